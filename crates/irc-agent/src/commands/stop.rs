use anyhow::Result;

use crate::control::{ControlPaths, Directive, enqueue};
use crate::log_success;

pub fn run(paths: &ControlPaths) -> Result<()> {
  paths.ensure_dir()?;
  enqueue(&paths.commands(), &Directive::Stop)?;
  log_success!("Requested daemon stop");
  Ok(())
}
