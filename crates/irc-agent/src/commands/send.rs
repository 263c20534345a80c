use anyhow::Result;

use crate::control::{ControlPaths, Directive, enqueue};
use crate::log_success;
use crate::utils::log::t;

pub fn run(paths: &ControlPaths, target: &str, text: &str) -> Result<()> {
  paths.ensure_dir()?;
  enqueue(&paths.commands(), &Directive::send(target, text))?;
  log_success!("Queued message for {}", t::target(target));
  Ok(())
}
