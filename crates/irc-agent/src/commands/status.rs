use anyhow::{Context, Result};

use crate::control::{ControlPaths, StatusFile};
use crate::utils::log::t;
use crate::{log_info, log_warn};

/// Prints the last status the daemon published in this control directory.
///
/// # Errors
/// Returns an error if the status file exists but cannot be read.
pub fn run(paths: &ControlPaths) -> Result<()> {
  let status = StatusFile::new(paths.status());
  let line = status
    .read()
    .with_context(|| format!("failed to read {}", paths.status().display()))?;
  match line {
    Some(line) if line.starts_with("CONNECTED") => log_info!("{}", t::ok(line)),
    Some(line) if line.starts_with("ERROR") => log_info!("{}", t::err(line)),
    Some(line) => log_info!("{}", line),
    None => log_warn!("No daemon has run in {}", paths.dir().display()),
  }
  Ok(())
}
