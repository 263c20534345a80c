use std::path::Path;

use anyhow::Result;

use crate::config::global_config_path;
use crate::control::ControlPaths;
use crate::log_info;
use crate::utils::log::t;

pub fn run(paths: &ControlPaths, explicit_config: Option<&Path>) -> Result<()> {
  log_info!("control   {}", t::path(paths.dir().display()));
  log_info!("commands  {}", t::path(paths.commands().display()));
  log_info!("inbox     {}", t::path(paths.inbox().display()));
  log_info!("outbox    {}", t::path(paths.outbox().display()));
  log_info!("status    {}", t::path(paths.status().display()));
  log_info!("config    {}", t::path(global_config_path()?.display()));
  if let Some(file) = explicit_config {
    log_info!("config    {}", t::path(file.display()));
  }
  Ok(())
}
