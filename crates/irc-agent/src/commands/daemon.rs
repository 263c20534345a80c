use anyhow::{Context, Result};
use log::{info, warn};

use crate::RunArgs;
use crate::config::AgentConfig;
use crate::connection::{ConnectionManager, TcpConnector};
use crate::control::{
  CommandFile, ControlPaths, Directive, Inbox, Outbox, StatusFile, make_directive_channel,
};
use crate::daemon::{DaemonBuilder, LoopTiming};

/// Runs the daemon in the foreground until a `QUIT` directive or a signal.
///
/// # Errors
/// Returns an error for invalid settings, an unusable control directory or
/// a failed first connect.
pub fn run_blocking(mut cfg: AgentConfig, paths: &ControlPaths, args: &RunArgs) -> Result<()> {
  let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
    .format_timestamp_secs()
    .try_init();

  apply_overrides(&mut cfg, args);
  cfg.validate()?;

  paths.ensure_dir()?;
  let commands = CommandFile::new(paths.commands());
  commands
    .ensure_exists()
    .with_context(|| format!("failed to create {}", commands.path().display()))?;
  info!("Control directory: {}", paths.dir().display());

  // Signals become a regular Stop so shutdown takes the same path as QUIT.
  let (tx, signals) = make_directive_channel(4);
  if let Err(err) = ctrlc::set_handler(move || {
    let _ = tx.try_send(Directive::Stop);
  }) {
    warn!("Failed to install signal handler: {err}");
  }

  let connector = TcpConnector::new(cfg.timing.connect_timeout());
  let mut conn = ConnectionManager::new(
    cfg.server.clone(),
    Box::new(connector),
    cfg.timing.welcome_timeout(),
  );
  if cfg.daemon.outbox {
    conn = conn.with_outbox(Outbox::new(paths.outbox()));
  }

  let mut daemon = DaemonBuilder::new(conn, Inbox::new(paths.inbox()), LoopTiming::from(&cfg.timing))
    .source(commands)
    .source(signals)
    .status_file(StatusFile::new(paths.status()))
    .quit_message(cfg.daemon.quit_message.clone())
    .start()
    .with_context(|| {
      format!(
        "failed to connect to {}:{}",
        cfg.server.host, cfg.server.port
      )
    })?;

  daemon.run();
  Ok(())
}

fn apply_overrides(cfg: &mut AgentConfig, args: &RunArgs) {
  if let Some(host) = &args.server {
    cfg.server.host.clone_from(host);
  }
  if let Some(port) = args.port {
    cfg.server.port = port;
  }
  if let Some(channel) = &args.channel {
    cfg.server.channel.clone_from(channel);
  }
  if let Some(nickname) = &args.nickname {
    cfg.server.nickname.clone_from(nickname);
  }
}
