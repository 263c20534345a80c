use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

mod commands;
pub mod config;
pub mod connection;
pub mod control;
pub mod daemon;
pub mod error;
pub mod protocol;
pub mod utils;
pub mod wire;

use crate::config::{control_paths, load_config};

/// irc-agent - A persistent IRC presence steered through plain files.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
  /// Additional config file layered over the defaults and the global config
  #[arg(long, global = true, value_name = "FILE")]
  config: Option<PathBuf>,
  /// Control directory (overrides IRC_AGENT_CONTROL_DIR and control.dir)
  #[arg(long, global = true, value_name = "DIR")]
  control_dir: Option<PathBuf>,
  #[command(subcommand)]
  command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
  /// Connect to the server and serve the control directory until stopped
  Run(RunArgs),
  /// Queue a chat message for the running daemon
  Send {
    /// Channel or nickname
    target: String,
    /// Message text; multiple words are joined with spaces
    #[arg(required = true, num_args = 1..)]
    text: Vec<String>,
  },
  /// Ask the running daemon to disconnect and exit
  Stop,
  /// Print the daemon's last published status
  Status,
  /// Print the resolved control and config file locations
  Paths,
}

/// Server settings given on the command line; each overrides `[server]`.
#[derive(Debug, Clone, Default, Args)]
pub struct RunArgs {
  /// Server host name
  pub server: Option<String>,
  /// Server port
  pub port: Option<u16>,
  /// Channel to join
  pub channel: Option<String>,
  /// Nickname to register
  pub nickname: Option<String>,
}

pub fn parse() -> Cli {
  Cli::parse()
}

/// Entry point of the binary.
///
/// # Errors
/// Returns the first error of the selected command, including a failed first
/// connect of `run`.
pub fn run() -> Result<()> {
  let cli = parse();
  let cfg = load_config(cli.config.as_deref())?;
  let paths = control_paths(&cfg, cli.control_dir.as_deref());

  match cli.command {
    Commands::Run(args) => commands::daemon::run_blocking(cfg, &paths, &args),
    Commands::Send { target, text } => commands::send::run(&paths, &target, &text.join(" ")),
    Commands::Stop => commands::stop::run(&paths),
    Commands::Status => commands::status::run(&paths),
    Commands::Paths => commands::paths::run(&paths, cli.config.as_deref()),
  }
}
