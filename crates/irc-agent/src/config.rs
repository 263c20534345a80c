use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use owo_colors::OwoColorize as _;
use serde::Deserialize;
use toml::Value as TomlValue;

use crate::control::ControlPaths;

/// Known top-level config keys.
const KNOWN_TOP_LEVEL_KEYS: &[&str] = &["server", "control", "timing", "daemon"];

/// Known keys within `[server]`.
const KNOWN_SERVER_KEYS: &[&str] = &["host", "port", "nickname", "channel"];

/// Known keys within `[control]`.
const KNOWN_CONTROL_KEYS: &[&str] = &["dir"];

/// Known keys within `[timing]`.
const KNOWN_TIMING_KEYS: &[&str] = &[
  "receive_timeout_ms",
  "reconnect_backoff_secs",
  "welcome_timeout_secs",
  "connect_timeout_secs",
  "keepalive_idle_secs",
];

/// Known keys within `[daemon]`.
const KNOWN_DAEMON_KEYS: &[&str] = &["quit_message", "outbox"];

/// Environment variable that overrides the control directory.
pub const CONTROL_DIR_ENV: &str = "IRC_AGENT_CONTROL_DIR";

/// Control directory used when nothing else is configured.
pub const FALLBACK_CONTROL_DIR: &str = "/tmp/irc_control";

// Embed repository defaults
const DEFAULT_TOML: &str =
  include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/defaults/irc-agent.toml"));

/// Resolve the global config file path.
///
/// # Errors
/// Returns an error if the XDG config home cannot be resolved.
pub fn global_config_path() -> Result<PathBuf> {
  let xdg = xdg::BaseDirectories::with_prefix("irc-agent");
  let config_home = xdg
    .get_config_home()
    .ok_or_else(|| anyhow::anyhow!("unable to resolve XDG config home"))?;
  Ok(config_home.join("config.toml"))
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerConfig {
  pub host: String,
  pub port: u16,
  pub nickname: String,
  pub channel: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ControlConfig {
  #[serde(default)]
  pub dir: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TimingConfig {
  /// Bound for one socket read; also the loop cadence when the line is quiet.
  pub receive_timeout_ms: u64,
  /// Fixed delay before every reconnect attempt.
  pub reconnect_backoff_secs: u64,
  pub welcome_timeout_secs: u64,
  pub connect_timeout_secs: u64,
  /// Send our own `PING` after this long without receiving anything. 0 disables.
  pub keepalive_idle_secs: u64,
}

impl TimingConfig {
  #[must_use]
  pub fn receive_timeout(&self) -> Duration {
    Duration::from_millis(self.receive_timeout_ms)
  }

  #[must_use]
  pub fn reconnect_backoff(&self) -> Duration {
    Duration::from_secs(self.reconnect_backoff_secs)
  }

  #[must_use]
  pub fn welcome_timeout(&self) -> Duration {
    Duration::from_secs(self.welcome_timeout_secs)
  }

  #[must_use]
  pub fn connect_timeout(&self) -> Duration {
    Duration::from_secs(self.connect_timeout_secs)
  }

  #[must_use]
  pub fn keepalive_idle(&self) -> Option<Duration> {
    (self.keepalive_idle_secs > 0).then(|| Duration::from_secs(self.keepalive_idle_secs))
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DaemonConfig {
  /// Reason sent with `QUIT` on graceful shutdown.
  pub quit_message: String,
  /// Whether to keep `outbox.txt`.
  pub outbox: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AgentConfig {
  pub server: ServerConfig,
  #[serde(default)]
  pub control: ControlConfig,
  pub timing: TimingConfig,
  pub daemon: DaemonConfig,
}

impl AgentConfig {
  /// The embedded defaults on their own.
  ///
  /// # Errors
  /// Only fails if the embedded defaults are invalid.
  pub fn defaults() -> Result<Self> {
    toml::from_str(DEFAULT_TOML).context("invalid embedded default config")
  }

  /// Rejects values the server would refuse or that break the wire format.
  ///
  /// # Errors
  /// Returns a descriptive error for the first invalid field.
  pub fn validate(&self) -> Result<()> {
    let server = &self.server;
    if server.host.trim().is_empty() {
      bail!("server host must not be empty");
    }
    if server.port == 0 {
      bail!("server port must not be 0");
    }
    if server.nickname.is_empty() || server.nickname.contains([' ', '\r', '\n']) {
      bail!("invalid nickname '{}': must be non-empty without spaces", server.nickname);
    }
    if server.channel.is_empty() || server.channel.contains([' ', ',', '\r', '\n']) {
      bail!(
        "invalid channel '{}': must be non-empty without spaces or commas",
        server.channel
      );
    }
    if self.timing.receive_timeout_ms == 0 {
      bail!("timing.receive_timeout_ms must be greater than 0");
    }
    Ok(())
  }
}

fn merge_values(base: &mut TomlValue, overlay: TomlValue) {
  match (base, overlay) {
    (TomlValue::Table(base_tbl), TomlValue::Table(overlay_tbl)) => {
      for (k, v) in overlay_tbl {
        match base_tbl.get_mut(&k) {
          Some(existing) => merge_values(existing, v),
          None => {
            base_tbl.insert(k, v);
          }
        }
      }
    }
    // Arrays and scalars: replace last-wins
    (base_slot, new_v) => *base_slot = new_v,
  }
}

/// Warn about unknown keys in a parsed TOML config file.
///
/// Unknown keys are reported on stderr to help users catch typos; they do not
/// fail the load.
fn warn_unknown_keys(val: &TomlValue, file_path: &Path) {
  let TomlValue::Table(table) = val else {
    return;
  };

  for key in table.keys() {
    if !KNOWN_TOP_LEVEL_KEYS.contains(&key.as_str()) {
      eprintln!(
        "{}: unknown config key '{}' in {} (did you mean one of: {}?)",
        "warning".yellow(),
        key,
        file_path.display(),
        KNOWN_TOP_LEVEL_KEYS.join(", ")
      );
    }
  }

  for (section, known) in [
    ("server", KNOWN_SERVER_KEYS),
    ("control", KNOWN_CONTROL_KEYS),
    ("timing", KNOWN_TIMING_KEYS),
    ("daemon", KNOWN_DAEMON_KEYS),
  ] {
    let Some(TomlValue::Table(inner)) = table.get(section) else {
      continue;
    };
    for key in inner.keys() {
      if !known.contains(&key.as_str()) {
        eprintln!(
          "{}: unknown config key '{}.{}' in {} (known keys: {})",
          "warning".yellow(),
          section,
          key,
          file_path.display(),
          known.join(", ")
        );
      }
    }
  }
}

fn merge_file(merged: &mut TomlValue, path: &Path) -> Result<()> {
  let data =
    fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
  let val: TomlValue =
    toml::from_str(&data).with_context(|| format!("invalid TOML in {}", path.display()))?;
  warn_unknown_keys(&val, path);
  merge_values(merged, val);
  Ok(())
}

/// Load and merge configuration from defaults, the global file and an
/// optional explicit file.
///
/// # Errors
/// Returns an error if any of the config files cannot be read or parsed
/// as valid TOML, or if the merged result has the wrong shape.
pub fn load_config(explicit: Option<&Path>) -> Result<AgentConfig> {
  // Start with embedded defaults
  let mut merged: TomlValue =
    toml::from_str(DEFAULT_TOML).context("invalid embedded default config")?;

  // Merge global XDG config if present
  let xdg = xdg::BaseDirectories::with_prefix("irc-agent");
  if let Some(global_path) = xdg.find_config_file("config.toml") {
    merge_file(&mut merged, &global_path)?;
  }

  if let Some(path) = explicit {
    merge_file(&mut merged, path)?;
  }

  // Deserialize into strongly typed config
  let merged_str = toml::to_string(&merged).context("failed to serialize merged config")?;
  let cfg: AgentConfig = toml::from_str(&merged_str).context("failed to parse merged config")?;
  Ok(cfg)
}

/// Resolve the control directory.
///
/// Precedence: explicit `cli_dir`, `$IRC_AGENT_CONTROL_DIR`, `control.dir`,
/// `$XDG_RUNTIME_DIR/irc-agent`, then `/tmp/irc_control`.
#[must_use]
pub fn compute_control_dir(cfg: &AgentConfig, cli_dir: Option<&Path>) -> PathBuf {
  if let Some(dir) = cli_dir {
    return dir.to_path_buf();
  }

  if let Ok(env_dir) = std::env::var(CONTROL_DIR_ENV)
    && !env_dir.is_empty()
  {
    return PathBuf::from(env_dir);
  }

  if let Some(ref dir) = cfg.control.dir {
    return PathBuf::from(dir);
  }

  if let Ok(xdg_runtime) = std::env::var("XDG_RUNTIME_DIR")
    && !xdg_runtime.is_empty()
  {
    return PathBuf::from(xdg_runtime).join("irc-agent");
  }

  PathBuf::from(FALLBACK_CONTROL_DIR)
}

#[must_use]
pub fn control_paths(cfg: &AgentConfig, cli_dir: Option<&Path>) -> ControlPaths {
  ControlPaths::new(compute_control_dir(cfg, cli_dir))
}
