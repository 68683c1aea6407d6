//! Configuration for the board server.
//!
//! Layered, highest priority first:
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/taskboard/server.toml`)
//! 4. Compiled defaults

use std::path::PathBuf;
use std::time::Duration;

use crate::activity::DEFAULT_HISTORY;
use crate::store::DEFAULT_LOCK_TIMEOUT;

/// Errors that can occur when loading server configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// A `--user` argument was not of the form `id:token`.
    #[error("invalid user entry {0:?}, expected id:token")]
    InvalidUser(String),
}

/// A user and the bearer token that authenticates as them.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct UserToken {
    pub id: String,
    pub token: String,
}

impl std::str::FromStr for UserToken {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((id, token)) if !id.is_empty() && !token.is_empty() => Ok(Self {
                id: id.to_string(),
                token: token.to_string(),
            }),
            _ => Err(ConfigError::InvalidUser(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerConfigFile {
    server: ServerFileConfig,
    users: Vec<UserToken>,
}

/// `[server]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    bind_addr: Option<String>,
    max_message_size: Option<usize>,
    lock_timeout_ms: Option<u64>,
    activity_history: Option<usize>,
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// CLI arguments for the board server.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Taskboard board server")]
pub struct ServerCliArgs {
    /// Address to bind the server to.
    #[arg(short, long, env = "TASKBOARD_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/taskboard/server.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Maximum size of one client frame in bytes.
    #[arg(long)]
    pub max_message_size: Option<usize>,

    /// How long a request waits for a busy board, in milliseconds.
    #[arg(long)]
    pub lock_timeout_ms: Option<u64>,

    /// Activity entries kept per board.
    #[arg(long)]
    pub activity_history: Option<usize>,

    /// Extra user as `id:token`; may be repeated. Added to the file's users.
    #[arg(long = "user")]
    pub users: Vec<UserToken>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "TASKBOARD_LOG")]
    pub log_level: String,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server to (e.g., `0.0.0.0:9100`).
    pub bind_addr: String,
    /// Maximum allowed client frame size in bytes.
    pub max_message_size: usize,
    /// Time a request waits for a board's lock before failing with `busy`.
    pub lock_timeout: Duration,
    /// Activity entries kept per board.
    pub activity_history: usize,
    /// Known users and their tokens.
    pub users: Vec<UserToken>,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9100".to_string(),
            max_message_size: 64 * 1024,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            activity_history: DEFAULT_HISTORY,
            users: Vec::new(),
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path is tried and a missing
    /// file is treated as empty config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed.
    pub fn load(cli: &ServerCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, file))
    }

    /// Priority: CLI > file > default. Users are merged, CLI last.
    fn resolve(cli: &ServerCliArgs, file: ServerConfigFile) -> Self {
        let defaults = Self::default();
        let mut users = file.users;
        users.extend(cli.users.iter().cloned());

        Self {
            bind_addr: cli
                .bind
                .clone()
                .or(file.server.bind_addr)
                .unwrap_or(defaults.bind_addr),
            max_message_size: cli
                .max_message_size
                .or(file.server.max_message_size)
                .unwrap_or(defaults.max_message_size),
            lock_timeout: cli
                .lock_timeout_ms
                .or(file.server.lock_timeout_ms)
                .map_or(defaults.lock_timeout, Duration::from_millis),
            activity_history: cli
                .activity_history
                .or(file.server.activity_history)
                .unwrap_or(defaults.activity_history),
            users,
            log_level: cli.log_level.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn load_config_file(
    explicit_path: Option<&std::path::Path>,
) -> Result<ServerConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ServerConfigFile::default());
        };
        config_dir.join("taskboard").join("server.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ServerConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
