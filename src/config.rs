// src/config.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_PG_PORT, DEFAULT_READY_TIMEOUT, DEFAULT_REPLAY_TIMEOUT};
use crate::replay::ReplayOptions;
use crate::serde_helpers::deserialize_count;

/// Top-level YAML configuration. Read once at startup; CLI flags override it.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Target database, used for catalog lookups during capture and for replay
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub capture: Option<CaptureConfig>,

    #[serde(default)]
    pub replay: Option<ReplayConfig>,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_user")]
    pub user: String,

    /// Falls back to $PGPASSWORD when omitted
    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_dbname")]
    pub dbname: String,

    /// Connect timeout per connection (e.g. "10s")
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            user: default_user(),
            password: None,
            dbname: default_dbname(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl DatabaseConfig {
    /// Password from the file, else $PGPASSWORD
    pub fn effective_password(&self) -> Option<String> {
        self.password
            .clone()
            .or_else(|| std::env::var("PGPASSWORD").ok())
    }

    pub fn to_pg_config(&self) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .user(&self.user)
            .dbname(&self.dbname)
            .application_name("sqlog-bench")
            .connect_timeout(self.connect_timeout);
        if let Some(password) = self.effective_password() {
            config.password(password);
        }
        config
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CaptureConfig {
    /// Server log to ingest (plain or .zst)
    pub log_path: PathBuf,

    /// Receives per-connection raw logs, entries, interaction files and diagnostics
    pub output_dir: PathBuf,

    /// Leading statements to drop per connection (warm-up)
    #[serde(default, deserialize_with = "deserialize_count")]
    pub skip_statements: usize,

    /// Resolve parameter types against the database catalog
    #[serde(default = "default_true")]
    pub resolve_types: bool,

    /// Join continuation lines into the preceding entry
    #[serde(default = "default_true")]
    pub join_continuations: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReplayConfig {
    /// Directory of `*.interactions` files
    pub interactions_dir: PathBuf,

    /// Wait for all clients to connect (e.g. "2m")
    #[serde(default = "default_ready_timeout", with = "humantime_serde")]
    pub ready_timeout: Duration,

    /// Overall completion wait after the start gate opens (e.g. "1h")
    #[serde(default = "default_replay_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Results basename; writes `<base>-clients.tsv` and `<base>-summary.tsv`
    #[serde(default)]
    pub results_path: Option<PathBuf>,
}

impl ReplayConfig {
    pub fn options(&self) -> ReplayOptions {
        ReplayOptions {
            ready_timeout: self.ready_timeout,
            timeout: self.timeout,
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PG_PORT
}

fn default_user() -> String {
    "postgres".to_string()
}

fn default_dbname() -> String {
    "postgres".to_string()
}

fn default_connect_timeout() -> Duration {
    DEFAULT_CONNECT_TIMEOUT
}

fn default_ready_timeout() -> Duration {
    DEFAULT_READY_TIMEOUT
}

fn default_replay_timeout() -> Duration {
    DEFAULT_REPLAY_TIMEOUT
}

fn default_true() -> bool {
    true
}
