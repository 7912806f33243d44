use crate::access::{AccessConfig, ACL_FILE};
use crate::store::SqliteConfig;
use crate::sync::SyncConfig;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Which backend serves documents. Fixed for the lifetime of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    Git,
    Database,
    Hybrid,
}

impl FromStr for BackendMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "git" => Ok(BackendMode::Git),
            "database" | "db" => Ok(BackendMode::Database),
            "hybrid" => Ok(BackendMode::Hybrid),
            other => bail!("unknown backend mode {other:?} (expected git, database or hybrid)"),
        }
    }
}

impl fmt::Display for BackendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendMode::Git => "git",
            BackendMode::Database => "database",
            BackendMode::Hybrid => "hybrid",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_mode")]
    pub mode: BackendMode,
    /// Directory holding the database, the git mirror, the search index and
    /// persisted grants.
    #[serde(default = "default_base_path")]
    pub base_path: PathBuf,
    #[serde(default)]
    pub remote_url: Option<String>,
    #[serde(default)]
    pub remote_credential: Option<String>,
    #[serde(default = "default_true")]
    pub access_control_enabled: bool,
    #[serde(default)]
    pub admins: BTreeSet<String>,
    #[serde(default = "default_true")]
    pub persist_grants: bool,
    #[serde(default)]
    pub sqlite: SqliteConfig,
    #[serde(default = "default_export_interval")]
    pub export_interval_secs: u64,
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_clone_retries")]
    pub clone_retries: u32,
    #[serde(default = "default_clone_backoff")]
    pub clone_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

fn default_mode() -> BackendMode { BackendMode::Database }
fn default_base_path() -> PathBuf { PathBuf::from("./data") }
fn default_true() -> bool { true }
fn default_export_interval() -> u64 { 30 }
fn default_reconcile_interval() -> u64 { 300 }
fn default_clone_retries() -> u32 { 3 }
fn default_clone_backoff() -> u64 { 500 }
fn default_max_backoff() -> u64 { 30_000 }
fn default_cache_capacity() -> usize { 1024 }

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            base_path: default_base_path(),
            remote_url: None,
            remote_credential: None,
            access_control_enabled: true,
            admins: BTreeSet::new(),
            persist_grants: true,
            sqlite: SqliteConfig::default(),
            export_interval_secs: default_export_interval(),
            reconcile_interval_secs: default_reconcile_interval(),
            clone_retries: default_clone_retries(),
            clone_backoff_ms: default_clone_backoff(),
            max_backoff_ms: default_max_backoff(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

impl Config {
    /// Defaults, then the TOML file if given, then `KB_*` environment
    /// variables.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut config = match file {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("parsing config file {}", path.display()))?
            }
            None => Config::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Override fields from `KB_*` variables looked up through `var`.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(mode) = var("KB_MODE") {
            self.mode = mode.parse()?;
        }
        if let Some(path) = var("KB_BASE_PATH") {
            self.base_path = PathBuf::from(path);
        }
        if let Some(url) = var("KB_REMOTE_URL") {
            self.remote_url = Some(url).filter(|u| !u.is_empty());
        }
        if let Some(credential) = var("KB_REMOTE_CREDENTIAL") {
            self.remote_credential = Some(credential).filter(|c| !c.is_empty());
        }
        if let Some(enabled) = var("KB_ACCESS_CONTROL") {
            self.access_control_enabled = parse_env("KB_ACCESS_CONTROL", &enabled)?;
        }
        if let Some(admins) = var("KB_ADMINS") {
            self.admins = admins
                .split(',')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = var("KB_EXPORT_INTERVAL_SECS") {
            self.export_interval_secs = parse_env("KB_EXPORT_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = var("KB_RECONCILE_INTERVAL_SECS") {
            self.reconcile_interval_secs = parse_env("KB_RECONCILE_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = var("KB_SQLITE_MAX_CONNECTIONS") {
            self.sqlite.max_connections = parse_env("KB_SQLITE_MAX_CONNECTIONS", &v)?;
        }
        if let Some(v) = var("KB_CACHE_CAPACITY") {
            self.cache_capacity = parse_env("KB_CACHE_CAPACITY", &v)?;
        }
        Ok(())
    }

    pub fn export_interval(&self) -> Duration {
        Duration::from_secs(self.export_interval_secs.max(1))
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }

    pub fn database_path(&self) -> PathBuf {
        self.base_path.join("kb.sqlite")
    }

    pub fn index_dir(&self) -> PathBuf {
        self.base_path.join("index")
    }

    pub fn sync_config(&self) -> SyncConfig {
        let mut sync = SyncConfig::new(&self.base_path).with_backoff(
            self.clone_retries,
            Duration::from_millis(self.clone_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        );
        if let Some(url) = &self.remote_url {
            sync = sync.with_remote(url.clone(), self.remote_credential.clone());
        }
        sync
    }

    pub fn access_config(&self) -> AccessConfig {
        AccessConfig {
            enabled: self.access_control_enabled,
            admins: self.admins.clone(),
            state_file: self
                .persist_grants
                .then(|| self.base_path.join(ACL_FILE)),
        }
    }
}

fn parse_env<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("invalid value {value:?} for {key}"))
}
