//! Configuration file management for corrald.
//!
//! Provides a TOML config file at `~/.config/corral/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use corral_core::config::{TaskConfig, WaitlistConfig};

/// Store URL value selecting the in-process memory backend.
pub const MEMORY_STORE_URL: &str = "memory";

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub waitlist: WaitlistSection,
    #[serde(default)]
    pub tasks: TasksSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreSection {
    /// `"memory"` or a `postgresql://` URL.
    #[serde(default = "default_store_url")]
    pub url: String,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            url: default_store_url(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WaitlistSection {
    #[serde(default = "default_max_limit")]
    pub max_limit: usize,
    #[serde(default = "default_wait_timeout_secs")]
    pub default_wait_timeout_secs: u64,
    #[serde(default = "default_etag_retries")]
    pub etag_retries: u32,
    #[serde(default = "default_retention_secs")]
    pub retention_window_secs: u64,
    #[serde(default = "default_sweep_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for WaitlistSection {
    fn default() -> Self {
        Self {
            max_limit: default_max_limit(),
            default_wait_timeout_secs: default_wait_timeout_secs(),
            etag_retries: default_etag_retries(),
            retention_window_secs: default_retention_secs(),
            sweep_interval_secs: default_sweep_secs(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TasksSection {
    #[serde(default = "default_task_retention_secs")]
    pub retention_secs: u64,
    #[serde(default = "default_abandon_secs")]
    pub abandon_after_secs: u64,
    #[serde(default = "default_wait_timeout_secs")]
    pub default_wait_timeout_secs: u64,
    #[serde(default = "default_sweep_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for TasksSection {
    fn default() -> Self {
        Self {
            retention_secs: default_task_retention_secs(),
            abandon_after_secs: default_abandon_secs(),
            default_wait_timeout_secs: default_wait_timeout_secs(),
            sweep_interval_secs: default_sweep_secs(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1".to_owned()
}
fn default_port() -> u16 {
    8080
}
fn default_store_url() -> String {
    MEMORY_STORE_URL.to_owned()
}
fn default_max_limit() -> usize {
    1000
}
fn default_wait_timeout_secs() -> u64 {
    60
}
fn default_etag_retries() -> u32 {
    3
}
fn default_retention_secs() -> u64 {
    3600
}
fn default_sweep_secs() -> u64 {
    60
}
fn default_task_retention_secs() -> u64 {
    300
}
fn default_abandon_secs() -> u64 {
    3600
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the corral config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/corral` or `~/.config/corral`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("corral");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("corral")
}

/// Return the path to the corral config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load the config file at a given path. `Ok(None)` when it does not exist.
pub fn load_config_from(path: &Path) -> Result<Option<ConfigFile>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(Some(config))
}

/// Serialize and write a config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config_to(path: &Path, config: &ConfigFile) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    }

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

/// `corrald init`: write the config file.
pub fn init(store_url: Option<String>, force: bool) -> Result<()> {
    let path = config_path();
    if path.exists() && !force {
        bail!(
            "config file already exists at {} (use --force to overwrite)",
            path.display()
        );
    }

    let mut config = ConfigFile::default();
    if let Some(url) = store_url {
        config.store.url = url;
    }
    save_config_to(&path, &config)?;
    println!("wrote {}", path.display());
    Ok(())
}

// -----------------------------------------------------------------------
// Resolution
// -----------------------------------------------------------------------

/// Fully resolved runtime settings.
#[derive(Debug)]
pub struct Settings {
    pub bind: String,
    pub port: u16,
    pub store_url: String,
    waitlist: WaitlistSection,
    tasks: TasksSection,
}

impl Settings {
    /// Resolve settings: CLI flag > env var > config file > default.
    pub fn resolve(
        store_flag: Option<String>,
        bind_flag: Option<String>,
        port_flag: Option<u16>,
    ) -> Result<Self> {
        let file = load_config_from(&config_path())?.unwrap_or_default();

        let store_url = store_flag
            .or_else(|| std::env::var("CORRAL_DATABASE_URL").ok())
            .unwrap_or(file.store.url);
        let bind = bind_flag
            .or_else(|| std::env::var("CORRAL_BIND").ok())
            .unwrap_or(file.server.bind);
        let port = match port_flag {
            Some(port) => port,
            None => match std::env::var("CORRAL_PORT") {
                Ok(raw) => raw
                    .parse()
                    .with_context(|| format!("invalid CORRAL_PORT value {raw:?}"))?,
                Err(_) => file.server.port,
            },
        };

        Ok(Self {
            bind,
            port,
            store_url,
            waitlist: file.waitlist,
            tasks: file.tasks,
        })
    }

    pub fn waitlist_config(&self) -> WaitlistConfig {
        WaitlistConfig {
            max_limit: self.waitlist.max_limit,
            default_wait_timeout: Duration::from_secs(self.waitlist.default_wait_timeout_secs),
            etag_retries: self.waitlist.etag_retries,
            retention_window: Duration::from_secs(self.waitlist.retention_window_secs),
            sweep_interval: Duration::from_secs(self.waitlist.sweep_interval_secs),
        }
    }

    pub fn task_config(&self) -> TaskConfig {
        TaskConfig {
            retention: Duration::from_secs(self.tasks.retention_secs),
            abandon_after: Duration::from_secs(self.tasks.abandon_after_secs),
            default_wait_timeout: Duration::from_secs(self.tasks.default_wait_timeout_secs),
            sweep_interval: Duration::from_secs(self.tasks.sweep_interval_secs),
        }
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config: ConfigFile = toml::from_str("").expect("empty config should parse");
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.store.url, MEMORY_STORE_URL);
        assert_eq!(config.waitlist.max_limit, 1000);
        assert_eq!(config.tasks.retention_secs, 300);
    }

    #[test]
    fn partial_file_overrides_only_named_fields() {
        let config: ConfigFile = toml::from_str(
            "[server]\nport = 9090\n\n[waitlist]\nretention_window_secs = 120\n",
        )
        .expect("partial config should parse");
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.waitlist.retention_window_secs, 120);
        assert_eq!(config.waitlist.max_limit, 1000);
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");

        let mut config = ConfigFile::default();
        config.store.url = "postgresql://localhost:5432/corral".to_owned();
        config.server.port = 9999;
        save_config_to(&path, &config).expect("save should succeed");

        let loaded = load_config_from(&path)
            .expect("load should succeed")
            .expect("file exists");
        assert_eq!(loaded.store.url, "postgresql://localhost:5432/corral");
        assert_eq!(loaded.server.port, 9999);
    }

    #[test]
    fn missing_file_is_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let loaded = load_config_from(&dir.path().join("nope.toml")).expect("load should succeed");
        assert!(loaded.is_none());
    }
}
