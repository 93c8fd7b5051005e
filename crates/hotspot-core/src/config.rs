//! Process configuration for hotspotd.
//!
//! Hierarchical resolution, lowest priority first:
//! 1. Built-in defaults
//! 2. Global config (`$XDG_CONFIG_HOME/hotspotd/settings.json`)
//! 3. Explicit config file (`--config`)
//! 4. `HOTSPOT_*` environment variables
//! 5. CLI arguments (applied by the binary)
//!
//! Runtime knobs that operators change while the daemon runs (list names,
//! thresholds, router credentials) live in the settings table instead.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete process configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub security: SecurityConfig,
}

/// HTTP listener and storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub database_path: Option<PathBuf>,
    pub log_level: String,
    /// `production` enforces webhook signatures; anything else only warns.
    pub environment: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            database_path: None,
            log_level: "info".to_string(),
            environment: "production".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn is_production(&self) -> bool {
        !matches!(
            self.environment.to_ascii_lowercase().as_str(),
            "development" | "dev" | "staging" | "test" | "sandbox"
        )
    }
}

/// Which router implementation the daemon drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RouterBackend {
    /// RouterOS REST API.
    #[default]
    Rest,
    /// In-memory dry run; nothing leaves the process.
    Memory,
}

impl std::str::FromStr for RouterBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rest" => Ok(Self::Rest),
            "memory" | "dry-run" => Ok(Self::Memory),
            other => Err(Error::Config(format!("unknown router backend: {other}"))),
        }
    }
}

/// Router connection pool sizing. Host and credentials come from settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    pub backend: RouterBackend,
    pub pool_size: usize,
    pub command_timeout_secs: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            backend: RouterBackend::Rest,
            pool_size: 8,
            command_timeout_secs: 15,
        }
    }
}

/// Secrets the daemon needs before it can read the settings table.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SecurityConfig {
    /// Bearer token for `/api/admin/*`. Admin routes are disabled when unset.
    pub admin_token: Option<String>,
    /// Passphrase the settings secret box derives its key from.
    pub settings_passphrase: Option<String>,
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        let global = load_config_file(&global_path)?;
        merge_config(&mut config, global);
    }

    if let Some(path) = explicit {
        let file = load_config_file(path)?;
        merge_config(&mut config, file);
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;

    Ok(config)
}

/// Global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("hotspotd").join("settings.json"))
}

/// Default database path when none is configured.
pub fn database_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("hotspotd").join("hotspotd.db"))
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut Config, overlay: Config) {
    if overlay.server.database_path.is_some() {
        base.server.database_path = overlay.server.database_path;
    }
    base.server.bind_addr = overlay.server.bind_addr;
    base.server.log_level = overlay.server.log_level;
    base.server.environment = overlay.server.environment;

    base.router = overlay.router;

    if overlay.security.admin_token.is_some() {
        base.security.admin_token = overlay.security.admin_token;
    }
    if overlay.security.settings_passphrase.is_some() {
        base.security.settings_passphrase = overlay.security.settings_passphrase;
    }
}

fn apply_env_overrides(config: &mut Config, env: impl Fn(&str) -> Option<String>) -> Result<()> {
    if let Some(val) = env("HOTSPOT_BIND_ADDR") {
        config.server.bind_addr = val;
    }
    if let Some(val) = env("HOTSPOT_DATABASE_PATH") {
        config.server.database_path = Some(PathBuf::from(val));
    }
    if let Some(val) = env("HOTSPOT_LOG_LEVEL") {
        config.server.log_level = val;
    }
    if let Some(val) = env("HOTSPOT_ENVIRONMENT") {
        config.server.environment = val;
    }
    if let Some(val) = env("HOTSPOT_ROUTER_BACKEND") {
        config.router.backend = val.parse()?;
    }
    if let Some(n) = env("HOTSPOT_ROUTER_POOL_SIZE").and_then(|v| v.parse().ok()) {
        config.router.pool_size = n;
    }
    if let Some(val) = env("HOTSPOT_ADMIN_TOKEN") {
        config.security.admin_token = Some(val);
    }
    if let Some(val) = env("HOTSPOT_SETTINGS_PASSPHRASE") {
        config.security.settings_passphrase = Some(val);
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.router.pool_size, 8);
        assert_eq!(config.router.command_timeout_secs, 15);
        assert!(config.server.is_production());
        assert!(config.security.admin_token.is_none());
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("HOTSPOT_BIND_ADDR", "127.0.0.1:9000"),
            ("HOTSPOT_ROUTER_BACKEND", "memory"),
            ("HOTSPOT_ENVIRONMENT", "development"),
            ("HOTSPOT_ADMIN_TOKEN", "secret"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        apply_env_overrides(&mut config, |k| vars.get(k).map(ToString::to_string)).unwrap();

        assert_eq!(config.server.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.router.backend, RouterBackend::Memory);
        assert!(!config.server.is_production());
        assert_eq!(config.security.admin_token.as_deref(), Some("secret"));
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let mut config = Config::default();
        let result = apply_env_overrides(&mut config, |k| {
            (k == "HOTSPOT_ROUTER_BACKEND").then(|| "telnet".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn explicit_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hotspotd.json");
        std::fs::write(
            &path,
            r#"{"server":{"bind_addr":"0.0.0.0:9999","database_path":"/tmp/h.db","log_level":"debug","environment":"dev"}}"#,
        )
        .unwrap();

        let mut config = Config::default();
        merge_config(&mut config, load_config_file(&path).unwrap());
        assert_eq!(config.server.bind_addr, "0.0.0.0:9999");
        assert_eq!(config.server.log_level, "debug");
        assert_eq!(config.router.pool_size, 8);
    }
}
