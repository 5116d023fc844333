//! Hub configuration, read from a TOML file.
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:3000"
//!
//! [storage]
//! path = "vigil.db"
//! retention_days = 30
//!
//! [connectors]
//! active = ["users", "settings"]
//!
//! [[exclude]]
//! connector = "users"
//! action = "login"
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::logger::ExclusionRule;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct HubConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub connectors: ConnectorsConfig,
    #[serde(default)]
    pub exclude: Vec<ExclusionRule>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// Records older than this many days are purged. `0` keeps everything.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            retention_days: default_retention_days(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConnectorsConfig {
    #[serde(default = "default_active")]
    pub active: Vec<String>,
}

impl Default for ConnectorsConfig {
    fn default() -> Self {
        Self {
            active: default_active(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:3000".into()
}
fn default_db_path() -> String {
    "vigil.db".into()
}
fn default_retention_days() -> u32 {
    30
}
fn default_active() -> Vec<String> {
    vec!["users".into(), "settings".into()]
}

impl HubConfig {
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Defaults when `path` does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = HubConfig::from_toml("").unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:3000");
        assert_eq!(config.storage.path, "vigil.db");
        assert_eq!(config.storage.retention_days, 30);
        assert_eq!(config.connectors.active, vec!["users", "settings"]);
        assert!(config.exclude.is_empty());
    }

    #[test]
    fn test_full_file() {
        let config = HubConfig::from_toml(
            r#"
            [server]
            bind = "0.0.0.0:8080"

            [storage]
            retention_days = 7

            [connectors]
            active = ["users"]

            [[exclude]]
            connector = "users"
            action = "login"

            [[exclude]]
            ip = "127.0.0.1"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:8080");
        assert_eq!(config.storage.path, "vigil.db");
        assert_eq!(config.storage.retention_days, 7);
        assert_eq!(config.connectors.active, vec!["users"]);
        assert_eq!(config.exclude.len(), 2);
        assert_eq!(config.exclude[0].action.as_deref(), Some("login"));
        assert_eq!(config.exclude[1].ip.as_deref(), Some("127.0.0.1"));
    }

    #[test]
    fn test_load_missing_and_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let missing = HubConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(missing.storage.retention_days, 30);

        let path = dir.path().join("bad.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[storage]\nretention_days = \"soon\"").unwrap();
        assert!(matches!(HubConfig::load(&path), Err(ConfigError::Parse(_))));
    }
}
