//! Client configuration.
//!
//! Loaded from `$TABLECHAT_CONFIG`, or `<config dir>/tablechat/config.toml`.
//! A missing file means defaults; a present but invalid file is an error.
//!
//! ```toml
//! [server]
//! base_url = "http://localhost:8000"
//! ws_url = "ws://localhost:8000/ws/chat-client"
//!
//! [connection]
//! reconnect_delay_ms = 2000
//!
//! [chat]
//! delta_mode = "cumulative"   # or "incremental"
//! pdf_name = "manual.pdf"
//!
//! [table]
//! page_size = 10
//! row_id_field = "ctid"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tablechat_state::DeltaMode;
use tablechat_types::DEFAULT_ROW_ID_FIELD;
use url::Url;

use crate::constants::{
    APP_NAME, CONFIG_ENV, DEFAULT_BASE_URL, DEFAULT_PAGE_SIZE, DEFAULT_WS_URL, RECONNECT_DELAY,
};

/// Errors from loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    pub connection: ConnectionConfig,
    pub chat: ChatConfig,
    pub table: TableConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Base URL of the HTTP endpoints.
    pub base_url: String,
    /// Chat stream websocket URL.
    pub ws_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            ws_url: DEFAULT_WS_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionConfig {
    pub reconnect_delay_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: RECONNECT_DELAY.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChatConfig {
    pub delta_mode: DeltaMode,
    /// Document sent alongside every request, if any.
    pub pdf_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TableConfig {
    pub page_size: u32,
    pub row_id_field: String,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            row_id_field: DEFAULT_ROW_ID_FIELD.to_string(),
        }
    }
}

impl Config {
    /// Config file location: `$TABLECHAT_CONFIG`, else the platform config dir.
    pub fn default_path() -> Option<PathBuf> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir().map(|p| p.join(APP_NAME).join("config.toml"))
    }

    /// Load from the default location, falling back to defaults.
    pub fn load_default() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) => Self::load(&path),
            None => {
                tracing::info!("no config directory available, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load and validate a config file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        tracing::info!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let base = self.base_url()?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid(format!(
                "server.base_url must be http or https, got {}",
                base.scheme()
            )));
        }
        let ws = self.ws_url()?;
        if !matches!(ws.scheme(), "ws" | "wss") {
            return Err(ConfigError::Invalid(format!(
                "server.ws_url must be ws or wss, got {}",
                ws.scheme()
            )));
        }
        if self.connection.reconnect_delay_ms == 0 {
            return Err(ConfigError::Invalid(
                "connection.reconnect_delay_ms must be positive".into(),
            ));
        }
        if self.table.page_size == 0 {
            return Err(ConfigError::Invalid("table.page_size must be positive".into()));
        }
        if self.table.row_id_field.trim().is_empty() {
            return Err(ConfigError::Invalid("table.row_id_field must not be empty".into()));
        }
        Ok(())
    }

    pub fn base_url(&self) -> Result<Url, ConfigError> {
        parse_url("server.base_url", &self.server.base_url)
    }

    pub fn ws_url(&self) -> Result<Url, ConfigError> {
        parse_url("server.ws_url", &self.server.ws_url)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.connection.reconnect_delay_ms)
    }

    /// Document name for outgoing requests (empty when unset).
    pub fn pdf_name(&self) -> &str {
        self.chat.pdf_name.as_deref().unwrap_or("")
    }
}

fn parse_url(key: &str, raw: &str) -> Result<Url, ConfigError> {
    if raw.trim().is_empty() {
        return Err(ConfigError::Invalid(format!("{key} must not be empty")));
    }
    Url::parse(raw).map_err(|e| ConfigError::Invalid(format!("{key} {raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.reconnect_delay(), Duration::from_millis(2000));
        assert_eq!(config.table.row_id_field, "ctid");
        assert_eq!(config.pdf_name(), "");
    }

    #[test]
    fn test_partial_file_merges_defaults() {
        let file = write_config(
            r#"
            [server]
            base_url = "https://data.example.com"

            [chat]
            delta_mode = "incremental"
            pdf_name = "manual.pdf"
            "#,
        );
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.server.base_url, "https://data.example.com");
        assert_eq!(config.server.ws_url, DEFAULT_WS_URL);
        assert_eq!(config.chat.delta_mode, DeltaMode::Incremental);
        assert_eq!(config.pdf_name(), "manual.pdf");
        assert_eq!(config.table.page_size, 10);
    }

    #[test]
    fn test_rejects_invalid_values() {
        for body in [
            "[connection]\nreconnect_delay_ms = 0",
            "[table]\npage_size = 0",
            "[table]\nrow_id_field = \"\"",
            "[server]\nbase_url = \"\"",
            "[server]\nws_url = \"http://localhost:8000/ws\"",
        ] {
            let file = write_config(body);
            let err = Config::load(file.path()).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{body}: {err}");
        }
    }

    #[test]
    fn test_rejects_unknown_keys_and_bad_toml() {
        let file = write_config("[server]\nbase_uri = \"http://x\"");
        assert!(matches!(Config::load(file.path()), Err(ConfigError::Parse { .. })));

        let file = write_config("[chat]\ndelta_mode = \"sideways\"");
        assert!(matches!(Config::load(file.path()), Err(ConfigError::Parse { .. })));
    }
}
