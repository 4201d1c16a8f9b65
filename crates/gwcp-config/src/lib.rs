//! Layered configuration for the gateway control-plane daemon, built on
//! the `config` crate's source-stacking builder rather than hand-rolled
//! merge logic.
//!
//! Sources are added to the builder in ascending priority — each later
//! source overwrites keys the earlier ones set:
//!
//! 1. **Struct defaults** (`Config::default()`, re-serialized as a source
//!    so every section always has a complete baseline even with no file
//!    and no environment present)
//! 2. **TOML file**: `./gwcp.toml`, then `~/.config/gwcp/gwcp.toml` if
//!    present (or an explicit path passed to [`Config::load_from_path`])
//! 3. **Environment**: `GWCP__<SECTION>__<FIELD>` (double underscore
//!    nests into sub-tables — `config`'s `Environment` source walks the
//!    struct shape itself, so no per-field plumbing is needed here)
//!
//! ```toml
//! [store]
//! path = "gwcp.db"
//!
//! [link]
//! ws_url = "wss://localhost/api/internal/v1/ws/gateways/connect"
//! api_key = "dev-token"
//! artifact_base_url = "https://localhost/api/internal/v1"
//!
//! [eventhub]
//! poll_interval_secs = 5
//! cleanup_interval_secs = 600
//! retention_secs = 3600
//!
//! [xds]
//! listen_address = "0.0.0.0:18000"
//! policy_engine_enabled = false
//!
//! [logging]
//! level = "info"
//! format = "compact"
//!
//! [tenant]
//! organization_id = "3fa2c1e0-1234-4a5b-8c9d-0123456789ab"
//! ```
//!
//! ```bash
//! export GWCP__LOGGING__LEVEL=debug
//! export GWCP__XDS__POLICY_ENGINE_ENABLED=true
//! ```
//!
//! The gateway's registration token is read separately from
//! `GATEWAY_REGISTRATION_TOKEN` (not `GWCP__LINK__API_KEY`) since it's
//! provisioned by the deployment tooling that hands gateways their
//! credentials, not by whoever authors `gwcp.toml`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("failed to assemble configuration: {0}")]
    Layer(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    ValidationError(String),

    #[error("failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("failed to write config file {path}: {source}")]
    WriteError {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub link: LinkConfig,
    pub eventhub: EventHubConfig,
    pub xds: XdsConfig,
    pub logging: LoggingConfig,
    pub telemetry: TelemetryConfig,
    pub tenant: TenantConfig,
}

/// The single organization this gateway instance subscribes to — each
/// gateway is an independent subscriber, not a multi-tenant fan-out
/// point itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantConfig {
    pub organization_id: String,
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            organization_id: "00000000-0000-0000-0000-000000000000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "gwcp.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub ws_url: String,
    pub api_key: String,
    pub artifact_base_url: String,
    pub handshake_timeout_secs: u64,
    pub ack_timeout_secs: u64,
    pub heartbeat_grace_secs: u64,
    pub backoff_initial_secs: f64,
    pub backoff_max_secs: f64,
    pub artifact_fetch_timeout_secs: u64,
    pub tls_verify: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://localhost/api/internal/v1/ws/gateways/connect".to_string(),
            api_key: String::new(),
            artifact_base_url: "https://localhost/api/internal/v1".to_string(),
            handshake_timeout_secs: 10,
            ack_timeout_secs: 5,
            heartbeat_grace_secs: 35,
            backoff_initial_secs: 1.0,
            backoff_max_secs: 30.0,
            artifact_fetch_timeout_secs: 30,
            tls_verify: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventHubConfig {
    pub poll_interval_secs: u64,
    pub cleanup_interval_secs: u64,
    pub retention_secs: i64,
    pub subscriber_channel_capacity: usize,
}

impl Default for EventHubConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            cleanup_interval_secs: 600,
            retention_secs: 3600,
            subscriber_channel_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct XdsConfig {
    pub listen_address: String,
    pub policy_engine_enabled: bool,
    pub snapshot_build_timeout_secs: u64,
}

impl Default for XdsConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:18000".to_string(),
            policy_engine_enabled: false,
            snapshot_build_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub otlp_endpoint: String,
    pub service_name: String,
    pub metrics_export_interval_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            otlp_endpoint: "http://localhost:4317".to_string(),
            service_name: "gwcp".to_string(),
            metrics_export_interval_secs: 10,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            link: LinkConfig::default(),
            eventhub: EventHubConfig::default(),
            xds: XdsConfig::default(),
            logging: LoggingConfig::default(),
            telemetry: TelemetryConfig::default(),
            tenant: TenantConfig::default(),
        }
    }
}

const ENV_PREFIX: &str = "GWCP";
const REGISTRATION_TOKEN_VAR: &str = "GATEWAY_REGISTRATION_TOKEN";

impl Config {
    /// Builds the layered source stack and searches the default file
    /// locations (`./gwcp.toml`, then `~/.config/gwcp/gwcp.toml`).
    pub fn load() -> Result<Self, ConfigError> {
        Self::assemble(FileSource::Discover)
    }

    /// Like [`Config::load`], but the file source is pinned to an
    /// explicit path — for a CLI `--config` override. The path must
    /// exist; callers asking for a specific file expect a clear error
    /// rather than a silent fall-through to defaults.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }
        Self::assemble(FileSource::Pinned(path.to_path_buf()))
    }

    /// Loads straight from a single TOML file with no discovery, no env
    /// overrides, and no registration-token injection — used by tests
    /// and tooling that want the file's contents verbatim.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }
        let raw = config::Config::builder()
            .add_source(config::File::from(path.to_path_buf()))
            .build()?;
        Ok(raw.try_deserialize()?)
    }

    fn assemble(file_source: FileSource) -> Result<Self, ConfigError> {
        let defaults = config::Config::try_from(&Config::default())?;
        let mut builder = config::Config::builder().add_source(defaults);

        builder = match file_source {
            FileSource::Pinned(path) => builder.add_source(config::File::from(path)),
            FileSource::Discover => {
                builder = builder.add_source(
                    config::File::from(PathBuf::from("gwcp.toml")).required(false),
                );
                if let Some(home) = dirs::home_dir() {
                    let user_config = home.join(".config").join("gwcp").join("gwcp.toml");
                    builder = builder.add_source(config::File::from(user_config).required(false));
                }
                builder
            }
        };

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let raw = builder.build()?;
        let mut config: Config = raw.try_deserialize()?;

        if let Ok(token) = std::env::var(REGISTRATION_TOKEN_VAR) {
            config.link.api_key = token;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "logging.level must be one of: {}",
                valid_levels.join(", ")
            )));
        }

        if self.link.backoff_initial_secs <= 0.0
            || self.link.backoff_max_secs < self.link.backoff_initial_secs
        {
            return Err(ConfigError::ValidationError(
                "link.backoff_initial_secs must be positive and <= backoff_max_secs".to_string(),
            ));
        }

        if self.eventhub.poll_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "eventhub.poll_interval_secs must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string).map_err(|source| ConfigError::WriteError {
            path: path.to_path_buf(),
            source,
        })
    }
}

enum FileSource {
    Discover,
    Pinned(PathBuf),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.xds.listen_address, "0.0.0.0:18000");
        assert_eq!(config.eventhub.poll_interval_secs, 5);
    }

    #[test]
    fn load_from_toml_overrides_defaults() {
        let toml_content = r#"
[store]
path = "/var/lib/gwcp/state.db"

[eventhub]
poll_interval_secs = 2
"#;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(toml_content.as_bytes()).unwrap();

        let config = Config::load_from_file(file.path()).unwrap();
        assert_eq!(config.store.path, "/var/lib/gwcp/state.db");
        assert_eq!(config.eventhub.poll_interval_secs, 2);
        // A field absent from the fragment falls back to the struct
        // default rather than some zeroed-out config type value.
        assert_eq!(config.xds.listen_address, "0.0.0.0:18000");
    }

    #[test]
    fn load_from_path_rejects_missing_file() {
        let missing = PathBuf::from("/nonexistent/gwcp.toml");
        let err = Config::load_from_path(&missing).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn load_from_path_applies_nested_env_override() {
        let toml_content = "[logging]\nlevel = \"warn\"\n";
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(toml_content.as_bytes()).unwrap();

        // SAFETY: test-only, single-threaded within this test body.
        std::env::set_var("GWCP__LOGGING__LEVEL", "debug");
        let config = Config::load_from_path(file.path());
        std::env::remove_var("GWCP__LOGGING__LEVEL");

        let config = config.unwrap();
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn registration_token_env_var_overrides_link_api_key() {
        let toml_content = "[link]\napi_key = \"file-token\"\n";
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(toml_content.as_bytes()).unwrap();

        std::env::set_var("GATEWAY_REGISTRATION_TOKEN", "injected-token");
        let config = Config::load_from_path(file.path());
        std::env::remove_var("GATEWAY_REGISTRATION_TOKEN");

        assert_eq!(config.unwrap().link.api_key, "injected-token");
    }

    #[test]
    fn rejects_invalid_log_level() {
        let mut config = Config::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_backoff_max_below_initial() {
        let mut config = Config::default();
        config.link.backoff_initial_secs = 5.0;
        config.link.backoff_max_secs = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn save_and_load_roundtrip() {
        let config = Config::default();
        let file = NamedTempFile::new().unwrap();
        config.save_to_file(file.path()).unwrap();
        let loaded = Config::load_from_file(file.path()).unwrap();
        assert_eq!(config.store.path, loaded.store.path);
    }
}
