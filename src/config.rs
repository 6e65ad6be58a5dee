//! Host-level configuration (TOML).
//!
//! This is the integrator-facing config of the binary: backend URL,
//! identity strings, storage directory. The OCPP configuration keys the
//! server can read and write live in [`crate::storage::configuration`],
//! not here.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub backend: BackendConfig,
    pub charger: ChargerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base endpoint; the charge point id is appended as a path segment.
    pub url: String,
    pub charge_point_id: String,
    /// `ocpp1.6` or `ocpp2.0.1`.
    pub protocol: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:9000/ocpp".to_string(),
            charge_point_id: "CP001".to_string(),
            protocol: "ocpp1.6".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChargerConfig {
    pub vendor: String,
    pub model: String,
    pub serial_number: Option<String>,
    pub firmware_version: Option<String>,
    pub connectors: u32,
    pub storage_dir: String,
}

impl Default for ChargerConfig {
    fn default() -> Self {
        Self {
            vendor: "GenericVendor".to_string(),
            model: "GenericCharger".to_string(),
            serial_number: None,
            firmware_version: None,
            connectors: 1,
            storage_dir: "./ocpp-data".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    /// Full WebSocket endpoint including the charge point id.
    pub fn endpoint(&self) -> String {
        format!(
            "{}/{}",
            self.backend.url.trim_end_matches('/'),
            self.backend.charge_point_id
        )
    }
}

pub fn default_config_path() -> PathBuf {
    dirs_next::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ocpp-client/config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.backend.protocol, "ocpp1.6");
        assert_eq!(cfg.charger.connectors, 1);
        assert_eq!(cfg.endpoint(), "ws://localhost:9000/ocpp/CP001");
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: AppConfig = toml::from_str(
            r#"
            [backend]
            url = "wss://csms.example.com/ocpp"
            charge_point_id = "STATION-7"

            [charger]
            vendor = "Acme"
            model = "FastCharge 22"
            connectors = 2
            "#,
        )
        .unwrap();
        assert_eq!(cfg.endpoint(), "wss://csms.example.com/ocpp/STATION-7");
        assert_eq!(cfg.charger.connectors, 2);
        assert_eq!(cfg.logging.level, "info");
    }
}
