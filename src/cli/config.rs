//! Psigrid configuration file handling.
//!
//! Operator settings only: logging and the setup-structure default. Nothing
//! protocol-visible lives here - the handshake semantics are fixed by the
//! protocol, not configurable per deployment.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use psigrid::engine::SetupStructure;

/// Default log level
const DEFAULT_LOG_LEVEL: &str = "info";

/// Psigrid service configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PsigridConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Protocol defaults
    #[serde(default)]
    pub protocol: ProtocolConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

/// Protocol defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Server setup structure: "gcs" (compact, probabilistic) or "raw" (exact)
    #[serde(default = "default_setup_structure")]
    pub setup_structure: String,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            setup_structure: default_setup_structure(),
        }
    }
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_setup_structure() -> String {
    "gcs".to_string()
}

impl PsigridConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file '{}': {}", path.display(), e))?;

        let config: PsigridConfig = toml::from_str(&contents)
            .map_err(|e| format!("Failed to parse config file '{}': {}", path.display(), e))?;

        Ok(config)
    }

    /// Write a default configuration file, creating parent directories
    pub fn create_default(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        let contents = toml::to_string_pretty(&PsigridConfig::default())
            .map_err(|e| format!("Failed to serialize config: {}", e))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create config directory: {}", e))?;
        }
        fs::write(path, contents)
            .map_err(|e| format!("Failed to write config file '{}': {}", path.display(), e))?;

        Ok(())
    }

    /// Parsed setup structure selector.
    pub fn setup_structure(&self) -> Result<SetupStructure, Box<dyn std::error::Error>> {
        match self.protocol.setup_structure.as_str() {
            "gcs" => Ok(SetupStructure::Gcs),
            "raw" => Ok(SetupStructure::Raw),
            other => Err(format!(
                "invalid setup_structure '{}' (expected 'gcs' or 'raw')",
                other
            )
            .into()),
        }
    }
}

/// Default config location: `<platform data dir>/psigrid/config.toml`
pub fn default_config_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("psigrid")
        .join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        PsigridConfig::create_default(&path).unwrap();
        let config = PsigridConfig::load(&path).unwrap();

        assert_eq!(config.logging.level, "info");
        assert!(matches!(config.setup_structure().unwrap(), SetupStructure::Gcs));
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[logging]\nlevel = \"debug\"\n").unwrap();

        let config = PsigridConfig::load(&path).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.protocol.setup_structure, "gcs");
    }

    #[test]
    fn test_invalid_structure_rejected() {
        let config = PsigridConfig {
            protocol: ProtocolConfig {
                setup_structure: "bloom".to_string(),
            },
            ..Default::default()
        };
        assert!(config.setup_structure().is_err());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(PsigridConfig::load(Path::new("/nonexistent/config.toml")).is_err());
    }
}
