/// Configuration management for atalaya
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::topology::{ConnectionMode, EndPoint};

/// Cluster-level settings: which servers to seed, how to interpret them, and
/// the timing knobs for monitoring and selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSettings {
    /// Seed endpoints, as host:port strings
    pub endpoints: Vec<String>,
    /// How to connect to the seed list
    pub connection_mode: ConnectionMode,
    /// Required replica set name, if any
    pub replica_set_name: Option<String>,
    /// Upper bound on how long one server selection may wait
    pub server_selection_timeout_ms: u64,
    /// Cadence of the per-server heartbeat loop
    pub heartbeat_interval_ms: u64,
    /// Lower bound between two consecutive heartbeats of one server
    pub min_heartbeat_interval_ms: u64,
    /// Width of the acceptable latency window above the fastest candidate
    pub latency_window_ms: u64,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            endpoints: vec!["127.0.0.1:27017".to_string()],
            connection_mode: ConnectionMode::Automatic,
            replica_set_name: None,
            server_selection_timeout_ms: 30_000,
            heartbeat_interval_ms: 10_000,
            min_heartbeat_interval_ms: 500,
            latency_window_ms: 15,
        }
    }
}

impl ClusterSettings {
    /// Load settings from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let settings: ClusterSettings =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        settings.validate()?;
        Ok(settings)
    }

    /// Save settings to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoints.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one endpoint is required".to_string(),
            ));
        }

        for endpoint in &self.endpoints {
            EndPoint::from_str(endpoint).map_err(|_| {
                ConfigError::ValidationError(format!("invalid endpoint: {}", endpoint))
            })?;
        }

        match self.connection_mode {
            ConnectionMode::Direct | ConnectionMode::Standalone => {
                if self.endpoints.len() != 1 {
                    return Err(ConfigError::ValidationError(format!(
                        "{:?} mode requires exactly one endpoint, got {}",
                        self.connection_mode,
                        self.endpoints.len()
                    )));
                }
            }
            _ => {}
        }

        if self.replica_set_name.is_some()
            && matches!(
                self.connection_mode,
                ConnectionMode::Sharded | ConnectionMode::Standalone
            )
        {
            return Err(ConfigError::ValidationError(format!(
                "replica_set_name is not valid in {:?} mode",
                self.connection_mode
            )));
        }

        if self.server_selection_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "server_selection_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "heartbeat_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.min_heartbeat_interval_ms > self.heartbeat_interval_ms {
            return Err(ConfigError::ValidationError(
                "min_heartbeat_interval_ms must not exceed heartbeat_interval_ms".to_string(),
            ));
        }

        Ok(())
    }

    /// Parsed seed endpoints; call after `validate()`.
    pub fn parsed_endpoints(&self) -> Vec<EndPoint> {
        self.endpoints
            .iter()
            .filter_map(|e| EndPoint::from_str(e).ok())
            .collect()
    }

    pub fn server_selection_timeout(&self) -> Duration {
        Duration::from_millis(self.server_selection_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn min_heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.min_heartbeat_interval_ms)
    }

    pub fn latency_window(&self) -> Duration {
        Duration::from_millis(self.latency_window_ms)
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_settings() {
        let settings = ClusterSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.server_selection_timeout(), Duration::from_secs(30));
        assert_eq!(settings.min_heartbeat_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_validation_rejects_empty_endpoints() {
        let settings = ClusterSettings {
            endpoints: vec![],
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_endpoint() {
        let settings = ClusterSettings {
            endpoints: vec!["host:badport".to_string()],
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_direct_mode_requires_single_endpoint() {
        let settings = ClusterSettings {
            endpoints: vec!["a:27017".to_string(), "b:27017".to_string()],
            connection_mode: ConnectionMode::Direct,
            ..Default::default()
        };
        assert!(settings.validate().is_err());

        let settings = ClusterSettings {
            endpoints: vec!["a:27017".to_string()],
            connection_mode: ConnectionMode::Direct,
            ..Default::default()
        };
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validation_set_name_incompatible_with_sharded() {
        let settings = ClusterSettings {
            replica_set_name: Some("rs0".to_string()),
            connection_mode: ConnectionMode::Sharded,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_min_interval_bounded_by_interval() {
        let settings = ClusterSettings {
            heartbeat_interval_ms: 100,
            min_heartbeat_interval_ms: 500,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_settings_serialization() {
        let settings = ClusterSettings::default();
        let toml_str = toml::to_string(&settings).unwrap();
        let parsed: ClusterSettings = toml::from_str(&toml_str).unwrap();
        assert!(parsed.validate().is_ok());
        assert_eq!(parsed.endpoints, settings.endpoints);
    }

    #[test]
    fn test_settings_file_operations() {
        let settings = ClusterSettings {
            endpoints: vec!["db1:27017".to_string(), "db2:27017".to_string()],
            connection_mode: ConnectionMode::ReplicaSet,
            replica_set_name: Some("rs0".to_string()),
            ..Default::default()
        };
        let temp_file = NamedTempFile::new().unwrap();

        settings.save_to_file(temp_file.path()).unwrap();
        let loaded = ClusterSettings::load_from_file(temp_file.path()).unwrap();
        assert_eq!(loaded.replica_set_name.as_deref(), Some("rs0"));
        assert_eq!(loaded.parsed_endpoints().len(), 2);
    }
}
