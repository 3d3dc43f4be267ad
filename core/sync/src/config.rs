//! Engine configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use fieldsync_common::{Error, Result};

use crate::retry::RetryConfig;

/// Backoff settings for remote writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl RetrySettings {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig::new(self.max_retries)
            .with_initial_delay(Duration::from_millis(self.base_delay_ms))
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
        }
    }
}

/// Two-phase geolocation policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationSettings {
    pub high_accuracy_timeout_ms: u64,
    pub low_accuracy_timeout_ms: u64,
    /// Retries of the high-accuracy request before falling back.
    pub high_accuracy_retries: u32,
    pub retry_base_delay_ms: u64,
    /// Oldest cached fix the platform may return; 0 forces a fresh one.
    pub maximum_age_ms: u64,
}

impl Default for LocationSettings {
    fn default() -> Self {
        Self {
            high_accuracy_timeout_ms: 15_000,
            low_accuracy_timeout_ms: 10_000,
            high_accuracy_retries: 2,
            retry_base_delay_ms: 500,
            maximum_age_ms: 0,
        }
    }
}

/// When and how images are shrunk before upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionSettings {
    pub enabled: bool,
    /// Only sources strictly larger than this are compressed.
    pub threshold_bytes: u64,
    pub max_width_px: u32,
    /// Lossy quality in `0.0..=1.0`.
    pub quality: f32,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_bytes: 1024 * 1024,
            max_width_px: 1200,
            quality: 0.7,
        }
    }
}

/// Upload destination and selection limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadSettings {
    pub storage_path: String,
    pub max_images: usize,
    pub max_file_size: u64,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            storage_path: "offline_visits".to_string(),
            max_images: 3,
            max_file_size: 20 * 1024 * 1024,
        }
    }
}

/// Configuration for the whole engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Top-level ledger collection holding one document per agent.
    pub agent_collection: String,
    pub retry: RetrySettings,
    pub location: LocationSettings,
    pub compression: CompressionSettings,
    pub upload: UploadSettings,
}

impl EngineConfig {
    /// Load configuration from a JSON file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Write configuration as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Serialize configuration to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn with_agent_collection(mut self, collection: impl Into<String>) -> Self {
        self.agent_collection = collection.into();
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            agent_collection: "agents".to_string(),
            retry: RetrySettings::default(),
            location: LocationSettings::default(),
            compression: CompressionSettings::default(),
            upload: UploadSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::from_json("{}").unwrap();
        assert_eq!(config.agent_collection, "agents");
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert_eq!(config.location.high_accuracy_timeout_ms, 15_000);
        assert_eq!(config.location.low_accuracy_timeout_ms, 10_000);
        assert_eq!(config.compression.threshold_bytes, 1_048_576);
        assert_eq!(config.upload.storage_path, "offline_visits");
        assert_eq!(config.upload.max_images, 3);
    }

    #[test]
    fn test_partial_override() {
        let config = EngineConfig::from_json(
            r#"{"agent_collection": "fieldAgents", "retry": {"max_retries": 5}}"#,
        )
        .unwrap();
        assert_eq!(config.agent_collection, "fieldAgents");
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert!(config.compression.enabled);
    }

    #[test]
    fn test_retry_config_conversion() {
        let settings = RetrySettings {
            max_retries: 2,
            base_delay_ms: 250,
        };
        let retry = settings.to_retry_config();
        assert_eq!(retry.max_retries, 2);
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(500));
    }

    #[test]
    fn test_load_and_save() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("engine.json");

        let mut config = EngineConfig::default().with_agent_collection("crew");
        config.upload.max_images = 5;
        config.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            EngineConfig::from_json("not json"),
            Err(Error::Serialization(_))
        ));
    }
}
