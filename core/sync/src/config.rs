//! Runtime configuration for a sharing session.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use listshare_common::{Error, Result};

use crate::retry::RetryPolicy;

/// Configuration for the sharing engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SharingConfig {
    /// Retry timing after a failed drain.
    pub retry: RetryPolicy,
    /// Maximum number of list entries per `add-shared-list-entries` action.
    pub chunk_size: usize,
    /// Whether changes applied by cloud sync are propagated to shared lists.
    pub process_sync_changes: bool,
    /// How long sharing events stay available to late subscribers.
    pub event_replay_window: Duration,
    /// How many events are kept for late subscribers.
    pub event_replay_capacity: usize,
    /// Buffer size of the live event channel.
    pub event_channel_capacity: usize,
}

impl SharingConfig {
    /// Parse a JSON configuration; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::Serialization(format!("Invalid sharing config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Check values that would make the engine misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::InvalidInput("chunk_size must be at least 1".to_string()));
        }
        if self.event_channel_capacity == 0 {
            return Err(Error::InvalidInput(
                "event_channel_capacity must be at least 1".to_string(),
            ));
        }
        if self.retry.interval.is_zero() {
            return Err(Error::InvalidInput("retry interval must not be zero".to_string()));
        }
        Ok(())
    }
}

impl Default for SharingConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            chunk_size: 100,
            process_sync_changes: true,
            event_replay_window: Duration::from_secs(5),
            event_replay_capacity: 16,
            event_channel_capacity: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = SharingConfig::default();
        assert_eq!(config.chunk_size, 100);
        assert!(config.process_sync_changes);
        assert_eq!(config.retry.interval, Duration::from_secs(300));
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_json() {
        let config = SharingConfig::from_json(r#"{"chunk_size": 2, "process_sync_changes": false}"#)
            .unwrap();
        assert_eq!(config.chunk_size, 2);
        assert!(!config.process_sync_changes);
        assert_eq!(config.event_replay_capacity, 16);
    }

    #[test]
    fn test_rejects_zero_chunk_size() {
        let result = SharingConfig::from_json(r#"{"chunk_size": 0}"#);
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_rejects_malformed_json() {
        let result = SharingConfig::from_json("{chunk_size: }");
        assert!(matches!(result, Err(Error::Serialization(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"event_replay_capacity": 4}}"#).unwrap();

        let config = SharingConfig::load(file.path()).unwrap();
        assert_eq!(config.event_replay_capacity, 4);
    }
}
