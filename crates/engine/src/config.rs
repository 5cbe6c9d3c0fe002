// Engine tunables: token pricing, cache TTL, parser thresholds, worker
// pool size. Loaded from TOML when the host has a config file; defaults
// are usable as-is.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Configuration for the authoring engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Minimum balance required before any provider call is made.
    pub min_immediate_cost: i64,
    /// Flat cost charged up front for a batch request.
    pub batch_flat_cost: i64,
    /// Characters-per-token divisor for estimating immediate-path cost
    /// when the provider does not report usage.
    pub chars_per_token: usize,
    /// Response cache time-to-live.
    pub cache_ttl_hours: i64,
    /// Candidate length above which a failed JSON decode is treated as a
    /// truncated provider response.
    pub truncation_threshold: usize,
    /// Number of background task workers.
    pub worker_count: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_immediate_cost: 5,
            batch_flat_cost: 50,
            chars_per_token: 4,
            cache_ttl_hours: 12,
            truncation_threshold: 512,
            worker_count: 2,
        }
    }
}

impl EngineConfig {
    /// Load from a TOML file.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&contents).map_err(ConfigError::Parse)
    }

    /// Save to a TOML file (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }
        let contents = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(path, contents).map_err(ConfigError::Io)
    }

    /// Estimate the token cost of a reply by length: `ceil(chars / divisor)`.
    pub fn estimate_cost(&self, reply: &str) -> i64 {
        let chars = reply.chars().count();
        (chars.div_ceil(self.chars_per_token.max(1))) as i64
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(std::io::Error),
    #[error("config parse error: {0}")]
    Parse(toml::de::Error),
    #[error("config serialize error: {0}")]
    Serialize(toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = EngineConfig::default();
        assert!(config.min_immediate_cost > 0);
        assert!(config.batch_flat_cost > config.min_immediate_cost);
        assert!(config.worker_count >= 1);
    }

    #[test]
    fn cost_estimate_rounds_up() {
        let config = EngineConfig::default(); // 4 chars per token
        assert_eq!(config.estimate_cost(""), 0);
        assert_eq!(config.estimate_cost("abc"), 1);
        assert_eq!(config.estimate_cost("abcd"), 1);
        assert_eq!(config.estimate_cost("abcde"), 2);
    }

    #[test]
    fn round_trips_through_toml() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let path = dir.path().join("engine.toml");

        let mut config = EngineConfig::default();
        config.batch_flat_cost = 75;
        config.save_to(&path).expect("save should succeed");

        let loaded = EngineConfig::load_from(&path).expect("load should succeed");
        assert_eq!(loaded, config);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "worker_count = 8\n").expect("write should succeed");

        let loaded = EngineConfig::load_from(&path).expect("load should succeed");
        assert_eq!(loaded.worker_count, 8);
        assert_eq!(loaded.batch_flat_cost, EngineConfig::default().batch_flat_cost);
    }
}
