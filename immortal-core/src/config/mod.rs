pub mod types;

pub use types::*;

use anyhow::{Context, Result};
use std::path::Path;

impl Config {
    /// Load configuration from a JSON file and validate it
    ///
    /// Missing sections and fields take their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path.display()))?;

        let cfg: Config = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse configuration file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        self.stream.validate()?;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.as_str()) {
            anyhow::bail!(
                "Invalid log level '{}', must be one of: {:?}",
                self.logging.level,
                valid_log_levels
            );
        }

        if let Some(metrics) = &self.metrics {
            if !metrics.metrics_path.starts_with('/') {
                anyhow::bail!("metrics_path must start with '/'");
            }
        }

        Ok(())
    }
}

impl PipeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.ring_capacity == 0 {
            anyhow::bail!("ring_capacity must be positive");
        }

        if let Some(retry) = &self.retry {
            if retry.multiplier < 1.0 {
                anyhow::bail!("retry multiplier must be at least 1.0");
            }
            if !(0.0..=1.0).contains(&retry.jitter_factor) {
                anyhow::bail!("retry jitter_factor must be within [0, 1]");
            }
            if retry.initial_delay > retry.max_delay {
                anyhow::bail!("retry initial_delay cannot exceed max_delay");
            }
        }

        Ok(())
    }
}

impl StreamConfig {
    pub fn validate(&self) -> Result<()> {
        self.pipe.validate()?;

        if self.copy_buffer_size == 0 {
            anyhow::bail!("copy_buffer_size must be positive");
        }

        if self.handshake_timeout.is_zero() {
            anyhow::bail!("handshake_timeout must be positive");
        }

        Ok(())
    }
}

/// Serde helper storing a `Duration` as integer milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::BackoffConfig;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.stream.pipe.ring_capacity = 0;
        assert!(config.validate().is_err());
        config.stream.pipe.ring_capacity = 1024;

        config.stream.copy_buffer_size = 0;
        assert!(config.validate().is_err());
        config.stream.copy_buffer_size = 4096;

        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());
        config.logging.level = "debug".to_string();

        config.stream.pipe.retry = Some(BackoffConfig {
            multiplier: 0.5,
            ..Default::default()
        });
        assert!(config.validate().is_err());

        config.stream.pipe.retry = Some(BackoffConfig {
            jitter_factor: 1.5,
            ..Default::default()
        });
        assert!(config.validate().is_err());

        config.stream.pipe.retry = Some(BackoffConfig::aggressive());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_file_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "stream": {{
                    "pipe": {{ "name": "shell", "ring_capacity": 4096 }},
                    "handshake_timeout_ms": 1500
                }},
                "logging": {{ "json": true }}
            }}"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.stream.pipe.name, "shell");
        assert_eq!(config.stream.pipe.ring_capacity, 4096);
        assert_eq!(config.stream.handshake_timeout, Duration::from_millis(1500));
        assert_eq!(config.stream.copy_buffer_size, 32 * 1024);
        assert!(config.logging.json);
        assert_eq!(config.logging.level, "info");
        assert!(config.metrics.is_none());
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "stream": {{ "pipe": {{ "ring_capacity": 0 }} }} }}"#).unwrap();

        let err = Config::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("ring_capacity"));
    }

    #[test]
    fn test_load_missing_file_names_path() {
        let err = Config::load("/nonexistent/immortal.json").unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/immortal.json"));
    }

    #[test]
    fn test_round_trips_through_json() {
        let mut config = Config::default();
        config.stream.pipe.retry = Some(BackoffConfig::conservative());
        config.metrics = Some(Default::default());

        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
