//! Cache Settings
//!
//! Process-level cache configuration, read once at startup from CLI flags,
//! environment variables or a YAML document, then turned into the
//! component configs.

use crate::cache::compression::{CompressionConfig, MAX_COMPRESSION_LEVEL, MIN_COMPRESSION_LEVEL};
use crate::cache::manager::{CacheManagerConfig, MB};
use crate::cache::policy::EvictionPolicy;
use crate::cache::prefetch::PrefetchConfig;
use crate::cache::remote::RedisConfig;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Cache settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Eviction policy: lru, lfu, fifo, ttl or hybrid
    pub cache_policy: String,
    /// Default TTL in seconds (0 disables expiry)
    pub cache_ttl: u64,
    /// Total memory budget in MB
    pub max_memory_size: u64,
    pub cache_partitions: usize,
    pub l1_size_ratio: f64,
    pub prefetch_threshold: f64,
    /// Values at or above this size (bytes) are compressed
    pub compression_threshold: u64,
    pub compression_level: u32,
    pub use_redis: bool,
    pub redis_url: String,
    /// Prefix of every Redis key written by this cache
    pub redis_key_prefix: String,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            cache_policy: "hybrid".into(),
            cache_ttl: 3600,
            max_memory_size: 1024,
            cache_partitions: 16,
            l1_size_ratio: 0.2,
            prefetch_threshold: 0.8,
            compression_threshold: 1024,
            compression_level: 6,
            use_redis: false,
            redis_url: "redis://localhost:6379".into(),
            redis_key_prefix: "ngx-cache:".into(),
        }
    }
}

impl CacheSettings {
    /// Load settings from a YAML file; absent fields keep their defaults
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let settings = Self::from_yaml_str(&raw)?;
        info!(path = %path.display(), "Loaded cache settings");
        Ok(settings)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let settings: Self = serde_yaml::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn policy(&self) -> Result<EvictionPolicy> {
        self.cache_policy.parse()
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        self.policy()?;
        if self.cache_partitions == 0 {
            return Err(Error::Configuration("cache_partitions must be at least 1".into()));
        }
        if self.max_memory_size == 0 {
            return Err(Error::Configuration("max_memory_size must be greater than 0".into()));
        }
        for (name, value) in [
            ("l1_size_ratio", self.l1_size_ratio),
            ("prefetch_threshold", self.prefetch_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Configuration(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        if !(MIN_COMPRESSION_LEVEL..=MAX_COMPRESSION_LEVEL).contains(&self.compression_level) {
            return Err(Error::Configuration(format!(
                "compression_level must be between {} and {}, got {}",
                MIN_COMPRESSION_LEVEL, MAX_COMPRESSION_LEVEL, self.compression_level
            )));
        }
        if self.use_redis && self.redis_url.is_empty() {
            return Err(Error::Configuration("redis_url is required when use_redis is set".into()));
        }
        Ok(())
    }

    /// Cache manager configuration for these settings
    pub fn manager_config(&self) -> Result<CacheManagerConfig> {
        self.validate()?;
        Ok(CacheManagerConfig {
            max_memory_bytes: self.max_memory_size.saturating_mul(MB),
            partitions: self.cache_partitions,
            l1_ratio: self.l1_size_ratio,
            policy: self.policy()?,
            default_ttl: (self.cache_ttl > 0).then(|| Duration::from_secs(self.cache_ttl)),
            compression: CompressionConfig {
                threshold_bytes: self.compression_threshold,
                level: self.compression_level,
                ..Default::default()
            },
            prefetch: PrefetchConfig::with_threshold(self.prefetch_threshold),
            ..Default::default()
        })
    }

    /// Redis configuration, when enabled
    pub fn redis_config(&self) -> Option<RedisConfig> {
        self.use_redis.then(|| RedisConfig {
            key_prefix: self.redis_key_prefix.clone(),
            ..RedisConfig::new(self.redis_url.clone())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let settings = CacheSettings::default();
        settings.validate().unwrap();

        let config = settings.manager_config().unwrap();
        assert_eq!(config.max_memory_bytes, 1024 * MB);
        assert_eq!(config.policy, EvictionPolicy::Hybrid);
        assert_eq!(config.default_ttl, Some(Duration::from_secs(3600)));
        assert!(settings.redis_config().is_none());
    }

    #[test]
    fn test_zero_ttl_disables_expiry() {
        let settings = CacheSettings {
            cache_ttl: 0,
            ..Default::default()
        };
        assert_eq!(settings.manager_config().unwrap().default_ttl, None);
    }

    #[test]
    fn test_validation_errors() {
        let cases = [
            CacheSettings {
                cache_policy: "random".into(),
                ..Default::default()
            },
            CacheSettings {
                cache_partitions: 0,
                ..Default::default()
            },
            CacheSettings {
                l1_size_ratio: 1.2,
                ..Default::default()
            },
            CacheSettings {
                compression_level: 12,
                ..Default::default()
            },
        ];
        for settings in cases {
            assert_matches!(settings.validate(), Err(Error::Configuration(_)));
        }
    }

    #[test]
    fn test_yaml_file_loading() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "cache_policy: lru\ncache_partitions: 4\nuse_redis: true\nredis_url: redis://cache:6379"
        )
        .unwrap();

        let settings = CacheSettings::from_yaml_file(file.path()).unwrap();
        assert_eq!(settings.policy().unwrap(), EvictionPolicy::Lru);
        assert_eq!(settings.cache_partitions, 4);
        assert_eq!(settings.cache_ttl, 3600);

        let redis = settings.redis_config().unwrap();
        assert_eq!(redis.url, "redis://cache:6379");
        assert_eq!(redis.key_prefix, "ngx-cache:");
    }

    #[test]
    fn test_invalid_yaml_rejected() {
        assert_matches!(
            CacheSettings::from_yaml_str("cache_partitions: many"),
            Err(Error::YamlParse(_))
        );
        assert_matches!(
            CacheSettings::from_yaml_str("prefetch_threshold: 3.0"),
            Err(Error::Configuration(_))
        );
    }
}
