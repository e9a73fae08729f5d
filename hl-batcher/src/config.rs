use crate::error::{BatcherError, Result};
use std::time::Duration;

pub(crate) const DEFAULT_THRESHOLD: usize = 5;
pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_MAX_BATCH_LENGTH: usize = 8192;
pub(crate) const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(300);
/// Upper bound for every configured period; deadlines are computed as `now + period`.
pub const MAX_PERIOD: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Number of buffered items that forces an immediate flush.
    pub threshold: usize,
    /// Quiet period after the last ingest before a timeout flush.
    pub timeout: Duration,
    /// Idle age after which the reaper discards a session.
    pub staleness: Duration,
    /// Cap on the concatenated batch, in characters.
    pub max_batch_length: usize,
    pub reap_interval: Duration,
    /// Joins buffered items into the batch text.
    pub separator: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            timeout: DEFAULT_TIMEOUT,
            staleness: DEFAULT_TIMEOUT * 2,
            max_batch_length: DEFAULT_MAX_BATCH_LENGTH,
            reap_interval: DEFAULT_REAP_INTERVAL,
            separator: " ".to_string(),
        }
    }
}

impl EngineConfig {
    /// Defaults with `staleness` tracking twice the given timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            staleness: timeout * 2,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.threshold == 0 {
            return Err(BatcherError::InvalidConfig(
                "threshold must be > 0".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(BatcherError::InvalidConfig(
                "timeout must be > 0".to_string(),
            ));
        }
        if self.staleness < self.timeout {
            return Err(BatcherError::InvalidConfig(format!(
                "staleness ({:?}) must be >= timeout ({:?})",
                self.staleness, self.timeout
            )));
        }
        if self.max_batch_length == 0 {
            return Err(BatcherError::InvalidConfig(
                "max_batch_length must be > 0".to_string(),
            ));
        }
        if self.reap_interval.is_zero() {
            return Err(BatcherError::InvalidConfig(
                "reap_interval must be > 0".to_string(),
            ));
        }
        for (name, period) in [
            ("timeout", self.timeout),
            ("staleness", self.staleness),
            ("reap_interval", self.reap_interval),
        ] {
            if period > MAX_PERIOD {
                return Err(BatcherError::InvalidConfig(format!(
                    "{name} ({period:?}) must be at most {MAX_PERIOD:?}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MentionCacheConfig {
    /// Messages kept per group; the oldest is evicted beyond this.
    pub capacity: usize,
    pub max_age: Duration,
}

impl Default for MentionCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 20,
            max_age: Duration::from_secs(3600),
        }
    }
}

impl MentionCacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(BatcherError::InvalidConfig(
                "mention cache capacity must be > 0".to_string(),
            ));
        }
        if self.max_age.is_zero() {
            return Err(BatcherError::InvalidConfig(
                "mention cache max_age must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_knobs() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.threshold, 5);
        assert_eq!(cfg.timeout, Duration::from_secs(10));
        assert_eq!(cfg.staleness, Duration::from_secs(20));
        assert_eq!(cfg.max_batch_length, 8192);
        assert_eq!(cfg.reap_interval, Duration::from_secs(300));
        cfg.validate().expect("defaults are valid");
    }

    #[test]
    fn rejects_zero_threshold_and_timeout() {
        let cfg = EngineConfig {
            threshold: 0,
            ..EngineConfig::default()
        };
        let err = cfg.validate().expect_err("zero threshold");
        assert!(err.to_string().contains("threshold"));

        let cfg = EngineConfig {
            timeout: Duration::ZERO,
            ..EngineConfig::default()
        };
        let err = cfg.validate().expect_err("zero timeout");
        assert!(err.to_string().contains("timeout must be > 0"));
    }

    #[test]
    fn rejects_staleness_shorter_than_timeout() {
        let cfg = EngineConfig {
            staleness: Duration::from_secs(5),
            ..EngineConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(BatcherError::InvalidConfig(_))
        ));
    }

    #[test]
    fn rejects_periods_beyond_a_year() {
        let cfg = EngineConfig {
            timeout: MAX_PERIOD + Duration::from_secs(1),
            staleness: MAX_PERIOD * 2,
            ..EngineConfig::default()
        };
        let err = cfg.validate().expect_err("huge timeout");
        assert!(err.to_string().contains("timeout"));

        let cfg = EngineConfig {
            reap_interval: MAX_PERIOD * 3,
            ..EngineConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = EngineConfig::with_timeout(MAX_PERIOD / 2);
        cfg.validate().expect("half-year timeout with year staleness");
    }

    #[test]
    fn with_timeout_scales_staleness() {
        let cfg = EngineConfig::with_timeout(Duration::from_secs(3));
        assert_eq!(cfg.staleness, Duration::from_secs(6));
    }

    #[test]
    fn mention_cache_rejects_zero_capacity() {
        let cfg = MentionCacheConfig {
            capacity: 0,
            ..MentionCacheConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
