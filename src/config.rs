//! Study configuration.
//!
//! A [`StudyConfig`] carries every numeric knob of a run. Values are
//! validated fail-fast when the study is constructed; a bad value never
//! surfaces at runtime.

use std::fmt;
use std::time::Duration;

use snafu::Snafu;

/// Which provide variant the host is asked to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProvideOp {
    /// The host's stock provide: full lookup, then ADD_PROVIDER to the
    /// closest K peers.
    #[default]
    Standard,
    /// Optimistic provide: start sending ADD_PROVIDER before the lookup has
    /// fully converged.
    Optimistic,
}

impl ProvideOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvideOp::Standard => "standard",
            ProvideOp::Optimistic => "optimistic",
        }
    }
}

impl fmt::Display for ProvideOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A configuration value failed validation.
#[derive(Debug, Snafu)]
#[snafu(display("invalid configuration for {key}: '{value}' ({reason})"))]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
    pub reason: &'static str,
}

/// Parameters of one measurement run.
#[derive(Debug, Clone)]
pub struct StudyConfig {
    /// Replication width requested from the DHT per publication.
    pub k: usize,
    /// How many CIDs to draw from the source.
    pub cid_number: usize,
    /// Parallel publication workers.
    pub publisher_workers: usize,
    /// Parallel probe workers.
    pub pinger_workers: usize,
    /// Minimum gap between two probe rounds of the same CID.
    pub req_interval: Duration,
    /// Intended lifetime of the study. Persisted with every CID for
    /// analysis; round accounting, not the clock, ends the run.
    pub study_duration: Duration,
    /// Rounds per CID including the publication round 0.
    pub rounds: usize,
    /// Bytes of random content behind each generated CID.
    pub content_size: usize,
    /// Provide variant to request from the host.
    pub prov_op: ProvideOp,
    /// Capacity of each sink channel.
    pub sink_capacity: usize,
}

impl Default for StudyConfig {
    fn default() -> Self {
        Self {
            k: 20,
            cid_number: 100,
            publisher_workers: 4,
            pinger_workers: 16,
            req_interval: Duration::from_secs(30 * 60),
            study_duration: Duration::from_secs(48 * 60 * 60),
            rounds: 10,
            content_size: 1024,
            prov_op: ProvideOp::Standard,
            sink_capacity: 10_000,
        }
    }
}

impl StudyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn positive(key: &'static str, value: usize) -> Result<(), ConfigError> {
            if value == 0 {
                return Err(ConfigError {
                    key,
                    value: value.to_string(),
                    reason: "must be at least 1",
                });
            }
            Ok(())
        }

        positive("k", self.k)?;
        positive("cid_number", self.cid_number)?;
        positive("publisher_workers", self.publisher_workers)?;
        positive("pinger_workers", self.pinger_workers)?;
        positive("rounds", self.rounds)?;
        positive("content_size", self.content_size)?;
        positive("sink_capacity", self.sink_capacity)?;

        if self.req_interval.is_zero() {
            return Err(ConfigError {
                key: "req_interval",
                value: format!("{:?}", self.req_interval),
                reason: "must be a positive duration",
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(StudyConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_workers_are_rejected() {
        let cfg = StudyConfig {
            publisher_workers: 0,
            ..StudyConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.key, "publisher_workers");
    }

    #[test]
    fn zero_interval_is_rejected() {
        let cfg = StudyConfig {
            req_interval: Duration::ZERO,
            ..StudyConfig::default()
        };
        assert_eq!(cfg.validate().unwrap_err().key, "req_interval");
    }
}
