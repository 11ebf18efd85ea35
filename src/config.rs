use crate::auth::{ProtectedRange, default_protected_ranges};
use crate::error::ConfigError;
use crate::pdu::MAX_READ_COUNT;
use crate::timing::OpKind;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Retry policy for reads that time out or come back garbled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 250,
        }
    }
}

impl RetryPolicy {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Capped exponential backoff between connection attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Consecutive failed attempts before the caller sees a connection error.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1_000,
            max_backoff_ms: 300_000,
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearnerConfig {
    pub min_samples: usize,
    pub safety_margin: f64,
    pub min_timeout_ms: u64,
    pub max_timeout_ms: u64,
}

impl Default for LearnerConfig {
    fn default() -> Self {
        Self {
            min_samples: 20,
            safety_margin: 1.5,
            min_timeout_ms: 300,
            max_timeout_ms: 5_000,
        }
    }
}

impl LearnerConfig {
    pub fn min_timeout(&self) -> Duration {
        Duration::from_millis(self.min_timeout_ms)
    }

    pub fn max_timeout(&self) -> Duration {
        Duration::from_millis(self.max_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InverterConfig {
    pub unit_id: u8,
    pub min_spacing_ms: u64,
    pub poll_interval_secs: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub auth_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub max_batch_size: u16,
    /// Consecutive response timeouts before the link is considered dead.
    pub max_consecutive_timeouts: u32,
    pub timing_window: usize,
    pub verify_delay_ms: u64,
    pub persist_interval_secs: u64,
    /// When set, the only password ever sent; the built-in candidates are
    /// used only when this is absent.
    pub password: Option<u16>,
    pub protected_ranges: Vec<ProtectedRange>,
    pub retry: RetryPolicy,
    pub reconnect: ReconnectPolicy,
    pub learner: LearnerConfig,
}

impl Default for InverterConfig {
    fn default() -> Self {
        Self {
            unit_id: 1,
            min_spacing_ms: 50,
            poll_interval_secs: 15,
            read_timeout_ms: 1_500,
            write_timeout_ms: 1_000,
            auth_timeout_ms: 1_500,
            connect_timeout_ms: 15_000,
            max_batch_size: 16,
            max_consecutive_timeouts: 5,
            timing_window: 100,
            verify_delay_ms: 150,
            persist_interval_secs: 600,
            password: None,
            protected_ranges: default_protected_ranges(),
            retry: RetryPolicy::default(),
            reconnect: ReconnectPolicy::default(),
            learner: LearnerConfig::default(),
        }
    }
}

impl InverterConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the coordinator cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, reason: String| -> Result<(), ConfigError> {
            Err(ConfigError::InvalidSetting { field, reason })
        };
        if !(1..=MAX_READ_COUNT).contains(&self.max_batch_size) {
            return invalid(
                "max_batch_size",
                format!("{} is outside 1..={MAX_READ_COUNT}", self.max_batch_size),
            );
        }
        if self.reconnect.initial_backoff_ms > self.reconnect.max_backoff_ms {
            return invalid(
                "reconnect.initial_backoff_ms",
                format!(
                    "{} exceeds max_backoff_ms {}",
                    self.reconnect.initial_backoff_ms, self.reconnect.max_backoff_ms
                ),
            );
        }
        let learner = &self.learner;
        if learner.min_timeout_ms > learner.max_timeout_ms {
            return invalid(
                "learner.min_timeout_ms",
                format!(
                    "{} exceeds max_timeout_ms {}",
                    learner.min_timeout_ms, learner.max_timeout_ms
                ),
            );
        }
        if !learner.safety_margin.is_finite() || learner.safety_margin <= 0.0 {
            return invalid(
                "learner.safety_margin",
                format!("{} is not a positive factor", learner.safety_margin),
            );
        }
        if self.timing_window < learner.min_samples {
            return invalid(
                "timing_window",
                format!(
                    "{} samples can never reach learner.min_samples {}",
                    self.timing_window, learner.min_samples
                ),
            );
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn min_spacing(&self) -> Duration {
        Duration::from_millis(self.min_spacing_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn verify_delay(&self) -> Duration {
        Duration::from_millis(self.verify_delay_ms)
    }

    pub fn persist_interval(&self) -> Duration {
        Duration::from_secs(self.persist_interval_secs)
    }

    /// Static timeout used until enough samples exist to learn one.
    pub fn default_timeout(&self, op: OpKind) -> Duration {
        Duration::from_millis(match op {
            OpKind::ReadRegister => self.read_timeout_ms,
            OpKind::WriteRegister => self.write_timeout_ms,
            OpKind::Authenticate => self.auth_timeout_ms,
            OpKind::Connect => self.connect_timeout_ms,
        })
    }

    /// Protected ranges with their password candidates. A configured password
    /// replaces every range's candidate list.
    pub fn effective_protected_ranges(&self) -> Vec<ProtectedRange> {
        let mut ranges = self.protected_ranges.clone();
        if let Some(password) = self.password {
            for range in &mut ranges {
                range.passwords = vec![password];
            }
        }
        ranges
    }
}
