use crate::config::LearnerConfig;
use crate::store::{StateStore, read_state};
use crate::timing::{OpKind, TimingCollector, millis};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnedTimeout {
    pub op: OpKind,
    #[serde(rename = "timeout_ms", with = "millis")]
    pub timeout: Duration,
    pub sample_count: usize,
    pub updated_at: DateTime<Utc>,
}

/// Derives per-operation timeouts from observed latency.
///
/// `timeout = clamp(p95 * safety_margin, min_timeout, max_timeout)`, rounded to
/// whole milliseconds, once at least `min_samples` successful samples exist.
pub struct TimeoutLearner {
    config: LearnerConfig,
    defaults: HashMap<OpKind, Duration>,
    learned: BTreeMap<OpKind, LearnedTimeout>,
}

impl TimeoutLearner {
    pub fn new(config: LearnerConfig, defaults: HashMap<OpKind, Duration>) -> Self {
        Self {
            config,
            defaults,
            learned: BTreeMap::new(),
        }
    }

    /// Bounds are applied max-first so inverted bounds settle on the minimum.
    fn clamp(&self, timeout: Duration) -> Duration {
        timeout
            .min(self.config.max_timeout())
            .max(self.config.min_timeout())
    }

    pub fn learn(&self, collector: &TimingCollector, op: OpKind) -> Option<LearnedTimeout> {
        let stats = collector.stats(op)?;
        if stats.success_count < self.config.min_samples {
            tracing::debug!(
                "Not enough samples for {}: {} < {}",
                op,
                stats.success_count,
                self.config.min_samples
            );
            return None;
        }

        let scaled = Duration::try_from_secs_f64(stats.p95.as_secs_f64() * self.config.safety_margin)
            .unwrap_or_else(|_| self.config.max_timeout());
        let clamped = self.clamp(scaled);
        let timeout = Duration::from_millis(((clamped.as_nanos() + 500_000) / 1_000_000) as u64);

        Some(LearnedTimeout {
            op,
            timeout,
            sample_count: stats.success_count,
            updated_at: Utc::now(),
        })
    }

    /// Recompute every operation kind; returns how many recommendations changed.
    pub fn update(&mut self, collector: &TimingCollector) -> usize {
        let mut changed = 0;
        for op in OpKind::ALL {
            let Some(learned) = self.learn(collector, op) else {
                continue;
            };
            let previous = self.learned.get(&op).map(|l| l.timeout);
            if previous != Some(learned.timeout) {
                tracing::info!(
                    "Learned timeout for {}: {:?} (was {:?}, default {:?}) from {} samples",
                    op,
                    learned.timeout,
                    previous,
                    self.default_timeout(op),
                    learned.sample_count
                );
                changed += 1;
            }
            self.learned.insert(op, learned);
        }
        changed
    }

    pub fn default_timeout(&self, op: OpKind) -> Duration {
        self.defaults
            .get(&op)
            .copied()
            .unwrap_or(Duration::from_secs(1))
    }

    /// Learned timeout when one exists, otherwise the static default.
    pub fn timeout_for(&self, op: OpKind) -> Duration {
        self.learned
            .get(&op)
            .map_or_else(|| self.default_timeout(op), |l| l.timeout)
    }

    pub fn learned(&self) -> &BTreeMap<OpKind, LearnedTimeout> {
        &self.learned
    }

    /// Install previously persisted recommendations, re-clamped to the current bounds.
    pub fn restore(&mut self, learned: BTreeMap<OpKind, LearnedTimeout>) {
        for (op, mut entry) in learned {
            entry.op = op;
            entry.timeout = self.clamp(entry.timeout);
            self.learned.insert(op, entry);
        }
    }
}

/// Learned timeouts from the store; empty when the document is absent or predates them.
pub fn load(store: &dyn StateStore) -> BTreeMap<OpKind, LearnedTimeout> {
    read_state(store).learned_timeouts
}

pub fn save(
    store: &dyn StateStore,
    learned: &BTreeMap<OpKind, LearnedTimeout>,
) -> Result<(), crate::error::StoreError> {
    let mut state = read_state(store);
    state.learned_timeouts = learned.clone();
    store.write(&state)
}
