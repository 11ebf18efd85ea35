use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

/// Kinds of link operation timed separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    ReadRegister,
    WriteRegister,
    Authenticate,
    Connect,
}

impl OpKind {
    pub const ALL: [OpKind; 4] = [
        OpKind::ReadRegister,
        OpKind::WriteRegister,
        OpKind::Authenticate,
        OpKind::Connect,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            OpKind::ReadRegister => "read_register",
            OpKind::WriteRegister => "write_register",
            OpKind::Authenticate => "authenticate",
            OpKind::Connect => "connect",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub op: OpKind,
    pub duration: Duration,
    pub success: bool,
    pub at: DateTime<Utc>,
}

/// Durations serialized as whole milliseconds.
pub mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

fn as_fractional_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64() * 1000.0)
}

/// Latency statistics over the exposed window. Percentiles use successful samples only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stats {
    #[serde(rename = "mean_ms", serialize_with = "as_fractional_millis")]
    pub mean: Duration,
    #[serde(rename = "median_ms", serialize_with = "as_fractional_millis")]
    pub median: Duration,
    #[serde(rename = "p95_ms", serialize_with = "as_fractional_millis")]
    pub p95: Duration,
    #[serde(rename = "p99_ms", serialize_with = "as_fractional_millis")]
    pub p99: Duration,
    pub success_rate: f64,
    pub sample_count: usize,
    pub success_count: usize,
}

/// Rolling per-operation latency window.
///
/// Each series holds up to `2 * window` measurements so eviction is amortized;
/// statistics only ever see the newest `window` of them.
pub struct TimingCollector {
    window: usize,
    series: HashMap<OpKind, VecDeque<Measurement>>,
    enabled: bool,
}

impl TimingCollector {
    pub fn new(window: usize) -> Self {
        tracing::debug!(
            "Timing collector window {} (capacity {})",
            window.max(1),
            window.max(1) * 2
        );
        Self {
            window: window.max(1),
            series: HashMap::new(),
            enabled: true,
        }
    }

    pub fn record(&mut self, op: OpKind, duration: Duration, success: bool) {
        if !self.enabled {
            return;
        }
        let capacity = self.window * 2;
        let series = self
            .series
            .entry(op)
            .or_insert_with(|| VecDeque::with_capacity(capacity));
        if series.len() >= capacity {
            series.pop_front();
        }
        series.push_back(Measurement {
            op,
            duration,
            success,
            at: Utc::now(),
        });
        tracing::trace!(
            "Timing: {} {} in {:?} ({} samples)",
            op,
            if success { "ok" } else { "failed" },
            duration,
            series.len()
        );
    }

    fn exposed(&self, op: OpKind) -> impl Iterator<Item = &Measurement> {
        let series = self.series.get(&op);
        let len = series.map_or(0, VecDeque::len);
        series
            .into_iter()
            .flat_map(|s| s.iter())
            .skip(len.saturating_sub(self.window))
    }

    pub fn sample_count(&self, op: OpKind) -> usize {
        self.exposed(op).count()
    }

    /// `None` until at least one measurement exists for `op`.
    pub fn stats(&self, op: OpKind) -> Option<Stats> {
        let samples: Vec<&Measurement> = self.exposed(op).collect();
        if samples.is_empty() {
            return None;
        }

        let mut latencies: Vec<Duration> = samples
            .iter()
            .filter(|m| m.success)
            .map(|m| m.duration)
            .collect();
        latencies.sort_unstable();

        let success_count = latencies.len();
        let mean = if success_count == 0 {
            Duration::ZERO
        } else {
            latencies.iter().sum::<Duration>() / success_count as u32
        };

        Some(Stats {
            mean,
            median: percentile(&latencies, 50.0),
            p95: percentile(&latencies, 95.0),
            p99: percentile(&latencies, 99.0),
            success_rate: success_count as f64 / samples.len() as f64,
            sample_count: samples.len(),
            success_count,
        })
    }

    pub fn all_stats(&self) -> BTreeMap<OpKind, Stats> {
        OpKind::ALL
            .iter()
            .filter_map(|&op| self.stats(op).map(|s| (op, s)))
            .collect()
    }

    pub fn enable(&mut self) {
        self.enabled = true;
        tracing::debug!("Timing collection enabled");
    }

    /// Stop recording; history is kept.
    pub fn disable(&mut self) {
        self.enabled = false;
        tracing::debug!("Timing collection disabled");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn clear(&mut self, op: OpKind) {
        if let Some(series) = self.series.get_mut(&op) {
            series.clear();
            tracing::debug!("Cleared timing history for {}", op);
        }
    }
}

/// Linearly interpolated percentile of a sorted slice.
fn percentile(sorted: &[Duration], pct: f64) -> Duration {
    match sorted {
        [] => Duration::ZERO,
        [only] => *only,
        _ => {
            let rank = pct / 100.0 * (sorted.len() - 1) as f64;
            let lower = rank.floor() as usize;
            let upper = (lower + 1).min(sorted.len() - 1);
            let fraction = rank - lower as f64;
            let lo = sorted[lower].as_nanos() as f64;
            let hi = sorted[upper].as_nanos() as f64;
            Duration::from_nanos((lo + fraction * (hi - lo)).round() as u64)
        }
    }
}
