use crate::coordinator::{ConnectionState, Diagnostics, Reading};
use crate::registers::Value;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::sync::atomic::AtomicU64;

fn bool_to_f64(b: bool) -> f64 {
    if b { 1.0 } else { 0.0 }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RegisterLabels {
    pub register: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OpLabels {
    pub op: String,
}

#[derive(Default)]
pub struct InverterMetrics {
    pub register_value: Family<RegisterLabels, Gauge<f64, AtomicU64>>,
    pub register_stale: Family<RegisterLabels, Gauge<f64, AtomicU64>>,
    pub connected: Gauge<f64, AtomicU64>,
    pub polling: Gauge<f64, AtomicU64>,
    pub connection_quality: Gauge<f64, AtomicU64>,
    pub failed_registers: Gauge<f64, AtomicU64>,
    pub connect_failures: Gauge<f64, AtomicU64>,
    pub poll_cycles: Gauge<f64, AtomicU64>,
    pub op_p95_seconds: Family<OpLabels, Gauge<f64, AtomicU64>>,
    pub op_success_rate: Family<OpLabels, Gauge<f64, AtomicU64>>,
    pub learned_timeout_seconds: Family<OpLabels, Gauge<f64, AtomicU64>>,
}

impl InverterMetrics {
    pub fn register(&self, registry: &mut Registry) {
        registry.register(
            "srne_register_value",
            "Last decoded numeric register value, scaled to engineering units",
            self.register_value.clone(),
        );
        registry.register(
            "srne_register_stale",
            "Register value is from an earlier cycle (1=stale, 0=fresh)",
            self.register_stale.clone(),
        );
        registry.register(
            "srne_link_connected",
            "BLE link state (1=connected, 0=disconnected)",
            self.connected.clone(),
        );
        registry.register(
            "srne_polling",
            "Coordinator is in the polling state (1=yes, 0=no)",
            self.polling.clone(),
        );
        registry.register(
            "srne_connection_quality",
            "Share of successful exchanges in the timing window",
            self.connection_quality.clone(),
        );
        registry.register(
            "srne_failed_registers",
            "Registers excluded as unsupported",
            self.failed_registers.clone(),
        );
        registry.register(
            "srne_connect_failures",
            "Consecutive failed connection attempts",
            self.connect_failures.clone(),
        );
        registry.register(
            "srne_poll_cycles",
            "Completed poll cycles since start",
            self.poll_cycles.clone(),
        );
        registry.register(
            "srne_op_p95_seconds",
            "95th percentile latency per operation kind",
            self.op_p95_seconds.clone(),
        );
        registry.register(
            "srne_op_success_rate",
            "Success rate per operation kind",
            self.op_success_rate.clone(),
        );
        registry.register(
            "srne_learned_timeout_seconds",
            "Timeout learned from observed latency per operation kind",
            self.learned_timeout_seconds.clone(),
        );
    }

    pub fn update(&self, diagnostics: &Diagnostics) {
        self.connected.set(bool_to_f64(diagnostics.connected));
        self.polling
            .set(bool_to_f64(diagnostics.state == ConnectionState::Polling));
        if let Some(quality) = diagnostics.connection_quality {
            self.connection_quality.set(quality);
        }
        self.failed_registers
            .set(diagnostics.failed_registers.len() as f64);
        self.connect_failures
            .set(f64::from(diagnostics.connect_failures));
        self.poll_cycles.set(diagnostics.cycles as f64);

        for (name, reading) in &diagnostics.values {
            let labels = RegisterLabels {
                register: name.clone(),
            };
            match reading {
                Reading::Fresh(Value::Number(n)) | Reading::Stale(Value::Number(n)) => {
                    self.register_value.get_or_create(&labels).set(*n);
                    self.register_stale
                        .get_or_create(&labels)
                        .set(bool_to_f64(matches!(reading, Reading::Stale(_))));
                }
                // Enumerated values are exported through /diagnostics only.
                Reading::Fresh(Value::Choice(_)) | Reading::Stale(Value::Choice(_)) => {}
                Reading::Unavailable => {
                    self.register_value.remove(&labels);
                    self.register_stale.remove(&labels);
                }
            }
        }

        for (op, stats) in &diagnostics.stats {
            let labels = OpLabels {
                op: op.to_string(),
            };
            self.op_p95_seconds
                .get_or_create(&labels)
                .set(stats.p95.as_secs_f64());
            self.op_success_rate
                .get_or_create(&labels)
                .set(stats.success_rate);
        }

        for (op, learned) in &diagnostics.learned_timeouts {
            self.learned_timeout_seconds
                .get_or_create(&OpLabels { op: op.to_string() })
                .set(learned.timeout.as_secs_f64());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::{OpKind, TimingCollector};
    use prometheus_client::encoding::text::encode;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn diagnostics() -> Diagnostics {
        let mut timing = TimingCollector::new(10);
        timing.record(OpKind::ReadRegister, Duration::from_millis(400), true);
        Diagnostics {
            state: ConnectionState::Polling,
            connected: true,
            session_id: 1,
            connection_quality: Some(1.0),
            stats: timing.all_stats(),
            failed_registers: vec![0x0105],
            learned_timeouts: BTreeMap::new(),
            connect_failures: 0,
            cycles: 3,
            last_cycle: None,
            values: BTreeMap::from([
                ("pv1_voltage".to_string(), Reading::Fresh(Value::Number(24.5))),
                ("battery_soc".to_string(), Reading::Stale(Value::Number(87.0))),
                ("output_priority".to_string(), Reading::Fresh(Value::Choice("sbu".into()))),
                ("load_power".to_string(), Reading::Unavailable),
            ]),
        }
    }

    #[test]
    fn renders_diagnostics() {
        let metrics = InverterMetrics::default();
        let mut registry = Registry::default();
        metrics.register(&mut registry);
        metrics.update(&diagnostics());

        let mut text = String::new();
        encode(&mut text, &registry).unwrap();
        assert!(text.contains(r#"srne_register_value{register="pv1_voltage"} 24.5"#));
        assert!(text.contains(r#"srne_register_stale{register="battery_soc"} 1"#));
        assert!(!text.contains("output_priority"));
        assert!(!text.contains("load_power"));
        assert!(text.contains(r#"srne_op_p95_seconds{op="read_register"} 0.4"#));
        assert!(text.contains("srne_failed_registers 1"));
    }
}
