/**
 * MÉTRIQUES KERNEL - Compteurs internes + exposition Prometheus
 *
 * RÔLE : Compteurs et jauges du kernel exposés en format texte Prometheus
 * sur GET /metrics, scrapés par la stack d'observabilité externe.
 */

use std::sync::atomic::{AtomicU64, Ordering};

/// Compteurs cumulés du kernel. Tous atomiques, incréments relaxed.
#[derive(Default)]
pub struct KernelMetrics {
    pub intents_submitted_total: AtomicU64,
    pub intents_rejected_total: AtomicU64,
    pub policies_applied_total: AtomicU64,
    pub apply_failures_total: AtomicU64,
    pub corrections_emitted_total: AtomicU64,
    pub metric_unavailable_total: AtomicU64,
    pub hysteresis_blocks_total: AtomicU64,
    pub telemetry_messages_total: AtomicU64,
}

impl KernelMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Rendu au format texte Prometheus. Les jauges instantanées sont
    /// fournies par l'appelant (lues du store / du health tracker).
    pub fn render_prometheus(
        &self,
        active_intents: i64,
        devices_known: usize,
        mqtt_connected: bool,
        uptime_seconds: u64,
    ) -> String {
        let mut out = String::with_capacity(1024);
        let counters: &[(&str, &str, u64)] = &[
            (
                "weft_intents_submitted_total",
                "Intents accepted for compilation",
                self.intents_submitted_total.load(Ordering::Relaxed),
            ),
            (
                "weft_intents_rejected_total",
                "Submissions rejected at parse or compile time",
                self.intents_rejected_total.load(Ordering::Relaxed),
            ),
            (
                "weft_policies_applied_total",
                "Policies successfully applied on either plane",
                self.policies_applied_total.load(Ordering::Relaxed),
            ),
            (
                "weft_apply_failures_total",
                "Policy apply attempts that ended in failure",
                self.apply_failures_total.load(Ordering::Relaxed),
            ),
            (
                "weft_corrections_emitted_total",
                "Corrective intents emitted by the feedback loop",
                self.corrections_emitted_total.load(Ordering::Relaxed),
            ),
            (
                "weft_metric_unavailable_total",
                "Feedback ticks that could not evaluate a goal",
                self.metric_unavailable_total.load(Ordering::Relaxed),
            ),
            (
                "weft_hysteresis_blocks_total",
                "Feedback corrections paused by oscillation damping",
                self.hysteresis_blocks_total.load(Ordering::Relaxed),
            ),
            (
                "weft_telemetry_messages_total",
                "Device telemetry messages ingested",
                self.telemetry_messages_total.load(Ordering::Relaxed),
            ),
        ];
        for (name, help, value) in counters {
            out.push_str(&format!("# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n"));
        }

        let gauges: &[(&str, &str, f64)] = &[
            ("weft_active_intents", "Intents in applied/satisfied/violated state", active_intents as f64),
            ("weft_devices_known", "Devices present in the catalog", devices_known as f64),
            ("weft_mqtt_connected", "1 when the MQTT transport is connected", if mqtt_connected { 1.0 } else { 0.0 }),
            ("weft_uptime_seconds", "Kernel uptime", uptime_seconds as f64),
        ];
        for (name, help, value) in gauges {
            out.push_str(&format!("# HELP {name} {help}\n# TYPE {name} gauge\n{name} {value}\n"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_counters_and_gauges() {
        let metrics = KernelMetrics::new();
        KernelMetrics::incr(&metrics.intents_submitted_total);
        KernelMetrics::incr(&metrics.intents_submitted_total);
        let text = metrics.render_prometheus(3, 5, true, 42);
        assert!(text.contains("weft_intents_submitted_total 2"));
        assert!(text.contains("weft_active_intents 3"));
        assert!(text.contains("weft_mqtt_connected 1"));
        assert!(text.contains("# TYPE weft_uptime_seconds gauge"));
    }
}
