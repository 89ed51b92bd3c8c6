//! Prometheus counters for the control channel and sessions

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub struct Metrics {
    registry: Registry,
    pub frames_received: IntCounterVec,
    pub frames_sent: IntCounterVec,
    pub malformed_frames: IntCounter,
    pub unknown_session_frames: IntCounter,
    pub sessions_opened: IntCounterVec,
    pub sessions_failed: IntCounterVec,
    pub pull_restarts: IntCounter,
    pub active_sessions: IntGauge,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("relay_signal".to_string()), None)
            .expect("metric prefix is valid");

        let frames_received = counter_vec(
            &registry,
            "frames_received_total",
            "Control frames received, by type",
            "type",
        );
        let frames_sent = counter_vec(&registry, "frames_sent_total", "Control frames sent, by type", "type");
        let malformed_frames = counter(&registry, "malformed_frames_total", "Inbound frames that failed to decode");
        let unknown_session_frames = counter(
            &registry,
            "unknown_session_frames_total",
            "Inbound frames addressed to an unregistered session",
        );
        let sessions_opened = counter_vec(&registry, "sessions_opened_total", "Sessions started, by role", "role");
        let sessions_failed = counter_vec(&registry, "sessions_failed_total", "Sessions ended as failed, by role", "role");
        let pull_restarts = counter(&registry, "pull_restarts_total", "Pull sessions re-initiated after closure");

        let active_sessions = IntGauge::new("active_sessions", "Sessions currently registered").expect("valid gauge");
        registry.register(Box::new(active_sessions.clone())).ok();

        Self {
            registry,
            frames_received,
            frames_sent,
            malformed_frames,
            unknown_session_frames,
            sessions_opened,
            sessions_failed,
            pull_restarts,
            active_sessions,
        }
    }

    /// Export in the Prometheus text format
    pub fn render(&self) -> String {
        let metric_families = self.registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new().encode(&metric_families, &mut buf).ok();
        String::from_utf8(buf).unwrap_or_default()
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let c = IntCounter::new(name, help).expect("valid counter");
    registry.register(Box::new(c.clone())).ok();
    c
}

fn counter_vec(registry: &Registry, name: &str, help: &str, label: &str) -> IntCounterVec {
    let c = IntCounterVec::new(Opts::new(name, help), &[label]).expect("valid counter");
    registry.register(Box::new(c.clone())).ok();
    c
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_counters() {
        let metrics = Metrics::new();
        metrics.frames_received.with_label_values(&["PUSH"]).inc();
        metrics.pull_restarts.inc();
        metrics.active_sessions.set(2);

        let text = metrics.render();
        assert!(text.contains(r#"relay_signal_frames_received_total{type="PUSH"} 1"#));
        assert!(text.contains("relay_signal_pull_restarts_total 1"));
        assert!(text.contains("relay_signal_active_sessions 2"));
    }

    #[test]
    fn test_instances_are_independent() {
        let a = Metrics::new();
        let b = Metrics::new();
        a.malformed_frames.inc();
        assert_eq!(a.malformed_frames.get(), 1);
        assert_eq!(b.malformed_frames.get(), 0);
    }
}
