//! Prometheus counters and gauges for a simulation run.
//!
//! Every run owns its own [`Registry`], so several runners (and tests) can coexist in one
//! process without fighting over the global default registry.

use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct SimMetrics {
    registry: Registry,

    // === Pathways ===
    pub pathways_started: IntCounter,
    pub pathways_completed: IntCounter,
    pub pathways_aborted: IntCounter,
    pub pathways_running: IntGauge,

    // === Messages ===
    pub messages_sent: IntCounter,
    pub messages_failed: IntCounter,

    // === MLLP ===
    pub mllp_reconnects: IntCounter,
    pub mllp_keep_alives: IntCounter,

    // === Store ===
    pub patients: IntGauge,
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let counter = IntCounter::with_opts(Opts::new(name, help).namespace("simhospital"))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntGauge> {
    let gauge = IntGauge::with_opts(Opts::new(name, help).namespace("simhospital"))?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

impl SimMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        Ok(Self {
            pathways_started: counter(
                &registry,
                "pathways_started_total",
                "Pathway instances started",
            )?,
            pathways_completed: counter(
                &registry,
                "pathways_completed_total",
                "Pathway instances that ran to the end",
            )?,
            pathways_aborted: counter(
                &registry,
                "pathways_aborted_total",
                "Pathway instances aborted by an error or by shutdown",
            )?,
            pathways_running: gauge(&registry, "pathways_running", "Pathway instances in flight")?,
            messages_sent: counter(&registry, "messages_sent_total", "Messages delivered")?,
            messages_failed: counter(
                &registry,
                "messages_failed_total",
                "Messages that could not be delivered",
            )?,
            mllp_reconnects: counter(
                &registry,
                "mllp_reconnects_total",
                "MLLP connections re-established after a drop",
            )?,
            mllp_keep_alives: counter(
                &registry,
                "mllp_keep_alives_total",
                "MLLP keep-alive frames written",
            )?,
            patients: gauge(&registry, "patients", "Patients held in memory")?,
            registry,
        })
    }

    /// Renders every metric in the Prometheus text exposition format.
    pub fn render(&self) -> Result<(String, Vec<u8>), prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

impl std::fmt::Debug for SimMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimMetrics")
            .field("pathways_started", &self.pathways_started.get())
            .field("pathways_running", &self.pathways_running.get())
            .field("messages_sent", &self.messages_sent.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_namespaced_metrics() {
        let metrics = SimMetrics::new().expect("metrics should register");
        metrics.pathways_started.inc();
        metrics.messages_sent.inc_by(3);

        let (content_type, body) = metrics.render().expect("metrics should render");
        let text = String::from_utf8(body).unwrap();

        assert!(content_type.starts_with("text/plain"));
        assert!(text.contains("simhospital_pathways_started_total 1"));
        assert!(text.contains("simhospital_messages_sent_total 3"));
        assert!(text.contains("simhospital_mllp_reconnects_total 0"));
    }

    #[test]
    fn test_two_instances_do_not_collide() {
        let first = SimMetrics::new().unwrap();
        let second = SimMetrics::new().unwrap();
        first.patients.set(5);

        assert_eq!(second.patients.get(), 0);
    }
}
