use jobq_core::Tier;
use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::collections::BTreeMap;

/// Prometheus metrics for the dispatcher
pub struct DispatcherMetrics {
    pub registry: Registry,

    // Terminal and intermediate transitions
    pub jobs_total: CounterVec,

    pub jobs_pending: IntGauge,
    pub jobs_running: IntGauge,

    pub queue_depth: IntGaugeVec,

    pub attempt_duration: HistogramVec,

    pub retries_total: CounterVec,

    pub slots_busy: IntGauge,
}

impl DispatcherMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let jobs_total = CounterVec::new(
            Opts::new("jobq_jobs_total", "Job state transitions by state and role"),
            &["state", "role"],
        )?;
        registry.register(Box::new(jobs_total.clone()))?;

        let jobs_pending = IntGauge::new("jobq_jobs_pending", "Jobs waiting for a slot")?;
        registry.register(Box::new(jobs_pending.clone()))?;

        let jobs_running = IntGauge::new("jobq_jobs_running", "Jobs with an attempt in flight")?;
        registry.register(Box::new(jobs_running.clone()))?;

        let queue_depth = IntGaugeVec::new(
            Opts::new("jobq_queue_depth", "Queue depth by tier"),
            &["tier"],
        )?;
        registry.register(Box::new(queue_depth.clone()))?;

        let attempt_duration = HistogramVec::new(
            HistogramOpts::new(
                "jobq_attempt_duration_seconds",
                "Duration of a single worker attempt in seconds",
            )
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
            &["role"],
        )?;
        registry.register(Box::new(attempt_duration.clone()))?;

        let retries_total = CounterVec::new(
            Opts::new("jobq_retries_total", "Retries scheduled after a transient failure"),
            &["role"],
        )?;
        registry.register(Box::new(retries_total.clone()))?;

        let slots_busy = IntGauge::new("jobq_slots_busy", "Worker slots currently holding a job")?;
        registry.register(Box::new(slots_busy.clone()))?;

        Ok(DispatcherMetrics {
            registry,
            jobs_total,
            jobs_pending,
            jobs_running,
            queue_depth,
            attempt_duration,
            retries_total,
            slots_busy,
        })
    }

    pub fn update_queue_depth(&self, by_tier: &BTreeMap<Tier, usize>) {
        for (tier, count) in by_tier {
            self.queue_depth
                .with_label_values(&[tier.as_str()])
                .set(*count as i64);
        }
    }

    pub fn inc_jobs_total(&self, state: &str, role: &str) {
        self.jobs_total.with_label_values(&[state, role]).inc();
    }

    pub fn inc_retries(&self, role: &str) {
        self.retries_total.with_label_values(&[role]).inc();
    }

    pub fn observe_attempt_duration(&self, role: &str, duration_secs: f64) {
        self.attempt_duration
            .with_label_values(&[role])
            .observe(duration_secs);
    }

    /// Text exposition of every registered metric
    pub fn render(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_registered_metrics() {
        let metrics = DispatcherMetrics::new().unwrap();
        metrics.inc_jobs_total("succeeded", "coder");
        metrics.inc_retries("coder");
        metrics.observe_attempt_duration("coder", 0.25);
        metrics.update_queue_depth(&Tier::ALL.iter().map(|t| (*t, 1)).collect());

        let text = metrics.render().unwrap();
        assert!(text.contains("jobq_jobs_total{role=\"coder\",state=\"succeeded\"} 1"));
        assert!(text.contains("jobq_retries_total{role=\"coder\"} 1"));
        assert!(text.contains("jobq_queue_depth{tier=\"enterprise\"} 1"));
        assert!(text.contains("jobq_attempt_duration_seconds_count{role=\"coder\"} 1"));
    }
}
