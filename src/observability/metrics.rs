use prometheus::{Encoder, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub transitions_total: IntCounterVec,
    pub transaction_latency_seconds: HistogramVec,
    pub notifications_total: IntCounterVec,
    pub unanswered_expired_total: IntCounter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let transitions_total = IntCounterVec::new(
            Opts::new("transitions_total", "Status transitions by operation and outcome"),
            &["operation", "outcome"],
        )
        .expect("valid transitions_total metric");

        let transaction_latency_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "transaction_latency_seconds",
                "Latency of transactional units of work in seconds",
            ),
            &["operation"],
        )
        .expect("valid transaction_latency_seconds metric");

        let notifications_total = IntCounterVec::new(
            Opts::new("notifications_total", "Post-commit notifications by outcome"),
            &["outcome"],
        )
        .expect("valid notifications_total metric");

        let unanswered_expired_total = IntCounter::new(
            "unanswered_expired_total",
            "Decisions closed because the driver never answered",
        )
        .expect("valid unanswered_expired_total metric");

        registry
            .register(Box::new(transitions_total.clone()))
            .expect("register transitions_total");
        registry
            .register(Box::new(transaction_latency_seconds.clone()))
            .expect("register transaction_latency_seconds");
        registry
            .register(Box::new(notifications_total.clone()))
            .expect("register notifications_total");
        registry
            .register(Box::new(unanswered_expired_total.clone()))
            .expect("register unanswered_expired_total");

        Self {
            registry,
            transitions_total,
            transaction_latency_seconds,
            notifications_total,
            unanswered_expired_total,
        }
    }

    pub fn record_transition(&self, operation: &str, outcome: &str, elapsed_secs: f64) {
        self.transitions_total
            .with_label_values(&[operation, outcome])
            .inc();
        self.transaction_latency_seconds
            .with_label_values(&[operation])
            .observe(elapsed_secs);
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}
