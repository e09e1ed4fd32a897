use prometheus::{Encoder, Histogram, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::Arc;
use std::time::Instant;

pub struct Metrics {
    registry: Registry,

    // Invocation metrics
    pub invocations_total: IntCounter,
    pub invocation_failures: IntCounterVec,
    pub invocation_duration: Histogram,

    // Process metrics
    pub nonzero_exits_total: IntCounter,
    pub timeouts_total: IntCounter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let invocations_total = IntCounter::new(
            "lazycomm_invocations_total",
            "Total number of script invocations",
        )
        .expect("metric creation failed");
        let invocation_failures = IntCounterVec::new(
            Opts::new(
                "lazycomm_invocation_failures_total",
                "Invocations answered by the bridge instead of the script",
            ),
            &["kind"],
        )
        .expect("metric creation failed");
        let invocation_duration = Histogram::with_opts(prometheus::HistogramOpts::new(
            "lazycomm_invocation_duration_seconds",
            "Script invocation duration in seconds",
        ))
        .expect("metric creation failed");

        let nonzero_exits_total = IntCounter::new(
            "lazycomm_nonzero_exits_total",
            "Total number of scripts that exited with a non-zero code",
        )
        .expect("metric creation failed");
        let timeouts_total = IntCounter::new(
            "lazycomm_timeouts_total",
            "Total number of scripts killed after the deadline",
        )
        .expect("metric creation failed");

        // Register all metrics
        registry
            .register(Box::new(invocations_total.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(invocation_failures.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(invocation_duration.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(nonzero_exits_total.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(timeouts_total.clone()))
            .expect("metric registration failed");

        Self {
            registry,
            invocations_total,
            invocation_failures,
            invocation_duration,
            nonzero_exits_total,
            timeouts_total,
        }
    }

    pub fn record_failure(&self, kind: &str) {
        self.invocation_failures.with_label_values(&[kind]).inc();
    }

    pub fn record_nonzero_exit(&self) {
        self.nonzero_exits_total.inc();
    }

    pub fn record_timeout(&self) {
        self.timeouts_total.inc();
    }

    pub fn gather_metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Prometheus text exposition of every registered metric.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.gather_metrics(), &mut buffer) {
            tracing::error!("Failed to encode metrics: {}", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

/// Measures one invocation from creation until `finish` or `fail`
pub struct InvocationTimer {
    start: Instant,
    metrics: Arc<Metrics>,
}

impl InvocationTimer {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        metrics.invocations_total.inc();
        Self {
            start: Instant::now(),
            metrics,
        }
    }

    pub fn finish(self) {
        let duration = self.start.elapsed();
        self.metrics.invocation_duration.observe(duration.as_secs_f64());
    }

    pub fn fail(self, kind: &str) {
        let duration = self.start.elapsed();
        self.metrics.invocation_duration.observe(duration.as_secs_f64());
        self.metrics.record_failure(kind);
    }
}
