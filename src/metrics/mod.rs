//! Metrics collection for observability

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec_with_registry, register_counter_with_registry,
    register_histogram_vec_with_registry, register_histogram_with_registry, Counter, CounterVec,
    Encoder, Histogram, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Global metrics registry
pub static METRICS: Lazy<Arc<Metrics>> = Lazy::new(|| {
    Arc::new(Metrics::new().expect("Failed to initialize metrics"))
});

/// Metrics collector
pub struct Metrics {
    registry: Registry,

    // Reply metrics
    pub replies: CounterVec,
    pub reply_length: Histogram,
    pub context_length: Histogram,
    pub reply_duration: HistogramVec,

    // Upstream metrics
    pub completion_failures: CounterVec,
    pub failovers: Counter,

    // History metrics
    pub history_evictions: Counter,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let replies = register_counter_vec_with_registry!(
            Opts::new("chat_replies_total", "Total reply requests by outcome"),
            &["status"],
            registry
        )?;

        let reply_length = register_histogram_with_registry!(
            HistogramOpts::new("chat_reply_length", "Accounted length of accepted replies")
                .buckets(vec![16.0, 64.0, 256.0, 512.0, 1024.0, 2048.0, 4096.0]),
            registry
        )?;

        let context_length = register_histogram_with_registry!(
            HistogramOpts::new("chat_context_length", "History cost after each accepted reply")
                .buckets(vec![256.0, 1024.0, 2048.0, 4096.0, 8192.0, 16384.0, 32768.0]),
            registry
        )?;

        let reply_duration = register_histogram_vec_with_registry!(
            "chat_reply_duration_seconds",
            "Reply request duration in seconds",
            &["endpoint"],
            registry
        )?;

        let completion_failures = register_counter_vec_with_registry!(
            Opts::new(
                "chat_completion_failures_total",
                "Failed completion attempts by failure class"
            ),
            &["class"],
            registry
        )?;

        let failovers = register_counter_with_registry!(
            Opts::new("chat_failovers_total", "Switches to the fallback endpoint"),
            registry
        )?;

        let history_evictions = register_counter_with_registry!(
            Opts::new("chat_history_evictions_total", "History eviction passes"),
            registry
        )?;

        Ok(Self {
            registry,
            replies,
            reply_length,
            context_length,
            reply_duration,
            completion_failures,
            failovers,
            history_evictions,
        })
    }

    /// Get the metrics registry for exporting
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the prometheus text format
    pub fn gather_text(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
