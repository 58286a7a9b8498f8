//! Prometheus metrics for the task queue.
//!
//! - Append metrics (messages handed to a backend, per backend and stream)
//! - Delivery metrics (processed, retried, discarded)
//! - Handler latency
//! - Lifecycle metrics (active consumers, drain timeouts, redis read errors)

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, Encoder, HistogramVec,
    IntCounterVec, IntGaugeVec, TextEncoder,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "ara_queue";

lazy_static! {
    /// Messages accepted by `append`
    pub static ref MESSAGES_APPENDED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_messages_appended_total", METRIC_PREFIX),
        "Total messages appended to a queue backend",
        &["backend", "stream"]
    ).unwrap();

    /// Messages whose handler succeeded
    pub static ref MESSAGES_PROCESSED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_messages_processed_total", METRIC_PREFIX),
        "Total messages processed successfully",
        &["backend", "stream"]
    ).unwrap();

    /// Failed deliveries that were requeued
    pub static ref MESSAGES_RETRIED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_messages_retried_total", METRIC_PREFIX),
        "Total failed deliveries requeued for another attempt",
        &["backend", "stream"]
    ).unwrap();

    /// Messages dropped after exhausting their attempts
    pub static ref MESSAGES_DISCARDED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_messages_discarded_total", METRIC_PREFIX),
        "Total messages discarded after the final failed attempt",
        &["backend", "stream"]
    ).unwrap();

    /// Handler execution time
    pub static ref HANDLER_LATENCY: HistogramVec = register_histogram_vec!(
        format!("{}_handler_latency_seconds", METRIC_PREFIX),
        "Handler execution time in seconds",
        &["backend", "stream"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]
    ).unwrap();

    /// Consumer tasks currently running
    pub static ref CONSUMERS_ACTIVE: IntGaugeVec = register_int_gauge_vec!(
        format!("{}_consumers_active", METRIC_PREFIX),
        "Number of running consumer tasks",
        &["backend"]
    ).unwrap();

    /// Streams that did not drain within the shutdown bound
    pub static ref DRAIN_TIMEOUTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_drain_timeouts_total", METRIC_PREFIX),
        "Total streams that exceeded the drain timeout on shutdown",
        &["backend"]
    ).unwrap();

    /// Failed stream reads (connection drops, command errors)
    pub static ref READ_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_read_errors_total", METRIC_PREFIX),
        "Total errors while reading from a stream",
        &["backend", "stream"]
    ).unwrap();
}

/// Encode all registered metrics in the Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper for recording delivery outcomes
pub struct DeliveryMetrics;

impl DeliveryMetrics {
    pub fn record_appended(backend: &str, stream: &str) {
        MESSAGES_APPENDED_TOTAL.with_label_values(&[backend, stream]).inc();
    }

    pub fn record_processed(backend: &str, stream: &str, elapsed_secs: f64) {
        MESSAGES_PROCESSED_TOTAL.with_label_values(&[backend, stream]).inc();
        HANDLER_LATENCY
            .with_label_values(&[backend, stream])
            .observe(elapsed_secs);
    }

    pub fn record_failed(backend: &str, stream: &str, elapsed_secs: f64, requeued: bool) {
        HANDLER_LATENCY
            .with_label_values(&[backend, stream])
            .observe(elapsed_secs);
        if requeued {
            MESSAGES_RETRIED_TOTAL.with_label_values(&[backend, stream]).inc();
        } else {
            MESSAGES_DISCARDED_TOTAL.with_label_values(&[backend, stream]).inc();
        }
    }

    pub fn consumer_started(backend: &str) {
        CONSUMERS_ACTIVE.with_label_values(&[backend]).inc();
    }

    pub fn consumer_stopped(backend: &str) {
        CONSUMERS_ACTIVE.with_label_values(&[backend]).dec();
    }
}

/// Keeps `CONSUMERS_ACTIVE` accurate for a consumer task, including aborted ones.
pub struct ConsumerGuard {
    backend: &'static str,
}

impl ConsumerGuard {
    pub fn new(backend: &'static str) -> Self {
        DeliveryMetrics::consumer_started(backend);
        Self { backend }
    }
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        DeliveryMetrics::consumer_stopped(self.backend);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_metrics() {
        DeliveryMetrics::record_appended("memory", "metrics-test");

        let output = encode_metrics().unwrap();
        assert!(output.contains("ara_queue_messages_appended_total"));
    }

    #[test]
    fn test_failed_delivery_split() {
        let before_retried = MESSAGES_RETRIED_TOTAL
            .with_label_values(&["memory", "metrics-split"])
            .get();
        let before_discarded = MESSAGES_DISCARDED_TOTAL
            .with_label_values(&["memory", "metrics-split"])
            .get();

        DeliveryMetrics::record_failed("memory", "metrics-split", 0.01, true);
        DeliveryMetrics::record_failed("memory", "metrics-split", 0.01, false);

        assert_eq!(
            MESSAGES_RETRIED_TOTAL.with_label_values(&["memory", "metrics-split"]).get(),
            before_retried + 1
        );
        assert_eq!(
            MESSAGES_DISCARDED_TOTAL.with_label_values(&["memory", "metrics-split"]).get(),
            before_discarded + 1
        );
    }
}
