/// Metrics for Aurora AppView
///
/// Provides Prometheus-compatible metrics for monitoring:
/// - Firehose frames, dropped frames and skipped blocks
/// - Applied, skipped and failed repo ops per collection
/// - Upstream connectivity and reconnects
/// - Backfill progress
/// - HTTP request counts and latencies

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    // ========== Ingest Metrics ==========

    /// Firehose frames received, by message type
    pub static ref FIREHOSE_FRAMES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "appview_firehose_frames_total",
        "Total number of firehose frames received",
        &["kind"]
    )
    .unwrap();

    /// Frames that could not be decoded at all
    pub static ref FIREHOSE_FRAMES_DROPPED_TOTAL: IntCounter = register_int_counter!(
        "appview_firehose_frames_dropped_total",
        "Total number of undecodable firehose frames"
    )
    .unwrap();

    /// Blocks skipped inside otherwise readable archives
    pub static ref CAR_BLOCKS_SKIPPED_TOTAL: IntCounter = register_int_counter!(
        "appview_car_blocks_skipped_total",
        "Total number of malformed blocks skipped"
    )
    .unwrap();

    /// Repo ops by collection, action and outcome
    pub static ref INGEST_OPS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "appview_ingest_ops_total",
        "Total number of repo ops processed",
        &["collection", "action", "outcome"]
    )
    .unwrap();

    /// Reconnect attempts against the upstream firehose
    pub static ref FIREHOSE_RECONNECTS_TOTAL: IntCounter = register_int_counter!(
        "appview_firehose_reconnects_total",
        "Total number of firehose reconnect attempts"
    )
    .unwrap();

    /// 1 while the firehose socket is open
    pub static ref INGEST_CONNECTED: IntGauge = register_int_gauge!(
        "appview_ingest_connected",
        "Whether the firehose connection is open"
    )
    .unwrap();

    /// Last applied stream sequence number
    pub static ref INGEST_LAST_SEQ: IntGauge = register_int_gauge!(
        "appview_ingest_last_seq",
        "Last applied firehose sequence number"
    )
    .unwrap();

    // ========== Backfill Metrics ==========

    /// Records written by backfill, by collection
    pub static ref BACKFILL_RECORDS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "appview_backfill_records_total",
        "Total number of records indexed by backfill",
        &["collection"]
    )
    .unwrap();

    // ========== HTTP Metrics ==========

    /// Total HTTP requests by method, path, and status
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "appview_http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    )
    .unwrap();

    /// HTTP request duration in seconds
    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "appview_http_request_duration_seconds",
        "HTTP request latencies in seconds",
        &["method", "path"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .unwrap();
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Record a received frame
pub fn record_frame(kind: &str) {
    FIREHOSE_FRAMES_TOTAL.with_label_values(&[kind]).inc();
}

/// Record a frame that failed to decode
pub fn record_frame_dropped() {
    FIREHOSE_FRAMES_DROPPED_TOTAL.inc();
}

pub fn record_blocks_skipped(count: usize) {
    CAR_BLOCKS_SKIPPED_TOTAL.inc_by(count as u64);
}

/// Record the outcome of one repo op
pub fn record_op(collection: &str, action: &str, outcome: &str) {
    INGEST_OPS_TOTAL
        .with_label_values(&[collection, action, outcome])
        .inc();
}

pub fn record_reconnect() {
    FIREHOSE_RECONNECTS_TOTAL.inc();
}

pub fn set_connected(connected: bool) {
    INGEST_CONNECTED.set(i64::from(connected));
}

pub fn set_last_seq(seq: i64) {
    INGEST_LAST_SEQ.set(seq);
}

pub fn record_backfill_records(collection: &str, count: usize) {
    BACKFILL_RECORDS_TOTAL
        .with_label_values(&[collection])
        .inc_by(count as u64);
}

/// Record an HTTP request
pub fn record_http_request(method: &str, path: &str, status: u16, duration: f64) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status.to_string()])
        .inc();
    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, path])
        .observe(duration);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_http_request() {
        record_http_request("GET", "/xrpc/app.bsky.feed.getTimeline", 200, 0.05);
        let metrics = render_metrics();
        assert!(metrics.contains("appview_http_requests_total"));
        assert!(metrics.contains("appview_http_request_duration_seconds"));
    }

    #[test]
    fn test_record_ingest() {
        record_frame("#commit");
        record_frame_dropped();
        record_blocks_skipped(2);
        record_op("post", "create", "applied");
        record_reconnect();
        set_connected(true);
        set_last_seq(42);

        let metrics = render_metrics();
        assert!(metrics.contains("appview_firehose_frames_total"));
        assert!(metrics.contains("appview_firehose_frames_dropped_total"));
        assert!(metrics.contains("appview_car_blocks_skipped_total"));
        assert!(metrics.contains("appview_ingest_ops_total"));
        assert!(metrics.contains("appview_ingest_connected"));
    }

    #[test]
    fn test_record_backfill() {
        record_backfill_records("post", 6);
        assert!(render_metrics().contains("appview_backfill_records_total"));
    }
}
