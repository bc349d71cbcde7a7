//! Internal counters, rendered in Prometheus text format.
//!
//! The gateway keeps a handful of atomic counters rather than pulling in a
//! metrics framework: auth rejections by failure mode, HMAC mismatches,
//! and upstream transport errors. `GET /metrics` renders them.

use std::sync::atomic::{AtomicU64, Ordering};

/// Gateway-wide counters. Cheap to share behind an `Arc`.
#[derive(Debug, Default)]
pub struct Metrics {
    requests_total: AtomicU64,
    auth_signature_malformed: AtomicU64,
    auth_signature_mismatch: AtomicU64,
    auth_unknown_access_key: AtomicU64,
    auth_clock_skew: AtomicU64,
    auth_payload_hash_mismatch: AtomicU64,
    hmac_mismatch: AtomicU64,
    upstream_errors: AtomicU64,
    streaming_uploads: AtomicU64,
    streaming_chunks: AtomicU64,
}

impl Metrics {
    /// Create zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one handled request.
    pub fn record_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one authentication rejection by its metric label
    /// (see `AuthError::metric_label`).
    pub fn record_auth_failure(&self, label: &str) {
        let counter = match label {
            "signature_mismatch" => &self.auth_signature_mismatch,
            "unknown_access_key" => &self.auth_unknown_access_key,
            "clock_skew" => &self.auth_clock_skew,
            "payload_hash_mismatch" => &self.auth_payload_hash_mismatch,
            _ => &self.auth_signature_malformed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one plaintext HMAC mismatch observed on download.
    pub fn record_hmac_mismatch(&self) {
        self.hmac_mismatch.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one upstream transport failure.
    pub fn record_upstream_error(&self) {
        self.upstream_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one aws-chunked upload and the data chunks it carried.
    pub fn record_chunked_upload(&self, chunks: u64) {
        self.streaming_uploads.fetch_add(1, Ordering::Relaxed);
        self.streaming_chunks.fetch_add(chunks, Ordering::Relaxed);
    }

    /// The number of HMAC mismatches so far.
    #[must_use]
    pub fn hmac_mismatches(&self) -> u64 {
        self.hmac_mismatch.load(Ordering::Relaxed)
    }

    /// Render all counters in Prometheus text exposition format.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(1024);
        let mut counter = |name: &str, help: &str, value: u64| {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n"
            ));
        };

        counter(
            "cryptgate_requests_total",
            "Total S3 requests handled.",
            self.requests_total.load(Ordering::Relaxed),
        );
        counter(
            "cryptgate_auth_failures_signature_malformed_total",
            "Requests rejected with a malformed or oversized signature.",
            self.auth_signature_malformed.load(Ordering::Relaxed),
        );
        counter(
            "cryptgate_auth_failures_signature_mismatch_total",
            "Requests rejected because the signature did not verify.",
            self.auth_signature_mismatch.load(Ordering::Relaxed),
        );
        counter(
            "cryptgate_auth_failures_unknown_access_key_total",
            "Requests rejected for an unregistered access key.",
            self.auth_unknown_access_key.load(Ordering::Relaxed),
        );
        counter(
            "cryptgate_auth_failures_clock_skew_total",
            "Requests rejected for excessive X-Amz-Date drift.",
            self.auth_clock_skew.load(Ordering::Relaxed),
        );
        counter(
            "cryptgate_auth_failures_payload_hash_mismatch_total",
            "Requests rejected for a payload hash mismatch.",
            self.auth_payload_hash_mismatch.load(Ordering::Relaxed),
        );
        counter(
            "cryptgate_hmac_mismatch_total",
            "Stored objects whose plaintext HMAC did not verify on download.",
            self.hmac_mismatch.load(Ordering::Relaxed),
        );
        counter(
            "cryptgate_upstream_errors_total",
            "Upstream requests that failed at the transport level.",
            self.upstream_errors.load(Ordering::Relaxed),
        );
        counter(
            "cryptgate_streaming_uploads_total",
            "Uploads received with the aws-chunked framing.",
            self.streaming_uploads.load(Ordering::Relaxed),
        );
        counter(
            "cryptgate_streaming_chunks_total",
            "Data chunks decoded from aws-chunked uploads.",
            self.streaming_chunks.load(Ordering::Relaxed),
        );

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_render_all_counters() {
        let metrics = Metrics::new();
        metrics.record_request();
        metrics.record_request();
        metrics.record_auth_failure("clock_skew");
        metrics.record_hmac_mismatch();
        metrics.record_chunked_upload(3);

        let text = metrics.render();
        assert!(text.contains("cryptgate_requests_total 2"));
        assert!(text.contains("cryptgate_auth_failures_clock_skew_total 1"));
        assert!(text.contains("cryptgate_hmac_mismatch_total 1"));
        assert!(text.contains("cryptgate_upstream_errors_total 0"));
        assert!(text.contains("cryptgate_streaming_uploads_total 1"));
        assert!(text.contains("cryptgate_streaming_chunks_total 3"));
        assert!(text.contains("# TYPE cryptgate_requests_total counter"));
    }

    #[test]
    fn test_should_bucket_unrecognized_auth_labels_as_malformed() {
        let metrics = Metrics::new();
        metrics.record_auth_failure("something_new");
        assert!(
            metrics
                .render()
                .contains("cryptgate_auth_failures_signature_malformed_total 1")
        );
    }
}
