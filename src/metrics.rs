//! Concurrency-safe collection of per-request observations.
//!
//! Workers feed every outcome into a shared [`ResponseMetric`]: latencies
//! keyed by "<METHOD> <url>", received byte counts, and classified failures.
//! Raw latencies are kept in observation order; percentile summaries are a
//! reader-side concern (see `report`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, OnceLock};

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::errors::{classify, RequestError};
use crate::report::{ResponseError, ResponseStats};

/// Replaces the object name in DELETE/PATCH URLs with a literal "{name}"
/// token so that churned objects collapse into one histogram bucket.
///
/// Other methods address fixed names and keep their URL unchanged.
pub fn normalize_url(method: &str, url: &str) -> String {
    if method != "DELETE" && method != "PATCH" {
        return url.to_string();
    }

    static NAME_SEGMENT: OnceLock<Regex> = OnceLock::new();
    let re = NAME_SEGMENT
        .get_or_init(|| Regex::new(r"/([^/]+)/([^/?]+)(\?|$)").expect("static pattern compiles"));
    re.replace_all(url, "/$1/{name}$3").into_owned()
}

#[derive(Default)]
struct Observations {
    errors: Vec<ResponseError>,
    latencies_by_url: HashMap<String, Vec<f64>>,
}

/// Thread-safe accumulator of request outcomes.
///
/// One instance is created per scheduler invocation and drained once with
/// [`ResponseMetric::gather`] after the workers quiesce.
#[derive(Default)]
pub struct ResponseMetric {
    inner: Mutex<Observations>,
    received_bytes: AtomicI64,
}

impl ResponseMetric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one successful request's latency in seconds.
    pub fn observe_latency(&self, method: &str, url: &str, seconds: f64) {
        let key = format!("{} {}", method, normalize_url(method, url));
        let mut inner = self.inner.lock().unwrap();
        inner.latencies_by_url.entry(key).or_default().push(seconds);
    }

    /// Records one classified failure.
    pub fn observe_failure(
        &self,
        method: &str,
        url: &str,
        at: DateTime<Utc>,
        seconds: f64,
        err: &RequestError,
    ) {
        let classified = classify(err);
        let record = ResponseError {
            url: format!("{} {}", method, normalize_url(method, url)),
            timestamp: at,
            duration_seconds: seconds,
            kind: classified.kind,
            code: classified.code,
            message: classified.message,
        };
        self.inner.lock().unwrap().errors.push(record);
    }

    /// Adds to the running total of bytes read from the server.
    pub fn observe_received_bytes(&self, bytes: i64) {
        self.received_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Snapshots all observations. The returned sequences are independent
    /// copies; callers may mutate them freely.
    pub fn gather(&self) -> ResponseStats {
        let inner = self.inner.lock().unwrap();
        ResponseStats {
            total_received_bytes: self.received_bytes.load(Ordering::Relaxed),
            latencies_by_url: inner.latencies_by_url.clone(),
            errors: inner.errors.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ResponseErrorKind;

    #[test]
    fn test_normalize_collapses_delete_and_patch() {
        let a = "https://api.example.com/api/v1/namespaces/kperf/pods/abc-123?timeout=1m";
        let b = "https://api.example.com/api/v1/namespaces/kperf/pods/xyz-9?timeout=1m";
        assert_eq!(normalize_url("DELETE", a), normalize_url("DELETE", b));
        assert_eq!(
            normalize_url("DELETE", a),
            "https://api.example.com/api/v1/namespaces/kperf/pods/{name}?timeout=1m"
        );
        assert_eq!(normalize_url("PATCH", a), normalize_url("PATCH", b));
    }

    #[test]
    fn test_normalize_keeps_other_methods() {
        let a = "https://api.example.com/api/v1/namespaces/kperf/pods/abc-123";
        let b = "https://api.example.com/api/v1/namespaces/kperf/pods/xyz-9";
        assert_eq!(normalize_url("GET", a), a);
        assert_ne!(normalize_url("GET", a), normalize_url("GET", b));
    }

    #[test]
    fn test_normalize_without_query() {
        assert_eq!(
            normalize_url("DELETE", "https://h/api/v1/namespaces/ns/configmaps/ns-42"),
            "https://h/api/v1/namespaces/ns/configmaps/{name}"
        );
    }

    #[test]
    fn test_latency_keys_include_method() {
        let metric = ResponseMetric::new();
        metric.observe_latency("LIST", "https://h/api/v1/pods", 0.1);
        metric.observe_latency("LIST", "https://h/api/v1/pods", 0.2);
        metric.observe_latency("GET", "https://h/api/v1/pods", 0.3);

        let stats = metric.gather();
        assert_eq!(stats.latencies_by_url.len(), 2);
        assert_eq!(
            stats.latencies_by_url["LIST https://h/api/v1/pods"],
            vec![0.1, 0.2]
        );
        assert_eq!(
            stats.latencies_by_url["GET https://h/api/v1/pods"],
            vec![0.3]
        );
    }

    #[test]
    fn test_churned_deletes_share_one_latency_key() {
        let metric = ResponseMetric::new();
        metric.observe_latency("DELETE", "https://h/api/v1/namespaces/ns/pods/ns-1", 0.1);
        metric.observe_latency("DELETE", "https://h/api/v1/namespaces/ns/pods/ns-2", 0.2);

        let stats = metric.gather();
        assert_eq!(stats.latencies_by_url.len(), 1);
        assert_eq!(
            stats.latencies_by_url["DELETE https://h/api/v1/namespaces/ns/pods/{name}"].len(),
            2
        );
    }

    #[test]
    fn test_observe_failure_records_classification() {
        let metric = ResponseMetric::new();
        let at = Utc::now();
        metric.observe_failure("GET", "https://h/api/v1/pods", at, 0.5, &RequestError::Http(429));
        metric.observe_failure("GET", "https://h/api/v1/pods", at, 0.7, &RequestError::Http(500));

        let stats = metric.gather();
        assert_eq!(stats.errors.len(), 2);
        assert_eq!(stats.errors[0].kind, ResponseErrorKind::Http);
        assert_eq!(stats.errors[0].code, Some(429));
        assert_eq!(stats.errors[0].message, None);
        assert_eq!(stats.errors[0].url, "GET https://h/api/v1/pods");
        assert_eq!(stats.errors[0].timestamp, at);
        assert_eq!(stats.errors[0].duration_seconds, 0.5);
        assert_eq!(stats.errors[1].code, Some(500));
    }

    #[test]
    fn test_received_bytes_accumulate() {
        let metric = ResponseMetric::new();
        metric.observe_received_bytes(1024);
        metric.observe_received_bytes(1024);
        assert_eq!(metric.gather().total_received_bytes, 2048);
    }

    #[test]
    fn test_gather_returns_independent_copies() {
        let metric = ResponseMetric::new();
        metric.observe_latency("GET", "https://h/api/v1/pods", 0.1);

        let mut first = metric.gather();
        first
            .latencies_by_url
            .get_mut("GET https://h/api/v1/pods")
            .unwrap()
            .push(9.9);

        let second = metric.gather();
        assert_eq!(
            second.latencies_by_url["GET https://h/api/v1/pods"],
            vec![0.1]
        );
    }

    #[test]
    fn test_concurrent_observers() {
        use std::sync::Arc;
        let metric = Arc::new(ResponseMetric::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let m = metric.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    m.observe_latency("LIST", "https://h/api/v1/pods", 0.01);
                    m.observe_received_bytes(10);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let stats = metric.gather();
        assert_eq!(
            stats.latencies_by_url["LIST https://h/api/v1/pods"].len(),
            8000
        );
        assert_eq!(stats.total_received_bytes, 80_000);
    }
}
