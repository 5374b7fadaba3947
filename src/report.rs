//! Benchmark report types, percentile summaries, and report merging.
//!
//! The scheduler produces a raw [`ResponseStats`]; this module turns it into
//! the JSON report emitted by the binary and merges reports from several
//! runners into one percentile summary.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::ResponseErrorKind;
use crate::utils::{format_iso8601_duration, parse_iso8601_duration};

/// Quantiles reported for every latency distribution, ascending.
pub const LATENCY_QUANTILES: [f64; 5] = [0.5, 0.9, 0.95, 0.99, 0.999];

/// One classified request failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseError {
    /// "<METHOD> <normalised url>" of the failed request.
    pub url: String,
    pub timestamp: DateTime<Utc>,
    pub duration_seconds: f64,
    #[serde(rename = "type")]
    pub kind: ResponseErrorKind,
    /// HTTP status code; present only when `kind` is `http`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    /// Underlying error text; present for every non-`http` kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Raw observations gathered over one scheduler run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseStats {
    pub total_received_bytes: i64,
    /// Latencies in seconds keyed by "<METHOD> <normalised url>", in
    /// observation order.
    #[serde(rename = "latenciesByURL")]
    pub latencies_by_url: HashMap<String, Vec<f64>>,
    pub errors: Vec<ResponseError>,
}

/// The report written by a runner, and the shape produced by merging
/// several runners' reports.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerMetricReport {
    pub total: usize,
    /// ISO 8601 duration string, e.g. "PT9.853S".
    pub duration: String,
    pub total_received_bytes: i64,
    #[serde(default)]
    pub error_stats: HashMap<String, i32>,
    /// Full failure list; omitted unless raw data was requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<ResponseError>>,
    /// Raw latency sequences; omitted unless raw data was requested.
    #[serde(
        default,
        rename = "latenciesByURL",
        skip_serializing_if = "Option::is_none"
    )]
    pub latencies_by_url: Option<HashMap<String, Vec<f64>>>,
    /// (quantile, seconds) pairs over all URLs, ascending quantile.
    #[serde(default)]
    pub percentile_latencies: Vec<(f64, f64)>,
    #[serde(default, rename = "percentileLatenciesByURL")]
    pub percentile_latencies_by_url: HashMap<String, Vec<(f64, f64)>>,
}

impl RunnerMetricReport {
    /// Builds a report from one scheduler run.
    ///
    /// `total` is the configured request budget; `raw_data` controls whether
    /// the full error list and raw latency sequences are embedded.
    pub fn from_stats(
        stats: &ResponseStats,
        duration: Duration,
        total: usize,
        raw_data: bool,
    ) -> Self {
        let mut all = Vec::new();
        let mut by_url = HashMap::new();
        for (url, latencies) in &stats.latencies_by_url {
            all.extend_from_slice(latencies);
            by_url.insert(url.clone(), build_percentile_latencies(latencies));
        }

        Self {
            total,
            duration: format_iso8601_duration(duration),
            total_received_bytes: stats.total_received_bytes,
            error_stats: build_error_stats(&stats.errors),
            errors: raw_data.then(|| stats.errors.clone()),
            latencies_by_url: raw_data.then(|| stats.latencies_by_url.clone()),
            percentile_latencies: build_percentile_latencies(&all),
            percentile_latencies_by_url: by_url,
        }
    }
}

/// Computes (quantile, seconds) pairs using the nearest-rank method over the
/// sorted sequence. Empty input yields an empty summary.
pub fn build_percentile_latencies(latencies: &[f64]) -> Vec<(f64, f64)> {
    if latencies.is_empty() {
        return Vec::new();
    }

    let mut sorted = latencies.to_vec();
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len();

    LATENCY_QUANTILES
        .iter()
        .map(|&q| {
            let rank = (q * n as f64).ceil() as usize;
            let idx = rank.saturating_sub(1).min(n - 1);
            (q, sorted[idx])
        })
        .collect()
}

/// Counts failures by a stable key: "http/<code>" for status errors,
/// "<kind>/<message>" for everything else.
pub fn build_error_stats(errors: &[ResponseError]) -> HashMap<String, i32> {
    let mut stats = HashMap::new();
    for err in errors {
        let key = match err.kind {
            ResponseErrorKind::Http => format!("http/{}", err.code.unwrap_or(0)),
            kind => format!("{}/{}", kind, err.message.as_deref().unwrap_or("")),
        };
        *stats.entry(key).or_insert(0) += 1;
    }
    stats
}

/// Merges per-runner reports into one summary.
///
/// Received bytes and error stats are summed, latency sequences are
/// concatenated per URL, and the longest runner duration becomes the
/// aggregate duration. `total` of the merged report is the number of latency
/// observations across all inputs. Raw latency sequences are consumed to
/// build percentiles and not re-emitted.
pub fn merge_reports(reports: Vec<RunnerMetricReport>) -> RunnerMetricReport {
    let mut total_bytes = 0i64;
    let mut total_resp = 0usize;
    let mut latencies_by_url: HashMap<String, Vec<f64>> = HashMap::new();
    let mut errors = Vec::new();
    let mut error_stats: HashMap<String, i32> = HashMap::new();
    let mut max_duration = Duration::ZERO;

    for mut report in reports {
        total_bytes += report.total_received_bytes;

        if let Some(latencies) = report.latencies_by_url.take() {
            for (url, seq) in latencies {
                total_resp += seq.len();
                latencies_by_url.entry(url).or_default().extend(seq);
            }
        }

        for (key, count) in report.error_stats {
            *error_stats.entry(key).or_insert(0) += count;
        }
        if let Some(errs) = report.errors.take() {
            errors.extend(errs);
        }

        match parse_iso8601_duration(&report.duration) {
            Ok(d) => max_duration = max_duration.max(d),
            Err(e) => warn!(duration = %report.duration, error = %e, "skipping unparseable runner duration"),
        }
    }

    let mut all = Vec::with_capacity(total_resp);
    let mut percentile_by_url = HashMap::new();
    for (url, seq) in &latencies_by_url {
        all.extend_from_slice(seq);
        percentile_by_url.insert(url.clone(), build_percentile_latencies(seq));
    }

    RunnerMetricReport {
        total: total_resp,
        duration: format_iso8601_duration(max_duration),
        total_received_bytes: total_bytes,
        error_stats,
        errors: Some(errors),
        latencies_by_url: None,
        percentile_latencies: build_percentile_latencies(&all),
        percentile_latencies_by_url: percentile_by_url,
    }
}
