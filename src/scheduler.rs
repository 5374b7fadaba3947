//! Scheduler: drives the request mixture against pre-built connections.
//!
//! A fixed pool of workers pulls builders from the weighted source, waits
//! for a token from a shared rate limiter, executes the request on its
//! dedicated connection, and records the outcome. Cancellation drains
//! cleanly: in-flight requests finish (bounded by their own timeout), then
//! workers exit the channel loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::builders::RequestBuilder;
use crate::client::ApiClient;
use crate::config::{ConfigError, LoadProfileSpec};
use crate::generator::WeightedRandomRequests;
use crate::metrics::ResponseMetric;
use crate::report::ResponseStats;
use crate::request::DEFAULT_REQUEST_TIMEOUT;

/// Errors that can occur when setting up a run.
#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("at least one connection is required")]
    NoConnections,
}

/// Outcome of one scheduler invocation.
#[derive(Debug)]
pub struct ScheduleResult {
    pub stats: ResponseStats,
    /// Wall-clock time from worker start to quiesce.
    pub duration: Duration,
    /// The configured request budget.
    pub total: usize,
}

/// Token bucket with burst 1.
///
/// Acquisitions are spaced `1/qps` apart; an idle period grants at most one
/// immediate token. A zero interval disables pacing entirely.
pub(crate) struct RateLimiter {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub(crate) fn new(qps: f64) -> Self {
        let interval = if qps > 0.0 {
            Duration::from_secs_f64(1.0 / qps)
        } else {
            Duration::ZERO
        };
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    pub(crate) async fn acquire(&self) {
        if self.interval.is_zero() {
            return;
        }
        let deadline = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let at = match *next {
                Some(slot) if slot > now => slot,
                _ => now,
            };
            *next = Some(at + self.interval);
            at
        };
        tokio::time::sleep_until(deadline).await;
    }
}

/// Resolves once the watch signals cancellation. If the sender is gone
/// without ever cancelling, cancellation can no longer happen and the
/// future stays pending.
pub(crate) async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Runs the load profile to completion (or cancellation) and returns the
/// aggregate result.
///
/// Worker `i` is bound to connection `i mod n`; workers share connections
/// when there are more workers than connections.
pub async fn schedule(
    spec: &LoadProfileSpec,
    conns: Vec<ApiClient>,
    cancel: watch::Receiver<bool>,
) -> Result<ScheduleResult, ScheduleError> {
    if conns.is_empty() {
        return Err(ScheduleError::NoConnections);
    }

    let (mut source, builder_rx) = WeightedRandomRequests::new(spec)?;

    let qps = if spec.rate == 0.0 {
        // Unlimited: pace at a rate no real server reaches.
        f64::from(i32::MAX)
    } else {
        spec.rate
    };
    let limiter = Arc::new(RateLimiter::new(qps));

    let workers = if spec.client != 0 { spec.client } else { spec.conns };
    let metric = Arc::new(ResponseMetric::new());
    let builder_rx = Arc::new(Mutex::new(builder_rx));

    info!(
        clients = workers,
        connections = conns.len(),
        rate = qps,
        total = spec.total,
        http2 = !spec.disable_http2,
        content_type = ?spec.content_type,
        "starting benchmark"
    );

    let mut handles = Vec::with_capacity(workers);
    for i in 0..workers {
        handles.push(tokio::spawn(run_worker(
            i,
            conns[i % conns.len()].clone(),
            builder_rx.clone(),
            limiter.clone(),
            metric.clone(),
            cancel.clone(),
        )));
    }

    let start = Instant::now();

    source.run(cancel.clone(), spec.total).await;
    source.stop();
    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "worker task failed");
        }
    }

    Ok(ScheduleResult {
        stats: metric.gather(),
        duration: start.elapsed(),
        total: spec.total,
    })
}

async fn run_worker(
    id: usize,
    conn: ApiClient,
    builder_rx: Arc<Mutex<mpsc::Receiver<Arc<dyn RequestBuilder>>>>,
    limiter: Arc<RateLimiter>,
    metric: Arc<ResponseMetric>,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        // Lock scope keeps the receiver available to sibling workers while
        // this one is executing a request.
        let builder = {
            let mut rx = builder_rx.lock().await;
            match rx.recv().await {
                Some(builder) => builder,
                None => break,
            }
        };

        tokio::select! {
            _ = limiter.acquire() => {}
            _ = wait_cancelled(&mut cancel) => {
                debug!(worker = id, "cancelled while waiting for rate limiter");
                return;
            }
        }

        let mut request = builder.build(&conn).await;
        request.set_timeout(DEFAULT_REQUEST_TIMEOUT);

        let method = request.method();
        let url = request.url().to_string();
        debug!(worker = id, method, url = %url, "dispatching request");

        // The request itself runs outside the cancellation scope so an
        // aborted run never skews the error counts; its own timeout bounds
        // the wait.
        let start = Instant::now();
        let outcome = request.dispatch().await;
        let latency = start.elapsed().as_secs_f64();

        match outcome {
            Ok(bytes) => {
                metric.observe_received_bytes(bytes);
                metric.observe_latency(method, &url, latency);
            }
            Err(err) => {
                debug!(worker = id, error = %err, "request failed");
                metric.observe_failure(method, &url, Utc::now(), latency, &err);
            }
        }
    }
    debug!(worker = id, "worker drained");
}
