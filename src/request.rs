//! Executable requests.
//!
//! A [`Requester`] is the one-shot unit a worker runs: method, URL, a
//! configurable timeout, and a `dispatch` that returns the bytes read
//! together with the outcome. Response bodies are streamed to nowhere so
//! that byte counts reflect what the server actually sent.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Response, Url};
use tokio::time::sleep;
use tracing::debug;

use crate::builders::NameCache;
use crate::errors::{is_http2_stream_no_error, RequestError};

/// Per-request deadline applied by the scheduler.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Statuses retried when the server asks for backoff via Retry-After.
const RETRYABLE_STATUSES: [u16; 2] = [429, 503];

/// How the response body is consumed and what bookkeeping follows success.
pub(crate) enum RequestMode {
    /// Stream the body to /dev/null and count the bytes.
    Discard,
    /// Consume a watch stream until the initial-events-end bookmark.
    WatchList,
    /// Discard the body; on success append `name` to the churn cache.
    Post { name: String, cache: Arc<NameCache> },
    /// Discard the body; on success remove `name` from the churn cache.
    Delete { name: String, cache: Arc<NameCache> },
}

/// One executable request bound to a connection.
pub struct Requester {
    method: &'static str,
    url: Url,
    request: reqwest::RequestBuilder,
    timeout: Duration,
    max_retries: u32,
    mode: RequestMode,
}

impl Requester {
    pub(crate) fn new(
        method: &'static str,
        url: Url,
        request: reqwest::RequestBuilder,
        max_retries: u32,
        mode: RequestMode,
    ) -> Self {
        Self {
            method,
            url,
            request,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            max_retries,
            mode,
        }
    }

    pub fn method(&self) -> &'static str {
        self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Executes the request and consumes the response.
    ///
    /// Returns the number of body bytes read on success. Callers cancel by
    /// dropping the enclosing task only between requests; an in-flight
    /// dispatch is bounded by the timeout, not by external cancellation, so
    /// observations stay consistent.
    pub async fn dispatch(self) -> Result<i64, RequestError> {
        let request = self.request.timeout(self.timeout);
        let response = send_with_retries(request, self.max_retries).await?;

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(RequestError::Http(status.as_u16()));
        }

        match self.mode {
            RequestMode::Discard => discard_body(response).await,
            RequestMode::WatchList => {
                consume_watch_stream(response).await?;
                Ok(0)
            }
            RequestMode::Post { name, cache } => {
                let bytes = discard_body(response).await?;
                cache.push(name);
                Ok(bytes)
            }
            RequestMode::Delete { name, cache } => {
                let bytes = discard_body(response).await?;
                cache.remove(&name);
                Ok(bytes)
            }
        }
    }
}

/// Sends the request, retrying up to `max_retries` times on connect
/// failures and on 429/503 responses that carry a Retry-After header.
async fn send_with_retries(
    request: reqwest::RequestBuilder,
    max_retries: u32,
) -> Result<Response, RequestError> {
    let mut remaining = max_retries;
    let mut current = request;
    loop {
        let mut fallback = if remaining > 0 { current.try_clone() } else { None };
        match current.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                if RETRYABLE_STATUSES.contains(&status) {
                    if let (Some(wait), Some(next)) =
                        (retry_after_seconds(response.headers()), fallback)
                    {
                        remaining -= 1;
                        debug!(status, wait, "server asked for backoff, retrying");
                        sleep(Duration::from_secs(wait)).await;
                        current = next;
                        continue;
                    }
                }
                return Ok(response);
            }
            Err(err) if err.is_connect() && fallback.is_some() => {
                remaining -= 1;
                debug!(error = %err, "connect failed, retrying");
                current = fallback.take().expect("checked by guard");
            }
            Err(err) => return Err(err.into()),
        }
    }
}

fn retry_after_seconds(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        // A worker never backs off longer than 30s per attempt.
        .map(|secs| secs.min(30))
}

/// Streams the response body to nowhere, returning the number of bytes
/// copied.
///
/// An HTTP/2 stream reset with NO_ERROR after a complete response is
/// success, not failure (RFC 7540 section 8.1).
async fn discard_body(response: Response) -> Result<i64, RequestError> {
    let mut stream = response.bytes_stream();
    let mut bytes = 0i64;
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(data) => bytes += data.len() as i64,
            Err(err) if is_http2_stream_no_error(&err) => break,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(bytes)
}

/// Consumes newline-delimited watch events until the server signals the end
/// of the initial snapshot, decoding each event into a throwaway value.
async fn consume_watch_stream(response: Response) -> Result<(), RequestError> {
    let mut stream = response.bytes_stream();
    let mut buf: Vec<u8> = Vec::new();
    'body: while let Some(chunk) = stream.next().await {
        let data = match chunk {
            Ok(data) => data,
            Err(err) if is_http2_stream_no_error(&err) => break,
            Err(err) => return Err(err.into()),
        };
        buf.extend_from_slice(&data);
        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buf.drain(..=pos).collect();
            if is_initial_events_end(&line) {
                break 'body;
            }
        }
    }
    Ok(())
}

/// True for a BOOKMARK event annotated with `k8s.io/initial-events-end`.
fn is_initial_events_end(line: &[u8]) -> bool {
    let event: serde_json::Value = match serde_json::from_slice(line) {
        Ok(value) => value,
        Err(_) => return false,
    };
    if event.get("type").and_then(|t| t.as_str()) != Some("BOOKMARK") {
        return false;
    }
    event
        .pointer("/object/metadata/annotations/k8s.io~1initial-events-end")
        .and_then(|v| v.as_str())
        == Some("true")
}
