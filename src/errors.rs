//! Classification of request failures into a fixed taxonomy.
//!
//! Every failed request is sorted into one of four buckets so that reports
//! can separate server-side rejections from transport-level trouble:
//! HTTP status errors, HTTP/2 protocol errors, connection errors, and a
//! catch-all for everything else. Classification is priority ordered; the
//! first matching bucket wins.

use std::error::Error as StdError;
use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Category of a failed response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseErrorKind {
    /// The server answered with a 4xx/5xx status code.
    #[serde(rename = "http")]
    Http,

    /// The failure originated in the HTTP/2 framing layer (GOAWAY, stream
    /// reset, lost connection).
    #[serde(rename = "http2-protocol")]
    Http2Protocol,

    /// Transport-level failure: dial errors, resets, timeouts, truncated
    /// streams.
    #[serde(rename = "connection")]
    Connection,

    /// Anything that did not match a more specific bucket.
    #[serde(rename = "unknown")]
    Unknown,
}

impl fmt::Display for ResponseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResponseErrorKind::Http => "http",
            ResponseErrorKind::Http2Protocol => "http2-protocol",
            ResponseErrorKind::Connection => "connection",
            ResponseErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Error produced by executing a single request.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The server replied, but with an error status.
    #[error("server returned HTTP {0}")]
    Http(u16),

    /// The request failed below the HTTP layer.
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

/// Outcome of classifying a [`RequestError`].
///
/// `code` is set only for [`ResponseErrorKind::Http`]; `message` is set for
/// every other kind.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedError {
    pub kind: ResponseErrorKind,
    pub code: Option<u16>,
    pub message: Option<String>,
}

impl ClassifiedError {
    fn http(code: u16) -> Self {
        Self {
            kind: ResponseErrorKind::Http,
            code: Some(code),
            message: None,
        }
    }

    fn with_message(kind: ResponseErrorKind, message: String) -> Self {
        Self {
            kind,
            code: None,
            message: Some(message),
        }
    }
}

/// Classifies a request error.
///
/// Priority order: HTTP status, HTTP/2 protocol, connection, unknown.
pub fn classify(err: &RequestError) -> ClassifiedError {
    match err {
        RequestError::Http(code) => ClassifiedError::http(*code),
        RequestError::Transport(e) => {
            if let Some(status) = e.status() {
                return ClassifiedError::http(status.as_u16());
            }
            if let Some(h2err) = find_source::<h2::Error>(e) {
                return ClassifiedError::with_message(
                    ResponseErrorKind::Http2Protocol,
                    h2err.to_string(),
                );
            }
            // Whole-request deadlines and dial failures, including TLS
            // handshakes that never complete.
            if e.is_timeout() || e.is_connect() {
                return ClassifiedError::with_message(
                    ResponseErrorKind::Connection,
                    root_cause_text(e),
                );
            }
            classify_source_chain(e)
        }
    }
}

/// Classifies an arbitrary error by walking its source chain.
///
/// Used directly by tests and as the fallback for transport errors whose
/// reqwest-level predicates did not match.
pub fn classify_source_chain(err: &(dyn StdError + 'static)) -> ClassifiedError {
    if let Some(h2err) = find_source::<h2::Error>(err) {
        return ClassifiedError::with_message(ResponseErrorKind::Http2Protocol, h2err.to_string());
    }
    if let Some(ioerr) = find_source::<io::Error>(err) {
        if is_connection_kind(ioerr.kind()) {
            return ClassifiedError::with_message(ResponseErrorKind::Connection, ioerr.to_string());
        }
    }
    ClassifiedError::with_message(ResponseErrorKind::Unknown, err.to_string())
}

fn is_connection_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::TimedOut
    )
}

/// Returns true if `err` is an HTTP/2 stream reset with code NO_ERROR.
///
/// Per RFC 7540 section 8.1 a server may send RST_STREAM with NO_ERROR after
/// a complete response; the body copy loop translates this into success
/// before any failure is recorded.
pub fn is_http2_stream_no_error(err: &(dyn StdError + 'static)) -> bool {
    match find_source::<h2::Error>(err) {
        // A GOAWAY with NO_ERROR still ends the whole connection and stays
        // an error; only the stream-level reset is benign.
        Some(h2err) => !h2err.is_go_away() && h2err.reason() == Some(h2::Reason::NO_ERROR),
        None => false,
    }
}

/// Finds the first error of type `T` in the source chain, including `err`
/// itself.
fn find_source<'a, T: StdError + 'static>(err: &'a (dyn StdError + 'static)) -> Option<&'a T> {
    let mut cur: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = cur {
        if let Some(found) = e.downcast_ref::<T>() {
            return Some(found);
        }
        cur = e.source();
    }
    None
}

/// Text of the innermost error in the chain.
fn root_cause_text(err: &(dyn StdError + 'static)) -> String {
    let mut cur: &(dyn StdError + 'static) = err;
    while let Some(next) = cur.source() {
        cur = next;
    }
    cur.to_string()
}
