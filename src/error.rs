//! Error types for the dispatch pipeline.

use thiserror::Error;

use crate::response::NetworkResponse;

/// A `Result` typedef to use with the [`RequestError`] type.
pub type Result<T> = std::result::Result<T, RequestError>;

/// The error taxonomy delivered to request error listeners.
///
/// Transport and transient failures flow through the request's retry policy;
/// once attempts are exhausted the original typed error is delivered. Errors
/// carry the originating [`NetworkResponse`] when one is available so callers
/// can inspect status, headers, and body.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The network round trip exceeded the per-attempt timeout.
    #[error("network round trip timed out")]
    Timeout,
    /// DNS or TCP failure, connection refused, or a malformed URL.
    #[error("no connection: {reason}")]
    NoConnection {
        /// Human-readable description of the transport failure.
        reason: String,
    },
    /// HTTP 401/403, or a credential refresh is needed before retrying.
    #[error("authentication failure")]
    AuthFailure {
        /// The server response, when the failure came from a status code.
        response: Option<NetworkResponse>,
    },
    /// An HTTP 4xx status other than the authentication pair.
    #[error("client error: status {}", .response.status)]
    Client {
        /// The server response that produced the error.
        response: NetworkResponse,
    },
    /// An HTTP 5xx status or another server-side fault.
    #[error("server error")]
    Server {
        /// The server response, when one was received.
        response: Option<NetworkResponse>,
    },
    /// The response could not be parsed by the request's strategy.
    #[error("failed to parse response: {reason}")]
    Parse {
        /// What the parser rejected.
        reason: String,
        /// The response handed to the parser, when available.
        response: Option<NetworkResponse>,
    },
    /// Any other transport error.
    #[error("network failure: {reason}")]
    Network {
        /// Human-readable description.
        reason: String,
        /// The server response, when one was received.
        response: Option<NetworkResponse>,
    },
}

impl RequestError {
    /// The network response attached to this error, if any.
    #[must_use]
    pub fn response(&self) -> Option<&NetworkResponse> {
        match self {
            RequestError::Timeout | RequestError::NoConnection { .. } => None,
            RequestError::AuthFailure { response }
            | RequestError::Server { response }
            | RequestError::Parse { response, .. }
            | RequestError::Network { response, .. } => response.as_ref(),
            RequestError::Client { response } => Some(response),
        }
    }

    /// Convenience constructor for parse failures without a raw response.
    pub fn parse(reason: impl Into<String>) -> Self {
        RequestError::Parse { reason: reason.into(), response: None }
    }
}

/// What a pluggable [`HttpStack`](crate::HttpStack) may raise instead of a
/// response.
///
/// The network dispatcher maps these onto the [`RequestError`] taxonomy:
/// timeouts become retriable [`RequestError::Timeout`]s, everything else is a
/// [`RequestError::NoConnection`].
#[derive(Debug, Error)]
pub enum TransportError {
    /// The per-attempt timeout elapsed before the response arrived.
    #[error("transport timed out")]
    Timeout,
    /// The request URL could not be interpreted by the transport.
    #[error("malformed url: {0}")]
    MalformedUrl(String),
    /// The connection could not be established or was dropped.
    #[error("connection failed: {0}")]
    Connection(String),
    /// Any other I/O failure below the HTTP layer.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised by the disk cache.
///
/// The pipeline swallows these — a failed read is a cache miss and a failed
/// write is logged — but the cache surface reports them so callers driving
/// the store directly can react.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Filesystem failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The on-disk bytes do not decode as a cache entry.
    #[error("corrupt cache file: {0}")]
    Corrupt(String),
}
