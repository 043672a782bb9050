//! The pluggable HTTP transport boundary.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;

use crate::error::TransportError;
use crate::header::Headers;
use crate::request::Method;

/// One fully-composed transport attempt.
///
/// Headers arrive already merged: queue-level defaults first, then the
/// request's own headers (the request wins on collisions), then any
/// conditional revalidation headers. `timeout` comes from the request's
/// retry policy and applies to this attempt only.
#[derive(Debug)]
pub struct TransportRequest<'a> {
    /// HTTP method. Transports map [`Method::LegacyGetOrPost`] to POST when
    /// a body is present and GET otherwise.
    pub method: Method,
    /// The request URL, uninterpreted by the pipeline.
    pub url: &'a str,
    /// The composed header list, in send order.
    pub headers: Headers,
    /// The request body, if any.
    pub body: Option<Bytes>,
    /// Content type to send with the body.
    pub body_content_type: &'a str,
    /// Per-attempt timeout.
    pub timeout: Duration,
}

/// What a transport yields for one attempt.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    /// HTTP status code.
    pub status: StatusCode,
    /// Response headers, in wire order.
    pub headers: Headers,
    /// The response body, fully read.
    pub body: Bytes,
}

/// A concrete HTTP transport.
///
/// The pipeline owns scheduling, caching, retries, and delivery; the stack
/// only performs one HTTP exchange per call. Status codes are not
/// interpreted here — a 500 is a successful transport exchange. Only
/// transport-level failures (timeouts, connection errors, unusable URLs)
/// are reported as [`TransportError`]s.
#[async_trait]
pub trait HttpStack: Send + Sync + 'static {
    /// Executes one HTTP exchange.
    async fn execute(
        &self,
        request: TransportRequest<'_>,
    ) -> Result<TransportResponse, TransportError>;
}
