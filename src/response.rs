//! Response values moving through the pipeline.

use std::any::Any;
use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;

use crate::cache::CacheEntry;
use crate::error::RequestError;
use crate::header::Headers;

/// The raw result of one HTTP exchange, as produced by the network leg.
#[derive(Debug, Clone)]
pub struct NetworkResponse {
    /// HTTP status code.
    pub status: StatusCode,
    /// Response headers, in wire order.
    pub headers: Headers,
    /// Response body bytes. For a `304` this is the cached body.
    pub body: Bytes,
    /// Whether the server answered `304 Not Modified`.
    pub not_modified: bool,
    /// Wall time spent in the transport for this response.
    pub network_time: Duration,
}

impl NetworkResponse {
    /// Builds the synthetic response the cache leg hands to a parser when a
    /// stored entry is served without touching the network.
    pub(crate) fn from_cache_entry(entry: &CacheEntry) -> Self {
        Self {
            status: StatusCode::OK,
            headers: entry.response_headers.clone(),
            body: entry.data.clone(),
            not_modified: false,
            network_time: Duration::ZERO,
        }
    }
}

/// What a [`ResponseParser`](crate::ResponseParser) produces: the typed value
/// plus the cache metadata extracted from the response, if any.
///
/// A `Parsed` without cache metadata is never written to the cache.
#[derive(Debug)]
pub struct Parsed<T> {
    /// The parsed value.
    pub value: T,
    /// Cache metadata for the write-through, when the response is cacheable.
    pub cache_entry: Option<CacheEntry>,
}

impl<T> Parsed<T> {
    /// A parsed value that must not be cached.
    pub fn new(value: T) -> Self {
        Self { value, cache_entry: None }
    }

    /// A parsed value whose cache metadata is computed from the response's
    /// standard cache headers.
    pub fn with_cache_headers(value: T, response: &NetworkResponse) -> Self {
        Self { value, cache_entry: crate::cache::parse_cache_headers(response) }
    }
}

/// A response as delivered to the caller's listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response<T> {
    /// The parsed result.
    pub result: T,
    /// `true` when this delivery will be followed by an authoritative one
    /// from the network (the soft-refresh path).
    pub intermediate: bool,
}

/// Type-erased parse output carried between pipeline stages.
pub(crate) struct ErasedParsed {
    pub(crate) value: Box<dyn Any + Send>,
    pub(crate) cache_entry: Option<CacheEntry>,
}

impl ErasedParsed {
    pub(crate) fn from_parsed<T: Send + 'static>(parsed: Parsed<T>) -> Self {
        Self { value: Box::new(parsed.value), cache_entry: parsed.cache_entry }
    }
}

/// What a parse attempt hands back to the pipeline.
pub(crate) type ParseResult = Result<ErasedParsed, RequestError>;
