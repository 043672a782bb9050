#![forbid(unsafe_code, future_incompatible)]
#![deny(
    missing_docs,
    missing_debug_implementations,
    nonstandard_style,
    unused_qualifications,
    unused_import_braces,
    unused_extern_crates,
    trivial_casts,
    trivial_numeric_casts
)]
//! A prioritized, cancelable, cache-coherent HTTP request dispatch pipeline.
//!
//! This crate schedules many small RPC-style HTTP calls on behalf of
//! client-side code: requests are submitted to a [`RequestQueue`], triaged
//! against a disk-backed [`Cache`] with soft/hard-TTL freshness, fetched
//! through a pluggable [`HttpStack`], retried with per-request
//! [`RetryPolicy`] state, and delivered to listener callbacks on a
//! configurable [`Executor`] context. It implements the client-side half of
//! RFC 7234 caching: `max-age` and `stale-while-revalidate` lifetimes,
//! `ETag` / `Last-Modified` conditional revalidation, and `304 Not
//! Modified` header merging.
//!
//! The pipeline guarantees:
//!
//! - **Priority before sequence**: ready requests start in priority order,
//!   ties broken by submission order.
//! - **In-flight coalescing**: concurrent cacheable requests for one cache
//!   key issue at most one network fetch; the rest are served from the
//!   leader's response.
//! - **Exactly-once terminal delivery**: a request invokes its success or
//!   error listener exactly once — or neither, once canceled.
//! - **Fire-and-forget cancellation**: cancel one handle, or a whole
//!   [`Tag`] scope; in-flight work drains without touching a listener.
//!
//! ## Usage
//!
//! Supply a transport, point the cache at a directory, start the queue:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use http_dispatch::{
//!     DiskCache, HttpStack, Method, NetworkResponse, Parsed, Request,
//!     RequestQueue, TransportError, TransportRequest, TransportResponse,
//! };
//!
//! struct MyStack;
//!
//! #[async_trait]
//! impl HttpStack for MyStack {
//!     async fn execute(
//!         &self,
//!         request: TransportRequest<'_>,
//!     ) -> Result<TransportResponse, TransportError> {
//!         // Drive the HTTP client of your choice here.
//!         unimplemented!()
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let cache = Arc::new(DiskCache::new("./http-cache"));
//!     let queue = RequestQueue::new(cache, Arc::new(MyStack));
//!     queue.start();
//!
//!     queue.add(
//!         Request::new(
//!             Method::Get,
//!             "https://example.com/profile",
//!             |raw: &NetworkResponse| {
//!                 Ok(Parsed::with_cache_headers(raw.body.to_vec(), raw))
//!             },
//!         )
//!         .on_response(|response| println!("{} bytes", response.result.len())),
//!     );
//! }
//! ```
//!
//! ## Freshness model
//!
//! Every cached entry carries two expiry instants. Before the *soft TTL*
//! the entry is served as-is with no network traffic. Between the soft and
//! the *hard TTL* the entry is still served — flagged
//! [`intermediate`](Response::intermediate) — while a refresh is fetched in
//! the background, so the caller sees data immediately and again when the
//! network answers. Past the hard TTL the entry is only used as a source of
//! validators for a conditional fetch.
//!
//! ## Out of scope
//!
//! Streaming downloads, resumable transfers, multipart uploads, and request
//! chaining. The concrete HTTP transport and the per-request response
//! parsing are supplied by the caller.

mod cache;
mod delivery;
mod dispatch;
mod error;
mod header;
mod queue;
mod request;
mod response;
mod retry;
mod stack;


pub use cache::{parse_cache_headers, Cache, CacheEntry, DiskCache};
pub use delivery::{DeliveryJob, Executor, InlineExecutor, TokioExecutor};
pub use error::{CacheError, RequestError, Result, TransportError};
pub use header::{Header, Headers, DEFAULT_CHARSET};
pub use queue::{
    QueueConfig, RequestEvent, RequestEventListener, RequestFinishedListener,
    RequestQueue,
};
pub use request::{
    Method, Priority, Request, RequestHandle, RequestState, ResponseParser,
    Tag, DEFAULT_BODY_CONTENT_TYPE,
};
pub use response::{NetworkResponse, Parsed, Response};
pub use retry::{
    DefaultRetryPolicy, RetryPolicy, DEFAULT_BACKOFF_MULTIPLIER,
    DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT_MS,
};
pub use stack::{HttpStack, TransportRequest, TransportResponse};
