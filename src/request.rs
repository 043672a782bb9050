//! Request descriptors and the strategy objects attached to them.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::cache::CacheEntry;
use crate::error::{RequestError, Result};
use crate::header::Headers;
use crate::response::{ErasedParsed, NetworkResponse, Parsed, ParseResult, Response};
use crate::retry::{DefaultRetryPolicy, RetryPolicy};

/// Body content type used when a request carries a body without an explicit
/// override.
pub const DEFAULT_BODY_CONTENT_TYPE: &str =
    "application/x-www-form-urlencoded; charset=UTF-8";

/// HTTP method of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// HTTP GET.
    Get,
    /// HTTP POST.
    Post,
    /// HTTP PUT.
    Put,
    /// HTTP DELETE.
    Delete,
    /// HTTP HEAD.
    Head,
    /// HTTP OPTIONS.
    Options,
    /// HTTP TRACE.
    Trace,
    /// HTTP PATCH.
    Patch,
    /// Legacy method for callers that let the transport pick GET or POST
    /// depending on whether a body is present.
    LegacyGetOrPost,
}

impl Method {
    /// The canonical method string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Patch => "PATCH",
            Method::LegacyGetOrPost => "GET_OR_POST",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling priority. Within a priority class, requests run in submission
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    /// Below-normal priority.
    Low,
    /// The default.
    #[default]
    Normal,
    /// Above-normal priority.
    High,
    /// Runs ahead of everything else.
    Immediate,
}

/// An opaque cancellation scope.
///
/// Tags compare by identity: two tags are equal only when one is a clone of
/// the other. Attach a clone of the same tag to a group of requests and
/// cancel the whole group with
/// [`RequestQueue::cancel_all`](crate::RequestQueue::cancel_all).
#[derive(Debug, Clone, Default)]
pub struct Tag(Arc<()>);

impl Tag {
    /// Creates a fresh tag, distinct from every other tag.
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(()))
    }
}

impl PartialEq for Tag {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Tag {}

/// Where a request currently is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Submitted, not yet picked up.
    Pending,
    /// Queued for the cache lookup leg.
    CacheTriage,
    /// Parked behind an in-flight request with the same cache key.
    AwaitingLeader,
    /// Queued for the network leg.
    NetworkPending,
    /// A network worker is driving the request.
    NetworkInflight,
    /// The response is being parsed.
    Parsing,
    /// A terminal response was delivered.
    Delivered,
    /// Canceled; no callback was or will be invoked.
    Canceled,
    /// Failed; the error listener was invoked.
    Failed,
}

/// Turns a raw network response into a typed value plus cache metadata.
///
/// Implementations run on a network worker, never on the delivery context.
/// The [`Parsed::with_cache_headers`] constructor wires the standard cache
/// metadata extraction in; [`Parsed::new`] opts the response out of caching.
pub trait ResponseParser: Send + Sync + 'static {
    /// The value produced for the caller.
    type Output: Send + 'static;

    /// Parses a raw response.
    fn parse(&self, response: &NetworkResponse) -> Result<Parsed<Self::Output>>;
}

impl<T, F> ResponseParser for F
where
    T: Send + 'static,
    F: Fn(&NetworkResponse) -> Result<Parsed<T>> + Send + Sync + 'static,
{
    type Output = T;

    fn parse(&self, response: &NetworkResponse) -> Result<Parsed<T>> {
        self(response)
    }
}

type HeaderProvider = Arc<dyn Fn() -> Result<Headers> + Send + Sync>;
type BodyProvider = Arc<dyn Fn() -> Result<Bytes> + Send + Sync>;

/// Shared, non-generic request state. One per submitted request; guarded by
/// per-request atomics and short-lived locks.
pub(crate) struct RequestCore {
    pub(crate) method: Method,
    pub(crate) url: String,
    pub(crate) cache_key: String,
    pub(crate) priority: Priority,
    pub(crate) tag: Option<Tag>,
    headers: Headers,
    header_provider: Option<HeaderProvider>,
    body: Option<Bytes>,
    body_provider: Option<BodyProvider>,
    pub(crate) body_content_type: String,
    pub(crate) should_cache: bool,
    pub(crate) retry_server_errors: bool,
    pub(crate) retry_connection_errors: bool,
    pub(crate) retry_policy: Mutex<Box<dyn RetryPolicy>>,
    sequence: AtomicU64,
    state: Mutex<RequestState>,
    canceled: AtomicBool,
    response_delivered: AtomicBool,
    finished: AtomicBool,
    coalescing_leader: AtomicBool,
    attached_entry: Mutex<Option<CacheEntry>>,
}

impl fmt::Debug for RequestCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestCore")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("sequence", &self.sequence.load(Ordering::Relaxed))
            .field("priority", &self.priority)
            .field("state", &self.state())
            .field("canceled", &self.is_canceled())
            .finish_non_exhaustive()
    }
}

impl RequestCore {
    /// The headers for the next attempt. The provider, when present, is
    /// consulted on every call so credentials can be refreshed between
    /// attempts; it may fail with an authentication error.
    pub(crate) fn headers(&self) -> Result<Headers> {
        match &self.header_provider {
            Some(provider) => provider(),
            None => Ok(self.headers.clone()),
        }
    }

    /// The body for the next attempt, if any.
    pub(crate) fn body(&self) -> Result<Option<Bytes>> {
        match &self.body_provider {
            Some(provider) => provider().map(Some),
            None => Ok(self.body.clone()),
        }
    }

    pub(crate) fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    pub(crate) fn assign_sequence(&self, sequence: u64) {
        self.sequence.store(sequence, Ordering::Release);
    }

    pub(crate) fn state(&self) -> RequestState {
        *self.state.lock().unwrap()
    }

    pub(crate) fn set_state(&self, state: RequestState) {
        *self.state.lock().unwrap() = state;
    }

    pub(crate) fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    pub(crate) fn mark_delivered(&self) {
        self.response_delivered.store(true, Ordering::Release);
    }

    pub(crate) fn has_delivered_response(&self) -> bool {
        self.response_delivered.load(Ordering::Acquire)
    }

    /// Flips the finished flag; returns `true` only for the first caller.
    pub(crate) fn mark_finished(&self) -> bool {
        !self.finished.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn set_coalescing_leader(&self) {
        self.coalescing_leader.store(true, Ordering::Release);
    }

    pub(crate) fn is_coalescing_leader(&self) -> bool {
        self.coalescing_leader.load(Ordering::Acquire)
    }

    pub(crate) fn attach_cache_entry(&self, entry: CacheEntry) {
        *self.attached_entry.lock().unwrap() = Some(entry);
    }

    pub(crate) fn attached_cache_entry(&self) -> Option<CacheEntry> {
        self.attached_entry.lock().unwrap().clone()
    }
}

/// The cache/coalescing identity of a request: the URL alone for GET-like
/// methods, `METHOD-url` otherwise.
fn derive_cache_key(method: Method, url: &str) -> String {
    match method {
        Method::Get | Method::LegacyGetOrPost => url.to_string(),
        other => format!("{}-{}", other.as_str(), url),
    }
}

/// A request descriptor plus its response strategy.
///
/// Configure with the chainable setters, then hand the request to
/// [`RequestQueue::add`](crate::RequestQueue::add). After submission the
/// descriptor is immutable; the returned [`RequestHandle`] is the way to
/// cancel or observe it.
///
/// ```
/// use http_dispatch::{Method, NetworkResponse, Parsed, Priority, Request};
///
/// let request = Request::new(
///     Method::Get,
///     "https://example.com/user",
///     |raw: &NetworkResponse| {
///         Ok(Parsed::with_cache_headers(
///             String::from_utf8_lossy(&raw.body).into_owned(),
///             raw,
///         ))
///     },
/// )
/// .priority(Priority::High)
/// .on_response(|response| println!("{}", response.result));
/// # drop(request);
/// ```
pub struct Request<T: Send + 'static> {
    core: RequestCore,
    parser: Box<dyn ResponseParser<Output = T>>,
    on_response: Option<Box<dyn Fn(Response<T>) + Send + Sync>>,
    on_error: Option<Box<dyn Fn(RequestError) + Send + Sync>>,
}

impl<T: Send + 'static> fmt::Debug for Request<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request").field("core", &self.core).finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Request<T> {
    /// Creates a request with the given method, URL, and response parser.
    pub fn new(
        method: Method,
        url: impl Into<String>,
        parser: impl ResponseParser<Output = T>,
    ) -> Self {
        let url = url.into();
        let cache_key = derive_cache_key(method, &url);
        Self {
            core: RequestCore {
                method,
                url,
                cache_key,
                priority: Priority::Normal,
                tag: None,
                headers: Headers::new(),
                header_provider: None,
                body: None,
                body_provider: None,
                body_content_type: DEFAULT_BODY_CONTENT_TYPE.to_string(),
                should_cache: true,
                retry_server_errors: false,
                retry_connection_errors: false,
                retry_policy: Mutex::new(Box::new(DefaultRetryPolicy::new())),
                sequence: AtomicU64::new(0),
                state: Mutex::new(RequestState::Pending),
                canceled: AtomicBool::new(false),
                response_delivered: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                coalescing_leader: AtomicBool::new(false),
                attached_entry: Mutex::new(None),
            },
            parser: Box::new(parser),
            on_response: None,
            on_error: None,
        }
    }

    /// Sets the scheduling priority.
    #[must_use]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.core.priority = priority;
        self
    }

    /// Attaches a cancellation tag.
    #[must_use]
    pub fn tag(mut self, tag: Tag) -> Self {
        self.core.tag = Some(tag);
        self
    }

    /// Appends a request header.
    #[must_use]
    pub fn header(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.core.headers.append(name, value);
        self
    }

    /// Replaces the full request header list.
    #[must_use]
    pub fn headers(mut self, headers: Headers) -> Self {
        self.core.headers = headers;
        self
    }

    /// Installs a per-attempt header provider, consulted before every
    /// transport attempt. May fail with
    /// [`RequestError::AuthFailure`] to signal that credentials are needed.
    #[must_use]
    pub fn header_provider(
        mut self,
        provider: impl Fn() -> Result<Headers> + Send + Sync + 'static,
    ) -> Self {
        self.core.header_provider = Some(Arc::new(provider));
        self
    }

    /// Sets a fixed request body.
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.core.body = Some(body.into());
        self
    }

    /// Installs a per-attempt body provider.
    #[must_use]
    pub fn body_provider(
        mut self,
        provider: impl Fn() -> Result<Bytes> + Send + Sync + 'static,
    ) -> Self {
        self.core.body_provider = Some(Arc::new(provider));
        self
    }

    /// Overrides the body content type.
    #[must_use]
    pub fn body_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.core.body_content_type = content_type.into();
        self
    }

    /// Controls whether responses may be served from and written to the
    /// cache. Defaults to `true`.
    #[must_use]
    pub fn should_cache(mut self, should_cache: bool) -> Self {
        self.core.should_cache = should_cache;
        self
    }

    /// Retries 5xx responses through the retry policy. Defaults to `false`.
    #[must_use]
    pub fn retry_server_errors(mut self, retry: bool) -> Self {
        self.core.retry_server_errors = retry;
        self
    }

    /// Retries connection-level failures through the retry policy. Defaults
    /// to `false`.
    #[must_use]
    pub fn retry_connection_errors(mut self, retry: bool) -> Self {
        self.core.retry_connection_errors = retry;
        self
    }

    /// Replaces the retry policy.
    #[must_use]
    pub fn retry_policy(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.core.retry_policy = Mutex::new(Box::new(policy));
        self
    }

    /// Sets the success listener, invoked on the delivery context. The
    /// soft-refresh path may invoke it twice: once with
    /// `intermediate = true`, then with the authoritative response.
    #[must_use]
    pub fn on_response(
        mut self,
        listener: impl Fn(Response<T>) + Send + Sync + 'static,
    ) -> Self {
        self.on_response = Some(Box::new(listener));
        self
    }

    /// Sets the error listener, invoked on the delivery context.
    #[must_use]
    pub fn on_error(
        mut self,
        listener: impl Fn(RequestError) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Box::new(listener));
        self
    }

    pub(crate) fn into_erased(self) -> Arc<dyn PipelineRequest> {
        Arc::new(TypedRequest {
            core: Arc::new(self.core),
            parser: self.parser,
            on_response: self.on_response.unwrap_or_else(|| Box::new(|_| {})),
            on_error: self.on_error.unwrap_or_else(|| Box::new(|_| {})),
        })
    }
}

/// A cheap, clonable reference to a submitted request.
#[derive(Debug, Clone)]
pub struct RequestHandle {
    core: Arc<RequestCore>,
}

impl RequestHandle {
    pub(crate) fn new(core: Arc<RequestCore>) -> Self {
        Self { core }
    }

    /// Marks the request as canceled. The pipeline lets in-flight work
    /// drain, but neither listener will be invoked once cancellation has
    /// been observed at a delivery boundary. Idempotent.
    pub fn cancel(&self) {
        self.core.cancel();
    }

    /// Whether the request has been canceled.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.core.is_canceled()
    }

    /// The sequence number assigned at submission.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.core.sequence()
    }

    /// The request's scheduling priority.
    #[must_use]
    pub fn priority(&self) -> Priority {
        self.core.priority
    }

    /// The request method.
    #[must_use]
    pub fn method(&self) -> Method {
        self.core.method
    }

    /// The request URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.core.url
    }

    /// The cache/coalescing key.
    #[must_use]
    pub fn cache_key(&self) -> &str {
        &self.core.cache_key
    }

    /// The cancellation tag, if one was attached.
    #[must_use]
    pub fn tag(&self) -> Option<&Tag> {
        self.core.tag.as_ref()
    }

    /// Where the request currently is in the pipeline.
    #[must_use]
    pub fn state(&self) -> RequestState {
        self.core.state()
    }
}

/// The type-erased face a request presents to the pipeline.
pub(crate) trait PipelineRequest: Send + Sync {
    fn core(&self) -> &Arc<RequestCore>;

    /// Runs the response strategy on a worker.
    fn parse(&self, response: &NetworkResponse) -> ParseResult;

    /// Invokes the success listener. Runs on the delivery context.
    fn deliver(&self, payload: ErasedParsed, intermediate: bool);

    /// Invokes the error listener. Runs on the delivery context.
    fn deliver_error(&self, error: RequestError);

    fn handle(&self) -> RequestHandle {
        RequestHandle::new(Arc::clone(self.core()))
    }
}

struct TypedRequest<T: Send + 'static> {
    core: Arc<RequestCore>,
    parser: Box<dyn ResponseParser<Output = T>>,
    on_response: Box<dyn Fn(Response<T>) + Send + Sync>,
    on_error: Box<dyn Fn(RequestError) + Send + Sync>,
}

impl<T: Send + 'static> PipelineRequest for TypedRequest<T> {
    fn core(&self) -> &Arc<RequestCore> {
        &self.core
    }

    fn parse(&self, response: &NetworkResponse) -> ParseResult {
        self.parser.parse(response).map(ErasedParsed::from_parsed)
    }

    fn deliver(&self, payload: ErasedParsed, intermediate: bool) {
        match payload.value.downcast::<T>() {
            Ok(value) => {
                (self.on_response)(Response { result: *value, intermediate });
            }
            Err(_) => {
                // Unreachable: payloads are produced by this request's own
                // parser.
                log::error!("payload type mismatch for {:?}", self.core);
            }
        }
    }

    fn deliver_error(&self, error: RequestError) {
        (self.on_error)(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_parser(
    ) -> impl Fn(&NetworkResponse) -> Result<Parsed<()>> + Send + Sync + 'static
    {
        |_raw: &NetworkResponse| Ok(Parsed::new(()))
    }

    #[test]
    fn cache_key_uses_url_for_get_like_methods() {
        let get = Request::new(Method::Get, "http://a/b", noop_parser());
        assert_eq!(get.core.cache_key, "http://a/b");

        let legacy =
            Request::new(Method::LegacyGetOrPost, "http://a/b", noop_parser());
        assert_eq!(legacy.core.cache_key, "http://a/b");

        let post = Request::new(Method::Post, "http://a/b", noop_parser());
        assert_eq!(post.core.cache_key, "POST-http://a/b");
    }

    #[test]
    fn tags_compare_by_identity() {
        let a = Tag::new();
        let b = Tag::new();
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn priorities_order_ascending() {
        assert!(Priority::Immediate > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn header_provider_replaces_static_headers() {
        let request = Request::new(Method::Get, "http://a", noop_parser())
            .header("X-Static", "1")
            .header_provider(|| {
                Ok([("Authorization", "Bearer t")].into_iter().collect())
            });
        let headers = request.core.headers().unwrap();
        assert!(headers.get("X-Static").is_none());
        assert_eq!(headers.get("authorization"), Some("Bearer t"));
    }

    #[test]
    fn finished_flag_flips_once() {
        let request = Request::new(Method::Get, "http://a", noop_parser());
        assert!(request.core.mark_finished());
        assert!(!request.core.mark_finished());
    }
}
