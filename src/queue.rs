//! The request queue: ingest, sequencing, tracking, cancellation scopes,
//! worker lifecycle, and in-flight coalescing.

use std::collections::hash_map::Entry;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::cache::Cache;
use crate::delivery::{DeliveryJob, Executor, InlineExecutor};
use crate::dispatch;
use crate::error::RequestError;
use crate::header::Headers;
use crate::request::{
    Method, PipelineRequest, Priority, Request, RequestHandle, RequestState,
    Tag,
};
use crate::response::{ErasedParsed, NetworkResponse};
use crate::stack::HttpStack;

/// Observation points fired as a request moves through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestEvent {
    /// The request was accepted by [`RequestQueue::add`].
    Queued,
    /// The cache leg picked the request up.
    CacheLookupStarted,
    /// The cache leg is done with the request.
    CacheLookupFinished,
    /// A network worker picked the request up.
    NetworkDispatchStarted,
    /// The network worker is done with the request.
    NetworkDispatchFinished,
    /// The request reached a terminal state.
    Finished,
}

/// Callback fired for every [`RequestEvent`].
pub type RequestEventListener =
    Arc<dyn Fn(RequestEvent, &RequestHandle) + Send + Sync>;

/// Callback fired once per request when it reaches a terminal state.
pub type RequestFinishedListener = Arc<dyn Fn(&RequestHandle) + Send + Sync>;

/// Configuration for a [`RequestQueue`].
#[derive(Clone)]
pub struct QueueConfig {
    /// Number of network workers. Defaults to 4.
    pub network_pool_size: usize,
    /// Headers sent with every request, overridden by request headers on
    /// name collisions.
    pub additional_headers: Headers,
    /// Execution context for listener callbacks.
    pub executor: Arc<dyn Executor>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            network_pool_size: 4,
            additional_headers: Headers::new(),
            executor: Arc::new(InlineExecutor),
        }
    }
}

impl fmt::Debug for QueueConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueConfig")
            .field("network_pool_size", &self.network_pool_size)
            .field("additional_headers", &self.additional_headers)
            .field("executor", &"dyn Executor")
            .finish()
    }
}

/// A priority + submission-order entry in a dispatch queue.
struct PendingEntry {
    priority: Priority,
    sequence: u64,
    request: Arc<dyn PipelineRequest>,
}

impl PartialEq for PendingEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for PendingEntry {}

impl PartialOrd for PendingEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority first, then earlier submission.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// A priority-ordered FIFO drained by one or more workers.
pub(crate) struct DispatchQueue {
    heap: Mutex<BinaryHeap<PendingEntry>>,
    notify: Notify,
}

impl DispatchQueue {
    fn new() -> Self {
        Self { heap: Mutex::new(BinaryHeap::new()), notify: Notify::new() }
    }

    fn push(&self, request: Arc<dyn PipelineRequest>) {
        let core = request.core();
        let entry = PendingEntry {
            priority: core.priority,
            sequence: core.sequence(),
            request,
        };
        self.heap.lock().unwrap().push(entry);
        self.notify.notify_one();
    }

    /// Pops the highest-priority request, waiting for one to arrive.
    /// Returns `None` once the queue has been stopped.
    pub(crate) async fn pop(
        &self,
        running: &AtomicBool,
    ) -> Option<Arc<dyn PipelineRequest>> {
        loop {
            if !running.load(Ordering::Acquire) {
                return None;
            }
            let notified = self.notify.notified();
            if let Some(entry) = self.heap.lock().unwrap().pop() {
                return Some(entry.request);
            }
            notified.await;
        }
    }

    fn wake_all(&self) {
        self.notify.notify_waiters();
    }
}

/// Outcome the network leg reports for a coalescing leader.
pub(crate) enum LeaderOutcome {
    /// The fetch produced a cacheable, unexpired entry; followers can be
    /// served from the shared raw response.
    Usable(Arc<NetworkResponse>),
    /// No usable result (error, cancellation, or an uncacheable response);
    /// the next follower must fetch for itself.
    NotUsable,
}

/// State shared between the public queue handle and its workers.
pub(crate) struct QueueInner {
    pub(crate) cache: Arc<dyn Cache>,
    pub(crate) stack: Arc<dyn HttpStack>,
    pub(crate) executor: Arc<dyn Executor>,
    pub(crate) additional_headers: Headers,
    pub(crate) cache_queue: DispatchQueue,
    pub(crate) network_queue: DispatchQueue,
    pub(crate) running: AtomicBool,
    sequence: AtomicU64,
    tracked: Mutex<Vec<Arc<dyn PipelineRequest>>>,
    waiting: Mutex<HashMap<String, Vec<Arc<dyn PipelineRequest>>>>,
    event_listeners: Mutex<Vec<RequestEventListener>>,
    finished_listeners: Mutex<Vec<RequestFinishedListener>>,
}

impl QueueInner {
    pub(crate) fn emit(
        &self,
        event: RequestEvent,
        request: &Arc<dyn PipelineRequest>,
    ) {
        let listeners = self.event_listeners.lock().unwrap().clone();
        if listeners.is_empty() {
            return;
        }
        let handle = request.handle();
        for listener in listeners {
            listener(event, &handle);
        }
    }

    /// Marks a request terminal. Exactly one call wins regardless of which
    /// path (delivery, error, cancellation) reaches it first.
    pub(crate) fn finish(
        &self,
        request: &Arc<dyn PipelineRequest>,
        reason: &str,
    ) {
        let core = request.core();
        if !core.mark_finished() {
            return;
        }
        debug!("request {} finished: {reason}", core.sequence());
        self.tracked.lock().unwrap().retain(|r| !Arc::ptr_eq(r, request));
        self.emit(RequestEvent::Finished, request);
        let listeners = self.finished_listeners.lock().unwrap().clone();
        let handle = request.handle();
        for listener in listeners {
            listener(&handle);
        }
    }

    pub(crate) fn enqueue_cache(&self, request: Arc<dyn PipelineRequest>) {
        request.core().set_state(RequestState::CacheTriage);
        self.cache_queue.push(request);
    }

    pub(crate) fn enqueue_network(&self, request: Arc<dyn PipelineRequest>) {
        request.core().set_state(RequestState::NetworkPending);
        self.network_queue.push(request);
    }

    /// Posts a parsed response to the delivery context. The cancel check
    /// happens on that context, immediately before the listener runs; a
    /// canceled request is finished without a callback. `then` runs after
    /// the listener returns and is skipped on cancellation.
    pub(crate) fn post_response(
        self: &Arc<Self>,
        request: Arc<dyn PipelineRequest>,
        payload: ErasedParsed,
        intermediate: bool,
        then: Option<DeliveryJob>,
    ) {
        let queue = Arc::clone(self);
        self.executor.execute(Box::new(move || {
            let core = request.core();
            if core.is_canceled() {
                core.set_state(RequestState::Canceled);
                queue.finish(&request, "canceled-at-delivery");
                return;
            }
            core.mark_delivered();
            request.deliver(payload, intermediate);
            if intermediate {
                debug!(
                    "intermediate response delivered for {}",
                    core.sequence()
                );
            } else {
                core.set_state(RequestState::Delivered);
                queue.finish(&request, "done");
            }
            if let Some(job) = then {
                job();
            }
        }));
    }

    /// Posts an error to the delivery context, with the same cancel
    /// handling as [`post_response`](Self::post_response).
    pub(crate) fn post_error(
        self: &Arc<Self>,
        request: Arc<dyn PipelineRequest>,
        error: RequestError,
    ) {
        let queue = Arc::clone(self);
        self.executor.execute(Box::new(move || {
            let core = request.core();
            if core.is_canceled() {
                core.set_state(RequestState::Canceled);
                queue.finish(&request, "canceled-at-delivery");
                return;
            }
            core.set_state(RequestState::Failed);
            request.deliver_error(error);
            queue.finish(&request, "error");
        }));
    }

    /// Attaches `request` behind an in-flight leader for the same cache
    /// key. Returns `false` when no leader exists — the request becomes the
    /// leader and must proceed to the network itself.
    pub(crate) fn try_add_follower(
        &self,
        request: &Arc<dyn PipelineRequest>,
    ) -> bool {
        let core = request.core();
        let mut waiting = self.waiting.lock().unwrap();
        match waiting.entry(core.cache_key.clone()) {
            Entry::Occupied(mut slot) => {
                slot.get_mut().push(Arc::clone(request));
                core.set_state(RequestState::AwaitingLeader);
                debug!(
                    "request {} waiting on in-flight fetch for {:?}",
                    core.sequence(),
                    core.cache_key
                );
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(Vec::new());
                core.set_coalescing_leader();
                false
            }
        }
    }

    /// Settles the followers parked behind a finished leader: serves them
    /// from the shared response when it is usable, otherwise promotes the
    /// first live follower to a fresh leader.
    pub(crate) fn leader_finished(
        self: &Arc<Self>,
        request: &Arc<dyn PipelineRequest>,
        outcome: LeaderOutcome,
    ) {
        let core = request.core();
        if !core.is_coalescing_leader() {
            return;
        }
        let key = &core.cache_key;
        match outcome {
            LeaderOutcome::Usable(response) => {
                let followers = self
                    .waiting
                    .lock()
                    .unwrap()
                    .remove(key)
                    .unwrap_or_default();
                for follower in followers {
                    if follower.core().is_canceled() {
                        follower.core().set_state(RequestState::Canceled);
                        self.finish(&follower, "canceled-follower");
                        continue;
                    }
                    match follower.parse(&response) {
                        Ok(parsed) => {
                            self.post_response(follower, parsed, false, None);
                        }
                        Err(err) => self.post_error(follower, err),
                    }
                }
            }
            LeaderOutcome::NotUsable => {
                let (stale, promoted) = {
                    let mut waiting = self.waiting.lock().unwrap();
                    let mut followers =
                        waiting.remove(key).unwrap_or_default();
                    let mut stale = Vec::new();
                    let mut promoted = None;
                    while !followers.is_empty() {
                        let candidate = followers.remove(0);
                        if candidate.core().is_canceled() {
                            stale.push(candidate);
                        } else {
                            promoted = Some(candidate);
                            break;
                        }
                    }
                    if let Some(leader) = &promoted {
                        leader.core().set_coalescing_leader();
                        waiting.insert(key.clone(), followers);
                    }
                    (stale, promoted)
                };
                for follower in stale {
                    follower.core().set_state(RequestState::Canceled);
                    self.finish(&follower, "canceled-follower");
                }
                if let Some(leader) = promoted {
                    debug!(
                        "promoting request {} to leader for {:?}",
                        leader.core().sequence(),
                        key
                    );
                    self.enqueue_network(leader);
                }
            }
        }
    }
}

/// The request dispatch pipeline.
///
/// A queue owns a [`Cache`], an [`HttpStack`], one cache-triage worker, and
/// a pool of network workers. Submit work with [`add`](Self::add), scope
/// cancellation with [`Tag`]s, and control the workers with
/// [`start`](Self::start) / [`stop`](Self::stop).
pub struct RequestQueue {
    inner: Arc<QueueInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    pool_size: usize,
}

impl fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestQueue")
            .field("network_pool_size", &self.pool_size)
            .field(
                "running",
                &self.inner.running.load(Ordering::Relaxed),
            )
            .finish()
    }
}

impl RequestQueue {
    /// Creates a queue with the default configuration.
    pub fn new(cache: Arc<dyn Cache>, stack: Arc<dyn HttpStack>) -> Self {
        Self::with_config(cache, stack, QueueConfig::default())
    }

    /// Creates a queue with an explicit configuration.
    pub fn with_config(
        cache: Arc<dyn Cache>,
        stack: Arc<dyn HttpStack>,
        config: QueueConfig,
    ) -> Self {
        let pool_size = config.network_pool_size.max(1);
        Self {
            inner: Arc::new(QueueInner {
                cache,
                stack,
                executor: config.executor,
                additional_headers: config.additional_headers,
                cache_queue: DispatchQueue::new(),
                network_queue: DispatchQueue::new(),
                running: AtomicBool::new(false),
                sequence: AtomicU64::new(0),
                tracked: Mutex::new(Vec::new()),
                waiting: Mutex::new(HashMap::new()),
                event_listeners: Mutex::new(Vec::new()),
                finished_listeners: Mutex::new(Vec::new()),
            }),
            workers: Mutex::new(Vec::new()),
            pool_size,
        }
    }

    /// Starts the workers. Must be called from within a tokio runtime. Any
    /// previously running workers are stopped first.
    pub fn start(&self) {
        self.stop();
        self.inner.running.store(true, Ordering::Release);
        let mut workers = self.workers.lock().unwrap();
        workers.push(tokio::spawn(dispatch::cache::run(Arc::clone(
            &self.inner,
        ))));
        for _ in 0..self.pool_size {
            workers.push(tokio::spawn(dispatch::network::run(Arc::clone(
                &self.inner,
            ))));
        }
    }

    /// Stops the workers. In-flight transport calls are abandoned at their
    /// next await point; queued requests stay queued and resume if the
    /// queue is started again. Idempotent.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::Release);
        self.inner.cache_queue.wake_all();
        self.inner.network_queue.wake_all();
        for handle in self.workers.lock().unwrap().drain(..) {
            handle.abort();
        }
    }

    /// Submits a request to the pipeline. Never blocks; safe from any
    /// thread. Returns a handle usable to cancel or observe the request.
    pub fn add<T: Send + 'static>(&self, request: Request<T>) -> RequestHandle {
        let erased = request.into_erased();
        let core = erased.core();
        core.assign_sequence(self.inner.sequence.fetch_add(1, Ordering::AcqRel));
        self.inner.tracked.lock().unwrap().push(Arc::clone(&erased));
        self.inner.emit(RequestEvent::Queued, &erased);
        if core.should_cache
            && matches!(core.method, Method::Get | Method::LegacyGetOrPost)
        {
            self.inner.enqueue_cache(Arc::clone(&erased));
        } else {
            self.inner.enqueue_network(Arc::clone(&erased));
        }
        erased.handle()
    }

    /// Cancels every tracked request carrying a clone of `tag`. Canceled
    /// requests finish their pipeline work but invoke no listener.
    pub fn cancel_all(&self, tag: &Tag) {
        self.cancel_all_matching(|handle| handle.tag() == Some(tag));
    }

    /// Cancels every tracked request the filter selects.
    pub fn cancel_all_matching(
        &self,
        filter: impl Fn(&RequestHandle) -> bool,
    ) {
        let tracked = self.inner.tracked.lock().unwrap().clone();
        let mut canceled = 0usize;
        for request in tracked {
            let handle = request.handle();
            if filter(&handle) {
                handle.cancel();
                canceled += 1;
            }
        }
        debug!("cancel_all marked {canceled} requests");
    }

    /// Registers an observer for request lifecycle events.
    pub fn add_request_event_listener(&self, listener: RequestEventListener) {
        self.inner.event_listeners.lock().unwrap().push(listener);
    }

    /// Registers an observer fired once per request at its terminal state.
    pub fn add_request_finished_listener(
        &self,
        listener: RequestFinishedListener,
    ) {
        self.inner.finished_listeners.lock().unwrap().push(listener);
    }
}

impl Drop for RequestQueue {
    fn drop(&mut self) {
        self.stop();
        if !self.inner.tracked.lock().unwrap().is_empty() {
            warn!("request queue dropped with requests still tracked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::response::Parsed;

    fn entry_for(priority: Priority, sequence: u64) -> PendingEntry {
        let request = Request::new(
            Method::Get,
            format!("http://example.com/{sequence}"),
            |_raw: &NetworkResponse| -> Result<Parsed<()>> {
                Ok(Parsed::new(()))
            },
        )
        .priority(priority)
        .into_erased();
        request.core().assign_sequence(sequence);
        PendingEntry { priority, sequence, request }
    }

    #[test]
    fn heap_orders_by_priority_then_sequence() {
        let mut heap = BinaryHeap::new();
        heap.push(entry_for(Priority::Low, 0));
        heap.push(entry_for(Priority::High, 3));
        heap.push(entry_for(Priority::Normal, 1));
        heap.push(entry_for(Priority::High, 2));
        heap.push(entry_for(Priority::Immediate, 4));

        let order: Vec<u64> =
            std::iter::from_fn(|| heap.pop().map(|e| e.sequence)).collect();
        assert_eq!(order, vec![4, 2, 3, 1, 0]);
    }
}
