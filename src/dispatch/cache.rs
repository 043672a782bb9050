//! The cache-triage worker.

use std::sync::Arc;

use log::{debug, warn};

use crate::cache::epoch_millis;
use crate::delivery::DeliveryJob;
use crate::queue::{QueueInner, RequestEvent};
use crate::request::{PipelineRequest, RequestState};
use crate::response::NetworkResponse;

/// Drains the cache-triage queue until the queue is stopped. A single
/// worker runs this loop so lookups happen in priority + submission order.
pub(crate) async fn run(queue: Arc<QueueInner>) {
    if let Err(err) = queue.cache.initialize().await {
        warn!("cache initialization failed: {err}");
    }
    while let Some(request) = queue.cache_queue.pop(&queue.running).await {
        triage(&queue, request).await;
    }
    debug!("cache dispatcher stopping");
}

async fn triage(queue: &Arc<QueueInner>, request: Arc<dyn PipelineRequest>) {
    queue.emit(RequestEvent::CacheLookupStarted, &request);
    let core = request.core();
    if core.is_canceled() {
        core.set_state(RequestState::Canceled);
        queue.finish(&request, "cache-discard-canceled");
        queue.emit(RequestEvent::CacheLookupFinished, &request);
        return;
    }

    let key = core.cache_key.clone();
    let entry = match queue.cache.get(&key).await {
        Ok(entry) => entry,
        Err(err) => {
            warn!("cache read failed for {key:?}: {err}");
            None
        }
    };
    // One captured instant for both freshness checks, so coinciding TTLs
    // cannot disagree.
    let now = epoch_millis();

    match entry {
        None => forward_to_network(queue, request.clone()),
        Some(entry) if entry.is_expired(now) => {
            // Keep the validators around for a conditional fetch.
            core.attach_cache_entry(entry);
            forward_to_network(queue, request.clone());
        }
        Some(entry) => {
            let raw = NetworkResponse::from_cache_entry(&entry);
            core.set_state(RequestState::Parsing);
            match request.parse(&raw) {
                Err(err) => {
                    debug!(
                        "cached entry for {key:?} failed to parse: {err}; \
                         invalidating"
                    );
                    if let Err(err) = queue.cache.invalidate(&key, true).await
                    {
                        warn!("cache invalidate failed for {key:?}: {err}");
                    }
                    forward_to_network(queue, request.clone());
                }
                Ok(parsed) if !entry.refresh_needed(now) => {
                    queue.post_response(Arc::clone(&request), parsed, false, None);
                }
                Ok(parsed) => {
                    // Soft-expired: serve the cached value immediately and
                    // refresh from the network once the callback returns.
                    core.attach_cache_entry(entry);
                    let refresh_queue = Arc::clone(queue);
                    let refresh_request = Arc::clone(&request);
                    let refresh: DeliveryJob = Box::new(move || {
                        if !refresh_queue.try_add_follower(&refresh_request) {
                            refresh_queue.enqueue_network(refresh_request);
                        }
                    });
                    queue.post_response(
                        Arc::clone(&request),
                        parsed,
                        true,
                        Some(refresh),
                    );
                }
            }
        }
    }
    queue.emit(RequestEvent::CacheLookupFinished, &request);
}

fn forward_to_network(
    queue: &Arc<QueueInner>,
    request: Arc<dyn PipelineRequest>,
) {
    if !queue.try_add_follower(&request) {
        queue.enqueue_network(request);
    }
}
