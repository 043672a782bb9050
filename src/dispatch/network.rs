//! The network worker pool.

use std::sync::Arc;
use std::time::Instant;

use http::StatusCode;
use log::{debug, warn};

use crate::cache::{epoch_millis, format_http_date};
use crate::error::{RequestError, TransportError};
use crate::header::Headers;
use crate::queue::{LeaderOutcome, QueueInner, RequestEvent};
use crate::request::{PipelineRequest, RequestCore, RequestState};
use crate::response::NetworkResponse;
use crate::stack::TransportRequest;

/// Drains the network queue until the queue is stopped. Several workers run
/// this loop concurrently; retries stay inside the worker that owns the
/// request so they cannot be starved by other queued work.
pub(crate) async fn run(queue: Arc<QueueInner>) {
    while let Some(request) = queue.network_queue.pop(&queue.running).await {
        process(&queue, request).await;
    }
    debug!("network dispatcher stopping");
}

async fn process(queue: &Arc<QueueInner>, request: Arc<dyn PipelineRequest>) {
    queue.emit(RequestEvent::NetworkDispatchStarted, &request);
    let core = request.core();
    if core.is_canceled() {
        core.set_state(RequestState::Canceled);
        queue.finish(&request, "network-discard-cancelled");
        queue.leader_finished(&request, LeaderOutcome::NotUsable);
        queue.emit(RequestEvent::NetworkDispatchFinished, &request);
        return;
    }
    core.set_state(RequestState::NetworkInflight);

    match perform(queue, core).await {
        Ok(None) => {
            // A 304 after the soft-refresh path already delivered the cached
            // response: nothing further for the caller.
            queue.finish(&request, "not-modified");
            queue.leader_finished(&request, LeaderOutcome::NotUsable);
        }
        Ok(Some(raw)) => {
            if core.is_canceled() {
                core.set_state(RequestState::Canceled);
                queue.finish(&request, "network-discard-cancelled");
                queue.leader_finished(&request, LeaderOutcome::NotUsable);
            } else {
                deliver(queue, &request, raw).await;
            }
        }
        Err(error) => {
            queue.post_error(Arc::clone(&request), error);
            queue.leader_finished(&request, LeaderOutcome::NotUsable);
        }
    }
    queue.emit(RequestEvent::NetworkDispatchFinished, &request);
}

async fn deliver(
    queue: &Arc<QueueInner>,
    request: &Arc<dyn PipelineRequest>,
    raw: NetworkResponse,
) {
    let core = request.core();
    let raw = Arc::new(raw);
    core.set_state(RequestState::Parsing);
    match request.parse(&raw) {
        Err(error) => {
            queue.post_error(Arc::clone(request), error);
            queue.leader_finished(request, LeaderOutcome::NotUsable);
        }
        Ok(parsed) => {
            let fresh_entry = parsed.cache_entry.clone();
            if core.should_cache {
                if let Some(entry) = &parsed.cache_entry {
                    if let Err(err) =
                        queue.cache.put(&core.cache_key, entry.clone()).await
                    {
                        warn!(
                            "cache write failed for {:?}: {err}",
                            core.cache_key
                        );
                    }
                }
            }
            core.mark_delivered();
            queue.post_response(Arc::clone(request), parsed, false, None);
            let usable = fresh_entry
                .map(|entry| !entry.is_expired(epoch_millis()))
                .unwrap_or(false);
            let outcome = if usable {
                LeaderOutcome::Usable(raw)
            } else {
                LeaderOutcome::NotUsable
            };
            queue.leader_finished(request, outcome);
        }
    }
}

/// Drives transport attempts for one request, looping through the retry
/// policy. `Ok(None)` reports a 304 whose response was already delivered.
async fn perform(
    queue: &Arc<QueueInner>,
    core: &RequestCore,
) -> Result<Option<NetworkResponse>, RequestError> {
    loop {
        let headers = compose_headers(queue, core)?;
        let body = core.body()?;
        let timeout = core.retry_policy.lock().unwrap().current_timeout();
        let attempt = TransportRequest {
            method: core.method,
            url: &core.url,
            headers,
            body,
            body_content_type: &core.body_content_type,
            timeout,
        };
        let started = Instant::now();
        let result = queue.stack.execute(attempt).await;
        let network_time = started.elapsed();

        let response = match result {
            Ok(response) => response,
            Err(TransportError::Timeout) => {
                attempt_retry(core, RequestError::Timeout, true)?;
                continue;
            }
            Err(err) => {
                let wrapped =
                    RequestError::NoConnection { reason: err.to_string() };
                attempt_retry(core, wrapped, core.retry_connection_errors)?;
                continue;
            }
        };

        let status = response.status;
        let raw = NetworkResponse {
            status,
            headers: response.headers,
            body: response.body,
            not_modified: status == StatusCode::NOT_MODIFIED,
            network_time,
        };

        if status == StatusCode::NOT_MODIFIED {
            if core.has_delivered_response() {
                return Ok(None);
            }
            return Ok(Some(merge_not_modified(core, raw)));
        }
        if status.is_success() {
            return Ok(Some(raw));
        }
        if status == StatusCode::UNAUTHORIZED
            || status == StatusCode::FORBIDDEN
        {
            debug!("auth failure ({status}) for {}", core.url);
            attempt_retry(
                core,
                RequestError::AuthFailure { response: Some(raw) },
                true,
            )?;
            continue;
        }
        if status.is_server_error() {
            attempt_retry(
                core,
                RequestError::Server { response: Some(raw) },
                core.retry_server_errors,
            )?;
            continue;
        }
        if status.is_client_error() {
            return Err(RequestError::Client { response: raw });
        }
        // Remaining 3xx statuses are terminal server-side outcomes.
        return Err(RequestError::Server { response: Some(raw) });
    }
}

/// Records a failed attempt with the retry policy, or surfaces the error
/// when it is not retriable or attempts are exhausted.
fn attempt_retry(
    core: &RequestCore,
    error: RequestError,
    retriable: bool,
) -> Result<(), RequestError> {
    if !retriable {
        return Err(error);
    }
    let mut policy = core.retry_policy.lock().unwrap();
    policy.retry(error)?;
    debug!("retrying {} (retry #{})", core.url, policy.retry_count());
    Ok(())
}

/// Builds the attempt's header list: queue defaults, then the request's own
/// headers (the request wins on collisions), then the conditional
/// revalidation headers from the attached cache entry.
fn compose_headers(
    queue: &Arc<QueueInner>,
    core: &RequestCore,
) -> Result<Headers, RequestError> {
    let request_headers = core.headers()?;
    let mut composed = Headers::new();
    for header in queue.additional_headers.iter() {
        if !request_headers.contains(header.name()) {
            composed.append(header.name(), header.value());
        }
    }
    for header in request_headers.iter() {
        composed.append(header.name(), header.value());
    }
    if let Some(entry) = core.attached_cache_entry() {
        if let Some(etag) = &entry.etag {
            composed.set("If-None-Match", etag.as_str());
        }
        if entry.last_modified > 0 {
            composed
                .set("If-Modified-Since", format_http_date(entry.last_modified));
        }
    }
    Ok(composed)
}

/// Combines a `304 Not Modified` with the cached entry: the body comes from
/// the cache, and cached headers fill in for names the server did not
/// return.
fn merge_not_modified(
    core: &RequestCore,
    raw: NetworkResponse,
) -> NetworkResponse {
    match core.attached_cache_entry() {
        Some(entry) => NetworkResponse {
            status: raw.status,
            headers: Headers::merge_not_modified(
                &raw.headers,
                &entry.response_headers,
            ),
            body: entry.data.clone(),
            not_modified: true,
            network_time: raw.network_time,
        },
        None => raw,
    }
}
