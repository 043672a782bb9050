//! Delivery of parsed responses onto a caller-chosen execution context.

/// A boxed delivery job.
pub type DeliveryJob = Box<dyn FnOnce() + Send>;

/// An execution context for listener callbacks.
///
/// The queue posts every success and error callback through its executor, so
/// callers can marshal deliveries onto an event loop or UI context. The
/// executor must run jobs in submission order for deliveries to a single
/// request to arrive in order.
pub trait Executor: Send + Sync + 'static {
    /// Runs `job` on the target context.
    fn execute(&self, job: DeliveryJob);
}

/// Runs delivery jobs inline on the posting worker.
///
/// This is the default: callbacks fire on whichever pipeline worker produced
/// the response, which keeps ordering trivially correct and suits headless
/// services and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, job: DeliveryJob) {
        job();
    }
}

/// Spawns each delivery job as a task on the current tokio runtime.
///
/// Jobs for one request may interleave with other work but are spawned in
/// posting order. Requires a runtime context at delivery time.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioExecutor;

impl Executor for TokioExecutor {
    fn execute(&self, job: DeliveryJob) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { job() });
            }
            Err(_) => {
                log::warn!(
                    "no tokio runtime at delivery time; running job inline"
                );
                job();
            }
        }
    }
}
