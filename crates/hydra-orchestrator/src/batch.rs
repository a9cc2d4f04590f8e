//! Generic semaphore-gated worker pool shared by every phase loop: fetch a
//! capped slice of eligible work, run each item under a concurrency limit,
//! and make every outstanding task abortable so a stop request can cancel
//! mid-flight work instead of waiting for it to drain.

use std::future::Future;
use std::sync::Arc;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use hydra_core::ShutdownSignal;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::AbortHandle;

/// Runs `worker` over `items` with at most `concurrency` running at once.
/// Registers each spawned task's `AbortHandle` in `active_handles` so a
/// concurrent call to `stop()` can cancel it; stops dispatching new work
/// (but still drains what's already running) once `shutdown` fires.
pub async fn run_batch<T, F, Fut>(
    items: Vec<T>,
    concurrency: usize,
    shutdown: &ShutdownSignal,
    active_handles: &Mutex<Vec<AbortHandle>>,
    worker: F,
) where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    if items.is_empty() {
        return;
    }

    {
        let mut guard = active_handles.lock().await;
        guard.retain(|h| !h.is_finished());
    }

    let worker = Arc::new(worker);
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = FuturesUnordered::new();

    for item in items {
        if shutdown.is_shutting_down() {
            break;
        }
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let worker = worker.clone();
        let handle = tokio::spawn(async move {
            let _permit = permit;
            worker(item).await;
        });
        active_handles.lock().await.push(handle.abort_handle());
        tasks.push(handle);
    }

    while let Some(result) = tasks.next().await {
        if let Err(join_err) = result {
            if !join_err.is_cancelled() {
                tracing::warn!(error = %join_err, "batch worker task panicked");
            }
        }
    }
}
