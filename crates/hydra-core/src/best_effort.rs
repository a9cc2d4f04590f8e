//! Explicit ignore-with-logging helper for call sites where failure is
//! expected and recovery is a no-op.

use std::fmt::Display;

/// Runs `op`; on `Err`, logs at `warn` with `context` and swallows it.
/// Use at call sites where failure is expected and recovery is a no-op —
/// e.g. deleting a branch that may not exist, aborting a merge that may
/// not be in progress.
pub fn best_effort<T, E: Display>(context: &str, op: impl FnOnce() -> Result<T, E>) -> Option<T> {
    match op() {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(context, error = %e, "best-effort operation failed, continuing");
            None
        }
    }
}

/// Async counterpart of [`best_effort`].
pub async fn best_effort_async<T, E, F>(context: &str, op: F) -> Option<T>
where
    E: Display,
    F: std::future::Future<Output = Result<T, E>>,
{
    match op.await {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(context, error = %e, "best-effort operation failed, continuing");
            None
        }
    }
}
