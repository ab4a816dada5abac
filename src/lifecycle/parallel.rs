//! Bounded fan-out of per-host work.
//!
//! Every item becomes its own tokio task; a semaphore sized by the worker
//! limit bounds how many run at once. Failures are collected rather than
//! short-circuited, so siblings always run to completion.

use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::error;

use crate::error::{Error, Result};

/// Run `task` over `items` with at most `limit` in flight.
///
/// Results come back in item order.
pub async fn run_bounded<T, R, F, Fut>(items: Vec<T>, limit: usize, task: F) -> Vec<Result<R>>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let task = Arc::new(task);

    let handles: Vec<_> = items
        .into_iter()
        .map(|item| {
            let semaphore = Arc::clone(&semaphore);
            let task = Arc::clone(&task);
            tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| Error::Other {
                        message: format!("worker pool closed: {e}"),
                        source: None,
                    })?;
                task(item).await
            })
        })
        .collect();

    join_all(handles)
        .await
        .into_iter()
        .map(|joined| {
            joined.unwrap_or_else(|e| {
                error!("Worker task aborted: {e}");
                Err(Error::Other {
                    message: format!("worker task aborted: {e}"),
                    source: None,
                })
            })
        })
        .collect()
}
