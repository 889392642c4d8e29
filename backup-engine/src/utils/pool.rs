//! Bounded worker pools used inside pipeline steps.
//!
//! Each call is one structured group: at most `workers` tasks run at once,
//! every task is joined before the call returns, and results come back in
//! input order. Cancellation stops new tasks from starting; tasks already
//! running finish their current unit.

use crate::utils::errors::{EngineError, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Run blocking `f` over `items` on at most `workers` threads
pub async fn map_blocking<T, R, F>(
    workers: usize,
    items: Vec<T>,
    cancel: &CancellationToken,
    f: F,
) -> Result<Vec<R>>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> R + Send + Sync + 'static,
{
    let total = items.len();
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let f = Arc::new(f);
    let mut set = JoinSet::new();

    for (idx, item) in items.into_iter().enumerate() {
        let permit = tokio::select! {
            permit = Arc::clone(&semaphore).acquire_owned() => {
                permit.map_err(|_| EngineError::Cancelled)?
            }
            _ = cancel.cancelled() => break,
        };
        let f = Arc::clone(&f);
        set.spawn_blocking(move || {
            let _permit = permit;
            (idx, f(item))
        });
    }

    collect(set, total, cancel).await
}

/// Run async `f` over `items` with at most `workers` futures in flight
pub async fn map_async<T, R, F, Fut>(
    workers: usize,
    items: Vec<T>,
    cancel: &CancellationToken,
    f: F,
) -> Result<Vec<R>>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
{
    let total = items.len();
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let mut set = JoinSet::new();

    for (idx, item) in items.into_iter().enumerate() {
        let permit = tokio::select! {
            permit = Arc::clone(&semaphore).acquire_owned() => {
                permit.map_err(|_| EngineError::Cancelled)?
            }
            _ = cancel.cancelled() => break,
        };
        let fut = f(item);
        set.spawn(async move {
            let _permit = permit;
            (idx, fut.await)
        });
    }

    collect(set, total, cancel).await
}

async fn collect<R: Send + 'static>(
    mut set: JoinSet<(usize, R)>,
    total: usize,
    cancel: &CancellationToken,
) -> Result<Vec<R>> {
    let mut slots: Vec<Option<R>> = (0..total).map(|_| None).collect();
    while let Some(joined) = set.join_next().await {
        let (idx, result) = joined?;
        slots[idx] = Some(result);
    }

    if cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
    }
    Ok(slots.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_results_keep_input_order() -> Result<()> {
        let cancel = CancellationToken::new();
        let out = map_blocking(3, (0..20u64).collect(), &cancel, |n| {
            std::thread::sleep(std::time::Duration::from_millis(20 - n));
            n * 2
        })
        .await?;
        assert_eq!(out, (0..20u64).map(|n| n * 2).collect::<Vec<_>>());
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() -> Result<()> {
        let cancel = CancellationToken::new();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (a, p) = (Arc::clone(&active), Arc::clone(&peak));

        map_async(2, (0..8).collect::<Vec<u32>>(), &cancel, move |_| {
            let (a, p) = (Arc::clone(&a), Arc::clone(&p));
            async move {
                let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                a.fetch_sub(1, Ordering::SeqCst);
            }
        })
        .await?;

        assert!(peak.load(Ordering::SeqCst) <= 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_group_reports_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = map_blocking(2, vec![1, 2, 3], &cancel, |n| n).await;
        assert!(matches!(result, Err(EngineError::Cancelled)));
    }
}
