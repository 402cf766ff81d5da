use std::borrow::Cow;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::PipeweaveError;
use crate::item::{BlockAction, BlockItem, DoneCallback};
use crate::metrics::{BlockMetrics, MetricsGuard, Phase};

use super::Block;

/// Options accepted by [`ActionBlock::new`] (spec §4.1 "Parameters").
pub struct ActionBlockOptions<T> {
    pub capacity: usize,
    pub parallelism: usize,
    pub action: BlockAction<T>,
    pub done: Option<DoneCallback<T>>,
    pub cancellation: Option<CancellationToken>,
    pub label: Cow<'static, str>,
}

/// Bounded queue + N parallel workers running a per-item function (spec
/// §4.1). The hard part lives in the error policy: once a worker's action
/// or `done` callback fails, the block records the *first* such error and
/// every subsequent item is drained (to keep producers from deadlocking
/// against a full channel) without ever reaching the user action again.
pub struct ActionBlock<T> {
    metrics: Arc<BlockMetrics>,
    tx: AsyncMutex<Option<mpsc::Sender<BlockItem<T>>>>,
    workers: AsyncMutex<Vec<JoinHandle<()>>>,
    first_error: Arc<Mutex<Option<PipeweaveError>>>,
    label: Cow<'static, str>,
}

impl<T> ActionBlock<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(options: ActionBlockOptions<T>) -> Result<Self, PipeweaveError> {
        if options.capacity == 0 {
            return Err(PipeweaveError::InvalidConfig(
                "ActionBlock capacity must be >= 1".into(),
            ));
        }
        if options.parallelism == 0 {
            return Err(PipeweaveError::InvalidConfig(
                "ActionBlock parallelism must be >= 1".into(),
            ));
        }

        let metrics = Arc::new(BlockMetrics::new(options.label.clone()));
        let (tx, rx) = mpsc::channel(options.capacity);
        let rx = Arc::new(AsyncMutex::new(rx));
        let first_error: Arc<Mutex<Option<PipeweaveError>>> = Arc::new(Mutex::new(None));
        let done = options.done.unwrap_or_else(DoneCallback::noop);

        let mut workers = Vec::with_capacity(options.parallelism);
        for worker_id in 0..options.parallelism {
            let rx = Arc::clone(&rx);
            let metrics = Arc::clone(&metrics);
            let first_error = Arc::clone(&first_error);
            let action = options.action.clone();
            let done = done.clone();
            let cancellation = options.cancellation.clone();
            let label = options.label.clone();

            workers.push(tokio::spawn(async move {
                run_worker(
                    worker_id,
                    rx,
                    metrics,
                    first_error,
                    action,
                    done,
                    cancellation,
                    label,
                )
                .await;
            }));
        }

        Ok(Self {
            metrics,
            tx: AsyncMutex::new(Some(tx)),
            workers: AsyncMutex::new(workers),
            first_error,
            label: options.label,
        })
    }
}

async fn run_worker<T>(
    worker_id: usize,
    rx: Arc<AsyncMutex<mpsc::Receiver<BlockItem<T>>>>,
    metrics: Arc<BlockMetrics>,
    first_error: Arc<Mutex<Option<PipeweaveError>>>,
    action: BlockAction<T>,
    done: DoneCallback<T>,
    cancellation: Option<CancellationToken>,
    label: Cow<'static, str>,
) where
    T: Clone + Send + Sync + 'static,
{
    loop {
        let item = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(item) = item else {
            break;
        };
        metrics.decr_input();

        if first_error.lock().unwrap().is_some() {
            // A prior worker already failed: keep draining to release
            // backpressure, but never touch the user action again
            // (spec §4.1 "Error policy").
            tracing::trace!(block = %label, worker_id, "dropping item after prior failure");
            continue;
        }

        let _working = MetricsGuard::enter(&metrics, Phase::Working);
        match action.call(item.clone()).await {
            Ok(()) => {
                let cancelled = cancellation
                    .as_ref()
                    .map(CancellationToken::is_cancelled)
                    .unwrap_or(false);
                if cancelled {
                    tracing::trace!(block = %label, worker_id, "cancelled: skipping done");
                    continue;
                }
                let _output = MetricsGuard::enter(&metrics, Phase::Output);
                if let Err(e) = done.call(item).await {
                    tracing::warn!(block = %label, worker_id, error = %e, "done callback failed");
                    *first_error.lock().unwrap() = Some(e);
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(block = %label, worker_id, error = %e, "action failed");
                *first_error.lock().unwrap() = Some(e);
                break;
            }
        }
    }
    tracing::debug!(block = %label, worker_id, "worker exiting");
}

#[async_trait]
impl<T> Block<T> for ActionBlock<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn send(&self, item: BlockItem<T>) -> Result<(), PipeweaveError> {
        let tx = {
            let guard = self.tx.lock().await;
            guard.clone()
        };
        match tx {
            Some(tx) => {
                self.metrics.incr_input();
                if tx.send(item).await.is_err() {
                    self.metrics.decr_input();
                }
                Ok(())
            }
            None => Err(PipeweaveError::InvalidConfig(format!(
                "ActionBlock `{}` is already completing; cannot accept new items",
                self.label
            ))),
        }
    }

    async fn complete(&self) -> Result<(), PipeweaveError> {
        // Drop the sender to close intake, then await every worker.
        self.tx.lock().await.take();

        let workers = self.workers.lock().await.drain(..).collect::<Vec<_>>();
        for worker in workers {
            // A task-cancelled join error is not a user failure (spec §4.8
            // "A task-cancelled error is converted to a successful
            // completion").
            let _ = worker.await;
        }

        match self.first_error.lock().unwrap().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn metrics(&self) -> &BlockMetrics {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn single_item_runs_action_and_done_exactly_once() {
        let action_calls = Arc::new(AtomicI32::new(0));
        let done_calls = Arc::new(AtomicI32::new(0));

        let action_calls_2 = Arc::clone(&action_calls);
        let done_calls_2 = Arc::clone(&done_calls);

        let block = ActionBlock::new(ActionBlockOptions {
            capacity: 1,
            parallelism: 1,
            action: BlockAction::from_async_fn(move |n: i32| {
                let action_calls = Arc::clone(&action_calls_2);
                async move {
                    assert_eq!(n, 42);
                    action_calls.fetch_add(1, Ordering::SeqCst);
                }
            }),
            done: Some(DoneCallback::new(move |item: BlockItem<i32>| {
                let done_calls = Arc::clone(&done_calls_2);
                async move {
                    assert_eq!(item.into_single()?, 42);
                    done_calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })),
            cancellation: None,
            label: "test-action".into(),
        })
        .unwrap();

        block.send(BlockItem::Single(42)).await.unwrap();
        block.complete().await.unwrap();

        assert_eq!(action_calls.load(Ordering::SeqCst), 1);
        assert_eq!(done_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallelism_runs_items_concurrently() {
        let processed = Arc::new(AtomicUsize::new(0));
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_concurrent = Arc::new(AtomicUsize::new(0));

        let processed_2 = Arc::clone(&processed);
        let concurrent_2 = Arc::clone(&concurrent);
        let max_concurrent_2 = Arc::clone(&max_concurrent);

        let block = ActionBlock::new(ActionBlockOptions {
            capacity: 10,
            parallelism: 3,
            action: BlockAction::from_async_fn(move |_: i32| {
                let processed = Arc::clone(&processed_2);
                let concurrent = Arc::clone(&concurrent_2);
                let max_concurrent = Arc::clone(&max_concurrent_2);
                async move {
                    let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                    max_concurrent.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                    processed.fetch_add(1, Ordering::SeqCst);
                }
            }),
            done: None,
            cancellation: None,
            label: "test-parallelism".into(),
        })
        .unwrap();

        for i in 0..5 {
            block.send(BlockItem::Single(i)).await.unwrap();
        }
        block.complete().await.unwrap();

        assert_eq!(processed.load(Ordering::SeqCst), 5);
        let max = max_concurrent.load(Ordering::SeqCst);
        assert!((2..=3).contains(&max), "max observed concurrency was {max}");
    }

    #[tokio::test]
    async fn items_after_first_failure_never_reach_the_action() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_2 = Arc::clone(&seen);

        let block = ActionBlock::new(ActionBlockOptions {
            capacity: 10,
            parallelism: 1,
            action: BlockAction::from_async_fn(move |n: i32| {
                let seen = Arc::clone(&seen_2);
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    if n == 1 {
                        // Surface as a done failure since `from_async_fn`'s
                        // future is infallible; `done` is where we inject it.
                    }
                }
            }),
            done: Some(DoneCallback::new(move |item: BlockItem<i32>| async move {
                let n = item.into_single()?;
                if n == 1 {
                    Err(PipeweaveError::user_action_msg("boom"))
                } else {
                    Ok(())
                }
            })),
            cancellation: None,
            label: "test-error-policy-2".into(),
        })
        .unwrap();

        block.send(BlockItem::Single(1)).await.unwrap();
        block.send(BlockItem::Single(2)).await.unwrap();
        block.send(BlockItem::Single(3)).await.unwrap();
        let result = block.complete().await;

        assert!(result.is_err());
        // Item 1 always reaches the action; items 2 and 3 race with the
        // failure but are capped at 3 total (items are never handed to the
        // action twice).
        assert!(seen.load(Ordering::SeqCst) <= 3);
    }
}
