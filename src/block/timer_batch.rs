use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::error::PipeweaveError;
use crate::item::{BlockItem, DoneCallback};
use crate::metrics::BlockMetrics;

use super::batch::{BatchBlock, BatchBlockOptions};
use super::Block;

/// Options accepted by [`TimerBatchBlock::new`].
pub struct TimerBatchBlockOptions<T> {
    pub capacity: usize,
    pub batch_size: usize,
    pub flush_interval: Option<Duration>,
    pub done: DoneCallback<T>,
    pub label: Cow<'static, str>,
}

/// Decorates a [`BatchBlock`] with a periodic tick that flushes partial
/// batches (spec §4.3).
///
/// Two flags coordinate the inner block's size-triggered flushes with the
/// timer's own flushes, so neither re-flushes the other's work:
/// `recently_batched_by_size` is set whenever the inner block just emitted a
/// size-triggered batch (unless a timer flush is in progress, to avoid
/// mislabeling it); on each tick, the timer either clears that flag and
/// skips, or performs its own flush.
pub struct TimerBatchBlock<T> {
    inner: Arc<BatchBlock<T>>,
    timer: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<T> TimerBatchBlock<T>
where
    T: Send + Sync + 'static,
{
    pub fn new(options: TimerBatchBlockOptions<T>) -> Result<Self, PipeweaveError> {
        let recently_batched_by_size = Arc::new(AtomicBool::new(false));
        let timer_flush_in_progress = Arc::new(AtomicBool::new(false));

        let hook_recently_batched = Arc::clone(&recently_batched_by_size);
        let hook_in_progress = Arc::clone(&timer_flush_in_progress);
        let on_size_flush: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
            if !hook_in_progress.load(Ordering::SeqCst) {
                hook_recently_batched.store(true, Ordering::SeqCst);
            }
        });

        let inner = Arc::new(BatchBlock::with_size_hook(
            BatchBlockOptions {
                capacity: options.capacity,
                batch_size: options.batch_size,
                done: options.done,
                label: options.label.clone(),
            },
            Some(on_size_flush),
        )?);

        let timer = options.flush_interval.map(|interval| {
            tokio::spawn(run_timer(
                interval,
                Arc::clone(&inner),
                recently_batched_by_size,
                timer_flush_in_progress,
                options.label,
            ))
        });

        Ok(Self {
            inner,
            timer: tokio::sync::Mutex::new(timer),
        })
    }
}

async fn run_timer<T>(
    interval: Duration,
    inner: Arc<BatchBlock<T>>,
    recently_batched_by_size: Arc<AtomicBool>,
    timer_flush_in_progress: Arc<AtomicBool>,
    label: Cow<'static, str>,
) where
    T: Send + Sync + 'static,
{
    let mut ticker = tokio::time::interval(interval);
    // The first tick fires immediately; that's not a real elapsed interval.
    ticker.tick().await;
    loop {
        ticker.tick().await;

        if recently_batched_by_size.swap(false, Ordering::SeqCst) {
            // A size-triggered batch just happened; don't immediately
            // re-flush an already-emptied buffer (spec §4.3, pathology 1).
            tracing::trace!(block = %label, "timer tick suppressed by recent size batch");
            continue;
        }

        timer_flush_in_progress.store(true, Ordering::SeqCst);
        inner.request_flush().await;
        timer_flush_in_progress.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl<T> Block<T> for TimerBatchBlock<T>
where
    T: Send + Sync + 'static,
{
    async fn send(&self, item: BlockItem<T>) -> Result<(), PipeweaveError> {
        self.inner.send(item).await
    }

    async fn complete(&self) -> Result<(), PipeweaveError> {
        if let Some(timer) = self.timer.lock().await.take() {
            timer.abort();
            let _ = timer.await;
        }
        self.inner.complete().await
    }

    fn metrics(&self) -> &BlockMetrics {
        self.inner.metrics()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn partial_batch_flushes_on_timer() {
        let batches: Arc<StdMutex<Vec<Vec<i32>>>> = Arc::new(StdMutex::new(Vec::new()));
        let batches_2 = Arc::clone(&batches);

        let block = TimerBatchBlock::new(TimerBatchBlockOptions {
            capacity: 10,
            batch_size: 10,
            flush_interval: Some(Duration::from_millis(100)),
            done: DoneCallback::new(move |item: BlockItem<i32>| {
                let batches = Arc::clone(&batches_2);
                async move {
                    batches.lock().unwrap().push(item.into_batch()?);
                    Ok(())
                }
            }),
            label: "test-timer-batch".into(),
        })
        .unwrap();

        block.send(BlockItem::Single(1)).await.unwrap();
        block.send(BlockItem::Single(2)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(batches.lock().unwrap().clone(), vec![vec![1, 2]]);

        block.complete().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn size_triggered_batch_suppresses_the_next_timer_tick() {
        let batches: Arc<StdMutex<Vec<Vec<i32>>>> = Arc::new(StdMutex::new(Vec::new()));
        let batches_2 = Arc::clone(&batches);

        let block = TimerBatchBlock::new(TimerBatchBlockOptions {
            capacity: 10,
            batch_size: 2,
            flush_interval: Some(Duration::from_millis(500)),
            done: DoneCallback::new(move |item: BlockItem<i32>| {
                let batches = Arc::clone(&batches_2);
                async move {
                    batches.lock().unwrap().push(item.into_batch()?);
                    Ok(())
                }
            }),
            label: "test-timer-batch-suppress".into(),
        })
        .unwrap();

        block.send(BlockItem::Single(1)).await.unwrap();
        block.send(BlockItem::Single(2)).await.unwrap();
        block.send(BlockItem::Single(3)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(750)).await;
        assert_eq!(batches.lock().unwrap().clone(), vec![vec![1, 2]]);

        block.complete().await.unwrap();
        assert_eq!(
            batches.lock().unwrap().clone(),
            vec![vec![1, 2], vec![3]]
        );
    }
}
