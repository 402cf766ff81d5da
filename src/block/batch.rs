use std::borrow::Cow;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::error::PipeweaveError;
use crate::item::{BlockItem, DoneCallback};
use crate::metrics::{BlockMetrics, MetricsGuard, Phase};

use super::Block;

/// Options accepted by [`BatchBlock::new`].
pub struct BatchBlockOptions<T> {
    pub capacity: usize,
    pub batch_size: usize,
    pub done: DoneCallback<T>,
    pub label: Cow<'static, str>,
}

/// Bounded queue + single aggregator producing size-triggered batches (spec
/// §4.2). There is no worker pool here: `done` runs synchronously on the
/// one consumer task, so parallelism across batches — if wanted — has to be
/// layered on top (see [`BatchActionBlock`](super::BatchActionBlock)).
///
/// [`TimerBatchBlock`](super::TimerBatchBlock) decorates this block by
/// feeding flush requests into [`BatchBlock::request_flush`], which this
/// block's single consumer task serves alongside its normal intake without
/// any extra synchronization on the batch buffer (the buffer only ever
/// lives on that one task).
pub struct BatchBlock<T> {
    metrics: Arc<BlockMetrics>,
    tx: AsyncMutex<Option<mpsc::Sender<BlockItem<T>>>>,
    flush_tx: mpsc::Sender<oneshot::Sender<()>>,
    consumer: AsyncMutex<Option<JoinHandle<()>>>,
    first_error: Arc<Mutex<Option<PipeweaveError>>>,
    label: Cow<'static, str>,
}

impl<T> BatchBlock<T>
where
    T: Send + Sync + 'static,
{
    pub fn new(options: BatchBlockOptions<T>) -> Result<Self, PipeweaveError> {
        Self::with_size_hook(options, None)
    }

    /// Used internally by [`TimerBatchBlock`](super::TimerBatchBlock), which
    /// needs to know exactly when a *size*-triggered batch fires, to keep
    /// its `recentlyBatchedBySize` flag accurate (spec §4.3).
    pub(crate) fn with_size_hook(
        options: BatchBlockOptions<T>,
        on_size_flush: Option<Arc<dyn Fn() + Send + Sync>>,
    ) -> Result<Self, PipeweaveError> {
        if options.capacity == 0 {
            return Err(PipeweaveError::InvalidConfig(
                "BatchBlock capacity must be >= 1".into(),
            ));
        }
        if options.batch_size == 0 {
            return Err(PipeweaveError::InvalidConfig(
                "BatchBlock batch_size must be >= 1".into(),
            ));
        }

        let metrics = Arc::new(BlockMetrics::new(options.label.clone()));
        let (tx, rx) = mpsc::channel(options.capacity);
        let (flush_tx, flush_rx) = mpsc::channel(1);
        let first_error: Arc<Mutex<Option<PipeweaveError>>> = Arc::new(Mutex::new(None));

        let consumer = tokio::spawn(run_consumer(
            rx,
            flush_rx,
            options.batch_size,
            options.done,
            Arc::clone(&metrics),
            Arc::clone(&first_error),
            on_size_flush,
            options.label.clone(),
        ));

        Ok(Self {
            metrics,
            tx: AsyncMutex::new(Some(tx)),
            flush_tx,
            consumer: AsyncMutex::new(Some(consumer)),
            first_error,
            label: options.label,
        })
    }

    /// Asks the consumer task to emit whatever partial batch it's holding,
    /// and waits until it has done so. A no-op if the buffer is empty.
    pub(crate) async fn request_flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.flush_tx.send(ack_tx).await.is_ok() {
            let _ = ack_rx.await;
        }
    }
}

async fn run_consumer<T>(
    mut rx: mpsc::Receiver<BlockItem<T>>,
    mut flush_rx: mpsc::Receiver<oneshot::Sender<()>>,
    batch_size: usize,
    done: DoneCallback<T>,
    metrics: Arc<BlockMetrics>,
    first_error: Arc<Mutex<Option<PipeweaveError>>>,
    on_size_flush: Option<Arc<dyn Fn() + Send + Sync>>,
    label: Cow<'static, str>,
) where
    T: Send + Sync + 'static,
{
    let mut buffer: Vec<T> = Vec::with_capacity(batch_size);
    let mut flush_channel_open = true;

    loop {
        if flush_channel_open {
            tokio::select! {
                item = rx.recv() => {
                    match item {
                        None => break,
                        Some(item) => {
                            handle_item(item, &mut buffer, batch_size, &done, &metrics, &first_error, &on_size_flush, &label).await;
                        }
                    }
                }
                req = flush_rx.recv() => {
                    match req {
                        None => flush_channel_open = false,
                        Some(ack) => {
                            force_flush(&mut buffer, &done, &metrics, &first_error, &label).await;
                            let _ = ack.send(());
                        }
                    }
                }
            }
        } else {
            match rx.recv().await {
                None => break,
                Some(item) => {
                    handle_item(
                        item,
                        &mut buffer,
                        batch_size,
                        &done,
                        &metrics,
                        &first_error,
                        &on_size_flush,
                        &label,
                    )
                    .await;
                }
            }
        }
    }

    // Final partial batch on drain (spec §4.2 "emit any remaining partial
    // batch (if non-empty)").
    force_flush(&mut buffer, &done, &metrics, &first_error, &label).await;
    tracing::debug!(block = %label, "batch consumer exiting");
}

async fn handle_item<T>(
    item: BlockItem<T>,
    buffer: &mut Vec<T>,
    batch_size: usize,
    done: &DoneCallback<T>,
    metrics: &Arc<BlockMetrics>,
    first_error: &Arc<Mutex<Option<PipeweaveError>>>,
    on_size_flush: &Option<Arc<dyn Fn() + Send + Sync>>,
    label: &Cow<'static, str>,
) where
    T: Send + Sync + 'static,
{
    metrics.decr_input();
    for value in item.into_values() {
        buffer.push(value);
        if buffer.len() >= batch_size {
            let batch = std::mem::replace(buffer, Vec::with_capacity(batch_size));
            emit_batch(batch, done, metrics, first_error, label).await;
            if let Some(hook) = on_size_flush {
                (hook.as_ref())();
            }
        }
    }
}

async fn force_flush<T>(
    buffer: &mut Vec<T>,
    done: &DoneCallback<T>,
    metrics: &Arc<BlockMetrics>,
    first_error: &Arc<Mutex<Option<PipeweaveError>>>,
    label: &Cow<'static, str>,
) where
    T: Send + Sync + 'static,
{
    if buffer.is_empty() {
        return;
    }
    let batch = std::mem::take(buffer);
    emit_batch(batch, done, metrics, first_error, label).await;
}

async fn emit_batch<T>(
    batch: Vec<T>,
    done: &DoneCallback<T>,
    metrics: &Arc<BlockMetrics>,
    first_error: &Arc<Mutex<Option<PipeweaveError>>>,
    label: &Cow<'static, str>,
) where
    T: Send + Sync + 'static,
{
    if first_error.lock().unwrap().is_some() {
        return;
    }
    let _working = MetricsGuard::enter(metrics, Phase::Working);
    let _output = MetricsGuard::enter(metrics, Phase::Output);
    if let Err(e) = done.call(BlockItem::batch(batch)).await {
        tracing::warn!(block = %label, error = %e, "batch done callback failed");
        *first_error.lock().unwrap() = Some(e);
    }
}

#[async_trait]
impl<T> Block<T> for BatchBlock<T>
where
    T: Send + Sync + 'static,
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
                "BatchBlock `{}` is already completing; cannot accept new items",
                self.label
            ))),
        }
    }

    async fn complete(&self) -> Result<(), PipeweaveError> {
        self.tx.lock().await.take();

        if let Some(consumer) = self.consumer.lock().await.take() {
            let _ = consumer.await;
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
    use std::sync::Mutex as StdMutex;

    use super::*;

    #[tokio::test]
    async fn size_triggered_batches_and_final_partial_batch() {
        let batches: Arc<StdMutex<Vec<Vec<i32>>>> = Arc::new(StdMutex::new(Vec::new()));
        let batches_2 = Arc::clone(&batches);

        let block = BatchBlock::new(BatchBlockOptions {
            capacity: 10,
            batch_size: 3,
            done: DoneCallback::new(move |item: BlockItem<i32>| {
                let batches = Arc::clone(&batches_2);
                async move {
                    batches.lock().unwrap().push(item.into_batch()?);
                    Ok(())
                }
            }),
            label: "test-batch".into(),
        })
        .unwrap();

        for i in 1..=7 {
            block.send(BlockItem::Single(i)).await.unwrap();
        }
        block.complete().await.unwrap();

        let batches = batches.lock().unwrap().clone();
        assert_eq!(batches, vec![vec![1, 2, 3], vec![4, 5, 6], vec![7]]);
    }
}
