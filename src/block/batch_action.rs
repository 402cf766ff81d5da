use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::PipeweaveError;
use crate::item::{BlockAction, BlockItem, DoneCallback};
use crate::metrics::BlockMetrics;

use super::action::{ActionBlock, ActionBlockOptions};
use super::timer_batch::{TimerBatchBlock, TimerBatchBlockOptions};
use super::Block;

/// Options accepted by [`BatchActionBlock::new`].
pub struct BatchActionBlockOptions<T> {
    pub capacity: usize,
    pub batch_size: usize,
    pub flush_interval: Option<Duration>,
    pub parallelism: usize,
    pub action: BlockAction<Vec<T>>,
    pub done: Option<DoneCallback<T>>,
    pub cancellation: Option<CancellationToken>,
    pub label: Cow<'static, str>,
}

/// An inner [`TimerBatchBlock`] whose `done` feeds each emitted batch into
/// an outer [`ActionBlock`] (capacity 1, `parallelism` workers) running the
/// user-supplied `batch -> future` action (spec §4.4). This is how
/// size/time batching gets parallel batch processing without the
/// `BatchBlock`/`TimerBatchBlock` layers needing any notion of worker
/// pools themselves.
pub struct BatchActionBlock<T> {
    timer_batch: TimerBatchBlock<T>,
    action_block: Arc<ActionBlock<Vec<T>>>,
}

impl<T> BatchActionBlock<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(options: BatchActionBlockOptions<T>) -> Result<Self, PipeweaveError> {
        let done = options.done.unwrap_or_else(DoneCallback::noop);
        let action_label: Cow<'static, str> = format!("{}-action", options.label).into();

        let action_block = Arc::new(ActionBlock::new(ActionBlockOptions {
            capacity: 1,
            parallelism: options.parallelism,
            action: options.action,
            done: Some(DoneCallback::new(move |batch_item: BlockItem<Vec<T>>| {
                let done = done.clone();
                async move {
                    // Each value in the batch is routed individually once
                    // the whole-batch action has run (spec §6 "batch pipe:
                    // applied per item after the batch action").
                    for batch in batch_item.into_values() {
                        done.call(BlockItem::batch(batch)).await?;
                    }
                    Ok(())
                }
            })),
            cancellation: options.cancellation,
            label: action_label,
        })?);

        let feed_action_block = Arc::clone(&action_block);
        let batch_done = DoneCallback::new(move |item: BlockItem<T>| {
            let action_block = Arc::clone(&feed_action_block);
            async move {
                let batch = item.into_batch()?;
                action_block.send(BlockItem::Single(batch)).await
            }
        });

        let timer_batch = TimerBatchBlock::new(TimerBatchBlockOptions {
            capacity: options.capacity,
            batch_size: options.batch_size,
            flush_interval: options.flush_interval,
            done: batch_done,
            label: options.label,
        })?;

        Ok(Self {
            timer_batch,
            action_block,
        })
    }

    /// The inner batching stage's own counters, for callers that want
    /// pre-batch queue depth distinct from the outer action block's worker
    /// concurrency (see [`Block::metrics`] for the aggregate view this
    /// block reports by default).
    pub fn batching_metrics(&self) -> &BlockMetrics {
        self.timer_batch.metrics()
    }
}

#[async_trait]
impl<T> Block<T> for BatchActionBlock<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn send(&self, item: BlockItem<T>) -> Result<(), PipeweaveError> {
        self.timer_batch.send(item).await
    }

    async fn complete(&self) -> Result<(), PipeweaveError> {
        let batching_result = self.timer_batch.complete().await;
        let action_result = self.action_block.complete().await;
        batching_result.and(action_result)
    }

    fn metrics(&self) -> &BlockMetrics {
        // The outer `ActionBlock` is where parallel batch processing — the
        // concurrency users most want visibility into — actually happens.
        self.action_block.metrics()
    }
}
