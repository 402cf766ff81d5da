use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::error::PipeweaveError;
use crate::item::{BlockAction, BlockItem, DoneCallback};
use crate::metrics::BlockMetrics;

use super::action::{ActionBlock, ActionBlockOptions};
use super::{Block, BlockFactory};

/// Options accepted by [`ParallelBlock::new`].
pub struct ParallelBlockOptions<T> {
    /// One factory per inner block, keyed by id. Each factory receives the
    /// `done` callback `ParallelBlock` needs it to call — that's how the
    /// completion tracker finds out an inner block finished a given item.
    pub inner_block_factories: Vec<(String, BlockFactory<Arc<T>>)>,
    pub capacity: usize,
    /// Runs exactly once per item, after every inner block has finished it.
    pub done: DoneCallback<Arc<T>>,
    pub label: Cow<'static, str>,
}

enum TrackerMsg<T> {
    Register {
        key: usize,
        item: Arc<T>,
        ack: oneshot::Sender<()>,
    },
    InnerDone {
        key: usize,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

/// Fans each item out to a fixed set of inner blocks, emitting it exactly
/// once after all of them have finished it (spec §4.5, fork-join).
///
/// Fan-out and completion-tracking are split into two tasks, matching the
/// spec's description precisely: a small coordinating [`ActionBlock`]
/// registers each item with the tracker and then dispatches it to every
/// inner block, while a single dedicated consumer task owns the per-item
/// completion counts, so the counter map is never touched from more than
/// one task (spec §4.5 "The tracker must serialize updates").
pub struct ParallelBlock<T> {
    fan_out: Arc<ActionBlock<Arc<T>>>,
    inner_blocks: Vec<Arc<dyn Block<Arc<T>>>>,
    tracker_tx: mpsc::UnboundedSender<TrackerMsg<T>>,
    tracker: AsyncMutex<Option<JoinHandle<()>>>,
}

impl<T> ParallelBlock<T>
where
    T: Send + Sync + 'static,
{
    pub fn new(options: ParallelBlockOptions<T>) -> Result<Self, PipeweaveError> {
        if options.inner_block_factories.is_empty() {
            return Err(PipeweaveError::InvalidConfig(
                "ParallelBlock requires at least one inner block".into(),
            ));
        }

        let (tracker_tx, tracker_rx) = mpsc::unbounded_channel();
        let total_inner = options.inner_block_factories.len();
        let tracker = tokio::spawn(run_tracker(tracker_rx, total_inner, options.done));

        let mut inner_blocks = Vec::with_capacity(total_inner);
        for (id, factory) in options.inner_block_factories {
            let tracker_tx = tracker_tx.clone();
            let inner_done = DoneCallback::new(move |item: BlockItem<Arc<T>>| {
                let tracker_tx = tracker_tx.clone();
                async move {
                    for value in item.into_values() {
                        let key = Arc::as_ptr(&value) as *const () as usize;
                        let _ = tracker_tx.send(TrackerMsg::InnerDone { key });
                    }
                    Ok(())
                }
            });
            let block = factory(inner_done).map_err(|e| {
                PipeweaveError::InvalidConfig(format!(
                    "failed to build fork inner block `{id}`: {e}"
                ))
            })?;
            inner_blocks.push(block);
        }

        let fan_out_blocks = inner_blocks.clone();
        let fan_out_tracker_tx = tracker_tx.clone();
        let fan_out_action = BlockAction::from_async_fn(move |item: Arc<T>| {
            let inner_blocks = fan_out_blocks.clone();
            let tracker_tx = fan_out_tracker_tx.clone();
            async move {
                let key = Arc::as_ptr(&item) as *const () as usize;
                let (ack_tx, ack_rx) = oneshot::channel();
                if tracker_tx
                    .send(TrackerMsg::Register {
                        key,
                        item: Arc::clone(&item),
                        ack: ack_tx,
                    })
                    .is_err()
                {
                    return;
                }
                let _ = ack_rx.await;

                let sends = inner_blocks
                    .iter()
                    .map(|inner| inner.send(BlockItem::Single(Arc::clone(&item))));
                for result in futures::future::join_all(sends).await {
                    if let Err(e) = result {
                        tracing::warn!(error = %e, "fork inner block rejected item");
                    }
                }
            }
        });

        let fan_out = Arc::new(ActionBlock::new(ActionBlockOptions {
            capacity: options.capacity,
            parallelism: 1,
            action: fan_out_action,
            done: None,
            cancellation: None,
            label: format!("{}-fanout", options.label).into(),
        })?);

        Ok(Self {
            fan_out,
            inner_blocks,
            tracker_tx,
            tracker: AsyncMutex::new(Some(tracker)),
        })
    }
}

async fn run_tracker<T>(
    mut rx: mpsc::UnboundedReceiver<TrackerMsg<T>>,
    total_inner: usize,
    done: DoneCallback<Arc<T>>,
) where
    T: Send + Sync + 'static,
{
    let mut counts: HashMap<usize, (usize, Arc<T>)> = HashMap::new();

    while let Some(msg) = rx.recv().await {
        match msg {
            TrackerMsg::Register { key, item, ack } => {
                counts.insert(key, (0, item));
                let _ = ack.send(());
            }
            TrackerMsg::InnerDone { key } => {
                let done_now = match counts.get_mut(&key) {
                    Some((count, _)) => {
                        *count += 1;
                        *count >= total_inner
                    }
                    None => false,
                };
                if done_now {
                    if let Some((_, item)) = counts.remove(&key) {
                        if let Err(e) = done.call(BlockItem::Single(item)).await {
                            tracing::warn!(error = %e, "fork-join done callback failed");
                        }
                    }
                }
            }
            TrackerMsg::Shutdown { ack } => {
                let _ = ack.send(());
                break;
            }
        }
    }
}

#[async_trait]
impl<T> Block<Arc<T>> for ParallelBlock<T>
where
    T: Send + Sync + 'static,
{
    async fn send(&self, item: BlockItem<Arc<T>>) -> Result<(), PipeweaveError> {
        if item.is_empty() {
            // Rust has no null references; an `Empty` item is the closest
            // analogue to the reviewed source's "null item" case, which
            // the spec requires rejecting (spec §4.5 "Identity", §6).
            return Err(PipeweaveError::MissingKey);
        }
        // Identity tracking is per item, not per batch, so a `Batch` is
        // flattened into individual fan-out sends rather than forwarded
        // whole (the coordinating action block only ever deals in singles).
        for value in item.into_values() {
            self.fan_out.send(BlockItem::Single(value)).await?;
        }
        Ok(())
    }

    async fn complete(&self) -> Result<(), PipeweaveError> {
        let fan_out_result = self.fan_out.complete().await;

        let mut inner_results = Vec::with_capacity(self.inner_blocks.len());
        for inner in &self.inner_blocks {
            inner_results.push(inner.complete().await);
        }

        if let Some(tracker) = self.tracker.lock().await.take() {
            let (ack_tx, ack_rx) = oneshot::channel();
            let _ = self.tracker_tx.send(TrackerMsg::Shutdown { ack: ack_tx });
            let _ = ack_rx.await;
            let _ = tracker.await;
        }

        fan_out_result?;
        for result in inner_results {
            result?;
        }
        Ok(())
    }

    fn metrics(&self) -> &BlockMetrics {
        self.fan_out.metrics()
    }
}
