//! Fluent configuration surface over the block/pipe primitives (spec §6).
//! Kept deliberately thin: builders validate eagerly and hand off to the
//! core types in `block`/`pipe` for everything that actually runs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::block::{
    ActionBlock, ActionBlockOptions, Block, BlockFactory, BatchActionBlock,
    BatchActionBlockOptions, ParallelBlock, ParallelBlockOptions,
};
use crate::error::PipeweaveError;
use crate::item::{BlockAction, DoneCallback};
use crate::pipe::{Pipe, PipeOptions, Route};

static NEXT_PIPE_ID: AtomicUsize = AtomicUsize::new(0);

fn auto_id(prefix: &str) -> String {
    format!("{prefix}-{}", NEXT_PIPE_ID.fetch_add(1, Ordering::Relaxed))
}

/// Shared wiring every top-level builder accepts (spec §6's common surface:
/// `Id`, `Filter`, `Route`, `BoundedCapacity`, `DegreeOfParallelism`,
/// `CancellationToken`).
struct CommonOptions<T> {
    id: Option<String>,
    filter: Option<Arc<dyn Fn(&T) -> bool + Send + Sync>>,
    routes: Vec<Route<T>>,
    capacity: Option<usize>,
    cancellation: Option<CancellationToken>,
}

impl<T> Default for CommonOptions<T> {
    fn default() -> Self {
        Self {
            id: None,
            filter: None,
            routes: Vec::new(),
            capacity: None,
            cancellation: None,
        }
    }
}

/// `Pipe.Action(fn)`: builds a pipe backed by an [`ActionBlock`].
pub struct ActionBuilder<T> {
    common: CommonOptions<T>,
    parallelism: usize,
    action: BlockAction<T>,
}

impl<T> ActionBuilder<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(action: BlockAction<T>) -> Self {
        Self {
            common: CommonOptions::default(),
            parallelism: 1,
            action,
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.common.id = Some(id.into());
        self
    }

    pub fn filter(mut self, f: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.common.filter = Some(Arc::new(f));
        self
    }

    pub fn route(mut self, route: Route<T>) -> Self {
        self.common.routes.push(route);
        self
    }

    pub fn bounded_capacity(mut self, capacity: usize) -> Self {
        self.common.capacity = Some(capacity);
        self
    }

    pub fn degree_of_parallelism(mut self, n: usize) -> Self {
        self.parallelism = n;
        self
    }

    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.common.cancellation = Some(token);
        self
    }

    pub fn to_pipe(self) -> Result<Arc<Pipe<T>>, PipeweaveError> {
        if let Some(id) = self.common.id.as_deref() {
            if id.is_empty() {
                return Err(PipeweaveError::InvalidConfig("pipe id must not be empty".into()));
            }
        }
        let id = self.common.id.unwrap_or_else(|| auto_id("action"));
        let capacity = self.common.capacity.unwrap_or(self.parallelism * 2);
        let parallelism = self.parallelism;
        let action = self.action;
        let cancellation = self.common.cancellation;
        let label = id.clone();

        let factory: BlockFactory<T> = Box::new(move |done: DoneCallback<T>| {
            Ok(Arc::new(ActionBlock::new(ActionBlockOptions {
                capacity,
                parallelism,
                action,
                done: Some(done),
                cancellation,
                label: label.into(),
            })?) as Arc<dyn Block<T>>)
        });

        Pipe::new(
            PipeOptions {
                id: id.into(),
                filter: self.common.filter,
                routes: self.common.routes,
            },
            factory,
        )
    }
}

/// `Pipe.Batch(size, fn)`: builds a pipe backed by a [`BatchActionBlock`]
/// (size- and, optionally, time-triggered batching feeding a parallel
/// batch action — spec §4.4).
pub struct BatchBuilder<T> {
    common: CommonOptions<T>,
    batch_size: usize,
    flush_interval: Option<Duration>,
    parallelism: usize,
    action: BlockAction<Vec<T>>,
}

impl<T> BatchBuilder<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(batch_size: usize, action: BlockAction<Vec<T>>) -> Self {
        Self {
            common: CommonOptions::default(),
            batch_size,
            flush_interval: None,
            parallelism: 1,
            action,
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.common.id = Some(id.into());
        self
    }

    pub fn filter(mut self, f: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.common.filter = Some(Arc::new(f));
        self
    }

    /// Route is applied per item, after the batch action runs (spec §6).
    pub fn route(mut self, route: Route<T>) -> Self {
        self.common.routes.push(route);
        self
    }

    pub fn bounded_capacity(mut self, capacity: usize) -> Self {
        self.common.capacity = Some(capacity);
        self
    }

    pub fn degree_of_parallelism(mut self, n: usize) -> Self {
        self.parallelism = n;
        self
    }

    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.common.cancellation = Some(token);
        self
    }

    pub fn batch_trigger_period(mut self, interval: Duration) -> Self {
        self.flush_interval = Some(interval);
        self
    }

    pub fn to_pipe(self) -> Result<Arc<Pipe<T>>, PipeweaveError> {
        if let Some(id) = self.common.id.as_deref() {
            if id.is_empty() {
                return Err(PipeweaveError::InvalidConfig("pipe id must not be empty".into()));
            }
        }
        let id = self.common.id.unwrap_or_else(|| auto_id("batch"));
        let capacity = self.common.capacity.unwrap_or(self.batch_size);
        let batch_size = self.batch_size;
        let flush_interval = self.flush_interval;
        let parallelism = self.parallelism;
        let action = self.action;
        let cancellation = self.common.cancellation;
        let label = id.clone();

        let factory: BlockFactory<T> = Box::new(move |done: DoneCallback<T>| {
            Ok(Arc::new(BatchActionBlock::new(BatchActionBlockOptions {
                capacity,
                batch_size,
                flush_interval,
                parallelism,
                action,
                done: Some(done),
                cancellation,
                label: label.into(),
            })?) as Arc<dyn Block<T>>)
        });

        Pipe::new(
            PipeOptions {
                id: id.into(),
                filter: self.common.filter,
                routes: self.common.routes,
            },
            factory,
        )
    }
}

/// One entry in a [`ForkBuilder`]: an inner block builder that produces a
/// `Block<Arc<T>>`, not a `Pipe` (spec §6 "Parallel inner-block builders
/// mirror the same surface ... but do not link to next").
pub struct InnerBlockBuilder<T> {
    id: String,
    factory: BlockFactory<Arc<T>>,
}

impl<T> InnerBlockBuilder<T>
where
    T: Send + Sync + 'static,
{
    /// A single-item inner [`ActionBlock`].
    pub fn action(action: BlockAction<Arc<T>>) -> InnerActionBlockBuilder<T> {
        InnerActionBlockBuilder {
            id: None,
            capacity: None,
            parallelism: 1,
            cancellation: None,
            action,
        }
    }
}

pub struct InnerActionBlockBuilder<T> {
    id: Option<String>,
    capacity: Option<usize>,
    parallelism: usize,
    cancellation: Option<CancellationToken>,
    action: BlockAction<Arc<T>>,
}

impl<T> InnerActionBlockBuilder<T>
where
    T: Send + Sync + 'static,
{
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn bounded_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn degree_of_parallelism(mut self, n: usize) -> Self {
        self.parallelism = n;
        self
    }

    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn build(self) -> Result<InnerBlockBuilder<T>, PipeweaveError> {
        if let Some(id) = self.id.as_deref() {
            if id.is_empty() {
                return Err(PipeweaveError::InvalidConfig("pipe id must not be empty".into()));
            }
        }
        let id = self.id.unwrap_or_else(|| auto_id("fork-inner"));
        let capacity = self.capacity.unwrap_or(self.parallelism * 2);
        let parallelism = self.parallelism;
        let action = self.action;
        let cancellation = self.cancellation;
        let label = id.clone();

        let factory: BlockFactory<Arc<T>> = Box::new(move |done: DoneCallback<Arc<T>>| {
            Ok(Arc::new(ActionBlock::new(ActionBlockOptions {
                capacity,
                parallelism,
                action,
                done: Some(done),
                cancellation,
                label: label.into(),
            })?) as Arc<dyn Block<Arc<T>>>)
        });

        Ok(InnerBlockBuilder { id, factory })
    }
}

/// `Pipe.Fork(blockBuilder...)`: builds a pipe backed by a [`ParallelBlock`]
/// fork-join over the supplied inner block builders.
pub struct ForkBuilder<T> {
    common: CommonOptions<Arc<T>>,
    inner: Vec<(String, BlockFactory<Arc<T>>)>,
    join: Option<DoneCallback<Arc<T>>>,
}

impl<T> ForkBuilder<T>
where
    T: Send + Sync + 'static,
{
    pub fn new(inner_blocks: Vec<InnerBlockBuilder<T>>) -> Self {
        Self {
            common: CommonOptions::default(),
            inner: inner_blocks
                .into_iter()
                .map(|b| (b.id, b.factory))
                .collect(),
            join: None,
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.common.id = Some(id.into());
        self
    }

    pub fn filter(mut self, f: impl Fn(&Arc<T>) -> bool + Send + Sync + 'static) -> Self {
        self.common.filter = Some(Arc::new(f));
        self
    }

    pub fn route(mut self, route: Route<Arc<T>>) -> Self {
        self.common.routes.push(route);
        self
    }

    pub fn bounded_capacity(mut self, capacity: usize) -> Self {
        self.common.capacity = Some(capacity);
        self
    }

    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.common.cancellation = Some(token);
        self
    }

    /// Runs after all inner blocks finish an item (spec §6 "Fork-only:
    /// Join").
    pub fn join(mut self, f: impl Fn(Arc<T>) + Send + Sync + 'static) -> Self {
        let f = Arc::new(f);
        self.join = Some(DoneCallback::new(move |item| {
            let f = Arc::clone(&f);
            async move {
                for value in item.into_values() {
                    (f.as_ref())(value);
                }
                Ok(())
            }
        }));
        self
    }

    pub fn to_pipe(self) -> Result<Arc<Pipe<Arc<T>>>, PipeweaveError> {
        let id = self.common.id.unwrap_or_else(|| auto_id("fork"));
        let capacity = self.common.capacity.unwrap_or(self.inner.len().max(1) * 2);
        let inner = self.inner;
        let join = self.join.unwrap_or_else(DoneCallback::noop);
        let label = id.clone();

        let factory: BlockFactory<Arc<T>> = Box::new(move |done: DoneCallback<Arc<T>>| {
            Ok(Arc::new(ParallelBlock::new(ParallelBlockOptions {
                inner_block_factories: inner,
                capacity,
                done: DoneCallback::new(move |item| {
                    let join = join.clone();
                    let done = done.clone();
                    async move {
                        join.call(item.clone()).await?;
                        done.call(item).await
                    }
                }),
                label: label.into(),
            })?) as Arc<dyn Block<Arc<T>>>)
        });

        Pipe::new(
            PipeOptions {
                id: id.into(),
                filter: self.common.filter,
                routes: self.common.routes,
            },
            factory,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_builder_rejects_empty_id() {
        let err = ActionBuilder::new(BlockAction::from_fn(|_: i32| {}))
            .id("")
            .to_pipe()
            .unwrap_err();
        assert!(matches!(err, PipeweaveError::InvalidConfig(_)));
    }

    #[test]
    fn batch_builder_rejects_empty_id() {
        let err = BatchBuilder::new(4, BlockAction::from_fn(|_: Vec<i32>| {}))
            .id("")
            .to_pipe()
            .unwrap_err();
        assert!(matches!(err, PipeweaveError::InvalidConfig(_)));
    }

    #[test]
    fn inner_action_block_builder_rejects_empty_id() {
        let err = InnerBlockBuilder::action(BlockAction::from_fn(|_: Arc<i32>| {}))
            .id("")
            .build()
            .unwrap_err();
        assert!(matches!(err, PipeweaveError::InvalidConfig(_)));
    }
}
