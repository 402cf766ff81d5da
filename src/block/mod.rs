//! Block primitives: the concurrent processing engines a [`Pipe`](crate::pipe::Pipe)
//! wraps.
//!
//! There is no inheritance hierarchy (spec §9 "No inheritance hierarchy"):
//! every block implements the small [`Block`] interface, and decorators
//! ([`FilterBlock`], [`ParallelBlock`]) hold another `Block` behind a
//! type-erased pointer rather than subclassing it.

pub mod action;
pub mod batch;
pub mod batch_action;
pub mod filter;
pub mod null;
pub mod parallel;
pub mod timer_batch;

pub use action::{ActionBlock, ActionBlockOptions};
pub use batch::{BatchBlock, BatchBlockOptions};
pub use batch_action::{BatchActionBlock, BatchActionBlockOptions};
pub use filter::FilterBlock;
pub use null::NullBlock;
pub use parallel::{ParallelBlock, ParallelBlockOptions};
pub use timer_batch::{TimerBatchBlock, TimerBatchBlockOptions};

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::PipeweaveError;
use crate::item::{BlockItem, DoneCallback};
use crate::metrics::BlockMetrics;

/// The common interface every block (and every block decorator) implements.
#[async_trait]
pub trait Block<T>: Send + Sync {
    /// Enqueues `item`; suspends while the block's intake is at capacity.
    async fn send(&self, item: BlockItem<T>) -> Result<(), PipeweaveError>;

    /// Closes intake and awaits drain of all in-flight work, surfacing the
    /// first captured user-action error, if any.
    async fn complete(&self) -> Result<(), PipeweaveError>;

    /// Per-block atomic counters (spec §3 "Block metrics").
    fn metrics(&self) -> &BlockMetrics;
}

/// Builds a block once its `done` callback is known. [`Pipe`](crate::pipe::Pipe)
/// and [`ParallelBlock`] both need this: the block they wrap has to call
/// back into routing/tracking logic the wrapper owns, so the wrapper
/// constructs the `done` first and only then asks the factory for the
/// finished block (spec §4.8 "a block factory closure that receives the
/// pipe's routing-done callback").
pub type BlockFactory<T> =
    Box<dyn FnOnce(DoneCallback<T>) -> Result<Arc<dyn Block<T>>, PipeweaveError> + Send>;
