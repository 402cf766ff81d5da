//! Composable, concurrent data-processing pipelines.
//!
//! Items of a user-chosen type flow through a sequence of [`Pipe`]s; each
//! pipe wraps a concurrent [`Block`](block::Block) that buffers, dispatches,
//! and executes user-supplied work. The library gives bounded memory
//! (backpressure via bounded channels), ordered completion propagation, and
//! predictable concurrency — it does not give distributed execution,
//! cross-restart persistence, inter-item ordering under parallel workers, or
//! exactly-once delivery.
//!
//! Start with [`builder::ActionBuilder`], [`builder::BatchBuilder`], or
//! [`builder::ForkBuilder`] to assemble a [`Pipe`], add pipes to a
//! [`Pipeline`], and drive items through with [`Pipeline::send`].

pub mod block;
pub mod builder;
pub mod error;
pub mod item;
pub mod limiter;
pub mod metrics;
pub mod pipe;
pub mod pipeline;

pub use error::PipeweaveError;
pub use item::{BlockAction, BlockItem, DoneCallback};
pub use limiter::PipelineLimiter;
pub use pipe::Pipe;
pub use pipeline::Pipeline;
