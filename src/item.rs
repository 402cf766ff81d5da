use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::PipeweaveError;

/// A tagged union carrying either nothing, a single value, or a batch of
/// values, so that batch and non-batch blocks can share one action and
/// metrics interface (spec §3, §9 — replaces a strategy-pattern wrapper with
/// a plain sum type, no virtual dispatch).
#[derive(Debug, Clone)]
pub enum BlockItem<T> {
    Empty,
    Single(T),
    Batch(Vec<T>),
}

impl<T> BlockItem<T> {
    /// Number of values carried: `0 | 1 | len(array)`.
    pub fn size(&self) -> usize {
        match self {
            BlockItem::Empty => 0,
            BlockItem::Single(_) => 1,
            BlockItem::Batch(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Builds a batch item, rejecting the empty-array case (spec §3: "a
    /// Batch with zero elements is not constructible").
    pub fn batch(items: Vec<T>) -> Self {
        if items.is_empty() {
            BlockItem::Empty
        } else {
            BlockItem::Batch(items)
        }
    }

    /// Applies `f` to each contained value, in order for a batch.
    pub fn for_each(&self, mut f: impl FnMut(&T)) {
        match self {
            BlockItem::Empty => {}
            BlockItem::Single(v) => f(v),
            BlockItem::Batch(items) => items.iter().for_each(f),
        }
    }

    /// Maps each contained value, preserving the shape.
    pub fn map<U>(self, mut f: impl FnMut(T) -> U) -> BlockItem<U> {
        match self {
            BlockItem::Empty => BlockItem::Empty,
            BlockItem::Single(v) => BlockItem::Single(f(v)),
            BlockItem::Batch(items) => BlockItem::Batch(items.into_iter().map(f).collect()),
        }
    }

    /// Keeps only the values matching `pred`; an all-rejected batch collapses
    /// to `Empty` rather than an empty `Batch`.
    pub fn filter(self, mut pred: impl FnMut(&T) -> bool) -> BlockItem<T> {
        match self {
            BlockItem::Empty => BlockItem::Empty,
            BlockItem::Single(v) => {
                if pred(&v) {
                    BlockItem::Single(v)
                } else {
                    BlockItem::Empty
                }
            }
            BlockItem::Batch(items) => {
                BlockItem::batch(items.into_iter().filter(|v| pred(v)).collect())
            }
        }
    }

    /// Returns the single value, failing if this isn't a `Single`.
    pub fn into_single(self) -> Result<T, PipeweaveError> {
        match self {
            BlockItem::Single(v) => Ok(v),
            BlockItem::Empty => Err(PipeweaveError::TypeMismatch(
                "expected a single value, found Empty",
            )),
            BlockItem::Batch(_) => Err(PipeweaveError::TypeMismatch(
                "expected a single value, found a batch",
            )),
        }
    }

    /// Returns the batch array, failing if this isn't a `Batch`.
    pub fn into_batch(self) -> Result<Vec<T>, PipeweaveError> {
        match self {
            BlockItem::Batch(items) => Ok(items),
            BlockItem::Single(_) => Err(PipeweaveError::TypeMismatch(
                "expected a batch, found a single value",
            )),
            BlockItem::Empty => Err(PipeweaveError::TypeMismatch(
                "expected a batch, found Empty",
            )),
        }
    }

    /// Flattens into a `Vec`, regardless of shape (used by routing, which
    /// forwards every contained value independently).
    pub fn into_values(self) -> Vec<T> {
        match self {
            BlockItem::Empty => Vec::new(),
            BlockItem::Single(v) => vec![v],
            BlockItem::Batch(items) => items,
        }
    }
}

impl<T> From<T> for BlockItem<T> {
    fn from(value: T) -> Self {
        BlockItem::Single(value)
    }
}

type ActionFuture = Pin<Box<dyn Future<Output = Result<(), PipeweaveError>> + Send>>;

/// A function `BlockItem<T> -> future<()>`, shared across worker tasks.
///
/// Constructed from one of the four shape-specific helpers below; mismatched
/// use (e.g. a single-item action fed a `Batch`) fails with
/// [`PipeweaveError::TypeMismatch`] rather than panicking.
#[derive(Clone)]
pub struct BlockAction<T>(Arc<dyn Fn(BlockItem<T>) -> ActionFuture + Send + Sync>);

impl<T: Send + 'static> BlockAction<T> {
    /// Wraps a synchronous per-item function.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self(Arc::new(move |item| {
            let result = item.into_single().map(|v| f(v));
            Box::pin(async move { result })
        }))
    }

    /// Wraps an asynchronous per-item function.
    pub fn from_async_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self(Arc::new(move |item| {
            let fut = item.into_single().map(|v| f(v));
            Box::pin(async move {
                match fut {
                    Ok(fut) => {
                        fut.await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            })
        }))
    }

    /// Wraps a synchronous whole-batch function.
    pub fn from_batch_fn<F>(f: F) -> Self
    where
        F: Fn(Vec<T>) + Send + Sync + 'static,
    {
        Self(Arc::new(move |item| {
            let result = item.into_batch().map(|v| f(v));
            Box::pin(async move { result })
        }))
    }

    /// Wraps an asynchronous whole-batch function.
    pub fn from_async_batch_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self(Arc::new(move |item| {
            let fut = item.into_batch().map(|v| f(v));
            Box::pin(async move {
                match fut {
                    Ok(fut) => {
                        fut.await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            })
        }))
    }

    pub async fn call(&self, item: BlockItem<T>) -> Result<(), PipeweaveError> {
        (self.0.as_ref())(item).await
    }
}

impl<T> std::fmt::Debug for BlockAction<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BlockAction(..)")
    }
}

/// A plumbing callback invoked after a block's action completes for an
/// item, regardless of shape (`Empty`/`Single`/`Batch`) — unlike
/// [`BlockAction`], it is never constructed directly by library users; it is
/// how a [`Pipe`](crate::pipe::Pipe) wires its own routing function in as a
/// block's `done`.
#[derive(Clone)]
pub struct DoneCallback<T>(Arc<dyn Fn(BlockItem<T>) -> ActionFuture + Send + Sync>);

impl<T: Send + 'static> DoneCallback<T> {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(BlockItem<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), PipeweaveError>> + Send + 'static,
    {
        Self(Arc::new(move |item| Box::pin(f(item))))
    }

    /// The default: does nothing with the item.
    pub fn noop() -> Self {
        Self(Arc::new(|_item| Box::pin(async { Ok(()) })))
    }

    pub async fn call(&self, item: BlockItem<T>) -> Result<(), PipeweaveError> {
        (self.0.as_ref())(item).await
    }
}

impl<T> std::fmt::Debug for DoneCallback<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DoneCallback(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn batch_rejects_the_empty_array() {
        assert!(matches!(BlockItem::<i32>::batch(vec![]), BlockItem::Empty));
    }

    proptest! {
        #[test]
        fn size_matches_into_values_len(values: Vec<i32>) {
            let item = BlockItem::batch(values.clone());
            prop_assert_eq!(item.size(), values.len());
            prop_assert_eq!(item.into_values(), values);
        }

        #[test]
        fn filter_then_for_each_only_sees_matching_values(values: Vec<i32>) {
            let item = BlockItem::batch(values.clone());
            let mut seen = Vec::new();
            item.filter(|v| v % 2 == 0).for_each(|v| seen.push(*v));
            let expected: Vec<i32> = values.into_iter().filter(|v| v % 2 == 0).collect();
            prop_assert_eq!(seen, expected);
        }
    }
}
