use std::sync::Arc;

use async_trait::async_trait;

use crate::error::PipeweaveError;
use crate::item::{BlockItem, DoneCallback};
use crate::metrics::BlockMetrics;

use super::Block;

/// Decorator over any block: predicate-true items go to the inner block,
/// predicate-false items go to a separate `done` action instead (spec
/// §4.6). `Complete` and metrics both delegate straight to the inner block
/// — this block adds no state of its own besides the predicate and the
/// bypass action.
pub struct FilterBlock<T> {
    inner: Arc<dyn Block<T>>,
    predicate: Arc<dyn Fn(&T) -> bool + Send + Sync>,
    bypass: DoneCallback<T>,
}

impl<T> FilterBlock<T>
where
    T: Send + Sync + 'static,
{
    pub fn new(
        inner: Arc<dyn Block<T>>,
        predicate: impl Fn(&T) -> bool + Send + Sync + 'static,
        bypass: DoneCallback<T>,
    ) -> Self {
        Self {
            inner,
            predicate: Arc::new(predicate),
            bypass,
        }
    }
}

#[async_trait]
impl<T> Block<T> for FilterBlock<T>
where
    T: Send + Sync + 'static,
{
    async fn send(&self, item: BlockItem<T>) -> Result<(), PipeweaveError> {
        match item {
            BlockItem::Empty => Ok(()),
            BlockItem::Single(value) => {
                if (self.predicate.as_ref())(&value) {
                    self.inner.send(BlockItem::Single(value)).await
                } else {
                    self.bypass.call(BlockItem::Single(value)).await
                }
            }
            BlockItem::Batch(values) => {
                let mut matched = Vec::new();
                let mut rejected = Vec::new();
                for value in values {
                    if (self.predicate)(&value) {
                        matched.push(value);
                    } else {
                        rejected.push(value);
                    }
                }

                let matched_item = BlockItem::batch(matched);
                let rejected_item = BlockItem::batch(rejected);

                let inner_result = if matched_item.is_empty() {
                    Ok(())
                } else {
                    self.inner.send(matched_item).await
                };
                let bypass_result = if rejected_item.is_empty() {
                    Ok(())
                } else {
                    self.bypass.call(rejected_item).await
                };
                inner_result.and(bypass_result)
            }
        }
    }

    async fn complete(&self) -> Result<(), PipeweaveError> {
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

    #[tokio::test]
    async fn matching_items_go_inner_others_go_to_bypass() {
        let inner_seen: Arc<StdMutex<Vec<i32>>> = Arc::new(StdMutex::new(Vec::new()));
        let bypass_seen: Arc<StdMutex<Vec<i32>>> = Arc::new(StdMutex::new(Vec::new()));

        let inner_seen_2 = Arc::clone(&inner_seen);
        let inner: Arc<dyn Block<i32>> = Arc::new(crate::block::ActionBlock::new(
            crate::block::ActionBlockOptions {
                capacity: 10,
                parallelism: 1,
                action: crate::item::BlockAction::from_fn(move |n: i32| {
                    inner_seen_2.lock().unwrap().push(n);
                }),
                done: None,
                cancellation: None,
                label: "test-filter-inner".into(),
            },
        )
        .unwrap());

        let bypass_seen_2 = Arc::clone(&bypass_seen);
        let bypass = DoneCallback::new(move |item: BlockItem<i32>| {
            let bypass_seen = Arc::clone(&bypass_seen_2);
            async move {
                bypass_seen.lock().unwrap().extend(item.into_values());
                Ok(())
            }
        });

        let filter = FilterBlock::new(inner, |n: &i32| n % 2 == 0, bypass);

        for n in 1..=4 {
            filter.send(BlockItem::Single(n)).await.unwrap();
        }
        filter.complete().await.unwrap();

        let mut inner_seen = inner_seen.lock().unwrap().clone();
        inner_seen.sort();
        assert_eq!(inner_seen, vec![2, 4]);
        assert_eq!(bypass_seen.lock().unwrap().clone(), vec![1, 3]);
    }
}
