use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;

use crate::error::PipeweaveError;
use crate::item::BlockItem;
use crate::metrics::BlockMetrics;

use super::Block;

/// Terminal sink: `send` and `complete` return immediately, discarding
/// whatever reaches them. Used as the routing target when no filter, route,
/// or default-next pipe claims an item (spec §4.7).
///
/// Stateless and safe to share; [`NullBlock::instance`] hands out one shared
/// instance per item type `T` (spec §9 "Global state" — the only
/// process-wide shared block). A `static` declared inside a generic
/// function is monomorphized once per distinct `T`, so each item type gets
/// its own lazily-built singleton without a `TypeId`-keyed registry.
pub struct NullBlock<T> {
    metrics: BlockMetrics,
    _marker: PhantomData<fn(T)>,
}

impl<T: Send + Sync + 'static> NullBlock<T> {
    /// Returns the process-wide singleton for this item type.
    pub fn instance() -> Arc<Self> {
        NullBlock::<T>::per_type_cell()
            .get_or_init(|| {
                Arc::new(NullBlock {
                    metrics: BlockMetrics::new("null"),
                    _marker: PhantomData,
                })
            })
            .clone()
    }

    fn per_type_cell() -> &'static OnceLock<Arc<NullBlock<T>>> {
        static CELL: OnceLock<Arc<NullBlock<T>>> = OnceLock::new();
        &CELL
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> Block<T> for NullBlock<T> {
    async fn send(&self, _item: BlockItem<T>) -> Result<(), PipeweaveError> {
        Ok(())
    }

    async fn complete(&self) -> Result<(), PipeweaveError> {
        Ok(())
    }

    fn metrics(&self) -> &BlockMetrics {
        &self.metrics
    }
}
