use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{try_join_all, BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::PipeweaveError;
use crate::item::BlockItem;
use crate::pipe::{Pipe, Route};

type CompletionFuture = Shared<BoxFuture<'static, Result<(), Arc<PipeweaveError>>>>;

/// Ordered list of [`Pipe`]s keyed by unique id (spec §4.10). Bookkeeping
/// only — all the concurrency lives in the pipes and blocks it holds
/// references to.
pub struct Pipeline<T> {
    default_route: Option<Route<T>>,
    order: AsyncMutex<Vec<Arc<Pipe<T>>>>,
    by_id: AsyncMutex<HashMap<String, Arc<Pipe<T>>>>,
    completion: AsyncMutex<Option<CompletionFuture>>,
}

impl<T> Pipeline<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(default_route: Option<Route<T>>) -> Self {
        Self {
            default_route,
            order: AsyncMutex::new(Vec::new()),
            by_id: AsyncMutex::new(HashMap::new()),
            completion: AsyncMutex::new(None),
        }
    }

    /// `Add(pipe)`: fails on a duplicate id; applies the pipeline's default
    /// route to the new pipe, then links the previous last pipe's default
    /// next to it (spec §4.10).
    pub async fn add(&self, pipe: Arc<Pipe<T>>) -> Result<(), PipeweaveError> {
        let mut by_id = self.by_id.lock().await;
        if by_id.contains_key(pipe.id()) {
            return Err(PipeweaveError::DuplicateId(pipe.id().to_string()));
        }

        if let Some(route) = &self.default_route {
            pipe.link_to(Arc::clone(route)).await;
        }

        let mut order = self.order.lock().await;
        if let Some(last) = order.last() {
            last.link_next(Arc::clone(&pipe)).await;
        }

        by_id.insert(pipe.id().to_string(), Arc::clone(&pipe));
        order.push(pipe);
        Ok(())
    }

    /// `Send(item, id?)`: dispatches through the named pipe, or the head
    /// pipe if `id` is `None`. A no-op (`Ok`) if the pipeline is empty and
    /// no id was given.
    pub async fn send(&self, item: BlockItem<T>, id: Option<&str>) -> Result<(), PipeweaveError> {
        let pipe = self.resolve(id).await?;
        match pipe {
            Some(pipe) => pipe.send(item).await,
            None => Ok(()),
        }
    }

    /// `SendNext(item, id)`: forwards past the named pipe.
    pub async fn send_next(&self, item: BlockItem<T>, id: &str) -> Result<(), PipeweaveError> {
        let pipe = self
            .by_id
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| PipeweaveError::PipeNotFound(id.to_string()))?;
        pipe.send_next(item).await
    }

    async fn resolve(&self, id: Option<&str>) -> Result<Option<Arc<Pipe<T>>>, PipeweaveError> {
        match id {
            Some(id) => self
                .by_id
                .lock()
                .await
                .get(id)
                .cloned()
                .map(Some)
                .ok_or_else(|| PipeweaveError::PipeNotFound(id.to_string())),
            None => Ok(self.order.lock().await.first().cloned()),
        }
    }

    /// `Completion`: a memoized future resolving once every member pipe's own
    /// [`Pipe::completion`] has resolved, joining them the same way
    /// `Pipe::completion` memoizes a single block's drain. The pipe set is
    /// snapshotted on first call, matching `Pipe::completion`'s
    /// once-computed, many-awaited shape.
    pub async fn completion(&self) -> CompletionFuture {
        let mut slot = self.completion.lock().await;
        if let Some(fut) = slot.as_ref() {
            return fut.clone();
        }
        let pipes = self.order.lock().await.clone();
        let fut: BoxFuture<'static, Result<(), Arc<PipeweaveError>>> = async move {
            let completions = futures::future::join_all(pipes.iter().map(|p| p.completion())).await;
            try_join_all(completions).await.map(|_| ())
        }
        .boxed();
        let shared = fut.shared();
        *slot = Some(shared.clone());
        shared
    }

    /// `Complete()`: completes every pipe in insertion order, awaiting each
    /// in turn; surfaces the first failure but still attempts every pipe.
    pub async fn complete(&self) -> Result<(), PipeweaveError> {
        let pipes = self.order.lock().await.clone();
        let mut first_error = None;
        for pipe in pipes {
            if let Err(e) = pipe.complete().await {
                tracing::warn!(pipe = pipe.id(), error = %e, "pipe failed to complete");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
