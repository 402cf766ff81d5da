use std::borrow::Cow;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex as AsyncMutex;

use crate::block::{Block, BlockFactory, NullBlock};
use crate::error::PipeweaveError;
use crate::item::{BlockItem, DoneCallback};

/// A dynamic routing function: given an item, optionally names the pipe it
/// should be routed to (spec §3 "ordered list of route functions").
pub type Route<T> = Arc<dyn Fn(&T) -> Option<Arc<Pipe<T>>> + Send + Sync>;

type CompletionFuture = Shared<BoxFuture<'static, Result<(), Arc<PipeweaveError>>>>;

/// Fixed identity of a [`Pipe`] plus its wiring, passed to [`Pipe::new`].
pub struct PipeOptions<T> {
    pub id: Cow<'static, str>,
    pub filter: Option<Arc<dyn Fn(&T) -> bool + Send + Sync>>,
    pub routes: Vec<Route<T>>,
}

/// Wraps a [`Block`] and adds filter/route/linking (spec §4.8). The block is
/// constructed via a [`BlockFactory`] so it can be wired with this pipe's own
/// `RouteItem` as its `done` callback — the block never needs to know it's
/// inside a pipe, it just calls `done` like any other block.
pub struct Pipe<T> {
    id: Cow<'static, str>,
    filter: Option<Arc<dyn Fn(&T) -> bool + Send + Sync>>,
    routes: AsyncMutex<Vec<Route<T>>>,
    next: AsyncMutex<Option<Arc<Pipe<T>>>>,
    block: Arc<dyn Block<T>>,
    completion: AsyncMutex<Option<CompletionFuture>>,
}

impl<T> Pipe<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(
        options: PipeOptions<T>,
        block_factory: BlockFactory<T>,
    ) -> Result<Arc<Self>, PipeweaveError> {
        // `Arc::new_cyclic` hands us a `Weak` to the not-yet-built pipe
        // before the pipe exists, which is exactly what `route_item` needs
        // to call back into `self` once it does — but its closure is
        // infallible, so a factory error is stashed here and rechecked
        // once construction returns.
        let mut build_error = None;
        let mut factory_slot = Some(block_factory);

        let pipe = Arc::new_cyclic(|weak: &std::sync::Weak<Self>| {
            let weak = weak.clone();
            let route_item = DoneCallback::new(move |item: BlockItem<T>| {
                let weak = weak.clone();
                async move {
                    let Some(pipe) = weak.upgrade() else {
                        return Ok(());
                    };
                    pipe.route_item(item).await
                }
            });

            let factory = factory_slot.take().expect("factory called at most once");
            let block = match factory(route_item) {
                Ok(block) => block,
                Err(e) => {
                    build_error = Some(e);
                    NullBlock::<T>::instance() as Arc<dyn Block<T>>
                }
            };

            Self {
                id: options.id,
                filter: options.filter,
                routes: AsyncMutex::new(options.routes),
                next: AsyncMutex::new(None),
                block,
                completion: AsyncMutex::new(None),
            }
        });

        match build_error {
            Some(e) => Err(e),
            None => Ok(pipe),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Forwards each contained value to its resolved target (spec §4.8
    /// "RouteItem"). The whole `BlockItem` may be a batch; every value is
    /// routed individually since a batch's contents can legitimately
    /// disperse to different downstream targets.
    async fn route_item(&self, item: BlockItem<T>) -> Result<(), PipeweaveError> {
        for value in item.into_values() {
            let target = self.target(&value).await;
            target.send(BlockItem::Single(value)).await?;
        }
        Ok(())
    }

    /// `Target(item)`: own block if unfiltered/matching, else `RouteTarget`.
    async fn target(&self, item: &T) -> Arc<dyn Block<T>> {
        let matches = self
            .filter
            .as_ref()
            .map(|f| (f.as_ref())(item))
            .unwrap_or(true);
        if matches {
            Arc::clone(&self.block)
        } else {
            self.route_target(item).await
        }
    }

    /// `RouteTarget(item)`: first matching route wins, recursing into *its*
    /// `Target`; otherwise the default next pipe's `Target`; otherwise the
    /// null sink. Recursing (rather than returning the matched pipe's block
    /// directly) is what lets a filtered-out item pass transparently through
    /// a chain of downstream filters (spec §4.8, §9 open question).
    async fn route_target(&self, item: &T) -> Arc<dyn Block<T>> {
        let routes = self.routes.lock().await.clone();
        for route in routes.iter() {
            if let Some(pipe) = (route.as_ref())(item) {
                return Box::pin(pipe.target(item)).await;
            }
        }

        let next = self.next.lock().await.clone();
        match next {
            Some(next) => Box::pin(next.target(item)).await,
            None => NullBlock::<T>::instance() as Arc<dyn Block<T>>,
        }
    }

    /// `Send`: resolves the same target a completed upstream item would
    /// (own block if unfiltered/matching, otherwise the route/next chain),
    /// so entry routing and post-completion routing share one resolution
    /// path (spec §4.8 "Send"/"Target").
    pub async fn send(&self, item: BlockItem<T>) -> Result<(), PipeweaveError> {
        for value in item.into_values() {
            let target = self.target(&value).await;
            target.send(BlockItem::Single(value)).await?;
        }
        Ok(())
    }

    /// `SendNext`: bypasses this pipe's own block/filter entirely and
    /// forwards straight to the default next pipe (or the null sink).
    pub async fn send_next(&self, item: BlockItem<T>) -> Result<(), PipeweaveError> {
        let next = self.next.lock().await.clone();
        match next {
            Some(next) => next.send(item).await,
            None => {
                for value in item.into_values() {
                    NullBlock::<T>::instance().send(BlockItem::Single(value)).await?;
                }
                Ok(())
            }
        }
    }

    /// Appends a route. Routes added later never re-order existing ones
    /// (spec §4.8 "Linking").
    pub async fn link_to(&self, route: Route<T>) {
        self.routes.lock().await.push(route);
    }

    /// Sets the default downstream pipe.
    pub async fn link_next(&self, next: Arc<Pipe<T>>) {
        *self.next.lock().await = Some(next);
    }

    /// Kicks off (idempotently) the block's drain and returns a future that
    /// resolves when it finishes — a task-cancelled join is converted to a
    /// successful completion (spec §4.8 "Completion").
    pub async fn completion(&self) -> CompletionFuture {
        let mut slot = self.completion.lock().await;
        if let Some(fut) = slot.as_ref() {
            return fut.clone();
        }
        let block = Arc::clone(&self.block);
        let fut: BoxFuture<'static, Result<(), Arc<PipeweaveError>>> = async move {
            block.complete().await.map_err(Arc::new)
        }
        .boxed();
        let shared = fut.shared();
        *slot = Some(shared.clone());
        shared
    }

    /// `Complete()`: invokes the block's drain and awaits it.
    pub async fn complete(&self) -> Result<(), PipeweaveError> {
        let fut = self.completion().await;
        fut.await.map_err(|e| match Arc::try_unwrap(e) {
            Ok(e) => e,
            Err(e) => PipeweaveError::user_action_msg(e.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::builder::ActionBuilder;
    use crate::item::BlockAction;

    use super::*;

    /// A filtered-out item must resolve through the downstream pipe's own
    /// `target`/`route_target`, not bypass straight to its block (spec §4.8,
    /// §9's "filter acts as a pass-through, not a drop"): pipe A rejects
    /// everything via its filter and links to pipe B, which only accepts
    /// even numbers via its own filter. An odd item sent into A must never
    /// reach B's action; an even item must.
    #[tokio::test]
    async fn filtered_item_resolves_through_downstream_pipes_own_filter() {
        let b_hits = Arc::new(AtomicUsize::new(0));
        let b_hits_2 = Arc::clone(&b_hits);

        let pipe_b = ActionBuilder::new(BlockAction::from_fn(move |_: i32| {
            b_hits_2.fetch_add(1, Ordering::SeqCst);
        }))
        .id("b")
        .filter(|n: &i32| n % 2 == 0)
        .to_pipe()
        .unwrap();

        let a_hits = Arc::new(AtomicUsize::new(0));
        let a_hits_2 = Arc::clone(&a_hits);

        let pipe_a = ActionBuilder::new(BlockAction::from_fn(move |_: i32| {
            a_hits_2.fetch_add(1, Ordering::SeqCst);
        }))
        .id("a")
        .filter(|n: &i32| *n > 100)
        .to_pipe()
        .unwrap();

        pipe_a.link_next(Arc::clone(&pipe_b)).await;

        pipe_a.send(BlockItem::Single(3)).await.unwrap();
        pipe_a.send(BlockItem::Single(4)).await.unwrap();

        pipe_a.complete().await.unwrap();
        pipe_b.complete().await.unwrap();

        assert_eq!(a_hits.load(Ordering::SeqCst), 0, "neither item matches A's filter");
        assert_eq!(
            b_hits.load(Ordering::SeqCst),
            1,
            "only the even item should reach B's action, via B's own filter"
        );
    }
}
