use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use metrics::gauge;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::error::PipeweaveError;

type DispatchFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A global work-in-progress cap gating a dispatch function, independent of
/// any per-block capacity (spec §4.9). Backpressure comes purely from the
/// single-slot *send* channel; the coordinator task is the only thing that
/// ever reads or writes `wip`.
pub struct PipelineLimiter<T> {
    send_tx: AsyncMutex<Option<mpsc::Sender<T>>>,
    done_tx: AsyncMutex<Option<mpsc::Sender<()>>>,
    coordinator: AsyncMutex<Option<JoinHandle<()>>>,
    wip: Arc<AtomicI64>,
    label: String,
}

impl<T> PipelineLimiter<T>
where
    T: Send + 'static,
{
    pub fn new<F, Fut>(max_work: usize, dispatch: F) -> Result<Self, PipeweaveError>
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::with_label(max_work, dispatch, "pipeline")
    }

    pub fn with_label<F, Fut>(
        max_work: usize,
        dispatch: F,
        label: impl Into<String>,
    ) -> Result<Self, PipeweaveError>
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if max_work == 0 {
            return Err(PipeweaveError::InvalidConfig(
                "PipelineLimiter max_work must be >= 1".into(),
            ));
        }

        let label = label.into();
        let (send_tx, send_rx) = mpsc::channel(1);
        let (done_tx, done_rx) = mpsc::channel(1);
        let wip = Arc::new(AtomicI64::new(0));

        let dispatch: Arc<dyn Fn(T) -> DispatchFuture + Send + Sync> =
            Arc::new(move |item: T| Box::pin(dispatch(item)) as DispatchFuture);

        let coordinator = tokio::spawn(run_coordinator(
            send_rx,
            done_rx,
            max_work,
            dispatch,
            Arc::clone(&wip),
            label.clone(),
        ));

        Ok(Self {
            send_tx: AsyncMutex::new(Some(send_tx)),
            done_tx: AsyncMutex::new(Some(done_tx)),
            coordinator: AsyncMutex::new(Some(coordinator)),
            wip,
            label,
        })
    }

    /// Current work-in-progress count (spec §8 invariant `wip <= maxWork`).
    pub fn wip(&self) -> i64 {
        self.wip.load(Ordering::SeqCst)
    }

    /// `Send(item)`: suspends while the single send slot is occupied or
    /// `wip` is already at `maxWork`.
    pub async fn send(&self, item: T) -> Result<(), PipeweaveError> {
        let tx = self.send_tx.lock().await.clone();
        match tx {
            Some(tx) => tx.send(item).await.map_err(|_| {
                PipeweaveError::InvalidConfig(format!(
                    "PipelineLimiter `{}` is already completing; cannot accept new items",
                    self.label
                ))
            }),
            None => Err(PipeweaveError::InvalidConfig(format!(
                "PipelineLimiter `{}` is already completing; cannot accept new items",
                self.label
            ))),
        }
    }

    /// `TrackDone(item)`: the user's dispatch function calls this exactly
    /// once per dispatched item to release its `wip` slot.
    pub async fn track_done(&self) -> Result<(), PipeweaveError> {
        let tx = self.done_tx.lock().await.clone();
        match tx {
            Some(tx) => tx.send(()).await.map_err(|_| {
                PipeweaveError::InvalidConfig(format!(
                    "PipelineLimiter `{}` coordinator is gone",
                    self.label
                ))
            }),
            None => Ok(()),
        }
    }

    /// `Complete()`: closes both channels and awaits the coordinator.
    pub async fn complete(&self) -> Result<(), PipeweaveError> {
        self.send_tx.lock().await.take();
        self.done_tx.lock().await.take();
        if let Some(coordinator) = self.coordinator.lock().await.take() {
            let _ = coordinator.await;
        }
        Ok(())
    }
}

async fn run_coordinator<T>(
    mut send_rx: mpsc::Receiver<T>,
    mut done_rx: mpsc::Receiver<()>,
    max_work: usize,
    dispatch: Arc<dyn Fn(T) -> DispatchFuture + Send + Sync>,
    wip: Arc<AtomicI64>,
    label: String,
) where
    T: Send + 'static,
{
    let mut send_closed = false;
    let mut pending: Option<T> = None;

    loop {
        if pending.is_none() && !send_closed && (wip.load(Ordering::SeqCst) as usize) < max_work {
            tokio::select! {
                biased;
                done = done_rx.recv() => {
                    match done {
                        Some(()) => release(&wip, &label),
                        None => {}
                    }
                }
                item = send_rx.recv() => {
                    match item {
                        Some(item) => pending = Some(item),
                        None => send_closed = true,
                    }
                }
            }
        } else if let Some(item) = pending.take() {
            wip.fetch_add(1, Ordering::SeqCst);
            publish(&wip, &label);
            let task_dispatch = Arc::clone(&dispatch);
            tokio::spawn(async move { (task_dispatch.as_ref())(item).await });
        } else {
            match done_rx.recv().await {
                Some(()) => release(&wip, &label),
                None => {
                    if send_closed {
                        break;
                    }
                }
            }
        }

        if send_closed && pending.is_none() && wip.load(Ordering::SeqCst) == 0 {
            break;
        }
    }
    tracing::debug!(limiter = %label, "limiter coordinator exiting");
}

fn release(wip: &Arc<AtomicI64>, label: &str) {
    wip.fetch_sub(1, Ordering::SeqCst);
    publish(wip, label);
}

fn publish(wip: &Arc<AtomicI64>, label: &str) {
    gauge!("pipeweave_limiter_wip", "limiter" => label.to_string())
        .set(wip.load(Ordering::SeqCst) as f64);
}
