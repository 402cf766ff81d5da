use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use pipeweave::builder::{ActionBuilder, ForkBuilder, InnerBlockBuilder};
use pipeweave::item::{BlockAction, BlockItem};
use pipeweave::limiter::PipelineLimiter;
use pipeweave::pipeline::Pipeline;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn fork_join_waits_for_every_inner_block() {
    init_tracing();
    let gate = Arc::new(Notify::new());
    let gate_waiter = Arc::clone(&gate);
    let gated_ran = Arc::new(AtomicUsize::new(0));
    let gated_ran_2 = Arc::clone(&gated_ran);

    let gated = InnerBlockBuilder::action(BlockAction::from_async_fn(move |n: Arc<i32>| {
        let gate = Arc::clone(&gate_waiter);
        let gated_ran = Arc::clone(&gated_ran_2);
        async move {
            gate.notified().await;
            assert_eq!(*n, 1);
            gated_ran.fetch_add(1, Ordering::SeqCst);
        }
    }))
    .id("gated")
    .build()
    .unwrap();

    let immediate_ran = Arc::new(AtomicUsize::new(0));
    let immediate_ran_2 = Arc::clone(&immediate_ran);
    let immediate = InnerBlockBuilder::action(BlockAction::from_async_fn(move |_: Arc<i32>| {
        let immediate_ran = Arc::clone(&immediate_ran_2);
        async move {
            immediate_ran.fetch_add(1, Ordering::SeqCst);
        }
    }))
    .id("immediate")
    .build()
    .unwrap();

    let joined = Arc::new(AtomicUsize::new(0));
    let joined_2 = Arc::clone(&joined);

    let fork = ForkBuilder::new(vec![gated, immediate])
        .id("test-fork")
        .join(move |_item| {
            joined_2.fetch_add(1, Ordering::SeqCst);
        })
        .to_pipe()
        .unwrap();

    fork.send(BlockItem::Single(Arc::new(1))).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(joined.load(Ordering::SeqCst), 0, "join must wait for the gate");
    assert_eq!(immediate_ran.load(Ordering::SeqCst), 1);
    assert_eq!(gated_ran.load(Ordering::SeqCst), 0);

    gate.notify_one();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(gated_ran.load(Ordering::SeqCst), 1);
    assert_eq!(joined.load(Ordering::SeqCst), 1);

    fork.complete().await.unwrap();
}

#[tokio::test]
async fn limiter_caps_work_in_progress_and_resumes_on_track_done() {
    let limiter = Arc::new(
        PipelineLimiter::new(1, |_item: i32| async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
        })
        .unwrap(),
    );

    limiter.send(1).await.unwrap();
    limiter.send(2).await.unwrap();

    let limiter_send3 = Arc::clone(&limiter);
    let send3 = tokio::spawn(async move { limiter_send3.send(3).await });

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!send3.is_finished(), "Send(3) should suspend while wip == maxWork");

    limiter.track_done().await.unwrap();
    send3.await.unwrap().unwrap();

    limiter.track_done().await.unwrap();
    limiter.track_done().await.unwrap();
    limiter.complete().await.unwrap();
}

#[tokio::test]
async fn linear_pipeline_of_pipes_drains() {
    let counter = Arc::new(AtomicI64::new(0));
    let counter_2 = Arc::clone(&counter);

    let first = ActionBuilder::new(BlockAction::from_fn(move |_: i32| {
        counter_2.fetch_add(1, Ordering::SeqCst);
    }))
    .id("first")
    .to_pipe()
    .unwrap();

    let seen: Arc<StdMutex<Vec<i32>>> = Arc::new(StdMutex::new(Vec::new()));
    let seen_2 = Arc::clone(&seen);
    let second = ActionBuilder::new(BlockAction::from_fn(move |n: i32| {
        seen_2.lock().unwrap().push(n);
    }))
    .id("second")
    .to_pipe()
    .unwrap();

    let pipeline = Pipeline::new(None);
    pipeline.add(first).await.unwrap();
    pipeline.add(second).await.unwrap();

    for n in 0..5 {
        pipeline.send(BlockItem::Single(n), None).await.unwrap();
    }
    pipeline.complete().await.unwrap();

    assert_eq!(counter.load(Ordering::SeqCst), 5);
    let mut seen = seen.lock().unwrap().clone();
    seen.sort();
    assert_eq!(seen, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn pipeline_completion_resolves_once_every_pipe_drains() {
    let first = ActionBuilder::new(BlockAction::from_async_fn(move |_: i32| async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }))
    .id("first")
    .to_pipe()
    .unwrap();

    let second = ActionBuilder::new(BlockAction::from_fn(move |_: i32| {}))
        .id("second")
        .to_pipe()
        .unwrap();

    let pipeline = Arc::new(Pipeline::new(None));
    pipeline.add(first).await.unwrap();
    pipeline.add(second).await.unwrap();

    pipeline.send(BlockItem::Single(1), None).await.unwrap();

    let completion = pipeline.completion().await;
    let pipeline_for_complete = Arc::clone(&pipeline);
    tokio::spawn(async move {
        pipeline_for_complete.complete().await.unwrap();
    });

    completion.await.unwrap();
}
