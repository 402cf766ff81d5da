use std::borrow::Cow;
use std::sync::atomic::{AtomicI64, Ordering};

use metrics::gauge;

/// Three non-negative integers per block: accepted-but-not-dispatched,
/// in-flight-in-the-user-action, and in-flight-in-downstream-handoff (spec
/// §3 "Block metrics"). Updated atomically around each phase; never guarded
/// by a lock (spec §5).
#[derive(Debug)]
pub struct BlockMetrics {
    label: Cow<'static, str>,
    input: AtomicI64,
    working: AtomicI64,
    output: AtomicI64,
}

impl BlockMetrics {
    pub fn new(label: impl Into<Cow<'static, str>>) -> Self {
        Self {
            label: label.into(),
            input: AtomicI64::new(0),
            working: AtomicI64::new(0),
            output: AtomicI64::new(0),
        }
    }

    pub fn input_count(&self) -> i64 {
        self.input.load(Ordering::SeqCst)
    }

    pub fn working_count(&self) -> i64 {
        self.working.load(Ordering::SeqCst)
    }

    pub fn output_count(&self) -> i64 {
        self.output.load(Ordering::SeqCst)
    }

    pub fn incr_input(&self) {
        self.input.fetch_add(1, Ordering::SeqCst);
        self.publish("input", self.input_count());
    }

    pub fn decr_input(&self) {
        self.input.fetch_sub(1, Ordering::SeqCst);
        self.publish("input", self.input_count());
    }

    pub fn incr_working(&self) {
        self.working.fetch_add(1, Ordering::SeqCst);
        self.publish("working", self.working_count());
    }

    pub fn decr_working(&self) {
        self.working.fetch_sub(1, Ordering::SeqCst);
        self.publish("working", self.working_count());
    }

    pub fn incr_output(&self) {
        self.output.fetch_add(1, Ordering::SeqCst);
        self.publish("output", self.output_count());
    }

    pub fn decr_output(&self) {
        self.output.fetch_sub(1, Ordering::SeqCst);
        self.publish("output", self.output_count());
    }

    fn publish(&self, stage: &'static str, value: i64) {
        gauge!("pipeweave_block_items", "block" => self.label.clone(), "stage" => stage)
            .set(value as f64);
    }
}

/// RAII guard that increments a counter on creation and decrements it on
/// drop, even on an early return or panic unwind through a worker task.
pub struct MetricsGuard<'a> {
    metrics: &'a BlockMetrics,
    phase: Phase,
}

#[derive(Clone, Copy)]
pub enum Phase {
    Input,
    Working,
    Output,
}

impl<'a> MetricsGuard<'a> {
    pub fn enter(metrics: &'a BlockMetrics, phase: Phase) -> Self {
        match phase {
            Phase::Input => metrics.incr_input(),
            Phase::Working => metrics.incr_working(),
            Phase::Output => metrics.incr_output(),
        }
        Self { metrics, phase }
    }
}

impl Drop for MetricsGuard<'_> {
    fn drop(&mut self) {
        match self.phase {
            Phase::Input => self.metrics.decr_input(),
            Phase::Working => self.metrics.decr_working(),
            Phase::Output => self.metrics.decr_output(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};
    use metrics_util::{CompositeKey, MetricKind};

    #[test]
    fn gauge_reflects_guard_enter_and_drop() {
        let recorder = DebuggingRecorder::default();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            let metrics = BlockMetrics::new("test-gauge");

            {
                let _guard = MetricsGuard::enter(&metrics, Phase::Working);
                assert_eq!(metrics.working_count(), 1);

                let snapshot = snapshotter.snapshot().into_vec();
                let working_key = metrics::Key::from_parts(
                    "pipeweave_block_items",
                    vec![
                        metrics::Label::new("block", "test-gauge"),
                        metrics::Label::new("stage", "working"),
                    ],
                );
                let expected = (
                    CompositeKey::new(MetricKind::Gauge, working_key),
                    None,
                    None,
                    DebugValue::Gauge(1.0.into()),
                );
                assert!(
                    snapshot.contains(&expected),
                    "expected a working gauge of 1.0, got {snapshot:?}"
                );
            }

            assert_eq!(metrics.working_count(), 0);
        });
    }
}
