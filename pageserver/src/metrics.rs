use std::collections::HashMap;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, Histogram,
    HistogramVec, IntCounterVec, IntGaugeVec,
};
use strum::{EnumCount, IntoEnumIterator};
use strum_macros::{EnumIter, IntoStaticStr};
use utils::id::TenantId;

use crate::tenant::tasks::BackgroundLoopKind;

/// Prometheus histogram buckets (in seconds) that capture the majority of
/// latencies in the microsecond range but also extend far enough up to distinguish
/// "bad" from "really bad".
fn get_buckets_for_critical_operations() -> Vec<f64> {
    let buckets_per_digit = 5;
    let min_exponent = -6;
    let max_exponent = 2;

    let mut buckets = vec![];
    // Compute 10^(exp / buckets_per_digit) instead of 10^(1/buckets_per_digit)^exp
    // because it's more numerically stable and doesn't result in numbers like 9.999999
    for exp in (min_exponent * buckets_per_digit)..=(max_exponent * buckets_per_digit) {
        buckets.push(10_f64.powf(exp as f64 / buckets_per_digit as f64))
    }
    buckets
}

/// Operations on the storage repository that are timed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum StorageTimeOperation {
    LayerFlush,
    Compact,
    CreateImages,
    Gc,
    LoadLayerMap,
}

static STORAGE_TIME_GLOBAL: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "pageserver_storage_operations_seconds",
        "Time spent on storage operations",
        &["operation"],
        get_buckets_for_critical_operations(),
    )
    .expect("failed to define a metric")
});

impl StorageTimeOperation {
    /// Histogram for this operation. Use `start_timer()` on the result; it records on drop.
    pub fn histogram(self) -> Histogram {
        let op: &'static str = self.into();
        STORAGE_TIME_GLOBAL.with_label_values(&[op])
    }
}

pub static TENANT_STATE_METRIC: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "pageserver_tenant_states_count",
        "Count of tenants per state",
        &["state"]
    )
    .expect("Failed to register pageserver_tenant_states_count metric")
});

pub(crate) static BACKGROUND_LOOP_PERIOD_OVERRUN_COUNT: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pageserver_background_loop_period_overrun_count",
        "Incremented whenever warn_when_period_overrun() logs a warning.",
        &["task", "period"],
    )
    .expect("failed to define a metric")
});

pub(crate) fn observe_period_overrun(task: BackgroundLoopKind, period: Duration) {
    let task: &'static str = task.into();
    BACKGROUND_LOOP_PERIOD_OVERRUN_COUNT
        .with_label_values(&[task, &format!("{}", period.as_secs())])
        .inc();
}

static TENANT_TASK_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pageserver_tenant_task_events",
        "Number of task start/stop/fail events.",
        &["event"],
    )
    .expect("Failed to register tenant_task_events metric")
});

/// Lifecycle event of a background loop.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    IntoStaticStr,
    EnumIter,
    strum_macros::EnumCount,
    strum_macros::VariantNames,
)]
#[strum(serialize_all = "snake_case")]
pub enum TaskEvent {
    Start,
    Stop,
    Panic,
}

/// Receiver of background loop lifecycle events.
///
/// Every spawned loop records exactly one `Start` and, once it has exited, exactly one
/// `Stop`. A loop that panicked records `Panic` as well, before its `Stop`.
pub trait TaskEventSink: Send + Sync + 'static {
    fn record(&self, tenant_id: TenantId, kind: BackgroundLoopKind, event: TaskEvent);
}

/// Feeds the `pageserver_tenant_task_events` counter.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusTaskEvents;

impl TaskEventSink for PrometheusTaskEvents {
    fn record(&self, _tenant_id: TenantId, _kind: BackgroundLoopKind, event: TaskEvent) {
        let event: &'static str = event.into();
        TENANT_TASK_EVENTS.with_label_values(&[event]).inc();
    }
}

impl PrometheusTaskEvents {
    /// Current value of the process-wide counter for `event`.
    pub fn get(event: TaskEvent) -> u64 {
        let event: &'static str = event.into();
        TENANT_TASK_EVENTS.with_label_values(&[event]).get()
    }
}

/// In-memory sink, one counter per tenant, loop kind and event.
#[derive(Debug, Default)]
pub struct TaskEventCounts {
    counts: Mutex<HashMap<(TenantId, BackgroundLoopKind, TaskEvent), u64>>,
}

impl TaskEventSink for TaskEventCounts {
    fn record(&self, tenant_id: TenantId, kind: BackgroundLoopKind, event: TaskEvent) {
        *self
            .counts
            .lock()
            .entry((tenant_id, kind, event))
            .or_default() += 1;
    }
}

impl TaskEventCounts {
    pub fn get(&self, tenant_id: TenantId, kind: BackgroundLoopKind, event: TaskEvent) -> u64 {
        self.counts
            .lock()
            .get(&(tenant_id, kind, event))
            .copied()
            .unwrap_or(0)
    }

    /// Sum over all tenants and loop kinds.
    pub fn total(&self, event: TaskEvent) -> u64 {
        self.counts
            .lock()
            .iter()
            .filter(|((_, _, e), _)| *e == event)
            .map(|(_, count)| *count)
            .sum()
    }

    /// Totals indexed by `TaskEvent as usize`.
    pub fn totals(&self) -> [u64; TaskEvent::COUNT] {
        let mut totals = [0; TaskEvent::COUNT];
        for event in TaskEvent::iter() {
            totals[event as usize] = self.total(event);
        }
        totals
    }
}

#[cfg(test)]
mod tests {
    use strum::VariantNames;

    use super::*;

    #[test]
    fn task_event_counts_are_per_tenant_and_kind() {
        let counts = TaskEventCounts::default();
        let t1 = TenantId::generate();
        let t2 = TenantId::generate();

        counts.record(t1, BackgroundLoopKind::Gc, TaskEvent::Start);
        counts.record(t1, BackgroundLoopKind::Compaction, TaskEvent::Start);
        counts.record(t2, BackgroundLoopKind::Gc, TaskEvent::Start);
        counts.record(t2, BackgroundLoopKind::Gc, TaskEvent::Stop);

        assert_eq!(counts.get(t1, BackgroundLoopKind::Gc, TaskEvent::Start), 1);
        assert_eq!(counts.get(t1, BackgroundLoopKind::Gc, TaskEvent::Stop), 0);
        assert_eq!(counts.total(TaskEvent::Start), 3);
        assert_eq!(counts.totals(), [3, 1, 0]);
    }

    #[test]
    fn prometheus_sink_feeds_counter() {
        let before = PrometheusTaskEvents::get(TaskEvent::Panic);
        PrometheusTaskEvents.record(TenantId::generate(), BackgroundLoopKind::Gc, TaskEvent::Panic);
        assert!(PrometheusTaskEvents::get(TaskEvent::Panic) > before);
        assert_eq!(TaskEvent::VARIANTS, &["start", "stop", "panic"]);
    }
}
