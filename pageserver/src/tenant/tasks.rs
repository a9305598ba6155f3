//! This module contains per-tenant background processes, e.g. compaction and GC.
//!
//! [`BackgroundLoops`] owns the loops of one tenant. Each activation gets its own
//! [`CancellationToken`]; once cancelled it stays cancelled, and a later activation
//! starts fresh loops with a new token.

use std::collections::HashMap;
use std::future::IntoFuture;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::*;
use utils::backoff::exponential_backoff_duration;
use utils::id::TenantId;

use crate::metrics::{self, TaskEvent, TaskEventSink};
use crate::tenant::{GcError, Tenant};

/// Background jobs of a tenant.
#[derive(
    Debug, PartialEq, Eq, Hash, Clone, Copy, strum_macros::IntoStaticStr, strum_macros::Display,
)]
#[strum(serialize_all = "snake_case")]
pub enum BackgroundLoopKind {
    Compaction,
    Gc,
}

impl BackgroundLoopKind {
    pub const ALL: [BackgroundLoopKind; 2] = [BackgroundLoopKind::Compaction, BackgroundLoopKind::Gc];
}

const BASE_BACKOFF_SECS: f64 = 1.0;
const MAX_BACKOFF_SECS: f64 = 300.0;
/// How often a disabled loop looks at the configuration again.
const RECHECK_CONFIG_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Default)]
struct LoopsInner {
    /// Token of the current activation. `None` while the loops should not run.
    cancel: Option<CancellationToken>,
    /// Most recently spawned loop of each kind; it may be winding down after a cancel.
    handles: HashMap<BackgroundLoopKind, JoinHandle<()>>,
}

/// Supervisor of a tenant's GC and compaction loops.
pub struct BackgroundLoops {
    tenant_id: TenantId,
    events: Arc<dyn TaskEventSink>,
    runtime: Handle,
    inner: Mutex<LoopsInner>,
}

/// Resolves once every loop that was running when the tenant started stopping has exited.
#[must_use = "the loops are only known to be stopped once this is awaited"]
pub struct LoopsStopping {
    tenant_id: TenantId,
    handles: Vec<(BackgroundLoopKind, JoinHandle<()>)>,
}

impl IntoFuture for LoopsStopping {
    type Output = ();
    type IntoFuture = BoxFuture<'static, ()>;

    fn into_future(self) -> Self::IntoFuture {
        async move {
            let LoopsStopping { tenant_id, handles } = self;
            for (kind, handle) in handles {
                if let Err(e) = handle.await {
                    // panics are caught inside the task, this is a runtime shutdown
                    warn!(%tenant_id, "{kind} loop did not run to completion: {e}");
                }
            }
        }
        .boxed()
    }
}

impl BackgroundLoops {
    pub fn new(tenant_id: TenantId, events: Arc<dyn TaskEventSink>, runtime: Handle) -> Self {
        BackgroundLoops {
            tenant_id,
            events,
            runtime,
            inner: Mutex::new(LoopsInner::default()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().cancel.is_some()
    }

    /// Start the GC and compaction loops. A no-op if they are already running.
    pub fn on_tenant_active(&self, tenant: &Arc<Tenant>) {
        let mut inner = self.inner.lock();
        if inner.cancel.is_some() {
            debug!(tenant_id = %self.tenant_id, "background loops already running");
            return;
        }
        let cancel = CancellationToken::new();
        inner.cancel = Some(cancel.clone());

        for kind in BackgroundLoopKind::ALL {
            let predecessor = inner.handles.remove(&kind);
            self.events.record(self.tenant_id, kind, TaskEvent::Start);
            let span = match kind {
                BackgroundLoopKind::Compaction => {
                    info_span!(parent: None, "compaction_loop", tenant_id = %self.tenant_id)
                }
                BackgroundLoopKind::Gc => {
                    info_span!(parent: None, "gc_loop", tenant_id = %self.tenant_id)
                }
            };
            let handle = self.runtime.spawn(
                run_loop(
                    kind,
                    Arc::clone(tenant),
                    cancel.clone(),
                    Arc::clone(&self.events),
                    predecessor,
                )
                .instrument(span),
            );
            inner.handles.insert(kind, handle);
        }
        info!(tenant_id = %self.tenant_id, "started background loops");
    }

    /// Signal the loops to stop, without waiting for them.
    pub fn on_tenant_idle(&self) {
        if let Some(cancel) = self.inner.lock().cancel.take() {
            info!(tenant_id = %self.tenant_id, "stopping background loops");
            cancel.cancel();
        }
    }

    /// Signal the loops to stop. Await the result to wait until they have exited.
    pub fn on_tenant_stopping(&self) -> LoopsStopping {
        let mut inner = self.inner.lock();
        if let Some(cancel) = inner.cancel.take() {
            cancel.cancel();
        }
        LoopsStopping {
            tenant_id: self.tenant_id,
            handles: inner.handles.drain().collect(),
        }
    }
}

async fn run_loop(
    kind: BackgroundLoopKind,
    tenant: Arc<Tenant>,
    cancel: CancellationToken,
    events: Arc<dyn TaskEventSink>,
    predecessor: Option<JoinHandle<()>>,
) {
    let tenant_id = tenant.tenant_id();
    // Recorded when the task finishes, however it finishes.
    scopeguard::defer!(events.record(tenant_id, kind, TaskEvent::Stop));

    // The loop of the previous activation may still be finishing an iteration.
    if let Some(predecessor) = predecessor {
        if let Err(e) = predecessor.await {
            warn!("previous {kind} loop did not run to completion: {e}");
        }
    }

    let body = match kind {
        BackgroundLoopKind::Compaction => compaction_loop(tenant, cancel).boxed(),
        BackgroundLoopKind::Gc => gc_loop(tenant, cancel).boxed(),
    };
    if let Err(panic) = AssertUnwindSafe(body).catch_unwind().await {
        error!("{kind} loop panicked: {}", panic_message(panic.as_ref()));
        events.record(tenant_id, kind, TaskEvent::Panic);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    match payload.downcast_ref::<&'static str>() {
        Some(s) => *s,
        None => match payload.downcast_ref::<String>() {
            Some(s) => s.as_str(),
            None => "Box<dyn Any>",
        },
    }
}

/// Sleeps for `duration`. Returns true if `cancel` fired first.
async fn sleep_or_cancelled(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::time::timeout(duration, cancel.cancelled())
        .await
        .is_ok()
}

/// Compaction task's main loop.
async fn compaction_loop(tenant: Arc<Tenant>, cancel: CancellationToken) {
    let mut error_run = 0; // consecutive errors

    loop {
        // Refresh the period. If compaction is disabled, check again in a bit.
        let period = tenant.get_compaction_period();
        if period == Duration::ZERO {
            #[cfg(not(feature = "testing"))]
            info!("automatic compaction is disabled");
            if sleep_or_cancelled(RECHECK_CONFIG_INTERVAL, &cancel).await {
                return;
            }
            continue;
        }

        // Wait for the next compaction run.
        let wait = if error_run > 0 {
            exponential_backoff_duration(error_run, BASE_BACKOFF_SECS, MAX_BACKOFF_SECS)
        } else {
            period
        };
        if sleep_or_cancelled(wait, &cancel).await || cancel.is_cancelled() {
            return;
        }

        let started_at = Instant::now();
        match tenant.compaction_iteration().await {
            Ok(()) => error_run = 0,
            Err(e) => {
                error_run += 1;
                let backoff =
                    exponential_backoff_duration(error_run, BASE_BACKOFF_SECS, MAX_BACKOFF_SECS);
                error!("Compaction failed {error_run} times, retrying in {backoff:?}: {e:#}");
            }
        }
        let elapsed = started_at.elapsed();
        warn_when_period_overrun(elapsed, period, BackgroundLoopKind::Compaction);
        debug!(elapsed_ms = elapsed.as_millis(), "compaction iteration complete");
    }
}

/// GC task's main loop.
async fn gc_loop(tenant: Arc<Tenant>, cancel: CancellationToken) {
    let mut error_run = 0; // consecutive errors

    loop {
        let period = tenant.get_gc_period();
        let gc_horizon = tenant.get_gc_horizon();

        let sleep_duration = if period == Duration::ZERO || gc_horizon == 0 {
            #[cfg(not(feature = "testing"))]
            info!("automatic GC is disabled");
            // check again in a bit, in case it's been enabled again.
            RECHECK_CONFIG_INTERVAL
        } else if error_run > 0 {
            exponential_backoff_duration(error_run, BASE_BACKOFF_SECS, MAX_BACKOFF_SECS)
        } else {
            period
        };
        if sleep_or_cancelled(sleep_duration, &cancel).await || cancel.is_cancelled() {
            return;
        }
        if period == Duration::ZERO || gc_horizon == 0 {
            continue;
        }

        let started_at = Instant::now();
        match tenant
            .gc_iteration(None, gc_horizon, tenant.get_pitr_interval())
            .await
        {
            Ok(result) => {
                error_run = 0;
                debug!(?result, "gc iteration complete");
            }
            Err(GcError::NotActive) => {
                info!("tenant is no longer active, stopping gc loop");
                return;
            }
            Err(e) => {
                error_run += 1;
                let wait_duration =
                    exponential_backoff_duration(error_run, BASE_BACKOFF_SECS, MAX_BACKOFF_SECS);
                error!("Gc failed {error_run} times, retrying in {wait_duration:?}: {e:#}");
            }
        }
        warn_when_period_overrun(started_at.elapsed(), period, BackgroundLoopKind::Gc);
    }
}

// NB: the `task` and `period` are used for metrics labels.
pub(crate) fn warn_when_period_overrun(
    elapsed: Duration,
    period: Duration,
    task: BackgroundLoopKind,
) {
    // Duration::ZERO will happen because it's the "disable [bgtask]" value.
    if elapsed >= period && period != Duration::ZERO {
        // humantime does no significant digits clamping whereas Duration's debug is a bit more
        // intelligent. however it makes sense to keep the "configuration format" for period, even
        // though there's no way to output the actual config value.
        warn!(
            ?elapsed,
            period = %humantime::format_duration(period),
            ?task,
            "task iteration took longer than the configured period"
        );
        metrics::observe_period_overrun(task, period);
    }
}

#[cfg(test)]
mod tests {
    use utils::lsn::Lsn;

    use super::*;
    use crate::tenant::harness::{TenantHarness, TIMELINE_ID};

    #[tokio::test]
    async fn starting_twice_is_a_no_op() -> anyhow::Result<()> {
        let harness = TenantHarness::create("starting_twice_is_a_no_op")?;
        let tenant = harness.load().await;
        assert!(!tenant.background_loops.is_running());

        tenant.create_empty_timeline(TIMELINE_ID, Lsn(0x10))?;
        assert_eq!(harness.events.total(TaskEvent::Start), 2);

        tenant.background_loops.on_tenant_active(&tenant);
        tenant.background_loops.on_tenant_active(&tenant);
        assert_eq!(harness.events.total(TaskEvent::Start), 2);

        tenant.background_loops.on_tenant_stopping().await;
        assert_eq!(harness.events.totals(), [2, 2, 0]);
        Ok(())
    }

    #[tokio::test]
    async fn restart_after_idle_uses_new_loops() -> anyhow::Result<()> {
        let harness = TenantHarness::create("restart_after_idle_uses_new_loops")?;
        let tenant = harness.load().await;
        let loops = &tenant.background_loops;

        loops.on_tenant_active(&tenant);
        loops.on_tenant_idle();
        assert!(!loops.is_running());
        // idle twice is fine too
        loops.on_tenant_idle();

        loops.on_tenant_active(&tenant);
        assert!(loops.is_running());
        loops.on_tenant_stopping().await;
        for kind in BackgroundLoopKind::ALL {
            assert_eq!(harness.events.get(tenant.tenant_id(), kind, TaskEvent::Start), 2);
            assert_eq!(harness.events.get(tenant.tenant_id(), kind, TaskEvent::Stop), 2);
        }
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_is_cut_short_by_cancel() {
        let cancel = CancellationToken::new();
        assert!(!sleep_or_cancelled(Duration::from_secs(1), &cancel).await);

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            canceller.cancel();
        });
        let started = tokio::time::Instant::now();
        assert!(sleep_or_cancelled(Duration::from_secs(3600), &cancel).await);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
