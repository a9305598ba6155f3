//!
//! Timeline repository implementation that keeps old data in files on disk, and
//! the recent changes in memory. See the files under tenant/storage_layer/.
//!
//! The files are stored in the .neon/tenants/<tenant_id>/timelines/<timeline_id>
//! directory. In addition to the layer files, there is a metadata file in the same
//! directory that contains information about the timeline, in particular its
//! parent timeline, and the last LSN that has been written to disk.
//!
//! A [`Tenant`] owns its timelines, the tenant config, the lifecycle state and the
//! GC and compaction loops. State changes go through [`state::transition`]; the
//! loop side effects are carried out by [`tasks::BackgroundLoops`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context};
use camino::Utf8Path;
use pageserver_api::models::{TenantInfo, TenantState, TimelineState};
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::*;
use utils::{
    crashsafe,
    id::{TenantId, TimelineId},
    lsn::Lsn,
};

use crate::config::PageServerConf;
use crate::metrics::{TaskEventSink, TENANT_STATE_METRIC};
use crate::task_mgr;
use crate::tenant::config::{TenantConf, TenantConfOpt};
use crate::tenant::gc_result::GcResult;
use crate::tenant::metadata::{load_metadata, save_metadata_to, TimelineMetadata};
use crate::tenant::state::{Intent, Transition, TransitionError, Trigger};
use crate::tenant::tasks::{BackgroundLoops, LoopsStopping};
use crate::{is_temporary, METADATA_FILE_NAME, TEMP_FILE_SUFFIX};

pub mod config;
pub mod gc_result;
pub mod layer_map;
pub mod metadata;
pub mod mgr;
pub mod state;
pub mod storage_layer;
pub mod tasks;
pub mod timeline;

pub use timeline::{
    CheckpointConfig, CompactionError, PageReconstructError, Timeline, TimelineWriter,
};

/// Error returned by [`Tenant::gc_iteration`].
#[derive(Debug, thiserror::Error)]
pub enum GcError {
    #[error("tenant is not active")]
    NotActive,

    #[error("timeline {0} not found")]
    TimelineNotFound(TimelineId),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum CreateTimelineError {
    #[error("a timeline with the given ID already exists")]
    AlreadyExists,

    #[error("tenant is not active")]
    NotActive,

    #[error("ancestor timeline {0} not found")]
    AncestorNotFound(TimelineId),

    #[error(transparent)]
    AncestorLsn(anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum GetTimelineError {
    #[error("timeline {tenant_id}/{timeline_id} is not active, state: {state:?}")]
    NotActive {
        tenant_id: TenantId,
        timeline_id: TimelineId,
        state: TimelineState,
    },

    #[error("timeline {tenant_id}/{timeline_id} was not found")]
    NotFound {
        tenant_id: TenantId,
        timeline_id: TimelineId,
    },
}

/// How a new timeline starts out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateTimelineParams {
    /// An empty timeline whose history begins at `initdb_lsn`.
    Bootstrap { initdb_lsn: Lsn },
    /// A branch of an existing timeline at `ancestor_start_lsn`, or at the
    /// ancestor's last record LSN if none is given.
    Branch {
        ancestor_timeline_id: TimelineId,
        ancestor_start_lsn: Option<Lsn>,
    },
}

///
/// Tenant consists of multiple timelines. Keep them in a hash table.
///
pub struct Tenant {
    conf: &'static PageServerConf,
    tenant_id: TenantId,

    state: watch::Sender<TenantState>,
    /// Held while a state change and its loop intents are applied.
    state_transition_lock: Mutex<()>,

    // Overridden tenant-specific config parameters.
    // We keep TenantConfOpt sturct here to preserve the information
    // about parameters that are not set.
    // This is necessary to allow global config updates.
    tenant_conf: Arc<RwLock<TenantConfOpt>>,

    timelines: Mutex<HashMap<TimelineId, Arc<Timeline>>>,

    // This mutex prevents creation of new timelines during GC.
    // Adding yet another mutex (in addition to `timelines`) is needed because holding
    // `timelines` mutex during all GC iteration
    // may block for a long time `get_timeline`, `get_timelines_state`,... and other operations
    // with timelines, which in turn may cause dropping replication connection, expiration of wait_for_lsn
    // timeout...
    gc_cs: tokio::sync::Mutex<()>,

    background_loops: BackgroundLoops,
}

impl std::fmt::Debug for Tenant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.tenant_id, self.current_state())
    }
}

impl Tenant {
    pub(crate) fn new(
        state: TenantState,
        conf: &'static PageServerConf,
        tenant_conf: TenantConfOpt,
        tenant_id: TenantId,
        events: Arc<dyn TaskEventSink>,
        runtime: Handle,
    ) -> Tenant {
        TENANT_STATE_METRIC
            .with_label_values(&[state.as_ref()])
            .inc();
        let (state, _) = watch::channel(state);
        Tenant {
            conf,
            tenant_id,
            state,
            state_transition_lock: Mutex::new(()),
            tenant_conf: Arc::new(RwLock::new(tenant_conf)),
            timelines: Mutex::new(HashMap::new()),
            gc_cs: tokio::sync::Mutex::new(()),
            background_loops: BackgroundLoops::new(tenant_id, events, runtime),
        }
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn current_state(&self) -> TenantState {
        self.state.borrow().clone()
    }

    pub fn subscribe_for_state_updates(&self) -> watch::Receiver<TenantState> {
        self.state.subscribe()
    }

    /// Waits until loading is over. Fails if the tenant ends up anywhere but Active.
    pub async fn wait_to_become_active(&self) -> anyhow::Result<()> {
        let mut receiver = self.state.subscribe();
        loop {
            let current_state = receiver.borrow_and_update().clone();
            match current_state {
                TenantState::Loading => {
                    receiver
                        .changed()
                        .await
                        .context("tenant state sender dropped while loading")?;
                }
                TenantState::Active { .. } => return Ok(()),
                other => bail!(
                    "tenant {} will not become active, current state: {other:?}",
                    self.tenant_id
                ),
            }
        }
    }

    /// Whether the GC and compaction loops of this tenant are currently running.
    pub fn background_loops_running(&self) -> bool {
        self.background_loops.is_running()
    }

    ///
    /// Apply a lifecycle trigger: store the new state and hand the resulting
    /// intents to the loop supervisor.
    ///
    /// Triggers that depend on the set of timelines are applied with the
    /// `timelines` lock held, so the state always agrees with the map.
    ///
    fn apply_trigger(
        self: &Arc<Self>,
        trigger: Trigger,
    ) -> Result<Option<LoopsStopping>, TransitionError> {
        let _guard = self.state_transition_lock.lock();
        let current = self.current_state();
        let Transition { new_state, intents } = state::transition(&current, trigger)?;

        if new_state != current {
            info!(tenant_id = %self.tenant_id, "tenant state changed from {current} to {new_state}");
            TENANT_STATE_METRIC
                .with_label_values(&[current.as_ref()])
                .dec();
            TENANT_STATE_METRIC
                .with_label_values(&[new_state.as_ref()])
                .inc();
            self.state.send_replace(new_state);
        }

        let mut stopping = None;
        for intent in intents {
            match intent {
                Intent::StartLoops if !self.conf.background_jobs_enabled => {
                    info!(tenant_id = %self.tenant_id, "background jobs are disabled, not starting gc and compaction loops");
                }
                Intent::StartLoops => self.background_loops.on_tenant_active(self),
                Intent::SignalStop => self.background_loops.on_tenant_idle(),
                Intent::StopAndWait => {
                    stopping = Some(self.background_loops.on_tenant_stopping())
                }
            }
        }
        Ok(stopping)
    }

    /// Loading is done: become Active, starting the loops if there are timelines.
    pub(crate) fn activate(self: &Arc<Self>) -> Result<(), TransitionError> {
        let timelines = self.timelines.lock();
        let has_timelines = !timelines.is_empty();
        // Activation never yields a stop intent.
        let _ = self.apply_trigger(Trigger::Activate { has_timelines })?;
        drop(timelines);
        Ok(())
    }

    pub(crate) fn set_broken(self: &Arc<Self>, reason: String) {
        if let Err(e) = self.apply_trigger(Trigger::LoadFailed { reason }) {
            warn!(tenant_id = %self.tenant_id, "could not mark tenant broken: {e}");
        }
    }

    ///
    /// Read the timelines of this tenant from disk and make them Active, ancestors first.
    ///
    /// Leftover temporary entries in the timelines directory are removed; entries that
    /// are not timeline directories are skipped with a warning.
    ///
    pub(crate) fn load_local_timelines(self: &Arc<Self>) -> anyhow::Result<()> {
        let timelines_path = self.conf.timelines_path(&self.tenant_id);
        let mut timelines_to_load: HashMap<TimelineId, TimelineMetadata> = HashMap::new();

        for entry in timelines_path
            .read_dir_utf8()
            .with_context(|| format!("read timelines directory {timelines_path}"))?
        {
            let entry = entry.with_context(|| format!("read entry in {timelines_path}"))?;
            let path = entry.path();
            if is_temporary(path) {
                info!("removing temporary timeline entry {path}");
                let res = if path.is_dir() {
                    std::fs::remove_dir_all(path)
                } else {
                    std::fs::remove_file(path)
                };
                res.with_context(|| format!("remove temporary entry {path}"))?;
                continue;
            }

            let Some(timeline_id) = entry
                .file_name()
                .parse::<TimelineId>()
                .ok()
                .filter(|_| path.is_dir())
            else {
                warn!("unrecognized entry in timelines directory: {path}");
                continue;
            };
            let metadata = load_metadata(self.conf, &self.tenant_id, &timeline_id)
                .with_context(|| format!("load metadata of timeline {timeline_id}"))?;
            timelines_to_load.insert(timeline_id, metadata);
        }

        let sorted = tree_sort_timelines(timelines_to_load, |m| m.ancestor_timeline())?;
        for (timeline_id, metadata) in sorted {
            let ancestor = match metadata.ancestor_timeline() {
                Some(ancestor_id) => Some(
                    self.timelines
                        .lock()
                        .get(&ancestor_id)
                        .cloned()
                        .ok_or_else(|| anyhow!("ancestor {ancestor_id} of timeline {timeline_id} is not loaded"))?,
                ),
                None => None,
            };
            let timeline = Timeline::new(
                self.conf,
                Arc::clone(&self.tenant_conf),
                &metadata,
                ancestor,
                timeline_id,
                self.tenant_id,
            );
            timeline
                .load_layer_map()
                .with_context(|| format!("load layer map of timeline {timeline_id}"))?;
            timeline.set_state(TimelineState::Active);
            self.timelines.lock().insert(timeline_id, timeline);
        }
        Ok(())
    }

    /// Load the timelines in the background and activate, or mark the tenant broken.
    pub(crate) async fn load_and_activate(self: &Arc<Self>) {
        let tenant = Arc::clone(self);
        match task_mgr::run_blocking(move || tenant.load_local_timelines()).await {
            Ok(()) => {
                if let Err(e) = self.activate() {
                    warn!(tenant_id = %self.tenant_id, "failed to activate tenant: {e}");
                }
            }
            Err(e) => {
                error!(tenant_id = %self.tenant_id, "failed to load tenant: {e:#}");
                self.set_broken(format!("{e:#}"));
            }
        }
    }

    pub fn get_timeline(
        &self,
        timeline_id: TimelineId,
        active_only: bool,
    ) -> Result<Arc<Timeline>, GetTimelineError> {
        let timelines = self.timelines.lock();
        let timeline = timelines
            .get(&timeline_id)
            .ok_or(GetTimelineError::NotFound {
                tenant_id: self.tenant_id,
                timeline_id,
            })?;
        if active_only && !timeline.is_active() {
            Err(GetTimelineError::NotActive {
                tenant_id: self.tenant_id,
                timeline_id,
                state: timeline.current_state(),
            })
        } else {
            Ok(Arc::clone(timeline))
        }
    }

    /// Lists timelines the tenant contains.
    /// Up to tenant's implementation to omit certain timelines that are not considered ready for use.
    pub fn list_timelines(&self) -> Vec<Arc<Timeline>> {
        self.timelines.lock().values().cloned().collect()
    }

    pub async fn create_timeline(
        self: &Arc<Self>,
        new_timeline_id: TimelineId,
        params: CreateTimelineParams,
    ) -> Result<Arc<Timeline>, CreateTimelineError> {
        match params {
            CreateTimelineParams::Bootstrap { initdb_lsn } => {
                self.create_empty_timeline(new_timeline_id, initdb_lsn)
            }
            CreateTimelineParams::Branch {
                ancestor_timeline_id,
                ancestor_start_lsn,
            } => {
                self.branch_timeline(ancestor_timeline_id, new_timeline_id, ancestor_start_lsn)
                    .await
            }
        }
    }

    ///
    /// Create a new timeline with no data, starting at `initdb_lsn`.
    ///
    pub fn create_empty_timeline(
        self: &Arc<Self>,
        new_timeline_id: TimelineId,
        initdb_lsn: Lsn,
    ) -> Result<Arc<Timeline>, CreateTimelineError> {
        let new_metadata = TimelineMetadata::new(initdb_lsn, None, Lsn(0), initdb_lsn, initdb_lsn);
        self.create_timeline_files_and_struct(new_timeline_id, new_metadata, None)
    }

    ///
    /// Branch an existing timeline.
    ///
    /// The new timeline sees everything of `src_timeline_id` up to and including
    /// `start_lsn`, which defaults to the source's last record LSN.
    ///
    pub async fn branch_timeline(
        self: &Arc<Self>,
        src_timeline_id: TimelineId,
        dst_timeline_id: TimelineId,
        start_lsn: Option<Lsn>,
    ) -> Result<Arc<Timeline>, CreateTimelineError> {
        // We need to hold this lock to prevent GC from starting at the same time. GC scans the directory to learn
        // about timelines, so otherwise a race condition is possible, where we create new timeline and GC
        // concurrently removes data that is needed by the new timeline.
        let _gc_cs = self.gc_cs.lock().await;

        let src_timeline = self
            .get_timeline(src_timeline_id, true)
            .map_err(|_| CreateTimelineError::AncestorNotFound(src_timeline_id))?;

        let start_lsn = start_lsn.unwrap_or_else(|| src_timeline.get_last_record_lsn());

        // Ensure that `start_lsn` is valid, i.e. the LSN is within the PITR
        // horizon on the source timeline
        //
        // We check it against both the planned GC cutoff stored in 'gc_info',
        // and the 'latest_gc_cutoff' of the last GC that was performed.  The
        // planned GC cutoff in 'gc_info' is normally larger than
        // 'latest_gc_cutoff_lsn', but beware of corner cases like if you just
        // changed the GC settings for the tenant to make the PITR window
        // larger, but some of the data was already removed by an earlier GC
        // iteration.
        let latest_gc_cutoff_lsn = src_timeline.get_latest_gc_cutoff_lsn();
        if start_lsn < latest_gc_cutoff_lsn {
            return Err(CreateTimelineError::AncestorLsn(anyhow!(
                "invalid branch start lsn: less than latest GC cutoff {latest_gc_cutoff_lsn}"
            )));
        }
        let planned_cutoff = {
            let gc_info = src_timeline.gc_info.read();
            Lsn::min(gc_info.horizon_cutoff, gc_info.pitr_cutoff)
        };
        if start_lsn < planned_cutoff {
            return Err(CreateTimelineError::AncestorLsn(anyhow!(
                "invalid branch start lsn: less than planned GC cutoff {planned_cutoff}"
            )));
        }
        let last_record_lsn = src_timeline.get_last_record_lsn();
        if start_lsn > last_record_lsn {
            return Err(CreateTimelineError::AncestorLsn(anyhow!(
                "invalid branch start lsn: ahead of the last record lsn {last_record_lsn}"
            )));
        }

        let metadata = TimelineMetadata::new(
            start_lsn,
            Some(src_timeline_id),
            start_lsn,
            start_lsn,
            src_timeline.get_initdb_lsn(),
        );
        let new_timeline =
            self.create_timeline_files_and_struct(dst_timeline_id, metadata, Some(src_timeline))?;
        info!("branched timeline {dst_timeline_id} from {src_timeline_id} at {start_lsn}");
        Ok(new_timeline)
    }

    fn create_timeline_files_and_struct(
        self: &Arc<Self>,
        new_timeline_id: TimelineId,
        new_metadata: TimelineMetadata,
        ancestor: Option<Arc<Timeline>>,
    ) -> Result<Arc<Timeline>, CreateTimelineError> {
        let mut timelines = self.timelines.lock();
        if !self.current_state().is_active() {
            return Err(CreateTimelineError::NotActive);
        }
        if timelines.contains_key(&new_timeline_id) {
            return Err(CreateTimelineError::AlreadyExists);
        }

        let timeline_path = self.conf.timeline_path(&self.tenant_id, &new_timeline_id);
        if timeline_path.exists() {
            return Err(CreateTimelineError::AlreadyExists);
        }
        let temp_path = crashsafe::path_with_suffix_extension(&timeline_path, TEMP_FILE_SUFFIX);
        if let Err(e) = self.create_timeline_files(&temp_path, &timeline_path, &new_metadata) {
            if temp_path.exists() {
                if let Err(cleanup_err) = std::fs::remove_dir_all(&temp_path) {
                    warn!("failed to clean up partially created timeline {temp_path}: {cleanup_err}");
                }
            }
            return Err(CreateTimelineError::Other(e));
        }

        let new_timeline = Timeline::new(
            self.conf,
            Arc::clone(&self.tenant_conf),
            &new_metadata,
            ancestor,
            new_timeline_id,
            self.tenant_id,
        );
        new_timeline.set_state(TimelineState::Active);
        timelines.insert(new_timeline_id, Arc::clone(&new_timeline));

        if let Err(e) = self.apply_trigger(Trigger::TimelineAdded) {
            warn!(tenant_id = %self.tenant_id, "timeline added in unexpected state: {e}");
        }
        drop(timelines);
        Ok(new_timeline)
    }

    /// Build the timeline directory under `temp_path` and rename it into place, so a
    /// crash never leaves a timeline directory without metadata.
    fn create_timeline_files(
        &self,
        temp_path: &Utf8Path,
        timeline_path: &Utf8Path,
        metadata: &TimelineMetadata,
    ) -> anyhow::Result<()> {
        if temp_path.exists() {
            std::fs::remove_dir_all(temp_path)
                .with_context(|| format!("remove leftover temporary timeline {temp_path}"))?;
        }
        crashsafe::create_dir(temp_path)
            .with_context(|| format!("create timeline directory {temp_path}"))?;
        save_metadata_to(&temp_path.join(METADATA_FILE_NAME), metadata)
            .context("save timeline metadata")?;

        fail::fail_point!(
            crate::failpoint_support::names::TIMELINE_CREATION_BEFORE_TMP_RENAME,
            |_| {
                bail!(
                    "failpoint {}",
                    crate::failpoint_support::names::TIMELINE_CREATION_BEFORE_TMP_RENAME
                )
            }
        );

        std::fs::rename(temp_path, timeline_path)
            .with_context(|| format!("rename {temp_path} to {timeline_path}"))?;
        let timelines_path = self.conf.timelines_path(&self.tenant_id);
        crashsafe::fsync(&timelines_path)
            .with_context(|| format!("fsync timelines directory {timelines_path}"))?;
        Ok(())
    }

    ///
    /// Delete a timeline and its files. Timelines that other timelines were branched
    /// from cannot be deleted.
    ///
    pub async fn delete_timeline(self: &Arc<Self>, timeline_id: TimelineId) -> anyhow::Result<()> {
        let timeline = {
            let mut timelines = self.timelines.lock();
            let children_exist = timelines
                .values()
                .any(|t| t.get_ancestor_timeline_id() == Some(timeline_id));
            if children_exist {
                bail!("cannot delete timeline {timeline_id}: it has child timelines");
            }
            let timeline = timelines
                .remove(&timeline_id)
                .ok_or_else(|| anyhow!("timeline {timeline_id} not found"))?;
            timeline.set_state(TimelineState::Stopping);

            if timelines.is_empty() {
                if let Err(e) = self.apply_trigger(Trigger::LastTimelineRemoved) {
                    warn!(tenant_id = %self.tenant_id, "last timeline removed in unexpected state: {e}");
                }
            }
            timeline
        };

        task_mgr::run_blocking(move || timeline.delete_local_files()).await?;
        info!("deleted timeline {timeline_id}");
        Ok(())
    }

    ///
    /// Perform one compaction iteration over all active timelines.
    ///
    pub async fn compaction_iteration(&self) -> anyhow::Result<()> {
        if !self.current_state().is_active() {
            return Ok(());
        }
        fail::fail_point!(crate::failpoint_support::names::COMPACTION_ITERATION);

        let timelines: Vec<Arc<Timeline>> = self
            .timelines
            .lock()
            .values()
            .filter(|t| t.is_active())
            .cloned()
            .collect();
        for timeline in timelines {
            let timeline_id = timeline.timeline_id;
            task_mgr::run_blocking(move || match timeline.compact() {
                // deleted under us
                Ok(()) | Err(CompactionError::NotActive) => Ok(()),
                Err(CompactionError::Other(e)) => Err(e),
            })
            .await
            .with_context(|| format!("compact timeline {timeline_id}"))?;
        }
        Ok(())
    }

    ///
    /// Perform one garbage collection iteration, removing old data files from disk.
    /// this function is periodically called by gc task.
    /// also it can be explicitly requested through page server api 'do_gc' command.
    ///
    /// `target_timeline_id` specifies the timeline to GC, or None for all.
    ///
    /// The `horizon` an `pitr` parameters determine how much WAL history needs to be retained.
    /// Also known as the retention period, or the GC cutoff point. `horizon` specifies
    /// the amount of history, as LSN difference from current latest LSN on each timeline.
    /// `pitr` specifies the same as a time difference from the current time. The effective
    /// GC cutoff point is determined conservatively by either `horizon` and `pitr`, whichever
    /// requires more history to be retained.
    //
    pub async fn gc_iteration(
        &self,
        target_timeline_id: Option<TimelineId>,
        horizon: u64,
        pitr: Duration,
    ) -> Result<GcResult, GcError> {
        if !self.current_state().is_active() {
            return Err(GcError::NotActive);
        }
        let started_at = Instant::now();
        let mut totals: GcResult = Default::default();

        let _gc_cs = self.gc_cs.lock().await;
        let gc_timelines = self.refresh_gc_info(target_timeline_id, horizon, pitr)?;

        for timeline in gc_timelines {
            if !timeline.is_active() {
                continue;
            }
            let result = task_mgr::run_blocking(move || timeline.gc()).await?;
            totals += result;
        }

        totals.elapsed = started_at.elapsed();
        Ok(totals)
    }

    /// Compute the branch points and cutoffs of every timeline GC will visit.
    fn refresh_gc_info(
        &self,
        target_timeline_id: Option<TimelineId>,
        horizon: u64,
        pitr: Duration,
    ) -> Result<Vec<Arc<Timeline>>, GcError> {
        let timelines = self.timelines.lock();
        if let Some(target_timeline_id) = target_timeline_id {
            if !timelines.contains_key(&target_timeline_id) {
                return Err(GcError::TimelineNotFound(target_timeline_id));
            }
        }

        // Scan all timelines. For each timeline, remember the timeline ID and
        // the branch point where it was created.
        let mut all_branchpoints: HashMap<TimelineId, Vec<Lsn>> = HashMap::new();
        for timeline in timelines.values() {
            if let Some(ancestor_id) = timeline.get_ancestor_timeline_id() {
                all_branchpoints
                    .entry(ancestor_id)
                    .or_default()
                    .push(timeline.get_ancestor_lsn());
            }
        }

        let mut gc_timelines = Vec::new();
        for (timeline_id, timeline) in timelines.iter() {
            if target_timeline_id.is_some_and(|target| target != *timeline_id) {
                continue;
            }
            let mut branchpoints = all_branchpoints.remove(timeline_id).unwrap_or_default();
            branchpoints.sort();
            let cutoff = timeline
                .get_last_record_lsn()
                .checked_sub(horizon)
                .unwrap_or(Lsn(0));
            timeline.update_gc_info(branchpoints, cutoff, pitr);
            gc_timelines.push(Arc::clone(timeline));
        }
        Ok(gc_timelines)
    }

    ///
    /// Stop the background loops and move the tenant to `Detached`.
    ///
    /// With `freeze_and_flush`, the in-memory layers of every timeline are written
    /// out once the loops are gone. A second caller waits for the first one.
    ///
    pub async fn shutdown(self: &Arc<Self>, freeze_and_flush: bool) -> Result<(), TransitionError> {
        match self.set_stopping()? {
            Some(stopping) => self.finish_shutdown(stopping, freeze_and_flush).await,
            None => {
                info!(tenant_id = %self.tenant_id, "tenant is already shutting down, waiting for it");
                let mut state = self.subscribe_for_state_updates();
                // The sender lives in `self`, so this only returns once Detached.
                let _ = state.wait_for(|s| *s == TenantState::Detached).await;
                Ok(())
            }
        }
    }

    /// Move the tenant to `Stopping` and signal its loops to exit.
    ///
    /// Returns `None` if the tenant was stopping or detached already. Does not wait, so
    /// callers can hold a lock across it.
    pub(crate) fn set_stopping(
        self: &Arc<Self>,
    ) -> Result<Option<LoopsStopping>, TransitionError> {
        let stopping = self.apply_trigger(Trigger::DetachRequested)?;
        if stopping.is_some() {
            for timeline in self.list_timelines() {
                timeline.set_state(TimelineState::Stopping);
            }
        }
        Ok(stopping)
    }

    /// Second half of a shutdown started by [`Tenant::set_stopping`]: wait for the loops,
    /// optionally flush, then move to `Detached`.
    pub(crate) async fn finish_shutdown(
        self: &Arc<Self>,
        stopping: LoopsStopping,
        freeze_and_flush: bool,
    ) -> Result<(), TransitionError> {
        stopping.await;

        if freeze_and_flush {
            for timeline in self.list_timelines() {
                let timeline_id = timeline.timeline_id;
                let res = task_mgr::run_blocking(move || {
                    timeline.checkpoint(CheckpointConfig::Flush)
                })
                .await;
                if let Err(e) = res {
                    warn!(tenant_id = %self.tenant_id, %timeline_id, "failed to flush timeline on shutdown: {e:#}");
                }
            }
        }

        let _ = self.apply_trigger(Trigger::LoopsStopped)?;
        Ok(())
    }

    pub fn tenant_conf(&self) -> TenantConfOpt {
        *self.tenant_conf.read()
    }

    /// The tenant overrides applied on top of the pageserver defaults.
    pub fn effective_config(&self) -> TenantConf {
        self.tenant_conf.read().merge(self.conf.default_tenant_conf)
    }

    pub fn get_compaction_period(&self) -> Duration {
        let tenant_conf = self.tenant_conf.read();
        tenant_conf
            .compaction_period
            .unwrap_or(self.conf.default_tenant_conf.compaction_period)
    }

    pub fn get_gc_period(&self) -> Duration {
        let tenant_conf = self.tenant_conf.read();
        tenant_conf
            .gc_period
            .unwrap_or(self.conf.default_tenant_conf.gc_period)
    }

    pub fn get_gc_horizon(&self) -> u64 {
        let tenant_conf = self.tenant_conf.read();
        tenant_conf
            .gc_horizon
            .unwrap_or(self.conf.default_tenant_conf.gc_horizon)
    }

    pub fn get_pitr_interval(&self) -> Duration {
        let tenant_conf = self.tenant_conf.read();
        tenant_conf
            .pitr_interval
            .unwrap_or(self.conf.default_tenant_conf.pitr_interval)
    }

    /// Apply `new_tenant_conf` on top of the current overrides and persist the result.
    pub fn update_tenant_config(&self, new_tenant_conf: TenantConfOpt) -> anyhow::Result<()> {
        let mut tenant_conf = self.tenant_conf.write();
        let mut updated = *tenant_conf;
        updated.update(&new_tenant_conf);
        Self::persist_tenant_config(&self.conf.tenant_config_path(&self.tenant_id), &updated)?;
        *tenant_conf = updated;
        Ok(())
    }

    pub(crate) fn persist_tenant_config(
        target_config_path: &Utf8Path,
        tenant_conf: &TenantConfOpt,
    ) -> anyhow::Result<()> {
        let temp_path = crashsafe::path_with_suffix_extension(target_config_path, TEMP_FILE_SUFFIX);
        let contents = tenant_conf.to_config_file()?;
        crashsafe::overwrite(target_config_path, &temp_path, contents.as_bytes())
            .with_context(|| format!("write tenant config {target_config_path}"))?;
        Ok(())
    }

    /// Read the tenant's config overrides. A missing file means no overrides.
    pub(crate) fn load_tenant_config(
        conf: &'static PageServerConf,
        tenant_id: &TenantId,
    ) -> anyhow::Result<TenantConfOpt> {
        let config_path = conf.tenant_config_path(tenant_id);
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => TenantConfOpt::from_config_file(&contents)
                .with_context(|| format!("parse tenant config {config_path}")),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("tenant config file {config_path} not found, using defaults");
                Ok(TenantConfOpt::default())
            }
            Err(e) => Err(e).with_context(|| format!("read tenant config {config_path}")),
        }
    }

    /// Sum of the layer file sizes of all timelines.
    pub fn current_physical_size(&self) -> u64 {
        self.timelines
            .lock()
            .values()
            .map(|timeline| timeline.physical_size())
            .sum()
    }

    pub fn info(&self) -> TenantInfo {
        TenantInfo {
            id: self.tenant_id,
            state: self.current_state(),
            current_physical_size: Some(self.current_physical_size()),
        }
    }
}

/// Given a Vec of timelines and their ancestors (timeline_id, ancestor_id),
/// perform a topological sort, so that the parent of each timeline comes
/// before the children.
/// E extracts the ancestor from T
/// This allows for T to be different. It can be TimelineMetadata, can be Timeline itself, etc.
fn tree_sort_timelines<T, E>(
    timelines: HashMap<TimelineId, T>,
    extractor: E,
) -> anyhow::Result<Vec<(TimelineId, T)>>
where
    E: Fn(&T) -> Option<TimelineId>,
{
    let mut result = Vec::with_capacity(timelines.len());

    let mut now = Vec::with_capacity(timelines.len());
    // (ancestor, children)
    let mut later: HashMap<TimelineId, Vec<(TimelineId, T)>> =
        HashMap::with_capacity(timelines.len());

    for (timeline_id, value) in timelines {
        if let Some(ancestor_id) = extractor(&value) {
            let children = later.entry(ancestor_id).or_default();
            children.push((timeline_id, value));
        } else {
            now.push((timeline_id, value));
        }
    }

    while let Some((timeline_id, metadata)) = now.pop() {
        result.push((timeline_id, metadata));
        // All children of this can be loaded now
        if let Some(mut children) = later.remove(&timeline_id) {
            now.append(&mut children);
        }
    }

    // All timelines should be visited now. Unless there were timelines with missing ancestors.
    if !later.is_empty() {
        for (missing_id, orphan_ids) in later {
            for (orphan_id, _) in orphan_ids {
                error!("could not load timeline {orphan_id} because its ancestor timeline {missing_id} could not be loaded");
            }
        }
        bail!("could not load tenant because some timelines are missing ancestors");
    }

    Ok(result)
}

#[cfg(test)]
pub(crate) mod harness {
    use bytes::Bytes;
    use camino_tempfile::Utf8TempDir;
    use once_cell::sync::OnceCell;
    use utils::logging::{self, LogFormat, Output};

    use super::*;
    use crate::metrics::TaskEventCounts;

    pub const TIMELINE_ID: TimelineId = TimelineId::from_array([
        0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77,
        0x88,
    ]);
    pub const NEW_TIMELINE_ID: TimelineId = TimelineId::from_array([
        0xAA, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77,
        0x88,
    ]);

    /// Convenience function to create a page image with given string as the only content
    pub fn test_img(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    static LOG_HANDLE: OnceCell<()> = OnceCell::new();

    pub fn setup_logging() {
        LOG_HANDLE.get_or_init(|| {
            logging::init(LogFormat::Test, Output::Stdout).expect("Failed to init test logging")
        });
    }

    pub struct TenantHarness {
        pub conf: &'static PageServerConf,
        pub tenant_conf: TenantConfOpt,
        pub tenant_id: TenantId,
        pub events: Arc<TaskEventCounts>,
        _repo_dir: Utf8TempDir,
    }

    impl TenantHarness {
        pub fn create(test_name: &'static str) -> anyhow::Result<Self> {
            setup_logging();

            let repo_dir = camino_tempfile::Builder::new()
                .prefix(test_name)
                .tempdir()
                .context("create test repo dir")?;
            let conf = PageServerConf::dummy_conf(repo_dir.path().to_owned());
            // The conf must outlive all the tenants and background tasks.
            let conf: &'static PageServerConf = Box::leak(Box::new(conf));

            let tenant_id = TenantId::generate();
            std::fs::create_dir_all(conf.tenant_path(&tenant_id))?;
            std::fs::create_dir_all(conf.timelines_path(&tenant_id))?;

            Ok(Self {
                conf,
                tenant_conf: TenantConfOpt::default(),
                tenant_id,
                events: Arc::new(TaskEventCounts::default()),
                _repo_dir: repo_dir,
            })
        }

        pub async fn load(&self) -> Arc<Tenant> {
            self.try_load().await.expect("failed to load test tenant")
        }

        pub async fn try_load(&self) -> anyhow::Result<Arc<Tenant>> {
            let tenant = Arc::new(Tenant::new(
                TenantState::Loading,
                self.conf,
                self.tenant_conf,
                self.tenant_id,
                self.events.clone(),
                task_mgr::BACKGROUND_RUNTIME.handle().clone(),
            ));
            let loader = Arc::clone(&tenant);
            task_mgr::run_blocking(move || loader.load_local_timelines()).await?;
            tenant.activate()?;
            Ok(tenant)
        }
    }
}
