//! This module acts as a switchboard to access different repositories managed by this
//! page server.
//!
//! There is no process-wide tenant map: a [`TenantManager`] is created at startup and
//! handed to whoever needs it, together with the sink for background task events.

use std::collections::{hash_map, HashMap};
use std::sync::Arc;

use anyhow::{bail, ensure, Context};
use camino::{Utf8Path, Utf8PathBuf};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use pageserver_api::models::{TenantInfo, TenantState};
use tokio::fs;
use tokio::runtime::Handle;
use tokio::sync::RwLock;
use tracing::*;
use utils::crashsafe::{self, path_with_suffix_extension};
use utils::id::{TenantId, TimelineId};

use crate::config::PageServerConf;
use crate::metrics::TaskEventSink;
use crate::tenant::config::TenantConfOpt;
use crate::tenant::{CreateTimelineParams, Tenant, Timeline};
use crate::{IGNORED_TENANT_FILE_NAME, TEMP_FILE_SUFFIX};

#[derive(Debug, thiserror::Error)]
pub enum GetTenantError {
    #[error("Tenant {0} not found")]
    NotFound(TenantId),

    #[error("Tenant {tenant_id} is not active, state: {state:?}")]
    NotActive {
        tenant_id: TenantId,
        state: TenantState,
    },
}

pub struct TenantManager {
    conf: &'static PageServerConf,
    tenants: RwLock<HashMap<TenantId, Arc<Tenant>>>,
    events: Arc<dyn TaskEventSink>,
    /// Tenant loading and the background loops run here.
    runtime: Handle,
}

impl TenantManager {
    pub fn new(
        conf: &'static PageServerConf,
        events: Arc<dyn TaskEventSink>,
        runtime: Handle,
    ) -> Self {
        TenantManager {
            conf,
            tenants: RwLock::new(HashMap::new()),
            events,
            runtime,
        }
    }

    /// Initialize repositories with locally available timelines.
    ///
    /// Every tenant directory found is scheduled for loading; tenants become Active
    /// (or Broken) in the background.
    #[instrument(skip_all)]
    pub async fn init_tenants(&self) -> anyhow::Result<()> {
        // Scan local filesystem for attached tenants
        let mut number_of_tenants = 0;
        let tenants_dir = self.conf.tenants_path();
        fs::create_dir_all(&tenants_dir)
            .await
            .with_context(|| format!("Failed to create tenants dir {tenants_dir}"))?;

        let mut dir_entries = fs::read_dir(&tenants_dir)
            .await
            .with_context(|| format!("Failed to list tenants dir {tenants_dir}"))?;

        loop {
            match dir_entries.next_entry().await {
                Ok(None) => break,
                Ok(Some(dir_entry)) => {
                    let tenant_dir_path = match Utf8PathBuf::try_from(dir_entry.path()) {
                        Ok(path) => path,
                        Err(e) => {
                            error!("Skipping non-utf8 entry in tenants dir: {e}");
                            continue;
                        }
                    };
                    if crate::is_temporary(&tenant_dir_path) {
                        info!("Found temporary tenant directory, removing: {tenant_dir_path}");
                        if let Err(e) = fs::remove_dir_all(&tenant_dir_path).await {
                            error!("Failed to remove temporary directory '{tenant_dir_path}': {e:?}");
                        }
                        continue;
                    }

                    // This case happens if we crash during tenant creation before the rename
                    let is_empty = is_empty_dir(&tenant_dir_path).with_context(|| {
                        format!("Failed to check whether {tenant_dir_path} is an empty dir")
                    })?;
                    if is_empty {
                        info!("removing empty tenant directory {tenant_dir_path}");
                        if let Err(e) = fs::remove_dir(&tenant_dir_path).await {
                            error!("Failed to remove empty tenant directory '{tenant_dir_path}': {e:#}")
                        }
                        continue;
                    }

                    let tenant_ignore_mark_file = tenant_dir_path.join(IGNORED_TENANT_FILE_NAME);
                    if tenant_ignore_mark_file.exists() {
                        info!("Found an ignore mark file {tenant_ignore_mark_file}, skipping the tenant");
                        continue;
                    }

                    match self.schedule_local_tenant_processing(&tenant_dir_path) {
                        Ok(tenant) => {
                            self.tenants
                                .write()
                                .await
                                .insert(tenant.tenant_id(), tenant);
                            number_of_tenants += 1;
                        }
                        Err(e) => {
                            error!("Failed to collect tenant files from dir {tenants_dir} for entry {tenant_dir_path}, reason: {e:#}");
                        }
                    }
                }
                Err(e) => {
                    // On error, print it, but continue with the other tenants. If we error out
                    // here, the pageserver startup fails altogether, causing outage for *all*
                    // tenants. That seems worse.
                    error!("Failed to list tenants dir entry in directory {tenants_dir}, reason: {e:?}");
                }
            }
        }

        info!("Processed {number_of_tenants} local tenants at startup");
        Ok(())
    }

    /// Build the in-memory tenant for `tenant_path` and start loading it.
    ///
    /// The tenant is returned in Loading state. A tenant whose config cannot be read
    /// is returned Broken.
    fn schedule_local_tenant_processing(
        &self,
        tenant_path: &Utf8Path,
    ) -> anyhow::Result<Arc<Tenant>> {
        ensure!(
            tenant_path.is_dir(),
            "Cannot load tenant from path {tenant_path}, it either does not exist or not a directory"
        );
        ensure!(
            !crate::is_temporary(tenant_path),
            "Cannot load tenant from temporary path {tenant_path}"
        );

        let tenant_id = tenant_path
            .file_name()
            .unwrap_or_default()
            .parse::<TenantId>()
            .with_context(|| {
                format!("Could not parse tenant id out of the tenant dir name in path {tenant_path}")
            })?;

        let tenant_ignore_mark = self.conf.tenant_ignore_mark_file_path(&tenant_id);
        ensure!(
            !tenant_ignore_mark.exists(),
            "Cannot load tenant, ignore mark found at {tenant_ignore_mark}"
        );

        let tenant_conf = Tenant::load_tenant_config(self.conf, &tenant_id);
        let tenant = Arc::new(Tenant::new(
            TenantState::Loading,
            self.conf,
            tenant_conf.as_ref().copied().unwrap_or_default(),
            tenant_id,
            Arc::clone(&self.events),
            self.runtime.clone(),
        ));

        match tenant_conf {
            Ok(_) => {
                info!("tenant {tenant_id} is assumed to be loadable, starting load operation");
                let loading = Arc::clone(&tenant);
                self.runtime.spawn(
                    async move { loading.load_and_activate().await }
                        .instrument(info_span!("tenant_load", %tenant_id)),
                );
            }
            Err(e) => {
                error!("failed to read config of tenant {tenant_id}: {e:#}");
                tenant.set_broken(format!("{e:#}"));
            }
        }
        Ok(tenant)
    }

    ///
    /// Shut down all tenants. This runs as part of pageserver shutdown.
    ///
    pub async fn shutdown_all_tenants(&self) {
        let tenants_to_shut_down: Vec<Arc<Tenant>> = {
            let mut m = self.tenants.write().await;
            m.drain().map(|(_, tenant)| tenant).collect()
        };

        let mut shutdown_futures: FuturesUnordered<_> = tenants_to_shut_down
            .iter()
            .map(|tenant| async move { (tenant.tenant_id(), tenant.shutdown(true).await) })
            .collect();
        while let Some((tenant_id, result)) = shutdown_futures.next().await {
            if let Err(e) = result {
                warn!("tenant {tenant_id} did not shut down cleanly: {e}");
            }
        }
        info!("shut down {} tenants", tenants_to_shut_down.len());
    }

    pub async fn create_tenant(
        &self,
        tenant_conf: TenantConfOpt,
        tenant_id: TenantId,
    ) -> anyhow::Result<Arc<Tenant>> {
        match self.tenants.write().await.entry(tenant_id) {
            hash_map::Entry::Occupied(_) => bail!("tenant {tenant_id} already exists"),
            hash_map::Entry::Vacant(v) => {
                // Hold the write lock, since all of this is local IO.
                let tenant_directory = create_tenant_files(self.conf, &tenant_conf, &tenant_id)?;
                let created_tenant = self.schedule_local_tenant_processing(&tenant_directory)?;
                let created_tenant_id = created_tenant.tenant_id();
                ensure!(
                    tenant_id == created_tenant_id,
                    "loaded created tenant has unexpected tenant id (expect {tenant_id} != actual {created_tenant_id})",
                );
                v.insert(Arc::clone(&created_tenant));
                Ok(created_tenant)
            }
        }
    }

    /// Load a tenant from its local directory, e.g. after [`TenantManager::ignore_tenant`].
    pub async fn load_tenant(&self, tenant_id: TenantId) -> anyhow::Result<Arc<Tenant>> {
        self.run_if_no_tenant_in_memory(tenant_id, |vacant_entry| {
            let tenant_path = self.conf.tenant_path(&tenant_id);
            let tenant_ignore_mark = self.conf.tenant_ignore_mark_file_path(&tenant_id);
            if tenant_ignore_mark.exists() {
                std::fs::remove_file(&tenant_ignore_mark).with_context(|| {
                    format!("Failed to remove tenant ignore mark {tenant_ignore_mark} during tenant loading")
                })?;
            }

            let new_tenant = self
                .schedule_local_tenant_processing(&tenant_path)
                .with_context(|| format!("Failed to schedule tenant processing in path {tenant_path}"))?;

            vacant_entry.insert(Arc::clone(&new_tenant));
            Ok(new_tenant)
        })
        .await
    }

    /// Gets the tenant from the in-memory data, erroring if it's absent or is not fitting to the query.
    /// `active_only = true` allows to query only tenants that are ready for operations, erroring on other kinds of tenants.
    pub async fn get_tenant(
        &self,
        tenant_id: TenantId,
        active_only: bool,
    ) -> Result<Arc<Tenant>, GetTenantError> {
        let m = self.tenants.read().await;
        let tenant = m
            .get(&tenant_id)
            .ok_or(GetTenantError::NotFound(tenant_id))?;
        if active_only && !tenant.current_state().is_active() {
            Err(GetTenantError::NotActive {
                tenant_id,
                state: tenant.current_state(),
            })
        } else {
            Ok(Arc::clone(tenant))
        }
    }

    ///
    /// Get list of tenants, for the mgmt API
    ///
    pub async fn list_tenants(&self) -> Vec<TenantInfo> {
        let mut tenants: Vec<TenantInfo> = self
            .tenants
            .read()
            .await
            .values()
            .map(|tenant| tenant.info())
            .collect();
        tenants.sort_by_key(|info| info.id);
        tenants
    }

    pub async fn update_tenant_config(
        &self,
        tenant_id: TenantId,
        tenant_conf: TenantConfOpt,
    ) -> anyhow::Result<()> {
        info!("configuring tenant {tenant_id}");
        let tenant = self.get_tenant(tenant_id, true).await?;
        tenant.update_tenant_config(tenant_conf)
    }

    pub async fn create_timeline(
        &self,
        tenant_id: TenantId,
        new_timeline_id: TimelineId,
        params: CreateTimelineParams,
    ) -> anyhow::Result<Arc<Timeline>> {
        let tenant = self.get_tenant(tenant_id, true).await?;
        let timeline = tenant.create_timeline(new_timeline_id, params).await?;
        Ok(timeline)
    }

    pub async fn branch_timeline(
        &self,
        tenant_id: TenantId,
        src_timeline_id: TimelineId,
        dst_timeline_id: TimelineId,
        start_lsn: Option<utils::lsn::Lsn>,
    ) -> anyhow::Result<Arc<Timeline>> {
        self.create_timeline(
            tenant_id,
            dst_timeline_id,
            CreateTimelineParams::Branch {
                ancestor_timeline_id: src_timeline_id,
                ancestor_start_lsn: start_lsn,
            },
        )
        .await
    }

    pub async fn delete_timeline(
        &self,
        tenant_id: TenantId,
        timeline_id: TimelineId,
    ) -> anyhow::Result<()> {
        match self.get_tenant(tenant_id, true).await {
            Ok(tenant) => tenant.delete_timeline(timeline_id).await?,
            Err(e) => bail!("Cannot access tenant {tenant_id} in local tenant state: {e}"),
        }
        Ok(())
    }

    /// Stop the tenant and delete its local files.
    pub async fn detach_tenant(&self, tenant_id: TenantId) -> anyhow::Result<()> {
        let conf = self.conf;
        self.remove_tenant_from_memory(tenant_id, async move {
            let local_tenant_directory = conf.tenant_path(&tenant_id);
            // Rename first: a crash half way through deleting leaves a temporary
            // directory, which is removed at the next startup.
            let tmp_path = path_with_suffix_extension(&local_tenant_directory, TEMP_FILE_SUFFIX);
            fs::rename(&local_tenant_directory, &tmp_path)
                .await
                .with_context(|| {
                    format!("Failed to rename local tenant directory {local_tenant_directory}")
                })?;
            crashsafe::fsync(&conf.tenants_path()).context("fsync tenants directory")?;
            fs::remove_dir_all(&tmp_path)
                .await
                .with_context(|| format!("Failed to remove local tenant directory {tmp_path}"))?;
            Ok(())
        })
        .await
    }

    /// Stop the tenant and forget it, leaving its files in place. An ignore mark keeps
    /// it from being loaded at the next startup.
    pub async fn ignore_tenant(&self, tenant_id: TenantId) -> anyhow::Result<()> {
        let conf = self.conf;
        self.remove_tenant_from_memory(tenant_id, async move {
            let ignore_mark_file = conf.tenant_ignore_mark_file_path(&tenant_id);
            fs::File::create(&ignore_mark_file)
                .await
                .context("Failed to create ignore mark file")
                .and_then(|_| {
                    crashsafe::fsync_file_and_parent(&ignore_mark_file)
                        .context("Failed to fsync ignore mark file")
                })
                .with_context(|| format!("Failed to create ignore mark for tenant {tenant_id}"))?;
            Ok(())
        })
        .await
    }

    async fn run_if_no_tenant_in_memory<F, V>(&self, tenant_id: TenantId, run: F) -> anyhow::Result<V>
    where
        F: FnOnce(hash_map::VacantEntry<TenantId, Arc<Tenant>>) -> anyhow::Result<V>,
    {
        match self.tenants.write().await.entry(tenant_id) {
            hash_map::Entry::Occupied(e) => {
                bail!(
                    "tenant {tenant_id} already exists, state: {:?}",
                    e.get().current_state()
                )
            }
            hash_map::Entry::Vacant(v) => run(v),
        }
    }

    /// Stops the tenant, runs `tenant_cleanup` and removes the tenant from memory.
    ///
    /// The tenant is removed from memory even if the cleanup fails; its files are then
    /// left as they are and it can be loaded again.
    async fn remove_tenant_from_memory<V, F>(
        &self,
        tenant_id: TenantId,
        tenant_cleanup: F,
    ) -> anyhow::Result<V>
    where
        F: std::future::Future<Output = anyhow::Result<V>>,
    {
        // The state check and the move to Stopping happen under one write lock, so a
        // second removal of the same tenant sees Stopping and bails.
        let (tenant, stopping) = {
            let tenants_accessor = self.tenants.write().await;
            let Some(tenant) = tenants_accessor.get(&tenant_id) else {
                bail!("Tenant not found for id {tenant_id}")
            };
            let stopping = match tenant.current_state() {
                TenantState::Stopping | TenantState::Detached => {
                    bail!("Tenant {tenant_id} is stopping already")
                }
                TenantState::Loading | TenantState::Active { .. } | TenantState::Broken { .. } => {
                    tenant
                        .set_stopping()
                        .with_context(|| format!("Failed to stop tenant {tenant_id}"))?
                }
            };
            let Some(stopping) = stopping else {
                bail!("Tenant {tenant_id} is stopping already")
            };
            (Arc::clone(tenant), stopping)
        };

        // Shut down all tenant and timeline tasks.
        tenant
            .finish_shutdown(stopping, false)
            .await
            .with_context(|| format!("Failed to shut down tenant {tenant_id}"))?;

        // All tasks that operated on the tenant or any of its timelines have finished,
        // and the tenant is Detached so that new ones cannot appear anymore. Proceed
        // with the cleanup.
        let result = tenant_cleanup
            .await
            .with_context(|| format!("Failed to run cleanup for tenant {tenant_id}"));
        if self.tenants.write().await.remove(&tenant_id).is_none() {
            warn!("Tenant {tenant_id} got removed from memory before operation finished");
        }
        result
    }
}

fn is_empty_dir(path: &Utf8Path) -> anyhow::Result<bool> {
    Ok(path.read_dir_utf8()?.next().is_none())
}

/// Create the directory of a new tenant: its config file and an empty timelines
/// directory. Everything is written into a temporary directory first and renamed
/// into place, so a crash never leaves a half-created tenant behind.
fn create_tenant_files(
    conf: &'static PageServerConf,
    tenant_conf: &TenantConfOpt,
    tenant_id: &TenantId,
) -> anyhow::Result<Utf8PathBuf> {
    let target_tenant_directory = conf.tenant_path(tenant_id);
    ensure!(
        !target_tenant_directory.exists(),
        "cannot create new tenant repo: '{tenant_id}' directory already exists",
    );

    let temporary_tenant_dir =
        path_with_suffix_extension(&target_tenant_directory, TEMP_FILE_SUFFIX);
    debug!("Creating temporary directory structure in {temporary_tenant_dir}");

    // top-level dir may exist if we are creating it through CLI
    crashsafe::create_dir_all(&temporary_tenant_dir).with_context(|| {
        format!("could not create temporary tenant directory {temporary_tenant_dir}")
    })?;

    let creation_result = try_create_target_tenant_dir(
        conf,
        tenant_conf,
        tenant_id,
        &temporary_tenant_dir,
        &target_tenant_directory,
    );

    if creation_result.is_err() {
        error!("Failed to create directory structure for tenant {tenant_id}, cleaning tmp data");
        if let Err(e) = std::fs::remove_dir_all(&temporary_tenant_dir) {
            error!("Failed to remove temporary tenant directory {temporary_tenant_dir:?}: {e}")
        } else if let Err(e) = crashsafe::fsync(&conf.tenants_path()) {
            error!("Failed to fsync removed temporary tenant directory {temporary_tenant_dir:?}: {e}")
        }
    }

    creation_result?;
    Ok(target_tenant_directory)
}

fn try_create_target_tenant_dir(
    conf: &'static PageServerConf,
    tenant_conf: &TenantConfOpt,
    tenant_id: &TenantId,
    temporary_tenant_dir: &Utf8Path,
    target_tenant_directory: &Utf8Path,
) -> anyhow::Result<()> {
    let temporary_tenant_timelines_dir = rebase_directory(
        &conf.timelines_path(tenant_id),
        target_tenant_directory,
        temporary_tenant_dir,
    )
    .with_context(|| format!("resolve tenant {tenant_id} temporary timelines dir"))?;
    let temporary_tenant_config_path = rebase_directory(
        &conf.tenant_config_path(tenant_id),
        target_tenant_directory,
        temporary_tenant_dir,
    )
    .with_context(|| format!("resolve tenant {tenant_id} temporary config path"))?;

    // first, create a config in the top-level temp directory, fsync the file
    Tenant::persist_tenant_config(&temporary_tenant_config_path, tenant_conf)?;
    // then, create a subdirectory in the top-level temp directory, fsynced
    crashsafe::create_dir(&temporary_tenant_timelines_dir).with_context(|| {
        format!(
            "create tenant {tenant_id} temporary timelines directory {temporary_tenant_timelines_dir}"
        )
    })?;

    fail::fail_point!(
        crate::failpoint_support::names::TENANT_CREATION_BEFORE_TMP_RENAME,
        |_| {
            bail!("failpoint tenant-creation-before-tmp-rename");
        }
    );

    // move-rename tmp directory with all files synced into a permanent directory, fsync its parent
    std::fs::rename(temporary_tenant_dir, target_tenant_directory).with_context(|| {
        format!(
            "move tenant {tenant_id} temporary directory {temporary_tenant_dir} into the permanent one {target_tenant_directory}"
        )
    })?;
    let target_dir_parent = target_tenant_directory.parent().with_context(|| {
        format!("get tenant {tenant_id} dir parent for {target_tenant_directory}")
    })?;
    crashsafe::fsync(target_dir_parent).with_context(|| {
        format!("fsync renamed directory's parent {target_dir_parent} for tenant {tenant_id}")
    })?;

    info!("created tenant directory structure in {target_tenant_directory}");
    Ok(())
}

fn rebase_directory(
    original_path: &Utf8Path,
    base: &Utf8Path,
    new_base: &Utf8Path,
) -> anyhow::Result<Utf8PathBuf> {
    let relative_path = original_path.strip_prefix(base).with_context(|| {
        format!("Failed to strip base prefix '{base}' off path '{original_path}'")
    })?;
    Ok(new_base.join(relative_path))
}
