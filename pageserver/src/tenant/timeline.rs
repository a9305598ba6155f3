//!
//! A timeline is one branch of a tenant's history: an append-only stream of
//! page versions, stored in layers.
//!
//! New versions go to the open in-memory layer. When it grows past
//! `checkpoint_distance` it is frozen and flushed to a level-0 delta layer.
//! Compaction turns level-0 deltas into level-1 deltas and creates image
//! layers; GC removes layers that no reader can need anymore.
//!
pub mod physical_size;

use std::collections::{BTreeSet, VecDeque};
use std::ops::{Deref, Range};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{ensure, Context};
use bytes::Bytes;
use itertools::Itertools;
use pageserver_api::key::Key;
use pageserver_api::models::{LayerMapInfo, TimelineInfo, TimelineState};
use parking_lot::{Mutex, MutexGuard, RwLock};
use tokio::sync::watch;
use tracing::*;
use utils::{
    crashsafe,
    id::{TenantId, TimelineId},
    lsn::{AtomicLsn, Lsn},
};

use crate::config::PageServerConf;
use crate::metrics::StorageTimeOperation;
use crate::tenant::config::TenantConfOpt;
use crate::tenant::gc_result::GcResult;
use crate::tenant::layer_map::{LayerMap, SearchResult};
use crate::tenant::metadata::{save_metadata, TimelineMetadata};
use crate::tenant::storage_layer::{
    DeltaLayerWriter, ImageLayerWriter, InMemoryLayer, LayerName, PersistentLayer, Value,
    ValueReconstructResult, ValueReconstructState,
};
use crate::walredo::apply_wal_records;
use crate::{is_temporary, METADATA_FILE_NAME};

/// How many (time, lsn) samples are kept for translating the PITR interval into an LSN.
const MAX_LSN_HISTORY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointConfig {
    /// Flush all in-memory data
    Flush,
    /// Flush all in-memory data and reconstruct all page images
    Forced,
}

#[derive(Debug, thiserror::Error)]
pub enum PageReconstructError {
    #[error("requested lsn {request_lsn} is below the latest gc cutoff {gc_cutoff}")]
    BelowGcCutoff { request_lsn: Lsn, gc_cutoff: Lsn },

    #[error("requested lsn {request_lsn} is ahead of the last record lsn {last_record_lsn}")]
    FutureLsn {
        request_lsn: Lsn,
        last_record_lsn: Lsn,
    },

    #[error("key {key} does not exist at {lsn}")]
    Missing { key: Key, lsn: Lsn },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum CompactionError {
    #[error("timeline is not active")]
    NotActive,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Information about how much history needs to be retained, needed by
/// Garbage Collection.
#[derive(Debug, Default)]
pub struct GcInfo {
    /// Specific LSNs that are needed.
    ///
    /// Currently, this includes all points where child branches have
    /// been forked off from.
    pub retain_lsns: Vec<Lsn>,

    /// In addition to 'retain_lsns', keep everything newer than this
    /// point.
    ///
    /// This is calculated by subtracting 'gc_horizon' setting from
    /// last-record LSN
    pub horizon_cutoff: Lsn,

    /// In addition to 'retain_lsns' and 'horizon_cutoff', keep everything newer than this
    /// point.
    ///
    /// This is calculated by finding a number such that a record is needed for PITR
    /// if only if its LSN is larger than 'pitr_cutoff'.
    pub pitr_cutoff: Lsn,
}

pub struct Timeline {
    conf: &'static PageServerConf,
    tenant_conf: Arc<RwLock<TenantConfOpt>>,

    pub tenant_id: TenantId,
    pub timeline_id: TimelineId,

    pub(crate) layers: RwLock<LayerMap>,

    last_record_lsn: AtomicLsn,
    disk_consistent_lsn: AtomicLsn,

    // Parent timeline that this timeline was branched from, and the LSN
    // of the branch point.
    ancestor_timeline: Option<Arc<Timeline>>,
    ancestor_lsn: Lsn,

    /// Reads below this LSN fail; GC may have removed what they need.
    latest_gc_cutoff_lsn: AtomicLsn,
    pub(crate) gc_info: RwLock<GcInfo>,
    initdb_lsn: Lsn,

    /// Held by the TimelineWriter for the duration of a write.
    write_lock: Mutex<()>,

    /// Makes sure that only one thread flushes frozen layers at a time.
    layer_flush_lock: Mutex<()>,

    /// Layer removal lock.
    /// A lock to ensure that no layer of the timeline is removed concurrently by other threads.
    /// This lock is acquired in [`Timeline::gc`] and [`Timeline::compact`].
    layer_removal_cs: Mutex<()>,

    /// Serializes rewrites of the metadata file.
    metadata_write_lock: Mutex<()>,

    /// When each flushed LSN became durable, oldest first.
    lsn_history: Mutex<VecDeque<(SystemTime, Lsn)>>,

    state: watch::Sender<TimelineState>,
}

impl std::fmt::Debug for Timeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timeline")
            .field("tenant_id", &self.tenant_id)
            .field("timeline_id", &self.timeline_id)
            .field("last_record_lsn", &self.last_record_lsn.load())
            .finish()
    }
}

/// Exclusive write access to a timeline.
///
/// Values are added with `put`; `finish_write` then makes everything up to the
/// given LSN visible, and flushes the open layer when it has grown large enough.
pub struct TimelineWriter<'a> {
    tl: &'a Timeline,
    _write_guard: MutexGuard<'a, ()>,
}

impl Deref for TimelineWriter<'_> {
    type Target = Timeline;

    fn deref(&self) -> &Self::Target {
        self.tl
    }
}

impl TimelineWriter<'_> {
    /// Put a new page version that can be constructed from a WAL record
    ///
    /// This will implicitly extend the relation, if the page is beyond the
    /// current end-of-file.
    pub fn put(&self, key: Key, lsn: Lsn, value: &Value) -> anyhow::Result<()> {
        self.tl.put_value(key, lsn, value)
    }

    /// Track the end of the latest digested WAL record.
    ///
    /// Call this after you have finished writing all the WAL up to 'lsn'.
    pub fn finish_write(&self, new_lsn: Lsn) -> anyhow::Result<()> {
        self.tl.finish_write(new_lsn)
    }
}

impl Timeline {
    pub(crate) fn new(
        conf: &'static PageServerConf,
        tenant_conf: Arc<RwLock<TenantConfOpt>>,
        metadata: &TimelineMetadata,
        ancestor: Option<Arc<Timeline>>,
        timeline_id: TimelineId,
        tenant_id: TenantId,
    ) -> Arc<Self> {
        let disk_consistent_lsn = metadata.disk_consistent_lsn();
        let (state, _) = watch::channel(TimelineState::Loading);
        let mut layers = LayerMap::default();
        layers.next_open_layer_at = Some(disk_consistent_lsn + 1);

        Arc::new(Timeline {
            conf,
            tenant_conf,
            tenant_id,
            timeline_id,
            layers: RwLock::new(layers),
            last_record_lsn: AtomicLsn::from(disk_consistent_lsn),
            disk_consistent_lsn: AtomicLsn::from(disk_consistent_lsn),
            ancestor_timeline: ancestor,
            ancestor_lsn: metadata.ancestor_lsn(),
            latest_gc_cutoff_lsn: AtomicLsn::from(metadata.latest_gc_cutoff_lsn()),
            gc_info: RwLock::new(GcInfo::default()),
            initdb_lsn: metadata.initdb_lsn(),
            write_lock: Mutex::new(()),
            layer_flush_lock: Mutex::new(()),
            layer_removal_cs: Mutex::new(()),
            metadata_write_lock: Mutex::new(()),
            lsn_history: Mutex::new(VecDeque::new()),
            state,
        })
    }

    pub fn get_last_record_lsn(&self) -> Lsn {
        self.last_record_lsn.load()
    }

    pub fn get_disk_consistent_lsn(&self) -> Lsn {
        self.disk_consistent_lsn.load()
    }

    pub fn get_latest_gc_cutoff_lsn(&self) -> Lsn {
        self.latest_gc_cutoff_lsn.load()
    }

    pub fn get_ancestor_lsn(&self) -> Lsn {
        self.ancestor_lsn
    }

    pub fn get_ancestor_timeline_id(&self) -> Option<TimelineId> {
        self.ancestor_timeline
            .as_ref()
            .map(|ancestor| ancestor.timeline_id)
    }

    pub fn get_initdb_lsn(&self) -> Lsn {
        self.initdb_lsn
    }

    pub fn current_state(&self) -> TimelineState {
        *self.state.borrow()
    }

    pub fn set_state(&self, new_state: TimelineState) {
        let old = self.state.send_replace(new_state);
        if old != new_state {
            debug!("timeline {} state {old:?} -> {new_state:?}", self.timeline_id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.current_state() == TimelineState::Active
    }

    fn get_checkpoint_distance(&self) -> u64 {
        let tenant_conf = self.tenant_conf.read();
        tenant_conf
            .checkpoint_distance
            .unwrap_or(self.conf.default_tenant_conf.checkpoint_distance)
    }

    fn get_compaction_target_size(&self) -> u64 {
        let tenant_conf = self.tenant_conf.read();
        tenant_conf
            .compaction_target_size
            .unwrap_or(self.conf.default_tenant_conf.compaction_target_size)
    }

    fn get_compaction_threshold(&self) -> usize {
        let tenant_conf = self.tenant_conf.read();
        tenant_conf
            .compaction_threshold
            .unwrap_or(self.conf.default_tenant_conf.compaction_threshold)
    }

    fn get_image_creation_threshold(&self) -> usize {
        let tenant_conf = self.tenant_conf.read();
        tenant_conf
            .image_creation_threshold
            .unwrap_or(self.conf.default_tenant_conf.image_creation_threshold)
    }

    /// Mutate the timeline with a [`TimelineWriter`].
    pub fn writer(&self) -> TimelineWriter<'_> {
        TimelineWriter {
            tl: self,
            _write_guard: self.write_lock.lock(),
        }
    }

    fn put_value(&self, key: Key, lsn: Lsn, value: &Value) -> anyhow::Result<()> {
        let layer = self.get_layer_for_write(lsn)?;
        layer.put_value(key, lsn, value)
    }

    fn get_layer_for_write(&self, lsn: Lsn) -> anyhow::Result<Arc<InMemoryLayer>> {
        let mut layers = self.layers.write();

        let last_record_lsn = self.get_last_record_lsn();
        ensure!(
            lsn > last_record_lsn,
            "cannot modify relation after advancing last_record_lsn (incoming_lsn={lsn}, last_record_lsn={last_record_lsn})"
        );

        if let Some(open_layer) = &layers.open_layer {
            return Ok(Arc::clone(open_layer));
        }

        let start_lsn = layers.next_open_layer_at.unwrap_or(last_record_lsn + 1);
        ensure!(
            lsn >= start_lsn,
            "write at {lsn} below the start of the next open layer {start_lsn}"
        );
        trace!("creating in-memory layer at {start_lsn}/{}", self.timeline_id);
        let new_layer = Arc::new(InMemoryLayer::new(
            self.conf,
            self.timeline_id,
            self.tenant_id,
            start_lsn,
        ));
        layers.open_layer = Some(Arc::clone(&new_layer));
        layers.next_open_layer_at = None;

        Ok(new_layer)
    }

    fn finish_write(&self, new_lsn: Lsn) -> anyhow::Result<()> {
        let prev = self.last_record_lsn.fetch_max(new_lsn);
        ensure!(
            new_lsn >= prev,
            "finish_write at {new_lsn} is behind the last record lsn {prev}"
        );
        self.check_checkpoint_distance()
    }

    /// Flushes the open layer once it holds more than `checkpoint_distance` bytes.
    /// The caller holds the write lock.
    fn check_checkpoint_distance(&self) -> anyhow::Result<()> {
        let open_layer_size = match &self.layers.read().open_layer {
            Some(open_layer) => open_layer.size(),
            None => return Ok(()),
        };
        if open_layer_size >= self.get_checkpoint_distance() {
            info!(
                "open layer of timeline {} reached {open_layer_size} bytes, flushing",
                self.timeline_id
            );
            self.freeze_inmem_layer()?;
            self.flush_frozen_layers()?;
        }
        Ok(())
    }

    /// Flush to disk all data that was written with the put_* functions
    pub fn checkpoint(&self, cconf: CheckpointConfig) -> anyhow::Result<()> {
        {
            let _write_guard = self.write_lock.lock();
            self.freeze_inmem_layer()?;
        }
        self.flush_frozen_layers()?;
        match cconf {
            CheckpointConfig::Flush => Ok(()),
            CheckpointConfig::Forced => self.compact().map_err(anyhow::Error::from),
        }
    }

    /// Freeze the current open in-memory layer. It will be written to disk on next
    /// iteration. The caller holds the write lock.
    fn freeze_inmem_layer(&self) -> anyhow::Result<()> {
        let mut layers = self.layers.write();
        let Some(open_layer) = layers.open_layer.take() else {
            return Ok(());
        };

        // Values written without a finish_write yet still belong to this layer.
        let mut last_record_lsn = self.get_last_record_lsn();
        if let Some(max_lsn) = open_layer.max_lsn() {
            if max_lsn > last_record_lsn {
                self.last_record_lsn.fetch_max(max_lsn);
                last_record_lsn = max_lsn;
            }
        }
        let end_lsn = last_record_lsn + 1;
        if let Err(e) = open_layer.freeze(end_lsn) {
            layers.open_layer = Some(open_layer);
            return Err(e);
        }
        layers.frozen_layers.push_back(open_layer);
        layers.next_open_layer_at = Some(end_lsn);
        Ok(())
    }

    /// Write out all frozen layers, oldest first.
    fn flush_frozen_layers(&self) -> anyhow::Result<()> {
        let _flush_guard = self.layer_flush_lock.lock();
        loop {
            let frozen = match self.layers.read().frozen_layers.front() {
                Some(frozen) => Arc::clone(frozen),
                None => return Ok(()),
            };
            self.flush_frozen_layer(frozen)?;
        }
    }

    fn flush_frozen_layer(&self, frozen_layer: Arc<InMemoryLayer>) -> anyhow::Result<()> {
        let timer = StorageTimeOperation::LayerFlush.histogram().start_timer();
        let lsn_range = frozen_layer.get_lsn_range();
        let new_delta = frozen_layer
            .write_to_disk()
            .with_context(|| format!("flush in-memory layer {}..{}", lsn_range.start, lsn_range.end))?;

        {
            let mut layers = self.layers.write();
            if let Some(delta) = new_delta {
                info!("flushed layer {}", delta.layer_desc().filename());
                layers.insert_historic(Arc::new(delta));
            }
            let flushed = layers.frozen_layers.pop_front();
            ensure!(
                flushed.is_some_and(|l| Arc::ptr_eq(&l, &frozen_layer)),
                "flushed layer is not the oldest frozen layer"
            );
        }

        let disk_consistent_lsn = Lsn(lsn_range.end.0 - 1);
        self.update_metadata_file(disk_consistent_lsn)?;
        self.disk_consistent_lsn.store(disk_consistent_lsn);

        let mut lsn_history = self.lsn_history.lock();
        lsn_history.push_back((SystemTime::now(), disk_consistent_lsn));
        if lsn_history.len() > MAX_LSN_HISTORY {
            lsn_history.pop_front();
        }
        drop(lsn_history);

        timer.observe_duration();
        Ok(())
    }

    fn update_metadata_file(&self, disk_consistent_lsn: Lsn) -> anyhow::Result<()> {
        let _guard = self.metadata_write_lock.lock();
        let metadata = TimelineMetadata::new(
            disk_consistent_lsn,
            self.get_ancestor_timeline_id(),
            self.ancestor_lsn,
            self.get_latest_gc_cutoff_lsn(),
            self.initdb_lsn,
        );
        save_metadata(self.conf, &self.tenant_id, &self.timeline_id, &metadata)
            .context("update timeline metadata file")
    }

    /// Look up the value of `key` at `lsn`.
    pub fn get(&self, key: Key, lsn: Lsn) -> Result<Bytes, PageReconstructError> {
        let gc_cutoff = self.get_latest_gc_cutoff_lsn();
        if lsn < gc_cutoff {
            return Err(PageReconstructError::BelowGcCutoff {
                request_lsn: lsn,
                gc_cutoff,
            });
        }
        let last_record_lsn = self.get_last_record_lsn();
        if lsn > last_record_lsn {
            return Err(PageReconstructError::FutureLsn {
                request_lsn: lsn,
                last_record_lsn,
            });
        }

        let mut reconstruct_state = ValueReconstructState::default();
        self.get_reconstruct_data(key, lsn, &mut reconstruct_state)?;

        let ValueReconstructState { mut records, img } = reconstruct_state;
        if img.is_none() && records.is_empty() {
            return Err(PageReconstructError::Missing { key, lsn });
        }
        records.reverse();
        let value = apply_wal_records(img, &records)
            .with_context(|| format!("reconstruct value of {key} at {lsn}"))?;
        Ok(value)
    }

    ///
    /// Collect the data needed to reconstruct `key` at `request_lsn`, newest first.
    ///
    /// The layers are visited from the newest down: the open and frozen in-memory
    /// layers, then the historic layers, then the ancestor timeline below the branch
    /// point. The layer map lock is only held while picking the next layer.
    ///
    fn get_reconstruct_data(
        &self,
        key: Key,
        request_lsn: Lsn,
        reconstruct_state: &mut ValueReconstructState,
    ) -> Result<(), PageReconstructError> {
        // Start from the current timeline.
        let mut timeline: &Timeline = self;

        // 'cont_lsn' is exclusive: the next layer must have data below it.
        let mut cont_lsn = request_lsn + 1;

        loop {
            let next = {
                let layers = timeline.layers.read();
                let next = match layers
                    .in_memory_layers_newest_first()
                    .find(|l| l.start_lsn() < cont_lsn)
                {
                    Some(l) => Some((ReadLayer::InMemory(Arc::clone(l)), l.start_lsn())),
                    None => layers
                        .search(key, cont_lsn)
                        .map(|SearchResult { layer, lsn_floor }| {
                            (ReadLayer::Persistent(layer), lsn_floor)
                        }),
                };
                next
            };

            let Some((layer, lsn_floor)) = next else {
                // Nothing more on this timeline, continue on the parent below the
                // branch point.
                match timeline.ancestor_timeline.as_deref() {
                    Some(ancestor) => {
                        cont_lsn = std::cmp::min(cont_lsn, timeline.ancestor_lsn + 1);
                        trace!(
                            "continuing reconstruct of {key} on ancestor {} at {cont_lsn}",
                            ancestor.timeline_id
                        );
                        timeline = ancestor;
                        continue;
                    }
                    None => return Ok(()),
                }
            };

            let lsn_range = lsn_floor..cont_lsn;
            let result = match &layer {
                ReadLayer::InMemory(l) => {
                    l.get_value_reconstruct_data(key, lsn_range, reconstruct_state)?
                }
                ReadLayer::Persistent(l) => {
                    l.get_value_reconstruct_data(key, lsn_range, reconstruct_state)?
                }
            };
            match result {
                ValueReconstructResult::Complete => return Ok(()),
                ValueReconstructResult::Missing => return Ok(()),
                ValueReconstructResult::Continue => cont_lsn = lsn_floor,
            }
        }
    }

    /// Keys with any version at or below `lsn`, including the ones inherited from
    /// the ancestors.
    fn collect_keys(&self, lsn: Lsn) -> anyhow::Result<BTreeSet<Key>> {
        let mut keys = match self.ancestor_timeline.as_deref() {
            Some(ancestor) => ancestor.collect_keys(self.ancestor_lsn)?,
            None => BTreeSet::new(),
        };
        let historic: Vec<Arc<PersistentLayer>> = self
            .layers
            .read()
            .iter_historic_layers()
            .filter(|l| l.layer_desc().lsn_range.start <= lsn)
            .cloned()
            .collect();
        for layer in historic {
            keys.extend(layer.keys()?);
        }
        Ok(keys)
    }

    ///
    /// Compaction: create image layers where enough deltas have accumulated,
    /// then merge level-0 deltas into level-1 deltas.
    ///
    pub fn compact(&self) -> Result<(), CompactionError> {
        if !self.is_active() {
            return Err(CompactionError::NotActive);
        }

        // Compaction and GC must not remove each other's layers.
        let _layer_removal_cs = self.layer_removal_cs.lock();
        let timer = StorageTimeOperation::Compact.histogram().start_timer();

        let target_file_size = self.get_compaction_target_size();
        let lsn = self.get_disk_consistent_lsn();

        if self.time_for_new_image_layer(lsn) {
            self.create_image_layers(lsn, target_file_size)
                .context("create image layers")?;
        }

        self.compact_level0(target_file_size)
            .context("compact level-0 layers")?;

        timer.observe_duration();
        Ok(())
    }

    // Is it time to create new image layers?
    fn time_for_new_image_layer(&self, lsn: Lsn) -> bool {
        let threshold = self.get_image_creation_threshold();
        let layers = self.layers.read();
        let newest_image = layers.latest_full_image_lsn();
        let deltas_since: Range<Lsn> = match newest_image {
            Some(img_lsn) if img_lsn >= lsn => return false,
            Some(img_lsn) => img_lsn + 1..Lsn::MAX,
            None => Lsn(0)..Lsn::MAX,
        };
        let num_deltas = layers.count_deltas(&(Key::MIN..Key::MAX), &deltas_since);
        debug!(
            "{num_deltas} deltas above newest image {newest_image:?}, threshold {threshold}"
        );
        num_deltas > 0 && num_deltas >= threshold
    }

    fn create_image_layers(
        &self,
        lsn: Lsn,
        target_file_size: u64,
    ) -> anyhow::Result<Vec<Arc<PersistentLayer>>> {
        let timer = StorageTimeOperation::CreateImages.histogram().start_timer();

        let mut images: Vec<(Key, Bytes)> = Vec::new();
        for key in self.collect_keys(lsn)? {
            match self.get(key, lsn) {
                Ok(img) => images.push((key, img)),
                Err(PageReconstructError::Missing { .. }) => {}
                Err(e) => return Err(anyhow::Error::new(e)),
            }
        }

        // Partition the key space into chunks of about target_file_size.
        let mut partitions: Vec<(Range<Key>, &[(Key, Bytes)])> = Vec::new();
        let mut chunk_start_key = Key::MIN;
        let mut chunk_start = 0;
        let mut chunk_size = 0;
        for (i, (key, img)) in images.iter().enumerate() {
            if chunk_size >= target_file_size && i > chunk_start {
                partitions.push((chunk_start_key..*key, &images[chunk_start..i]));
                chunk_start_key = *key;
                chunk_start = i;
                chunk_size = 0;
            }
            chunk_size += img.len() as u64;
        }
        partitions.push((chunk_start_key..Key::MAX, &images[chunk_start..]));

        // Layers written so far are removed again if a later one fails.
        let mut published = scopeguard::guard(Vec::new(), |published: Vec<PersistentLayer>| {
            for layer in published {
                if let Err(e) = layer.delete_file() {
                    warn!("failed to remove image layer after failed compaction: {e:#}");
                }
            }
        });
        for (key_range, chunk) in partitions {
            let mut image_layer_writer = ImageLayerWriter::new(
                self.conf,
                self.timeline_id,
                self.tenant_id,
                &key_range,
                lsn,
            )?;
            for (key, img) in chunk {
                image_layer_writer.put_image(*key, img.clone())?;
            }
            published.push(image_layer_writer.finish()?);
        }
        let new_layers: Vec<Arc<PersistentLayer>> = scopeguard::ScopeGuard::into_inner(published)
            .into_iter()
            .map(Arc::new)
            .collect();

        let mut layers = self.layers.write();
        for l in &new_layers {
            layers.insert_historic(Arc::clone(l));
        }
        drop(layers);

        info!(
            "created {} image layers at {lsn} in {:.3}s",
            new_layers.len(),
            timer.stop_and_record()
        );
        Ok(new_layers)
    }

    ///
    /// Merge level-0 delta layers into level-1 deltas, split by key at about
    /// `target_file_size`.
    ///
    fn compact_level0(&self, target_file_size: u64) -> anyhow::Result<()> {
        let level0_deltas = self.layers.read().get_level0_deltas();

        let threshold = self.get_compaction_threshold();
        if level0_deltas.len() < threshold {
            debug!(
                "level0 deltas count {} below threshold {threshold}",
                level0_deltas.len()
            );
            return Ok(());
        }

        let (Some(first), Some(last)) = (level0_deltas.first(), level0_deltas.last()) else {
            return Ok(());
        };
        let lsn_range = first.layer_desc().lsn_range.start..last.layer_desc().lsn_range.end;
        info!(
            "compacting {} level0 deltas covering {}..{}",
            level0_deltas.len(),
            lsn_range.start,
            lsn_range.end
        );

        let all_values = level0_deltas
            .iter()
            .map(|l| l.load_values())
            .collect::<anyhow::Result<Vec<_>>>()?;
        let merged = all_values
            .into_iter()
            .map(|values| values.into_iter())
            .kmerge_by(|a, b| (a.0, a.1) < (b.0, b.1));

        let mut published = scopeguard::guard(Vec::new(), |published: Vec<PersistentLayer>| {
            for layer in published {
                if let Err(e) = layer.delete_file() {
                    warn!("failed to remove delta layer after failed compaction: {e:#}");
                }
            }
        });
        let mut writer: Option<DeltaLayerWriter> = None;
        let mut prev_key: Option<Key> = None;
        for (key, lsn, value) in merged {
            // Only split at key boundaries, so that all versions of a key
            // end up in the same layer.
            let split_here = match (&writer, prev_key) {
                (Some(w), Some(prev)) => w.size() >= target_file_size && key != prev,
                _ => false,
            };
            if split_here {
                if let Some(w) = writer.take() {
                    published.push(w.finish(key)?);
                }
            }
            if writer.is_none() {
                writer = Some(DeltaLayerWriter::new(
                    self.conf,
                    self.timeline_id,
                    self.tenant_id,
                    key,
                    lsn_range.clone(),
                )?);
            }
            if let Some(w) = writer.as_mut() {
                w.put_value(key, lsn, &value)?;
            }
            prev_key = Some(key);
        }
        if let (Some(w), Some(prev)) = (writer.take(), prev_key) {
            published.push(w.finish(prev.next())?);
        }
        let new_layers = scopeguard::ScopeGuard::into_inner(published);

        {
            let mut layers = self.layers.write();
            for l in new_layers {
                layers.insert_historic(Arc::new(l));
            }
            for l in &level0_deltas {
                layers.remove_historic(l);
            }
        }

        // Now that the level-1 layers are in the layer map, the inputs can go.
        for l in level0_deltas {
            l.delete_file()?;
        }
        Ok(())
    }

    ///
    /// Update the GC information: where the horizon and PITR cutoffs are, and
    /// which branch points must be retained.
    ///
    pub(crate) fn update_gc_info(
        &self,
        retain_lsns: Vec<Lsn>,
        cutoff_horizon: Lsn,
        pitr: Duration,
    ) {
        let pitr_cutoff = if pitr.is_zero() {
            cutoff_horizon
        } else {
            // The newest flushed LSN that was already durable `pitr` ago.
            let found = SystemTime::now().checked_sub(pitr).and_then(|pitr_time| {
                self.lsn_history
                    .lock()
                    .iter()
                    .rev()
                    .find(|(time, _)| *time <= pitr_time)
                    .map(|(_, lsn)| *lsn)
            });
            match found {
                Some(lsn) => lsn,
                // Everything we know of is inside the PITR window.
                None => self.get_latest_gc_cutoff_lsn(),
            }
        };

        let mut gc_info = self.gc_info.write();
        gc_info.retain_lsns = retain_lsns;
        gc_info.horizon_cutoff = cutoff_horizon;
        gc_info.pitr_cutoff = pitr_cutoff;
    }

    ///
    /// Garbage collect layer files on a timeline that are no longer needed.
    ///
    /// Currently, we don't make any attempt at removing unneeded page versions
    /// within a layer file. We can only remove the whole file if it's fully
    /// obsolete.
    ///
    pub(crate) fn gc(&self) -> anyhow::Result<GcResult> {
        let _layer_removal_cs = self.layer_removal_cs.lock();
        let timer = StorageTimeOperation::Gc.histogram().start_timer();

        let (horizon_cutoff, pitr_cutoff, retain_lsns) = {
            let gc_info = self.gc_info.read();
            (
                gc_info.horizon_cutoff,
                gc_info.pitr_cutoff,
                gc_info.retain_lsns.clone(),
            )
        };
        let new_gc_cutoff = Lsn::min(horizon_cutoff, pitr_cutoff);
        let new_gc_cutoff = Lsn::min(new_gc_cutoff, self.get_disk_consistent_lsn());

        let _enter = info_span!("gc_timeline", timeline_id = %self.timeline_id, cutoff = %new_gc_cutoff).entered();
        let result = self.gc_timeline(horizon_cutoff, pitr_cutoff, retain_lsns, new_gc_cutoff)?;
        timer.observe_duration();
        Ok(result)
    }

    fn gc_timeline(
        &self,
        horizon_cutoff: Lsn,
        pitr_cutoff: Lsn,
        retain_lsns: Vec<Lsn>,
        new_gc_cutoff: Lsn,
    ) -> anyhow::Result<GcResult> {
        let now = Instant::now();
        let mut result: GcResult = GcResult::default();

        // Nothing to GC. Return early.
        let latest_gc_cutoff = self.get_latest_gc_cutoff_lsn();
        if latest_gc_cutoff >= new_gc_cutoff {
            debug!("nothing to GC: latest cutoff {latest_gc_cutoff}, new cutoff {new_gc_cutoff}");
            return Ok(result);
        }

        // Readers must not ask for data below the new cutoff before any layer is gone.
        self.latest_gc_cutoff_lsn.store(new_gc_cutoff);
        self.update_metadata_file(self.get_disk_consistent_lsn())?;

        // Decide on a consistent snapshot of the layer map.
        let mut layers_to_remove = {
            let layers = self.layers.read();
            let mut layers_to_remove = Vec::new();
            'outer: for l in layers.iter_historic_layers() {
                result.layers_total += 1;
                let desc = l.layer_desc();

                // 1. Is it newer than GC horizon cutoff point?
                if desc.lsn_range.end > horizon_cutoff {
                    debug!("keeping {} because it's newer than horizon_cutoff {horizon_cutoff}", desc.filename());
                    result.layers_needed_by_cutoff += 1;
                    continue 'outer;
                }

                // 2. It is newer than PiTR cutoff point?
                if desc.lsn_range.end > pitr_cutoff {
                    debug!("keeping {} because it's newer than pitr_cutoff {pitr_cutoff}", desc.filename());
                    result.layers_needed_by_pitr += 1;
                    continue 'outer;
                }

                // 3. Is it needed by a child branch?
                for retain_lsn in &retain_lsns {
                    if &desc.lsn_range.start <= retain_lsn {
                        debug!("keeping {} because it's still might be referenced by child branch forked at {retain_lsn}", desc.filename());
                        result.layers_needed_by_branches += 1;
                        continue 'outer;
                    }
                }

                // 4. Is there a later on-disk layer for this relation?
                //
                // The end-LSN is exclusive, while disk_consistent_lsn is
                // inclusive. For example, if disk_consistent_lsn is 100, it is
                // OK for a delta layer to have end LSN 101, but if the end LSN
                // is 102, then it might not have been fully flushed to disk
                // before crash.
                if !layers.image_layer_exists(&desc.key_range, &(desc.lsn_range.end..new_gc_cutoff + 1)) {
                    debug!("keeping {} because it is the latest layer", desc.filename());
                    result.layers_not_updated += 1;
                    continue 'outer;
                }

                // We didn't find any reason to keep this file, so remove it.
                debug!("garbage collecting {}", desc.filename());
                layers_to_remove.push(Arc::clone(l));
            }
            layers_to_remove
        };

        // Compaction may have replaced layers since the snapshot; only remove
        // the ones that are still there.
        let removed: Vec<Arc<PersistentLayer>> = {
            let mut layers = self.layers.write();
            layers_to_remove.retain(|l| layers.remove_historic(l));
            layers_to_remove
        };
        for layer in removed {
            layer.delete_file()?;
            result.layers_removed += 1;
        }

        info!(
            "GC completed removing {} layers, cutoff {new_gc_cutoff}",
            result.layers_removed
        );

        result.elapsed = now.elapsed();
        Ok(result)
    }

    ///
    /// Scan the timeline directory to populate the layer map.
    /// Temporary files and layers above `disk_consistent_lsn` are deleted.
    ///
    pub(crate) fn load_layer_map(&self) -> anyhow::Result<()> {
        let timer = StorageTimeOperation::LoadLayerMap.histogram().start_timer();
        let disk_consistent_lsn = self.get_disk_consistent_lsn();
        let timeline_path = self.conf.timeline_path(&self.tenant_id, &self.timeline_id);

        let mut entries = timeline_path
            .read_dir_utf8()
            .with_context(|| format!("read timeline directory {timeline_path}"))?
            .map(|entry| entry.map(|e| e.path().to_owned()))
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort();

        let mut num_layers = 0;
        let mut layers = self.layers.write();
        for path in entries {
            let Some(fname) = path.file_name() else {
                continue;
            };
            if fname == METADATA_FILE_NAME {
                continue;
            }
            if is_temporary(&path) {
                info!("removing temp timeline file at {path}");
                std::fs::remove_file(&path)
                    .with_context(|| format!("remove temporary file {path}"))?;
                continue;
            }

            match LayerName::classify(fname) {
                Some(name) if name.is_in_future(disk_consistent_lsn) => {
                    warn!("found future layer {fname} on timeline {} disk_consistent_lsn is {disk_consistent_lsn}, removing", self.timeline_id);
                    std::fs::remove_file(&path)
                        .with_context(|| format!("remove future layer {path}"))?;
                }
                Some(name) => {
                    let layer = PersistentLayer::from_existing_file(
                        self.tenant_id,
                        self.timeline_id,
                        name,
                        path,
                    )?;
                    trace!("found layer {}", layer.path());
                    layers.insert_historic(Arc::new(layer));
                    num_layers += 1;
                }
                None => warn!("unrecognized filename in timeline dir: {fname}"),
            }
        }
        layers.next_open_layer_at = Some(disk_consistent_lsn + 1);

        info!(
            "loaded layer map with {num_layers} layers at {disk_consistent_lsn} in {:.3}s",
            timer.stop_and_record()
        );
        Ok(())
    }

    /// Removes the timeline directory. Waits for a running compaction or GC to finish first.
    pub(crate) fn delete_local_files(&self) -> anyhow::Result<()> {
        let _layer_removal_cs = self.layer_removal_cs.lock();
        let timeline_path = self.conf.timeline_path(&self.tenant_id, &self.timeline_id);
        std::fs::remove_dir_all(&timeline_path)
            .with_context(|| format!("remove timeline directory {timeline_path}"))?;
        let timelines_path = self.conf.timelines_path(&self.tenant_id);
        crashsafe::fsync(&timelines_path)
            .with_context(|| format!("fsync timelines directory {timelines_path}"))?;
        Ok(())
    }

    pub fn layer_map_info(&self) -> LayerMapInfo {
        let layers = self.layers.read();
        let mut in_memory_layers: Vec<_> = layers.frozen_layers.iter().map(|l| l.info()).collect();
        if let Some(open_layer) = &layers.open_layer {
            in_memory_layers.push(open_layer.info());
        }
        let historic_layers = layers.iter_historic_layers().map(|l| l.info()).collect();
        LayerMapInfo {
            in_memory_layers,
            historic_layers,
        }
    }

    /// Size of the layer files, as tracked by the layer map.
    pub fn physical_size(&self) -> u64 {
        self.layers
            .read()
            .iter_historic_layers()
            .map(|l| l.layer_desc().file_size)
            .sum()
    }

    pub fn info(&self) -> TimelineInfo {
        TimelineInfo {
            tenant_id: self.tenant_id,
            timeline_id: self.timeline_id,
            ancestor_timeline_id: self.get_ancestor_timeline_id(),
            ancestor_lsn: self.ancestor_timeline.as_ref().map(|_| self.ancestor_lsn),
            last_record_lsn: self.get_last_record_lsn(),
            disk_consistent_lsn: self.get_disk_consistent_lsn(),
            latest_gc_cutoff_lsn: self.get_latest_gc_cutoff_lsn(),
            current_physical_size: self.physical_size(),
            state: self.current_state(),
        }
    }
}

enum ReadLayer {
    InMemory(Arc<InMemoryLayer>),
    Persistent(Arc<PersistentLayer>),
}
