//! An in-memory layer stores recently received key-value pairs.
//!
//! The "in-memory" part of the name is a bit misleading: the actual page versions are
//! kept in a map, and are written to a level-0 delta layer when the layer is frozen
//! and flushed.
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::ops::Range;

use anyhow::{ensure, Context};
use once_cell::sync::OnceCell;
use pageserver_api::key::Key;
use pageserver_api::models::InMemoryLayerInfo;
use parking_lot::RwLock;
use tracing::*;
use utils::{
    id::{TenantId, TimelineId},
    lsn::Lsn,
};

use super::{
    collect_versions, DeltaLayerWriter, PersistentLayer, Value, ValueReconstructResult,
    ValueReconstructState,
};
use crate::config::PageServerConf;

pub struct InMemoryLayer {
    conf: &'static PageServerConf,
    tenant_id: TenantId,
    timeline_id: TimelineId,

    /// This layer contains all the changes from 'start_lsn'. The
    /// start is inclusive.
    start_lsn: Lsn,

    /// Frozen layers have an exclusive end LSN.
    /// Writes are only allowed when this is not set.
    end_lsn: OnceCell<Lsn>,

    inner: RwLock<InMemoryLayerInner>,
}

impl std::fmt::Debug for InMemoryLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryLayer")
            .field("start_lsn", &self.start_lsn)
            .field("end_lsn", &self.end_lsn)
            .finish()
    }
}

#[derive(Default)]
struct InMemoryLayerInner {
    /// All versions of all pages in the layer are kept here. Indexed
    /// by key and lsn.
    index: BTreeMap<Key, BTreeMap<Lsn, Value>>,

    /// Estimated memory footprint of the values.
    size: u64,

    /// Highest LSN written to the layer.
    max_lsn: Option<Lsn>,
}

impl InMemoryLayer {
    pub fn new(
        conf: &'static PageServerConf,
        timeline_id: TimelineId,
        tenant_id: TenantId,
        start_lsn: Lsn,
    ) -> InMemoryLayer {
        trace!("initializing new empty InMemoryLayer for writing on timeline {timeline_id} at {start_lsn}");
        InMemoryLayer {
            conf,
            timeline_id,
            tenant_id,
            start_lsn,
            end_lsn: OnceCell::new(),
            inner: RwLock::new(InMemoryLayerInner::default()),
        }
    }

    pub fn start_lsn(&self) -> Lsn {
        self.start_lsn
    }

    /// `start..end` for a frozen layer, `start..Lsn::MAX` for the open one.
    pub fn get_lsn_range(&self) -> Range<Lsn> {
        self.start_lsn..self.end_lsn.get().copied().unwrap_or(Lsn::MAX)
    }

    pub fn is_frozen(&self) -> bool {
        self.end_lsn.get().is_some()
    }

    pub fn size(&self) -> u64 {
        self.inner.read().size
    }

    pub fn max_lsn(&self) -> Option<Lsn> {
        self.inner.read().max_lsn
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().index.is_empty()
    }

    /// Adds a page version to the layer. A later write of the same key and LSN
    /// replaces the earlier one.
    pub fn put_value(&self, key: Key, lsn: Lsn, val: &Value) -> anyhow::Result<()> {
        ensure!(!self.is_frozen(), "cannot write to a frozen in-memory layer");
        ensure!(
            lsn >= self.start_lsn,
            "write at {lsn} below the start of in-memory layer {}",
            self.start_lsn
        );
        trace!("put_value key {key} at {lsn}/{}", self.timeline_id);

        let mut inner = self.inner.write();
        let size = val.size_estimate();
        if let Some(old) = inner.index.entry(key).or_default().insert(lsn, val.clone()) {
            inner.size = inner.size.saturating_sub(old.size_estimate());
        }
        inner.size += size;
        inner.max_lsn = inner.max_lsn.max(Some(lsn));
        Ok(())
    }

    /// Records the end LSN and makes the layer read-only.
    pub fn freeze(&self, end_lsn: Lsn) -> anyhow::Result<()> {
        ensure!(
            end_lsn > self.start_lsn,
            "freeze at {end_lsn} is not after the layer start {}",
            self.start_lsn
        );
        // hold the write lock so that no put_value is in the middle of inserting
        let inner = self.inner.write();
        if let Some(max_lsn) = inner.max_lsn {
            ensure!(
                max_lsn < end_lsn,
                "freeze at {end_lsn} would cut off a write at {max_lsn}"
            );
        }
        self.end_lsn
            .set(end_lsn)
            .map_err(|_| anyhow::anyhow!("in-memory layer already frozen"))?;
        Ok(())
    }

    pub fn get_value_reconstruct_data(
        &self,
        key: Key,
        lsn_range: Range<Lsn>,
        state: &mut ValueReconstructState,
    ) -> anyhow::Result<ValueReconstructResult> {
        let inner = self.inner.read();
        let Some(versions) = inner.index.get(&key) else {
            return Ok(ValueReconstructResult::Continue);
        };
        let versions = versions
            .range(lsn_range)
            .map(|(lsn, value)| (*lsn, Cow::Borrowed(value)));
        Ok(collect_versions(versions, state))
    }

    pub fn keys(&self) -> Vec<Key> {
        self.inner.read().index.keys().copied().collect()
    }

    /// Writes the contents of a frozen layer to a new level-0 delta layer covering
    /// the whole key space. Returns `None` if the layer holds no data.
    pub fn write_to_disk(&self) -> anyhow::Result<Option<PersistentLayer>> {
        let end_lsn = *self
            .end_lsn
            .get()
            .context("only a frozen in-memory layer can be written to disk")?;
        let inner = self.inner.read();
        if inner.index.is_empty() {
            return Ok(None);
        }

        let mut delta_layer_writer = DeltaLayerWriter::new(
            self.conf,
            self.timeline_id,
            self.tenant_id,
            Key::MIN,
            self.start_lsn..end_lsn,
        )?;
        for (key, versions) in inner.index.iter() {
            for (lsn, value) in versions.iter() {
                delta_layer_writer.put_value(*key, *lsn, value)?;
            }
        }
        let delta_layer = delta_layer_writer.finish(Key::MAX)?;
        Ok(Some(delta_layer))
    }

    pub fn info(&self) -> InMemoryLayerInfo {
        match self.end_lsn.get() {
            Some(lsn_end) => InMemoryLayerInfo::Frozen {
                lsn_start: self.start_lsn,
                lsn_end: *lsn_end,
            },
            None => InMemoryLayerInfo::Open {
                lsn_start: self.start_lsn,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::harness::TenantHarness;
    use crate::walredo::WalRecord;
    use bytes::Bytes;

    #[test]
    fn freeze_and_flush() -> anyhow::Result<()> {
        let harness = TenantHarness::create("inmemory_freeze_and_flush")?;
        let timeline_id = TimelineId::generate();
        std::fs::create_dir_all(harness.conf.timeline_path(&harness.tenant_id, &timeline_id))?;

        let layer = InMemoryLayer::new(harness.conf, timeline_id, harness.tenant_id, Lsn(0x10));
        let key = Key::from_u32(42);
        layer.put_value(key, Lsn(0x10), &Value::Image(Bytes::from_static(b"img")))?;
        layer.put_value(
            key,
            Lsn(0x18),
            &Value::WalRecord(WalRecord::Append(Bytes::from_static(b"rec"))),
        )?;
        assert!(layer.put_value(key, Lsn(0x8), &Value::Image(Bytes::new())).is_err());
        assert_eq!(layer.get_lsn_range(), Lsn(0x10)..Lsn::MAX);
        assert!(layer.write_to_disk().is_err());

        assert!(layer.freeze(Lsn(0x18)).is_err());
        layer.freeze(Lsn(0x19))?;
        assert!(layer.put_value(key, Lsn(0x20), &Value::Image(Bytes::new())).is_err());
        assert!(matches!(
            layer.info(),
            InMemoryLayerInfo::Frozen { lsn_end, .. } if lsn_end == Lsn(0x19)
        ));

        let mut state = ValueReconstructState::default();
        let res = layer.get_value_reconstruct_data(key, Lsn(0)..Lsn(0x19), &mut state)?;
        assert_eq!(res, ValueReconstructResult::Complete);
        assert_eq!(state.records.len(), 1);

        let delta = layer.write_to_disk()?.expect("layer has data");
        assert!(delta.layer_desc().is_level0());
        assert_eq!(delta.layer_desc().lsn_range, Lsn(0x10)..Lsn(0x19));
        assert_eq!(delta.load_values()?.len(), 2);
        Ok(())
    }

    #[test]
    fn empty_layer_writes_nothing() -> anyhow::Result<()> {
        let harness = TenantHarness::create("inmemory_empty")?;
        let timeline_id = TimelineId::generate();
        let layer = InMemoryLayer::new(harness.conf, timeline_id, harness.tenant_id, Lsn(0x10));
        layer.freeze(Lsn(0x20))?;
        assert!(layer.write_to_disk()?.is_none());
        Ok(())
    }
}
