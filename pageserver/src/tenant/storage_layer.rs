//! Common traits and structs for layers

pub mod delta_layer;
pub mod image_layer;
pub mod inmemory_layer;
pub(crate) mod layer_file;
pub mod layer_name;

use std::ops::Range;
use std::os::unix::fs::MetadataExt;

use anyhow::Context;
use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use once_cell::sync::OnceCell;
use pageserver_api::key::Key;
use pageserver_api::models::HistoricLayerInfo;
use serde::{Deserialize, Serialize};
use tracing::*;
use utils::{
    id::{TenantId, TimelineId},
    lsn::Lsn,
};

use crate::walredo::WalRecord;
use crate::{DELTA_FILE_MAGIC, IMAGE_FILE_MAGIC};

pub use delta_layer::DeltaLayerWriter;
pub use image_layer::ImageLayerWriter;
pub use inmemory_layer::InMemoryLayer;
pub use layer_name::{DeltaLayerName, ImageLayerName, LayerName};

use layer_file::IndexEntry;

pub fn range_overlaps<T>(a: &Range<T>, b: &Range<T>) -> bool
where
    T: PartialOrd<T>,
{
    if a.start < b.start {
        a.end > b.start
    } else {
        b.end > a.start
    }
}

/// A value stored in a layer: either a full image or a record to apply on top of the
/// previous version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Image(Bytes),
    WalRecord(WalRecord),
}

impl Value {
    pub fn is_image(&self) -> bool {
        matches!(self, Value::Image(_))
    }

    pub fn will_init(&self) -> bool {
        match self {
            Value::Image(_) => true,
            Value::WalRecord(rec) => rec.will_init(),
        }
    }

    /// Rough in-memory footprint, used for checkpoint and layer size decisions.
    pub fn size_estimate(&self) -> u64 {
        const OVERHEAD: u64 = 32;
        OVERHEAD
            + match self {
                Value::Image(img) => img.len() as u64,
                Value::WalRecord(rec) => rec.len() as u64,
            }
    }
}

/// Struct used to communicate across calls to 'get_value_reconstruct_data'.
///
/// When get_value_reconstruct_data returns Complete, 'img' is set to an image
/// of the page, or the oldest WAL record in 'records' is a will_init-type
/// record that initializes the page without requiring a previous image.
///
/// If 'get_value_reconstruct_data' returns Continue, some 'records' may have
/// been collected, but there are more records outside the current layer. Pass
/// the same ValueReconstructState struct in the next 'get_value_reconstruct_data'
/// call, to collect more records.
///
#[derive(Debug, Default)]
pub struct ValueReconstructState {
    /// Newest first.
    pub records: Vec<(Lsn, WalRecord)>,
    pub img: Option<(Lsn, Bytes)>,
}

/// Return value from get_value_reconstruct_data
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueReconstructResult {
    /// Got all the data needed to reconstruct the requested page
    Complete,
    /// This layer didn't contain all the required data, the caller should look up
    /// the predecessor layer at the returned LSN and collect more data from there.
    Continue,
    /// An image layer covering the key does not contain it: the key does not exist
    /// at this LSN.
    Missing,
}

/// Collects the versions of `key` in `lsn_range` from entries sorted by (key, lsn).
///
/// Shared by the in-memory and the on-disk layers.
fn collect_versions<'a>(
    versions: impl DoubleEndedIterator<Item = (Lsn, std::borrow::Cow<'a, Value>)>,
    state: &mut ValueReconstructState,
) -> ValueReconstructResult {
    for (lsn, value) in versions.rev() {
        match value.into_owned() {
            Value::Image(img) => {
                state.img = Some((lsn, img));
                return ValueReconstructResult::Complete;
            }
            Value::WalRecord(rec) => {
                let will_init = rec.will_init();
                state.records.push((lsn, rec));
                if will_init {
                    return ValueReconstructResult::Complete;
                }
            }
        }
    }
    ValueReconstructResult::Continue
}

/// A layer descriptor: everything about a layer file except its contents.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PersistentLayerDesc {
    pub tenant_id: TenantId,
    pub timeline_id: TimelineId,
    pub key_range: Range<Key>,
    /// For an image layer, this is `lsn..lsn + 1`.
    pub lsn_range: Range<Lsn>,
    pub is_delta: bool,
    pub file_size: u64,
}

impl PersistentLayerDesc {
    pub fn new_img(
        tenant_id: TenantId,
        timeline_id: TimelineId,
        key_range: Range<Key>,
        lsn: Lsn,
        file_size: u64,
    ) -> Self {
        Self {
            tenant_id,
            timeline_id,
            key_range,
            lsn_range: lsn.single(),
            is_delta: false,
            file_size,
        }
    }

    pub fn new_delta(
        tenant_id: TenantId,
        timeline_id: TimelineId,
        key_range: Range<Key>,
        lsn_range: Range<Lsn>,
        file_size: u64,
    ) -> Self {
        Self {
            tenant_id,
            timeline_id,
            key_range,
            lsn_range,
            is_delta: true,
            file_size,
        }
    }

    pub fn from_layer_name(
        tenant_id: TenantId,
        timeline_id: TimelineId,
        name: LayerName,
        file_size: u64,
    ) -> Self {
        match name {
            LayerName::Image(i) => Self::new_img(tenant_id, timeline_id, i.key_range, i.lsn, file_size),
            LayerName::Delta(d) => {
                Self::new_delta(tenant_id, timeline_id, d.key_range, d.lsn_range, file_size)
            }
        }
    }

    /// The LSN of an image layer.
    pub fn image_layer_lsn(&self) -> Lsn {
        assert!(!self.is_delta);
        self.lsn_range.start
    }

    pub fn layer_name(&self) -> LayerName {
        if self.is_delta {
            DeltaLayerName {
                key_range: self.key_range.clone(),
                lsn_range: self.lsn_range.clone(),
            }
            .into()
        } else {
            ImageLayerName {
                key_range: self.key_range.clone(),
                lsn: self.lsn_range.start,
            }
            .into()
        }
    }

    pub fn filename(&self) -> String {
        self.layer_name().to_string()
    }

    /// A level-0 delta covers the whole key space.
    pub fn is_level0(&self) -> bool {
        self.is_delta && self.key_range == (Key::MIN..Key::MAX)
    }
}

/// Index and file handle of a layer, loaded on first access.
struct LoadedLayer {
    file: std::fs::File,
    index: Vec<IndexEntry>,
}

/// An immutable layer file in the timeline directory.
pub struct PersistentLayer {
    desc: PersistentLayerDesc,
    path: Utf8PathBuf,
    loaded: OnceCell<LoadedLayer>,
}

impl std::fmt::Debug for PersistentLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentLayer")
            .field("path", &self.path)
            .field("file_size", &self.desc.file_size)
            .finish()
    }
}

impl PersistentLayer {
    pub(crate) fn new(desc: PersistentLayerDesc, path: Utf8PathBuf) -> Self {
        PersistentLayer {
            desc,
            path,
            loaded: OnceCell::new(),
        }
    }

    /// A layer found in the timeline directory at startup.
    pub(crate) fn from_existing_file(
        tenant_id: TenantId,
        timeline_id: TimelineId,
        name: LayerName,
        path: Utf8PathBuf,
    ) -> anyhow::Result<Self> {
        let file_size = path
            .metadata()
            .with_context(|| format!("stat layer file {path}"))?
            .size();
        Ok(Self::new(
            PersistentLayerDesc::from_layer_name(tenant_id, timeline_id, name, file_size),
            path,
        ))
    }

    pub fn layer_desc(&self) -> &PersistentLayerDesc {
        &self.desc
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn load(&self) -> anyhow::Result<&LoadedLayer> {
        self.loaded.get_or_try_init(|| {
            let file = std::fs::File::open(&self.path)
                .with_context(|| format!("open layer file {}", self.path))?;
            let expected_magic = if self.desc.is_delta {
                DELTA_FILE_MAGIC
            } else {
                IMAGE_FILE_MAGIC
            };
            let (summary, index) = layer_file::read_summary_and_index(&file, expected_magic)
                .with_context(|| format!("load layer file {}", self.path))?;
            anyhow::ensure!(
                summary.key_range == self.desc.key_range && summary.lsn_range == self.desc.lsn_range,
                "layer file {} summary does not match its name",
                self.path
            );
            debug!("loaded layer file {} with {} entries", self.path, index.len());
            Ok(LoadedLayer { file, index })
        })
    }

    /// Collects data for `key` with LSN in `lsn_range` into `state`.
    pub fn get_value_reconstruct_data(
        &self,
        key: Key,
        lsn_range: Range<Lsn>,
        state: &mut ValueReconstructState,
    ) -> anyhow::Result<ValueReconstructResult> {
        let loaded = self.load()?;
        let index = &loaded.index;
        let start = index.partition_point(|(k, lsn, _)| (*k, *lsn) < (key, lsn_range.start));
        let end = index.partition_point(|(k, lsn, _)| (*k, *lsn) < (key, lsn_range.end));
        let entries = &index[start..end];

        if !self.desc.is_delta && entries.is_empty() {
            return Ok(ValueReconstructResult::Missing);
        }

        let mut versions = Vec::with_capacity(entries.len());
        for (_, lsn, offset) in entries {
            let value = layer_file::read_value(&loaded.file, *offset)
                .with_context(|| format!("read value of {key} at {lsn} from {}", self.path))?;
            versions.push((*lsn, std::borrow::Cow::Owned(value)));
        }
        Ok(collect_versions(versions.into_iter(), state))
    }

    /// Distinct keys stored in the layer, in order.
    pub fn keys(&self) -> anyhow::Result<Vec<Key>> {
        let loaded = self.load()?;
        let mut keys: Vec<Key> = loaded.index.iter().map(|(k, _, _)| *k).collect();
        keys.dedup();
        Ok(keys)
    }

    /// All entries of the layer, sorted by key and LSN.
    pub fn load_values(&self) -> anyhow::Result<Vec<(Key, Lsn, Value)>> {
        let loaded = self.load()?;
        loaded
            .index
            .iter()
            .map(|(key, lsn, offset)| {
                let value = layer_file::read_value(&loaded.file, *offset)?;
                Ok((*key, *lsn, value))
            })
            .collect()
    }

    pub(crate) fn delete_file(&self) -> anyhow::Result<()> {
        std::fs::remove_file(&self.path)
            .with_context(|| format!("delete layer file {}", self.path))
    }

    pub fn info(&self) -> HistoricLayerInfo {
        let layer_file_name = self.desc.filename();
        if self.desc.is_delta {
            HistoricLayerInfo::Delta {
                layer_file_name,
                layer_file_size: self.desc.file_size,
                lsn_start: self.desc.lsn_range.start,
                lsn_end: self.desc.lsn_range.end,
            }
        } else {
            HistoricLayerInfo::Image {
                layer_file_name,
                layer_file_size: self.desc.file_size,
                lsn_start: self.desc.lsn_range.start,
            }
        }
    }
}
