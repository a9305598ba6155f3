//! A delta layer stores all the versions of the keys in a key range that were written
//! in an LSN range.
//!
//! The file is named `<key start>-<key end>__<lsn start>-<lsn end>`; see
//! [`DeltaLayerName`]. The end of the key range is only known when the writer is
//! finished, so while a delta layer is being written its temporary file uses the
//! placeholder `XXX` in place of the key end.
use std::ops::Range;

use anyhow::{ensure, Context};
use camino::Utf8PathBuf;
use pageserver_api::key::Key;
use rand::{distributions::Alphanumeric, Rng};
use tracing::*;
use utils::{
    id::{TenantId, TimelineId},
    lsn::Lsn,
};

use super::layer_file::{self, BlobWriter, Summary};
use super::{PersistentLayer, PersistentLayerDesc, Value};
use crate::config::PageServerConf;
use crate::{DELTA_FILE_MAGIC, STORAGE_FORMAT_VERSION, TEMP_FILE_SUFFIX};

fn temp_path_for(
    conf: &PageServerConf,
    timeline_id: TimelineId,
    tenant_id: TenantId,
    key_start: Key,
    lsn_range: &Range<Lsn>,
) -> Utf8PathBuf {
    let rand_string: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();

    conf.timeline_path(&tenant_id, &timeline_id).join(format!(
        "{}-XXX__{:016X}-{:016X}.{}.{}",
        key_start,
        u64::from(lsn_range.start),
        u64::from(lsn_range.end),
        rand_string,
        TEMP_FILE_SUFFIX,
    ))
}

struct DeltaLayerWriterInner {
    conf: &'static PageServerConf,
    path: Utf8PathBuf,
    timeline_id: TimelineId,
    tenant_id: TenantId,

    key_start: Key,
    lsn_range: Range<Lsn>,
    last: Option<(Key, Lsn)>,

    blob_writer: BlobWriter,
}

impl DeltaLayerWriterInner {
    fn new(
        conf: &'static PageServerConf,
        timeline_id: TimelineId,
        tenant_id: TenantId,
        key_start: Key,
        lsn_range: Range<Lsn>,
    ) -> anyhow::Result<Self> {
        ensure!(
            lsn_range.start < lsn_range.end,
            "empty LSN range {}..{} for delta layer",
            lsn_range.start,
            lsn_range.end
        );

        // Create the file initially with a temporary filename. We don't know
        // the end key yet, so we cannot form the final filename yet. We will
        // rename it when we're done.
        let path = temp_path_for(conf, timeline_id, tenant_id, key_start, &lsn_range);
        debug!("new delta layer {path}");
        let blob_writer = BlobWriter::create(&path)?;

        Ok(Self {
            conf,
            path,
            timeline_id,
            tenant_id,
            key_start,
            lsn_range,
            last: None,
            blob_writer,
        })
    }

    fn put_value(&mut self, key: Key, lsn: Lsn, val: &Value) -> anyhow::Result<()> {
        ensure!(
            key >= self.key_start,
            "key {key} is before the start of the delta layer"
        );
        ensure!(
            self.lsn_range.contains(&lsn),
            "value LSN {lsn} outside of delta layer LSN range {}..{}",
            self.lsn_range.start,
            self.lsn_range.end
        );
        if let Some(last) = self.last {
            ensure!(
                (key, lsn) > last,
                "delta layer values must be written in (key, lsn) order"
            );
        }
        self.blob_writer.put(key, lsn, val)?;
        self.last = Some((key, lsn));
        Ok(())
    }

    fn finish(self, key_end: Key) -> anyhow::Result<PersistentLayer> {
        let temp_path = self.path.clone();
        let result = self.finish0(key_end);
        if result.is_err() {
            layer_file::remove_if_exists(&temp_path);
        }
        result
    }

    fn finish0(self, key_end: Key) -> anyhow::Result<PersistentLayer> {
        ensure!(
            key_end > self.key_start,
            "delta layer key end {key_end} must be after its start {}",
            self.key_start
        );
        if let Some((last_key, _)) = self.last {
            ensure!(
                key_end > last_key,
                "delta layer key end {key_end} must be after the last written key {last_key}"
            );
        }

        let summary = Summary {
            magic: DELTA_FILE_MAGIC,
            format_version: STORAGE_FORMAT_VERSION,
            tenant_id: self.tenant_id,
            timeline_id: self.timeline_id,
            key_range: self.key_start..key_end,
            lsn_range: self.lsn_range.clone(),
            index_start: 0,
            index_len: 0,
        };
        let file_size = self
            .blob_writer
            .finish(summary)
            .with_context(|| format!("write delta layer {}", self.path))?;

        fail::fail_point!(
            crate::failpoint_support::names::DELTA_LAYER_WRITER_FAIL_BEFORE_FINISH,
            |_| {
                Err(anyhow::anyhow!(
                    "failpoint {}",
                    crate::failpoint_support::names::DELTA_LAYER_WRITER_FAIL_BEFORE_FINISH
                ))
            }
        );

        let desc = PersistentLayerDesc::new_delta(
            self.tenant_id,
            self.timeline_id,
            self.key_start..key_end,
            self.lsn_range,
            file_size,
        );
        let final_path = self
            .conf
            .timeline_path(&self.tenant_id, &self.timeline_id)
            .join(desc.filename());
        layer_file::publish(&self.path, &final_path)?;

        trace!("created delta layer {final_path}");

        Ok(PersistentLayer::new(desc, final_path))
    }
}

/// A builder object for constructing a new delta layer.
///
/// Usage:
///
/// 1. Create the DeltaLayerWriter by calling DeltaLayerWriter::new(...)
///
/// 2. Write the contents by calling `put_value` for every page
///    version to store in the layer, ordered by key and LSN.
///
/// 3. Call `finish` with the end of the key range.
///
/// Dropping the writer before `finish`, or a failing `finish`, removes the
/// temporary file.
#[must_use]
pub struct DeltaLayerWriter {
    inner: Option<DeltaLayerWriterInner>,
}

impl DeltaLayerWriter {
    ///
    /// Start building a new delta layer.
    ///
    pub fn new(
        conf: &'static PageServerConf,
        timeline_id: TimelineId,
        tenant_id: TenantId,
        key_start: Key,
        lsn_range: Range<Lsn>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            inner: Some(DeltaLayerWriterInner::new(
                conf,
                timeline_id,
                tenant_id,
                key_start,
                lsn_range,
            )?),
        })
    }

    ///
    /// Append a key-value pair to the file.
    ///
    /// The values must be appended in key, lsn order.
    ///
    pub fn put_value(&mut self, key: Key, lsn: Lsn, val: &Value) -> anyhow::Result<()> {
        self.inner
            .as_mut()
            .context("delta layer writer already finished")?
            .put_value(key, lsn, val)
    }

    pub fn size(&self) -> u64 {
        self.inner.as_ref().map_or(0, |inner| inner.blob_writer.size())
    }

    pub fn num_entries(&self) -> usize {
        self.inner
            .as_ref()
            .map_or(0, |inner| inner.blob_writer.num_entries())
    }

    ///
    /// Finish writing the delta layer, moving it to its final name.
    ///
    pub fn finish(mut self, key_end: Key) -> anyhow::Result<PersistentLayer> {
        self.inner
            .take()
            .context("delta layer writer already finished")?
            .finish(key_end)
    }
}

impl Drop for DeltaLayerWriter {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            drop(inner.blob_writer);
            layer_file::remove_if_exists(&inner.path);
        }
    }
}
