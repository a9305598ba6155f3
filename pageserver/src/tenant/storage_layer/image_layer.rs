//! An image layer stores a snapshot of all keys in a key range at one LSN.
//!
//! The file is named `<key start>-<key end>__<lsn>`; see [`ImageLayerName`]. Image
//! layers are created by compaction and are never modified after the final rename.
use std::ops::Range;

use anyhow::{ensure, Context};
use bytes::Bytes;
use camino::Utf8PathBuf;
use pageserver_api::key::{is_valid_key_range, Key};
use rand::{distributions::Alphanumeric, Rng};
use tracing::*;
use utils::{
    id::{TenantId, TimelineId},
    lsn::Lsn,
};

use super::layer_file::{self, BlobWriter, Summary};
use super::{ImageLayerName, PersistentLayer, PersistentLayerDesc, Value};
use crate::config::PageServerConf;
use crate::{IMAGE_FILE_MAGIC, STORAGE_FORMAT_VERSION, TEMP_FILE_SUFFIX};

fn temp_path_for(
    conf: &PageServerConf,
    timeline_id: TimelineId,
    tenant_id: TenantId,
    fname: &ImageLayerName,
) -> Utf8PathBuf {
    let rand_string: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();

    conf.timeline_path(&tenant_id, &timeline_id)
        .join(format!("{fname}.{rand_string}.{TEMP_FILE_SUFFIX}"))
}

struct ImageLayerWriterInner {
    conf: &'static PageServerConf,
    path: Utf8PathBuf,
    timeline_id: TimelineId,
    tenant_id: TenantId,
    key_range: Range<Key>,
    lsn: Lsn,
    last_key: Option<Key>,

    blob_writer: BlobWriter,
}

impl ImageLayerWriterInner {
    fn new(
        conf: &'static PageServerConf,
        timeline_id: TimelineId,
        tenant_id: TenantId,
        key_range: &Range<Key>,
        lsn: Lsn,
    ) -> anyhow::Result<Self> {
        ensure!(
            is_valid_key_range(key_range),
            "invalid key range {}..{} for image layer",
            key_range.start,
            key_range.end
        );
        ensure!(lsn < Lsn::MAX, "image layer cannot be created at Lsn::MAX");

        // Create the file initially with a temporary filename.
        // We'll atomically rename it to the final name when we're done.
        let path = temp_path_for(
            conf,
            timeline_id,
            tenant_id,
            &ImageLayerName {
                key_range: key_range.clone(),
                lsn,
            },
        );
        info!("new image layer {path}");
        let blob_writer = BlobWriter::create(&path)?;

        Ok(Self {
            conf,
            path,
            timeline_id,
            tenant_id,
            key_range: key_range.clone(),
            lsn,
            last_key: None,
            blob_writer,
        })
    }

    fn put_image(&mut self, key: Key, img: Bytes) -> anyhow::Result<()> {
        ensure!(
            self.key_range.contains(&key),
            "key {key} outside of image layer key range"
        );
        if let Some(last_key) = self.last_key {
            ensure!(key > last_key, "image keys must be written in increasing order");
        }
        self.blob_writer.put(key, self.lsn, &Value::Image(img))?;
        self.last_key = Some(key);
        Ok(())
    }

    fn finish(self) -> anyhow::Result<PersistentLayer> {
        let temp_path = self.path.clone();
        let result = self.finish0();
        if result.is_err() {
            layer_file::remove_if_exists(&temp_path);
        }
        result
    }

    fn finish0(self) -> anyhow::Result<PersistentLayer> {
        let summary = Summary {
            magic: IMAGE_FILE_MAGIC,
            format_version: STORAGE_FORMAT_VERSION,
            tenant_id: self.tenant_id,
            timeline_id: self.timeline_id,
            key_range: self.key_range.clone(),
            lsn_range: self.lsn.single(),
            index_start: 0,
            index_len: 0,
        };
        let file_size = self
            .blob_writer
            .finish(summary)
            .with_context(|| format!("write image layer {}", self.path))?;

        fail::fail_point!(
            crate::failpoint_support::names::IMAGE_LAYER_WRITER_FAIL_BEFORE_FINISH,
            |_| {
                Err(anyhow::anyhow!(
                    "failpoint {}",
                    crate::failpoint_support::names::IMAGE_LAYER_WRITER_FAIL_BEFORE_FINISH
                ))
            }
        );
        // the name the regression suite configures
        fail::fail_point!(
            crate::failpoint_support::names::IMAGE_LAYER_FAIL_BEFORE_FINISH,
            |_| {
                Err(anyhow::anyhow!(
                    "failpoint {}",
                    crate::failpoint_support::names::IMAGE_LAYER_FAIL_BEFORE_FINISH
                ))
            }
        );

        let desc = PersistentLayerDesc::new_img(
            self.tenant_id,
            self.timeline_id,
            self.key_range,
            self.lsn,
            file_size,
        );
        let final_path = self
            .conf
            .timeline_path(&self.tenant_id, &self.timeline_id)
            .join(desc.filename());
        layer_file::publish(&self.path, &final_path)?;

        trace!("created image layer {final_path}");

        Ok(PersistentLayer::new(desc, final_path))
    }
}

/// A builder object for constructing a new image layer.
///
/// Usage:
///
/// 1. Create the ImageLayerWriter by calling ImageLayerWriter::new(...)
///
/// 2. Write the contents by calling `put_image` for every key in the key
///    range, in increasing key order.
///
/// 3. Call `finish`.
///
/// Until `finish` succeeds, the data lives in a temporary file in the timeline
/// directory. Dropping the writer, or a failing `finish`, removes it.
#[must_use]
pub struct ImageLayerWriter {
    inner: Option<ImageLayerWriterInner>,
}

impl ImageLayerWriter {
    ///
    /// Start building a new image layer.
    ///
    pub fn new(
        conf: &'static PageServerConf,
        timeline_id: TimelineId,
        tenant_id: TenantId,
        key_range: &Range<Key>,
        lsn: Lsn,
    ) -> anyhow::Result<ImageLayerWriter> {
        Ok(Self {
            inner: Some(ImageLayerWriterInner::new(
                conf,
                timeline_id,
                tenant_id,
                key_range,
                lsn,
            )?),
        })
    }

    pub fn put_image(&mut self, key: Key, img: Bytes) -> anyhow::Result<()> {
        self.inner
            .as_mut()
            .context("image layer writer already finished")?
            .put_image(key, img)
    }

    /// Bytes written so far.
    pub fn size(&self) -> u64 {
        self.inner.as_ref().map_or(0, |inner| inner.blob_writer.size())
    }

    ///
    /// Finish writing the image layer, moving it to its final name.
    ///
    pub fn finish(mut self) -> anyhow::Result<PersistentLayer> {
        self.inner
            .take()
            .context("image layer writer already finished")?
            .finish()
    }
}

impl Drop for ImageLayerWriter {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            drop(inner.blob_writer);
            layer_file::remove_if_exists(&inner.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::harness::TenantHarness;
    use crate::tenant::storage_layer::{ValueReconstructResult, ValueReconstructState};

    #[test]
    fn image_layer_lifecycle() -> anyhow::Result<()> {
        let harness = TenantHarness::create("image_layer_lifecycle")?;
        let timeline_id = TimelineId::generate();
        let timeline_dir = harness.conf.timeline_path(&harness.tenant_id, &timeline_id);
        std::fs::create_dir_all(&timeline_dir)?;

        let key_range = Key::from_u32(0)..Key::from_u32(100);
        let mut writer = ImageLayerWriter::new(
            harness.conf,
            timeline_id,
            harness.tenant_id,
            &key_range,
            Lsn(0x40),
        )?;
        writer.put_image(Key::from_u32(3), Bytes::from_static(b"three"))?;
        writer.put_image(Key::from_u32(10), Bytes::from_static(b"ten"))?;
        assert!(writer
            .put_image(Key::from_u32(5), Bytes::from_static(b"late"))
            .is_err());
        assert!(writer
            .put_image(Key::from_u32(200), Bytes::from_static(b"outside"))
            .is_err());

        let layer = writer.finish()?;
        let expected_name = format!("{}-{}__{:016X}", key_range.start, key_range.end, 0x40);
        assert_eq!(layer.layer_desc().filename(), expected_name);
        assert_eq!(layer.path(), timeline_dir.join(&expected_name));

        let names: Vec<String> = std::fs::read_dir(&timeline_dir)?
            .map(|e| e.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect::<Result<_, _>>()?;
        assert_eq!(names, vec![expected_name]);

        let mut state = ValueReconstructState::default();
        let res = layer.get_value_reconstruct_data(
            Key::from_u32(10),
            Lsn(0x40)..Lsn(0x41),
            &mut state,
        )?;
        assert_eq!(res, ValueReconstructResult::Complete);
        assert_eq!(state.img, Some((Lsn(0x40), Bytes::from_static(b"ten"))));

        let mut state = ValueReconstructState::default();
        let res = layer.get_value_reconstruct_data(
            Key::from_u32(4),
            Lsn(0x40)..Lsn(0x41),
            &mut state,
        )?;
        assert_eq!(res, ValueReconstructResult::Missing);
        assert_eq!(layer.keys()?, vec![Key::from_u32(3), Key::from_u32(10)]);
        Ok(())
    }

    #[test]
    fn dropped_writer_leaves_nothing_behind() -> anyhow::Result<()> {
        let harness = TenantHarness::create("dropped_image_writer")?;
        let timeline_id = TimelineId::generate();
        let timeline_dir = harness.conf.timeline_path(&harness.tenant_id, &timeline_id);
        std::fs::create_dir_all(&timeline_dir)?;

        let mut writer = ImageLayerWriter::new(
            harness.conf,
            timeline_id,
            harness.tenant_id,
            &(Key::MIN..Key::MAX),
            Lsn(0x20),
        )?;
        writer.put_image(Key::from_u32(1), Bytes::from_static(b"x"))?;
        assert_eq!(std::fs::read_dir(&timeline_dir)?.count(), 1);
        drop(writer);
        assert_eq!(std::fs::read_dir(&timeline_dir)?.count(), 0);
        Ok(())
    }
}
