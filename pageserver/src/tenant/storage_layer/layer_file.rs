//! On-disk format shared by image and delta layer files.
//!
//! ```text
//! +--------------------+ 0
//! | Summary (bincode)  |
//! +--------------------+ PAGE_SZ
//! | blob               |  u32 big-endian length, then a bincode-encoded Value
//! | blob               |
//! | ...                |
//! +--------------------+ index_start
//! | index (bincode)    |  Vec<(Key, Lsn, blob offset)>, sorted by key and LSN
//! +--------------------+ index_start + index_len
//! ```
//!
//! The summary is written last, after all the blobs and the index, so a file with a
//! valid summary block always has a complete index.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::ops::Range;
use std::os::unix::fs::FileExt;

use anyhow::{ensure, Context};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use camino::Utf8Path;
use pageserver_api::key::Key;
use serde::{Deserialize, Serialize};
use tracing::*;
use utils::{
    crashsafe,
    id::{TenantId, TimelineId},
    lsn::Lsn,
};

use super::Value;
use crate::STORAGE_FORMAT_VERSION;

pub(crate) const PAGE_SZ: u64 = 8192;

/// Header stored in the first block of every layer file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Summary {
    /// Magic value to identify this as an image or delta layer file.
    pub magic: u16,
    pub format_version: u16,

    pub tenant_id: TenantId,
    pub timeline_id: TimelineId,
    pub key_range: Range<Key>,
    pub lsn_range: Range<Lsn>,

    pub index_start: u64,
    pub index_len: u64,
}

pub(crate) type IndexEntry = (Key, Lsn, u64);

/// Appends values to a new layer file, collecting the index as it goes.
pub(crate) struct BlobWriter {
    file: BufWriter<File>,
    offset: u64,
    index: Vec<IndexEntry>,
}

impl BlobWriter {
    /// Creates `path`, which must not exist yet.
    pub fn create(path: &Utf8Path) -> anyhow::Result<Self> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .with_context(|| format!("create layer file {path}"))?;
        // make room for the header block
        file.seek(SeekFrom::Start(PAGE_SZ))?;
        Ok(BlobWriter {
            file: BufWriter::new(file),
            offset: PAGE_SZ,
            index: Vec::new(),
        })
    }

    pub fn put(&mut self, key: Key, lsn: Lsn, value: &Value) -> anyhow::Result<()> {
        let buf = bincode::serialize(value)?;
        let len = u32::try_from(buf.len()).context("value too large for a layer file")?;
        self.file.write_u32::<BigEndian>(len)?;
        self.file.write_all(&buf)?;
        self.index.push((key, lsn, self.offset));
        self.offset += 4 + buf.len() as u64;
        Ok(())
    }

    /// Bytes written so far, including the header block.
    pub fn size(&self) -> u64 {
        self.offset
    }

    pub fn num_entries(&self) -> usize {
        self.index.len()
    }

    /// Writes the index and the summary, then fsyncs the file. Returns the file size.
    ///
    /// `index_start` and `index_len` of `summary` are filled in here.
    pub fn finish(self, mut summary: Summary) -> anyhow::Result<u64> {
        let BlobWriter {
            mut file,
            offset,
            index,
        } = self;

        let index_buf = bincode::serialize(&index)?;
        file.write_all(&index_buf)?;
        let file = file.into_inner().map_err(|e| e.into_error())?;

        summary.index_start = offset;
        summary.index_len = index_buf.len() as u64;
        let summary_buf = bincode::serialize(&summary)?;
        ensure!(
            summary_buf.len() as u64 <= PAGE_SZ,
            "layer summary does not fit in the header block"
        );
        file.write_all_at(&summary_buf, 0)?;
        file.sync_all()?;

        Ok(summary.index_start + summary.index_len)
    }
}

/// Checks the header of a layer file and reads its index.
pub(crate) fn read_summary_and_index(
    file: &File,
    expected_magic: u16,
) -> anyhow::Result<(Summary, Vec<IndexEntry>)> {
    let mut header = vec![0u8; PAGE_SZ as usize];
    file.read_exact_at(&mut header, 0)
        .context("read layer summary block")?;
    let summary: Summary = bincode::deserialize(&header).context("decode layer summary")?;
    ensure!(
        summary.magic == expected_magic,
        "unexpected layer file magic {:#06X}, expected {:#06X}",
        summary.magic,
        expected_magic
    );
    ensure!(
        summary.format_version == STORAGE_FORMAT_VERSION,
        "unsupported layer format version {}",
        summary.format_version
    );

    let mut index_buf = vec![0u8; summary.index_len as usize];
    file.read_exact_at(&mut index_buf, summary.index_start)
        .context("read layer index")?;
    let index: Vec<IndexEntry> = bincode::deserialize(&index_buf).context("decode layer index")?;
    Ok((summary, index))
}

pub(crate) fn read_value(file: &File, offset: u64) -> anyhow::Result<Value> {
    let mut len_buf = [0u8; 4];
    file.read_exact_at(&mut len_buf, offset)?;
    let len = BigEndian::read_u32(&len_buf) as usize;
    let mut buf = vec![0u8; len];
    file.read_exact_at(&mut buf, offset + 4)?;
    Ok(bincode::deserialize(&buf)?)
}

/// Moves a finished temporary layer file to its final name and makes the rename durable.
///
/// On failure, neither the temporary nor the final file is left behind.
pub(crate) fn publish(temp_path: &Utf8Path, final_path: &Utf8Path) -> anyhow::Result<()> {
    ensure!(
        !final_path.exists(),
        "layer file {final_path} already exists"
    );
    std::fs::rename(temp_path, final_path)
        .with_context(|| format!("rename {temp_path} to {final_path}"))?;

    let parent = final_path
        .parent()
        .context("layer file path has no parent")?;
    if let Err(e) = crashsafe::fsync(parent) {
        remove_if_exists(final_path);
        return Err(e).with_context(|| format!("fsync directory {parent}"));
    }
    Ok(())
}

/// Best-effort removal used on the error paths of the layer writers.
pub(crate) fn remove_if_exists(path: &Utf8Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("failed to remove layer file {path}: {e}"),
    }
}
