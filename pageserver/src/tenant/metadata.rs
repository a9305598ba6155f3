//! Every timeline has a metadata file that needs to be stored persistently.
//!
//! The module contains all structs and related helper methods related to timeline metadata.

use anyhow::{ensure, Context};
use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use tracing::info_span;
use utils::crashsafe;
use utils::{
    id::{TenantId, TimelineId},
    lsn::Lsn,
};

use crate::config::PageServerConf;
use crate::TEMP_FILE_SUFFIX;

/// Use special format number to enable backward compatibility.
const METADATA_FORMAT_VERSION: u16 = 1;

/// We assume that a write of up to METADATA_MAX_SIZE bytes is atomic.
///
/// This is the same assumption that PostgreSQL makes with the control file,
/// see PG_CONTROL_MAX_SAFE_SIZE
const METADATA_MAX_SIZE: usize = 512;

/// Metadata stored on disk for each timeline
///
/// The fields correspond to the values we hold in memory, in Timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineMetadata {
    hdr: TimelineMetadataHeader,
    body: TimelineMetadataBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct TimelineMetadataHeader {
    checksum: u32,       // CRC of serialized metadata body
    size: u16,           // size of serialized metadata
    format_version: u16, // metadata format version (used for compatibility checks)
}
const METADATA_HDR_SIZE: usize = std::mem::size_of::<TimelineMetadataHeader>();

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct TimelineMetadataBody {
    disk_consistent_lsn: Lsn,
    ancestor_timeline: Option<TimelineId>,
    ancestor_lsn: Lsn,
    latest_gc_cutoff_lsn: Lsn,
    initdb_lsn: Lsn,
}

impl TimelineMetadata {
    pub fn new(
        disk_consistent_lsn: Lsn,
        ancestor_timeline: Option<TimelineId>,
        ancestor_lsn: Lsn,
        latest_gc_cutoff_lsn: Lsn,
        initdb_lsn: Lsn,
    ) -> Self {
        Self {
            hdr: TimelineMetadataHeader {
                checksum: 0,
                size: 0,
                format_version: METADATA_FORMAT_VERSION,
            },
            body: TimelineMetadataBody {
                disk_consistent_lsn,
                ancestor_timeline,
                ancestor_lsn,
                latest_gc_cutoff_lsn,
                initdb_lsn,
            },
        }
    }

    pub fn from_bytes(metadata_bytes: &[u8]) -> anyhow::Result<Self> {
        ensure!(
            metadata_bytes.len() == METADATA_MAX_SIZE,
            "metadata bytes size is wrong"
        );
        let hdr: TimelineMetadataHeader =
            bincode::deserialize(&metadata_bytes[0..METADATA_HDR_SIZE])?;
        ensure!(
            hdr.format_version == METADATA_FORMAT_VERSION,
            "unsupported metadata format version {}",
            hdr.format_version
        );

        let metadata_size = hdr.size as usize;
        ensure!(
            (METADATA_HDR_SIZE..=METADATA_MAX_SIZE).contains(&metadata_size),
            "corrupted metadata size {metadata_size}"
        );
        let calculated_checksum = crc32c::crc32c(&metadata_bytes[METADATA_HDR_SIZE..metadata_size]);
        ensure!(
            hdr.checksum == calculated_checksum,
            "metadata checksum mismatch"
        );

        let body: TimelineMetadataBody =
            bincode::deserialize(&metadata_bytes[METADATA_HDR_SIZE..metadata_size])?;
        Ok(TimelineMetadata { hdr, body })
    }

    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        let body_bytes = bincode::serialize(&self.body)?;
        let metadata_size = METADATA_HDR_SIZE + body_bytes.len();
        ensure!(
            metadata_size <= METADATA_MAX_SIZE,
            "metadata of {metadata_size} bytes does not fit"
        );
        let hdr = TimelineMetadataHeader {
            size: metadata_size as u16,
            format_version: METADATA_FORMAT_VERSION,
            checksum: crc32c::crc32c(&body_bytes),
        };
        let hdr_bytes = bincode::serialize(&hdr)?;
        let mut metadata_bytes = vec![0u8; METADATA_MAX_SIZE];
        metadata_bytes[0..METADATA_HDR_SIZE].copy_from_slice(&hdr_bytes);
        metadata_bytes[METADATA_HDR_SIZE..metadata_size].copy_from_slice(&body_bytes);
        Ok(metadata_bytes)
    }

    /// [`Lsn`] that corresponds to the corresponding timeline directory
    /// contents, stored locally in the pageserver workdir.
    pub fn disk_consistent_lsn(&self) -> Lsn {
        self.body.disk_consistent_lsn
    }

    pub fn ancestor_timeline(&self) -> Option<TimelineId> {
        self.body.ancestor_timeline
    }

    pub fn ancestor_lsn(&self) -> Lsn {
        self.body.ancestor_lsn
    }

    pub fn latest_gc_cutoff_lsn(&self) -> Lsn {
        self.body.latest_gc_cutoff_lsn
    }

    pub fn initdb_lsn(&self) -> Lsn {
        self.body.initdb_lsn
    }
}

/// Save timeline metadata to file
pub fn save_metadata(
    conf: &PageServerConf,
    tenant_id: &TenantId,
    timeline_id: &TimelineId,
    data: &TimelineMetadata,
) -> anyhow::Result<()> {
    save_metadata_to(&conf.metadata_path(tenant_id, timeline_id), data)
}

/// Writes `data` to the metadata file at `path`, replacing it crash-safely.
pub(crate) fn save_metadata_to(path: &Utf8Path, data: &TimelineMetadata) -> anyhow::Result<()> {
    let _enter = info_span!("saving metadata").entered();
    let temp_path = crashsafe::path_with_suffix_extension(path, TEMP_FILE_SUFFIX);
    let metadata_bytes = data.to_bytes().context("Failed to get metadata bytes")?;
    crashsafe::overwrite(path, &temp_path, &metadata_bytes)
        .with_context(|| format!("write metadata file {path}"))?;
    Ok(())
}

pub fn load_metadata(
    conf: &PageServerConf,
    tenant_id: &TenantId,
    timeline_id: &TimelineId,
) -> anyhow::Result<TimelineMetadata> {
    let metadata_path = conf.metadata_path(tenant_id, timeline_id);
    let metadata_bytes = std::fs::read(&metadata_path)
        .with_context(|| format!("Failed to read metadata bytes from path {metadata_path}"))?;
    TimelineMetadata::from_bytes(&metadata_bytes).with_context(|| {
        format!("Failed to parse metadata bytes from path {metadata_path}")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMELINE_ID: TimelineId = TimelineId::from_array([
        0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77,
        0x88,
    ]);

    #[test]
    fn metadata_serializes_correctly() {
        let original_metadata = TimelineMetadata::new(
            Lsn(0x200),
            Some(TIMELINE_ID),
            Lsn(0),
            Lsn(0),
            Lsn(0),
        );

        let metadata_bytes = original_metadata
            .to_bytes()
            .expect("Should serialize correct metadata to bytes");
        assert_eq!(metadata_bytes.len(), METADATA_MAX_SIZE);

        let deserialized_metadata = TimelineMetadata::from_bytes(&metadata_bytes)
            .expect("Should deserialize its own bytes");

        assert_eq!(
            deserialized_metadata.body, original_metadata.body,
            "Metadata that was serialized to bytes and deserialized back should not change"
        );
    }

    #[test]
    fn corrupted_metadata_is_rejected() {
        let metadata = TimelineMetadata::new(Lsn(0x200), None, Lsn(0), Lsn(0x100), Lsn(0x10));
        let mut bytes = metadata.to_bytes().unwrap();
        bytes[METADATA_HDR_SIZE] ^= 0xFF;
        let err = TimelineMetadata::from_bytes(&bytes).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"), "{err}");

        TimelineMetadata::from_bytes(&bytes[..100]).unwrap_err();
    }
}
