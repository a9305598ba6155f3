//!
//! Reconstructs a value from a base image and the WAL records on top of it.
//!
//! A record either appends bytes to the current value or replaces it outright, so
//! redo happens in process.
//!
use anyhow::bail;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use utils::lsn::Lsn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalRecord {
    /// Appends to the previous version of the value.
    Append(Bytes),
    /// Starts a new version, without needing the previous one.
    Init(Bytes),
}

impl WalRecord {
    pub fn will_init(&self) -> bool {
        matches!(self, WalRecord::Init(_))
    }

    pub fn len(&self) -> usize {
        match self {
            WalRecord::Append(b) | WalRecord::Init(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Applies `records`, oldest first, on top of `base_img`.
pub fn apply_wal_records(
    base_img: Option<(Lsn, Bytes)>,
    records: &[(Lsn, WalRecord)],
) -> anyhow::Result<Bytes> {
    let mut page = match &base_img {
        Some((_, img)) => BytesMut::from(&img[..]),
        None => match records.first() {
            Some((_, rec)) if rec.will_init() => BytesMut::new(),
            Some((lsn, _)) => bail!("no base image and first record at {lsn} does not init"),
            None => bail!("nothing to reconstruct from"),
        },
    };
    let mut prev_lsn = base_img.as_ref().map(|(lsn, _)| *lsn);
    for (lsn, record) in records {
        if let Some(prev) = prev_lsn {
            if *lsn < prev {
                bail!("records out of order: {lsn} after {prev}");
            }
        }
        prev_lsn = Some(*lsn);
        match record {
            WalRecord::Init(b) => {
                page.clear();
                page.extend_from_slice(b);
            }
            WalRecord::Append(b) => page.extend_from_slice(b),
        }
    }
    Ok(page.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_on_base_image() {
        let img = apply_wal_records(
            Some((Lsn(0x10), Bytes::from_static(b"foo"))),
            &[
                (Lsn(0x20), WalRecord::Append(Bytes::from_static(b"bar"))),
                (Lsn(0x30), WalRecord::Append(Bytes::from_static(b"!"))),
            ],
        )
        .unwrap();
        assert_eq!(&img[..], b"foobar!");
    }

    #[test]
    fn init_record_resets() {
        let img = apply_wal_records(
            None,
            &[
                (Lsn(0x20), WalRecord::Init(Bytes::from_static(b"a"))),
                (Lsn(0x30), WalRecord::Append(Bytes::from_static(b"b"))),
                (Lsn(0x40), WalRecord::Init(Bytes::from_static(b"c"))),
            ],
        )
        .unwrap();
        assert_eq!(&img[..], b"c");
    }

    #[test]
    fn missing_base_is_an_error() {
        apply_wal_records(
            None,
            &[(Lsn(0x20), WalRecord::Append(Bytes::from_static(b"a")))],
        )
        .unwrap_err();
        apply_wal_records(None, &[]).unwrap_err();
    }
}
