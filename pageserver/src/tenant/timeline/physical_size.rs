//! On-disk size of a timeline's layer files.

use anyhow::Context;
use camino::Utf8Path;

use crate::tenant::storage_layer::LayerName;

/// Sum of the sizes of the layer files directly in `timeline_path`.
///
/// Entries whose name is not a layer name are skipped, and so is a layer that is
/// removed while the directory is being scanned. Subdirectories are not entered.
pub fn calculate_physical_size(timeline_path: &Utf8Path) -> anyhow::Result<u64> {
    let mut total_physical_size = 0;
    let dir = timeline_path
        .read_dir_utf8()
        .with_context(|| format!("read timeline directory {timeline_path}"))?;
    for entry in dir {
        let entry = entry.with_context(|| format!("read timeline directory {timeline_path}"))?;
        if LayerName::classify(entry.file_name()).is_none() {
            continue;
        }
        match entry.metadata() {
            Ok(metadata) if metadata.is_file() => total_physical_size += metadata.len(),
            Ok(_) => {}
            // removed by gc or compaction after we listed it
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("stat {}", entry.path()));
            }
        }
    }
    Ok(total_physical_size)
}
