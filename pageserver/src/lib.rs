pub mod config;
pub mod failpoint_support;
pub mod metrics;
pub mod task_mgr;
pub mod tenant;
pub mod walredo;

use camino::Utf8Path;

pub use crate::tenant::mgr::TenantManager;

/// Current storage format version
///
/// This is embedded in the header of all the layer files.
/// If you make any backwards-incompatible changes to the storage
/// format, bump this!
pub const STORAGE_FORMAT_VERSION: u16 = 1;

// Magic constants used to identify different kinds of files
pub const IMAGE_FILE_MAGIC: u16 = 0x5A60;
pub const DELTA_FILE_MAGIC: u16 = 0x5A61;

/// A suffix used for various temporary files. Any temporary files found in the
/// data directory at pageserver startup can be automatically removed.
pub const TEMP_FILE_SUFFIX: &str = "___temp";

pub const METADATA_FILE_NAME: &str = "metadata";

pub const TENANT_CONFIG_NAME: &str = "config";

pub const TIMELINES_SEGMENT_NAME: &str = "timelines";

/// A marker file in a tenant directory. Tenants with it are not loaded at startup.
pub const IGNORED_TENANT_FILE_NAME: &str = "ignored-tenant";

pub fn is_temporary(path: &Utf8Path) -> bool {
    match path.file_name() {
        Some(name) => name.ends_with(TEMP_FILE_SUFFIX),
        None => false,
    }
}
