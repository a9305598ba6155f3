use std::fs::File;

use tracing::*;
use utils::logging::{self, LogFormat, Output};

#[test]
fn test_plain_format_respects_rust_log() {
    std::env::set_var("RUST_LOG", "warn");

    let dir = camino_tempfile::tempdir().unwrap();
    let log_path = dir.path().join("pageserver.log");
    logging::init(LogFormat::Plain, Output::File(File::create(&log_path).unwrap())).unwrap();

    info!("filtered out");
    warn!(tenant_id = "t1", "compaction failed");

    let content = std::fs::read_to_string(&log_path).unwrap();
    assert!(!content.contains("filtered out"));
    assert!(content.contains("WARN"));
    assert!(content.contains("compaction failed"));
    assert!(content.contains("tenant_id"));
}
