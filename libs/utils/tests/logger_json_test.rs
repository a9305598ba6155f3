// The subscriber is global, so each logging test lives in its own test binary.
use std::fs::File;
use std::io::{BufRead, BufReader};

use tracing::*;
use utils::logging::{self, LogFormat, Output};

#[test]
fn test_json_format_has_message_and_custom_field() {
    std::env::set_var("RUST_LOG", "info");

    let dir = camino_tempfile::tempdir().unwrap();
    let log_path = dir.path().join("pageserver.log");
    let log_file = File::create(&log_path).unwrap();
    logging::init(LogFormat::Json, Output::File(log_file)).unwrap();

    let custom_field: &str = "hi";
    trace!(custom = %custom_field, "test log message");
    debug!(custom = %custom_field, "test log message");
    info!(custom = %custom_field, "test log message");
    warn!(custom = %custom_field, "test log message");
    error!(custom = %custom_field, "test log message");

    let lines = BufReader::new(File::open(&log_path).unwrap())
        .lines()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(lines.len(), 3);

    for content in lines {
        let json_object = serde_json::from_str::<serde_json::Value>(&content).unwrap();

        assert_eq!(json_object["fields"]["custom"], "hi");
        assert_eq!(json_object["fields"]["message"], "test log message");

        assert_ne!(json_object["level"], "TRACE");
        assert_ne!(json_object["level"], "DEBUG");
    }

    // a second global subscriber is refused
    logging::init(LogFormat::Plain, Output::Stderr).unwrap_err();
}
