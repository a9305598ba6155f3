//! Failpoints are configured from the `FAILPOINTS` environment variable at startup,
//! `name=action` pairs separated by `;`. Besides the actions the `fail` crate knows,
//! `exit` terminates the process when the failpoint is hit.
//!
//! The `fail_point!` sites only exist in builds with the `testing` feature.

/// Names of the failpoints in this crate.
pub mod names {
    pub const IMAGE_LAYER_WRITER_FAIL_BEFORE_FINISH: &str = "image-layer-writer-fail-before-finish";
    /// Same site as [`IMAGE_LAYER_WRITER_FAIL_BEFORE_FINISH`].
    pub const IMAGE_LAYER_FAIL_BEFORE_FINISH: &str = "image-layer-fail-before-finish";
    pub const DELTA_LAYER_WRITER_FAIL_BEFORE_FINISH: &str = "delta-layer-writer-fail-before-finish";
    pub const COMPACTION_ITERATION: &str = "compaction-iteration";
    pub const TENANT_CREATION_BEFORE_TMP_RENAME: &str = "tenant-creation-before-tmp-rename";
    pub const TIMELINE_CREATION_BEFORE_TMP_RENAME: &str = "timeline-creation-before-tmp-rename";
}

pub fn init() -> fail::FailScenario<'static> {
    let mut exits = Vec::new();

    if let Ok(val) = std::env::var("FAILPOINTS") {
        // pre-process to allow using "exit"
        let parsed = val.split(';').map(|s| {
            s.split_once('=')
                .map(|tuple| (tuple.0, Some(tuple.1)))
                .unwrap_or((s, None))
        });

        let mut s = String::new();

        for (name, action) in parsed {
            if action == Some("exit") {
                // we'll need to handle this separatedly
                exits.push(String::from(name));
                continue;
            }

            if !s.is_empty() {
                s.push(';');
            }
            s.push_str(name);
            if let Some(action) = action {
                s.push('=');
                s.push_str(action);
            }
        }
        std::env::set_var("FAILPOINTS", s);
    };

    let scenario = fail::FailScenario::setup();

    for name in exits {
        if let Err(e) = fail::cfg_callback(name.clone(), exit_failpoint) {
            tracing::warn!("failed to configure exit failpoint {name}: {e}");
        }
    }

    scenario
}

#[inline(never)]
fn exit_failpoint() {
    tracing::info!("Exit requested by failpoint");
    std::process::exit(1);
}
