use serde::{Deserialize, Serialize};
use utils::{
    id::{TenantId, TimelineId},
    lsn::Lsn,
};

/// The state of a tenant in this pageserver.
///
/// ```mermaid
/// stateDiagram-v2
///
///     [*] --> Loading: spawn_load()
///
///     Loading --> Active: load() success
///     Loading --> Broken: load() failure
///
///     Active --> Active: first timeline added / last timeline removed
///     Active --> Stopping: detach, ignore or shutdown
///     Broken --> Stopping: detach, ignore or shutdown
///
///     Stopping --> Detached: all background loops stopped
///     Detached --> [*]
/// ```
///
/// Serialized with serde's external tagging, so an active tenant with running loops
/// shows up as `{"Active":{"background_jobs_running":true}}` and a detached one as
/// `"Detached"`.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::VariantNames,
    strum_macros::AsRefStr,
    strum_macros::IntoStaticStr,
)]
pub enum TenantState {
    /// Timelines are being read from local disk.
    Loading,
    /// The tenant is open for business.
    ///
    /// GC and compaction loops run only while the tenant has at least one timeline.
    Active { background_jobs_running: bool },
    /// Detach or shutdown was requested; background loops are being stopped.
    Stopping,
    /// All background loops have stopped and the tenant is gone from memory.
    Detached,
    /// Loading failed. No background loops run for a broken tenant.
    Broken { reason: String },
}

impl TenantState {
    pub fn is_active(&self) -> bool {
        matches!(self, TenantState::Active { .. })
    }

    pub fn background_jobs_running(&self) -> bool {
        matches!(
            self,
            TenantState::Active {
                background_jobs_running: true
            }
        )
    }
}

/// A state of a timeline in pageserver's memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimelineState {
    /// The timeline is recognized by the pageserver but is not yet operational.
    Loading,
    /// The timeline is fully operational.
    Active,
    /// The timeline is being deleted or its tenant detached.
    Stopping,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TenantInfo {
    pub id: TenantId,
    pub state: TenantState,
    /// Sum of the size of all layer files.
    pub current_physical_size: Option<u64>,
}

/// This represents the output of timeline listing.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TimelineInfo {
    pub tenant_id: TenantId,
    pub timeline_id: TimelineId,

    pub ancestor_timeline_id: Option<TimelineId>,
    pub ancestor_lsn: Option<Lsn>,
    pub last_record_lsn: Lsn,
    pub disk_consistent_lsn: Lsn,
    pub latest_gc_cutoff_lsn: Lsn,

    pub current_physical_size: u64,
    pub state: TimelineState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerMapInfo {
    pub in_memory_layers: Vec<InMemoryLayerInfo>,
    pub historic_layers: Vec<HistoricLayerInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum InMemoryLayerInfo {
    Open { lsn_start: Lsn },
    Frozen { lsn_start: Lsn, lsn_end: Lsn },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind")]
pub enum HistoricLayerInfo {
    Delta {
        layer_file_name: String,
        layer_file_size: u64,

        lsn_start: Lsn,
        lsn_end: Lsn,
    },
    Image {
        layer_file_name: String,
        layer_file_size: u64,

        lsn_start: Lsn,
    },
}

impl HistoricLayerInfo {
    pub fn layer_file_name(&self) -> &str {
        match self {
            HistoricLayerInfo::Delta {
                layer_file_name, ..
            }
            | HistoricLayerInfo::Image {
                layer_file_name, ..
            } => layer_file_name,
        }
    }

    pub fn layer_file_size(&self) -> u64 {
        match self {
            HistoricLayerInfo::Delta {
                layer_file_size, ..
            }
            | HistoricLayerInfo::Image {
                layer_file_size, ..
            } => *layer_file_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenantstate_serde_external_tagging() {
        let active = TenantState::Active {
            background_jobs_running: true,
        };
        let json = serde_json::to_value(&active).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"Active": {"background_jobs_running": true}})
        );
        assert_eq!(
            serde_json::to_value(TenantState::Detached).unwrap(),
            serde_json::json!("Detached")
        );

        let back: TenantState =
            serde_json::from_str(r#"{"Active":{"background_jobs_running":false}}"#).unwrap();
        assert_eq!(
            back,
            TenantState::Active {
                background_jobs_running: false
            }
        );
        assert!(!back.background_jobs_running());
        assert!(back.is_active());
    }

    #[test]
    fn tenantstate_strum_names() {
        let s: &'static str = TenantState::Broken {
            reason: "oops".to_string(),
        }
        .into();
        assert_eq!(s, "Broken");
        assert_eq!(TenantState::Stopping.to_string(), "Stopping");
        assert_eq!(
            TenantState::Active {
                background_jobs_running: true
            }
            .as_ref(),
            "Active"
        );
    }

    #[test]
    fn historic_layer_info_accessors() {
        let info = HistoricLayerInfo::Image {
            layer_file_name: "a".to_string(),
            layer_file_size: 10,
            lsn_start: Lsn(0x10),
        };
        assert_eq!(info.layer_file_name(), "a");
        assert_eq!(info.layer_file_size(), 10);
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["kind"], "Image");
    }
}
