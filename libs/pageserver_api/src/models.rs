pub mod detach_ancestor;

use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};
use utils::{
    id::{TenantId, TimelineId},
    lsn::Lsn,
};

use crate::key::Key;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerMapInfo {
    pub in_memory_layers: Vec<InMemoryLayerInfo>,
    pub historic_layers: Vec<HistoricLayerInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum InMemoryLayerInfo {
    Open { lsn_start: Lsn },
    Frozen { lsn_start: Lsn, lsn_end: Lsn },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum HistoricLayerInfo {
    Delta {
        layer_file_name: String,
        layer_file_size: u64,

        key_start: Key,
        key_end: Key,
        lsn_start: Lsn,
        lsn_end: Lsn,
        remote: bool,
    },
    Image {
        layer_file_name: String,
        layer_file_size: u64,

        key_start: Key,
        key_end: Key,
        lsn_start: Lsn,
        remote: bool,
    },
}

impl HistoricLayerInfo {
    pub fn layer_file_name(&self) -> &str {
        match self {
            HistoricLayerInfo::Delta {
                layer_file_name, ..
            } => layer_file_name,
            HistoricLayerInfo::Image {
                layer_file_name, ..
            } => layer_file_name,
        }
    }

    pub fn layer_file_size(&self) -> u64 {
        match self {
            HistoricLayerInfo::Delta {
                layer_file_size, ..
            } => *layer_file_size,
            HistoricLayerInfo::Image {
                layer_file_size, ..
            } => *layer_file_size,
        }
    }

    pub fn is_remote(&self) -> bool {
        match self {
            HistoricLayerInfo::Delta { remote, .. } => *remote,
            HistoricLayerInfo::Image { remote, .. } => *remote,
        }
    }

    pub fn set_remote(&mut self, value: bool) {
        let field = match self {
            HistoricLayerInfo::Delta { remote, .. } => remote,
            HistoricLayerInfo::Image { remote, .. } => remote,
        };
        *field = value;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRemoteLayersTaskSpawnRequest {
    pub max_concurrent_downloads: NonZeroUsize,
    /// Keep going past failed downloads and report them in the tally.
    #[serde(default)]
    pub errors_ok: bool,
    /// Fail the request if not a single layer could be downloaded.
    #[serde(default)]
    pub at_least_one_download: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct DownloadRemoteLayersTaskInfo {
    pub task_id: String,
    pub state: DownloadRemoteLayersTaskState,
    pub total_layer_count: u64,         // stable once `completed`
    pub successful_download_count: u64, // stable once `completed`
    pub failed_download_count: u64,     // stable once `completed`
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum DownloadRemoteLayersTaskState {
    Running,
    Completed,
    ShutDown,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TimelineGcRequest {
    pub gc_horizon: Option<u64>,
}

/// Classification of a timestamp lookup against the commit history of a timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LsnByTimestampKind {
    /// The LSN of the last commit at or before the timestamp.
    Present,
    /// The timestamp is after the last known commit; the LSN is the latest one.
    Future,
    /// The timestamp precedes every usable commit; the LSN is the timeline start.
    Past,
    /// There are no commit timestamps to search.
    NoData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LsnByTimestampResponse {
    pub lsn: Lsn,
    pub kind: LsnByTimestampKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineInfo {
    pub tenant_id: TenantId,
    pub timeline_id: TimelineId,
    pub ancestor_timeline_id: Option<TimelineId>,
    pub ancestor_lsn: Option<Lsn>,
    pub last_record_lsn: Lsn,
    pub disk_consistent_lsn: Lsn,
    pub latest_gc_cutoff_lsn: Lsn,
    pub current_physical_size: u64,
    pub resident_physical_size: u64,
    pub remote_physical_size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn historic_layer_info_is_tagged_by_kind() {
        let info = HistoricLayerInfo::Image {
            layer_file_name: "x".to_string(),
            layer_file_size: 10,
            key_start: Key::MIN,
            key_end: Key::MAX,
            lsn_start: Lsn(0x10),
            remote: true,
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["kind"], "Image");
        assert_eq!(json["remote"], true);
        assert_eq!(json["lsn_start"], "0/10");
    }

    #[test]
    fn lsn_by_timestamp_kind_names() {
        let resp = LsnByTimestampResponse {
            lsn: Lsn(0x20),
            kind: LsnByTimestampKind::NoData,
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["kind"], "nodata");
        assert_eq!(LsnByTimestampKind::Future.to_string(), "future");
    }

    #[test]
    fn spawn_request_flags_default_off() {
        let req: DownloadRemoteLayersTaskSpawnRequest =
            serde_json::from_str(r#"{"max_concurrent_downloads": 10}"#).unwrap();
        assert_eq!(req.max_concurrent_downloads.get(), 10);
        assert!(!req.errors_ok);
        assert!(!req.at_least_one_download);
    }
}
