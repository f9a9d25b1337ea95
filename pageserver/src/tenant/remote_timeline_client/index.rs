//! In-memory index to track the timeline files on the remote storage.
//!
//! Every timeline's remote directory holds an `index_part.json`: the list of layer
//! files that make up the timeline, plus its metadata. A layer file that the index
//! does not list is not part of the timeline.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use utils::{id::TimelineId, lsn::Lsn};

use crate::tenant::metadata::TimelineMetadata;
use crate::tenant::storage_layer::LayerName;

/// Metadata gathered for each of the layer files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerFileMetadata {
    pub file_size: u64,
}

impl LayerFileMetadata {
    pub fn new(file_size: u64) -> Self {
        LayerFileMetadata { file_size }
    }
}

/// In-memory representation of an `index_part.json` file
///
/// This type needs to be backwards and forwards compatible. When changing the fields,
/// remember to add a test case for the changed version.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct IndexPart {
    /// Debugging aid describing the version of this type.
    #[serde(default)]
    version: usize,

    /// Layer names, which are stored on the remote storage, with their metadata.
    pub layer_metadata: HashMap<LayerName, LayerFileMetadata>,

    pub metadata: TimelineMetadata,

    #[serde(default)]
    pub lineage: Lineage,

    /// Progress of an ancestor detach which has not completed yet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ongoing_detach: Option<OngoingDetach>,
}

impl IndexPart {
    /// When adding or modifying any parts of `IndexPart`, increment the version so that it can be
    /// used to understand later versions.
    ///
    /// Version is currently informative only.
    const LATEST_VERSION: usize = 1;

    pub const FILE_NAME: &'static str = "index_part.json";

    pub fn new(
        layer_metadata: HashMap<LayerName, LayerFileMetadata>,
        metadata: TimelineMetadata,
        lineage: Lineage,
        ongoing_detach: Option<OngoingDetach>,
    ) -> Self {
        IndexPart {
            version: Self::LATEST_VERSION,
            layer_metadata,
            metadata,
            lineage,
            ongoing_detach,
        }
    }

    pub fn empty(metadata: TimelineMetadata) -> Self {
        Self::new(HashMap::new(), metadata, Lineage::default(), None)
    }

    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn to_json_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn duplicated_disk_consistent_lsn(&self) -> Lsn {
        self.metadata.disk_consistent_lsn
    }
}

/// How the ancestry of a timeline changed over time.
#[derive(Debug, Default, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Lineage {
    /// The ancestor and branch point this timeline had before it was detached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_ancestor: Option<(TimelineId, Lsn)>,

    /// Ancestors this timeline was reparented away from, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reparenting_history: Vec<TimelineId>,

    /// Set once a detach of this timeline has completed: the timelines which were
    /// reparented to it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detach_reparented: Option<BTreeSet<TimelineId>>,
}

impl Lineage {
    pub(crate) fn record_detaching(&mut self, ancestor: TimelineId, ancestor_lsn: Lsn) {
        self.original_ancestor.get_or_insert((ancestor, ancestor_lsn));
    }

    pub(crate) fn record_reparenting(&mut self, old_ancestor: TimelineId) {
        if self.reparenting_history.last() != Some(&old_ancestor) {
            self.reparenting_history.push(old_ancestor);
        }
    }

    pub(crate) fn is_reparented_from(&self, ancestor: &TimelineId) -> bool {
        self.reparenting_history.contains(ancestor)
    }

    pub(crate) fn is_detached_from_original_ancestor(&self) -> bool {
        self.original_ancestor.is_some()
    }
}

/// Persisted progress of an ancestor detach, so that a retry after a crash or a
/// failure resumes where the previous attempt stopped.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct OngoingDetach {
    pub ancestor_timeline_id: TimelineId,
    pub ancestor_lsn: Lsn,

    /// Layers of the ancestor history which have been copied or rewritten into this
    /// timeline, both locally and remotely.
    #[serde(default)]
    pub prepared_layers: BTreeMap<LayerName, LayerFileMetadata>,

    /// Set once the index without the ancestor link has been uploaded.
    #[serde(default)]
    pub attached: bool,

    /// Timelines reparented to this timeline so far.
    #[serde(default)]
    pub reparented: BTreeSet<TimelineId>,
}

impl OngoingDetach {
    pub(crate) fn new(ancestor_timeline_id: TimelineId, ancestor_lsn: Lsn) -> Self {
        OngoingDetach {
            ancestor_timeline_id,
            ancestor_lsn,
            prepared_layers: BTreeMap::new(),
            attached: false,
            reparented: BTreeSet::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v1_indexpart_is_parsed() {
        let example = r#"{
            "version":1,
            "layer_metadata":{
                "000000000000000000000000000000000000-FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF__0000000000000010-0000000000000030": { "file_size": 25600000 },
                "000000000000000000000000000000000000-FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF__0000000000000040": { "file_size": 9007199254741001 }
            },
            "metadata":{
                "disk_consistent_lsn":"0/30",
                "ancestor_timeline":null,
                "ancestor_lsn":"0/0",
                "latest_gc_cutoff_lsn":"0/10",
                "initdb_lsn":"0/10"
            }
        }"#;

        let part = IndexPart::from_json_bytes(example.as_bytes()).unwrap();
        assert_eq!(part.version, 1);
        assert_eq!(part.layer_metadata.len(), 2);
        assert_eq!(part.duplicated_disk_consistent_lsn(), Lsn(0x30));
        assert_eq!(part.lineage, Lineage::default());
        assert_eq!(part.ongoing_detach, None);

        let delta: LayerName =
            "000000000000000000000000000000000000-FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF__0000000000000010-0000000000000030"
                .parse()
                .unwrap();
        assert_eq!(part.layer_metadata[&delta], LayerFileMetadata::new(25600000));
    }

    #[test]
    fn detach_progress_survives_serialization() {
        let ancestor = TimelineId::generate();
        let sibling = TimelineId::generate();
        let name: LayerName =
            "000000000000000000000000000000000000-FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF__0000000000000010-0000000000000030"
                .parse()
                .unwrap();

        let mut ongoing = OngoingDetach::new(ancestor, Lsn(0x30));
        ongoing
            .prepared_layers
            .insert(name, LayerFileMetadata::new(100));
        ongoing.reparented.insert(sibling);

        let mut lineage = Lineage::default();
        lineage.record_detaching(ancestor, Lsn(0x30));

        let part = IndexPart::new(
            HashMap::new(),
            TimelineMetadata::new(Lsn(0x40), None, Lsn::INVALID, Lsn(0), Lsn(0x10)),
            lineage,
            Some(ongoing),
        );

        let bytes = part.to_json_bytes().unwrap();
        let back = IndexPart::from_json_bytes(&bytes).unwrap();
        assert_eq!(back, part);
        assert!(back.lineage.is_detached_from_original_ancestor());
    }

    #[test]
    fn lineage_records_are_idempotent() {
        let a = TimelineId::generate();
        let b = TimelineId::generate();
        let mut lineage = Lineage::default();

        lineage.record_detaching(a, Lsn(0x10));
        lineage.record_detaching(b, Lsn(0x20));
        assert_eq!(lineage.original_ancestor, Some((a, Lsn(0x10))));

        lineage.record_reparenting(a);
        lineage.record_reparenting(a);
        assert_eq!(lineage.reparenting_history, vec![a]);
        assert!(lineage.is_reparented_from(&a));
        assert!(!lineage.is_reparented_from(&b));
    }
}
