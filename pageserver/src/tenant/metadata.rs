//! Every timeline of a [`crate::tenant::Tenant`] has metadata that needs to be
//! stored persistently.
//!
//! The metadata is a part of the [`IndexPart`] uploaded to the remote storage, which is
//! the only persistent record of it: the local timeline directory is a cache.
//!
//! [`IndexPart`]: super::remote_timeline_client::index::IndexPart

use serde::{Deserialize, Serialize};
use utils::{id::TimelineId, lsn::Lsn};

/// Metadata stored for each timeline
///
/// The fields correspond to the values we hold in memory, in Timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineMetadata {
    pub disk_consistent_lsn: Lsn,
    pub ancestor_timeline: Option<TimelineId>,
    /// [`Lsn::INVALID`] for timelines without an ancestor.
    pub ancestor_lsn: Lsn,
    pub latest_gc_cutoff_lsn: Lsn,
    pub initdb_lsn: Lsn,
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
            disk_consistent_lsn,
            ancestor_timeline,
            ancestor_lsn,
            latest_gc_cutoff_lsn,
            initdb_lsn,
        }
    }

    /// The ancestor and the branch point, if the timeline has an ancestor.
    pub fn ancestor(&self) -> Option<(TimelineId, Lsn)> {
        self.ancestor_timeline.map(|id| (id, self.ancestor_lsn))
    }

    /// The first LSN at which the timeline can hold its own data.
    pub fn start_lsn(&self) -> Lsn {
        match self.ancestor_timeline {
            Some(_) => self.ancestor_lsn,
            None => self.initdb_lsn,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ancestor_and_start() {
        let root = TimelineMetadata::new(Lsn(0x30), None, Lsn::INVALID, Lsn(0), Lsn(0x10));
        assert_eq!(root.ancestor(), None);
        assert_eq!(root.start_lsn(), Lsn(0x10));

        let parent = TimelineId::from_array([7; 16]);
        let child = TimelineMetadata::new(Lsn(0x50), Some(parent), Lsn(0x28), Lsn(0), Lsn(0x10));
        assert_eq!(child.ancestor(), Some((parent, Lsn(0x28))));
        assert_eq!(child.start_lsn(), Lsn(0x28));

        let json = serde_json::to_string(&child).unwrap();
        assert_eq!(serde_json::from_str::<TimelineMetadata>(&json).unwrap(), child);
    }
}
