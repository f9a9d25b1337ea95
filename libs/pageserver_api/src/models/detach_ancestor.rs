use std::collections::HashSet;

use utils::id::TimelineId;

/// Result of a completed ancestor detach: the timelines that now have the
/// detached timeline as their ancestor.
#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AncestorDetached {
    pub reparented_timelines: HashSet<TimelineId>,
}
