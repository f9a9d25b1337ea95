//! This module defines the value type used by the storage engine.
//!
//! A [`Value`] represents either a completely new value for one Key ([`Value::Image`]),
//! or a "delta" of how to get from previous version of the value to the new one
//! ([`Value::WalRecord`]).
//!
//! Note that the [`Value`] type is used for the permanent storage format, so any
//! changes to it must be backwards compatible.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Value {
    /// An Image value contains a full copy of the value
    Image(Bytes),
    /// A WalRecord value contains bytes appended to the previous version
    /// of the value. Replaying it requires that previous version.
    WalRecord(Bytes),
}

impl Value {
    #[inline(always)]
    pub fn is_image(&self) -> bool {
        matches!(self, Value::Image(_))
    }

    #[inline(always)]
    pub fn will_init(&self) -> bool {
        self.is_image()
    }

    pub fn serialized_size(&self) -> usize {
        1 + 4
            + match self {
                Value::Image(img) => img.len(),
                Value::WalRecord(rec) => rec.len(),
            }
    }
}

/// Apply `records` (oldest first) on top of `base`.
///
/// Returns `None` if the first record needs a previous version and there is none.
pub fn apply_records(base: Option<Bytes>, records: &[Bytes]) -> Option<Bytes> {
    let base = base?;
    if records.is_empty() {
        return Some(base);
    }
    let mut buf = BytesMut::from(&base[..]);
    for rec in records {
        buf.extend_from_slice(rec);
    }
    Some(buf.freeze())
}
