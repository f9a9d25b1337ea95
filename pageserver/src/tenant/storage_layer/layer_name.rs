//!
//! Names of the image and delta layer files.
//!
//! A layer file is named after the region of the key-LSN space it covers, so the
//! name alone is enough to place the layer in a layer map:
//!
//! ```text
//!    delta: <key start>-<key end>__<LSN start>-<LSN end>
//!    image: <key start>-<key end>__<LSN>
//! ```
//!
//! Keys are printed as 36 hex digits and LSNs as 16.
use pageserver_api::key::Key;
use std::cmp::Ordering;
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use utils::lsn::Lsn;

#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub struct DeltaLayerName {
    pub key_range: Range<Key>,
    pub lsn_range: Range<Lsn>,
}

impl PartialOrd for DeltaLayerName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DeltaLayerName {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.key_range.start, self.key_range.end, self.lsn_range.start, self.lsn_range.end).cmp(&(
            other.key_range.start,
            other.key_range.end,
            other.lsn_range.start,
            other.lsn_range.end,
        ))
    }
}

impl DeltaLayerName {
    /// Returns None if the name does not match the delta layer pattern.
    pub fn parse_str(fname: &str) -> Option<Self> {
        let (key_part, lsn_part) = fname.split_once("__")?;
        let key_range = parse_key_range(key_part)?;
        let (lsn_start_str, lsn_end_str) = lsn_part.split_once('-')?;

        if lsn_start_str.len() != 16 || lsn_end_str.len() != 16 {
            return None;
        }
        let start_lsn = Lsn::from_hex(lsn_start_str).ok()?;
        let end_lsn = Lsn::from_hex(lsn_end_str).ok()?;
        if start_lsn >= end_lsn {
            return None;
        }

        Some(DeltaLayerName {
            key_range,
            lsn_range: start_lsn..end_lsn,
        })
    }
}

impl fmt::Display for DeltaLayerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}__{:016X}-{:016X}",
            self.key_range.start,
            self.key_range.end,
            u64::from(self.lsn_range.start),
            u64::from(self.lsn_range.end),
        )
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub struct ImageLayerName {
    pub key_range: Range<Key>,
    pub lsn: Lsn,
}

impl PartialOrd for ImageLayerName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ImageLayerName {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.key_range.start, self.key_range.end, self.lsn).cmp(&(
            other.key_range.start,
            other.key_range.end,
            other.lsn,
        ))
    }
}

impl ImageLayerName {
    /// Returns None if the name does not match the image layer pattern.
    pub fn parse_str(fname: &str) -> Option<Self> {
        let (key_part, lsn_str) = fname.split_once("__")?;
        let key_range = parse_key_range(key_part)?;
        if lsn_str.len() != 16 {
            return None;
        }
        let lsn = Lsn::from_hex(lsn_str).ok()?;

        Some(ImageLayerName { key_range, lsn })
    }
}

impl fmt::Display for ImageLayerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}__{:016X}",
            self.key_range.start,
            self.key_range.end,
            u64::from(self.lsn),
        )
    }
}

fn parse_key_range(s: &str) -> Option<Range<Key>> {
    let (key_start_str, key_end_str) = s.split_once('-')?;
    if key_start_str.len() != 36 || key_end_str.len() != 36 {
        return None;
    }
    let key_start = Key::from_hex(key_start_str).ok()?;
    let key_end = Key::from_hex(key_end_str).ok()?;
    if key_start >= key_end {
        return None;
    }
    Some(key_start..key_end)
}

/// LayerName is the identity of a layer within a timeline: its file name locally
/// and its object name in the remote storage.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone)]
pub enum LayerName {
    Image(ImageLayerName),
    Delta(DeltaLayerName),
}

impl LayerName {
    pub fn key_range(&self) -> &Range<Key> {
        match self {
            Self::Image(name) => &name.key_range,
            Self::Delta(name) => &name.key_range,
        }
    }

    /// The LSN range, `lsn..lsn+1` for images.
    pub fn lsn_range(&self) -> Range<Lsn> {
        match self {
            Self::Image(name) => name.lsn..name.lsn + 1,
            Self::Delta(name) => name.lsn_range.clone(),
        }
    }

    pub fn is_delta(&self) -> bool {
        matches!(self, Self::Delta(_))
    }

    /// Whether the layer holds data past `disk_consistent_lsn`, which a crash may
    /// have left behind without a matching index entry.
    pub(crate) fn is_in_future(&self, disk_consistent_lsn: Lsn) -> bool {
        match self {
            Self::Image(name) => name.lsn > disk_consistent_lsn,
            Self::Delta(name) => name.lsn_range.end > disk_consistent_lsn + 1,
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Delta(_) => "delta",
            Self::Image(_) => "image",
        }
    }
}

impl fmt::Display for LayerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image(fname) => write!(f, "{fname}"),
            Self::Delta(fname) => write!(f, "{fname}"),
        }
    }
}

impl From<ImageLayerName> for LayerName {
    fn from(fname: ImageLayerName) -> Self {
        Self::Image(fname)
    }
}

impl From<DeltaLayerName> for LayerName {
    fn from(fname: DeltaLayerName) -> Self {
        Self::Delta(fname)
    }
}

impl FromStr for LayerName {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        // a delta name has a dash in its LSN part, which no image name has
        let delta = DeltaLayerName::parse_str(value);
        let image = ImageLayerName::parse_str(value);
        match (delta, image) {
            (Some(delta), None) => Ok(Self::Delta(delta)),
            (None, Some(image)) => Ok(Self::Image(image)),
            _ => Err(format!(
                "neither delta nor image layer file name: {value:?}"
            )),
        }
    }
}

impl serde::Serialize for LayerName {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for LayerName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn image_layer_name() {
        let name = "000000000000000000000000000000000001-000000000000000000000000000000000100__00000000016B59D8";
        let parsed = LayerName::from_str(name).unwrap();
        let expected = LayerName::Image(ImageLayerName {
            key_range: Key::from_hex("000000000000000000000000000000000001").unwrap()
                ..Key::from_hex("000000000000000000000000000000000100").unwrap(),
            lsn: Lsn::from_hex("00000000016B59D8").unwrap(),
        });
        assert_eq!(parsed, expected);
        assert_eq!(parsed.to_string(), name);
        assert!(!parsed.is_delta());
        assert_eq!(parsed.lsn_range(), Lsn(0x016B59D8)..Lsn(0x016B59D9));
    }

    #[test]
    fn delta_layer_name() {
        let name = "000000000000000000000000000000000000-FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF__00000000016B59D8-00000000016B5A51";
        let parsed = LayerName::from_str(name).unwrap();
        assert!(parsed.is_delta());
        assert_eq!(parsed.key_range(), &(Key::MIN..Key::MAX));
        assert_eq!(parsed.lsn_range(), Lsn(0x016B59D8)..Lsn(0x016B5A51));
        assert_eq!(parsed.to_string(), name);
        assert_eq!(parsed.kind(), "delta");
    }

    #[test]
    fn invalid_names() {
        for name in [
            "",
            "foo",
            "000000000000000000000000000000000001-000000000000000000000000000000000100",
            // empty key range
            "000000000000000000000000000000000100-000000000000000000000000000000000100__00000000016B59D8",
            // empty lsn range
            "000000000000000000000000000000000000-FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF__00000000016B59D8-00000000016B59D8",
            "000000000000000000000000000000000001-000000000000000000000000000000000100__16B59D8",
        ] {
            assert!(LayerName::from_str(name).is_err(), "{name:?} should not parse");
        }
    }

    #[test]
    fn serde_as_string() {
        let name = LayerName::Image(ImageLayerName {
            key_range: Key::user(1, 0)..Key::user(1, 100),
            lsn: Lsn(0x40),
        });
        let json = serde_json::to_string(&name).unwrap();
        assert_eq!(json, format!("\"{name}\""));
        let back: LayerName = serde_json::from_str(&json).unwrap();
        assert_eq!(back, name);
    }

    #[test]
    fn in_future() {
        let name = LayerName::from_str("000000000000000000000000000000000000-FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF__0000000000000010-0000000000000020").unwrap();
        assert!(!name.is_in_future(Lsn(0x1F)));
        assert!(name.is_in_future(Lsn(0x1E)));
    }
}
