use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

/// Key used in the timeline key-value store.
///
/// The engine treats this as an opaque, totally ordered 18-byte value. `field1`
/// selects a key space: `0x00` holds user data, `0x01` holds per-timeline
/// bookkeeping such as [`COMMIT_TIMESTAMP_KEY`].
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Key {
    pub field1: u8,
    pub field2: u32,
    pub field3: u32,
    pub field4: u32,
    pub field5: u8,
    pub field6: u32,
}

pub const KEY_SIZE: usize = 18;

/// Holds the wall-clock timestamp of the latest commit record at or below the read LSN.
pub const COMMIT_TIMESTAMP_KEY: Key = Key {
    field1: 0x01,
    field2: 0,
    field3: 0,
    field4: 0,
    field5: 0,
    field6: 1,
};

impl Key {
    pub const MIN: Key = Key {
        field1: u8::MIN,
        field2: u32::MIN,
        field3: u32::MIN,
        field4: u32::MIN,
        field5: u8::MIN,
        field6: u32::MIN,
    };
    pub const MAX: Key = Key {
        field1: u8::MAX,
        field2: u32::MAX,
        field3: u32::MAX,
        field4: u32::MAX,
        field5: u8::MAX,
        field6: u32::MAX,
    };

    /// A user data key, addressed by a relation-like id and a block number.
    pub const fn user(rel: u32, blkno: u32) -> Key {
        Key {
            field1: 0x00,
            field2: 0,
            field3: 0,
            field4: rel,
            field5: 0,
            field6: blkno,
        }
    }

    pub fn next(&self) -> Key {
        self.add(1)
    }

    pub fn add(&self, x: u32) -> Key {
        let mut key = *self;

        let r = key.field6.overflowing_add(x);
        key.field6 = r.0;
        if r.1 {
            let r = key.field5.overflowing_add(1);
            key.field5 = r.0;
            if r.1 {
                let r = key.field4.overflowing_add(1);
                key.field4 = r.0;
                if r.1 {
                    let r = key.field3.overflowing_add(1);
                    key.field3 = r.0;
                    if r.1 {
                        let r = key.field2.overflowing_add(1);
                        key.field2 = r.0;
                        if r.1 {
                            let r = key.field1.overflowing_add(1);
                            key.field1 = r.0;
                            assert!(!r.1);
                        }
                    }
                }
            }
        }
        key
    }

    pub fn from_slice(b: &[u8; KEY_SIZE]) -> Self {
        let be_u32 = |at: usize| u32::from_be_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]]);
        Key {
            field1: b[0],
            field2: be_u32(1),
            field3: be_u32(5),
            field4: be_u32(9),
            field5: b[13],
            field6: be_u32(14),
        }
    }

    pub fn write_to_byte_slice(&self, buf: &mut [u8; KEY_SIZE]) {
        buf[0] = self.field1;
        buf[1..5].copy_from_slice(&self.field2.to_be_bytes());
        buf[5..9].copy_from_slice(&self.field3.to_be_bytes());
        buf[9..13].copy_from_slice(&self.field4.to_be_bytes());
        buf[13] = self.field5;
        buf[14..18].copy_from_slice(&self.field6.to_be_bytes());
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != 36 {
            bail!("parse error");
        }
        Ok(Key {
            field1: u8::from_str_radix(&s[0..2], 16)?,
            field2: u32::from_str_radix(&s[2..10], 16)?,
            field3: u32::from_str_radix(&s[10..18], 16)?,
            field4: u32::from_str_radix(&s[18..26], 16)?,
            field5: u8::from_str_radix(&s[26..28], 16)?,
            field6: u32::from_str_radix(&s[28..36], 16)?,
        })
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}{:08X}{:08X}{:08X}{:02X}{:08X}",
            self.field1, self.field2, self.field3, self.field4, self.field5, self.field6
        )
    }
}

impl std::str::FromStr for Key {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

/// Whether two key ranges share at least one key.
pub fn ranges_overlap(a: &Range<Key>, b: &Range<Key>) -> bool {
    a.start < b.end && b.start < a.end
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    use rand::Rng;
    use rand::SeedableRng;

    #[test]
    fn display_fromstr_bijection() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);

        let key = Key {
            field1: rng.gen(),
            field2: rng.gen(),
            field3: rng.gen(),
            field4: rng.gen(),
            field5: rng.gen(),
            field6: rng.gen(),
        };

        assert_eq!(key, Key::from_str(&format!("{key}")).unwrap());
    }

    #[test]
    fn byte_slice_roundtrip_preserves_order() {
        let a = Key::user(1, 7);
        let b = Key::user(1, u32::MAX).next();
        assert!(a < b);

        let mut buf_a = [0u8; KEY_SIZE];
        let mut buf_b = [0u8; KEY_SIZE];
        a.write_to_byte_slice(&mut buf_a);
        b.write_to_byte_slice(&mut buf_b);
        assert!(buf_a < buf_b);
        assert_eq!(Key::from_slice(&buf_a), a);
        assert_eq!(Key::from_slice(&buf_b), b);
    }

    #[test]
    fn user_keys_sort_below_bookkeeping() {
        assert!(Key::user(u32::MAX, u32::MAX) < COMMIT_TIMESTAMP_KEY);
        assert!(ranges_overlap(
            &(Key::MIN..Key::MAX),
            &(COMMIT_TIMESTAMP_KEY..COMMIT_TIMESTAMP_KEY.next())
        ));
        assert!(!ranges_overlap(
            &(Key::user(0, 0)..Key::user(0, 10)),
            &(Key::user(0, 10)..Key::user(0, 20))
        ));
    }
}
