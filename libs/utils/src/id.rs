use std::{fmt, str::FromStr};

use hex::FromHex;
use rand::Rng;
use serde::{
    de::{self, Visitor},
    Deserialize, Serialize,
};

/// A 128-bit random ID, the common base of tenant and timeline ids.
///
/// Serializes as a hex string for human readable formats (json) and as a
/// byte array otherwise.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct Id([u8; 16]);

impl Serialize for Id {
    fn serialize<S>(&self, ser: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        if ser.is_human_readable() {
            ser.collect_str(self)
        } else {
            self.0.serialize(ser)
        }
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D>(de: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct IdVisitor;

        impl Visitor<'_> for IdVisitor {
            type Value = Id;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a hexadecimal representation of a 128-bit random id")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Id::from_hex(v).map_err(de::Error::custom)
            }

            fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                let arr: [u8; 16] = v
                    .try_into()
                    .map_err(|_| de::Error::invalid_length(v.len(), &self))?;
                Ok(Id(arr))
            }
        }

        if de.is_human_readable() {
            de.deserialize_str(IdVisitor)
        } else {
            <[u8; 16]>::deserialize(de).map(Id)
        }
    }
}

impl Id {
    fn generate() -> Self {
        let mut buf = [0u8; 16];
        rand::thread_rng().fill(&mut buf);
        Id(buf)
    }
}

impl FromHex for Id {
    type Error = hex::FromHexError;

    fn from_hex<T: AsRef<[u8]>>(hex: T) -> Result<Self, Self::Error> {
        let mut buf: [u8; 16] = [0u8; 16];
        hex::decode_to_slice(hex, &mut buf)?;
        Ok(Id(buf))
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

macro_rules! id_newtype {
    ($t:ident) => {
        impl $t {
            pub fn generate() -> Self {
                $t(Id::generate())
            }

            pub const fn from_array(b: [u8; 16]) -> Self {
                $t(Id(b))
            }

            pub fn as_arr(&self) -> [u8; 16] {
                self.0 .0
            }
        }

        impl FromStr for $t {
            type Err = hex::FromHexError;

            fn from_str(s: &str) -> Result<$t, Self::Err> {
                Id::from_hex(s).map($t)
            }
        }

        impl From<[u8; 16]> for $t {
            fn from(b: [u8; 16]) -> Self {
                $t(Id(b))
            }
        }

        impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl fmt::Debug for $t {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

/// Identifies a timeline: a branch of a tenant's history.
///
/// Timelines of one tenant form a tree; the tree is recorded through
/// ancestor ids, never through references between timeline objects.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct TimelineId(Id);

id_newtype!(TimelineId);

/// Identifies a tenant, the unit of isolation owning a set of timelines.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct TenantId(Id);

id_newtype!(TenantId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_hex_roundtrip() {
        let id = TimelineId::from_array([
            0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66,
            0x77, 0x88,
        ]);
        assert_eq!(id.to_string(), "11223344556677881122334455667788");
        assert_eq!(format!("{id:?}"), id.to_string());
        assert_eq!(
            "11223344556677881122334455667788"
                .parse::<TimelineId>()
                .unwrap(),
            id
        );
        "1122".parse::<TimelineId>().unwrap_err();
    }

    #[test]
    fn id_json_is_hex_string() {
        let id = TenantId::generate();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let back: TenantId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
