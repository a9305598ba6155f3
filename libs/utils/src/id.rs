use std::{fmt, str::FromStr};

use hex::FromHex;
use rand::Rng;
use serde::{
    de::{self, Visitor},
    Deserialize, Serialize,
};

#[derive(Debug, thiserror::Error)]
pub enum IdError {
    #[error("invalid id length {0}")]
    SliceParseError(usize),
}

/// A 128-bit random identifier.
///
/// Shown as 32 lowercase hex characters, and serialized the same way in human readable
/// formats. Binary formats get the raw 16 bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct Id([u8; 16]);

impl Id {
    fn generate() -> Self {
        let mut buf = [0u8; 16];
        rand::thread_rng().fill(&mut buf);
        Id(buf)
    }

    fn from_slice(src: &[u8]) -> Result<Id, IdError> {
        if src.len() != 16 {
            return Err(IdError::SliceParseError(src.len()));
        }
        let mut id_array = [0u8; 16];
        id_array.copy_from_slice(src);
        Ok(Id(id_array))
    }
}

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

        impl<'de> Visitor<'de> for IdVisitor {
            type Value = Id;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a 32 character hex string or a 16 byte array")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Id::from_str(v).map_err(de::Error::custom)
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: de::SeqAccess<'de>,
            {
                let mut buf = [0u8; 16];
                for (i, b) in buf.iter_mut().enumerate() {
                    *b = seq
                        .next_element()?
                        .ok_or_else(|| de::Error::invalid_length(i, &self))?;
                }
                Ok(Id(buf))
            }
        }

        if de.is_human_readable() {
            de.deserialize_str(IdVisitor)
        } else {
            de.deserialize_tuple(16, IdVisitor)
        }
    }
}

impl FromStr for Id {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Id, Self::Err> {
        Self::from_hex(s)
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

impl fmt::Debug for Id {
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

            pub fn from_slice(src: &[u8]) -> Result<$t, IdError> {
                Ok($t(Id::from_slice(src)?))
            }

            pub fn as_arr(&self) -> [u8; 16] {
                self.0 .0
            }
        }

        impl FromStr for $t {
            type Err = hex::FromHexError;

            fn from_str(s: &str) -> Result<$t, Self::Err> {
                let value = Id::from_str(s)?;
                Ok($t(value))
            }
        }

        impl From<[u8; 16]> for $t {
            fn from(b: [u8; 16]) -> Self {
                $t(Id(b))
            }
        }

        impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl fmt::Debug for $t {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

/// Identifies a timeline, i.e. one branch of a tenant's history.
///
/// Each timeline owns a directory under `tenants/<tenant_id>/timelines/` named after
/// its id.
#[derive(Clone, Copy, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimelineId(Id);

id_newtype!(TimelineId);

/// Identifies a tenant, the unit of isolation that owns a set of timelines.
#[derive(Clone, Copy, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(Id);

id_newtype!(TenantId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_hex_roundtrip() {
        let s = "ad50847381e248feaac9876cc71ae418";
        let id: TenantId = s.parse().unwrap();
        assert_eq!(id.to_string(), s);
        assert_eq!(id.as_arr()[0], 0xad);

        "ad50847381e248feaac9876cc71ae41".parse::<TenantId>().unwrap_err();
        "zz50847381e248feaac9876cc71ae418".parse::<TenantId>().unwrap_err();
        TimelineId::from_slice(&[1, 2, 3]).unwrap_err();
    }

    #[test]
    fn id_json_is_hex_string() {
        let id = TimelineId::from_array([0x11; 16]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"11111111111111111111111111111111\"");
        let back: TimelineId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn generated_ids_differ() {
        assert_ne!(TenantId::generate(), TenantId::generate());
    }
}
