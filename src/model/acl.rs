//! Rights bitmasks and access control entries.
//!
//! Internally rights are one `u32`: capability *n* lives at bit `n - 1` and
//! full control sets every bit. Older documents store rights as base64 of a
//! byte array using the same bit numbering; those are accepted when reading
//! and never written.

use std::fmt;
use std::ops::BitOr;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A single capability an Ace can grant or deny.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Right {
    Create = 1,
    Read = 2,
    Update = 3,
    Delete = 4,
    Invoke = 5,
}

impl Right {
    pub const fn bit(self) -> u32 {
        1 << (self as u32 - 1)
    }
}

impl fmt::Display for Right {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Right::Create => "create",
            Right::Read => "read",
            Right::Update => "update",
            Right::Delete => "delete",
            Right::Invoke => "invoke",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rights(u32);

impl Rights {
    pub const NONE: Rights = Rights(0);
    pub const FULL_CONTROL: Rights = Rights(u32::MAX);

    pub const fn from_bits(bits: u32) -> Self {
        Rights(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub fn covers(self, right: Right) -> bool {
        self.0 & right.bit() != 0
    }

    pub fn is_full_control(self) -> bool {
        self.0 == u32::MAX
    }

    /// Decode the legacy base64 byte-array encoding.
    pub fn from_legacy(encoded: &str) -> Option<Self> {
        let bytes = STANDARD.decode(encoded).ok()?;
        if bytes.is_empty() {
            return Some(Rights::NONE);
        }
        if bytes.iter().all(|b| *b == 0xff) {
            return Some(Rights::FULL_CONTROL);
        }
        let mut word = [0u8; 4];
        for (slot, byte) in word.iter_mut().zip(bytes.iter()) {
            *slot = *byte;
        }
        Some(Rights(u32::from_le_bytes(word)))
    }
}

impl From<Right> for Rights {
    fn from(right: Right) -> Self {
        Rights(right.bit())
    }
}

impl BitOr for Rights {
    type Output = Rights;
    fn bitor(self, rhs: Rights) -> Rights {
        Rights(self.0 | rhs.0)
    }
}

impl BitOr<Right> for Rights {
    type Output = Rights;
    fn bitor(self, rhs: Right) -> Rights {
        Rights(self.0 | rhs.bit())
    }
}

impl Serialize for Rights {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.0)
    }
}

impl<'de> Deserialize<'de> for Rights {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RightsVisitor;

        impl Visitor<'_> for RightsVisitor {
            type Value = Rights;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an integer rights mask or a base64 legacy rights string")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Rights, E> {
                if v > u64::from(u32::MAX) {
                    return Ok(Rights::FULL_CONTROL);
                }
                Ok(Rights(v as u32))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Rights, E> {
                // -1 is the historical spelling of full control.
                if v < 0 {
                    return Ok(Rights::FULL_CONTROL);
                }
                self.visit_u64(v as u64)
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Rights, E> {
                Rights::from_legacy(v)
                    .ok_or_else(|| E::invalid_value(de::Unexpected::Str(v), &self))
            }
        }

        deserializer.deserialize_any(RightsVisitor)
    }
}

/// Access control entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ace {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub rights: Rights,
    #[serde(default)]
    pub deny: bool,
}

impl Ace {
    pub fn allow(id: impl Into<String>, name: impl Into<String>, rights: Rights) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            rights,
            deny: false,
        }
    }

    pub fn deny(id: impl Into<String>, name: impl Into<String>, rights: Rights) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            rights,
            deny: true,
        }
    }
}

/// Grant `rights` to a principal, merging into an existing allow entry.
pub fn add_right(acl: &mut Vec<Ace>, id: &str, name: &str, rights: Rights) {
    match acl.iter_mut().find(|ace| ace.id == id && !ace.deny) {
        Some(ace) => ace.rights = ace.rights | rights,
        None => acl.push(Ace::allow(id, name, rights)),
    }
}

/// Read the `_acl` of a raw document, skipping entries that do not parse.
pub fn acl_of(doc: &serde_json::Value) -> Vec<Ace> {
    doc.get("_acl")
        .and_then(|v| v.as_array())
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| serde_json::from_value(entry.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// Rewrite a document's `_acl` in canonical form (integer rights).
pub fn normalize_acl(doc: &mut serde_json::Value) {
    let acl = acl_of(doc);
    if let Some(obj) = doc.as_object_mut() {
        if let Ok(value) = serde_json::to_value(acl) {
            obj.insert("_acl".to_string(), value);
        }
    }
}
