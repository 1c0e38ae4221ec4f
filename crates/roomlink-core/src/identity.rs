use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use unicode_normalization::UnicodeNormalization;

/// Stable identity of a room member.
///
/// Servers send user ids either as JSON numbers or strings, sometimes padded
/// with whitespace. Equality, hashing and ordering use a key that is trimmed,
/// NFKC-normalized and lowercased, so all representations of the same member
/// compare equal. Serialization writes the id back exactly as it was received.
#[derive(Debug, Clone)]
pub struct ParticipantId {
    key: String,
    wire: WireId,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
enum WireId {
    Text(String),
    Unsigned(u64),
    Signed(i64),
}

fn comparison_key(raw: &str) -> String {
    let normalized: String = raw.trim().nfkc().collect();
    normalized.to_lowercase()
}

impl ParticipantId {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        Self {
            key: comparison_key(&raw),
            wire: WireId::Text(raw),
        }
    }

    /// The normalized comparison key.
    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// The id as the server knows it.
    pub fn raw(&self) -> String {
        match &self.wire {
            WireId::Text(s) => s.clone(),
            WireId::Unsigned(n) => n.to_string(),
            WireId::Signed(n) => n.to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.key.is_empty()
    }
}

impl PartialEq for ParticipantId {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for ParticipantId {}

impl Hash for ParticipantId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl PartialOrd for ParticipantId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ParticipantId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.wire {
            WireId::Text(s) => f.write_str(s.trim()),
            WireId::Unsigned(n) => write!(f, "{n}"),
            WireId::Signed(n) => write!(f, "{n}"),
        }
    }
}

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ParticipantId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<u64> for ParticipantId {
    fn from(n: u64) -> Self {
        Self {
            key: n.to_string(),
            wire: WireId::Unsigned(n),
        }
    }
}

impl From<i64> for ParticipantId {
    fn from(n: i64) -> Self {
        Self {
            key: n.to_string(),
            wire: WireId::Signed(n),
        }
    }
}

impl Serialize for ParticipantId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match &self.wire {
            WireId::Text(s) => serializer.serialize_str(s),
            WireId::Unsigned(n) => serializer.serialize_u64(*n),
            WireId::Signed(n) => serializer.serialize_i64(*n),
        }
    }
}

impl<'de> Deserialize<'de> for ParticipantId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match WireId::deserialize(deserializer)? {
            WireId::Text(s) => ParticipantId::new(s),
            WireId::Unsigned(n) => ParticipantId::from(n),
            WireId::Signed(n) => ParticipantId::from(n),
        })
    }
}
