//! Key identifiers and the per-session key status table.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// 128-bit content key identifier.
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct KeyId([u8; 16]);

impl KeyId {
    /// Create a key id from raw bytes, which must be exactly 16 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; 16] = bytes.try_into().map_err(|_| {
            Error::MalformedSample(format!(
                "key id must be 16 bytes long, got {} bytes",
                bytes.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 16]
    }

    pub fn uuid(&self) -> String {
        let value = hex::encode(self.0);
        format!(
            "{}-{}-{}-{}-{}",
            &value[..8],
            &value[8..12],
            &value[12..16],
            &value[16..20],
            &value[20..]
        )
    }
}

impl From<[u8; 16]> for KeyId {
    fn from(value: [u8; 16]) -> Self {
        Self(value)
    }
}

impl AsRef<[u8]> for KeyId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl FromStr for KeyId {
    type Err = Error;

    /// Parse 32 hex characters, UUID dashes are ignored.
    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim().replace('-', ""))?;
        Self::from_slice(&bytes)
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({})", hex::encode(self.0))
    }
}

impl Serialize for KeyId {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for KeyId {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

/// Status of a single key as reported by the backend.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyStatus {
    Usable,
    Expired,
    OutputRestricted,
    InternalError,
    Unusable,
    Released,
    /// Known key id the backend has not reported on yet.
    StatusPending,
}

impl KeyStatus {
    pub fn is_usable(self) -> bool {
        self == Self::Usable
    }
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Usable => "usable",
            Self::Expired => "expired",
            Self::OutputRestricted => "output-restricted",
            Self::InternalError => "internal-error",
            Self::Unusable => "unusable",
            Self::Released => "released",
            Self::StatusPending => "status-pending",
        })
    }
}

/// Ordered set of key ids with their status. A key id appears at most once.
#[derive(Clone, Debug, Default)]
pub struct KeyTable {
    keys: Vec<(KeyId, KeyStatus)>,
}

impl KeyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a key or update the status of an existing one.
    /// Returns true if the key id was not present before.
    pub fn upsert(&mut self, key_id: KeyId, status: KeyStatus) -> bool {
        match self.keys.iter_mut().find(|(id, _)| *id == key_id) {
            Some((_, old)) => {
                *old = status;
                false
            }
            None => {
                self.keys.push((key_id, status));
                true
            }
        }
    }

    /// Swap the whole table, dropping duplicate key ids (last status wins).
    pub fn replace_all<I: IntoIterator<Item = (KeyId, KeyStatus)>>(&mut self, keys: I) {
        let mut table = Self::new();
        for (key_id, status) in keys {
            table.upsert(key_id, status);
        }
        *self = table;
    }

    pub fn status(&self, key_id: &KeyId) -> Option<KeyStatus> {
        self.keys
            .iter()
            .find(|(id, _)| id == key_id)
            .map(|(_, status)| *status)
    }

    pub fn contains(&self, key_id: &KeyId) -> bool {
        self.status(key_id).is_some()
    }

    pub fn has_usable(&self) -> bool {
        self.keys.iter().any(|(_, status)| status.is_usable())
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(KeyId, KeyStatus)> {
        self.keys.iter()
    }

    pub fn to_vec(&self) -> Vec<(KeyId, KeyStatus)> {
        self.keys.clone()
    }
}
