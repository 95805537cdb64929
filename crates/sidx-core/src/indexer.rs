use crate::state::{StateErrors, StatesById};
use crate::subscription::Subscription;
use async_trait::async_trait;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// Version of an indexer's derivation logic. Zero means "never indexed".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(pub u32);

impl Version {
    pub const ZERO: Self = Self(0);

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Narrows a stored integer, rejecting values outside the u32 domain.
    pub fn from_stored(value: i64) -> Option<Self> {
        u32::try_from(value).ok().map(Self)
    }

    pub fn as_stored(self) -> i64 {
        i64::from(self.0)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Version {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl Serialize for Version {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u32(self.0)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct VersionVisitor;

        impl<'de> Visitor<'de> for VersionVisitor {
            type Value = Version;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("an indexer version as integer or string")
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                u32::try_from(value)
                    .map(Version)
                    .map_err(|_| E::custom(format!("indexer version out of range: {value}")))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if value < 0 {
                    return Err(E::custom(format!(
                        "indexer version cannot be negative: {value}"
                    )));
                }
                self.visit_u64(value as u64)
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                let cleaned = value.trim().trim_start_matches('v');
                cleaned.parse::<u32>().map(Version).map_err(|err| {
                    E::custom(format!("invalid indexer version '{value}': {err}"))
                })
            }
        }

        deserializer.deserialize_any(VersionVisitor)
    }
}

/// Failure of a whole remote indexer call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct IndexerError {
    pub message: String,
}

impl IndexerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Capability contract of a derived-state indexer.
///
/// Implementations are usually thin clients of a remote service. `index` must
/// be idempotent: the same states can arrive from the online path and from a
/// reindex replay, possibly more than once. `prepare_reindex` and
/// `complete_reindex` must tolerate retries and concurrent re-drives of the
/// same version pair.
#[async_trait]
pub trait Indexer: Send + Sync {
    /// Globally unique and stable across deploys.
    fn id(&self) -> &str;

    /// Positive and non-decreasing across releases.
    fn version(&self) -> Version;

    fn subscriptions(&self) -> Vec<Subscription>;

    fn types(&self) -> BTreeSet<String> {
        self.subscriptions()
            .into_iter()
            .map(|sub| sub.state_type)
            .collect()
    }

    async fn prepare_reindex(
        &self,
        from: Version,
        to: Version,
        is_first: bool,
    ) -> Result<(), IndexerError>;

    async fn complete_reindex(&self, from: Version, to: Version) -> Result<(), IndexerError>;

    async fn index(
        &self,
        network_id: &str,
        states: &StatesById,
    ) -> Result<StateErrors, IndexerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_accepts_integer_and_string_forms() {
        let from_int: Version = serde_json::from_str("7").expect("int");
        let from_str: Version = serde_json::from_str("\"v12\"").expect("str");
        assert_eq!(from_int, Version(7));
        assert_eq!(from_str, Version(12));
        assert!(serde_json::from_str::<Version>("-1").is_err());
        assert!(serde_json::from_str::<Version>("4294967296").is_err());
        assert_eq!(serde_json::to_string(&Version(3)).expect("json"), "3");
    }

    #[test]
    fn stored_versions_must_fit_u32() {
        assert_eq!(Version::from_stored(0), Some(Version::ZERO));
        assert_eq!(Version::from_stored(i64::from(u32::MAX)), Some(Version(u32::MAX)));
        assert_eq!(Version::from_stored(i64::from(u32::MAX) + 1), None);
        assert_eq!(Version::from_stored(-3), None);
    }
}
