//! Strongly-typed identifiers (avoid mixing strings/row ids arbitrarily).

use serde::{Deserialize, Serialize};

/// Stable, globally unique string identifier of one catalog object
/// (an "oddrn"). The catalog owns entity identity; this subsystem only
/// stores these strings and never interprets their structure.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityOddrn(pub String);

impl EntityOddrn {
    pub fn new(oddrn: impl Into<String>) -> Self {
        Self(oddrn.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntityOddrn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EntityOddrn {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Numeric key of an entity row in the backing catalog store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId(pub i64);

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Owner identifier (an owner is a person or team the catalog associates
/// with entities; owner records themselves live outside this subsystem).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId(pub i64);

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Dataset field row identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldId(pub i64);

impl std::fmt::Display for FieldId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
