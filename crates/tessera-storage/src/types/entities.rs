//! Entity identity records.
//!
//! Entity rows are owned by the external catalog store; this subsystem only
//! reads them (identifier resolution, name search, before-state lookups).
//! The seed types below exist so backends and tests can populate a minimal
//! entity table without depending on the full ingestion pipeline.

use super::{EntityId, EntityOddrn};

/// Entity identity row as resolved from the backing store.
#[derive(Clone, Debug)]
pub struct EntityRecord {
    pub id: EntityId,
    pub oddrn: EntityOddrn,
    pub internal_name: Option<String>,
    pub external_name: Option<String>,
    /// Created by hand in the catalog UI rather than discovered by ingestion.
    pub manually_created: bool,
    pub data_source_id: Option<i64>,
    pub namespace_id: Option<i64>,
}

/// Seed data for one entity row.
#[derive(Clone, Debug)]
pub struct NewEntity {
    pub oddrn: EntityOddrn,
    pub internal_name: Option<String>,
    pub external_name: Option<String>,
    pub description: Option<String>,
    pub manually_created: bool,
    pub data_source_id: Option<i64>,
    pub namespace_id: Option<i64>,
}

impl NewEntity {
    pub fn discovered(oddrn: impl Into<EntityOddrn>) -> Self {
        Self {
            oddrn: oddrn.into(),
            internal_name: None,
            external_name: None,
            description: None,
            manually_created: false,
            data_source_id: None,
            namespace_id: None,
        }
    }

    pub fn manually_created(oddrn: impl Into<EntityOddrn>) -> Self {
        Self {
            manually_created: true,
            ..Self::discovered(oddrn)
        }
    }

    pub fn internal_name(mut self, name: impl Into<String>) -> Self {
        self.internal_name = Some(name.into());
        self
    }

    pub fn external_name(mut self, name: impl Into<String>) -> Self {
        self.external_name = Some(name.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn data_source_id(mut self, id: i64) -> Self {
        self.data_source_id = Some(id);
        self
    }

    pub fn namespace_id(mut self, id: i64) -> Self {
        self.namespace_id = Some(id);
        self
    }
}
