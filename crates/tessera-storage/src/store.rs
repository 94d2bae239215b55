//! The backend traits that storage engines implement.

use std::collections::HashMap;

use crate::types::*;
use crate::StoreError;

/// Durable mapping of group→member edges.
///
/// All mutating operations are idempotent: duplicate inserts are silently
/// ignored and deletes of absent rows are no-ops. Each statement issued by
/// a backend is atomic; partial application is never visible to concurrent
/// readers.
#[cfg_attr(feature = "test-support", mockall::automock)]
#[async_trait::async_trait]
pub trait RelationStore: Send + Sync {
    /// Bulk-insert edges, ignoring duplicates and self-loops. Backends
    /// partition large inputs into bounded chunks; each chunk is one
    /// atomic statement. No-op on empty input.
    async fn create_relations(&self, relations: &[GroupRelation]) -> Result<(), StoreError>;

    /// Remove every edge where `entity` appears as group OR as member
    /// (used when the entity itself is deleted). Returns the removed edges
    /// so callers can react.
    async fn delete_all_for_entity(
        &self,
        entity: &EntityOddrn,
    ) -> Result<Vec<GroupRelation>, StoreError>;

    /// Remove every edge under `group` whose member is not in `keep`,
    /// returning the removed edges. Reconciles a group's membership to an
    /// authoritative snapshot in one step.
    async fn delete_except(
        &self,
        group: &EntityOddrn,
        keep: &[EntityOddrn],
    ) -> Result<Vec<GroupRelation>, StoreError>;

    /// Remove exactly one edge; returns it if it existed.
    async fn delete_pair(
        &self,
        group: &EntityOddrn,
        member: &EntityOddrn,
    ) -> Result<Option<GroupRelation>, StoreError>;

    /// Given a target edge set, delete any existing edge of a mentioned
    /// group whose (group, member) pair is not present in the target set.
    /// Groups not mentioned in `target` are left untouched.
    async fn reconcile(&self, target: &[GroupRelation]) -> Result<(), StoreError>;

    /// Direct membership existence check (an indexed EXISTS, not a scan).
    async fn has_members(&self, group: &EntityOddrn) -> Result<bool, StoreError>;

    /// Batch reverse lookup: the groups directly containing any of
    /// `members`, keyed by group. Short-circuits to an empty map on empty
    /// input without touching the backend.
    async fn parents_of(
        &self,
        members: &[EntityOddrn],
    ) -> Result<HashMap<EntityOddrn, Vec<EntityOddrn>>, StoreError>;

    /// All edges whose group is one of `groups` (adjacency fetch for
    /// level-by-level traversal). Short-circuits on empty input.
    async fn members_of(&self, groups: &[EntityOddrn]) -> Result<Vec<GroupRelation>, StoreError>;

    /// Edges placing `member` under groups that were manually created in
    /// the catalog (as opposed to discovered by ingestion).
    async fn manually_created_parents(
        &self,
        member: &EntityOddrn,
    ) -> Result<Vec<GroupRelation>, StoreError>;

    /// One page of direct members of `group`, ordered by the member's
    /// entity row id descending. `prefix` filters case-insensitively on
    /// the entity's internal or external name.
    async fn member_page(
        &self,
        group: &EntityOddrn,
        prefix: Option<&str>,
        limit: u32,
        offset: u64,
    ) -> Result<Vec<EntityOddrn>, StoreError>;

    /// One page of groups directly containing `group`, same ordering and
    /// filter semantics as [`member_page`](Self::member_page).
    async fn upper_group_page(
        &self,
        group: &EntityOddrn,
        prefix: Option<&str>,
        limit: u32,
        offset: u64,
    ) -> Result<Vec<EntityOddrn>, StoreError>;

    /// Count of direct members matching `prefix`.
    async fn count_members(
        &self,
        group: &EntityOddrn,
        prefix: Option<&str>,
    ) -> Result<u64, StoreError>;

    /// Count of containing groups matching `prefix`.
    async fn count_upper_groups(
        &self,
        group: &EntityOddrn,
        prefix: Option<&str>,
    ) -> Result<u64, StoreError>;
}

/// Entity identity resolution, backed by the external catalog store.
#[cfg_attr(feature = "test-support", mockall::automock)]
#[async_trait::async_trait]
pub trait EntityStore: Send + Sync {
    /// Resolve a numeric entity key to its stable string identifier.
    async fn oddrn_by_id(&self, id: EntityId) -> Result<EntityOddrn, StoreError>;

    /// Resolve a stable string identifier back to its numeric key.
    async fn id_by_oddrn(&self, oddrn: &EntityOddrn) -> Result<EntityId, StoreError>;

    /// Whether the entity was created by hand rather than discovered.
    async fn is_manually_created(&self, oddrn: &EntityOddrn) -> Result<bool, StoreError>;
}

/// Pre-mutation state lookups used by activity handlers to capture the
/// "before" side of a diff. Must be consulted before the underlying
/// mutation completes, since the previous values are lost afterwards.
#[cfg_attr(feature = "test-support", mockall::automock)]
#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    async fn entity_description(&self, id: EntityId) -> Result<Option<String>, StoreError>;

    /// Batch form of [`entity_description`](Self::entity_description);
    /// ids without a row are absent from the result map.
    async fn entity_descriptions(
        &self,
        ids: &[EntityId],
    ) -> Result<HashMap<EntityId, Option<String>>, StoreError>;

    async fn entity_tags(&self, id: EntityId) -> Result<Vec<String>, StoreError>;

    async fn entity_owners(&self, id: EntityId) -> Result<Vec<String>, StoreError>;

    async fn field_description(&self, field: FieldId) -> Result<Option<String>, StoreError>;

    async fn field_labels(&self, field: FieldId) -> Result<Vec<String>, StoreError>;

    /// The entity a dataset field belongs to.
    async fn field_entity_id(&self, field: FieldId) -> Result<EntityId, StoreError>;
}
