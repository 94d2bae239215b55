//! Recursive graph queries over group→member edges.
//!
//! The engine performs its own level-by-level traversal with an explicit
//! visited set instead of relying on storage-side recursion, so the
//! semantics (deduplication, cycle termination) hold for any
//! [`RelationStore`] backend.

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use tessera_storage::{
    EntityId, EntityOddrn, EntityStore, GroupMemberItem, RelationStore, StoreError,
};

#[derive(Debug, Error)]
pub enum HierarchyError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One page of a group's membership listing, plus the independent totals
/// of the two logical buckets (direct members, containing groups).
#[derive(Clone, Debug)]
pub struct MemberPage {
    pub items: Vec<GroupMemberItem>,
    pub total_members: u64,
    pub total_upper_groups: u64,
}

/// Recursive traversal and paginated listing over the relation store's
/// edge set.
pub struct HierarchyEngine {
    relations: Arc<dyn RelationStore>,
    entities: Arc<dyn EntityStore>,
}

impl HierarchyEngine {
    pub fn new(relations: Arc<dyn RelationStore>, entities: Arc<dyn EntityStore>) -> Self {
        Self {
            relations,
            entities,
        }
    }

    /// Transitive closure of membership starting at `group`: every entity
    /// reachable by following group→member edges, deduplicated. Terminates
    /// on cyclic edge sets; a node is expanded at most once.
    pub async fn descendants_of(
        &self,
        group: EntityId,
    ) -> Result<HashSet<EntityOddrn>, HierarchyError> {
        let root = self.entities.oddrn_by_id(group).await?;

        let mut result: HashSet<EntityOddrn> = HashSet::new();
        let mut expanded: HashSet<EntityOddrn> = HashSet::new();
        expanded.insert(root.clone());
        let mut frontier = vec![root];

        while !frontier.is_empty() {
            let edges = self.relations.members_of(&frontier).await?;
            let mut next = Vec::new();
            for edge in edges {
                let member = edge.member_oddrn;
                if result.insert(member.clone()) && expanded.insert(member.clone()) {
                    next.push(member);
                }
            }
            frontier = next;
        }

        debug!(group = %group, descendants = result.len(), "resolved descendant closure");
        Ok(result)
    }

    /// Direct (non-recursive) membership existence test.
    pub async fn has_members(&self, group: EntityId) -> Result<bool, HierarchyError> {
        let oddrn = self.entities.oddrn_by_id(group).await?;
        Ok(self.relations.has_members(&oddrn).await?)
    }

    /// One level of a group's surroundings: direct members (tagged
    /// `is_upper_group = false`) followed by the groups that directly
    /// contain `group` (tagged `true`). The buckets are concatenated, not
    /// interleaved, and paginated with 1-based page numbers across the
    /// concatenation. `prefix` filters both buckets case-insensitively on
    /// entity names.
    pub async fn page_members(
        &self,
        group: EntityId,
        page: u32,
        size: u32,
        prefix: Option<&str>,
    ) -> Result<MemberPage, HierarchyError> {
        if page < 1 || size < 1 {
            return Err(HierarchyError::InvalidRequest(
                "page and size must be positive".into(),
            ));
        }
        let oddrn = self.entities.oddrn_by_id(group).await?;

        let total_members = self.relations.count_members(&oddrn, prefix).await?;
        let total_upper_groups = self.relations.count_upper_groups(&oddrn, prefix).await?;

        let offset = u64::from(page - 1) * u64::from(size);
        let mut items = Vec::new();

        // Slice of the first bucket, if the page starts inside it.
        if offset < total_members {
            let members = self
                .relations
                .member_page(&oddrn, prefix, size, offset)
                .await?;
            items.extend(members.into_iter().map(|oddrn| GroupMemberItem {
                oddrn,
                is_upper_group: false,
            }));
        }

        // Fill the remainder from the second bucket.
        let remaining = (size as usize).saturating_sub(items.len());
        if remaining > 0 {
            let upper_offset = offset.saturating_sub(total_members);
            let upper = self
                .relations
                .upper_group_page(&oddrn, prefix, remaining as u32, upper_offset)
                .await?;
            items.extend(upper.into_iter().map(|oddrn| GroupMemberItem {
                oddrn,
                is_upper_group: true,
            }));
        }

        Ok(MemberPage {
            items,
            total_members,
            total_upper_groups,
        })
    }

    /// Count of direct members matching `prefix`.
    pub async fn count_members(
        &self,
        group: EntityId,
        prefix: Option<&str>,
    ) -> Result<u64, HierarchyError> {
        let oddrn = self.entities.oddrn_by_id(group).await?;
        Ok(self.relations.count_members(&oddrn, prefix).await?)
    }

    /// Count of groups directly containing `group`, matching `prefix`.
    pub async fn count_upper_groups(
        &self,
        group: EntityId,
        prefix: Option<&str>,
    ) -> Result<u64, HierarchyError> {
        let oddrn = self.entities.oddrn_by_id(group).await?;
        Ok(self.relations.count_upper_groups(&oddrn, prefix).await?)
    }
}
