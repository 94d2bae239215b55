//! Group membership edges.

use super::EntityOddrn;

/// One group→member edge. Entities can belong to group entities, which can
/// themselves belong to other groups; the edge set forms a graph over
/// entity identifiers that is expected to be acyclic but is not enforced
/// to be (traversal must terminate regardless).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GroupRelation {
    pub group_oddrn: EntityOddrn,
    pub member_oddrn: EntityOddrn,
}

impl GroupRelation {
    pub fn new(group: impl Into<EntityOddrn>, member: impl Into<EntityOddrn>) -> Self {
        Self {
            group_oddrn: group.into(),
            member_oddrn: member.into(),
        }
    }

    /// A relation of an entity to itself carries no information.
    pub fn is_self_loop(&self) -> bool {
        self.group_oddrn == self.member_oddrn
    }

    /// Fan a single group out over many members, dropping self-loops.
    pub fn fan_out(group: &EntityOddrn, members: &[EntityOddrn]) -> Vec<GroupRelation> {
        members
            .iter()
            .filter(|m| *m != group)
            .map(|m| GroupRelation {
                group_oddrn: group.clone(),
                member_oddrn: m.clone(),
            })
            .collect()
    }
}

/// One row of a paginated group membership listing: either a direct member
/// of the listed group (`is_upper_group == false`) or a group that directly
/// contains the listed group (`is_upper_group == true`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupMemberItem {
    pub oddrn: EntityOddrn,
    pub is_upper_group: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fan_out_drops_self_loops() {
        let group = EntityOddrn::from("//g/1");
        let members = vec![
            EntityOddrn::from("//e/1"),
            EntityOddrn::from("//g/1"),
            EntityOddrn::from("//e/2"),
        ];
        let relations = GroupRelation::fan_out(&group, &members);
        assert_eq!(relations.len(), 2);
        assert!(relations.iter().all(|r| !r.is_self_loop()));
        assert!(relations.iter().all(|r| r.group_oddrn == group));
    }
}
