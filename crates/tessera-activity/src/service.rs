//! Activity orchestration: actor capture, handler dispatch, persistence,
//! and the filtered/paginated read side.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use tessera_storage::{EntityId, EntityOddrn, OwnerId};

use crate::{
    ActivityContext, ActivityCreateEvent, ActivityCursor, ActivityError, ActivityEventType,
    ActivityFilter, ActivityKind, ActivityLog, ActivityRecord, ActivityScope, HandlerParams,
    HandlerRegistry, LineageDirection, NewActivity,
};

/// The acting identity for one request, resolved once at the API boundary
/// and passed explicitly into every operation that needs it. A fully-empty
/// actor represents a system-initiated change, which is a valid state, not
/// an error.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Actor {
    pub username: Option<String>,
    /// The owner identity associated with the user, when one exists.
    /// Required only for `MyObjects` scoping.
    pub owner_id: Option<OwnerId>,
}

impl Actor {
    pub fn system() -> Self {
        Self::default()
    }

    pub fn user(username: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            owner_id: None,
        }
    }

    pub fn owner_id(mut self, owner_id: OwnerId) -> Self {
        self.owner_id = Some(owner_id);
        self
    }
}

/// Resolves the current acting identity. Consumed by the API layer to
/// build an [`Actor`] once per request.
#[cfg_attr(feature = "test-support", mockall::automock)]
#[async_trait::async_trait]
pub trait ActorProvider: Send + Sync {
    async fn current_user(&self) -> Result<Option<String>, ActivityError>;

    async fn current_owner(&self) -> Result<Option<OwnerId>, ActivityError>;
}

/// Build an [`Actor`] from a provider. Absence of a user or owner is not
/// an error; it yields a (partially) anonymous actor.
pub async fn resolve_actor(provider: &dyn ActorProvider) -> Result<Actor, ActivityError> {
    Ok(Actor {
        username: provider.current_user().await?,
        owner_id: provider.current_owner().await?,
    })
}

/// External lineage collaborator: the set of entities reachable from the
/// current context via data-flow edges in the given direction.
#[cfg_attr(feature = "test-support", mockall::automock)]
#[async_trait::async_trait]
pub trait LineageResolver: Send + Sync {
    async fn dependent_entity_oddrns(
        &self,
        direction: LineageDirection,
    ) -> Result<HashSet<EntityOddrn>, ActivityError>;
}

/// An activity listing/count request as it arrives from the API layer.
#[derive(Clone, Debug, Default)]
pub struct ActivityQuery {
    pub begin: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// Result-size cap; `None` means backend default.
    pub size: Option<u32>,
    pub data_source_id: Option<i64>,
    pub namespace_id: Option<i64>,
    pub tag_ids: Vec<i64>,
    pub owner_ids: Vec<OwnerId>,
    pub usernames: Vec<String>,
    pub event_type: Option<ActivityEventType>,
    pub kind: ActivityKind,
    pub cursor: Option<ActivityCursor>,
}

impl ActivityQuery {
    pub fn window(begin: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            begin: Some(begin),
            end: Some(end),
            ..Self::default()
        }
    }

    pub fn kind(mut self, kind: ActivityKind) -> Self {
        self.kind = kind;
        self
    }
}

/// The four aggregate counts served alongside activity listings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ActivityCounts {
    pub total: u64,
    pub my_objects: u64,
    pub downstream: u64,
    pub upstream: u64,
}

/// Orchestrates activity creation and querying: dispatches to the handler
/// matching the event type, stamps actor and creation time, persists via
/// the [`ActivityLog`], and consults the lineage collaborator for
/// upstream/downstream scoping.
pub struct ActivityService {
    log: Arc<dyn ActivityLog>,
    registry: HandlerRegistry,
    lineage: Arc<dyn LineageResolver>,
}

impl ActivityService {
    pub fn new(
        log: Arc<dyn ActivityLog>,
        registry: HandlerRegistry,
        lineage: Arc<dyn LineageResolver>,
    ) -> Self {
        Self {
            log,
            registry,
            lineage,
        }
    }

    // ───────────────────────────── Write side ─────────────────────────────

    /// Persist one event on behalf of `actor`.
    pub async fn create_event(
        &self,
        actor: &Actor,
        event: ActivityCreateEvent,
    ) -> Result<ActivityRecord, ActivityError> {
        let created_at = Utc::now();
        let record = self
            .log
            .append(build_activity(event, created_at, actor))
            .await?;
        Ok(record)
    }

    /// Persist a batch of events. Every record in one call shares the same
    /// creation timestamp so bulk-operation audit trails stay visibly
    /// correlated.
    pub async fn create_events(
        &self,
        actor: &Actor,
        events: Vec<ActivityCreateEvent>,
    ) -> Result<Vec<ActivityRecord>, ActivityError> {
        if events.is_empty() {
            return Ok(Vec::new());
        }
        let created_at = Utc::now();
        debug!(count = events.len(), "persisting activity records");
        let activities = events
            .into_iter()
            .map(|event| build_activity(event, created_at, actor))
            .collect();
        Ok(self.log.append_many(activities).await?)
    }

    /// Capture before-state for a pending mutation of the given type.
    pub async fn context_info(
        &self,
        event_type: ActivityEventType,
        params: &HandlerParams,
    ) -> Result<ActivityContext, ActivityError> {
        self.registry.resolve(event_type)?.context_info(params).await
    }

    /// Render the post-mutation state for one entity.
    pub async fn updated_state(
        &self,
        event_type: ActivityEventType,
        params: &HandlerParams,
        entity_id: EntityId,
    ) -> Result<Value, ActivityError> {
        self.registry
            .resolve(event_type)?
            .updated_state(params, entity_id)
            .await
    }

    /// Render the post-mutation state for many entities at once.
    pub async fn updated_state_many(
        &self,
        event_type: ActivityEventType,
        params: &HandlerParams,
        entity_ids: &[EntityId],
    ) -> Result<HashMap<EntityId, Value>, ActivityError> {
        self.registry
            .resolve(event_type)?
            .updated_state_many(params, entity_ids)
            .await
    }

    // ───────────────────────────── Read side ──────────────────────────────

    /// Matching activities, newest first. `query.kind` selects the query
    /// shape; an unresolvable prerequisite (no owner identity, empty
    /// lineage set) yields an empty result, never an error.
    pub async fn list_activities(
        &self,
        actor: &Actor,
        query: &ActivityQuery,
    ) -> Result<Vec<ActivityRecord>, ActivityError> {
        let filter = base_filter(query)?;
        let filter = match query.kind {
            ActivityKind::All => filter,
            ActivityKind::MyObjects => match actor.owner_id {
                Some(owner) => scoped(filter, ActivityScope::OwnedBy(owner)),
                None => return Ok(Vec::new()),
            },
            ActivityKind::Downstream | ActivityKind::Upstream => {
                let oddrns = self
                    .lineage
                    .dependent_entity_oddrns(direction_of(query.kind))
                    .await?;
                if oddrns.is_empty() {
                    return Ok(Vec::new());
                }
                scoped(
                    filter,
                    ActivityScope::Entities(oddrns.into_iter().collect()),
                )
            }
        };
        Ok(self.log.query(&filter, query.cursor, query.size).await?)
    }

    /// Activities of one entity, newest first. Only the window, user,
    /// event-type and cursor dimensions apply.
    pub async fn list_entity_activities(
        &self,
        entity_id: EntityId,
        query: &ActivityQuery,
    ) -> Result<Vec<ActivityRecord>, ActivityError> {
        let mut filter = require_window(query)?;
        filter.usernames = query.usernames.clone();
        filter.event_type = query.event_type;
        filter.entity_id = Some(entity_id);
        Ok(self.log.query(&filter, query.cursor, query.size).await?)
    }

    /// All four aggregate counts, computed concurrently and combined. Each
    /// sub-count independently defaults to zero when its prerequisite
    /// resolution yields nothing; a storage failure in any branch fails
    /// the whole aggregate.
    pub async fn activity_counts(
        &self,
        actor: &Actor,
        query: &ActivityQuery,
    ) -> Result<ActivityCounts, ActivityError> {
        let total_filter = base_filter(query)?;
        let my_filter = actor
            .owner_id
            .map(|owner| scoped(total_filter.clone(), ActivityScope::OwnedBy(owner)));

        let total = async { Ok::<_, ActivityError>(self.log.count(&total_filter).await?) };
        let my_objects = async {
            match &my_filter {
                Some(filter) => Ok(self.log.count(filter).await?),
                None => Ok(0),
            }
        };
        let downstream = self.dependent_count(query, LineageDirection::Downstream);
        let upstream = self.dependent_count(query, LineageDirection::Upstream);

        let (total, my_objects, downstream, upstream) =
            tokio::try_join!(total, my_objects, downstream, upstream)?;
        Ok(ActivityCounts {
            total,
            my_objects,
            downstream,
            upstream,
        })
    }

    async fn dependent_count(
        &self,
        query: &ActivityQuery,
        direction: LineageDirection,
    ) -> Result<u64, ActivityError> {
        let oddrns = self.lineage.dependent_entity_oddrns(direction).await?;
        if oddrns.is_empty() {
            return Ok(0);
        }
        let filter = scoped(
            base_filter(query)?,
            ActivityScope::Entities(oddrns.into_iter().collect()),
        );
        Ok(self.log.count(&filter).await?)
    }
}

fn direction_of(kind: ActivityKind) -> LineageDirection {
    match kind {
        ActivityKind::Upstream => LineageDirection::Upstream,
        _ => LineageDirection::Downstream,
    }
}

fn require_window(query: &ActivityQuery) -> Result<ActivityFilter, ActivityError> {
    match (query.begin, query.end) {
        (Some(begin), Some(end)) => Ok(ActivityFilter::new(begin, end)),
        _ => Err(ActivityError::InvalidRequest(
            "begin and end dates are required".into(),
        )),
    }
}

fn base_filter(query: &ActivityQuery) -> Result<ActivityFilter, ActivityError> {
    let mut filter = require_window(query)?;
    filter.data_source_id = query.data_source_id;
    filter.namespace_id = query.namespace_id;
    filter.tag_ids = query.tag_ids.clone();
    filter.owner_ids = query.owner_ids.clone();
    filter.usernames = query.usernames.clone();
    filter.event_type = query.event_type;
    Ok(filter)
}

/// Actor-restricted shapes drop the explicit owner filter; the scope
/// supersedes it.
fn scoped(mut filter: ActivityFilter, scope: ActivityScope) -> ActivityFilter {
    filter.owner_ids.clear();
    filter.scope = scope;
    filter
}

fn build_activity(
    event: ActivityCreateEvent,
    created_at: DateTime<Utc>,
    actor: &Actor,
) -> NewActivity {
    NewActivity {
        created_at,
        username: actor.username.clone(),
        event_type: event.event_type,
        old_state: event.old_state,
        new_state: event.new_state,
        entity_id: event.entity_id,
    }
}
