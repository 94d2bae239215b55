//! Activity trail for tessera.
//!
//! This crate defines the types representing catalog mutation events, the
//! `ActivityLog` trait for persisting and querying them, the per-event-type
//! handler registry, and the `ActivityService` orchestration on top.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use tessera_storage::{EntityId, EntityOddrn, OwnerId, StoreError};

mod handler;
mod service;

pub use handler::*;
pub use service::*;

/// Unique identifier for an activity record (the backing store's row id;
/// monotonically increasing, which the keyset cursor relies on for its
/// tie-break).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActivityId(pub i64);

impl std::fmt::Display for ActivityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kinds of catalog mutation events this subsystem records.
///
/// Every variant must have exactly one registered handler; the
/// [`HandlerRegistry`] checks this at construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityEventType {
    OwnershipUpdated,
    DescriptionUpdated,
    TagsUpdated,
    FieldDescriptionUpdated,
    FieldLabelsUpdated,
    GroupCreated,
    GroupUpdated,
    GroupDeleted,
}

impl ActivityEventType {
    /// Every enumeration value, in declaration order. Used to validate
    /// handler coverage at startup.
    pub const ALL: [ActivityEventType; 8] = [
        ActivityEventType::OwnershipUpdated,
        ActivityEventType::DescriptionUpdated,
        ActivityEventType::TagsUpdated,
        ActivityEventType::FieldDescriptionUpdated,
        ActivityEventType::FieldLabelsUpdated,
        ActivityEventType::GroupCreated,
        ActivityEventType::GroupUpdated,
        ActivityEventType::GroupDeleted,
    ];
}

impl std::fmt::Display for ActivityEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActivityEventType::OwnershipUpdated => "ownership.updated",
            ActivityEventType::DescriptionUpdated => "description.updated",
            ActivityEventType::TagsUpdated => "tags.updated",
            ActivityEventType::FieldDescriptionUpdated => "field.description_updated",
            ActivityEventType::FieldLabelsUpdated => "field.labels_updated",
            ActivityEventType::GroupCreated => "group.created",
            ActivityEventType::GroupUpdated => "group.updated",
            ActivityEventType::GroupDeleted => "group.deleted",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for ActivityEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ownership.updated" => Ok(ActivityEventType::OwnershipUpdated),
            "description.updated" => Ok(ActivityEventType::DescriptionUpdated),
            "tags.updated" => Ok(ActivityEventType::TagsUpdated),
            "field.description_updated" => Ok(ActivityEventType::FieldDescriptionUpdated),
            "field.labels_updated" => Ok(ActivityEventType::FieldLabelsUpdated),
            "group.created" => Ok(ActivityEventType::GroupCreated),
            "group.updated" => Ok(ActivityEventType::GroupUpdated),
            "group.deleted" => Ok(ActivityEventType::GroupDeleted),
            _ => Err(format!("Unknown activity event type: {}", s)),
        }
    }
}

/// Which slice of the activity trail a listing request asks for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    /// No actor restriction.
    #[default]
    All,
    /// Only events on entities owned by the requesting actor.
    MyObjects,
    /// Only events on entities downstream of the actor's context.
    Downstream,
    /// Only events on entities upstream of the actor's context.
    Upstream,
}

/// Direction of a lineage walk, resolved by the external lineage
/// collaborator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LineageDirection {
    Downstream,
    Upstream,
}

/// One persisted, immutable activity record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub id: ActivityId,
    /// Assigned once at record creation, never mutated.
    pub created_at: DateTime<Utc>,
    /// Acting user; `None` for system-initiated changes.
    pub username: Option<String>,
    pub event_type: ActivityEventType,
    /// Kind-specific payload, opaque to the store.
    pub old_state: serde_json::Value,
    pub new_state: serde_json::Value,
    pub entity_id: EntityId,
}

/// A finalized record ready for persistence (everything but the row id).
#[derive(Clone, Debug)]
pub struct NewActivity {
    pub created_at: DateTime<Utc>,
    pub username: Option<String>,
    pub event_type: ActivityEventType,
    pub old_state: serde_json::Value,
    pub new_state: serde_json::Value,
    pub entity_id: EntityId,
}

/// What a catalog mutation site submits: the affected entity plus the
/// before/after payloads its handler computed around the mutation. Actor
/// and timestamp are stamped by the service.
#[derive(Clone, Debug)]
pub struct ActivityCreateEvent {
    pub entity_id: EntityId,
    pub event_type: ActivityEventType,
    pub old_state: serde_json::Value,
    pub new_state: serde_json::Value,
}

/// Scope restriction applied on top of the common filter dimensions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ActivityScope {
    #[default]
    All,
    /// Entities owned by the given owner.
    OwnedBy(OwnerId),
    /// Entities within an explicit identifier set (lineage resolution).
    Entities(Vec<EntityOddrn>),
}

/// Common filter vocabulary shared by activity queries and counts.
///
/// The time window is mandatory; everything else is optional. Empty
/// collections mean "no restriction on that dimension".
#[derive(Clone, Debug)]
pub struct ActivityFilter {
    /// Window start (inclusive).
    pub begin: DateTime<Utc>,
    /// Window end (inclusive).
    pub end: DateTime<Utc>,
    pub data_source_id: Option<i64>,
    pub namespace_id: Option<i64>,
    pub tag_ids: Vec<i64>,
    pub owner_ids: Vec<OwnerId>,
    pub usernames: Vec<String>,
    pub event_type: Option<ActivityEventType>,
    pub entity_id: Option<EntityId>,
    pub scope: ActivityScope,
}

impl ActivityFilter {
    pub fn new(begin: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            begin,
            end,
            data_source_id: None,
            namespace_id: None,
            tag_ids: Vec::new(),
            owner_ids: Vec::new(),
            usernames: Vec::new(),
            event_type: None,
            entity_id: None,
            scope: ActivityScope::All,
        }
    }

    pub fn data_source_id(mut self, id: i64) -> Self {
        self.data_source_id = Some(id);
        self
    }

    pub fn namespace_id(mut self, id: i64) -> Self {
        self.namespace_id = Some(id);
        self
    }

    pub fn tag_ids(mut self, ids: Vec<i64>) -> Self {
        self.tag_ids = ids;
        self
    }

    pub fn owner_ids(mut self, ids: Vec<OwnerId>) -> Self {
        self.owner_ids = ids;
        self
    }

    pub fn usernames(mut self, usernames: Vec<String>) -> Self {
        self.usernames = usernames;
        self
    }

    pub fn event_type(mut self, event_type: ActivityEventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    pub fn entity_id(mut self, id: EntityId) -> Self {
        self.entity_id = Some(id);
        self
    }

    pub fn scope(mut self, scope: ActivityScope) -> Self {
        self.scope = scope;
        self
    }
}

/// Keyset pagination cursor: the last record the caller has seen. Pages
/// remain correct under concurrent inserts of newer events, which offset
/// pagination would not.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityCursor {
    pub last_id: ActivityId,
    pub last_created_at: DateTime<Utc>,
}

/// Error type for activity log backends.
#[derive(Debug, Error)]
pub enum ActivityLogError {
    #[error("database error: {0}")]
    Database(String),
}

/// Append-mostly ledger of activity records.
///
/// Records are immutable once persisted; this subsystem never updates or
/// deletes them (retention is an external policy concern).
#[cfg_attr(feature = "test-support", mockall::automock)]
#[async_trait::async_trait]
pub trait ActivityLog: Send + Sync {
    /// Persist one record, returning it with its assigned id.
    async fn append(&self, activity: NewActivity) -> Result<ActivityRecord, ActivityLogError>;

    /// Persist a batch. Backends partition large batches into bounded
    /// chunks; results are concatenated in submission order.
    async fn append_many(
        &self,
        activities: Vec<NewActivity>,
    ) -> Result<Vec<ActivityRecord>, ActivityLogError>;

    /// Matching records, newest first with an id-descending tie-break,
    /// starting strictly after `cursor` when one is given.
    async fn query(
        &self,
        filter: &ActivityFilter,
        cursor: Option<ActivityCursor>,
        limit: Option<u32>,
    ) -> Result<Vec<ActivityRecord>, ActivityLogError>;

    /// Number of matching records.
    async fn count(&self, filter: &ActivityFilter) -> Result<u64, ActivityLogError>;
}

/// Error taxonomy of the activity subsystem.
///
/// `InvalidRequest` is user-facing and never touches storage.
/// `MissingHandler`/`DuplicateHandler` indicate a deployment defect, not
/// bad input. Storage errors propagate unchanged; no retries here.
#[derive(Debug, Error)]
pub enum ActivityError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no activity handler registered for event type '{0}'")]
    MissingHandler(ActivityEventType),

    #[error("more than one activity handler registered for event type '{0}'")]
    DuplicateHandler(ActivityEventType),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Log(#[from] ActivityLogError),
}
