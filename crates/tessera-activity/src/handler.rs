//! Per-event-type activity handlers.
//!
//! Each handler knows how to capture the "before" context of one class of
//! catalog mutation and how to render the "after" diff. Handlers are
//! resolved by direct lookup in a [`HandlerRegistry`] built once at
//! startup; a type without a handler is a deployment defect and fails
//! registry construction, never a user-facing error.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};

use tessera_storage::{EntityId, EntityStore, FieldId, RelationStore, StateStore};

use crate::{ActivityError, ActivityEventType};

/// Kind-specific handler inputs, keyed by parameter name (mirrors the loose
/// parameter maps mutation sites already carry).
pub type HandlerParams = serde_json::Map<String, Value>;

/// Read a required integer parameter.
pub fn param_i64(params: &HandlerParams, key: &str) -> Result<i64, ActivityError> {
    params
        .get(key)
        .and_then(Value::as_i64)
        .ok_or_else(|| ActivityError::InvalidRequest(format!("missing parameter '{}'", key)))
}

/// Context captured before the underlying mutation completes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActivityContext {
    /// The entity the event will be recorded against.
    pub entity_id: EntityId,
    /// Kind-specific "before" payload.
    pub old_state: Value,
}

#[async_trait::async_trait]
pub trait ActivityHandler: Send + Sync {
    /// The event types this handler serves.
    fn event_types(&self) -> &'static [ActivityEventType];

    /// Capture the "before" information needed to later compute a diff.
    /// Must run before the underlying mutation completes.
    async fn context_info(&self, params: &HandlerParams) -> Result<ActivityContext, ActivityError>;

    /// Render the post-mutation state for one entity.
    async fn updated_state(
        &self,
        params: &HandlerParams,
        entity_id: EntityId,
    ) -> Result<Value, ActivityError>;

    /// Batch form of [`updated_state`](Self::updated_state). The default
    /// loops over single lookups; handlers with a batched storage path
    /// override it.
    async fn updated_state_many(
        &self,
        params: &HandlerParams,
        entity_ids: &[EntityId],
    ) -> Result<HashMap<EntityId, Value>, ActivityError> {
        let mut out = HashMap::with_capacity(entity_ids.len());
        for id in entity_ids {
            out.insert(*id, self.updated_state(params, *id).await?);
        }
        Ok(out)
    }
}

/// Static event-type → handler mapping, validated at construction: every
/// [`ActivityEventType`] value must be claimed by exactly one handler.
pub struct HandlerRegistry {
    handlers: HashMap<ActivityEventType, Arc<dyn ActivityHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("event_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new(handlers: Vec<Arc<dyn ActivityHandler>>) -> Result<Self, ActivityError> {
        let mut map: HashMap<ActivityEventType, Arc<dyn ActivityHandler>> = HashMap::new();
        for handler in handlers {
            for ty in handler.event_types() {
                if map.insert(*ty, handler.clone()).is_some() {
                    return Err(ActivityError::DuplicateHandler(*ty));
                }
            }
        }
        for ty in ActivityEventType::ALL {
            if !map.contains_key(&ty) {
                return Err(ActivityError::MissingHandler(ty));
            }
        }
        Ok(Self { handlers: map })
    }

    /// Wire up the built-in handler set over the given stores.
    pub fn with_stores(
        states: Arc<dyn StateStore>,
        relations: Arc<dyn RelationStore>,
        entities: Arc<dyn EntityStore>,
    ) -> Result<Self, ActivityError> {
        Self::new(vec![
            Arc::new(OwnershipHandler::new(states.clone())),
            Arc::new(DescriptionHandler::new(states.clone())),
            Arc::new(TagsHandler::new(states.clone())),
            Arc::new(FieldDescriptionHandler::new(states.clone())),
            Arc::new(FieldLabelsHandler::new(states)),
            Arc::new(GroupLifecycleHandler::new(relations, entities)),
        ])
    }

    pub fn resolve(&self, ty: ActivityEventType) -> Result<&dyn ActivityHandler, ActivityError> {
        self.handlers
            .get(&ty)
            .map(AsRef::as_ref)
            .ok_or(ActivityError::MissingHandler(ty))
    }
}

// ─────────────────────────── Built-in handlers ───────────────────────────

/// Ownership changes on an entity.
pub struct OwnershipHandler {
    states: Arc<dyn StateStore>,
}

impl OwnershipHandler {
    pub fn new(states: Arc<dyn StateStore>) -> Self {
        Self { states }
    }
}

#[async_trait::async_trait]
impl ActivityHandler for OwnershipHandler {
    fn event_types(&self) -> &'static [ActivityEventType] {
        &[ActivityEventType::OwnershipUpdated]
    }

    async fn context_info(&self, params: &HandlerParams) -> Result<ActivityContext, ActivityError> {
        let entity_id = EntityId(param_i64(params, "entity_id")?);
        let owners = self.states.entity_owners(entity_id).await?;
        Ok(ActivityContext {
            entity_id,
            old_state: json!({ "owners": owners }),
        })
    }

    async fn updated_state(
        &self,
        _params: &HandlerParams,
        entity_id: EntityId,
    ) -> Result<Value, ActivityError> {
        let owners = self.states.entity_owners(entity_id).await?;
        Ok(json!({ "owners": owners }))
    }
}

/// Internal description changes on an entity.
pub struct DescriptionHandler {
    states: Arc<dyn StateStore>,
}

impl DescriptionHandler {
    pub fn new(states: Arc<dyn StateStore>) -> Self {
        Self { states }
    }
}

#[async_trait::async_trait]
impl ActivityHandler for DescriptionHandler {
    fn event_types(&self) -> &'static [ActivityEventType] {
        &[ActivityEventType::DescriptionUpdated]
    }

    async fn context_info(&self, params: &HandlerParams) -> Result<ActivityContext, ActivityError> {
        let entity_id = EntityId(param_i64(params, "entity_id")?);
        let description = self.states.entity_description(entity_id).await?;
        Ok(ActivityContext {
            entity_id,
            old_state: json!({ "description": description }),
        })
    }

    async fn updated_state(
        &self,
        _params: &HandlerParams,
        entity_id: EntityId,
    ) -> Result<Value, ActivityError> {
        let description = self.states.entity_description(entity_id).await?;
        Ok(json!({ "description": description }))
    }

    async fn updated_state_many(
        &self,
        _params: &HandlerParams,
        entity_ids: &[EntityId],
    ) -> Result<HashMap<EntityId, Value>, ActivityError> {
        let descriptions = self.states.entity_descriptions(entity_ids).await?;
        Ok(entity_ids
            .iter()
            .map(|id| {
                let description = descriptions.get(id).cloned().flatten();
                (*id, json!({ "description": description }))
            })
            .collect())
    }
}

/// Tag association changes on an entity.
pub struct TagsHandler {
    states: Arc<dyn StateStore>,
}

impl TagsHandler {
    pub fn new(states: Arc<dyn StateStore>) -> Self {
        Self { states }
    }
}

#[async_trait::async_trait]
impl ActivityHandler for TagsHandler {
    fn event_types(&self) -> &'static [ActivityEventType] {
        &[ActivityEventType::TagsUpdated]
    }

    async fn context_info(&self, params: &HandlerParams) -> Result<ActivityContext, ActivityError> {
        let entity_id = EntityId(param_i64(params, "entity_id")?);
        let tags = self.states.entity_tags(entity_id).await?;
        Ok(ActivityContext {
            entity_id,
            old_state: json!({ "tags": tags }),
        })
    }

    async fn updated_state(
        &self,
        _params: &HandlerParams,
        entity_id: EntityId,
    ) -> Result<Value, ActivityError> {
        let tags = self.states.entity_tags(entity_id).await?;
        Ok(json!({ "tags": tags }))
    }
}

/// Description changes on a dataset field. The affected entity is the
/// dataset the field belongs to, resolved through the state store.
pub struct FieldDescriptionHandler {
    states: Arc<dyn StateStore>,
}

impl FieldDescriptionHandler {
    pub fn new(states: Arc<dyn StateStore>) -> Self {
        Self { states }
    }
}

#[async_trait::async_trait]
impl ActivityHandler for FieldDescriptionHandler {
    fn event_types(&self) -> &'static [ActivityEventType] {
        &[ActivityEventType::FieldDescriptionUpdated]
    }

    async fn context_info(&self, params: &HandlerParams) -> Result<ActivityContext, ActivityError> {
        let field = FieldId(param_i64(params, "field_id")?);
        let entity_id = self.states.field_entity_id(field).await?;
        let description = self.states.field_description(field).await?;
        Ok(ActivityContext {
            entity_id,
            old_state: json!({ "field_id": field.0, "description": description }),
        })
    }

    async fn updated_state(
        &self,
        params: &HandlerParams,
        _entity_id: EntityId,
    ) -> Result<Value, ActivityError> {
        let field = FieldId(param_i64(params, "field_id")?);
        let description = self.states.field_description(field).await?;
        Ok(json!({ "field_id": field.0, "description": description }))
    }
}

/// Label changes on a dataset field.
pub struct FieldLabelsHandler {
    states: Arc<dyn StateStore>,
}

impl FieldLabelsHandler {
    pub fn new(states: Arc<dyn StateStore>) -> Self {
        Self { states }
    }
}

#[async_trait::async_trait]
impl ActivityHandler for FieldLabelsHandler {
    fn event_types(&self) -> &'static [ActivityEventType] {
        &[ActivityEventType::FieldLabelsUpdated]
    }

    async fn context_info(&self, params: &HandlerParams) -> Result<ActivityContext, ActivityError> {
        let field = FieldId(param_i64(params, "field_id")?);
        let entity_id = self.states.field_entity_id(field).await?;
        let labels = self.states.field_labels(field).await?;
        Ok(ActivityContext {
            entity_id,
            old_state: json!({ "field_id": field.0, "labels": labels }),
        })
    }

    async fn updated_state(
        &self,
        params: &HandlerParams,
        _entity_id: EntityId,
    ) -> Result<Value, ActivityError> {
        let field = FieldId(param_i64(params, "field_id")?);
        let labels = self.states.field_labels(field).await?;
        Ok(json!({ "field_id": field.0, "labels": labels }))
    }
}

/// Group lifecycle events. The before/after payload is a snapshot of the
/// group's direct membership, so a deleted group's audit record keeps the
/// member list it had.
pub struct GroupLifecycleHandler {
    relations: Arc<dyn RelationStore>,
    entities: Arc<dyn EntityStore>,
}

impl GroupLifecycleHandler {
    pub fn new(relations: Arc<dyn RelationStore>, entities: Arc<dyn EntityStore>) -> Self {
        Self {
            relations,
            entities,
        }
    }

    async fn membership_snapshot(&self, entity_id: EntityId) -> Result<Value, ActivityError> {
        let oddrn = self.entities.oddrn_by_id(entity_id).await?;
        let mut members: Vec<String> = self
            .relations
            .members_of(std::slice::from_ref(&oddrn))
            .await?
            .into_iter()
            .map(|r| r.member_oddrn.0)
            .collect();
        members.sort_unstable();
        Ok(json!({ "group": oddrn.0, "members": members }))
    }
}

#[async_trait::async_trait]
impl ActivityHandler for GroupLifecycleHandler {
    fn event_types(&self) -> &'static [ActivityEventType] {
        &[
            ActivityEventType::GroupCreated,
            ActivityEventType::GroupUpdated,
            ActivityEventType::GroupDeleted,
        ]
    }

    async fn context_info(&self, params: &HandlerParams) -> Result<ActivityContext, ActivityError> {
        let entity_id = EntityId(param_i64(params, "entity_id")?);
        let old_state = self.membership_snapshot(entity_id).await?;
        Ok(ActivityContext {
            entity_id,
            old_state,
        })
    }

    async fn updated_state(
        &self,
        _params: &HandlerParams,
        entity_id: EntityId,
    ) -> Result<Value, ActivityError> {
        self.membership_snapshot(entity_id).await
    }
}
