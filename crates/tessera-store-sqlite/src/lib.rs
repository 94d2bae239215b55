//! SQLite backend for tessera.
//!
//! Implements the relation, entity, state and activity-log traits over one
//! sqlx pool. Statement-level atomicity comes from SQLite itself; bulk
//! inserts are partitioned into bounded chunks to stay inside the bind
//! parameter limit, and each chunk is one atomic statement.

use std::collections::HashMap;

use chrono::DateTime;
use sqlx::{sqlite::SqlitePoolOptions, QueryBuilder, Sqlite, SqlitePool};
use tracing::debug;

use tessera_activity::{
    ActivityCursor, ActivityFilter, ActivityLog, ActivityLogError, ActivityRecord, ActivityScope,
    NewActivity,
};
use tessera_storage::{
    EntityId, EntityOddrn, EntityStore, FieldId, GroupRelation, NewEntity, OwnerId, RelationStore,
    StateStore, StoreError,
};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// SQLite's default bind parameter ceiling; chunk sizes are clamped so no
/// statement exceeds it.
const SQLITE_BIND_LIMIT: usize = 999;

/// Default rows per bulk-insert chunk, validated against the bind limit
/// (relation rows carry two parameters each).
const DEFAULT_INSERT_CHUNK: usize = 400;

/// Default result cap for activity queries when the caller gives none.
const DEFAULT_ACTIVITY_LIMIT: u32 = 100;

type ActivityRow = (i64, i64, Option<String>, String, String, String, i64);

pub struct SqliteStore {
    pool: SqlitePool,
    insert_chunk_size: usize,
}

impl SqliteStore {
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        Self::open("sqlite::memory:").await
    }

    pub async fn open(url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(url)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(Self {
            pool,
            insert_chunk_size: DEFAULT_INSERT_CHUNK,
        })
    }

    /// Override the bulk-insert chunk size (rows per statement). Values
    /// are clamped to the backend's bind parameter limit per table.
    pub fn with_insert_chunk_size(mut self, rows: usize) -> Self {
        self.insert_chunk_size = rows.max(1);
        self
    }

    fn relation_chunk(&self) -> usize {
        // two binds per relation row
        self.insert_chunk_size.min(SQLITE_BIND_LIMIT / 2)
    }

    fn activity_chunk(&self) -> usize {
        // six binds per activity row
        self.insert_chunk_size.min(SQLITE_BIND_LIMIT / 6)
    }

    // ───────────────────────── Entity seed helpers ─────────────────────────
    // Entity/field rows are owned by the external catalog; these helpers
    // stand in for its ingest path so backends can be populated in tests
    // and embedded deployments.

    pub async fn insert_entity(&self, entity: &NewEntity) -> Result<EntityId, StoreError> {
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO entities(oddrn, internal_name, external_name, description,
                                  manually_created, data_source_id, namespace_id)
             VALUES(?,?,?,?,?,?,?) RETURNING id",
        )
        .bind(&entity.oddrn.0)
        .bind(&entity.internal_name)
        .bind(&entity.external_name)
        .bind(&entity.description)
        .bind(entity.manually_created)
        .bind(entity.data_source_id)
        .bind(entity.namespace_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(EntityId(id))
    }

    pub async fn update_entity_description(
        &self,
        id: EntityId,
        description: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE entities SET description=? WHERE id=?")
            .bind(description)
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    pub async fn set_entity_owners(
        &self,
        id: EntityId,
        owners: &[(OwnerId, &str)],
    ) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        sqlx::query("DELETE FROM entity_owners WHERE entity_id=?")
            .bind(id.0)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        for (owner, name) in owners {
            sqlx::query("INSERT INTO entity_owners(entity_id, owner_id, owner_name) VALUES(?,?,?)")
                .bind(id.0)
                .bind(owner.0)
                .bind(name)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
        }
        tx.commit()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    pub async fn set_entity_tags(
        &self,
        id: EntityId,
        tags: &[(i64, &str)],
    ) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        sqlx::query("DELETE FROM entity_tags WHERE entity_id=?")
            .bind(id.0)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        for (tag_id, name) in tags {
            sqlx::query("INSERT INTO entity_tags(entity_id, tag_id, tag_name) VALUES(?,?,?)")
                .bind(id.0)
                .bind(tag_id)
                .bind(name)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
        }
        tx.commit()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    pub async fn insert_dataset_field(
        &self,
        entity_id: EntityId,
        name: &str,
        description: Option<&str>,
        labels: &[String],
    ) -> Result<FieldId, StoreError> {
        let labels_json = serde_json::to_string(labels)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO dataset_fields(entity_id, name, description, labels)
             VALUES(?,?,?,?) RETURNING id",
        )
        .bind(entity_id.0)
        .bind(name)
        .bind(description)
        .bind(labels_json)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(FieldId(id))
    }

    pub async fn update_field_description(
        &self,
        field: FieldId,
        description: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE dataset_fields SET description=? WHERE id=?")
            .bind(description)
            .bind(field.0)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    pub async fn update_field_labels(
        &self,
        field: FieldId,
        labels: &[String],
    ) -> Result<(), StoreError> {
        let labels_json = serde_json::to_string(labels)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        sqlx::query("UPDATE dataset_fields SET labels=? WHERE id=?")
            .bind(labels_json)
            .bind(field.0)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    // ───────────────────────── Internal query helpers ──────────────────────

    /// One page of relation targets joined against the entity table.
    /// `target` is the selected/joined column, `anchor` the filtered one.
    async fn relation_page(
        &self,
        target: &str,
        anchor: &str,
        key: &EntityOddrn,
        prefix: Option<&str>,
        limit: u32,
        offset: u64,
    ) -> Result<Vec<EntityOddrn>, StoreError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT gr.{target} FROM group_relations gr \
             JOIN entities e ON e.oddrn = gr.{target} WHERE gr.{anchor} = "
        ));
        qb.push_bind(key.0.clone());
        push_name_filter(&mut qb, prefix);
        qb.push(" ORDER BY e.id DESC LIMIT ");
        qb.push_bind(limit as i64);
        qb.push(" OFFSET ");
        qb.push_bind(offset as i64);

        let rows: Vec<(String,)> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(rows.into_iter().map(|(oddrn,)| EntityOddrn(oddrn)).collect())
    }

    async fn relation_count(
        &self,
        target: &str,
        anchor: &str,
        key: &EntityOddrn,
        prefix: Option<&str>,
    ) -> Result<u64, StoreError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT COUNT(*) FROM group_relations gr \
             JOIN entities e ON e.oddrn = gr.{target} WHERE gr.{anchor} = "
        ));
        qb.push_bind(key.0.clone());
        push_name_filter(&mut qb, prefix);

        let (count,): (i64,) = qb
            .build_query_as()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(count as u64)
    }
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Case-insensitive prefix filter over the entity's two name fields.
fn push_name_filter(qb: &mut QueryBuilder<'_, Sqlite>, prefix: Option<&str>) {
    if let Some(prefix) = prefix {
        let pattern = format!("{}%", escape_like(prefix));
        qb.push(" AND (e.internal_name LIKE ");
        qb.push_bind(pattern.clone());
        qb.push(" ESCAPE '\\' OR e.external_name LIKE ");
        qb.push_bind(pattern);
        qb.push(" ESCAPE '\\')");
    }
}

#[async_trait::async_trait]
impl RelationStore for SqliteStore {
    async fn create_relations(&self, relations: &[GroupRelation]) -> Result<(), StoreError> {
        let rows: Vec<&GroupRelation> = relations.iter().filter(|r| !r.is_self_loop()).collect();
        if rows.is_empty() {
            return Ok(());
        }
        for chunk in rows.chunks(self.relation_chunk()) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("INSERT INTO group_relations(group_oddrn, member_oddrn) ");
            qb.push_values(chunk, |mut b, rel| {
                b.push_bind(rel.group_oddrn.0.clone())
                    .push_bind(rel.member_oddrn.0.clone());
            });
            qb.push(" ON CONFLICT DO NOTHING");
            qb.build()
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
        }
        debug!(relations = rows.len(), "created group relations");
        Ok(())
    }

    async fn delete_all_for_entity(
        &self,
        entity: &EntityOddrn,
    ) -> Result<Vec<GroupRelation>, StoreError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "DELETE FROM group_relations WHERE group_oddrn=?1 OR member_oddrn=?1
             RETURNING group_oddrn, member_oddrn",
        )
        .bind(&entity.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(rows.into_iter().map(into_relation).collect())
    }

    async fn delete_except(
        &self,
        group: &EntityOddrn,
        keep: &[EntityOddrn],
    ) -> Result<Vec<GroupRelation>, StoreError> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("DELETE FROM group_relations WHERE group_oddrn = ");
        qb.push_bind(group.0.clone());
        if !keep.is_empty() {
            qb.push(" AND member_oddrn NOT IN (");
            {
                let mut sep = qb.separated(", ");
                for member in keep {
                    sep.push_bind(member.0.clone());
                }
            }
            qb.push(")");
        }
        qb.push(" RETURNING group_oddrn, member_oddrn");

        let rows: Vec<(String, String)> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(rows.into_iter().map(into_relation).collect())
    }

    async fn delete_pair(
        &self,
        group: &EntityOddrn,
        member: &EntityOddrn,
    ) -> Result<Option<GroupRelation>, StoreError> {
        let row: Option<(String, String)> = sqlx::query_as(
            "DELETE FROM group_relations WHERE group_oddrn=? AND member_oddrn=?
             RETURNING group_oddrn, member_oddrn",
        )
        .bind(&group.0)
        .bind(&member.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(row.map(into_relation))
    }

    async fn reconcile(&self, target: &[GroupRelation]) -> Result<(), StoreError> {
        if target.is_empty() {
            return Ok(());
        }
        let mut by_group: HashMap<&str, Vec<&str>> = HashMap::new();
        for rel in target {
            by_group
                .entry(rel.group_oddrn.as_str())
                .or_default()
                .push(rel.member_oddrn.as_str());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        for (group, members) in by_group {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("DELETE FROM group_relations WHERE group_oddrn = ");
            qb.push_bind(group.to_string());
            qb.push(" AND member_oddrn NOT IN (");
            {
                let mut sep = qb.separated(", ");
                for member in members {
                    sep.push_bind(member.to_string());
                }
            }
            qb.push(")");
            qb.build()
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
        }
        tx.commit()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn has_members(&self, group: &EntityOddrn) -> Result<bool, StoreError> {
        let (exists,): (i64,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM group_relations WHERE group_oddrn=?)",
        )
        .bind(&group.0)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(exists != 0)
    }

    async fn parents_of(
        &self,
        members: &[EntityOddrn],
    ) -> Result<HashMap<EntityOddrn, Vec<EntityOddrn>>, StoreError> {
        if members.is_empty() {
            return Ok(HashMap::new());
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT group_oddrn, member_oddrn FROM group_relations WHERE member_oddrn IN (",
        );
        {
            let mut sep = qb.separated(", ");
            for member in members {
                sep.push_bind(member.0.clone());
            }
        }
        qb.push(")");

        let rows: Vec<(String, String)> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let mut out: HashMap<EntityOddrn, Vec<EntityOddrn>> = HashMap::new();
        for (group, member) in rows {
            out.entry(EntityOddrn(group))
                .or_default()
                .push(EntityOddrn(member));
        }
        Ok(out)
    }

    async fn members_of(&self, groups: &[EntityOddrn]) -> Result<Vec<GroupRelation>, StoreError> {
        if groups.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT group_oddrn, member_oddrn FROM group_relations WHERE group_oddrn IN (",
        );
        {
            let mut sep = qb.separated(", ");
            for group in groups {
                sep.push_bind(group.0.clone());
            }
        }
        qb.push(")");

        let rows: Vec<(String, String)> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(rows.into_iter().map(into_relation).collect())
    }

    async fn manually_created_parents(
        &self,
        member: &EntityOddrn,
    ) -> Result<Vec<GroupRelation>, StoreError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT gr.group_oddrn, gr.member_oddrn FROM group_relations gr
             JOIN entities e ON e.oddrn = gr.group_oddrn
             WHERE gr.member_oddrn=? AND e.manually_created=1",
        )
        .bind(&member.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(rows.into_iter().map(into_relation).collect())
    }

    async fn member_page(
        &self,
        group: &EntityOddrn,
        prefix: Option<&str>,
        limit: u32,
        offset: u64,
    ) -> Result<Vec<EntityOddrn>, StoreError> {
        self.relation_page("member_oddrn", "group_oddrn", group, prefix, limit, offset)
            .await
    }

    async fn upper_group_page(
        &self,
        group: &EntityOddrn,
        prefix: Option<&str>,
        limit: u32,
        offset: u64,
    ) -> Result<Vec<EntityOddrn>, StoreError> {
        self.relation_page("group_oddrn", "member_oddrn", group, prefix, limit, offset)
            .await
    }

    async fn count_members(
        &self,
        group: &EntityOddrn,
        prefix: Option<&str>,
    ) -> Result<u64, StoreError> {
        self.relation_count("member_oddrn", "group_oddrn", group, prefix)
            .await
    }

    async fn count_upper_groups(
        &self,
        group: &EntityOddrn,
        prefix: Option<&str>,
    ) -> Result<u64, StoreError> {
        self.relation_count("group_oddrn", "member_oddrn", group, prefix)
            .await
    }
}

fn into_relation((group, member): (String, String)) -> GroupRelation {
    GroupRelation {
        group_oddrn: EntityOddrn(group),
        member_oddrn: EntityOddrn(member),
    }
}

#[async_trait::async_trait]
impl EntityStore for SqliteStore {
    async fn oddrn_by_id(&self, id: EntityId) -> Result<EntityOddrn, StoreError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT oddrn FROM entities WHERE id=?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        match row {
            Some((oddrn,)) => Ok(EntityOddrn(oddrn)),
            None => Err(StoreError::NotFound),
        }
    }

    async fn id_by_oddrn(&self, oddrn: &EntityOddrn) -> Result<EntityId, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM entities WHERE oddrn=?")
            .bind(&oddrn.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        match row {
            Some((id,)) => Ok(EntityId(id)),
            None => Err(StoreError::NotFound),
        }
    }

    async fn is_manually_created(&self, oddrn: &EntityOddrn) -> Result<bool, StoreError> {
        let row: Option<(bool,)> =
            sqlx::query_as("SELECT manually_created FROM entities WHERE oddrn=?")
                .bind(&oddrn.0)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
        match row {
            Some((manual,)) => Ok(manual),
            None => Err(StoreError::NotFound),
        }
    }
}

#[async_trait::async_trait]
impl StateStore for SqliteStore {
    async fn entity_description(&self, id: EntityId) -> Result<Option<String>, StoreError> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT description FROM entities WHERE id=?")
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
        match row {
            Some((description,)) => Ok(description),
            None => Err(StoreError::NotFound),
        }
    }

    async fn entity_descriptions(
        &self,
        ids: &[EntityId],
    ) -> Result<HashMap<EntityId, Option<String>>, StoreError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT id, description FROM entities WHERE id IN (");
        {
            let mut sep = qb.separated(", ");
            for id in ids {
                sep.push_bind(id.0);
            }
        }
        qb.push(")");

        let rows: Vec<(i64, Option<String>)> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(rows
            .into_iter()
            .map(|(id, description)| (EntityId(id), description))
            .collect())
    }

    async fn entity_tags(&self, id: EntityId) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT tag_name FROM entity_tags WHERE entity_id=? ORDER BY tag_id",
        )
        .bind(id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    async fn entity_owners(&self, id: EntityId) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT owner_name FROM entity_owners WHERE entity_id=? ORDER BY owner_id",
        )
        .bind(id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    async fn field_description(&self, field: FieldId) -> Result<Option<String>, StoreError> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT description FROM dataset_fields WHERE id=?")
                .bind(field.0)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
        match row {
            Some((description,)) => Ok(description),
            None => Err(StoreError::NotFound),
        }
    }

    async fn field_labels(&self, field: FieldId) -> Result<Vec<String>, StoreError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT labels FROM dataset_fields WHERE id=?")
                .bind(field.0)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
        match row {
            Some((labels,)) => {
                serde_json::from_str(&labels).map_err(|e| StoreError::Backend(e.to_string()))
            }
            None => Err(StoreError::NotFound),
        }
    }

    async fn field_entity_id(&self, field: FieldId) -> Result<EntityId, StoreError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT entity_id FROM dataset_fields WHERE id=?")
                .bind(field.0)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
        match row {
            Some((id,)) => Ok(EntityId(id)),
            None => Err(StoreError::NotFound),
        }
    }
}

#[async_trait::async_trait]
impl ActivityLog for SqliteStore {
    async fn append(&self, activity: NewActivity) -> Result<ActivityRecord, ActivityLogError> {
        let mut records = self.append_many(vec![activity]).await?;
        records
            .pop()
            .ok_or_else(|| ActivityLogError::Database("insert returned no row".into()))
    }

    async fn append_many(
        &self,
        activities: Vec<NewActivity>,
    ) -> Result<Vec<ActivityRecord>, ActivityLogError> {
        if activities.is_empty() {
            return Ok(Vec::new());
        }
        let mut records = Vec::with_capacity(activities.len());
        for chunk in activities.chunks(self.activity_chunk()) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO activities(created_at, username, event_type, old_state, new_state, entity_id) ",
            );
            qb.push_values(chunk, |mut b, a| {
                b.push_bind(a.created_at.timestamp_micros())
                    .push_bind(a.username.clone())
                    .push_bind(a.event_type.to_string())
                    .push_bind(a.old_state.to_string())
                    .push_bind(a.new_state.to_string())
                    .push_bind(a.entity_id.0);
            });
            qb.push(" RETURNING id");

            let mut ids: Vec<(i64,)> = qb
                .build_query_as()
                .fetch_all(&self.pool)
                .await
                .map_err(|e| ActivityLogError::Database(e.to_string()))?;
            if ids.len() != chunk.len() {
                return Err(ActivityLogError::Database(
                    "insert returned unexpected row count".into(),
                ));
            }
            // RETURNING row order is undefined; rowids ascend in insertion
            // order within one statement, so sorting restores the pairing.
            ids.sort_unstable();
            for ((id,), activity) in ids.into_iter().zip(chunk) {
                records.push(ActivityRecord {
                    id: tessera_activity::ActivityId(id),
                    created_at: activity.created_at,
                    username: activity.username.clone(),
                    event_type: activity.event_type,
                    old_state: activity.old_state.clone(),
                    new_state: activity.new_state.clone(),
                    entity_id: activity.entity_id,
                });
            }
        }
        debug!(records = records.len(), "appended activity records");
        Ok(records)
    }

    async fn query(
        &self,
        filter: &ActivityFilter,
        cursor: Option<ActivityCursor>,
        limit: Option<u32>,
    ) -> Result<Vec<ActivityRecord>, ActivityLogError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT a.id, a.created_at, a.username, a.event_type, a.old_state, a.new_state, a.entity_id \
             FROM activities a WHERE a.created_at >= ",
        );
        qb.push_bind(filter.begin.timestamp_micros());
        qb.push(" AND a.created_at <= ");
        qb.push_bind(filter.end.timestamp_micros());
        push_activity_filter(&mut qb, filter);

        if let Some(cursor) = cursor {
            let last = cursor.last_created_at.timestamp_micros();
            qb.push(" AND (a.created_at < ");
            qb.push_bind(last);
            qb.push(" OR (a.created_at = ");
            qb.push_bind(last);
            qb.push(" AND a.id < ");
            qb.push_bind(cursor.last_id.0);
            qb.push("))");
        }

        qb.push(" ORDER BY a.created_at DESC, a.id DESC LIMIT ");
        qb.push_bind(i64::from(limit.unwrap_or(DEFAULT_ACTIVITY_LIMIT)));

        let rows: Vec<ActivityRow> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ActivityLogError::Database(e.to_string()))?;
        rows.into_iter().map(row_to_record).collect()
    }

    async fn count(&self, filter: &ActivityFilter) -> Result<u64, ActivityLogError> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) FROM activities a WHERE a.created_at >= ");
        qb.push_bind(filter.begin.timestamp_micros());
        qb.push(" AND a.created_at <= ");
        qb.push_bind(filter.end.timestamp_micros());
        push_activity_filter(&mut qb, filter);

        let (count,): (i64,) = qb
            .build_query_as()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| ActivityLogError::Database(e.to_string()))?;
        Ok(count as u64)
    }
}

/// The common filter dimensions, appended as AND clauses. Entity-level
/// dimensions go through EXISTS subqueries so multi-valued joins (tags,
/// owners) can't duplicate activity rows.
fn push_activity_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &ActivityFilter) {
    if let Some(data_source_id) = filter.data_source_id {
        qb.push(
            " AND EXISTS (SELECT 1 FROM entities e WHERE e.id = a.entity_id AND e.data_source_id = ",
        );
        qb.push_bind(data_source_id);
        qb.push(")");
    }
    if let Some(namespace_id) = filter.namespace_id {
        qb.push(
            " AND EXISTS (SELECT 1 FROM entities e WHERE e.id = a.entity_id AND e.namespace_id = ",
        );
        qb.push_bind(namespace_id);
        qb.push(")");
    }
    if !filter.tag_ids.is_empty() {
        qb.push(
            " AND EXISTS (SELECT 1 FROM entity_tags t WHERE t.entity_id = a.entity_id AND t.tag_id IN (",
        );
        {
            let mut sep = qb.separated(", ");
            for tag_id in &filter.tag_ids {
                sep.push_bind(*tag_id);
            }
        }
        qb.push("))");
    }
    if !filter.owner_ids.is_empty() {
        qb.push(
            " AND EXISTS (SELECT 1 FROM entity_owners o WHERE o.entity_id = a.entity_id AND o.owner_id IN (",
        );
        {
            let mut sep = qb.separated(", ");
            for owner in &filter.owner_ids {
                sep.push_bind(owner.0);
            }
        }
        qb.push("))");
    }
    if !filter.usernames.is_empty() {
        qb.push(" AND a.username IN (");
        {
            let mut sep = qb.separated(", ");
            for username in &filter.usernames {
                sep.push_bind(username.clone());
            }
        }
        qb.push(")");
    }
    if let Some(event_type) = filter.event_type {
        qb.push(" AND a.event_type = ");
        qb.push_bind(event_type.to_string());
    }
    if let Some(entity_id) = filter.entity_id {
        qb.push(" AND a.entity_id = ");
        qb.push_bind(entity_id.0);
    }
    match &filter.scope {
        ActivityScope::All => {}
        ActivityScope::OwnedBy(owner) => {
            qb.push(
                " AND EXISTS (SELECT 1 FROM entity_owners o WHERE o.entity_id = a.entity_id AND o.owner_id = ",
            );
            qb.push_bind(owner.0);
            qb.push(")");
        }
        ActivityScope::Entities(oddrns) => {
            if oddrns.is_empty() {
                // an empty identifier set matches nothing
                qb.push(" AND 1 = 0");
            } else {
                qb.push(
                    " AND EXISTS (SELECT 1 FROM entities e WHERE e.id = a.entity_id AND e.oddrn IN (",
                );
                {
                    let mut sep = qb.separated(", ");
                    for oddrn in oddrns {
                        sep.push_bind(oddrn.0.clone());
                    }
                }
                qb.push("))");
            }
        }
    }
}

fn row_to_record(row: ActivityRow) -> Result<ActivityRecord, ActivityLogError> {
    let (id, created_at, username, event_type, old_state, new_state, entity_id) = row;
    let created_at = DateTime::from_timestamp_micros(created_at)
        .ok_or_else(|| ActivityLogError::Database("timestamp out of range".into()))?;
    let event_type = event_type
        .parse()
        .map_err(ActivityLogError::Database)?;
    let old_state = serde_json::from_str(&old_state)
        .map_err(|e| ActivityLogError::Database(e.to_string()))?;
    let new_state = serde_json::from_str(&new_state)
        .map_err(|e| ActivityLogError::Database(e.to_string()))?;
    Ok(ActivityRecord {
        id: tessera_activity::ActivityId(id),
        created_at,
        username,
        event_type,
        old_state,
        new_state,
        entity_id: EntityId(entity_id),
    })
}
