use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;

use tessera_activity::{
    ActivityCursor, ActivityEventType, ActivityFilter, ActivityLog, ActivityScope, NewActivity,
};
use tessera_storage::{EntityId, EntityOddrn, NewEntity, OwnerId};
use tessera_store_sqlite::SqliteStore;

async fn store() -> SqliteStore {
    SqliteStore::open_in_memory().await.unwrap()
}

fn t(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, minute, 0).unwrap()
}

fn activity(entity: i64, created_at: DateTime<Utc>) -> NewActivity {
    NewActivity {
        created_at,
        username: Some("alice".into()),
        event_type: ActivityEventType::DescriptionUpdated,
        old_state: json!({ "description": "old" }),
        new_state: json!({ "description": "new" }),
        entity_id: EntityId(entity),
    }
}

fn day_filter() -> ActivityFilter {
    ActivityFilter::new(t(0), t(59))
}

#[tokio::test]
async fn append_assigns_ids_and_round_trips() {
    let store = store().await;
    let record = store.append(activity(1, t(5))).await.unwrap();
    assert_eq!(record.created_at, t(5));
    assert_eq!(record.username.as_deref(), Some("alice"));

    let records = store.query(&day_filter(), None, None).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, record.id);
    assert_eq!(records[0].event_type, ActivityEventType::DescriptionUpdated);
    assert_eq!(records[0].old_state, json!({ "description": "old" }));
    assert_eq!(records[0].new_state, json!({ "description": "new" }));
}

#[tokio::test]
async fn query_orders_newest_first_with_id_tie_break() {
    let store = store().await;
    // two records at the same instant, one earlier
    let early = store.append(activity(1, t(1))).await.unwrap();
    let a = store.append(activity(2, t(10))).await.unwrap();
    let b = store.append(activity(3, t(10))).await.unwrap();

    let records = store.query(&day_filter(), None, None).await.unwrap();
    let ids: Vec<_> = records.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![b.id, a.id, early.id]);
    assert!(b.id > a.id);
}

#[tokio::test]
async fn cursor_resumes_strictly_after_the_last_seen_record() {
    let store = store().await;
    for minute in 1..=5 {
        store.append(activity(minute, t(minute as u32))).await.unwrap();
    }

    let first = store.query(&day_filter(), None, Some(2)).await.unwrap();
    assert_eq!(first.len(), 2);

    let cursor = ActivityCursor {
        last_id: first[1].id,
        last_created_at: first[1].created_at,
    };
    let second = store.query(&day_filter(), Some(cursor), Some(2)).await.unwrap();
    assert_eq!(second.len(), 2);
    // no overlap, strictly older
    assert!(second[0].created_at < first[1].created_at);

    let cursor = ActivityCursor {
        last_id: second[1].id,
        last_created_at: second[1].created_at,
    };
    let third = store.query(&day_filter(), Some(cursor), Some(2)).await.unwrap();
    assert_eq!(third.len(), 1);
}

#[tokio::test]
async fn cursor_breaks_ties_on_id() {
    let store = store().await;
    let a = store.append(activity(1, t(10))).await.unwrap();
    let b = store.append(activity(2, t(10))).await.unwrap();

    let cursor = ActivityCursor {
        last_id: b.id,
        last_created_at: b.created_at,
    };
    let records = store.query(&day_filter(), Some(cursor), None).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, a.id);
}

#[tokio::test]
async fn window_bounds_are_inclusive() {
    let store = store().await;
    store.append(activity(1, t(0))).await.unwrap();
    store.append(activity(2, t(30))).await.unwrap();
    store.append(activity(3, t(59))).await.unwrap();

    assert_eq!(store.count(&day_filter()).await.unwrap(), 3);
    assert_eq!(store.count(&ActivityFilter::new(t(1), t(58))).await.unwrap(), 1);
}

#[tokio::test]
async fn append_many_preserves_submission_order_across_chunks() {
    let store = store().await.with_insert_chunk_size(8);
    let batch: Vec<NewActivity> = (0..50).map(|i| activity(i, t(30))).collect();

    let records = store.append_many(batch).await.unwrap();
    assert_eq!(records.len(), 50);
    for (i, record) in records.iter().enumerate() {
        assert_eq!(record.entity_id, EntityId(i as i64));
    }
    assert!(store.append_many(Vec::new()).await.unwrap().is_empty());
}

#[tokio::test]
async fn append_many_pairs_assigned_ids_with_their_payloads() {
    let store = store().await.with_insert_chunk_size(8);
    let batch: Vec<NewActivity> = (0..30).map(|i| activity(i, t(30))).collect();

    let returned = store.append_many(batch).await.unwrap();
    assert!(returned.windows(2).all(|w| w[0].id < w[1].id));

    // the ids handed back must agree with the persisted rows, not just
    // with the submission positions
    let persisted = store.query(&day_filter(), None, Some(100)).await.unwrap();
    for record in &returned {
        let row = persisted.iter().find(|r| r.id == record.id).unwrap();
        assert_eq!(row.entity_id, record.entity_id);
    }
}

#[tokio::test]
async fn entity_dimension_filters_apply() {
    let store = store().await;
    let e1 = store
        .insert_entity(&NewEntity::discovered("e1").data_source_id(10).namespace_id(20))
        .await
        .unwrap();
    let e2 = store.insert_entity(&NewEntity::discovered("e2")).await.unwrap();
    store.set_entity_tags(e1, &[(7, "pii")]).await.unwrap();
    store.set_entity_owners(e1, &[(OwnerId(3), "team-a")]).await.unwrap();

    store.append(activity(e1.0, t(10))).await.unwrap();
    store.append(activity(e2.0, t(11))).await.unwrap();

    assert_eq!(
        store.count(&day_filter().data_source_id(10)).await.unwrap(),
        1
    );
    assert_eq!(store.count(&day_filter().namespace_id(20)).await.unwrap(), 1);
    assert_eq!(store.count(&day_filter().tag_ids(vec![7])).await.unwrap(), 1);
    assert_eq!(
        store
            .count(&day_filter().owner_ids(vec![OwnerId(3)]))
            .await
            .unwrap(),
        1
    );
    assert_eq!(store.count(&day_filter().entity_id(e2)).await.unwrap(), 1);
}

#[tokio::test]
async fn username_and_event_type_filters_apply() {
    let store = store().await;
    store.append(activity(1, t(10))).await.unwrap();
    let mut system = activity(2, t(11));
    system.username = None;
    system.event_type = ActivityEventType::TagsUpdated;
    store.append(system).await.unwrap();

    assert_eq!(
        store
            .count(&day_filter().usernames(vec!["alice".into()]))
            .await
            .unwrap(),
        1
    );
    assert_eq!(
        store
            .count(&day_filter().event_type(ActivityEventType::TagsUpdated))
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn ownership_scope_restricts_to_owned_entities() {
    let store = store().await;
    let owned = store.insert_entity(&NewEntity::discovered("owned")).await.unwrap();
    let other = store.insert_entity(&NewEntity::discovered("other")).await.unwrap();
    store
        .set_entity_owners(owned, &[(OwnerId(5), "team-b")])
        .await
        .unwrap();

    store.append(activity(owned.0, t(10))).await.unwrap();
    store.append(activity(other.0, t(11))).await.unwrap();

    let filter = day_filter().scope(ActivityScope::OwnedBy(OwnerId(5)));
    let records = store.query(&filter, None, None).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].entity_id, owned);
    assert_eq!(store.count(&filter).await.unwrap(), 1);
}

#[tokio::test]
async fn entity_set_scope_restricts_by_identifier() {
    let store = store().await;
    let e1 = store.insert_entity(&NewEntity::discovered("e1")).await.unwrap();
    let e2 = store.insert_entity(&NewEntity::discovered("e2")).await.unwrap();
    store.append(activity(e1.0, t(10))).await.unwrap();
    store.append(activity(e2.0, t(11))).await.unwrap();

    let filter = day_filter().scope(ActivityScope::Entities(vec![EntityOddrn::from("e2")]));
    let records = store.query(&filter, None, None).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].entity_id, e2);

    // an empty identifier set matches nothing
    let empty = day_filter().scope(ActivityScope::Entities(Vec::new()));
    assert_eq!(store.count(&empty).await.unwrap(), 0);
    assert!(store.query(&empty, None, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn sub_second_timestamps_survive_persistence() {
    let store = store().await;
    let at = t(10) + Duration::microseconds(123_456);
    let record = store.append(activity(1, at)).await.unwrap();
    assert_eq!(record.created_at, at);

    let records = store.query(&day_filter(), None, None).await.unwrap();
    assert_eq!(records[0].created_at, at);
}
