use std::sync::Arc;

use tessera_hierarchy::{HierarchyEngine, HierarchyError};
use tessera_storage::{EntityId, EntityOddrn, EntityStore, GroupRelation, NewEntity, RelationStore};
use tessera_store_sqlite::SqliteStore;

async fn store() -> Arc<SqliteStore> {
    Arc::new(SqliteStore::open_in_memory().await.unwrap())
}

fn engine(store: &Arc<SqliteStore>) -> HierarchyEngine {
    HierarchyEngine::new(store.clone(), store.clone())
}

async fn seed_entity(store: &SqliteStore, oddrn: &str) -> EntityId {
    store
        .insert_entity(&NewEntity::discovered(oddrn).internal_name(oddrn))
        .await
        .unwrap()
}

fn edge(group: &str, member: &str) -> GroupRelation {
    GroupRelation::new(EntityOddrn::from(group), EntityOddrn::from(member))
}

fn oddrns(names: &[&str]) -> std::collections::HashSet<EntityOddrn> {
    names.iter().map(|n| EntityOddrn::from(*n)).collect()
}

#[tokio::test]
async fn descendants_follow_nested_groups() {
    let store = store().await;
    let a = seed_entity(&store, "a").await;
    for name in ["b", "c", "d"] {
        seed_entity(&store, name).await;
    }
    store
        .create_relations(&[edge("a", "b"), edge("a", "c"), edge("b", "d")])
        .await
        .unwrap();

    let engine = engine(&store);
    assert_eq!(
        engine.descendants_of(a).await.unwrap(),
        oddrns(&["b", "c", "d"])
    );
}

#[tokio::test]
async fn diamond_membership_is_deduplicated() {
    let store = store().await;
    let a = seed_entity(&store, "a").await;
    for name in ["b", "c", "d"] {
        seed_entity(&store, name).await;
    }
    // d is reachable through both b and c
    store
        .create_relations(&[
            edge("a", "b"),
            edge("a", "c"),
            edge("b", "d"),
            edge("c", "d"),
        ])
        .await
        .unwrap();

    let engine = engine(&store);
    let descendants = engine.descendants_of(a).await.unwrap();
    assert_eq!(descendants, oddrns(&["b", "c", "d"]));
}

#[tokio::test]
async fn cyclic_edges_terminate() {
    let store = store().await;
    let a = seed_entity(&store, "a").await;
    seed_entity(&store, "b").await;
    store
        .create_relations(&[edge("a", "b"), edge("b", "a")])
        .await
        .unwrap();

    let engine = engine(&store);
    // the root shows up because the cycle makes it a member of b
    assert_eq!(engine.descendants_of(a).await.unwrap(), oddrns(&["a", "b"]));
}

#[tokio::test]
async fn has_members_is_direct_only() {
    let store = store().await;
    let a = seed_entity(&store, "a").await;
    let b = seed_entity(&store, "b").await;
    seed_entity(&store, "c").await;
    store
        .create_relations(&[edge("a", "b"), edge("b", "c")])
        .await
        .unwrap();

    let engine = engine(&store);
    assert!(engine.has_members(a).await.unwrap());
    assert!(engine.has_members(b).await.unwrap());
    let c = store.id_by_oddrn(&EntityOddrn::from("c")).await.unwrap();
    assert!(!engine.has_members(c).await.unwrap());
}

#[tokio::test]
async fn pages_concatenate_members_then_upper_groups() {
    let store = store().await;
    let g = seed_entity(&store, "g").await;
    for name in ["m1", "m2", "m3", "u1", "u2"] {
        seed_entity(&store, name).await;
    }
    store
        .create_relations(&[
            edge("g", "m1"),
            edge("g", "m2"),
            edge("g", "m3"),
            edge("u1", "g"),
            edge("u2", "g"),
        ])
        .await
        .unwrap();

    let engine = engine(&store);

    // entity row ids descend, so newest-seeded entities come first per bucket
    let page1 = engine.page_members(g, 1, 2, None).await.unwrap();
    assert_eq!(page1.total_members, 3);
    assert_eq!(page1.total_upper_groups, 2);
    let names: Vec<&str> = page1.items.iter().map(|i| i.oddrn.as_str()).collect();
    assert_eq!(names, ["m3", "m2"]);
    assert!(page1.items.iter().all(|i| !i.is_upper_group));

    // page straddling the bucket boundary
    let page2 = engine.page_members(g, 2, 2, None).await.unwrap();
    let names: Vec<&str> = page2.items.iter().map(|i| i.oddrn.as_str()).collect();
    assert_eq!(names, ["m1", "u2"]);
    assert_eq!(
        page2.items.iter().map(|i| i.is_upper_group).collect::<Vec<_>>(),
        [false, true]
    );

    // page entirely inside the second bucket
    let page3 = engine.page_members(g, 3, 2, None).await.unwrap();
    let names: Vec<&str> = page3.items.iter().map(|i| i.oddrn.as_str()).collect();
    assert_eq!(names, ["u1"]);
    assert!(page3.items[0].is_upper_group);

    // past the end
    let page4 = engine.page_members(g, 4, 2, None).await.unwrap();
    assert!(page4.items.is_empty());
}

#[tokio::test]
async fn prefix_filters_both_buckets_by_name() {
    let store = store().await;
    let g = seed_entity(&store, "g").await;
    store
        .insert_entity(&NewEntity::discovered("m1").internal_name("sales_orders"))
        .await
        .unwrap();
    store
        .insert_entity(&NewEntity::discovered("m2").internal_name("inventory"))
        .await
        .unwrap();
    store
        .insert_entity(&NewEntity::discovered("u1").external_name("sales_mart"))
        .await
        .unwrap();
    store
        .create_relations(&[edge("g", "m1"), edge("g", "m2"), edge("u1", "g")])
        .await
        .unwrap();

    let engine = engine(&store);
    let page = engine.page_members(g, 1, 10, Some("sales")).await.unwrap();
    assert_eq!(page.total_members, 1);
    assert_eq!(page.total_upper_groups, 1);
    let names: Vec<&str> = page.items.iter().map(|i| i.oddrn.as_str()).collect();
    assert_eq!(names, ["m1", "u1"]);

    // prefix matching ignores case
    let page = engine.page_members(g, 1, 10, Some("Sales")).await.unwrap();
    assert_eq!(page.total_members, 1);
    assert_eq!(page.total_upper_groups, 1);

    assert_eq!(engine.count_members(g, Some("inv")).await.unwrap(), 1);
    assert_eq!(engine.count_members(g, Some("INV")).await.unwrap(), 1);
    assert_eq!(engine.count_upper_groups(g, Some("inv")).await.unwrap(), 0);
}

#[tokio::test]
async fn zero_page_and_size_are_rejected() {
    let store = store().await;
    let g = seed_entity(&store, "g").await;
    let engine = engine(&store);

    for (page, size) in [(0, 10), (1, 0)] {
        let err = engine.page_members(g, page, size, None).await.unwrap_err();
        assert!(matches!(err, HierarchyError::InvalidRequest(_)));
    }
}

#[tokio::test]
async fn unknown_group_is_not_found() {
    let store = store().await;
    let engine = engine(&store);
    let err = engine.descendants_of(EntityId(999)).await.unwrap_err();
    assert!(matches!(
        err,
        HierarchyError::Store(tessera_storage::StoreError::NotFound)
    ));
}
