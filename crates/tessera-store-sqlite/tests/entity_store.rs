use tessera_storage::{EntityId, EntityOddrn, EntityStore, NewEntity, StoreError};
use tessera_store_sqlite::SqliteStore;

#[tokio::test]
async fn ids_and_oddrns_resolve_both_ways() {
    let store = SqliteStore::open_in_memory().await.unwrap();
    let id = store
        .insert_entity(&NewEntity::discovered("//warehouse/orders"))
        .await
        .unwrap();

    assert_eq!(
        store.oddrn_by_id(id).await.unwrap(),
        EntityOddrn::from("//warehouse/orders")
    );
    assert_eq!(
        store
            .id_by_oddrn(&EntityOddrn::from("//warehouse/orders"))
            .await
            .unwrap(),
        id
    );
}

#[tokio::test]
async fn manually_created_flag_reflects_the_seeded_value() {
    let store = SqliteStore::open_in_memory().await.unwrap();
    store
        .insert_entity(&NewEntity::manually_created("manual"))
        .await
        .unwrap();
    store
        .insert_entity(&NewEntity::discovered("ingested"))
        .await
        .unwrap();

    assert!(store
        .is_manually_created(&EntityOddrn::from("manual"))
        .await
        .unwrap());
    assert!(!store
        .is_manually_created(&EntityOddrn::from("ingested"))
        .await
        .unwrap());
}

#[tokio::test]
async fn unknown_entities_are_not_found() {
    let store = SqliteStore::open_in_memory().await.unwrap();

    assert!(matches!(
        store.oddrn_by_id(EntityId(42)).await.unwrap_err(),
        StoreError::NotFound
    ));
    assert!(matches!(
        store.id_by_oddrn(&EntityOddrn::from("ghost")).await.unwrap_err(),
        StoreError::NotFound
    ));
    assert!(matches!(
        store
            .is_manually_created(&EntityOddrn::from("ghost"))
            .await
            .unwrap_err(),
        StoreError::NotFound
    ));
}
