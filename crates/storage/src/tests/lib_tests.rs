use super::*;
use chrono::TimeZone;

fn owner() -> PeerId {
    PeerId::new("shoe@gmail.com")
}

fn peer() -> PeerId {
    PeerId::new("socks@gmail.com")
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let store = DeviceStore::new("sqlite::memory:").await.expect("db");
    store.health_check().await.expect("health check");
}

#[tokio::test]
async fn hidden_overlay_round_trips_and_stays_scoped_to_owner() {
    let store = DeviceStore::new("sqlite::memory:").await.expect("db");
    store
        .record_hidden(&owner(), &[MessageId("m1".into()), MessageId("m2".into())])
        .await
        .expect("record");

    let hidden = store.hidden_ids(&owner()).await.expect("load");
    assert_eq!(hidden.len(), 2);
    assert!(hidden.contains(&MessageId("m1".into())));

    let other = store.hidden_ids(&peer()).await.expect("load other owner");
    assert!(other.is_empty());
}

#[tokio::test]
async fn rehiding_an_id_is_idempotent() {
    let store = DeviceStore::new("sqlite::memory:").await.expect("db");
    store
        .record_hidden(&owner(), &[MessageId("m1".into())])
        .await
        .expect("first");
    store
        .record_hidden(&owner(), &[MessageId("m1".into())])
        .await
        .expect("second");

    let hidden = store.hidden_ids(&owner()).await.expect("load");
    assert_eq!(hidden.len(), 1);
}

#[tokio::test]
async fn last_seen_keeps_the_newest_timestamp() {
    let store = DeviceStore::new("sqlite::memory:").await.expect("db");
    let newer = Utc.with_ymd_and_hms(2024, 5, 2, 12, 0, 0).unwrap();
    let older = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

    store
        .record_last_seen(&owner(), &peer(), newer)
        .await
        .expect("newer");
    store
        .record_last_seen(&owner(), &peer(), older)
        .await
        .expect("older");

    let cached = store.last_seen(&owner(), &peer()).await.expect("load");
    assert_eq!(cached, Some(newer));
}

#[tokio::test]
async fn last_seen_is_none_for_unknown_peer() {
    let store = DeviceStore::new("sqlite::memory:").await.expect("db");
    let cached = store.last_seen(&owner(), &peer()).await.expect("load");
    assert_eq!(cached, None);
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let temp_root = std::env::temp_dir().join(format!("device_store_test_{suffix}"));
    let db_path = temp_root.join("nested").join("device.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let store = DeviceStore::new(&database_url).await.expect("db");
    drop(store);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );

    std::fs::remove_dir_all(temp_root).expect("cleanup");
}
