//! IdentityStore interface tests.
//!
//! These tests verify the contract of the IdentityStore trait.
//! Each storage implementation should run these tests.

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use courier::materializer::IdentityRecord;
use courier::storage::IdentityStore;

/// Unique id so tests can share one database.
pub fn test_id(name: &str) -> String {
    format!("test_{}_{}", name, Uuid::new_v4())
}

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0)
        .single()
        .expect("valid timestamp")
}

pub fn make_record(id: &str, email: &str, display_name: &str) -> IdentityRecord {
    IdentityRecord {
        id: id.to_string(),
        email: email.to_string(),
        display_name: display_name.to_string(),
        created_at: Some(at(0)),
        updated_at: Some(at(0)),
    }
}

// =============================================================================
// IdentityStore::find_by_id tests
// =============================================================================

pub async fn test_find_nonexistent<S: IdentityStore + ?Sized>(store: &S) {
    let found = store
        .find_by_id(&test_id("missing"))
        .await
        .expect("find should succeed");
    assert!(found.is_none(), "unknown id should be None");
}

pub async fn test_find_preserves_fields<S: IdentityStore + ?Sized>(store: &S) {
    let id = test_id("fields");
    let record = IdentityRecord {
        id: id.clone(),
        email: "o'brien@example.com".to_string(),
        display_name: "Ünïcödé Näme".to_string(),
        created_at: Some(at(1)),
        updated_at: Some(at(2)),
    };

    store.upsert(&record).await.expect("upsert should succeed");

    let found = store
        .find_by_id(&id)
        .await
        .expect("find should succeed")
        .expect("record should exist");
    assert_eq!(found, record);
}

pub async fn test_find_without_timestamps<S: IdentityStore + ?Sized>(store: &S) {
    let id = test_id("no_ts");
    let record = IdentityRecord {
        created_at: None,
        updated_at: None,
        ..make_record(&id, "a@b.com", "A")
    };

    store.upsert(&record).await.expect("upsert should succeed");

    let found = store
        .find_by_id(&id)
        .await
        .expect("find should succeed")
        .expect("record should exist");
    assert!(found.created_at.is_none());
    assert!(found.updated_at.is_none());
}

// =============================================================================
// IdentityStore::upsert tests
// =============================================================================

pub async fn test_upsert_is_idempotent<S: IdentityStore + ?Sized>(store: &S) {
    let id = test_id("idempotent");
    let record = make_record(&id, "a@b.com", "A");

    store.upsert(&record).await.expect("first upsert");
    store.upsert(&record).await.expect("second upsert");

    let found = store.find_by_id(&id).await.expect("find").expect("exists");
    assert_eq!(found, record, "repeating an upsert must not change the row");
}

pub async fn test_upsert_last_write_wins<S: IdentityStore + ?Sized>(store: &S) {
    let id = test_id("lww");
    store
        .upsert(&make_record(&id, "old@b.com", "Old"))
        .await
        .expect("first upsert");

    let newer = IdentityRecord {
        updated_at: Some(at(60)),
        ..make_record(&id, "new@b.com", "New")
    };
    store.upsert(&newer).await.expect("second upsert");

    let found = store.find_by_id(&id).await.expect("find").expect("exists");
    assert_eq!(found.email, "new@b.com");
    assert_eq!(found.display_name, "New");
    assert_eq!(found.updated_at, Some(at(60)));
}

pub async fn test_upsert_keeps_records_separate<S: IdentityStore + ?Sized>(store: &S) {
    let first = test_id("first");
    let second = test_id("second");
    store
        .upsert(&make_record(&first, "one@b.com", "One"))
        .await
        .expect("upsert first");
    store
        .upsert(&make_record(&second, "two@b.com", "Two"))
        .await
        .expect("upsert second");

    let one = store.find_by_id(&first).await.expect("find").expect("exists");
    let two = store.find_by_id(&second).await.expect("find").expect("exists");
    assert_eq!(one.email, "one@b.com");
    assert_eq!(two.email, "two@b.com");
}

/// Run every IdentityStore contract test against `$store`.
#[macro_export]
macro_rules! run_identity_store_tests {
    ($store:expr) => {
        use $crate::storage::identity_store_tests::*;

        // find_by_id tests
        test_find_nonexistent($store).await;
        println!("  test_find_nonexistent: PASSED");

        test_find_preserves_fields($store).await;
        println!("  test_find_preserves_fields: PASSED");

        test_find_without_timestamps($store).await;
        println!("  test_find_without_timestamps: PASSED");

        // upsert tests
        test_upsert_is_idempotent($store).await;
        println!("  test_upsert_is_idempotent: PASSED");

        test_upsert_last_write_wins($store).await;
        println!("  test_upsert_last_write_wins: PASSED");

        test_upsert_keeps_records_separate($store).await;
        println!("  test_upsert_keeps_records_separate: PASSED");
    };
}
