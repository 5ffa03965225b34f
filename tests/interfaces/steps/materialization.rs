//! Materialization step definitions.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use courier::bus::Payload;
use courier::materializer::{IdentityMaterializer, IdentityRecord, MaterializeError};
use courier::storage::{IdentityStore, MemoryIdentityStore};
use cucumber::gherkin::Step;
use cucumber::{given, then, when, World};

/// Test context for materialization scenarios.
#[derive(World)]
#[world(init = Self::new)]
pub struct MaterializationWorld {
    store: Arc<MemoryIdentityStore>,
    materializer: IdentityMaterializer,
    last: Option<Result<IdentityRecord, MaterializeError>>,
}

impl std::fmt::Debug for MaterializationWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaterializationWorld")
            .field("last", &self.last)
            .finish()
    }
}

impl MaterializationWorld {
    fn new() -> Self {
        let store = Arc::new(MemoryIdentityStore::new());
        Self {
            materializer: IdentityMaterializer::new(store.clone()),
            store,
            last: None,
        }
    }

    async fn apply(&mut self, step: &Step) {
        let raw = step.docstring.as_deref().expect("step needs a JSON docstring");
        let payload: Payload = serde_json::from_str(raw).expect("docstring is a JSON object");
        self.last = Some(self.materializer.materialize(&payload).await);
    }

    async fn record(&self, id: &str) -> IdentityRecord {
        self.store
            .find_by_id(id)
            .await
            .expect("store lookup")
            .unwrap_or_else(|| panic!("no record for {id}"))
    }

    fn error(&self) -> &MaterializeError {
        match self.last.as_ref().expect("nothing was materialized") {
            Ok(record) => panic!("expected a failure, got {record:?}"),
            Err(e) => e,
        }
    }
}

fn timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .expect("valid RFC 3339 timestamp")
        .with_timezone(&Utc)
}

// ==========================================================================
// Setup
// ==========================================================================

#[given("an existing identity:")]
async fn given_existing_identity(world: &mut MaterializationWorld, step: &Step) {
    world.apply(step).await;
    assert!(
        matches!(world.last, Some(Ok(_))),
        "setup payload failed: {:?}",
        world.last
    );
}

// ==========================================================================
// Actions
// ==========================================================================

#[when("the payload is materialized:")]
async fn when_materialized(world: &mut MaterializationWorld, step: &Step) {
    world.apply(step).await;
}

#[when("the payload is materialized again:")]
async fn when_materialized_again(world: &mut MaterializationWorld, step: &Step) {
    world.apply(step).await;
}

// ==========================================================================
// Outcomes
// ==========================================================================

#[then(expr = "the store holds {int} record(s)")]
async fn then_store_count(world: &mut MaterializationWorld, count: usize) {
    assert_eq!(world.store.len().await, count);
}

#[then(expr = "identity {string} has email {string} and name {string}")]
async fn then_identity_fields(
    world: &mut MaterializationWorld,
    id: String,
    email: String,
    display_name: String,
) {
    let record = world.record(&id).await;
    assert_eq!(record.email, email);
    assert_eq!(record.display_name, display_name);
}

#[then(expr = "identity {string} was last updated at {string}")]
async fn then_updated_at(world: &mut MaterializationWorld, id: String, at: String) {
    assert_eq!(world.record(&id).await.updated_at, Some(timestamp(&at)));
}

#[then("materialization fails because the subject id is missing")]
async fn then_missing_id(world: &mut MaterializationWorld) {
    assert!(matches!(world.error(), MaterializeError::MissingSubjectId));
}

#[then(expr = "materialization fails because {string} is unknown without {string}")]
async fn then_incomplete(world: &mut MaterializationWorld, id: String, field: String) {
    match world.error() {
        MaterializeError::Incomplete {
            id: failed_id,
            field: failed_field,
        } => {
            assert_eq!(failed_id, &id);
            assert_eq!(*failed_field, field.as_str());
        }
        other => panic!("expected Incomplete, got {other:?}"),
    }
}

#[then(expr = "materialization fails because {string} is invalid")]
async fn then_invalid_field(world: &mut MaterializationWorld, field: String) {
    match world.error() {
        MaterializeError::InvalidField { field: failed } => assert_eq!(*failed, field.as_str()),
        other => panic!("expected InvalidField, got {other:?}"),
    }
}
