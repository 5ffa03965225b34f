//! Idempotent identity materializer.
//!
//! Turns an identity payload into a local upsert keyed by the payload's
//! subject id. The payload is treated as the current state of the subject,
//! never as a delta: present fields overwrite, absent fields are kept. No
//! wall-clock reads happen here, so applying the same payload any number of
//! times converges on the same record.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::bus::Payload;
use crate::storage::{IdentityStore, StorageError};

/// Local denormalized copy of an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityRecord {
    pub id: String,
    pub email: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl IdentityRecord {
    /// The record as an envelope payload.
    pub fn to_payload(&self) -> Payload {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Payload::new(),
        }
    }
}

/// Errors raised while materializing a payload.
#[derive(Debug, thiserror::Error)]
pub enum MaterializeError {
    #[error("Payload has no subject id")]
    MissingSubjectId,

    #[error("Payload field '{field}' has an invalid value")]
    InvalidField { field: &'static str },

    #[error("Identity {id} is unknown locally and the payload has no '{field}'")]
    Incomplete { id: String, field: &'static str },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Fields extracted from a payload before merging.
struct IdentityFields {
    id: String,
    email: Option<String>,
    display_name: Option<String>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
}

impl IdentityFields {
    fn parse(payload: &Payload) -> Result<Self, MaterializeError> {
        let id = match payload.get("id") {
            Some(Value::String(id)) if !id.trim().is_empty() => id.clone(),
            _ => return Err(MaterializeError::MissingSubjectId),
        };

        Ok(Self {
            id,
            email: string_field(payload, "email")?,
            display_name: string_field(payload, "displayName")?,
            created_at: timestamp_field(payload, "createdAt")?,
            updated_at: timestamp_field(payload, "updatedAt")?,
        })
    }

    /// Merge over `existing`, last write wins on present fields.
    fn merge(self, existing: Option<IdentityRecord>) -> Result<IdentityRecord, MaterializeError> {
        let updated_at = self.updated_at.or(self.created_at);

        match existing {
            Some(mut record) => {
                if let Some(email) = self.email {
                    record.email = email;
                }
                if let Some(display_name) = self.display_name {
                    record.display_name = display_name;
                }
                if self.created_at.is_some() {
                    record.created_at = self.created_at;
                }
                if updated_at.is_some() {
                    record.updated_at = updated_at;
                }
                Ok(record)
            }
            None => {
                let email = self.email.ok_or_else(|| MaterializeError::Incomplete {
                    id: self.id.clone(),
                    field: "email",
                })?;
                let display_name =
                    self.display_name
                        .ok_or_else(|| MaterializeError::Incomplete {
                            id: self.id.clone(),
                            field: "displayName",
                        })?;

                Ok(IdentityRecord {
                    id: self.id,
                    email,
                    display_name,
                    created_at: self.created_at,
                    updated_at,
                })
            }
        }
    }
}

fn string_field(payload: &Payload, field: &'static str) -> Result<Option<String>, MaterializeError> {
    match payload.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(_) => Err(MaterializeError::InvalidField { field }),
    }
}

fn timestamp_field(
    payload: &Payload,
    field: &'static str,
) -> Result<Option<DateTime<Utc>>, MaterializeError> {
    string_field(payload, field)?
        .map(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|_| MaterializeError::InvalidField { field })
        })
        .transpose()
}

/// Applies identity payloads to a local store.
#[derive(Clone)]
pub struct IdentityMaterializer {
    store: Arc<dyn IdentityStore>,
}

impl IdentityMaterializer {
    pub fn new(store: Arc<dyn IdentityStore>) -> Self {
        Self { store }
    }

    /// Upsert the subject described by `payload` and return the stored record.
    pub async fn materialize(&self, payload: &Payload) -> Result<IdentityRecord, MaterializeError> {
        let fields = IdentityFields::parse(payload)?;
        let existing = self.store.find_by_id(&fields.id).await?;
        let is_new = existing.is_none();

        let record = fields.merge(existing)?;
        self.store.upsert(&record).await?;

        debug!(id = %record.id, new = is_new, "Materialized identity");
        Ok(record)
    }
}
