//! SQLite IdentityStore implementation.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sea_query::{Expr, OnConflict, Query, SqliteQueryBuilder};
use sqlx::{Row, SqlitePool};

use crate::materializer::IdentityRecord;
use crate::storage::schema::{Identities, CREATE_IDENTITIES_TABLE};
use crate::storage::{IdentityStore, Result, StorageError};

/// SQLite implementation of IdentityStore.
pub struct SqliteIdentityStore {
    pool: SqlitePool,
}

impl SqliteIdentityStore {
    /// Create a new SQLite identity store.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(CREATE_IDENTITIES_TABLE)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn encode_timestamp(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(|t| t.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

fn decode_timestamp(column: &'static str, value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value
        .map(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|_| StorageError::InvalidTimestamp { column, value: raw })
        })
        .transpose()
}

#[async_trait]
impl IdentityStore for SqliteIdentityStore {
    async fn find_by_id(&self, id: &str) -> Result<Option<IdentityRecord>> {
        let query = Query::select()
            .columns([
                Identities::Id,
                Identities::Email,
                Identities::DisplayName,
                Identities::CreatedAt,
                Identities::UpdatedAt,
            ])
            .from(Identities::Table)
            .and_where(Expr::col(Identities::Id).eq(id))
            .to_string(SqliteQueryBuilder);

        let Some(row) = sqlx::query(&query).fetch_optional(&self.pool).await? else {
            return Ok(None);
        };

        Ok(Some(IdentityRecord {
            id: row.get("id"),
            email: row.get("email"),
            display_name: row.get("display_name"),
            created_at: decode_timestamp("created_at", row.get("created_at"))?,
            updated_at: decode_timestamp("updated_at", row.get("updated_at"))?,
        }))
    }

    async fn upsert(&self, record: &IdentityRecord) -> Result<()> {
        let query = Query::insert()
            .into_table(Identities::Table)
            .columns([
                Identities::Id,
                Identities::Email,
                Identities::DisplayName,
                Identities::CreatedAt,
                Identities::UpdatedAt,
            ])
            .values_panic([
                record.id.as_str().into(),
                record.email.as_str().into(),
                record.display_name.as_str().into(),
                encode_timestamp(record.created_at).into(),
                encode_timestamp(record.updated_at).into(),
            ])
            .on_conflict(
                OnConflict::column(Identities::Id)
                    .update_columns([
                        Identities::Email,
                        Identities::DisplayName,
                        Identities::CreatedAt,
                        Identities::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;

        Ok(())
    }
}
