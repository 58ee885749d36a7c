//! Audit history sink
//!
//! Every mutation of an audited entity records one immutable history entry
//! per changed field, inside the same transaction as the mutation itself.
//! The diff-and-record step is explicit: callers hand over the before/after
//! JSON representation of the record.

use chrono::Utc;
use serde_json::Value;
use sqlx::PgConnection;
use uuid::Uuid;

use crate::error::AppResult;

/// Serialize a record into its audit JSON representation
pub fn snapshot<T: serde::Serialize>(record: &T) -> AppResult<Value> {
    serde_json::to_value(record).map_err(|e| crate::error::AppError::InternalError(e.into()))
}

/// History service writing immutable audit entries
pub struct HistoryService;

impl HistoryService {
    /// Compare two JSON representations of a record and write one history
    /// entry per changed field, attributed to `actor_id`
    pub async fn diff_and_record(
        conn: &mut PgConnection,
        table_name: &str,
        record_id: i64,
        actor_id: i64,
        before: &Value,
        after: &Value,
    ) -> AppResult<()> {
        let empty = serde_json::Map::new();
        let before_fields = before.as_object().unwrap_or(&empty);
        let after_fields = after.as_object().unwrap_or(&empty);

        for (field, new_value) in after_fields {
            let old_value = before_fields.get(field).unwrap_or(&Value::Null);
            if old_value != new_value {
                Self::record(conn, table_name, record_id, actor_id, field, old_value, new_value)
                    .await?;
            }
        }

        Ok(())
    }

    /// Record the creation of a record: one entry per non-null field
    pub async fn record_creation(
        conn: &mut PgConnection,
        table_name: &str,
        record_id: i64,
        actor_id: i64,
        record: &Value,
    ) -> AppResult<()> {
        Self::diff_and_record(conn, table_name, record_id, actor_id, &Value::Null, record).await
    }

    /// Persist a single immutable audit entry
    pub async fn record(
        conn: &mut PgConnection,
        table_name: &str,
        record_id: i64,
        actor_id: i64,
        changed_field: &str,
        from_value: &Value,
        to_value: &Value,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO history (id, table_name, record_id, changed_field, from_value, to_value, changed_by, changed_on)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(table_name)
        .bind(record_id)
        .bind(changed_field)
        .bind(from_value)
        .bind(to_value)
        .bind(actor_id)
        .bind(Utc::now())
        .execute(conn)
        .await?;

        Ok(())
    }
}
