//! Organisation and base models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A legal entity owning zero or more bases
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Organisation {
    pub id: i64,
    pub name: String,
    pub deleted_on: Option<DateTime<Utc>>,
}

/// A warehouse/site owned by exactly one organisation
///
/// Soft-deletable; queries must filter on `deleted_on` explicitly.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Base {
    pub id: i64,
    pub organisation_id: i64,
    pub name: String,
    pub deleted_on: Option<DateTime<Utc>>,
}

impl Base {
    pub fn is_deleted(&self) -> bool {
        self.deleted_on.is_some()
    }
}
