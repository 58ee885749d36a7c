//! Stock models: boxes and the base-scoped resources they reference

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle state of a box
///
/// Must always agree with the box's most recent open shipment detail (or
/// the absence of one).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BoxState {
    InStock,
    MarkedForShipment,
    Receiving,
    Lost,
    Donated,
    Scrap,
    /// Transitional state while a received box awaits reconciliation
    Received,
}

impl BoxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BoxState::InStock => "in_stock",
            BoxState::MarkedForShipment => "marked_for_shipment",
            BoxState::Receiving => "receiving",
            BoxState::Lost => "lost",
            BoxState::Donated => "donated",
            BoxState::Scrap => "scrap",
            BoxState::Received => "received",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "in_stock" => Some(BoxState::InStock),
            "marked_for_shipment" => Some(BoxState::MarkedForShipment),
            "receiving" => Some(BoxState::Receiving),
            "lost" => Some(BoxState::Lost),
            "donated" => Some(BoxState::Donated),
            "scrap" => Some(BoxState::Scrap),
            "received" => Some(BoxState::Received),
            _ => None,
        }
    }
}

/// A physical container of items with a unique label identifier
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct StockBox {
    pub id: i64,
    pub label_identifier: String,
    pub product_id: i64,
    pub location_id: i64,
    pub size_id: i64,
    pub number_of_items: i32,
    pub state: BoxState,
    pub comment: Option<String>,
    pub created_by: i64,
    pub created_on: DateTime<Utc>,
    pub last_modified_by: Option<i64>,
    pub last_modified_on: Option<DateTime<Utc>>,
    pub deleted_on: Option<DateTime<Utc>>,
}

/// A storage location within a base
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Location {
    pub id: i64,
    pub base_id: i64,
    pub name: String,
    pub deleted_on: Option<DateTime<Utc>>,
}

/// A product in a base's catalog
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Product {
    pub id: i64,
    pub base_id: i64,
    pub name: String,
    pub deleted_on: Option<DateTime<Utc>>,
}

/// A size option for boxed goods
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Size {
    pub id: i64,
    pub label: String,
}

/// A base-scoped tag assignable to boxes; tags must never leak across
/// organisations when a box is received elsewhere
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Tag {
    pub id: i64,
    pub base_id: i64,
    pub name: String,
    pub deleted_on: Option<DateTime<Utc>>,
}
