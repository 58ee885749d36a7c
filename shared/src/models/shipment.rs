//! Shipment models
//!
//! A shipment is one directional movement of boxes between two specific
//! bases under an accepted transfer agreement. Per-box participation is
//! tracked in [`ShipmentDetail`] rows which are soft-closed (removed, lost
//! or received), never hard-deleted, to preserve the audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle state of a shipment
///
/// The only reachable forward path is Preparing → Sent → Receiving →
/// Completed | Lost. Canceled is reachable only from Preparing, and Lost
/// also directly from Sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ShipmentState {
    Preparing,
    Sent,
    Receiving,
    Completed,
    Lost,
    Canceled,
}

impl ShipmentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShipmentState::Preparing => "preparing",
            ShipmentState::Sent => "sent",
            ShipmentState::Receiving => "receiving",
            ShipmentState::Completed => "completed",
            ShipmentState::Lost => "lost",
            ShipmentState::Canceled => "canceled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "preparing" => Some(ShipmentState::Preparing),
            "sent" => Some(ShipmentState::Sent),
            "receiving" => Some(ShipmentState::Receiving),
            "completed" => Some(ShipmentState::Completed),
            "lost" => Some(ShipmentState::Lost),
            "canceled" => Some(ShipmentState::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ShipmentState::Completed | ShipmentState::Lost | ShipmentState::Canceled
        )
    }
}

/// One directional movement of boxes between two bases
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Shipment {
    pub id: i64,
    pub source_base_id: i64,
    pub target_base_id: i64,
    pub transfer_agreement_id: i64,
    pub state: ShipmentState,
    pub started_by: i64,
    pub started_on: DateTime<Utc>,
    pub sent_by: Option<i64>,
    pub sent_on: Option<DateTime<Utc>>,
    pub receiving_started_by: Option<i64>,
    pub receiving_started_on: Option<DateTime<Utc>>,
    pub completed_by: Option<i64>,
    pub completed_on: Option<DateTime<Utc>>,
    pub canceled_by: Option<i64>,
    pub canceled_on: Option<DateTime<Utc>>,
}

/// One box's participation record within a shipment
///
/// A detail is "open" while `removed_on`, `lost_on` and `received_on` are
/// all null; a box may have at most one open detail at any time.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ShipmentDetail {
    pub id: i64,
    pub shipment_id: i64,
    pub box_id: i64,
    pub source_product_id: i64,
    pub source_location_id: i64,
    pub source_size_id: i64,
    pub target_product_id: Option<i64>,
    pub target_location_id: Option<i64>,
    pub target_size_id: Option<i64>,
    pub created_by: i64,
    pub created_on: DateTime<Utc>,
    pub removed_by: Option<i64>,
    pub removed_on: Option<DateTime<Utc>>,
    pub lost_by: Option<i64>,
    pub lost_on: Option<DateTime<Utc>>,
    pub received_by: Option<i64>,
    pub received_on: Option<DateTime<Utc>>,
}

impl ShipmentDetail {
    pub fn is_open(&self) -> bool {
        self.removed_on.is_none() && self.lost_on.is_none() && self.received_on.is_none()
    }
}
