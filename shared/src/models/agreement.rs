//! Transfer agreement models
//!
//! A transfer agreement is an org-to-org contract to exchange goods. It is
//! created once and only transitions forward (never reopened).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle state of a transfer agreement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransferAgreementState {
    UnderReview,
    Accepted,
    Rejected,
    Canceled,
    Expired,
}

impl TransferAgreementState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferAgreementState::UnderReview => "under_review",
            TransferAgreementState::Accepted => "accepted",
            TransferAgreementState::Rejected => "rejected",
            TransferAgreementState::Canceled => "canceled",
            TransferAgreementState::Expired => "expired",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "under_review" => Some(TransferAgreementState::UnderReview),
            "accepted" => Some(TransferAgreementState::Accepted),
            "rejected" => Some(TransferAgreementState::Rejected),
            "canceled" => Some(TransferAgreementState::Canceled),
            "expired" => Some(TransferAgreementState::Expired),
            _ => None,
        }
    }
}

/// Direction of goods movement authorised by an agreement, as seen from the
/// initiating organisation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransferAgreementType {
    SendingTo,
    ReceivingFrom,
    Bidirectional,
}

impl TransferAgreementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferAgreementType::SendingTo => "sending_to",
            TransferAgreementType::ReceivingFrom => "receiving_from",
            TransferAgreementType::Bidirectional => "bidirectional",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "sending_to" => Some(TransferAgreementType::SendingTo),
            "receiving_from" => Some(TransferAgreementType::ReceivingFrom),
            "bidirectional" => Some(TransferAgreementType::Bidirectional),
            _ => None,
        }
    }
}

/// An org-to-org contract to exchange goods between bases
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct TransferAgreement {
    pub id: i64,
    pub source_organisation_id: i64,
    pub target_organisation_id: i64,
    pub agreement_type: TransferAgreementType,
    pub state: TransferAgreementState,
    pub valid_from: DateTime<Utc>,
    pub valid_until: Option<DateTime<Utc>>,
    pub requested_by: i64,
    pub requested_on: DateTime<Utc>,
    pub accepted_by: Option<i64>,
    pub accepted_on: Option<DateTime<Utc>>,
    pub terminated_by: Option<i64>,
    pub terminated_on: Option<DateTime<Utc>>,
    pub comment: Option<String>,
}

impl TransferAgreement {
    /// The organisation whose members may accept or reject the agreement.
    /// For `ReceivingFrom` that is the source side (the partner was asked to
    /// send goods); otherwise the target side.
    pub fn reviewing_organisation_id(&self) -> i64 {
        match self.agreement_type {
            TransferAgreementType::ReceivingFrom => self.source_organisation_id,
            _ => self.target_organisation_id,
        }
    }

    pub fn involves_organisation(&self, organisation_id: i64) -> bool {
        self.source_organisation_id == organisation_id
            || self.target_organisation_id == organisation_id
    }
}

/// One (source base, target base) pair covered by an agreement
///
/// A null base id is the legacy wildcard meaning "all bases, including
/// future ones, of that organisation". Newly created agreements always
/// enumerate a concrete, closed snapshot of base ids.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct TransferAgreementDetail {
    pub id: i64,
    pub transfer_agreement_id: i64,
    pub source_base_id: Option<i64>,
    pub target_base_id: Option<i64>,
}
