//! Pure business-rule helpers for agreements and shipments
//!
//! Everything in this module is side-effect free; the backend services call
//! these helpers before (or while) mutating state, and the test suite
//! exercises them directly.

use std::collections::HashSet;

use chrono::{DateTime, NaiveDate, Utc};

use crate::models::{BoxState, ShipmentState, TransferAgreementState, TransferAgreementType};

// ============================================================================
// Agreement validations
// ============================================================================

/// Validate that an agreement's validity window ends strictly after it
/// starts (date granularity)
pub fn validate_agreement_window(
    valid_from: DateTime<Utc>,
    valid_until: Option<DateTime<Utc>>,
) -> Result<(), &'static str> {
    if let Some(until) = valid_until {
        if until.date_naive() <= valid_from.date_naive() {
            return Err("Agreement validity window must end after it starts");
        }
    }
    Ok(())
}

/// Whether an existing validity window fully contains a new one
///
/// An open-ended existing window (`existing_until == None`) contains every
/// later-starting window; an open-ended new window is only contained by an
/// open-ended existing one.
pub fn window_contains(
    existing_from: DateTime<Utc>,
    existing_until: Option<DateTime<Utc>>,
    new_from: DateTime<Utc>,
    new_until: Option<DateTime<Utc>>,
) -> bool {
    if new_from < existing_from {
        return false;
    }
    match existing_until {
        None => true,
        Some(existing_until) => match new_until {
            Some(new_until) => new_until <= existing_until,
            None => false,
        },
    }
}

/// The base ids and validity window covered by an agreement (or a request
/// for one), flattened for duplicate detection
#[derive(Debug, Clone)]
pub struct AgreementCoverage {
    pub base_ids: HashSet<i64>,
    pub valid_from: DateTime<Utc>,
    pub valid_until: Option<DateTime<Utc>>,
}

/// Whether an existing agreement makes a requested one redundant: its
/// covered base set is a superset of the request's and its validity window
/// fully contains the request's window
pub fn is_duplicate_agreement(existing: &AgreementCoverage, requested: &AgreementCoverage) -> bool {
    existing.base_ids.is_superset(&requested.base_ids)
        && window_contains(
            existing.valid_from,
            existing.valid_until,
            requested.valid_from,
            requested.valid_until,
        )
}

// ============================================================================
// Shipment validations
// ============================================================================

/// Whether a (source, target) base pair is permitted by an agreement's
/// covered base sets
///
/// For bidirectional agreements any covered base may serve as either end;
/// for unidirectional agreements each base must sit on its matching side.
/// The two ends must differ.
pub fn shipment_bases_permitted(
    agreement_type: TransferAgreementType,
    source_base_ids: &HashSet<i64>,
    target_base_ids: &HashSet<i64>,
    source_base_id: i64,
    target_base_id: i64,
) -> bool {
    if source_base_id == target_base_id {
        return false;
    }
    match agreement_type {
        TransferAgreementType::Bidirectional => {
            let covered = |id: &i64| source_base_ids.contains(id) || target_base_ids.contains(id);
            covered(&source_base_id) && covered(&target_base_id)
        }
        _ => {
            source_base_ids.contains(&source_base_id) && target_base_ids.contains(&target_base_id)
        }
    }
}

/// Whether a box may be pulled into a shipment while it is being prepared
pub fn box_eligible_for_preparation(
    box_state: BoxState,
    box_base_id: i64,
    source_base_id: i64,
) -> bool {
    box_state == BoxState::InStock && box_base_id == source_base_id
}

/// Whether a prepared box may be returned to stock
pub fn box_eligible_for_removal(box_state: BoxState) -> bool {
    box_state == BoxState::MarkedForShipment
}

/// Whether a shipment detail may be reconciled at the target base
pub fn box_eligible_for_receiving(
    box_state: BoxState,
    target_product_base_id: i64,
    target_location_base_id: i64,
    target_base_id: i64,
) -> bool {
    box_state == BoxState::Receiving
        && target_product_base_id == target_base_id
        && target_location_base_id == target_base_id
}

/// Resolve the terminal state a receiving shipment should auto-transition
/// into, given the box states of its still-open details
///
/// - every box lost → the shipment is lost;
/// - every box back in stock (or lost) → the shipment is completed;
/// - otherwise the shipment keeps receiving.
///
/// Callers must only invoke this for shipments that had at least one
/// non-removed detail; an empty slice means every detail was closed as lost.
pub fn resolve_shipment_outcome(open_box_states: &[BoxState]) -> Option<ShipmentState> {
    if open_box_states.is_empty() || open_box_states.iter().all(|s| *s == BoxState::Lost) {
        return Some(ShipmentState::Lost);
    }
    if open_box_states
        .iter()
        .all(|s| matches!(s, BoxState::InStock | BoxState::Lost))
    {
        return Some(ShipmentState::Completed);
    }
    None
}

// ============================================================================
// State guards
// ============================================================================

/// States from which an agreement may be accepted or rejected
pub const AGREEMENT_REVIEWABLE_STATES: &[TransferAgreementState] =
    &[TransferAgreementState::UnderReview];

/// States from which an agreement may be canceled
pub const AGREEMENT_CANCELABLE_STATES: &[TransferAgreementState] = &[
    TransferAgreementState::UnderReview,
    TransferAgreementState::Accepted,
];

/// Shipment states permitting preparation edits, dispatch and cancellation
pub const SHIPMENT_PREPARATION_STATES: &[ShipmentState] = &[ShipmentState::Preparing];

/// Shipment states permitting receiving to start or the shipment to be
/// declared lost in transit
pub const SHIPMENT_IN_TRANSIT_STATES: &[ShipmentState] = &[ShipmentState::Sent];

/// Shipment states permitting box reconciliation
pub const SHIPMENT_RECONCILIATION_STATES: &[ShipmentState] = &[ShipmentState::Receiving];

/// A rejected state transition: the states that would have permitted the
/// operation and the state the record was actually in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateGuardFailure<S> {
    pub expected: Vec<S>,
    pub actual: S,
}

/// Guard an agreement state transition
pub fn ensure_agreement_state(
    expected: &[TransferAgreementState],
    actual: TransferAgreementState,
) -> Result<(), StateGuardFailure<TransferAgreementState>> {
    if expected.contains(&actual) {
        Ok(())
    } else {
        Err(StateGuardFailure {
            expected: expected.to_vec(),
            actual,
        })
    }
}

/// Guard a shipment state transition
pub fn ensure_shipment_state(
    expected: &[ShipmentState],
    actual: ShipmentState,
) -> Result<(), StateGuardFailure<ShipmentState>> {
    if expected.contains(&actual) {
        Ok(())
    } else {
        Err(StateGuardFailure {
            expected: expected.to_vec(),
            actual,
        })
    }
}

// ============================================================================
// Display formats
// ============================================================================

/// Human-readable shipment label:
/// `S{id zero-padded to 3 digits}-{start date as YYMMDD}-{AB}x{CD}` where
/// AB/CD are the first two letters of the source/target base names,
/// uppercased (e.g. `S042-230815-THxLE`)
pub fn shipment_label(
    id: i64,
    start_date: NaiveDate,
    source_base_name: &str,
    target_base_name: &str,
) -> String {
    format!(
        "S{:03}-{}-{}x{}",
        id,
        start_date.format("%y%m%d"),
        base_name_prefix(source_base_name),
        base_name_prefix(target_base_name),
    )
}

fn base_name_prefix(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphabetic())
        .take(2)
        .collect::<String>()
        .to_uppercase()
}
