//! Shipment lifecycle tests
//!
//! Tests for base-pair validation against agreement coverage, bulk box
//! eligibility (silent-discard semantics), auto-completion outcomes and the
//! shipment display label.

use std::collections::{BTreeMap, HashSet};

use chrono::NaiveDate;
use proptest::prelude::*;

use shared::models::{BoxState, ShipmentState, TransferAgreementType};
use shared::validation::{
    box_eligible_for_preparation, box_eligible_for_receiving, box_eligible_for_removal,
    ensure_shipment_state, resolve_shipment_outcome, shipment_bases_permitted, shipment_label,
    SHIPMENT_IN_TRANSIT_STATES, SHIPMENT_PREPARATION_STATES, SHIPMENT_RECONCILIATION_STATES,
};

// ============================================================================
// In-memory bulk-operation model
// ============================================================================

/// A labeled box as the bulk operations see it: its base and current state
#[derive(Debug, Clone, PartialEq)]
struct TestBox {
    base_id: i64,
    state: BoxState,
}

/// Apply the prepare bulk operation over a label list, returning the
/// (applied, skipped) split the service reports
fn prepare_boxes(
    boxes: &mut BTreeMap<String, TestBox>,
    labels: &[String],
    source_base_id: i64,
) -> (Vec<String>, Vec<String>) {
    let mut applied = Vec::new();
    let mut skipped = Vec::new();
    for label in labels {
        match boxes.get_mut(label) {
            Some(b) if box_eligible_for_preparation(b.state, b.base_id, source_base_id) => {
                b.state = BoxState::MarkedForShipment;
                applied.push(label.clone());
            }
            _ => skipped.push(label.clone()),
        }
    }
    (applied, skipped)
}

/// Apply the remove bulk operation over a label list
fn remove_boxes(
    boxes: &mut BTreeMap<String, TestBox>,
    labels: &[String],
) -> (Vec<String>, Vec<String>) {
    let mut applied = Vec::new();
    let mut skipped = Vec::new();
    for label in labels {
        match boxes.get_mut(label) {
            Some(b) if box_eligible_for_removal(b.state) => {
                b.state = BoxState::InStock;
                applied.push(label.clone());
            }
            _ => skipped.push(label.clone()),
        }
    }
    (applied, skipped)
}

/// Boxes still circulating in stock terms: in stock or staged for a shipment
fn circulating(boxes: &BTreeMap<String, TestBox>) -> usize {
    boxes
        .values()
        .filter(|b| matches!(b.state, BoxState::InStock | BoxState::MarkedForShipment))
        .count()
}

// ============================================================================
// Property Test Strategies
// ============================================================================

fn box_state_strategy() -> impl Strategy<Value = BoxState> {
    prop_oneof![
        Just(BoxState::InStock),
        Just(BoxState::MarkedForShipment),
        Just(BoxState::Receiving),
        Just(BoxState::Lost),
        Just(BoxState::Donated),
        Just(BoxState::Scrap),
    ]
}

fn base_set_strategy() -> impl Strategy<Value = HashSet<i64>> {
    prop::collection::hash_set(1i64..30, 1..6)
}

fn base_name_strategy() -> impl Strategy<Value = String> {
    "[A-Za-z]{2,12}"
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod unit_tests {
    use super::*;

    #[test]
    fn test_unidirectional_base_pair_must_match_sides() {
        let sources: HashSet<i64> = [1, 2].into_iter().collect();
        let targets: HashSet<i64> = [5].into_iter().collect();
        let t = TransferAgreementType::SendingTo;

        assert!(shipment_bases_permitted(t, &sources, &targets, 2, 5));
        // reversed direction is not permitted
        assert!(!shipment_bases_permitted(t, &sources, &targets, 5, 2));
        // both ends on the source side
        assert!(!shipment_bases_permitted(t, &sources, &targets, 1, 2));
    }

    #[test]
    fn test_bidirectional_base_pair_any_direction() {
        let sources: HashSet<i64> = [1].into_iter().collect();
        let targets: HashSet<i64> = [2, 3].into_iter().collect();
        let t = TransferAgreementType::Bidirectional;

        assert!(shipment_bases_permitted(t, &sources, &targets, 1, 3));
        assert!(shipment_bases_permitted(t, &sources, &targets, 3, 1));
        // even two target-side bases may exchange
        assert!(shipment_bases_permitted(t, &sources, &targets, 2, 3));
        // the two ends must differ
        assert!(!shipment_bases_permitted(t, &sources, &targets, 2, 2));
    }

    /// Only boxes in stock at the shipment's source base are pulled in;
    /// everything else is silently skipped by the bulk operation
    #[test]
    fn test_preparation_eligibility() {
        assert!(box_eligible_for_preparation(BoxState::InStock, 4, 4));
        assert!(!box_eligible_for_preparation(BoxState::InStock, 5, 4));
        assert!(!box_eligible_for_preparation(BoxState::MarkedForShipment, 4, 4));
        assert!(!box_eligible_for_preparation(BoxState::Donated, 4, 4));
        assert!(!box_eligible_for_preparation(BoxState::Scrap, 4, 4));
    }

    #[test]
    fn test_removal_eligibility() {
        assert!(box_eligible_for_removal(BoxState::MarkedForShipment));
        assert!(!box_eligible_for_removal(BoxState::InStock));
        assert!(!box_eligible_for_removal(BoxState::Receiving));
    }

    /// Reconciliation requires the box to be in the receiving state and the
    /// chosen product and location to belong to the target base
    #[test]
    fn test_receiving_eligibility() {
        assert!(box_eligible_for_receiving(BoxState::Receiving, 7, 7, 7));
        assert!(!box_eligible_for_receiving(BoxState::Receiving, 6, 7, 7));
        assert!(!box_eligible_for_receiving(BoxState::Receiving, 7, 6, 7));
        assert!(!box_eligible_for_receiving(BoxState::MarkedForShipment, 7, 7, 7));
    }

    /// End-to-end outcome walk: boxes reconciled one at a time, shipment
    /// completes exactly when the last open box leaves the receiving state
    #[test]
    fn test_auto_completion_when_last_box_reconciled() {
        let mut states = vec![BoxState::Receiving, BoxState::Receiving, BoxState::Receiving];
        assert_eq!(resolve_shipment_outcome(&states), None);

        states[0] = BoxState::InStock;
        assert_eq!(resolve_shipment_outcome(&states), None);

        states[1] = BoxState::Lost;
        assert_eq!(resolve_shipment_outcome(&states), None);

        states[2] = BoxState::InStock;
        assert_eq!(
            resolve_shipment_outcome(&states),
            Some(ShipmentState::Completed)
        );
    }

    #[test]
    fn test_all_lost_resolves_to_lost() {
        assert_eq!(
            resolve_shipment_outcome(&[BoxState::Lost, BoxState::Lost]),
            Some(ShipmentState::Lost)
        );
        // every detail already closed as lost
        assert_eq!(resolve_shipment_outcome(&[]), Some(ShipmentState::Lost));
    }

    /// Preparation edits, dispatch and cancellation are only legal while
    /// preparing; every other state is rejected with exactly that list
    /// (in particular, a sent shipment can no longer be canceled)
    #[test]
    fn test_preparing_guard_reports_expected_list() {
        use ShipmentState::*;

        assert!(ensure_shipment_state(SHIPMENT_PREPARATION_STATES, Preparing).is_ok());
        for actual in [Sent, Receiving, Completed, Lost, Canceled] {
            let err = ensure_shipment_state(SHIPMENT_PREPARATION_STATES, actual).unwrap_err();
            assert_eq!(err.expected, vec![Preparing]);
            assert_eq!(err.actual, actual);
        }
    }

    /// Start-receiving and mark-lost require a sent shipment
    #[test]
    fn test_in_transit_guard_reports_expected_list() {
        use ShipmentState::*;

        assert!(ensure_shipment_state(SHIPMENT_IN_TRANSIT_STATES, Sent).is_ok());
        for actual in [Preparing, Receiving, Completed, Lost, Canceled] {
            let err = ensure_shipment_state(SHIPMENT_IN_TRANSIT_STATES, actual).unwrap_err();
            assert_eq!(err.expected, vec![Sent]);
            assert_eq!(err.actual, actual);
        }
    }

    /// Box reconciliation requires a receiving shipment
    #[test]
    fn test_reconciliation_guard_reports_expected_list() {
        use ShipmentState::*;

        assert!(ensure_shipment_state(SHIPMENT_RECONCILIATION_STATES, Receiving).is_ok());
        for actual in [Preparing, Sent, Completed, Lost, Canceled] {
            let err = ensure_shipment_state(SHIPMENT_RECONCILIATION_STATES, actual).unwrap_err();
            assert_eq!(err.expected, vec![Receiving]);
            assert_eq!(err.actual, actual);
        }
    }

    /// Removing a label that is no longer staged is reported as skipped and
    /// changes nothing, however often it is retried
    #[test]
    fn test_remove_of_unstaged_label_is_skipped_without_effect() {
        let mut boxes = BTreeMap::from([
            (
                "00000001".to_string(),
                TestBox {
                    base_id: 1,
                    state: BoxState::MarkedForShipment,
                },
            ),
            (
                "00000002".to_string(),
                TestBox {
                    base_id: 1,
                    state: BoxState::InStock,
                },
            ),
        ]);
        let labels = vec!["00000001".to_string(), "00000002".to_string()];

        let (applied, skipped) = remove_boxes(&mut boxes, &labels);
        assert_eq!(applied, vec!["00000001".to_string()]);
        assert_eq!(skipped, vec!["00000002".to_string()]);

        // retrying the same request discards everything and is a no-op
        let snapshot = boxes.clone();
        let (applied, skipped) = remove_boxes(&mut boxes, &labels);
        assert!(applied.is_empty());
        assert_eq!(skipped, labels);
        assert_eq!(boxes, snapshot);
    }

    #[test]
    fn test_terminal_shipment_states() {
        assert!(ShipmentState::Completed.is_terminal());
        assert!(ShipmentState::Lost.is_terminal());
        assert!(ShipmentState::Canceled.is_terminal());
        assert!(!ShipmentState::Preparing.is_terminal());
        assert!(!ShipmentState::Sent.is_terminal());
        assert!(!ShipmentState::Receiving.is_terminal());
    }

    #[test]
    fn test_shipment_label_format() {
        let date = NaiveDate::from_ymd_opt(2023, 8, 15).unwrap();
        assert_eq!(
            shipment_label(42, date, "Thessaloniki", "Lesvos"),
            "S042-230815-THxLE"
        );
        assert_eq!(shipment_label(7, date, "athens", "samos"), "S007-230815-ATxSA");
        // non-alphabetic characters are skipped when building the prefix
        assert_eq!(
            shipment_label(7, date, "1st Warehouse", "B-2 Depot"),
            "S007-230815-STxBD"
        );
    }
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    /// Property: swapping source and target never changes the verdict of a
    /// bidirectional agreement
    #[test]
    fn prop_bidirectional_is_symmetric(
        sources in base_set_strategy(),
        targets in base_set_strategy(),
        a in 1i64..30,
        b in 1i64..30,
    ) {
        let t = TransferAgreementType::Bidirectional;
        prop_assert_eq!(
            shipment_bases_permitted(t, &sources, &targets, a, b),
            shipment_bases_permitted(t, &sources, &targets, b, a)
        );
    }

    /// Property: a resolved outcome is always terminal, and Completed is
    /// only ever produced with at least one surviving box
    #[test]
    fn prop_resolved_outcome_is_terminal(states in prop::collection::vec(box_state_strategy(), 0..12)) {
        if let Some(outcome) = resolve_shipment_outcome(&states) {
            prop_assert!(outcome.is_terminal());
            if outcome == ShipmentState::Completed {
                prop_assert!(states.iter().any(|s| *s == BoxState::InStock));
            }
        } else {
            // undecided means some box is still in flight
            prop_assert!(states
                .iter()
                .any(|s| !matches!(s, BoxState::InStock | BoxState::Lost)));
        }
    }

    /// Property: the label always carries the zero-padded id and a
    /// 6-digit date, regardless of base names
    #[test]
    fn prop_label_shape(
        id in 1i64..5000,
        source in base_name_strategy(),
        target in base_name_strategy(),
    ) {
        let date = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        let label = shipment_label(id, date, &source, &target);
        prop_assert!(label.starts_with('S'));
        let parts: Vec<&str> = label.splitn(3, '-').collect();
        prop_assert_eq!(parts.len(), 3);
        prop_assert!(parts[0][1..].parse::<i64>().is_ok());
        prop_assert!(parts[0].len() >= 4);
        prop_assert_eq!(parts[1], "240229");
        prop_assert!(parts[2].contains('x'));
    }

    /// Property: a prepare/remove pair over the same labels conserves the
    /// circulating box count at every step, restores every box to its
    /// original state, and a repeated removal is an idempotent discard
    #[test]
    fn prop_prepare_remove_conserves_boxes(
        fleet in prop::collection::vec((1i64..4, box_state_strategy()), 1..12),
        source_base in 1i64..4,
    ) {
        let mut boxes: BTreeMap<String, TestBox> = fleet
            .into_iter()
            .enumerate()
            .map(|(i, (base_id, state))| (format!("{:08}", i), TestBox { base_id, state }))
            .collect();
        let labels: Vec<String> = boxes.keys().cloned().collect();
        let original = boxes.clone();
        let count_before = circulating(&boxes);

        let (prepared, skipped) = prepare_boxes(&mut boxes, &labels, source_base);
        prop_assert_eq!(prepared.len() + skipped.len(), labels.len());
        prop_assert_eq!(circulating(&boxes), count_before);
        // skipped entries are always label identifiers from the request
        for label in &skipped {
            prop_assert!(labels.contains(label));
        }

        let (removed, _) = remove_boxes(&mut boxes, &prepared);
        prop_assert_eq!(&removed, &prepared);
        prop_assert_eq!(circulating(&boxes), count_before);
        // the pair is a full round trip on every box state
        prop_assert_eq!(&boxes, &original);

        // removing the same labels again discards all of them untouched
        let (reapplied, reskipped) = remove_boxes(&mut boxes, &prepared);
        prop_assert!(reapplied.is_empty());
        prop_assert_eq!(reskipped, prepared);
        prop_assert_eq!(&boxes, &original);
    }
}
