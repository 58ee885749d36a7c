//! Transfer agreement tests
//!
//! Tests for agreement validity windows, duplicate detection and the
//! reviewing-side rules of the agreement state machine.

use std::collections::HashSet;

use chrono::{DateTime, TimeZone, Utc};
use proptest::prelude::*;

use shared::models::{TransferAgreementState, TransferAgreementType};
use shared::validation::{
    ensure_agreement_state, is_duplicate_agreement, validate_agreement_window, window_contains,
    AgreementCoverage, AGREEMENT_CANCELABLE_STATES, AGREEMENT_REVIEWABLE_STATES,
};

fn ts(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
}

// ============================================================================
// Property Test Strategies
// ============================================================================

/// Generate a day offset within a few years
fn day_strategy() -> impl Strategy<Value = i64> {
    0i64..1500
}

/// Generate a non-empty set of base ids
fn base_set_strategy() -> impl Strategy<Value = HashSet<i64>> {
    prop::collection::hash_set(1i64..20, 1..6)
}

fn date_from_offset(days: i64) -> DateTime<Utc> {
    ts(2022, 1, 1) + chrono::Duration::days(days)
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod unit_tests {
    use super::*;

    /// A window ending on its start date (or earlier) is invalid
    #[test]
    fn test_window_must_end_after_start() {
        assert!(validate_agreement_window(ts(2023, 5, 1), Some(ts(2023, 6, 1))).is_ok());
        assert!(validate_agreement_window(ts(2023, 5, 1), None).is_ok());
        assert!(validate_agreement_window(ts(2023, 5, 1), Some(ts(2023, 5, 1))).is_err());
        assert!(validate_agreement_window(ts(2023, 5, 1), Some(ts(2023, 4, 1))).is_err());
    }

    /// Same calendar day counts as invalid even with a later time of day
    #[test]
    fn test_window_same_day_later_time_rejected() {
        let from = Utc.with_ymd_and_hms(2023, 5, 1, 0, 0, 0).unwrap();
        let until = Utc.with_ymd_and_hms(2023, 5, 1, 23, 0, 0).unwrap();
        assert!(validate_agreement_window(from, Some(until)).is_err());
    }

    #[test]
    fn test_duplicate_requires_base_superset_and_window_containment() {
        let existing = AgreementCoverage {
            base_ids: [1, 2, 3].into_iter().collect(),
            valid_from: ts(2023, 1, 1),
            valid_until: None,
        };
        let requested = AgreementCoverage {
            base_ids: [2, 3].into_iter().collect(),
            valid_from: ts(2023, 6, 1),
            valid_until: Some(ts(2023, 9, 1)),
        };
        assert!(is_duplicate_agreement(&existing, &requested));

        // A base outside the existing coverage breaks the duplicate
        let requested = AgreementCoverage {
            base_ids: [2, 9].into_iter().collect(),
            ..requested
        };
        assert!(!is_duplicate_agreement(&existing, &requested));
    }

    #[test]
    fn test_duplicate_rejected_when_request_starts_earlier() {
        let existing = AgreementCoverage {
            base_ids: [1].into_iter().collect(),
            valid_from: ts(2023, 6, 1),
            valid_until: None,
        };
        let requested = AgreementCoverage {
            base_ids: [1].into_iter().collect(),
            valid_from: ts(2023, 1, 1),
            valid_until: Some(ts(2023, 3, 1)),
        };
        assert!(!is_duplicate_agreement(&existing, &requested));
    }

    /// The partner organisation reviews a SendingTo/Bidirectional request;
    /// for ReceivingFrom the roles are swapped at creation so the reviewing
    /// side is the stored source organisation
    #[test]
    fn test_reviewing_side_per_agreement_type() {
        use shared::models::TransferAgreement;

        let base = TransferAgreement {
            id: 1,
            source_organisation_id: 10,
            target_organisation_id: 20,
            agreement_type: TransferAgreementType::SendingTo,
            state: TransferAgreementState::UnderReview,
            valid_from: ts(2023, 1, 1),
            valid_until: None,
            requested_by: 1,
            requested_on: ts(2023, 1, 1),
            accepted_by: None,
            accepted_on: None,
            terminated_by: None,
            terminated_on: None,
            comment: None,
        };
        assert_eq!(base.reviewing_organisation_id(), 20);

        let bidirectional = TransferAgreement {
            agreement_type: TransferAgreementType::Bidirectional,
            ..base.clone()
        };
        assert_eq!(bidirectional.reviewing_organisation_id(), 20);

        let receiving = TransferAgreement {
            agreement_type: TransferAgreementType::ReceivingFrom,
            ..base.clone()
        };
        assert_eq!(receiving.reviewing_organisation_id(), 10);

        assert!(base.involves_organisation(10));
        assert!(base.involves_organisation(20));
        assert!(!base.involves_organisation(30));
    }

    /// Accept and reject are only legal while the agreement is under
    /// review; the rejection names exactly that expected list
    #[test]
    fn test_accept_reject_guard_reports_under_review_only() {
        use TransferAgreementState::*;

        assert!(ensure_agreement_state(AGREEMENT_REVIEWABLE_STATES, UnderReview).is_ok());
        for actual in [Accepted, Rejected, Canceled, Expired] {
            let err = ensure_agreement_state(AGREEMENT_REVIEWABLE_STATES, actual).unwrap_err();
            assert_eq!(err.expected, vec![UnderReview]);
            assert_eq!(err.actual, actual);
        }
    }

    /// Cancel is legal from UnderReview or Accepted; terminal states are
    /// rejected with exactly that expected list
    #[test]
    fn test_cancel_guard_reports_under_review_and_accepted() {
        use TransferAgreementState::*;

        for actual in [UnderReview, Accepted] {
            assert!(ensure_agreement_state(AGREEMENT_CANCELABLE_STATES, actual).is_ok());
        }
        for actual in [Rejected, Canceled, Expired] {
            let err = ensure_agreement_state(AGREEMENT_CANCELABLE_STATES, actual).unwrap_err();
            assert_eq!(err.expected, vec![UnderReview, Accepted]);
            assert_eq!(err.actual, actual);
        }
    }

    #[test]
    fn test_agreement_state_round_trip() {
        for state in [
            TransferAgreementState::UnderReview,
            TransferAgreementState::Accepted,
            TransferAgreementState::Rejected,
            TransferAgreementState::Canceled,
            TransferAgreementState::Expired,
        ] {
            assert_eq!(TransferAgreementState::from_str(state.as_str()), Some(state));
        }
        assert_eq!(TransferAgreementState::from_str("bogus"), None);
    }
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    /// Property: a coverage always duplicates itself
    #[test]
    fn prop_coverage_duplicates_itself(
        bases in base_set_strategy(),
        from in day_strategy(),
        len in prop::option::of(1i64..500),
    ) {
        let coverage = AgreementCoverage {
            base_ids: bases,
            valid_from: date_from_offset(from),
            valid_until: len.map(|l| date_from_offset(from + l)),
        };
        prop_assert!(is_duplicate_agreement(&coverage, &coverage.clone()));
    }

    /// Property: window containment is transitive
    #[test]
    fn prop_window_containment_transitive(
        a_from in day_strategy(),
        a_len in prop::option::of(1i64..500),
        b_off in 0i64..100,
        b_len in prop::option::of(1i64..300),
        c_off in 0i64..100,
        c_len in prop::option::of(1i64..200),
    ) {
        let a = (date_from_offset(a_from), a_len.map(|l| date_from_offset(a_from + l)));
        let b = (date_from_offset(a_from + b_off), b_len.map(|l| date_from_offset(a_from + b_off + l)));
        let c = (date_from_offset(a_from + b_off + c_off), c_len.map(|l| date_from_offset(a_from + b_off + c_off + l)));

        if window_contains(a.0, a.1, b.0, b.1) && window_contains(b.0, b.1, c.0, c.1) {
            prop_assert!(window_contains(a.0, a.1, c.0, c.1));
        }
    }

    /// Property: shrinking the requested base set never un-duplicates
    #[test]
    fn prop_subset_request_stays_duplicate(
        existing_bases in base_set_strategy(),
        from in day_strategy(),
    ) {
        let existing = AgreementCoverage {
            base_ids: existing_bases.clone(),
            valid_from: date_from_offset(from),
            valid_until: None,
        };
        let mut shrunk: HashSet<i64> = existing_bases.iter().copied().collect();
        if shrunk.len() > 1 {
            let drop = *shrunk.iter().next().unwrap();
            shrunk.remove(&drop);
        }
        let requested = AgreementCoverage {
            base_ids: shrunk,
            valid_from: date_from_offset(from + 10),
            valid_until: Some(date_from_offset(from + 20)),
        };
        prop_assert!(is_duplicate_agreement(&existing, &requested));
    }
}
