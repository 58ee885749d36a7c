//! Common types used across the platform

use serde::Serialize;

/// Outcome of a bulk operation with silent-discard semantics
///
/// Entries that fail their eligibility checks are dropped from the
/// effective operation and reported in `skipped`; they are never errors.
#[derive(Debug, Clone, Serialize)]
pub struct BulkOutcome<T> {
    pub applied: Vec<T>,
    pub skipped: Vec<String>,
}

impl<T> BulkOutcome<T> {
    pub fn new() -> Self {
        Self {
            applied: Vec::new(),
            skipped: Vec::new(),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

impl<T> Default for BulkOutcome<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_noop_tracks_applied_entries_only() {
        let mut outcome: BulkOutcome<String> = BulkOutcome::new();
        assert!(outcome.is_noop());

        // skipped entries alone do not make the operation effective
        outcome.skipped.push("00000001".to_string());
        assert!(outcome.is_noop());

        outcome.applied.push("00000002".to_string());
        assert!(!outcome.is_noop());
    }
}
