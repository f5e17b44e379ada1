//! Time windows for memory records
//!
//! Two kinds of window are used during retrieval:
//! - **Validity window**: when a semantic memory holds true in the real world
//! - **Creation window**: which `created_at` values a query looks back over

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Validity window of a semantic memory
///
/// Both bounds are inclusive. An unset bound is unbounded on that side, so a
/// default window contains every instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityWindow {
    /// When the memory starts to hold
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<DateTime<Utc>>,

    /// When the memory stops holding
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,
}

impl ValidityWindow {
    /// Window unbounded on both sides
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Window with explicit bounds
    pub fn new(valid_from: Option<DateTime<Utc>>, valid_until: Option<DateTime<Utc>>) -> Self {
        Self {
            valid_from,
            valid_until,
        }
    }

    /// Check if the window contains `time`
    pub fn contains(&self, time: DateTime<Utc>) -> bool {
        let after_start = self.valid_from.map_or(true, |from| from <= time);
        let before_end = self.valid_until.map_or(true, |until| time <= until);
        after_start && before_end
    }

    /// A window whose start lies after its end can never match
    pub fn is_empty(&self) -> bool {
        matches!((self.valid_from, self.valid_until), (Some(from), Some(until)) if from > until)
    }
}

/// Closed range of creation times a query looks back over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreationWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl CreationWindow {
    /// `[reference - days, reference]`. A range reaching past the earliest
    /// representable time starts there instead.
    pub fn looking_back(reference: DateTime<Utc>, days: u32) -> Self {
        let start = reference
            .checked_sub_signed(Duration::days(i64::from(days)))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Self {
            start,
            end: reference,
        }
    }

    /// Check if `time` falls inside the range
    pub fn contains(&self, time: DateTime<Utc>) -> bool {
        self.start <= time && time <= self.end
    }
}
