//! Coarse-grained deduplication keys for resident decisions.
//!
//! A signature is `"<visitorId>_<status>_<respondedBy>_<minuteEpoch>"`. The
//! response timestamp is truncated to the minute so the same decision observed
//! through the poll and through a broadcast (with sub-minute jitter between
//! the two copies) collapses to one key.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::decision::DecisionStatus;
use crate::types::Timestamp;

/// Width of a signature time bucket.
pub const SIGNATURE_BUCKET_MILLIS: i64 = 60_000;

/// Placeholder used when a decision carries no visitor id.
pub const UNKNOWN_VISITOR: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DecisionSignature(String);

impl DecisionSignature {
    pub fn compute(
        visitor_id: Option<&str>,
        status: DecisionStatus,
        responded_by: &str,
        responded_at: Timestamp,
    ) -> Self {
        let visitor = visitor_id
            .filter(|id| !id.is_empty())
            .unwrap_or(UNKNOWN_VISITOR);
        Self(format!(
            "{visitor}_{status}_{responded_by}_{}",
            minute_bucket(responded_at)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for DecisionSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Signatures restored from persistence are trusted as-is.
impl From<String> for DecisionSignature {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

/// Minutes since the Unix epoch, floored (also for pre-epoch instants).
pub fn minute_bucket(ts: Timestamp) -> i64 {
    ts.timestamp_millis().div_euclid(SIGNATURE_BUCKET_MILLIS)
}
