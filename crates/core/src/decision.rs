//! Resident decisions on pending visitors.
//!
//! Decisions reach the doorman's device through two paths (the periodic poll
//! and the per-building broadcast channel) and in several shapes. Both paths
//! deserialize into the permissive [`DecisionRecord`]; only records that pass
//! [`DecisionRecord::into_decision`] become actionable [`Decision`]s.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::CoreError;
use crate::signature::DecisionSignature;
use crate::types::{EntityId, Timestamp};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

pub const STATUS_APPROVED: &str = "approved";
pub const STATUS_REJECTED: &str = "rejected";

/// The two final outcomes a resident can give a visitor request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionStatus {
    Approved,
    Rejected,
}

impl DecisionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => STATUS_APPROVED,
            Self::Rejected => STATUS_REJECTED,
        }
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved)
    }
}

impl fmt::Display for DecisionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DecisionStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            STATUS_APPROVED => Ok(Self::Approved),
            STATUS_REJECTED => Ok(Self::Rejected),
            other => Err(CoreError::Validation(format!(
                "Invalid decision status '{other}'. Must be one of: {STATUS_APPROVED}, {STATUS_REJECTED}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Raw records
// ---------------------------------------------------------------------------

/// Apartment reference nested in backend rows (`apartments!inner (number, building_id)`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ApartmentRef {
    #[serde(default, deserialize_with = "opt_text")]
    pub number: Option<String>,
    #[serde(default, alias = "buildingId", deserialize_with = "opt_text")]
    pub building_id: Option<String>,
}

/// Visitor reference nested in backend rows (`visitors (name)`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct VisitorRef {
    #[serde(default)]
    pub name: Option<String>,
}

/// A decision-like record exactly as delivered by the backend or a broadcast.
///
/// Accepts both the backend's column names (`notification_status`,
/// `resident_response_by`, ...) and the camelCase names used by broadcast
/// publishers. Identifiers may arrive as strings or numbers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DecisionRecord {
    #[serde(default, deserialize_with = "opt_text")]
    pub id: Option<EntityId>,

    #[serde(default, alias = "visitorId", deserialize_with = "opt_text")]
    pub visitor_id: Option<EntityId>,

    #[serde(default, alias = "notification_status")]
    pub status: Option<String>,

    #[serde(
        default,
        alias = "respondedBy",
        alias = "resident_response_by",
        deserialize_with = "opt_text"
    )]
    pub responded_by: Option<EntityId>,

    #[serde(default, alias = "respondedAt", alias = "resident_response_at")]
    pub responded_at: Option<String>,

    #[serde(default, alias = "apartmentNumber", deserialize_with = "opt_text")]
    pub apartment_number: Option<String>,

    #[serde(default, alias = "buildingId", deserialize_with = "opt_text")]
    pub building_id: Option<EntityId>,

    #[serde(default)]
    pub apartments: Option<ApartmentRef>,

    #[serde(default)]
    pub apartment: Option<ApartmentRef>,

    #[serde(default)]
    pub visitors: Option<VisitorRef>,
}

/// Why a record was not actionable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IncompleteDecision {
    #[error("status {0:?} is not a final decision")]
    Status(Option<String>),

    #[error("missing responder")]
    MissingResponder,

    #[error("missing or unparseable response timestamp")]
    MissingTimestamp,
}

impl DecisionRecord {
    /// Building the record belongs to.
    ///
    /// Looks at the nested apartment join first, then the flat field, then the
    /// singular `apartment` object some publishers send.
    pub fn building_id(&self) -> Option<&str> {
        self.apartments
            .as_ref()
            .and_then(|a| a.building_id.as_deref())
            .or(self.building_id.as_deref())
            .or_else(|| {
                self.apartment
                    .as_ref()
                    .and_then(|a| a.building_id.as_deref())
            })
            .filter(|id| !id.is_empty())
    }

    /// Returns `true` only when the record explicitly names `building_id`.
    ///
    /// Records without any building reference are treated as out of scope.
    pub fn belongs_to(&self, building_id: &str) -> bool {
        self.building_id() == Some(building_id)
    }

    /// Validate completeness and convert into an actionable [`Decision`].
    pub fn into_decision(self) -> Result<Decision, IncompleteDecision> {
        let building_id = self.building_id().map(str::to_owned);

        let Some(status) = self
            .status
            .as_deref()
            .and_then(|s| s.parse::<DecisionStatus>().ok())
        else {
            return Err(IncompleteDecision::Status(self.status));
        };

        let responded_by = self
            .responded_by
            .filter(|id| !id.trim().is_empty())
            .ok_or(IncompleteDecision::MissingResponder)?;

        let responded_at = self
            .responded_at
            .as_deref()
            .and_then(parse_timestamp)
            .ok_or(IncompleteDecision::MissingTimestamp)?;

        let apartment_number = self
            .apartments
            .as_ref()
            .and_then(|a| a.number.clone())
            .or(self.apartment_number)
            .or_else(|| self.apartment.and_then(|a| a.number));

        Ok(Decision {
            id: self.id,
            visitor_id: self.visitor_id.filter(|id| !id.is_empty()),
            status,
            responded_by,
            responded_at,
            apartment_number,
            building_id,
            visitor_name: self.visitors.and_then(|v| v.name),
        })
    }
}

// ---------------------------------------------------------------------------
// Actionable decision
// ---------------------------------------------------------------------------

/// A complete resident decision, ready for deduplication and presentation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub id: Option<EntityId>,
    pub visitor_id: Option<EntityId>,
    pub status: DecisionStatus,
    pub responded_by: EntityId,
    pub responded_at: Timestamp,
    pub apartment_number: Option<String>,
    pub building_id: Option<EntityId>,
    pub visitor_name: Option<String>,
}

impl Decision {
    pub fn signature(&self) -> DecisionSignature {
        DecisionSignature::compute(
            self.visitor_id.as_deref(),
            self.status,
            &self.responded_by,
            self.responded_at,
        )
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Parse a backend timestamp.
///
/// Accepts RFC 3339 with an offset and the offset-less form PostgREST emits
/// for `timestamp` columns (interpreted as UTC).
pub fn parse_timestamp(raw: &str) -> Option<Timestamp> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(|naive| naive.and_utc())
}

/// Deserialize an optional identifier that may be a JSON string or number.
fn opt_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
