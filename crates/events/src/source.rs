//! Backend read contract consumed by the decision watcher.

use std::collections::HashMap;

use async_trait::async_trait;
use porteiro_core::decision::DecisionRecord;
use porteiro_core::types::{EntityId, Timestamp};

/// PostgREST error code for an expired JWT.
pub const CODE_JWT_EXPIRED: &str = "PGRST303";

/// Errors from a [`DecisionSource`].
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The caller's authorization is no longer valid.
    #[error("Session expired: {0}")]
    SessionExpired(String),

    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The backend answered with a non-2xx status.
    #[error("Backend error ({status}): {message}")]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("Failed to decode backend response: {0}")]
    Decode(String),
}

impl SourceError {
    /// `true` for errors that must be escalated to force re-authentication.
    pub fn is_session_expired(&self) -> bool {
        match self {
            Self::SessionExpired(_) => true,
            Self::Api { code, message, .. } => {
                code.as_deref() == Some(CODE_JWT_EXPIRED) || message.contains("JWT expired")
            }
            _ => false,
        }
    }
}

#[async_trait]
pub trait DecisionSource: Send + Sync {
    /// Decisions for `building_id` responded at or after `since`, newest first.
    async fn decisions_since(
        &self,
        building_id: &str,
        since: Timestamp,
    ) -> Result<Vec<DecisionRecord>, SourceError>;

    /// Point lookup of one decision log entry, scoped to the building.
    async fn decision_by_id(
        &self,
        building_id: &str,
        id: &str,
    ) -> Result<Option<DecisionRecord>, SourceError>;

    /// Display names for the given resident ids. Unknown ids are omitted.
    async fn resident_names(
        &self,
        _ids: &[EntityId],
    ) -> Result<HashMap<EntityId, String>, SourceError> {
        Ok(HashMap::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_jwt_is_recognised_by_code_or_message() {
        let by_code = SourceError::Api {
            status: 401,
            code: Some(CODE_JWT_EXPIRED.into()),
            message: "whatever".into(),
        };
        let by_message = SourceError::Api {
            status: 401,
            code: None,
            message: "JWT expired".into(),
        };
        assert!(by_code.is_session_expired());
        assert!(by_message.is_session_expired());
        assert!(SourceError::SessionExpired("x".into()).is_session_expired());
    }

    #[test]
    fn other_errors_are_transient() {
        let err = SourceError::Api {
            status: 500,
            code: Some("PGRST000".into()),
            message: "connection refused".into(),
        };
        assert!(!err.is_session_expired());
        assert!(!SourceError::Decode("bad json".into()).is_session_expired());
    }
}
