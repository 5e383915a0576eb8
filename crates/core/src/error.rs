use crate::call_state::{CallEvent, CallState};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid state transition: {event} is not allowed in state {from}")]
    InvalidTransition { from: CallState, event: CallEvent },
}
