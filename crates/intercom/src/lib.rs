//! Intercom call coordination between a resident and an on-duty doorman.
//!
//! Each device runs one [`CallCoordinator`], which owns the device's
//! [`CallSession`] and drives it through the call state machine using
//! signaling messages exchanged over a [`SignalingChannel`].

pub mod coordinator;
pub mod session;
pub mod signaling;

pub use coordinator::{CallConfig, CallCoordinator, CallError};
pub use session::{CallDirection, CallSession, CallSnapshot};
pub use signaling::{SignalingChannel, SignalingError, SignalingHub};
