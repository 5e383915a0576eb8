//! Domain types and pure logic for the doorman/resident coordination core.
//!
//! Nothing in this crate performs I/O. The watcher, realtime transport and
//! intercom coordinator crates all build on the same decision records,
//! signature scheme, call state table and signaling protocol defined here.

pub mod call_state;
pub mod decision;
pub mod error;
pub mod signaling;
pub mod signature;
pub mod types;
