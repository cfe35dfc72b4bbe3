//! Long-running operations: the polling state machine and the poller that drives it.
//!
//! [`state`] holds the serializable [`OperationState`] and the pure transition functions
//! ([`start`] for the initial response, [`advance`] for each poll response). [`poller`] layers
//! waiting, cancellation, resume tokens, and final-result retrieval on top.

pub mod poller;
pub mod state;

pub use poller::*;
pub use state::*;
