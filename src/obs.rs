//! Optional observability helpers for pipeline calls, pollers, and pagers.
//!
//! # Feature Flags
//!
//! - Enable `tracing` to emit structured spans named `resman_runtime.call` with the `op` (call
//!   kind) and `stage` (call site) fields, plus `debug`/`warn` events for retries and discarded
//!   sync tokens.
//! - Enable `metrics` to increment the `resman_runtime_call_total` counter for every
//!   attempt/success/failure, labeled by `op` + `outcome`.
//!
//! Secrets (bearer tokens, HMAC keys) are never passed to any helper in this module.

mod events;
mod metrics;
mod tracing;

pub use self::{events::*, metrics::*, tracing::*};

// self
use crate::_prelude::*;

/// Kinds of runtime calls observed by the crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallKind {
	/// One logical pipeline call (all retry attempts included).
	Pipeline,
	/// One long-running operation poll or wait-until-done loop.
	Poll,
	/// One page fetch.
	Page,
}
impl CallKind {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			CallKind::Pipeline => "pipeline",
			CallKind::Poll => "poll",
			CallKind::Page => "page",
		}
	}
}
impl Display for CallKind {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Outcome labels recorded for each call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallOutcome {
	/// Entry to a runtime call.
	Attempt,
	/// Successful completion.
	Success,
	/// Failure propagated back to the caller.
	Failure,
}
impl CallOutcome {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			CallOutcome::Attempt => "attempt",
			CallOutcome::Success => "success",
			CallOutcome::Failure => "failure",
		}
	}
}
impl Display for CallOutcome {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}
