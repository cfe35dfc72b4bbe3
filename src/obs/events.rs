//! Point-in-time events emitted from inside policies.

// self
use crate::_prelude::*;

/// Records that the retry policy is about to wait `delay` before attempt `attempt + 1`.
pub fn retry_scheduled(attempt: u32, delay: Duration, status: Option<StatusCode>) {
	#[cfg(feature = "tracing")]
	{
		tracing::debug!(
			attempt,
			delay_ms = delay.whole_milliseconds() as u64,
			status = status.map(|s| s.as_u16()),
			"retrying request"
		);
	}
	#[cfg(not(feature = "tracing"))]
	{
		let _ = (attempt, delay, status);
	}
}

/// Records that a server-requested delay exceeded the configured cap, ending the retry loop.
pub fn retry_after_too_long(requested: Duration, cap: Duration) {
	#[cfg(feature = "tracing")]
	{
		tracing::debug!(
			requested_ms = requested.whole_milliseconds() as u64,
			cap_ms = cap.whole_milliseconds() as u64,
			"server-requested retry delay exceeds the cap; returning response"
		);
	}
	#[cfg(not(feature = "tracing"))]
	{
		let _ = (requested, cap);
	}
}

/// Records a sync token from a response header that failed to parse and was discarded.
pub fn sync_token_discarded(reason: &dyn Display) {
	#[cfg(feature = "tracing")]
	{
		tracing::warn!(%reason, "discarding malformed sync token");
	}
	#[cfg(not(feature = "tracing"))]
	{
		let _ = reason;
	}
}

/// Records a long-running operation state transition.
pub fn operation_transition(from: &dyn Display, to: &dyn Display) {
	#[cfg(feature = "tracing")]
	{
		tracing::debug!(%from, %to, "long-running operation transition");
	}
	#[cfg(not(feature = "tracing"))]
	{
		let _ = (from, to);
	}
}

/// Records a failed early token refresh that fell back to the still-valid cached token.
pub fn token_refresh_failed(error: &dyn Display) {
	#[cfg(feature = "tracing")]
	{
		tracing::warn!(%error, "token refresh failed; reusing cached token until it expires");
	}
	#[cfg(not(feature = "tracing"))]
	{
		let _ = error;
	}
}

/// Records that a `401` challenge triggered a token re-acquisition and one replay.
pub fn auth_challenge_answered(scheme: &str, with_claims: bool) {
	#[cfg(feature = "tracing")]
	{
		tracing::debug!(scheme, with_claims, "answering authentication challenge; replaying request");
	}
	#[cfg(not(feature = "tracing"))]
	{
		let _ = (scheme, with_claims);
	}
}
