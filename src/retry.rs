//! Retry policy with jittered exponential backoff.
//!
//! The policy wraps the remainder of the chain. A transport error, or a response whose status is
//! in the retryable set, schedules another attempt after `retry_delay * (2^attempt - 1)` scaled by
//! a random factor in `[0.8, 1.3)` and capped at `max_retry_delay` (no cap when unset).
//! `Retry-After` style headers override the computed delay; a server-requested delay above the cap
//! ends the loop and the response is returned as-is. Exhaustion surfaces the last response or
//! error unchanged.
//!
//! Methods with side effects (`POST`, `PATCH`, ...) are retried only when the caller marked the
//! call safe via [`Context::with_retry_safe`](crate::context::Context::with_retry_safe), or when
//! the failure proves the request never reached the service (connect errors) or was throttled
//! (`429`).

// crates.io
use rand::Rng;
use time::format_description::well_known::Rfc2822;
// self
use crate::{
	_prelude::*,
	error::TransportError,
	http::{Request, Response},
	obs,
	pipeline::{Next, Policy, PolicyFuture},
};

/// Predicate deciding whether a completed attempt should be retried.
///
/// Exactly one of the arguments is `Some`. Method safety and the attempt budget still apply.
pub type ShouldRetry = Arc<dyn Fn(Option<&Response>, Option<&Error>) -> bool + Send + Sync>;

/// Retry configuration; deserializable so clients can load it from their own config files.
///
/// Durations are expressed in milliseconds on the wire (`retry_delay_ms`, ...).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
	/// Retries after the first attempt; `0` disables retrying.
	pub max_retries: u32,
	/// Base backoff delay.
	#[serde(rename = "retry_delay_ms", with = "millis")]
	pub retry_delay: Duration,
	/// Upper bound for any single wait, computed or server-requested; `None` lifts the cap.
	///
	/// A negative or `null` `max_retry_delay_ms` lifts the cap; omitting the field keeps the
	/// default.
	#[serde(rename = "max_retry_delay_ms", with = "opt_millis")]
	pub max_retry_delay: Option<Duration>,
	/// Optional time budget for each attempt.
	#[serde(rename = "try_timeout_ms", with = "opt_millis")]
	pub try_timeout: Option<Duration>,
	/// Statuses treated as transient.
	pub status_codes: Vec<u16>,
}
impl RetryOptions {
	const DEFAULT_MAX_RETRIES: u32 = 3;
	const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::seconds(60);
	const DEFAULT_RETRY_DELAY: Duration = Duration::milliseconds(800);
	const DEFAULT_STATUS_CODES: [u16; 6] = [408, 429, 500, 502, 503, 504];

	/// Overrides the retry budget.
	pub fn with_max_retries(mut self, max_retries: u32) -> Self {
		self.max_retries = max_retries;

		self
	}

	/// Overrides the base delay.
	pub fn with_retry_delay(mut self, delay: Duration) -> Self {
		self.retry_delay = clamp_non_negative(delay);

		self
	}

	/// Overrides the delay cap; a negative delay removes it.
	pub fn with_max_retry_delay(mut self, delay: Duration) -> Self {
		self.max_retry_delay = (!delay.is_negative()).then_some(delay);

		self
	}

	/// Bounds each attempt.
	pub fn with_try_timeout(mut self, timeout: Duration) -> Self {
		self.try_timeout = Some(clamp_non_negative(timeout));

		self
	}

	/// Replaces the retryable status set.
	pub fn with_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
		self.status_codes = codes.into_iter().collect();

		self
	}

	/// Total attempts allowed, first attempt included.
	pub fn max_attempts(&self) -> u32 {
		self.max_retries.saturating_add(1)
	}

	/// Jittered exponential delay before the attempt following `attempt` (1-based).
	pub fn backoff(&self, attempt: u32) -> Duration {
		let factor = 2_f64.powi(attempt.min(30) as i32) - 1.;
		let jitter = rand::rng().random_range(0.8..1.3);
		let delay = self.retry_delay * (factor * jitter);

		match self.max_retry_delay {
			Some(cap) => delay.min(cap),
			None => delay,
		}
	}

	fn is_retryable_status(&self, status: StatusCode) -> bool {
		self.status_codes.contains(&status.as_u16())
	}
}
impl Default for RetryOptions {
	fn default() -> Self {
		Self {
			max_retries: Self::DEFAULT_MAX_RETRIES,
			retry_delay: Self::DEFAULT_RETRY_DELAY,
			max_retry_delay: Some(Self::DEFAULT_MAX_RETRY_DELAY),
			try_timeout: None,
			status_codes: Self::DEFAULT_STATUS_CODES.to_vec(),
		}
	}
}

/// Policy that redoes transient failures of the inner chain.
#[derive(Clone)]
pub struct RetryPolicy {
	options: RetryOptions,
	should_retry: Option<ShouldRetry>,
}
impl RetryPolicy {
	/// Creates a policy from the provided options.
	pub fn new(options: RetryOptions) -> Self {
		Self { options, should_retry: None }
	}

	/// Replaces status/error classification with a custom predicate.
	pub fn with_should_retry(
		mut self,
		predicate: impl 'static + Send + Sync + Fn(Option<&Response>, Option<&Error>) -> bool,
	) -> Self {
		self.should_retry = Some(Arc::new(predicate));

		self
	}

	/// Active options.
	pub fn options(&self) -> &RetryOptions {
		&self.options
	}

	async fn attempt(&self, request: &mut Request, next: Next<'_>) -> Result<Response> {
		match self.options.try_timeout {
			Some(budget) => tokio::time::timeout(budget.unsigned_abs(), next.run(request))
				.await
				.unwrap_or_else(|_| Err(TransportError::Timeout.into())),
			None => next.run(request).await,
		}
	}

	/// Decides whether `outcome` deserves another attempt and, if so, how long to wait.
	fn plan(&self, request: &Request, attempt: u32, outcome: &Result<Response>) -> Option<Duration> {
		let safety = Safety::of(request);

		if matches!(safety, Safety::Never) {
			return None;
		}

		match outcome {
			Ok(response) => {
				let retryable = match &self.should_retry {
					Some(predicate) => predicate(Some(response), None),
					None => self.options.is_retryable_status(response.status()),
				};

				if !retryable {
					return None;
				}
				if matches!(safety, Safety::Unmarked)
					&& response.status() != StatusCode::TOO_MANY_REQUESTS
				{
					return None;
				}

				match (retry_after(response.headers()), self.options.max_retry_delay) {
					(Some(requested), Some(cap)) if requested > cap => {
						obs::retry_after_too_long(requested, cap);

						None
					},
					(Some(requested), _) => Some(requested),
					(None, _) => Some(self.options.backoff(attempt)),
				}
			},
			Err(err) => {
				if matches!(err, Error::Canceled | Error::DeadlineExceeded) {
					return None;
				}

				let retryable = match &self.should_retry {
					Some(predicate) => predicate(None, Some(err)),
					None => err.is_transient(),
				};

				if !retryable {
					return None;
				}
				if matches!(safety, Safety::Unmarked)
					&& !matches!(err, Error::Transport(e) if e.is_connect())
				{
					return None;
				}

				Some(self.options.backoff(attempt))
			},
		}
	}
}
impl Policy for RetryPolicy {
	fn send<'a>(&'a self, request: &'a mut Request, next: Next<'a>) -> PolicyFuture<'a> {
		Box::pin(async move {
			let max_attempts = self.options.max_attempts();
			let mut attempt = 0;

			loop {
				attempt += 1;

				let outcome = self.attempt(request, next).await;

				if attempt >= max_attempts {
					return outcome;
				}

				let Some(delay) = self.plan(request, attempt, &outcome) else {
					return outcome;
				};

				obs::retry_scheduled(
					attempt,
					delay,
					outcome.as_ref().ok().map(Response::status),
				);
				request.context().sleep(delay).await?;
			}
		})
	}
}
impl Debug for RetryPolicy {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("RetryPolicy")
			.field("options", &self.options)
			.field("custom_predicate", &self.should_retry.is_some())
			.finish()
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Safety {
	Safe,
	Unmarked,
	Never,
}
impl Safety {
	fn of(request: &Request) -> Self {
		match request.context().retry_safe() {
			Some(true) => Self::Safe,
			Some(false) => Self::Never,
			None if is_idempotent(request.method()) => Self::Safe,
			None => Self::Unmarked,
		}
	}
}

fn is_idempotent(method: &Method) -> bool {
	matches!(
		*method,
		Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE | Method::PUT | Method::DELETE
	)
}

fn clamp_non_negative(value: Duration) -> Duration {
	if value.is_negative() { Duration::ZERO } else { value }
}

/// Server-requested delay from `retry-after-ms`, `x-ms-retry-after-ms`, or `Retry-After`.
pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
	for name in ["retry-after-ms", "x-ms-retry-after-ms"] {
		let millis = headers
			.get(name)
			.and_then(|value| value.to_str().ok())
			.and_then(|raw| raw.trim().parse::<i64>().ok());

		if let Some(millis) = millis.filter(|ms| *ms >= 0) {
			return Some(Duration::milliseconds(millis));
		}
	}

	let raw = headers.get(http::header::RETRY_AFTER)?.to_str().ok()?.trim();

	if let Ok(secs) = raw.parse::<u64>() {
		return Some(Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX)));
	}
	if let Ok(moment) = OffsetDateTime::parse(raw, &Rfc2822) {
		let delta = moment - OffsetDateTime::now_utc();

		return Some(if delta.is_positive() { delta } else { Duration::ZERO });
	}

	None
}

pub(crate) mod millis {
	// self
	use crate::_prelude::*;

	pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_i64(value.whole_milliseconds() as i64)
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let ms = u64::deserialize(deserializer)?;

		Ok(Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX)))
	}
}

pub(crate) mod opt_millis {
	// self
	use crate::_prelude::*;

	pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: serde::Serializer,
	{
		match value {
			Some(value) => serializer.serialize_some(&(value.whole_milliseconds() as i64)),
			None => serializer.serialize_none(),
		}
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let ms = <Option<i64>>::deserialize(deserializer)?;

		Ok(ms.filter(|ms| *ms >= 0).map(Duration::milliseconds))
	}
}
