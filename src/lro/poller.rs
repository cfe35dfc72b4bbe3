//! Poller driving an [`OperationState`] to completion through a [`Pipeline`].

// std
use std::marker::PhantomData;
// crates.io
use serde::de::DeserializeOwned;
// self
use crate::{
	_prelude::*,
	context::Context,
	error::{ConfigError, OperationError, ResponseError},
	http::{Request, Response, decode_json},
	lro::{OperationState, OperationStatus, advance, start},
	obs::{self, CallKind, CallOutcome, CallSpan},
	pipeline::Pipeline,
	retry::millis,
};

const RESUME_TOKEN_TYPE: &str = "resman-runtime/lro";
const RESUME_TOKEN_VERSION: u32 = 1;

/// Poll pacing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollOptions {
	/// Wait between polls when the service sends no `Retry-After`.
	#[serde(rename = "frequency_ms", with = "millis")]
	pub frequency: Duration,
}
impl PollOptions {
	const DEFAULT_FREQUENCY: Duration = Duration::seconds(30);

	/// Overrides the default frequency.
	pub fn with_frequency(mut self, frequency: Duration) -> Self {
		self.frequency = if frequency.is_negative() { Duration::ZERO } else { frequency };

		self
	}
}
impl Default for PollOptions {
	fn default() -> Self {
		Self { frequency: Self::DEFAULT_FREQUENCY }
	}
}

/// Interprets poll responses for one family of operations.
///
/// Every method defaults to the built-in Azure status-monitor, `Location`, and provisioning-state
/// handling, so an implementation overrides only what its service does differently. Handlers see
/// nothing but the serializable [`OperationState`], which keeps custom polling resumable.
pub trait PollingHandler
where
	Self: Send + Sync,
{
	/// URL fetched by the next poll.
	fn poll_url(&self, state: &OperationState) -> Url {
		state.poll_url.clone()
	}

	/// Applies one successful poll response, returning the successor state.
	fn advance(&self, state: &OperationState, response: &Response) -> Result<OperationState> {
		advance(state, response)
	}

	/// URL fetched for the result once the operation succeeded; `None` decodes the last poll
	/// response instead.
	fn result_url(&self, state: &OperationState) -> Option<Url> {
		state.final_url.clone()
	}
}

/// Built-in handling for Azure-style operations.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultPollingHandler;
impl PollingHandler for DefaultPollingHandler {}

#[derive(Serialize, Deserialize)]
struct ResumeToken {
	#[serde(rename = "type")]
	kind: String,
	version: u32,
	state: OperationState,
}

/// Drives one long-running operation; `T` is the decoded result type.
pub struct Poller<T> {
	pipeline: Pipeline,
	state: OperationState,
	context: Context,
	last: Option<Response>,
	handler: Arc<dyn PollingHandler>,
	_result: PhantomData<fn() -> T>,
}
impl<T> Poller<T>
where
	T: DeserializeOwned,
{
	/// Starts polling from the response of the initiating call.
	///
	/// `context` is reused for every poll and the final GET.
	pub fn from_response(pipeline: Pipeline, initial: Response, context: Context) -> Result<Self> {
		let state = start(&initial)?;

		Ok(Self::with_state(pipeline, state, Some(initial), context))
	}

	/// Starts polling from an already-built state (for example one using
	/// [`OperationState::with_final_state_via`]).
	pub fn with_state(
		pipeline: Pipeline,
		state: OperationState,
		last: Option<Response>,
		context: Context,
	) -> Self {
		Self {
			pipeline,
			state,
			context,
			last,
			handler: Arc::new(DefaultPollingHandler),
			_result: PhantomData,
		}
	}

	/// Replaces the built-in polling logic.
	///
	/// Resumed pollers do not remember their handler; pass the same one again after
	/// [`from_resume_token`](Self::from_resume_token).
	pub fn with_handler(mut self, handler: impl 'static + PollingHandler) -> Self {
		self.handler = Arc::new(handler);

		self
	}

	/// Reconstructs a poller from [`resume_token`](Self::resume_token) output.
	pub fn from_resume_token(pipeline: Pipeline, token: &str, context: Context) -> Result<Self> {
		let invalid = |reason: String| ConfigError::InvalidResumeToken { reason };
		let token = serde_json::from_str::<ResumeToken>(token)
			.map_err(|e| invalid(format!("malformed token ({e})")))?;

		if token.kind != RESUME_TOKEN_TYPE {
			return Err(invalid(format!("unexpected token type `{}`", token.kind)).into());
		}
		if token.version != RESUME_TOKEN_VERSION {
			return Err(invalid(format!("unsupported token version {}", token.version)).into());
		}
		if token.state.status.is_terminal() {
			return Err(invalid("operation already reached a terminal state".into()).into());
		}

		Ok(Self::with_state(pipeline, token.state, None, context))
	}

	/// Serializes the state so another process can continue polling.
	pub fn resume_token(&self) -> Result<String> {
		if self.done() {
			return Err(ConfigError::InvalidResumeToken {
				reason: "operation already reached a terminal state".into(),
			}
			.into());
		}

		let token = ResumeToken {
			kind: RESUME_TOKEN_TYPE.into(),
			version: RESUME_TOKEN_VERSION,
			state: self.state.clone(),
		};

		serde_json::to_string(&token)
			.map_err(|e| ConfigError::InvalidResumeToken { reason: e.to_string() }.into())
	}

	/// Returns `true` once the operation reached a terminal status.
	pub fn done(&self) -> bool {
		self.state.status.is_terminal()
	}

	/// Current status.
	pub fn status(&self) -> OperationStatus {
		self.state.status
	}

	/// Current state.
	pub fn state(&self) -> &OperationState {
		&self.state
	}

	/// Most recent response (initial or poll), when one is held.
	pub fn last_response(&self) -> Option<&Response> {
		self.last.as_ref()
	}

	/// Performs one poll exchange unless already done, returning the resulting status.
	pub async fn poll(&mut self) -> Result<OperationStatus> {
		if self.done() {
			return Ok(self.state.status);
		}

		const KIND: CallKind = CallKind::Poll;

		obs::record_call_outcome(KIND, CallOutcome::Attempt);

		let span = CallSpan::new(KIND, "poll");
		let outcome = span.instrument(self.poll_once()).await;

		match &outcome {
			Ok(_) => obs::record_call_outcome(KIND, CallOutcome::Success),
			Err(_) => obs::record_call_outcome(KIND, CallOutcome::Failure),
		}

		outcome
	}

	/// Waits and polls until the operation finishes, then returns its result.
	///
	/// Each wait uses the last response's `Retry-After` when present, otherwise
	/// `options.frequency`. Cancellation or deadline expiry interrupts the wait promptly and leaves
	/// the remote operation untouched.
	pub async fn poll_until_done(&mut self, options: &PollOptions) -> Result<T> {
		while !self.done() {
			let wait = self.state.poll_interval.unwrap_or(options.frequency);

			self.context.sleep(wait).await?;
			self.poll().await?;
		}

		self.result().await
	}

	/// Result of a finished operation.
	///
	/// Failed or cancelled operations yield [`Error::Operation`]. Successful status-monitor
	/// operations fetch the result with a final GET; everything else decodes the last response.
	/// An empty body decodes as JSON `null`, so `T = ()` or `Option<_>` suit bodiless results.
	pub async fn result(&mut self) -> Result<T> {
		match self.state.status {
			status if status.is_failure() => {
				let response = self.last.clone().unwrap_or_else(|| {
					Response::new(StatusCode::OK)
						.with_request_line(Method::GET, self.handler.poll_url(&self.state))
				});

				Err(OperationError { status, response: ResponseError::from_response(response) }.into())
			},
			OperationStatus::Succeeded => {
				let response = match self.handler.result_url(&self.state) {
					Some(final_url) => self.get(final_url).await?,
					None => self.last.clone().ok_or(Error::OperationPending)?,
				};

				decode_result(&response)
			},
			_ => Err(Error::OperationPending),
		}
	}

	async fn poll_once(&mut self) -> Result<OperationStatus> {
		let response = self.get(self.handler.poll_url(&self.state)).await?;
		let next = self.handler.advance(&self.state, &response)?;

		if next.status != self.state.status {
			obs::operation_transition(&self.state.status, &next.status);
		}

		self.state = next;
		self.last = Some(response);

		Ok(self.state.status)
	}

	async fn get(&self, url: Url) -> Result<Response> {
		let mut request = Request::new(Method::GET, url).with_context(self.context.clone());
		let response = self.pipeline.send(&mut request).await?;

		if !response.is_success() {
			return Err(ResponseError::from_response(response).into());
		}

		Ok(response)
	}
}
impl<T> Debug for Poller<T> {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("Poller").field("state", &self.state).finish_non_exhaustive()
	}
}

fn decode_result<T>(response: &Response) -> Result<T>
where
	T: DeserializeOwned,
{
	if response.body().iter().all(u8::is_ascii_whitespace) {
		return decode_json(response.status(), b"null");
	}

	decode_json(response.status(), response.body())
}
