//! Serializable polling state and its pure transitions.

// self
use crate::{
	_prelude::*,
	error::{ConfigError, DecodeError, ResponseError},
	http::Response,
	retry::{opt_millis, retry_after},
};

const ASYNC_OPERATION: &str = "azure-asyncoperation";
const OPERATION_LOCATION: &str = "operation-location";
const LOCATION: &str = "location";

/// Lifecycle of a long-running operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationStatus {
	/// Accepted but not yet running.
	NotStarted,
	/// Running.
	InProgress,
	/// Finished successfully.
	Succeeded,
	/// Finished with a failure.
	Failed,
	/// Cancelled server-side.
	Canceled,
}
impl OperationStatus {
	/// Maps a service status string; unknown non-terminal values (`Running`, `Creating`, ...)
	/// count as in progress.
	pub fn from_service(raw: &str) -> Self {
		match raw.trim().to_ascii_lowercase().as_str() {
			"succeeded" => Self::Succeeded,
			"failed" => Self::Failed,
			"canceled" | "cancelled" => Self::Canceled,
			"notstarted" => Self::NotStarted,
			_ => Self::InProgress,
		}
	}

	/// Returns `true` for `Succeeded`, `Failed`, and `Canceled`.
	pub fn is_terminal(self) -> bool {
		matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
	}

	/// Returns `true` for `Failed` and `Canceled`.
	pub fn is_failure(self) -> bool {
		matches!(self, Self::Failed | Self::Canceled)
	}

	/// Stable label.
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::NotStarted => "NotStarted",
			Self::InProgress => "InProgress",
			Self::Succeeded => "Succeeded",
			Self::Failed => "Failed",
			Self::Canceled => "Canceled",
		}
	}
}
impl Display for OperationStatus {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// How the operation's progress is observed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollingKind {
	/// `Azure-AsyncOperation` / `Operation-Location` status monitor with a `status` body field.
	StatusMonitor,
	/// `Location` header; progress is the HTTP status unless the body embeds a status.
	Location,
	/// The resource itself, via `properties.provisioningState`.
	Body,
}

/// Where the result of a successful operation is fetched from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinalStateVia {
	/// The status monitor URL itself.
	AzureAsyncOperation,
	/// The `Location` header of the initial response.
	Location,
	/// The URL of the initial request.
	OriginalUri,
}

/// Everything needed to continue polling, in this process or another.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationState {
	/// Polling strategy chosen from the initial response.
	pub kind: PollingKind,
	/// Current status.
	pub status: OperationStatus,
	/// Method of the initial request.
	#[serde(with = "method_text")]
	pub method: Method,
	/// URL of the initial request.
	pub original_url: Url,
	/// URL to GET for progress.
	pub poll_url: Url,
	/// URL to GET for the result once succeeded; `None` means the last poll response is the result.
	pub final_url: Option<Url>,
	/// Server-suggested wait before the next poll.
	#[serde(rename = "poll_interval_ms", with = "opt_millis", default)]
	pub poll_interval: Option<Duration>,
}
impl OperationState {
	/// Overrides where the final result is fetched from, using the initial response's headers.
	pub fn with_final_state_via(mut self, via: FinalStateVia, initial: &Response) -> Result<Self> {
		self.final_url = match via {
			FinalStateVia::AzureAsyncOperation => Some(self.poll_url.clone()),
			FinalStateVia::Location => header_url(initial, &self.original_url, LOCATION)?,
			FinalStateVia::OriginalUri => Some(self.original_url.clone()),
		};

		Ok(self)
	}
}

/// Builds the initial state from the response that started the operation.
pub fn start(initial: &Response) -> Result<OperationState> {
	if !initial.is_success() {
		return Err(ResponseError::from_response(initial.clone()).into());
	}

	let original_url = initial
		.url()
		.cloned()
		.ok_or(ConfigError::Unpollable { reason: "response does not record its request URL" })?;
	let method = initial.method().clone();
	let poll_interval = retry_after(initial.headers());
	let monitor = match header_url(initial, &original_url, ASYNC_OPERATION)? {
		Some(url) => Some(url),
		None => header_url(initial, &original_url, OPERATION_LOCATION)?,
	};
	let location = header_url(initial, &original_url, LOCATION)?;
	let state = |kind, status, poll_url, final_url| OperationState {
		kind,
		status,
		method: method.clone(),
		original_url: original_url.clone(),
		poll_url,
		final_url,
		poll_interval,
	};

	if let Some(monitor) = monitor {
		let final_url = match method {
			Method::PUT | Method::PATCH => Some(original_url.clone()),
			Method::POST => location,
			_ => None,
		};

		return Ok(state(PollingKind::StatusMonitor, OperationStatus::InProgress, monitor, final_url));
	}
	if let Some(location) = location {
		return Ok(state(PollingKind::Location, OperationStatus::InProgress, location, None));
	}

	let tracks_resource = matches!(method, Method::PUT | Method::PATCH)
		&& matches!(initial.status(), StatusCode::OK | StatusCode::CREATED);

	if let Some(status) = provisioning_state(initial).filter(|_| tracks_resource) {
		return Ok(state(PollingKind::Body, status, original_url.clone(), None));
	}
	if initial.status() == StatusCode::ACCEPTED {
		return Err(ConfigError::Unpollable { reason: "202 Accepted without a polling header" }.into());
	}

	Ok(state(PollingKind::Body, OperationStatus::Succeeded, original_url.clone(), None))
}

/// Applies one poll response to `state`, returning the successor state.
///
/// Non-2xx poll responses are protocol errors; they do not change the operation's status.
pub fn advance(state: &OperationState, response: &Response) -> Result<OperationState> {
	if !response.is_success() {
		return Err(ResponseError::from_response(response.clone()).into());
	}

	let mut next = state.clone();

	next.poll_interval = retry_after(response.headers());
	next.status = match state.kind {
		PollingKind::StatusMonitor => match embedded_status(response) {
			Some(OperationStatus::Succeeded) => {
				if let Some(url) = resource_location(response, &state.poll_url)? {
					next.final_url = Some(url);
				}

				OperationStatus::Succeeded
			},
			Some(status) => status,
			None if response.status() == StatusCode::ACCEPTED => OperationStatus::InProgress,
			None => return Err(DecodeError::MissingStatus { field: "status" }.into()),
		},
		PollingKind::Location => {
			if let Some(url) = header_url(response, &state.original_url, LOCATION)? {
				next.poll_url = url;
			}

			match response.status() {
				StatusCode::ACCEPTED => OperationStatus::InProgress,
				_ => embedded_status(response)
					.or_else(|| provisioning_state(response))
					.unwrap_or(OperationStatus::Succeeded),
			}
		},
		PollingKind::Body => match response.status() {
			StatusCode::ACCEPTED => OperationStatus::InProgress,
			StatusCode::NO_CONTENT => OperationStatus::Succeeded,
			_ => provisioning_state(response).unwrap_or(OperationStatus::Succeeded),
		},
	};

	Ok(next)
}

fn body_json(response: &Response) -> Option<serde_json::Value> {
	if response.body().is_empty() {
		return None;
	}

	serde_json::from_slice(response.body()).ok()
}

fn embedded_status(response: &Response) -> Option<OperationStatus> {
	let body = body_json(response)?;

	body.get("status")?.as_str().map(OperationStatus::from_service)
}

fn provisioning_state(response: &Response) -> Option<OperationStatus> {
	let body = body_json(response)?;

	body.get("properties")?.get("provisioningState")?.as_str().map(OperationStatus::from_service)
}

// A succeeded status monitor may name the finished resource; it outranks the URL chosen at start.
fn resource_location(response: &Response, base: &Url) -> Result<Option<Url>> {
	let Some(body) = body_json(response) else {
		return Ok(None);
	};
	let Some(raw) = body
		.get("resourceLocation")
		.and_then(|value| value.as_str())
		.map(str::trim)
		.filter(|raw| !raw.is_empty())
	else {
		return Ok(None);
	};
	let url = base.join(raw).map_err(|e| ConfigError::invalid_url(raw, e))?;

	Ok(Some(url))
}

fn header_url(response: &Response, base: &Url, name: &str) -> Result<Option<Url>> {
	let Some(raw) = response.header(name).map(str::trim).filter(|raw| !raw.is_empty()) else {
		return Ok(None);
	};
	let url = base.join(raw).map_err(|e| ConfigError::invalid_url(raw, e))?;

	Ok(Some(url))
}

mod method_text {
	// self
	use crate::_prelude::*;

	pub fn serialize<S>(method: &Method, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str(method.as_str())
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Method, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let raw = String::deserialize(deserializer)?;

		Method::from_bytes(raw.as_bytes()).map_err(serde::de::Error::custom)
	}
}
