//! Runtime-level error types shared across the pipeline, policies, pollers, and pagers.

// self
use crate::{_prelude::*, http::Response, lro::OperationStatus};

/// Runtime-wide result type alias returning [`Error`] by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const RULE: &str =
	"--------------------------------------------------------------------------------";

/// Canonical runtime error exposed by public APIs.
#[derive(Debug, ThisError)]
pub enum Error {
	/// Local input problem detected before any network I/O.
	#[error(transparent)]
	Config(#[from] ConfigError),
	/// Transport failure (DNS, TCP, TLS, timeout).
	#[error(transparent)]
	Transport(#[from] TransportError),
	/// Service answered with a status no policy accepted.
	#[error(transparent)]
	Response(#[from] ResponseError),
	/// Long-running operation reached a terminal non-success state.
	#[error(transparent)]
	Operation(#[from] OperationError),
	/// Response body could not be decoded into the expected shape.
	#[error(transparent)]
	Decode(#[from] DecodeError),

	/// Token credential failed to produce an access token.
	#[error("Credential failed to acquire an access token.")]
	Credential {
		/// Credential-specific failure.
		#[source]
		source: BoxError,
	},
	/// Caller cancelled the call.
	#[error("The call was cancelled.")]
	Canceled,
	/// Call deadline elapsed.
	#[error("The call deadline was exceeded.")]
	DeadlineExceeded,
	/// `next_page` was called after the last page was fetched.
	#[error("No more pages are available.")]
	PagerExhausted,
	/// A poller result was requested before the operation reached a terminal state.
	#[error("The long-running operation has not finished yet.")]
	OperationPending,
}
impl Error {
	/// Wraps a credential failure.
	pub fn credential(src: impl 'static + Send + Sync + std::error::Error) -> Self {
		Self::Credential { source: Box::new(src) }
	}

	/// Returns `true` when the retry policy may redo the exchange that produced this error.
	pub fn is_transient(&self) -> bool {
		matches!(self, Self::Transport(_))
	}

	/// HTTP status attached to the error, if any.
	pub fn status(&self) -> Option<StatusCode> {
		match self {
			Self::Response(e) => Some(e.status),
			Self::Operation(e) => Some(e.response.status),
			_ => None,
		}
	}
}

/// Malformed local input; these fail fast before any network I/O.
#[derive(Debug, ThisError)]
pub enum ConfigError {
	/// Connection string is malformed.
	#[error(transparent)]
	ConnectionString(#[from] crate::auth::ConnectionStringError),
	/// Sync token is malformed.
	#[error(transparent)]
	SyncToken(#[from] crate::sync_token::SyncTokenError),
	/// A required path parameter was missing or empty.
	#[error("Required path parameter `{name}` is missing or empty.")]
	MissingParameter {
		/// Template parameter name.
		name: String,
	},
	/// URL could not be parsed.
	#[error("URL `{url}` is invalid.")]
	InvalidUrl {
		/// Offending input.
		url: String,
		/// Underlying parsing failure.
		#[source]
		source: url::ParseError,
	},
	/// Header name or value is invalid.
	#[error("Header `{name}` has an invalid name or value.")]
	InvalidHeader {
		/// Header name as supplied.
		name: String,
	},
	/// Bearer tokens must not travel over plain HTTP.
	#[error("Bearer token authentication requires HTTPS, got `{scheme}`.")]
	InsecureTransport {
		/// Scheme of the offending request URL.
		scheme: String,
	},
	/// The initial response cannot start a long-running operation.
	#[error("Response cannot start a long-running operation: {reason}.")]
	Unpollable {
		/// Why the response was rejected.
		reason: &'static str,
	},
	/// Resume token is malformed, foreign, or describes a finished operation.
	#[error("Resume token is invalid: {reason}.")]
	InvalidResumeToken {
		/// Why the token was rejected.
		reason: String,
	},
	/// No transport was configured and no default transport is compiled in.
	#[error("No transport is configured; enable the `reqwest` feature or supply one.")]
	MissingTransport,
	/// HTTP client could not be constructed.
	#[error("HTTP client could not be constructed.")]
	HttpClientBuild {
		/// Underlying transport builder failure.
		#[source]
		source: BoxError,
	},
}
impl ConfigError {
	/// Wraps a transport's builder failure inside [`ConfigError`].
	pub fn http_client_build(src: impl 'static + Send + Sync + std::error::Error) -> Self {
		Self::HttpClientBuild { source: Box::new(src) }
	}

	/// Wraps a URL parsing failure along with the offending input.
	pub fn invalid_url(url: impl Into<String>, source: url::ParseError) -> Self {
		Self::InvalidUrl { url: url.into(), source }
	}
}

/// Transport-level failures (network, IO, timeouts).
#[derive(Debug, ThisError)]
pub enum TransportError {
	/// Connection could not be established; the request never reached the server.
	#[error("Failed to connect to the service.")]
	Connect {
		/// Transport-specific connect error.
		#[source]
		source: BoxError,
	},
	/// Exchange did not complete in time.
	#[error("Request timed out.")]
	Timeout,
	/// Underlying HTTP client reported a network failure.
	#[error("Network error occurred while calling the service.")]
	Network {
		/// Transport-specific network error.
		#[source]
		source: BoxError,
	},
	/// Underlying IO failure surfaced during transport.
	#[error("I/O error occurred while calling the service.")]
	Io(#[from] std::io::Error),
}
impl TransportError {
	/// Wraps a transport-specific network error.
	pub fn network(src: impl 'static + Send + Sync + std::error::Error) -> Self {
		Self::Network { source: Box::new(src) }
	}

	/// Wraps a transport-specific connect error.
	pub fn connect(src: impl 'static + Send + Sync + std::error::Error) -> Self {
		Self::Connect { source: Box::new(src) }
	}

	/// Returns `true` when the request provably never left the client.
	pub fn is_connect(&self) -> bool {
		matches!(self, Self::Connect { .. })
	}
}
#[cfg(feature = "reqwest")]
impl From<ReqwestError> for TransportError {
	fn from(e: ReqwestError) -> Self {
		if e.is_timeout() {
			Self::Timeout
		} else if e.is_connect() {
			Self::connect(e)
		} else {
			Self::network(e)
		}
	}
}

/// Protocol error: a completed exchange whose status was not accepted.
///
/// `Display` renders the same multi-line report for every call site so logs stay greppable.
#[derive(Clone, Debug)]
pub struct ResponseError {
	/// Method of the failed request.
	pub method: Method,
	/// URL of the failed request, without its query string.
	pub url: Option<Url>,
	/// Status returned by the service.
	pub status: StatusCode,
	/// Service error code from `x-ms-error-code` or the JSON error body.
	pub error_code: Option<String>,
	/// Raw response body.
	pub body: Bytes,
	/// Response headers.
	pub headers: HeaderMap,
}
impl ResponseError {
	/// Builds a protocol error from a completed response.
	pub fn from_response(response: Response) -> Self {
		let error_code = error_code(response.headers(), response.body());
		let url = response.url().cloned().map(|mut url| {
			url.set_query(None);

			url
		});
		let method = response.method().clone();
		let status = response.status();
		let (headers, body) = response.into_parts();

		Self { method, url, status, error_code, body, headers }
	}
}
impl Display for ResponseError {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		match &self.url {
			Some(url) => writeln!(f, "{} {url}", self.method)?,
			None => writeln!(f, "{}", self.method)?,
		}

		writeln!(f, "{RULE}")?;
		writeln!(
			f,
			"RESPONSE {}: {}",
			self.status.as_u16(),
			self.status.canonical_reason().unwrap_or("Unknown Status")
		)?;

		match &self.error_code {
			Some(code) => writeln!(f, "ERROR CODE: {code}")?,
			None => writeln!(f, "ERROR CODE UNAVAILABLE")?,
		}

		writeln!(f, "{RULE}")?;

		if self.body.is_empty() {
			writeln!(f, "Response contained no body")?;
		} else {
			match serde_json::from_slice::<serde_json::Value>(&self.body)
				.ok()
				.and_then(|value| serde_json::to_string_pretty(&value).ok())
			{
				Some(pretty) => writeln!(f, "{pretty}")?,
				None => writeln!(f, "{}", String::from_utf8_lossy(&self.body))?,
			}
		}

		writeln!(f, "{RULE}")
	}
}
impl StdError for ResponseError {}

/// Long-running operation reached `Failed` or `Canceled`.
#[derive(Clone, Debug, ThisError)]
#[error("Long-running operation finished as {status}.\n{response}")]
pub struct OperationError {
	/// Terminal status reported by the service.
	pub status: OperationStatus,
	/// Final poll response.
	pub response: ResponseError,
}

/// Response body did not match the expected JSON shape.
#[derive(Debug, ThisError)]
pub enum DecodeError {
	/// JSON was malformed or mistyped.
	#[error("Response body is not valid for the expected shape.")]
	Json {
		/// Structured parsing failure with the offending path.
		#[source]
		source: serde_path_to_error::Error<serde_json::Error>,
		/// HTTP status code of the decoded response.
		status: u16,
	},
	/// Long-running operation status payload lacks its status field.
	#[error("Operation status payload is missing the `{field}` field.")]
	MissingStatus {
		/// Expected field path.
		field: &'static str,
	},
}

fn error_code(headers: &HeaderMap, body: &[u8]) -> Option<String> {
	if let Some(code) = headers.get("x-ms-error-code").and_then(|v| v.to_str().ok()) {
		return Some(code.to_owned());
	}

	let value = serde_json::from_slice::<serde_json::Value>(body).ok()?;
	let code = value
		.get("error")
		.and_then(|inner| inner.get("code"))
		.or_else(|| value.get("code"))?
		.as_str()?;

	Some(code.to_owned())
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	fn failed(status: u16) -> Response {
		Response::new(StatusCode::from_u16(status).expect("Status fixture should be valid."))
			.with_request_line(
				Method::GET,
				Url::parse("https://fakeurl.com/the/path?qp=removed")
					.expect("URL fixture should parse."),
			)
	}

	#[test]
	fn response_error_without_body_or_code() {
		let err = ResponseError::from_response(failed(500));
		let want = "GET https://fakeurl.com/the/path\n".to_owned()
			+ RULE + "\n"
			+ "RESPONSE 500: Internal Server Error\n"
			+ "ERROR CODE UNAVAILABLE\n"
			+ RULE + "\n"
			+ "Response contained no body\n"
			+ RULE + "\n";

		assert!(err.error_code.is_none());
		assert_eq!(err.to_string(), want);
	}

	#[test]
	fn response_error_prefers_header_code() {
		let err = ResponseError::from_response(
			failed(500)
				.with_header("x-ms-error-code", "ErrorTooManyCheats")
				.with_body(r#"{"error":{"code":"Ignored"}}"#),
		);

		assert_eq!(err.error_code.as_deref(), Some("ErrorTooManyCheats"));
		assert!(err.to_string().contains("ERROR CODE: ErrorTooManyCheats"));
	}

	#[test]
	fn response_error_reads_body_codes() {
		let nested = ResponseError::from_response(
			failed(404).with_body(r#"{"error":{"code":"ResourceNotFound","message":"gone"}}"#),
		);
		let flat = ResponseError::from_response(
			failed(500).with_body(r#"{ "code": "ErrorItsBroken", "message": "it's not working" }"#),
		);

		assert_eq!(nested.error_code.as_deref(), Some("ResourceNotFound"));
		assert_eq!(flat.error_code.as_deref(), Some("ErrorItsBroken"));
		assert!(flat.to_string().contains("\"message\": \"it's not working\""));
	}

	#[test]
	fn only_transport_errors_are_transient() {
		assert!(Error::from(TransportError::Timeout).is_transient());
		assert!(!Error::Canceled.is_transient());
		assert!(
			!Error::from(ConfigError::MissingParameter { name: "vaultName".into() }).is_transient()
		);
	}
}
