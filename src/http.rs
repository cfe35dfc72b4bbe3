//! Request and response values threaded through the pipeline.
//!
//! A [`Request`] owns everything one logical call needs: method, URL, headers, an optional
//! body, and the per-call [`Context`]. Bodies are in-memory [`Bytes`], so every attempt made by
//! the retry policy re-sends exactly the same payload and signing policies can hash the body
//! without consuming it.
//!
//! A [`Response`] is fully buffered by the transport. Policies inspect it by reference; the
//! ultimate caller consumes the body once via [`Response::into_body`] or [`Response::json`].

// crates.io
pub use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};

use http::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;
// self
use crate::{_prelude::*, context::Context, error::ConfigError, error::DecodeError};

/// Outbound request owned by the call that created it.
#[derive(Clone, Debug)]
pub struct Request {
	method: Method,
	url: Url,
	headers: HeaderMap,
	body: Option<Bytes>,
	context: Context,
}
impl Request {
	/// Creates a request without a body.
	pub fn new(method: Method, url: Url) -> Self {
		Self { method, url, headers: HeaderMap::new(), body: None, context: Context::default() }
	}

	/// Parses `url` and creates a request, failing fast on malformed input.
	pub fn parse(method: Method, url: &str) -> Result<Self> {
		let url = Url::parse(url).map_err(|e| ConfigError::invalid_url(url, e))?;

		Ok(Self::new(method, url))
	}

	/// Replaces the per-call context.
	pub fn with_context(mut self, context: Context) -> Self {
		self.context = context;

		self
	}

	/// Attaches a body and its content type.
	pub fn with_body(mut self, body: impl Into<Bytes>, content_type: &str) -> Result<Self> {
		self.set_body(body, content_type)?;

		Ok(self)
	}

	/// Adds a header, failing fast on an invalid name or value.
	pub fn with_header(mut self, name: &str, value: &str) -> Result<Self> {
		self.append_header(name, value)?;

		Ok(self)
	}

	/// HTTP method.
	pub fn method(&self) -> &Method {
		&self.method
	}

	/// Target URL.
	pub fn url(&self) -> &Url {
		&self.url
	}

	/// Mutable target URL.
	pub fn url_mut(&mut self) -> &mut Url {
		&mut self.url
	}

	/// `host[:port]` exactly as it appears in the URL authority.
	pub fn host(&self) -> &str {
		&self.url[url::Position::BeforeHost..url::Position::AfterPort]
	}

	/// Path plus `?query` when a query is present.
	pub fn path_and_query(&self) -> String {
		match self.url.query() {
			Some(query) if !query.is_empty() => format!("{}?{query}", self.url.path()),
			_ => self.url.path().to_owned(),
		}
	}

	/// Request headers.
	pub fn headers(&self) -> &HeaderMap {
		&self.headers
	}

	/// Mutable request headers.
	pub fn headers_mut(&mut self) -> &mut HeaderMap {
		&mut self.headers
	}

	/// Appends a header entry, keeping existing values for the same name.
	pub fn append_header(&mut self, name: &str, value: &str) -> Result<()> {
		let (name, value) = header_pair(name, value)?;

		self.headers.append(name, value);

		Ok(())
	}

	/// Sets a header, replacing every existing value for the same name.
	pub fn insert_header(&mut self, name: &str, value: &str) -> Result<()> {
		let (name, value) = header_pair(name, value)?;

		self.headers.insert(name, value);

		Ok(())
	}

	/// Request body, if any. Reading it never consumes it.
	pub fn body(&self) -> Option<&Bytes> {
		self.body.as_ref()
	}

	/// Sets the body and its content type.
	pub fn set_body(&mut self, body: impl Into<Bytes>, content_type: &str) -> Result<()> {
		self.insert_header(CONTENT_TYPE.as_str(), content_type)?;
		self.body = Some(body.into());

		Ok(())
	}

	/// Per-call context.
	pub fn context(&self) -> &Context {
		&self.context
	}

	/// Mutable per-call context.
	pub fn context_mut(&mut self) -> &mut Context {
		&mut self.context
	}
}

/// Buffered response produced by a transport or fabricated by a policy.
#[derive(Clone, Debug)]
pub struct Response {
	status: StatusCode,
	headers: HeaderMap,
	body: Bytes,
	method: Method,
	url: Option<Url>,
}
impl Response {
	/// Creates an empty response with the given status.
	pub fn new(status: StatusCode) -> Self {
		Self { status, headers: HeaderMap::new(), body: Bytes::new(), method: Method::GET, url: None }
	}

	/// Creates a response from parts delivered by a transport.
	pub fn from_parts(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
		Self { status, headers, body, method: Method::GET, url: None }
	}

	/// Adds a header; names or values that are not valid header text are skipped.
	pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
		if let (Ok(name), Ok(value)) =
			(HeaderName::from_bytes(name.as_bytes()), HeaderValue::try_from(value.into()))
		{
			self.headers.append(name, value);
		}

		self
	}

	/// Replaces the body.
	pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
		self.body = body.into();

		self
	}

	/// Records the request line that produced this response.
	pub fn with_request_line(mut self, method: Method, url: Url) -> Self {
		self.method = method;
		self.url = Some(url);

		self
	}

	/// Records `request` as the origin of this response.
	pub fn for_request(self, request: &Request) -> Self {
		self.with_request_line(request.method().clone(), request.url().clone())
	}

	/// Status code.
	pub fn status(&self) -> StatusCode {
		self.status
	}

	/// Returns `true` for 2xx statuses.
	pub fn is_success(&self) -> bool {
		self.status.is_success()
	}

	/// Method of the originating request.
	pub fn method(&self) -> &Method {
		&self.method
	}

	/// URL of the originating request, when known.
	pub fn url(&self) -> Option<&Url> {
		self.url.as_ref()
	}

	/// Response headers.
	pub fn headers(&self) -> &HeaderMap {
		&self.headers
	}

	/// Mutable response headers.
	pub fn headers_mut(&mut self) -> &mut HeaderMap {
		&mut self.headers
	}

	/// First value of `name` as text, when present and valid UTF-8.
	pub fn header(&self, name: &str) -> Option<&str> {
		self.headers.get(name).and_then(|value| value.to_str().ok())
	}

	/// Borrows the buffered body.
	pub fn body(&self) -> &Bytes {
		&self.body
	}

	/// Consumes the response, returning its body.
	pub fn into_body(self) -> Bytes {
		self.body
	}

	/// Consumes the response, returning headers and body.
	pub fn into_parts(self) -> (HeaderMap, Bytes) {
		(self.headers, self.body)
	}

	/// Consumes the response and decodes its JSON body.
	pub fn json<T>(self) -> Result<T>
	where
		T: DeserializeOwned,
	{
		decode_json(self.status, &self.body)
	}
}

/// Decodes `body` as JSON, recording the failing path on error.
pub(crate) fn decode_json<T>(status: StatusCode, body: &[u8]) -> Result<T>
where
	T: DeserializeOwned,
{
	let mut de = serde_json::Deserializer::from_slice(body);

	serde_path_to_error::deserialize(&mut de)
		.map_err(|source| DecodeError::Json { source, status: status.as_u16() }.into())
}

fn header_pair(name: &str, value: &str) -> Result<(HeaderName, HeaderValue)> {
	let invalid = || ConfigError::InvalidHeader { name: name.to_owned() };
	let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid())?;
	let header_value = HeaderValue::from_str(value).map_err(|_| invalid())?;

	Ok((header_name, header_value))
}
