//! Client facade wiring credentials, sync tokens, retry, and transport into one pipeline.
//!
//! Generated operation code builds requests with [`Client::request`] and hands them to
//! [`Client::send`], [`Client::begin_operation`], or [`Client::pager`].

// crates.io
use serde::de::DeserializeOwned;
// self
use crate::{
	_prelude::*,
	auth::{BearerTokenPolicy, ConnectionString, HmacCredential, HmacPolicy, TokenCredential},
	context::Context,
	error::{ConfigError, ResponseError},
	http::{Request, Response},
	lro::Poller,
	pager::Pager,
	pipeline::{Pipeline, Policy},
	retry::RetryOptions,
	sync_token::{SyncTokenCache, SyncTokenPolicy},
	transport::Transport,
};

/// Client construction options.
#[derive(Clone, Default)]
pub struct ClientOptions {
	/// Retry behavior.
	pub retry: RetryOptions,
	/// Extra policies run once per call, before retries.
	pub per_call: Vec<Arc<dyn Policy>>,
	/// Extra policies run on every attempt, after authentication and sync tokens.
	pub per_retry: Vec<Arc<dyn Policy>>,
	/// Custom transport; defaults to reqwest when the feature is enabled.
	pub transport: Option<Arc<dyn Transport>>,
	/// Permits bearer tokens over plain `http` (local emulators only).
	pub allow_http: bool,
}
impl ClientOptions {
	/// Overrides retry behavior.
	pub fn with_retry(mut self, retry: RetryOptions) -> Self {
		self.retry = retry;

		self
	}

	/// Appends a per-call policy.
	pub fn with_per_call_policy(mut self, policy: Arc<dyn Policy>) -> Self {
		self.per_call.push(policy);

		self
	}

	/// Appends a per-retry policy.
	pub fn with_per_retry_policy(mut self, policy: Arc<dyn Policy>) -> Self {
		self.per_retry.push(policy);

		self
	}

	/// Replaces the transport.
	pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
		self.transport = Some(transport);

		self
	}

	/// Permits bearer tokens over plain `http`.
	pub fn with_allow_http(mut self, allow: bool) -> Self {
		self.allow_http = allow;

		self
	}

	fn transport(&self) -> Result<Arc<dyn Transport>> {
		if let Some(transport) = &self.transport {
			return Ok(transport.clone());
		}

		#[cfg(feature = "reqwest")]
		{
			Ok(Arc::new(crate::transport::ReqwestTransport::try_new()?))
		}
		#[cfg(not(feature = "reqwest"))]
		{
			Err(ConfigError::MissingTransport.into())
		}
	}
}
impl Debug for ClientOptions {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("ClientOptions")
			.field("retry", &self.retry)
			.field("per_call", &self.per_call.len())
			.field("per_retry", &self.per_retry.len())
			.field("custom_transport", &self.transport.is_some())
			.field("allow_http", &self.allow_http)
			.finish()
	}
}

/// Service client owning the pipeline and the sync-token registry.
#[derive(Clone)]
pub struct Client {
	endpoint: Url,
	pipeline: Pipeline,
	sync_tokens: SyncTokenCache,
}
impl Client {
	/// Builds a client authenticating with bearer tokens for `scopes`.
	pub fn with_credential(
		endpoint: &str,
		credential: Arc<dyn TokenCredential>,
		scopes: impl IntoIterator<Item = impl Into<String>>,
		options: ClientOptions,
	) -> Result<Self> {
		let endpoint = parse_endpoint(endpoint)?;
		let auth = BearerTokenPolicy::new(credential, scopes).allow_http(options.allow_http);

		Self::assemble(endpoint, Arc::new(auth), options)
	}

	/// Builds a client signing requests with the HMAC credential from a connection string.
	pub fn from_connection_string(raw: &str, options: ClientOptions) -> Result<Self> {
		let parsed = raw.parse::<ConnectionString>().map_err(ConfigError::from)?;
		let credential = HmacCredential::from_connection_string(&parsed)?;
		let endpoint = parse_endpoint(parsed.endpoint.as_str())?;

		Self::assemble(endpoint, Arc::new(HmacPolicy::new(credential)), options)
	}

	fn assemble(endpoint: Url, auth: Arc<dyn Policy>, options: ClientOptions) -> Result<Self> {
		let sync_tokens = SyncTokenCache::new();
		let mut builder = Pipeline::builder(options.transport()?).retry(options.retry.clone());

		for policy in options.per_call {
			builder = builder.per_call(policy);
		}

		builder = builder
			.per_retry(auth)
			.per_retry(Arc::new(SyncTokenPolicy::new(sync_tokens.clone())));

		for policy in options.per_retry {
			builder = builder.per_retry(policy);
		}

		Ok(Self { endpoint, pipeline: builder.build(), sync_tokens })
	}

	/// Service endpoint.
	pub fn endpoint(&self) -> &Url {
		&self.endpoint
	}

	/// Underlying pipeline.
	pub fn pipeline(&self) -> &Pipeline {
		&self.pipeline
	}

	/// Sync-token registry shared by every call on this client.
	pub fn sync_tokens(&self) -> &SyncTokenCache {
		&self.sync_tokens
	}

	/// Feeds externally obtained `,`-separated sync tokens into the registry.
	///
	/// Malformed input is rejected before anything is merged.
	pub fn set_sync_token(&self, raw: &str) -> Result<()> {
		self.sync_tokens.set(raw).map_err(|e| ConfigError::from(e).into())
	}

	/// Builds a request against the endpoint from a path template such as
	/// `/subscriptions/{subscriptionId}/vaults/{vaultName}?api-version=2023-07-01`.
	///
	/// Parameter values are percent-encoded as single path segments. An absent or empty value is
	/// a [`ConfigError::MissingParameter`].
	pub fn request(&self, method: Method, template: &str, params: &[(&str, &str)]) -> Result<Request> {
		let (path, query) = match template.split_once('?') {
			Some((path, query)) => (path, Some(query)),
			None => (template, None),
		};
		let mut url = self.endpoint.clone();

		{
			let mut segments = url.path_segments_mut().map_err(|_| {
				ConfigError::invalid_url(
					self.endpoint.as_str(),
					url::ParseError::RelativeUrlWithCannotBeABaseBase,
				)
			})?;

			segments.pop_if_empty();

			for raw in path.split('/').filter(|segment| !segment.is_empty()) {
				segments.push(&fill_segment(raw, params)?);
			}
		}

		if let Some(query) = query.filter(|query| !query.is_empty()) {
			url.set_query(Some(query));
		}

		Ok(Request::new(method, url))
	}

	/// Sends `request`, turning non-2xx responses into [`Error::Response`].
	pub async fn send(&self, request: &mut Request) -> Result<Response> {
		let response = self.pipeline.send(request).await?;

		if !response.is_success() {
			return Err(ResponseError::from_response(response).into());
		}

		Ok(response)
	}

	/// Sends the initiating request of a long-running operation and returns its poller.
	pub async fn begin_operation<T>(&self, mut request: Request) -> Result<Poller<T>>
	where
		T: DeserializeOwned,
	{
		let response = self.pipeline.send(&mut request).await?;

		Poller::from_response(self.pipeline.clone(), response, request.context().clone())
	}

	/// Continues an operation from a resume token produced by [`Poller::resume_token`].
	pub fn resume_operation<T>(&self, token: &str, context: Context) -> Result<Poller<T>>
	where
		T: DeserializeOwned,
	{
		Poller::from_resume_token(self.pipeline.clone(), token, context)
	}

	/// Pages through a list operation starting with `request`.
	pub fn pager<T>(&self, request: Request) -> Pager<T>
	where
		T: DeserializeOwned,
	{
		Pager::new(self.pipeline.clone(), request)
	}
}
impl Debug for Client {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("Client")
			.field("endpoint", &self.endpoint.as_str())
			.field("pipeline", &self.pipeline)
			.field("sync_tokens", &self.sync_tokens.len())
			.finish()
	}
}

fn parse_endpoint(raw: &str) -> Result<Url> {
	let url = Url::parse(raw).map_err(|e| ConfigError::invalid_url(raw, e))?;

	if url.cannot_be_a_base() {
		return Err(ConfigError::invalid_url(raw, url::ParseError::RelativeUrlWithCannotBeABaseBase)
			.into());
	}

	Ok(url)
}

fn fill_segment(raw: &str, params: &[(&str, &str)]) -> Result<String> {
	let mut filled = String::with_capacity(raw.len());
	let mut rest = raw;

	while let Some(open) = rest.find('{') {
		let Some(close) = rest[open..].find('}').map(|offset| open + offset) else {
			break;
		};
		let name = &rest[open + 1..close];
		let value = params
			.iter()
			.find(|(key, _)| *key == name)
			.map(|(_, value)| *value)
			.filter(|value| !value.is_empty())
			.ok_or_else(|| ConfigError::MissingParameter { name: name.to_owned() })?;

		filled.push_str(&rest[..open]);
		filled.push_str(value);
		rest = &rest[close + 1..];
	}

	filled.push_str(rest);

	Ok(filled)
}
