//! Transport leaf of the pipeline.
//!
//! [`Transport`] is the runtime's only dependency on an HTTP stack. Implementations perform
//! exactly one network exchange per [`Transport::send`] call and return a fully buffered
//! [`Response`]; the pipeline layers retry, auth, and cancellation on top. Implementations must
//! be `Send + Sync + 'static` so one transport can be shared by every client built on it.

// crates.io
#[cfg(feature = "reqwest")] use reqwest::header::CONTENT_LENGTH;
// self
use crate::{
	_prelude::*,
	error::TransportError,
	http::{Request, Response},
};

/// Boxed future returned by [`Transport::send`].
pub type TransportFuture<'a> =
	Pin<Box<dyn Future<Output = Result<Response, TransportError>> + 'a + Send>>;

/// Performs a single network exchange.
pub trait Transport
where
	Self: 'static + Send + Sync,
{
	/// Sends `request` once and buffers the response.
	fn send<'a>(&'a self, request: &'a Request) -> TransportFuture<'a>;
}

/// Adapter turning a closure into a [`Transport`]; handy for fakes.
pub struct TransportFn<F>(pub F);
impl<F> Transport for TransportFn<F>
where
	F: 'static + Send + Sync + Fn(&Request) -> Result<Response, TransportError>,
{
	fn send<'a>(&'a self, request: &'a Request) -> TransportFuture<'a> {
		let outcome = (self.0)(request).map(|response| response.for_request(request));

		Box::pin(async move { outcome })
	}
}
impl<F> Debug for TransportFn<F> {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str("TransportFn(..)")
	}
}

/// Thin wrapper around [`ReqwestClient`] so shared HTTP behavior lives in one place.
///
/// Redirects must not be followed: long-running operations and pagers read `Location` headers
/// themselves. The default client disables redirects; configure any custom [`ReqwestClient`]
/// the same way.
#[cfg(feature = "reqwest")]
#[derive(Clone, Debug)]
pub struct ReqwestTransport(pub ReqwestClient);
#[cfg(feature = "reqwest")]
impl ReqwestTransport {
	/// Wraps an existing reqwest [`ReqwestClient`].
	pub fn with_client(client: ReqwestClient) -> Self {
		Self(client)
	}

	/// Builds a client with redirects disabled.
	pub fn try_new() -> Result<Self> {
		let client = ReqwestClient::builder()
			.redirect(reqwest::redirect::Policy::none())
			.build()
			.map_err(crate::error::ConfigError::http_client_build)?;

		Ok(Self(client))
	}
}
#[cfg(feature = "reqwest")]
impl Default for ReqwestTransport {
	fn default() -> Self {
		Self::try_new().unwrap_or_else(|_| Self(ReqwestClient::default()))
	}
}
#[cfg(feature = "reqwest")]
impl Transport for ReqwestTransport {
	fn send<'a>(&'a self, request: &'a Request) -> TransportFuture<'a> {
		Box::pin(async move {
			let mut builder = self
				.0
				.request(request.method().clone(), request.url().clone())
				.headers(request.headers().clone());

			match request.body() {
				Some(body) => builder = builder.body(body.clone()),
				None if body_expected(request.method()) => builder = builder.header(CONTENT_LENGTH, 0),
				None => {},
			}

			let response = builder.send().await?;
			let status = response.status();
			let headers = response.headers().to_owned();
			let body = response.bytes().await?;

			Ok(Response::from_parts(status, headers, body).for_request(request))
		})
	}
}

#[cfg(feature = "reqwest")]
fn body_expected(method: &Method) -> bool {
	matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}
