//! Composable HTTP pipeline runtime for generated resource-management clients: retry, bearer and
//! HMAC authentication, sync tokens, long-running operation pollers, and pagers in one crate.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod auth;
pub mod client;
pub mod context;
pub mod error;
pub mod http;
pub mod lro;
pub mod obs;
pub mod pager;
pub mod pipeline;
pub mod retry;
pub mod sync_token;
pub mod transport;
#[cfg(any(test, feature = "test"))]
pub mod _preludet {
	//! Convenience re-exports and helpers for integration tests; enabled via `cfg(test)` or the
	//! `test` crate feature.

	pub use crate::_prelude::*;

	// std
	use std::{collections::VecDeque, sync::atomic::AtomicUsize};
	// self
	use crate::{
		error::TransportError,
		http::{Request, Response},
		pipeline::{Pipeline, Policy},
		retry::RetryOptions,
		transport::{Transport, TransportFuture},
	};

	/// One scripted transport outcome.
	pub type Scripted = std::result::Result<Response, TransportError>;

	/// Transport that replays a fixed script of outcomes and records every request it sees.
	///
	/// Once the script runs dry the transport answers with `500 Internal Server Error` so a test
	/// that over-calls fails loudly instead of hanging.
	#[derive(Debug, Default)]
	pub struct ScriptedTransport {
		script: Mutex<VecDeque<Scripted>>,
		seen: Mutex<Vec<Request>>,
		calls: AtomicUsize,
	}
	impl ScriptedTransport {
		/// Builds a transport that replays `script` in order.
		pub fn new(script: impl IntoIterator<Item = Scripted>) -> Self {
			Self {
				script: Mutex::new(script.into_iter().collect()),
				seen: Default::default(),
				calls: Default::default(),
			}
		}

		/// Appends one more outcome to the script.
		pub fn push(&self, outcome: Scripted) {
			self.script.lock().push_back(outcome);
		}

		/// Number of exchanges performed so far.
		pub fn calls(&self) -> usize {
			self.calls.load(std::sync::atomic::Ordering::SeqCst)
		}

		/// Snapshot of every request observed, in order.
		pub fn requests(&self) -> Vec<Request> {
			self.seen.lock().clone()
		}
	}
	impl Transport for ScriptedTransport {
		fn send<'a>(&'a self, request: &'a Request) -> TransportFuture<'a> {
			Box::pin(async move {
				self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
				self.seen.lock().push(request.clone());

				let next = self.script.lock().pop_front();

				match next {
					Some(Ok(response)) => Ok(response.for_request(request)),
					Some(Err(err)) => Err(err),
					None => Ok(Response::new(StatusCode::INTERNAL_SERVER_ERROR).for_request(request)),
				}
			})
		}
	}

	/// Retry options with millisecond delays so retry-heavy tests stay fast.
	pub fn fast_retry_options() -> RetryOptions {
		RetryOptions::default()
			.with_retry_delay(Duration::milliseconds(1))
			.with_max_retry_delay(Duration::milliseconds(10))
	}

	/// Builds a pipeline over `transport` with fast retries and the provided per-retry policies.
	pub fn scripted_pipeline(
		transport: Arc<ScriptedTransport>,
		per_retry: impl IntoIterator<Item = Arc<dyn Policy>>,
	) -> Pipeline {
		let mut builder = Pipeline::builder(transport).retry(fast_retry_options());

		for policy in per_retry {
			builder = builder.per_retry(policy);
		}

		builder.build()
	}

	/// Response with the given status and a JSON body.
	pub fn json_response(status: u16, body: &str) -> Response {
		Response::new(StatusCode::from_u16(status).expect("Test status code should be valid."))
			.with_header("content-type", "application/json")
			.with_body(body.to_owned())
	}

	/// Response with the given status and no body.
	pub fn status_response(status: u16) -> Response {
		Response::new(StatusCode::from_u16(status).expect("Test status code should be valid."))
	}

	/// Parses a URL fixture.
	pub fn url(value: &str) -> Url {
		Url::parse(value).expect("Test URL fixture should parse.")
	}

	#[cfg(feature = "reqwest")]
	/// Pipeline over the reqwest transport with fast retries, for `httpmock`-backed tests.
	pub fn reqwest_pipeline(per_retry: impl IntoIterator<Item = Arc<dyn Policy>>) -> Pipeline {
		let transport = crate::transport::ReqwestTransport::default();
		let mut builder = Pipeline::builder(Arc::new(transport)).retry(fast_retry_options());

		for policy in per_retry {
			builder = builder.per_retry(policy);
		}

		builder.build()
	}
}

mod _prelude {
	pub use std::{
		collections::{BTreeMap, HashMap},
		error::Error as StdError,
		fmt::{Debug, Display, Formatter, Result as FmtResult},
		future::Future,
		pin::Pin,
		str::FromStr,
		sync::Arc,
	};

	pub use async_lock::Mutex as AsyncMutex;
	pub use bytes::Bytes;
	pub use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
	pub use parking_lot::{Mutex, RwLock};
	#[cfg(feature = "reqwest")]
	pub use reqwest::{Client as ReqwestClient, Error as ReqwestError};
	pub use serde::{Deserialize, Serialize};
	pub use thiserror::Error as ThisError;
	pub use time::{Duration, OffsetDateTime};
	pub use url::Url;

	pub use crate::error::{Error, Result};
}

#[cfg(feature = "reqwest")] pub use reqwest;
pub use url;
#[cfg(test)] use {color_eyre as _, httpmock as _};
