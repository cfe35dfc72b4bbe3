//! Bearer token policy backed by a shared, single-flight token cache.
//!
//! Concurrent calls read the cached token under a `RwLock`. When the token is missing, expiring
//! within [`AccessToken::REFRESH_WINDOW`], or past its refresh hint, one caller acquires the async
//! refresh guard and asks the credential; everyone else waits on the guard and reuses the result.
//!
//! A `401` carrying a `WWW-Authenticate` challenge may be answered once per kind: a
//! continuous-access-evaluation claims challenge (`error="insufficient_claims"`) is always answered
//! with a token carrying the decoded claims; any other challenge goes to the optional
//! [`ChallengeHandler`]. Answering re-acquires the token and replays the request.

// crates.io
use http::header::{AUTHORIZATION, WWW_AUTHENTICATE};
// self
use crate::{
	_prelude::*,
	auth::{AccessToken, Challenge, TokenCredential, TokenRequest, TokenSecret, parse_challenges},
	context::Context,
	error::ConfigError,
	http::{Request, Response},
	obs,
	pipeline::{Next, Policy, PolicyFuture},
};

/// Hook answering `401` challenges that are not claims challenges.
///
/// `Ok(Some(request))` acquires a token for `request` and replays the call once, `Ok(None)` returns
/// the `401` unchanged, and an error aborts the call.
pub type ChallengeHandler =
	Arc<dyn Fn(&Response, &[Challenge]) -> Result<Option<TokenRequest>> + Send + Sync>;

/// Per-retry policy attaching `Authorization: Bearer <token>`.
pub struct BearerTokenPolicy {
	credential: Arc<dyn TokenCredential>,
	scopes: Vec<String>,
	cache: RwLock<Option<AccessToken>>,
	refresh_guard: AsyncMutex<()>,
	allow_http: bool,
	on_challenge: Option<ChallengeHandler>,
}
impl BearerTokenPolicy {
	/// Creates a policy requesting tokens for `scopes`.
	pub fn new(
		credential: Arc<dyn TokenCredential>,
		scopes: impl IntoIterator<Item = impl Into<String>>,
	) -> Self {
		Self {
			credential,
			scopes: scopes.into_iter().map(Into::into).collect(),
			cache: RwLock::new(None),
			refresh_guard: AsyncMutex::new(()),
			allow_http: false,
			on_challenge: None,
		}
	}

	/// Installs a hook for challenges other than claims challenges.
	pub fn with_challenge_handler(
		mut self,
		handler: impl 'static + Send + Sync + Fn(&Response, &[Challenge]) -> Result<Option<TokenRequest>>,
	) -> Self {
		self.on_challenge = Some(Arc::new(handler));

		self
	}

	/// Permits sending tokens over plain `http` (local emulators only).
	pub fn allow_http(mut self, allow: bool) -> Self {
		self.allow_http = allow;

		self
	}

	/// Scopes requested from the credential.
	pub fn scopes(&self) -> &[String] {
		&self.scopes
	}

	/// Drops the cached token so the next call acquires a new one.
	pub fn invalidate(&self) {
		*self.cache.write() = None;
	}

	async fn token(&self, context: &Context) -> Result<TokenSecret> {
		if let Some(token) = self.cached(OffsetDateTime::now_utc()) {
			return Ok(token);
		}

		let _singleflight = context.race(async { Ok(self.refresh_guard.lock().await) }).await?;
		let now = OffsetDateTime::now_utc();

		if let Some(token) = self.cached(now) {
			return Ok(token);
		}

		match context.race(self.credential.get_token(&self.scopes)).await {
			Ok(fresh) => {
				let secret = fresh.token.clone();

				*self.cache.write() = Some(fresh);

				Ok(secret)
			},
			Err(err) if matches!(err, Error::Credential { .. }) => {
				let still_valid = self
					.cache
					.read()
					.as_ref()
					.filter(|token| !token.is_expired_at(now))
					.map(|token| token.token.clone());

				match still_valid {
					Some(secret) => {
						obs::token_refresh_failed(&err);

						Ok(secret)
					},
					None => Err(err),
				}
			},
			Err(err) => Err(err),
		}
	}

	// The rejected token is never a fallback here.
	async fn token_for(&self, context: &Context, token_request: &TokenRequest) -> Result<TokenSecret> {
		let _singleflight = context.race(async { Ok(self.refresh_guard.lock().await) }).await?;
		let fresh = context.race(self.credential.get_token_with(token_request)).await?;
		let secret = fresh.token.clone();

		*self.cache.write() = Some(fresh);

		Ok(secret)
	}

	/// Picks the token request answering `response`, or `None` to hand the `401` back.
	fn answer(
		&self,
		response: &Response,
		answered: &mut Answered,
	) -> Result<Option<(String, TokenRequest)>> {
		let challenges =
			response.header(WWW_AUTHENTICATE.as_str()).map(parse_challenges).unwrap_or_default();

		if let Some(challenge) = challenges.iter().find(|c| c.is_claims_challenge()) {
			if answered.claims {
				return Ok(None);
			}

			answered.claims = true;

			let Some(claims) = challenge.claims() else {
				return Ok(None);
			};
			let request = TokenRequest::new(self.scopes.clone()).with_claims(claims);

			return Ok(Some((challenge.scheme.clone(), request)));
		}

		let (Some(handler), Some(first)) = (&self.on_challenge, challenges.first()) else {
			return Ok(None);
		};

		if answered.hook || answered.claims {
			return Ok(None);
		}

		answered.hook = true;

		Ok(handler(response, &challenges)?.map(|request| (first.scheme.clone(), request)))
	}

	fn cached(&self, now: OffsetDateTime) -> Option<TokenSecret> {
		self.cache
			.read()
			.as_ref()
			.filter(|token| !token.needs_refresh_at(now))
			.map(|token| token.token.clone())
	}
}
impl Policy for BearerTokenPolicy {
	fn send<'a>(&'a self, request: &'a mut Request, next: Next<'a>) -> PolicyFuture<'a> {
		Box::pin(async move {
			let scheme = request.url().scheme();

			if scheme != "https" && !self.allow_http {
				return Err(ConfigError::InsecureTransport { scheme: scheme.to_owned() }.into());
			}

			let token = self.token(request.context()).await?;

			authorize(request, &token)?;

			let mut response = next.run(request).await?;
			let mut answered = Answered::default();

			while response.status() == StatusCode::UNAUTHORIZED {
				self.invalidate();

				let Some((scheme, token_request)) = self.answer(&response, &mut answered)? else {
					break;
				};

				obs::auth_challenge_answered(&scheme, token_request.claims.is_some());

				let token = self.token_for(request.context(), &token_request).await?;

				authorize(request, &token)?;
				response = next.run(request).await?;
			}

			Ok(response)
		})
	}
}
impl Debug for BearerTokenPolicy {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("BearerTokenPolicy")
			.field("scopes", &self.scopes)
			.field("allow_http", &self.allow_http)
			.field("challenge_handler", &self.on_challenge.is_some())
			.finish()
	}
}

#[derive(Default)]
struct Answered {
	claims: bool,
	hook: bool,
}

fn authorize(request: &mut Request, token: &TokenSecret) -> Result<()> {
	let mut value = HeaderValue::from_str(&format!("Bearer {}", token.expose()))
		.map_err(|_| ConfigError::InvalidHeader { name: AUTHORIZATION.to_string() })?;

	value.set_sensitive(true);
	request.headers_mut().insert(AUTHORIZATION, value);

	Ok(())
}

#[cfg(test)]
mod tests {
	// std
	use std::sync::atomic::{AtomicUsize, Ordering};
	// self
	use super::*;
	use crate::{_preludet::*, auth::CredentialFuture, pipeline::Pipeline};

	#[derive(Debug, ThisError)]
	#[error("identity endpoint unavailable")]
	struct Unavailable;

	struct CountingCredential {
		calls: AtomicUsize,
		lifetime: Duration,
		fail_after: Option<usize>,
		requests: Mutex<Vec<TokenRequest>>,
	}
	impl CountingCredential {
		fn new(lifetime: Duration) -> Arc<Self> {
			Self::failing_after(lifetime, None)
		}

		fn failing_after(lifetime: Duration, fail_after: Option<usize>) -> Arc<Self> {
			Arc::new(Self {
				calls: AtomicUsize::new(0),
				lifetime,
				fail_after,
				requests: Mutex::new(Vec::new()),
			})
		}

		fn calls(&self) -> usize {
			self.calls.load(Ordering::SeqCst)
		}

		fn requests(&self) -> Vec<TokenRequest> {
			self.requests.lock().clone()
		}
	}
	impl TokenCredential for CountingCredential {
		fn get_token<'a>(&'a self, scopes: &'a [String]) -> CredentialFuture<'a> {
			Box::pin(async move {
				let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

				if self.fail_after.is_some_and(|limit| n > limit) {
					return Err(Error::credential(Unavailable));
				}

				tokio::time::sleep(std::time::Duration::from_millis(10)).await;

				Ok(AccessToken::new(
					format!("token-{n}-{}", scopes.join(",")),
					OffsetDateTime::now_utc() + self.lifetime,
				))
			})
		}

		fn get_token_with<'a>(&'a self, request: &'a TokenRequest) -> CredentialFuture<'a> {
			self.requests.lock().push(request.clone());

			self.get_token(&request.scopes)
		}
	}

	fn pipeline(transport: Arc<ScriptedTransport>, policy: Arc<BearerTokenPolicy>) -> Pipeline {
		scripted_pipeline(transport, [policy as Arc<dyn Policy>])
	}

	fn auth_header(request: &Request) -> String {
		request
			.headers()
			.get(AUTHORIZATION)
			.and_then(|v| v.to_str().ok())
			.unwrap_or_default()
			.to_owned()
	}

	fn get(target: &str) -> Request {
		Request::new(Method::GET, url(target))
	}

	#[tokio::test]
	async fn attaches_cached_token_across_calls() {
		let credential = CountingCredential::new(Duration::hours(1));
		let policy = Arc::new(BearerTokenPolicy::new(credential.clone(), ["https://mgmt/.default"]));
		let transport = Arc::new(ScriptedTransport::new([
			Ok(status_response(200)),
			Ok(status_response(200)),
		]));
		let pipeline = pipeline(transport.clone(), policy);

		pipeline.send(&mut get("https://example.com/a")).await.expect("First call should succeed.");
		pipeline.send(&mut get("https://example.com/b")).await.expect("Second call should succeed.");

		let seen = transport.requests();

		assert_eq!(credential.calls(), 1);
		assert_eq!(auth_header(&seen[0]), "Bearer token-1-https://mgmt/.default");
		assert_eq!(auth_header(&seen[1]), auth_header(&seen[0]));
	}

	#[tokio::test]
	async fn concurrent_calls_share_one_acquisition() {
		let credential = CountingCredential::new(Duration::hours(1));
		let policy = Arc::new(BearerTokenPolicy::new(credential.clone(), ["scope"]));
		let transport = Arc::new(ScriptedTransport::new((0..8).map(|_| Ok(status_response(200)))));
		let pipeline = pipeline(transport.clone(), policy);
		let handles: Vec<_> = (0..8)
			.map(|_| {
				let pipeline = pipeline.clone();

				tokio::spawn(async move { pipeline.send(&mut get("https://example.com/x")).await })
			})
			.collect();

		for handle in handles {
			handle.await.expect("Task should join.").expect("Call should succeed.");
		}

		assert_eq!(credential.calls(), 1);
		assert_eq!(transport.calls(), 8);
	}

	#[tokio::test]
	async fn expiring_token_is_refreshed() {
		let credential = CountingCredential::new(Duration::minutes(3));
		let policy = Arc::new(BearerTokenPolicy::new(credential.clone(), ["scope"]));
		let transport = Arc::new(ScriptedTransport::default());
		let pipeline = pipeline(transport.clone(), policy);

		transport.push(Ok(status_response(200)));
		transport.push(Ok(status_response(200)));
		pipeline.send(&mut get("https://example.com/a")).await.expect("First call should succeed.");
		pipeline.send(&mut get("https://example.com/b")).await.expect("Second call should succeed.");

		assert_eq!(credential.calls(), 2);
	}

	#[tokio::test]
	async fn refresh_failure_reuses_unexpired_token() {
		let credential = CountingCredential::failing_after(Duration::minutes(3), Some(1));
		let policy = Arc::new(BearerTokenPolicy::new(credential.clone(), ["scope"]));
		let transport = Arc::new(ScriptedTransport::new([
			Ok(status_response(200)),
			Ok(status_response(200)),
		]));
		let pipeline = pipeline(transport.clone(), policy);

		pipeline.send(&mut get("https://example.com/a")).await.expect("First call should succeed.");
		pipeline
			.send(&mut get("https://example.com/b"))
			.await
			.expect("Still-valid token should be reused.");

		let seen = transport.requests();

		assert_eq!(credential.calls(), 2);
		assert_eq!(auth_header(&seen[1]), "Bearer token-1-scope");
	}

	#[tokio::test]
	async fn credential_failure_without_cache_surfaces() {
		let credential = CountingCredential::failing_after(Duration::hours(1), Some(0));
		let policy = Arc::new(BearerTokenPolicy::new(credential, ["scope"]));
		let transport = Arc::new(ScriptedTransport::default());
		let err = pipeline(transport.clone(), policy)
			.send(&mut get("https://example.com/a"))
			.await
			.expect_err("Credential failure should surface.");

		assert!(matches!(err, Error::Credential { .. }));
		assert_eq!(transport.calls(), 0);
	}

	#[tokio::test]
	async fn plain_http_is_rejected_unless_allowed() {
		let credential = CountingCredential::new(Duration::hours(1));
		let strict = Arc::new(BearerTokenPolicy::new(credential.clone(), ["scope"]));
		let transport = Arc::new(ScriptedTransport::new([Ok(status_response(200))]));
		let err = pipeline(transport.clone(), strict)
			.send(&mut get("http://localhost:8080/a"))
			.await
			.expect_err("Plain HTTP should be rejected.");

		assert!(matches!(err, Error::Config(ConfigError::InsecureTransport { ref scheme }) if scheme == "http"));
		assert_eq!(transport.calls(), 0);
		assert_eq!(credential.calls(), 0);

		let relaxed = Arc::new(BearerTokenPolicy::new(credential, ["scope"]).allow_http(true));

		pipeline(transport.clone(), relaxed)
			.send(&mut get("http://localhost:8080/a"))
			.await
			.expect("Emulator call should succeed.");

		assert_eq!(transport.calls(), 1);
	}

	#[tokio::test]
	async fn unauthorized_response_drops_cache() {
		let credential = CountingCredential::new(Duration::hours(1));
		let policy = Arc::new(BearerTokenPolicy::new(credential.clone(), ["scope"]));
		let transport = Arc::new(ScriptedTransport::new([
			Ok(status_response(401)),
			Ok(status_response(200)),
		]));
		let pipeline = pipeline(transport.clone(), policy);
		let first = pipeline
			.send(&mut get("https://example.com/a"))
			.await
			.expect("401 is a completed exchange.");

		assert_eq!(first.status(), StatusCode::UNAUTHORIZED);

		pipeline.send(&mut get("https://example.com/a")).await.expect("Second call should succeed.");

		let seen = transport.requests();

		assert_eq!(credential.calls(), 2);
		assert_eq!(auth_header(&seen[1]), "Bearer token-2-scope");
	}

	fn challenged(challenge: &str) -> Scripted {
		Ok(status_response(401).with_header("WWW-Authenticate", challenge))
	}

	const CAE: &str = r#"Bearer realm="", authorization_uri="https://login.example.com", error="insufficient_claims", claims="eyJhY2Nlc3NfdG9rZW4iOnsibmJmIjp7ImVzc2VudGlhbCI6dHJ1ZX19fQ==""#;

	#[tokio::test]
	async fn claims_challenge_reacquires_and_replays_once() {
		let credential = CountingCredential::new(Duration::hours(1));
		let policy = Arc::new(BearerTokenPolicy::new(credential.clone(), ["scope"]));
		let transport = Arc::new(ScriptedTransport::new([challenged(CAE), Ok(status_response(200))]));
		let mut request = get("https://example.com/a")
			.with_body("payload", "text/plain")
			.expect("Body fixture should attach.");
		let response = pipeline(transport.clone(), policy)
			.send(&mut request)
			.await
			.expect("Challenge should be answered.");
		let seen = transport.requests();

		assert_eq!(response.status(), StatusCode::OK);
		assert_eq!(credential.calls(), 2);
		assert_eq!(credential.requests(), [TokenRequest::new(["scope"])
			.with_claims(r#"{"access_token":{"nbf":{"essential":true}}}"#)]);
		assert_eq!(auth_header(&seen[0]), "Bearer token-1-scope");
		assert_eq!(auth_header(&seen[1]), "Bearer token-2-scope");
		assert_eq!(seen[1].body().map(|b| &b[..]), Some(&b"payload"[..]));
	}

	#[tokio::test]
	async fn unanswerable_challenges_return_the_401() {
		let repeat = r#"Bearer error="insufficient_claims", claims="Mg==""#;
		let invalid = r#"Bearer claims="not base64", error="insufficient_claims""#;
		let plain = r#"Bearer authorization_uri="https://login.example.com", error="invalid_token""#;

		for (script, expected_calls, last) in [
			(vec![challenged(CAE), challenged(repeat)], 2, repeat),
			(vec![challenged(invalid)], 1, invalid),
			(vec![challenged(plain)], 1, plain),
		] {
			let credential = CountingCredential::new(Duration::hours(1));
			let policy = Arc::new(BearerTokenPolicy::new(credential.clone(), ["scope"]));
			let transport = Arc::new(ScriptedTransport::new(script));
			let response = pipeline(transport.clone(), policy)
				.send(&mut get("https://example.com/a"))
				.await
				.expect("401 is a completed exchange.");

			assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
			assert_eq!(response.header("www-authenticate"), Some(last));
			assert_eq!(transport.calls(), expected_calls);
			assert_eq!(credential.calls(), expected_calls);
		}
	}

	#[tokio::test]
	async fn challenge_handler_answers_other_challenges() {
		let credential = CountingCredential::new(Duration::hours(1));
		let hook_calls = Arc::new(AtomicUsize::new(0));
		let policy = {
			let hook_calls = hook_calls.clone();

			BearerTokenPolicy::new(credential.clone(), ["scope"]).with_challenge_handler(
				move |response, challenges| {
					hook_calls.fetch_add(1, Ordering::SeqCst);

					assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

					Ok(challenges
						.iter()
						.find_map(|c| c.param("resource"))
						.map(|resource| TokenRequest::new([format!("{resource}/.default")])))
				},
			)
		};
		let transport = Arc::new(ScriptedTransport::new([
			challenged(r#"Bearer authorization_uri="https://login.example.com", resource="https://vault.example.com""#),
			challenged(CAE),
			Ok(status_response(200)),
		]));
		let response = pipeline(transport.clone(), Arc::new(policy))
			.send(&mut get("https://example.com/secrets/s"))
			.await
			.expect("Both challenges should be answered.");
		let seen = transport.requests();

		assert_eq!(response.status(), StatusCode::OK);
		assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
		assert_eq!(auth_header(&seen[1]), "Bearer token-2-https://vault.example.com/.default");
		assert_eq!(auth_header(&seen[2]), "Bearer token-3-scope");
		assert_eq!(credential.requests().len(), 2);
	}

	#[tokio::test]
	async fn challenge_handler_errors_abort_the_call() {
		let credential = CountingCredential::new(Duration::hours(1));
		let policy = BearerTokenPolicy::new(credential.clone(), ["scope"])
			.with_challenge_handler(|_, _| Err(Error::credential(Unavailable)));
		let transport = Arc::new(ScriptedTransport::new([challenged(r#"Bearer key="value""#)]));
		let err = pipeline(transport.clone(), Arc::new(policy))
			.send(&mut get("https://example.com/a"))
			.await
			.expect_err("Hook failure should surface.");

		assert!(matches!(err, Error::Credential { .. }));
		assert_eq!(transport.calls(), 1);
		assert_eq!(credential.calls(), 1);
	}
}
