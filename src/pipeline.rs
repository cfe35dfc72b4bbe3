//! Policy chain and the pipeline that drives it.
//!
//! A [`Pipeline`] is an immutable, ordered list of [`Policy`] values terminating in a
//! [`Transport`]. Each call threads one [`Request`] through the policies outermost first; every
//! policy receives a [`Next`] handle and either forwards through [`Next::run`] (possibly several
//! times, as the retry policy does) or short-circuits with its own response or error. `Next`
//! only exposes the immediately following link, so no policy can skip ahead.
//!
//! [`PipelineBuilder`] fixes the layout used by every client:
//! `per_call -> retry -> per_retry -> transport`. Per-retry policies (auth, sync tokens) run once
//! per attempt so signatures and headers are rebuilt for every retry.

// self
use crate::{
	_prelude::*,
	http::{Request, Response},
	obs::{self, CallKind, CallOutcome, CallSpan},
	retry::{RetryOptions, RetryPolicy},
	transport::Transport,
};

/// Boxed future returned by [`Policy::send`] and [`Next::run`].
pub type PolicyFuture<'a> = Pin<Box<dyn Future<Output = Result<Response>> + 'a + Send>>;

/// A composable unit of request/response middleware.
pub trait Policy
where
	Self: Send + Sync,
{
	/// Processes `request`, forwarding through `next` to continue the chain.
	fn send<'a>(&'a self, request: &'a mut Request, next: Next<'a>) -> PolicyFuture<'a>;
}

/// Handle to the remainder of the chain after the current policy.
#[derive(Clone, Copy)]
pub struct Next<'a> {
	policies: &'a [Arc<dyn Policy>],
	transport: &'a dyn Transport,
}
impl<'a> Next<'a> {
	/// Invokes the next link; at the end of the chain this performs one transport exchange,
	/// raced against the request's cancellation signal and deadline.
	pub fn run<'r>(&self, request: &'r mut Request) -> PolicyFuture<'r>
	where
		'a: 'r,
	{
		match self.policies.split_first() {
			Some((head, rest)) =>
				head.send(request, Next { policies: rest, transport: self.transport }),
			None => {
				let transport = self.transport;

				Box::pin(async move {
					let request = &*request;
					let context = request.context().clone();

					context
						.race(async { transport.send(request).await.map_err(Error::from) })
						.await
				})
			},
		}
	}

	/// Number of links left before the transport.
	pub fn remaining(&self) -> usize {
		self.policies.len()
	}
}
impl Debug for Next<'_> {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("Next").field("remaining", &self.policies.len()).finish()
	}
}

/// Adapter turning an async closure into a [`Policy`].
///
/// The closure receives the request and the [`Next`] handle and must return a boxed future,
/// typically `Box::pin(async move { next.run(request).await })`.
pub struct PolicyFn<F>(F);
impl<F> PolicyFn<F>
where
	F: Send + Sync + for<'a> Fn(&'a mut Request, Next<'a>) -> PolicyFuture<'a>,
{
	/// Wraps `f`.
	pub fn new(f: F) -> Self {
		Self(f)
	}
}
impl<F> Policy for PolicyFn<F>
where
	F: Send + Sync + for<'a> Fn(&'a mut Request, Next<'a>) -> PolicyFuture<'a>,
{
	fn send<'a>(&'a self, request: &'a mut Request, next: Next<'a>) -> PolicyFuture<'a> {
		(self.0)(request, next)
	}
}
impl<F> Debug for PolicyFn<F> {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str("PolicyFn(..)")
	}
}

/// Ordered policy chain plus terminal transport; cheap to clone and share.
#[derive(Clone)]
pub struct Pipeline {
	policies: Arc<[Arc<dyn Policy>]>,
	transport: Arc<dyn Transport>,
}
impl Pipeline {
	/// Builds a pipeline from an explicit policy order.
	pub fn new(
		transport: Arc<dyn Transport>,
		policies: impl IntoIterator<Item = Arc<dyn Policy>>,
	) -> Self {
		Self { policies: policies.into_iter().collect(), transport }
	}

	/// Starts a builder with the standard `per_call -> retry -> per_retry` layout.
	pub fn builder(transport: Arc<dyn Transport>) -> PipelineBuilder {
		PipelineBuilder::new(transport)
	}

	/// Number of policies in the chain.
	pub fn len(&self) -> usize {
		self.policies.len()
	}

	/// Returns `true` when the chain holds no policies.
	pub fn is_empty(&self) -> bool {
		self.policies.is_empty()
	}

	/// Runs one logical call through the chain.
	///
	/// The request body is already replayable (buffered [`Bytes`]), so retrying policies may
	/// invoke the rest of the chain any number of times. An already-cancelled or expired context
	/// fails before any policy runs.
	pub async fn send(&self, request: &mut Request) -> Result<Response> {
		const KIND: CallKind = CallKind::Pipeline;

		request.context().check()?;
		obs::record_call_outcome(KIND, CallOutcome::Attempt);

		let span = CallSpan::new(KIND, "send");
		let next = Next { policies: &self.policies, transport: self.transport.as_ref() };
		let result = span.instrument(next.run(request)).await;

		match &result {
			Ok(_) => obs::record_call_outcome(KIND, CallOutcome::Success),
			Err(_) => obs::record_call_outcome(KIND, CallOutcome::Failure),
		}

		result
	}
}
impl Debug for Pipeline {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("Pipeline").field("policies", &self.policies.len()).finish()
	}
}

/// Builder for [`Pipeline`] values.
pub struct PipelineBuilder {
	transport: Arc<dyn Transport>,
	per_call: Vec<Arc<dyn Policy>>,
	retry: Option<RetryPolicy>,
	per_retry: Vec<Arc<dyn Policy>>,
}
impl PipelineBuilder {
	/// Creates a builder with default retry options and no extra policies.
	pub fn new(transport: Arc<dyn Transport>) -> Self {
		Self {
			transport,
			per_call: Vec::new(),
			retry: Some(RetryPolicy::new(RetryOptions::default())),
			per_retry: Vec::new(),
		}
	}

	/// Appends a policy that runs once per logical call, before retries.
	pub fn per_call(mut self, policy: Arc<dyn Policy>) -> Self {
		self.per_call.push(policy);

		self
	}

	/// Appends a policy that runs once per attempt, after the retry policy.
	pub fn per_retry(mut self, policy: Arc<dyn Policy>) -> Self {
		self.per_retry.push(policy);

		self
	}

	/// Replaces the retry options.
	pub fn retry(self, options: RetryOptions) -> Self {
		self.retry_policy(RetryPolicy::new(options))
	}

	/// Replaces the retry policy (for example, one with a custom predicate).
	pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
		self.retry = Some(policy);

		self
	}

	/// Removes the retry policy entirely.
	pub fn without_retry(mut self) -> Self {
		self.retry = None;

		self
	}

	/// Freezes the chain.
	pub fn build(self) -> Pipeline {
		let retry = self.retry.map(|policy| Arc::new(policy) as Arc<dyn Policy>);
		let policies = self.per_call.into_iter().chain(retry).chain(self.per_retry);

		Pipeline::new(self.transport, policies)
	}
}
impl Debug for PipelineBuilder {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("PipelineBuilder")
			.field("per_call", &self.per_call.len())
			.field("retry", &self.retry.is_some())
			.field("per_retry", &self.per_retry.len())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	// std
	use std::sync::atomic::{AtomicBool, Ordering};
	// self
	use super::*;
	use crate::{
		_preludet::*,
		context::{CancellationSignal, Context},
		error::TransportError,
		transport::TransportFn,
	};

	struct Recorder {
		name: &'static str,
		log: Arc<Mutex<Vec<String>>>,
		forwarded: AtomicBool,
	}
	impl Recorder {
		fn new(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
			Arc::new(Self { name, log: log.clone(), forwarded: AtomicBool::new(false) })
		}
	}
	impl Policy for Recorder {
		fn send<'a>(&'a self, request: &'a mut Request, next: Next<'a>) -> PolicyFuture<'a> {
			Box::pin(async move {
				self.log.lock().push(format!("{} down", self.name));
				request.append_header("x-visited", self.name)?;
				self.forwarded.store(true, Ordering::SeqCst);

				let response = next.run(request).await;

				self.log.lock().push(format!("{} up", self.name));

				response
			})
		}
	}

	fn get() -> Request {
		Request::new(Method::GET, url("https://example.com/items"))
	}

	#[tokio::test]
	async fn policies_run_in_order_and_unwind_in_reverse() {
		let log = Arc::new(Mutex::new(Vec::new()));
		let transport = Arc::new(ScriptedTransport::new([Ok(status_response(200))]));
		let outer = Recorder::new("outer", &log);
		let inner = Recorder::new("inner", &log);
		let pipeline = Pipeline::new(transport.clone(), [
			outer.clone() as Arc<dyn Policy>,
			inner.clone() as Arc<dyn Policy>,
		]);
		let response =
			pipeline.send(&mut get()).await.expect("Pipeline call should succeed.");

		assert_eq!(response.status(), StatusCode::OK);
		assert_eq!(*log.lock(), ["outer down", "inner down", "inner up", "outer up"]);
		assert!(outer.forwarded.load(Ordering::SeqCst));
		assert!(inner.forwarded.load(Ordering::SeqCst));
		assert_eq!(transport.calls(), 1);

		let seen = transport.requests();
		let visited: Vec<_> = seen[0].headers().get_all("x-visited").iter().collect();

		assert_eq!(visited, ["outer", "inner"]);
	}

	#[tokio::test]
	async fn short_circuit_skips_transport() {
		let transport = Arc::new(ScriptedTransport::default());
		let fake = PolicyFn::new(|request, _next| {
			let response = Response::new(StatusCode::NO_CONTENT).for_request(request);

			Box::pin(async move { Ok(response) })
		});
		let pipeline = Pipeline::new(transport.clone(), [Arc::new(fake) as Arc<dyn Policy>]);
		let response =
			pipeline.send(&mut get()).await.expect("Fabricated response should be returned.");

		assert_eq!(response.status(), StatusCode::NO_CONTENT);
		assert_eq!(transport.calls(), 0);
	}

	#[tokio::test]
	async fn builder_places_retry_between_per_call_and_per_retry() {
		let log = Arc::new(Mutex::new(Vec::new()));
		let transport = Arc::new(ScriptedTransport::new([
			Ok(status_response(503)),
			Ok(status_response(200)),
		]));
		let pipeline = Pipeline::builder(transport.clone())
			.retry(fast_retry_options())
			.per_call(Recorder::new("call", &log))
			.per_retry(Recorder::new("try", &log))
			.build();

		pipeline.send(&mut get()).await.expect("Retried call should succeed.");

		assert_eq!(pipeline.len(), 3);
		assert_eq!(*log.lock(), ["call down", "try down", "try up", "try down", "try up", "call up"]);
		assert_eq!(transport.calls(), 2);
	}

	#[tokio::test]
	async fn cancelled_request_never_reaches_transport() {
		let transport = Arc::new(ScriptedTransport::new([Ok(status_response(200))]));
		let pipeline = Pipeline::builder(transport.clone()).build();
		let signal = CancellationSignal::new();

		signal.cancel();

		let mut request = get().with_context(Context::new().with_signal(signal));
		let err = pipeline.send(&mut request).await.expect_err("Cancelled call should fail.");

		assert!(matches!(err, Error::Canceled));
		assert_eq!(transport.calls(), 0);
	}

	#[tokio::test]
	async fn closure_transport_without_retry_runs_once() {
		let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
		let counter = calls.clone();
		let transport = TransportFn(move |_: &Request| -> Result<Response, TransportError> {
			counter.fetch_add(1, Ordering::SeqCst);

			Ok(status_response(503))
		});
		let pipeline = Pipeline::builder(Arc::new(transport)).without_retry().build();
		let response = pipeline.send(&mut get()).await.expect("Exchange should complete.");

		assert!(pipeline.is_empty());
		assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
		assert_eq!(response.url().map(Url::as_str), Some("https://example.com/items"));
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn deadline_bounds_the_whole_call() {
		let transport = Arc::new(ScriptedTransport::new((0..4).map(|_| Ok(status_response(503)))));
		let pipeline = Pipeline::builder(transport.clone()).build();
		let mut request =
			get().with_context(Context::new().with_timeout(Duration::milliseconds(500)));
		let err = pipeline.send(&mut request).await.expect_err("Deadline should cut retries short.");

		assert!(matches!(err, Error::DeadlineExceeded));
		assert!(transport.calls() < 4);
	}
}
