//! Per-call context: deadline, cancellation, retry safety, and typed routing values.
//!
//! Every suspension point in the runtime (transport exchange, retry backoff, poll wait) goes
//! through [`Context::race`] or [`Context::sleep`], so a cancelled signal or an expired deadline
//! unblocks the call immediately instead of waiting out the remainder.

// std
use std::sync::atomic::{AtomicBool, Ordering};
// crates.io
use http::Extensions;
use tokio::{sync::Notify, time::Instant};
// self
use crate::_prelude::*;

/// Cloneable cancellation signal shared between a caller and its in-flight calls.
#[derive(Clone, Debug, Default)]
pub struct CancellationSignal(Arc<SignalInner>);
impl CancellationSignal {
	/// Creates a fresh, un-cancelled signal.
	pub fn new() -> Self {
		Self::default()
	}

	/// Cancels every call observing this signal.
	pub fn cancel(&self) {
		self.0.cancelled.store(true, Ordering::SeqCst);
		self.0.notify.notify_waiters();
	}

	/// Returns `true` once [`cancel`](Self::cancel) has been called.
	pub fn is_cancelled(&self) -> bool {
		self.0.cancelled.load(Ordering::SeqCst)
	}

	/// Resolves once the signal is cancelled.
	pub async fn cancelled(&self) {
		loop {
			let notified = self.0.notify.notified();
			let mut notified = std::pin::pin!(notified);

			notified.as_mut().enable();

			if self.is_cancelled() {
				return;
			}

			notified.await;
		}
	}
}

#[derive(Debug, Default)]
struct SignalInner {
	cancelled: AtomicBool,
	notify: Notify,
}

/// Mutable per-call state carried by a [`Request`](crate::http::Request).
#[derive(Clone, Debug, Default)]
pub struct Context {
	deadline: Option<Instant>,
	signal: CancellationSignal,
	retry_safe: Option<bool>,
	extensions: Extensions,
}
impl Context {
	/// Creates an empty context with no deadline.
	pub fn new() -> Self {
		Self::default()
	}

	/// Sets an absolute deadline.
	pub fn with_deadline(mut self, deadline: Instant) -> Self {
		self.deadline = Some(deadline);

		self
	}

	/// Sets a deadline relative to now.
	///
	/// Negative timeouts expire immediately; a timeout too large to represent leaves the call
	/// without a deadline.
	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.deadline = Instant::now().checked_add(timeout.max(Duration::ZERO).unsigned_abs());

		self
	}

	/// Binds the context to a caller-owned cancellation signal.
	pub fn with_signal(mut self, signal: CancellationSignal) -> Self {
		self.signal = signal;

		self
	}

	/// Marks the call as safe (`true`) or unsafe (`false`) to retry regardless of its method.
	pub fn with_retry_safe(mut self, safe: bool) -> Self {
		self.retry_safe = Some(safe);

		self
	}

	/// Stores a typed routing value.
	pub fn with_value<T>(mut self, value: T) -> Self
	where
		T: 'static + Clone + Send + Sync,
	{
		self.extensions.insert(value);

		self
	}

	/// Deadline, if any.
	pub fn deadline(&self) -> Option<Instant> {
		self.deadline
	}

	/// Cancellation signal.
	pub fn signal(&self) -> &CancellationSignal {
		&self.signal
	}

	/// Explicit retry-safety flag, if the caller set one.
	pub fn retry_safe(&self) -> Option<bool> {
		self.retry_safe
	}

	/// Typed routing value, if present.
	pub fn value<T>(&self) -> Option<&T>
	where
		T: 'static + Send + Sync,
	{
		self.extensions.get::<T>()
	}

	/// Typed routing values.
	pub fn extensions_mut(&mut self) -> &mut Extensions {
		&mut self.extensions
	}

	/// Fails when the call is already cancelled or past its deadline.
	pub fn check(&self) -> Result<()> {
		if self.signal.is_cancelled() {
			return Err(Error::Canceled);
		}
		if self.deadline.is_some_and(|deadline| deadline <= Instant::now()) {
			return Err(Error::DeadlineExceeded);
		}

		Ok(())
	}

	/// Drives `fut` to completion unless the call is cancelled or its deadline passes first.
	pub async fn race<F, T>(&self, fut: F) -> Result<T>
	where
		F: Future<Output = Result<T>>,
	{
		self.check()?;

		let deadline = self.deadline;

		tokio::select! {
			biased;
			_ = self.signal.cancelled() => Err(Error::Canceled),
			_ = sleep_until(deadline) => Err(Error::DeadlineExceeded),
			out = fut => out,
		}
	}

	/// Waits for `delay`, returning early with an error on cancellation or deadline expiry.
	///
	/// A wait that would outlive the deadline fails as soon as the deadline passes.
	pub async fn sleep(&self, delay: Duration) -> Result<()> {
		let delay = delay.unsigned_abs();

		self.race(async move {
			tokio::time::sleep(delay).await;

			Ok(())
		})
		.await
	}
}

async fn sleep_until(deadline: Option<Instant>) {
	match deadline {
		Some(deadline) => tokio::time::sleep_until(deadline).await,
		None => std::future::pending().await,
	}
}
