//! Cursor-based pagination over JSON list responses.
//!
//! A [`Pager`] sends the original request once, then follows each page's next link with `GET`
//! until a page arrives without one. Pages are fetched one exchange at a time; nothing is
//! buffered ahead of the caller.

// std
use std::marker::PhantomData;
// crates.io
use serde::de::DeserializeOwned;
// self
use crate::{
	_prelude::*,
	context::Context,
	error::{ConfigError, DecodeError, ResponseError},
	http::{Request, decode_json},
	obs::{self, CallKind, CallOutcome, CallSpan},
	pipeline::Pipeline,
};

/// Field names locating items and the continuation link in a page body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageShape {
	/// Array field holding the page's items.
	pub items: String,
	/// String field holding the next page's URL.
	pub next_link: String,
}
impl PageShape {
	/// Custom field names.
	pub fn new(items: impl Into<String>, next_link: impl Into<String>) -> Self {
		Self { items: items.into(), next_link: next_link.into() }
	}
}
impl Default for PageShape {
	fn default() -> Self {
		Self::new("value", "nextLink")
	}
}

/// One decoded page.
#[derive(Clone, Debug, PartialEq)]
pub struct Page<T> {
	/// Items on this page, in service order.
	pub items: Vec<T>,
	/// Continuation, absent on the last page.
	pub next_link: Option<Url>,
}

#[derive(Debug)]
enum Cursor {
	NotStarted(Box<Request>),
	Next(Url),
	Done,
}

/// Forward-only iterator over pages of `T`.
pub struct Pager<T> {
	pipeline: Pipeline,
	cursor: Cursor,
	context: Context,
	shape: PageShape,
	_item: PhantomData<fn() -> T>,
}
impl<T> Pager<T>
where
	T: DeserializeOwned,
{
	/// Creates a pager whose first page comes from `request`; later pages reuse its context.
	pub fn new(pipeline: Pipeline, request: Request) -> Self {
		let context = request.context().clone();

		Self {
			pipeline,
			cursor: Cursor::NotStarted(Box::new(request)),
			context,
			shape: PageShape::default(),
			_item: PhantomData,
		}
	}

	/// Overrides the page field names.
	pub fn with_shape(mut self, shape: PageShape) -> Self {
		self.shape = shape;

		self
	}

	/// Returns `true` while another page may be fetched.
	pub fn more(&self) -> bool {
		!matches!(self.cursor, Cursor::Done)
	}

	/// Fetches the next page.
	///
	/// A failed exchange leaves the cursor in place, so the same page can be requested again.
	pub async fn next_page(&mut self) -> Result<Page<T>> {
		const KIND: CallKind = CallKind::Page;

		let mut request = match &self.cursor {
			Cursor::NotStarted(request) => request.as_ref().clone(),
			Cursor::Next(url) => Request::new(Method::GET, url.clone()).with_context(self.context.clone()),
			Cursor::Done => return Err(Error::PagerExhausted),
		};

		obs::record_call_outcome(KIND, CallOutcome::Attempt);

		let span = CallSpan::new(KIND, "next_page");
		let outcome = span.instrument(self.fetch(&mut request)).await;

		match outcome {
			Ok(page) => {
				self.cursor = match &page.next_link {
					Some(url) => Cursor::Next(url.clone()),
					None => Cursor::Done,
				};
				obs::record_call_outcome(KIND, CallOutcome::Success);

				Ok(page)
			},
			Err(err) => {
				obs::record_call_outcome(KIND, CallOutcome::Failure);

				Err(err)
			},
		}
	}

	/// Drains every remaining page into one list.
	pub async fn collect_all(mut self) -> Result<Vec<T>> {
		let mut items = Vec::new();

		while self.more() {
			items.extend(self.next_page().await?.items);
		}

		Ok(items)
	}

	async fn fetch(&self, request: &mut Request) -> Result<Page<T>> {
		let response = self.pipeline.send(request).await?;

		if !response.is_success() {
			return Err(ResponseError::from_response(response).into());
		}

		let status = response.status();
		let mut body: serde_json::Map<String, serde_json::Value> = decode_json(status, response.body())?;
		let items = match body.remove(&self.shape.items) {
			Some(serde_json::Value::Null) | None => Vec::new(),
			Some(value) => serde_path_to_error::deserialize(value)
				.map_err(|source| DecodeError::Json { source, status: status.as_u16() })?,
		};
		let next_link = match body.get(&self.shape.next_link).and_then(|v| v.as_str()) {
			Some(raw) if !raw.trim().is_empty() => Some(
				request.url().join(raw.trim()).map_err(|e| ConfigError::invalid_url(raw, e))?,
			),
			_ => None,
		};

		Ok(Page { items, next_link })
	}
}
impl<T> Debug for Pager<T> {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("Pager")
			.field("cursor", &self.cursor)
			.field("shape", &self.shape)
			.finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::{_preludet::*, context::Context};

	#[derive(Clone, Debug, PartialEq, Deserialize)]
	struct Vault {
		name: String,
	}

	#[derive(Clone, Debug, PartialEq)]
	struct Tenant(&'static str);

	fn first_request() -> Request {
		Request::new(Method::GET, url("https://mgmt.example.com/vaults?api-version=1"))
			.with_context(Context::new().with_value(Tenant("contoso")))
	}

	#[tokio::test]
	async fn follows_next_links_until_absent() {
		let transport = Arc::new(ScriptedTransport::new([
			Ok(json_response(
				200,
				r#"{"value":[{"name":"a"},{"name":"b"}],"nextLink":"https://mgmt.example.com/vaults?page=2"}"#,
			)),
			Ok(json_response(200, r#"{"value":[{"name":"c"}],"nextLink":"/vaults?page=3"}"#)),
			Ok(json_response(200, r#"{"value":[],"nextLink":""}"#)),
		]));
		let mut pager = Pager::<Vault>::new(scripted_pipeline(transport.clone(), []), first_request());
		let mut names = Vec::new();

		assert!(pager.more());

		while pager.more() {
			let page = pager.next_page().await.expect("Page should be fetched.");

			names.extend(page.items.into_iter().map(|v| v.name));
		}

		assert_eq!(names, ["a", "b", "c"]);
		assert_eq!(transport.calls(), 3);

		let seen = transport.requests();

		assert_eq!(seen[1].url().as_str(), "https://mgmt.example.com/vaults?page=2");
		assert_eq!(seen[2].url().as_str(), "https://mgmt.example.com/vaults?page=3");
		assert!(seen.iter().all(|r| r.method() == Method::GET));
		assert!(seen.iter().all(|r| r.context().value::<Tenant>() == Some(&Tenant("contoso"))));
		assert!(matches!(pager.next_page().await, Err(Error::PagerExhausted)));
	}

	#[tokio::test]
	async fn custom_shape_and_missing_fields() {
		let transport = Arc::new(ScriptedTransport::new([Ok(json_response(
			200,
			r#"{"items":[{"name":"x"}],"@nextLink":null}"#,
		))]));
		let pager = Pager::<Vault>::new(scripted_pipeline(transport.clone(), []), first_request())
			.with_shape(PageShape::new("items", "@nextLink"));
		let all = pager.collect_all().await.expect("Single page should be collected.");

		assert_eq!(all, [Vault { name: "x".into() }]);
		assert_eq!(transport.calls(), 1);
	}

	#[tokio::test]
	async fn failed_page_keeps_cursor_for_another_try() {
		let transport = Arc::new(ScriptedTransport::new([
			Ok(json_response(200, r#"{"value":[{"name":"a"}],"nextLink":"/vaults?page=2"}"#)),
			Ok(json_response(404, r#"{"error":{"code":"NotFound"}}"#)),
			Ok(json_response(200, r#"{"value":[{"name":"b"}]}"#)),
		]));
		let mut pager = Pager::<Vault>::new(scripted_pipeline(transport.clone(), []), first_request());

		pager.next_page().await.expect("First page should be fetched.");

		let err = pager.next_page().await.expect_err("404 should surface.");

		assert_eq!(err.status(), Some(StatusCode::NOT_FOUND));
		assert!(pager.more());

		let page = pager.next_page().await.expect("Retry of the page should succeed.");

		assert_eq!(page.items, [Vault { name: "b".into() }]);
		assert!(!pager.more());
	}

	#[tokio::test]
	async fn mistyped_items_report_their_path() {
		let transport =
			Arc::new(ScriptedTransport::new([Ok(json_response(200, r#"{"value":[{"name":7}]}"#))]));
		let mut pager = Pager::<Vault>::new(scripted_pipeline(transport, []), first_request());

		match pager.next_page().await {
			Err(Error::Decode(DecodeError::Json { source, status })) => {
				assert_eq!(status, 200);
				assert_eq!(source.path().to_string(), "[0].name");
			},
			other => panic!("Unexpected outcome: {other:?}."),
		}
	}
}
