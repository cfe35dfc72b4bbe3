//! HMAC-SHA256 request signing.
//!
//! Each attempt is signed over
//! `METHOD\npath[?query]\n<timestamp>;<host>;<content hash>` where the content hash is the base64
//! SHA-256 of the body and the timestamp is the RFC 1123 value sent in `Date`.

// crates.io
use base64::{Engine, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use http::header::{AUTHORIZATION, DATE};
use sha2::{Digest, Sha256};
use time::{UtcOffset, format_description::BorrowedFormatItem, macros::format_description};
// self
use crate::{
	_prelude::*,
	auth::{ConnectionString, ConnectionStringError},
	error::ConfigError,
	http::Request,
	pipeline::{Next, Policy, PolicyFuture},
};

const CONTENT_HASH: &str = "x-ms-content-sha256";
const SIGNED_HEADERS: &str = "date;host;x-ms-content-sha256";
const RFC_1123: &[BorrowedFormatItem<'static>] = format_description!(
	"[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

/// Formats `moment` as an RFC 1123 GMT date (`Tue, 14 Oct 2025 09:30:00 GMT`).
pub fn http_date(moment: OffsetDateTime) -> Result<String> {
	moment.to_offset(UtcOffset::UTC).format(RFC_1123).map_err(Error::credential)
}

/// Header values produced by one signing computation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedHeaders {
	/// `Date` header value; identical to the signed timestamp.
	pub date: String,
	/// `x-ms-content-sha256` header value.
	pub content_hash: String,
	/// `Authorization` header value.
	pub authorization: String,
}

/// Credential id plus keyed HMAC state.
#[derive(Clone)]
pub struct HmacCredential {
	id: String,
	mac: Hmac<Sha256>,
}
impl HmacCredential {
	/// Creates a credential from an id and the decoded secret.
	pub fn new(id: impl Into<String>, secret: &[u8]) -> Result<Self, ConnectionStringError> {
		let mac = <Hmac<Sha256> as Mac>::new_from_slice(secret)
			.map_err(|_| ConnectionStringError::InvalidSecret)?;

		Ok(Self { id: id.into(), mac })
	}

	/// Creates a credential from a parsed connection string.
	pub fn from_connection_string(parsed: &ConnectionString) -> Result<Self> {
		Self::new(parsed.id.clone(), parsed.secret()).map_err(|e| ConfigError::from(e).into())
	}

	/// Credential identifier.
	pub fn id(&self) -> &str {
		&self.id
	}

	/// Computes the signing headers; pure in all of its inputs.
	pub fn sign(
		&self,
		method: &Method,
		path_and_query: &str,
		host: &str,
		timestamp: &str,
		body: &[u8],
	) -> SignedHeaders {
		let content_hash = STANDARD.encode(Sha256::digest(body));
		let canonical = format!(
			"{}\n{path_and_query}\n{timestamp};{host};{content_hash}",
			method.as_str().to_ascii_uppercase()
		);
		let mut mac = self.mac.clone();

		mac.update(canonical.as_bytes());

		let signature = STANDARD.encode(mac.finalize().into_bytes());
		let authorization = format!(
			"HMAC-SHA256 Credential={}, SignedHeaders={SIGNED_HEADERS}, Signature={signature}",
			self.id
		);

		SignedHeaders { date: timestamp.to_owned(), content_hash, authorization }
	}
}
impl Debug for HmacCredential {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("HmacCredential").field("id", &self.id).finish_non_exhaustive()
	}
}

/// Per-retry policy signing every attempt with the current time.
#[derive(Clone, Debug)]
pub struct HmacPolicy {
	credential: HmacCredential,
}
impl HmacPolicy {
	/// Creates a signing policy.
	pub fn new(credential: HmacCredential) -> Self {
		Self { credential }
	}

	/// Signs `request` as of `now`, replacing any previous signature.
	pub fn sign_request(&self, request: &mut Request, now: OffsetDateTime) -> Result<()> {
		let timestamp = http_date(now)?;
		let signed = self.credential.sign(
			request.method(),
			&request.path_and_query(),
			request.host(),
			&timestamp,
			request.body().map(|body| &body[..]).unwrap_or_default(),
		);

		request.insert_header(CONTENT_HASH, &signed.content_hash)?;
		request.insert_header(DATE.as_str(), &signed.date)?;

		let mut authorization = HeaderValue::from_str(&signed.authorization)
			.map_err(|_| ConfigError::InvalidHeader { name: AUTHORIZATION.to_string() })?;

		authorization.set_sensitive(true);
		request.headers_mut().insert(AUTHORIZATION, authorization);

		Ok(())
	}
}
impl Policy for HmacPolicy {
	fn send<'a>(&'a self, request: &'a mut Request, next: Next<'a>) -> PolicyFuture<'a> {
		Box::pin(async move {
			self.sign_request(request, OffsetDateTime::now_utc())?;

			next.run(request).await
		})
	}
}
