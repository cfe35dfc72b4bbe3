//! Access tokens, their redacting secret wrapper, and the credential contract.

// self
use crate::_prelude::*;

/// Boxed future returned by [`TokenCredential::get_token`].
pub type CredentialFuture<'a> = Pin<Box<dyn Future<Output = Result<AccessToken>> + 'a + Send>>;

/// Source of bearer tokens (managed identity, CLI login, client secret, ...).
///
/// Implementations report their own failures through [`Error::credential`].
pub trait TokenCredential
where
	Self: Send + Sync,
{
	/// Acquires a token valid for `scopes`.
	fn get_token<'a>(&'a self, scopes: &'a [String]) -> CredentialFuture<'a>;

	/// Acquires a token for a full request, such as one answering a claims challenge.
	///
	/// The default forwards the scopes to [`get_token`](Self::get_token) and drops the claims;
	/// credentials able to request extra claims should override it.
	fn get_token_with<'a>(&'a self, request: &'a TokenRequest) -> CredentialFuture<'a> {
		self.get_token(&request.scopes)
	}
}

/// Parameters of one token acquisition.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TokenRequest {
	/// Requested scopes.
	pub scopes: Vec<String>,
	/// Additional claims (decoded JSON) demanded by the resource.
	pub claims: Option<String>,
}
impl TokenRequest {
	/// Creates a request for `scopes` without extra claims.
	pub fn new(scopes: impl IntoIterator<Item = impl Into<String>>) -> Self {
		Self { scopes: scopes.into_iter().map(Into::into).collect(), claims: None }
	}

	/// Attaches challenge claims.
	pub fn with_claims(mut self, claims: impl Into<String>) -> Self {
		self.claims = Some(claims.into());

		self
	}
}

/// Redacted token secret wrapper keeping sensitive material out of logs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSecret(String);
impl TokenSecret {
	/// Wraps a new secret string.
	pub fn new(value: impl Into<String>) -> Self {
		Self(value.into())
	}

	/// Returns the inner token value. Callers must avoid logging this string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}
impl Debug for TokenSecret {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_tuple("TokenSecret").field(&"<redacted>").finish()
	}
}
impl Display for TokenSecret {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str("<redacted>")
	}
}

/// Bearer token plus its validity window.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessToken {
	/// Token value.
	pub token: TokenSecret,
	/// Instant after which the service rejects the token.
	pub expires_on: OffsetDateTime,
	/// Instant after which the token should be proactively refreshed, when the issuer says so.
	pub refresh_on: Option<OffsetDateTime>,
}
impl AccessToken {
	/// Tokens expiring within this window are refreshed before use.
	pub const REFRESH_WINDOW: Duration = Duration::minutes(5);

	/// Creates a token without an issuer-provided refresh hint.
	pub fn new(token: impl Into<String>, expires_on: OffsetDateTime) -> Self {
		Self { token: TokenSecret::new(token), expires_on, refresh_on: None }
	}

	/// Sets the issuer-provided refresh hint.
	pub fn with_refresh_on(mut self, refresh_on: OffsetDateTime) -> Self {
		self.refresh_on = Some(refresh_on);

		self
	}

	/// Returns `true` once the token is no longer accepted.
	pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
		self.expires_on <= now
	}

	/// Returns `true` when the token should be replaced before its next use.
	pub fn needs_refresh_at(&self, now: OffsetDateTime) -> bool {
		if self.refresh_on.is_some_and(|refresh_on| refresh_on <= now) {
			return true;
		}

		self.expires_on - now < Self::REFRESH_WINDOW
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn secret_formatters_redact() {
		let secret = TokenSecret::new("super-secret");

		assert_eq!(format!("{secret:?}"), "TokenSecret(\"<redacted>\")");
		assert_eq!(format!("{secret}"), "<redacted>");

		let token = AccessToken::new("super-secret", OffsetDateTime::UNIX_EPOCH);

		assert!(!format!("{token:?}").contains("super-secret"));
	}

	#[test]
	fn refresh_window_and_hint() {
		let now = OffsetDateTime::now_utc();
		let fresh = AccessToken::new("t", now + Duration::hours(1));
		let expiring = AccessToken::new("t", now + Duration::minutes(4));
		let hinted = AccessToken::new("t", now + Duration::hours(1))
			.with_refresh_on(now - Duration::seconds(1));

		assert!(!fresh.needs_refresh_at(now));
		assert!(expiring.needs_refresh_at(now));
		assert!(!expiring.is_expired_at(now));
		assert!(hinted.needs_refresh_at(now));
	}
}
