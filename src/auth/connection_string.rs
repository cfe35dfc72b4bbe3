//! `Endpoint=<url>;Id=<id>;Secret=<base64>` connection strings.

// crates.io
use base64::{Engine, engine::general_purpose::STANDARD};
// self
use crate::_prelude::*;

/// Connection string parsing failures.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum ConnectionStringError {
	/// A required field is absent.
	#[error("Connection string is missing the `{field}` field.")]
	MissingField {
		/// Field name.
		field: &'static str,
	},
	/// A field appears more than once.
	#[error("Connection string contains the `{field}` field more than once.")]
	DuplicateField {
		/// Field name.
		field: &'static str,
	},
	/// `Endpoint` is not an absolute URL.
	#[error("Connection string endpoint `{endpoint}` is not a valid URL.")]
	InvalidEndpoint {
		/// Offending value.
		endpoint: String,
	},
	/// `Secret` is not valid base64.
	#[error("Connection string secret is not valid base64.")]
	InvalidSecret,
}

/// Parsed connection string. The decoded secret is redacted from `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionString {
	/// Service endpoint.
	pub endpoint: Url,
	/// Credential identifier.
	pub id: String,
	secret: Vec<u8>,
}
impl ConnectionString {
	const ENDPOINT: &str = "Endpoint";
	const ID: &str = "Id";
	const SECRET: &str = "Secret";

	/// Decoded signing key.
	pub fn secret(&self) -> &[u8] {
		&self.secret
	}
}
impl FromStr for ConnectionString {
	type Err = ConnectionStringError;

	fn from_str(raw: &str) -> Result<Self, Self::Err> {
		let mut endpoint = None;
		let mut id = None;
		let mut secret = None;

		for segment in raw.split(';') {
			let Some((key, value)) = segment.split_once('=') else {
				continue;
			};
			let (field, slot) = match key.trim() {
				Self::ENDPOINT => (Self::ENDPOINT, &mut endpoint),
				Self::ID => (Self::ID, &mut id),
				Self::SECRET => (Self::SECRET, &mut secret),
				_ => continue,
			};

			if slot.replace(value.trim()).is_some() {
				return Err(ConnectionStringError::DuplicateField { field });
			}
		}

		let endpoint = endpoint
			.filter(|value: &&str| !value.is_empty())
			.ok_or(ConnectionStringError::MissingField { field: Self::ENDPOINT })?;
		let id = id
			.filter(|value: &&str| !value.is_empty())
			.ok_or(ConnectionStringError::MissingField { field: Self::ID })?;
		let secret = secret
			.filter(|value: &&str| !value.is_empty())
			.ok_or(ConnectionStringError::MissingField { field: Self::SECRET })?;
		let endpoint = Url::parse(endpoint)
			.ok()
			.filter(|url| url.has_host())
			.ok_or_else(|| ConnectionStringError::InvalidEndpoint { endpoint: endpoint.to_owned() })?;
		let secret = STANDARD.decode(secret).map_err(|_| ConnectionStringError::InvalidSecret)?;

		Ok(Self { endpoint, id: id.to_owned(), secret })
	}
}
impl Debug for ConnectionString {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("ConnectionString")
			.field("endpoint", &self.endpoint.as_str())
			.field("id", &self.id)
			.field("secret", &"<redacted>")
			.finish()
	}
}
