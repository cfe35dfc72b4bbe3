//! `WWW-Authenticate` challenge parsing.
//!
//! A header may carry several challenges (`PoP nonce="..", Bearer error="insufficient_claims",
//! claims=".."`). Parsing is lenient: a bare token starts a new challenge, `key=value` and
//! `key="quoted value"` pairs attach to the current one, and anything else is skipped.

// crates.io
use base64::{
	Engine, alphabet,
	engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
};
// self
use crate::_prelude::*;

/// `error` value announcing a continuous-access-evaluation claims challenge.
pub const INSUFFICIENT_CLAIMS: &str = "insufficient_claims";

const LENIENT: GeneralPurposeConfig = GeneralPurposeConfig::new()
	.with_decode_allow_trailing_bits(true)
	.with_decode_padding_mode(DecodePaddingMode::Indifferent);
const CLAIMS_STANDARD: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, LENIENT);
const CLAIMS_URL_SAFE: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, LENIENT);

/// One authentication challenge.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Challenge {
	/// Authentication scheme (`Bearer`, `PoP`, ...), as sent.
	pub scheme: String,
	/// Parameters keyed by lowercase name; quoted values are unescaped.
	pub params: BTreeMap<String, String>,
}
impl Challenge {
	/// Parameter value by case-insensitive name.
	pub fn param(&self, name: &str) -> Option<&str> {
		self.params.get(&name.to_ascii_lowercase()).map(String::as_str)
	}

	/// Returns `true` for the `Bearer` scheme.
	pub fn is_bearer(&self) -> bool {
		self.scheme.eq_ignore_ascii_case("bearer")
	}

	/// Returns `true` for a `Bearer` challenge with `error="insufficient_claims"` and claims.
	pub fn is_claims_challenge(&self) -> bool {
		self.is_bearer()
			&& self.param("error") == Some(INSUFFICIENT_CLAIMS)
			&& self.param("claims").is_some_and(|raw| !raw.is_empty())
	}

	/// Decoded `claims` parameter; `None` when absent or not base64-encoded UTF-8.
	pub fn claims(&self) -> Option<String> {
		let raw = self.param("claims")?;
		let bytes = CLAIMS_STANDARD.decode(raw).or_else(|_| CLAIMS_URL_SAFE.decode(raw)).ok()?;

		String::from_utf8(bytes).ok()
	}
}

/// Parses every challenge in a `WWW-Authenticate` value.
pub fn parse_challenges(raw: &str) -> Vec<Challenge> {
	let mut challenges: Vec<Challenge> = Vec::new();
	let mut rest = raw;

	loop {
		rest = rest.trim_start_matches(|c: char| c == ',' || c.is_whitespace());

		if rest.is_empty() {
			break;
		}

		let end = rest.find(|c: char| c == '=' || c == ',' || c.is_whitespace()).unwrap_or(rest.len());

		if end == 0 {
			// Stray `=`.
			rest = &rest[1..];

			continue;
		}

		let token = &rest[..end];

		rest = &rest[end..];

		if let Some(after) = rest.strip_prefix('=') {
			let (value, remaining) = match after.strip_prefix('"') {
				Some(quoted) => read_quoted(quoted),
				None => {
					let end = after
						.find(|c: char| c == ',' || c.is_whitespace())
						.unwrap_or(after.len());

					(after[..end].to_owned(), &after[end..])
				},
			};

			rest = remaining;

			if let Some(current) = challenges.last_mut() {
				current.params.insert(token.to_ascii_lowercase(), value);
			}
		} else {
			challenges.push(Challenge { scheme: token.to_owned(), params: BTreeMap::new() });
		}
	}

	challenges
}

fn read_quoted(raw: &str) -> (String, &str) {
	let mut value = String::new();
	let mut chars = raw.char_indices();

	while let Some((i, c)) = chars.next() {
		match c {
			'"' => return (value, &raw[i + 1..]),
			'\\' =>
				if let Some((_, escaped)) = chars.next() {
					value.push(escaped);
				},
			_ => value.push(c),
		}
	}

	(value, "")
}
