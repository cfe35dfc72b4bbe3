//! Sync tokens: per-id, sequence-numbered consistency markers exchanged with the service.
//!
//! The [`SyncTokenPolicy`] announces every known token id on each request and harvests the
//! `Sync-Token` response header afterwards. The registry keeps the highest sequence number seen per
//! id, so concurrent calls converge regardless of the order their responses arrive in.

// self
use crate::{
	_prelude::*,
	http::Request,
	obs,
	pipeline::{Next, Policy, PolicyFuture},
};

/// Header carrying sync tokens in both directions.
pub const SYNC_TOKEN_HEADER: &str = "sync-token";

const SEQUENCE_KEY: &str = "sn";

/// Sync token grammar violations.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum SyncTokenError {
	/// Token text is empty.
	#[error("Sync token is empty.")]
	Empty,
	/// A segment lacks `=`, a key, or a value.
	#[error("Sync token segment `{segment}` is not a `key=value` pair.")]
	MalformedSegment {
		/// Offending segment.
		segment: String,
	},
	/// No segment other than `sn` was present.
	#[error("Sync token has no id segment.")]
	MissingId,
	/// More than one non-`sn` segment was present.
	#[error("Sync token has more than one id segment.")]
	MultipleIds,
	/// The `sn` segment is absent.
	#[error("Sync token has no `sn` segment.")]
	MissingSequence,
	/// The `sn` segment is repeated or not a 64-bit integer.
	#[error("Sync token sequence `{value}` is invalid.")]
	InvalidSequence {
		/// Offending value.
		value: String,
	},
}

/// One parsed `id=value;sn=<i64>` token.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SyncToken {
	/// Token id.
	pub id: String,
	/// Opaque token value.
	pub value: String,
	/// Sequence number; higher is fresher.
	pub sequence: i64,
}
impl SyncToken {
	/// Parses a `,`-separated list, yielding one outcome per item.
	pub fn parse_list(raw: &str) -> impl Iterator<Item = Result<Self, SyncTokenError>> + '_ {
		raw.split(',').map(str::parse)
	}
}
impl FromStr for SyncToken {
	type Err = SyncTokenError;

	fn from_str(raw: &str) -> Result<Self, Self::Err> {
		if raw.trim().is_empty() {
			return Err(SyncTokenError::Empty);
		}

		let mut id = None;
		let mut sequence = None;

		for segment in raw.split(';').filter(|segment| !segment.trim().is_empty()) {
			let malformed = || SyncTokenError::MalformedSegment { segment: segment.trim().to_owned() };
			let (key, value) = segment.split_once('=').ok_or_else(malformed)?;
			let (key, value) = (key.trim(), value.trim());

			if key.is_empty() || value.is_empty() {
				return Err(malformed());
			}
			if key == SEQUENCE_KEY {
				let invalid = || SyncTokenError::InvalidSequence { value: value.to_owned() };

				if sequence.is_some() {
					return Err(invalid());
				}

				sequence = Some(value.parse::<i64>().map_err(|_| invalid())?);
			} else if id.replace((key, value)).is_some() {
				return Err(SyncTokenError::MultipleIds);
			}
		}

		let (id, value) = id.ok_or(SyncTokenError::MissingId)?;
		let sequence = sequence.ok_or(SyncTokenError::MissingSequence)?;

		Ok(Self { id: id.to_owned(), value: value.to_owned(), sequence })
	}
}
impl Display for SyncToken {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		write!(f, "{}={};{SEQUENCE_KEY}={}", self.id, self.value, self.sequence)
	}
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Entry {
	value: String,
	sequence: i64,
}

/// Per-client registry of the freshest token per id; clones share the same map.
#[derive(Clone, Debug, Default)]
pub struct SyncTokenCache(Arc<RwLock<HashMap<String, Entry>>>);
impl SyncTokenCache {
	/// Creates an empty registry.
	pub fn new() -> Self {
		Self::default()
	}

	/// Merges `token`; returns `true` when it replaced or created the entry.
	///
	/// Only a strictly greater sequence number replaces a stored entry.
	pub fn merge(&self, token: SyncToken) -> bool {
		let mut map = self.0.write();
		let fresher = map.get(&token.id).is_none_or(|stored| stored.sequence < token.sequence);

		if fresher {
			map.insert(token.id, Entry { value: token.value, sequence: token.sequence });
		}

		fresher
	}

	/// Parses and merges an externally obtained `,`-separated token list.
	///
	/// Every item is validated before any is merged, so a malformed list leaves the registry
	/// untouched.
	pub fn set(&self, raw: &str) -> Result<(), SyncTokenError> {
		let tokens = SyncToken::parse_list(raw).collect::<Result<Vec<_>, _>>()?;

		for token in tokens {
			self.merge(token);
		}

		Ok(())
	}

	/// Merges every valid token from `Sync-Token` response headers; invalid tokens are dropped.
	pub fn harvest(&self, headers: &HeaderMap) {
		for raw in headers.get_all(SYNC_TOKEN_HEADER) {
			let Ok(raw) = raw.to_str() else {
				obs::sync_token_discarded(&"non-ASCII header value");

				continue;
			};

			for outcome in SyncToken::parse_list(raw) {
				match outcome {
					Ok(token) => {
						self.merge(token);
					},
					Err(err) => obs::sync_token_discarded(&err),
				}
			}
		}
	}

	/// Known ids in lexicographic order.
	pub fn ids(&self) -> Vec<String> {
		let mut ids: Vec<_> = self.0.read().keys().cloned().collect();

		ids.sort_unstable();

		ids
	}

	/// Stored token for `id`.
	pub fn get(&self, id: &str) -> Option<SyncToken> {
		self.0.read().get(id).map(|entry| SyncToken {
			id: id.to_owned(),
			value: entry.value.clone(),
			sequence: entry.sequence,
		})
	}

	/// Number of known ids.
	pub fn len(&self) -> usize {
		self.0.read().len()
	}

	/// Returns `true` when no token has been seen yet.
	pub fn is_empty(&self) -> bool {
		self.0.read().is_empty()
	}
}

/// Per-retry policy attaching known ids and harvesting returned tokens.
#[derive(Clone, Debug, Default)]
pub struct SyncTokenPolicy {
	cache: SyncTokenCache,
}
impl SyncTokenPolicy {
	/// Creates a policy over a (possibly shared) registry.
	pub fn new(cache: SyncTokenCache) -> Self {
		Self { cache }
	}

	/// Backing registry.
	pub fn cache(&self) -> &SyncTokenCache {
		&self.cache
	}
}
impl Policy for SyncTokenPolicy {
	fn send<'a>(&'a self, request: &'a mut Request, next: Next<'a>) -> PolicyFuture<'a> {
		Box::pin(async move {
			request.headers_mut().remove(SYNC_TOKEN_HEADER);

			for id in self.cache.ids() {
				request.append_header(SYNC_TOKEN_HEADER, &id)?;
			}

			let response = next.run(request).await?;

			self.cache.harvest(response.headers());

			Ok(response)
		})
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::_preludet::*;

	fn token(raw: &str) -> SyncToken {
		raw.parse().expect("Sync token fixture should parse.")
	}

	#[test]
	fn parses_segments_in_any_order_and_keeps_padding() {
		let parsed = token("jtqGc1I4=MDoyOA==;sn=28");

		assert_eq!(parsed.id, "jtqGc1I4");
		assert_eq!(parsed.value, "MDoyOA==");
		assert_eq!(parsed.sequence, 28);
		assert_eq!(token(" sn = 28 ; jtqGc1I4=MDoyOA==;"), parsed);
		assert_eq!(parsed.to_string(), "jtqGc1I4=MDoyOA==;sn=28");
		assert_eq!(token("a=b;sn=-3").sequence, -3);
	}

	#[test]
	fn rejects_grammar_violations() {
		let parse = |raw: &str| raw.parse::<SyncToken>();

		assert_eq!(parse(""), Err(SyncTokenError::Empty));
		assert_eq!(parse("  "), Err(SyncTokenError::Empty));
		assert_eq!(parse("sn=1"), Err(SyncTokenError::MissingId));
		assert_eq!(parse("a=b;c=d;sn=1"), Err(SyncTokenError::MultipleIds));
		assert_eq!(parse("a=b"), Err(SyncTokenError::MissingSequence));
		assert_eq!(parse("a=b;sn=abc"), Err(SyncTokenError::InvalidSequence { value: "abc".into() }));
		assert_eq!(
			parse("a=b;sn=99999999999999999999"),
			Err(SyncTokenError::InvalidSequence { value: "99999999999999999999".into() })
		);
		assert_eq!(parse("a;sn=1"), Err(SyncTokenError::MalformedSegment { segment: "a".into() }));
		assert_eq!(parse("a=;sn=1"), Err(SyncTokenError::MalformedSegment { segment: "a=".into() }));
	}

	#[test]
	fn merge_keeps_strictly_greater_sequence() {
		let cache = SyncTokenCache::new();

		assert!(cache.merge(token("a=v5;sn=5")));
		assert!(!cache.merge(token("a=v5b;sn=5")));
		assert!(!cache.merge(token("a=v3;sn=3")));
		assert!(cache.merge(token("b=w1;sn=1")));
		assert!(cache.merge(token("a=v9;sn=9")));

		assert_eq!(cache.get("a").map(|t| (t.value, t.sequence)), Some(("v9".into(), 9)));
		assert_eq!(cache.get("b").map(|t| t.sequence), Some(1));
		assert_eq!(cache.ids(), ["a", "b"]);
	}

	#[test]
	fn merge_result_is_independent_of_arrival_order() {
		let tokens = ["x=1;sn=1", "x=7;sn=7", "x=4;sn=4", "y=2;sn=2", "y=0;sn=0"];
		let orders: [[usize; 5]; 4] = [[0, 1, 2, 3, 4], [4, 3, 2, 1, 0], [2, 0, 4, 1, 3], [1, 4, 0, 3, 2]];

		for order in orders {
			let cache = SyncTokenCache::new();

			for idx in order {
				cache.merge(token(tokens[idx]));
			}

			assert_eq!(cache.get("x").map(|t| t.value), Some("7".into()));
			assert_eq!(cache.get("y").map(|t| t.value), Some("2".into()));
		}
	}

	#[test]
	fn set_is_all_or_nothing() {
		let cache = SyncTokenCache::new();

		assert_eq!(cache.set("a=1;sn=1,broken"), Err(SyncTokenError::MalformedSegment {
			segment: "broken".into()
		}));
		assert!(cache.is_empty());

		cache.set("a=1;sn=1, b=2;sn=2").expect("Valid list should merge.");

		assert_eq!(cache.len(), 2);
	}

	#[tokio::test]
	async fn policy_announces_ids_and_harvests_tokens() {
		let cache = SyncTokenCache::new();

		cache.merge(token("zeta=z;sn=1"));
		cache.merge(token("alpha=a;sn=1"));

		let transport = Arc::new(ScriptedTransport::new([Ok(status_response(200)
			.with_header("sync-token", "alpha=a2;sn=2,bogus,zeta=z0;sn=0")
			.with_header("sync-token", "new=n;sn=4"))]));
		let policy = Arc::new(SyncTokenPolicy::new(cache.clone()));
		let pipeline = scripted_pipeline(transport.clone(), [policy as Arc<dyn Policy>]);
		let mut request = Request::new(Method::GET, url("https://example.azconfig.io/kv/a"));

		pipeline.send(&mut request).await.expect("Call should succeed.");

		let sent = &transport.requests()[0];
		let announced: Vec<_> =
			sent.headers().get_all(SYNC_TOKEN_HEADER).iter().filter_map(|v| v.to_str().ok()).collect();

		assert_eq!(announced, ["alpha", "zeta"]);
		assert_eq!(cache.get("alpha").map(|t| t.sequence), Some(2));
		assert_eq!(cache.get("zeta").map(|t| t.value), Some("z".into()));
		assert_eq!(cache.get("new").map(|t| t.sequence), Some(4));
		assert_eq!(cache.len(), 3);
	}

	#[tokio::test(start_paused = true)]
	async fn retries_do_not_duplicate_announcements() {
		let cache = SyncTokenCache::new();

		cache.merge(token("alpha=a;sn=1"));

		let transport = Arc::new(ScriptedTransport::new([
			Ok(status_response(503)),
			Ok(status_response(200)),
		]));
		let policy = Arc::new(SyncTokenPolicy::new(cache));
		let pipeline = scripted_pipeline(transport.clone(), [policy as Arc<dyn Policy>]);
		let mut request = Request::new(Method::GET, url("https://example.azconfig.io/kv/a"));

		pipeline.send(&mut request).await.expect("Call should succeed.");

		for sent in transport.requests() {
			assert_eq!(sent.headers().get_all(SYNC_TOKEN_HEADER).iter().count(), 1);
		}
	}
}
