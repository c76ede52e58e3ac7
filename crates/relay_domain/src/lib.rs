#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing domain identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
}

/// Display name used to address a user.
///
/// Non-empty after trimming; NOT guaranteed unique among online sessions
/// (uniqueness is a registry policy, not a property of the type).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
	/// Create a non-empty `Identity`. Surrounding whitespace is removed.
	pub fn new(name: impl Into<String>) -> Result<Self, ParseIdError> {
		let name = name.into();
		let trimmed = name.trim();
		if trimmed.is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(trimmed.to_string()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for Identity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for Identity {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Identity::new(s)
	}
}

/// Opaque per-connection handle, assigned at transport accept time.
///
/// A handle is never reused for the lifetime of the process and is the only
/// way to address a live connection (identities may be duplicated).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnHandle(pub u64);

impl ConnHandle {
	pub const fn as_u64(self) -> u64 {
		self.0
	}
}

impl fmt::Display for ConnHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Public view of an online connection: what the rest of the system (and the
/// wire) sees of a presence-registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
	pub handle: ConnHandle,
	pub identity: Identity,
}

/// Server-assigned message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub uuid::Uuid);

impl MessageId {
	/// Create a new random message id.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// A single direct message. Immutable once created; the conversation store
/// only ever appends these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
	pub id: MessageId,
	pub sender: Identity,
	pub recipient: Identity,
	pub text: String,
	pub sent_at_unix_ms: i64,
}

impl Message {
	/// Construct a message with a fresh random id.
	pub fn new(sender: Identity, recipient: Identity, text: String, sent_at_unix_ms: i64) -> Self {
		Self {
			id: MessageId::new_v4(),
			sender,
			recipient,
			text,
			sent_at_unix_ms,
		}
	}

	/// Canonical key of the conversation this message belongs to.
	pub fn conversation_key(&self) -> ConversationKey {
		ConversationKey::of(self.sender.clone(), self.recipient.clone())
	}
}

/// Canonical unordered pair of identities indexing stored history.
///
/// `of(a, b)` and `of(b, a)` produce the same key, so history lookups do not
/// depend on which side asks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
	lo: Identity,
	hi: Identity,
}

impl ConversationKey {
	/// Build the canonical key for a pair of identities.
	pub fn of(a: Identity, b: Identity) -> Self {
		if a <= b { Self { lo: a, hi: b } } else { Self { lo: b, hi: a } }
	}

	pub fn lo(&self) -> &Identity {
		&self.lo
	}

	pub fn hi(&self) -> &Identity {
		&self.hi
	}
}

impl fmt::Display for ConversationKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}<->{}", self.lo, self.hi)
	}
}
