#![forbid(unsafe_code)]

pub mod framing;

use relay_domain::{ConnHandle, Message, User};
use serde::{Deserialize, Serialize};

pub use framing::{
	DEFAULT_MAX_FRAME_SIZE, FramingError, decode_frame, encode_frame, encode_frame_default, encode_frame_into,
	try_decode_frame_from_buffer,
};

/// v1 protocol version written into envelopes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Envelope for client -> server frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientEnvelope {
	pub version: u32,
	pub frame: ClientFrame,
}

impl ClientEnvelope {
	pub fn v1(frame: ClientFrame) -> Self {
		Self {
			version: PROTOCOL_VERSION,
			frame,
		}
	}
}

/// Envelope for server -> client frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEnvelope {
	pub version: u32,
	pub frame: ServerFrame,
}

impl ServerEnvelope {
	pub fn v1(frame: ServerFrame) -> Self {
		Self {
			version: PROTOCOL_VERSION,
			frame,
		}
	}
}

/// Frames a client may send on its control stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientFrame {
	/// Claim an identity and enter the presence registry.
	Join {
		identity: String,
	},

	/// Liveness refresh; no response is sent.
	Heartbeat {},

	/// Leave the registry; the server closes the channel afterwards.
	Logout {},

	/// Direct message to a live connection, addressed by handle.
	SendMessage {
		recipient_handle: ConnHandle,
		text: String,
	},
}

/// Reasons a join request is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinReason {
	IdentityRequired,
	IdentityTaken,
}

/// Server greeting sent once per connection, before any join.
///
/// This is where a client learns its own handle; the join acknowledgment
/// itself carries nothing but a status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Welcome {
	pub handle: ConnHandle,
	pub server_name: String,
	pub server_time_unix_ms: i64,
	pub heartbeat_timeout_ms: u64,
	pub max_frame_bytes: u32,
}

/// Frames the server may push on a connection's control stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerFrame {
	Welcome(Welcome),

	/// Join acknowledged; the registry snapshot follows as a `users` frame.
	JoinOk {},

	JoinError {
		reason: JoinReason,
	},

	/// Full presence snapshot. Ordering is unspecified.
	Users {
		users: Vec<User>,
	},

	UserJoined {
		user: User,
	},

	UserLeft {
		user: User,
	},

	/// Acknowledgment to the sender of a routed message.
	MessageSent {
		message: Message,
	},

	/// Delivery of a routed message to its recipient.
	NewMessage {
		message: Message,
	},

	/// Request-level failure (e.g. routing errors), reported to the
	/// originating connection only.
	Error {
		code: String,
		message: String,
	},
}

impl ServerFrame {
	/// Stable frame-kind label for logs.
	pub fn kind(&self) -> &'static str {
		match self {
			ServerFrame::Welcome(_) => "welcome",
			ServerFrame::JoinOk {} => "join_ok",
			ServerFrame::JoinError { .. } => "join_error",
			ServerFrame::Users { .. } => "users",
			ServerFrame::UserJoined { .. } => "user_joined",
			ServerFrame::UserLeft { .. } => "user_left",
			ServerFrame::MessageSent { .. } => "message_sent",
			ServerFrame::NewMessage { .. } => "new_message",
			ServerFrame::Error { .. } => "error",
		}
	}
}
