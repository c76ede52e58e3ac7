#![forbid(unsafe_code)]

use relay_domain::{ConnHandle, Message};
use relay_protocol::ServerFrame;
use tracing::debug;

use crate::server::conversations::ConversationStore;
use crate::server::presence::PresenceRegistry;
use crate::util::time::unix_ms_now;

/// Why a send request was refused. Nothing is recorded on refusal.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RouteError {
	#[error("sender has not joined")]
	SenderNotOnline,

	#[error("recipient is not online")]
	RecipientNotOnline,

	#[error("message text must be non-empty")]
	EmptyText,
}

impl RouteError {
	pub fn code(&self) -> &'static str {
		match self {
			Self::SenderNotOnline => "sender_not_online",
			Self::RecipientNotOnline => "recipient_not_online",
			Self::EmptyText => "empty_text",
		}
	}
}

/// Routes direct messages between joined connections, recording each
/// accepted message before attempting delivery.
#[derive(Debug, Clone)]
pub struct MessageRouter {
	registry: PresenceRegistry,
	conversations: ConversationStore,
}

impl MessageRouter {
	pub fn new(registry: PresenceRegistry, conversations: ConversationStore) -> Self {
		Self { registry, conversations }
	}

	/// Route one message from `sender` to `recipient`.
	///
	/// Both endpoints must resolve before anything is recorded. Once the
	/// message is appended it stays recorded even if delivery to the
	/// recipient's outbox fails.
	pub async fn route(&self, sender: ConnHandle, recipient: ConnHandle, text: String) -> Result<Message, RouteError> {
		let sender_user = self.registry.lookup(sender).await.ok_or(RouteError::SenderNotOnline)?;
		let recipient_user = self.registry.lookup(recipient).await.ok_or(RouteError::RecipientNotOnline)?;

		if text.trim().is_empty() {
			return Err(RouteError::EmptyText);
		}

		let message = Message::new(sender_user.identity, recipient_user.identity, text, unix_ms_now());

		self.conversations.append(message.clone()).await;

		let delivered = self
			.registry
			.push(recipient, ServerFrame::NewMessage { message: message.clone() })
			.await;
		if !delivered {
			debug!(recipient = %recipient, message_id = %message.id, "router: recipient outbox unavailable; message recorded");
		}

		self.registry
			.push(sender, ServerFrame::MessageSent { message: message.clone() })
			.await;

		metrics::counter!("relay_server_messages_routed_total").increment(1);

		Ok(message)
	}
}
