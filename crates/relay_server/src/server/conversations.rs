#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use relay_domain::{ConversationKey, Identity, Message};
use tokio::sync::Mutex;

/// Append-only store of delivered messages, keyed by unordered identity
/// pair. History lives in memory for the lifetime of the process.
#[derive(Debug, Clone, Default)]
pub struct ConversationStore {
	inner: Arc<Mutex<HashMap<ConversationKey, Vec<Message>>>>,
}

impl ConversationStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Record a routed message under its conversation key.
	pub async fn append(&self, message: Message) {
		let key = message.conversation_key();
		let mut inner = self.inner.lock().await;
		inner.entry(key).or_default().push(message);
	}

	/// Full history between two identities, oldest first. Argument order
	/// does not matter.
	pub async fn history(&self, a: &Identity, b: &Identity) -> Vec<Message> {
		let key = ConversationKey::of(a.clone(), b.clone());
		let inner = self.inner.lock().await;
		inner.get(&key).cloned().unwrap_or_default()
	}

	pub async fn conversation_count(&self) -> usize {
		let inner = self.inner.lock().await;
		inner.len()
	}
}
