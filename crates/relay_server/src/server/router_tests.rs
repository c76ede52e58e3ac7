#![forbid(unsafe_code)]

use relay_domain::{ConnHandle, Identity};
use relay_protocol::ServerFrame;
use tokio::sync::{mpsc, oneshot};

use crate::server::conversations::ConversationStore;
use crate::server::presence::{PresenceConfig, PresenceRegistry};
use crate::server::router::{MessageRouter, RouteError};

struct Fixture {
	registry: PresenceRegistry,
	conversations: ConversationStore,
	router: MessageRouter,
}

impl Fixture {
	fn new() -> Self {
		let registry = PresenceRegistry::new(PresenceConfig::default());
		let conversations = ConversationStore::new();
		let router = MessageRouter::new(registry.clone(), conversations.clone());
		Self {
			registry,
			conversations,
			router,
		}
	}

	async fn join(&self, handle: ConnHandle, identity: &str) -> mpsc::Receiver<ServerFrame> {
		let (tx, mut rx) = mpsc::channel(32);
		let (evict_tx, _evict_rx) = oneshot::channel();
		self.registry
			.join(handle, identity, tx, evict_tx)
			.await
			.expect("join succeeds");

		// Discard the join preamble so tests only observe routing frames.
		while let Ok(frame) = rx.try_recv() {
			let _ = frame;
		}
		rx
	}
}

#[tokio::test]
async fn routes_between_two_joined_connections() {
	let fx = Fixture::new();
	let mut alice_rx = fx.join(ConnHandle(1), "alice").await;
	let mut bob_rx = fx.join(ConnHandle(2), "bob").await;
	while alice_rx.try_recv().is_ok() {}

	let message = fx
		.router
		.route(ConnHandle(1), ConnHandle(2), "hi bob".to_string())
		.await
		.expect("route succeeds");

	assert_eq!(message.sender.as_str(), "alice");
	assert_eq!(message.recipient.as_str(), "bob");
	assert_eq!(message.text, "hi bob");

	let delivered = bob_rx.try_recv().expect("recipient frame queued");
	let echoed = alice_rx.try_recv().expect("sender frame queued");

	match (delivered, echoed) {
		(ServerFrame::NewMessage { message: to_bob }, ServerFrame::MessageSent { message: to_alice }) => {
			// Both sides carry the identical recorded message.
			assert_eq!(to_bob.id, to_alice.id);
			assert_eq!(to_bob.id, message.id);
			assert_eq!(to_bob.text, to_alice.text);
			assert_eq!(to_bob.sent_at_unix_ms, to_alice.sent_at_unix_ms);
		}
		other => panic!("expected NewMessage and MessageSent, got: {other:?}"),
	}
}

#[tokio::test]
async fn routed_message_is_recorded_in_history() {
	let fx = Fixture::new();
	let _alice_rx = fx.join(ConnHandle(1), "alice").await;
	let _bob_rx = fx.join(ConnHandle(2), "bob").await;

	let message = fx
		.router
		.route(ConnHandle(1), ConnHandle(2), "hello".to_string())
		.await
		.expect("route succeeds");

	let alice = Identity::new("alice").unwrap();
	let bob = Identity::new("bob").unwrap();
	let history = fx.conversations.history(&bob, &alice).await;
	assert_eq!(history.len(), 1);
	assert_eq!(history[0].id, message.id);
}

#[tokio::test]
async fn unjoined_sender_is_refused() {
	let fx = Fixture::new();
	let _bob_rx = fx.join(ConnHandle(2), "bob").await;

	let err = fx
		.router
		.route(ConnHandle(1), ConnHandle(2), "hi".to_string())
		.await
		.unwrap_err();
	assert_eq!(err, RouteError::SenderNotOnline);
	assert_eq!(err.code(), "sender_not_online");
}

#[tokio::test]
async fn offline_recipient_is_refused_and_nothing_is_recorded() {
	let fx = Fixture::new();
	let _alice_rx = fx.join(ConnHandle(1), "alice").await;

	let err = fx
		.router
		.route(ConnHandle(1), ConnHandle(7), "hi".to_string())
		.await
		.unwrap_err();
	assert_eq!(err, RouteError::RecipientNotOnline);

	assert_eq!(fx.conversations.conversation_count().await, 0);
}

#[tokio::test]
async fn empty_text_is_refused() {
	let fx = Fixture::new();
	let _alice_rx = fx.join(ConnHandle(1), "alice").await;
	let _bob_rx = fx.join(ConnHandle(2), "bob").await;

	let err = fx
		.router
		.route(ConnHandle(1), ConnHandle(2), "   ".to_string())
		.await
		.unwrap_err();
	assert_eq!(err, RouteError::EmptyText);
	assert_eq!(fx.conversations.conversation_count().await, 0);
}

#[tokio::test]
async fn delivery_failure_after_resolve_still_records_the_message() {
	let fx = Fixture::new();
	let _alice_rx = fx.join(ConnHandle(1), "alice").await;
	let bob_rx = fx.join(ConnHandle(2), "bob").await;

	// Bob's connection task has gone away but the registry has not yet
	// noticed; the recipient still resolves.
	drop(bob_rx);

	let message = fx
		.router
		.route(ConnHandle(1), ConnHandle(2), "hi".to_string())
		.await
		.expect("route succeeds once both endpoints resolve");

	let alice = Identity::new("alice").unwrap();
	let bob = Identity::new("bob").unwrap();
	let history = fx.conversations.history(&alice, &bob).await;
	assert_eq!(history.len(), 1);
	assert_eq!(history[0].id, message.id);
}

#[tokio::test]
async fn self_messages_are_routable() {
	let fx = Fixture::new();
	let mut alice_rx = fx.join(ConnHandle(1), "alice").await;

	fx.router
		.route(ConnHandle(1), ConnHandle(1), "note to self".to_string())
		.await
		.expect("route succeeds");

	let first = alice_rx.try_recv().expect("first frame");
	let second = alice_rx.try_recv().expect("second frame");
	assert!(matches!(first, ServerFrame::NewMessage { .. }));
	assert!(matches!(second, ServerFrame::MessageSent { .. }));
}
