#![forbid(unsafe_code)]

use std::time::Duration;

use relay_domain::ConnHandle;
use relay_protocol::{JoinReason, ServerFrame};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use crate::server::presence::{JoinError, PresenceConfig, PresenceRegistry};

fn observer(capacity: usize) -> (mpsc::Sender<ServerFrame>, mpsc::Receiver<ServerFrame>) {
	mpsc::channel(capacity)
}

async fn join(
	registry: &PresenceRegistry,
	handle: ConnHandle,
	identity: &str,
) -> (Result<relay_domain::User, JoinError>, mpsc::Receiver<ServerFrame>) {
	let (tx, rx) = observer(32);
	let (evict_tx, _evict_rx) = oneshot::channel();
	let result = registry.join(handle, identity, tx, evict_tx).await;
	(result, rx)
}

async fn next_frame(rx: &mut mpsc::Receiver<ServerFrame>) -> ServerFrame {
	timeout(Duration::from_millis(250), rx.recv())
		.await
		.expect("expected frame within timeout")
		.expect("channel open")
}

#[tokio::test]
async fn join_pushes_join_ok_then_snapshot_to_requester() {
	let registry = PresenceRegistry::new(PresenceConfig::default());

	let (result, mut rx) = join(&registry, ConnHandle(1), "alice").await;
	let user = result.expect("join succeeds");
	assert_eq!(user.identity.as_str(), "alice");

	assert!(matches!(next_frame(&mut rx).await, ServerFrame::JoinOk {}));
	match next_frame(&mut rx).await {
		ServerFrame::Users { users } => {
			assert_eq!(users.len(), 1);
			assert_eq!(users[0].handle, ConnHandle(1));
		}
		other => panic!("expected Users snapshot, got: {other:?}"),
	}
}

#[tokio::test]
async fn empty_identity_is_rejected_without_broadcast() {
	let registry = PresenceRegistry::new(PresenceConfig::default());

	let (_, mut alice_rx) = join(&registry, ConnHandle(1), "alice").await;
	// Drain alice's own join frames.
	next_frame(&mut alice_rx).await;
	next_frame(&mut alice_rx).await;

	let (result, _rx) = join(&registry, ConnHandle(2), "   ").await;
	assert_eq!(result.unwrap_err(), JoinError::IdentityRequired);

	assert_eq!(registry.online_count().await, 1);
	assert!(
		timeout(Duration::from_millis(50), alice_rx.recv()).await.is_err(),
		"failed join must not broadcast"
	);
}

#[tokio::test]
async fn duplicate_identities_are_allowed_by_default() {
	let registry = PresenceRegistry::new(PresenceConfig::default());

	let (first, _rx1) = join(&registry, ConnHandle(1), "alice").await;
	let (second, _rx2) = join(&registry, ConnHandle(2), "alice").await;

	assert!(first.is_ok());
	assert!(second.is_ok());
	assert_eq!(registry.online_count().await, 2);
}

#[tokio::test]
async fn unique_identities_config_rejects_duplicates() {
	let registry = PresenceRegistry::new(PresenceConfig { unique_identities: true });

	let (first, _rx1) = join(&registry, ConnHandle(1), "alice").await;
	assert!(first.is_ok());

	let (second, _rx2) = join(&registry, ConnHandle(2), "alice").await;
	assert_eq!(second.unwrap_err(), JoinError::IdentityTaken);
	assert_eq!(registry.online_count().await, 1);
}

#[tokio::test]
async fn join_broadcasts_delta_and_snapshot_to_existing_connections() {
	let registry = PresenceRegistry::new(PresenceConfig::default());

	let (_, mut alice_rx) = join(&registry, ConnHandle(1), "alice").await;
	next_frame(&mut alice_rx).await;
	next_frame(&mut alice_rx).await;

	let (_, mut bob_rx) = join(&registry, ConnHandle(2), "bob").await;

	// Alice sees the delta for bob and then the refreshed roster.
	match next_frame(&mut alice_rx).await {
		ServerFrame::UserJoined { user } => assert_eq!(user.handle, ConnHandle(2)),
		other => panic!("expected UserJoined, got: {other:?}"),
	}
	match next_frame(&mut alice_rx).await {
		ServerFrame::Users { users } => {
			let handles: Vec<u64> = users.iter().map(|u| u.handle.0).collect();
			assert_eq!(handles, vec![1, 2]);
		}
		other => panic!("expected Users snapshot, got: {other:?}"),
	}

	// Bob's own stream sees join_ok then the two-user snapshot, no
	// UserJoined for himself.
	assert!(matches!(next_frame(&mut bob_rx).await, ServerFrame::JoinOk {}));
	match next_frame(&mut bob_rx).await {
		ServerFrame::Users { users } => assert_eq!(users.len(), 2),
		other => panic!("expected Users snapshot, got: {other:?}"),
	}
}

#[tokio::test]
async fn snapshot_is_ordered_by_handle() {
	let registry = PresenceRegistry::new(PresenceConfig::default());

	let (_, _rx3) = join(&registry, ConnHandle(3), "carol").await;
	let (_, _rx1) = join(&registry, ConnHandle(1), "alice").await;
	let (_, _rx2) = join(&registry, ConnHandle(2), "bob").await;

	let snapshot = registry.snapshot().await;
	let handles: Vec<u64> = snapshot.iter().map(|u| u.handle.0).collect();
	assert_eq!(handles, vec![1, 2, 3]);
}

#[tokio::test]
async fn remove_broadcasts_user_left_exactly_once() {
	let registry = PresenceRegistry::new(PresenceConfig::default());

	let (_, _alice_rx) = join(&registry, ConnHandle(1), "alice").await;
	let (_, mut bob_rx) = join(&registry, ConnHandle(2), "bob").await;
	next_frame(&mut bob_rx).await;
	next_frame(&mut bob_rx).await;

	let removed = registry.remove(ConnHandle(1)).await;
	assert_eq!(removed.expect("first removal yields the user").handle, ConnHandle(1));

	match next_frame(&mut bob_rx).await {
		ServerFrame::UserLeft { user } => assert_eq!(user.handle, ConnHandle(1)),
		other => panic!("expected UserLeft, got: {other:?}"),
	}

	// Second removal is a no-op, no second departure broadcast.
	assert!(registry.remove(ConnHandle(1)).await.is_none());
	assert!(timeout(Duration::from_millis(50), bob_rx.recv()).await.is_err());
}

#[tokio::test]
async fn touch_does_not_resurrect_removed_entries() {
	let registry = PresenceRegistry::new(PresenceConfig::default());

	let (_, _rx) = join(&registry, ConnHandle(1), "alice").await;
	registry.remove(ConnHandle(1)).await;

	registry.touch(ConnHandle(1)).await;
	assert_eq!(registry.online_count().await, 0);
	assert!(registry.lookup(ConnHandle(1)).await.is_none());
}

#[tokio::test]
async fn push_to_unknown_handle_returns_false() {
	let registry = PresenceRegistry::new(PresenceConfig::default());

	let delivered = registry
		.push(
			ConnHandle(42),
			ServerFrame::Error {
				code: "x".to_string(),
				message: "x".to_string(),
			},
		)
		.await;
	assert!(!delivered);
}

#[tokio::test]
async fn observers_see_presence_deltas_in_the_same_order() {
	let registry = PresenceRegistry::new(PresenceConfig::default());

	let (_, mut alice_rx) = join(&registry, ConnHandle(1), "alice").await;
	let (_, mut bob_rx) = join(&registry, ConnHandle(2), "bob").await;

	// Drain the frames from alice's and bob's own joins so both observers
	// start at the same point.
	for _ in 0..4 {
		next_frame(&mut alice_rx).await;
	}
	next_frame(&mut bob_rx).await;
	next_frame(&mut bob_rx).await;

	let (_, _carol_rx) = join(&registry, ConnHandle(3), "carol").await;
	let (_, _dave_rx) = join(&registry, ConnHandle(4), "dave").await;
	registry.remove(ConnHandle(3)).await;

	let mut alice_seen = Vec::new();
	let mut bob_seen = Vec::new();
	for _ in 0..5 {
		alice_seen.push(frame_signature(next_frame(&mut alice_rx).await));
		bob_seen.push(frame_signature(next_frame(&mut bob_rx).await));
	}

	assert_eq!(alice_seen, bob_seen);
	assert_eq!(
		alice_seen,
		vec![
			("user_joined", 3),
			("users", 3),
			("user_joined", 4),
			("users", 4),
			("user_left", 3),
		]
	);
}

fn frame_signature(frame: ServerFrame) -> (&'static str, u64) {
	match frame {
		ServerFrame::UserJoined { user } => ("user_joined", user.handle.0),
		ServerFrame::UserLeft { user } => ("user_left", user.handle.0),
		ServerFrame::Users { users } => ("users", users.len() as u64),
		other => panic!("unexpected presence frame: {other:?}"),
	}
}

#[tokio::test]
async fn join_refused_when_unique_leaves_existing_session_untouched() {
	let registry = PresenceRegistry::new(PresenceConfig { unique_identities: true });

	let (_, mut alice_rx) = join(&registry, ConnHandle(1), "alice").await;
	next_frame(&mut alice_rx).await;
	next_frame(&mut alice_rx).await;

	let (second, _rx) = join(&registry, ConnHandle(2), "alice").await;
	assert!(second.is_err());

	assert!(registry.lookup(ConnHandle(1)).await.is_some());
	assert!(
		timeout(Duration::from_millis(50), alice_rx.recv()).await.is_err(),
		"refused join must not broadcast"
	);
}
