#![forbid(unsafe_code)]

use crate::server::accounts::{AccountError, AccountStore};

#[tokio::test]
async fn create_then_verify_roundtrip() {
	let store = AccountStore::in_memory();

	store.create("alice", "hunter2").await.expect("create succeeds");

	assert!(store.verify("alice", "hunter2").await.unwrap());
	assert!(!store.verify("alice", "wrong").await.unwrap());
}

#[tokio::test]
async fn duplicate_identity_is_rejected() {
	let store = AccountStore::in_memory();

	store.create("alice", "one").await.expect("first create succeeds");
	let err = store.create("alice", "two").await.unwrap_err();
	assert!(matches!(err, AccountError::AlreadyExists));

	// The original credential survives the failed create.
	assert!(store.verify("alice", "one").await.unwrap());
}

#[tokio::test]
async fn unknown_identity_verifies_as_false() {
	let store = AccountStore::in_memory();
	assert!(!store.verify("nobody", "anything").await.unwrap());
}

#[tokio::test]
async fn sqlite_backend_enforces_uniqueness() {
	// A pooled `sqlite::memory:` opens one database per connection, so
	// use a throwaway file instead.
	let path = std::env::temp_dir().join(format!("relay-accounts-{}.db", std::process::id()));
	let url = format!("sqlite://{}?mode=rwc", path.display());

	let store = AccountStore::connect(&url).await.expect("connect sqlite");

	store.create("alice", "pw").await.expect("create succeeds");
	let err = store.create("alice", "pw2").await.unwrap_err();
	assert!(matches!(err, AccountError::AlreadyExists));

	assert!(store.verify("alice", "pw").await.unwrap());
	assert!(!store.verify("alice", "pw2").await.unwrap());

	let _ = std::fs::remove_file(&path);
}
