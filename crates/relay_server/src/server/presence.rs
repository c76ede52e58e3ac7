#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use relay_domain::{ConnHandle, Identity, User};
use relay_protocol::ServerFrame;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::debug;

/// Why a join request was refused.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum JoinError {
	#[error("identity must be non-empty")]
	IdentityRequired,

	#[error("identity is already in use")]
	IdentityTaken,
}

impl JoinError {
	pub fn reason(&self) -> relay_protocol::JoinReason {
		match self {
			Self::IdentityRequired => relay_protocol::JoinReason::IdentityRequired,
			Self::IdentityTaken => relay_protocol::JoinReason::IdentityTaken,
		}
	}
}

/// Configuration for `PresenceRegistry`.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
	/// Reject a join whose identity is already registered.
	pub unique_identities: bool,
}

impl Default for PresenceConfig {
	fn default() -> Self {
		Self { unique_identities: false }
	}
}

/// Registry of joined connections. Fans out presence deltas to every
/// registered outbox.
///
/// All mutations and the broadcasts they trigger happen under one lock,
/// so every observer sees presence deltas in the same order.
#[derive(Debug, Clone)]
pub struct PresenceRegistry {
	inner: Arc<Mutex<Inner>>,
	cfg: PresenceConfig,
}

#[derive(Debug, Default)]
struct Inner {
	entries: HashMap<ConnHandle, Entry>,
}

#[derive(Debug)]
struct Entry {
	identity: Identity,
	last_liveness: tokio::time::Instant,
	outbox: mpsc::Sender<ServerFrame>,
	// Dropped on removal so the connection task notices eviction.
	#[allow(dead_code)]
	evict_tx: oneshot::Sender<()>,
}

impl Entry {
	fn user(&self, handle: ConnHandle) -> User {
		User {
			handle,
			identity: self.identity.clone(),
		}
	}
}

impl PresenceRegistry {
	pub fn new(cfg: PresenceConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			cfg,
		}
	}

	/// Register a joined connection.
	///
	/// On success the requester's outbox receives `JoinOk`, every other
	/// outbox receives `UserJoined`, and then every outbox including the
	/// requester's receives the full `Users` snapshot.
	pub async fn join(
		&self,
		handle: ConnHandle,
		raw_identity: &str,
		outbox: mpsc::Sender<ServerFrame>,
		evict_tx: oneshot::Sender<()>,
	) -> Result<User, JoinError> {
		let identity = Identity::new(raw_identity).map_err(|_| JoinError::IdentityRequired)?;

		let mut inner = self.inner.lock().await;

		if self.cfg.unique_identities && inner.entries.values().any(|e| e.identity == identity) {
			return Err(JoinError::IdentityTaken);
		}

		let entry = Entry {
			identity,
			last_liveness: tokio::time::Instant::now(),
			outbox,
			evict_tx,
		};
		let user = entry.user(handle);

		inner.entries.insert(handle, entry);

		let snapshot = snapshot_locked(&inner);

		for (other, entry) in inner.entries.iter() {
			if *other == handle {
				try_push(entry, ServerFrame::JoinOk {});
			} else {
				try_push(entry, ServerFrame::UserJoined { user: user.clone() });
			}
		}

		// Every connection gets the roster after a join, not just the
		// requester, so late observers converge without a round trip.
		for entry in inner.entries.values() {
			try_push(entry, ServerFrame::Users { users: snapshot.clone() });
		}

		debug!(handle = %handle, identity = %user.identity, online = inner.entries.len(), "presence: joined");

		Ok(user)
	}

	/// Record liveness for a connection. Unknown handles are ignored and
	/// do not resurrect a removed entry.
	pub async fn touch(&self, handle: ConnHandle) {
		let mut inner = self.inner.lock().await;
		if let Some(entry) = inner.entries.get_mut(&handle) {
			entry.last_liveness = tokio::time::Instant::now();
		}
	}

	/// Remove a connection. Broadcasts exactly one `UserLeft` on the first
	/// removal; repeated removals are no-ops.
	pub async fn remove(&self, handle: ConnHandle) -> Option<User> {
		let mut inner = self.inner.lock().await;
		let entry = inner.entries.remove(&handle)?;
		let user = entry.user(handle);

		for entry in inner.entries.values() {
			try_push(entry, ServerFrame::UserLeft { user: user.clone() });
		}

		debug!(handle = %handle, identity = %user.identity, online = inner.entries.len(), "presence: left");

		Some(user)
	}

	/// Snapshot of everyone online, ordered by handle.
	pub async fn snapshot(&self) -> Vec<User> {
		let inner = self.inner.lock().await;
		snapshot_locked(&inner)
	}

	pub async fn lookup(&self, handle: ConnHandle) -> Option<User> {
		let inner = self.inner.lock().await;
		inner.entries.get(&handle).map(|e| e.user(handle))
	}

	/// Queue a frame onto one connection's outbox. Returns false when the
	/// handle is unknown or its outbox is full or closed.
	pub async fn push(&self, handle: ConnHandle, frame: ServerFrame) -> bool {
		let inner = self.inner.lock().await;
		match inner.entries.get(&handle) {
			Some(entry) => try_push(entry, frame),
			None => false,
		}
	}

	/// Evict every connection whose last liveness is older than `timeout`
	/// or whose outbox has been closed. One `UserLeft` per eviction.
	pub async fn evict_stale(&self, timeout: Duration) -> Vec<User> {
		let now = tokio::time::Instant::now();

		let mut inner = self.inner.lock().await;

		let stale: Vec<ConnHandle> = inner
			.entries
			.iter()
			.filter(|(_, e)| now.duration_since(e.last_liveness) > timeout || e.outbox.is_closed())
			.map(|(h, _)| *h)
			.collect();

		let mut evicted = Vec::with_capacity(stale.len());

		for handle in stale {
			let Some(entry) = inner.entries.remove(&handle) else {
				continue;
			};
			let user = entry.user(handle);

			for entry in inner.entries.values() {
				try_push(entry, ServerFrame::UserLeft { user: user.clone() });
			}

			debug!(handle = %handle, identity = %user.identity, "presence: evicted stale connection");
			evicted.push(user);
		}

		evicted
	}

	pub async fn online_count(&self) -> usize {
		let inner = self.inner.lock().await;
		inner.entries.len()
	}
}

fn snapshot_locked(inner: &Inner) -> Vec<User> {
	let mut users: Vec<User> = inner.entries.iter().map(|(h, e)| e.user(*h)).collect();
	users.sort_by_key(|u| u.handle.0);
	users
}

fn try_push(entry: &Entry, frame: ServerFrame) -> bool {
	match entry.outbox.try_send(frame) {
		Ok(()) => true,
		Err(mpsc::error::TrySendError::Full(frame)) => {
			metrics::counter!("relay_server_broadcast_drops_total").increment(1);
			debug!(identity = %entry.identity, kind = frame.kind(), "presence: dropped frame for full outbox");
			false
		}
		Err(mpsc::error::TrySendError::Closed(_)) => false,
	}
}
