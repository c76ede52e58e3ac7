#![forbid(unsafe_code)]

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use crate::server::presence::PresenceRegistry;

/// Configuration for the liveness monitor.
#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
	/// Interval between eviction sweeps.
	pub sweep_interval: Duration,

	/// Connections silent for longer than this are evicted.
	pub idle_timeout: Duration,
}

impl Default for MonitorConfig {
	fn default() -> Self {
		Self {
			sweep_interval: Duration::from_secs(10),
			idle_timeout: Duration::from_secs(30),
		}
	}
}

/// Spawn the background sweep that evicts silent connections.
pub fn spawn_liveness_monitor(registry: PresenceRegistry, cfg: MonitorConfig) -> JoinHandle<()> {
	tokio::spawn(async move {
		let mut ticker = tokio::time::interval(cfg.sweep_interval);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

		// The first tick fires immediately; skip it so a fresh join is
		// never swept before its first heartbeat window.
		ticker.tick().await;

		loop {
			ticker.tick().await;

			let evicted = registry.evict_stale(cfg.idle_timeout).await;
			if !evicted.is_empty() {
				metrics::counter!("relay_server_evictions_total").increment(evicted.len() as u64);
				for user in &evicted {
					info!(handle = %user.handle, identity = %user.identity, "liveness: evicted idle connection");
				}
			}
		}
	})
}
