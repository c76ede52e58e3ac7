#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::{Context as _, anyhow};
use bytes::BytesMut;
use relay_domain::ConnHandle;
use relay_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, encode_frame, try_decode_frame_from_buffer};
use relay_protocol::{ClientEnvelope, ClientFrame, ServerEnvelope, ServerFrame, Welcome};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::server::presence::PresenceRegistry;
use crate::server::router::MessageRouter;
use crate::util::time::unix_ms_now;

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub max_frame_bytes: u32,

	/// Depth of the per-connection outbound frame queue.
	pub outbox_capacity: usize,

	/// Advertised to the client in `Welcome`; the liveness monitor
	/// enforces it.
	pub heartbeat_timeout: Duration,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE as u32,
			outbox_capacity: 256,
			heartbeat_timeout: Duration::from_secs(30),
		}
	}
}

/// Drive one client connection from accept to close.
///
/// The connection starts unjoined. `Join` registers it with the presence
/// registry; `Logout`, transport close, or eviction by the liveness
/// monitor end the session. Registry removal at the end is idempotent,
/// so an evicted connection does not broadcast a second departure.
pub async fn handle_connection(
	handle: ConnHandle,
	connection: quinn::Connection,
	registry: PresenceRegistry,
	router: MessageRouter,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("relay_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("relay_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let (mut control_send, mut control_recv) =
		connection.accept_bi().await.context("accept control bidirectional stream")?;

	let max_frame_bytes = settings.max_frame_bytes as usize;

	let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<ClientEnvelope>();
	let reader_task = tokio::spawn(async move {
		let mut buf = BytesMut::with_capacity(16 * 1024);
		let mut tmp = [0u8; 8192];

		loop {
			let n = match control_recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => return Ok::<(), anyhow::Error>(()),
				Err(e) => return Err(anyhow!(e).context("control stream read failed")),
			};

			metrics::counter!("relay_server_control_bytes_in_total").increment(n as u64);

			buf.extend_from_slice(&tmp[..n]);

			loop {
				match try_decode_frame_from_buffer::<ClientEnvelope>(&mut buf, max_frame_bytes) {
					Ok(Some(env)) => {
						metrics::counter!("relay_server_envelopes_in_total").increment(1);

						if ctrl_tx.send(env).is_err() {
							return Ok(());
						}
					}
					Ok(None) => break,
					Err(e) => {
						metrics::counter!("relay_server_control_decode_errors_total").increment(1);
						return Err(anyhow!(e).context("failed to decode control frame"));
					}
				}
			}
		}
	});

	// Every outbound frame goes through one queue so broadcasts from the
	// registry and direct replies share a single write order.
	let (tx, mut rx) = mpsc::channel::<ServerFrame>(settings.outbox_capacity);
	let writer_task = tokio::spawn(async move {
		while let Some(frame) = rx.recv().await {
			let frame = encode_frame(&ServerEnvelope::v1(frame), max_frame_bytes).map_err(|e| anyhow!(e))?;
			metrics::counter!("relay_server_envelopes_out_total").increment(1);
			metrics::counter!("relay_server_control_bytes_out_total").increment(frame.len() as u64);

			control_send.write_all(&frame).await.context("control stream write")?;
		}
		Ok::<(), anyhow::Error>(())
	});

	let welcome = Welcome {
		handle,
		server_name: format!("relay-server/{}", env!("CARGO_PKG_VERSION")),
		server_time_unix_ms: unix_ms_now(),
		heartbeat_timeout_ms: settings.heartbeat_timeout.as_millis() as u64,
		max_frame_bytes: settings.max_frame_bytes,
	};
	tx.send(ServerFrame::Welcome(welcome))
		.await
		.map_err(|_| anyhow!("outbox closed before Welcome"))?;

	let mut joined = false;
	let mut evicted = false;

	let loop_result = async {
		let mut evict_rx: Option<oneshot::Receiver<()>> = None;

		loop {
			let env = tokio::select! {
				env = ctrl_rx.recv() => match env {
					Some(env) => env,
					None => break,
				},
				_ = async {
					if let Some(rx) = evict_rx.as_mut() {
						let _ = rx.await;
					}
				}, if evict_rx.is_some() => {
					info!(handle = %handle, "connection evicted by liveness monitor");
					evicted = true;
					break;
				}
			};

			match env.frame {
				ClientFrame::Join { identity } => {
					if joined {
						debug!(handle = %handle, "ignoring duplicate Join");
						continue;
					}

					let (evict_tx, rx) = oneshot::channel();
					match registry.join(handle, &identity, tx.clone(), evict_tx).await {
						Ok(user) => {
							joined = true;
							evict_rx = Some(rx);
							info!(handle = %handle, identity = %user.identity, "client joined");
							metrics::counter!("relay_server_joins_total").increment(1);
						}
						Err(e) => {
							warn!(handle = %handle, error = %e, "join refused");
							metrics::counter!("relay_server_join_errors_total").increment(1);
							tx.send(ServerFrame::JoinError { reason: e.reason() })
								.await
								.map_err(|_| anyhow!("outbox closed"))?;
						}
					}
				}

				ClientFrame::Heartbeat {} => {
					registry.touch(handle).await;
					metrics::counter!("relay_server_heartbeats_total").increment(1);
				}

				ClientFrame::SendMessage { recipient_handle, text } => {
					if let Err(e) = router.route(handle, recipient_handle, text).await {
						debug!(handle = %handle, recipient = %recipient_handle, error = %e, "send refused");
						metrics::counter!("relay_server_route_errors_total").increment(1);
						tx.send(ServerFrame::Error {
							code: e.code().to_string(),
							message: e.to_string(),
						})
						.await
						.map_err(|_| anyhow!("outbox closed"))?;
					}
				}

				ClientFrame::Logout {} => {
					debug!(handle = %handle, "client logout");
					break;
				}
			}
		}
		Ok::<(), anyhow::Error>(())
	}
	.await;

	// Idempotent: a no-op when the liveness monitor already evicted us.
	if joined && !evicted {
		registry.remove(handle).await;
	}

	drop(tx);
	connection.close(0u32.into(), b"session ended");

	let _ = reader_task.await;
	let _ = writer_task.await;

	loop_result
}
