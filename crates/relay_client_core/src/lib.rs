#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use bytes::BytesMut;
use quinn::{ClientConfig, Endpoint, TransportConfig, VarInt};
use relay_domain::{ConnHandle, Message, User};
use relay_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, FramingError, encode_frame, try_decode_frame_from_buffer};
use relay_protocol::{ClientEnvelope, ClientFrame, JoinReason, ServerEnvelope, ServerFrame, Welcome};
use relay_util::endpoint::QuicEndpoint;
use tracing::{debug, info};

/// Client session configuration (v1).
#[derive(Debug, Clone)]
pub struct ClientConfigV1 {
	/// Remote server host (DNS name or IP literal).
	pub server_host: String,

	/// Remote server UDP port.
	pub server_port: u16,

	/// Resolved remote server address override.
	pub server_addr: Option<SocketAddr>,

	/// Maximum inbound/outbound frame size.
	pub max_frame_bytes: usize,

	/// Timeout for connect + handshake.
	pub connect_timeout: Duration,
}

impl ClientConfigV1 {
	/// Parse a `quic://host:port` endpoint into `(host, port)`.
	pub fn parse_quic_endpoint(endpoint: &str) -> Result<(String, u16), ClientCoreError> {
		let e = QuicEndpoint::parse(endpoint)
			.map_err(|msg| ClientCoreError::Protocol(format!("invalid endpoint (expected quic://host:port): {msg}")))?;
		Ok((e.host, e.port))
	}

	/// Convenience: create a config from `quic://host:port`.
	pub fn from_quic_endpoint(endpoint: &str) -> Result<Self, ClientCoreError> {
		let (host, port) = Self::parse_quic_endpoint(endpoint)?;
		Ok(Self {
			server_host: host,
			server_port: port,
			server_addr: None,
			..Self::default()
		})
	}
}

impl Default for ClientConfigV1 {
	fn default() -> Self {
		Self {
			server_host: "localhost".to_string(),
			server_port: 17603,
			server_addr: None,
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			connect_timeout: Duration::from_secs(15),
		}
	}
}

/// Errors for client core operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientCoreError {
	/// QUIC endpoint setup failed.
	#[error("failed to create QUIC endpoint: {0}")]
	Endpoint(String),

	/// Connection establishment failed.
	#[error("failed to connect: {0}")]
	Connect(String),

	/// Protocol framing error.
	#[error(transparent)]
	Framing(#[from] FramingError),

	/// Protocol error (unexpected message ordering/types).
	#[error("protocol error: {0}")]
	Protocol(String),

	/// The server refused a join request.
	#[error("join refused: {0:?}")]
	JoinRefused(JoinReason),

	/// The server refused a send request.
	#[error("send refused ({code}): {message}")]
	SendRefused { code: String, message: String },

	/// IO error.
	#[error("io error: {0}")]
	Io(String),
}

/// A connected client session over the single control stream.
pub struct Session {
	conn: quinn::Connection,
	send: quinn::SendStream,
	recv: quinn::RecvStream,
	buf: BytesMut,
	// Frames received while waiting for a specific reply.
	pending: VecDeque<ServerFrame>,
	max_frame_bytes: usize,
	handle: ConnHandle,
}

impl Session {
	/// Connect and wait for the server's `Welcome`.
	pub async fn connect(cfg: ClientConfigV1) -> Result<(Self, Welcome), ClientCoreError> {
		let endpoint = make_client_endpoint().map_err(|e| ClientCoreError::Endpoint(format!("{e:#}")))?;
		let quinn_cfg = make_insecure_client_config().map_err(|e| ClientCoreError::Endpoint(format!("{e:#}")))?;

		let connect_timeout = cfg.connect_timeout;
		let server_name = cfg.server_host.clone();

		let candidates: Vec<SocketAddr> = match cfg.server_addr {
			Some(addr) => vec![addr],
			None => {
				let hostport = format!("{}:{}", cfg.server_host, cfg.server_port);
				let addrs = hostport
					.to_socket_addrs()
					.map_err(|e| ClientCoreError::Connect(format!("failed to resolve {hostport}: {e}")))?;

				let addrs: Vec<SocketAddr> = addrs.collect();
				if addrs.is_empty() {
					return Err(ClientCoreError::Connect(format!(
						"DNS resolution returned no addresses for {hostport}"
					)));
				}
				addrs
			}
		};

		let mut last_err: Option<String> = None;
		let mut conn: Option<quinn::Connection> = None;

		for server_addr in candidates {
			let connecting = endpoint
				.connect_with(quinn_cfg.clone(), server_addr, &server_name)
				.map_err(|e| ClientCoreError::Connect(format!("connect_with({server_addr}, sni={server_name}): {e}")))?;

			match tokio::time::timeout(connect_timeout, connecting).await {
				Ok(Ok(c)) => {
					conn = Some(c);
					break;
				}
				Ok(Err(e)) => {
					last_err = Some(format!("connect failed (addr={server_addr}, sni={server_name}): {e}"));
				}
				Err(_) => {
					last_err = Some(format!(
						"connect timeout after {connect_timeout:?} (addr={server_addr}, sni={server_name})"
					));
				}
			}
		}

		let conn = conn.ok_or_else(|| {
			ClientCoreError::Connect(
				last_err.unwrap_or_else(|| format!("connect failed (no addresses attempted) (sni={server_name})")),
			)
		})?;

		info!(remote = %conn.remote_address(), "connected");

		let (send, recv) = tokio::time::timeout(connect_timeout, conn.open_bi())
			.await
			.map_err(|_| ClientCoreError::Io(format!("timeout opening control stream after {connect_timeout:?}")))?
			.map_err(|e| ClientCoreError::Io(format!("open_bi(control) failed: {e}")))?;

		let mut session = Self {
			conn,
			send,
			recv,
			buf: BytesMut::with_capacity(16 * 1024),
			pending: VecDeque::new(),
			max_frame_bytes: cfg.max_frame_bytes,
			handle: ConnHandle(0),
		};

		// The control stream only exists on the server once data flows,
		// so nudge it with a heartbeat and wait for Welcome.
		session.write_frame(ClientFrame::Heartbeat {}).await?;

		let welcome = match tokio::time::timeout(connect_timeout, session.read_frame()).await {
			Ok(Ok(ServerFrame::Welcome(w))) => w,
			Ok(Ok(other)) => return Err(ClientCoreError::Protocol(format!("expected Welcome, got {other:?}"))),
			Ok(Err(e)) => return Err(e),
			Err(_) => {
				return Err(ClientCoreError::Protocol(format!(
					"timeout waiting for Welcome after {connect_timeout:?}"
				)));
			}
		};

		session.handle = welcome.handle;
		session.max_frame_bytes = (welcome.max_frame_bytes as usize).min(cfg.max_frame_bytes);

		debug!(
			handle = %welcome.handle,
			server_name = %welcome.server_name,
			heartbeat_timeout_ms = welcome.heartbeat_timeout_ms,
			"received Welcome"
		);

		Ok((session, welcome))
	}

	/// Server-assigned handle for this connection.
	pub fn handle(&self) -> ConnHandle {
		self.handle
	}

	/// Join with an identity. Resolves with the roster snapshot the
	/// server pushes right after the acknowledgement.
	pub async fn join(&mut self, identity: &str) -> Result<Vec<User>, ClientCoreError> {
		self.write_frame(ClientFrame::Join {
			identity: identity.to_string(),
		})
		.await?;

		loop {
			match self.read_frame().await? {
				ServerFrame::JoinOk {} => break,
				ServerFrame::JoinError { reason } => return Err(ClientCoreError::JoinRefused(reason)),
				other => self.pending.push_back(other),
			}
		}

		loop {
			match self.read_frame().await? {
				ServerFrame::Users { users } => return Ok(users),
				other => self.pending.push_back(other),
			}
		}
	}

	/// Send a direct message. Resolves with the recorded message once the
	/// server echoes the acknowledgement.
	pub async fn send_message(&mut self, recipient: ConnHandle, text: &str) -> Result<Message, ClientCoreError> {
		self.write_frame(ClientFrame::SendMessage {
			recipient_handle: recipient,
			text: text.to_string(),
		})
		.await?;

		loop {
			match self.read_frame().await? {
				ServerFrame::MessageSent { message } => return Ok(message),
				ServerFrame::Error { code, message } => return Err(ClientCoreError::SendRefused { code, message }),
				other => self.pending.push_back(other),
			}
		}
	}

	/// Fire-and-forget liveness signal.
	pub async fn heartbeat(&mut self) -> Result<(), ClientCoreError> {
		self.write_frame(ClientFrame::Heartbeat {}).await
	}

	/// Announce departure. The server broadcasts it and closes the session.
	pub async fn logout(&mut self) -> Result<(), ClientCoreError> {
		self.write_frame(ClientFrame::Logout {}).await
	}

	/// Receive the next server frame, draining buffered ones first.
	pub async fn recv_frame(&mut self) -> Result<ServerFrame, ClientCoreError> {
		if let Some(frame) = self.pending.pop_front() {
			return Ok(frame);
		}
		self.read_frame().await
	}

	pub fn close(&self, code: u32, reason: &str) {
		self.conn.close(VarInt::from_u32(code), reason.as_bytes());
	}

	async fn write_frame(&mut self, frame: ClientFrame) -> Result<(), ClientCoreError> {
		let env = ClientEnvelope::v1(frame);
		let bytes = encode_frame(&env, self.max_frame_bytes).map_err(ClientCoreError::Framing)?;
		self.send
			.write_all(&bytes)
			.await
			.map_err(|e| ClientCoreError::Io(e.to_string()))?;
		Ok(())
	}

	async fn read_frame(&mut self) -> Result<ServerFrame, ClientCoreError> {
		let mut tmp = [0u8; 8192];

		loop {
			match try_decode_frame_from_buffer::<ServerEnvelope>(&mut self.buf, self.max_frame_bytes) {
				Ok(Some(env)) => return Ok(env.frame),
				Ok(None) => {}
				Err(e) => return Err(ClientCoreError::Framing(e)),
			}

			let n = match self.recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => {
					return Err(ClientCoreError::Protocol(
						"stream closed before receiving full message".to_string(),
					));
				}
				Err(e) => return Err(ClientCoreError::Io(e.to_string())),
			};

			self.buf.extend_from_slice(&tmp[..n]);
		}
	}
}

fn make_client_endpoint() -> anyhow::Result<Endpoint> {
	let addr: SocketAddr = "0.0.0.0:0".parse().context("parse wildcard addr")?;
	let endpoint = Endpoint::client(addr).context("create client endpoint")?;
	Ok(endpoint)
}

/// Dev-only TLS config that skips server cert validation.
fn make_insecure_client_config() -> anyhow::Result<ClientConfig> {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

	#[derive(Debug)]
	struct NoVerifier;

	impl rustls::client::danger::ServerCertVerifier for NoVerifier {
		fn verify_server_cert(
			&self,
			_end_entity: &rustls::pki_types::CertificateDer<'_>,
			_intermediates: &[rustls::pki_types::CertificateDer<'_>],
			_server_name: &rustls::pki_types::ServerName<'_>,
			_ocsp_response: &[u8],
			_now: rustls::pki_types::UnixTime,
		) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
			Ok(rustls::client::danger::ServerCertVerified::assertion())
		}

		fn verify_tls12_signature(
			&self,
			_message: &[u8],
			_cert: &rustls::pki_types::CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
			Err(rustls::Error::General("TLS1.2 not supported".into()))
		}

		fn verify_tls13_signature(
			&self,
			_message: &[u8],
			_cert: &rustls::pki_types::CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
			Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
		}

		fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
			vec![
				rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
				rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
				rustls::SignatureScheme::RSA_PSS_SHA256,
				rustls::SignatureScheme::RSA_PSS_SHA384,
				rustls::SignatureScheme::RSA_PSS_SHA512,
				rustls::SignatureScheme::ED25519,
			]
		}
	}

	let mut tls = rustls::ClientConfig::builder()
		.with_root_certificates(rustls::RootCertStore::empty())
		.with_no_client_auth();

	tls.dangerous().set_certificate_verifier(Arc::new(NoVerifier));
	tls.alpn_protocols = vec![b"relay-v1".to_vec()];

	let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls)?;

	let mut cfg = ClientConfig::new(Arc::new(quic_tls));

	let mut transport = TransportConfig::default();
	transport.max_concurrent_bidi_streams(VarInt::from_u32(16));
	transport.max_concurrent_uni_streams(VarInt::from_u32(16));
	cfg.transport_config(Arc::new(transport));

	Ok(cfg)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_config_is_sane() {
		let cfg = ClientConfigV1::default();
		assert_eq!(cfg.server_host, "localhost");
		assert_eq!(cfg.server_port, 17603);
		assert!(cfg.max_frame_bytes > 0);
	}

	#[test]
	fn from_quic_endpoint_parses_host_and_port() {
		let cfg = ClientConfigV1::from_quic_endpoint("quic://relay.example:9000").unwrap();
		assert_eq!(cfg.server_host, "relay.example");
		assert_eq!(cfg.server_port, 9000);
	}
}
