#![forbid(unsafe_code)]

//! End-to-end smoke test against the compiled `relay_server` binary.

use std::net::SocketAddr;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context as _;
use relay_client_core::{ClientConfigV1, Session};
use relay_domain::Message;
use relay_protocol::ServerFrame;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn free_udp_port() -> anyhow::Result<u16> {
	let socket = std::net::UdpSocket::bind("127.0.0.1:0").context("bind scratch udp socket")?;
	Ok(socket.local_addr().context("scratch udp local_addr")?.port())
}

fn free_tcp_port() -> anyhow::Result<u16> {
	let listener = std::net::TcpListener::bind("127.0.0.1:0").context("bind scratch tcp socket")?;
	Ok(listener.local_addr().context("scratch tcp local_addr")?.port())
}

struct ServerProcess {
	// Killed on drop so a failing test does not leak the child.
	_child: tokio::process::Child,
	quic_addr: SocketAddr,
	http_addr: SocketAddr,
}

async fn spawn_server() -> anyhow::Result<ServerProcess> {
	let quic_port = free_udp_port()?;
	let http_port = free_tcp_port()?;
	let quic_addr: SocketAddr = format!("127.0.0.1:{quic_port}").parse()?;
	let http_addr: SocketAddr = format!("127.0.0.1:{http_port}").parse()?;

	// An empty home directory keeps a developer's own config file out of
	// the run.
	let home = std::env::temp_dir().join(format!("relay-e2e-{}-{quic_port}", std::process::id()));
	std::fs::create_dir_all(&home).context("create scratch home")?;

	let child = tokio::process::Command::new(env!("CARGO_BIN_EXE_relay_server"))
		.arg("--bind")
		.arg(format!("quic://127.0.0.1:{quic_port}"))
		.env("HOME", &home)
		.env("RELAY_HTTP_BIND", format!("127.0.0.1:{http_port}"))
		.env("RELAY_PERSISTENCE_ENABLED", "0")
		.env("RELAY_UNIQUE_IDENTITIES", "0")
		.env_remove("RELAY_TLS_CERT")
		.env_remove("RELAY_TLS_KEY")
		.env_remove("RELAY_METRICS_BIND")
		.env_remove("RELAY_DATABASE_URL")
		.env_remove("RELAY_HEARTBEAT_TIMEOUT_SECS")
		.env_remove("RELAY_SWEEP_INTERVAL_SECS")
		.env_remove("RELAY_OUTBOX_CAPACITY")
		.stdout(Stdio::null())
		.stderr(Stdio::null())
		.kill_on_drop(true)
		.spawn()
		.context("spawn relay_server binary")?;

	let server = ServerProcess {
		_child: child,
		quic_addr,
		http_addr,
	};

	// The sidecar reports ready only after the QUIC endpoint is bound.
	for _ in 0..100 {
		if let Ok((200, _)) = http_get(server.http_addr, "/readyz").await {
			return Ok(server);
		}
		tokio::time::sleep(Duration::from_millis(100)).await;
	}
	anyhow::bail!("server did not become ready within 10s")
}

async fn http_get(addr: SocketAddr, path: &str) -> anyhow::Result<(u16, String)> {
	let mut stream = tokio::net::TcpStream::connect(addr).await.context("connect sidecar")?;
	let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
	stream.write_all(request.as_bytes()).await.context("write request")?;

	let mut raw = Vec::new();
	stream.read_to_end(&mut raw).await.context("read response")?;
	let text = String::from_utf8_lossy(&raw);

	let status: u16 = text
		.split_whitespace()
		.nth(1)
		.and_then(|s| s.parse().ok())
		.context("parse status line")?;
	let body = text.split("\r\n\r\n").nth(1).unwrap_or_default().to_string();

	Ok((status, body))
}

fn client_config(server_addr: SocketAddr) -> ClientConfigV1 {
	ClientConfigV1 {
		server_host: "localhost".to_string(),
		server_port: server_addr.port(),
		server_addr: Some(server_addr),
		..ClientConfigV1::default()
	}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn relay_binary_serves_a_full_session() -> anyhow::Result<()> {
	let server = spawn_server().await?;

	let (mut alice, alice_welcome) = Session::connect(client_config(server.quic_addr)).await.context("alice connect")?;
	let (mut bob, bob_welcome) = Session::connect(client_config(server.quic_addr)).await.context("bob connect")?;
	assert_ne!(alice_welcome.handle, bob_welcome.handle);

	let roster = alice.join("alice").await.context("alice join")?;
	assert_eq!(roster.len(), 1);

	let roster = bob.join("bob").await.context("bob join")?;
	assert_eq!(roster.len(), 2);
	assert!(roster.iter().any(|u| u.identity.as_str() == "alice"));

	let sent = alice.send_message(bob.handle(), "hi bob").await.context("send")?;
	assert_eq!(sent.sender.as_str(), "alice");
	assert_eq!(sent.recipient.as_str(), "bob");

	let frame = tokio::time::timeout(Duration::from_secs(5), bob.recv_frame())
		.await
		.context("timeout waiting for delivery")??;
	match frame {
		ServerFrame::NewMessage { message } => {
			assert_eq!(message.id, sent.id);
			assert_eq!(message.text, "hi bob");
		}
		other => panic!("expected NewMessage, got: {other:?}"),
	}

	// The sidecar serves the conversation the router recorded.
	let (status, body) = http_get(server.http_addr, "/v1/history?a=alice&b=bob").await?;
	assert_eq!(status, 200);
	let history: Vec<Message> = serde_json::from_str(&body).context("parse history body")?;
	assert_eq!(history.len(), 1);
	assert_eq!(history[0].id, sent.id);

	// Logout propagates to the remaining client.
	bob.logout().await.context("bob logout")?;
	loop {
		let frame = tokio::time::timeout(Duration::from_secs(5), alice.recv_frame())
			.await
			.context("timeout waiting for departure")??;
		match frame {
			ServerFrame::UserLeft { user } => {
				assert_eq!(user.identity.as_str(), "bob");
				break;
			}
			ServerFrame::UserJoined { .. } | ServerFrame::Users { .. } => continue,
			other => panic!("expected presence frames, got: {other:?}"),
		}
	}

	alice.close(0, "done");
	Ok(())
}
