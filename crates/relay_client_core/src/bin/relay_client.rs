#![forbid(unsafe_code)]

use relay_client_core::{ClientConfigV1, Session};
use relay_protocol::ServerFrame;
use tracing::{info, warn};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: relay_client --identity name [--connect quic://host:port] [--send handle:text]\n\
\n\
Options:\n\
	--identity  Display name to join with (required)\n\
	--connect   Server endpoint (default: quic://127.0.0.1:17603)\n\
	            Format: quic://host:port\n\
	--send      Send one message after joining: recipient handle and text\n\
	            Format: handle:text (e.g. 2:hello)\n\
	--help      Show this help\n\
\n\
Examples:\n\
	relay_client --identity alice\n\
	relay_client --identity bob --connect quic://relay.example.com:443 --send 1:hi\n"
	);
	std::process::exit(2)
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,relay_client_core=debug".to_string());
	tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

struct Args {
	endpoint: String,
	identity: String,
	send: Option<(u64, String)>,
}

fn parse_args() -> Args {
	let mut endpoint = "quic://127.0.0.1:17603".to_string();
	let mut identity: Option<String> = None;
	let mut send: Option<(u64, String)> = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--connect" | "--endpoint" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--connect must be non-empty (expected quic://host:port)");
					usage_and_exit();
				}
				endpoint = v;
			}
			"--identity" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--identity must be non-empty");
					usage_and_exit();
				}
				identity = Some(v);
			}
			"--send" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				let Some((handle, text)) = v.split_once(':') else {
					eprintln!("Invalid --send value (expected handle:text): {v}");
					usage_and_exit()
				};
				let handle: u64 = handle.parse().unwrap_or_else(|_| {
					eprintln!("Invalid --send handle (expected integer): {v}");
					usage_and_exit()
				});
				send = Some((handle, text.to_string()));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let Some(identity) = identity else {
		eprintln!("--identity is required");
		usage_and_exit()
	};

	Args { endpoint, identity, send }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();
	let args = parse_args();

	let cfg = ClientConfigV1::from_quic_endpoint(&args.endpoint)?;
	let (mut session, welcome) = Session::connect(cfg).await?;
	info!(
		handle = %welcome.handle,
		server = %welcome.server_name,
		heartbeat_timeout_ms = welcome.heartbeat_timeout_ms,
		"connected"
	);

	let users = session.join(&args.identity).await?;
	info!(identity = %args.identity, online = users.len(), "joined");
	for user in &users {
		info!(handle = %user.handle, identity = %user.identity, "online");
	}

	if let Some((handle, text)) = args.send {
		let message = session.send_message(relay_domain::ConnHandle(handle), &text).await?;
		info!(message_id = %message.id, recipient = %message.recipient, "message sent");
	}

	let heartbeat_every = std::time::Duration::from_millis(welcome.heartbeat_timeout_ms.max(1000) / 3);

	loop {
		match tokio::time::timeout(heartbeat_every, session.recv_frame()).await {
			Err(_) => {
				session.heartbeat().await?;
			}
			Ok(Ok(ServerFrame::NewMessage { message })) => {
				info!(from = %message.sender, text = %message.text, "new message");
			}
			Ok(Ok(ServerFrame::UserJoined { user })) => {
				info!(handle = %user.handle, identity = %user.identity, "user joined");
			}
			Ok(Ok(ServerFrame::UserLeft { user })) => {
				info!(handle = %user.handle, identity = %user.identity, "user left");
			}
			Ok(Ok(other)) => {
				info!("server frame: {other:?}");
			}
			Ok(Err(e)) => {
				warn!(error = %e, "session ended");
				break;
			}
		}
	}

	session.close(0, "done");
	Ok(())
}
