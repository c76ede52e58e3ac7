#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use relay_domain::Identity;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::warn;

use crate::server::accounts::{AccountError, AccountStore};
use crate::server::conversations::ConversationStore;

#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

#[derive(Clone)]
struct HttpState {
	health: HealthState,
	accounts: AccountStore,
	conversations: ConversationStore,
}

#[derive(Debug, Deserialize)]
struct AccountRequest {
	identity: String,
	credential: String,
}

/// Spawn the HTTP sidecar serving health probes and the account and
/// history endpoints.
pub fn spawn_http_server(bind: SocketAddr, health: HealthState, accounts: AccountStore, conversations: ConversationStore) {
	let state = HttpState {
		health,
		accounts,
		conversations,
	};
	tokio::spawn(async move {
		if let Err(err) = run_http_server(bind, state).await {
			warn!(error = %err, "http sidecar stopped");
		}
	});
}

async fn run_http_server(bind: SocketAddr, state: HttpState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_request(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "http sidecar connection error");
			}
		});
	}
}

async fn handle_request(req: Request<Incoming>, state: HttpState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	let method = req.method().clone();
	let path = req.uri().path().to_string();

	match (method, path.as_str()) {
		(Method::GET, "/healthz") => Ok(text(StatusCode::OK, "ok")),
		(Method::GET, "/readyz") => {
			if state.health.is_ready() {
				Ok(text(StatusCode::OK, "ready"))
			} else {
				Ok(text(StatusCode::SERVICE_UNAVAILABLE, "not-ready"))
			}
		}
		(Method::POST, "/v1/accounts") => {
			let Some(body) = read_json_body::<AccountRequest>(req).await? else {
				return Ok(text(StatusCode::BAD_REQUEST, "invalid body"));
			};
			if body.identity.trim().is_empty() || body.credential.is_empty() {
				return Ok(text(StatusCode::BAD_REQUEST, "identity and credential required"));
			}
			match state.accounts.create(body.identity.trim(), &body.credential).await {
				Ok(()) => Ok(text(StatusCode::CREATED, "created")),
				Err(AccountError::AlreadyExists) => Ok(text(StatusCode::CONFLICT, "account already exists")),
				Err(err) => {
					warn!(error = %err, "account create failed");
					Ok(text(StatusCode::INTERNAL_SERVER_ERROR, "storage error"))
				}
			}
		}
		(Method::POST, "/v1/login") => {
			let Some(body) = read_json_body::<AccountRequest>(req).await? else {
				return Ok(text(StatusCode::BAD_REQUEST, "invalid body"));
			};
			match state.accounts.verify(body.identity.trim(), &body.credential).await {
				Ok(true) => Ok(text(StatusCode::OK, "ok")),
				Ok(false) => Ok(text(StatusCode::UNAUTHORIZED, "invalid credentials")),
				Err(err) => {
					warn!(error = %err, "account verify failed");
					Ok(text(StatusCode::INTERNAL_SERVER_ERROR, "storage error"))
				}
			}
		}
		(Method::GET, "/v1/history") => {
			let query = req.uri().query().unwrap_or_default();
			let (Some(a), Some(b)) = (query_param(query, "a"), query_param(query, "b")) else {
				return Ok(text(StatusCode::BAD_REQUEST, "query params a and b required"));
			};
			let (Ok(a), Ok(b)) = (Identity::new(&a), Identity::new(&b)) else {
				return Ok(text(StatusCode::BAD_REQUEST, "identities must be non-empty"));
			};
			let history = state.conversations.history(&a, &b).await;
			match serde_json::to_vec(&history) {
				Ok(body) => Ok(Response::builder()
					.status(StatusCode::OK)
					.header("content-type", "application/json")
					.body(Full::new(Bytes::from(body)))
					.unwrap()),
				Err(err) => {
					warn!(error = %err, "history serialization failed");
					Ok(text(StatusCode::INTERNAL_SERVER_ERROR, "serialization error"))
				}
			}
		}
		(Method::GET, _) | (Method::POST, _) => Ok(text(StatusCode::NOT_FOUND, "")),
		_ => Ok(text(StatusCode::METHOD_NOT_ALLOWED, "")),
	}
}

async fn read_json_body<T: serde::de::DeserializeOwned>(req: Request<Incoming>) -> Result<Option<T>, hyper::Error> {
	let bytes = req.into_body().collect().await?.to_bytes();
	Ok(serde_json::from_slice(&bytes).ok())
}

pub(crate) fn query_param(query: &str, name: &str) -> Option<String> {
	query.split('&').find_map(|pair| {
		let (k, v) = pair.split_once('=')?;
		if k != name || v.is_empty() {
			return None;
		}
		// Query values arrive percent-encoded, with '+' for spaces.
		let decoded = urlencoding::decode(&v.replace('+', " ")).ok()?.into_owned();
		if decoded.is_empty() { None } else { Some(decoded) }
	})
}

fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
	Response::builder()
		.status(status)
		.body(Full::new(Bytes::from_static(body.as_bytes())))
		.unwrap()
}
