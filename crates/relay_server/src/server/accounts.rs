#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use tokio::sync::Mutex;

/// Account store failure modes surfaced to the HTTP sidecar.
#[derive(Debug, thiserror::Error)]
pub enum AccountError {
	#[error("account already exists")]
	AlreadyExists,

	#[error("account storage error: {0}")]
	Storage(#[from] sqlx::Error),
}

/// Registered accounts, either in process memory or behind a sqlx pool.
///
/// Credentials are stored verbatim. Hashing and real authentication sit
/// outside this service's boundary.
#[derive(Clone)]
pub struct AccountStore {
	backend: AccountBackend,
}

#[derive(Clone)]
enum AccountBackend {
	Memory(Arc<Mutex<HashMap<String, String>>>),
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
	Mysql(sqlx::MySqlPool),
}

impl AccountStore {
	pub fn in_memory() -> Self {
		Self {
			backend: AccountBackend::Memory(Arc::new(Mutex::new(HashMap::new()))),
		}
	}

	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		let backend = if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
			sqlx::query("CREATE TABLE IF NOT EXISTS accounts (identity TEXT PRIMARY KEY, credential TEXT NOT NULL)")
				.execute(&pool)
				.await
				.context("create accounts table (sqlite)")?;
			AccountBackend::Sqlite(pool)
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::query("CREATE TABLE IF NOT EXISTS accounts (identity TEXT PRIMARY KEY, credential TEXT NOT NULL)")
				.execute(&pool)
				.await
				.context("create accounts table (postgres)")?;
			AccountBackend::Postgres(pool)
		} else if database_url.starts_with("mysql:") || database_url.starts_with("mariadb:") {
			let pool = sqlx::MySqlPool::connect(database_url).await.context("connect mysql")?;
			sqlx::query("CREATE TABLE IF NOT EXISTS accounts (identity VARCHAR(255) PRIMARY KEY, credential TEXT NOT NULL)")
				.execute(&pool)
				.await
				.context("create accounts table (mysql)")?;
			AccountBackend::Mysql(pool)
		} else {
			return Err(anyhow!("unsupported database_url for accounts"));
		};

		Ok(Self { backend })
	}

	/// Create an account. Fails if the identity is already registered.
	pub async fn create(&self, identity: &str, credential: &str) -> Result<(), AccountError> {
		match &self.backend {
			AccountBackend::Memory(map) => {
				let mut map = map.lock().await;
				if map.contains_key(identity) {
					return Err(AccountError::AlreadyExists);
				}
				map.insert(identity.to_string(), credential.to_string());
				Ok(())
			}
			AccountBackend::Sqlite(pool) => {
				let res = sqlx::query("INSERT INTO accounts (identity, credential) VALUES (?, ?)")
					.bind(identity)
					.bind(credential)
					.execute(pool)
					.await;
				map_insert_result(res)
			}
			AccountBackend::Postgres(pool) => {
				let res = sqlx::query("INSERT INTO accounts (identity, credential) VALUES ($1, $2)")
					.bind(identity)
					.bind(credential)
					.execute(pool)
					.await;
				map_insert_result(res)
			}
			AccountBackend::Mysql(pool) => {
				let res = sqlx::query("INSERT INTO accounts (identity, credential) VALUES (?, ?)")
					.bind(identity)
					.bind(credential)
					.execute(pool)
					.await;
				map_insert_result(res)
			}
		}
	}

	/// Check a credential against the stored one. Unknown identities
	/// verify as false.
	pub async fn verify(&self, identity: &str, credential: &str) -> Result<bool, AccountError> {
		match &self.backend {
			AccountBackend::Memory(map) => {
				let map = map.lock().await;
				Ok(map.get(identity).is_some_and(|stored| stored == credential))
			}
			AccountBackend::Sqlite(pool) => {
				let stored: Option<String> = sqlx::query_scalar("SELECT credential FROM accounts WHERE identity = ?")
					.bind(identity)
					.fetch_optional(pool)
					.await?;
				Ok(stored.is_some_and(|stored| stored == credential))
			}
			AccountBackend::Postgres(pool) => {
				let stored: Option<String> = sqlx::query_scalar("SELECT credential FROM accounts WHERE identity = $1")
					.bind(identity)
					.fetch_optional(pool)
					.await?;
				Ok(stored.is_some_and(|stored| stored == credential))
			}
			AccountBackend::Mysql(pool) => {
				let stored: Option<String> = sqlx::query_scalar("SELECT credential FROM accounts WHERE identity = ?")
					.bind(identity)
					.fetch_optional(pool)
					.await?;
				Ok(stored.is_some_and(|stored| stored == credential))
			}
		}
	}
}

fn map_insert_result(res: Result<impl Sized, sqlx::Error>) -> Result<(), AccountError> {
	match res {
		Ok(_) => Ok(()),
		Err(sqlx::Error::Database(db_err)) if db_err.kind() == sqlx::error::ErrorKind::UniqueViolation => {
			Err(AccountError::AlreadyExists)
		}
		Err(e) => Err(AccountError::Storage(e)),
	}
}
