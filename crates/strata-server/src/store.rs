//! Source-of-truth storage for users.
//!
//! The cache sits in front of a [`UserStore`]; the store is the only place a
//! user is authoritative. Both implementations enforce email uniqueness
//! themselves, independent of the cache reservation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use sqlx_core::error::Error as SqlxError;
use sqlx_core::pool::PoolOptions;
use sqlx_core::query::query;
use sqlx_core::query_as::query_as;
use sqlx_postgres::{PgPool, Postgres};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::config::PostgresStorageConfig;
use crate::models::User;

/// PostgreSQL error code for unique violation (23505).
pub const PG_UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("conflict: {message}")]
    Conflict { message: String },

    #[error("storage backend error: {message}")]
    Backend { message: String },
}

impl StoreError {
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }
}

impl From<SqlxError> for StoreError {
    fn from(err: SqlxError) -> Self {
        if let SqlxError::Database(db_err) = &err
            && db_err.code().as_deref() == Some(PG_UNIQUE_VIOLATION)
        {
            return Self::conflict(db_err.message().to_string());
        }
        Self::backend(err.to_string())
    }
}

#[async_trait]
pub trait UserStore: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Persists a new user. An email that is already taken is a `Conflict`.
    async fn insert(&self, user: &User) -> Result<(), StoreError>;

    async fn find(&self, id: Uuid) -> Result<Option<User>, StoreError>;

    async fn health(&self) -> Result<(), StoreError>;

    async fn close(&self) {}
}

/// In-process store for single-node deployments and tests.
#[derive(Debug, Default)]
pub struct MemoryUserStore {
    users: DashMap<Uuid, User>,
    emails: DashMap<String, Uuid>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn insert(&self, user: &User) -> Result<(), StoreError> {
        match self.emails.entry(user.email.to_lowercase()) {
            Entry::Occupied(_) => Err(StoreError::conflict(format!(
                "email {} already registered",
                user.email
            ))),
            Entry::Vacant(slot) => {
                slot.insert(user.id);
                self.users.insert(user.id, user.clone());
                Ok(())
            }
        }
    }

    async fn find(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.users.get(&id).map(|u| u.value().clone()))
    }

    async fn health(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

type UserRow = (Uuid, String, String, DateTime<Utc>);

fn row_to_user((id, username, email, created_at): UserRow) -> User {
    User {
        id,
        username,
        email,
        created_at,
    }
}

/// PostgreSQL-backed store.
#[derive(Debug, Clone)]
pub struct PgUserStore {
    pool: PgPool,
}

impl PgUserStore {
    /// Connects, then creates the `users` table and its unique email index if
    /// they do not exist.
    #[instrument(skip(config), fields(url = %mask_password(&config.url)))]
    pub async fn connect(config: &PostgresStorageConfig) -> Result<Self, StoreError> {
        info!(
            pool_size = config.pool_size,
            connect_timeout_ms = config.connect_timeout_ms,
            "Creating PostgreSQL connection pool"
        );

        let pool = PoolOptions::<Postgres>::new()
            .max_connections(config.pool_size)
            .min_connections((config.pool_size / 4).max(1))
            .acquire_timeout(config.connect_timeout())
            .connect(&config.url)
            .await?;

        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        query(
            "CREATE TABLE IF NOT EXISTS users (
                id UUID PRIMARY KEY,
                username TEXT NOT NULL,
                email TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        query("CREATE UNIQUE INDEX IF NOT EXISTS users_email_key ON users (lower(email))")
            .execute(&self.pool)
            .await?;

        debug!("users schema ready");
        Ok(())
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    #[instrument(skip(self, user), fields(user_id = %user.id))]
    async fn insert(&self, user: &User) -> Result<(), StoreError> {
        query("INSERT INTO users (id, username, email, created_at) VALUES ($1, $2, $3, $4)")
            .bind(user.id)
            .bind(user.username.as_str())
            .bind(user.email.as_str())
            .bind(user.created_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn find(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let row: Option<UserRow> =
            query_as("SELECT id, username, email, created_at FROM users WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(row_to_user))
    }

    async fn health(&self) -> Result<(), StoreError> {
        query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Masks the password in a database URL for logging.
fn mask_password(url: &str) -> String {
    if let Some(at_pos) = url.find('@')
        && let Some(colon_pos) = url[..at_pos].rfind(':')
    {
        let scheme_end = url.find("://").map(|p| p + 3).unwrap_or(0);
        if colon_pos > scheme_end {
            return format!("{}:****{}", &url[..colon_pos], &url[at_pos..]);
        }
    }
    url.to_string()
}
