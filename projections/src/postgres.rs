//! `PostgreSQL` implementations for projections.
//!
//! # Overview
//!
//! Provides `PostgreSQL`-backed storage for projections with:
//! - Generic key-value storage of bincode-encoded projections
//! - Checkpoint tracking in the `projection_state` table
//! - Separate database support (true CQRS)
//!
//! Both adapters run their statements through a [`PgSession`]. While the
//! session has a transaction open, every statement joins it; otherwise each
//! statement autocommits on a pooled connection. Handing the same session to
//! a projector's repositories, its checkpoint store and
//! [`CheckpointedProjector::with_unit_of_work`](crate::CheckpointedProjector::with_unit_of_work)
//! makes each batch and its checkpoint one transaction.
//!
//! # Architecture
//!
//! ```text
//! Write Side (Event Log)            Read Side (Projections)
//! ┌─────────────────────┐          ┌─────────────────────┐
//! │  PostgreSQL DB #1   │          │  PostgreSQL DB #2   │
//! │                     │          │                     │
//! │  events             │   →→→    │  projection_data    │
//! │                     │  Events  │  projection_state   │
//! └─────────────────────┘          └─────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use eventide_projections::postgres::*;
//!
//! let pool = connect("postgres://localhost/projections").await?;
//! migrate(&pool).await?;
//!
//! let session = PgSession::new(pool);
//! let products = PostgresProjectionRepository::<Product>::new(session.clone(), "projection_data")?;
//! let checkpoints = Arc::new(PostgresCheckpointStore::new(session.clone()));
//!
//! let projector = CheckpointedProjector::new(EntityProjector::new("catalog", map, products), checkpoints)
//!     .with_unit_of_work(Arc::new(session));
//! ```

use eventide_core::projection::{
    Checkpoint, CheckpointStore, Projection, ProjectionError, ProjectionRepository, Result,
    UnitOfWork,
};
use eventide_core::subscription::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::fmt::Display;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Connect a pool to a projection database.
///
/// # Errors
///
/// Returns [`ProjectionError::Storage`] if connection fails.
pub async fn connect(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .map_err(|e| ProjectionError::Storage(format!("Failed to connect: {e}")))
}

/// Run the embedded migrations creating `projection_data` and
/// `projection_state`.
///
/// # Errors
///
/// Returns [`ProjectionError::Storage`] if migration fails.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| ProjectionError::Storage(format!("Migration failed: {e}")))?;
    Ok(())
}

/// Pool plus an optional open transaction, shared by every adapter of one
/// projection.
///
/// Cloning is cheap and clones share the transaction slot. As a
/// [`UnitOfWork`], `begin` opens a transaction on the pool, `commit` and
/// `rollback` close it. A transaction the caller already holds can be
/// handed over with [`attach`](Self::attach) and taken back with
/// [`detach`](Self::detach).
#[derive(Clone)]
pub struct PgSession {
    pool: PgPool,
    transaction: Arc<Mutex<Option<Transaction<'static, Postgres>>>>,
}

impl PgSession {
    /// Create a session with no open transaction.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            transaction: Arc::new(Mutex::new(None)),
        }
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Whether statements currently join an open transaction.
    pub async fn in_transaction(&self) -> bool {
        self.transaction.lock().await.is_some()
    }

    /// Run subsequent statements inside `transaction`.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if a transaction is already open;
    /// `transaction` is dropped, and so rolled back, in that case.
    pub async fn attach(&self, transaction: Transaction<'static, Postgres>) -> Result<()> {
        let mut slot = self.transaction.lock().await;
        if slot.is_some() {
            return Err(already_open());
        }
        *slot = Some(transaction);
        Ok(())
    }

    /// Take the open transaction back, leaving statements to autocommit.
    pub async fn detach(&self) -> Option<Transaction<'static, Postgres>> {
        self.transaction.lock().await.take()
    }

    /// Run `op` on the open transaction, or on a pooled connection when none
    /// is open.
    async fn run<T, F>(&self, op: F) -> sqlx::Result<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, sqlx::Result<T>> + Send,
    {
        let mut slot = self.transaction.lock().await;
        if let Some(transaction) = slot.as_mut() {
            return op(&mut **transaction).await;
        }
        drop(slot);

        let mut connection = self.pool.acquire().await?;
        op(&mut *connection).await
    }
}

impl From<PgPool> for PgSession {
    fn from(pool: PgPool) -> Self {
        Self::new(pool)
    }
}

impl std::fmt::Debug for PgSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgSession")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

fn already_open() -> ProjectionError {
    ProjectionError::Storage("A transaction is already open on this session".to_string())
}

impl UnitOfWork for PgSession {
    fn begin(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut slot = self.transaction.lock().await;
            if slot.is_some() {
                return Err(already_open());
            }
            let transaction = self
                .pool
                .begin()
                .await
                .map_err(|e| ProjectionError::Storage(format!("Failed to begin transaction: {e}")))?;
            *slot = Some(transaction);
            tracing::trace!("Transaction opened");
            Ok(())
        })
    }

    fn commit(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let Some(transaction) = self.transaction.lock().await.take() else {
                return Err(ProjectionError::Storage(
                    "No transaction is open on this session".to_string(),
                ));
            };
            transaction
                .commit()
                .await
                .map_err(|e| ProjectionError::Storage(format!("Failed to commit transaction: {e}")))?;
            tracing::trace!("Transaction committed");
            Ok(())
        })
    }

    fn rollback(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let Some(transaction) = self.transaction.lock().await.take() else {
                return Ok(());
            };
            transaction.rollback().await.map_err(|e| {
                ProjectionError::Storage(format!("Failed to roll back transaction: {e}"))
            })?;
            tracing::trace!("Transaction rolled back");
            Ok(())
        })
    }
}

/// Check that `name` is a plain or schema-qualified SQL identifier.
///
/// Table names are spliced into statements, so anything else is refused.
fn validate_table_name(name: &str) -> Result<()> {
    let valid_part = |part: &str| {
        let mut chars = part.chars();
        chars
            .next()
            .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    };
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() <= 2 && parts.iter().all(|part| valid_part(part)) {
        Ok(())
    } else {
        Err(ProjectionError::Storage(format!("Invalid table name: {name:?}")))
    }
}

/// Statements of one projection table.
#[derive(Debug, Clone)]
struct TableStatements {
    select: Arc<str>,
    upsert: Arc<str>,
    delete: Arc<str>,
}

impl TableStatements {
    fn new(table: &str) -> Self {
        Self {
            select: format!("SELECT data FROM {table} WHERE key = $1").into(),
            upsert: format!(
                "INSERT INTO {table} (key, data, updated_at)
                 VALUES ($1, $2, now())
                 ON CONFLICT (key) DO UPDATE
                 SET data = EXCLUDED.data, updated_at = now()"
            )
            .into(),
            delete: format!("DELETE FROM {table} WHERE key = $1").into(),
        }
    }
}

fn encode<P: Serialize>(key: &str, projection: &P) -> Result<Vec<u8>> {
    bincode::serialize(projection).map_err(|e| {
        ProjectionError::Serialization(format!("Failed to encode projection {key}: {e}"))
    })
}

fn decode<P: DeserializeOwned>(key: &str, data: &[u8]) -> Result<P> {
    bincode::deserialize(data).map_err(|e| {
        ProjectionError::Serialization(format!("Failed to decode projection {key}: {e}"))
    })
}

/// PostgreSQL-backed repository for one projection type.
///
/// Projections are stored bincode-encoded, keyed by the `Display` rendering
/// of their key.
///
/// # Schema
///
/// ```sql
/// CREATE TABLE projection_data (
///     key TEXT PRIMARY KEY,
///     data BYTEA NOT NULL,
///     updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
/// );
/// ```
///
/// Several projection types can share one table if their keys never
/// collide; otherwise create one table per type with the same layout.
pub struct PostgresProjectionRepository<P> {
    session: PgSession,
    table_name: String,
    statements: TableStatements,
    _projection: PhantomData<fn() -> P>,
}

impl<P> Clone for PostgresProjectionRepository<P> {
    fn clone(&self) -> Self {
        Self {
            session: self.session.clone(),
            table_name: self.table_name.clone(),
            statements: self.statements.clone(),
            _projection: PhantomData,
        }
    }
}

impl<P> PostgresProjectionRepository<P> {
    /// Create a repository over `table_name`.
    ///
    /// Pass a [`PgSession`] shared with the checkpoint store to take part in
    /// batch transactions, or a bare pool to autocommit every statement.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if `table_name` is not a plain or
    /// schema-qualified identifier.
    pub fn new(session: impl Into<PgSession>, table_name: impl Into<String>) -> Result<Self> {
        let table_name = table_name.into();
        validate_table_name(&table_name)?;
        Ok(Self {
            session: session.into(),
            statements: TableStatements::new(&table_name),
            table_name,
            _projection: PhantomData,
        })
    }

    /// Get the session statements run through.
    #[must_use]
    pub const fn session(&self) -> &PgSession {
        &self.session
    }

    /// Get the table name.
    #[must_use]
    pub fn table_name(&self) -> &str {
        &self.table_name
    }
}

impl<P> ProjectionRepository<P> for PostgresProjectionRepository<P>
where
    P: Projection + Serialize + DeserializeOwned,
    P::Key: Display,
{
    async fn find_by_key(&self, key: &P::Key) -> Result<Option<P>> {
        let key = key.to_string();
        let sql = Arc::clone(&self.statements.select);
        let bound = key.clone();

        let row: Option<(Vec<u8>,)> = self
            .session
            .run(move |conn| {
                Box::pin(async move {
                    sqlx::query_as::<_, (Vec<u8>,)>(&sql)
                        .bind(bound)
                        .fetch_optional(conn)
                        .await
                })
            })
            .await
            .map_err(|e| ProjectionError::Storage(format!("Failed to find {key}: {e}")))?;

        row.map(|(data,)| decode(&key, &data)).transpose()
    }

    async fn save(&self, projection: &P) -> Result<()> {
        let key = projection.key().to_string();
        let data = encode(&key, projection)?;
        let sql = Arc::clone(&self.statements.upsert);
        let bound = key.clone();

        self.session
            .run(move |conn| {
                Box::pin(async move {
                    sqlx::query(&sql).bind(bound).bind(data).execute(conn).await
                })
            })
            .await
            .map_err(|e| ProjectionError::Storage(format!("Failed to save {key}: {e}")))?;

        Ok(())
    }

    async fn delete(&self, key: &P::Key) -> Result<u64> {
        let key = key.to_string();
        let sql = Arc::clone(&self.statements.delete);
        let bound = key.clone();

        let result = self
            .session
            .run(move |conn| {
                Box::pin(async move { sqlx::query(&sql).bind(bound).execute(conn).await })
            })
            .await
            .map_err(|e| ProjectionError::Storage(format!("Failed to delete {key}: {e}")))?;

        Ok(result.rows_affected())
    }
}

impl<P> std::fmt::Debug for PostgresProjectionRepository<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresProjectionRepository")
            .field("table_name", &self.table_name)
            .finish_non_exhaustive()
    }
}

/// PostgreSQL-backed checkpoint store.
///
/// # Schema
///
/// ```sql
/// CREATE TABLE projection_state (
///     id TEXT PRIMARY KEY,
///     position BIGINT NOT NULL,
///     last_update_utc TIMESTAMPTZ NOT NULL
/// );
/// ```
#[derive(Clone, Debug)]
pub struct PostgresCheckpointStore {
    session: PgSession,
}

impl PostgresCheckpointStore {
    /// Create a checkpoint store over a session or a bare pool.
    #[must_use]
    pub fn new(session: impl Into<PgSession>) -> Self {
        Self {
            session: session.into(),
        }
    }

    /// Get the session statements run through.
    #[must_use]
    pub const fn session(&self) -> &PgSession {
        &self.session
    }
}

impl CheckpointStore for PostgresCheckpointStore {
    fn load_checkpoint(
        &self,
        projection_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Checkpoint>>> + Send + '_>> {
        let projection_id = projection_id.to_string();
        Box::pin(async move {
            let bound = projection_id.clone();
            let row: Option<(i64, chrono::DateTime<chrono::Utc>)> = self
                .session
                .run(move |conn| {
                    Box::pin(async move {
                        sqlx::query_as::<_, (i64, chrono::DateTime<chrono::Utc>)>(
                            "SELECT position, last_update_utc
                             FROM projection_state
                             WHERE id = $1",
                        )
                        .bind(bound)
                        .fetch_optional(conn)
                        .await
                    })
                })
                .await
                .map_err(|e| ProjectionError::Checkpoint(format!("Failed to load checkpoint: {e}")))?;

            Ok(row.map(|(position, last_updated_at)| {
                Checkpoint::new(projection_id, position, last_updated_at)
            }))
        })
    }

    fn save_checkpoint(
        &self,
        checkpoint: Checkpoint,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let row = checkpoint.clone();
            self.session
                .run(move |conn| {
                    Box::pin(async move {
                        sqlx::query(
                            "INSERT INTO projection_state (id, position, last_update_utc)
                             VALUES ($1, $2, $3)
                             ON CONFLICT (id) DO UPDATE
                             SET position = EXCLUDED.position,
                                 last_update_utc = EXCLUDED.last_update_utc",
                        )
                        .bind(row.projection_id)
                        .bind(row.position)
                        .bind(row.last_updated_at)
                        .execute(conn)
                        .await
                    })
                })
                .await
                .map_err(|e| ProjectionError::Checkpoint(format!("Failed to save checkpoint: {e}")))?;

            tracing::trace!(
                projection = %checkpoint.projection_id,
                position = checkpoint.position,
                "Checkpoint saved"
            );
            Ok(())
        })
    }
}
