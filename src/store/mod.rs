//! SQLite-backed persistence: pool setup, migrations, and the error type
//! shared by the stores built on top.

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

pub mod commerce;
pub mod orders;
pub mod tracking;

pub use commerce::CommerceStore;
pub use orders::OrderSyncStore;
pub use tracking::TrackingStore;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Storage-boundary failures. Callers must not assume a write succeeded.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database query failed: {0}")]
    Query(#[from] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("stored column could not be encoded or decoded: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("untrack needs a source id or a local id")]
    MissingUntrackKey,
}

/// Opens the database named by `DATABASE_URL` (default `sqlite://caravel.db`,
/// created if missing) and applies pending migrations.
///
/// # Errors
///
/// Returns [`StoreError::Query`] when the URL is malformed or the pool cannot
/// connect, and [`StoreError::Migrate`] when a migration fails.
pub async fn connect_from_env() -> Result<SqlitePool, StoreError> {
    let url = std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://caravel.db".to_string());
    connect(&url).await
}

pub async fn connect(database_url: &str) -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5));
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    MIGRATOR.run(&pool).await?;
    info!(target = "caravel.store", url = database_url, "database ready");
    Ok(pool)
}

/// Fresh in-memory database for tests. A single connection keeps the pool
/// pinned to the one in-memory instance.
#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory pool");
    MIGRATOR.run(&pool).await.expect("migrations");
    pool
}
