//! # Database Connection Pool
//!
//! SQLite pool creation for the engine's persisted state.
//!
//! ## Features
//!
//! - **WAL Mode** for file databases
//! - **Foreign Keys** enforced (file trackers cascade with their object tracker)
//! - **Automatic Migrations** embedded at compile time
//! - **Health Check** after connecting
//!
//! In-memory databases live inside a single connection, so their pool is
//! capped at one connection that is never recycled.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use core_sync::db::{create_pool, DatabaseConfig};
//!
//! let pool = create_pool(DatabaseConfig::new("/data/sync.db")).await?;
//! ```

use crate::{Result, SyncError};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Database configuration for the SQLite connection pool
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// `sqlite:` URL of the database
    pub database_url: String,
    pub min_connections: u32,
    pub max_connections: u32,
    /// Maximum time to wait for a connection from the pool
    pub acquire_timeout: Duration,
    pub max_lifetime: Option<Duration>,
    pub idle_timeout: Option<Duration>,
}

impl DatabaseConfig {
    /// Configuration for a database file at `database_path`.
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        let path = database_path.into();

        Self {
            database_url: format!("sqlite:{}", path.display()),
            min_connections: 1,
            max_connections: 4,
            acquire_timeout: Duration::from_secs(30),
            max_lifetime: Some(Duration::from_secs(1800)),
            idle_timeout: Some(Duration::from_secs(600)),
        }
    }

    /// Configuration for an in-memory database (state is lost on drop).
    pub fn in_memory() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            min_connections: 1,
            max_connections: 1,
            acquire_timeout: Duration::from_secs(30),
            max_lifetime: None,
            idle_timeout: None,
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.database_url.contains(":memory:")
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self::in_memory()
    }
}

/// Create a configured SQLite connection pool, run migrations and verify the
/// connection.
///
/// # Errors
///
/// Returns an error if the database cannot be opened, a migration fails or the
/// health check query fails.
pub async fn create_pool(config: DatabaseConfig) -> Result<SqlitePool> {
    info!(
        database_url = %config.database_url,
        max_connections = config.max_connections,
        "Creating database connection pool"
    );

    let mut connect_options = SqliteConnectOptions::from_str(&config.database_url)?
        .foreign_keys(true)
        .create_if_missing(true)
        .synchronous(SqliteSynchronous::Normal);

    if !config.is_in_memory() {
        connect_options = connect_options.journal_mode(SqliteJournalMode::Wal);
    }

    let max_connections = if config.is_in_memory() {
        1
    } else {
        config.max_connections
    };

    let pool = SqlitePoolOptions::new()
        .min_connections(config.min_connections.min(max_connections))
        .max_connections(max_connections)
        .acquire_timeout(config.acquire_timeout)
        .max_lifetime(config.max_lifetime)
        .idle_timeout(config.idle_timeout)
        .connect_with(connect_options)
        .await
        .map_err(|e| {
            warn!(error = %e, "Failed to create connection pool");
            SyncError::Database(e)
        })?;

    run_migrations(&pool).await?;
    health_check(&pool).await?;

    Ok(pool)
}

/// In-memory pool with the schema applied.
pub async fn create_test_pool() -> Result<SqlitePool> {
    create_pool(DatabaseConfig::in_memory()).await
}

async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    debug!("Running database migrations");

    sqlx::migrate!("./migrations").run(pool).await.map_err(|e| {
        warn!(error = %e, "Migration failed");
        SyncError::Migration(e.to_string())
    })?;

    Ok(())
}

async fn health_check(pool: &SqlitePool) -> Result<()> {
    sqlx::query("SELECT 1").fetch_one(pool).await.map_err(|e| {
        warn!(error = %e, "Database health check failed");
        SyncError::Database(e)
    })?;

    debug!("Database health check passed");
    Ok(())
}
