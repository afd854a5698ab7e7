//! SQLite persistence and the retrying HTTP fetcher for the Manfred job fetcher.
//!
//! [`Store`] owns a single pool; the repository operations live in per-concern modules
//! (`offers`, `ledger`, `tokens`, `fetch_log`) as `impl Store` blocks.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::info;

mod fetch_log;
pub mod http;
mod ledger;
mod offers;
mod tokens;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse, HttpClientConfig,
    HttpFetcher, RetryDisposition,
};
pub use ledger::NotificationOutcome;

pub const CRATE_NAME: &str = "mjf-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("offer {0} not found")]
    OfferNotFound(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Row counts reported by the health surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StoreCounts {
    pub active_offers: i64,
    pub pending_details: i64,
    pub delivered_notifications: i64,
}

#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if needed) the database file at `path` and apply migrations.
    ///
    /// With `reset` the file is removed first.
    pub async fn connect(path: impl AsRef<Path>, reset: bool) -> Result<Self, StorageError> {
        let path = path.as_ref();

        if reset {
            for suffix in ["", "-wal", "-shm"] {
                let file = format!("{}{suffix}", path.display());
                match tokio::fs::remove_file(&file).await {
                    Ok(()) => info!(file = %file, "removed database file"),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(source) => return Err(StorageError::Io { path: file, source }),
                }
            }
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StorageError::Io {
                    path: parent.display().to_string(),
                    source,
                })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    /// Ephemeral database for tests and dry runs.
    ///
    /// Every `sqlite::memory:` connection is its own database, so the pool is pinned to one
    /// connection that is never recycled.
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self, StorageError> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn counts(&self) -> Result<StoreCounts, StorageError> {
        let (active_offers, pending_details, delivered_notifications): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                (SELECT COUNT(*) FROM offers WHERE is_active = 1),
                (SELECT COUNT(*) FROM offers WHERE is_active = 1 AND detail_fetched = 0),
                (SELECT COUNT(*) FROM notifications WHERE status = 'delivered')
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(StoreCounts {
            active_offers,
            pending_details,
            delivered_notifications,
        })
    }
}

pub(crate) fn parse_label<T>(raw: &str) -> Result<T, StorageError>
where
    T: FromStr<Err = mjf_core::UnknownVariant>,
{
    raw.parse::<T>().map_err(|err| StorageError::Corrupt(err.to_string()))
}
