//! Database layer for Millrace.
//!
//! SQLite via sqlx. One pool per process; repositories in `millrace_store`
//! borrow handles from here. Schema bootstrap lives in [`schema`] - all
//! CREATE TABLE statements in one place.
//!
//! # Example
//!
//! ```rust,ignore
//! use millrace_db::MillraceDb;
//!
//! let db = MillraceDb::open("millrace.db").await?;
//! db.ensure_schema().await?;
//! let pool = db.pool().clone();
//! ```

mod error;
mod schema;

pub use error::{DbError, Result};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;

/// Owning handle on the process-wide SQLite pool.
#[derive(Clone)]
pub struct MillraceDb {
    pool: SqlitePool,
}

impl MillraceDb {
    /// Open (creating if necessary) a file-backed database.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.apply_pragmas().await?;
        Ok(db)
    }

    /// Open an in-memory database (tests).
    ///
    /// A single connection keeps the in-memory database alive for the whole
    /// pool lifetime.
    pub async fn open_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(":memory:")
            .await?;
        Ok(Self { pool })
    }

    async fn apply_pragmas(&self) -> Result<()> {
        // WAL for concurrent readers alongside the writer
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA foreign_keys=ON")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_memory_and_bootstrap() {
        let db = MillraceDb::open_memory().await.unwrap();
        db.ensure_schema().await.unwrap();
        // Idempotent
        db.ensure_schema().await.unwrap();

        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'")
                .fetch_one(db.pool())
                .await
                .unwrap();
        assert!(count >= 10, "expected full schema, got {count} tables");
    }
}
