//! Embedded relational store.
//!
//! Owns the SQLite pool, runs schema migrations, and exposes a write mutex so
//! that mutating transactions are never attempted concurrently against the
//! same file-backed database.

use sqlx::sqlite::{SqlitePoolOptions, SqliteConnectOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::str::FromStr;
use tokio::sync::Mutex;

/// Serializes all write transactions against the store.
pub struct WriteGuard(Mutex<()>);

impl WriteGuard {
    fn new() -> Self {
        Self(Mutex::new(()))
    }
}

pub struct Store {
    pool: SqlitePool,
    write_guard: WriteGuard,
}

impl Store {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;

        let store = Self {
            pool,
            write_guard: WriteGuard::new(),
        };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                secret TEXT UNIQUE NOT NULL,
                valid INTEGER NOT NULL DEFAULT 1,
                failure_count INTEGER NOT NULL DEFAULT 0,
                last_used TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_credentials_validation
                ON credentials (valid, last_used);

            CREATE TABLE IF NOT EXISTS call_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                credential_id INTEGER NOT NULL REFERENCES credentials(id) ON DELETE CASCADE,
                model_name TEXT,
                identification_code INTEGER,
                timestamp TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS error_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                credential_id INTEGER NOT NULL REFERENCES credentials(id) ON DELETE CASCADE,
                model_name TEXT,
                identification_code TEXT,
                message TEXT NOT NULL,
                timestamp TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS config_settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS monthly_counters (
                year_month TEXT PRIMARY KEY,
                count INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS admin_sessions (
                token TEXT PRIMARY KEY,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                expires_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_admin_sessions_expires_at
                ON admin_sessions (expires_at);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Acquire exclusive write access and begin a transaction. The guard is
    /// held for the lifetime of the returned transaction.
    pub async fn begin_write(&self) -> anyhow::Result<(tokio::sync::MutexGuard<'_, ()>, Transaction<'static, Sqlite>)> {
        let guard = self.write_guard.0.lock().await;
        let tx = self.pool.begin().await?;
        Ok((guard, tx))
    }
}
