//! CredentialPool: credential lifecycle plus the in-memory rotation queue.
//!
//! Grounded on the reference implementation's `KeyManager` for the refill
//! query and transaction shape, with a `Mutex`-guarded in-memory pool
//! structured the way a guarded entry list typically is in this codebase.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex as AsyncMutex;

use crate::config_registry::ConfigRegistry;
use crate::credential::{mask_secret, Credential, CredentialSummary};
use crate::error::ApiError;
use crate::store::Store;

const DEFAULT_POOL_SIZE: usize = 30;

pub struct CredentialPool {
    store: Arc<Store>,
    config: Arc<ConfigRegistry>,
    pool_size: usize,
    queue: SyncMutex<VecDeque<String>>,
    refill_guard: AsyncMutex<()>,
}

impl CredentialPool {
    pub fn new(store: Arc<Store>, config: Arc<ConfigRegistry>) -> Self {
        Self {
            store,
            config,
            pool_size: DEFAULT_POOL_SIZE,
            queue: SyncMutex::new(VecDeque::new()),
            refill_guard: AsyncMutex::new(()),
        }
    }

    /// Pop the next credential, refilling from the store if the queue is empty.
    pub async fn get(&self) -> Result<String, ApiError> {
        if let Some(secret) = self.queue.lock().pop_front() {
            return Ok(secret);
        }

        let _permit = self.refill_guard.lock().await;
        if let Some(secret) = self.queue.lock().pop_front() {
            return Ok(secret);
        }

        self.refill().await?;

        self.queue
            .lock()
            .pop_front()
            .ok_or(ApiError::AllCredentialsExhausted)
    }

    async fn refill(&self) -> Result<(), ApiError> {
        let (_guard, mut tx) = self.store.begin_write().await.map_err(|e| ApiError::Internal(e.to_string()))?;

        let rows: Vec<Credential> = sqlx::query_as(
            "SELECT id, secret, valid, failure_count, last_used FROM credentials \
             WHERE valid = 1 ORDER BY last_used ASC, id ASC LIMIT ?",
        )
        .bind(self.pool_size as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

        let now = Utc::now();
        for row in &rows {
            sqlx::query("UPDATE credentials SET last_used = ? WHERE id = ?")
                .bind(now)
                .bind(row.id)
                .execute(&mut *tx)
                .await
                .map_err(|e| ApiError::Internal(e.to_string()))?;
        }

        tx.commit().await.map_err(|e| ApiError::Internal(e.to_string()))?;

        let mut queue = self.queue.lock();
        queue.clear();
        queue.extend(rows.into_iter().map(|c| c.secret));
        Ok(())
    }

    /// Drop the rotation queue; the next `get()` forces a refill. Called after
    /// any administrative mutation of the credential set.
    pub fn clear_queue(&self) {
        self.queue.lock().clear();
    }

    pub async fn record_success(&self, secret: &str, model_name: Option<&str>) -> anyhow::Result<()> {
        let (_guard, mut tx) = self.store.begin_write().await?;

        let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM credentials WHERE secret = ?")
            .bind(secret)
            .fetch_optional(&mut *tx)
            .await?;

        let Some((id,)) = row else {
            tracing::warn!("record_success for unknown credential");
            return Ok(());
        };

        sqlx::query("UPDATE credentials SET failure_count = 0, valid = 1 WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        if let Some(model) = model_name {
            sqlx::query(
                "INSERT INTO call_records (credential_id, model_name, identification_code) VALUES (?, ?, 200)",
            )
            .bind(id)
            .bind(model)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query("INSERT INTO call_records (credential_id, identification_code) VALUES (?, 200)")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        bump_monthly_counter(&mut tx).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn record_failure(
        &self,
        secret: &str,
        model_name: Option<&str>,
        code: Option<&str>,
        message: Option<&str>,
    ) -> anyhow::Result<()> {
        let max_failures = self.config.max_failure_count().await;

        let (_guard, mut tx) = self.store.begin_write().await?;

        let row: Option<(i64, i64)> =
            sqlx::query_as("SELECT id, failure_count FROM credentials WHERE secret = ?")
                .bind(secret)
                .fetch_optional(&mut *tx)
                .await?;

        let Some((id, failure_count)) = row else {
            tracing::warn!("record_failure for unknown credential");
            return Ok(());
        };

        let new_count = failure_count + 1;
        if new_count >= max_failures {
            sqlx::query("UPDATE credentials SET failure_count = ?, valid = 0 WHERE id = ?")
                .bind(new_count)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        } else {
            sqlx::query("UPDATE credentials SET failure_count = ? WHERE id = ?")
                .bind(new_count)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("INSERT INTO call_records (credential_id, model_name) VALUES (?, ?)")
            .bind(id)
            .bind(model_name)
            .execute(&mut *tx)
            .await?;

        if let (Some(code), Some(message)) = (code, message) {
            sqlx::query(
                "INSERT INTO error_entries (credential_id, model_name, identification_code, message) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(id)
            .bind(model_name)
            .bind(code)
            .bind(message)
            .execute(&mut *tx)
            .await?;
        }

        bump_monthly_counter(&mut tx).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Append a diagnostic entry without touching failure_count or validity.
    /// Used for per-attempt retry diagnostics that do not rise to the level
    /// of a credential failure.
    pub async fn log_request_failure(
        &self,
        secret: &str,
        model_name: Option<&str>,
        code: &str,
        message: &str,
    ) -> anyhow::Result<()> {
        let (_guard, mut tx) = self.store.begin_write().await?;

        let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM credentials WHERE secret = ?")
            .bind(secret)
            .fetch_optional(&mut *tx)
            .await?;

        let Some((id,)) = row else {
            return Ok(());
        };

        sqlx::query(
            "INSERT INTO error_entries (credential_id, model_name, identification_code, message) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(id)
        .bind(model_name)
        .bind(code)
        .bind(message)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Upsert a credential; reactivates it if it already exists.
    pub async fn add(&self, secret: &str) -> anyhow::Result<()> {
        let (_guard, mut tx) = self.store.begin_write().await?;
        sqlx::query(
            "INSERT INTO credentials (secret) VALUES (?) \
             ON CONFLICT(secret) DO UPDATE SET valid = 1, failure_count = 0, last_used = NULL",
        )
        .bind(secret)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        self.clear_queue();
        Ok(())
    }

    pub async fn remove(&self, id: i64) -> anyhow::Result<()> {
        let (_guard, mut tx) = self.store.begin_write().await?;
        sqlx::query("DELETE FROM credentials WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        self.clear_queue();
        Ok(())
    }

    pub async fn reactivate(&self, id: i64) -> anyhow::Result<()> {
        let (_guard, mut tx) = self.store.begin_write().await?;
        sqlx::query("UPDATE credentials SET valid = 1, failure_count = 0 WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        self.clear_queue();
        Ok(())
    }

    pub async fn list(&self) -> anyhow::Result<Vec<CredentialSummary>> {
        let rows: Vec<Credential> =
            sqlx::query_as("SELECT id, secret, valid, failure_count, last_used FROM credentials ORDER BY id ASC")
                .fetch_all(self.store.pool())
                .await?;

        Ok(rows
            .into_iter()
            .map(|c| CredentialSummary {
                id: c.id,
                masked_secret: mask_secret(&c.secret),
                valid: c.valid,
                failure_count: c.failure_count,
                last_used: c.last_used,
            })
            .collect())
    }

    pub async fn invalid_credentials(&self) -> anyhow::Result<Vec<Credential>> {
        let rows: Vec<Credential> = sqlx::query_as(
            "SELECT id, secret, valid, failure_count, last_used FROM credentials WHERE valid = 0",
        )
        .fetch_all(self.store.pool())
        .await?;
        Ok(rows)
    }

    pub fn masked(&self, secret: &str) -> String {
        mask_secret(secret)
    }
}

async fn bump_monthly_counter(tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>) -> anyhow::Result<()> {
    let year_month = Utc::now().format("%Y-%m").to_string();
    sqlx::query(
        "INSERT INTO monthly_counters (year_month, count) VALUES (?, 1) \
         ON CONFLICT(year_month) DO UPDATE SET count = count + 1",
    )
    .bind(year_month)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pool() -> (CredentialPool, Arc<Store>) {
        let store = Arc::new(Store::connect("sqlite::memory:").await.unwrap());
        let config = Arc::new(ConfigRegistry::new(store.clone(), None));
        (CredentialPool::new(store.clone(), config), store)
    }

    #[tokio::test]
    async fn get_fails_when_no_credentials_exist() {
        let (pool, _store) = pool().await;
        assert!(matches!(pool.get().await, Err(ApiError::AllCredentialsExhausted)));
    }

    #[tokio::test]
    async fn add_then_get_round_trips_secret() {
        let (pool, _store) = pool().await;
        pool.add("sk-test-credential-one").await.unwrap();
        let got = pool.get().await.unwrap();
        assert_eq!(got, "sk-test-credential-one");
    }

    #[tokio::test]
    async fn record_failure_invalidates_past_threshold() {
        let (pool, store) = pool().await;
        pool.add("sk-test-credential-two").await.unwrap();
        for _ in 0..5 {
            pool.record_failure("sk-test-credential-two", None, None, None)
                .await
                .unwrap();
        }
        let row: (bool,) = sqlx::query_as("SELECT valid FROM credentials WHERE secret = ?")
            .bind("sk-test-credential-two")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert!(!row.0);
    }

    #[tokio::test]
    async fn record_success_reactivates_credential() {
        let (pool, store) = pool().await;
        pool.add("sk-test-credential-three").await.unwrap();
        for _ in 0..5 {
            pool.record_failure("sk-test-credential-three", None, None, None)
                .await
                .unwrap();
        }
        pool.record_success("sk-test-credential-three", None).await.unwrap();
        let row: (bool, i64) = sqlx::query_as("SELECT valid, failure_count FROM credentials WHERE secret = ?")
            .bind("sk-test-credential-three")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert!(row.0);
        assert_eq!(row.1, 0);
    }

    #[tokio::test]
    async fn clear_queue_forces_refill() {
        let (pool, _store) = pool().await;
        pool.add("sk-test-credential-four").await.unwrap();
        let _ = pool.get().await.unwrap();
        pool.add("sk-test-credential-five").await.unwrap();
        pool.clear_queue();
        let got = pool.get().await.unwrap();
        assert!(got == "sk-test-credential-four" || got == "sk-test-credential-five");
    }
}
