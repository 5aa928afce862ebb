//! ConfigRegistry: key/value view over the store for runtime-tunable
//! settings, with bulk-update semantics and a debounced notification to the
//! Scheduler whenever a scheduler-affecting key changes.
//!
//! Grounded on the reference implementation's `ConfigManager`
//! (`_schedule_debounced_restart`, `_bulk_depth` reentrant counter).

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::AbortHandle;

const DEBOUNCE: std::time::Duration = std::time::Duration::from_millis(500);

const SCHEDULER_KEYS: &[&str] = &[
    "VALIDATION_MODEL",
    "KEY_VALIDATION_INTERVAL_HOURS",
    "SCHEDULER_TIMEZONE",
    "ERROR_LOG_RETENTION_DAYS",
    "REQUEST_LOG_RETENTION_DAYS",
];

pub struct ConfigRegistry {
    store: Arc<crate::store::Store>,
    restart_tx: Option<UnboundedSender<()>>,
    pending_restart: Mutex<Option<AbortHandle>>,
    bulk_depth: Mutex<u32>,
}

impl ConfigRegistry {
    pub fn new(store: Arc<crate::store::Store>, restart_tx: Option<UnboundedSender<()>>) -> Self {
        Self {
            store,
            restart_tx,
            pending_restart: Mutex::new(None),
            bulk_depth: Mutex::new(0),
        }
    }

    pub async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM config_settings WHERE key = ?")
            .bind(key)
            .fetch_optional(self.store.pool())
            .await?;
        Ok(row.map(|(v,)| v))
    }

    pub async fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let (_guard, mut tx) = self.store.begin_write().await?;
        sqlx::query(
            "INSERT INTO config_settings (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        if SCHEDULER_KEYS.contains(&key) {
            self.maybe_schedule_restart();
        }
        Ok(())
    }

    /// Enter a reentrant bulk-update section: scheduler-affecting writes made
    /// while depth > 0 do not trigger a debounced restart.
    pub fn begin_bulk(&self) {
        *self.bulk_depth.lock() += 1;
    }

    /// Leave a bulk-update section. Fires exactly one restart, only at the
    /// outermost close, if `restart` is true.
    pub fn end_bulk(&self, restart: bool) {
        let mut depth = self.bulk_depth.lock();
        if *depth > 0 {
            *depth -= 1;
        }
        if *depth == 0 && restart {
            drop(depth);
            self.maybe_schedule_restart();
        }
    }

    fn in_bulk(&self) -> bool {
        *self.bulk_depth.lock() > 0
    }

    fn maybe_schedule_restart(&self) {
        if self.in_bulk() {
            return;
        }
        let Some(tx) = self.restart_tx.clone() else {
            return;
        };

        let mut pending = self.pending_restart.lock();
        if let Some(handle) = pending.take() {
            handle.abort();
        }

        let task = tokio::spawn(async move {
            tokio::time::sleep(DEBOUNCE).await;
            let _ = tx.send(());
        });
        *pending = Some(task.abort_handle());
    }

    pub async fn max_failure_count(&self) -> i64 {
        self.get("MAX_FAILURE_COUNT")
            .await
            .ok()
            .flatten()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5)
    }

    pub async fn max_retry_count(&self) -> u32 {
        self.get("MAX_RETRY_COUNT")
            .await
            .ok()
            .flatten()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3)
    }

    pub async fn base_url(&self) -> String {
        self.get("GEMINI_API_BASE_URL")
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string())
    }

    pub async fn access_keys(&self) -> Vec<String> {
        self.get("ACCESS_KEY")
            .await
            .ok()
            .flatten()
            .map(|v| v.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub async fn admin_key(&self) -> Option<String> {
        self.get("ADMIN_KEY").await.ok().flatten()
    }

    pub async fn validation_model(&self) -> String {
        self.get("VALIDATION_MODEL")
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| "gemini-2.5-flash-lite".to_string())
    }

    pub async fn validation_interval_hours(&self) -> u64 {
        self.get("KEY_VALIDATION_INTERVAL_HOURS")
            .await
            .ok()
            .flatten()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1)
            .max(1)
    }

    pub async fn scheduler_timezone(&self) -> String {
        self.get("SCHEDULER_TIMEZONE")
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| "Asia/Shanghai".to_string())
    }

    pub async fn error_log_retention_days(&self) -> i64 {
        self.get("ERROR_LOG_RETENTION_DAYS")
            .await
            .ok()
            .flatten()
            .and_then(|v| v.parse().ok())
            .unwrap_or(15)
    }

    pub async fn request_log_retention_days(&self) -> i64 {
        self.get("REQUEST_LOG_RETENTION_DAYS")
            .await
            .ok()
            .flatten()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30)
    }
}
