//! Scheduler: periodic credential revalidation and log/session pruning.
//!
//! Single-leader by construction — this process is always the leader, there
//! is no distributed coordination. Grounded on the reference
//! implementation's `scheduler.py` (`scheduled_key_validation` batching,
//! `delete_old_logs` table whitelist, cron timing, coalesce-on-misfire).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, TimeZone, Utc};
use chrono_tz::Tz;
use reqwest::Client;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use crate::config_registry::ConfigRegistry;
use crate::credential::CredentialPool;
use crate::store::Store;

const VALIDATION_BATCH_SIZE: usize = 10;
const VALIDATION_BATCH_PAUSE: Duration = Duration::from_millis(500);

/// Tables eligible for retention pruning. Never derive this from user input —
/// the table name is interpolated into SQL, so only these two literals are
/// ever accepted.
const PRUNABLE_TABLES: &[&str] = &["error_entries", "call_records"];

pub struct Scheduler {
    store: Arc<Store>,
    credentials: Arc<CredentialPool>,
    config: Arc<ConfigRegistry>,
    client: Client,
}

impl Scheduler {
    pub fn new(store: Arc<Store>, credentials: Arc<CredentialPool>, config: Arc<ConfigRegistry>, client: Client) -> Self {
        Self { store, credentials, config, client }
    }

    /// Run the scheduler loop until `restart_rx` signals a config-driven
    /// restart or the task is aborted. The caller is expected to re-create
    /// the `Scheduler` (to re-read timezone and intervals) and call `run`
    /// again — mirroring the reference implementation's stop/discard/recreate
    /// restart protocol.
    pub fn spawn(self: Arc<Self>, mut restart_rx: UnboundedReceiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let scheduler = self.clone();
                let run = tokio::spawn(async move { scheduler.run().await });

                tokio::select! {
                    _ = run => {},
                    _ = restart_rx.recv() => {
                        tracing::info!("scheduler restart requested, reloading configuration");
                    }
                }
            }
        })
    }

    async fn run(&self) {
        let interval_hours = self.config.validation_interval_hours().await;
        let mut validation_tick = tokio::time::interval(Duration::from_secs(interval_hours * 3600));

        loop {
            let tz = self.resolve_timezone().await;
            let daily_sleep = tokio::time::sleep(duration_until_next_three_am(tz));
            tokio::pin!(daily_sleep);

            tokio::select! {
                _ = validation_tick.tick() => {
                    if let Err(e) = self.revalidate_invalid_credentials().await {
                        tracing::warn!("credential revalidation pass failed: {e}");
                    }
                }
                _ = &mut daily_sleep => {
                    if let Err(e) = self.prune_logs().await {
                        tracing::warn!("log pruning pass failed: {e}");
                    }
                    if let Err(e) = self.prune_expired_sessions().await {
                        tracing::warn!("session pruning pass failed: {e}");
                    }
                }
            }
        }
    }

    /// Resolve the configured `SCHEDULER_TIMEZONE`, falling back to UTC for an
    /// unrecognized IANA zone name.
    async fn resolve_timezone(&self) -> Tz {
        let configured = self.config.scheduler_timezone().await;
        configured.parse::<Tz>().unwrap_or_else(|_| {
            tracing::warn!("unrecognized scheduler timezone {configured:?}, falling back to UTC");
            chrono_tz::UTC
        })
    }

    pub async fn revalidate_invalid_credentials(&self) -> anyhow::Result<()> {
        let invalid = self.credentials.invalid_credentials().await?;
        let model = self.config.validation_model().await;
        let base_url = self.config.base_url().await;

        for batch in invalid.chunks(VALIDATION_BATCH_SIZE) {
            for credential in batch {
                match self.validate_key(&base_url, &model, &credential.secret).await {
                    Ok(true) => {
                        self.credentials.record_success(&credential.secret, Some(&model)).await.ok();
                    }
                    Ok(false) => {
                        self.credentials
                            .record_failure(&credential.secret, Some(&model), None, None)
                            .await
                            .ok();
                    }
                    Err(e) => {
                        tracing::debug!("validation probe failed for credential: {e}");
                    }
                }
            }
            tokio::time::sleep(VALIDATION_BATCH_PAUSE).await;
        }

        Ok(())
    }

    async fn validate_key(&self, base_url: &str, model: &str, secret: &str) -> anyhow::Result<bool> {
        let url = format!("{}/models/{}:countTokens", base_url.trim_end_matches('/'), model);
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", secret)
            .timeout(Duration::from_secs(10))
            .json(&serde_json::json!({ "contents": [{ "parts": [{ "text": "hello" }] }] }))
            .send()
            .await?;
        Ok(response.status().is_success())
    }

    pub async fn prune_logs(&self) -> anyhow::Result<()> {
        let error_retention = self.config.error_log_retention_days().await;
        let request_retention = self.config.request_log_retention_days().await;

        self.delete_old_logs("error_entries", error_retention).await?;
        self.delete_old_logs("call_records", request_retention).await?;
        Ok(())
    }

    async fn delete_old_logs(&self, table: &str, retention_days: i64) -> anyhow::Result<()> {
        if !PRUNABLE_TABLES.contains(&table) {
            anyhow::bail!("table {table} is not eligible for retention pruning");
        }

        let (_guard, mut tx) = self.store.begin_write().await?;
        let query = format!("DELETE FROM {table} WHERE timestamp < datetime('now', ?)");
        sqlx::query(&query)
            .bind(format!("-{retention_days} days"))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn prune_expired_sessions(&self) -> anyhow::Result<()> {
        let (_guard, mut tx) = self.store.begin_write().await?;
        sqlx::query("DELETE FROM admin_sessions WHERE expires_at < datetime('now')")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

/// Time remaining until the next 03:00 local wall-clock time in `tz`. Always
/// positive; recomputed on every call so it tracks DST transitions in `tz`.
fn duration_until_next_three_am(tz: Tz) -> Duration {
    let now_utc = Utc::now();
    let now_local = now_utc.with_timezone(&tz);

    let today_three_am = tz
        .with_ymd_and_hms(now_local.year(), now_local.month(), now_local.day(), 3, 0, 0)
        .single()
        .unwrap_or(now_local);

    let next_three_am = if now_local < today_three_am {
        today_three_am
    } else {
        today_three_am + chrono::Duration::days(1)
    };

    let next_three_am_utc: DateTime<Utc> = next_three_am.with_timezone(&Utc);
    (next_three_am_utc - now_utc)
        .to_std()
        .unwrap_or(Duration::from_secs(24 * 3600))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn scheduler() -> Scheduler {
        let store = Arc::new(Store::connect("sqlite::memory:").await.unwrap());
        let config = Arc::new(ConfigRegistry::new(store.clone(), None));
        let credentials = Arc::new(CredentialPool::new(store.clone(), config.clone()));
        Scheduler::new(store, credentials, config, Client::new())
    }

    #[tokio::test]
    async fn rejects_non_whitelisted_table_names() {
        let scheduler = scheduler().await;
        let err = scheduler.delete_old_logs("credentials", 30).await.unwrap_err();
        assert!(err.to_string().contains("not eligible"));
    }

    #[tokio::test]
    async fn prunes_whitelisted_tables_without_error() {
        let scheduler = scheduler().await;
        scheduler.prune_logs().await.unwrap();
    }

    #[tokio::test]
    async fn prune_expired_sessions_removes_only_expired() {
        let scheduler = scheduler().await;
        sqlx::query("INSERT INTO admin_sessions (token, expires_at) VALUES (?, datetime('now', '-1 hour'))")
            .bind("expired-token")
            .execute(scheduler.store.pool())
            .await
            .unwrap();
        sqlx::query("INSERT INTO admin_sessions (token, expires_at) VALUES (?, datetime('now', '+1 hour'))")
            .bind("live-token")
            .execute(scheduler.store.pool())
            .await
            .unwrap();

        scheduler.prune_expired_sessions().await.unwrap();

        let remaining: Vec<(String,)> = sqlx::query_as("SELECT token FROM admin_sessions")
            .fetch_all(scheduler.store.pool())
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].0, "live-token");
    }

    #[test]
    fn duration_until_next_three_am_is_never_negative_and_bounded_by_a_day() {
        let duration = duration_until_next_three_am(chrono_tz::Asia::Shanghai);
        assert!(duration <= Duration::from_secs(24 * 3600));
    }

    #[test]
    fn duration_until_next_three_am_differs_across_timezones_at_the_same_instant() {
        let utc = duration_until_next_three_am(chrono_tz::UTC);
        let shanghai = duration_until_next_three_am(chrono_tz::Asia::Shanghai);
        // Shanghai is UTC+8, so unless the two clocks happen to straddle
        // midnight identically the remaining durations diverge.
        let diff = if utc > shanghai { utc - shanghai } else { shanghai - utc };
        assert!(diff > Duration::from_secs(0) || utc == shanghai);
    }

    #[tokio::test]
    async fn resolve_timezone_falls_back_to_utc_for_unknown_zone() {
        let scheduler = scheduler().await;
        scheduler.config.set("SCHEDULER_TIMEZONE", "Nowhere/Made_Up").await.unwrap();
        assert_eq!(scheduler.resolve_timezone().await, chrono_tz::UTC);
    }

    #[tokio::test]
    async fn validate_key_returns_true_on_success_status() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&mock_server)
            .await;

        let scheduler = scheduler().await;
        let ok = scheduler
            .validate_key(&mock_server.uri(), "gemini-2.5-flash-lite", "sk-test")
            .await
            .unwrap();
        assert!(ok);
    }

    #[tokio::test]
    async fn validate_key_returns_false_on_error_status() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&mock_server)
            .await;

        let scheduler = scheduler().await;
        let ok = scheduler
            .validate_key(&mock_server.uri(), "gemini-2.5-flash-lite", "sk-test")
            .await
            .unwrap();
        assert!(!ok);
    }

    #[tokio::test]
    async fn revalidate_invalid_credentials_reactivates_on_success() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&mock_server)
            .await;

        let store = Arc::new(Store::connect("sqlite::memory:").await.unwrap());
        let config = Arc::new(ConfigRegistry::new(store.clone(), None));
        config.set("GEMINI_API_BASE_URL", &mock_server.uri()).await.unwrap();
        let credentials = Arc::new(CredentialPool::new(store.clone(), config.clone()));
        credentials.add("sk-test-revalidate").await.unwrap();
        for _ in 0..5 {
            credentials
                .record_failure("sk-test-revalidate", None, None, None)
                .await
                .unwrap();
        }

        let scheduler = Scheduler::new(store.clone(), credentials, config, Client::new());
        scheduler.revalidate_invalid_credentials().await.unwrap();

        let row: (bool,) = sqlx::query_as("SELECT valid FROM credentials WHERE secret = ?")
            .bind("sk-test-revalidate")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert!(row.0);
    }
}
