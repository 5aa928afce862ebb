//! AuthGate: validates inbound access keys and admin session tokens.
//!
//! Grounded on the reference implementation's `SecurityService`
//! (`verify_access_key`, `verify_admin_key_from_cookie`), using
//! `subtle::ConstantTimeEq` for constant-time comparison.

use std::sync::Arc;

use axum::http::HeaderMap;
use chrono::{Duration as ChronoDuration, Utc};
use rand::RngCore;
use subtle::ConstantTimeEq;

use crate::config_registry::ConfigRegistry;
use crate::error::ApiError;
use crate::store::Store;

pub const SESSION_DURATION_HOURS: i64 = 2;

pub struct AuthGate {
    store: Arc<Store>,
    config: Arc<ConfigRegistry>,
}

impl AuthGate {
    pub fn new(store: Arc<Store>, config: Arc<ConfigRegistry>) -> Self {
        Self { store, config }
    }

    /// Extract a client-presented key: `Authorization: Bearer <key>`, else
    /// the `key` query parameter, else `x-goog-api-key`.
    pub fn extract_client_key(headers: &HeaderMap, query: &str) -> Option<String> {
        if let Some(value) = headers.get(axum::http::header::AUTHORIZATION) {
            if let Ok(s) = value.to_str() {
                if let Some(token) = s.strip_prefix("Bearer ") {
                    return Some(token.to_string());
                }
            }
        }

        if let Some(key) = query_param(query, "key") {
            return Some(key);
        }

        headers
            .get("x-goog-api-key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    pub async fn verify_access_key(&self, headers: &HeaderMap, query: &str) -> Result<(), ApiError> {
        let presented = Self::extract_client_key(headers, query).ok_or(ApiError::Authentication)?;
        let configured = self.config.access_keys().await;

        if configured.is_empty() {
            return Err(ApiError::Authentication);
        }

        if configured.iter().any(|k| constant_time_eq(k, &presented)) {
            Ok(())
        } else {
            Err(ApiError::Authentication)
        }
    }

    pub async fn verify_admin_key(&self, presented: &str) -> Result<(), ApiError> {
        let configured = self.config.admin_key().await.ok_or(ApiError::Authentication)?;
        if constant_time_eq(&configured, presented) {
            Ok(())
        } else {
            Err(ApiError::Authentication)
        }
    }

    /// Create a 256-bit random session token and persist it with a 2 hour
    /// expiry.
    pub async fn create_admin_session(&self) -> anyhow::Result<String> {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = hex::encode(bytes);

        let expires_at = Utc::now() + ChronoDuration::hours(SESSION_DURATION_HOURS);
        let (_guard, mut tx) = self.store.begin_write().await?;
        sqlx::query("INSERT INTO admin_sessions (token, expires_at) VALUES (?, ?)")
            .bind(&token)
            .bind(expires_at)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(token)
    }

    pub async fn delete_admin_session(&self, token: &str) -> anyhow::Result<()> {
        let (_guard, mut tx) = self.store.begin_write().await?;
        sqlx::query("DELETE FROM admin_sessions WHERE token = ?")
            .bind(token)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn verify_admin_session(&self, token: &str) -> Result<(), ApiError> {
        let row: Option<(chrono::DateTime<Utc>,)> =
            sqlx::query_as("SELECT expires_at FROM admin_sessions WHERE token = ?")
                .bind(token)
                .fetch_optional(self.store.pool())
                .await
                .map_err(|e| ApiError::Internal(e.to_string()))?;

        let Some((expires_at,)) = row else {
            return Err(ApiError::Authentication);
        };

        if expires_at < Utc::now() {
            self.delete_admin_session(token).await.ok();
            return Err(ApiError::Authentication);
        }

        Ok(())
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        if k == name {
            urlencoding::decode(v).ok().map(|s| s.into_owned())
        } else {
            None
        }
    })
}
