//! Credential data model.

pub mod pool;

pub use pool::CredentialPool;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Credential {
    pub id: i64,
    pub secret: String,
    pub valid: bool,
    pub failure_count: i64,
    pub last_used: Option<DateTime<Utc>>,
}

/// Read-only view of a credential for administrative listing. Never exposes
/// the raw secret.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CredentialSummary {
    pub id: i64,
    pub masked_secret: String,
    pub valid: bool,
    pub failure_count: i64,
    pub last_used: Option<DateTime<Utc>>,
}

/// `first4…last4`, matching the masking convention used everywhere a secret
/// would otherwise be logged or displayed.
pub fn mask_secret(secret: &str) -> String {
    if secret.len() <= 8 {
        "Not Set or Too Short".to_string()
    } else {
        format!("{}...{}", &secret[..4], &secret[secret.len() - 4..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_long_secrets() {
        assert_eq!(mask_secret("AIzaSyABCDEFGHIJKL1234"), "AIza...1234");
    }

    #[test]
    fn short_secrets_are_not_shown() {
        assert_eq!(mask_secret("short"), "Not Set or Too Short");
        assert_eq!(mask_secret(""), "Not Set or Too Short");
    }
}
