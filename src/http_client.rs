//! HTTP client builder module
//!
//! Builds the single shared client used for all upstream calls: rustls TLS,
//! a generous timeout to accommodate streaming, and connection pool limits
//! (§5 of the design: 300s timeout, 120 max connections, 20 keepalive).

use reqwest::Client;
use std::time::Duration;

pub fn build_client() -> anyhow::Result<Client> {
    Ok(Client::builder()
        .use_rustls_tls()
        .timeout(Duration::from_secs(300))
        .pool_max_idle_per_host(20)
        .build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_a_client() {
        assert!(build_client().is_ok());
    }
}
