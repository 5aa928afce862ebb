//! ProxyEngine: the request-forwarding state machine.
//!
//! Wraps a per-credential retry loop (deterministic exponential backoff)
//! inside a cross-credential rotation loop, classifying upstream responses
//! into retry / rotate / fail-fast / success.
//!
//! Grounded on the reference implementation's `ProxyService`
//! (`_send_request_with_single_key`, `forward_request`, `_parse_model_name`)
//! for the domain state machine. The backoff is deliberately the reference
//! implementation's deterministic `2**attempt` seconds, not a jittered one.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Method, StatusCode};
use regex::Regex;
use reqwest::Client;

use crate::config_registry::ConfigRegistry;
use crate::credential::CredentialPool;
use crate::error::ApiError;
use crate::proxy::url_builder::build_upstream_url;

const MAX_ROTATIONS: usize = 10;

static MODEL_NAME_RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();

fn model_name_re() -> &'static Regex {
    MODEL_NAME_RE.get_or_init(|| Regex::new(r"(?:models|tunedModels)/([^:/]+)").unwrap())
}

/// Headers that must never be forwarded to, or echoed back from, upstream.
const EXCLUDED_REQUEST_HEADERS: &[&str] = &["host", "authorization", "x-goog-api-key", "content-length", "cookie", "set-cookie"];
const EXCLUDED_RESPONSE_HEADERS: &[&str] = &["content-encoding", "transfer-encoding", "content-length"];

pub struct ProxyRequest {
    pub method: Method,
    pub path: String,
    pub query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub enum ProxyResponse {
    Buffered {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },
    Streaming {
        status: StatusCode,
        headers: HeaderMap,
        body: Body,
    },
}

pub struct ProxyEngine {
    client: Client,
    credentials: Arc<CredentialPool>,
    config: Arc<ConfigRegistry>,
}

impl ProxyEngine {
    pub fn new(client: Client, credentials: Arc<CredentialPool>, config: Arc<ConfigRegistry>) -> Self {
        Self { client, credentials, config }
    }

    pub fn parse_model_name(path: &str) -> Option<String> {
        model_name_re().captures(path).map(|c| c[1].to_string())
    }

    pub async fn forward(&self, request: ProxyRequest) -> Result<ProxyResponse, ApiError> {
        let model_name = Self::parse_model_name(&request.path);
        let base_url = self.config.base_url().await;
        let url = build_upstream_url(&base_url, &request.path);
        let is_streaming = is_streaming_request(&request.query);
        let max_retries = self.config.max_retry_count().await;

        let headers = sanitize_request_headers(&request.headers);

        for _rotation in 0..MAX_ROTATIONS {
            let secret = self.credentials.get().await?;

            match self
                .attempt_with_credential(
                    &secret,
                    &request.method,
                    &url,
                    &request.query,
                    &headers,
                    &request.body,
                    model_name.as_deref(),
                    is_streaming,
                    max_retries,
                )
                .await
            {
                Attempt::Success(response) => return Ok(response),
                Attempt::NotFound => return Err(ApiError::NotFound),
                Attempt::TransportExhausted(err) => return Err(err),
                Attempt::RotateCredential(_err) => continue,
            }
        }

        // Every rotation either rotated past a failing credential or was
        // pulled from an already-exhausted pool; either way no credential
        // produced a response within MAX_ROTATIONS attempts.
        Err(ApiError::AllCredentialsExhausted)
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt_with_credential(
        &self,
        secret: &str,
        method: &Method,
        url: &str,
        query: &str,
        headers: &HeaderMap,
        body: &Bytes,
        model_name: Option<&str>,
        is_streaming: bool,
        max_retries: u32,
    ) -> Attempt {
        let mut last_transport_err: Option<String> = None;
        let mut last_http_failure: Option<(String, String)> = None;

        let full_url = if query.is_empty() {
            url.to_string()
        } else {
            format!("{url}?{query}")
        };

        for attempt in 0..max_retries {
            let mut req = self
                .client
                .request(method.clone(), &full_url)
                .headers(headers.clone())
                .header("x-goog-api-key", secret)
                .body(body.clone());
            req = req.timeout(Duration::from_secs(300));

            let sent = req.send().await;

            let response = match sent {
                Ok(resp) => resp,
                Err(err) => {
                    last_transport_err = Some(err.to_string());
                    tokio::time::sleep(backoff(attempt)).await;
                    continue;
                }
            };

            let status = response.status();

            if status.as_u16() < 400 {
                let success = if is_streaming {
                    self.credentials.record_success(secret, model_name).await.ok();
                    ProxyResponse::Streaming {
                        status,
                        headers: sanitize_response_headers(response.headers()),
                        body: Body::from_stream(response.bytes_stream()),
                    }
                } else {
                    let headers = sanitize_response_headers(response.headers());
                    let body = response.bytes().await.unwrap_or_default();
                    self.credentials.record_success(secret, model_name).await.ok();
                    ProxyResponse::Buffered { status, headers, body }
                };
                return Attempt::Success(success);
            }

            if status == StatusCode::NOT_FOUND {
                return Attempt::NotFound;
            }

            if matches!(status.as_u16(), 400 | 403 | 429) {
                let body_text = response.text().await.unwrap_or_default();
                self.credentials
                    .record_failure(secret, model_name, Some(status.as_str()), Some(&body_text))
                    .await
                    .ok();
                return Attempt::RotateCredential(ApiError::ServiceUnavailable(format!(
                    "upstream returned {status}"
                )));
            }

            // Other >=400: retry with backoff on the same credential.
            let body_text = response.text().await.unwrap_or_default();
            self.credentials
                .log_request_failure(secret, model_name, status.as_str(), &body_text)
                .await
                .ok();
            last_http_failure = Some((status.as_str().to_string(), body_text));
            tokio::time::sleep(backoff(attempt)).await;
        }

        if let Some(transport_err) = last_transport_err {
            return Attempt::TransportExhausted(ApiError::ServiceUnavailable(transport_err));
        }

        if let Some((code, message)) = last_http_failure {
            self.credentials
                .record_failure(secret, model_name, Some(&code), Some(&message))
                .await
                .ok();
            return Attempt::RotateCredential(ApiError::ServiceUnavailable(format!(
                "upstream returned {code} after exhausting retries"
            )));
        }

        Attempt::RotateCredential(ApiError::ServiceUnavailable(
            "exhausted retries against this credential".to_string(),
        ))
    }
}

enum Attempt {
    Success(ProxyResponse),
    NotFound,
    /// Exhausted the per-credential retry loop on a transport fault; abort
    /// the whole request, do not rotate.
    TransportExhausted(ApiError),
    /// Exhausted the per-credential retry loop on an HTTP fault, or hit an
    /// immediately-rotating status; move to the next credential.
    RotateCredential(ApiError),
}

/// Deterministic exponential backoff: 2^attempt seconds, unjittered.
fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt))
}

/// True iff the query string has an `alt` parameter whose value is exactly
/// `sse`, matching the reference implementation's `params.get("alt") == "sse"`.
fn is_streaming_request(query: &str) -> bool {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .any(|(k, v)| k == "alt" && v == "sse")
}

fn sanitize_request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers.iter() {
        if EXCLUDED_REQUEST_HEADERS.contains(&name.as_str().to_ascii_lowercase().as_str()) {
            continue;
        }
        out.insert(name.clone(), value.clone());
    }
    out
}

fn sanitize_response_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers.iter() {
        if EXCLUDED_RESPONSE_HEADERS.contains(&name.as_str().to_ascii_lowercase().as_str()) {
            continue;
        }
        out.insert(name.clone(), value.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use crate::config_registry::ConfigRegistry;
    use crate::store::Store;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn parses_models_path() {
        assert_eq!(
            ProxyEngine::parse_model_name("models/gemini-2.5-flash:generateContent"),
            Some("gemini-2.5-flash".to_string())
        );
    }

    #[test]
    fn parses_tuned_models_path() {
        assert_eq!(
            ProxyEngine::parse_model_name("tunedModels/my-tuned-model:generateContent"),
            Some("my-tuned-model".to_string())
        );
    }

    #[test]
    fn returns_none_when_absent() {
        assert_eq!(ProxyEngine::parse_model_name("health"), None);
    }

    #[test]
    fn backoff_is_deterministic_exponential() {
        assert_eq!(backoff(0), Duration::from_secs(1));
        assert_eq!(backoff(1), Duration::from_secs(2));
        assert_eq!(backoff(2), Duration::from_secs(4));
    }

    #[test]
    fn request_header_sanitation_drops_excluded_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer x"));
        headers.insert("x-custom", HeaderValue::from_static("keep-me"));
        let sanitized = sanitize_request_headers(&headers);
        assert!(sanitized.get("authorization").is_none());
        assert!(sanitized.get("x-custom").is_some());
    }

    #[test]
    fn is_streaming_request_matches_alt_sse_exactly() {
        assert!(is_streaming_request("alt=sse"));
        assert!(is_streaming_request("foo=bar&alt=sse"));
        assert!(!is_streaming_request("alt=sse2"));
        assert!(!is_streaming_request("malt=sse"));
        assert!(!is_streaming_request(""));
    }

    async fn engine_against(mock_server: &MockServer, credential_count: usize) -> ProxyEngine {
        let store = Arc::new(Store::connect("sqlite::memory:").await.unwrap());
        let config = Arc::new(ConfigRegistry::new(store.clone(), None));
        config.set("GEMINI_API_BASE_URL", &mock_server.uri()).await.unwrap();
        config.set("MAX_RETRY_COUNT", "1").await.unwrap();

        let credentials = Arc::new(CredentialPool::new(store, config.clone()));
        for i in 0..credential_count {
            credentials.add(&format!("sk-test-{i}")).await.unwrap();
        }

        ProxyEngine::new(reqwest::Client::new(), credentials, config)
    }

    fn sample_request() -> ProxyRequest {
        ProxyRequest {
            method: Method::POST,
            path: "models/gemini-2.5-flash:generateContent".to_string(),
            query: String::new(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    #[tokio::test]
    async fn forward_exhausts_all_credentials_with_403_and_returns_all_credentials_exhausted() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&mock_server)
            .await;

        let engine = engine_against(&mock_server, MAX_ROTATIONS).await;

        let result = engine.forward(sample_request()).await;
        assert!(matches!(result, Err(ApiError::AllCredentialsExhausted)));
    }

    #[tokio::test]
    async fn forward_succeeds_on_first_credential_when_upstream_returns_200() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"ok\":true}"))
            .mount(&mock_server)
            .await;

        let engine = engine_against(&mock_server, 1).await;

        let response = engine.forward(sample_request()).await.unwrap();
        match response {
            ProxyResponse::Buffered { status, body, .. } => {
                assert_eq!(status, StatusCode::OK);
                assert_eq!(&body[..], b"{\"ok\":true}");
            }
            ProxyResponse::Streaming { .. } => panic!("expected a buffered response"),
        }
    }
}
