//! Detailed request/response logging middleware, with sensitive headers and
//! the `key` query parameter masked before anything is written to the log.
//!
//! Grounded on the reference implementation's `detailed_logging_middleware`.

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;

const SENSITIVE_HEADERS: &[&str] = &["authorization", "x-goog-api-key", "cookie", "set-cookie"];

pub async fn detailed_logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let masked_query = uri.query().map(mask_key_query_param);

    tracing::debug!(
        method = %method,
        path = %uri.path(),
        query = masked_query.as_deref().unwrap_or(""),
        headers = ?filtered_headers(request.headers()),
        "incoming request"
    );

    let response = next.run(request).await;

    tracing::debug!(
        method = %method,
        path = %uri.path(),
        status = response.status().as_u16(),
        "request completed"
    );

    response
}

fn filtered_headers(headers: &axum::http::HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| !SENSITIVE_HEADERS.contains(&name.as_str().to_ascii_lowercase().as_str()))
        .map(|(name, value)| (name.to_string(), value.to_str().unwrap_or("<binary>").to_string()))
        .collect()
}

fn mask_key_query_param(query: &str) -> String {
    query
        .split('&')
        .map(|pair| match pair.split_once('=') {
            Some((k, _)) if k == "key" => format!("{k}=***"),
            _ => pair.to_string(),
        })
        .collect::<Vec<_>>()
        .join("&")
}
