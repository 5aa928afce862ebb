//! HTTP handlers: the proxied `/v1beta/*` catch-all and the admin login
//! session-cookie flow.
//!
//! Grounded on the reference implementation's `/login`/`/logout` endpoints
//! (brute-force throttling delays, cookie attributes) and `forward_request`.

use std::time::Duration;

use axum::extract::{OriginalUri, Path, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::error::ApiError;
use crate::proxy::engine::{ProxyRequest, ProxyResponse};
use crate::surface::router::AppState;

pub async fn proxy_handler(
    State(state): State<AppState>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Response, ApiError> {
    let query = uri.query().unwrap_or("");
    state.auth.verify_access_key(&headers, query).await?;

    let filtered_query = strip_key_param(query);

    let request = ProxyRequest {
        method,
        path,
        query: filtered_query,
        headers,
        body,
    };

    let response = state.engine.forward(request).await?;

    Ok(match response {
        ProxyResponse::Buffered { status, headers, body } => {
            let mut builder = Response::builder().status(status);
            for (name, value) in headers.iter() {
                builder = builder.header(name, value);
            }
            builder.body(axum::body::Body::from(body)).unwrap()
        }
        ProxyResponse::Streaming { status, headers, body } => {
            let mut builder = Response::builder().status(status);
            for (name, value) in headers.iter() {
                builder = builder.header(name, value);
            }
            builder.body(body).unwrap()
        }
    })
}

fn strip_key_param(query: &str) -> String {
    query
        .split('&')
        .filter(|pair| !pair.starts_with("key="))
        .collect::<Vec<_>>()
        .join("&")
}

#[derive(Deserialize)]
pub struct LoginBody {
    admin_key: String,
}

pub async fn login_handler(
    State(state): State<AppState>,
    Json(body): Json<LoginBody>,
) -> Result<Response, ApiError> {
    tokio::time::sleep(Duration::from_millis(500)).await;

    if state.auth.verify_admin_key(&body.admin_key).await.is_err() {
        tokio::time::sleep(Duration::from_secs(1)).await;
        return Err(ApiError::Authentication);
    }

    let token = state
        .auth
        .create_admin_session()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let secure = if state.production { "; Secure" } else { "" };
    let cookie = format!(
        "admin_session_token={token}; HttpOnly; SameSite=Strict; Max-Age={}{}",
        crate::auth::SESSION_DURATION_HOURS * 3600,
        secure
    );

    Ok((
        StatusCode::OK,
        [(axum::http::header::SET_COOKIE, cookie)],
        Json(json!({ "status": "ok" })),
    )
        .into_response())
}

pub async fn logout_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(token) = extract_session_cookie(&headers) {
        state.auth.delete_admin_session(&token).await.ok();
    }

    let cookie = "admin_session_token=; HttpOnly; SameSite=Strict; Max-Age=0";
    (
        StatusCode::OK,
        [(axum::http::header::SET_COOKIE, cookie)],
        Json(json!({ "status": "ok" })),
    )
        .into_response()
}

fn extract_session_cookie(headers: &HeaderMap) -> Option<String> {
    let cookie_header = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    cookie_header.split(';').find_map(|pair| {
        let (k, v) = pair.trim().split_once('=')?;
        (k == "admin_session_token").then(|| v.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_key_param_only() {
        assert_eq!(strip_key_param("key=secret&alt=sse"), "alt=sse");
        assert_eq!(strip_key_param("alt=sse"), "alt=sse");
    }

    #[test]
    fn extracts_session_cookie_among_others() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::COOKIE,
            "other=1; admin_session_token=abc123; more=2".parse().unwrap(),
        );
        assert_eq!(extract_session_cookie(&headers), Some("abc123".to_string()));
    }
}
