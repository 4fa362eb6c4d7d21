use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashMap, convert::Infallible, sync::Arc};
use tracing::{info, warn};

const OPERATOR_KEY_HEADER: &str = "X-Operator-Key";

#[derive(Clone)]
pub struct AuthState {
    records: Arc<HashMap<String, OperatorRecord>>,
}

/// Identity attached to authenticated requests.
#[derive(Clone, Debug)]
pub struct OperatorContext {
    pub operator: String,
    pub key_id: String,
}

#[derive(Clone)]
struct OperatorRecord {
    operator: String,
    key_id: String,
}

impl AuthState {
    /// Parses `name:key` pairs separated by commas.
    pub fn from_key_list(raw: &str) -> Self {
        Self {
            records: Arc::new(parse_keys(raw)),
        }
    }

    fn authenticate(&self, presented: &str) -> Option<OperatorContext> {
        self.records.get(presented).map(|record| OperatorContext {
            operator: record.operator.clone(),
            key_id: record.key_id.clone(),
        })
    }
}

pub async fn require_operator(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(presented) = extract_api_key(request.headers()) else {
        return Ok(unauthorized_response(
            "missing_api_key",
            "Provide X-Operator-Key or Bearer token",
        ));
    };

    let Some(context) = state.authenticate(&presented) else {
        warn!(target = "reupload.api", path = %request.uri().path(), "rejected operator key");
        return Ok(unauthorized_response("invalid_api_key", "Key not recognized"));
    };

    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}

fn extract_api_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string());
    }
    headers
        .get(OPERATOR_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn unauthorized_response(code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (StatusCode::UNAUTHORIZED, Json(payload)).into_response()
}

fn parse_keys(raw: &str) -> HashMap<String, OperatorRecord> {
    let mut entries = HashMap::new();
    for (idx, token) in raw.split(',').enumerate() {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut parts = trimmed.splitn(2, ':');
        let operator = parts.next().map(str::trim).filter(|s| !s.is_empty());
        let key = parts.next().map(str::trim).filter(|s| !s.is_empty());
        match (operator, key) {
            (Some(name), Some(secret)) => {
                let record = OperatorRecord {
                    operator: name.to_string(),
                    key_id: format!("key-{:02}", idx + 1),
                };
                entries.insert(secret.to_string(), record);
            }
            _ => warn!(
                target = "reupload.api",
                "ignored malformed OPERATOR_API_KEYS entry"
            ),
        }
    }

    if entries.is_empty() {
        warn!(
            target = "reupload.api",
            "OPERATOR_API_KEYS produced no keys; every protected route will reject"
        );
    } else {
        info!(
            target = "reupload.api",
            key_count = entries.len(),
            "loaded operator keys"
        );
    }

    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Extension, Router, middleware, routing::get};
    use tower::ServiceExt;

    async fn whoami(Extension(ctx): Extension<OperatorContext>) -> String {
        format!("{}/{}", ctx.operator, ctx.key_id)
    }

    fn app() -> Router {
        let auth = AuthState::from_key_list("alice:secret-a, bob:secret-b, broken");
        Router::new()
            .route("/whoami", get(whoami))
            .route_layer(middleware::from_fn_with_state(auth, require_operator))
    }

    async fn call(request: Request<Body>) -> (StatusCode, String) {
        let response = app().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn bearer_and_header_keys_are_accepted() {
        let (status, body) = call(
            Request::get("/whoami")
                .header("Authorization", "Bearer secret-b")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "bob/key-02");

        let (status, body) = call(
            Request::get("/whoami")
                .header(OPERATOR_KEY_HEADER, "secret-a")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "alice/key-01");
    }

    #[tokio::test]
    async fn missing_or_unknown_keys_are_rejected() {
        let (status, body) = call(Request::get("/whoami").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body.contains("missing_api_key"));

        let (status, body) = call(
            Request::get("/whoami")
                .header(OPERATOR_KEY_HEADER, "nope")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body.contains("invalid_api_key"));
    }

    #[test]
    fn malformed_entries_are_skipped() {
        let state = AuthState::from_key_list("ops:k1,,:k2,solo");
        assert!(state.authenticate("k1").is_some());
        assert!(state.authenticate("k2").is_none());
        assert_eq!(state.records.len(), 1);
    }
}
