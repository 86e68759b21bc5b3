use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use common::{CommandFailure, CommandRequest, CommandResponse, ErrorKind};
use serde_json::json;
use tracing::warn;

use crate::config_store::ConfigStore;
use crate::dispatcher::Dispatcher;
use crate::error::status_of;

/// Shared state of the command channel.
#[derive(Clone)]
pub struct Channel {
    dispatcher: Arc<Dispatcher>,
    store: Arc<ConfigStore>,
}

pub fn router(dispatcher: Arc<Dispatcher>, store: Arc<ConfigStore>) -> Router {
    Router::new()
        .route("/v1/commands", post(handle_command))
        .route("/v1/healthz", get(healthz))
        .with_state(Channel { dispatcher, store })
}

async fn healthz() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// Byte comparison whose running time depends only on the lengths.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |diff, (x, y)| diff | (x ^ y)) == 0
}

fn token_matches(expected: Option<&str>, presented: Option<&str>) -> bool {
    match (expected, presented) {
        (Some(expected), Some(presented)) => {
            constant_time_eq(expected.as_bytes(), presented.as_bytes())
        }
        _ => false,
    }
}

async fn handle_command(
    State(channel): State<Channel>,
    headers: HeaderMap,
    Json(request): Json<CommandRequest>,
) -> Response {
    let token = channel.store.current().await.map(|config| config.token);
    let presented = bearer(&headers);
    if !token_matches(token.as_deref(), presented) {
        warn!(caller = request.caller, "rejected request with a bad bearer token");
        let failure = CommandFailure {
            kind: ErrorKind::Unauthorized,
            detail: "missing or invalid bearer token".to_string(),
            violations: Vec::new(),
        };
        return (
            StatusCode::UNAUTHORIZED,
            Json(CommandResponse::Error(failure)),
        )
            .into_response();
    }

    let response = channel.dispatcher.handle(request).await;
    let status = match &response {
        CommandResponse::Ok(_) => StatusCode::OK,
        CommandResponse::Error(failure) => status_of(failure.kind),
    };
    (status, Json(response)).into_response()
}

#[cfg(test)]
mod test {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_bearer_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer(&headers), None);
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer(&headers), None);
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer s3cret"));
        assert_eq!(bearer(&headers), Some("s3cret"));
    }

    #[test]
    fn test_token_matches() {
        assert!(token_matches(Some("s3cret"), Some("s3cret")));
        assert!(!token_matches(Some("s3cret"), Some("s3creT")));
        assert!(!token_matches(Some("s3cret"), Some("s3cre")));
        assert!(!token_matches(Some("s3cret"), None));
        assert!(!token_matches(None, Some("s3cret")));
        assert!(!token_matches(None, None));
        assert!(constant_time_eq(b"", b""));
    }
}
