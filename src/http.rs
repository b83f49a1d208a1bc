use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use hmac::{Hmac, Mac};
#[allow(unused_imports)]
use log::{debug, warn};
use serde::Deserialize;
use sha2::Sha256;
use tower_http::trace::TraceLayer;

use crate::docservice::DocumentService;
use crate::errors::ServeError;
use crate::gate::{gate_middleware, ReadinessGate};
use crate::scheduler::UpdateScheduler;
use crate::status::StatusObserver;

type HmacSha256 = Hmac<Sha256>;

// Present in remote mode only - local mode has no update pipeline to
// schedule against or observe, and serves its ORD routes ungated.
pub struct RemoteState {
    pub scheduler: Arc<UpdateScheduler>,
    pub status: Arc<StatusObserver>,
    pub webhook_secret: Option<String>,
}

#[derive(Clone)]
pub struct AppState {
    pub docservice: Arc<DocumentService>,
    pub remote: Option<Arc<RemoteState>>,
}

pub fn build_router(state: AppState, readiness_timeout: Duration) -> Router {
    let ord_routes = Router::new()
        .route("/.well-known/open-resource-discovery", get(get_ord_configuration))
        .route("/ord/v1/documents/*path", get(get_processed_document))
        .route("/ord/v1/*path", get(get_file_content));

    let ord_routes = match &state.remote {
        Some(remote) => {
            let gate = ReadinessGate::new(remote.scheduler.state_manager(), readiness_timeout);
            ord_routes.route_layer(axum::middleware::from_fn_with_state(gate, gate_middleware))
        }
        None => ord_routes,
    };

    Router::new()
        .merge(ord_routes)
        .route("/api/v1/webhook/github", post(webhook_github))
        .route("/status", get(get_status))
        .route("/api/v1/ws", get(ws_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Deserialize)]
struct PerspectiveQuery {
    perspective: Option<String>,
}

async fn get_ord_configuration(
    State(state): State<AppState>,
    Query(query): Query<PerspectiveQuery>,
) -> Result<Response, ServeError> {
    let config = state
        .docservice
        .get_ord_configuration(query.perspective.as_deref())
        .await?;
    Ok(Json(config).into_response())
}

async fn get_processed_document(
    State(state): State<AppState>,
    AxumPath(path): AxumPath<String>,
) -> Result<Response, ServeError> {
    let doc = state.docservice.get_processed_document(&path).await?;
    Ok(Json((*doc).clone()).into_response())
}

async fn get_file_content(
    State(state): State<AppState>,
    AxumPath(path): AxumPath<String>,
) -> Result<Response, ServeError> {
    let content = state.docservice.get_file_content(&path).await?;
    Ok(content.into_response())
}

#[derive(serde::Serialize)]
struct WebhookAccepted {
    scheduled: bool,
    #[serde(rename = "scheduledAt", skip_serializing_if = "Option::is_none")]
    scheduled_at: Option<chrono::DateTime<chrono::Utc>>,
    reason: &'static str,
}

// Not gated by the readiness gate - a webhook firing while an update is
// already in flight must still be accepted (and debounced), not blocked.
async fn webhook_github(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Response, ServeError> {
    let remote = state
        .remote
        .as_ref()
        .ok_or_else(|| ServeError::NotFound("webhook endpoint is local-mode only".to_owned()))?;

    if let Some(secret) = &remote.webhook_secret {
        verify_webhook_signature(secret, &headers, &body)?;
    }

    match remote.scheduler.schedule_immediate_update() {
        Some(scheduled_at) => Ok((
            StatusCode::ACCEPTED,
            Json(WebhookAccepted {
                scheduled: true,
                scheduled_at: Some(scheduled_at),
                reason: "update scheduled",
            }),
        )
            .into_response()),
        None => Ok((
            StatusCode::ACCEPTED,
            Json(WebhookAccepted {
                scheduled: false,
                scheduled_at: None,
                reason: "update already pending or in flight",
            }),
        )
            .into_response()),
    }
}

fn verify_webhook_signature(secret: &str, headers: &HeaderMap, body: &[u8]) -> Result<(), ServeError> {
    let signature_header = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .ok_or(ServeError::Unauthorized)?;
    let expected_hex = signature_header
        .strip_prefix("sha256=")
        .ok_or(ServeError::Unauthorized)?;
    let expected = hex::decode(expected_hex).map_err(|_| ServeError::Unauthorized)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| ServeError::Unauthorized)?;
    mac.update(body);
    mac.verify_slice(&expected).map_err(|_| ServeError::Unauthorized)?;
    Ok(())
}

async fn get_status(State(state): State<AppState>) -> Result<Response, ServeError> {
    match &state.remote {
        Some(remote) => Ok(Json(remote.status.current()).into_response()),
        None => Ok(Json(serde_json::json!({ "mode": "local" })).into_response()),
    }
}

async fn ws_status(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let Some(remote) = state.remote.clone() else {
        return (StatusCode::NOT_FOUND, "status streaming is remote-mode only").into_response();
    };
    ws.on_upgrade(move |socket| handle_status_socket(socket, remote))
}

async fn handle_status_socket(mut socket: WebSocket, remote: Arc<RemoteState>) {
    let mut rx = remote.status.subscribe();
    if let Ok(initial) = serde_json::to_string(&*rx.borrow_and_update()) {
        if socket.send(Message::Text(initial)).await.is_err() {
            return;
        }
    }
    loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    return;
                }
                let snapshot = rx.borrow_and_update().clone();
                let Ok(text) = serde_json::to_string(&snapshot) else { continue };
                if socket.send(Message::Text(text)).await.is_err() {
                    return;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Err(_)) => return,
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_webhook_signature_without_header() {
        let headers = HeaderMap::new();
        let result = verify_webhook_signature("secret", &headers, b"body");
        assert!(matches!(result, Err(ServeError::Unauthorized)));
    }

    #[test]
    fn rejects_webhook_signature_with_wrong_mac() {
        let mut headers = HeaderMap::new();
        headers.insert("x-hub-signature-256", "sha256=deadbeef".parse().unwrap());
        let result = verify_webhook_signature("secret", &headers, b"body");
        assert!(matches!(result, Err(ServeError::Unauthorized)));
    }

    #[test]
    fn accepts_webhook_signature_with_correct_mac() {
        let mut mac = HmacSha256::new_from_slice(b"secret").unwrap();
        mac.update(b"body");
        let digest = hex::encode(mac.finalize().into_bytes());
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-hub-signature-256",
            format!("sha256={digest}").parse().unwrap(),
        );
        let result = verify_webhook_signature("secret", &headers, b"body");
        assert!(result.is_ok());
    }
}
