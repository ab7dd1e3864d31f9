//! HTTP and WebSocket surface.
//!
//! Three fixed routes under `/api/whatsapp` (`status`, `qr`, `send`) plus a
//! `/ws` endpoint that streams relay events to connected clients. Route
//! handlers stay thin; all session logic lives behind [`SessionManager`] and
//! [`Dispatcher`].

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};

use crate::config::RelayConfig;
use crate::dispatch::{Dispatcher, SendRequest};
use crate::error::RelayError;
use crate::session::{qr, ConnectionState, SessionManager};
use crate::types::RelayEvent;

#[derive(Clone)]
pub struct AppState {
    pub session: Arc<SessionManager>,
    pub dispatcher: Arc<Dispatcher>,
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = match &self {
            RelayError::Validation(_) => StatusCode::BAD_REQUEST,
            RelayError::NotConnected => StatusCode::CONFLICT,
            RelayError::QrUnavailable | RelayError::QrExpired => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn build_router(state: AppState, frontend_origin: Option<&str>) -> Router {
    Router::new()
        .route("/api/whatsapp/status", get(status_handler))
        .route("/api/whatsapp/qr", get(qr_handler))
        .route("/api/whatsapp/send", post(send_handler))
        .route("/ws", get(ws_handler))
        .layer(cors_layer(frontend_origin))
        .with_state(state)
}

/// Bind and run the server until the task is cancelled.
pub async fn serve(config: &RelayConfig, session: Arc<SessionManager>) -> std::io::Result<()> {
    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&session)));
    let app = build_router(
        AppState {
            session,
            dispatcher,
        },
        config.frontend_origin.as_deref(),
    );

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "relay server listening");
    axum::serve(listener, app).await
}

fn cors_layer(frontend_origin: Option<&str>) -> CorsLayer {
    match frontend_origin.and_then(|origin| origin.parse::<HeaderValue>().ok()) {
        Some(origin) => CorsLayer::new()
            .allow_origin(origin)
            .allow_methods(Any)
            .allow_headers(Any),
        None => CorsLayer::permissive(),
    }
}

/// Connection snapshot. Never triggers a connection attempt.
async fn status_handler(State(state): State<AppState>) -> Response {
    Json(state.session.status()).into_response()
}

/// Pairing entry point.
///
/// Ensures an initialization is under way, then either reports the already
/// connected session or serves the current challenge as an SVG. Clients are
/// expected to poll: a challenge may not have been issued yet when the first
/// call lands.
async fn qr_handler(State(state): State<AppState>) -> Result<Response, RelayError> {
    state.session.ensure_connected().await?;

    if state.session.state() == ConnectionState::Connected {
        return Ok(Json(json!({ "status": "connected" })).into_response());
    }

    let challenge = state.session.qr_challenge()?;
    let svg = qr::render_svg(&challenge)?;
    Ok((
        [
            (header::CONTENT_TYPE, "image/svg+xml"),
            (
                header::CACHE_CONTROL,
                "no-store, no-cache, must-revalidate, proxy-revalidate",
            ),
            (header::PRAGMA, "no-cache"),
            (header::EXPIRES, "0"),
        ],
        svg,
    )
        .into_response())
}

async fn send_handler(
    State(state): State<AppState>,
    Json(request): Json<SendRequest>,
) -> Result<Response, RelayError> {
    let receipt = state.dispatcher.send(request).await?;
    Ok(Json(receipt).into_response())
}

async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let rx = state.session.subscribe();
    ws.on_upgrade(move |socket| relay_to_socket(socket, rx))
}

/// Forward relay events to one WebSocket client until it disconnects.
async fn relay_to_socket(mut socket: WebSocket, mut rx: broadcast::Receiver<RelayEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                let payload = match serde_json::to_string(&event) {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!("failed to serialize relay event: {e}");
                        continue;
                    }
                };
                if socket.send(Message::Text(payload.into())).await.is_err() {
                    break;
                }
            }
            // A slow client loses events rather than stalling the relay.
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "websocket client lagged behind event stream");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::sim::SimEngine;
    use crate::session::QR_TTL_SECONDS;
    use crate::store::Database;
    use crate::types::{AccountIdentity, EngineEvent};
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    async fn stack() -> (Router, Arc<SessionManager>) {
        let db = Database::in_memory().unwrap();
        let engine = SimEngine::manual();
        let session = SessionManager::new(Arc::new(engine), db, "default");
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&session)));
        let router = build_router(
            AppState {
                session: Arc::clone(&session),
                dispatcher,
            },
            None,
        );
        (router, session)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_status_route_reports_disconnected() {
        let (router, _session) = stack().await;

        let response = router
            .oneshot(get_request("/api/whatsapp/status"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["connected"], false);
        assert_eq!(json["hasQR"], false);
        assert_eq!(json["qrAgeSeconds"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn test_status_route_reports_qr_age() {
        let (router, session) = stack().await;
        session
            .handle_engine_event(EngineEvent::PairingChallenge("ref,abc".into()))
            .await;

        let json = body_json(
            router
                .oneshot(get_request("/api/whatsapp/status"))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(json["connected"], false);
        assert_eq!(json["hasQR"], true);
        assert_eq!(json["qrAgeSeconds"], 0);
    }

    #[tokio::test]
    async fn test_qr_route_before_challenge_is_unavailable() {
        let (router, _session) = stack().await;

        let response = router
            .oneshot(get_request("/api/whatsapp/qr"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let json = body_json(response).await;
        assert!(json["error"].as_str().unwrap().contains("no QR code"));
    }

    #[tokio::test]
    async fn test_qr_route_serves_uncacheable_svg() {
        let (router, session) = stack().await;
        session
            .handle_engine_event(EngineEvent::PairingChallenge("ref,abc".into()))
            .await;

        let response = router
            .oneshot(get_request("/api/whatsapp/qr"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            HeaderValue::from_static("image/svg+xml")
        );
        assert!(response.headers()[header::CACHE_CONTROL]
            .to_str()
            .unwrap()
            .contains("no-store"));

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(std::str::from_utf8(&bytes).unwrap().contains("<svg"));
    }

    #[tokio::test]
    async fn test_qr_route_reports_expired_challenge() {
        let (router, session) = stack().await;
        session
            .handle_engine_event(EngineEvent::PairingChallenge("ref,abc".into()))
            .await;
        session.backdate_qr(QR_TTL_SECONDS + 1);

        let response = router
            .oneshot(get_request("/api/whatsapp/qr"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let json = body_json(response).await;
        assert!(json["error"].as_str().unwrap().contains("expired"));
    }

    #[tokio::test]
    async fn test_qr_route_reports_connected_session() {
        let (router, session) = stack().await;
        session.ensure_connected().await.unwrap();
        session
            .handle_engine_event(EngineEvent::Opened(AccountIdentity::default()))
            .await;

        let response = router
            .oneshot(get_request("/api/whatsapp/qr"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "connected");
    }

    #[tokio::test]
    async fn test_send_route_rejects_missing_destination() {
        let (router, session) = stack().await;
        session.ensure_connected().await.unwrap();
        session
            .handle_engine_event(EngineEvent::Opened(AccountIdentity::default()))
            .await;

        let response = router
            .oneshot(post_json("/api/whatsapp/send", json!({"message": "hi"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(response).await["error"].is_string());
    }

    #[tokio::test]
    async fn test_send_route_conflicts_when_disconnected() {
        let (router, _session) = stack().await;

        let response = router
            .oneshot(post_json(
                "/api/whatsapp/send",
                json!({"to": "+5511999999999", "message": "hi"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_send_route_returns_receipt() {
        let (router, session) = stack().await;
        session.ensure_connected().await.unwrap();
        session
            .handle_engine_event(EngineEvent::Opened(AccountIdentity::default()))
            .await;

        let response = router
            .oneshot(post_json(
                "/api/whatsapp/send",
                json!({"to": "+5511999999999", "message": "hi", "orderingHint": 3}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert!(json["messageId"].is_string());
        assert!(json["timestamp"].is_i64());
    }
}
