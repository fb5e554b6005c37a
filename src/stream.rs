//! The snapshot stream server.
//!
//! Subscribers connect to `GET /stream` on the stream port and receive JSON
//! text frames, one [`SnapshotOp`] per frame: first the current collection
//! as `insert`s, then live operations. Delivery is at-least-once — the
//! subscription is opened before the resync, so an operation racing the
//! replay can arrive twice; subscribers dedupe by `sessionId`.

use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
    routing::get,
    Router,
};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::broadcast::SnapshotOp;
use crate::registry::Registry;

/// Builds the stream-port router.
pub fn create_stream_router(registry: Registry) -> Router {
    Router::new()
        .route("/stream", get(get_stream))
        .layer(TraceLayer::new_for_http())
        .with_state(registry)
}

/// GET /stream - upgrade to the snapshot WebSocket.
async fn get_stream(State(registry): State<Registry>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_stream(socket, registry))
}

/// Serves one subscriber: initial `insert` replay, then live operations
/// until either side closes.
async fn handle_stream(socket: axum::extract::ws::WebSocket, registry: Registry) {
    use axum::extract::ws::Message;
    use futures_util::StreamExt;

    let (mut sender, mut receiver) = socket.split();

    // Subscribe before the resync so no operation falls in the gap.
    let mut rx = registry.publisher().subscribe();
    let initial = registry.publisher().resync();

    info!(
        initial_sessions = initial.len(),
        "snapshot subscriber connected"
    );

    let forward = tokio::spawn(async move {
        for snapshot in initial {
            let op = SnapshotOp::Insert { snapshot };
            if !send_op(&mut sender, &op).await {
                return;
            }
        }
        loop {
            match rx.recv().await {
                Ok(op) => {
                    if !send_op(&mut sender, &op).await {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "snapshot subscriber lagged, operations skipped");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Close(_)) => {
                debug!("subscriber sent close frame");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                debug!(error = %err, "websocket error");
                break;
            }
        }
    }

    forward.abort();
    info!("snapshot subscriber disconnected");
}

/// Serializes and sends one operation; false means the socket is gone.
async fn send_op<S>(sender: &mut S, op: &SnapshotOp) -> bool
where
    S: futures_util::Sink<axum::extract::ws::Message> + Unpin,
{
    use futures_util::SinkExt;

    let json = match serde_json::to_string(op) {
        Ok(json) => json,
        Err(err) => {
            warn!(error = %err, "failed to serialize snapshot operation");
            return true;
        }
    };
    sender
        .send(axum::extract::ws::Message::Text(json.into()))
        .await
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tempfile::TempDir;
    use tower::ServiceExt;

    #[tokio::test]
    async fn plain_get_without_upgrade_is_rejected() {
        let dir = TempDir::new().unwrap();
        let config = Config::for_dirs(dir.path().join("tree"), dir.path().join("data"));
        let app = create_stream_router(Registry::new(config));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/stream")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        // No upgrade headers: axum answers with a client error, not a panic.
        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let dir = TempDir::new().unwrap();
        let config = Config::for_dirs(dir.path().join("tree"), dir.path().join("data"));
        let app = create_stream_router(Registry::new(config));
        let response = app
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
