//! HTTP surface: health probe plus one WebSocket endpoint per turn.
//!
//! The client opens a socket, sends one turn request as a JSON text frame,
//! and receives every pipeline event as its own text frame until `done`.
//! Closing the socket mid-turn cancels the turn cooperatively.

use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::State,
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use tower_http::cors::CorsLayer;

use crate::events::{self, StreamEvent};
use crate::pipeline::{SessionPipeline, TurnRequest};

pub fn build_router(pipeline: Arc<SessionPipeline>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(pipeline)
}

pub async fn start_server(pipeline: Arc<SessionPipeline>, host: &str, port: u16) -> Result<()> {
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, build_router(pipeline)).await?;
    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

// ── WebSocket handler ───────────────────────────────────────────────────────

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(pipeline): State<Arc<SessionPipeline>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, pipeline))
}

async fn handle_socket(socket: WebSocket, pipeline: Arc<SessionPipeline>) {
    let (mut sender, mut receiver) = socket.split();

    // The first text frame carries the turn request.
    let request = loop {
        match receiver.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<TurnRequest>(&text) {
                Ok(request) => break request,
                Err(error) => {
                    let event = StreamEvent::Error {
                        message: format!("invalid turn request: {error}"),
                    };
                    if let Ok(json) = serde_json::to_string(&event) {
                        let _ = sender.send(Message::Text(json.into())).await;
                    }
                    let _ = sender.send(Message::Close(None)).await;
                    return;
                }
            },
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(_)) => continue,
            Some(Err(_)) => return,
        }
    };

    let (sink, mut rx) = events::channel();
    let turn = pipeline.run_turn(request, sink);

    // Forward until the turn's channel closes or the client goes away.
    // Returning drops `rx`, which cancels the still-running turn.
    let forward = async move {
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => {
                        let Ok(json) = serde_json::to_string(&event) else {
                            continue;
                        };
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                frame = receiver.next() => match frame {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                },
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    };

    tokio::join!(turn, forward);
}
