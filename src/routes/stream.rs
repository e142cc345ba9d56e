use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

use crate::services::fanout::StreamEvent;
use crate::state::AppState;

#[utoipa::path(
    get,
    path = "/api/stream",
    tag = "stream",
    responses((status = 101, description = "Switching to websocket"))
)]
pub(crate) async fn stream_handler(
    ws: WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_stream(socket, state))
}

#[derive(Debug)]
enum StreamTick {
    Deliver(StreamEvent),
    Skip(u64),
    Shutdown,
}

/// Next thing the session loop should do with the fanout side. Resolves to
/// `Shutdown` when the process-wide token fires, so an idle-but-connected
/// client never keeps graceful shutdown waiting.
async fn next_tick(
    rx: &mut broadcast::Receiver<StreamEvent>,
    cancel: &CancellationToken,
) -> StreamTick {
    tokio::select! {
        _ = cancel.cancelled() => StreamTick::Shutdown,
        event = rx.recv() => match event {
            Ok(event) => StreamTick::Deliver(event),
            Err(RecvError::Lagged(skipped)) => StreamTick::Skip(skipped),
            Err(RecvError::Closed) => StreamTick::Shutdown,
        },
    }
}

async fn serve_stream(mut socket: WebSocket, state: AppState) {
    let cancel = state.shutdown.clone();
    // Subscribe before snapshotting so events arriving in between are not
    // lost; the client may see a reading twice but never a gap.
    let mut rx = state.fanout.subscribe();
    let snapshot = StreamEvent::InitialSnapshot(state.store.snapshot());
    if send_event(&mut socket, &snapshot).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            tick = next_tick(&mut rx, &cancel) => {
                match tick {
                    StreamTick::Deliver(event) => {
                        if send_event(&mut socket, &event).await.is_err() {
                            break;
                        }
                    }
                    StreamTick::Skip(skipped) => {
                        tracing::debug!(skipped, "stream subscriber lagged; frames skipped");
                    }
                    StreamTick::Shutdown => {
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

async fn send_event(socket: &mut WebSocket, event: &StreamEvent) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(err) => {
            tracing::error!(error = %err, "failed to serialize stream event");
            return Ok(());
        }
    };
    socket.send(Message::Text(text.into())).await
}

pub fn router() -> Router<AppState> {
    Router::new().route("/stream", get(stream_handler))
}
