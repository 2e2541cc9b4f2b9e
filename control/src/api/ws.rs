use axum::{
    extract::{
        ws::{Message as Frame, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::Response,
};
use futures::{future, SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

use super::nodes::AppState;

/// GET /ws - Real-time channel for operator consoles
pub async fn upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| attach(socket, peer, state))
}

/// Hand the socket to the hub as a text sink and a text stream.
async fn attach(socket: WebSocket, peer: SocketAddr, state: Arc<AppState>) {
    let key = format!("{}#{}", peer, uuid::Uuid::new_v4().simple());
    let (sink, stream) = socket.split();

    let sink = sink.with(|text: String| future::ok::<_, axum::Error>(Frame::Text(text)));
    let stream = stream
        .take_while(|frame| future::ready(!matches!(frame, Ok(Frame::Close(_)))))
        .filter_map(|frame| {
            future::ready(match frame {
                Ok(Frame::Text(text)) => Some(Ok(text)),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            })
        });

    let mut handle = state
        .hub
        .connect(key, &state.registry, Box::pin(sink), Box::pin(stream));
    handle.closed().await;
    debug!(observer = %handle.key(), "WebSocket session ended");
}
