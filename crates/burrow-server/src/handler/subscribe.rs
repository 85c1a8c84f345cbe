use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use burrow_firehose::{EventBus, EventFilter, FirehoseError, FirehoseSession, FrameSink};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info};

use crate::state::AppState;

/// Upgrade to a websocket carrying firehose frames as binary messages.
pub async fn subscribe_repos(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let bus = Arc::clone(state.manager.bus());
    debug!("firehose upgrade requested");
    ws.on_upgrade(move |socket| stream_events(socket, bus))
}

struct WsSink(SplitSink<WebSocket, Message>);

#[async_trait]
impl FrameSink for WsSink {
    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<(), FirehoseError> {
        self.0
            .send(Message::Binary(frame))
            .await
            .map_err(|e| FirehoseError::Sink(e.to_string()))
    }
}

/// Resolves once the client closes the socket or the read side fails.
async fn client_gone(mut receiver: SplitStream<WebSocket>) {
    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Close(_)) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

async fn stream_events(socket: WebSocket, bus: Arc<EventBus>) {
    let (sender, receiver) = socket.split();
    let mut sink = WsSink(sender);
    let mut session = FirehoseSession::new(bus, EventFilter::default());
    let reason = session.run(&mut sink, client_gone(receiver)).await;
    let _ = sink.0.close().await;
    info!(%reason, frames = session.frames_sent(), "firehose connection finished");
}
