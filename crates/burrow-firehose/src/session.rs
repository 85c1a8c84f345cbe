use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::bus::{EventBus, EventFilter, Subscription};
use crate::error::{FirehoseError, Result};
use crate::frame::encode_frame;

/// Transport that carries frames to one subscriber, e.g. a websocket.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<()>;
}

/// Why a session ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The client went away.
    ClientDisconnected,
    /// Writing a frame to the transport failed.
    WriteFailed(String),
    /// An event could not be framed.
    EncodeFailed(String),
    /// The bus closed the subscriber's channel.
    BusClosed,
    /// The bus disconnected the subscriber for falling behind.
    Lagged,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ClientDisconnected => write!(f, "client disconnected"),
            Self::WriteFailed(e) => write!(f, "write failed: {e}"),
            Self::EncodeFailed(e) => write!(f, "encode failed: {e}"),
            Self::BusClosed => write!(f, "event bus closed"),
            Self::Lagged => write!(f, "subscriber fell behind"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Streaming,
    Closed(CloseReason),
}

/// One subscriber connection: `Connected -> Streaming -> Closed`.
///
/// Entering `Streaming` registers the filter with the bus; only events
/// published from then on are delivered. Error events are sent in-band and
/// do not end the session.
pub struct FirehoseSession {
    bus: Arc<EventBus>,
    filter: EventFilter,
    state: SessionState,
    subscription: Option<Subscription>,
    frames_sent: u64,
}

impl FirehoseSession {
    pub fn new(bus: Arc<EventBus>, filter: EventFilter) -> Self {
        Self {
            bus,
            filter,
            state: SessionState::Connected,
            subscription: None,
            frames_sent: 0,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    /// Subscribe to the bus and enter `Streaming`.
    pub fn start(&mut self) -> Result<()> {
        if self.state != SessionState::Connected {
            return Err(FirehoseError::InvalidState(format!("cannot start from {:?}", self.state)));
        }
        let subscription = self.bus.subscribe(self.filter.clone());
        info!(subscriber = subscription.id(), "firehose session streaming");
        self.subscription = Some(subscription);
        self.state = SessionState::Streaming;
        Ok(())
    }

    /// Deliver events to `sink` until the session closes.
    ///
    /// Starts the session if it is still `Connected`. `disconnected`
    /// resolves when the client goes away.
    pub async fn run<S, F>(&mut self, sink: &mut S, disconnected: F) -> CloseReason
    where
        S: FrameSink + ?Sized,
        F: Future<Output = ()> + Send,
    {
        if let SessionState::Closed(reason) = &self.state {
            return reason.clone();
        }
        if self.state == SessionState::Connected {
            if let Err(e) = self.start() {
                return self.close(CloseReason::EncodeFailed(e.to_string()));
            }
        }
        let Some(mut subscription) = self.subscription.take() else {
            return self.close(CloseReason::BusClosed);
        };

        let subscriber = subscription.id();
        tokio::pin!(disconnected);
        let reason = loop {
            tokio::select! {
                _ = &mut disconnected => break CloseReason::ClientDisconnected,
                next = subscription.recv() => {
                    let Some(event) = next else {
                        break if subscription.is_lagged() {
                            CloseReason::Lagged
                        } else {
                            CloseReason::BusClosed
                        };
                    };
                    let frame = match encode_frame(&event) {
                        Ok(frame) => frame,
                        Err(e) => break CloseReason::EncodeFailed(e.to_string()),
                    };
                    if let Err(e) = sink.send_frame(frame).await {
                        break CloseReason::WriteFailed(e.to_string());
                    }
                    self.frames_sent += 1;
                    debug!(subscriber, seq = event.seq, kind = %event.kind(), "frame sent");
                }
            }
        };

        self.bus.unsubscribe(subscriber);
        self.close(reason)
    }

    fn close(&mut self, reason: CloseReason) -> CloseReason {
        info!(frames = self.frames_sent, %reason, "firehose session closed");
        self.state = SessionState::Closed(reason.clone());
        reason
    }
}
