//! WebSocket connection lifecycle management.
//!
//! [`ConnectionManager`] handles connecting, reading messages, keep-alive
//! pings and automatic reconnection with exponential backoff. It reports
//! every lifecycle change as a [`TransportEvent::ConnectionState`] and
//! replays nothing itself: after each reconnect the reconciler resends the
//! desired set through [`WsTransport`].

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tungstenite::Message as WsMessage;

use super::{WsReader, WsWriter, connect, ping, subscribe, unsubscribe};
use crate::error::TransportError;
use crate::models::{InstrumentKey, SubscriptionMode};
use crate::transport::{ConnectionState, TransportAdapter, TransportEvent};

/// Initial backoff duration between reconnection attempts.
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Maximum backoff duration between reconnection attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Interval between keep-alive pings on an idle connection.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Commands sent from the reconciler side to the connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionCommand {
    Subscribe {
        instruments: Vec<InstrumentKey>,
        mode: SubscriptionMode,
    },
    Unsubscribe {
        instruments: Vec<InstrumentKey>,
        mode: SubscriptionMode,
    },
}

/// Why the reader loop exited.
enum DisconnectReason {
    /// The connection was lost or errored.
    ConnectionError,
    /// Cancelled, or the event or command channel was closed.
    Shutdown,
}

/// [`TransportAdapter`] that queues requests for a [`ConnectionManager`].
///
/// Calls never block. Refusals arrive later as
/// [`TransportEvent::SubscribeRejected`].
#[derive(Debug, Clone)]
pub struct WsTransport {
    commands: mpsc::UnboundedSender<ConnectionCommand>,
}

impl WsTransport {
    fn send(&self, command: ConnectionCommand) -> Result<(), TransportError> {
        self.commands
            .send(command)
            .map_err(|_| TransportError::Unavailable("connection manager stopped".to_string()))
    }
}

impl TransportAdapter for WsTransport {
    fn subscribe(
        &mut self,
        instruments: &[InstrumentKey],
        mode: SubscriptionMode,
    ) -> Result<(), TransportError> {
        self.send(ConnectionCommand::Subscribe {
            instruments: instruments.to_vec(),
            mode,
        })
    }

    fn unsubscribe(
        &mut self,
        instruments: &[InstrumentKey],
        mode: SubscriptionMode,
    ) -> Result<(), TransportError> {
        self.send(ConnectionCommand::Unsubscribe {
            instruments: instruments.to_vec(),
            mode,
        })
    }
}

/// Owns the WebSocket connection and keeps it alive.
pub struct ConnectionManager {
    url: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    commands: mpsc::UnboundedReceiver<ConnectionCommand>,
    cancel: CancellationToken,
}

impl ConnectionManager {
    /// Creates a manager for `url` and the transport handle that feeds it.
    ///
    /// Events are published on `events`; `cancel` stops the manager.
    #[must_use]
    pub fn new(
        url: impl Into<String>,
        events: mpsc::UnboundedSender<TransportEvent>,
        cancel: CancellationToken,
    ) -> (Self, WsTransport) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = Self {
            url: url.into(),
            events,
            commands: rx,
            cancel,
        };
        (manager, WsTransport { commands: tx })
    }

    fn emit(&self, event: TransportEvent) -> bool {
        self.events.send(event).is_ok()
    }

    /// Waits out a backoff period. Returns `false` if cancelled meanwhile.
    async fn back_off(&self, backoff: Duration) -> bool {
        info!(backoff_secs = backoff.as_secs(), "Backing off before retry");
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(backoff) => true,
        }
    }

    /// Runs the connection manager loop until cancelled.
    ///
    /// Connects to the WebSocket, reads messages, and automatically
    /// reconnects with exponential backoff on disconnection.
    pub async fn run(mut self) {
        let mut backoff = INITIAL_BACKOFF;

        loop {
            if self.cancel.is_cancelled()
                || !self.emit(TransportEvent::ConnectionState(ConnectionState::Connecting))
            {
                break;
            }

            info!(url = %self.url, "Connecting to WebSocket");
            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = connect(&self.url) => result,
            };
            let (mut write, read) = match connected {
                Ok(pair) => pair,
                Err(e) => {
                    error!("Connection failed: {e}");
                    self.emit(TransportEvent::ConnectionState(ConnectionState::Disconnected));
                    if !self.back_off(backoff).await {
                        break;
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            };

            if let Err(e) = ping(&mut write).await {
                warn!("Ping failed: {e}");
                self.emit(TransportEvent::ConnectionState(ConnectionState::Disconnected));
                if !self.back_off(backoff).await {
                    break;
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }

            // Requests queued for the previous connection are stale; the
            // reconciler replays the desired set on `Connected`.
            let mut stale = 0usize;
            while self.commands.try_recv().is_ok() {
                stale += 1;
            }
            if stale > 0 {
                debug!(stale, "Dropped requests queued before reconnect");
            }

            if !self.emit(TransportEvent::ConnectionState(ConnectionState::Connected)) {
                break;
            }
            info!("WebSocket connected");
            backoff = INITIAL_BACKOFF;

            let reason = self.read_loop(&mut write, read).await;
            self.emit(TransportEvent::ConnectionState(ConnectionState::Disconnected));

            match reason {
                DisconnectReason::ConnectionError => {
                    info!("Connection lost");
                    if !self.back_off(backoff).await {
                        break;
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                DisconnectReason::Shutdown => {
                    let _ = write.close().await;
                    break;
                }
            }
        }

        info!("Connection manager shutting down");
    }

    /// Reads messages and forwards requests until disconnection or shutdown.
    async fn read_loop(&mut self, write: &mut WsWriter, mut read: WsReader) -> DisconnectReason {
        let mut keepalive =
            tokio::time::interval_at(tokio::time::Instant::now() + PING_INTERVAL, PING_INTERVAL);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return DisconnectReason::Shutdown,

                msg = read.next() => {
                    match msg {
                        Some(Ok(WsMessage::Text(text))) => {
                            match serde_json::from_str::<serde_json::Value>(&text) {
                                Ok(value) => {
                                    for event in super::route_message(value) {
                                        if !self.emit(event) {
                                            return DisconnectReason::Shutdown;
                                        }
                                    }
                                }
                                Err(e) => warn!("Dropping unparseable message: {e}"),
                            }
                        }
                        Some(Ok(WsMessage::Close(frame))) => {
                            warn!(?frame, "Server closed the connection");
                            return DisconnectReason::ConnectionError;
                        }
                        Some(Ok(_)) => {} // Binary/Ping/Pong frames
                        Some(Err(e)) => {
                            warn!("WebSocket error: {e}");
                            return DisconnectReason::ConnectionError;
                        }
                        None => {
                            warn!("WebSocket stream ended");
                            return DisconnectReason::ConnectionError;
                        }
                    }
                }

                cmd = self.commands.recv() => {
                    let sent = match cmd {
                        Some(ConnectionCommand::Subscribe { instruments, mode }) => {
                            subscribe(write, &instruments, mode).await
                        }
                        Some(ConnectionCommand::Unsubscribe { instruments, mode }) => {
                            unsubscribe(write, &instruments, mode).await
                        }
                        None => return DisconnectReason::Shutdown,
                    };
                    if let Err(e) = sent {
                        warn!("Failed to send request: {e}");
                        return DisconnectReason::ConnectionError;
                    }
                }

                _ = keepalive.tick() => {
                    if let Err(e) = ping(write).await {
                        warn!("Keep-alive ping failed: {e}");
                        return DisconnectReason::ConnectionError;
                    }
                }
            }
        }
    }
}
