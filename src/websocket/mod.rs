//! WebSocket implementation of the transport adapter.
//!
//! This module is organized by domain:
//! - [`subscription`] - Instrument subscribe/unsubscribe requests
//! - [`handler`] - Incoming message normalization into transport events
//! - [`connection`] - Connection lifecycle, reconnect backoff and the
//!   [`WsTransport`] handle the reconciler drives

mod connection;
mod handler;
mod subscription;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};
use tungstenite::Message;

use crate::Result;
use crate::models::PingRequest;

pub use connection::{ConnectionCommand, ConnectionManager, WsTransport};
pub use handler::route_message;
pub use subscription::{subscribe, unsubscribe};

/// Write half of a tick-stream WebSocket connection.
pub type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Read half of a tick-stream WebSocket connection.
pub type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Establishes a WebSocket connection to the given URL.
///
/// # Errors
///
/// Returns a [`FeedError`](crate::FeedError) if the connection or TLS handshake fails.
pub async fn connect(url: &str) -> Result<(WsWriter, WsReader)> {
    let (ws_stream, _) = connect_async(url).await?;
    info!("WebSocket handshake completed");

    Ok(ws_stream.split())
}

/// Sends a ping message over the WebSocket to test connection liveness.
///
/// # Errors
///
/// Returns a [`FeedError`](crate::FeedError) if sending the message fails.
pub async fn ping(write: &mut WsWriter) -> Result<()> {
    let request = PingRequest::new();
    let json = serde_json::to_string(&request)?;
    write.send(Message::Text(json.into())).await?;
    debug!("Sent ping");

    Ok(())
}
