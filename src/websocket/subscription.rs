//! Instrument subscription and unsubscription requests.

use futures_util::SinkExt;
use tracing::{debug, info};
use tungstenite::Message;

use super::WsWriter;
use crate::Result;
use crate::models::{InstrumentKey, SubscribeRequest, SubscriptionMode, UnsubscribeRequest};

/// Asks the server to stream the given instruments in `mode`.
///
/// # Errors
///
/// Returns a [`FeedError`](crate::FeedError) if sending the subscription message fails.
pub async fn subscribe(
    write: &mut WsWriter,
    instruments: &[InstrumentKey],
    mode: SubscriptionMode,
) -> Result<()> {
    let request = SubscribeRequest::new(instruments, mode);
    let json = serde_json::to_string(&request)?;
    debug!("Sending subscribe request: {}", json);
    write.send(Message::Text(json.into())).await?;
    info!(
        mode = mode.as_str(),
        count = instruments.len(),
        "Subscribed to instruments"
    );

    Ok(())
}

/// Asks the server to stop streaming the given instruments.
///
/// # Errors
///
/// Returns a [`FeedError`](crate::FeedError) if sending the unsubscribe message fails.
pub async fn unsubscribe(
    write: &mut WsWriter,
    instruments: &[InstrumentKey],
    mode: SubscriptionMode,
) -> Result<()> {
    let request = UnsubscribeRequest::new(instruments, mode);
    let json = serde_json::to_string(&request)?;
    debug!("Sending unsubscribe request: {}", json);
    write.send(Message::Text(json.into())).await?;
    info!(
        mode = mode.as_str(),
        count = instruments.len(),
        "Unsubscribed from instruments"
    );

    Ok(())
}
