//! The seam between the pipeline and whatever delivers ticks.
//!
//! A transport adapter accepts fire-and-forget subscribe/unsubscribe calls
//! and reports [`TransportEvent`]s back. The WebSocket implementation lives
//! in [`crate::websocket`]; tests plug in recording fakes.

use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::models::tick::TickMessage;
use crate::models::{InstrumentKey, SubscriptionMode};

/// Connection lifecycle as seen by the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

/// Outbound half of the push connection.
///
/// Both calls are fire-and-forget and idempotent per instrument. A returned
/// [`TransportError::Rejected`] only covers the instruments it names.
pub trait TransportAdapter: Send {
    fn subscribe(
        &mut self,
        instruments: &[InstrumentKey],
        mode: SubscriptionMode,
    ) -> Result<(), TransportError>;

    fn unsubscribe(
        &mut self,
        instruments: &[InstrumentKey],
        mode: SubscriptionMode,
    ) -> Result<(), TransportError>;
}

/// Inbound events produced by a transport adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A normalized tick.
    Tick(TickMessage),
    /// The connection moved to a new lifecycle state.
    ConnectionState(ConnectionState),
    /// The server refused some instruments after a subscribe request.
    SubscribeRejected {
        instruments: Vec<InstrumentKey>,
        reason: String,
    },
    /// A tick payload was dropped at the boundary.
    MalformedTick(String),
}
