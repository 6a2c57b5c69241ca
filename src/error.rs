//! Crate-level error types.
//!
//! [`FeedError`] unifies every error source (configuration, WebSocket,
//! HTTP, JSON, tick decoding) behind a single enum so callers can match on
//! the variant they care about while still using the `?` operator.
//!
//! None of these are fatal to the pipeline. Per-instrument failures are
//! recorded on the affected record or series and the rest keeps flowing.

use crate::models::InstrumentKey;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FeedError>;

/// Top-level error type returned by all public APIs.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// An environment variable was missing, empty, or out of range.
    #[error("configuration error: {0}")]
    Config(String),

    /// A WebSocket operation (connect, send, receive) failed.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A REST request failed at the HTTP layer.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// An I/O operation failed (signal handling, sockets outside WebSocket).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A tick payload was missing required fields or carried unusable values.
    #[error("malformed tick: {0}")]
    MalformedTick(String),

    /// An instrument key could not be parsed from its `SEGMENT:TOKEN` form.
    #[error("invalid instrument key: {0}")]
    InvalidInstrument(String),

    /// The REST collaborator answered, but not with usable data.
    #[error("snapshot source error: {0}")]
    Snapshot(String),
}

/// Errors reported by a transport adapter for subscribe/unsubscribe calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The transport refused these instruments; the rest of the call went through.
    #[error("transport rejected {} instrument(s): {reason}", .instruments.len())]
    Rejected {
        instruments: Vec<InstrumentKey>,
        reason: String,
    },

    /// No live connection to send on. The next reconnect replays the desired set.
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}
