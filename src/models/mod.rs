//! Shared models for the tick pipeline.
//!
//! Contains the instrument identity type, subscription modes, and the
//! request/control messages exchanged with the push connection. Tick,
//! quote and bar payloads live in their own submodules.

pub mod bar;
pub mod quote;
pub mod tick;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::FeedError;

/// Identity of a tradable instrument: exchange token plus exchange segment.
///
/// Equality is structural. The text form is `SEGMENT:TOKEN`, e.g. `NSE_EQ:2885`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentKey {
    pub token: String,
    pub exchange_segment: String,
}

impl InstrumentKey {
    /// Creates a key from a token and an exchange segment.
    pub fn new(token: impl Into<String>, exchange_segment: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            exchange_segment: exchange_segment.into(),
        }
    }
}

impl fmt::Display for InstrumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.exchange_segment, self.token)
    }
}

impl FromStr for InstrumentKey {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (segment, token) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| FeedError::InvalidInstrument(format!("expected SEGMENT:TOKEN, got {s:?}")))?;

        let (segment, token) = (segment.trim(), token.trim());
        if segment.is_empty() || token.is_empty() {
            return Err(FeedError::InvalidInstrument(format!(
                "empty segment or token in {s:?}"
            )));
        }

        Ok(Self::new(token, segment))
    }
}

/// Depth of data requested per instrument from the push connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionMode {
    /// Last traded price only.
    Ltp,
    /// Price, change, session OHLC and volume.
    #[default]
    Quote,
    /// Everything in `Quote` plus open interest.
    Full,
}

impl SubscriptionMode {
    /// Returns the wire-format mode name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionMode::Ltp => "ltp",
            SubscriptionMode::Quote => "quote",
            SubscriptionMode::Full => "full",
        }
    }
}

impl FromStr for SubscriptionMode {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ltp" => Ok(SubscriptionMode::Ltp),
            "quote" => Ok(SubscriptionMode::Quote),
            "full" => Ok(SubscriptionMode::Full),
            other => Err(FeedError::Config(format!(
                "unknown subscription mode {other:?} (expected ltp, quote or full)"
            ))),
        }
    }
}

/// A `subscribe` request sent over the push connection.
#[derive(Debug, Serialize)]
pub struct SubscribeRequest {
    pub method: String,
    pub params: Params,
}

impl SubscribeRequest {
    pub fn new(instruments: &[InstrumentKey], mode: SubscriptionMode) -> Self {
        Self {
            method: "subscribe".to_string(),
            params: Params::new(instruments, mode),
        }
    }
}

/// An `unsubscribe` request sent over the push connection.
#[derive(Debug, Serialize)]
pub struct UnsubscribeRequest {
    pub method: String,
    pub params: Params,
}

impl UnsubscribeRequest {
    pub fn new(instruments: &[InstrumentKey], mode: SubscriptionMode) -> Self {
        Self {
            method: "unsubscribe".to_string(),
            params: Params::new(instruments, mode),
        }
    }
}

/// Mode and instrument list used in subscribe/unsubscribe requests.
#[derive(Debug, Serialize)]
pub struct Params {
    pub mode: SubscriptionMode,
    pub instruments: Vec<InstrumentKey>,
}

impl Params {
    fn new(instruments: &[InstrumentKey], mode: SubscriptionMode) -> Self {
        Self {
            mode,
            instruments: instruments.to_vec(),
        }
    }
}

/// A `ping` request used to test connection liveness.
#[derive(Debug, Serialize)]
pub struct PingRequest {
    pub method: String,
}

impl PingRequest {
    pub fn new() -> Self {
        Self {
            method: "ping".to_string(),
        }
    }
}

impl Default for PingRequest {
    fn default() -> Self {
        Self::new()
    }
}

/// Server acknowledgement of a subscribe or unsubscribe request.
///
/// A refusal names the instruments it covers; the rest of the request
/// went through.
#[derive(Debug, Deserialize)]
pub struct SubscriptionResponse {
    pub method: String,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub instruments: Vec<InstrumentKey>,
    #[serde(default)]
    pub error: Option<String>,
}

impl SubscriptionResponse {
    /// Returns `true` if the server refused at least part of the request.
    pub fn is_rejection(&self) -> bool {
        self.success == Some(false) || self.error.is_some()
    }
}
