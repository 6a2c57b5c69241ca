//! Incoming WebSocket message processing.
//!
//! Every text frame is turned into zero or more [`TransportEvent`]s here,
//! so nothing downstream ever sees a raw payload.

use serde_json::Value;
use tracing::{debug, warn};

use crate::models::SubscriptionResponse;
use crate::models::tick::parse_tick;
use crate::transport::TransportEvent;

/// Routes a parsed JSON message to transport events.
///
/// Recognised shapes:
/// - `{"method": ...}` acknowledgements, where a refused subscribe becomes
///   [`TransportEvent::SubscribeRejected`]
/// - `{"type": "heartbeat"}` keep-alives, which produce nothing
/// - `{"type": "tick", "data": {...}}` and `{"type": "ticks", "data": [...]}`
/// - a bare tick object or a bare array of tick objects
///
/// Ticks that fail to normalize become [`TransportEvent::MalformedTick`]
/// without affecting the other ticks in the same frame.
pub fn route_message(value: Value) -> Vec<TransportEvent> {
    if let Some(method) = value
        .get("method")
        .and_then(|m| m.as_str())
        .map(String::from)
    {
        return handle_rpc_response(&method, value);
    }

    match value.get("type").and_then(|t| t.as_str()) {
        Some("heartbeat") => {
            debug!("Received heartbeat");
            Vec::new()
        }
        Some("tick" | "ticks") => match value.get("data") {
            Some(data) => handle_ticks(data),
            None => vec![TransportEvent::MalformedTick(
                "tick message without data".to_string(),
            )],
        },
        Some(other) => {
            debug!(message_type = other, "Ignoring message");
            Vec::new()
        }
        None => handle_ticks(&value),
    }
}

/// Handles method-routed acknowledgements.
fn handle_rpc_response(method: &str, value: Value) -> Vec<TransportEvent> {
    match method {
        "pong" => {
            debug!("Received pong");
            Vec::new()
        }
        "subscribe" | "unsubscribe" => {
            let response: SubscriptionResponse = match serde_json::from_value(value) {
                Ok(response) => response,
                Err(e) => {
                    warn!(method, "Unreadable subscription response: {e}");
                    return Vec::new();
                }
            };
            if !response.is_rejection() {
                debug!(method = %response.method, "Subscription acknowledged");
                return Vec::new();
            }
            let reason = response
                .error
                .unwrap_or_else(|| "rejected by server".to_string());
            if response.method != "subscribe" || response.instruments.is_empty() {
                warn!(method = %response.method, %reason, "Subscription request failed");
                return Vec::new();
            }
            vec![TransportEvent::SubscribeRejected {
                instruments: response.instruments,
                reason,
            }]
        }
        other => {
            debug!(method = other, "Ignoring response");
            Vec::new()
        }
    }
}

fn handle_ticks(data: &Value) -> Vec<TransportEvent> {
    let items: Vec<&Value> = match data {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };

    items
        .into_iter()
        .map(|item| match parse_tick(item) {
            Ok(tick) => TransportEvent::Tick(tick),
            Err(e) => TransportEvent::MalformedTick(e.to_string()),
        })
        .collect()
}
