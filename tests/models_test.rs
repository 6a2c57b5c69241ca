//! Decoding tests for wire payloads: push ticks and REST responses.

use rust_decimal_macros::dec;
use serde_json::Value;

use tickflow::models::InstrumentKey;
use tickflow::models::bar::Resolution;
use tickflow::models::quote::{QuoteRecord, SnapshotState, StaticMetadata};
use tickflow::rest::{parse_history_response, parse_quote_response};
use tickflow::transport::TransportEvent;
use tickflow::websocket::route_message;

const TICK_QUOTE_JSON: &str = include_str!("fixtures/tick_quote.json");
const TICK_FULL_JSON: &str = include_str!("fixtures/tick_full.json");
const QUOTE_SNAPSHOT_JSON: &str = include_str!("fixtures/quote_snapshot.json");
const HISTORY_JSON: &str = include_str!("fixtures/history.json");
const API_ERROR_JSON: &str = include_str!("fixtures/api_error.json");

fn fixture(text: &str) -> Value {
    serde_json::from_str(text).expect("Failed to parse fixture")
}

#[test]
fn test_quote_mode_tick_decodes() {
    let events = route_message(fixture(TICK_QUOTE_JSON));
    let [TransportEvent::Tick(tick)] = &events[..] else {
        panic!("expected one tick, got {events:?}");
    };

    assert_eq!(tick.instrument, InstrumentKey::new("2885", "NSE_EQ"));
    assert_eq!(tick.ltp, dec!(2951.35));
    assert_eq!(tick.change_abs, Some(dec!(12.10)));
    assert_eq!(tick.change_pct, Some(dec!(0.41)));
    assert_eq!(tick.volume, Some(dec!(1843210)));
    assert_eq!(tick.timestamp_millis, 1_705_310_110_000);

    let ohlc = tick.ohlc.expect("session ohlc");
    assert_eq!(ohlc.open, dec!(2940.00));
    assert_eq!(ohlc.close, dec!(2939.25));
}

#[test]
fn test_full_mode_ticks_decode_with_vendor_field_names() {
    let events = route_message(fixture(TICK_FULL_JSON));
    assert_eq!(events.len(), 2);

    let TransportEvent::Tick(tick) = &events[0] else {
        panic!("expected tick, got {:?}", events[0]);
    };
    assert_eq!(tick.instrument, InstrumentKey::new("53490439", "NFO_FO"));
    assert_eq!(tick.ltp, dec!(21734.5));
    assert_eq!(tick.open_interest, Some(dec!(11925600)));
    assert_eq!(tick.volume, Some(dec!(96350)));
    assert_eq!(tick.timestamp_millis, 1_705_310_110_250);
    assert_eq!(tick.ohlc.map(|o| o.high), Some(dec!(21760)));

    // The entry without a price is reported without losing its neighbour.
    assert!(matches!(events[1], TransportEvent::MalformedTick(_)));
}

#[test]
fn test_quote_snapshot_response_decodes() {
    let snapshots = parse_quote_response(&fixture(QUOTE_SNAPSHOT_JSON)).unwrap();
    assert_eq!(snapshots.len(), 2);

    let reliance = &snapshots[0];
    assert_eq!(reliance.instrument, InstrumentKey::new("2885", "NSE_EQ"));
    assert_eq!(
        reliance.metadata,
        StaticMetadata::new("RELIANCE")
            .with_display_name("Reliance Industries")
            .with_lot_size(1)
            .with_exchange("NSE")
    );
    assert_eq!(reliance.previous_close, Some(dec!(2939.25)));
    assert_eq!(reliance.ltp, Some(dec!(2951.35)));
    assert_eq!(reliance.timestamp_millis, Some(1_705_310_110_000));

    let bare = &snapshots[1];
    assert_eq!(bare.previous_close, None);
    assert_eq!(bare.metadata, StaticMetadata::default());
    assert!(bare.ohlc.is_none());
}

#[test]
fn test_history_response_decodes_mixed_time_formats() {
    let bars = parse_history_response(&fixture(HISTORY_JSON)).unwrap();
    assert_eq!(bars.len(), 3);

    // 09:15 IST is 03:45 UTC.
    assert_eq!(bars[0].start_time, 1_705_290_300_000);
    assert_eq!(bars[0].volume, dec!(51230));
    assert_eq!(bars[1].start_time - bars[0].start_time, Resolution::OneMinute.duration_ms());
    assert_eq!(bars[2].start_time, 1_705_290_480_000);
    assert_eq!(bars[2].close, dec!(2949.95));
    assert_eq!(bars[2].volume, dec!(0));
}

#[test]
fn test_error_envelope_is_reported() {
    let body = fixture(API_ERROR_JSON);

    let err = parse_quote_response(&body).unwrap_err();
    assert!(err.to_string().contains("Invalid instrument token"));
    assert!(parse_history_response(&body).is_err());
}

#[test]
fn test_quote_record_serializes_for_consumers() {
    let mut record = QuoteRecord::seeded(
        InstrumentKey::new("2885", "NSE_EQ"),
        StaticMetadata::new("RELIANCE"),
    );
    record.snapshot = SnapshotState::Failed("timeout".to_string());

    let value = serde_json::to_value(&record).unwrap();
    assert_eq!(value["instrument"]["exchangeSegment"], "NSE_EQ");
    assert_eq!(value["metadata"]["symbol"], "RELIANCE");
    assert_eq!(value["snapshot"]["state"], "failed");
    assert_eq!(value["snapshot"]["reason"], "timeout");
    assert!(value["live"].is_null());
    assert!(value["lastUpdated"].is_null());
}

#[test]
fn test_resolution_wire_names_round_trip_through_from_str() {
    for resolution in Resolution::ALL {
        let text = resolution.to_string();
        assert_eq!(text.parse::<Resolution>().unwrap(), resolution);
        assert_eq!(serde_json::to_value(resolution).unwrap(), Value::String(text));
    }
}
