//! Application configuration loaded from environment variables.
//!
//! Every variable is optional:
//! - `TICKFLOW_WEBSOCKET_URL` - tick stream endpoint
//! - `TICKFLOW_REST_URL` - REST API root for snapshots and history
//! - `TICKFLOW_FLUSH_INTERVAL_MS` - coalescing window, default 200
//! - `TICKFLOW_SUBSCRIPTION_MODE` - `ltp`, `quote` (default) or `full`
//! - `TICKFLOW_UTC_OFFSET_MINUTES` - exchange-local offset for bar
//!   alignment, default 330
//! - `TICKFLOW_HISTORY_BARS` - bars requested when a chart opens, default 500
//! - `TICKFLOW_INSTRUMENTS` - comma-separated `SEGMENT:TOKEN` list the
//!   binary subscribes to at startup

use std::str::FromStr;
use std::time::Duration;

use chrono::FixedOffset;
use tracing::warn;

use crate::error::FeedError;
use crate::models::{InstrumentKey, SubscriptionMode};

/// Default tick stream endpoint.
const DEFAULT_WEBSOCKET_URL: &str = "wss://stream.example-broker.in/v2/ticks";

/// Default REST API root.
const DEFAULT_REST_URL: &str = "https://api.example-broker.in/v1";

const DEFAULT_FLUSH_INTERVAL_MS: u64 = 200;

/// Flush intervals outside this range are accepted but warned about.
const RECOMMENDED_FLUSH_RANGE_MS: std::ops::RangeInclusive<u64> = 150..=250;

/// IST, UTC+05:30.
const DEFAULT_UTC_OFFSET_MINUTES: i32 = 330;

const DEFAULT_HISTORY_BARS: usize = 500;

/// Top-level application configuration.
#[derive(Debug)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub feed: FeedConfig,
}

/// Broker endpoints.
#[derive(Debug)]
pub struct BrokerConfig {
    pub websocket_url: String,
    pub rest_url: String,
}

/// Pipeline tuning.
#[derive(Debug)]
pub struct FeedConfig {
    pub flush_interval: Duration,
    pub subscription_mode: SubscriptionMode,
    pub utc_offset: FixedOffset,
    pub history_bars: usize,
    pub instruments: Vec<InstrumentKey>,
}

/// Loads the application configuration from environment variables.
///
/// # Errors
///
/// Returns [`FeedError::Config`] if a variable is set to a value that does
/// not parse or is out of range, and [`FeedError::InvalidInstrument`] for a
/// bad entry in `TICKFLOW_INSTRUMENTS`.
pub fn fetch_config() -> crate::Result<AppConfig> {
    let websocket_url = non_empty_var("TICKFLOW_WEBSOCKET_URL")
        .unwrap_or_else(|| DEFAULT_WEBSOCKET_URL.to_string());
    let rest_url =
        non_empty_var("TICKFLOW_REST_URL").unwrap_or_else(|| DEFAULT_REST_URL.to_string());

    let flush_ms: u64 = parsed_var("TICKFLOW_FLUSH_INTERVAL_MS")?.unwrap_or(DEFAULT_FLUSH_INTERVAL_MS);
    if flush_ms == 0 {
        return Err(FeedError::Config(
            "TICKFLOW_FLUSH_INTERVAL_MS must be greater than zero".to_string(),
        ));
    }
    if !RECOMMENDED_FLUSH_RANGE_MS.contains(&flush_ms) {
        warn!(
            flush_ms,
            "Flush interval is outside the recommended 150-250 ms range"
        );
    }

    let subscription_mode = match non_empty_var("TICKFLOW_SUBSCRIPTION_MODE") {
        Some(mode) => mode.parse()?,
        None => SubscriptionMode::default(),
    };

    let offset_minutes: i32 =
        parsed_var("TICKFLOW_UTC_OFFSET_MINUTES")?.unwrap_or(DEFAULT_UTC_OFFSET_MINUTES);
    let utc_offset = offset_minutes
        .checked_mul(60)
        .and_then(FixedOffset::east_opt)
        .ok_or_else(|| {
            FeedError::Config(format!(
                "TICKFLOW_UTC_OFFSET_MINUTES out of range: {offset_minutes}"
            ))
        })?;

    let history_bars: usize = parsed_var("TICKFLOW_HISTORY_BARS")?.unwrap_or(DEFAULT_HISTORY_BARS);

    let instruments = match non_empty_var("TICKFLOW_INSTRUMENTS") {
        Some(list) => list
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(InstrumentKey::from_str)
            .collect::<crate::Result<Vec<_>>>()?,
        None => Vec::new(),
    };

    Ok(AppConfig {
        broker: BrokerConfig {
            websocket_url,
            rest_url,
        },
        feed: FeedConfig {
            flush_interval: Duration::from_millis(flush_ms),
            subscription_mode,
            utc_offset,
            history_bars,
            instruments,
        },
    })
}

/// Returns the value of an environment variable if it exists and is non-empty.
fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

/// Parses a non-empty environment variable, naming it in the error.
fn parsed_var<T>(name: &str) -> crate::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    non_empty_var(name)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| FeedError::Config(format!("{name}={raw:?}: {e}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: [&str; 7] = [
        "TICKFLOW_WEBSOCKET_URL",
        "TICKFLOW_REST_URL",
        "TICKFLOW_FLUSH_INTERVAL_MS",
        "TICKFLOW_SUBSCRIPTION_MODE",
        "TICKFLOW_UTC_OFFSET_MINUTES",
        "TICKFLOW_HISTORY_BARS",
        "TICKFLOW_INSTRUMENTS",
    ];

    /// Serializes tests that touch the process environment.
    static ENV_LOCK: parking_lot::Mutex<()> = parking_lot::Mutex::new(());

    /// Helper that clears every config variable, applies `vars`, runs `f`,
    /// then restores the originals.
    fn with_env<F: FnOnce()>(vars: &[(&str, &str)], f: F) {
        let _guard = ENV_LOCK.lock();
        let originals: Vec<(&str, Option<String>)> =
            VARS.iter().map(|k| (*k, std::env::var(k).ok())).collect();

        // SAFETY: every test touching these variables holds ENV_LOCK.
        unsafe {
            for k in VARS {
                std::env::remove_var(k);
            }
            for (k, v) in vars {
                std::env::set_var(k, v);
            }
        }

        f();

        for (k, original) in originals {
            // SAFETY: restoring original values under the same lock.
            unsafe {
                match original {
                    Some(val) => std::env::set_var(k, val),
                    None => std::env::remove_var(k),
                }
            }
        }
    }

    #[test]
    fn defaults_without_env_vars() {
        with_env(&[], || {
            let config = fetch_config().unwrap();
            assert_eq!(config.broker.websocket_url, DEFAULT_WEBSOCKET_URL);
            assert_eq!(config.broker.rest_url, DEFAULT_REST_URL);
            assert_eq!(config.feed.flush_interval, Duration::from_millis(200));
            assert_eq!(config.feed.subscription_mode, SubscriptionMode::Quote);
            assert_eq!(config.feed.utc_offset.local_minus_utc(), 330 * 60);
            assert_eq!(config.feed.history_bars, 500);
            assert!(config.feed.instruments.is_empty());
        });
    }

    #[test]
    fn loads_values_from_env() {
        with_env(
            &[
                ("TICKFLOW_WEBSOCKET_URL", "ws://localhost:9000"),
                ("TICKFLOW_FLUSH_INTERVAL_MS", "150"),
                ("TICKFLOW_SUBSCRIPTION_MODE", "full"),
                ("TICKFLOW_UTC_OFFSET_MINUTES", "-300"),
                ("TICKFLOW_HISTORY_BARS", "120"),
                ("TICKFLOW_INSTRUMENTS", "NSE_EQ:2885, NSE_FO:49081,"),
            ],
            || {
                let config = fetch_config().unwrap();
                assert_eq!(config.broker.websocket_url, "ws://localhost:9000");
                assert_eq!(config.feed.flush_interval, Duration::from_millis(150));
                assert_eq!(config.feed.subscription_mode, SubscriptionMode::Full);
                assert_eq!(config.feed.utc_offset.local_minus_utc(), -300 * 60);
                assert_eq!(config.feed.history_bars, 120);
                assert_eq!(
                    config.feed.instruments,
                    vec![
                        InstrumentKey::new("2885", "NSE_EQ"),
                        InstrumentKey::new("49081", "NSE_FO"),
                    ]
                );
            },
        );
    }

    #[test]
    fn rejects_zero_flush_interval() {
        with_env(&[("TICKFLOW_FLUSH_INTERVAL_MS", "0")], || {
            let err = fetch_config().unwrap_err();
            assert!(err.to_string().contains("greater than zero"));
        });
    }

    #[test]
    fn rejects_unparseable_numbers() {
        with_env(&[("TICKFLOW_HISTORY_BARS", "lots")], || {
            let err = fetch_config().unwrap_err();
            assert!(err.to_string().contains("TICKFLOW_HISTORY_BARS"));
        });
    }

    #[test]
    fn rejects_out_of_range_offset() {
        with_env(&[("TICKFLOW_UTC_OFFSET_MINUTES", "1500")], || {
            assert!(matches!(fetch_config(), Err(FeedError::Config(_))));
        });
    }

    #[test]
    fn rejects_bad_instrument_entry() {
        with_env(&[("TICKFLOW_INSTRUMENTS", "NSE_EQ:2885,garbage")], || {
            assert!(matches!(
                fetch_config(),
                Err(FeedError::InvalidInstrument(_))
            ));
        });
    }

    #[test]
    fn empty_values_treated_as_absent() {
        with_env(
            &[
                ("TICKFLOW_WEBSOCKET_URL", ""),
                ("TICKFLOW_SUBSCRIPTION_MODE", ""),
            ],
            || {
                let config = fetch_config().unwrap();
                assert_eq!(config.broker.websocket_url, DEFAULT_WEBSOCKET_URL);
                assert_eq!(config.feed.subscription_mode, SubscriptionMode::Quote);
            },
        );
    }
}
