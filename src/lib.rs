//! Live market-tick pipeline.
//!
//! Keeps a dynamic subscription set in sync with what the application
//! wants, coalesces bursts of ticks into one update per instrument per
//! flush window, maintains a canonical quote record per instrument, and
//! derives OHLCV bars at fixed resolutions from the same stream.
//!
//! The core stages ([`reconciler`], [`coalescer`], [`quotes`], [`bars`])
//! are synchronous and composed by [`feed::MarketFeed`]. [`service`] runs
//! that engine on tokio; [`websocket`] and [`rest`] are the concrete
//! collaborators.

pub mod bars;
pub mod coalescer;
pub mod config;
pub mod error;
pub mod feed;
pub mod models;
pub mod notify;
pub mod quotes;
pub mod reconciler;
pub mod rest;
pub mod service;
pub mod transport;
pub mod websocket;

pub use error::{FeedError, Result, TransportError};
pub use feed::{DesiredSet, FeedUpdate, MarketFeed};
pub use models::InstrumentKey;
pub use service::FeedHandle;
