use std::sync::Arc;

use tickflow::config::fetch_config;
use tickflow::rest::RestSnapshotClient;
use tickflow::websocket::ConnectionManager;
use tickflow::{DesiredSet, FeedError, FeedHandle, FeedUpdate, MarketFeed};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), FeedError> {
    // Initialize tracing subscriber for logging output.
    tracing_subscriber::fmt::init();

    let app_config = fetch_config()?;
    let feed_config = app_config.feed;

    let cancel = CancellationToken::new();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (manager, transport) =
        ConnectionManager::new(&app_config.broker.websocket_url, events_tx, cancel.clone());
    let source = Arc::new(RestSnapshotClient::new(&app_config.broker.rest_url)?);

    let feed = MarketFeed::new(
        transport,
        feed_config.subscription_mode,
        feed_config.utc_offset,
    );
    let handle = FeedHandle::new(feed, source).with_history_bars(feed_config.history_bars);

    handle.subscribe(|update| match update {
        FeedUpdate::BatchApplied(batch) => {
            for quote in &batch.quotes {
                info!(
                    instrument = %quote.instrument,
                    ltp = ?quote.ltp(),
                    sequence = batch.sequence,
                    "Quote updated"
                );
            }
        }
        FeedUpdate::SnapshotApplied(records) => {
            info!(count = records.len(), "Snapshots applied");
        }
        FeedUpdate::HistoryLoaded(series) => {
            info!(
                instrument = %series.instrument,
                resolution = %series.resolution,
                bars = series.closed_bars.len(),
                "History loaded"
            );
        }
        FeedUpdate::ConnectionChanged(state) => {
            info!(state = state.as_str(), "Connection state changed");
        }
    });

    let pump = handle.spawn_event_pump(events_rx);
    let flush = handle.spawn_flush_loop(feed_config.flush_interval);
    let connection = tokio::spawn(manager.run());

    let desired: DesiredSet = feed_config.instruments.into_iter().collect();
    handle.set_desired_set(desired);

    tokio::signal::ctrl_c().await?;
    info!(stats = ?handle.stats(), "Shutting down");

    cancel.cancel();
    handle.shutdown();
    let _ = tokio::join!(pump, flush, connection);

    Ok(())
}
