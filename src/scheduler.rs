use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::audit::AuditRecord;
use crate::engine::{CycleInput, DecisionEngine};
use crate::error::CycleError;
use crate::market_data::{append_new, MarketDataStore};

/// Candles fetched per cycle on top of the forecast window
const FETCH_MARGIN: usize = 5;

/// Drives the engine at a fixed interval, one cycle at a time.
///
/// Each tick: pull fresh candles into the store, read back the forecast
/// window, fetch price and balance, then run a cycle. A tick that comes due
/// while a cycle is still running is skipped, never queued.
pub struct TradingLoop {
    engine: DecisionEngine,
    store: Arc<dyn MarketDataStore>,
    symbol: String,
    quote_asset: String,
    timeframe: String,
    interval: Duration,
    retention: Option<ChronoDuration>,
}

impl TradingLoop {
    pub fn new(
        engine: DecisionEngine,
        store: Arc<dyn MarketDataStore>,
        symbol: &str,
        quote_asset: &str,
        timeframe: &str,
        interval: Duration,
    ) -> Self {
        Self {
            engine,
            store,
            symbol: symbol.to_string(),
            quote_asset: quote_asset.to_string(),
            timeframe: timeframe.to_string(),
            interval,
            retention: None,
        }
    }

    /// Prune stored candles older than `retention` on every tick
    pub fn with_retention(mut self, retention: ChronoDuration) -> Self {
        self.retention = Some(retention);
        self
    }

    pub fn engine(&self) -> &DecisionEngine {
        &self.engine
    }

    /// Gather market data and run one cycle
    pub async fn tick(&mut self) -> Result<AuditRecord, CycleError> {
        let window_len = self.engine.forecaster().sequence_length();
        let gateway = self.engine.gateway();

        let fresh = gateway
            .fetch_ohlcv(&self.symbol, &self.timeframe, window_len + FETCH_MARGIN)
            .await?;
        append_new(self.store.as_ref(), &fresh).await?;

        let window = self.store.latest(&self.symbol, window_len).await?;
        let now = Utc::now();
        if let Some(cutoff) = self.retention.and_then(|r| now.checked_sub_signed(r)) {
            // Housekeeping only; a failed prune never blocks the cycle
            if let Err(e) = self.store.prune(&self.symbol, cutoff).await {
                tracing::warn!("Failed to prune old candles for {}: {}", self.symbol, e);
            }
        }
        let market_price = gateway.last_price(&self.symbol).await?;
        let available_balance = gateway.available_balance(&self.quote_asset).await?;

        let input = CycleInput {
            symbol: self.symbol.clone(),
            window,
            market_price,
            available_balance,
            now,
        };

        // A cycle that overruns its interval is cancelled at the next state boundary
        self.engine
            .run_cycle_with_deadline(input, Some(self.interval))
            .await
    }

    /// Run until `shutdown` flips to true
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            "🔄 Trading loop started for {} (every {}s)",
            self.symbol,
            self.interval.as_secs()
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    tracing::info!("Trading loop stopping");
                    break;
                }
            }
            if *shutdown.borrow() {
                break;
            }

            match self.tick().await {
                Ok(record) => tracing::debug!(
                    "Cycle {} finished: {:?}",
                    record.cycle_id,
                    record.status
                ),
                Err(e) if e.is_fatal() => {
                    tracing::error!("❌ Cycle failed, ledger may diverge from exchange: {}", e)
                }
                Err(e) => tracing::warn!("Cycle failed: {}", e),
            }
        }
    }
}
