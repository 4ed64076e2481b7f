// Historical OHLCV storage and derived features
pub mod features;
pub mod memory;
pub mod validator;

pub use features::FeatureSnapshot;
pub use memory::InMemoryCandleStore;
pub use validator::CandleValidator;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::models::Candle;

/// Append-only candle store.
///
/// Implementations reject a second candle for the same (symbol, timestamp)
/// and return candles ordered by timestamp, oldest first.
#[async_trait]
pub trait MarketDataStore: Send + Sync {
    async fn append(&self, candle: &Candle) -> Result<(), StoreError>;

    /// Candles with `start <= timestamp <= end`
    async fn query(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, StoreError>;

    /// The `limit` most recent candles
    async fn latest(&self, symbol: &str, limit: usize) -> Result<Vec<Candle>, StoreError>;

    /// Drop candles with `timestamp < before`; returns how many were removed
    async fn prune(&self, symbol: &str, before: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// Append a batch, skipping candles that are already stored.
///
/// Returns how many candles were new.
pub async fn append_new(
    store: &dyn MarketDataStore,
    candles: &[Candle],
) -> Result<usize, StoreError> {
    let mut appended = 0;
    for candle in candles {
        match store.append(candle).await {
            Ok(()) => appended += 1,
            Err(StoreError::DuplicateTimestamp { .. }) => {}
            Err(e) => return Err(e),
        }
    }

    if appended > 0 {
        tracing::debug!("Appended {} new candles", appended);
    }

    Ok(appended)
}
