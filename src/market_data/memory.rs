use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use super::{CandleValidator, MarketDataStore};
use crate::error::StoreError;
use crate::models::Candle;

type Series = BTreeMap<DateTime<Utc>, Candle>;

/// Thread-safe in-memory candle store
///
/// Keeps a bounded history per symbol; the oldest candles are evicted once
/// `max_candles` is exceeded. Readers never observe a half-written candle.
#[derive(Clone)]
pub struct InMemoryCandleStore {
    data: Arc<RwLock<HashMap<String, Series>>>,
    max_candles: usize,
    validator: Arc<CandleValidator>,
}

impl InMemoryCandleStore {
    pub fn new(max_candles: usize) -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            max_candles,
            validator: Arc::new(CandleValidator::new()),
        }
    }

    pub fn candle_count(&self, symbol: &str) -> Result<usize, StoreError> {
        let data = self.data.read().map_err(lock_error)?;
        Ok(data.get(symbol).map(|s| s.len()).unwrap_or(0))
    }
}

fn lock_error<T>(err: std::sync::PoisonError<T>) -> StoreError {
    StoreError::Backend(err.to_string())
}

#[async_trait]
impl MarketDataStore for InMemoryCandleStore {
    async fn append(&self, candle: &Candle) -> Result<(), StoreError> {
        self.validator.validate(candle)?;

        let mut data = self.data.write().map_err(lock_error)?;
        let series = data.entry(candle.symbol.clone()).or_default();

        if series.contains_key(&candle.timestamp) {
            return Err(StoreError::DuplicateTimestamp {
                symbol: candle.symbol.clone(),
                timestamp: candle.timestamp,
            });
        }

        series.insert(candle.timestamp, candle.clone());

        while series.len() > self.max_candles {
            series.pop_first();
        }

        Ok(())
    }

    async fn query(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, StoreError> {
        if start > end {
            return Ok(Vec::new());
        }
        let data = self.data.read().map_err(lock_error)?;
        Ok(data
            .get(symbol)
            .map(|series| series.range(start..=end).map(|(_, c)| c.clone()).collect())
            .unwrap_or_default())
    }

    async fn latest(&self, symbol: &str, limit: usize) -> Result<Vec<Candle>, StoreError> {
        let data = self.data.read().map_err(lock_error)?;
        Ok(data
            .get(symbol)
            .map(|series| {
                let mut recent: Vec<Candle> =
                    series.values().rev().take(limit).cloned().collect();
                recent.reverse();
                recent
            })
            .unwrap_or_default())
    }

    async fn prune(&self, symbol: &str, before: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut data = self.data.write().map_err(lock_error)?;
        let Some(series) = data.get_mut(symbol) else {
            return Ok(0);
        };
        let kept = series.split_off(&before);
        let removed = series.len();
        *series = kept;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::append_new;
    use chrono::Duration;
    use rust_decimal::Decimal;

    fn create_test_candle(symbol: &str, hours_ago: i64, price: i64) -> Candle {
        let price = Decimal::from(price);
        Candle {
            symbol: symbol.to_string(),
            timestamp: Utc::now() - Duration::hours(hours_ago),
            open: price,
            high: price,
            low: price,
            close: price,
            volume: Decimal::from(1000),
        }
    }

    #[tokio::test]
    async fn test_append_and_latest_ordering() {
        let store = InMemoryCandleStore::new(100);

        // Inserted out of order, returned oldest first
        store.append(&create_test_candle("DOGE/IDR", 1, 2002)).await.unwrap();
        store.append(&create_test_candle("DOGE/IDR", 3, 2000)).await.unwrap();
        store.append(&create_test_candle("DOGE/IDR", 2, 2001)).await.unwrap();

        let candles = store.latest("DOGE/IDR", 10).await.unwrap();
        assert_eq!(candles.len(), 3);
        assert_eq!(candles[0].close, Decimal::from(2000));
        assert_eq!(candles[2].close, Decimal::from(2002));

        let recent = store.latest("DOGE/IDR", 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].close, Decimal::from(2001));
    }

    #[tokio::test]
    async fn test_duplicate_timestamp_rejected() {
        let store = InMemoryCandleStore::new(100);
        let candle = create_test_candle("DOGE/IDR", 1, 2000);

        store.append(&candle).await.unwrap();
        let result = store.append(&candle).await;

        assert!(matches!(result, Err(StoreError::DuplicateTimestamp { .. })));
        assert_eq!(store.candle_count("DOGE/IDR").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_invalid_candle_not_stored() {
        let store = InMemoryCandleStore::new(100);
        let mut candle = create_test_candle("DOGE/IDR", 1, 2000);
        candle.low = Decimal::from(2100);

        assert!(matches!(
            store.append(&candle).await,
            Err(StoreError::InvalidCandle(_))
        ));
        assert_eq!(store.candle_count("DOGE/IDR").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_query_range_inclusive() {
        let store = InMemoryCandleStore::new(100);
        let candles: Vec<Candle> = (0..10)
            .map(|i| create_test_candle("DOGE/IDR", 10 - i, 2000 + i))
            .collect();
        for c in &candles {
            store.append(c).await.unwrap();
        }

        let result = store
            .query("DOGE/IDR", candles[2].timestamp, candles[5].timestamp)
            .await
            .unwrap();
        assert_eq!(result.len(), 4);
        assert_eq!(result[0], candles[2]);
        assert_eq!(result[3], candles[5]);

        let empty = store
            .query("DOGE/IDR", candles[5].timestamp, candles[2].timestamp)
            .await
            .unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_prune_drops_older_candles() {
        let store = InMemoryCandleStore::new(100);
        let candles: Vec<Candle> = (0..6)
            .map(|i| create_test_candle("DOGE/IDR", 6 - i, 2000 + i))
            .collect();
        for c in &candles {
            store.append(c).await.unwrap();
        }

        let removed = store.prune("DOGE/IDR", candles[2].timestamp).await.unwrap();
        assert_eq!(removed, 2);
        let left = store.latest("DOGE/IDR", 100).await.unwrap();
        assert_eq!(left.first(), Some(&candles[2]));
        assert_eq!(left.len(), 4);

        assert_eq!(store.prune("BTC/IDR", Utc::now()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_max_candles_evicts_oldest() {
        let store = InMemoryCandleStore::new(5);
        for i in 0..10 {
            store
                .append(&create_test_candle("DOGE/IDR", 10 - i, 2000 + i))
                .await
                .unwrap();
        }

        let candles = store.latest("DOGE/IDR", 100).await.unwrap();
        assert_eq!(candles.len(), 5);
        assert_eq!(candles[0].close, Decimal::from(2005));
        assert_eq!(candles[4].close, Decimal::from(2009));
    }

    #[tokio::test]
    async fn test_append_new_skips_duplicates() {
        let store = InMemoryCandleStore::new(100);
        let batch: Vec<Candle> = (0..3)
            .map(|i| create_test_candle("DOGE/IDR", 3 - i, 2000 + i))
            .collect();

        assert_eq!(append_new(&store, &batch).await.unwrap(), 3);
        assert_eq!(append_new(&store, &batch).await.unwrap(), 0);
        assert_eq!(store.candle_count("DOGE/IDR").unwrap(), 3);
    }

    #[tokio::test]
    async fn test_symbols_are_isolated() {
        let store = InMemoryCandleStore::new(100);
        store.append(&create_test_candle("DOGE/IDR", 1, 2000)).await.unwrap();
        store.append(&create_test_candle("BTC/IDR", 1, 900)).await.unwrap();

        assert_eq!(store.latest("DOGE/IDR", 10).await.unwrap().len(), 1);
        assert_eq!(store.latest("ETH/IDR", 10).await.unwrap().len(), 0);
    }
}
