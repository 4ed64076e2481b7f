use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::time::{timeout, Duration};

use crate::error::StoreError;
use crate::market_data::{CandleValidator, MarketDataStore};
use crate::models::Candle;

/// Candle as stored in the sorted set; the symbol lives in the key
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredCandle {
    timestamp: DateTime<Utc>,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: Decimal,
}

impl StoredCandle {
    fn into_candle(self, symbol: &str) -> Candle {
        Candle {
            symbol: symbol.to_string(),
            timestamp: self.timestamp,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
        }
    }
}

impl From<&Candle> for StoredCandle {
    fn from(candle: &Candle) -> Self {
        Self {
            timestamp: candle.timestamp,
            open: candle.open,
            high: candle.high,
            low: candle.low,
            close: candle.close,
            volume: candle.volume,
        }
    }
}

/// Redis-backed candle history
///
/// One sorted set per symbol (`candles:{symbol}`) scored by the candle's
/// timestamp in milliseconds. ZADD is atomic per member, so concurrent readers
/// never see a partial row.
#[derive(Clone)]
pub struct RedisCandleStore {
    conn: ConnectionManager,
    validator: std::sync::Arc<CandleValidator>,
}

impl RedisCandleStore {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    pub async fn new(redis_url: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)?;

        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Backend("Redis connection timeout after 5 seconds".into()))??;

        tracing::info!("Connected to Redis at {}", redis_url);

        Ok(Self {
            conn,
            validator: std::sync::Arc::new(CandleValidator::new()),
        })
    }

    fn key(symbol: &str) -> String {
        format!("candles:{}", symbol)
    }

    fn score(timestamp: DateTime<Utc>) -> f64 {
        timestamp.timestamp_millis() as f64
    }

    fn decode(symbol: &str, rows: Vec<String>) -> Result<Vec<Candle>, StoreError> {
        rows.iter()
            .map(|json| {
                let stored: StoredCandle = serde_json::from_str(json)?;
                Ok(stored.into_candle(symbol))
            })
            .collect()
    }
}

#[async_trait]
impl MarketDataStore for RedisCandleStore {
    async fn append(&self, candle: &Candle) -> Result<(), StoreError> {
        self.validator.validate(candle)?;

        let mut conn = self.conn.clone();
        let key = Self::key(&candle.symbol);
        let score = Self::score(candle.timestamp);

        // Single writer per symbol (the trading loop), so check-then-add is safe
        let existing: Vec<String> = conn.zrangebyscore(&key, score, score).await?;
        if !existing.is_empty() {
            return Err(StoreError::DuplicateTimestamp {
                symbol: candle.symbol.clone(),
                timestamp: candle.timestamp,
            });
        }

        let value = serde_json::to_string(&StoredCandle::from(candle))?;
        conn.zadd::<_, _, _, ()>(&key, value, score).await?;

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
        let mut conn = self.conn.clone();
        let rows: Vec<String> = conn
            .zrangebyscore(Self::key(symbol), Self::score(start), Self::score(end))
            .await?;
        Self::decode(symbol, rows)
    }

    async fn latest(&self, symbol: &str, limit: usize) -> Result<Vec<Candle>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let rows: Vec<String> = conn
            .zrange(Self::key(symbol), -(limit as isize), -1)
            .await?;
        Self::decode(symbol, rows)
    }

    async fn prune(&self, symbol: &str, before: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let removed: usize = conn
            .zrembyscore(Self::key(symbol), "-inf", format!("({}", Self::score(before)))
            .await?;

        if removed > 0 {
            tracing::debug!("Pruned {} old candles for {}", removed, symbol);
        }

        Ok(removed)
    }
}

/// Millisecond epoch to UTC, as returned by exchange OHLCV endpoints
pub fn timestamp_from_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}
