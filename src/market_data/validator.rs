use chrono::{Duration, Utc};
use rust_decimal::Decimal;

use crate::error::StoreError;
use crate::models::Candle;

/// Sanity checks applied before a candle is stored
pub struct CandleValidator {
    /// Tolerated clock skew for timestamps ahead of local time
    max_clock_skew: Duration,
}

impl CandleValidator {
    pub fn new() -> Self {
        Self {
            max_clock_skew: Duration::minutes(5),
        }
    }

    pub fn validate(&self, candle: &Candle) -> Result<(), StoreError> {
        self.validate_prices(candle)?;
        self.validate_timestamp(candle)?;
        self.validate_ohlc_relationship(candle)?;
        Ok(())
    }

    fn validate_prices(&self, candle: &Candle) -> Result<(), StoreError> {
        let prices = [
            ("open", candle.open),
            ("high", candle.high),
            ("low", candle.low),
            ("close", candle.close),
        ];
        for (name, value) in prices {
            if value <= Decimal::ZERO {
                return Err(StoreError::InvalidCandle(format!(
                    "{} price must be positive, got {}",
                    name, value
                )));
            }
        }
        if candle.volume < Decimal::ZERO {
            return Err(StoreError::InvalidCandle(format!(
                "negative volume {}",
                candle.volume
            )));
        }
        Ok(())
    }

    fn validate_timestamp(&self, candle: &Candle) -> Result<(), StoreError> {
        let now = Utc::now();
        if candle.timestamp > now + self.max_clock_skew {
            return Err(StoreError::InvalidCandle(format!(
                "timestamp {} is in the future (now: {})",
                candle.timestamp, now
            )));
        }
        Ok(())
    }

    fn validate_ohlc_relationship(&self, candle: &Candle) -> Result<(), StoreError> {
        if candle.high < candle.low {
            return Err(StoreError::InvalidCandle(format!(
                "high {} is below low {}",
                candle.high, candle.low
            )));
        }
        if candle.high < candle.open.max(candle.close) {
            return Err(StoreError::InvalidCandle(format!(
                "high {} is below open/close",
                candle.high
            )));
        }
        if candle.low > candle.open.min(candle.close) {
            return Err(StoreError::InvalidCandle(format!(
                "low {} is above open/close",
                candle.low
            )));
        }
        Ok(())
    }
}

impl Default for CandleValidator {
    fn default() -> Self {
        Self::new()
    }
}
