use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

use crate::models::Candle;

/// Market scenario types for synthetic data generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketScenario {
    /// Steady uptrend with noise
    Uptrend,
    /// Steady downtrend with noise
    Downtrend,
    /// Mean-reverting chop around the base price
    Sideways,
    /// Large swings (±5% per candle)
    Volatile,
}

impl MarketScenario {
    pub fn all() -> [MarketScenario; 4] {
        [
            MarketScenario::Uptrend,
            MarketScenario::Downtrend,
            MarketScenario::Sideways,
            MarketScenario::Volatile,
        ]
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "uptrend" => Some(MarketScenario::Uptrend),
            "downtrend" => Some(MarketScenario::Downtrend),
            "sideways" => Some(MarketScenario::Sideways),
            "volatile" => Some(MarketScenario::Volatile),
            _ => None,
        }
    }
}

/// Generates synthetic candles for backtesting
pub struct SyntheticDataGenerator {
    rng: StdRng,
    symbol: String,
    base_price: f64,
    base_volume: f64,
}

impl SyntheticDataGenerator {
    /// Create a new generator with a seed for reproducibility
    pub fn new(symbol: &str, base_price: f64, seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            symbol: symbol.to_string(),
            base_price,
            base_volume: 1_000_000.0,
        }
    }

    /// Generate `num_candles` candles ending now, `interval_minutes` apart
    pub fn generate(
        &mut self,
        scenario: MarketScenario,
        num_candles: usize,
        interval_minutes: i64,
    ) -> Vec<Candle> {
        let start_time = Utc::now() - Duration::minutes(num_candles as i64 * interval_minutes);
        // Per-candle drift equivalent to ±10% per day
        let daily_drift = 0.1 / (24.0 * 60.0 / interval_minutes as f64);

        let mut candles = Vec::with_capacity(num_candles);
        let mut current_price = self.base_price;

        for i in 0..num_candles {
            let timestamp = start_time + Duration::minutes(i as i64 * interval_minutes);

            let change = match scenario {
                MarketScenario::Uptrend => {
                    current_price * (daily_drift + self.rng.gen_range(-0.001..0.001))
                }
                MarketScenario::Downtrend => {
                    current_price * (-daily_drift + self.rng.gen_range(-0.001..0.001))
                }
                MarketScenario::Sideways => {
                    // 10% pull to the mean plus ±1% noise
                    (self.base_price - current_price) * 0.1
                        + current_price * self.rng.gen_range(-0.01..0.01)
                }
                MarketScenario::Volatile => current_price * self.rng.gen_range(-0.05..0.05),
            };
            current_price = (current_price + change).max(self.base_price * 0.5);

            candles.push(self.create_candle(current_price, timestamp));
        }

        candles
    }

    /// Realistic OHLC around a close price
    fn create_candle(&mut self, price: f64, timestamp: DateTime<Utc>) -> Candle {
        let noise_pct = 0.002;

        let high = price * (1.0 + self.rng.gen_range(0.0..noise_pct));
        let low = price * (1.0 - self.rng.gen_range(0.0..noise_pct));
        let open = (price * (1.0 + self.rng.gen_range(-noise_pct..noise_pct))).clamp(low, high);
        let volume = self.base_volume * self.rng.gen_range(0.7..1.3);

        Candle {
            symbol: self.symbol.clone(),
            timestamp,
            open: to_decimal(open),
            high: to_decimal(high),
            low: to_decimal(low),
            close: to_decimal(price),
            volume: to_decimal(volume),
        }
    }
}

fn to_decimal(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or_default().round_dp(8)
}
