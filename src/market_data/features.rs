use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

use crate::models::Candle;

pub const DEFAULT_FEATURE_PERIOD: usize = 14;

/// Indicators derived from a candle window, attached to audit records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSnapshot {
    pub period: usize,
    pub sma: Option<f64>,
    pub ema: Option<f64>,
    pub rsi: Option<f64>,
    /// Close-to-close return of the last candle
    pub last_return: Option<f64>,
}

impl FeatureSnapshot {
    pub fn from_candles(candles: &[Candle], period: usize) -> Self {
        let closes = closes(candles);
        let last_return = match closes.as_slice() {
            [.., prev, last] if *prev != 0.0 => Some((last - prev) / prev),
            _ => None,
        };

        Self {
            period,
            sma: calculate_sma(&closes, period),
            ema: calculate_ema(&closes, period),
            rsi: calculate_rsi(&closes, period),
            last_return,
        }
    }
}

pub fn closes(candles: &[Candle]) -> Vec<f64> {
    candles
        .iter()
        .filter_map(|c| c.close.to_f64())
        .collect()
}

/// Mean of the last `period` values
pub fn calculate_sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let sum: f64 = values[values.len() - period..].iter().sum();
    Some(sum / period as f64)
}

/// EMA seeded with the SMA of the first `period` values
pub fn calculate_ema(values: &[f64], period: usize) -> Option<f64> {
    let seed = calculate_sma(values.get(..period)?, period)?;
    let k = 2.0 / (period as f64 + 1.0);
    Some(
        values[period..]
            .iter()
            .fold(seed, |ema, value| ema + (value - ema) * k),
    )
}

/// Simple-average RSI over the last `period` changes
pub fn calculate_rsi(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period + 1 {
        return None;
    }

    let (gain, loss) = values[values.len() - period - 1..]
        .windows(2)
        .map(|w| w[1] - w[0])
        .fold((0.0, 0.0), |(g, l), change| {
            if change > 0.0 {
                (g + change, l)
            } else {
                (g, l - change)
            }
        });

    if loss == 0.0 {
        return Some(100.0);
    }

    let rs = gain / loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}
