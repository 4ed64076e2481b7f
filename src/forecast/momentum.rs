use rust_decimal::Decimal;

use super::{trailing_window, Forecaster};
use crate::error::ForecastError;
use crate::models::{Candle, Forecast};

/// Drift extrapolation: next close = last close * (1 + mean return).
///
/// Used by the backtest and when no trained artifact exists. Confidence is the
/// share of returns in the window that agree in sign with the mean return.
pub struct MomentumForecaster {
    sequence_length: usize,
    /// Mean return is projected this many candles ahead
    horizon: u32,
}

impl MomentumForecaster {
    pub fn new(sequence_length: usize, horizon: u32) -> Self {
        Self {
            sequence_length: sequence_length.max(2),
            horizon: horizon.max(1),
        }
    }
}

impl Forecaster for MomentumForecaster {
    fn name(&self) -> &str {
        "momentum"
    }

    fn sequence_length(&self) -> usize {
        self.sequence_length
    }

    fn forecast(&self, window: &[Candle]) -> Result<Forecast, ForecastError> {
        let window = trailing_window(window, self.sequence_length)?;

        let returns: Vec<Decimal> = window
            .windows(2)
            .filter(|w| w[0].close > Decimal::ZERO)
            .map(|w| (w[1].close - w[0].close) / w[0].close)
            .collect();

        let last = &window[window.len() - 1];
        if returns.is_empty() {
            return Ok(Forecast {
                as_of: last.timestamp,
                predicted_value: last.close,
                confidence: Decimal::ZERO,
            });
        }

        let count = Decimal::from(returns.len());
        let mean: Decimal = returns.iter().sum::<Decimal>() / count;
        let agreeing = returns
            .iter()
            .filter(|r| !r.is_zero() && r.is_sign_negative() == mean.is_sign_negative())
            .count();

        let confidence = if mean.is_zero() {
            Decimal::ZERO
        } else {
            (Decimal::from(agreeing) / count).round_dp(4)
        };

        let predicted_value =
            (last.close * (Decimal::ONE + mean * Decimal::from(self.horizon))).round_dp(8);

        Ok(Forecast {
            as_of: last.timestamp,
            predicted_value,
            confidence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;

    fn series(prices: &[Decimal]) -> Vec<Candle> {
        let now = Utc::now();
        prices
            .iter()
            .enumerate()
            .map(|(i, price)| Candle {
                symbol: "DOGE/IDR".to_string(),
                timestamp: now - Duration::hours((prices.len() - i) as i64),
                open: *price,
                high: *price,
                low: *price,
                close: *price,
                volume: dec!(1),
            })
            .collect()
    }

    #[test]
    fn test_rising_series() {
        let forecaster = MomentumForecaster::new(3, 1);
        let candles = series(&[dec!(100), dec!(110), dec!(121)]);

        let forecast = forecaster.forecast(&candles).unwrap();
        assert_eq!(forecast.predicted_value, dec!(133.1));
        assert_eq!(forecast.confidence, Decimal::ONE);
    }

    #[test]
    fn test_mixed_series_confidence() {
        let forecaster = MomentumForecaster::new(5, 1);
        let candles = series(&[dec!(100), dec!(110), dec!(100), dec!(110), dec!(121)]);

        let forecast = forecaster.forecast(&candles).unwrap();
        assert!(forecast.predicted_value > dec!(121));
        assert_eq!(forecast.confidence, dec!(0.75));
    }

    #[test]
    fn test_flat_series_has_zero_confidence() {
        let forecaster = MomentumForecaster::new(3, 1);
        let candles = series(&[dec!(100), dec!(100), dec!(100)]);

        let forecast = forecaster.forecast(&candles).unwrap();
        assert_eq!(forecast.predicted_value, dec!(100));
        assert_eq!(forecast.confidence, Decimal::ZERO);
    }

    #[test]
    fn test_short_window() {
        let forecaster = MomentumForecaster::new(3, 1);
        let candles = series(&[dec!(100), dec!(101)]);
        assert_eq!(
            forecaster.forecast(&candles),
            Err(ForecastError::InsufficientData { needed: 3, got: 2 })
        );
    }
}
