use chrono::{DateTime, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use super::{trailing_window, Forecaster, DEFAULT_CONFIDENCE};
use crate::error::ForecastError;
use crate::models::{Candle, Forecast};

/// Residual std (in min-max scaled units) at which confidence reaches zero
pub const RESIDUAL_SCALE: f64 = 0.25;

/// Trained model artifact
///
/// Predicts the next close from a window of closes min-max scaled to [0, 1]
/// within that window; the output is mapped back with the same scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    pub sequence_length: usize,
    pub weights: Vec<f64>,
    pub bias: f64,
    /// In-sample residual standard deviation, in scaled units
    pub residual_std: Option<f64>,
    pub trained_at: DateTime<Utc>,
    pub samples: usize,
}

impl LinearModel {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ForecastError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ForecastError::ModelUnavailable(format!("cannot read {}: {}", path.display(), e))
        })?;
        let model: LinearModel = serde_json::from_str(&raw).map_err(|e| {
            ForecastError::ModelUnavailable(format!("cannot parse {}: {}", path.display(), e))
        })?;
        model.check()?;
        Ok(model)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
    }

    fn check(&self) -> Result<(), ForecastError> {
        if self.weights.len() != self.sequence_length {
            return Err(ForecastError::ModelUnavailable(format!(
                "model has {} weights for sequence length {}",
                self.weights.len(),
                self.sequence_length
            )));
        }
        if !self.bias.is_finite() || self.weights.iter().any(|w| !w.is_finite()) {
            return Err(ForecastError::ModelUnavailable(
                "model has non-finite parameters".to_string(),
            ));
        }
        Ok(())
    }

    pub fn predict_scaled(&self, scaled: &[f64]) -> f64 {
        self.bias
            + self
                .weights
                .iter()
                .zip(scaled)
                .map(|(w, x)| w * x)
                .sum::<f64>()
    }

    /// Model-derived confidence, or the documented default without a residual
    pub fn confidence(&self) -> Decimal {
        match self.residual_std {
            Some(std) if std.is_finite() => {
                let value = (1.0 - std / RESIDUAL_SCALE).clamp(0.0, 1.0);
                Decimal::from_f64(value)
                    .map(|d| d.round_dp(4))
                    .unwrap_or(DEFAULT_CONFIDENCE)
            }
            _ => DEFAULT_CONFIDENCE,
        }
    }
}

/// Min-max scaling of one window
pub(crate) struct WindowScale {
    pub min: f64,
    pub range: f64,
}

impl WindowScale {
    pub fn fit(values: &[f64]) -> Self {
        let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        Self {
            min,
            range: max - min,
        }
    }

    /// A flat window scales to all zeros
    pub fn scale(&self, value: f64) -> f64 {
        if self.range == 0.0 {
            0.0
        } else {
            (value - self.min) / self.range
        }
    }

    pub fn unscale(&self, value: f64) -> f64 {
        self.min + value * self.range
    }
}

/// Forecaster backed by a trained [`LinearModel`]
pub struct ModelForecaster {
    model: Option<Arc<LinearModel>>,
    sequence_length: usize,
}

impl ModelForecaster {
    pub fn new(model: LinearModel) -> Self {
        Self {
            sequence_length: model.sequence_length,
            model: Some(Arc::new(model)),
        }
    }

    /// No model loaded; every forecast fails with ModelUnavailable
    pub fn unloaded(sequence_length: usize) -> Self {
        Self {
            model: None,
            sequence_length,
        }
    }

    /// Load the artifact at `path`. A missing or broken artifact is logged and
    /// leaves the forecaster unloaded so cycles skip instead of the bot dying.
    pub fn from_path(path: impl AsRef<Path>, sequence_length: usize) -> Self {
        match LinearModel::load(&path) {
            Ok(model) if model.sequence_length == sequence_length => {
                tracing::info!(
                    "Loaded model from {} ({} samples, trained {})",
                    path.as_ref().display(),
                    model.samples,
                    model.trained_at
                );
                Self::new(model)
            }
            Ok(model) => {
                tracing::warn!(
                    "Model at {} expects {} candles but SEQUENCE_LENGTH is {}; ignoring it",
                    path.as_ref().display(),
                    model.sequence_length,
                    sequence_length
                );
                Self::unloaded(sequence_length)
            }
            Err(e) => {
                tracing::warn!("{}", e);
                Self::unloaded(sequence_length)
            }
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }
}

impl Forecaster for ModelForecaster {
    fn name(&self) -> &str {
        "linear"
    }

    fn sequence_length(&self) -> usize {
        self.sequence_length
    }

    fn forecast(&self, window: &[Candle]) -> Result<Forecast, ForecastError> {
        let window = trailing_window(window, self.sequence_length)?;
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| ForecastError::ModelUnavailable("no model loaded".to_string()))?;

        let closes: Vec<f64> = window
            .iter()
            .map(|c| c.close.to_f64())
            .collect::<Option<Vec<f64>>>()
            .ok_or_else(|| {
                ForecastError::ModelUnavailable("close price not representable".to_string())
            })?;

        let scale = WindowScale::fit(&closes);
        let scaled: Vec<f64> = closes.iter().map(|c| scale.scale(*c)).collect();
        let predicted = scale.unscale(model.predict_scaled(&scaled));

        let predicted_value = Decimal::from_f64(predicted)
            .map(|d| d.round_dp(8))
            .ok_or_else(|| {
                ForecastError::ModelUnavailable(format!("non-finite prediction {}", predicted))
            })?;

        Ok(Forecast {
            as_of: window[window.len() - 1].timestamp,
            predicted_value,
            confidence: model.confidence(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn ramp(len: usize, start: i64) -> Vec<Candle> {
        let now = Utc::now();
        (0..len)
            .map(|i| {
                let price = Decimal::from(start + i as i64);
                Candle {
                    symbol: "DOGE/IDR".to_string(),
                    timestamp: now - Duration::hours((len - i) as i64),
                    open: price,
                    high: price,
                    low: price,
                    close: price,
                    volume: dec!(1),
                }
            })
            .collect()
    }

    /// Predicts the last scaled value (a "no change" model)
    fn persistence_model(len: usize, residual_std: Option<f64>) -> LinearModel {
        let mut weights = vec![0.0; len];
        weights[len - 1] = 1.0;
        LinearModel {
            sequence_length: len,
            weights,
            bias: 0.0,
            residual_std,
            trained_at: Utc::now(),
            samples: 100,
        }
    }

    #[test]
    fn test_insufficient_data() {
        let forecaster = ModelForecaster::new(persistence_model(5, None));
        let result = forecaster.forecast(&ramp(4, 100));
        assert_eq!(
            result,
            Err(ForecastError::InsufficientData { needed: 5, got: 4 })
        );
    }

    #[test]
    fn test_unloaded_model() {
        let forecaster = ModelForecaster::unloaded(5);
        let result = forecaster.forecast(&ramp(5, 100));
        assert!(matches!(result, Err(ForecastError::ModelUnavailable(_))));
    }

    #[test]
    fn test_insufficient_data_reported_before_missing_model() {
        let forecaster = ModelForecaster::unloaded(5);
        let result = forecaster.forecast(&ramp(2, 100));
        assert!(matches!(result, Err(ForecastError::InsufficientData { .. })));
    }

    #[test]
    fn test_forecast_uses_trailing_window() {
        let forecaster = ModelForecaster::new(persistence_model(5, None));
        let candles = ramp(8, 100);

        let forecast = forecaster.forecast(&candles).unwrap();
        assert_eq!(forecast.predicted_value, dec!(107));
        assert_eq!(forecast.as_of, candles[7].timestamp);
        assert_eq!(forecast.confidence, DEFAULT_CONFIDENCE);
    }

    #[test]
    fn test_forecast_is_deterministic() {
        let forecaster = ModelForecaster::new(persistence_model(5, Some(0.05)));
        let candles = ramp(5, 2000);

        let first = forecaster.forecast(&candles).unwrap();
        let second = forecaster.forecast(&candles).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_flat_window() {
        let forecaster = ModelForecaster::new(persistence_model(5, None));
        let mut candles = ramp(5, 100);
        for c in candles.iter_mut() {
            c.close = dec!(100);
        }
        let forecast = forecaster.forecast(&candles).unwrap();
        assert_eq!(forecast.predicted_value, dec!(100));
    }

    #[test]
    fn test_confidence_from_residual() {
        assert_eq!(persistence_model(5, Some(0.05)).confidence(), dec!(0.8));
        assert_eq!(persistence_model(5, Some(1.0)).confidence(), Decimal::ZERO);
        assert_eq!(persistence_model(5, None).confidence(), dec!(0.5));
    }

    #[test]
    fn test_save_and_load_artifact() {
        let model = persistence_model(5, Some(0.1));
        let path = std::env::temp_dir()
            .join(format!("forecastbot-{}", uuid::Uuid::new_v4()))
            .join("model.json");

        model.save(&path).unwrap();
        let loaded = LinearModel::load(&path).unwrap();
        assert_eq!(loaded, model);

        let forecaster = ModelForecaster::from_path(&path, 5);
        assert!(forecaster.is_loaded());

        // Wrong sequence length leaves the forecaster unloaded
        let forecaster = ModelForecaster::from_path(&path, 60);
        assert!(!forecaster.is_loaded());

        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_load_rejects_mismatched_weights() {
        let mut model = persistence_model(5, None);
        model.weights.pop();
        let path = std::env::temp_dir().join(format!("forecastbot-{}.json", uuid::Uuid::new_v4()));
        model.save(&path).unwrap();

        assert!(matches!(
            LinearModel::load(&path),
            Err(ForecastError::ModelUnavailable(_))
        ));
        std::fs::remove_file(&path).ok();
    }
}
