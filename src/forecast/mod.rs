// Price forecasting boundary
pub mod linear;
pub mod momentum;
pub mod training;

pub use linear::{LinearModel, ModelForecaster};
pub use momentum::MomentumForecaster;
pub use training::{train, TrainingOptions};

use rust_decimal::Decimal;

use crate::error::ForecastError;
use crate::models::{Candle, Forecast};

/// Confidence reported when a model carries no uncertainty signal (0.5)
pub const DEFAULT_CONFIDENCE: Decimal = Decimal::from_parts(5, 0, 0, false, 1);

/// Maps a window of recent candles to a forecast of the next close.
///
/// Implementations are pure: the same window always yields the same forecast.
pub trait Forecaster: Send + Sync {
    fn name(&self) -> &str;

    /// Candles required per forecast
    fn sequence_length(&self) -> usize;

    fn forecast(&self, window: &[Candle]) -> Result<Forecast, ForecastError>;
}

/// The trailing `length` candles, or InsufficientData
pub fn trailing_window(window: &[Candle], length: usize) -> Result<&[Candle], ForecastError> {
    if window.len() < length {
        return Err(ForecastError::InsufficientData {
            needed: length,
            got: window.len(),
        });
    }
    Ok(&window[window.len() - length..])
}
