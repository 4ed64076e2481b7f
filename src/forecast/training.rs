use chrono::Utc;

use super::linear::{LinearModel, WindowScale};
use crate::error::ForecastError;
use crate::market_data::features::closes;
use crate::models::Candle;

#[derive(Debug, Clone)]
pub struct TrainingOptions {
    pub sequence_length: usize,
    /// L2 penalty on the weights (not the bias)
    pub ridge: f64,
}

impl Default for TrainingOptions {
    fn default() -> Self {
        Self {
            sequence_length: 60,
            ridge: 1e-3,
        }
    }
}

/// Sliding windows of scaled closes and the scaled next close
fn build_dataset(closes: &[f64], sequence_length: usize) -> (Vec<Vec<f64>>, Vec<f64>) {
    let mut inputs = Vec::new();
    let mut targets = Vec::new();

    for end in sequence_length..closes.len() {
        let window = &closes[end - sequence_length..end];
        let scale = WindowScale::fit(window);
        inputs.push(window.iter().map(|c| scale.scale(*c)).collect());
        targets.push(scale.scale(closes[end]));
    }

    (inputs, targets)
}

/// Fit a ridge-regularized linear model on the closes of `candles`.
///
/// Needs at least `sequence_length + 1` candles (one training sample).
pub fn train(candles: &[Candle], options: &TrainingOptions) -> Result<LinearModel, ForecastError> {
    let n = options.sequence_length;
    let closes = closes(candles);
    if n == 0 || closes.len() <= n {
        return Err(ForecastError::InsufficientData {
            needed: n + 1,
            got: closes.len(),
        });
    }

    let (inputs, targets) = build_dataset(&closes, n);

    // Normal equations over [x_1..x_n, 1]
    let dim = n + 1;
    let mut xtx = vec![vec![0.0; dim]; dim];
    let mut xty = vec![0.0; dim];
    for (x, y) in inputs.iter().zip(&targets) {
        for i in 0..dim {
            let xi = if i < n { x[i] } else { 1.0 };
            xty[i] += xi * y;
            for j in 0..dim {
                let xj = if j < n { x[j] } else { 1.0 };
                xtx[i][j] += xi * xj;
            }
        }
    }
    for (i, row) in xtx.iter_mut().enumerate().take(n) {
        row[i] += options.ridge;
    }

    let solution = solve(xtx, xty).ok_or_else(|| {
        ForecastError::ModelUnavailable("training system is singular".to_string())
    })?;

    let mut model = LinearModel {
        sequence_length: n,
        weights: solution[..n].to_vec(),
        bias: solution[n],
        residual_std: None,
        trained_at: Utc::now(),
        samples: inputs.len(),
    };

    let sse: f64 = inputs
        .iter()
        .zip(&targets)
        .map(|(x, y)| (model.predict_scaled(x) - y).powi(2))
        .sum();
    model.residual_std = Some((sse / inputs.len() as f64).sqrt());

    tracing::info!(
        "Trained linear model on {} samples (residual std {:.4})",
        model.samples,
        model.residual_std.unwrap_or_default()
    );

    Ok(model)
}

/// Gaussian elimination with partial pivoting
fn solve(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Option<Vec<f64>> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))?;
        if a[pivot][col].abs() < 1e-12 {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);

        for row in col + 1..n {
            let factor = a[row][col] / a[col][col];
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = (row + 1..n).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    Some(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forecast::{Forecaster, ModelForecaster};
    use chrono::Duration;
    use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
    use rust_decimal::Decimal;

    fn candles_from(closes: &[f64]) -> Vec<Candle> {
        let now = Utc::now();
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let price = Decimal::from_f64(*c).unwrap();
                Candle {
                    symbol: "DOGE/IDR".to_string(),
                    timestamp: now - Duration::hours((closes.len() - i) as i64),
                    open: price,
                    high: price,
                    low: price,
                    close: price,
                    volume: Decimal::ONE,
                }
            })
            .collect()
    }

    #[test]
    fn test_solve_small_system() {
        // 2x + y = 5, x + 3y = 10
        let x = solve(vec![vec![2.0, 1.0], vec![1.0, 3.0]], vec![5.0, 10.0]).unwrap();
        assert!((x[0] - 1.0).abs() < 1e-9);
        assert!((x[1] - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_solve_singular() {
        assert!(solve(vec![vec![1.0, 2.0], vec![2.0, 4.0]], vec![1.0, 2.0]).is_none());
    }

    #[test]
    fn test_train_requires_enough_candles() {
        let options = TrainingOptions {
            sequence_length: 10,
            ridge: 1e-3,
        };
        let result = train(&candles_from(&[1.0; 10]), &options);
        assert_eq!(
            result,
            Err(ForecastError::InsufficientData { needed: 11, got: 10 })
        );
    }

    #[test]
    fn test_trained_model_tracks_ramp() {
        let closes: Vec<f64> = (0..200).map(|i| 1000.0 + 2.0 * i as f64).collect();
        let options = TrainingOptions {
            sequence_length: 10,
            ridge: 1e-6,
        };
        let model = train(&candles_from(&closes), &options).unwrap();

        assert_eq!(model.samples, 190);
        assert!(model.residual_std.unwrap() < 0.01);

        // Next value after a ramp ending at 1398 is 1400
        let forecaster = ModelForecaster::new(model);
        let forecast = forecaster.forecast(&candles_from(&closes)).unwrap();
        let predicted = forecast.predicted_value.to_f64().unwrap();
        assert!((predicted - 1400.0).abs() < 1.0, "predicted {}", predicted);
        assert!(forecast.confidence > Decimal::new(9, 1));
    }
}
