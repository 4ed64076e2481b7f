use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::{Action, ExitReason, Forecast, PortfolioState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionParams {
    /// Minimum |expected return| that counts as a signal
    pub prediction_threshold: Decimal,
    /// Confidence must be strictly above this to open
    pub min_confidence: Decimal,
    /// Size requested for new positions
    pub position_size: Decimal,
}

impl Default for DecisionParams {
    fn default() -> Self {
        Self {
            prediction_threshold: Decimal::new(2, 2), // 2%
            min_confidence: Decimal::new(3, 1),
            position_size: Decimal::new(1, 1),
        }
    }
}

/// Turn a forecast into signal-driven proposals.
///
/// - OpenLong iff nothing is open, expected return >= threshold and
///   confidence > min_confidence
/// - ClosePosition (Reversal) for every open position iff expected return
///   <= -threshold
/// - otherwise a single Hold
///
/// Stop-loss and take-profit exits come from the risk scan, not from here.
pub fn decide(
    forecast: &Forecast,
    market_price: Decimal,
    portfolio: &PortfolioState,
    params: &DecisionParams,
) -> Vec<Action> {
    let Some(expected_return) = forecast.expected_return(market_price) else {
        return vec![Action::hold(format!("no usable market price ({})", market_price))];
    };

    let threshold = params.prediction_threshold;

    if expected_return <= -threshold && portfolio.has_open_position() {
        return portfolio
            .open_positions
            .iter()
            .map(|position| {
                Action::close(
                    position.id,
                    ExitReason::Reversal,
                    format!(
                        "Reversal: expected return {} <= -{}",
                        expected_return.round_dp(4),
                        threshold
                    ),
                )
            })
            .collect();
    }

    if expected_return >= threshold && !portfolio.has_open_position() {
        if forecast.confidence > params.min_confidence {
            return vec![Action::open_long(
                params.position_size,
                format!(
                    "Expected return {} >= {} with confidence {}",
                    expected_return.round_dp(4),
                    threshold,
                    forecast.confidence
                ),
            )];
        }
        return vec![Action::hold(format!(
            "Confidence {} not above {}",
            forecast.confidence, params.min_confidence
        ))];
    }

    vec![Action::hold(format!(
        "Expected return {} within threshold {}",
        expected_return.round_dp(4),
        threshold
    ))]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActionKind, Position, PositionStatus};
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn forecast(predicted: Decimal, confidence: Decimal) -> Forecast {
        Forecast {
            as_of: Utc::now(),
            predicted_value: predicted,
            confidence,
        }
    }

    fn open_position() -> Position {
        Position {
            id: Uuid::new_v4(),
            symbol: "DOGE/IDR".to_string(),
            entry_order_id: "1".to_string(),
            entry_price: dec!(100),
            size: dec!(0.1),
            quantity: dec!(10),
            opened_at: Utc::now(),
            stop_loss_price: dec!(95),
            take_profit_price: dec!(110),
            status: PositionStatus::Open,
            close_price: None,
            closed_at: None,
            realized_pnl: None,
            exit_reason: None,
        }
    }

    fn empty() -> PortfolioState {
        PortfolioState::new(vec![], dec!(1000))
    }

    #[test]
    fn test_open_on_strong_forecast() {
        let actions = decide(
            &forecast(dec!(105), dec!(0.8)),
            dec!(100),
            &empty(),
            &DecisionParams::default(),
        );
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind, ActionKind::OpenLong);
        assert_eq!(actions[0].size, Some(dec!(0.1)));
    }

    #[test]
    fn test_threshold_is_inclusive() {
        // Exactly 2% up
        let actions = decide(
            &forecast(dec!(102), dec!(0.8)),
            dec!(100),
            &empty(),
            &DecisionParams::default(),
        );
        assert_eq!(actions[0].kind, ActionKind::OpenLong);

        // Just under
        let actions = decide(
            &forecast(dec!(101.99), dec!(0.8)),
            dec!(100),
            &empty(),
            &DecisionParams::default(),
        );
        assert_eq!(actions[0].kind, ActionKind::Hold);
    }

    #[test]
    fn test_confidence_must_exceed_minimum() {
        let params = DecisionParams::default();
        let actions = decide(&forecast(dec!(110), dec!(0.3)), dec!(100), &empty(), &params);
        assert_eq!(actions[0].kind, ActionKind::Hold);

        let actions = decide(&forecast(dec!(110), dec!(0.31)), dec!(100), &empty(), &params);
        assert_eq!(actions[0].kind, ActionKind::OpenLong);
    }

    #[test]
    fn test_no_open_while_holding() {
        let portfolio = PortfolioState::new(vec![open_position()], dec!(1000));
        let actions = decide(
            &forecast(dec!(110), dec!(0.9)),
            dec!(100),
            &portfolio,
            &DecisionParams::default(),
        );
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind, ActionKind::Hold);
    }

    #[test]
    fn test_reversal_closes_every_open_position() {
        let first = open_position();
        let second = open_position();
        let portfolio = PortfolioState::new(vec![first.clone(), second.clone()], dec!(1000));

        let actions = decide(
            &forecast(dec!(98), dec!(0.1)),
            dec!(100),
            &portfolio,
            &DecisionParams::default(),
        );

        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].kind, ActionKind::ClosePosition(first.id));
        assert_eq!(actions[1].kind, ActionKind::ClosePosition(second.id));
        assert!(actions
            .iter()
            .all(|a| a.exit_reason == Some(ExitReason::Reversal)));
    }

    #[test]
    fn test_reversal_without_position_holds() {
        let actions = decide(
            &forecast(dec!(90), dec!(0.9)),
            dec!(100),
            &empty(),
            &DecisionParams::default(),
        );
        assert_eq!(actions[0].kind, ActionKind::Hold);
    }

    #[test]
    fn test_invalid_price_holds() {
        let actions = decide(
            &forecast(dec!(110), dec!(0.9)),
            Decimal::ZERO,
            &empty(),
            &DecisionParams::default(),
        );
        assert_eq!(actions[0].kind, ActionKind::Hold);
    }
}
