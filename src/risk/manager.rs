use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::{Action, ActionKind, ExitReason, PortfolioState, Position};

/// Risk limits applied to every proposal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Max fraction of tradable balance per trade
    pub position_size: Decimal,
    pub stop_loss_pct: Decimal,
    pub take_profit_pct: Decimal,
    pub max_positions: usize,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            position_size: Decimal::new(1, 1),    // 10% of balance
            stop_loss_pct: Decimal::new(5, 2),    // -5%
            take_profit_pct: Decimal::new(10, 2), // +10%
            max_positions: 3,
        }
    }
}

impl RiskConfig {
    pub fn stop_loss_price(&self, entry_price: Decimal) -> Decimal {
        entry_price * (Decimal::ONE - self.stop_loss_pct)
    }

    pub fn take_profit_price(&self, entry_price: Decimal) -> Decimal {
        entry_price * (Decimal::ONE + self.take_profit_pct)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectionReason {
    MaxPositionsExceeded { open: usize, max: usize },
    ExposureExceeded { requested: Decimal, exposure: Decimal },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Admitted,
    Rejected(RejectionReason),
}

impl Verdict {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Verdict::Admitted)
    }
}

/// Admission check for a proposed action. Pure; never touches state.
///
/// Rules in order, first failure wins:
/// 1. OpenLong with `max_positions` already open -> MaxPositionsExceeded
/// 2. size above `position_size`, or exposure pushed past 1.0 -> ExposureExceeded
/// 3. Closes are always admitted
///
/// An OpenLong without an explicit size is sized at `position_size`.
pub fn evaluate(proposed: &Action, state: &PortfolioState, config: &RiskConfig) -> Verdict {
    match proposed.kind {
        ActionKind::OpenLong => {
            if state.open_count() >= config.max_positions {
                return Verdict::Rejected(RejectionReason::MaxPositionsExceeded {
                    open: state.open_count(),
                    max: config.max_positions,
                });
            }

            let requested = proposed.size.unwrap_or(config.position_size);
            let exposure = state.exposure() + requested;
            if requested <= Decimal::ZERO
                || requested > config.position_size
                || exposure > Decimal::ONE
            {
                return Verdict::Rejected(RejectionReason::ExposureExceeded {
                    requested,
                    exposure,
                });
            }

            Verdict::Admitted
        }
        ActionKind::ClosePosition(_) | ActionKind::CloseAll | ActionKind::Hold => Verdict::Admitted,
    }
}

pub struct RiskManager {
    config: RiskConfig,
}

impl RiskManager {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn evaluate(&self, proposed: &Action, state: &PortfolioState) -> Verdict {
        if proposed.is_forced() {
            return Verdict::Admitted;
        }
        evaluate(proposed, state, &self.config)
    }

    /// Forced closes for every open position whose stop-loss or take-profit
    /// price has been crossed, oldest position first.
    pub fn scan_exits(&self, state: &PortfolioState, current_price: Decimal) -> Vec<Action> {
        let mut positions: Vec<&Position> = state.open_positions.iter().collect();
        positions.sort_by_key(|p| p.opened_at);

        positions
            .into_iter()
            .filter_map(|position| {
                exit_trigger(position, current_price).map(|reason| {
                    let note = match reason {
                        ExitReason::StopLoss => format!(
                            "Stop loss: price {} <= {}",
                            current_price, position.stop_loss_price
                        ),
                        _ => format!(
                            "Take profit: price {} >= {}",
                            current_price, position.take_profit_price
                        ),
                    };
                    Action::close(position.id, reason, note)
                })
            })
            .collect()
    }
}

/// Stop-loss is checked before take-profit
fn exit_trigger(position: &Position, current_price: Decimal) -> Option<ExitReason> {
    if current_price <= position.stop_loss_price {
        return Some(ExitReason::StopLoss);
    }
    if current_price >= position.take_profit_price {
        return Some(ExitReason::TakeProfit);
    }
    None
}
