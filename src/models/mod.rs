use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// OHLCV candlestick for one time bucket. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// Model output for one cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub as_of: DateTime<Utc>,
    pub predicted_value: Decimal,
    /// In [0, 1]
    pub confidence: Decimal,
}

impl Forecast {
    /// `(predicted - price) / price`, or None for a non-positive price
    pub fn expected_return(&self, price: Decimal) -> Option<Decimal> {
        if price <= Decimal::ZERO {
            return None;
        }
        Some((self.predicted_value - price) / price)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    /// Forecast points below the current price by at least the threshold
    Reversal,
    Manual,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "StopLoss",
            ExitReason::TakeProfit => "TakeProfit",
            ExitReason::Reversal => "Reversal",
            ExitReason::Manual => "Manual",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "StopLoss" => Some(ExitReason::StopLoss),
            "TakeProfit" => Some(ExitReason::TakeProfit),
            "Reversal" => Some(ExitReason::Reversal),
            "Manual" => Some(ExitReason::Manual),
            _ => None,
        }
    }

    /// Risk-driven exits bypass admission checks.
    pub fn is_forced(&self) -> bool {
        matches!(self, ExitReason::StopLoss | ExitReason::TakeProfit)
    }
}

/// Long position on the trading pair.
///
/// `size` is the fraction of tradable balance committed (0 < size <= 1);
/// `quantity` is the filled amount of the base asset backing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub symbol: String,
    pub entry_order_id: String,
    pub entry_price: Decimal,
    pub size: Decimal,
    pub quantity: Decimal,
    pub opened_at: DateTime<Utc>,
    pub stop_loss_price: Decimal,
    pub take_profit_price: Decimal,
    pub status: PositionStatus,
    pub close_price: Option<Decimal>,
    pub closed_at: Option<DateTime<Utc>>,
    /// Accumulates across partial closes; final once Closed
    pub realized_pnl: Option<Decimal>,
    pub exit_reason: Option<ExitReason>,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    pub fn unrealized_pnl(&self, current_price: Decimal) -> Decimal {
        (current_price - self.entry_price) * self.quantity
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    OpenLong,
    CloseAll,
    ClosePosition(Uuid),
    Hold,
}

/// A proposed trading action. Transient; persisted only inside audit records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub kind: ActionKind,
    pub size: Option<Decimal>,
    pub reason: String,
    pub exit_reason: Option<ExitReason>,
}

impl Action {
    pub fn open_long(size: Decimal, reason: impl Into<String>) -> Self {
        Self {
            kind: ActionKind::OpenLong,
            size: Some(size),
            reason: reason.into(),
            exit_reason: None,
        }
    }

    pub fn close(position_id: Uuid, exit_reason: ExitReason, reason: impl Into<String>) -> Self {
        Self {
            kind: ActionKind::ClosePosition(position_id),
            size: None,
            reason: reason.into(),
            exit_reason: Some(exit_reason),
        }
    }

    pub fn close_all(reason: impl Into<String>) -> Self {
        Self {
            kind: ActionKind::CloseAll,
            size: None,
            reason: reason.into(),
            exit_reason: Some(ExitReason::Manual),
        }
    }

    pub fn hold(reason: impl Into<String>) -> Self {
        Self {
            kind: ActionKind::Hold,
            size: None,
            reason: reason.into(),
            exit_reason: None,
        }
    }

    pub fn is_forced(&self) -> bool {
        self.exit_reason.map(|r| r.is_forced()).unwrap_or(false)
    }

    pub fn is_close(&self) -> bool {
        matches!(self.kind, ActionKind::ClosePosition(_) | ActionKind::CloseAll)
    }
}

/// Derived view over the ledger; never stored on its own.
#[derive(Debug, Clone)]
pub struct PortfolioState {
    pub open_positions: Vec<Position>,
    pub available_balance: Decimal,
}

impl PortfolioState {
    pub fn new(open_positions: Vec<Position>, available_balance: Decimal) -> Self {
        Self {
            open_positions,
            available_balance,
        }
    }

    /// Sum of `size` over open positions
    pub fn exposure(&self) -> Decimal {
        self.open_positions.iter().map(|p| p.size).sum()
    }

    pub fn open_count(&self) -> usize {
        self.open_positions.len()
    }

    pub fn has_open_position(&self) -> bool {
        !self.open_positions.is_empty()
    }
}

/// "DOGE/IDR" -> ("DOGE", "IDR")
pub fn split_symbol(symbol: &str) -> Option<(&str, &str)> {
    let (base, quote) = symbol.split_once('/')?;
    if base.is_empty() || quote.is_empty() {
        return None;
    }
    Some((base, quote))
}
