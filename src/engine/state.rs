use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::audit::AuditRecord;
use crate::execution::OrderRequest;
use crate::models::{Action, Candle, Forecast, PortfolioState};

/// Everything the scheduler hands to one cycle
#[derive(Debug, Clone)]
pub struct CycleInput {
    pub symbol: String,
    /// Recent candles, oldest first
    pub window: Vec<Candle>,
    pub market_price: Decimal,
    /// Free quote balance used to size opens
    pub available_balance: Decimal,
    pub now: DateTime<Utc>,
}

/// Per-cycle working data threaded through the states
#[derive(Debug, Clone)]
pub struct CycleContext {
    pub input: CycleInput,
    /// Portfolio as of the start of the cycle
    pub portfolio: PortfolioState,
    pub record: AuditRecord,
}

/// Admitted actions in execution order: forced closes, voluntary closes,
/// then at most one open
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    pub actions: Vec<Action>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// An order the exchange accepted but whose outcome could not be confirmed.
/// Reconciled at the start of the next cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct UnresolvedOrder {
    pub action: Action,
    pub request: OrderRequest,
    pub order_id: String,
    pub reference_price: Decimal,
}

/// Where a cycle currently is.
///
/// `Idle -> DataReady -> Forecasted -> Decided -> Executed -> Idle`; a failed
/// forecast goes straight from DataReady back to Idle, and a stale candle
/// window goes from DataReady to Decided with exits only.
#[derive(Debug, Clone)]
pub enum EngineState {
    Idle,
    DataReady(CycleContext),
    Forecasted(CycleContext, Forecast),
    Decided(CycleContext, Plan),
    Executed(CycleContext),
}

impl EngineState {
    pub fn name(&self) -> &'static str {
        match self {
            EngineState::Idle => "Idle",
            EngineState::DataReady(_) => "DataReady",
            EngineState::Forecasted(..) => "Forecasted",
            EngineState::Decided(..) => "Decided",
            EngineState::Executed(_) => "Executed",
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, EngineState::Idle)
    }
}
