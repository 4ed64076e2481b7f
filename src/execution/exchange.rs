use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ExecutionError;
use crate::models::Candle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderState {
    /// No further fills will happen
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Cancelled | OrderState::Rejected
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderStatus {
    pub order_id: String,
    pub state: OrderState,
    pub requested_quantity: Decimal,
    pub filled_quantity: Decimal,
    pub average_price: Option<Decimal>,
}

/// Narrow capability interface over one exchange.
///
/// `client_order_id` lets an adapter recognise a resubmitted order so a retry
/// after a lost response never opens a second order.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    fn name(&self) -> &str;

    async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        client_order_id: Uuid,
    ) -> Result<String, ExecutionError>;

    async fn get_order_status(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<OrderStatus, ExecutionError>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExecutionError>;

    /// Free balance of one asset
    async fn get_balance(&self, asset: &str) -> Result<Decimal, ExecutionError>;

    async fn get_last_price(&self, symbol: &str) -> Result<Decimal, ExecutionError>;

    /// Most recent `limit` candles, oldest first
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, ExecutionError>;
}
