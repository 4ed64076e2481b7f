use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::exchange::{ExchangeClient, OrderSide, OrderState, OrderStatus};
use crate::error::ExecutionError;
use crate::models::{Action, ActionKind, Candle, Position};

/// Bounded retry with exponential backoff for transient exchange failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Status checks before a working order is cancelled
    pub status_polls: u32,
    pub poll_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            status_polls: 5,
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// No sleeping; for tests and backtests
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            status_polls: 3,
            poll_interval: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (1-based): base * 2^(retry-1), capped
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Confirmed execution of one order, possibly partial
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillResult {
    pub order_id: String,
    pub side: OrderSide,
    pub requested_quantity: Decimal,
    pub filled_quantity: Decimal,
    pub average_price: Decimal,
    pub filled_at: DateTime<Utc>,
}

impl FillResult {
    pub fn is_complete(&self) -> bool {
        self.filled_quantity >= self.requested_quantity
    }

    /// filled / requested, in (0, 1]
    pub fn fill_ratio(&self) -> Decimal {
        if self.requested_quantity.is_zero() {
            return Decimal::ZERO;
        }
        (self.filled_quantity / self.requested_quantity).min(Decimal::ONE)
    }
}

/// A concrete exchange order derived from an action
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub client_order_id: Uuid,
}

/// Market context needed to size an order
#[derive(Debug, Clone)]
pub struct OrderContext<'a> {
    pub symbol: &'a str,
    pub price: Decimal,
    pub available_balance: Decimal,
    /// Target of a ClosePosition action
    pub position: Option<&'a Position>,
}

/// Translates admitted actions into exchange orders and reports fills.
///
/// Never touches position state; the caller records confirmed fills.
pub struct ExecutionGateway {
    client: Arc<dyn ExchangeClient>,
    policy: RetryPolicy,
}

impl ExecutionGateway {
    pub fn new(client: Arc<dyn ExchangeClient>, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    pub fn client(&self) -> &Arc<dyn ExchangeClient> {
        &self.client
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Build the order for an action. OpenLong buys `balance * size / price`
    /// of the base asset; ClosePosition sells the position's full quantity.
    pub fn translate(&self, action: &Action, ctx: &OrderContext<'_>) -> Result<OrderRequest, ExecutionError> {
        let (side, quantity) = match &action.kind {
            ActionKind::OpenLong => {
                let size = action
                    .size
                    .ok_or_else(|| ExecutionError::Rejected("open without a size".to_string()))?;
                if ctx.price <= Decimal::ZERO {
                    return Err(ExecutionError::Rejected(format!(
                        "cannot size order at price {}",
                        ctx.price
                    )));
                }
                let quantity = (ctx.available_balance * size / ctx.price).round_dp(8);
                (OrderSide::Buy, quantity)
            }
            ActionKind::ClosePosition(id) => {
                let position = ctx
                    .position
                    .filter(|p| p.id == *id)
                    .ok_or_else(|| ExecutionError::Rejected(format!("position {} not supplied", id)))?;
                (OrderSide::Sell, position.quantity)
            }
            ActionKind::CloseAll | ActionKind::Hold => {
                return Err(ExecutionError::Rejected(format!(
                    "{:?} is not an order",
                    action.kind
                )));
            }
        };

        if quantity <= Decimal::ZERO {
            return Err(ExecutionError::Rejected(format!(
                "order quantity {} is not positive",
                quantity
            )));
        }

        Ok(OrderRequest {
            symbol: ctx.symbol.to_string(),
            side,
            quantity,
            client_order_id: Uuid::new_v4(),
        })
    }

    pub async fn submit(
        &self,
        action: &Action,
        ctx: &OrderContext<'_>,
    ) -> Result<FillResult, ExecutionError> {
        let request = self.translate(action, ctx)?;
        self.execute(&request, ctx.price).await
    }

    /// Place an order and wait for it to settle.
    ///
    /// The client order id is reused across retries. A working order that has
    /// not settled after the last status poll is cancelled and whatever filled
    /// is reported. Once the exchange has accepted the order, a status that
    /// cannot be confirmed is reported as `Unresolved`, never as a failure to
    /// place.
    pub async fn execute(
        &self,
        request: &OrderRequest,
        reference_price: Decimal,
    ) -> Result<FillResult, ExecutionError> {
        let order_id = self
            .with_retry("place order", || {
                self.client.place_order(
                    &request.symbol,
                    request.side,
                    request.quantity,
                    request.client_order_id,
                )
            })
            .await?;

        tracing::info!(
            "Placed {} order {} for {} {}",
            request.side.as_str(),
            order_id,
            request.quantity,
            request.symbol
        );

        for poll in 1..=self.policy.status_polls.max(1) {
            if let Some(fill) = self.check(request, &order_id, reference_price).await? {
                return Ok(fill);
            }
            tracing::debug!("Order {} still working after poll {}", order_id, poll);
            tokio::time::sleep(self.policy.poll_interval).await;
        }

        tracing::warn!(
            "Order {} not settled after {} polls, cancelling",
            order_id,
            self.policy.status_polls
        );
        self.cancel_and_check(request, &order_id, reference_price).await
    }

    /// Settle an order left unresolved by an earlier `execute`.
    ///
    /// A still-working order is cancelled first. `Unresolved` again means the
    /// exchange still cannot confirm it; any other error means it ended
    /// without a fill.
    pub async fn reconcile(
        &self,
        request: &OrderRequest,
        order_id: &str,
        reference_price: Decimal,
    ) -> Result<FillResult, ExecutionError> {
        if let Some(fill) = self.check(request, order_id, reference_price).await? {
            return Ok(fill);
        }
        self.cancel_and_check(request, order_id, reference_price).await
    }

    async fn cancel_and_check(
        &self,
        request: &OrderRequest,
        order_id: &str,
        reference_price: Decimal,
    ) -> Result<FillResult, ExecutionError> {
        if let Err(e) = self
            .with_retry("cancel order", || self.client.cancel_order(&request.symbol, order_id))
            .await
        {
            tracing::warn!("Failed to cancel order {}: {}", order_id, e);
        }

        match self.check(request, order_id, reference_price).await? {
            Some(fill) => Ok(fill),
            None => Err(self.unresolved(request, order_id, "still working after cancel request")),
        }
    }

    /// One status lookup. `None` while the order is still working.
    async fn check(
        &self,
        request: &OrderRequest,
        order_id: &str,
        reference_price: Decimal,
    ) -> Result<Option<FillResult>, ExecutionError> {
        let status = self
            .with_retry("order status", || {
                self.client.get_order_status(&request.symbol, order_id)
            })
            .await
            .map_err(|e| self.unresolved(request, order_id, e))?;

        match status.state {
            OrderState::Filled => Ok(Some(self.fill(request, &status, reference_price))),
            OrderState::Rejected => Err(ExecutionError::Rejected(format!(
                "order {} rejected by exchange",
                order_id
            ))),
            OrderState::Cancelled => self.settle_cancelled(request, &status, reference_price).map(Some),
            OrderState::Open | OrderState::PartiallyFilled => {
                tracing::debug!(
                    "Order {} working: {}/{} filled",
                    order_id,
                    status.filled_quantity,
                    status.requested_quantity
                );
                Ok(None)
            }
        }
    }

    fn unresolved(&self, request: &OrderRequest, order_id: &str, reason: impl std::fmt::Display) -> ExecutionError {
        tracing::error!(
            "Order {} ({}) outcome unknown: {}",
            order_id,
            request.client_order_id,
            reason
        );
        ExecutionError::Unresolved {
            order_id: order_id.to_string(),
            client_order_id: request.client_order_id,
            reason: reason.to_string(),
        }
    }

    fn settle_cancelled(
        &self,
        request: &OrderRequest,
        status: &OrderStatus,
        reference_price: Decimal,
    ) -> Result<FillResult, ExecutionError> {
        if status.filled_quantity > Decimal::ZERO {
            return Ok(self.fill(request, status, reference_price));
        }
        Err(ExecutionError::Rejected(format!(
            "order {} cancelled without fill",
            status.order_id
        )))
    }

    fn fill(&self, request: &OrderRequest, status: &OrderStatus, reference_price: Decimal) -> FillResult {
        let filled_quantity = if status.state == OrderState::Filled && status.filled_quantity.is_zero() {
            request.quantity
        } else {
            status.filled_quantity.min(request.quantity)
        };

        let fill = FillResult {
            order_id: status.order_id.clone(),
            side: request.side,
            requested_quantity: request.quantity,
            filled_quantity,
            average_price: status.average_price.unwrap_or(reference_price),
            filled_at: Utc::now(),
        };

        if fill.is_complete() {
            tracing::info!(
                "Order {} filled: {} @ {}",
                fill.order_id,
                fill.filled_quantity,
                fill.average_price
            );
        } else {
            tracing::warn!(
                "Order {} partially filled: {}/{} @ {}",
                fill.order_id,
                fill.filled_quantity,
                fill.requested_quantity,
                fill.average_price
            );
        }

        fill
    }

    pub async fn available_balance(&self, asset: &str) -> Result<Decimal, ExecutionError> {
        self.with_retry("balance", || self.client.get_balance(asset))
            .await
    }

    pub async fn last_price(&self, symbol: &str) -> Result<Decimal, ExecutionError> {
        self.with_retry("last price", || self.client.get_last_price(symbol))
            .await
    }

    pub async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, ExecutionError> {
        self.with_retry("ohlcv", || self.client.fetch_ohlcv(symbol, timeframe, limit))
            .await
    }

    async fn with_retry<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, ExecutionError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExecutionError>>,
    {
        let mut retry = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && retry < self.policy.max_retries => {
                    retry += 1;
                    let delay = self.policy.delay_for(retry);
                    tracing::warn!(
                        "{} failed: {}, retrying in {:?} (retry {}/{})",
                        operation,
                        e,
                        delay,
                        retry,
                        self.policy.max_retries
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if e.is_transient() {
                        tracing::warn!(
                            "{} failed after {} retries: {}",
                            operation,
                            self.policy.max_retries,
                            e
                        );
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::PaperExchange;
    use crate::models::{ExitReason, PositionStatus};
    use rust_decimal_macros::dec;

    const SYMBOL: &str = "DOGE/IDR";

    fn paper() -> Arc<PaperExchange> {
        let exchange = PaperExchange::new("IDR", dec!(1000000));
        exchange.set_price(SYMBOL, dec!(2000));
        Arc::new(exchange)
    }

    fn ctx(balance: Decimal) -> OrderContext<'static> {
        OrderContext {
            symbol: SYMBOL,
            price: dec!(2000),
            available_balance: balance,
            position: None,
        }
    }

    fn held_position(quantity: Decimal) -> Position {
        Position {
            id: Uuid::new_v4(),
            symbol: SYMBOL.to_string(),
            entry_order_id: "paper-1".to_string(),
            entry_price: dec!(2000),
            size: dec!(0.1),
            quantity,
            opened_at: Utc::now(),
            stop_loss_price: dec!(1900),
            take_profit_price: dec!(2200),
            status: PositionStatus::Open,
            close_price: None,
            closed_at: None,
            realized_pnl: None,
            exit_reason: None,
        }
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(3),
            status_polls: 1,
            poll_interval: Duration::ZERO,
        };

        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(4), Duration::from_secs(3));
        assert_eq!(policy.delay_for(40), Duration::from_secs(3));
    }

    #[test]
    fn test_translate_open_long() {
        let gateway = ExecutionGateway::new(paper(), RetryPolicy::immediate(3));
        let action = Action::open_long(dec!(0.1), "signal");

        let request = gateway.translate(&action, &ctx(dec!(1000000))).unwrap();
        assert_eq!(request.side, OrderSide::Buy);
        assert_eq!(request.quantity, dec!(50));
    }

    #[test]
    fn test_translate_rejects_non_orders() {
        let gateway = ExecutionGateway::new(paper(), RetryPolicy::immediate(3));

        let hold = gateway.translate(&Action::hold("nothing"), &ctx(dec!(1000)));
        assert!(matches!(hold, Err(ExecutionError::Rejected(_))));

        // Close without the target position in context
        let close = Action::close(Uuid::new_v4(), ExitReason::Reversal, "signal");
        let result = gateway.translate(&close, &ctx(dec!(1000)));
        assert!(matches!(result, Err(ExecutionError::Rejected(_))));

        // Nothing to spend
        let open = Action::open_long(dec!(0.1), "signal");
        let result = gateway.translate(&open, &ctx(Decimal::ZERO));
        assert!(matches!(result, Err(ExecutionError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_submit_open_fills() {
        let exchange = paper();
        let gateway = ExecutionGateway::new(exchange.clone(), RetryPolicy::immediate(3));

        let fill = gateway
            .submit(&Action::open_long(dec!(0.1), "signal"), &ctx(dec!(1000000)))
            .await
            .unwrap();

        assert!(fill.is_complete());
        assert_eq!(fill.filled_quantity, dec!(50));
        assert_eq!(fill.average_price, dec!(2000));
        assert_eq!(exchange.balance("DOGE"), dec!(50));
        assert_eq!(exchange.balance("IDR"), dec!(900000));
    }

    #[tokio::test]
    async fn test_transient_failures_within_bound() {
        let exchange = paper();
        exchange.fail_next_orders(vec![
            ExecutionError::Transient("timeout".to_string()),
            ExecutionError::Transient("rate limited".to_string()),
            ExecutionError::Transient("502".to_string()),
        ]);
        let gateway = ExecutionGateway::new(exchange.clone(), RetryPolicy::immediate(3));

        let fill = gateway
            .submit(&Action::open_long(dec!(0.1), "signal"), &ctx(dec!(1000000)))
            .await
            .unwrap();

        assert_eq!(fill.filled_quantity, dec!(50));
        assert_eq!(exchange.place_calls(), 4);
        assert_eq!(exchange.order_count(), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_exhaust_retries() {
        let exchange = paper();
        exchange.fail_next_orders(vec![
            ExecutionError::Transient("timeout".to_string());
            4
        ]);
        let gateway = ExecutionGateway::new(exchange.clone(), RetryPolicy::immediate(3));

        let result = gateway
            .submit(&Action::open_long(dec!(0.1), "signal"), &ctx(dec!(1000000)))
            .await;

        assert!(matches!(result, Err(ExecutionError::Transient(_))));
        assert_eq!(exchange.order_count(), 0);
        assert_eq!(exchange.balance("IDR"), dec!(1000000));
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let exchange = paper();
        exchange.fail_next_orders(vec![ExecutionError::Rejected(
            "insufficient balance".to_string(),
        )]);
        let gateway = ExecutionGateway::new(exchange.clone(), RetryPolicy::immediate(3));

        let result = gateway
            .submit(&Action::open_long(dec!(0.1), "signal"), &ctx(dec!(1000000)))
            .await;

        assert!(matches!(result, Err(ExecutionError::Rejected(_))));
        assert_eq!(exchange.place_calls(), 1);
    }

    #[tokio::test]
    async fn test_partial_fill_is_cancelled_and_reported() {
        let exchange = paper();
        exchange.set_fill_ratio(dec!(0.4));
        let gateway = ExecutionGateway::new(exchange.clone(), RetryPolicy::immediate(3));

        let fill = gateway
            .submit(&Action::open_long(dec!(0.1), "signal"), &ctx(dec!(1000000)))
            .await
            .unwrap();

        assert!(!fill.is_complete());
        assert_eq!(fill.filled_quantity, dec!(20));
        assert_eq!(fill.fill_ratio(), dec!(0.4));

        let status = exchange
            .get_order_status(SYMBOL, &fill.order_id)
            .await
            .unwrap();
        assert_eq!(status.state, OrderState::Cancelled);
    }

    #[tokio::test]
    async fn test_status_timeout_after_fill_is_unresolved() {
        let exchange = paper();
        exchange.set_status_outage(true);
        let gateway = ExecutionGateway::new(exchange.clone(), RetryPolicy::immediate(3));

        let request = gateway
            .translate(&Action::open_long(dec!(0.1), "signal"), &ctx(dec!(1000000)))
            .unwrap();
        let result = gateway.execute(&request, dec!(2000)).await;

        // The order filled on the exchange even though no status came back
        let order_id = match result {
            Err(ExecutionError::Unresolved {
                order_id,
                client_order_id,
                ..
            }) => {
                assert_eq!(client_order_id, request.client_order_id);
                order_id
            }
            other => panic!("expected unresolved order, got {:?}", other),
        };
        assert_eq!(exchange.balance("DOGE"), dec!(50));

        // Still down: stays unresolved
        let again = gateway.reconcile(&request, &order_id, dec!(2000)).await;
        assert!(matches!(again, Err(ExecutionError::Unresolved { .. })));

        exchange.set_status_outage(false);
        let fill = gateway.reconcile(&request, &order_id, dec!(2000)).await.unwrap();
        assert!(fill.is_complete());
        assert_eq!(fill.filled_quantity, dec!(50));
        assert_eq!(exchange.order_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_cancel_keeps_order_unresolved() {
        let exchange = paper();
        exchange.set_fill_ratio(dec!(0.4));
        exchange.set_cancel_outage(true);
        let gateway = ExecutionGateway::new(exchange.clone(), RetryPolicy::immediate(3));

        let request = gateway
            .translate(&Action::open_long(dec!(0.1), "signal"), &ctx(dec!(1000000)))
            .unwrap();
        let result = gateway.execute(&request, dec!(2000)).await;
        let order_id = match result {
            Err(ExecutionError::Unresolved { order_id, .. }) => order_id,
            other => panic!("expected unresolved order, got {:?}", other),
        };

        exchange.set_cancel_outage(false);
        let fill = gateway.reconcile(&request, &order_id, dec!(2000)).await.unwrap();
        assert_eq!(fill.filled_quantity, dec!(20));

        let status = exchange.get_order_status(SYMBOL, &order_id).await.unwrap();
        assert_eq!(status.state, OrderState::Cancelled);
    }

    #[tokio::test]
    async fn test_close_sells_position_quantity() {
        let exchange = paper();
        exchange.deposit("DOGE", dec!(50));
        let gateway = ExecutionGateway::new(exchange.clone(), RetryPolicy::immediate(3));

        let position = held_position(dec!(50));
        let action = Action::close(position.id, ExitReason::TakeProfit, "target");
        let context = OrderContext {
            position: Some(&position),
            ..ctx(dec!(1000000))
        };

        let fill = gateway.submit(&action, &context).await.unwrap();
        assert_eq!(fill.side, OrderSide::Sell);
        assert_eq!(fill.filled_quantity, dec!(50));
        assert_eq!(exchange.balance("DOGE"), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_balance_is_retried() {
        let exchange = paper();
        let gateway = ExecutionGateway::new(exchange, RetryPolicy::immediate(3));
        assert_eq!(gateway.available_balance("IDR").await.unwrap(), dec!(1000000));
    }
}
