use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use super::exchange::{ExchangeClient, OrderSide, OrderState, OrderStatus};
use crate::error::ExecutionError;
use crate::models::{split_symbol, Candle, Position};

const MAX_STORED_CANDLES: usize = 5000;

#[derive(Default)]
struct PaperState {
    balances: HashMap<String, Decimal>,
    prices: HashMap<String, Decimal>,
    candles: HashMap<String, Vec<Candle>>,
    orders: HashMap<String, OrderStatus>,
    by_client_id: HashMap<Uuid, String>,
    next_order: u64,
    /// Failures returned by the next place_order calls, in order
    injected: VecDeque<ExecutionError>,
    place_calls: usize,
    status_outage: bool,
    cancel_outage: bool,
}

/// Simulated exchange for paper trading and backtests.
///
/// Market orders fill immediately at the last known price, scaled by the
/// configured fill ratio. A partially filled order stays working until it is
/// cancelled. Market data comes from an upstream exchange when one is given,
/// otherwise from candles pushed in with [`PaperExchange::push_candle`].
pub struct PaperExchange {
    state: Mutex<PaperState>,
    fill_ratio: Mutex<Decimal>,
    upstream: Option<Arc<dyn ExchangeClient>>,
}

impl PaperExchange {
    pub fn new(quote_asset: &str, initial_balance: Decimal) -> Self {
        let mut state = PaperState::default();
        state.balances.insert(quote_asset.to_string(), initial_balance);
        Self {
            state: Mutex::new(state),
            fill_ratio: Mutex::new(Decimal::ONE),
            upstream: None,
        }
    }

    /// Simulated fills against real market data
    pub fn with_market_data(mut self, upstream: Arc<dyn ExchangeClient>) -> Self {
        self.upstream = Some(upstream);
        self
    }

    fn state(&self) -> Result<MutexGuard<'_, PaperState>, ExecutionError> {
        self.state
            .lock()
            .map_err(|_| ExecutionError::Transient("paper exchange state poisoned".to_string()))
    }

    pub fn set_price(&self, symbol: &str, price: Decimal) {
        if let Ok(mut state) = self.state.lock() {
            state.prices.insert(symbol.to_string(), price);
        }
    }

    /// Feed one candle; its close becomes the last price
    pub fn push_candle(&self, candle: Candle) {
        if let Ok(mut state) = self.state.lock() {
            state.prices.insert(candle.symbol.clone(), candle.close);
            let series = state.candles.entry(candle.symbol.clone()).or_default();
            series.push(candle);
            if series.len() > MAX_STORED_CANDLES {
                let excess = series.len() - MAX_STORED_CANDLES;
                series.drain(..excess);
            }
        }
    }

    pub fn deposit(&self, asset: &str, amount: Decimal) {
        if let Ok(mut state) = self.state.lock() {
            *state.balances.entry(asset.to_string()).or_default() += amount;
        }
    }

    /// Credit the base asset held by positions recovered from the ledger, so
    /// a restarted paper session can still sell them
    pub fn seed_positions(&self, positions: &[Position]) {
        for position in positions.iter().filter(|p| p.is_open()) {
            match split_symbol(&position.symbol) {
                Some((base, _)) => self.deposit(base, position.quantity),
                None => tracing::warn!(
                    "Cannot seed position {}: unknown symbol {}",
                    position.id,
                    position.symbol
                ),
            }
        }
    }

    pub fn balance(&self, asset: &str) -> Decimal {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.balances.get(asset).copied())
            .unwrap_or_default()
    }

    /// Fraction of each order that fills, in (0, 1]
    pub fn set_fill_ratio(&self, ratio: Decimal) {
        if let Ok(mut fill_ratio) = self.fill_ratio.lock() {
            *fill_ratio = ratio.clamp(Decimal::ZERO, Decimal::ONE);
        }
    }

    pub fn fail_next_orders(&self, errors: Vec<ExecutionError>) {
        if let Ok(mut state) = self.state.lock() {
            state.injected.extend(errors);
        }
    }

    /// Status lookups time out while set; orders keep filling underneath
    pub fn set_status_outage(&self, down: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.status_outage = down;
        }
    }

    pub fn set_cancel_outage(&self, down: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.cancel_outage = down;
        }
    }

    /// place_order invocations, including failed ones
    pub fn place_calls(&self) -> usize {
        self.state.lock().map(|s| s.place_calls).unwrap_or_default()
    }

    /// Orders accepted by the exchange
    pub fn order_count(&self) -> usize {
        self.state.lock().map(|s| s.orders.len()).unwrap_or_default()
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    fn name(&self) -> &str {
        "paper"
    }

    async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        client_order_id: Uuid,
    ) -> Result<String, ExecutionError> {
        let fill_ratio = self.fill_ratio.lock().map(|r| *r).unwrap_or(Decimal::ONE);
        let mut state = self.state()?;
        state.place_calls += 1;

        if let Some(err) = state.injected.pop_front() {
            return Err(err);
        }
        if let Some(existing) = state.by_client_id.get(&client_order_id) {
            return Ok(existing.clone());
        }

        let (base, quote) = split_symbol(symbol)
            .ok_or_else(|| ExecutionError::Rejected(format!("unknown symbol {}", symbol)))?;
        let price = *state
            .prices
            .get(symbol)
            .ok_or_else(|| ExecutionError::Rejected(format!("no market price for {}", symbol)))?;
        if quantity <= Decimal::ZERO {
            return Err(ExecutionError::Rejected("quantity must be positive".to_string()));
        }

        let filled = (quantity * fill_ratio).round_dp(8);
        let free = |asset: &str| state.balances.get(asset).copied().unwrap_or_default();
        match side {
            OrderSide::Buy if quantity * price > free(quote) => {
                return Err(ExecutionError::Rejected(format!(
                    "insufficient {} balance: need {}, have {}",
                    quote,
                    quantity * price,
                    free(quote)
                )));
            }
            OrderSide::Sell if quantity > free(base) => {
                return Err(ExecutionError::Rejected(format!(
                    "insufficient {} balance: need {}, have {}",
                    base,
                    quantity,
                    free(base)
                )));
            }
            _ => {}
        }

        let (debit, credit, debit_amount, credit_amount) = match side {
            OrderSide::Buy => (quote, base, filled * price, filled),
            OrderSide::Sell => (base, quote, filled, filled * price),
        };
        *state.balances.entry(debit.to_string()).or_default() -= debit_amount;
        *state.balances.entry(credit.to_string()).or_default() += credit_amount;

        state.next_order += 1;
        let order_id = format!("paper-{}", state.next_order);
        let order_state = if filled >= quantity {
            OrderState::Filled
        } else {
            OrderState::PartiallyFilled
        };
        state.orders.insert(
            order_id.clone(),
            OrderStatus {
                order_id: order_id.clone(),
                state: order_state,
                requested_quantity: quantity,
                filled_quantity: filled,
                average_price: Some(price),
            },
        );
        state.by_client_id.insert(client_order_id, order_id.clone());

        tracing::debug!(
            "Paper {} {} {} @ {} ({} filled)",
            side.as_str(),
            quantity,
            symbol,
            price,
            filled
        );

        Ok(order_id)
    }

    async fn get_order_status(
        &self,
        _symbol: &str,
        order_id: &str,
    ) -> Result<OrderStatus, ExecutionError> {
        let state = self.state()?;
        if state.status_outage {
            return Err(ExecutionError::Transient("order status timed out".to_string()));
        }
        state
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| ExecutionError::Rejected(format!("unknown order {}", order_id)))
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> Result<(), ExecutionError> {
        let mut state = self.state()?;
        if state.cancel_outage {
            return Err(ExecutionError::Transient("cancel timed out".to_string()));
        }
        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| ExecutionError::Rejected(format!("unknown order {}", order_id)))?;
        if !order.state.is_terminal() {
            order.state = OrderState::Cancelled;
        }
        Ok(())
    }

    async fn get_balance(&self, asset: &str) -> Result<Decimal, ExecutionError> {
        let state = self.state()?;
        Ok(state.balances.get(asset).copied().unwrap_or_default())
    }

    async fn get_last_price(&self, symbol: &str) -> Result<Decimal, ExecutionError> {
        if let Some(upstream) = &self.upstream {
            let price = upstream.get_last_price(symbol).await?;
            self.set_price(symbol, price);
            return Ok(price);
        }
        let state = self.state()?;
        state
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| ExecutionError::Transient(format!("no price yet for {}", symbol)))
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, ExecutionError> {
        if let Some(upstream) = &self.upstream {
            let candles = upstream.fetch_ohlcv(symbol, timeframe, limit).await?;
            if let Some(last) = candles.last() {
                self.set_price(symbol, last.close);
            }
            return Ok(candles);
        }
        let state = self.state()?;
        let series = state.candles.get(symbol).map(Vec::as_slice).unwrap_or(&[]);
        let start = series.len().saturating_sub(limit);
        Ok(series[start..].to_vec())
    }
}
