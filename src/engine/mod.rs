// Decision engine: one trading cycle as an explicit state machine
pub mod decision;
pub mod state;

pub use decision::{decide, DecisionParams};
pub use state::{CycleContext, CycleInput, EngineState, Plan, UnresolvedOrder};

use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use crate::audit::{
    AuditRecord, AuditSink, CycleStatus, ExecutionOutcome, ExecutionRecord, ProposalRecord,
};
use crate::error::{CycleError, ExecutionError, LedgerError};
use crate::execution::{ExecutionGateway, FillResult, OrderContext};
use crate::forecast::Forecaster;
use crate::ledger::{LedgerEffect, PositionEntry, PositionLedger};
use crate::market_data::features::{FeatureSnapshot, DEFAULT_FEATURE_PERIOD};
use crate::models::{Action, ActionKind, ExitReason, Forecast, PortfolioState};
use crate::risk::{RiskManager, Verdict};

/// Drives one cycle at a time from a candle window to persisted outcomes.
///
/// Holds no per-cycle state between calls; everything a cycle needs travels
/// in the [`EngineState`] value. Across cycles only the ledger and orders
/// still awaiting reconciliation persist.
pub struct DecisionEngine {
    forecaster: Arc<dyn Forecaster>,
    risk: RiskManager,
    gateway: ExecutionGateway,
    ledger: PositionLedger,
    audit: Arc<dyn AuditSink>,
    params: DecisionParams,
    max_window_age: Option<chrono::Duration>,
    unresolved: Vec<UnresolvedOrder>,
    last_record: Option<AuditRecord>,
}

impl DecisionEngine {
    pub fn new(
        forecaster: Arc<dyn Forecaster>,
        risk: RiskManager,
        gateway: ExecutionGateway,
        ledger: PositionLedger,
        audit: Arc<dyn AuditSink>,
        params: DecisionParams,
    ) -> Self {
        Self {
            forecaster,
            risk,
            gateway,
            ledger,
            audit,
            params,
            max_window_age: None,
            unresolved: Vec::new(),
            last_record: None,
        }
    }

    /// Treat a window whose last candle is older than `age` as stale: no
    /// forecast and no opens, but stop-loss and take-profit still run
    pub fn with_max_window_age(mut self, age: chrono::Duration) -> Self {
        self.max_window_age = Some(age);
        self
    }

    pub fn ledger(&self) -> &PositionLedger {
        &self.ledger
    }

    pub fn gateway(&self) -> &ExecutionGateway {
        &self.gateway
    }

    pub fn forecaster(&self) -> &Arc<dyn Forecaster> {
        &self.forecaster
    }

    pub fn last_record(&self) -> Option<&AuditRecord> {
        self.last_record.as_ref()
    }

    pub fn unresolved_orders(&self) -> &[UnresolvedOrder] {
        &self.unresolved
    }

    /// Idle -> DataReady. Pending ledger writes from earlier cycles are
    /// flushed first and unresolved orders reconciled; if either leaves the
    /// ledger behind the exchange the cycle is aborted before it starts.
    pub async fn begin(&mut self, input: CycleInput) -> Result<EngineState, CycleError> {
        let mut record = AuditRecord::new(&input.symbol, input.market_price, input.now);

        if self.ledger.has_pending() {
            if let Err(e) = self.ledger.flush_pending().await {
                let reason = format!("pending ledger writes still failing: {}", e);
                return Err(self.abort(record, reason, e).await);
            }
        }

        if !self.unresolved.is_empty() {
            if let Err(e) = self.reconcile(&input, &mut record).await {
                let reason = e.to_string();
                return Err(self.abort(record, reason, e).await);
            }
        }

        let portfolio = self.ledger.portfolio(input.available_balance);
        Ok(EngineState::DataReady(CycleContext {
            input,
            portfolio,
            record,
        }))
    }

    /// Advance one state. Returns Idle when the cycle has finished.
    pub async fn step(&mut self, state: EngineState) -> Result<EngineState, CycleError> {
        Ok(self.advance(state).await?.0)
    }

    async fn advance(
        &mut self,
        state: EngineState,
    ) -> Result<(EngineState, Option<AuditRecord>), CycleError> {
        match state {
            EngineState::Idle => Ok((EngineState::Idle, None)),
            EngineState::DataReady(ctx) => self.forecast(ctx).await,
            EngineState::Forecasted(ctx, forecast) => Ok((self.plan(ctx, Some(&forecast)), None)),
            EngineState::Decided(ctx, plan) => Ok((self.execute(ctx, plan).await?, None)),
            EngineState::Executed(ctx) => {
                let mut record = ctx.record;
                record.status = CycleStatus::Completed;
                let record = self.emit(record).await?;
                Ok((EngineState::Idle, Some(record)))
            }
        }
    }

    /// Run a whole cycle and return its audit record
    pub async fn run_cycle(&mut self, input: CycleInput) -> Result<AuditRecord, CycleError> {
        self.run_cycle_with_deadline(input, None).await
    }

    /// Run a cycle, cancelling at the next state boundary once `deadline` has
    /// elapsed. Order submission is never interrupted.
    pub async fn run_cycle_with_deadline(
        &mut self,
        input: CycleInput,
        deadline: Option<Duration>,
    ) -> Result<AuditRecord, CycleError> {
        let span = tracing::info_span!(
            "cycle",
            symbol = %input.symbol,
            cycle_id = tracing::field::Empty
        );
        async move {
            let started = Instant::now();
            let mut state = self.begin(input).await?;
            if let EngineState::DataReady(ctx) = &state {
                tracing::Span::current()
                    .record("cycle_id", tracing::field::display(ctx.record.cycle_id));
            }

            loop {
                let expired = deadline
                    .map(|limit| started.elapsed() >= limit)
                    .unwrap_or(false);
                let at = state.name();

                state = match state {
                    EngineState::DataReady(ctx)
                    | EngineState::Forecasted(ctx, _)
                    | EngineState::Decided(ctx, _)
                        if expired =>
                    {
                        return self.cancel(ctx, at).await;
                    }
                    other => other,
                };

                let (next, finished) = self.advance(state).await?;
                tracing::debug!("{} -> {}", at, next.name());
                if let Some(record) = finished {
                    return Ok(record);
                }
                state = next;
            }
        }
        .instrument(span)
        .await
    }

    async fn cancel(&mut self, ctx: CycleContext, at_state: &str) -> Result<AuditRecord, CycleError> {
        tracing::warn!("Cycle deadline reached, cancelling at {}", at_state);
        let mut record = ctx.record;
        record.status = CycleStatus::Cancelled {
            at_state: at_state.to_string(),
        };
        self.emit(record).await
    }

    /// DataReady -> Forecasted, or straight back to Idle when no forecast
    /// can be made
    async fn forecast(
        &mut self,
        mut ctx: CycleContext,
    ) -> Result<(EngineState, Option<AuditRecord>), CycleError> {
        ctx.record.features = Some(FeatureSnapshot::from_candles(
            &ctx.input.window,
            DEFAULT_FEATURE_PERIOD,
        ));

        if ctx.input.market_price <= Decimal::ZERO {
            let reason = format!("invalid market price {}", ctx.input.market_price);
            return self.skip(ctx, reason).await;
        }

        if let Some(age) = self.window_staleness(&ctx.input) {
            tracing::warn!(
                "Last candle is {}s old, managing exits only",
                age.num_seconds()
            );
            ctx.record.stale_window = true;
            return Ok((self.plan(ctx, None), None));
        }

        match self.forecaster.forecast(&ctx.input.window) {
            Ok(forecast) => {
                ctx.record.expected_return = forecast.expected_return(ctx.input.market_price);
                ctx.record.forecast = Some(forecast.clone());
                tracing::info!(
                    "Forecast {} (confidence {}) vs price {}",
                    forecast.predicted_value,
                    forecast.confidence,
                    ctx.input.market_price
                );
                Ok((EngineState::Forecasted(ctx, forecast), None))
            }
            Err(e) => self.skip(ctx, e.to_string()).await,
        }
    }

    async fn skip(
        &mut self,
        mut ctx: CycleContext,
        reason: String,
    ) -> Result<(EngineState, Option<AuditRecord>), CycleError> {
        tracing::warn!("Skipping cycle: {}", reason);
        ctx.record.status = CycleStatus::Skipped { reason };
        let record = self.emit(ctx.record).await?;
        Ok((EngineState::Idle, Some(record)))
    }

    /// Age of the last candle when it exceeds the configured limit
    fn window_staleness(&self, input: &CycleInput) -> Option<chrono::Duration> {
        let limit = self.max_window_age?;
        let last = input.window.last()?;
        let age = input.now - last.timestamp;
        (age > limit).then_some(age)
    }

    /// Forecasted -> Decided. Without a forecast only forced exits are
    /// proposed.
    fn plan(&self, ctx: CycleContext, forecast: Option<&Forecast>) -> EngineState {
        let signal = match forecast {
            Some(forecast) => decide(
                forecast,
                ctx.input.market_price,
                &ctx.portfolio,
                &self.params,
            ),
            None => Vec::new(),
        };
        self.admit(ctx, signal)
    }

    /// Merge forced exits with signal actions, run every proposal through
    /// risk and order what survives. Forced exits take precedence over
    /// signal closes for the same position.
    fn admit(&self, mut ctx: CycleContext, signal: Vec<Action>) -> EngineState {
        let price = ctx.input.market_price;
        let portfolio = &ctx.portfolio;

        let forced = self.risk.scan_exits(portfolio, price);
        let forced_ids: HashSet<Uuid> = forced.iter().filter_map(target).collect();

        let mut proposals: Vec<Action> = forced;
        for action in signal {
            match action.kind {
                ActionKind::ClosePosition(id) if forced_ids.contains(&id) => {
                    tracing::debug!("Reversal close for {} superseded by forced exit", id);
                }
                ActionKind::CloseAll => proposals.extend(expand_close_all(&action, portfolio, &forced_ids)),
                ActionKind::Hold if !proposals.is_empty() => {}
                _ => proposals.push(action),
            }
        }

        // A close reconciled at the start of this cycle counts as closing
        let reconciled_close = ctx
            .record
            .executions
            .iter()
            .any(|e| e.action.is_close() && matches!(e.outcome, ExecutionOutcome::Filled { .. }));

        // Positions whose close order is still awaiting reconciliation
        let closing_unresolved: HashSet<Uuid> = self
            .unresolved
            .iter()
            .filter_map(|o| target(&o.action))
            .collect();

        let mut forced_closes = Vec::new();
        let mut voluntary_closes = Vec::new();
        let mut opens = Vec::new();
        for action in proposals {
            let verdict = self.risk.evaluate(&action, portfolio);
            if let Verdict::Rejected(reason) = &verdict {
                tracing::warn!("Risk rejected {:?}: {:?}", action.kind, reason);
            }

            if verdict.is_admitted() {
                match action.kind {
                    ActionKind::ClosePosition(id) if closing_unresolved.contains(&id) => {
                        tracing::warn!("Close of {} already in flight, not resubmitting", id);
                    }
                    ActionKind::OpenLong => opens.push(action.clone()),
                    ActionKind::ClosePosition(_) if action.is_forced() => {
                        forced_closes.push(action.clone())
                    }
                    ActionKind::ClosePosition(_) => voluntary_closes.push(action.clone()),
                    ActionKind::CloseAll | ActionKind::Hold => {}
                }
            }
            ctx.record.proposals.push(ProposalRecord { action, verdict });
        }

        let closing = reconciled_close || !forced_closes.is_empty() || !voluntary_closes.is_empty();
        let mut actions = forced_closes;
        actions.extend(voluntary_closes);
        if closing && !opens.is_empty() {
            tracing::warn!("Dropping open: positions are being closed this cycle");
        } else if !self.unresolved.is_empty() && !opens.is_empty() {
            tracing::warn!("Dropping open: {} order(s) awaiting reconciliation", self.unresolved.len());
        } else if let Some(open) = opens.into_iter().next() {
            actions.push(open);
        }

        EngineState::Decided(ctx, Plan { actions })
    }

    /// Decided -> Executed. Execution failures drop only their own action;
    /// a ledger failure aborts the cycle. An order whose outcome is unknown
    /// is kept for reconciliation next cycle.
    async fn execute(&mut self, mut ctx: CycleContext, plan: Plan) -> Result<EngineState, CycleError> {
        for action in plan.actions {
            let position = match action.kind {
                ActionKind::ClosePosition(id) => match self.ledger.get(id).filter(|p| p.is_open()) {
                    Some(p) => Some(p.clone()),
                    None => {
                        tracing::warn!("Position {} no longer open, skipping close", id);
                        continue;
                    }
                },
                _ => None,
            };

            let order = OrderContext {
                symbol: &ctx.input.symbol,
                price: ctx.input.market_price,
                available_balance: ctx.input.available_balance,
                position: position.as_ref(),
            };

            let submitted = match self.gateway.translate(&action, &order) {
                Ok(request) => {
                    let result = self.gateway.execute(&request, order.price).await;
                    if let Err(ExecutionError::Unresolved { order_id, .. }) = &result {
                        self.unresolved.push(UnresolvedOrder {
                            action: action.clone(),
                            request,
                            order_id: order_id.clone(),
                            reference_price: ctx.input.market_price,
                        });
                    }
                    result
                }
                Err(e) => Err(e),
            };

            let fill = match submitted {
                Ok(fill) => fill,
                Err(e) => {
                    tracing::warn!("Execution of {:?} failed: {}", action.kind, e);
                    ctx.record.executions.push(failed(action, &e));
                    continue;
                }
            };

            let (effect, ledger_result) = self.apply_fill(&action, &fill, &ctx.input).await;
            ctx.record.executions.push(ExecutionRecord {
                action,
                outcome: ExecutionOutcome::Filled { fill, effect },
            });

            if let Err(e) = ledger_result {
                let reason = e.to_string();
                return Err(self.abort(ctx.record, reason, e).await);
            }
        }

        Ok(EngineState::Executed(ctx))
    }

    /// Settle orders left unresolved by earlier cycles. Whatever filled is
    /// recorded in the ledger and in this cycle's executions; orders the
    /// exchange still cannot confirm stay queued.
    async fn reconcile(&mut self, input: &CycleInput, record: &mut AuditRecord) -> Result<(), LedgerError> {
        let mut first_failure = None;

        for order in std::mem::take(&mut self.unresolved) {
            let result = self
                .gateway
                .reconcile(&order.request, &order.order_id, order.reference_price)
                .await;

            match result {
                Ok(fill) => {
                    tracing::info!(
                        "Reconciled order {}: {} filled",
                        order.order_id,
                        fill.filled_quantity
                    );
                    let (effect, ledger_result) = self.apply_fill(&order.action, &fill, input).await;
                    record.executions.push(ExecutionRecord {
                        action: order.action,
                        outcome: ExecutionOutcome::Filled { fill, effect },
                    });
                    if let Err(e) = ledger_result {
                        first_failure.get_or_insert(e);
                    }
                }
                Err(ExecutionError::Unresolved { reason, .. }) => {
                    tracing::warn!("Order {} still unresolved: {}", order.order_id, reason);
                    self.unresolved.push(order);
                }
                Err(e) => {
                    tracing::info!("Order {} ended without a fill: {}", order.order_id, e);
                    record.executions.push(failed(order.action, &e));
                }
            }
        }

        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Record a confirmed fill in the ledger. A close that did not fully fill
    /// only reduces the position. Ledger timestamps follow the cycle clock.
    async fn apply_fill(
        &mut self,
        action: &Action,
        fill: &FillResult,
        input: &CycleInput,
    ) -> (Option<LedgerEffect>, Result<(), LedgerError>) {
        let written = match action.kind {
            ActionKind::OpenLong => {
                let requested = action.size.unwrap_or(self.params.position_size);
                let entry_price = fill.average_price;
                let config = self.risk.config();
                let entry = PositionEntry {
                    symbol: input.symbol.clone(),
                    entry_order_id: fill.order_id.clone(),
                    entry_price,
                    size: (requested * fill.fill_ratio()).round_dp(8),
                    quantity: fill.filled_quantity,
                    opened_at: input.now,
                    stop_loss_price: config.stop_loss_price(entry_price),
                    take_profit_price: config.take_profit_price(entry_price),
                };
                self.ledger.open(entry).await.map(LedgerEffect::Opened)
            }
            ActionKind::ClosePosition(id) if fill.is_complete() => {
                let reason = action.exit_reason.unwrap_or(ExitReason::Manual);
                self.ledger
                    .close(id, fill.average_price, input.now, reason)
                    .await
                    .map(LedgerEffect::Closed)
            }
            ActionKind::ClosePosition(id) => self
                .ledger
                .reduce(id, fill.filled_quantity, fill.average_price)
                .await
                .map(LedgerEffect::Reduced),
            ActionKind::CloseAll | ActionKind::Hold => return (None, Ok(())),
        };

        match written {
            Ok(effect) => (Some(effect), Ok(())),
            Err(LedgerError::Unacknowledged { id, reason }) => {
                // Cached but not durable: record what the ledger now holds
                let effect = self.ledger.get(id).cloned().map(|p| match action.kind {
                    ActionKind::OpenLong => LedgerEffect::Opened(p),
                    _ if p.is_open() => LedgerEffect::Reduced(p),
                    _ => LedgerEffect::Closed(p),
                });
                (effect, Err(LedgerError::Unacknowledged { id, reason }))
            }
            Err(e) => (None, Err(e)),
        }
    }

    /// Mark the cycle aborted and audit it. An audit failure here is logged
    /// rather than returned so the ledger error stays the reported cause.
    async fn abort(&mut self, mut record: AuditRecord, reason: String, cause: LedgerError) -> CycleError {
        record.status = CycleStatus::Aborted { reason };
        if let Err(audit_err) = self.emit(record).await {
            tracing::error!("Audit record for aborted cycle lost: {}", audit_err);
        }
        CycleError::Persistence(cause)
    }

    async fn emit(&mut self, mut record: AuditRecord) -> Result<AuditRecord, CycleError> {
        if record.finished_at.is_none() {
            record.finished_at = Some(chrono::Utc::now());
        }
        self.last_record = Some(record.clone());
        self.audit.record(&record).await?;
        Ok(record)
    }
}

fn target(action: &Action) -> Option<Uuid> {
    match action.kind {
        ActionKind::ClosePosition(id) => Some(id),
        _ => None,
    }
}

fn failed(action: Action, error: &ExecutionError) -> ExecutionRecord {
    ExecutionRecord {
        action,
        outcome: ExecutionOutcome::Failed {
            kind: error.kind(),
            reason: error.to_string(),
        },
    }
}

fn expand_close_all(action: &Action, portfolio: &PortfolioState, skip: &HashSet<Uuid>) -> Vec<Action> {
    let reason = action.exit_reason.unwrap_or(ExitReason::Manual);
    portfolio
        .open_positions
        .iter()
        .filter(|p| !skip.contains(&p.id))
        .map(|p| Action::close(p.id, reason, action.reason.clone()))
        .collect()
}
