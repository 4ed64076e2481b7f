use anyhow::{bail, Result};
use rust_decimal::Decimal;
use std::sync::Arc;

use crate::audit::{prediction_accuracy, CycleStatus, MemoryAuditLog};
use crate::backtest::metrics::{BacktestMetrics, CycleStats};
use crate::engine::{CycleInput, DecisionEngine, DecisionParams};
use crate::execution::{ExecutionGateway, PaperExchange, RetryPolicy};
use crate::forecast::Forecaster;
use crate::ledger::PositionLedger;
use crate::models::{split_symbol, Candle};
use crate::risk::{RiskConfig, RiskManager};

/// Replays a candle series through the real decision engine.
///
/// Every candle after the warm-up window becomes one cycle: the paper
/// exchange is priced at its close and the engine sees the trailing window.
pub struct BacktestRunner {
    symbol: String,
    initial_balance: Decimal,
    risk: RiskConfig,
    params: DecisionParams,
}

impl BacktestRunner {
    pub fn new(
        symbol: &str,
        initial_balance: Decimal,
        risk: RiskConfig,
        params: DecisionParams,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            initial_balance,
            risk,
            params,
        }
    }

    pub async fn run(
        &self,
        forecaster: Arc<dyn Forecaster>,
        candles: &[Candle],
    ) -> Result<BacktestMetrics> {
        let Some((_, quote_asset)) = split_symbol(&self.symbol) else {
            bail!("symbol must look like BASE/QUOTE, got {}", self.symbol);
        };

        let window_len = forecaster.sequence_length();
        if candles.len() <= window_len {
            bail!(
                "Not enough candles for backtest. Need more than {}, got {}",
                window_len,
                candles.len()
            );
        }

        tracing::info!(
            "Starting backtest: {} candles, {} forecaster needs {}",
            candles.len(),
            forecaster.name(),
            window_len
        );

        let exchange = Arc::new(PaperExchange::new(quote_asset, self.initial_balance));
        let audit = Arc::new(MemoryAuditLog::new());
        let mut engine = DecisionEngine::new(
            forecaster,
            RiskManager::new(self.risk.clone()),
            ExecutionGateway::new(exchange.clone(), RetryPolicy::immediate(3)),
            PositionLedger::in_memory(),
            audit.clone(),
            self.params.clone(),
        );

        for end in window_len..=candles.len() {
            let current = &candles[end - 1];
            exchange.set_price(&self.symbol, current.close);

            let input = CycleInput {
                symbol: self.symbol.clone(),
                window: candles[end - window_len..end].to_vec(),
                market_price: current.close,
                available_balance: exchange.balance(quote_asset),
                now: current.timestamp,
            };

            engine.run_cycle(input).await?;
        }

        let last_price = candles[candles.len() - 1].close;
        let open_value: Decimal = engine
            .ledger()
            .list_open()
            .iter()
            .map(|p| p.quantity * last_price)
            .sum();
        let final_value = exchange.balance(quote_asset) + open_value;

        let records = audit.all();
        let stats = CycleStats {
            cycles: records.len(),
            skipped: records
                .iter()
                .filter(|r| matches!(r.status, CycleStatus::Skipped { .. }))
                .count(),
            failed_orders: records.iter().map(|r| r.failures().count()).sum(),
            forecast_mape: prediction_accuracy(&records),
        };

        let metrics = BacktestMetrics::from_positions(
            engine.ledger().all_positions(),
            self.initial_balance,
            final_value,
            stats,
        );

        tracing::info!(
            "✅ Backtest finished: {} trades, realized P&L {}",
            metrics.total_trades,
            metrics.total_pnl
        );

        Ok(metrics)
    }
}
