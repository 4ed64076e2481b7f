use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::{ExitReason, Position};

/// Record of a single closed position for analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub quantity: Decimal,
    pub pnl: Decimal,
    pub pnl_pct: f64,
    pub holding_period_minutes: i64,
    pub exit_reason: Option<ExitReason>,
}

impl TradeRecord {
    /// None while the position is still open
    pub fn from_position(position: &Position) -> Option<Self> {
        let (Some(exit_price), Some(exit_time), Some(pnl)) = (
            position.close_price,
            position.closed_at,
            position.realized_pnl,
        ) else {
            return None;
        };

        let pnl_pct = if position.entry_price > Decimal::ZERO {
            ((exit_price - position.entry_price) / position.entry_price * Decimal::ONE_HUNDRED)
                .to_f64()
                .unwrap_or(0.0)
        } else {
            0.0
        };

        Some(Self {
            entry_time: position.opened_at,
            exit_time,
            entry_price: position.entry_price,
            exit_price,
            quantity: position.quantity,
            pnl,
            pnl_pct,
            holding_period_minutes: (exit_time - position.opened_at).num_minutes(),
            exit_reason: position.exit_reason,
        })
    }
}

/// Backtest performance summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestMetrics {
    // P&L
    pub total_pnl: Decimal,
    pub total_return_pct: f64,
    pub initial_portfolio_value: Decimal,
    pub final_portfolio_value: Decimal,

    // Trade statistics
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub stop_loss_exits: usize,
    pub take_profit_exits: usize,
    pub reversal_exits: usize,

    // Risk
    pub max_drawdown: Decimal,
    pub max_drawdown_pct: f64,
    pub sharpe_ratio: f64,

    pub avg_holding_period_minutes: f64,

    // Cycles
    pub cycles: usize,
    pub skipped_cycles: usize,
    pub failed_orders: usize,
    /// Mean absolute percentage error of consecutive forecasts
    pub forecast_mape: Option<f64>,

    pub trades: Vec<TradeRecord>,
}

/// Cycle counters gathered by the runner
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleStats {
    pub cycles: usize,
    pub skipped: usize,
    pub failed_orders: usize,
    pub forecast_mape: Option<f64>,
}

impl BacktestMetrics {
    /// Calculate metrics from ledger positions; open positions are ignored
    pub fn from_positions(
        positions: &[Position],
        initial_portfolio_value: Decimal,
        final_portfolio_value: Decimal,
        stats: CycleStats,
    ) -> Self {
        let mut trades: Vec<TradeRecord> = positions
            .iter()
            .filter_map(TradeRecord::from_position)
            .collect();
        trades.sort_by_key(|t| t.exit_time);

        let total_trades = trades.len();
        let total_pnl: Decimal = trades.iter().map(|t| t.pnl).sum();
        let total_return_pct = if initial_portfolio_value > Decimal::ZERO {
            ((final_portfolio_value - initial_portfolio_value) / initial_portfolio_value
                * Decimal::ONE_HUNDRED)
                .to_f64()
                .unwrap_or(0.0)
        } else {
            0.0
        };

        let winning_trades = trades.iter().filter(|t| t.pnl > Decimal::ZERO).count();
        let losing_trades = total_trades - winning_trades;
        let win_rate = if total_trades > 0 {
            (winning_trades as f64 / total_trades as f64) * 100.0
        } else {
            0.0
        };

        let exits = |reason: ExitReason| {
            trades
                .iter()
                .filter(|t| t.exit_reason == Some(reason))
                .count()
        };

        let (max_drawdown, max_drawdown_pct) =
            Self::calculate_drawdown(&trades, initial_portfolio_value);

        let avg_holding_period_minutes = if total_trades > 0 {
            trades.iter().map(|t| t.holding_period_minutes).sum::<i64>() as f64
                / total_trades as f64
        } else {
            0.0
        };

        Self {
            total_pnl,
            total_return_pct,
            initial_portfolio_value,
            final_portfolio_value,
            total_trades,
            winning_trades,
            losing_trades,
            win_rate,
            stop_loss_exits: exits(ExitReason::StopLoss),
            take_profit_exits: exits(ExitReason::TakeProfit),
            reversal_exits: exits(ExitReason::Reversal),
            max_drawdown,
            max_drawdown_pct,
            sharpe_ratio: Self::calculate_sharpe_ratio(&trades),
            avg_holding_period_minutes,
            cycles: stats.cycles,
            skipped_cycles: stats.skipped,
            failed_orders: stats.failed_orders,
            forecast_mape: stats.forecast_mape,
            trades,
        }
    }

    /// Largest peak-to-trough drop of realized equity
    fn calculate_drawdown(trades: &[TradeRecord], initial_value: Decimal) -> (Decimal, f64) {
        let mut peak = initial_value;
        let mut current_value = initial_value;
        let mut max_dd = Decimal::ZERO;
        let mut max_dd_pct = 0.0;

        for trade in trades {
            current_value += trade.pnl;
            peak = peak.max(current_value);

            let drawdown = peak - current_value;
            if drawdown > max_dd {
                max_dd = drawdown;
                if peak > Decimal::ZERO {
                    max_dd_pct = (drawdown / peak * Decimal::ONE_HUNDRED)
                        .to_f64()
                        .unwrap_or(0.0);
                }
            }
        }

        (max_dd, max_dd_pct)
    }

    /// Per-trade Sharpe ratio with a zero risk-free rate
    fn calculate_sharpe_ratio(trades: &[TradeRecord]) -> f64 {
        if trades.is_empty() {
            return 0.0;
        }

        let returns: Vec<f64> = trades.iter().map(|t| t.pnl_pct).collect();
        let mean_return = returns.iter().sum::<f64>() / returns.len() as f64;
        let variance = returns
            .iter()
            .map(|r| (r - mean_return).powi(2))
            .sum::<f64>()
            / returns.len() as f64;
        let std_dev = variance.sqrt();

        if std_dev > 0.0 {
            mean_return / std_dev
        } else {
            0.0
        }
    }

    /// Print a formatted report to stdout
    pub fn print_report(&self) {
        println!("\n=======================================================");
        println!("              BACKTEST PERFORMANCE REPORT");
        println!("=======================================================\n");

        println!("📊 P&L SUMMARY");
        println!("  Initial Portfolio:     {:.2}", self.initial_portfolio_value);
        println!("  Final Portfolio:       {:.2}", self.final_portfolio_value);
        println!(
            "  Realized P&L:          {:.2} ({:+.2}%)",
            self.total_pnl, self.total_return_pct
        );

        println!("\n📈 TRADE STATISTICS");
        println!("  Total Trades:          {}", self.total_trades);
        println!(
            "  Winning Trades:        {} ({:.1}%)",
            self.winning_trades, self.win_rate
        );
        println!("  Losing Trades:         {}", self.losing_trades);
        println!(
            "  Exits:                 {} stop-loss, {} take-profit, {} reversal",
            self.stop_loss_exits, self.take_profit_exits, self.reversal_exits
        );

        if self.total_trades > 0 {
            println!("\n⚠️  RISK METRICS");
            println!(
                "  Max Drawdown:          {:.2} ({:.2}%)",
                self.max_drawdown, self.max_drawdown_pct
            );
            println!("  Sharpe Ratio:          {:.2}", self.sharpe_ratio);
            println!(
                "  Avg Holding Period:    {:.1} hours",
                self.avg_holding_period_minutes / 60.0
            );
        }

        println!("\n🔄 CYCLES");
        println!("  Cycles Run:            {}", self.cycles);
        println!("  Skipped:               {}", self.skipped_cycles);
        println!("  Failed Orders:         {}", self.failed_orders);
        match self.forecast_mape {
            Some(mape) => println!("  Forecast MAPE:         {:.2}%", mape),
            None => println!("  Forecast MAPE:         n/a"),
        }

        println!("\n=======================================================\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PositionStatus;
    use rust_decimal_macros::dec;

    fn closed_position(pnl: Decimal, holding_minutes: i64, reason: ExitReason) -> Position {
        let opened_at = Utc::now() - chrono::Duration::days(1);
        let entry_price = dec!(100);
        let quantity = dec!(1);

        Position {
            id: uuid::Uuid::new_v4(),
            symbol: "DOGE/IDR".to_string(),
            entry_order_id: "paper-1".to_string(),
            entry_price,
            size: dec!(0.1),
            quantity,
            opened_at,
            stop_loss_price: dec!(95),
            take_profit_price: dec!(110),
            status: PositionStatus::Closed,
            close_price: Some(entry_price + pnl / quantity),
            closed_at: Some(opened_at + chrono::Duration::minutes(holding_minutes)),
            realized_pnl: Some(pnl),
            exit_reason: Some(reason),
        }
    }

    #[test]
    fn test_metrics_with_winning_trades() {
        let positions = vec![
            closed_position(dec!(100), 60, ExitReason::TakeProfit),
            closed_position(dec!(50), 120, ExitReason::Reversal),
            closed_position(dec!(-30), 90, ExitReason::StopLoss),
        ];

        let metrics = BacktestMetrics::from_positions(
            &positions,
            dec!(10000),
            dec!(10120),
            CycleStats::default(),
        );

        assert_eq!(metrics.total_trades, 3);
        assert_eq!(metrics.winning_trades, 2);
        assert_eq!(metrics.losing_trades, 1);
        assert!((metrics.win_rate - 66.66).abs() < 0.1);
        assert_eq!(metrics.total_pnl, dec!(120));
        assert_eq!(metrics.stop_loss_exits, 1);
        assert_eq!(metrics.take_profit_exits, 1);
        assert!((metrics.total_return_pct - 1.2).abs() < 1e-9);
    }

    #[test]
    fn test_metrics_with_no_trades() {
        let metrics = BacktestMetrics::from_positions(
            &[],
            dec!(10000),
            dec!(10000),
            CycleStats::default(),
        );

        assert_eq!(metrics.total_trades, 0);
        assert_eq!(metrics.win_rate, 0.0);
        assert_eq!(metrics.total_pnl, Decimal::ZERO);
        assert_eq!(metrics.max_drawdown, Decimal::ZERO);
    }

    #[test]
    fn test_open_positions_are_not_trades() {
        let mut open = closed_position(dec!(10), 60, ExitReason::Manual);
        open.status = PositionStatus::Open;
        open.close_price = None;
        open.closed_at = None;
        open.realized_pnl = None;

        let metrics = BacktestMetrics::from_positions(
            &[open],
            dec!(10000),
            dec!(10000),
            CycleStats::default(),
        );
        assert_eq!(metrics.total_trades, 0);
    }

    #[test]
    fn test_drawdown_calculation() {
        let positions = vec![
            closed_position(dec!(100), 60, ExitReason::TakeProfit), // Peak at 10100
            closed_position(dec!(-200), 120, ExitReason::StopLoss), // Down to 9900
            closed_position(dec!(50), 180, ExitReason::Reversal),   // Back to 9950
        ];

        let metrics = BacktestMetrics::from_positions(
            &positions,
            dec!(10000),
            dec!(9950),
            CycleStats::default(),
        );

        assert_eq!(metrics.max_drawdown, dec!(200));
        assert!((metrics.max_drawdown_pct - 1.98).abs() < 0.01);
    }
}
