use anyhow::Result;
use clap::Parser;
use rust_decimal::Decimal;
use std::sync::Arc;

use forecastbot::backtest::{BacktestMetrics, BacktestRunner, MarketScenario, SyntheticDataGenerator};
use forecastbot::engine::DecisionParams;
use forecastbot::forecast::MomentumForecaster;
use forecastbot::risk::RiskConfig;

/// Replay synthetic market scenarios through the decision engine
#[derive(Parser, Debug)]
#[command(name = "backtest")]
struct Args {
    /// RNG seed for the synthetic series
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Candles per scenario
    #[arg(long, default_value_t = 500)]
    candles: usize,

    /// Minutes between candles
    #[arg(long, default_value_t = 60)]
    interval_minutes: i64,

    /// Only run this scenario (uptrend, downtrend, sideways, volatile)
    #[arg(long)]
    scenario: Option<String>,

    /// Candles in the forecast window
    #[arg(long, default_value_t = 60)]
    sequence_length: usize,

    /// Candles ahead the momentum drift is projected
    #[arg(long, default_value_t = 12)]
    horizon: u32,

    #[arg(long, default_value = "1000000")]
    initial_balance: Decimal,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("forecastbot=info")
        .init();

    let args = Args::parse();

    let scenarios: Vec<MarketScenario> = match args.scenario.as_deref() {
        Some(name) => match MarketScenario::parse(name) {
            Some(scenario) => vec![scenario],
            None => anyhow::bail!("unknown scenario {:?}", name),
        },
        None => MarketScenario::all().to_vec(),
    };

    println!("\n=======================================================");
    println!("          FORECASTBOT BACKTESTING SUITE");
    println!("=======================================================");

    let runner = BacktestRunner::new(
        "SYNTH/IDR",
        args.initial_balance,
        RiskConfig::default(),
        DecisionParams::default(),
    );

    let mut all_metrics = Vec::new();

    for scenario in scenarios {
        let mut generator = SyntheticDataGenerator::new("SYNTH/IDR", 2000.0, args.seed);
        let candles = generator.generate(scenario, args.candles, args.interval_minutes);
        let forecaster = Arc::new(MomentumForecaster::new(args.sequence_length, args.horizon));

        println!("\n▶ {:?}", scenario);
        match runner.run(forecaster, &candles).await {
            Ok(metrics) => {
                metrics.print_report();
                all_metrics.push((format!("{:?}", scenario), metrics));
            }
            Err(e) => eprintln!("❌ Backtest failed for {:?}: {}", scenario, e),
        }
    }

    print_summary_comparison(&all_metrics);

    Ok(())
}

fn print_summary_comparison(results: &[(String, BacktestMetrics)]) {
    println!("\n=======================================================");
    println!("              SCENARIO COMPARISON");
    println!("=======================================================\n");

    println!(
        "{:<14} {:>14} {:>10} {:>8} {:>8} {:>12}",
        "Scenario", "P&L", "Return%", "Trades", "Win%", "MaxDD%"
    );
    println!("{}", "-".repeat(70));

    for (name, metrics) in results {
        println!(
            "{:<14} {:>14.2} {:>10.2} {:>8} {:>8.1} {:>12.2}",
            name,
            metrics.total_pnl,
            metrics.total_return_pct,
            metrics.total_trades,
            metrics.win_rate,
            metrics.max_drawdown_pct
        );
    }

    let total_trades: usize = results.iter().map(|(_, m)| m.total_trades).sum();
    println!("\n📊 Total Trades Across All Scenarios: {}", total_trades);
    println!("\n=======================================================\n");
}
