use anyhow::{bail, Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

use forecastbot::audit::{prediction_accuracy, AuditSink, FanoutAuditSink, TracingAuditSink};
use forecastbot::db::PostgresPersistence;
use forecastbot::engine::DecisionEngine;
use forecastbot::execution::{ExchangeClient, ExecutionGateway, HttpExchange, PaperExchange};
use forecastbot::forecast::{train, ModelForecaster, TrainingOptions};
use forecastbot::ledger::{LedgerStore, MemoryLedgerStore, PositionLedger};
use forecastbot::market_data::{InMemoryCandleStore, MarketDataStore};
use forecastbot::models::Position;
use forecastbot::persistence::RedisCandleStore;
use forecastbot::risk::RiskManager;
use forecastbot::scheduler::TradingLoop;
use forecastbot::Settings;

/// Candles kept per symbol when running without Redis
const MEMORY_STORE_CAPACITY: usize = 5000;

#[derive(Parser, Debug)]
#[command(name = "forecastbot", about = "Forecast-driven single-pair trading agent")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the trading loop (default)
    Run {
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
    },
    /// Fit the forecasting model on recent exchange candles
    Train {
        #[arg(long, default_value_t = 1000)]
        limit: usize,
        /// Where to write the artifact (defaults to MODEL_PATH)
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Show open positions, recent history and forecast accuracy
    Status {
        #[arg(long, default_value_t = 24)]
        hours: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    let settings = Settings::from_env().context("invalid configuration")?;

    match cli.command.unwrap_or(Command::Run { once: false }) {
        Command::Run { once } => run(settings, once).await,
        Command::Train { limit, output } => train_model(settings, limit, output).await,
        Command::Status { hours } => status(settings, hours).await,
    }
}

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("forecastbot=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(settings: Settings, once: bool) -> Result<()> {
    tracing::info!("🚀 Forecastbot starting for {}", settings.symbol);
    settings.log_summary();

    let postgres = connect_to_postgres(&settings).await;

    let ledger_store: Arc<dyn LedgerStore> = match &postgres {
        Some(pg) => pg.clone(),
        None => {
            tracing::warn!("DATABASE_URL not set, positions are kept in memory only");
            Arc::new(MemoryLedgerStore::new())
        }
    };
    let ledger = PositionLedger::load(ledger_store)
        .await
        .context("failed to load positions")?;

    let mut sinks: Vec<Arc<dyn AuditSink>> = vec![Arc::new(TracingAuditSink)];
    if let Some(pg) = &postgres {
        sinks.push(pg.clone());
    }
    let audit = Arc::new(FanoutAuditSink::new(sinks));

    let store = connect_market_store(&settings).await?;
    let exchange = build_exchange(&settings, &ledger.list_open())?;
    tracing::info!("✅ Exchange: {}", exchange.name());

    let forecaster = Arc::new(ModelForecaster::from_path(
        &settings.model_path,
        settings.sequence_length,
    ));
    if !forecaster.is_loaded() {
        tracing::warn!(
            "No usable model at {}; cycles will skip until `forecastbot train` has run",
            settings.model_path.display()
        );
    }

    let engine = DecisionEngine::new(
        forecaster,
        RiskManager::new(settings.risk_config()),
        ExecutionGateway::new(exchange, settings.retry_policy()),
        ledger,
        audit,
        settings.decision_params(),
    )
    .with_max_window_age(settings.max_window_age());

    let mut trading = TradingLoop::new(
        engine,
        store,
        &settings.symbol,
        settings.quote_asset(),
        &settings.candle_timeframe,
        settings.update_interval,
    )
    .with_retention(settings.candle_retention());

    if once {
        let record = trading.tick().await?;
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let trading_task = tokio::spawn(async move {
        trading.run(shutdown_rx).await;
    });

    tracing::info!("Press Ctrl+C to stop...");

    tokio::signal::ctrl_c().await?;
    tracing::info!("⚠️  Received Ctrl+C, finishing current cycle...");
    shutdown_tx.send(true).ok();

    trading_task.await.context("trading loop panicked")?;
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn train_model(settings: Settings, limit: usize, output: Option<PathBuf>) -> Result<()> {
    let exchange = build_exchange(&settings, &[])?;
    let gateway = ExecutionGateway::new(exchange, settings.retry_policy());

    tracing::info!(
        "📊 Fetching {} {} candles for {}",
        limit,
        settings.candle_timeframe,
        settings.symbol
    );
    let candles = gateway
        .fetch_ohlcv(&settings.symbol, &settings.candle_timeframe, limit)
        .await
        .context("failed to fetch training candles")?;

    let options = TrainingOptions {
        sequence_length: settings.sequence_length,
        ..TrainingOptions::default()
    };
    let model = train(&candles, &options)?;

    let path = output.unwrap_or(settings.model_path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    model
        .save(&path)
        .with_context(|| format!("failed to write model to {}", path.display()))?;

    tracing::info!(
        "✅ Trained on {} samples (residual std {:?}), saved to {}",
        model.samples,
        model.residual_std,
        path.display()
    );

    Ok(())
}

async fn status(settings: Settings, hours: i64) -> Result<()> {
    let Some(database_url) = settings.database_url.as_deref() else {
        bail!("DATABASE_URL is required for status");
    };
    let db = Arc::new(PostgresPersistence::new(database_url).await?);

    let ledger = PositionLedger::load(db.clone()).await?;
    let open = ledger.list_open();

    println!("\n📊 {} open position(s)", open.len());
    for position in &open {
        println!(
            "  {} {} qty {} @ {} (SL {} / TP {}) since {}",
            position.id,
            position.symbol,
            position.quantity,
            position.entry_price,
            position.stop_loss_price,
            position.take_profit_price,
            position.opened_at
        );
    }

    let end = Utc::now();
    let start = end - ChronoDuration::hours(hours);
    let history = ledger.history(start, end);
    println!("\n📈 {} position(s) opened or closed in the last {}h", history.len(), hours);
    for position in &history {
        println!(
            "  {} {:?} entry {} exit {:?} pnl {:?} ({:?})",
            position.symbol,
            position.status,
            position.entry_price,
            position.close_price,
            position.realized_pnl,
            position.exit_reason
        );
    }
    println!("\n💰 Realized P&L: {}", ledger.realized_pnl());

    let records = db
        .load_audit_records(&settings.symbol, start, end)
        .await?;
    match prediction_accuracy(&records) {
        Some(mape) => println!("🎯 Forecast MAPE over {} cycles: {:.2}%", records.len(), mape),
        None => println!("🎯 Forecast MAPE: not enough forecasts"),
    }

    Ok(())
}

async fn connect_to_postgres(settings: &Settings) -> Option<Arc<PostgresPersistence>> {
    let database_url = settings.database_url.as_deref()?;

    match PostgresPersistence::new(database_url).await {
        Ok(p) => Some(Arc::new(p)),
        Err(e) => {
            tracing::error!("❌ Failed to connect to Postgres: {}", e);
            tracing::warn!("Continuing without durable positions or audit log");
            None
        }
    }
}

async fn connect_market_store(settings: &Settings) -> Result<Arc<dyn MarketDataStore>> {
    match settings.redis_url.as_deref() {
        Some(redis_url) => {
            let store = RedisCandleStore::new(redis_url)
                .await
                .context("failed to connect to Redis")?;
            Ok(Arc::new(store))
        }
        None => {
            tracing::info!("REDIS_URL not set, keeping candles in memory");
            Ok(Arc::new(InMemoryCandleStore::new(MEMORY_STORE_CAPACITY)))
        }
    }
}

/// Live REST adapter, or the paper exchange (optionally priced by the live
/// feed). A paper exchange starts out holding the base asset of `recovered`
/// positions.
fn build_exchange(settings: &Settings, recovered: &[Position]) -> Result<Arc<dyn ExchangeClient>> {
    let http = match settings.exchange_base_url.as_deref() {
        Some(base_url) => Some(Arc::new(HttpExchange::new(
            base_url,
            settings.exchange_api_key.as_deref().unwrap_or_default(),
            settings.exchange_api_secret.as_deref().unwrap_or_default(),
        )?)),
        None => None,
    };

    if settings.paper_trading {
        let paper = PaperExchange::new(settings.quote_asset(), settings.initial_balance);
        if !recovered.is_empty() {
            paper.seed_positions(recovered);
            tracing::info!("Paper exchange seeded with {} recovered position(s)", recovered.len());
        }
        let paper = match http {
            Some(http) => paper.with_market_data(http),
            None => {
                tracing::warn!("EXCHANGE_BASE_URL not set, paper exchange has no market feed");
                paper
            }
        };
        return Ok(Arc::new(paper));
    }

    let Some(http) = http else {
        bail!("EXCHANGE_BASE_URL is required when PAPER_TRADING=false");
    };
    if settings.exchange_api_key.is_none() || settings.exchange_api_secret.is_none() {
        bail!("EXCHANGE_API_KEY and EXCHANGE_API_SECRET are required for live trading");
    }
    let live: Arc<dyn ExchangeClient> = http;
    Ok(live)
}
