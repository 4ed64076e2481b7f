use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::{Arc, Mutex};

use forecastbot::audit::{CycleStatus, ExecutionOutcome, MemoryAuditLog};
use forecastbot::engine::{CycleInput, DecisionEngine, DecisionParams};
use forecastbot::error::{ExecutionError, ExecutionErrorKind, ForecastError};
use forecastbot::execution::{ExecutionGateway, PaperExchange, RetryPolicy};
use forecastbot::forecast::{trailing_window, Forecaster};
use forecastbot::ledger::{replay, MemoryLedgerStore, PositionLedger};
use forecastbot::risk::{evaluate, RejectionReason, RiskConfig, RiskManager, Verdict};
use forecastbot::{Action, ActionKind, Candle, ExitReason, Forecast, PortfolioState};

const SYMBOL: &str = "DOGE/IDR";
const SEQUENCE_LENGTH: usize = 60;

/// Predicts the last close moved by a return the test can change between cycles
struct ScriptedForecaster {
    change: Mutex<Decimal>,
}

impl ScriptedForecaster {
    fn new(change: Decimal) -> Arc<Self> {
        Arc::new(Self {
            change: Mutex::new(change),
        })
    }

    fn set(&self, change: Decimal) {
        *self.change.lock().unwrap() = change;
    }
}

impl Forecaster for ScriptedForecaster {
    fn name(&self) -> &str {
        "scripted"
    }

    fn sequence_length(&self) -> usize {
        SEQUENCE_LENGTH
    }

    fn forecast(&self, window: &[Candle]) -> Result<Forecast, ForecastError> {
        let window = trailing_window(window, SEQUENCE_LENGTH)?;
        let last = &window[window.len() - 1];
        let change = *self.change.lock().unwrap();
        Ok(Forecast {
            as_of: last.timestamp,
            predicted_value: last.close * (Decimal::ONE + change),
            confidence: dec!(0.9),
        })
    }
}

struct Bot {
    engine: DecisionEngine,
    exchange: Arc<PaperExchange>,
    forecaster: Arc<ScriptedForecaster>,
    audit: Arc<MemoryAuditLog>,
}

async fn bot(change: Decimal) -> Bot {
    let exchange = Arc::new(PaperExchange::new("IDR", dec!(1000000)));
    session(change, Arc::new(MemoryLedgerStore::new()), exchange).await
}

/// A bot over an existing ledger store, as after a restart
async fn session(change: Decimal, store: Arc<MemoryLedgerStore>, exchange: Arc<PaperExchange>) -> Bot {
    let forecaster = ScriptedForecaster::new(change);
    let audit = Arc::new(MemoryAuditLog::new());
    let ledger = PositionLedger::load(store).await.unwrap();

    let engine = DecisionEngine::new(
        forecaster.clone(),
        RiskManager::new(RiskConfig::default()),
        ExecutionGateway::new(exchange.clone(), RetryPolicy::immediate(3)),
        ledger,
        audit.clone(),
        DecisionParams::default(),
    );

    Bot {
        engine,
        exchange,
        forecaster,
        audit,
    }
}

/// `len` hourly candles rising by 1 per candle and ending at `last`
fn rising_window(last: Decimal, len: usize) -> Vec<Candle> {
    let now = Utc::now();
    (0..len)
        .map(|i| {
            let close = last - Decimal::from((len - 1 - i) as i64);
            Candle {
                symbol: SYMBOL.to_string(),
                timestamp: now - Duration::hours((len - i) as i64),
                open: close,
                high: close,
                low: close,
                close,
                volume: dec!(100),
            }
        })
        .collect()
}

impl Bot {
    async fn cycle(&mut self, price: Decimal, len: usize) -> forecastbot::audit::AuditRecord {
        self.exchange.set_price(SYMBOL, price);
        let input = CycleInput {
            symbol: SYMBOL.to_string(),
            window: rising_window(price, len),
            market_price: price,
            available_balance: self.exchange.balance("IDR"),
            now: Utc::now(),
        };
        self.engine.run_cycle(input).await.unwrap()
    }
}

#[tokio::test]
async fn test_rising_window_opens_one_long() {
    let mut bot = bot(dec!(0.05)).await;

    let record = bot.cycle(dec!(2000), SEQUENCE_LENGTH).await;

    assert_eq!(record.status, CycleStatus::Completed);
    let admitted: Vec<&Action> = record.admitted().collect();
    assert_eq!(admitted.len(), 1);
    assert_eq!(admitted[0].kind, ActionKind::OpenLong);
    assert!(admitted[0].size.unwrap() <= dec!(0.1));

    let open = bot.engine.ledger().list_open();
    assert_eq!(open.len(), 1);
    assert!(open[0].size <= dec!(0.1));
    assert_eq!(open[0].entry_price, dec!(2000));
}

#[tokio::test]
async fn test_short_window_skips_without_touching_portfolio() {
    let mut bot = bot(dec!(0.05)).await;

    let record = bot.cycle(dec!(2000), SEQUENCE_LENGTH - 1).await;

    assert!(matches!(record.status, CycleStatus::Skipped { .. }));
    assert!(record.proposals.is_empty());
    assert!(bot.engine.ledger().all_positions().is_empty());
    assert_eq!(bot.exchange.balance("IDR"), dec!(1000000));
}

#[tokio::test]
async fn test_transient_failures_then_fill_opens_once() {
    let mut bot = bot(dec!(0.05)).await;
    bot.exchange.fail_next_orders(vec![
        ExecutionError::Transient("timeout".to_string()),
        ExecutionError::Transient("timeout".to_string()),
        ExecutionError::Transient("502 bad gateway".to_string()),
    ]);

    let record = bot.cycle(dec!(2000), SEQUENCE_LENGTH).await;

    assert_eq!(record.failures().count(), 0);
    assert_eq!(bot.exchange.place_calls(), 4);
    assert_eq!(bot.exchange.order_count(), 1);

    let open = bot.engine.ledger().list_open();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].quantity, dec!(50));
}

#[tokio::test]
async fn test_rejected_close_keeps_position_open() {
    let mut bot = bot(dec!(0.05)).await;
    bot.cycle(dec!(2000), SEQUENCE_LENGTH).await;
    let before = bot.engine.ledger().list_open();
    assert_eq!(before.len(), 1);

    bot.forecaster.set(dec!(-0.05));
    bot.exchange
        .fail_next_orders(vec![ExecutionError::Rejected("market closed".to_string())]);
    let record = bot.cycle(dec!(2010), SEQUENCE_LENGTH).await;

    assert_eq!(bot.engine.ledger().list_open(), before);

    let failures: Vec<_> = record.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].action.kind, ActionKind::ClosePosition(before[0].id));
    match &failures[0].outcome {
        ExecutionOutcome::Failed { kind, reason } => {
            assert_eq!(*kind, ExecutionErrorKind::Rejected);
            assert!(reason.contains("market closed"));
        }
        other => panic!("expected a failure, got {:?}", other),
    }
    assert_eq!(bot.audit.len(), 2);
}

#[tokio::test]
async fn test_stop_loss_overrides_bullish_forecast() {
    let mut bot = bot(dec!(0.05)).await;
    bot.cycle(dec!(2000), SEQUENCE_LENGTH).await;
    let position = bot.engine.ledger().list_open()[0].clone();

    // Still bullish, but price is through the stop
    let record = bot.cycle(dec!(1890), SEQUENCE_LENGTH).await;

    assert!(record
        .admitted()
        .any(|a| a.kind == ActionKind::ClosePosition(position.id)
            && a.exit_reason == Some(ExitReason::StopLoss)));
    assert!(!record.admitted().any(|a| a.kind == ActionKind::OpenLong));

    let closed = bot.engine.ledger().get(position.id).unwrap();
    assert!(!closed.is_open());
    assert_eq!(closed.exit_reason, Some(ExitReason::StopLoss));
    assert_eq!(closed.realized_pnl, Some(dec!(-5500)));
}

#[test]
fn test_open_rejected_at_max_positions() {
    let config = RiskConfig::default();
    let open: Vec<_> = (0..config.max_positions)
        .map(|i| forecastbot::Position {
            id: uuid::Uuid::new_v4(),
            symbol: SYMBOL.to_string(),
            entry_order_id: format!("paper-{}", i),
            entry_price: dec!(2000),
            size: dec!(0.1),
            quantity: dec!(50),
            opened_at: Utc::now(),
            stop_loss_price: dec!(1900),
            take_profit_price: dec!(2200),
            status: forecastbot::PositionStatus::Open,
            close_price: None,
            closed_at: None,
            realized_pnl: None,
            exit_reason: None,
        })
        .collect();
    let state = PortfolioState::new(open, dec!(1000000));

    let verdict = evaluate(&Action::open_long(dec!(0.05), "signal"), &state, &config);
    assert_eq!(
        verdict,
        Verdict::Rejected(RejectionReason::MaxPositionsExceeded { open: 3, max: 3 })
    );
}

#[tokio::test]
async fn test_replaying_a_cycle_reproduces_the_ledger() {
    let mut bot = bot(dec!(0.05)).await;

    let before_open = bot.engine.ledger().snapshot();
    let open_record = bot.cycle(dec!(2000), SEQUENCE_LENGTH).await;
    let after_open = bot.engine.ledger().snapshot();
    assert_eq!(replay(&before_open, &open_record), after_open);

    bot.forecaster.set(dec!(-0.05));
    let close_record = bot.cycle(dec!(2050), SEQUENCE_LENGTH).await;
    let after_close = bot.engine.ledger().snapshot();

    let replayed = replay(&after_open, &close_record);
    assert_eq!(replayed, after_close);
    // Second application changes nothing
    assert_eq!(replay(&replayed, &close_record), after_close);
    assert_eq!(replayed.open_positions().count(), 0);
}

#[tokio::test]
async fn test_recovered_position_closes_after_paper_restart() {
    let store = Arc::new(MemoryLedgerStore::new());

    let mut first = session(
        dec!(0.05),
        store.clone(),
        Arc::new(PaperExchange::new("IDR", dec!(1000000))),
    )
    .await;
    first.cycle(dec!(2000), SEQUENCE_LENGTH).await;
    let opened = first.engine.ledger().list_open()[0].clone();
    drop(first);

    // Restart with a fresh paper exchange holding what the ledger recovered
    let recovered = PositionLedger::load(store.clone()).await.unwrap().list_open();
    assert_eq!(recovered.len(), 1);
    let exchange = Arc::new(PaperExchange::new("IDR", dec!(1000000)));
    exchange.seed_positions(&recovered);
    assert_eq!(exchange.balance("DOGE"), opened.quantity);

    let mut second = session(dec!(0.05), store.clone(), exchange.clone()).await;
    let record = second.cycle(dec!(1890), SEQUENCE_LENGTH).await;

    assert_eq!(record.failures().count(), 0);
    let closed = second.engine.ledger().get(opened.id).unwrap();
    assert_eq!(closed.exit_reason, Some(ExitReason::StopLoss));
    assert_eq!(exchange.balance("DOGE"), Decimal::ZERO);
}
