// Offline replay of candle series through the decision engine
pub mod metrics;
pub mod runner;
pub mod synthetic;

pub use metrics::{BacktestMetrics, CycleStats, TradeRecord};
pub use runner::BacktestRunner;
pub use synthetic::{MarketScenario, SyntheticDataGenerator};
