// Core modules
pub mod audit;
pub mod backtest;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod execution;
pub mod forecast;
pub mod ledger;
pub mod market_data;
pub mod models;
pub mod persistence;
pub mod risk;
pub mod scheduler;

// Re-export commonly used types
pub use config::Settings;
pub use engine::DecisionEngine;
pub use error::CycleError;
pub use models::*;
pub use scheduler::TradingLoop;
