use config::{Config, Environment};
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::DecisionParams;
use crate::error::ConfigError;
use crate::execution::RetryPolicy;
use crate::models::split_symbol;
use crate::risk::RiskConfig;

/// Runtime settings, read from the environment (after `.env`) and validated
/// once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub symbol: String,
    pub update_interval: Duration,
    pub sequence_length: usize,
    pub prediction_threshold: Decimal,
    pub position_size: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub max_positions: usize,
    pub min_confidence: Decimal,
    pub order_max_retries: u32,
    pub order_backoff: Duration,
    pub candle_timeframe: String,
    /// Stored candles older than this are pruned
    pub candle_retention_hours: u64,
    pub model_path: PathBuf,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub exchange_base_url: Option<String>,
    pub exchange_api_key: Option<String>,
    pub exchange_api_secret: Option<String>,
    pub paper_trading: bool,
    pub initial_balance: Decimal,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self::builder()?.add_source(Environment::default()).build()?;
        Self::from_config(&config)
    }

    /// Builder pre-loaded with every default; keys are lowercase
    pub fn builder() -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        Ok(Config::builder()
            .set_default("trading_symbol", "DOGE/IDR")?
            .set_default("update_interval", 300)?
            .set_default("sequence_length", 60)?
            .set_default("prediction_threshold", "0.02")?
            .set_default("position_size", "0.1")?
            .set_default("stop_loss", "0.05")?
            .set_default("take_profit", "0.1")?
            .set_default("max_positions", 3)?
            .set_default("min_confidence", "0.3")?
            .set_default("order_max_retries", 3)?
            .set_default("order_backoff_ms", 500)?
            .set_default("candle_timeframe", "1h")?
            .set_default("candle_retention_hours", 720)?
            .set_default("model_path", "models/forecaster.json")?
            .set_default("paper_trading", true)?
            .set_default("initial_balance", "1000000")?)
    }

    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let settings = Self {
            symbol: config.get_string("trading_symbol")?.trim().to_string(),
            update_interval: Duration::from_secs(non_negative(config, "update_interval", "UPDATE_INTERVAL")?),
            sequence_length: non_negative(config, "sequence_length", "SEQUENCE_LENGTH")? as usize,
            prediction_threshold: decimal(config, "prediction_threshold", "PREDICTION_THRESHOLD")?,
            position_size: decimal(config, "position_size", "POSITION_SIZE")?,
            stop_loss: decimal(config, "stop_loss", "STOP_LOSS")?,
            take_profit: decimal(config, "take_profit", "TAKE_PROFIT")?,
            max_positions: non_negative(config, "max_positions", "MAX_POSITIONS")? as usize,
            min_confidence: decimal(config, "min_confidence", "MIN_CONFIDENCE")?,
            order_max_retries: non_negative(config, "order_max_retries", "ORDER_MAX_RETRIES")? as u32,
            order_backoff: Duration::from_millis(non_negative(config, "order_backoff_ms", "ORDER_BACKOFF_MS")?),
            candle_timeframe: config.get_string("candle_timeframe")?.trim().to_string(),
            candle_retention_hours: non_negative(config, "candle_retention_hours", "CANDLE_RETENTION_HOURS")?,
            model_path: PathBuf::from(config.get_string("model_path")?),
            database_url: optional(config, "database_url"),
            redis_url: optional(config, "redis_url"),
            exchange_base_url: optional(config, "exchange_base_url"),
            exchange_api_key: optional(config, "exchange_api_key"),
            exchange_api_secret: optional(config, "exchange_api_secret"),
            paper_trading: config.get_bool("paper_trading")?,
            initial_balance: decimal(config, "initial_balance", "INITIAL_BALANCE")?,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Fail fast on anything outside its documented range
    pub fn validate(&self) -> Result<(), ConfigError> {
        let zero = Decimal::ZERO;
        let one = Decimal::ONE;

        if split_symbol(&self.symbol).is_none() {
            return Err(ConfigError::Invalid {
                key: "TRADING_SYMBOL",
                value: self.symbol.clone(),
            });
        }
        check(self.update_interval.as_secs() >= 1, "UPDATE_INTERVAL", self.update_interval.as_secs(), ">= 1")?;
        check(self.sequence_length >= 2, "SEQUENCE_LENGTH", self.sequence_length, ">= 2")?;
        check(
            self.prediction_threshold > zero && self.prediction_threshold < one,
            "PREDICTION_THRESHOLD",
            self.prediction_threshold,
            "0 < x < 1",
        )?;
        check(
            self.position_size > zero && self.position_size <= one,
            "POSITION_SIZE",
            self.position_size,
            "0 < x <= 1",
        )?;
        check(
            self.stop_loss > zero && self.stop_loss < one,
            "STOP_LOSS",
            self.stop_loss,
            "0 < x < 1",
        )?;
        check(self.take_profit > zero, "TAKE_PROFIT", self.take_profit, "> 0")?;
        check(self.max_positions >= 1, "MAX_POSITIONS", self.max_positions, ">= 1")?;
        check(
            self.min_confidence >= zero && self.min_confidence < one,
            "MIN_CONFIDENCE",
            self.min_confidence,
            "0 <= x < 1",
        )?;
        check(self.order_max_retries <= 10, "ORDER_MAX_RETRIES", self.order_max_retries, "<= 10")?;
        check(
            self.order_backoff.as_millis() >= 1,
            "ORDER_BACKOFF_MS",
            self.order_backoff.as_millis(),
            ">= 1",
        )?;
        if self.candle_period().is_none() {
            return Err(ConfigError::Invalid {
                key: "CANDLE_TIMEFRAME",
                value: self.candle_timeframe.clone(),
            });
        }
        check(
            self.candle_retention_hours >= 1,
            "CANDLE_RETENTION_HOURS",
            self.candle_retention_hours,
            ">= 1",
        )?;
        if self.paper_trading {
            check(self.initial_balance > zero, "INITIAL_BALANCE", self.initial_balance, "> 0")?;
        }
        Ok(())
    }

    /// Length of one candle, from a timeframe such as "5m", "1h" or "1d"
    pub fn candle_period(&self) -> Option<Duration> {
        parse_timeframe(&self.candle_timeframe)
    }

    /// Oldest the last candle may be before the window counts as stale: two
    /// candle periods plus one update interval
    pub fn max_window_age(&self) -> chrono::Duration {
        let period = self.candle_period().unwrap_or(Duration::from_secs(3600));
        chrono::Duration::from_std(period * 2 + self.update_interval)
            .unwrap_or_else(|_| chrono::Duration::days(1))
    }

    pub fn candle_retention(&self) -> chrono::Duration {
        i64::try_from(self.candle_retention_hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
            .unwrap_or(chrono::Duration::MAX)
    }

    pub fn base_asset(&self) -> &str {
        split_symbol(&self.symbol).map(|(base, _)| base).unwrap_or_default()
    }

    pub fn quote_asset(&self) -> &str {
        split_symbol(&self.symbol).map(|(_, quote)| quote).unwrap_or_default()
    }

    pub fn risk_config(&self) -> RiskConfig {
        RiskConfig {
            position_size: self.position_size,
            stop_loss_pct: self.stop_loss,
            take_profit_pct: self.take_profit,
            max_positions: self.max_positions,
        }
    }

    pub fn decision_params(&self) -> DecisionParams {
        DecisionParams {
            prediction_threshold: self.prediction_threshold,
            min_confidence: self.min_confidence,
            position_size: self.position_size,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.order_max_retries,
            base_delay: self.order_backoff,
            ..RetryPolicy::default()
        }
    }

    pub fn log_summary(&self) {
        tracing::info!("📊 Configuration:");
        tracing::info!("  Symbol: {} ({} candles)", self.symbol, self.candle_timeframe);
        tracing::info!("  Interval: {}s", self.update_interval.as_secs());
        tracing::info!("  Sequence length: {}", self.sequence_length);
        tracing::info!(
            "  Threshold: {} | Min confidence: {}",
            self.prediction_threshold,
            self.min_confidence
        );
        tracing::info!(
            "  Position size: {} | Stop loss: {} | Take profit: {} | Max positions: {}",
            self.position_size,
            self.stop_loss,
            self.take_profit,
            self.max_positions
        );
        tracing::info!(
            "  Mode: {}",
            if self.paper_trading { "paper" } else { "live" }
        );
    }
}

fn decimal(config: &Config, key: &str, name: &'static str) -> Result<Decimal, ConfigError> {
    let raw = config.get_string(key)?;
    Decimal::from_str(raw.trim()).map_err(|_| ConfigError::Invalid {
        key: name,
        value: raw,
    })
}

fn non_negative(config: &Config, key: &str, name: &'static str) -> Result<u64, ConfigError> {
    let value = config.get_int(key)?;
    u64::try_from(value).map_err(|_| ConfigError::OutOfRange {
        key: name,
        value: value.to_string(),
        expected: ">= 0",
    })
}

fn parse_timeframe(timeframe: &str) -> Option<Duration> {
    let (split, _) = timeframe.char_indices().last()?;
    let (count, unit) = timeframe.split_at(split);
    let count: u64 = count.parse().ok().filter(|n| *n > 0)?;
    let unit_secs = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86_400,
        "w" => 604_800,
        _ => return None,
    };
    count.checked_mul(unit_secs).map(Duration::from_secs)
}

fn optional(config: &Config, key: &str) -> Option<String> {
    config
        .get_string(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn check(
    ok: bool,
    key: &'static str,
    value: impl ToString,
    expected: &'static str,
) -> Result<(), ConfigError> {
    if ok {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            key,
            value: value.to_string(),
            expected,
        })
    }
}
