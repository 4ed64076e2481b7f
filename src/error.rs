use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Failures that make a forecast impossible. Both skip the current cycle.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ForecastError {
    #[error("insufficient data: need {needed} candles, got {got}")]
    InsufficientData { needed: usize, got: usize },

    #[error("model unavailable: {0}")]
    ModelUnavailable(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("candle already stored for {symbol} at {timestamp}")]
    DuplicateTimestamp {
        symbol: String,
        timestamp: DateTime<Utc>,
    },

    #[error("invalid candle: {0}")]
    InvalidCandle(String),

    #[error("market data backend: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionErrorKind {
    Transient,
    Rejected,
    Unresolved,
}

/// Exchange-side failure for a single order.
///
/// `Transient` covers network errors, timeouts and rate limits and is retried
/// by the gateway. `Rejected` is a definitive answer from the exchange.
/// `Unresolved` means the order was accepted but its final state could not
/// be confirmed; it may have filled and must be reconciled before trading on.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub enum ExecutionError {
    #[error("transient exchange failure: {0}")]
    Transient(String),

    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("order {order_id} outcome unknown: {reason}")]
    Unresolved {
        order_id: String,
        client_order_id: Uuid,
        reason: String,
    },
}

impl ExecutionError {
    pub fn kind(&self) -> ExecutionErrorKind {
        match self {
            ExecutionError::Transient(_) => ExecutionErrorKind::Transient,
            ExecutionError::Rejected(_) => ExecutionErrorKind::Rejected,
            ExecutionError::Unresolved { .. } => ExecutionErrorKind::Unresolved,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ExecutionErrorKind::Transient
    }
}

impl From<reqwest::Error> for ExecutionError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) if status.is_client_error() && status.as_u16() != 429 => {
                ExecutionError::Rejected(err.to_string())
            }
            _ => ExecutionError::Transient(err.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("position {0} not found")]
    NotFound(Uuid),

    #[error("position {0} is already closed")]
    AlreadyClosed(Uuid),

    #[error("ledger persistence failed: {0}")]
    Persistence(String),

    /// Applied in memory but not yet durable; retried next cycle
    #[error("position {id} not persisted: {reason}")]
    Unacknowledged { id: Uuid, reason: String },
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        LedgerError::Persistence(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("{key} is not a valid value: {value:?}")]
    Invalid { key: &'static str, value: String },

    #[error("{key} out of range: {value} (expected {expected})")]
    OutOfRange {
        key: &'static str,
        value: String,
        expected: &'static str,
    },
}

#[derive(Debug, Error)]
#[error("audit sink failed: {0}")]
pub struct AuditError(pub String);

impl From<sqlx::Error> for AuditError {
    fn from(err: sqlx::Error) -> Self {
        AuditError(err.to_string())
    }
}

/// Failures that abort a trading cycle.
///
/// Forecast and execution failures never appear here: the first skips the
/// cycle, the second drops a single action.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Persistence(#[from] LedgerError),

    #[error(transparent)]
    MarketData(#[from] StoreError),

    #[error("market feed unavailable: {0}")]
    MarketFeed(#[from] ExecutionError),

    #[error(transparent)]
    Audit(#[from] AuditError),
}

impl CycleError {
    /// Persistence and audit failures risk divergence between exchange and ledger.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CycleError::Persistence(_) | CycleError::Audit(_))
    }
}
