// Immutable per-cycle audit records
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::error::{AuditError, ExecutionErrorKind};
use crate::execution::FillResult;
use crate::ledger::LedgerEffect;
use crate::market_data::FeatureSnapshot;
use crate::models::{Action, Forecast};
use crate::risk::Verdict;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CycleStatus {
    Completed,
    /// Forecast unavailable; nothing was proposed or executed
    Skipped { reason: String },
    /// A ledger write failed; the cycle did not report success
    Aborted { reason: String },
    /// Deadline hit at a state boundary
    Cancelled { at_state: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalRecord {
    pub action: Action,
    pub verdict: Verdict,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecutionOutcome {
    Filled {
        fill: FillResult,
        /// None only if the ledger could not apply the fill at all
        effect: Option<LedgerEffect>,
    },
    Failed {
        kind: ExecutionErrorKind,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub action: Action,
    pub outcome: ExecutionOutcome,
}

/// Everything one cycle saw and did
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub cycle_id: Uuid,
    pub symbol: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub market_price: Decimal,
    pub forecast: Option<Forecast>,
    pub expected_return: Option<Decimal>,
    pub features: Option<FeatureSnapshot>,
    pub proposals: Vec<ProposalRecord>,
    pub executions: Vec<ExecutionRecord>,
    pub status: CycleStatus,
    /// The candle window was too old to forecast from; only exits were managed
    #[serde(default)]
    pub stale_window: bool,
}

impl AuditRecord {
    pub fn new(symbol: &str, market_price: Decimal, started_at: DateTime<Utc>) -> Self {
        Self {
            cycle_id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            started_at,
            finished_at: None,
            market_price,
            forecast: None,
            expected_return: None,
            features: None,
            proposals: Vec::new(),
            executions: Vec::new(),
            status: CycleStatus::Completed,
            stale_window: false,
        }
    }

    /// Ledger writes made by this cycle, in order
    pub fn effects(&self) -> impl Iterator<Item = &LedgerEffect> {
        self.executions.iter().filter_map(|e| match &e.outcome {
            ExecutionOutcome::Filled { effect, .. } => effect.as_ref(),
            ExecutionOutcome::Failed { .. } => None,
        })
    }

    pub fn admitted(&self) -> impl Iterator<Item = &Action> {
        self.proposals
            .iter()
            .filter(|p| p.verdict.is_admitted())
            .map(|p| &p.action)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ExecutionRecord> {
        self.executions
            .iter()
            .filter(|e| matches!(e.outcome, ExecutionOutcome::Failed { .. }))
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: &AuditRecord) -> Result<(), AuditError>;
}

/// Keeps records in memory; the query side of the monitoring boundary
#[derive(Default)]
pub struct MemoryAuditLog {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<AuditRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn history(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<AuditRecord> {
        self.all()
            .into_iter()
            .filter(|r| r.started_at >= start && r.started_at <= end)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AuditSink for MemoryAuditLog {
    async fn record(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let mut records = self
            .records
            .lock()
            .map_err(|e| AuditError(e.to_string()))?;
        records.push(record.clone());
        Ok(())
    }
}

/// Writes a one-line summary of each cycle to the log
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let admitted = record.admitted().count();
        let filled = record.effects().count();
        let failed = record.failures().count();

        match &record.status {
            CycleStatus::Completed => tracing::info!(
                cycle_id = %record.cycle_id,
                "Cycle complete: price {}, expected return {}, {} admitted, {} filled, {} failed",
                record.market_price,
                record
                    .expected_return
                    .map(|r| r.round_dp(4).to_string())
                    .unwrap_or_else(|| "-".to_string()),
                admitted,
                filled,
                failed
            ),
            CycleStatus::Skipped { reason } => {
                tracing::warn!(cycle_id = %record.cycle_id, "Cycle skipped: {}", reason)
            }
            CycleStatus::Aborted { reason } => {
                tracing::error!(cycle_id = %record.cycle_id, "Cycle aborted: {}", reason)
            }
            CycleStatus::Cancelled { at_state } => {
                tracing::warn!(cycle_id = %record.cycle_id, "Cycle cancelled at {}", at_state)
            }
        }
        Ok(())
    }
}

/// Sends each record to every sink; the first failure wins
pub struct FanoutAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl FanoutAuditSink {
    pub fn new(sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl AuditSink for FanoutAuditSink {
    async fn record(&self, record: &AuditRecord) -> Result<(), AuditError> {
        for sink in &self.sinks {
            sink.record(record).await?;
        }
        Ok(())
    }
}

/// Mean absolute percentage error of each forecast against the price seen by
/// the following cycle. Records are matched in `started_at` order.
pub fn prediction_accuracy(records: &[AuditRecord]) -> Option<f64> {
    let mut ordered: Vec<&AuditRecord> = records.iter().collect();
    ordered.sort_by_key(|r| r.started_at);

    let errors: Vec<f64> = ordered
        .windows(2)
        .filter_map(|pair| {
            let predicted = pair[0].forecast.as_ref()?.predicted_value;
            let actual = pair[1].market_price;
            if actual <= Decimal::ZERO {
                return None;
            }
            ((predicted - actual).abs() / actual).to_f64()
        })
        .collect();

    if errors.is_empty() {
        return None;
    }
    Some(errors.iter().sum::<f64>() / errors.len() as f64 * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn record_at(minutes: i64, price: Decimal, predicted: Option<Decimal>) -> AuditRecord {
        let mut record = AuditRecord::new(
            "DOGE/IDR",
            price,
            Utc::now() - Duration::minutes(100 - minutes),
        );
        record.forecast = predicted.map(|p| Forecast {
            as_of: record.started_at,
            predicted_value: p,
            confidence: dec!(0.8),
        });
        record
    }

    #[test]
    fn test_prediction_accuracy() {
        let records = vec![
            record_at(10, dec!(100), Some(dec!(110))),
            // Out of order on purpose
            record_at(20, dec!(100), Some(dec!(95))),
            record_at(15, dec!(100), None),
        ];

        // 10 -> 15: |110 - 100| / 100 = 10%; 15 has no forecast
        let mape = prediction_accuracy(&records).unwrap();
        assert!((mape - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_prediction_accuracy_needs_pairs() {
        assert_eq!(prediction_accuracy(&[]), None);
        assert_eq!(
            prediction_accuracy(&[record_at(1, dec!(100), Some(dec!(101)))]),
            None
        );
    }

    #[test]
    fn test_failures_are_listed() {
        let mut record = record_at(1, dec!(100), None);
        record.executions.push(ExecutionRecord {
            action: Action::open_long(dec!(0.1), "signal"),
            outcome: ExecutionOutcome::Failed {
                kind: ExecutionErrorKind::Rejected,
                reason: "insufficient balance".to_string(),
            },
        });

        assert_eq!(record.failures().count(), 1);
        assert_eq!(record.effects().count(), 0);
    }

    #[tokio::test]
    async fn test_memory_log_history() {
        let log = MemoryAuditLog::new();
        log.record(&record_at(10, dec!(100), None)).await.unwrap();
        log.record(&record_at(90, dec!(101), None)).await.unwrap();

        assert_eq!(log.len(), 2);
        let recent = log.history(Utc::now() - Duration::minutes(30), Utc::now());
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].market_price, dec!(101));
    }

    #[tokio::test]
    async fn test_record_serializes() {
        let record = record_at(1, dec!(100), Some(dec!(105)));
        let json = serde_json::to_value(&record).unwrap();
        let back: AuditRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
