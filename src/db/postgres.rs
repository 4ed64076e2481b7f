use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};

use crate::audit::{AuditRecord, AuditSink, CycleStatus};
use crate::error::{AuditError, LedgerError};
use crate::ledger::LedgerStore;
use crate::models::{ExitReason, Position, PositionStatus};

/// Postgres persistence for the position ledger and the audit log
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Connect and run pending migrations
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("Connected to Postgres (positions & audit log)");

        Ok(Self { pool })
    }

    /// Positions opened at or after `cutoff`
    pub async fn load_positions_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Position>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT id, symbol, entry_order_id, entry_price, size, quantity, opened_at,
                   stop_loss_price, take_profit_price, status,
                   close_price, closed_at, realized_pnl, exit_reason
            FROM positions
            WHERE opened_at >= $1
            ORDER BY opened_at ASC
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(position_from_row).collect()
    }

    /// Total realized P&L over closed positions
    pub async fn total_realized_pnl(&self) -> Result<rust_decimal::Decimal, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(realized_pnl), 0) AS total_pnl
            FROM positions
            WHERE status = 'Closed'
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("total_pnl"))
    }

    /// Audit records whose cycle started within `[start, end]`, oldest first
    pub async fn load_audit_records(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<AuditRecord>, AuditError> {
        let rows = sqlx::query(
            r#"
            SELECT record
            FROM audit_records
            WHERE symbol = $1 AND started_at >= $2 AND started_at <= $3
            ORDER BY started_at ASC
            "#,
        )
        .bind(symbol)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let Json(record): Json<AuditRecord> = row.try_get("record")?;
            records.push(record);
        }
        Ok(records)
    }

    /// Delete all positions (testing only)
    #[cfg(test)]
    pub async fn clear_all_positions(&self) -> Result<()> {
        sqlx::query("DELETE FROM positions").execute(&self.pool).await?;
        Ok(())
    }

    /// Delete all audit records (testing only)
    #[cfg(test)]
    pub async fn clear_audit_records(&self) -> Result<()> {
        sqlx::query("DELETE FROM audit_records")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn position_from_row(row: &PgRow) -> Result<Position, LedgerError> {
    let status_str: String = row.try_get("status")?;
    let status = match status_str.as_str() {
        "Open" => PositionStatus::Open,
        "Closed" => PositionStatus::Closed,
        other => {
            return Err(LedgerError::Persistence(format!(
                "invalid position status {:?}",
                other
            )))
        }
    };

    let exit_reason_str: Option<String> = row.try_get("exit_reason")?;
    let exit_reason = match exit_reason_str.as_deref() {
        None => None,
        Some(value) => Some(ExitReason::parse(value).ok_or_else(|| {
            LedgerError::Persistence(format!("invalid exit reason {:?}", value))
        })?),
    };

    Ok(Position {
        id: row.try_get("id")?,
        symbol: row.try_get("symbol")?,
        entry_order_id: row.try_get("entry_order_id")?,
        entry_price: row.try_get("entry_price")?,
        size: row.try_get("size")?,
        quantity: row.try_get("quantity")?,
        opened_at: row.try_get("opened_at")?,
        stop_loss_price: row.try_get("stop_loss_price")?,
        take_profit_price: row.try_get("take_profit_price")?,
        status,
        close_price: row.try_get("close_price")?,
        closed_at: row.try_get("closed_at")?,
        realized_pnl: row.try_get("realized_pnl")?,
        exit_reason,
    })
}

fn status_label(status: &CycleStatus) -> &'static str {
    match status {
        CycleStatus::Completed => "Completed",
        CycleStatus::Skipped { .. } => "Skipped",
        CycleStatus::Aborted { .. } => "Aborted",
        CycleStatus::Cancelled { .. } => "Cancelled",
    }
}

#[async_trait]
impl LedgerStore for PostgresPersistence {
    async fn save_position(&self, position: &Position) -> Result<(), LedgerError> {
        let status_str = match position.status {
            PositionStatus::Open => "Open",
            PositionStatus::Closed => "Closed",
        };

        sqlx::query(
            r#"
            INSERT INTO positions (
                id, symbol, entry_order_id, entry_price, size, quantity, opened_at,
                stop_loss_price, take_profit_price, status,
                close_price, closed_at, realized_pnl, exit_reason
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO UPDATE SET
                size = EXCLUDED.size,
                quantity = EXCLUDED.quantity,
                status = EXCLUDED.status,
                close_price = EXCLUDED.close_price,
                closed_at = EXCLUDED.closed_at,
                realized_pnl = EXCLUDED.realized_pnl,
                exit_reason = EXCLUDED.exit_reason,
                updated_at = NOW()
            "#,
        )
        .bind(position.id)
        .bind(&position.symbol)
        .bind(&position.entry_order_id)
        .bind(position.entry_price)
        .bind(position.size)
        .bind(position.quantity)
        .bind(position.opened_at)
        .bind(position.stop_loss_price)
        .bind(position.take_profit_price)
        .bind(status_str)
        .bind(position.close_price)
        .bind(position.closed_at)
        .bind(position.realized_pnl)
        .bind(position.exit_reason.map(|r| r.as_str()))
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            "Saved position {} for {} to Postgres",
            position.id,
            position.symbol
        );

        Ok(())
    }

    async fn load_positions(&self) -> Result<Vec<Position>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT id, symbol, entry_order_id, entry_price, size, quantity, opened_at,
                   stop_loss_price, take_profit_price, status,
                   close_price, closed_at, realized_pnl, exit_reason
            FROM positions
            ORDER BY opened_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let positions: Vec<Position> = rows
            .iter()
            .map(position_from_row)
            .collect::<Result<_, _>>()?;

        tracing::info!("Loaded {} positions from Postgres", positions.len());

        Ok(positions)
    }
}

#[async_trait]
impl AuditSink for PostgresPersistence {
    async fn record(&self, record: &AuditRecord) -> Result<(), AuditError> {
        sqlx::query(
            r#"
            INSERT INTO audit_records (cycle_id, symbol, started_at, finished_at, status, record)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (cycle_id) DO NOTHING
            "#,
        )
        .bind(record.cycle_id)
        .bind(&record.symbol)
        .bind(record.started_at)
        .bind(record.finished_at)
        .bind(status_label(&record.status))
        .bind(Json(record))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
