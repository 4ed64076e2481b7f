// Authoritative record of open and closed positions
pub mod replay;
pub mod store;

pub use replay::{replay, LedgerEffect, LedgerSnapshot};
pub use store::{LedgerStore, MemoryLedgerStore};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::LedgerError;
use crate::models::{ExitReason, PortfolioState, Position, PositionStatus};

/// Everything needed to record a confirmed entry fill
#[derive(Debug, Clone)]
pub struct PositionEntry {
    pub symbol: String,
    pub entry_order_id: String,
    pub entry_price: Decimal,
    pub size: Decimal,
    pub quantity: Decimal,
    pub opened_at: DateTime<Utc>,
    pub stop_loss_price: Decimal,
    pub take_profit_price: Decimal,
}

/// Sole writer of position state.
///
/// Every change is written to the store before it is acknowledged. When the
/// write fails the change is still cached (the exchange already filled) and
/// marked pending; `flush_pending` retries it at the start of the next cycle.
pub struct PositionLedger {
    positions: Vec<Position>,
    store: Arc<dyn LedgerStore>,
    pending: BTreeSet<Uuid>,
}

impl PositionLedger {
    /// Restore the ledger from its store
    pub async fn load(store: Arc<dyn LedgerStore>) -> Result<Self, LedgerError> {
        let positions = store.load_positions().await?;

        let open = positions.iter().filter(|p| p.is_open()).count();
        let realized: Decimal = positions
            .iter()
            .filter(|p| p.status == PositionStatus::Closed)
            .filter_map(|p| p.realized_pnl)
            .sum();
        tracing::info!(
            "Restored {} positions ({} open, realized P&L {})",
            positions.len(),
            open,
            realized
        );

        Ok(Self {
            positions,
            store,
            pending: BTreeSet::new(),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            positions: Vec::new(),
            store: Arc::new(MemoryLedgerStore::new()),
            pending: BTreeSet::new(),
        }
    }

    /// Record a new open position from a confirmed fill
    pub async fn open(&mut self, entry: PositionEntry) -> Result<Position, LedgerError> {
        let position = Position {
            id: Uuid::new_v4(),
            symbol: entry.symbol,
            entry_order_id: entry.entry_order_id,
            entry_price: entry.entry_price,
            size: entry.size,
            quantity: entry.quantity,
            opened_at: entry.opened_at,
            stop_loss_price: entry.stop_loss_price,
            take_profit_price: entry.take_profit_price,
            status: PositionStatus::Open,
            close_price: None,
            closed_at: None,
            realized_pnl: None,
            exit_reason: None,
        };

        self.positions.push(position.clone());
        self.persist(&position).await?;

        tracing::info!(
            "Opened position {} for {}: {} @ {} (size {})",
            position.id,
            position.symbol,
            position.quantity,
            position.entry_price,
            position.size
        );

        Ok(position)
    }

    /// Close a position in full at `price`
    pub async fn close(
        &mut self,
        id: Uuid,
        price: Decimal,
        at: DateTime<Utc>,
        reason: ExitReason,
    ) -> Result<Position, LedgerError> {
        let position = self.get_open_mut(id)?;

        let pnl = (price - position.entry_price) * position.quantity;
        position.status = PositionStatus::Closed;
        position.close_price = Some(price);
        position.closed_at = Some(at);
        position.realized_pnl = Some(position.realized_pnl.unwrap_or_default() + pnl);
        position.exit_reason = Some(reason);

        let closed = position.clone();
        self.persist(&closed).await?;

        tracing::info!(
            "Closed position {} @ {} ({:?}), realized P&L {}",
            closed.id,
            price,
            reason,
            closed.realized_pnl.unwrap_or_default()
        );

        Ok(closed)
    }

    /// Record a partial close of `quantity` at `price`. The position stays
    /// Open; its size shrinks in proportion to the remaining quantity.
    pub async fn reduce(
        &mut self,
        id: Uuid,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<Position, LedgerError> {
        let position = self.get_open_mut(id)?;
        let closed_quantity = quantity.min(position.quantity);
        let remaining = position.quantity - closed_quantity;

        let pnl = (price - position.entry_price) * closed_quantity;
        if position.quantity > Decimal::ZERO {
            position.size = (position.size * remaining / position.quantity).round_dp(8);
        }
        position.quantity = remaining;
        position.realized_pnl = Some(position.realized_pnl.unwrap_or_default() + pnl);

        let reduced = position.clone();
        self.persist(&reduced).await?;

        tracing::warn!(
            "Partially closed position {}: {} filled, {} remaining",
            reduced.id,
            closed_quantity,
            reduced.quantity
        );

        Ok(reduced)
    }

    /// Retry writes that failed in earlier cycles; returns how many were flushed
    pub async fn flush_pending(&mut self) -> Result<usize, LedgerError> {
        let ids: Vec<Uuid> = self.pending.iter().copied().collect();
        for id in &ids {
            if let Some(position) = self.positions.iter().find(|p| p.id == *id) {
                self.store.save_position(position).await?;
            }
            self.pending.remove(id);
        }
        if !ids.is_empty() {
            tracing::info!("Flushed {} pending ledger writes", ids.len());
        }
        Ok(ids.len())
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    async fn persist(&mut self, position: &Position) -> Result<(), LedgerError> {
        match self.store.save_position(position).await {
            Ok(()) => {
                self.pending.remove(&position.id);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to persist position {}: {}", position.id, e);
                self.pending.insert(position.id);
                Err(LedgerError::Unacknowledged {
                    id: position.id,
                    reason: e.to_string(),
                })
            }
        }
    }

    fn get_open_mut(&mut self, id: Uuid) -> Result<&mut Position, LedgerError> {
        let position = self
            .positions
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or(LedgerError::NotFound(id))?;
        if !position.is_open() {
            return Err(LedgerError::AlreadyClosed(id));
        }
        Ok(position)
    }

    pub fn get(&self, id: Uuid) -> Option<&Position> {
        self.positions.iter().find(|p| p.id == id)
    }

    pub fn list_open(&self) -> Vec<Position> {
        self.positions.iter().filter(|p| p.is_open()).cloned().collect()
    }

    /// Positions opened or closed within `[start, end]`
    pub fn history(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Position> {
        let in_range = |t: DateTime<Utc>| t >= start && t <= end;
        self.positions
            .iter()
            .filter(|p| in_range(p.opened_at) || p.closed_at.map(in_range).unwrap_or(false))
            .cloned()
            .collect()
    }

    pub fn all_positions(&self) -> &[Position] {
        &self.positions
    }

    pub fn realized_pnl(&self) -> Decimal {
        self.positions.iter().filter_map(|p| p.realized_pnl).sum()
    }

    pub fn portfolio(&self, available_balance: Decimal) -> PortfolioState {
        PortfolioState::new(self.list_open(), available_balance)
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot::from_positions(&self.positions)
    }
}
