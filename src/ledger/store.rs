use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

use crate::error::LedgerError;
use crate::models::Position;

/// Durable backing store for the position ledger
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert or update a position; returns only once the write is durable
    async fn save_position(&self, position: &Position) -> Result<(), LedgerError>;

    /// All positions, oldest first
    async fn load_positions(&self) -> Result<Vec<Position>, LedgerError>;
}

/// Process-local store for tests, backtests and runs without Postgres
#[derive(Default)]
pub struct MemoryLedgerStore {
    positions: Mutex<HashMap<Uuid, Position>>,
    fail_writes: AtomicBool,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail (simulates the database going away)
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn stored(&self, id: Uuid) -> Option<Position> {
        self.positions.lock().ok()?.get(&id).cloned()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn save_position(&self, position: &Position) -> Result<(), LedgerError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(LedgerError::Persistence("store unavailable".to_string()));
        }
        let mut positions = self
            .positions
            .lock()
            .map_err(|e| LedgerError::Persistence(e.to_string()))?;
        positions.insert(position.id, position.clone());
        Ok(())
    }

    async fn load_positions(&self) -> Result<Vec<Position>, LedgerError> {
        let positions = self
            .positions
            .lock()
            .map_err(|e| LedgerError::Persistence(e.to_string()))?;
        let mut all: Vec<Position> = positions.values().cloned().collect();
        all.sort_by_key(|p| p.opened_at);
        Ok(all)
    }
}
