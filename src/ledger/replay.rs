use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::audit::AuditRecord;
use crate::models::Position;

/// A single ledger write, carrying the position state after the write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LedgerEffect {
    Opened(Position),
    /// Partial close; the position stays Open with a smaller quantity
    Reduced(Position),
    Closed(Position),
}

impl LedgerEffect {
    pub fn position(&self) -> &Position {
        match self {
            LedgerEffect::Opened(p) | LedgerEffect::Reduced(p) | LedgerEffect::Closed(p) => p,
        }
    }
}

/// Point-in-time copy of every position the ledger knows about
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub positions: BTreeMap<Uuid, Position>,
}

impl LedgerSnapshot {
    pub fn from_positions<'a>(positions: impl IntoIterator<Item = &'a Position>) -> Self {
        Self {
            positions: positions.into_iter().map(|p| (p.id, p.clone())).collect(),
        }
    }

    pub fn apply(&mut self, effect: &LedgerEffect) {
        let position = effect.position();
        self.positions.insert(position.id, position.clone());
    }

    pub fn open_positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values().filter(|p| p.is_open())
    }
}

/// Re-apply the ledger effects of one cycle's audit record to a snapshot.
///
/// Effects carry full post-write state, so replaying a record twice is the
/// same as replaying it once.
pub fn replay(snapshot: &LedgerSnapshot, record: &AuditRecord) -> LedgerSnapshot {
    let mut next = snapshot.clone();
    for effect in record.effects() {
        next.apply(effect);
    }
    next
}
