// Risk management module
pub mod manager;

pub use manager::{evaluate, RejectionReason, RiskConfig, RiskManager, Verdict};
