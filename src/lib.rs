//! Adaptive Trader Library
//!
//! Per-pair execution engine that turns sentiment-aware RL policy signals
//! into risk-checked, idempotent orders against a crash-safe ledger.

pub mod binance;
pub mod common;
pub mod config;
pub mod engine;
pub mod firebase;
pub mod ledger;
pub mod paper;
pub mod policy;
pub mod risk;
pub mod sentiment;

// Re-export commonly used types
pub use common::errors::{EngineError, Result};
pub use common::retry::RetryPolicy;
pub use common::traits::{DurableStore, Exchange, MarketDataSource, PolicyInference, SentimentSource};
pub use common::types::{
    CycleStage, Direction, EventKind, EventLogEntry, Fill, LedgerRecord, MarketSnapshot, Order,
    PolicyAction, Position, RiskDecision, SentimentScore, Side, SubmitOutcome,
};
pub use config::types::EngineConfig;
pub use engine::{Collaborators, CycleOutcome, CycleReport, ExecutionCoordinator, OperatorHandle, WorkerPool};
pub use ledger::Ledger;
pub use risk::RiskManager;
