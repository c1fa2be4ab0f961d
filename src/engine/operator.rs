//! Operator surface: status board, kill-switches and policy reload

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::common::errors::{EngineError, Result};
use crate::common::traits::DurableStore;
use crate::common::types::{CapitalLedger, EventLogEntry, LedgerRecord, Position};
use crate::policy::ReloadHandle;

/// What an operator sees for one pair
#[derive(Debug, Clone, Serialize)]
pub struct PairStatus {
    pub pair: String,
    pub capital: Option<CapitalLedger>,
    pub position: Option<Position>,
    pub last_epoch: u64,
    pub recent_events: VecDeque<EventLogEntry>,
    /// Set once the worker has stopped on a fatal error
    pub halted: Option<String>,
    pub kill_switch: bool,
}

impl PairStatus {
    fn new(pair: &str) -> Self {
        Self {
            pair: pair.to_string(),
            capital: None,
            position: None,
            last_epoch: 0,
            recent_events: VecDeque::new(),
            halted: None,
            kill_switch: false,
        }
    }
}

/// Shared, read-mostly view of every pair's state
#[derive(Debug, Clone)]
pub struct StatusBoard {
    pairs: Arc<RwLock<HashMap<String, PairStatus>>>,
    event_limit: usize,
}

impl StatusBoard {
    pub fn new(event_limit: usize) -> Self {
        Self {
            pairs: Arc::new(RwLock::new(HashMap::new())),
            event_limit: event_limit.max(1),
        }
    }

    pub async fn register(&self, pair: &str) {
        self.pairs
            .write()
            .await
            .entry(pair.to_string())
            .or_insert_with(|| PairStatus::new(pair));
    }

    pub async fn update_ledger(&self, pair: &str, record: &LedgerRecord) {
        let mut pairs = self.pairs.write().await;
        let status = pairs
            .entry(pair.to_string())
            .or_insert_with(|| PairStatus::new(pair));
        status.capital = Some(record.capital.clone());
        status.position = Some(record.position.clone());
        status.last_epoch = record.last_epoch;
    }

    pub async fn push_event(&self, entry: &EventLogEntry) {
        let mut pairs = self.pairs.write().await;
        let status = pairs
            .entry(entry.pair.clone())
            .or_insert_with(|| PairStatus::new(&entry.pair));
        if status.recent_events.len() == self.event_limit {
            status.recent_events.pop_front();
        }
        status.recent_events.push_back(entry.clone());
    }

    pub async fn mark_halted(&self, pair: &str, reason: &str) {
        let mut pairs = self.pairs.write().await;
        let status = pairs
            .entry(pair.to_string())
            .or_insert_with(|| PairStatus::new(pair));
        status.halted = Some(reason.to_string());
    }

    async fn set_kill_switch(&self, pair: &str, engaged: bool) {
        if let Some(status) = self.pairs.write().await.get_mut(pair) {
            status.kill_switch = engaged;
        }
    }

    pub async fn get(&self, pair: &str) -> Option<PairStatus> {
        self.pairs.read().await.get(pair).cloned()
    }

    /// All pairs, sorted by name
    pub async fn all(&self) -> Vec<PairStatus> {
        let mut statuses: Vec<PairStatus> = self.pairs.read().await.values().cloned().collect();
        statuses.sort_by(|a, b| a.pair.cmp(&b.pair));
        statuses
    }
}

/// Per-pair switch that forces HOLD on every policy decision
#[derive(Debug, Clone, Default)]
pub struct KillSwitch {
    engaged: Arc<AtomicBool>,
}

impl KillSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, engaged: bool) {
        self.engaged.store(engaged, Ordering::SeqCst);
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged.load(Ordering::SeqCst)
    }
}

/// Handle given to whatever drives operations (CLI, admin endpoint, tests)
#[derive(Clone)]
pub struct OperatorHandle {
    board: StatusBoard,
    switches: HashMap<String, KillSwitch>,
    reload: ReloadHandle,
    store: Arc<dyn DurableStore>,
}

impl OperatorHandle {
    pub fn new(
        board: StatusBoard,
        switches: HashMap<String, KillSwitch>,
        reload: ReloadHandle,
        store: Arc<dyn DurableStore>,
    ) -> Self {
        Self {
            board,
            switches,
            reload,
            store,
        }
    }

    pub async fn status(&self, pair: &str) -> Option<PairStatus> {
        self.board.get(pair).await
    }

    pub async fn statuses(&self) -> Vec<PairStatus> {
        self.board.all().await
    }

    /// Engage or release the kill-switch for a pair
    pub async fn set_hold(&self, pair: &str, engaged: bool) -> Result<()> {
        let switch = self
            .switches
            .get(pair)
            .ok_or_else(|| EngineError::Validation(format!("unknown pair {}", pair)))?;
        switch.set(engaged);
        self.board.set_kill_switch(pair, engaged).await;
        if engaged {
            warn!("Kill-switch engaged for {}", pair);
        } else {
            info!("Kill-switch released for {}", pair);
        }
        Ok(())
    }

    /// Ask every policy adapter to re-read its model version
    pub fn request_policy_reload(&self) {
        info!("Policy reload requested");
        self.reload.request_reload();
    }

    /// Durable event history, oldest first
    pub async fn event_history(&self, pair: &str, limit: usize) -> Result<Vec<EventLogEntry>> {
        self.store.recent_events(pair, limit).await
    }
}
