//! In-memory durable store for paper trading and tests

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::common::errors::{EngineError, Result};
use crate::common::traits::DurableStore;
use crate::common::types::{EventLogEntry, LedgerRecord, Revision};

const ABSENT: &str = "absent";

#[derive(Debug, Default)]
struct StoreState {
    ledgers: HashMap<String, (LedgerRecord, u64)>,
    events: HashMap<String, Vec<EventLogEntry>>,
    next_version: u64,
    failing_puts: u32,
    failing_appends: u32,
}

/// Process-local store with revision counters and fault injection
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` ledger writes fail with a transient error
    pub async fn fail_next_puts(&self, count: u32) {
        self.state.lock().await.failing_puts = count;
    }

    /// Make the next `count` event appends fail with a transient error
    pub async fn fail_next_appends(&self, count: u32) {
        self.state.lock().await.failing_appends = count;
    }

    /// Replace a ledger out of band, bumping its revision
    pub async fn overwrite_ledger(&self, pair: &str, record: LedgerRecord) {
        let mut state = self.state.lock().await;
        state.next_version += 1;
        let version = state.next_version;
        state.ledgers.insert(pair.to_string(), (record, version));
    }

    pub async fn ledger(&self, pair: &str) -> Option<LedgerRecord> {
        self.state
            .lock()
            .await
            .ledgers
            .get(pair)
            .map(|(record, _)| record.clone())
    }

    /// Every event appended for a pair, in append order
    pub async fn events(&self, pair: &str) -> Vec<EventLogEntry> {
        self.state
            .lock()
            .await
            .events
            .get(pair)
            .cloned()
            .unwrap_or_default()
    }
}

fn revision_of(entry: Option<&(LedgerRecord, u64)>) -> Revision {
    match entry {
        Some((_, version)) => Revision::new(version.to_string()),
        None => Revision::new(ABSENT),
    }
}

#[async_trait]
impl DurableStore for InMemoryStore {
    async fn get_ledger(&self, pair: &str) -> Result<(Option<LedgerRecord>, Revision)> {
        let state = self.state.lock().await;
        let entry = state.ledgers.get(pair);
        Ok((entry.map(|(record, _)| record.clone()), revision_of(entry)))
    }

    async fn put_ledger(
        &self,
        pair: &str,
        record: &LedgerRecord,
        expected: &Revision,
    ) -> Result<Revision> {
        let mut state = self.state.lock().await;
        if state.failing_puts > 0 {
            state.failing_puts -= 1;
            return Err(EngineError::transient("store", "injected ledger write failure"));
        }

        let actual = revision_of(state.ledgers.get(pair));
        if &actual != expected {
            return Err(EngineError::VersionConflict {
                expected: expected.clone(),
                actual,
            });
        }

        state.next_version += 1;
        let version = state.next_version;
        state.ledgers.insert(pair.to_string(), (record.clone(), version));
        Ok(Revision::new(version.to_string()))
    }

    async fn append_event(&self, entry: &EventLogEntry) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.failing_appends > 0 {
            state.failing_appends -= 1;
            return Err(EngineError::transient("store", "injected event append failure"));
        }
        state
            .events
            .entry(entry.pair.clone())
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn recent_events(&self, pair: &str, limit: usize) -> Result<Vec<EventLogEntry>> {
        let state = self.state.lock().await;
        let events = state.events.get(pair).map(Vec::as_slice).unwrap_or(&[]);
        let start = events.len().saturating_sub(limit);
        Ok(events[start..].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_version_checked_writes() {
        let store = InMemoryStore::new();
        let (record, revision) = store.get_ledger("BTC/USDT").await.unwrap();
        assert!(record.is_none());

        let seed = LedgerRecord::seed("BTC/USDT", dec!(1000));
        let first = store.put_ledger("BTC/USDT", &seed, &revision).await.unwrap();

        // Stale revision loses
        let err = store.put_ledger("BTC/USDT", &seed, &revision).await.unwrap_err();
        assert!(matches!(err, EngineError::VersionConflict { .. }));

        let second = store.put_ledger("BTC/USDT", &seed, &first).await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_injected_failures_are_transient() {
        let store = InMemoryStore::new();
        store.fail_next_puts(1).await;
        let seed = LedgerRecord::seed("ETH/USDT", dec!(10));
        let err = store
            .put_ledger("ETH/USDT", &seed, &Revision::new(ABSENT))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(store
            .put_ledger("ETH/USDT", &seed, &Revision::new(ABSENT))
            .await
            .is_ok());
    }
}
