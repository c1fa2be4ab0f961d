//! Background event journal for one pair

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::operator::StatusBoard;
use crate::common::channels::create_event_channel;
use crate::common::retry::RetryPolicy;
use crate::common::traits::DurableStore;
use crate::common::types::{EventKind, EventLogEntry};

/// Orders events by (epoch, seq) and appends them off the cycle's path
///
/// Appends are retried with backoff by a writer task; a cycle never waits
/// for the store.
pub struct EventJournal {
    pair: String,
    sender: Option<mpsc::UnboundedSender<EventLogEntry>>,
    writer: Option<JoinHandle<()>>,
    current_epoch: u64,
    next_seq: u32,
}

impl EventJournal {
    pub fn spawn(
        pair: &str,
        store: Arc<dyn DurableStore>,
        retry: RetryPolicy,
        board: StatusBoard,
    ) -> Self {
        let (sender, receiver) = create_event_channel();
        let writer = tokio::spawn(write_events(store, retry, board, receiver));
        Self {
            pair: pair.to_string(),
            sender: Some(sender),
            writer: Some(writer),
            current_epoch: 0,
            next_seq: 0,
        }
    }

    /// Queue an event for `epoch`
    pub fn record(&mut self, epoch: u64, kind: EventKind) -> EventLogEntry {
        if epoch != self.current_epoch {
            self.current_epoch = epoch;
            self.next_seq = 0;
        }
        let entry = EventLogEntry {
            pair: self.pair.clone(),
            epoch,
            seq: self.next_seq,
            kind,
            written_at: Utc::now(),
        };
        self.next_seq += 1;

        match &entry.kind {
            EventKind::Fatal { detail } => error!("[{} #{}] FATAL: {}", self.pair, epoch, detail),
            EventKind::Held { .. } => debug!("[{} #{}] HELD", self.pair, epoch),
            EventKind::Filled { .. } | EventKind::Reconciled { .. } => {
                info!("[{} #{}] {}", self.pair, epoch, entry.kind.label())
            }
            other => warn!("[{} #{}] {}", self.pair, epoch, other.label()),
        }

        if let Some(sender) = &self.sender {
            if sender.send(entry.clone()).is_err() {
                error!("Event writer for {} is gone; dropping {}", self.pair, entry.kind.label());
            }
        }
        entry
    }

    /// Flush queued events and stop the writer
    pub async fn shutdown(&mut self) {
        self.sender.take();
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.await {
                error!("Event writer for {} panicked: {}", self.pair, e);
            }
        }
    }
}

async fn write_events(
    store: Arc<dyn DurableStore>,
    retry: RetryPolicy,
    board: StatusBoard,
    mut receiver: mpsc::UnboundedReceiver<EventLogEntry>,
) {
    while let Some(entry) = receiver.recv().await {
        board.push_event(&entry).await;

        let store = &*store;
        let event = &entry;
        if let Err(e) = retry
            .run("append event", move |_| store.append_event(event))
            .await
        {
            error!(
                "Lost {} event for {} epoch {}: {}",
                entry.kind.label(),
                entry.pair,
                entry.epoch,
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::CycleStage;
    use crate::paper::InMemoryStore;
    use std::time::Duration;

    fn retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            attempt_timeout: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn test_sequence_restarts_per_epoch_and_survives_store_hiccups() {
        let store = Arc::new(InMemoryStore::new());
        store.fail_next_appends(2).await;
        let mut journal = EventJournal::spawn("BTC/USDT", store.clone(), retry(), StatusBoard::new(10));

        let skipped = EventKind::Skipped {
            stage: CycleStage::Gather,
            reason: "down".into(),
        };
        assert_eq!(journal.record(1, skipped.clone()).seq, 0);
        assert_eq!(journal.record(1, skipped.clone()).seq, 1);
        assert_eq!(journal.record(2, skipped).seq, 0);
        journal.shutdown().await;

        let events = store.events("BTC/USDT").await;
        let keys: Vec<(u64, u32)> = events.iter().map(|e| (e.epoch, e.seq)).collect();
        assert_eq!(keys, vec![(1, 0), (1, 1), (2, 0)]);
    }
}
