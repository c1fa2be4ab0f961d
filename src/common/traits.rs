//! Capability traits for the engine's external collaborators
//!
//! The coordinator only ever talks to these traits; concrete clients are
//! constructed once at process start and shared as `Arc<dyn Trait>`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::errors::Result;
use super::types::{
    EventLogEntry, ExchangePosition, LedgerRecord, MarketSnapshot, Order, RawReading, Revision,
    SubmitOutcome,
};

/// Durable key-value/document store for ledgers and the event log
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Read the ledger document for a pair along with its current revision
    ///
    /// A missing document yields `None` and the revision to use for the
    /// first write.
    async fn get_ledger(&self, pair: &str) -> Result<(Option<LedgerRecord>, Revision)>;

    /// Version-checked write
    ///
    /// Returns the new revision, or `EngineError::VersionConflict` if the
    /// stored revision no longer matches `expected`.
    async fn put_ledger(
        &self,
        pair: &str,
        record: &LedgerRecord,
        expected: &Revision,
    ) -> Result<Revision>;

    /// Append an immutable audit entry
    async fn append_event(&self, entry: &EventLogEntry) -> Result<()>;

    /// Most recent `limit` entries for a pair, oldest first
    async fn recent_events(&self, pair: &str, limit: usize) -> Result<Vec<EventLogEntry>>;
}

/// Order-submission service
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Authoritative position for a pair
    async fn get_position(&self, pair: &str) -> Result<ExchangePosition>;

    /// Submit an order keyed by its idempotency key
    ///
    /// Submitting a key that was already accepted must return
    /// `SubmitOutcome::AlreadyProcessed` with the original fill.
    async fn submit_order(&self, order: &Order) -> Result<SubmitOutcome>;

    /// Name used in logs
    fn name(&self) -> &'static str;
}

/// Source of market snapshots
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Latest snapshot for a pair, stamped with the caller's epoch
    async fn latest_snapshot(&self, pair: &str, epoch: u64) -> Result<MarketSnapshot>;
}

/// Source of raw sentiment readings
#[async_trait]
pub trait SentimentSource: Send + Sync {
    async fn raw_readings(&self, pair: &str) -> Result<Vec<RawReading>>;
}

/// Policy input after normalization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedState {
    pub pair: String,
    /// Fractional change versus the previous snapshot
    pub price_return: f64,
    /// Price z-score over the rolling window, clamped to +/-5
    pub price_zscore: f64,
    /// Log ratio of volume to its rolling mean
    pub volume_ratio: f64,
    /// Sentiment value scaled by its confidence
    pub sentiment: f64,
    pub sentiment_confidence: f64,
}

/// Unvalidated policy output; any field may be missing or out of range
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawPolicyOutput {
    #[serde(default)]
    pub direction: Option<String>,
    #[serde(default)]
    pub size_fraction: Option<f64>,
}

impl RawPolicyOutput {
    pub fn new(direction: impl Into<String>, size_fraction: f64) -> Self {
        Self {
            direction: Some(direction.into()),
            size_fraction: Some(size_fraction),
        }
    }
}

/// Black-box policy inference
#[async_trait]
pub trait PolicyInference: Send + Sync {
    /// Version pointer of the model currently published for serving
    async fn current_version(&self) -> Result<String>;

    /// Run inference with a specific model version
    async fn infer(&self, version: &str, state: &NormalizedState) -> Result<RawPolicyOutput>;
}
