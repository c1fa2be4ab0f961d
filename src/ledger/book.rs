//! Per-pair position and capital book

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, error, info, instrument, warn};

use crate::common::errors::{EngineError, Result};
use crate::common::retry::RetryPolicy;
use crate::common::traits::DurableStore;
use crate::common::types::{ExchangePosition, Fill, LedgerRecord, LedgerSnapshot, Position, Revision};
use crate::risk::RiskManager;

/// Difference found between the stored and exchange positions
#[derive(Debug, Clone, PartialEq)]
pub struct Discrepancy {
    pub old_quantity: Decimal,
    pub new_quantity: Decimal,
    pub capital_adjustment: Decimal,
}

/// Owned, in-memory copy of a pair's durable ledger
///
/// Only the pair's worker holds one. Mutations happen in memory and are
/// made durable with [`Ledger::persist`]; a failed persist is undone with
/// [`Ledger::rollback`].
#[derive(Debug, Clone)]
pub struct Ledger {
    pair: String,
    record: LedgerRecord,
    revision: Revision,
    checkpoint: Option<LedgerRecord>,
}

impl Ledger {
    /// Load the pair's ledger, seeding it with `initial_capital` if absent
    #[instrument(skip(store, retry))]
    pub async fn load(
        store: &dyn DurableStore,
        pair: &str,
        initial_capital: Decimal,
        retry: &RetryPolicy,
    ) -> Result<Self> {
        let (stored, revision) = retry
            .run("load ledger", move |_| store.get_ledger(pair))
            .await?;

        match stored {
            Some(record) => {
                info!(
                    "Loaded ledger for {}: available {}, position {} @ {}, last epoch {}",
                    pair,
                    record.capital.available_capital,
                    record.position.quantity,
                    record.position.entry_price,
                    record.last_epoch
                );
                Ok(Self::from_record(pair, record, revision))
            }
            None => {
                info!("Seeding ledger for {} with {}", pair, initial_capital);
                let mut ledger = Self::from_record(pair, LedgerRecord::seed(pair, initial_capital), revision);
                ledger.persist(store, retry).await?;
                Ok(ledger)
            }
        }
    }

    pub fn from_record(pair: &str, record: LedgerRecord, revision: Revision) -> Self {
        Self {
            pair: pair.to_string(),
            record,
            revision,
            checkpoint: None,
        }
    }

    pub fn pair(&self) -> &str {
        &self.pair
    }

    pub fn record(&self) -> &LedgerRecord {
        &self.record
    }

    pub fn position(&self) -> &Position {
        &self.record.position
    }

    pub fn last_epoch(&self) -> u64 {
        self.record.last_epoch
    }

    pub fn revision(&self) -> &Revision {
        &self.revision
    }

    pub fn snapshot(&self, mark_price: Decimal) -> LedgerSnapshot {
        LedgerSnapshot {
            capital: self.record.capital.clone(),
            position: self.record.position.clone(),
            mark_price,
        }
    }

    /// Remember the current state as the point to roll back to
    pub fn checkpoint(&mut self) {
        self.checkpoint = Some(self.record.clone());
    }

    /// Restore the last checkpoint, discarding unpersisted changes
    pub fn rollback(&mut self) {
        if let Some(record) = self.checkpoint.clone() {
            warn!("Rolling back in-memory ledger for {}", self.pair);
            self.record = record;
        }
    }

    pub fn mark_epoch(&mut self, epoch: u64) {
        self.record.last_epoch = self.record.last_epoch.max(epoch);
    }

    /// Move cash from available to reserved ahead of a buy
    pub fn reserve(&mut self, amount: Decimal) {
        let capital = &mut self.record.capital;
        let amount = amount.max(Decimal::ZERO).min(capital.available_capital);
        capital.available_capital -= amount;
        capital.reserved_capital += amount;
    }


    /// Apply a confirmed fill; returns realized PnL before fees
    ///
    /// Adding to a position moves the entry to the weighted average,
    /// reducing realizes PnL against the entry, and crossing zero re-enters
    /// at the fill price. Protective levels are re-anchored to the entry
    /// whenever exposure grows.
    pub fn apply_fill(&mut self, fill: &Fill, risk: &RiskManager) -> Result<Decimal> {
        let signed = fill.signed_quantity();
        let available = self.record.capital.cash() - signed * fill.price - fill.fee;
        if available < Decimal::ZERO {
            error!(
                "Fill {} for {} would overdraw capital to {}",
                fill.idempotency_key, self.pair, available
            );
            return Err(EngineError::FatalState(format!(
                "fill {} overdraws {} capital to {}",
                fill.idempotency_key, self.pair, available
            )));
        }

        let position = &mut self.record.position;
        let old = position.quantity;
        let new = old + signed;
        let mut realized = Decimal::ZERO;
        let grows = old.is_zero() || old.is_sign_positive() == signed.is_sign_positive();

        if grows {
            position.entry_price =
                (old.abs() * position.entry_price + fill.quantity * fill.price) / new.abs();
        } else {
            let closed = old.abs().min(fill.quantity);
            let closed = if old.is_sign_negative() { -closed } else { closed };
            realized = (fill.price - position.entry_price) * closed;
            if new.is_zero() {
                position.entry_price = Decimal::ZERO;
            } else if new.is_sign_positive() != old.is_sign_positive() {
                position.entry_price = fill.price;
            }
        }
        position.quantity = new;

        let flipped = !grows && !new.is_zero() && new.is_sign_positive() != old.is_sign_positive();
        if new.is_zero() {
            position.stop_loss_price = None;
            position.take_profit_price = None;
        } else if grows || flipped {
            let (stop, target) = risk.protective_levels(new > Decimal::ZERO, position.entry_price);
            position.stop_loss_price = Some(stop);
            position.take_profit_price = Some(target);
        }

        self.record.capital.available_capital = available;
        self.record.capital.reserved_capital = Decimal::ZERO;
        debug!(
            "Applied fill {} {} {} @ {} to {}: position {} -> {}, available {}",
            fill.idempotency_key, fill.side, fill.quantity, fill.price, self.pair, old, new, available
        );
        Ok(realized)
    }

    /// Overwrite the stored position with the exchange's authoritative one
    ///
    /// Capital moves by the opposite of the quantity change at the
    /// reference price, floored at zero. Returns `None` when the books
    /// already agree.
    pub fn repair(
        &mut self,
        exchange: &ExchangePosition,
        reference_price: Decimal,
        risk: &RiskManager,
    ) -> Option<Discrepancy> {
        let position = &mut self.record.position;
        let old = position.quantity;
        let new = exchange.quantity;
        if old == new {
            return None;
        }

        let same_side = !old.is_zero() && old.is_sign_positive() == new.is_sign_positive();
        let entry = match exchange.avg_price {
            Some(price) if price > Decimal::ZERO => price,
            _ if same_side && position.entry_price > Decimal::ZERO => position.entry_price,
            _ => reference_price,
        };

        position.quantity = new;
        if new.is_zero() {
            position.entry_price = Decimal::ZERO;
            position.stop_loss_price = None;
            position.take_profit_price = None;
        } else {
            position.entry_price = entry;
            let (stop, target) = risk.protective_levels(new > Decimal::ZERO, entry);
            position.stop_loss_price = Some(stop);
            position.take_profit_price = Some(target);
        }

        let capital = &mut self.record.capital;
        let before = capital.available_capital;
        capital.available_capital = (before - (new - old) * reference_price).max(Decimal::ZERO);
        let capital_adjustment = capital.available_capital - before;

        warn!(
            "Reconciled {}: stored quantity {} -> exchange {}, capital adjusted by {}",
            self.pair, old, new, capital_adjustment
        );
        Some(Discrepancy {
            old_quantity: old,
            new_quantity: new,
            capital_adjustment,
        })
    }

    /// Write the ledger with a version check
    ///
    /// On a version conflict the stored record is re-read. If it still
    /// equals the checkpointed state the write is retried once against the
    /// fresh revision; anything else means another writer touched the
    /// ledger and is fatal for the pair.
    #[instrument(skip(self, store, retry), fields(pair = %self.pair))]
    pub async fn persist(&mut self, store: &dyn DurableStore, retry: &RetryPolicy) -> Result<()> {
        self.record.updated_at = Utc::now();
        let pair = self.pair.as_str();
        let record = &self.record;
        let expected = &self.revision;

        let outcome = retry
            .run("persist ledger", move |_| store.put_ledger(pair, record, expected))
            .await;

        let revision = match outcome {
            Ok(revision) => revision,
            Err(EngineError::VersionConflict { expected, actual }) => {
                warn!(
                    "Ledger write for {} conflicted (expected {}, found {}); re-reading",
                    pair, expected, actual
                );
                let (stored, fresh) = retry
                    .run("re-read ledger", move |_| store.get_ledger(pair))
                    .await?;

                // Our own write landed but its acknowledgement was lost
                if stored.as_ref().is_some_and(|stored| stored.same_state(record)) {
                    info!("Ledger for {} already holds this write at revision {}", pair, fresh);
                    self.revision = fresh;
                    return Ok(());
                }

                let unchanged = match (&stored, &self.checkpoint) {
                    (Some(stored), Some(checkpoint)) => stored.same_state(checkpoint),
                    (None, None) => true,
                    _ => false,
                };
                if !unchanged {
                    error!("Ledger for {} was modified by another writer", pair);
                    return Err(EngineError::FatalState(format!(
                        "ledger for {} modified concurrently (revision {})",
                        pair, fresh
                    )));
                }

                match store.put_ledger(pair, record, &fresh).await {
                    Ok(revision) => revision,
                    Err(EngineError::VersionConflict { .. }) => {
                        return Err(EngineError::FatalState(format!(
                            "ledger for {} still conflicting after re-read",
                            pair
                        )))
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        };

        debug!("Persisted ledger for {} at revision {}", pair, revision);
        self.revision = revision;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::Side;
    use crate::config::types::RiskConfig;
    use crate::paper::InMemoryStore;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    const PAIR: &str = "BTC/USDT";

    fn risk() -> RiskManager {
        RiskManager::new(RiskConfig::default(), 6, true)
    }

    fn retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            attempt_timeout: Duration::from_millis(100),
        }
    }

    fn fill(side: Side, quantity: Decimal, price: Decimal, fee: Decimal) -> Fill {
        Fill {
            pair: PAIR.into(),
            side,
            quantity,
            price,
            fee,
            idempotency_key: "k".into(),
            exchange_order_id: "1".into(),
            filled_at: Utc::now(),
        }
    }

    fn ledger(available: Decimal) -> Ledger {
        Ledger::from_record(PAIR, LedgerRecord::seed(PAIR, available), Revision::new("absent"))
    }

    #[test]
    fn test_buy_then_partial_sell() {
        let mut ledger = ledger(dec!(10000));
        ledger.reserve(dec!(1010));
        assert_eq!(ledger.record().capital.reserved_capital, dec!(1010));

        let pnl = ledger
            .apply_fill(&fill(Side::Buy, dec!(10), dec!(100), dec!(1)), &risk())
            .unwrap();
        assert_eq!(pnl, Decimal::ZERO);
        assert_eq!(ledger.record().capital.available_capital, dec!(8999));
        assert_eq!(ledger.record().capital.reserved_capital, Decimal::ZERO);
        assert_eq!(ledger.position().quantity, dec!(10));
        assert_eq!(ledger.position().stop_loss_price, Some(dec!(98)));
        assert_eq!(ledger.position().take_profit_price, Some(dec!(105)));

        let pnl = ledger
            .apply_fill(&fill(Side::Sell, dec!(4), dec!(110), dec!(0.5)), &risk())
            .unwrap();
        assert_eq!(pnl, dec!(40));
        assert_eq!(ledger.position().quantity, dec!(6));
        assert_eq!(ledger.position().entry_price, dec!(100));
        // Reducing keeps the existing levels
        assert_eq!(ledger.position().stop_loss_price, Some(dec!(98)));
        assert_eq!(ledger.record().capital.available_capital, dec!(9438.5));
    }

    #[test]
    fn test_adding_averages_entry() {
        let mut ledger = ledger(dec!(10000));
        ledger.apply_fill(&fill(Side::Buy, dec!(1), dec!(100), dec!(0)), &risk()).unwrap();
        ledger.apply_fill(&fill(Side::Buy, dec!(1), dec!(200), dec!(0)), &risk()).unwrap();
        assert_eq!(ledger.position().entry_price, dec!(150));
        assert_eq!(ledger.position().stop_loss_price, Some(dec!(147)));
    }

    #[test]
    fn test_close_clears_levels() {
        let mut ledger = ledger(dec!(1000));
        ledger.apply_fill(&fill(Side::Buy, dec!(2), dec!(100), dec!(0)), &risk()).unwrap();
        let pnl = ledger
            .apply_fill(&fill(Side::Sell, dec!(2), dec!(90), dec!(0)), &risk())
            .unwrap();
        assert_eq!(pnl, dec!(-20));
        assert!(ledger.position().is_flat());
        assert_eq!(ledger.position().stop_loss_price, None);
        assert_eq!(ledger.position().entry_price, Decimal::ZERO);
    }

    #[test]
    fn test_flip_reenters_at_fill_price() {
        let mut ledger = ledger(dec!(1000));
        ledger.apply_fill(&fill(Side::Buy, dec!(1), dec!(100), dec!(0)), &risk()).unwrap();
        ledger.apply_fill(&fill(Side::Sell, dec!(3), dec!(100), dec!(0)), &risk()).unwrap();
        assert_eq!(ledger.position().quantity, dec!(-2));
        assert_eq!(ledger.position().entry_price, dec!(100));
        assert_eq!(ledger.position().stop_loss_price, Some(dec!(102)));
        assert_eq!(ledger.position().take_profit_price, Some(dec!(95)));
    }

    #[test]
    fn test_overdraw_is_fatal_and_leaves_ledger_untouched() {
        let mut ledger = ledger(dec!(50));
        ledger.reserve(dec!(30));
        let before = ledger.record().clone();

        let err = ledger
            .apply_fill(&fill(Side::Buy, dec!(1), dec!(100), dec!(0)), &risk())
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(ledger.record(), &before);
        assert_eq!(ledger.record().capital.reserved_capital, dec!(30));
    }

    #[test]
    fn test_reserved_cash_funds_the_fill() {
        let mut ledger = ledger(dec!(100));
        ledger.reserve(dec!(100));
        ledger
            .apply_fill(&fill(Side::Buy, dec!(0.99), dec!(100), dec!(0.5)), &risk())
            .unwrap();
        assert_eq!(ledger.record().capital.available_capital, dec!(0.5));
        assert_eq!(ledger.record().capital.reserved_capital, Decimal::ZERO);
    }

    #[test]
    fn test_short_cover_realizes_inverse_pnl() {
        let mut ledger = ledger(dec!(1000));
        ledger.apply_fill(&fill(Side::Sell, dec!(2), dec!(100), dec!(0)), &risk()).unwrap();
        let pnl = ledger
            .apply_fill(&fill(Side::Buy, dec!(1), dec!(90), dec!(0)), &risk())
            .unwrap();
        assert_eq!(pnl, dec!(10));
        assert_eq!(ledger.position().quantity, dec!(-1));
    }

    #[test]
    fn test_repair_adopts_exchange_position() {
        let mut ledger = ledger(dec!(10000));
        let exchange = ExchangePosition {
            quantity: dec!(0.5),
            avg_price: None,
        };
        let discrepancy = ledger.repair(&exchange, dec!(30000), &risk()).unwrap();
        assert_eq!(
            discrepancy,
            Discrepancy {
                old_quantity: dec!(0),
                new_quantity: dec!(0.5),
                capital_adjustment: dec!(-10000),
            }
        );
        // Floored at zero rather than going negative
        assert_eq!(ledger.record().capital.available_capital, Decimal::ZERO);
        assert_eq!(ledger.position().entry_price, dec!(30000));
        assert_eq!(ledger.position().stop_loss_price, Some(dec!(29400)));

        assert!(ledger.repair(&exchange, dec!(30000), &risk()).is_none());
    }

    #[tokio::test]
    async fn test_load_seeds_missing_ledger() {
        let store = InMemoryStore::new();
        let ledger = Ledger::load(&store, PAIR, dec!(5000), &retry()).await.unwrap();
        assert_eq!(ledger.record().capital.available_capital, dec!(5000));
        assert_eq!(ledger.last_epoch(), 0);
        assert!(store.ledger(PAIR).await.is_some());
    }

    #[tokio::test]
    async fn test_conflict_with_unchanged_record_retries_once() {
        let store = InMemoryStore::new();
        let mut ledger = Ledger::load(&store, PAIR, dec!(5000), &retry()).await.unwrap();
        ledger.checkpoint();

        // Same content rewritten elsewhere: only the revision moved
        store.overwrite_ledger(PAIR, ledger.record().clone()).await;
        ledger.mark_epoch(1);
        ledger.persist(&store, &retry()).await.unwrap();
        assert_eq!(store.ledger(PAIR).await.unwrap().last_epoch, 1);
    }

    /// Applies writes but drops the reply to the next `lost` of them
    struct DroppedReplyStore {
        inner: InMemoryStore,
        lost: std::sync::atomic::AtomicU32,
    }

    #[async_trait::async_trait]
    impl DurableStore for DroppedReplyStore {
        async fn get_ledger(&self, pair: &str) -> Result<(Option<LedgerRecord>, Revision)> {
            self.inner.get_ledger(pair).await
        }

        async fn put_ledger(&self, pair: &str, record: &LedgerRecord, expected: &Revision) -> Result<Revision> {
            let revision = self.inner.put_ledger(pair, record, expected).await?;
            let dropped = self
                .lost
                .fetch_update(
                    std::sync::atomic::Ordering::SeqCst,
                    std::sync::atomic::Ordering::SeqCst,
                    |n| n.checked_sub(1),
                )
                .is_ok();
            if dropped {
                return Err(EngineError::Timeout("put ledger".into()));
            }
            Ok(revision)
        }

        async fn append_event(&self, entry: &crate::common::types::EventLogEntry) -> Result<()> {
            self.inner.append_event(entry).await
        }

        async fn recent_events(
            &self,
            pair: &str,
            limit: usize,
        ) -> Result<Vec<crate::common::types::EventLogEntry>> {
            self.inner.recent_events(pair, limit).await
        }
    }

    #[tokio::test]
    async fn test_write_with_lost_reply_is_not_a_conflict() {
        let store = DroppedReplyStore {
            inner: InMemoryStore::new(),
            lost: std::sync::atomic::AtomicU32::new(0),
        };
        let mut ledger = Ledger::load(&store, PAIR, dec!(5000), &retry()).await.unwrap();
        ledger.checkpoint();
        ledger.apply_fill(&fill(Side::Buy, dec!(1), dec!(100), dec!(0)), &risk()).unwrap();
        ledger.mark_epoch(1);

        store.lost.store(1, std::sync::atomic::Ordering::SeqCst);
        ledger.persist(&store, &retry()).await.unwrap();

        let (stored, revision) = store.get_ledger(PAIR).await.unwrap();
        assert_eq!(stored.unwrap().position.quantity, dec!(1));
        assert_eq!(ledger.revision(), &revision);

        // The adopted revision is current, so the next write goes straight through
        ledger.mark_epoch(2);
        ledger.persist(&store, &retry()).await.unwrap();
        assert_eq!(store.inner.ledger(PAIR).await.unwrap().last_epoch, 2);
    }

    #[tokio::test]
    async fn test_conflict_with_foreign_change_is_fatal() {
        let store = InMemoryStore::new();
        let mut ledger = Ledger::load(&store, PAIR, dec!(5000), &retry()).await.unwrap();
        ledger.checkpoint();

        store
            .overwrite_ledger(PAIR, LedgerRecord::seed(PAIR, dec!(1)))
            .await;
        ledger.mark_epoch(1);
        let err = ledger.persist(&store, &retry()).await.unwrap_err();
        assert!(matches!(err, EngineError::FatalState(_)));
    }

    #[tokio::test]
    async fn test_rollback_after_failed_persist() {
        let store = InMemoryStore::new();
        let mut ledger = Ledger::load(&store, PAIR, dec!(5000), &retry()).await.unwrap();
        ledger.checkpoint();
        ledger.apply_fill(&fill(Side::Buy, dec!(1), dec!(100), dec!(0)), &risk()).unwrap();

        store.fail_next_puts(5).await;
        assert!(ledger.persist(&store, &retry()).await.is_err());
        ledger.rollback();
        assert!(ledger.position().is_flat());
        assert_eq!(ledger.record().capital.available_capital, dec!(5000));
    }
}
