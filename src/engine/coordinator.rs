//! Per-pair cycle state machine
//!
//! `GATHER -> [FORCED_CLOSE] -> DECIDE -> RISK_CHECK -> SUBMIT -> SETTLE -> LOG -> DONE`
//!
//! The coordinator owns the pair's ledger. Every exit path records exactly
//! one terminal event for the epoch; external calls go through the retry
//! policy and nothing is mutated durably before GATHER completes.

use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

use super::journal::EventJournal;
use super::operator::{KillSwitch, StatusBoard};
use crate::common::errors::Result;
use crate::common::retry::RetryPolicy;
use crate::common::traits::{DurableStore, Exchange, MarketDataSource, PolicyInference, SentimentSource};
use crate::common::types::{
    CycleStage, Direction, EventKind, MarketSnapshot, Order, PolicyAction, SentimentScore, Side,
    SubmitOutcome,
};
use crate::config::types::EngineConfig;
use crate::ledger::Ledger;
use crate::policy::{PolicyAdapter, ReloadHandle};
use crate::risk::RiskManager;
use crate::sentiment::SentimentAggregator;

/// External services shared by every pair worker
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn DurableStore>,
    pub exchange: Arc<dyn Exchange>,
    pub market_data: Arc<dyn MarketDataSource>,
    pub sentiment: Arc<dyn SentimentSource>,
    pub policy: Arc<dyn PolicyInference>,
}

/// How a cycle ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Reached DONE: traded, held or rejected
    Done,
    /// Aborted in GATHER or SUBMIT without mutating the ledger
    Skipped,
    /// Abandoned before SUBMIT for exceeding the cycle budget
    TimedOut,
    /// Exchange filled but the ledger write failed and was rolled back
    FailedAfterFill,
    /// Worker halted
    Fatal(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub epoch: u64,
    pub outcome: CycleOutcome,
}

/// Drives one pair through successive cycles
pub struct ExecutionCoordinator {
    pair: String,
    store: Arc<dyn DurableStore>,
    exchange: Arc<dyn Exchange>,
    market_data: Arc<dyn MarketDataSource>,
    sentiment: SentimentAggregator,
    policy: PolicyAdapter,
    risk: RiskManager,
    ledger: Ledger,
    journal: EventJournal,
    retry: RetryPolicy,
    cycle_budget: Duration,
    kill_switch: KillSwitch,
    board: StatusBoard,
    next_epoch: u64,
    halted: Option<String>,
}

impl ExecutionCoordinator {
    /// Load the pair's ledger and wire up its components
    #[instrument(skip(config, collaborators, reload, kill_switch, board))]
    pub async fn start(
        pair: &str,
        config: &EngineConfig,
        collaborators: &Collaborators,
        reload: ReloadHandle,
        kill_switch: KillSwitch,
        board: StatusBoard,
    ) -> Result<Self> {
        let retry = config.execution.retry_policy();
        let ledger = Ledger::load(
            collaborators.store.as_ref(),
            pair,
            config.trading.initial_capital,
            &retry,
        )
        .await?;
        board.register(pair).await;
        board.update_ledger(pair, ledger.record()).await;

        let journal = EventJournal::spawn(
            pair,
            collaborators.store.clone(),
            config.execution.journal_retry_policy(),
            board.clone(),
        );
        let policy = PolicyAdapter::new(
            collaborators.policy.clone(),
            config.policy.normalization_window,
            Duration::from_secs(config.policy.reload_interval_secs),
            retry.attempt_timeout,
            reload,
        );
        let risk = RiskManager::new(
            config.risk.clone(),
            config.trading.quantity_precision,
            config.trading.allow_short,
        );

        let store = collaborators.store.as_ref();
        let newest_event = match retry
            .run("newest event", move |_| store.recent_events(pair, 1))
            .await
        {
            Ok(events) => events.iter().map(|e| e.epoch).max().unwrap_or(0),
            Err(e) => {
                warn!("Could not read event history for {}: {}", pair, e);
                0
            }
        };
        let next_epoch = ledger.last_epoch().max(newest_event) + 1;
        info!("Worker for {} starts at epoch {}", pair, next_epoch);

        Ok(Self {
            pair: pair.to_string(),
            store: collaborators.store.clone(),
            exchange: collaborators.exchange.clone(),
            market_data: collaborators.market_data.clone(),
            sentiment: SentimentAggregator::new(collaborators.sentiment.clone(), config.sentiment.clone()),
            policy,
            risk,
            ledger,
            journal,
            retry,
            cycle_budget: config.execution.cycle_budget(),
            kill_switch,
            board,
            next_epoch,
            halted: None,
        })
    }

    pub fn pair(&self) -> &str {
        &self.pair
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn next_epoch(&self) -> u64 {
        self.next_epoch
    }

    /// Reason the worker stopped, if it did
    pub fn halted(&self) -> Option<&str> {
        self.halted.as_deref()
    }

    /// Run one full cycle for the next epoch
    #[instrument(skip(self), fields(pair = %self.pair, epoch = self.next_epoch))]
    pub async fn run_cycle(&mut self) -> CycleReport {
        let epoch = self.next_epoch;
        if let Some(reason) = &self.halted {
            return CycleReport {
                epoch,
                outcome: CycleOutcome::Fatal(reason.clone()),
            };
        }

        let started = Instant::now();
        let outcome = match self.execute(epoch, started).await {
            Ok(outcome) => match self.advance_epoch(epoch).await {
                Ok(()) => outcome,
                Err(e) => self.fail(epoch, e.to_string()).await,
            },
            Err(e) => {
                self.ledger.rollback();
                self.fail(epoch, e.to_string()).await
            }
        };

        self.next_epoch = (epoch + 1).max(self.ledger.last_epoch() + 1);
        self.board.update_ledger(&self.pair, self.ledger.record()).await;
        debug!(
            "Cycle {} for {} finished as {:?} in {:?}",
            epoch,
            self.pair,
            outcome,
            started.elapsed()
        );
        CycleReport { epoch, outcome }
    }

    /// Flush the journal; call once the worker stops
    pub async fn shutdown(&mut self) {
        self.journal.shutdown().await;
    }

    /// The state machine proper; `Err` is always fatal for the pair
    async fn execute(&mut self, epoch: u64, started: Instant) -> Result<CycleOutcome> {
        self.ledger.checkpoint();

        // GATHER
        let pair = self.pair.as_str();
        let exchange = self.exchange.as_ref();
        let exchange_position = match self
            .retry
            .run("position query", move |_| exchange.get_position(pair))
            .await
        {
            Ok(position) => position,
            Err(e) => return Ok(self.skip(epoch, CycleStage::Gather, format!("position query failed: {}", e))),
        };

        let market_data = self.market_data.as_ref();
        let snapshot = match self
            .retry
            .run("market snapshot", move |_| market_data.latest_snapshot(pair, epoch))
            .await
        {
            Ok(snapshot) if snapshot.price > Decimal::ZERO => snapshot,
            Ok(snapshot) => {
                return Ok(self.skip(
                    epoch,
                    CycleStage::Gather,
                    format!("market snapshot has invalid price {}", snapshot.price),
                ))
            }
            Err(e) => return Ok(self.skip(epoch, CycleStage::Gather, format!("market data unavailable: {}", e))),
        };

        if let Some(discrepancy) = self.ledger.repair(&exchange_position, snapshot.price, &self.risk) {
            self.ledger.mark_epoch(epoch);
            if let Err(e) = self.ledger.persist(self.store.as_ref(), &self.retry).await {
                if e.is_fatal() {
                    return Err(e);
                }
                self.ledger.rollback();
                return Ok(self.skip(epoch, CycleStage::Gather, format!("reconciliation not persisted: {}", e)));
            }
            self.journal.record(
                epoch,
                EventKind::Reconciled {
                    old_quantity: discrepancy.old_quantity,
                    new_quantity: discrepancy.new_quantity,
                    capital_adjustment: discrepancy.capital_adjustment,
                },
            );
            self.ledger.checkpoint();
        }

        let sentiment = self.sentiment.score(&self.pair).await;

        // FORCED_CLOSE takes priority over whatever the policy would say
        let position = self.ledger.position();
        if let (Some(trigger), Some(side)) = (position.protective_trigger(snapshot.price), position.closing_side()) {
            info!(
                "{} {} triggered at {} (position {} @ {})",
                self.pair, trigger, snapshot.price, position.quantity, position.entry_price
            );
            let order = Order::new(&self.pair, epoch, side, position.quantity.abs(), snapshot.price).forced();
            let direction = match side {
                Side::Buy => Direction::Buy,
                Side::Sell => Direction::Sell,
            };
            if let Some(outcome) = self.check_budget(epoch, CycleStage::Submit, started) {
                return Ok(outcome);
            }
            return self.submit_and_settle(epoch, order, direction, Decimal::ONE).await;
        }

        // DECIDE
        if let Some(outcome) = self.check_budget(epoch, CycleStage::Decide, started) {
            return Ok(outcome);
        }
        let kill_switch = self.kill_switch.is_engaged();
        let action = if kill_switch {
            debug!("Kill-switch engaged for {}; holding", self.pair);
            PolicyAction::hold()
        } else {
            let decision = self.policy.decide(&snapshot, &sentiment).await;
            if let Some(detail) = decision.validation_error {
                self.journal.record(epoch, EventKind::ValidationError { detail });
            }
            decision.action
        };

        // RISK_CHECK
        if let Some(outcome) = self.check_budget(epoch, CycleStage::RiskCheck, started) {
            return Ok(outcome);
        }
        let decision = self
            .risk
            .check(&self.pair, &action, &self.ledger.snapshot(snapshot.price));
        if !decision.approved {
            let reason = decision
                .reason
                .map(|r| r.to_string())
                .unwrap_or_else(|| "rejected".to_string());
            self.journal.record(
                epoch,
                EventKind::Rejected {
                    direction: action.direction,
                    requested_fraction: action.size_fraction,
                    reason,
                    by_exchange: false,
                },
            );
            return Ok(CycleOutcome::Done);
        }
        let side = match (decision.is_trade(), decision.direction.side()) {
            (true, Some(side)) => side,
            _ => {
                self.record_held(epoch, &snapshot, &sentiment, kill_switch);
                return Ok(CycleOutcome::Done);
            }
        };

        // SUBMIT
        if let Some(outcome) = self.check_budget(epoch, CycleStage::Submit, started) {
            return Ok(outcome);
        }
        if side == Side::Buy {
            self.ledger.reserve(self.risk.buy_cost(decision.quantity, snapshot.price));
        }
        let order = Order::new(&self.pair, epoch, side, decision.quantity, snapshot.price);
        self.submit_and_settle(epoch, order, decision.direction, decision.size_fraction)
            .await
    }

    /// SUBMIT, SETTLE and LOG for an order; never abandoned once started
    async fn submit_and_settle(
        &mut self,
        epoch: u64,
        order: Order,
        direction: Direction,
        size_fraction: Decimal,
    ) -> Result<CycleOutcome> {
        let exchange = self.exchange.as_ref();
        let pending = &order;
        let submitted = self
            .retry
            .run("submit order", move |attempt| async move {
                exchange
                    .submit_order(pending)
                    .await
                    .map(|outcome| (attempt, outcome))
            })
            .await;

        let (attempt, outcome) = match submitted {
            Ok(result) => result,
            Err(e) => {
                // Whether it executed is unknown; reconciliation settles it
                self.ledger.rollback();
                return Ok(self.skip(epoch, CycleStage::Submit, format!("order submission failed: {}", e)));
            }
        };

        let (fill, already_reflected) = match outcome {
            SubmitOutcome::Filled(fill) => (fill, false),
            SubmitOutcome::AlreadyProcessed(fill) if fill.side != order.side || fill.quantity != order.quantity => {
                error!(
                    "Key {} for {} epoch {} belongs to a different order ({} {}, wanted {} {})",
                    order.idempotency_key, self.pair, epoch, fill.side, fill.quantity, order.side, order.quantity
                );
                self.ledger.rollback();
                return Ok(self.skip(
                    epoch,
                    CycleStage::Submit,
                    format!("idempotency key {} already used by another order", order.idempotency_key),
                ));
            }
            // Seen on the first attempt, the key belongs to an earlier run whose
            // effect GATHER has already reconciled into the ledger
            SubmitOutcome::AlreadyProcessed(fill) => {
                info!(
                    "Order {} already processed by {} (attempt {})",
                    fill.idempotency_key,
                    self.exchange.name(),
                    attempt
                );
                (fill, attempt == 1)
            }
            SubmitOutcome::Rejected(reason) => {
                self.ledger.rollback();
                self.journal.record(
                    epoch,
                    EventKind::Rejected {
                        direction,
                        requested_fraction: size_fraction,
                        reason,
                        by_exchange: true,
                    },
                );
                return Ok(CycleOutcome::Done);
            }
        };

        // SETTLE
        let realized_pnl = if already_reflected {
            self.ledger.rollback();
            Decimal::ZERO
        } else {
            self.ledger.apply_fill(&fill, &self.risk)?
        };
        self.ledger.mark_epoch(epoch);

        if let Err(e) = self.ledger.persist(self.store.as_ref(), &self.retry).await {
            if e.is_fatal() {
                return Err(e);
            }
            self.ledger.rollback();
            if already_reflected {
                warn!("Could not record epoch {} for {}: {}", epoch, self.pair, e);
            } else {
                error!(
                    "Fill {} for {} executed but the ledger write failed: {}",
                    fill.idempotency_key, self.pair, e
                );
                self.journal.record(
                    epoch,
                    EventKind::FailedAfterFill {
                        side: fill.side,
                        quantity: fill.quantity,
                        price: fill.price,
                        idempotency_key: fill.idempotency_key.clone(),
                        error: e.to_string(),
                    },
                );
                return Ok(CycleOutcome::FailedAfterFill);
            }
        }

        // LOG
        self.journal.record(
            epoch,
            EventKind::Filled {
                side: fill.side,
                quantity: fill.quantity,
                price: fill.price,
                fee: fill.fee,
                idempotency_key: fill.idempotency_key,
                forced_close: order.forced_close,
                realized_pnl,
                already_reflected,
            },
        );
        Ok(CycleOutcome::Done)
    }

    fn skip(&mut self, epoch: u64, stage: CycleStage, reason: String) -> CycleOutcome {
        warn!("Skipping {} epoch {} at {}: {}", self.pair, epoch, stage, reason);
        self.journal.record(epoch, EventKind::Skipped { stage, reason });
        CycleOutcome::Skipped
    }

    fn record_held(&mut self, epoch: u64, snapshot: &MarketSnapshot, sentiment: &SentimentScore, kill_switch: bool) {
        self.journal.record(
            epoch,
            EventKind::Held {
                price: snapshot.price,
                sentiment: sentiment.value,
                sentiment_confidence: sentiment.confidence,
                kill_switch,
            },
        );
    }

    /// Abandon the cycle if its budget is spent before `stage`
    fn check_budget(&mut self, epoch: u64, stage: CycleStage, started: Instant) -> Option<CycleOutcome> {
        let elapsed = started.elapsed();
        if elapsed <= self.cycle_budget {
            return None;
        }
        self.ledger.rollback();
        self.journal.record(
            epoch,
            EventKind::Timeout {
                stage,
                elapsed_ms: elapsed.as_millis() as u64,
            },
        );
        Some(CycleOutcome::TimedOut)
    }

    /// Make the epoch durable whatever the cycle's outcome
    ///
    /// A failed write only delays this: the next persist carries the epoch,
    /// and the journal's copy of the epoch covers a restart in between.
    async fn advance_epoch(&mut self, epoch: u64) -> Result<()> {
        if self.ledger.last_epoch() >= epoch {
            return Ok(());
        }
        self.ledger.checkpoint();
        self.ledger.mark_epoch(epoch);
        if let Err(e) = self.ledger.persist(self.store.as_ref(), &self.retry).await {
            self.ledger.rollback();
            if e.is_fatal() {
                return Err(e);
            }
            warn!("Could not record epoch {} for {}: {}", epoch, self.pair, e);
        }
        Ok(())
    }

    async fn fail(&mut self, epoch: u64, detail: String) -> CycleOutcome {
        self.halt(epoch, detail.clone()).await;
        CycleOutcome::Fatal(detail)
    }

    async fn halt(&mut self, epoch: u64, detail: String) {
        error!("Halting worker for {}: {}", self.pair, detail);
        self.journal.record(epoch, EventKind::Fatal { detail: detail.clone() });
        self.board.mark_halted(&self.pair, &detail).await;
        self.halted = Some(detail);
    }
}

impl std::fmt::Debug for ExecutionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionCoordinator")
            .field("pair", &self.pair)
            .field("next_epoch", &self.next_epoch)
            .field("halted", &self.halted)
            .finish()
    }
}
