//! Common test utilities and fixtures

#![allow(dead_code)]

use adaptive_trader::common::errors::{EngineError, Result};
use adaptive_trader::common::traits::{
    Exchange, MarketDataSource, NormalizedState, PolicyInference, RawPolicyOutput,
};
use adaptive_trader::common::types::{ExchangePosition, MarketSnapshot, Order, SubmitOutcome};
use adaptive_trader::config::types::EngineConfig;
use adaptive_trader::engine::{Collaborators, ExecutionCoordinator, KillSwitch, StatusBoard};
use adaptive_trader::paper::{InMemoryStore, PaperExchange, RandomWalkMarket, StaticSentimentSource};
use adaptive_trader::policy::ReloadHandle;
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const BTC: &str = "BTC/USDT";
pub const ETH: &str = "ETH/USDT";

/// Engine config with millisecond retry budgets
pub fn fast_config(pairs: &[&str]) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.trading.pairs = pairs.iter().map(|p| p.to_string()).collect();
    config.trading.timeframe = "1s".to_string();
    config.trading.initial_capital = dec!(10000);
    config.execution.max_attempts = 3;
    config.execution.base_delay_ms = 1;
    config.execution.max_delay_ms = 5;
    config.execution.attempt_timeout_ms = 50;
    config.execution.journal_max_attempts = 3;
    config.sentiment.timeout_ms = 50;
    config
}

/// Policy whose output is set by the test
pub struct ScriptedPolicy {
    output: Mutex<RawPolicyOutput>,
}

impl ScriptedPolicy {
    pub fn new(output: RawPolicyOutput) -> Arc<Self> {
        Arc::new(Self {
            output: Mutex::new(output),
        })
    }

    pub fn set(&self, output: RawPolicyOutput) {
        *self.output.lock().unwrap() = output;
    }
}

#[async_trait]
impl PolicyInference for ScriptedPolicy {
    async fn current_version(&self) -> Result<String> {
        Ok("scripted-1".to_string())
    }

    async fn infer(&self, _version: &str, _state: &NormalizedState) -> Result<RawPolicyOutput> {
        Ok(self.output.lock().unwrap().clone())
    }
}

/// Market data that can be made to hang past the attempt timeout
pub struct StallingMarket {
    inner: Arc<RandomWalkMarket>,
    stalls: AtomicU32,
    pub calls: AtomicU32,
}

impl StallingMarket {
    pub fn new(inner: Arc<RandomWalkMarket>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            stalls: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        })
    }

    pub fn stall_next(&self, count: u32) {
        self.stalls.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl MarketDataSource for StallingMarket {
    async fn latest_snapshot(&self, pair: &str, epoch: u64) -> Result<MarketSnapshot> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let stalled = self
            .stalls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if stalled {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        self.inner.latest_snapshot(pair, epoch).await
    }
}

/// Reports every fill as far larger than the order, overdrawing the ledger
pub struct InflatingExchange {
    inner: Arc<PaperExchange>,
}

impl InflatingExchange {
    pub fn new(inner: Arc<PaperExchange>) -> Arc<Self> {
        Arc::new(Self { inner })
    }
}

#[async_trait]
impl Exchange for InflatingExchange {
    async fn get_position(&self, pair: &str) -> Result<ExchangePosition> {
        self.inner.get_position(pair).await
    }

    async fn submit_order(&self, order: &Order) -> Result<SubmitOutcome> {
        match self.inner.submit_order(order).await? {
            SubmitOutcome::Filled(mut fill) => {
                fill.quantity *= dec!(1000);
                Ok(SubmitOutcome::Filled(fill))
            }
            other => Ok(other),
        }
    }

    fn name(&self) -> &'static str {
        "inflating"
    }
}

/// Routes each pair to its own exchange
pub struct RoutingExchange {
    routes: HashMap<String, Arc<dyn Exchange>>,
}

impl RoutingExchange {
    pub fn new(routes: Vec<(&str, Arc<dyn Exchange>)>) -> Arc<Self> {
        Arc::new(Self {
            routes: routes
                .into_iter()
                .map(|(pair, exchange)| (pair.to_string(), exchange))
                .collect(),
        })
    }

    fn route(&self, pair: &str) -> Result<&Arc<dyn Exchange>> {
        self.routes
            .get(pair)
            .ok_or_else(|| EngineError::Validation(format!("no route for {}", pair)))
    }
}

#[async_trait]
impl Exchange for RoutingExchange {
    async fn get_position(&self, pair: &str) -> Result<ExchangePosition> {
        self.route(pair)?.get_position(pair).await
    }

    async fn submit_order(&self, order: &Order) -> Result<SubmitOutcome> {
        self.route(&order.pair)?.submit_order(order).await
    }

    fn name(&self) -> &'static str {
        "routing"
    }
}

/// Everything a scenario needs, wired the way `main` wires it
pub struct Harness {
    pub config: EngineConfig,
    pub store: Arc<InMemoryStore>,
    pub market: Arc<RandomWalkMarket>,
    pub stalling: Arc<StallingMarket>,
    pub exchange: Arc<PaperExchange>,
    pub policy: Arc<ScriptedPolicy>,
    pub board: StatusBoard,
    pub kill_switch: KillSwitch,
}

impl Harness {
    /// Zero-volatility market at `price` for every pair
    pub async fn new(pairs: &[&str], price: Decimal, output: RawPolicyOutput) -> Self {
        let config = fast_config(pairs);
        let market = Arc::new(RandomWalkMarket::new(1, 0.0, 100.0));
        for pair in pairs {
            market.set_price(pair, price).await;
        }
        Self {
            store: Arc::new(InMemoryStore::new()),
            stalling: StallingMarket::new(market.clone()),
            exchange: Arc::new(PaperExchange::new(market.clone(), config.risk.fee_rate)),
            board: StatusBoard::new(config.execution.status_event_limit),
            market,
            policy: ScriptedPolicy::new(output),
            kill_switch: KillSwitch::new(),
            config,
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            store: self.store.clone(),
            exchange: self.exchange.clone(),
            market_data: self.stalling.clone(),
            sentiment: Arc::new(StaticSentimentSource::new(0.0, 0.0)),
            policy: self.policy.clone(),
        }
    }

    pub async fn coordinator(&self, pair: &str) -> ExecutionCoordinator {
        ExecutionCoordinator::start(
            pair,
            &self.config,
            &self.collaborators(),
            ReloadHandle::new(),
            self.kill_switch.clone(),
            self.board.clone(),
        )
        .await
        .expect("coordinator should start")
    }
}

/// Event kind labels for a pair, in append order
pub async fn labels(store: &InMemoryStore, pair: &str) -> Vec<&'static str> {
    store
        .events(pair)
        .await
        .iter()
        .map(|e| e.kind.label())
        .collect()
}
