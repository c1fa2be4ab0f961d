//! One long-lived task per pair

use futures_util::future::join_all;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, info_span, Instrument};

use super::coordinator::{Collaborators, CycleOutcome, ExecutionCoordinator};
use super::operator::{KillSwitch, OperatorHandle, StatusBoard};
use crate::common::errors::Result;
use crate::config::types::EngineConfig;
use crate::policy::ReloadHandle;

/// How a pair's worker ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub pair: String,
    pub cycles: u64,
    /// Fatal reason if the worker halted rather than shut down
    pub halted: Option<String>,
}

/// Spawns and supervises the pair workers
///
/// Pairs share nothing mutable: each worker owns its ledger and
/// coordinator, and a halted pair never stops the others.
pub struct WorkerPool {
    config: EngineConfig,
    collaborators: Collaborators,
    board: StatusBoard,
    reload: ReloadHandle,
    switches: HashMap<String, KillSwitch>,
}

impl WorkerPool {
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Self {
        let switches = config
            .trading
            .pairs
            .iter()
            .map(|pair| (pair.clone(), KillSwitch::new()))
            .collect();
        Self {
            board: StatusBoard::new(config.execution.status_event_limit),
            config,
            collaborators,
            reload: ReloadHandle::new(),
            switches,
        }
    }

    pub fn operator(&self) -> OperatorHandle {
        OperatorHandle::new(
            self.board.clone(),
            self.switches.clone(),
            self.reload.clone(),
            self.collaborators.store.clone(),
        )
    }

    /// Run every pair until shutdown, or for `max_cycles` cycles each
    pub async fn run(self, shutdown: watch::Receiver<bool>, max_cycles: Option<u64>) -> Result<Vec<WorkerExit>> {
        let period = self.config.cycle_interval()?;
        info!(
            "Starting {} pair worker(s) every {:?}",
            self.config.trading.pairs.len(),
            period
        );

        let mut handles = Vec::new();
        for pair in &self.config.trading.pairs {
            let span = info_span!("worker", pair = %pair);
            let task = run_pair(
                pair.clone(),
                self.config.clone(),
                self.collaborators.clone(),
                self.reload.clone(),
                self.switches.get(pair).cloned().unwrap_or_default(),
                self.board.clone(),
                shutdown.clone(),
                period,
                max_cycles,
            );
            handles.push(tokio::spawn(task.instrument(span)));
        }

        let mut exits = Vec::new();
        for (pair, joined) in self.config.trading.pairs.iter().zip(join_all(handles).await) {
            match joined {
                Ok(exit) => exits.push(exit),
                Err(e) => {
                    error!("Worker task for {} panicked: {}", pair, e);
                    self.board.mark_halted(pair, "worker task panicked").await;
                    exits.push(WorkerExit {
                        pair: pair.clone(),
                        cycles: 0,
                        halted: Some(e.to_string()),
                    });
                }
            }
        }
        Ok(exits)
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_pair(
    pair: String,
    config: EngineConfig,
    collaborators: Collaborators,
    reload: ReloadHandle,
    kill_switch: KillSwitch,
    board: StatusBoard,
    mut shutdown: watch::Receiver<bool>,
    period: Duration,
    max_cycles: Option<u64>,
) -> WorkerExit {
    let mut coordinator =
        match ExecutionCoordinator::start(&pair, &config, &collaborators, reload, kill_switch, board.clone()).await {
            Ok(coordinator) => coordinator,
            Err(e) => {
                let reason = format!("worker failed to start: {}", e);
                error!("{} {}", pair, reason);
                board.mark_halted(&pair, &reason).await;
                return WorkerExit {
                    pair,
                    cycles: 0,
                    halted: Some(reason),
                };
            }
        };

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut cycles = 0;
    let mut halted = None;

    loop {
        if max_cycles.map(|max| cycles >= max).unwrap_or(false) {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Shutdown requested for {}", pair);
                    break;
                }
                continue;
            }
        }

        let report = coordinator.run_cycle().await;
        cycles += 1;
        if let CycleOutcome::Fatal(reason) = report.outcome {
            halted = Some(reason);
            break;
        }
    }

    coordinator.shutdown().await;
    info!("Worker for {} stopped after {} cycle(s)", pair, cycles);
    WorkerExit { pair, cycles, halted }
}
