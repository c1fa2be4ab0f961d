//! Execution engine: per-pair coordinators, their journals and the worker pool

mod coordinator;
mod journal;
mod operator;
mod worker;

pub use coordinator::{Collaborators, CycleOutcome, CycleReport, ExecutionCoordinator};
pub use journal::EventJournal;
pub use operator::{KillSwitch, OperatorHandle, PairStatus, StatusBoard};
pub use worker::{WorkerExit, WorkerPool};
