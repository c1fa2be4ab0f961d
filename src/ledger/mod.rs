//! Durable per-pair ledger: capital, position and reconciliation

mod book;

pub use book::{Discrepancy, Ledger};
