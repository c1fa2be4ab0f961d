//! Risk limits applied between the policy and the exchange

mod manager;

pub use manager::RiskManager;
