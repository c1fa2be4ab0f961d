//! Binance spot REST adapter: market data, signed orders and balances

pub mod auth;
pub mod client;
pub mod messages;

pub use client::BinanceClient;
