//! Random-walk market data for paper trading

use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::common::errors::{EngineError, Result};
use crate::common::traits::MarketDataSource;
use crate::common::types::MarketSnapshot;

struct WalkState {
    prices: HashMap<String, Decimal>,
    rng: StdRng,
}

/// Simulated market where each snapshot moves the price by a bounded shock
///
/// The last generated price is the mark the paper exchange fills at.
pub struct RandomWalkMarket {
    state: Mutex<WalkState>,
    volatility: f64,
    base_volume: f64,
}

impl RandomWalkMarket {
    pub fn new(seed: u64, volatility: f64, base_volume: f64) -> Self {
        Self {
            state: Mutex::new(WalkState {
                prices: HashMap::new(),
                rng: StdRng::seed_from_u64(seed),
            }),
            volatility: volatility.abs(),
            base_volume: base_volume.max(0.0),
        }
    }

    /// Set or reset a pair's current price
    pub async fn set_price(&self, pair: &str, price: Decimal) {
        self.state.lock().await.prices.insert(pair.to_string(), price);
    }

    /// Current price without advancing the walk
    pub async fn price(&self, pair: &str) -> Option<Decimal> {
        self.state.lock().await.prices.get(pair).copied()
    }
}

#[async_trait]
impl MarketDataSource for RandomWalkMarket {
    async fn latest_snapshot(&self, pair: &str, epoch: u64) -> Result<MarketSnapshot> {
        let mut state = self.state.lock().await;
        let current = state
            .prices
            .get(pair)
            .copied()
            .ok_or_else(|| EngineError::transient("market_data", format!("no paper price for {}", pair)))?;

        let shock: f64 = state.rng.gen_range(-1.0..=1.0) * self.volatility;
        let volume: f64 = state.rng.gen_range(0.5..=1.5) * self.base_volume;

        let next = current.to_f64().unwrap_or(0.0) * (1.0 + shock);
        let price = Decimal::from_f64(next)
            .map(|p| p.round_dp(2))
            .filter(|p| *p > Decimal::ZERO)
            .unwrap_or(current);
        state.prices.insert(pair.to_string(), price);

        Ok(MarketSnapshot {
            pair: pair.to_string(),
            epoch,
            price,
            volume: Decimal::from_f64(volume).unwrap_or_default().round_dp(4),
            timestamp: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_walk_stays_within_volatility_band() {
        let market = RandomWalkMarket::new(7, 0.01, 100.0);
        market.set_price("BTC/USDT", dec!(30000)).await;

        let snapshot = market.latest_snapshot("BTC/USDT", 3).await.unwrap();
        assert_eq!(snapshot.epoch, 3);
        assert!(snapshot.price >= dec!(29700) && snapshot.price <= dec!(30300));
        assert_eq!(market.price("BTC/USDT").await, Some(snapshot.price));
    }

    #[tokio::test]
    async fn test_unknown_pair_is_unavailable() {
        let market = RandomWalkMarket::new(7, 0.01, 100.0);
        let err = market.latest_snapshot("DOGE/USDT", 1).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
