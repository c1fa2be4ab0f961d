//! Baseline policy used when no model service is configured

use async_trait::async_trait;

use crate::common::errors::Result;
use crate::common::traits::{NormalizedState, PolicyInference, RawPolicyOutput};

pub const MOMENTUM_VERSION: &str = "momentum-baseline-1";

/// Trades in the direction of confidence-weighted sentiment plus price momentum
#[derive(Debug, Clone)]
pub struct MomentumPolicy {
    threshold: f64,
}

impl MomentumPolicy {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold: threshold.abs(),
        }
    }

    fn signal(state: &NormalizedState) -> f64 {
        state.sentiment + 0.2 * state.price_zscore + 10.0 * state.price_return
    }
}

impl Default for MomentumPolicy {
    fn default() -> Self {
        Self::new(0.15)
    }
}

#[async_trait]
impl PolicyInference for MomentumPolicy {
    async fn current_version(&self) -> Result<String> {
        Ok(MOMENTUM_VERSION.to_string())
    }

    async fn infer(&self, _version: &str, state: &NormalizedState) -> Result<RawPolicyOutput> {
        let signal = Self::signal(state);
        let output = if signal > self.threshold {
            RawPolicyOutput::new("BUY", signal.min(1.0))
        } else if signal < -self.threshold {
            RawPolicyOutput::new("SELL", (-signal).min(1.0))
        } else {
            RawPolicyOutput::new("HOLD", 0.0)
        };
        Ok(output)
    }
}
