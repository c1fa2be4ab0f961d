//! Adapter around the black-box policy model

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use super::normalizer::StateNormalizer;
use crate::common::errors::{EngineError, Result};
use crate::common::traits::{PolicyInference, RawPolicyOutput};
use crate::common::types::{Direction, MarketSnapshot, PolicyAction, SentimentScore};

/// Signal that asks every policy adapter to re-read the model version pointer
///
/// Cloned into each pair's adapter; a request bumps a generation counter so
/// every adapter observes it once.
#[derive(Debug, Clone, Default)]
pub struct ReloadHandle {
    generation: Arc<AtomicU64>,
}

impl ReloadHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_reload(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

/// Validated policy output
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyDecision {
    pub action: PolicyAction,
    /// Model version that produced the action, if any
    pub model_version: Option<String>,
    /// Set when the output was replaced by HOLD
    pub validation_error: Option<String>,
}

impl PolicyDecision {
    fn fallback(model_version: Option<String>, detail: String) -> Self {
        Self {
            action: PolicyAction::hold(),
            model_version,
            validation_error: Some(detail),
        }
    }
}

/// Normalizes inputs, validates outputs and hot-swaps model versions
pub struct PolicyAdapter {
    inference: Arc<dyn PolicyInference>,
    normalizer: StateNormalizer,
    active_version: Option<String>,
    last_reload: Option<Instant>,
    reload_interval: Duration,
    reload: ReloadHandle,
    seen_generation: u64,
    inference_timeout: Duration,
}

impl PolicyAdapter {
    pub fn new(
        inference: Arc<dyn PolicyInference>,
        window: usize,
        reload_interval: Duration,
        inference_timeout: Duration,
        reload: ReloadHandle,
    ) -> Self {
        let seen_generation = reload.generation();
        Self {
            inference,
            normalizer: StateNormalizer::new(window),
            active_version: None,
            last_reload: None,
            reload_interval,
            reload,
            seen_generation,
            inference_timeout,
        }
    }

    /// Model version currently used for inference
    pub fn active_version(&self) -> Option<&str> {
        self.active_version.as_deref()
    }

    /// Produce an action; malformed output or failed inference yields HOLD
    #[instrument(skip(self, snapshot, sentiment), fields(pair = %snapshot.pair, epoch = snapshot.epoch))]
    pub async fn decide(&mut self, snapshot: &MarketSnapshot, sentiment: &SentimentScore) -> PolicyDecision {
        self.refresh_version().await;
        let state = self.normalizer.normalize(snapshot, sentiment);

        let version = match self.active_version.clone() {
            Some(version) => version,
            None => {
                return PolicyDecision::fallback(None, "no policy model version available".into())
            }
        };

        let raw = match timeout(self.inference_timeout, self.inference.infer(&version, &state)).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                warn!("Policy inference failed: {}", e);
                return PolicyDecision::fallback(Some(version), format!("policy inference failed: {}", e));
            }
            Err(_) => {
                warn!("Policy inference timed out after {:?}", self.inference_timeout);
                return PolicyDecision::fallback(Some(version), "policy inference timed out".into());
            }
        };

        match validate_output(&raw) {
            Ok(action) => {
                debug!("Policy {} proposed {} {}", version, action.direction, action.size_fraction);
                PolicyDecision {
                    action,
                    model_version: Some(version),
                    validation_error: None,
                }
            }
            Err(e) => {
                warn!("Discarding malformed policy output {:?}: {}", raw, e);
                PolicyDecision::fallback(Some(version), e.to_string())
            }
        }
    }

    /// Re-read the version pointer on schedule or after a reload request
    async fn refresh_version(&mut self) {
        let generation = self.reload.generation();
        let signalled = generation != self.seen_generation;
        let due = self
            .last_reload
            .map(|at| at.elapsed() >= self.reload_interval)
            .unwrap_or(true);
        if !signalled && !due {
            return;
        }

        match timeout(self.inference_timeout, self.inference.current_version()).await {
            Ok(Ok(version)) => {
                if self.active_version.as_deref() != Some(version.as_str()) {
                    info!(
                        "Policy model swapped: {} -> {}",
                        self.active_version.as_deref().unwrap_or("none"),
                        version
                    );
                    self.active_version = Some(version);
                }
                self.last_reload = Some(Instant::now());
                self.seen_generation = generation;
            }
            Ok(Err(e)) => warn!("Could not read policy version pointer: {}", e),
            Err(_) => warn!("Reading policy version pointer timed out"),
        }
    }
}

/// Check a raw model output against the action contract
///
/// Direction must be BUY, SELL or HOLD; size must be finite and is clamped
/// into [0, 1]. HOLD always carries size 0.
pub fn validate_output(raw: &RawPolicyOutput) -> Result<PolicyAction> {
    let direction: Direction = raw
        .direction
        .as_deref()
        .ok_or_else(|| EngineError::Validation("policy output has no direction".into()))?
        .parse()?;

    if direction == Direction::Hold {
        return Ok(PolicyAction::hold());
    }

    let size = raw
        .size_fraction
        .ok_or_else(|| EngineError::Validation("policy output has no size_fraction".into()))?;
    if !size.is_finite() {
        return Err(EngineError::Validation(format!(
            "policy size_fraction {} is not finite",
            size
        )));
    }

    let size_fraction = Decimal::from_f64(size.clamp(0.0, 1.0))
        .ok_or_else(|| EngineError::Validation(format!("policy size_fraction {} unrepresentable", size)))?
        .round_dp(8);

    Ok(PolicyAction::new(direction, size_fraction))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::traits::NormalizedState;
    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;

    struct FakePolicy {
        version: Mutex<String>,
        output: Mutex<RawPolicyOutput>,
        version_reads: AtomicU64,
    }

    impl FakePolicy {
        fn new(version: &str, output: RawPolicyOutput) -> Arc<Self> {
            Arc::new(Self {
                version: Mutex::new(version.to_string()),
                output: Mutex::new(output),
                version_reads: AtomicU64::new(0),
            })
        }
    }

    #[async_trait]
    impl PolicyInference for FakePolicy {
        async fn current_version(&self) -> Result<String> {
            self.version_reads.fetch_add(1, Ordering::SeqCst);
            Ok(self.version.lock().unwrap().clone())
        }

        async fn infer(&self, _version: &str, _state: &NormalizedState) -> Result<RawPolicyOutput> {
            Ok(self.output.lock().unwrap().clone())
        }
    }

    fn snapshot() -> MarketSnapshot {
        MarketSnapshot {
            pair: "BTC/USDT".into(),
            epoch: 1,
            price: dec!(30000),
            volume: dec!(12),
            timestamp: Utc::now(),
        }
    }

    fn adapter(policy: Arc<FakePolicy>, reload: ReloadHandle) -> PolicyAdapter {
        PolicyAdapter::new(
            policy,
            10,
            Duration::from_secs(3600),
            Duration::from_millis(200),
            reload,
        )
    }

    #[test]
    fn test_validate_clamps_size() {
        let action = validate_output(&RawPolicyOutput::new("buy", 1.7)).unwrap();
        assert_eq!(action.direction, Direction::Buy);
        assert_eq!(action.size_fraction, Decimal::ONE);

        let action = validate_output(&RawPolicyOutput::new("SELL", -0.2)).unwrap();
        assert_eq!(action.size_fraction, Decimal::ZERO);
    }

    #[test]
    fn test_validate_hold_forces_zero_size() {
        let action = validate_output(&RawPolicyOutput::new("HOLD", 0.9)).unwrap();
        assert_eq!(action, PolicyAction::hold());
    }

    #[test]
    fn test_validate_rejects_malformed() {
        assert!(validate_output(&RawPolicyOutput::new("SHORT", 0.5)).is_err());
        assert!(validate_output(&RawPolicyOutput::new("BUY", f64::NAN)).is_err());
        assert!(validate_output(&RawPolicyOutput::default()).is_err());
        let missing_size = RawPolicyOutput {
            direction: Some("BUY".into()),
            size_fraction: None,
        };
        assert!(validate_output(&missing_size).is_err());
    }

    #[tokio::test]
    async fn test_unknown_direction_becomes_hold() {
        let policy = FakePolicy::new("v1", RawPolicyOutput::new("SHORT", 0.5));
        let mut adapter = adapter(policy, ReloadHandle::new());
        let sentiment = SentimentScore::neutral("BTC/USDT", Utc::now());

        let decision = adapter.decide(&snapshot(), &sentiment).await;
        assert_eq!(decision.action, PolicyAction::hold());
        assert!(decision.validation_error.unwrap().contains("SHORT"));
        assert_eq!(decision.model_version.as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn test_model_swap_on_reload_signal() {
        let policy = FakePolicy::new("v1", RawPolicyOutput::new("BUY", 0.3));
        let reload = ReloadHandle::new();
        let mut adapter = adapter(policy.clone(), reload.clone());
        let sentiment = SentimentScore::neutral("BTC/USDT", Utc::now());

        adapter.decide(&snapshot(), &sentiment).await;
        assert_eq!(adapter.active_version(), Some("v1"));

        *policy.version.lock().unwrap() = "v2".to_string();
        adapter.decide(&snapshot(), &sentiment).await;
        // Interval not elapsed and no signal yet
        assert_eq!(adapter.active_version(), Some("v1"));
        assert_eq!(policy.version_reads.load(Ordering::SeqCst), 1);

        reload.request_reload();
        let decision = adapter.decide(&snapshot(), &sentiment).await;
        assert_eq!(adapter.active_version(), Some("v2"));
        assert_eq!(decision.model_version.as_deref(), Some("v2"));
        assert_eq!(decision.action.size_fraction, dec!(0.3));
    }
}
