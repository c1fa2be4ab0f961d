//! Staleness-aware sentiment aggregation

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::common::traits::SentimentSource;
use crate::common::types::{RawReading, SentimentScore};
use crate::config::types::SentimentConfig;

/// Merges raw readings from a sentiment source into one score per pair
///
/// Never fails: source outages degrade to the cached score with decayed
/// confidence, or to a neutral score.
pub struct SentimentAggregator {
    source: Arc<dyn SentimentSource>,
    config: SentimentConfig,
    /// Last successfully aggregated score per pair
    cache: HashMap<String, SentimentScore>,
}

impl SentimentAggregator {
    pub fn new(source: Arc<dyn SentimentSource>, config: SentimentConfig) -> Self {
        Self {
            source,
            config,
            cache: HashMap::new(),
        }
    }

    /// Current score for `pair`
    #[instrument(skip(self))]
    pub async fn score(&mut self, pair: &str) -> SentimentScore {
        let now = Utc::now();
        let fetched = timeout(self.config.timeout(), self.source.raw_readings(pair)).await;

        let score = match fetched {
            Ok(Ok(readings)) => match aggregate(pair, &readings, now, &self.config) {
                Some(score) => {
                    self.cache.insert(pair.to_string(), score.clone());
                    score
                }
                None => {
                    debug!("No qualifying sentiment readings for {}", pair);
                    SentimentScore::neutral(pair, now)
                }
            },
            Ok(Err(e)) => {
                warn!("Sentiment source failed for {}: {}", pair, e);
                self.fallback(pair, now)
            }
            Err(_) => {
                warn!(
                    "Sentiment source timed out for {} after {:?}",
                    pair,
                    self.config.timeout()
                );
                self.fallback(pair, now)
            }
        };

        apply_staleness(score, now, &self.config)
    }

    /// Cached score with decayed confidence, or neutral
    fn fallback(&mut self, pair: &str, now: DateTime<Utc>) -> SentimentScore {
        match self.cache.get_mut(pair) {
            Some(cached) => {
                cached.confidence *= self.config.decay_factor;
                cached.clone()
            }
            None => SentimentScore::neutral(pair, now),
        }
    }
}

/// Confidence-weighted mean of readings inside the staleness window
///
/// Returns `None` when no reading qualifies.
pub fn aggregate(
    pair: &str,
    readings: &[RawReading],
    now: DateTime<Utc>,
    config: &SentimentConfig,
) -> Option<SentimentScore> {
    let window = config.staleness_threshold();
    let qualifying: Vec<(f64, f64, DateTime<Utc>)> = readings
        .iter()
        .filter(|r| r.value.is_finite() && r.confidence.is_finite())
        .filter(|r| now - r.timestamp <= window)
        .map(|r| (r.value.clamp(-1.0, 1.0), r.confidence.clamp(0.0, 1.0), r.timestamp))
        .filter(|(_, confidence, _)| *confidence > 0.0)
        .collect();

    if qualifying.is_empty() {
        return None;
    }

    let weight: f64 = qualifying.iter().map(|(_, c, _)| c).sum();
    let weighted: f64 = qualifying.iter().map(|(v, c, _)| v * c).sum();
    let newest = qualifying.iter().map(|(_, _, ts)| *ts).max()?;

    Some(SentimentScore {
        pair: pair.to_string(),
        value: (weighted / weight).clamp(-1.0, 1.0),
        confidence: weight / qualifying.len() as f64,
        computed_at: newest.min(now),
    })
}

/// Decay the confidence of a score older than the staleness threshold
///
/// Beyond the threshold confidence is multiplied by
/// `decay^(1 + excess / threshold)`, which is strictly below the original and
/// strictly decreasing with age. Below `min_confidence` the score is neutral.
pub fn apply_staleness(
    mut score: SentimentScore,
    now: DateTime<Utc>,
    config: &SentimentConfig,
) -> SentimentScore {
    let threshold = config.staleness_threshold();
    let staleness = score.staleness(now);
    if staleness > threshold {
        let excess = (staleness - threshold).num_milliseconds() as f64;
        let threshold_ms = threshold.num_milliseconds().max(1) as f64;
        let factor = config.decay_factor.powf(1.0 + excess / threshold_ms);
        score.confidence *= factor;
    }
    if score.confidence < config.min_confidence {
        return SentimentScore {
            computed_at: score.computed_at,
            ..SentimentScore::neutral(score.pair, now)
        };
    }
    score
}
