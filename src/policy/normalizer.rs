//! Input scaling for the policy model

use rust_decimal::prelude::ToPrimitive;
use std::collections::VecDeque;

use crate::common::traits::NormalizedState;
use crate::common::types::{MarketSnapshot, SentimentScore};

const ZSCORE_LIMIT: f64 = 5.0;

/// Rolling-window normalizer for one pair
#[derive(Debug, Clone)]
pub struct StateNormalizer {
    window: usize,
    prices: VecDeque<f64>,
    volumes: VecDeque<f64>,
}

impl StateNormalizer {
    pub fn new(window: usize) -> Self {
        let window = window.max(2);
        Self {
            window,
            prices: VecDeque::with_capacity(window),
            volumes: VecDeque::with_capacity(window),
        }
    }

    /// Number of snapshots currently in the window
    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }

    /// Scale a snapshot and sentiment score into policy features
    pub fn normalize(&mut self, snapshot: &MarketSnapshot, sentiment: &SentimentScore) -> NormalizedState {
        let price = snapshot.price.to_f64().unwrap_or(0.0);
        let volume = snapshot.volume.to_f64().unwrap_or(0.0).max(0.0);

        let price_return = match self.prices.back() {
            Some(&previous) if previous > 0.0 => (price - previous) / previous,
            _ => 0.0,
        };

        push_bounded(&mut self.prices, price, self.window);
        push_bounded(&mut self.volumes, volume, self.window);

        let (mean, std_dev) = mean_and_std(&self.prices);
        let price_zscore = if std_dev > f64::EPSILON {
            ((price - mean) / std_dev).clamp(-ZSCORE_LIMIT, ZSCORE_LIMIT)
        } else {
            0.0
        };

        let (volume_mean, _) = mean_and_std(&self.volumes);
        let volume_ratio = ((volume + 1.0) / (volume_mean + 1.0)).ln();

        NormalizedState {
            pair: snapshot.pair.clone(),
            price_return,
            price_zscore,
            volume_ratio,
            sentiment: sentiment.value * sentiment.confidence,
            sentiment_confidence: sentiment.confidence,
        }
    }
}

fn push_bounded(values: &mut VecDeque<f64>, value: f64, capacity: usize) {
    if values.len() == capacity {
        values.pop_front();
    }
    values.push_back(value);
}

fn mean_and_std(values: &VecDeque<f64>) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}
