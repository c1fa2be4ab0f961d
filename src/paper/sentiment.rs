//! Fixed sentiment readings for paper trading

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::common::errors::Result;
use crate::common::traits::SentimentSource;
use crate::common::types::RawReading;

/// Returns one fresh reading per call unless a pair has explicit readings
pub struct StaticSentimentSource {
    value: f64,
    confidence: f64,
    overrides: RwLock<HashMap<String, Vec<RawReading>>>,
}

impl StaticSentimentSource {
    pub fn new(value: f64, confidence: f64) -> Self {
        Self {
            value,
            confidence,
            overrides: RwLock::new(HashMap::new()),
        }
    }

    /// Serve exactly these readings for a pair from now on
    pub async fn set_readings(&self, pair: &str, readings: Vec<RawReading>) {
        self.overrides.write().await.insert(pair.to_string(), readings);
    }
}

#[async_trait]
impl SentimentSource for StaticSentimentSource {
    async fn raw_readings(&self, pair: &str) -> Result<Vec<RawReading>> {
        if let Some(readings) = self.overrides.read().await.get(pair) {
            return Ok(readings.clone());
        }
        Ok(vec![RawReading {
            value: self.value,
            confidence: self.confidence,
            source: "static".to_string(),
            timestamp: Utc::now(),
        }])
    }
}
