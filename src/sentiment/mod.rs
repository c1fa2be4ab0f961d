//! Sentiment aggregation

mod aggregator;

pub use aggregator::{aggregate, apply_staleness, SentimentAggregator};
