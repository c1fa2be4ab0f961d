//! Configuration types

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

use crate::common::errors::{EngineError, Result};
use crate::common::retry::RetryPolicy;

/// Main engine configuration
///
/// Built once at startup and handed to every pair worker by value; there is
/// no process-wide settings object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub trading: TradingConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub sentiment: SentimentConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub settings: AppSettings,
}

/// Trading parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    /// Pairs to trade, one worker each
    #[serde(default = "default_pairs")]
    pub pairs: Vec<String>,
    /// Cycle interval, e.g. `1m`, `15m`, `1h`, `1d`
    #[serde(default = "default_timeframe")]
    pub timeframe: String,
    /// Capital seeded into a pair's ledger when the store has none
    #[serde(default = "default_initial_capital")]
    pub initial_capital: Decimal,
    /// Decimal places kept on order quantities
    #[serde(default = "default_quantity_precision")]
    pub quantity_precision: u32,
    /// Allow SELL to open or flip into a short position
    #[serde(default)]
    pub allow_short: bool,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            pairs: default_pairs(),
            timeframe: default_timeframe(),
            initial_capital: default_initial_capital(),
            quantity_precision: default_quantity_precision(),
            allow_short: false,
        }
    }
}

fn default_pairs() -> Vec<String> {
    vec!["BTC/USDT".to_string()]
}

fn default_timeframe() -> String {
    "1h".to_string()
}

fn default_initial_capital() -> Decimal {
    dec!(10000)
}

fn default_quantity_precision() -> u32 {
    6
}

/// Risk limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Max position notional as a fraction of equity, in (0, 1]
    #[serde(default = "default_max_position_size")]
    pub max_position_size: Decimal,
    /// Stop-loss distance from entry, in percent
    #[serde(default = "default_stop_loss_percent")]
    pub stop_loss_percent: Decimal,
    /// Take-profit distance from entry, in percent
    #[serde(default = "default_take_profit_percent")]
    pub take_profit_percent: Decimal,
    /// Expected taker fee rate, reserved when sizing buys
    #[serde(default = "default_fee_rate")]
    pub fee_rate: Decimal,
    /// Extra headroom for price movement between sizing and fill
    #[serde(default = "default_slippage_buffer")]
    pub slippage_buffer: Decimal,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_position_size: default_max_position_size(),
            stop_loss_percent: default_stop_loss_percent(),
            take_profit_percent: default_take_profit_percent(),
            fee_rate: default_fee_rate(),
            slippage_buffer: default_slippage_buffer(),
        }
    }
}

fn default_max_position_size() -> Decimal {
    dec!(0.1)
}

fn default_stop_loss_percent() -> Decimal {
    dec!(2.0)
}

fn default_take_profit_percent() -> Decimal {
    dec!(5.0)
}

fn default_fee_rate() -> Decimal {
    dec!(0.001)
}

fn default_slippage_buffer() -> Decimal {
    dec!(0.005)
}

/// Sentiment aggregation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentConfig {
    /// Readings older than this are ignored; scores older than this decay
    #[serde(default = "default_staleness_threshold")]
    pub staleness_threshold_secs: u64,
    /// Confidence multiplier applied on source outage and per threshold of age
    #[serde(default = "default_decay_factor")]
    pub decay_factor: f64,
    /// Decayed confidence below this is treated as absent
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    /// Bound on waiting for the sentiment source
    #[serde(default = "default_sentiment_timeout")]
    pub timeout_ms: u64,
}

impl Default for SentimentConfig {
    fn default() -> Self {
        Self {
            staleness_threshold_secs: default_staleness_threshold(),
            decay_factor: default_decay_factor(),
            min_confidence: default_min_confidence(),
            timeout_ms: default_sentiment_timeout(),
        }
    }
}

impl SentimentConfig {
    pub fn staleness_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.staleness_threshold_secs as i64)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_staleness_threshold() -> u64 {
    3600
}

fn default_decay_factor() -> f64 {
    0.5
}

fn default_min_confidence() -> f64 {
    0.05
}

fn default_sentiment_timeout() -> u64 {
    2000
}

/// Policy adapter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Where the trained model artifacts live
    #[serde(default = "default_model_path")]
    pub model_path: String,
    /// HTTP inference endpoint; the built-in baseline is used when absent
    #[serde(default)]
    pub endpoint: Option<String>,
    /// How often the model version pointer is re-read
    #[serde(default = "default_reload_interval")]
    pub reload_interval_secs: u64,
    /// Rolling window used for input normalization
    #[serde(default = "default_normalization_window")]
    pub normalization_window: usize,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            model_path: default_model_path(),
            endpoint: None,
            reload_interval_secs: default_reload_interval(),
            normalization_window: default_normalization_window(),
        }
    }
}

fn default_model_path() -> String {
    "./models/rl_agent".to_string()
}

fn default_reload_interval() -> u64 {
    300
}

fn default_normalization_window() -> usize {
    50
}

/// Retry and cycle budgets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_ms: u64,
    /// Wall-clock budget for one cycle up to SUBMIT
    #[serde(default = "default_cycle_budget")]
    pub cycle_budget_secs: u64,
    /// Attempts for background event appends
    #[serde(default = "default_journal_attempts")]
    pub journal_max_attempts: u32,
    /// Events kept per pair on the status board
    #[serde(default = "default_status_events")]
    pub status_event_limit: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            attempt_timeout_ms: default_attempt_timeout(),
            cycle_budget_secs: default_cycle_budget(),
            journal_max_attempts: default_journal_attempts(),
            status_event_limit: default_status_events(),
        }
    }
}

impl ExecutionConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            attempt_timeout: Duration::from_millis(self.attempt_timeout_ms),
        }
    }

    pub fn journal_retry_policy(&self) -> RetryPolicy {
        self.retry_policy().with_max_attempts(self.journal_max_attempts)
    }

    pub fn cycle_budget(&self) -> Duration {
        Duration::from_secs(self.cycle_budget_secs)
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    250
}

fn default_max_delay() -> u64 {
    5000
}

fn default_attempt_timeout() -> u64 {
    10_000
}

fn default_cycle_budget() -> u64 {
    120
}

fn default_journal_attempts() -> u32 {
    8
}

fn default_status_events() -> usize {
    50
}

/// Durable store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Persist ledgers and events to Firebase; in-memory otherwise
    #[serde(default)]
    pub enable_firebase_logging: bool,
    /// Firebase Realtime Database URL
    #[serde(default)]
    pub firebase_database_url: Option<String>,
    /// Database secret or ID token passed as `auth`
    #[serde(default)]
    pub firebase_auth_token: Option<String>,
    /// Top-level node under which all data is written
    #[serde(default = "default_store_root")]
    pub root: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            enable_firebase_logging: false,
            firebase_database_url: None,
            firebase_auth_token: None,
            root: default_store_root(),
        }
    }
}

fn default_store_root() -> String {
    "trading".to_string()
}

/// Exchange connectivity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default = "default_exchange_name")]
    pub name: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_secret: Option<String>,
    #[serde(default = "default_exchange_rest_url")]
    pub rest_url: String,
    /// Signed request validity window
    #[serde(default = "default_recv_window")]
    pub recv_window_ms: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            name: default_exchange_name(),
            api_key: None,
            api_secret: None,
            rest_url: default_exchange_rest_url(),
            recv_window_ms: default_recv_window(),
        }
    }
}

impl ExchangeConfig {
    /// Credentials if both key and secret are set
    pub fn credentials(&self) -> Option<ApiCredentials> {
        match (&self.api_key, &self.api_secret) {
            (Some(key), Some(secret)) if !key.is_empty() && !secret.is_empty() => {
                Some(ApiCredentials::new(key.clone(), secret.clone()))
            }
            _ => None,
        }
    }
}

fn default_exchange_name() -> String {
    "binance".to_string()
}

fn default_exchange_rest_url() -> String {
    "https://api.binance.com".to_string()
}

fn default_recv_window() -> u64 {
    5000
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

/// API credentials for authenticated requests
#[derive(Debug, Clone)]
pub struct ApiCredentials {
    pub api_key: String,
    pub api_secret: String,
}

impl ApiCredentials {
    pub fn new(api_key: String, api_secret: String) -> Self {
        Self {
            api_key,
            api_secret,
        }
    }
}

/// Parse a timeframe such as `30s`, `15m`, `1h` or `1d`
pub fn parse_timeframe(timeframe: &str) -> Result<Duration> {
    let timeframe = timeframe.trim();
    let split = timeframe
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| EngineError::Configuration(format!("timeframe '{}' has no unit", timeframe)))?;
    let (amount, unit) = timeframe.split_at(split);
    let amount: u64 = amount
        .parse()
        .map_err(|_| EngineError::Configuration(format!("invalid timeframe '{}'", timeframe)))?;
    if amount == 0 {
        return Err(EngineError::Configuration("timeframe must be positive".into()));
    }
    let seconds = match unit {
        "s" => amount,
        "m" => amount * 60,
        "h" => amount * 3600,
        "d" => amount * 86_400,
        "w" => amount * 604_800,
        _ => {
            return Err(EngineError::Configuration(format!(
                "unknown timeframe unit '{}'",
                unit
            )))
        }
    };
    Ok(Duration::from_secs(seconds))
}

impl EngineConfig {
    /// Cycle interval derived from the timeframe
    pub fn cycle_interval(&self) -> Result<Duration> {
        parse_timeframe(&self.trading.timeframe)
    }

    /// Validate critical configuration parameters
    ///
    /// Collects every problem before failing so operators see them all at once.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.trading.pairs.is_empty() {
            errors.push("at least one trading pair is required".to_string());
        }
        if let Err(e) = self.cycle_interval() {
            errors.push(e.to_string());
        }
        if self.trading.initial_capital < Decimal::ZERO {
            errors.push("INITIAL_CAPITAL must not be negative".to_string());
        }

        let risk = &self.risk;
        if risk.max_position_size <= Decimal::ZERO || risk.max_position_size > Decimal::ONE {
            errors.push("MAX_POSITION_SIZE must be between 0 and 1".to_string());
        }
        if risk.stop_loss_percent <= Decimal::ZERO || risk.stop_loss_percent >= dec!(100) {
            errors.push("STOP_LOSS_PERCENT must be positive and below 100".to_string());
        }
        if risk.take_profit_percent <= Decimal::ZERO {
            errors.push("TAKE_PROFIT_PERCENT must be positive".to_string());
        }
        if risk.fee_rate < Decimal::ZERO || risk.slippage_buffer < Decimal::ZERO {
            errors.push("fee_rate and slippage_buffer must not be negative".to_string());
        }

        let sentiment = &self.sentiment;
        if !(sentiment.decay_factor > 0.0 && sentiment.decay_factor < 1.0) {
            errors.push("sentiment decay_factor must be in (0, 1)".to_string());
        }
        if !(0.0..=1.0).contains(&sentiment.min_confidence) {
            errors.push("sentiment min_confidence must be in [0, 1]".to_string());
        }
        if sentiment.staleness_threshold_secs == 0 {
            errors.push("sentiment staleness threshold must be positive".to_string());
        }

        if self.execution.max_attempts == 0 {
            errors.push("execution max_attempts must be at least 1".to_string());
        }

        if self.store.enable_firebase_logging
            && self
                .store
                .firebase_database_url
                .as_deref()
                .map(str::is_empty)
                .unwrap_or(true)
        {
            errors.push(
                "FIREBASE_DATABASE_URL is required when Firebase logging is enabled".to_string(),
            );
        }

        let urls = [
            ("FIREBASE_DATABASE_URL", self.store.firebase_database_url.as_deref()),
            ("exchange rest_url", Some(self.exchange.rest_url.as_str())),
            ("RL_POLICY_ENDPOINT", self.policy.endpoint.as_deref()),
        ];
        for (name, value) in urls {
            if let Some(value) = value.filter(|v| !v.is_empty()) {
                if let Err(e) = url::Url::parse(value) {
                    errors.push(format!("{} '{}' is not a valid URL: {}", name, value, e));
                }
            }
        }

        if self.exchange.credentials().is_none() {
            warn!("Exchange API credentials not configured - running in simulation mode only");
        }

        if errors.is_empty() {
            info!("Configuration validated successfully");
            Ok(())
        } else {
            for error in &errors {
                tracing::error!("Configuration error: {}", error);
            }
            Err(EngineError::Configuration(errors.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_urls_rejected() {
        let mut config = EngineConfig::default();
        config.exchange.rest_url = "not a url".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("rest_url"));
    }

    #[test]
    fn test_defaults_validate() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cycle_interval().unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn test_parse_timeframe_units() {
        assert_eq!(parse_timeframe("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_timeframe("15m").unwrap(), Duration::from_secs(900));
        assert_eq!(parse_timeframe("1d").unwrap(), Duration::from_secs(86_400));
        assert!(parse_timeframe("0m").is_err());
        assert!(parse_timeframe("h").is_err());
        assert!(parse_timeframe("12").is_err());
        assert!(parse_timeframe("5y").is_err());
    }

    #[test]
    fn test_invalid_risk_parameters_rejected() {
        let mut config = EngineConfig::default();
        config.risk.max_position_size = dec!(1.5);
        config.risk.stop_loss_percent = dec!(0);
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("MAX_POSITION_SIZE"));
        assert!(err.contains("STOP_LOSS_PERCENT"));
    }

    #[test]
    fn test_firebase_requires_url() {
        let mut config = EngineConfig::default();
        config.store.enable_firebase_logging = true;
        assert!(config.validate().is_err());
        config.store.firebase_database_url = Some("https://demo.firebaseio.com".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_credentials_require_both_parts() {
        let mut exchange = ExchangeConfig::default();
        exchange.api_key = Some("key".into());
        assert!(exchange.credentials().is_none());
        exchange.api_secret = Some("secret".into());
        assert!(exchange.credentials().is_some());
    }
}
