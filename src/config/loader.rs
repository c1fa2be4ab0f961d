//! Configuration loader

use config::{Config, Environment, File};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;

use super::types::EngineConfig;
use crate::common::errors::{EngineError, Result};

/// Load configuration from file and environment variables
///
/// Priority (highest to lowest):
/// 1. Environment variables (prefixed with APP_, sections split by `__`)
/// 2. Configuration file (TOML format)
/// 3. Default values
pub fn load_config(config_path: Option<&str>) -> Result<EngineConfig> {
    let mut builder = Config::builder();

    if let Some(path) = config_path {
        if Path::new(path).exists() {
            builder = builder.add_source(File::with_name(path).required(false));
        }
    }

    builder = builder.add_source(
        Environment::with_prefix("APP")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("trading.pairs")
            .try_parsing(true),
    );

    let config = builder.build()?;
    let mut engine: EngineConfig = config.try_deserialize()?;
    apply_env_overrides(&mut engine, |key| std::env::var(key).ok())?;
    Ok(engine)
}

/// Load configuration from the flat environment variables only
pub fn load_from_env() -> Result<EngineConfig> {
    dotenvy::dotenv().ok();

    let mut engine = EngineConfig::default();
    apply_env_overrides(&mut engine, |key| std::env::var(key).ok())?;
    Ok(engine)
}

/// Apply the flat `TRADING_PAIR` / `MAX_POSITION_SIZE` style variables
///
/// `lookup` is injected so tests do not touch the process environment.
pub fn apply_env_overrides<F>(engine: &mut EngineConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(pairs) = get("TRADING_PAIRS").or_else(|| get("TRADING_PAIR")) {
        engine.trading.pairs = pairs
            .split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
    }
    if let Some(timeframe) = get("TIMEFRAME") {
        engine.trading.timeframe = timeframe;
    }
    if let Some(v) = get("INITIAL_CAPITAL") {
        engine.trading.initial_capital = parse_decimal("INITIAL_CAPITAL", &v)?;
    }

    if let Some(v) = get("MAX_POSITION_SIZE") {
        engine.risk.max_position_size = parse_decimal("MAX_POSITION_SIZE", &v)?;
    }
    if let Some(v) = get("STOP_LOSS_PERCENT") {
        engine.risk.stop_loss_percent = parse_decimal("STOP_LOSS_PERCENT", &v)?;
    }
    if let Some(v) = get("TAKE_PROFIT_PERCENT") {
        engine.risk.take_profit_percent = parse_decimal("TAKE_PROFIT_PERCENT", &v)?;
    }

    if let Some(path) = get("RL_MODEL_PATH") {
        engine.policy.model_path = path;
    }
    if let Some(endpoint) = get("RL_POLICY_ENDPOINT") {
        engine.policy.endpoint = Some(endpoint);
    }

    if let Some(v) = get("ENABLE_FIREBASE_LOGGING") {
        engine.store.enable_firebase_logging = v.eq_ignore_ascii_case("true");
    }
    if let Some(url) = get("FIREBASE_DATABASE_URL") {
        engine.store.firebase_database_url = Some(url);
    }
    if let Some(token) = get("FIREBASE_AUTH_TOKEN") {
        engine.store.firebase_auth_token = Some(token);
    }

    if let Some(name) = get("EXCHANGE_NAME") {
        engine.exchange.name = name;
    }
    if let Some(key) = get("EXCHANGE_API_KEY") {
        engine.exchange.api_key = Some(key);
    }
    if let Some(secret) = get("EXCHANGE_SECRET_KEY") {
        engine.exchange.api_secret = Some(secret);
    }

    if let Some(level) = get("LOG_LEVEL") {
        engine.settings.log_level = level.to_lowercase();
    }

    Ok(())
}

fn parse_decimal(key: &str, value: &str) -> Result<Decimal> {
    Decimal::from_str(value.trim())
        .map_err(|e| EngineError::Configuration(format!("{} is not a number: {}", key, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_flat_variables_override_defaults() {
        let mut engine = EngineConfig::default();
        apply_env_overrides(
            &mut engine,
            lookup(&[
                ("TRADING_PAIR", "ETH/USDT"),
                ("TIMEFRAME", "15m"),
                ("INITIAL_CAPITAL", "2500.50"),
                ("MAX_POSITION_SIZE", "0.25"),
                ("ENABLE_FIREBASE_LOGGING", "True"),
                ("LOG_LEVEL", "DEBUG"),
            ]),
        )
        .unwrap();

        assert_eq!(engine.trading.pairs, vec!["ETH/USDT".to_string()]);
        assert_eq!(engine.trading.timeframe, "15m");
        assert_eq!(engine.trading.initial_capital, dec!(2500.50));
        assert_eq!(engine.risk.max_position_size, dec!(0.25));
        assert!(engine.store.enable_firebase_logging);
        assert_eq!(engine.settings.log_level, "debug");
    }

    #[test]
    fn test_multiple_pairs() {
        let mut engine = EngineConfig::default();
        apply_env_overrides(&mut engine, lookup(&[("TRADING_PAIRS", "BTC/USDT, ETH/USDT,")]))
            .unwrap();
        assert_eq!(engine.trading.pairs, vec!["BTC/USDT", "ETH/USDT"]);
    }

    #[test]
    fn test_bad_number_is_configuration_error() {
        let mut engine = EngineConfig::default();
        let result = apply_env_overrides(&mut engine, lookup(&[("STOP_LOSS_PERCENT", "two")]));
        assert!(matches!(result, Err(EngineError::Configuration(_))));
    }
}
