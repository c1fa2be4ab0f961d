//! Adaptive Trader - Main Entry Point
//!
//! Runs one execution worker per configured trading pair until interrupted.

use adaptive_trader::binance::BinanceClient;
use adaptive_trader::common::channels::create_shutdown_channel;
use adaptive_trader::common::traits::{DurableStore, Exchange, MarketDataSource, PolicyInference};
use adaptive_trader::config::{load_config, EngineConfig};
use adaptive_trader::engine::{Collaborators, WorkerPool};
use adaptive_trader::firebase::FirebaseStore;
use adaptive_trader::paper::{InMemoryStore, MomentumPolicy, PaperExchange, RandomWalkMarket, StaticSentimentSource};
use adaptive_trader::policy::HttpPolicyClient;
use anyhow::{Context, Result};
use clap::Parser;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Per-cycle price shock of the paper market
const PAPER_VOLATILITY: f64 = 0.01;

/// CLI arguments for the application
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error); overrides the config
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Comma-separated trading pairs, e.g. BTC/USDT,ETH/USDT
    #[arg(long, value_delimiter = ',')]
    pairs: Vec<String>,

    /// Trade against the paper exchange even if credentials are set
    #[arg(long)]
    paper: bool,

    /// Run a single cycle per pair and exit
    #[arg(long)]
    once: bool,
}

fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    if json {
        builder
            .json()
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to install subscriber: {}", e))
    } else {
        builder
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to install subscriber: {}", e))
    }
}

async fn build_collaborators(config: &EngineConfig, paper: bool) -> Result<Collaborators> {
    let timeout = Duration::from_secs(config.settings.request_timeout_seconds);

    let store: Arc<dyn DurableStore> = if config.store.enable_firebase_logging {
        let url = config
            .store
            .firebase_database_url
            .as_deref()
            .context("FIREBASE_DATABASE_URL not set")?;
        info!("Persisting ledgers and events to Firebase at {}", url);
        Arc::new(FirebaseStore::new(
            url,
            &config.store.root,
            config.store.firebase_auth_token.clone(),
            timeout,
        )?)
    } else {
        warn!("Firebase logging disabled; ledgers and events are kept in memory only");
        Arc::new(InMemoryStore::new())
    };

    let policy: Arc<dyn PolicyInference> = match &config.policy.endpoint {
        Some(endpoint) => {
            info!("Using policy service at {} (models from {})", endpoint, config.policy.model_path);
            Arc::new(HttpPolicyClient::new(endpoint, timeout)?)
        }
        None => {
            warn!(
                "No policy endpoint configured; using the momentum baseline instead of {}",
                config.policy.model_path
            );
            Arc::new(MomentumPolicy::default())
        }
    };

    let binance = BinanceClient::new(&config.exchange.rest_url, timeout)?
        .with_recv_window(config.exchange.recv_window_ms);

    let (exchange, market_data): (Arc<dyn Exchange>, Arc<dyn MarketDataSource>) =
        match config.exchange.credentials() {
            Some(credentials) if !paper => {
                info!("Trading live on {}", config.exchange.name);
                let client = Arc::new(binance.with_credentials(credentials));
                (client.clone() as Arc<dyn Exchange>, client as Arc<dyn MarketDataSource>)
            }
            _ => {
                warn!("Paper trading: orders are simulated");
                let market = Arc::new(RandomWalkMarket::new(
                    rand::random(),
                    PAPER_VOLATILITY,
                    1000.0,
                ));
                for pair in &config.trading.pairs {
                    let price = match binance.latest_snapshot(pair, 0).await {
                        Ok(snapshot) => snapshot.price,
                        Err(e) => {
                            warn!("No live price for {} ({}); starting paper market at 100", pair, e);
                            dec!(100)
                        }
                    };
                    market.set_price(pair, price).await;
                }
                let exchange = Arc::new(PaperExchange::new(market.clone(), config.risk.fee_rate));
                (exchange as Arc<dyn Exchange>, market as Arc<dyn MarketDataSource>)
            }
        };

    Ok(Collaborators {
        store,
        exchange,
        market_data,
        sentiment: Arc::new(StaticSentimentSource::new(0.0, 0.0)),
        policy,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load environment variables from .env file if present
    dotenvy::dotenv().ok();

    let mut config = load_config(Some(args.config.as_str())).context("failed to load configuration")?;
    if !args.pairs.is_empty() {
        config.trading.pairs = args.pairs.clone();
    }

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.settings.log_level.clone());
    init_logging(&level, args.log_json)?;

    info!("Starting adaptive trader");
    info!("Configuration file: {}", args.config);
    config.validate()?;

    let collaborators = build_collaborators(&config, args.paper).await?;
    let pool = WorkerPool::new(config, collaborators);
    let operator = pool.operator();

    let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal, cleaning up...");
            let _ = shutdown_tx.send(true);
        }
        // Keep the sender alive until the process exits
        std::future::pending::<()>().await;
    });

    let exits = pool.run(shutdown_rx, args.once.then_some(1)).await?;

    for status in operator.statuses().await {
        info!(
            "{}: position {:?}, capital {:?}, last epoch {}",
            status.pair,
            status.position.as_ref().map(|p| p.quantity),
            status.capital.as_ref().map(|c| c.available_capital),
            status.last_epoch
        );
    }
    for exit in &exits {
        if let Some(reason) = &exit.halted {
            error!("{} halted after {} cycle(s): {}", exit.pair, exit.cycles, reason);
        }
    }

    Ok(())
}
