//! REST client for Binance spot

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::{Client, Response, StatusCode};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::auth::{apply_api_key, signed_query};
use super::messages::*;
use crate::common::errors::{EngineError, Result};
use crate::common::traits::{Exchange, MarketDataSource};
use crate::common::types::{ExchangePosition, Fill, MarketSnapshot, Order, Side, SubmitOutcome};
use crate::config::types::ApiCredentials;

/// Binance error code for a reused client order id
const DUPLICATE_ORDER_CODE: i64 = -2010;

/// Split `BTC/USDT` into base and quote assets
pub fn split_pair(pair: &str) -> Result<(&str, &str)> {
    match pair.split_once('/') {
        Some((base, quote)) if !base.is_empty() && !quote.is_empty() => Ok((base, quote)),
        _ => Err(EngineError::Validation(format!(
            "pair '{}' is not in BASE/QUOTE form",
            pair
        ))),
    }
}

/// Exchange symbol for a pair, e.g. `BTCUSDT`
pub fn symbol(pair: &str) -> Result<String> {
    let (base, quote) = split_pair(pair)?;
    Ok(format!("{}{}", base, quote).to_uppercase())
}

fn parse_decimal(field: &str, value: &str) -> Result<Decimal> {
    Decimal::from_str(value)
        .map_err(|e| EngineError::InvalidResponse(format!("Invalid {} '{}': {}", field, value, e)))
}

/// Spot REST client; market data is public, orders and balances are signed
#[derive(Debug, Clone)]
pub struct BinanceClient {
    client: Client,
    base_url: String,
    credentials: Option<ApiCredentials>,
    recv_window_ms: u64,
}

impl BinanceClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Internal(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials: None,
            recv_window_ms: 5000,
        })
    }

    pub fn with_credentials(mut self, credentials: ApiCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_recv_window(mut self, recv_window_ms: u64) -> Self {
        self.recv_window_ms = recv_window_ms;
        self
    }

    fn credentials(&self) -> Result<&ApiCredentials> {
        self.credentials
            .as_ref()
            .ok_or_else(|| EngineError::Authentication("Binance API credentials not configured".into()))
    }

    fn signed_url(&self, path: &str, params: &[(&str, String)]) -> Result<String> {
        let credentials = self.credentials()?;
        let query = signed_query(
            params,
            &credentials.api_secret,
            Utc::now().timestamp_millis(),
            self.recv_window_ms,
        )?;
        Ok(format!("{}{}?{}", self.base_url, path, query))
    }

    /// Map non-success statuses onto engine errors; 4xx bodies are returned
    /// to the caller for endpoint-specific handling
    async fn classify(response: Response) -> Result<std::result::Result<Response, ApiErrorBody>> {
        let status = response.status();
        if status.is_success() {
            return Ok(Ok(response));
        }

        if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(EngineError::RateLimit {
                message: format!("Binance returned {}", status),
                retry_after_seconds: retry_after,
            });
        }

        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() {
            return Err(EngineError::transient(
                "exchange",
                format!("Binance returned {}: {}", status, body),
            ));
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(EngineError::Authentication(body));
        }

        match serde_json::from_str::<ApiErrorBody>(&body) {
            Ok(error) => Ok(Err(error)),
            Err(_) => Err(EngineError::InvalidResponse(format!(
                "Binance returned {}: {}",
                status, body
            ))),
        }
    }

    /// Look up an order by the client id it was submitted with
    #[instrument(skip(self))]
    pub async fn query_order(&self, symbol: &str, client_order_id: &str) -> Result<OrderResponse> {
        let url = self.signed_url(
            "/api/v3/order",
            &[
                ("symbol", symbol.to_string()),
                ("origClientOrderId", client_order_id.to_string()),
            ],
        )?;
        let request = apply_api_key(self.client.get(&url), &self.credentials()?.api_key);
        match Self::classify(request.send().await?).await? {
            Ok(response) => Ok(response.json().await?),
            Err(error) => Err(EngineError::InvalidResponse(format!(
                "order query failed ({}): {}",
                error.code, error.msg
            ))),
        }
    }

    /// Convert an order response into a fill
    ///
    /// Average price is quote filled over base filled. Commissions paid in
    /// the quote asset count directly; base-asset commissions are valued at
    /// the fill price. Order queries carry no fills, so their fee is zero.
    fn to_fill(order: &Order, response: &OrderResponse, quote: &str, base: &str) -> Result<Option<Fill>> {
        let executed = parse_decimal("executedQty", &response.executed_qty)?;
        if executed <= Decimal::ZERO {
            return Ok(None);
        }
        let quote_total = parse_decimal("cummulativeQuoteQty", &response.cummulative_quote_qty)?;
        let price = quote_total / executed;

        let mut fee = Decimal::ZERO;
        for entry in &response.fills {
            let commission = parse_decimal("commission", &entry.commission)?;
            if entry.commission_asset.eq_ignore_ascii_case(quote) {
                fee += commission;
            } else if entry.commission_asset.eq_ignore_ascii_case(base) {
                fee += commission * parse_decimal("price", &entry.price)?;
            }
        }

        let side = match response.side.as_str() {
            "BUY" => Side::Buy,
            "SELL" => Side::Sell,
            _ => order.side,
        };
        let filled_at = response
            .transact_time
            .or(response.update_time)
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now);

        Ok(Some(Fill {
            pair: order.pair.clone(),
            side,
            quantity: executed,
            price,
            fee,
            idempotency_key: response.client_order_id.clone(),
            exchange_order_id: response.order_id.to_string(),
            filled_at,
        }))
    }
}

#[async_trait]
impl MarketDataSource for BinanceClient {
    #[instrument(skip(self))]
    async fn latest_snapshot(&self, pair: &str, epoch: u64) -> Result<MarketSnapshot> {
        let url = format!("{}/api/v3/ticker/24hr?symbol={}", self.base_url, symbol(pair)?);
        debug!("Fetching ticker from: {}", url);

        let response = match Self::classify(self.client.get(&url).send().await?).await? {
            Ok(response) => response,
            Err(error) => {
                return Err(EngineError::InvalidResponse(format!(
                    "ticker request failed ({}): {}",
                    error.code, error.msg
                )))
            }
        };
        let ticker: Ticker24h = response.json().await?;

        Ok(MarketSnapshot {
            pair: pair.to_string(),
            epoch,
            price: parse_decimal("lastPrice", &ticker.last_price)?,
            volume: parse_decimal("volume", &ticker.volume)?,
            timestamp: Utc
                .timestamp_millis_opt(ticker.close_time)
                .single()
                .unwrap_or_else(Utc::now),
        })
    }
}

#[async_trait]
impl Exchange for BinanceClient {
    /// Spot holdings of the base asset, free plus locked
    #[instrument(skip(self))]
    async fn get_position(&self, pair: &str) -> Result<ExchangePosition> {
        let (base, _) = split_pair(pair)?;
        let url = self.signed_url("/api/v3/account", &[])?;
        let request = apply_api_key(self.client.get(&url), &self.credentials()?.api_key);

        let response = match Self::classify(request.send().await?).await? {
            Ok(response) => response,
            Err(error) => {
                return Err(EngineError::InvalidResponse(format!(
                    "account request failed ({}): {}",
                    error.code, error.msg
                )))
            }
        };
        let account: AccountResponse = response.json().await?;

        let mut quantity = Decimal::ZERO;
        for balance in account.balances.iter().filter(|b| b.asset.eq_ignore_ascii_case(base)) {
            quantity += parse_decimal("free", &balance.free)? + parse_decimal("locked", &balance.locked)?;
        }
        Ok(ExchangePosition {
            quantity,
            avg_price: None,
        })
    }

    #[instrument(skip(self, order), fields(pair = %order.pair, key = %order.idempotency_key))]
    async fn submit_order(&self, order: &Order) -> Result<SubmitOutcome> {
        let (base, quote) = split_pair(&order.pair)?;
        let symbol = symbol(&order.pair)?;
        let url = self.signed_url(
            "/api/v3/order",
            &[
                ("symbol", symbol.clone()),
                ("side", order.side.to_string()),
                ("type", "MARKET".to_string()),
                ("quantity", order.quantity.normalize().to_string()),
                ("newClientOrderId", order.idempotency_key.clone()),
                ("newOrderRespType", "FULL".to_string()),
            ],
        )?;
        let request = apply_api_key(self.client.post(&url), &self.credentials()?.api_key);

        match Self::classify(request.send().await?).await? {
            Ok(response) => {
                let body: OrderResponse = response.json().await?;
                match Self::to_fill(order, &body, quote, base)? {
                    Some(fill) => {
                        info!(
                            "Binance filled {} {} {} @ {} (order {})",
                            fill.side, fill.quantity, symbol, fill.price, fill.exchange_order_id
                        );
                        Ok(SubmitOutcome::Filled(fill))
                    }
                    None => Ok(SubmitOutcome::Rejected(format!("order {} not filled", body.status))),
                }
            }
            Err(error) if error.code == DUPLICATE_ORDER_CODE && error.msg.contains("Duplicate") => {
                info!("Order {} already accepted; fetching original", order.idempotency_key);
                let original = self.query_order(&symbol, &order.idempotency_key).await?;
                match Self::to_fill(order, &original, quote, base)? {
                    Some(fill) => Ok(SubmitOutcome::AlreadyProcessed(fill)),
                    None => Ok(SubmitOutcome::Rejected(format!(
                        "duplicate order {} did not fill",
                        original.status
                    ))),
                }
            }
            Err(error) => {
                warn!("Binance rejected order ({}): {}", error.code, error.msg);
                Ok(SubmitOutcome::Rejected(error.msg))
            }
        }
    }

    fn name(&self) -> &'static str {
        "binance"
    }
}
