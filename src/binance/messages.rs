//! Binance spot REST payloads

use serde::Deserialize;

/// `GET /api/v3/ticker/24hr`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticker24h {
    pub symbol: String,
    pub last_price: String,
    pub volume: String,
    pub close_time: i64,
}

/// One execution inside a FULL order response
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderFillEntry {
    pub price: String,
    pub qty: String,
    pub commission: String,
    pub commission_asset: String,
}

/// `POST /api/v3/order` (FULL) and `GET /api/v3/order`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub symbol: String,
    pub order_id: u64,
    pub client_order_id: String,
    pub executed_qty: String,
    pub cummulative_quote_qty: String,
    pub status: String,
    pub side: String,
    #[serde(default)]
    pub transact_time: Option<i64>,
    #[serde(default)]
    pub update_time: Option<i64>,
    #[serde(default)]
    pub fills: Vec<OrderFillEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Balance {
    pub asset: String,
    pub free: String,
    pub locked: String,
}

/// `GET /api/v3/account`
#[derive(Debug, Clone, Deserialize)]
pub struct AccountResponse {
    pub balances: Vec<Balance>,
}

/// Error body returned with 4xx responses
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    pub code: i64,
    pub msg: String,
}
