//! Simulated exchange that fills market orders at the paper mark

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use super::market::RandomWalkMarket;
use crate::common::errors::{EngineError, Result};
use crate::common::traits::Exchange;
use crate::common::types::{ExchangePosition, Fill, Order, SubmitOutcome};

#[derive(Debug, Default)]
struct Book {
    /// pair -> (signed quantity, average entry)
    positions: HashMap<String, (Decimal, Decimal)>,
    /// idempotency key -> original fill
    fills: HashMap<String, Fill>,
    next_order_id: u64,
    lost_acks: u32,
}

/// Paper exchange with idempotent order keys and a flat fee rate
pub struct PaperExchange {
    market: Arc<RandomWalkMarket>,
    fee_rate: Decimal,
    book: Mutex<Book>,
}

impl PaperExchange {
    pub fn new(market: Arc<RandomWalkMarket>, fee_rate: Decimal) -> Self {
        Self {
            market,
            fee_rate,
            book: Mutex::new(Book::default()),
        }
    }

    /// Execute the next `count` orders but report a lost response
    pub async fn lose_next_acks(&self, count: u32) {
        self.book.lock().await.lost_acks = count;
    }

    /// Move a position out of band, as a manual trade would
    pub async fn set_position(&self, pair: &str, quantity: Decimal, avg_price: Decimal) {
        self.book
            .lock()
            .await
            .positions
            .insert(pair.to_string(), (quantity, avg_price));
    }

    /// Number of distinct orders executed
    pub async fn executed_orders(&self) -> usize {
        self.book.lock().await.fills.len()
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    async fn get_position(&self, pair: &str) -> Result<ExchangePosition> {
        let book = self.book.lock().await;
        let (quantity, avg) = book.positions.get(pair).copied().unwrap_or_default();
        Ok(ExchangePosition {
            quantity,
            avg_price: if quantity.is_zero() { None } else { Some(avg) },
        })
    }

    #[instrument(skip(self, order), fields(pair = %order.pair, key = %order.idempotency_key))]
    async fn submit_order(&self, order: &Order) -> Result<SubmitOutcome> {
        let mut book = self.book.lock().await;
        if let Some(fill) = book.fills.get(&order.idempotency_key) {
            debug!("Duplicate paper order {}", order.idempotency_key);
            return Ok(SubmitOutcome::AlreadyProcessed(fill.clone()));
        }

        if order.quantity <= Decimal::ZERO {
            return Ok(SubmitOutcome::Rejected(format!(
                "invalid quantity {}",
                order.quantity
            )));
        }
        let price = match self.market.price(&order.pair).await {
            Some(price) => price,
            None => return Ok(SubmitOutcome::Rejected(format!("unknown symbol {}", order.pair))),
        };

        book.next_order_id += 1;
        let fill = Fill {
            pair: order.pair.clone(),
            side: order.side,
            quantity: order.quantity,
            price,
            fee: (order.quantity * price * self.fee_rate).round_dp(8),
            idempotency_key: order.idempotency_key.clone(),
            exchange_order_id: format!("paper-{}", book.next_order_id),
            filled_at: Utc::now(),
        };

        let entry = book.positions.entry(order.pair.clone()).or_default();
        let (old, avg) = *entry;
        let new = old + fill.signed_quantity();
        let avg = if new.is_zero() {
            Decimal::ZERO
        } else if old.is_zero() || (old.is_sign_positive() == new.is_sign_positive() && new.abs() > old.abs()) {
            (old.abs() * avg + fill.quantity * price) / new.abs()
        } else if old.is_sign_positive() != new.is_sign_positive() {
            price
        } else {
            avg
        };
        *entry = (new, avg);
        book.fills.insert(order.idempotency_key.clone(), fill.clone());

        info!(
            "Paper fill {} {} {} @ {} (order {})",
            fill.side, fill.quantity, fill.pair, fill.price, fill.exchange_order_id
        );

        if book.lost_acks > 0 {
            book.lost_acks -= 1;
            return Err(EngineError::transient("exchange", "paper order response lost"));
        }
        Ok(SubmitOutcome::Filled(fill))
    }

    fn name(&self) -> &'static str {
        "paper"
    }
}
