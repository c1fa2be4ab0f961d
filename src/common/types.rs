//! Core domain types shared by every component of the engine

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::errors::{EngineError, Result};

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// +1 for buys, -1 for sells
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => Decimal::NEGATIVE_ONE,
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Direction proposed by the policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Buy,
    Sell,
    Hold,
}

impl Direction {
    /// Order side for a trading direction, `None` for HOLD
    pub fn side(&self) -> Option<Side> {
        match self {
            Direction::Buy => Some(Side::Buy),
            Direction::Sell => Some(Side::Sell),
            Direction::Hold => None,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Buy => write!(f, "BUY"),
            Direction::Sell => write!(f, "SELL"),
            Direction::Hold => write!(f, "HOLD"),
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BUY" => Ok(Direction::Buy),
            "SELL" => Ok(Direction::Sell),
            "HOLD" => Ok(Direction::Hold),
            other => Err(EngineError::Validation(format!(
                "unknown policy direction '{}'",
                other
            ))),
        }
    }
}

/// Market state for one pair at one epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    /// Trading pair, e.g. `BTC/USDT`
    pub pair: String,
    /// Monotonic cycle identifier
    pub epoch: u64,
    /// Last traded price
    pub price: Decimal,
    /// Traded volume over the source's window
    pub volume: Decimal,
    /// When the source produced this snapshot
    pub timestamp: DateTime<Utc>,
}

/// A single reading from a sentiment source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawReading {
    pub value: f64,
    pub confidence: f64,
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

/// Aggregated sentiment for one pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentScore {
    pub pair: String,
    /// Polarity in [-1, 1]
    pub value: f64,
    /// Trust in [0, 1]
    pub confidence: f64,
    pub computed_at: DateTime<Utc>,
}

impl SentimentScore {
    /// Neutral score carrying no information
    pub fn neutral(pair: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            pair: pair.into(),
            value: 0.0,
            confidence: 0.0,
            computed_at: now,
        }
    }

    /// Elapsed time since the score was computed
    pub fn staleness(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.computed_at
    }

    pub fn is_neutral(&self) -> bool {
        self.confidence == 0.0
    }
}

/// Policy output before risk checks
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PolicyAction {
    pub direction: Direction,
    /// Fraction of equity to deploy, in [0, 1]
    pub size_fraction: Decimal,
}

impl PolicyAction {
    pub fn hold() -> Self {
        Self {
            direction: Direction::Hold,
            size_fraction: Decimal::ZERO,
        }
    }

    pub fn new(direction: Direction, size_fraction: Decimal) -> Self {
        Self {
            direction,
            size_fraction,
        }
    }
}

/// Why a risk check rejected or shrank an action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskReason {
    InvalidMarkPrice,
    NoAvailableCapital,
    NoEquity,
    ClampedToMaxPosition,
    ClampedToAvailableCapital,
    ClampedToHeldQuantity,
    PositionLimitReached,
    NoPositionToSell,
    SupersededByForcedClose,
    SizeRoundedToZero,
}

impl std::fmt::Display for RiskReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            RiskReason::InvalidMarkPrice => "mark price is not positive",
            RiskReason::NoAvailableCapital => "available capital is exhausted",
            RiskReason::NoEquity => "equity base is not positive",
            RiskReason::ClampedToMaxPosition => "size clamped to max position fraction",
            RiskReason::ClampedToAvailableCapital => "size clamped to available capital",
            RiskReason::ClampedToHeldQuantity => "sell clamped to held quantity",
            RiskReason::PositionLimitReached => "position already at max size",
            RiskReason::NoPositionToSell => "no long position to sell and shorting disabled",
            RiskReason::SupersededByForcedClose => "protective level already triggered",
            RiskReason::SizeRoundedToZero => "order quantity rounds to zero",
        };
        f.write_str(text)
    }
}

/// Outcome of the risk check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskDecision {
    pub approved: bool,
    pub direction: Direction,
    /// Size after clamping, never above the max position fraction
    pub size_fraction: Decimal,
    /// Base-asset quantity to trade
    pub quantity: Decimal,
    pub reason: Option<RiskReason>,
    /// Protective levels for a newly opened position
    pub stop_loss_price: Option<Decimal>,
    pub take_profit_price: Option<Decimal>,
}

impl RiskDecision {
    pub fn hold() -> Self {
        Self {
            approved: true,
            direction: Direction::Hold,
            size_fraction: Decimal::ZERO,
            quantity: Decimal::ZERO,
            reason: None,
            stop_loss_price: None,
            take_profit_price: None,
        }
    }

    pub fn reject(direction: Direction, reason: RiskReason) -> Self {
        Self {
            approved: false,
            direction,
            size_fraction: Decimal::ZERO,
            quantity: Decimal::ZERO,
            reason: Some(reason),
            stop_loss_price: None,
            take_profit_price: None,
        }
    }

    /// True when an order must be sent
    pub fn is_trade(&self) -> bool {
        self.approved && self.direction != Direction::Hold && self.quantity > Decimal::ZERO
    }
}

/// Deterministic order key derived from pair and epoch
pub fn idempotency_key(pair: &str, epoch: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(pair.as_bytes());
    hasher.update(b":");
    hasher.update(epoch.to_be_bytes());
    // 32 hex chars fits exchange client-order-id limits
    hex::encode(hasher.finalize())[..32].to_string()
}

/// An order ready for submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub pair: String,
    pub epoch: u64,
    pub side: Side,
    pub quantity: Decimal,
    pub idempotency_key: String,
    /// Price the order was sized against
    pub reference_price: Decimal,
    /// Issued by a stop-loss/take-profit trigger rather than the policy
    pub forced_close: bool,
}

impl Order {
    pub fn new(pair: &str, epoch: u64, side: Side, quantity: Decimal, reference_price: Decimal) -> Self {
        Self {
            pair: pair.to_string(),
            epoch,
            side,
            quantity,
            idempotency_key: idempotency_key(pair, epoch),
            reference_price,
            forced_close: false,
        }
    }

    pub fn forced(mut self) -> Self {
        self.forced_close = true;
        self
    }
}

/// Exchange confirmation of an executed order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub pair: String,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    /// Fee in quote currency
    pub fee: Decimal,
    pub idempotency_key: String,
    pub exchange_order_id: String,
    pub filled_at: DateTime<Utc>,
}

impl Fill {
    /// Signed base-asset change
    pub fn signed_quantity(&self) -> Decimal {
        self.side.sign() * self.quantity
    }
}

/// Result of an order submission
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// Executed by this call
    Filled(Fill),
    /// The idempotency key was seen before; this is the original fill
    AlreadyProcessed(Fill),
    /// Refused by the exchange
    Rejected(String),
}

/// Authoritative position held at the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub quantity: Decimal,
    pub avg_price: Option<Decimal>,
}

/// Which protective level fired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectiveTrigger {
    StopLoss,
    TakeProfit,
}

impl std::fmt::Display for ProtectiveTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtectiveTrigger::StopLoss => write!(f, "stop-loss"),
            ProtectiveTrigger::TakeProfit => write!(f, "take-profit"),
        }
    }
}

/// Open position for one pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub pair: String,
    /// Positive = long, negative = short
    pub quantity: Decimal,
    pub entry_price: Decimal,
    #[serde(default)]
    pub stop_loss_price: Option<Decimal>,
    #[serde(default)]
    pub take_profit_price: Option<Decimal>,
}

impl Position {
    pub fn flat(pair: impl Into<String>) -> Self {
        Self {
            pair: pair.into(),
            quantity: Decimal::ZERO,
            entry_price: Decimal::ZERO,
            stop_loss_price: None,
            take_profit_price: None,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.quantity.is_zero()
    }

    pub fn is_long(&self) -> bool {
        self.quantity > Decimal::ZERO
    }

    /// Signed mark-to-market value
    pub fn market_value(&self, mark: Decimal) -> Decimal {
        self.quantity * mark
    }

    /// Check whether `price` crosses a protective level
    pub fn protective_trigger(&self, price: Decimal) -> Option<ProtectiveTrigger> {
        if self.is_flat() {
            return None;
        }
        let long = self.is_long();
        if let Some(stop) = self.stop_loss_price {
            if (long && price <= stop) || (!long && price >= stop) {
                return Some(ProtectiveTrigger::StopLoss);
            }
        }
        if let Some(target) = self.take_profit_price {
            if (long && price >= target) || (!long && price <= target) {
                return Some(ProtectiveTrigger::TakeProfit);
            }
        }
        None
    }

    /// Side of the order that closes this position
    pub fn closing_side(&self) -> Option<Side> {
        if self.is_flat() {
            None
        } else if self.is_long() {
            Some(Side::Sell)
        } else {
            Some(Side::Buy)
        }
    }
}

/// Capital bookkeeping for one pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapitalLedger {
    pub pair: String,
    pub available_capital: Decimal,
    pub reserved_capital: Decimal,
}

impl CapitalLedger {
    pub fn new(pair: impl Into<String>, available_capital: Decimal) -> Self {
        Self {
            pair: pair.into(),
            available_capital,
            reserved_capital: Decimal::ZERO,
        }
    }

    /// Cash held, free plus reserved
    pub fn cash(&self) -> Decimal {
        self.available_capital + self.reserved_capital
    }
}

/// Durable ledger document for one pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub capital: CapitalLedger,
    pub position: Position,
    /// Last epoch whose effects are included in this record
    pub last_epoch: u64,
    pub updated_at: DateTime<Utc>,
}

impl LedgerRecord {
    pub fn seed(pair: &str, initial_capital: Decimal) -> Self {
        Self {
            capital: CapitalLedger::new(pair, initial_capital),
            position: Position::flat(pair),
            last_epoch: 0,
            updated_at: Utc::now(),
        }
    }

    /// Equal ignoring the write timestamp
    pub fn same_state(&self, other: &LedgerRecord) -> bool {
        self.capital == other.capital
            && self.position == other.position
            && self.last_epoch == other.last_epoch
    }
}

/// Read-only view handed to the risk manager
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerSnapshot {
    pub capital: CapitalLedger,
    pub position: Position,
    pub mark_price: Decimal,
}

impl LedgerSnapshot {
    /// Cash plus mark-to-market position value
    pub fn total_equity(&self) -> Decimal {
        self.capital.cash() + self.position.market_value(self.mark_price)
    }

    /// Equity used to size new exposure
    pub fn equity_base(&self) -> Decimal {
        self.capital.cash().min(self.total_equity())
    }
}

/// Opaque store version token used for version-checked writes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Revision(pub String);

impl Revision {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stage of the per-cycle state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CycleStage {
    Gather,
    ForcedClose,
    Decide,
    RiskCheck,
    Submit,
    Settle,
    Log,
    Done,
}

impl std::fmt::Display for CycleStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CycleStage::Gather => "GATHER",
            CycleStage::ForcedClose => "FORCED_CLOSE",
            CycleStage::Decide => "DECIDE",
            CycleStage::RiskCheck => "RISK_CHECK",
            CycleStage::Submit => "SUBMIT",
            CycleStage::Settle => "SETTLE",
            CycleStage::Log => "LOG",
            CycleStage::Done => "DONE",
        };
        f.write_str(name)
    }
}

/// Closed set of audit event kinds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    /// Cycle aborted before any mutation
    Skipped { stage: CycleStage, reason: String },
    /// Cycle finished without trading
    Held {
        price: Decimal,
        sentiment: f64,
        sentiment_confidence: f64,
        kill_switch: bool,
    },
    /// Fill applied and persisted
    Filled {
        side: Side,
        quantity: Decimal,
        price: Decimal,
        fee: Decimal,
        idempotency_key: String,
        forced_close: bool,
        realized_pnl: Decimal,
        already_reflected: bool,
    },
    /// Exchange filled but the ledger write failed; healed by reconciliation
    FailedAfterFill {
        side: Side,
        quantity: Decimal,
        price: Decimal,
        idempotency_key: String,
        error: String,
    },
    /// Risk manager or exchange refused the action
    Rejected {
        direction: Direction,
        requested_fraction: Decimal,
        reason: String,
        by_exchange: bool,
    },
    /// Stored ledger repaired from the exchange's position
    Reconciled {
        old_quantity: Decimal,
        new_quantity: Decimal,
        capital_adjustment: Decimal,
    },
    /// Policy output replaced by the safe default
    ValidationError { detail: String },
    /// Cycle abandoned for exceeding its wall-clock budget
    Timeout { stage: CycleStage, elapsed_ms: u64 },
    /// Worker halted
    Fatal { detail: String },
}

impl EventKind {
    /// Short label used in logs
    pub fn label(&self) -> &'static str {
        match self {
            EventKind::Skipped { .. } => "SKIPPED",
            EventKind::Held { .. } => "HELD",
            EventKind::Filled { .. } => "FILLED",
            EventKind::FailedAfterFill { .. } => "FAILED_AFTER_FILL",
            EventKind::Rejected { .. } => "REJECTED",
            EventKind::Reconciled { .. } => "RECONCILED",
            EventKind::ValidationError { .. } => "VALIDATION_ERROR",
            EventKind::Timeout { .. } => "TIMEOUT",
            EventKind::Fatal { .. } => "FATAL",
        }
    }
}

/// Append-only audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub pair: String,
    pub epoch: u64,
    /// Order within the epoch
    pub seq: u32,
    #[serde(flatten)]
    pub kind: EventKind,
    pub written_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_idempotency_key_is_deterministic() {
        let a = idempotency_key("BTC/USDT", 42);
        let b = idempotency_key("BTC/USDT", 42);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert_ne!(a, idempotency_key("BTC/USDT", 43));
        assert_ne!(a, idempotency_key("ETH/USDT", 42));
    }

    #[test]
    fn test_direction_parsing() {
        assert_eq!("buy".parse::<Direction>().unwrap(), Direction::Buy);
        assert_eq!(" HOLD ".parse::<Direction>().unwrap(), Direction::Hold);
        assert!("SHORT".parse::<Direction>().is_err());
    }

    #[test]
    fn test_long_protective_triggers() {
        let position = Position {
            pair: "BTC/USDT".into(),
            quantity: dec!(0.5),
            entry_price: dec!(30000),
            stop_loss_price: Some(dec!(28000)),
            take_profit_price: Some(dec!(33000)),
        };
        assert_eq!(position.protective_trigger(dec!(27500)), Some(ProtectiveTrigger::StopLoss));
        assert_eq!(position.protective_trigger(dec!(33500)), Some(ProtectiveTrigger::TakeProfit));
        assert_eq!(position.protective_trigger(dec!(30000)), None);
        assert_eq!(position.closing_side(), Some(Side::Sell));
    }

    #[test]
    fn test_short_protective_triggers() {
        let position = Position {
            pair: "BTC/USDT".into(),
            quantity: dec!(-1),
            entry_price: dec!(100),
            stop_loss_price: Some(dec!(102)),
            take_profit_price: Some(dec!(95)),
        };
        assert_eq!(position.protective_trigger(dec!(103)), Some(ProtectiveTrigger::StopLoss));
        assert_eq!(position.protective_trigger(dec!(94)), Some(ProtectiveTrigger::TakeProfit));
        assert_eq!(position.closing_side(), Some(Side::Buy));
    }

    #[test]
    fn test_equity_base_uses_lower_of_cash_and_equity() {
        let snapshot = LedgerSnapshot {
            capital: CapitalLedger::new("BTC/USDT", dec!(1000)),
            position: Position {
                quantity: dec!(-2),
                entry_price: dec!(100),
                ..Position::flat("BTC/USDT")
            },
            mark_price: dec!(110),
        };
        assert_eq!(snapshot.total_equity(), dec!(780));
        assert_eq!(snapshot.equity_base(), dec!(780));
    }

    #[test]
    fn test_event_kind_serializes_tagged() {
        let entry = EventLogEntry {
            pair: "BTC/USDT".into(),
            epoch: 7,
            seq: 0,
            kind: EventKind::ValidationError {
                detail: "bad direction".into(),
            },
            written_at: Utc::now(),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["kind"], "VALIDATION_ERROR");
        assert_eq!(json["detail"], "bad direction");
        let back: EventLogEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back, entry);
    }
}
