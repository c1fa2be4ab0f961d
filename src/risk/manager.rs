//! Position-size and protective-level enforcement

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use tracing::debug;

use crate::common::types::{LedgerSnapshot, PolicyAction, RiskDecision, RiskReason, Side};
use crate::config::types::RiskConfig;

/// Applies risk rules to a policy action
///
/// Rules run in order and each may reject or shrink the request. A
/// rejection is a normal outcome, not an error.
#[derive(Debug, Clone)]
pub struct RiskManager {
    config: RiskConfig,
    quantity_precision: u32,
    allow_short: bool,
}

impl RiskManager {
    pub fn new(config: RiskConfig, quantity_precision: u32, allow_short: bool) -> Self {
        Self {
            config,
            quantity_precision,
            allow_short,
        }
    }

    pub fn max_position_size(&self) -> Decimal {
        self.config.max_position_size
    }

    /// Check an action against the ledger at the current mark price
    pub fn check(&self, pair: &str, action: &PolicyAction, ledger: &LedgerSnapshot) -> RiskDecision {
        let direction = action.direction;
        let side = match direction.side() {
            Some(side) => side,
            None => return RiskDecision::hold(),
        };

        let price = ledger.mark_price;
        if price <= Decimal::ZERO {
            return RiskDecision::reject(direction, RiskReason::InvalidMarkPrice);
        }
        if ledger.capital.available_capital <= Decimal::ZERO {
            return RiskDecision::reject(direction, RiskReason::NoAvailableCapital);
        }

        let position = &ledger.position;
        if position.closing_side() == Some(side) && position.protective_trigger(price).is_some() {
            return RiskDecision::reject(direction, RiskReason::SupersededByForcedClose);
        }

        let base = ledger.equity_base();
        if base <= Decimal::ZERO {
            return RiskDecision::reject(direction, RiskReason::NoEquity);
        }

        let max_fraction = self.config.max_position_size;
        let max_quantity = max_fraction * base / price;
        let requested = action.size_fraction.min(Decimal::ONE) * base / price;
        let current = position.quantity;

        // Largest quantity keeping |resulting position| within the limit
        let (limit, limit_reason) = match side {
            Side::Buy => ((max_quantity - current).max(Decimal::ZERO), RiskReason::ClampedToMaxPosition),
            Side::Sell if self.allow_short => {
                ((max_quantity + current).max(Decimal::ZERO), RiskReason::ClampedToMaxPosition)
            }
            Side::Sell if current > Decimal::ZERO => (current, RiskReason::ClampedToHeldQuantity),
            Side::Sell => return RiskDecision::reject(direction, RiskReason::NoPositionToSell),
        };
        if limit.is_zero() {
            return RiskDecision::reject(direction, RiskReason::PositionLimitReached);
        }

        let mut quantity = requested;
        let mut reason = None;
        if quantity > limit {
            quantity = limit;
            reason = Some(limit_reason);
        }

        if side == Side::Buy {
            let affordable = ledger.capital.available_capital / self.buy_cost(Decimal::ONE, price);
            if quantity > affordable {
                quantity = affordable;
                reason = Some(RiskReason::ClampedToAvailableCapital);
            }
        }

        let quantity = quantity.round_dp_with_strategy(self.quantity_precision, RoundingStrategy::ToZero);
        if quantity <= Decimal::ZERO {
            return RiskDecision::reject(direction, RiskReason::SizeRoundedToZero);
        }

        let size_fraction = (quantity * price / base).min(max_fraction).round_dp(8);

        let resulting = current + side.sign() * quantity;
        let opens_exposure = !resulting.is_zero()
            && (current.is_zero() || current.is_sign_positive() != resulting.is_sign_positive() || resulting.abs() > current.abs());
        let (stop_loss_price, take_profit_price) = if opens_exposure {
            let (stop, target) = self.protective_levels(resulting > Decimal::ZERO, price);
            (Some(stop), Some(target))
        } else {
            (None, None)
        };

        debug!(
            "Risk check {} {}: requested {} -> {} ({:?})",
            pair, direction, action.size_fraction, size_fraction, reason
        );

        RiskDecision {
            approved: true,
            direction,
            size_fraction,
            quantity,
            reason,
            stop_loss_price,
            take_profit_price,
        }
    }

    /// Cash to reserve for buying `quantity` at `price`, fees and slippage included
    pub fn buy_cost(&self, quantity: Decimal, price: Decimal) -> Decimal {
        quantity * price * (Decimal::ONE + self.config.fee_rate + self.config.slippage_buffer)
    }

    /// Stop-loss and take-profit prices for a position entered at `entry`
    ///
    /// Longs stop below and take profit above; shorts are mirrored.
    pub fn protective_levels(&self, long: bool, entry: Decimal) -> (Decimal, Decimal) {
        let stop = self.config.stop_loss_percent / dec!(100);
        let target = self.config.take_profit_percent / dec!(100);
        if long {
            (entry * (Decimal::ONE - stop), entry * (Decimal::ONE + target))
        } else {
            (entry * (Decimal::ONE + stop), entry * (Decimal::ONE - target))
        }
    }
}
