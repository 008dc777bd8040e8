//! Order types for the TickMatch engine.
//!
//! The eight order types form a closed sum — the state machine over them
//! lives in the symbol engine, and every routing decision is an
//! exhaustive `match`. There is no open-ended plugin surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::amount::Amount;
use crate::asset::Symbol;
use crate::error::{EngineError, Result};
use crate::ids::{AccountId, ClientId, OrderId};

/// Which side of the book this order is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// The type of order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum OrderType {
    Limit,
    Market,
    Stop,
    StopLimit,
    TrailingStop,
    TakeProfit,
    Iceberg,
    OcoLeg,
}

impl OrderType {
    /// Conditional types park in the trigger registry until the last
    /// trade price crosses their trigger.
    #[must_use]
    pub fn is_conditional(self) -> bool {
        matches!(
            self,
            Self::Stop | Self::StopLimit | Self::TrailingStop | Self::TakeProfit
        )
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Limit => write!(f, "LIMIT"),
            Self::Market => write!(f, "MARKET"),
            Self::Stop => write!(f, "STOP"),
            Self::StopLimit => write!(f, "STOP_LIMIT"),
            Self::TrailingStop => write!(f, "TRAILING_STOP"),
            Self::TakeProfit => write!(f, "TAKE_PROFIT"),
            Self::Iceberg => write!(f, "ICEBERG"),
            Self::OcoLeg => write!(f, "OCO_LEG"),
        }
    }
}

/// Time-in-force instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum TimeInForce {
    /// Good till cancel.
    Gtc,
    /// Immediate or cancel: the unfilled remainder never rests.
    Ioc,
    /// Fill or kill: all-or-nothing, checked by dry run before matching.
    Fok,
    /// Good for the trading session; expired by the session `Tick`.
    Day,
}

/// Lifecycle state of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum OrderState {
    New,
    PendingTrigger,
    Active,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Cancelled | Self::Rejected | Self::Expired
        )
    }
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, "NEW"),
            Self::PendingTrigger => write!(f, "PENDING_TRIGGER"),
            Self::Active => write!(f, "ACTIVE"),
            Self::PartiallyFilled => write!(f, "PARTIALLY_FILLED"),
            Self::Filled => write!(f, "FILLED"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::Rejected => write!(f, "REJECTED"),
            Self::Expired => write!(f, "EXPIRED"),
        }
    }
}

/// The central order record.
///
/// Mutated only by the owning symbol's engine thread; `accepted_ts` is a
/// strictly monotonic per-symbol nanosecond counter and the sole
/// time-priority key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub client_id: ClientId,
    pub user_id: AccountId,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
    /// Reject instead of crossing on entry.
    pub post_only: bool,
    pub state: OrderState,
    pub qty: Amount,
    pub filled_qty: Amount,
    pub limit_price: Option<Amount>,
    pub stop_price: Option<Amount>,
    pub trail_amount: Option<Amount>,
    pub trail_percent: Option<Amount>,
    /// Iceberg display slice size.
    pub display_qty: Option<Amount>,
    pub oco_sibling_id: Option<OrderId>,
    /// Strictly monotonic per-symbol nanosecond counter assigned at
    /// engine entry.
    pub accepted_ts: u64,
    /// Base asset still locked in the ledger for this order.
    pub reserved_base: Amount,
    /// Quote asset still locked in the ledger for this order.
    pub reserved_quote: Amount,
    pub created_at: DateTime<Utc>,
}

impl Order {
    #[must_use]
    pub fn remaining_qty(&self) -> Amount {
        Amount::from_raw(self.qty.raw() - self.filled_qty.raw())
    }

    #[must_use]
    pub fn is_filled(&self) -> bool {
        self.filled_qty == self.qty
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether a limit taker is still marketable against a head price.
    /// Market takers are bounded by the protection band instead, which
    /// the matcher passes in as an effective limit.
    #[must_use]
    pub fn is_marketable_at(&self, head_price: Amount) -> bool {
        match (self.side, self.limit_price) {
            (Side::Buy, Some(limit)) => head_price <= limit,
            (Side::Sell, Some(limit)) => head_price >= limit,
            (_, None) => true,
        }
    }

    /// Record a fill of `qty`, updating state.
    ///
    /// # Errors
    /// [`EngineError::InvalidOrder`] if the fill exceeds the remainder —
    /// the matcher never produces one, so this guards a corrupted book.
    pub fn record_fill(&mut self, qty: Amount) -> Result<()> {
        if qty > self.remaining_qty() || !qty.is_positive() {
            return Err(EngineError::InvalidOrder {
                reason: format!("fill {qty} exceeds remaining {}", self.remaining_qty()),
            });
        }
        self.filled_qty = self.filled_qty.checked_add(qty)?;
        self.state = if self.is_filled() {
            OrderState::Filled
        } else {
            OrderState::PartiallyFilled
        };
        Ok(())
    }

    /// Consume part of the base-asset reservation (sell-side fills).
    ///
    /// # Errors
    /// [`EngineError::InsufficientLocked`] if the reservation is short.
    pub fn consume_reserved_base(&mut self, amount: Amount) -> Result<()> {
        if amount > self.reserved_base {
            return Err(EngineError::InsufficientLocked {
                needed: amount,
                locked: self.reserved_base,
            });
        }
        self.reserved_base = self.reserved_base.checked_sub(amount)?;
        Ok(())
    }

    /// Consume part of the quote-asset reservation (buy-side fills).
    ///
    /// # Errors
    /// [`EngineError::InsufficientLocked`] if the reservation is short.
    pub fn consume_reserved_quote(&mut self, amount: Amount) -> Result<()> {
        if amount > self.reserved_quote {
            return Err(EngineError::InsufficientLocked {
                needed: amount,
                locked: self.reserved_quote,
            });
        }
        self.reserved_quote = self.reserved_quote.checked_sub(amount)?;
        Ok(())
    }
}

/// Test helpers.
#[cfg(any(test, feature = "test-helpers"))]
impl Order {
    pub fn dummy_limit(side: Side, price: Amount, qty: Amount) -> Self {
        Self::dummy_limit_for_user(AccountId::new(), side, price, qty)
    }

    pub fn dummy_limit_for_user(
        user_id: AccountId,
        side: Side,
        price: Amount,
        qty: Amount,
    ) -> Self {
        Self {
            id: OrderId(0),
            client_id: ClientId::new(),
            user_id,
            symbol: Symbol::new("BTC", "USD"),
            side,
            order_type: OrderType::Limit,
            time_in_force: TimeInForce::Gtc,
            post_only: false,
            state: OrderState::Active,
            qty,
            filled_qty: Amount::ZERO,
            limit_price: Some(price),
            stop_price: None,
            trail_amount: None,
            trail_percent: None,
            display_qty: None,
            oco_sibling_id: None,
            accepted_ts: 0,
            reserved_base: match side {
                Side::Buy => Amount::ZERO,
                Side::Sell => qty,
            },
            reserved_quote: match side {
                Side::Buy => price.checked_mul(qty).unwrap(),
                Side::Sell => Amount::ZERO,
            },
            created_at: Utc::now(),
        }
    }

    pub fn dummy_market(side: Side, qty: Amount) -> Self {
        let mut order = Self::dummy_limit(side, Amount::ONE, qty);
        order.order_type = OrderType::Market;
        order.limit_price = None;
        order.reserved_quote = Amount::ZERO;
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amt(s: &str) -> Amount {
        s.parse().unwrap()
    }

    #[test]
    fn side_opposite() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
    }

    #[test]
    fn conditional_classification() {
        assert!(OrderType::Stop.is_conditional());
        assert!(OrderType::TrailingStop.is_conditional());
        assert!(!OrderType::Limit.is_conditional());
        assert!(!OrderType::Iceberg.is_conditional());
    }

    #[test]
    fn terminal_states() {
        assert!(OrderState::Filled.is_terminal());
        assert!(OrderState::Expired.is_terminal());
        assert!(!OrderState::Active.is_terminal());
        assert!(!OrderState::PendingTrigger.is_terminal());
    }

    #[test]
    fn fill_tracking() {
        let mut order = Order::dummy_limit(Side::Buy, amt("100"), amt("10"));
        order.record_fill(amt("4")).unwrap();
        assert_eq!(order.state, OrderState::PartiallyFilled);
        assert_eq!(order.remaining_qty(), amt("6"));

        order.record_fill(amt("6")).unwrap();
        assert_eq!(order.state, OrderState::Filled);
        assert!(order.is_filled());
    }

    #[test]
    fn overfill_rejected() {
        let mut order = Order::dummy_limit(Side::Buy, amt("100"), amt("1"));
        assert!(order.record_fill(amt("2")).is_err());
        assert!(order.record_fill(Amount::ZERO).is_err());
    }

    #[test]
    fn marketability() {
        let buy = Order::dummy_limit(Side::Buy, amt("100"), amt("1"));
        assert!(buy.is_marketable_at(amt("99")));
        assert!(buy.is_marketable_at(amt("100")));
        assert!(!buy.is_marketable_at(amt("101")));

        let sell = Order::dummy_limit(Side::Sell, amt("100"), amt("1"));
        assert!(sell.is_marketable_at(amt("101")));
        assert!(!sell.is_marketable_at(amt("99")));

        let market = Order::dummy_market(Side::Buy, amt("1"));
        assert!(market.is_marketable_at(amt("1000000")));
    }

    #[test]
    fn reservation_consumption() {
        let mut order = Order::dummy_limit(Side::Buy, amt("100"), amt("1"));
        assert_eq!(order.reserved_quote, amt("100"));
        order.consume_reserved_quote(amt("40")).unwrap();
        assert_eq!(order.reserved_quote, amt("60"));
        assert!(order.consume_reserved_quote(amt("61")).is_err());
    }
}
