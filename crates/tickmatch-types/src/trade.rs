//! Trade types produced by the matching loop.
//!
//! A [`Trade`] is the immutable record of a single maker/taker fill.
//! Execution is always at the maker's resting price — price improvement
//! goes to the taker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::amount::Amount;
use crate::asset::Symbol;
use crate::ids::{AccountId, OrderId, TradeId};
use crate::order::Side;

/// An executed fill between a resting maker and an aggressing taker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    /// Engine-assigned id, strictly increasing per symbol.
    pub id: TradeId,
    pub symbol: Symbol,
    pub maker_order_id: OrderId,
    pub maker_user_id: AccountId,
    pub taker_order_id: OrderId,
    pub taker_user_id: AccountId,
    /// Execution price — the maker's resting price.
    pub price: Amount,
    /// Executed quantity in base asset.
    pub qty: Amount,
    /// `price × qty` in quote asset.
    pub quote_amount: Amount,
    /// Which side the resting maker was on.
    pub maker_side: Side,
    pub executed_at: DateTime<Utc>,
}

impl Trade {
    #[must_use]
    pub fn taker_side(&self) -> Side {
        self.maker_side.opposite()
    }

    /// The account receiving base asset.
    #[must_use]
    pub fn buyer(&self) -> AccountId {
        match self.maker_side {
            Side::Buy => self.maker_user_id,
            Side::Sell => self.taker_user_id,
        }
    }

    /// The account receiving quote asset.
    #[must_use]
    pub fn seller(&self) -> AccountId {
        match self.maker_side {
            Side::Buy => self.taker_user_id,
            Side::Sell => self.maker_user_id,
        }
    }

    /// Quote-currency notional of the fill.
    #[must_use]
    pub fn notional(&self) -> Amount {
        self.quote_amount
    }
}

impl std::fmt::Display for Trade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Trade[{}] {} {} @ {} = {} (maker {})",
            self.id, self.symbol, self.qty, self.price, self.quote_amount, self.maker_side,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amt(s: &str) -> Amount {
        s.parse().unwrap()
    }

    fn make_trade(maker_side: Side) -> Trade {
        Trade {
            id: TradeId(1),
            symbol: Symbol::new("BTC", "USD"),
            maker_order_id: OrderId(10),
            maker_user_id: AccountId::new(),
            taker_order_id: OrderId(11),
            taker_user_id: AccountId::new(),
            price: amt("50000"),
            qty: amt("1"),
            quote_amount: amt("50000"),
            maker_side,
            executed_at: Utc::now(),
        }
    }

    #[test]
    fn buyer_seller_with_sell_maker() {
        let t = make_trade(Side::Sell);
        assert_eq!(t.buyer(), t.taker_user_id);
        assert_eq!(t.seller(), t.maker_user_id);
        assert_eq!(t.taker_side(), Side::Buy);
    }

    #[test]
    fn buyer_seller_with_buy_maker() {
        let t = make_trade(Side::Buy);
        assert_eq!(t.buyer(), t.maker_user_id);
        assert_eq!(t.seller(), t.taker_user_id);
        assert_eq!(t.taker_side(), Side::Sell);
    }

    #[test]
    fn trade_display() {
        let t = make_trade(Side::Sell);
        let s = format!("{t}");
        assert!(s.contains("BTC/USD"));
        assert!(s.contains("50000"));
    }

    #[test]
    fn serde_roundtrip() {
        let t = make_trade(Side::Sell);
        let json = serde_json::to_string(&t).unwrap();
        let back: Trade = serde_json::from_str(&json).unwrap();
        assert_eq!(t.id, back.id);
        assert_eq!(t.price, back.price);
        assert_eq!(t.qty, back.qty);
    }
}
