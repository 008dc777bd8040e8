//! The order book for a single symbol.
//!
//! Uses `BTreeMap` for price-level ordering:
//! - **Bids** (buys): `BTreeMap<Reverse<Amount>, PriceLevel>` — highest price first
//! - **Asks** (sells): `BTreeMap<Amount, PriceLevel>` — lowest price first
//!
//! An auxiliary `HashMap<OrderId, (Side, Amount)>` enables O(log N)
//! cancellation. Empty levels are deleted eagerly, so `best_bid`/`best_ask`
//! are O(1) peeks at live liquidity.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tickmatch_types::{Amount, EngineError, Order, OrderId, Result, Side, Symbol};
use tracing::debug;

use crate::price_level::PriceLevel;

/// Aggregated view of one price level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: Amount,
    pub qty: Amount,
}

/// Top-N depth per side, taken at a consistent point between commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthSnapshot {
    pub symbol: Symbol,
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
}

/// The order book for a single symbol.
#[derive(Debug)]
pub struct OrderBook {
    pub symbol: Symbol,
    /// Buy side: highest price first (`Reverse` key).
    pub(crate) bids: BTreeMap<Reverse<Amount>, PriceLevel>,
    /// Sell side: lowest price first.
    pub(crate) asks: BTreeMap<Amount, PriceLevel>,
    /// Fast lookup: `OrderId → (side, price)` for cancellation.
    index: HashMap<OrderId, (Side, Amount)>,
}

impl OrderBook {
    /// Create a new empty order book.
    #[must_use]
    pub fn new(symbol: Symbol) -> Self {
        Self {
            symbol,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            index: HashMap::new(),
        }
    }

    // =================================================================
    // Insertion
    // =================================================================

    /// Rest an order at its limit price.
    ///
    /// # Errors
    /// [`EngineError::DuplicateOrder`] if the id is already resting;
    /// [`EngineError::InvalidOrder`] if the order has no limit price.
    pub fn insert(&mut self, order: Order) -> Result<()> {
        if self.index.contains_key(&order.id) {
            return Err(EngineError::DuplicateOrder(order.id));
        }
        let price = order.limit_price.ok_or_else(|| EngineError::InvalidOrder {
            reason: "resting order requires a limit price".to_string(),
        })?;

        self.index.insert(order.id, (order.side, price));
        match order.side {
            Side::Buy => self
                .bids
                .entry(Reverse(price))
                .or_insert_with(|| PriceLevel::new(price))
                .push_back(order),
            Side::Sell => self
                .asks
                .entry(price)
                .or_insert_with(|| PriceLevel::new(price))
                .push_back(order),
        }
        Ok(())
    }

    // =================================================================
    // Cancellation / modification
    // =================================================================

    /// Remove an order by id. Returns the removed order.
    ///
    /// # Errors
    /// [`EngineError::UnknownOrder`] if it is not resting here.
    pub fn cancel(&mut self, order_id: OrderId) -> Result<Order> {
        let (side, price) = self
            .index
            .remove(&order_id)
            .ok_or(EngineError::UnknownOrder(order_id))?;

        let order = match side {
            Side::Buy => {
                let level = self
                    .bids
                    .get_mut(&Reverse(price))
                    .ok_or(EngineError::UnknownOrder(order_id))?;
                let order = level
                    .remove_order(order_id)
                    .ok_or(EngineError::UnknownOrder(order_id))?;
                if level.is_empty() {
                    self.bids.remove(&Reverse(price));
                }
                order
            }
            Side::Sell => {
                let level = self
                    .asks
                    .get_mut(&price)
                    .ok_or(EngineError::UnknownOrder(order_id))?;
                let order = level
                    .remove_order(order_id)
                    .ok_or(EngineError::UnknownOrder(order_id))?;
                if level.is_empty() {
                    self.asks.remove(&price);
                }
                order
            }
        };
        debug!(symbol = %self.symbol, order = %order_id, remaining = %order.remaining_qty(),
               "unlinked from book");
        Ok(order)
    }

    /// Shrink a resting order to `new_qty` total quantity in place,
    /// preserving its queue position and `accepted_ts`. Returns a
    /// snapshot of the updated order.
    ///
    /// # Errors
    /// [`EngineError::UnknownOrder`] if not resting;
    /// [`EngineError::InvalidOrder`] if `new_qty` does not shrink the
    /// order or falls below the filled quantity.
    pub fn reduce(&mut self, order_id: OrderId, new_qty: Amount) -> Result<Order> {
        let (side, price) = *self
            .index
            .get(&order_id)
            .ok_or(EngineError::UnknownOrder(order_id))?;

        let level = match side {
            Side::Buy => self.bids.get_mut(&Reverse(price)),
            Side::Sell => self.asks.get_mut(&price),
        }
        .ok_or(EngineError::UnknownOrder(order_id))?;
        let order = level
            .get_mut(order_id)
            .ok_or(EngineError::UnknownOrder(order_id))?;

        if new_qty >= order.qty || new_qty <= order.filled_qty || !new_qty.is_positive() {
            return Err(EngineError::InvalidOrder {
                reason: format!(
                    "reduce to {new_qty} must stay within ({}, {})",
                    order.filled_qty, order.qty
                ),
            });
        }
        let delta = order.qty.checked_sub(new_qty)?;
        order.qty = new_qty;
        let snapshot = order.clone();
        level.note_reduce(delta);
        Ok(snapshot)
    }

    // =================================================================
    // Queries
    // =================================================================

    /// Best (highest) bid price, or `None` if no bids.
    #[must_use]
    pub fn best_bid(&self) -> Option<Amount> {
        self.bids.keys().next().map(|r| r.0)
    }

    /// Best (lowest) ask price, or `None` if no asks.
    #[must_use]
    pub fn best_ask(&self) -> Option<Amount> {
        self.asks.keys().next().copied()
    }

    /// Spread = best_ask − best_bid. `None` if either side is empty.
    #[must_use]
    pub fn spread(&self) -> Option<Amount> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(Amount::from_raw(ask.raw() - bid.raw())),
            _ => None,
        }
    }

    /// Look at a resting order.
    #[must_use]
    pub fn get(&self, order_id: OrderId) -> Option<&Order> {
        let (side, price) = self.index.get(&order_id)?;
        let level = match side {
            Side::Buy => self.bids.get(&Reverse(*price)),
            Side::Sell => self.asks.get(price),
        }?;
        level.iter().find(|o| o.id == order_id)
    }

    #[must_use]
    pub fn contains(&self, order_id: OrderId) -> bool {
        self.index.contains_key(&order_id)
    }

    /// Total number of resting orders.
    #[must_use]
    pub fn order_count(&self) -> usize {
        self.index.len()
    }

    /// Number of distinct bid price levels.
    #[must_use]
    pub fn bid_depth(&self) -> usize {
        self.bids.len()
    }

    /// Number of distinct ask price levels.
    #[must_use]
    pub fn ask_depth(&self) -> usize {
        self.asks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Ids of resting orders matching a predicate (session maintenance,
    /// not the hot path).
    pub fn order_ids_where(&self, pred: impl Fn(&Order) -> bool) -> Vec<OrderId> {
        let mut ids = Vec::new();
        for level in self.bids.values().chain(self.asks.values()) {
            ids.extend(level.iter().filter(|o| pred(o)).map(|o| o.id));
        }
        ids
    }

    /// Copy the top-`depth` levels per side with aggregated quantities.
    #[must_use]
    pub fn snapshot(&self, depth: usize) -> DepthSnapshot {
        let bids = self
            .bids
            .values()
            .take(depth)
            .map(|l| DepthLevel {
                price: l.price,
                qty: l.total_qty(),
            })
            .collect();
        let asks = self
            .asks
            .values()
            .take(depth)
            .map(|l| DepthLevel {
                price: l.price,
                qty: l.total_qty(),
            })
            .collect();
        DepthSnapshot {
            symbol: self.symbol.clone(),
            bids,
            asks,
        }
    }

    /// Shrink a resting order's reservation bookkeeping after the
    /// engine released the delta in the ledger. Quantities are not
    /// touched — use [`OrderBook::reduce`] for those.
    ///
    /// # Errors
    /// [`EngineError::UnknownOrder`]; reservation underflow from
    /// [`Order::consume_reserved_base`] / [`Order::consume_reserved_quote`].
    pub fn consume_reservation(
        &mut self,
        order_id: OrderId,
        base: Amount,
        quote: Amount,
    ) -> Result<()> {
        let (side, price) = *self
            .index
            .get(&order_id)
            .ok_or(EngineError::UnknownOrder(order_id))?;
        let level = match side {
            Side::Buy => self.bids.get_mut(&Reverse(price)),
            Side::Sell => self.asks.get_mut(&price),
        }
        .ok_or(EngineError::UnknownOrder(order_id))?;
        let order = level
            .get_mut(order_id)
            .ok_or(EngineError::UnknownOrder(order_id))?;
        if !base.is_zero() {
            order.consume_reserved_base(base)?;
        }
        if !quote.is_zero() {
            order.consume_reserved_quote(quote)?;
        }
        Ok(())
    }

    // =================================================================
    // Matcher internals
    // =================================================================

    /// Drop an order from the id index after the matcher unlinked it
    /// from its level directly.
    pub(crate) fn unindex(&mut self, order_id: OrderId) {
        self.index.remove(&order_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amt(s: &str) -> Amount {
        s.parse().unwrap()
    }

    fn make_order(id: u64, side: Side, price: &str, qty: &str) -> Order {
        let mut order = Order::dummy_limit(side, amt(price), amt(qty));
        order.id = OrderId(id);
        order
    }

    fn book() -> OrderBook {
        OrderBook::new(Symbol::new("BTC", "USD"))
    }

    #[test]
    fn insert_and_query_best_prices() {
        let mut book = book();
        book.insert(make_order(1, Side::Buy, "100", "1")).unwrap();
        book.insert(make_order(2, Side::Buy, "99", "1")).unwrap();
        book.insert(make_order(3, Side::Sell, "101", "1")).unwrap();
        book.insert(make_order(4, Side::Sell, "102", "1")).unwrap();

        assert_eq!(book.best_bid(), Some(amt("100")));
        assert_eq!(book.best_ask(), Some(amt("101")));
        assert_eq!(book.spread(), Some(amt("1")));
        assert_eq!(book.order_count(), 4);
        assert_eq!(book.bid_depth(), 2);
        assert_eq!(book.ask_depth(), 2);
    }

    #[test]
    fn cancel_removes_from_book_and_empty_level() {
        let mut book = book();
        book.insert(make_order(1, Side::Buy, "100", "1")).unwrap();
        assert_eq!(book.bid_depth(), 1);

        let cancelled = book.cancel(OrderId(1)).unwrap();
        assert_eq!(cancelled.id, OrderId(1));
        assert_eq!(book.bid_depth(), 0);
        assert!(book.is_empty());
    }

    #[test]
    fn cancel_unknown_order() {
        let mut book = book();
        assert!(matches!(
            book.cancel(OrderId(9)),
            Err(EngineError::UnknownOrder(_))
        ));
    }

    #[test]
    fn duplicate_insert_rejected() {
        let mut book = book();
        book.insert(make_order(1, Side::Buy, "100", "1")).unwrap();
        let result = book.insert(make_order(1, Side::Buy, "100", "1"));
        assert!(matches!(result, Err(EngineError::DuplicateOrder(_))));
    }

    #[test]
    fn insert_without_price_rejected() {
        let mut book = book();
        let order = Order::dummy_market(Side::Buy, amt("1"));
        assert!(matches!(
            book.insert(order),
            Err(EngineError::InvalidOrder { .. })
        ));
    }

    #[test]
    fn reduce_preserves_queue_position() {
        let mut book = book();
        book.insert(make_order(1, Side::Buy, "100", "5")).unwrap();
        book.insert(make_order(2, Side::Buy, "100", "5")).unwrap();

        let reduced = book.reduce(OrderId(1), amt("2")).unwrap();
        assert_eq!(reduced.qty, amt("2"));

        // Order 1 still ahead of order 2 at the level.
        let snapshot = book.snapshot(1);
        assert_eq!(snapshot.bids[0].qty, amt("7"));
        let front_id = book
            .bids
            .values()
            .next()
            .and_then(PriceLevel::front)
            .map(|o| o.id);
        assert_eq!(front_id, Some(OrderId(1)));
    }

    #[test]
    fn reduce_rejects_growth_and_below_filled() {
        let mut book = book();
        book.insert(make_order(1, Side::Buy, "100", "5")).unwrap();
        assert!(book.reduce(OrderId(1), amt("6")).is_err());
        assert!(book.reduce(OrderId(1), amt("5")).is_err());
        assert!(book.reduce(OrderId(1), Amount::ZERO).is_err());
    }

    #[test]
    fn snapshot_orders_levels_best_first() {
        let mut book = book();
        book.insert(make_order(1, Side::Buy, "90", "1")).unwrap();
        book.insert(make_order(2, Side::Buy, "100", "2")).unwrap();
        book.insert(make_order(3, Side::Buy, "95", "3")).unwrap();
        book.insert(make_order(4, Side::Sell, "110", "1")).unwrap();
        book.insert(make_order(5, Side::Sell, "101", "1")).unwrap();

        let snap = book.snapshot(2);
        let bid_prices: Vec<Amount> = snap.bids.iter().map(|l| l.price).collect();
        assert_eq!(bid_prices, vec![amt("100"), amt("95")]);
        let ask_prices: Vec<Amount> = snap.asks.iter().map(|l| l.price).collect();
        assert_eq!(ask_prices, vec![amt("101"), amt("110")]);
    }

    #[test]
    fn order_ids_where_finds_matches() {
        let mut book = book();
        book.insert(make_order(1, Side::Buy, "100", "1")).unwrap();
        book.insert(make_order(2, Side::Sell, "101", "2")).unwrap();

        let ids = book.order_ids_where(|o| o.side == Side::Sell);
        assert_eq!(ids, vec![OrderId(2)]);
    }

    #[test]
    fn get_returns_resting_order() {
        let mut book = book();
        book.insert(make_order(7, Side::Sell, "101", "2")).unwrap();
        assert_eq!(book.get(OrderId(7)).map(|o| o.qty), Some(amt("2")));
        assert!(book.get(OrderId(8)).is_none());
        assert!(book.contains(OrderId(7)));
    }

    #[test]
    fn empty_book() {
        let book = book();
        assert!(book.is_empty());
        assert_eq!(book.best_bid(), None);
        assert_eq!(book.best_ask(), None);
        assert_eq!(book.spread(), None);
    }
}
