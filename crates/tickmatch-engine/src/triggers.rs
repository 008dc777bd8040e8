//! The conditional-order trigger registry.
//!
//! Two ordered indexes per symbol, keyed by `(trigger_price,
//! accepted_ts)`:
//!
//! - **above**: fire when the last trade price rises to or through the
//!   trigger (buy stops, sell take-profits)
//! - **below**: fire when it falls to or through (sell stops, buy
//!   take-profits)
//!
//! A last-trade update wakes at most the crossed prefix of one index —
//! O(log n + fired). Trailing stops keep a water mark and ratchet their
//! effective trigger toward the price on every update; the ratchet only
//! ever tightens.

use std::collections::{BTreeMap, HashMap};

use tickmatch_types::{
    Amount, EngineError, Order, OrderId, OrderType, Result, Side, RAW_PER_UNIT,
};
use tracing::debug;

/// Which way the last-trade price must cross the trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerDirection {
    /// Fire when `last ≥ trigger_price`.
    Above,
    /// Fire when `last ≤ trigger_price`.
    Below,
}

#[derive(Debug)]
struct PendingTrigger {
    order: Order,
    direction: TriggerDirection,
    trigger_price: Amount,
    /// Best favourable extreme seen by a trailing stop.
    water_mark: Option<Amount>,
}

type TriggerKey = (Amount, u64);

/// Per-symbol registry of orders waiting on a price trigger.
#[derive(Debug, Default)]
pub struct TriggerRegistry {
    above: BTreeMap<TriggerKey, OrderId>,
    below: BTreeMap<TriggerKey, OrderId>,
    orders: HashMap<OrderId, PendingTrigger>,
}

impl TriggerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a conditional order. `last_price` seeds a trailing
    /// stop's water mark.
    ///
    /// Returns the effective trigger price.
    ///
    /// # Errors
    /// [`EngineError::InvalidTrigger`] when the order is missing its
    /// trigger fields or no reference price exists for a trailing stop.
    pub fn insert(&mut self, order: Order, last_price: Option<Amount>) -> Result<Amount> {
        let direction = direction_for(&order)?;
        let (trigger_price, water_mark) = match order.order_type {
            OrderType::TrailingStop => {
                let mark = last_price.or(order.stop_price).ok_or_else(|| {
                    EngineError::InvalidTrigger {
                        reason: "trailing stop needs a reference price".to_string(),
                    }
                })?;
                (trail_trigger(&order, mark)?, Some(mark))
            }
            _ => {
                let price = order.stop_price.ok_or_else(|| EngineError::InvalidTrigger {
                    reason: format!("{} requires a stop price", order.order_type),
                })?;
                (price, None)
            }
        };

        let key = (trigger_price, order.accepted_ts);
        match direction {
            TriggerDirection::Above => self.above.insert(key, order.id),
            TriggerDirection::Below => self.below.insert(key, order.id),
        };
        debug!(order = %order.id, %trigger_price, ?direction, "trigger registered");
        self.orders.insert(
            order.id,
            PendingTrigger {
                order,
                direction,
                trigger_price,
                water_mark,
            },
        );
        Ok(trigger_price)
    }

    /// Remove a pending order (cancel or OCO sibling cleanup).
    pub fn cancel(&mut self, order_id: OrderId) -> Option<Order> {
        let pending = self.orders.remove(&order_id)?;
        let key = (pending.trigger_price, pending.order.accepted_ts);
        match pending.direction {
            TriggerDirection::Above => self.above.remove(&key),
            TriggerDirection::Below => self.below.remove(&key),
        };
        Some(pending.order)
    }

    /// React to a new last-trade price: extract every crossed entry in
    /// strict `(trigger_price, accepted_ts)` order, then ratchet the
    /// remaining trailing stops.
    ///
    /// Returns the fired orders with their trigger prices.
    pub fn fire(&mut self, last: Amount) -> Vec<(Order, Amount)> {
        let mut fired_keys: Vec<(TriggerKey, TriggerDirection)> = Vec::new();
        for key in self
            .above
            .range(..=(last, u64::MAX))
            .map(|(k, _)| *k)
        {
            fired_keys.push((key, TriggerDirection::Above));
        }
        for key in self.below.range((last, 0)..).map(|(k, _)| *k) {
            fired_keys.push((key, TriggerDirection::Below));
        }
        fired_keys.sort_by_key(|(key, _)| *key);

        let mut fired = Vec::with_capacity(fired_keys.len());
        for (key, direction) in fired_keys {
            let id = match direction {
                TriggerDirection::Above => self.above.remove(&key),
                TriggerDirection::Below => self.below.remove(&key),
            };
            if let Some(id) = id {
                if let Some(pending) = self.orders.remove(&id) {
                    fired.push((pending.order, pending.trigger_price));
                }
            }
        }

        self.ratchet_trailing(last);
        fired
    }

    /// Tighten trailing-stop triggers toward the new price extreme.
    fn ratchet_trailing(&mut self, last: Amount) {
        let mut moves: Vec<(OrderId, TriggerKey, TriggerKey, TriggerDirection)> = Vec::new();
        for (id, pending) in &mut self.orders {
            if pending.order.order_type != OrderType::TrailingStop {
                continue;
            }
            let Some(mark) = pending.water_mark else {
                continue;
            };
            let improved = match pending.order.side {
                // Sell trailing follows the high; buy trailing the low.
                Side::Sell => last > mark,
                Side::Buy => last < mark,
            };
            if !improved {
                continue;
            }
            pending.water_mark = Some(last);
            let Ok(candidate) = trail_trigger(&pending.order, last) else {
                continue;
            };
            let tightened = match pending.order.side {
                Side::Sell => candidate > pending.trigger_price,
                Side::Buy => candidate < pending.trigger_price,
            };
            if tightened {
                let old_key = (pending.trigger_price, pending.order.accepted_ts);
                let new_key = (candidate, pending.order.accepted_ts);
                pending.trigger_price = candidate;
                moves.push((*id, old_key, new_key, pending.direction));
            }
        }
        for (id, old_key, new_key, direction) in moves {
            let index = match direction {
                TriggerDirection::Above => &mut self.above,
                TriggerDirection::Below => &mut self.below,
            };
            index.remove(&old_key);
            index.insert(new_key, id);
        }
    }

    #[must_use]
    pub fn contains(&self, order_id: OrderId) -> bool {
        self.orders.contains_key(&order_id)
    }

    #[must_use]
    pub fn get(&self, order_id: OrderId) -> Option<&Order> {
        self.orders.get(&order_id).map(|p| &p.order)
    }

    /// Effective trigger price of a pending order.
    #[must_use]
    pub fn trigger_price(&self, order_id: OrderId) -> Option<Amount> {
        self.orders.get(&order_id).map(|p| p.trigger_price)
    }

    /// Pending ids matching a predicate (session maintenance).
    pub fn ids_where(&self, pred: impl Fn(&Order) -> bool) -> Vec<OrderId> {
        self.orders
            .values()
            .filter(|p| pred(&p.order))
            .map(|p| p.order.id)
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.orders.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }
}

fn direction_for(order: &Order) -> Result<TriggerDirection> {
    match order.order_type {
        OrderType::Stop | OrderType::StopLimit | OrderType::TrailingStop => Ok(match order.side {
            Side::Buy => TriggerDirection::Above,
            Side::Sell => TriggerDirection::Below,
        }),
        OrderType::TakeProfit => Ok(match order.side {
            Side::Buy => TriggerDirection::Below,
            Side::Sell => TriggerDirection::Above,
        }),
        // An OCO stop leg triggers like a plain stop.
        OrderType::OcoLeg => Ok(match order.side {
            Side::Buy => TriggerDirection::Above,
            Side::Sell => TriggerDirection::Below,
        }),
        _ => Err(EngineError::InvalidTrigger {
            reason: format!("{} is not a conditional type", order.order_type),
        }),
    }
}

/// Effective trigger of a trailing stop given its water mark.
fn trail_trigger(order: &Order, mark: Amount) -> Result<Amount> {
    let delta = if let Some(amount) = order.trail_amount {
        amount
    } else if let Some(percent) = order.trail_percent {
        let raw = mark
            .raw()
            .checked_mul(percent.raw())
            .ok_or(EngineError::AmountOverflow)?
            / (100 * RAW_PER_UNIT);
        Amount::from_raw(raw)
    } else {
        return Err(EngineError::InvalidTrigger {
            reason: "trailing stop needs trail_amount or trail_percent".to_string(),
        });
    };
    match order.side {
        Side::Sell => mark.checked_sub(delta),
        Side::Buy => mark.checked_add(delta),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amt(s: &str) -> Amount {
        s.parse().unwrap()
    }

    fn stop(id: u64, side: Side, stop_price: &str, ts: u64) -> Order {
        let mut order = Order::dummy_limit(side, amt("1"), amt("1"));
        order.id = OrderId(id);
        order.order_type = OrderType::Stop;
        order.limit_price = None;
        order.stop_price = Some(amt(stop_price));
        order.accepted_ts = ts;
        order
    }

    fn trailing(id: u64, side: Side, trail: &str, ts: u64) -> Order {
        let mut order = Order::dummy_limit(side, amt("1"), amt("1"));
        order.id = OrderId(id);
        order.order_type = OrderType::TrailingStop;
        order.limit_price = None;
        order.trail_amount = Some(amt(trail));
        order.accepted_ts = ts;
        order
    }

    #[test]
    fn buy_stop_fires_at_or_above() {
        let mut registry = TriggerRegistry::new();
        registry.insert(stop(1, Side::Buy, "101", 1), None).unwrap();

        assert!(registry.fire(amt("100.99")).is_empty());
        let fired = registry.fire(amt("101"));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0.id, OrderId(1));
        assert_eq!(fired[0].1, amt("101"));
        assert!(registry.is_empty());
    }

    #[test]
    fn sell_stop_fires_at_or_below() {
        let mut registry = TriggerRegistry::new();
        registry.insert(stop(1, Side::Sell, "96", 1), None).unwrap();

        assert!(registry.fire(amt("96.01")).is_empty());
        assert_eq!(registry.fire(amt("95")).len(), 1);
    }

    #[test]
    fn take_profit_directions_mirror_stops() {
        let mut registry = TriggerRegistry::new();
        let mut sell_tp = stop(1, Side::Sell, "110", 1);
        sell_tp.order_type = OrderType::TakeProfit;
        let mut buy_tp = stop(2, Side::Buy, "90", 2);
        buy_tp.order_type = OrderType::TakeProfit;
        registry.insert(sell_tp, None).unwrap();
        registry.insert(buy_tp, None).unwrap();

        // Price rises: the sell take-profit fires, the buy one stays.
        let fired = registry.fire(amt("110"));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0.id, OrderId(1));
        assert!(registry.contains(OrderId(2)));

        assert_eq!(registry.fire(amt("90")).len(), 1);
    }

    #[test]
    fn fires_in_price_then_time_order() {
        let mut registry = TriggerRegistry::new();
        registry.insert(stop(1, Side::Buy, "102", 5), None).unwrap();
        registry.insert(stop(2, Side::Buy, "101", 9), None).unwrap();
        registry.insert(stop(3, Side::Buy, "101", 3), None).unwrap();

        let fired = registry.fire(amt("105"));
        let ids: Vec<u64> = fired.iter().map(|(o, _)| o.id.0).collect();
        assert_eq!(ids, vec![3, 2, 1], "(trigger_price, accepted_ts) order");
    }

    #[test]
    fn trailing_stop_ratchets_with_the_high() {
        let mut registry = TriggerRegistry::new();
        registry
            .insert(trailing(1, Side::Sell, "5", 1), Some(amt("100")))
            .unwrap();
        assert_eq!(registry.trigger_price(OrderId(1)), Some(amt("95")));

        // Price rises: the trigger follows.
        assert!(registry.fire(amt("110")).is_empty());
        assert_eq!(registry.trigger_price(OrderId(1)), Some(amt("105")));

        // A dip that stays above the trigger does not loosen it.
        assert!(registry.fire(amt("106")).is_empty());
        assert_eq!(registry.trigger_price(OrderId(1)), Some(amt("105")));

        // Retrace to the trigger fires.
        let fired = registry.fire(amt("105"));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].1, amt("105"));
    }

    #[test]
    fn trailing_percent_delta() {
        let mut registry = TriggerRegistry::new();
        let mut order = trailing(1, Side::Sell, "1", 1);
        order.trail_amount = None;
        order.trail_percent = Some(amt("10"));
        registry.insert(order, Some(amt("200"))).unwrap();
        // 10% of 200 = 20 below the mark.
        assert_eq!(registry.trigger_price(OrderId(1)), Some(amt("180")));
    }

    #[test]
    fn buy_trailing_follows_the_low() {
        let mut registry = TriggerRegistry::new();
        registry
            .insert(trailing(1, Side::Buy, "5", 1), Some(amt("100")))
            .unwrap();
        assert_eq!(registry.trigger_price(OrderId(1)), Some(amt("105")));

        assert!(registry.fire(amt("90")).is_empty());
        assert_eq!(registry.trigger_price(OrderId(1)), Some(amt("95")));

        assert_eq!(registry.fire(amt("95")).len(), 1);
    }

    #[test]
    fn cancel_removes_pending() {
        let mut registry = TriggerRegistry::new();
        registry.insert(stop(1, Side::Buy, "101", 1), None).unwrap();
        let cancelled = registry.cancel(OrderId(1)).unwrap();
        assert_eq!(cancelled.id, OrderId(1));
        assert!(registry.fire(amt("200")).is_empty());
        assert!(registry.cancel(OrderId(1)).is_none());
    }

    #[test]
    fn trailing_without_reference_is_rejected() {
        let mut registry = TriggerRegistry::new();
        let err = registry.insert(trailing(1, Side::Sell, "5", 1), None).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTrigger { .. }));
    }

    #[test]
    fn non_conditional_is_rejected() {
        let mut registry = TriggerRegistry::new();
        let order = Order::dummy_limit(Side::Buy, amt("100"), amt("1"));
        assert!(matches!(
            registry.insert(order, None),
            Err(EngineError::InvalidTrigger { .. })
        ));
    }
}
