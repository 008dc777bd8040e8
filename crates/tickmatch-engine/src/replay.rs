//! Event-log replay.
//!
//! The engine persists nothing; its event stream is the source of
//! truth. [`ReplayState`] consumes a sequenced stream, enforces
//! sequence contiguity, and rebuilds ledger balances and aggregate book
//! depth: `Accepted` re-applies the reservation it embeds, `Trade`
//! re-applies the four-legged settlement, and every terminal event
//! re-applies the release amounts it carries. [`stream_digest`] is a
//! canonical hash over the stream so two replays of the same log can be
//! compared with one equality check.

use std::collections::{BTreeMap, HashMap};

use sha2::{Digest, Sha256};
use tickmatch_types::{
    AccountId, Amount, Asset, BalanceEntry, EngineError, EngineEvent, OrderId, Result,
    SequencedEvent, Side, Symbol, Trade,
};

/// Canonical digest over a sequenced event stream.
///
/// # Errors
/// [`EngineError::Internal`] if an event fails to serialize (which
/// would itself be a determinism bug).
pub fn stream_digest(events: &[SequencedEvent]) -> Result<[u8; 32]> {
    let mut hasher = Sha256::new();
    hasher.update(b"tickmatch:event_stream:v1:");
    hasher.update((events.len() as u64).to_le_bytes());
    for event in events {
        hasher.update(event.seq.to_le_bytes());
        let body = serde_json::to_vec(&event.event)
            .map_err(|e| EngineError::Internal(format!("event serialization: {e}")))?;
        hasher.update(&body);
    }
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    Ok(out)
}

#[derive(Debug, Clone)]
struct OrderFacts {
    user_id: AccountId,
    qty: Amount,
}

/// Ledger balances and aggregate depth reconstructed from a stream.
#[derive(Debug, Default)]
pub struct ReplayState {
    symbol: Option<Symbol>,
    next_seq: u64,
    balances: HashMap<(AccountId, Asset), BalanceEntry>,
    bids: BTreeMap<Amount, Amount>,
    asks: BTreeMap<Amount, Amount>,
    orders: HashMap<OrderId, OrderFacts>,
    halted: Option<String>,
}

impl ReplayState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the pre-stream custody state (mints precede the event log).
    pub fn seed_mint(&mut self, account: AccountId, asset: &str, amount: Amount) {
        let entry = self
            .balances
            .entry((account, asset.to_string()))
            .or_default();
        entry.available = Amount::from_raw(entry.available.raw() + amount.raw());
    }

    /// Apply the next event.
    ///
    /// # Errors
    /// [`EngineError::SequenceGap`] on a non-contiguous sequence number;
    /// arithmetic errors if the stream is internally inconsistent.
    pub fn apply(&mut self, event: &SequencedEvent) -> Result<()> {
        if event.seq != self.next_seq {
            return Err(EngineError::SequenceGap {
                expected: self.next_seq,
                got: event.seq,
            });
        }
        self.next_seq += 1;
        if self.symbol.is_none() {
            self.symbol = Some(event.symbol.clone());
        }

        let base = event.symbol.base.clone();
        let quote = event.symbol.quote.clone();
        match &event.event {
            EngineEvent::Accepted { order } => {
                self.orders.insert(
                    order.id,
                    OrderFacts {
                        user_id: order.user_id,
                        qty: order.qty,
                    },
                );
                self.reserve(order.user_id, &base, order.reserved_base)?;
                self.reserve(order.user_id, &quote, order.reserved_quote)?;
            }
            EngineEvent::Resting {
                side, price, qty, ..
            } => {
                let level = self.depth_side(*side).entry(*price).or_default();
                *level = Amount::from_raw(level.raw() + qty.raw());
            }
            EngineEvent::Trade(trade) => self.settle(trade)?,
            EngineEvent::Filled {
                order_id,
                released_base,
                released_quote,
            } => {
                let user = self.order_user(*order_id)?;
                self.release(user, &base, *released_base)?;
                self.release(user, &quote, *released_quote)?;
                self.orders.remove(order_id);
            }
            EngineEvent::Cancelled {
                order_id,
                side,
                resting_price,
                remaining_qty,
                released_base,
                released_quote,
                ..
            }
            | EngineEvent::Expired {
                order_id,
                side,
                resting_price,
                remaining_qty,
                released_base,
                released_quote,
            } => {
                let user = self.order_user(*order_id)?;
                self.release(user, &base, *released_base)?;
                self.release(user, &quote, *released_quote)?;
                if let Some(price) = resting_price {
                    self.reduce_depth(*side, *price, *remaining_qty);
                }
                self.orders.remove(order_id);
            }
            EngineEvent::Reduced {
                order_id,
                side,
                price,
                new_qty,
                released_base,
                released_quote,
            } => {
                let user = self.order_user(*order_id)?;
                self.release(user, &base, *released_base)?;
                self.release(user, &quote, *released_quote)?;
                let delta = self.orders.get_mut(order_id).map(|facts| {
                    let delta = Amount::from_raw(facts.qty.raw() - new_qty.raw());
                    facts.qty = *new_qty;
                    delta
                });
                if let (Some(delta), Some(price)) = (delta, *price) {
                    self.reduce_depth(*side, price, delta);
                }
            }
            EngineEvent::HaltedSymbol { reason } => {
                self.halted = Some(reason.clone());
            }
            EngineEvent::Rejected { .. }
            | EngineEvent::PartiallyFilled { .. }
            | EngineEvent::Triggered { .. } => {}
        }
        Ok(())
    }

    /// Apply a whole stream in order.
    ///
    /// # Errors
    /// See [`ReplayState::apply`].
    pub fn apply_all(&mut self, events: &[SequencedEvent]) -> Result<()> {
        for event in events {
            self.apply(event)?;
        }
        Ok(())
    }

    fn order_user(&self, order_id: OrderId) -> Result<AccountId> {
        self.orders
            .get(&order_id)
            .map(|f| f.user_id)
            .ok_or_else(|| EngineError::Internal(format!("replay: unknown order {order_id}")))
    }

    fn entry(&mut self, account: AccountId, asset: &str) -> &mut BalanceEntry {
        self.balances
            .entry((account, asset.to_string()))
            .or_default()
    }

    fn reserve(&mut self, account: AccountId, asset: &str, amount: Amount) -> Result<()> {
        if amount.is_zero() {
            return Ok(());
        }
        let entry = self.entry(account, asset);
        entry.available = entry.available.checked_sub(amount)?;
        entry.locked = entry.locked.checked_add(amount)?;
        Ok(())
    }

    fn release(&mut self, account: AccountId, asset: &str, amount: Amount) -> Result<()> {
        if amount.is_zero() {
            return Ok(());
        }
        let entry = self.entry(account, asset);
        entry.locked = entry.locked.checked_sub(amount)?;
        entry.available = entry.available.checked_add(amount)?;
        Ok(())
    }

    fn settle(&mut self, trade: &Trade) -> Result<()> {
        let base = trade.symbol.base.clone();
        let quote = trade.symbol.quote.clone();
        let buyer = trade.buyer();
        let seller = trade.seller();

        let buyer_quote = self.entry(buyer, &quote);
        buyer_quote.locked = buyer_quote.locked.checked_sub(trade.quote_amount)?;
        let buyer_base = self.entry(buyer, &base);
        buyer_base.available = buyer_base.available.checked_add(trade.qty)?;
        let seller_base = self.entry(seller, &base);
        seller_base.locked = seller_base.locked.checked_sub(trade.qty)?;
        let seller_quote = self.entry(seller, &quote);
        seller_quote.available = seller_quote.available.checked_add(trade.quote_amount)?;

        self.reduce_depth(trade.maker_side, trade.price, trade.qty);
        Ok(())
    }

    fn depth_side(&mut self, side: Side) -> &mut BTreeMap<Amount, Amount> {
        match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        }
    }

    fn reduce_depth(&mut self, side: Side, price: Amount, qty: Amount) {
        let levels = self.depth_side(side);
        if let Some(level) = levels.get_mut(&price) {
            *level = Amount::from_raw(level.raw() - qty.raw());
            if !level.is_positive() {
                levels.remove(&price);
            }
        }
    }

    // =================================================================
    // Reconstructed state
    // =================================================================

    #[must_use]
    pub fn balance(&self, account: AccountId, asset: &str) -> BalanceEntry {
        self.balances
            .get(&(account, asset.to_string()))
            .copied()
            .unwrap_or_default()
    }

    #[must_use]
    pub fn best_bid(&self) -> Option<Amount> {
        self.bids.keys().next_back().copied()
    }

    #[must_use]
    pub fn best_ask(&self) -> Option<Amount> {
        self.asks.keys().next().copied()
    }

    #[must_use]
    pub fn depth_at(&self, side: Side, price: Amount) -> Amount {
        let levels = match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        };
        levels.get(&price).copied().unwrap_or(Amount::ZERO)
    }

    /// Events applied so far.
    #[must_use]
    pub fn applied(&self) -> u64 {
        self.next_seq
    }

    /// Halt reason, if the stream ended in `HaltedSymbol`.
    #[must_use]
    pub fn halted(&self) -> Option<&str> {
        self.halted.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tickmatch_types::{ClientId, Order, OrderState, TradeId};

    use super::*;

    fn amt(s: &str) -> Amount {
        s.parse().unwrap()
    }

    fn seal(seq: u64, event: EngineEvent) -> SequencedEvent {
        SequencedEvent {
            symbol: Symbol::new("BTC", "USD"),
            seq,
            ts: Utc::now(),
            event,
        }
    }

    #[test]
    fn sequence_gap_is_detected() {
        let mut state = ReplayState::new();
        let ev = seal(
            3,
            EngineEvent::Rejected {
                client_id: Some(ClientId::new()),
                order_id: None,
                user_id: AccountId::new(),
                reason: "x".into(),
            },
        );
        let err = state.apply(&ev).unwrap_err();
        assert!(matches!(
            err,
            EngineError::SequenceGap {
                expected: 0,
                got: 3
            }
        ));
    }

    #[test]
    fn accepted_then_cancelled_restores_balances() {
        let mut state = ReplayState::new();
        let user = AccountId::new();
        state.seed_mint(user, "USD", amt("1000"));

        let mut order = Order::dummy_limit_for_user(user, Side::Buy, amt("100"), amt("2"));
        order.id = OrderId(1);
        order.state = OrderState::New;
        state
            .apply(&seal(0, EngineEvent::Accepted { order }))
            .unwrap();
        assert_eq!(state.balance(user, "USD").locked, amt("200"));

        state
            .apply(&seal(
                1,
                EngineEvent::Cancelled {
                    order_id: OrderId(1),
                    reason: tickmatch_types::CancelReason::UserRequested,
                    side: Side::Buy,
                    resting_price: None,
                    remaining_qty: amt("2"),
                    released_base: Amount::ZERO,
                    released_quote: amt("200"),
                },
            ))
            .unwrap();

        let bal = state.balance(user, "USD");
        assert_eq!(bal.available, amt("1000"));
        assert_eq!(bal.locked, Amount::ZERO);
    }

    #[test]
    fn resting_and_trade_rebuild_depth() {
        let mut state = ReplayState::new();
        let maker = AccountId::new();
        let taker = AccountId::new();
        state.seed_mint(maker, "BTC", amt("2"));
        state.seed_mint(taker, "USD", amt("500"));

        let mut sell = Order::dummy_limit_for_user(maker, Side::Sell, amt("100"), amt("2"));
        sell.id = OrderId(1);
        state
            .apply(&seal(0, EngineEvent::Accepted { order: sell }))
            .unwrap();
        state
            .apply(&seal(
                1,
                EngineEvent::Resting {
                    order_id: OrderId(1),
                    side: Side::Sell,
                    price: amt("100"),
                    qty: amt("2"),
                },
            ))
            .unwrap();
        assert_eq!(state.best_ask(), Some(amt("100")));
        assert_eq!(state.depth_at(Side::Sell, amt("100")), amt("2"));

        let mut buy = Order::dummy_limit_for_user(taker, Side::Buy, amt("100"), amt("1"));
        buy.id = OrderId(2);
        state
            .apply(&seal(2, EngineEvent::Accepted { order: buy }))
            .unwrap();
        state
            .apply(&seal(
                3,
                EngineEvent::Trade(Trade {
                    id: TradeId(1),
                    symbol: Symbol::new("BTC", "USD"),
                    maker_order_id: OrderId(1),
                    maker_user_id: maker,
                    taker_order_id: OrderId(2),
                    taker_user_id: taker,
                    price: amt("100"),
                    qty: amt("1"),
                    quote_amount: amt("100"),
                    maker_side: Side::Sell,
                    executed_at: Utc::now(),
                }),
            ))
            .unwrap();

        assert_eq!(state.depth_at(Side::Sell, amt("100")), amt("1"));
        assert_eq!(state.balance(taker, "BTC").available, amt("1"));
        assert_eq!(state.balance(maker, "USD").available, amt("100"));
    }

    #[test]
    fn digest_is_deterministic_and_order_sensitive() {
        let ev0 = seal(
            0,
            EngineEvent::Triggered {
                order_id: OrderId(1),
                trigger_price: amt("100"),
            },
        );
        let ev1 = seal(
            1,
            EngineEvent::Triggered {
                order_id: OrderId(2),
                trigger_price: amt("101"),
            },
        );
        let a = stream_digest(&[ev0.clone(), ev1.clone()]).unwrap();
        let b = stream_digest(&[ev0.clone(), ev1.clone()]).unwrap();
        assert_eq!(a, b);

        let swapped = stream_digest(&[ev1, ev0]).unwrap();
        assert_ne!(a, swapped);
    }
}
