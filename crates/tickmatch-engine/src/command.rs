//! The inbound command surface of a symbol engine.
//!
//! Commands arrive through a bounded MPSC queue and are processed in
//! arrival order — that total order defines `accepted_ts`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tickmatch_types::{
    AccountId, Amount, ClientId, OrderId, OrderType, Side, Symbol, TimeInForce,
};

/// A submit request as produced by the gateway.
///
/// Prices and quantities are expected to be pre-rounded onto the
/// symbol's tick/lot grid; the engine rejects rather than rounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_id: ClientId,
    pub user_id: AccountId,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: Amount,
    pub limit_price: Option<Amount>,
    pub stop_price: Option<Amount>,
    pub trail_amount: Option<Amount>,
    pub trail_percent: Option<Amount>,
    pub display_qty: Option<Amount>,
    pub oco_sibling_id: Option<OrderId>,
    pub time_in_force: TimeInForce,
    pub post_only: bool,
    /// Reject with `DeadlineExceeded` if not processed by this
    /// wall-clock nanosecond timestamp.
    pub deadline_ns: Option<u64>,
}

impl OrderRequest {
    fn base(
        user_id: AccountId,
        symbol: Symbol,
        side: Side,
        order_type: OrderType,
        qty: Amount,
    ) -> Self {
        Self {
            client_id: ClientId::new(),
            user_id,
            symbol,
            side,
            order_type,
            qty,
            limit_price: None,
            stop_price: None,
            trail_amount: None,
            trail_percent: None,
            display_qty: None,
            oco_sibling_id: None,
            time_in_force: TimeInForce::Gtc,
            post_only: false,
            deadline_ns: None,
        }
    }

    /// A GTC limit order.
    #[must_use]
    pub fn limit(
        user_id: AccountId,
        symbol: Symbol,
        side: Side,
        qty: Amount,
        price: Amount,
    ) -> Self {
        let mut req = Self::base(user_id, symbol, side, OrderType::Limit, qty);
        req.limit_price = Some(price);
        req
    }

    /// A market order.
    #[must_use]
    pub fn market(user_id: AccountId, symbol: Symbol, side: Side, qty: Amount) -> Self {
        Self::base(user_id, symbol, side, OrderType::Market, qty)
    }

    /// A stop order (market form at fire).
    #[must_use]
    pub fn stop(
        user_id: AccountId,
        symbol: Symbol,
        side: Side,
        qty: Amount,
        stop_price: Amount,
    ) -> Self {
        let mut req = Self::base(user_id, symbol, side, OrderType::Stop, qty);
        req.stop_price = Some(stop_price);
        req
    }

    /// A stop-limit order.
    #[must_use]
    pub fn stop_limit(
        user_id: AccountId,
        symbol: Symbol,
        side: Side,
        qty: Amount,
        stop_price: Amount,
        limit_price: Amount,
    ) -> Self {
        let mut req = Self::base(user_id, symbol, side, OrderType::StopLimit, qty);
        req.stop_price = Some(stop_price);
        req.limit_price = Some(limit_price);
        req
    }

    /// A take-profit order; `limit_price` selects the limit form.
    #[must_use]
    pub fn take_profit(
        user_id: AccountId,
        symbol: Symbol,
        side: Side,
        qty: Amount,
        target_price: Amount,
        limit_price: Option<Amount>,
    ) -> Self {
        let mut req = Self::base(user_id, symbol, side, OrderType::TakeProfit, qty);
        req.stop_price = Some(target_price);
        req.limit_price = limit_price;
        req
    }

    /// A trailing stop with a fixed trail amount.
    #[must_use]
    pub fn trailing_stop(
        user_id: AccountId,
        symbol: Symbol,
        side: Side,
        qty: Amount,
        trail_amount: Amount,
    ) -> Self {
        let mut req = Self::base(user_id, symbol, side, OrderType::TrailingStop, qty);
        req.trail_amount = Some(trail_amount);
        req
    }

    /// An iceberg order exposing `display_qty` at a time.
    #[must_use]
    pub fn iceberg(
        user_id: AccountId,
        symbol: Symbol,
        side: Side,
        qty: Amount,
        price: Amount,
        display_qty: Amount,
    ) -> Self {
        let mut req = Self::base(user_id, symbol, side, OrderType::Iceberg, qty);
        req.limit_price = Some(price);
        req.display_qty = Some(display_qty);
        req
    }

    /// An OCO limit leg; pair the second leg via
    /// [`OrderRequest::with_oco_sibling`].
    #[must_use]
    pub fn oco_limit(
        user_id: AccountId,
        symbol: Symbol,
        side: Side,
        qty: Amount,
        price: Amount,
    ) -> Self {
        let mut req = Self::base(user_id, symbol, side, OrderType::OcoLeg, qty);
        req.limit_price = Some(price);
        req
    }

    /// An OCO stop leg.
    #[must_use]
    pub fn oco_stop(
        user_id: AccountId,
        symbol: Symbol,
        side: Side,
        qty: Amount,
        stop_price: Amount,
    ) -> Self {
        let mut req = Self::base(user_id, symbol, side, OrderType::OcoLeg, qty);
        req.stop_price = Some(stop_price);
        req
    }

    #[must_use]
    pub fn with_tif(mut self, tif: TimeInForce) -> Self {
        self.time_in_force = tif;
        self
    }

    #[must_use]
    pub fn post_only(mut self) -> Self {
        self.post_only = true;
        self
    }

    #[must_use]
    pub fn with_oco_sibling(mut self, sibling: OrderId) -> Self {
        self.oco_sibling_id = Some(sibling);
        self
    }

    #[must_use]
    pub fn with_deadline_ns(mut self, deadline_ns: u64) -> Self {
        self.deadline_ns = Some(deadline_ns);
        self
    }
}

/// A command delivered to a symbol engine's queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    Submit(Box<OrderRequest>),
    Cancel {
        user_id: AccountId,
        order_id: OrderId,
    },
    Modify {
        user_id: AccountId,
        order_id: OrderId,
        new_qty: Option<Amount>,
        new_price: Option<Amount>,
    },
    /// Session-boundary maintenance; expires DAY orders.
    Tick { now: DateTime<Utc> },
}
