//! The outbound event stream of a symbol engine.
//!
//! Events are append-only and carry enough state to rebuild balances and
//! book depth by replay: `Accepted` embeds the full order record with its
//! exact reservation, `Trade` embeds the full fill, and every terminal
//! event carries the reservation amounts it released.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::amount::Amount;
use crate::asset::Symbol;
use crate::ids::{AccountId, ClientId, OrderId};
use crate::order::{Order, Side};
use crate::trade::Trade;

/// Why an order was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelReason {
    /// Explicit `Cancel` command from the owner.
    UserRequested,
    /// Resting maker removed by the cancel-maker self-trade policy.
    SelfTradePrevention,
    /// The other OCO leg filled or triggered first.
    OcoSibling,
    /// Market order ran out of depth.
    NoLiquidity,
    /// Market order remainder fell outside the protection band.
    ProtectionBand,
    /// Promoted conditional failed its risk re-check at fire time.
    StaleTrigger,
    /// Unfilled IOC remainder.
    IocResidual,
    /// Replaced by a `Modify` that lost time priority.
    Replaced,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::UserRequested => "USER_REQUESTED",
            Self::SelfTradePrevention => "SELF_TRADE_PREVENTION",
            Self::OcoSibling => "OCO_SIBLING",
            Self::NoLiquidity => "NO_LIQUIDITY",
            Self::ProtectionBand => "PROTECTION_BAND",
            Self::StaleTrigger => "STALE_TRIGGER",
            Self::IocResidual => "IOC_RESIDUAL",
            Self::Replaced => "REPLACED",
        };
        write!(f, "{s}")
    }
}

/// One event in a symbol's outbound stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineEvent {
    /// Order passed validation, risk, and reservation. Carries the full
    /// record including the exact amounts locked in the ledger.
    Accepted { order: Order },
    /// Command refused with no side effects. `client_id` correlates a
    /// rejected submit; `order_id` a rejected cancel/modify.
    Rejected {
        client_id: Option<ClientId>,
        order_id: Option<OrderId>,
        user_id: AccountId,
        reason: String,
    },
    /// Order (or iceberg slice) now resting on the book.
    Resting {
        order_id: OrderId,
        side: Side,
        price: Amount,
        qty: Amount,
    },
    /// An executed fill.
    Trade(Trade),
    /// Progress on a partially filled order.
    PartiallyFilled {
        order_id: OrderId,
        filled_qty: Amount,
        remaining_qty: Amount,
    },
    /// Order completely filled. `released_*` is any reservation left
    /// over after the final fill (taker price improvement, band slack).
    Filled {
        order_id: OrderId,
        released_base: Amount,
        released_quote: Amount,
    },
    /// Order cancelled; its remaining reservation is released.
    Cancelled {
        order_id: OrderId,
        reason: CancelReason,
        side: Side,
        /// Resting price if the order was on the book when cancelled.
        resting_price: Option<Amount>,
        remaining_qty: Amount,
        released_base: Amount,
        released_quote: Amount,
    },
    /// In-place quantity reduction that kept time priority.
    Reduced {
        order_id: OrderId,
        side: Side,
        price: Option<Amount>,
        new_qty: Amount,
        released_base: Amount,
        released_quote: Amount,
    },
    /// Conditional order promoted to the book.
    Triggered {
        order_id: OrderId,
        trigger_price: Amount,
    },
    /// DAY order expired at session end.
    Expired {
        order_id: OrderId,
        side: Side,
        resting_price: Option<Amount>,
        remaining_qty: Amount,
        released_base: Amount,
        released_quote: Amount,
    },
    /// Fatal invariant breach; final event of a halted symbol.
    HaltedSymbol { reason: String },
}

impl EngineEvent {
    /// Short label for logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Accepted { .. } => "accepted",
            Self::Rejected { .. } => "rejected",
            Self::Resting { .. } => "resting",
            Self::Trade(_) => "trade",
            Self::PartiallyFilled { .. } => "partially_filled",
            Self::Filled { .. } => "filled",
            Self::Cancelled { .. } => "cancelled",
            Self::Reduced { .. } => "reduced",
            Self::Triggered { .. } => "triggered",
            Self::Expired { .. } => "expired",
            Self::HaltedSymbol { .. } => "halted_symbol",
        }
    }
}

/// An event sealed into a symbol's totally ordered stream.
///
/// `seq` is contiguous from 0 per symbol; a gap observed by a consumer
/// means loss and is itself a fatal condition for replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencedEvent {
    pub symbol: Symbol,
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub event: EngineEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_reason_display() {
        assert_eq!(
            CancelReason::SelfTradePrevention.to_string(),
            "SELF_TRADE_PREVENTION"
        );
        assert_eq!(CancelReason::OcoSibling.to_string(), "OCO_SIBLING");
    }

    #[test]
    fn event_kinds() {
        let ev = EngineEvent::HaltedSymbol {
            reason: "test".into(),
        };
        assert_eq!(ev.kind(), "halted_symbol");

        let ev = EngineEvent::Rejected {
            client_id: Some(ClientId::new()),
            order_id: None,
            user_id: AccountId::new(),
            reason: "r".into(),
        };
        assert_eq!(ev.kind(), "rejected");
    }

    #[test]
    fn sequenced_event_serde_roundtrip() {
        let ev = SequencedEvent {
            symbol: Symbol::new("BTC", "USD"),
            seq: 7,
            ts: Utc::now(),
            event: EngineEvent::Filled {
                order_id: OrderId(3),
                released_base: Amount::ZERO,
                released_quote: "0.5".parse().unwrap(),
            },
        };
        let json = serde_json::to_string(&ev).unwrap();
        let back: SequencedEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.seq, 7);
        assert!(matches!(back.event, EngineEvent::Filled { .. }));
    }
}
