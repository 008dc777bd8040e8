//! The price-time-priority aggression loop.
//!
//! A taker walks the opposing side best-price-first; within a level,
//! resting orders fill in FIFO order. Execution is always at the maker's
//! price. The matcher is pure book manipulation: it produces
//! [`MatchStep`]s for the engine to settle and narrate, and never touches
//! the ledger.
//!
//! ## Self-trade prevention
//!
//! When the head maker belongs to the taker's own account, the maker is
//! **cancelled** (removed from the book, no trade) and the walk
//! continues — the cancel-maker policy.

use std::cmp::Reverse;

use tickmatch_types::{
    AccountId, Amount, EngineError, Order, OrderState, Result, Side,
};

use crate::book::OrderBook;

/// Bounds the engine computed for this taker before matching.
#[derive(Debug, Clone, Copy)]
pub struct TakerParams {
    /// Worst acceptable execution price: the taker's own limit, or the
    /// protection-band price for market orders. `None` is unbounded.
    pub limit: Option<Amount>,
    /// Remaining quote budget (market buys promoted from triggers can be
    /// bounded by a reservation taken at an older price).
    pub quote_budget: Option<Amount>,
    /// Lot size used when flooring a budget-capped fill.
    pub lot_size: Amount,
}

/// One maker/taker fill, reported in execution order.
#[derive(Debug, Clone)]
pub struct Fill {
    pub maker_order_id: tickmatch_types::OrderId,
    pub maker_user_id: AccountId,
    pub maker_side: Side,
    /// Execution price — the maker's resting price.
    pub price: Amount,
    pub qty: Amount,
    pub maker_filled_qty: Amount,
    pub maker_remaining: Amount,
    /// Whether this fill completed the maker.
    pub maker_done: bool,
    /// Reservation left on a completed maker (truncation slack on buy
    /// makers), to be released by the engine.
    pub maker_released_base: Amount,
    pub maker_released_quote: Amount,
    /// The final maker record when this fill removed it from the book.
    pub maker_removed: Option<Order>,
}

/// Steps produced by the walk, in the order they happened.
#[derive(Debug, Clone)]
pub enum MatchStep {
    Fill(Fill),
    /// Maker removed by self-trade prevention; reservation still intact
    /// for the engine to release.
    SelfTradeCancel(Order),
}

/// Why the walk stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStop {
    /// Taker fully filled.
    TakerDone,
    /// Opposing side ran out of orders.
    BookExhausted,
    /// Head price fell outside the taker's limit / protection band.
    PriceBound,
    /// Quote budget can no longer afford a lot at the head price.
    BudgetBound,
}

/// Result of a taker walk.
#[derive(Debug)]
pub struct MatchOutcome {
    pub steps: Vec<MatchStep>,
    pub stop: MatchStop,
}

enum Pairing {
    SelfTrade(Order),
    Fill(Box<Fill>),
    LevelGone,
    Budget,
}

/// Walk `taker` against the opposing side of `book`.
///
/// The taker order is mutated in place (`filled_qty`, `state`); maker
/// orders are mutated on the book and removed when complete.
///
/// # Errors
/// Only internal invariant breaches (overfill, reservation underflow,
/// amount overflow) — client-visible conditions are all expressed in
/// [`MatchStop`].
pub fn match_taker(
    book: &mut OrderBook,
    taker: &mut Order,
    params: &TakerParams,
) -> Result<MatchOutcome> {
    let mut steps = Vec::new();
    let mut budget = params.quote_budget;

    let stop = loop {
        if taker.remaining_qty().is_zero() {
            break MatchStop::TakerDone;
        }
        let head_price = match taker.side {
            Side::Buy => book.best_ask(),
            Side::Sell => book.best_bid(),
        };
        let Some(price) = head_price else {
            break MatchStop::BookExhausted;
        };
        if let Some(limit) = params.limit {
            let crossed = match taker.side {
                Side::Buy => price <= limit,
                Side::Sell => price >= limit,
            };
            if !crossed {
                break MatchStop::PriceBound;
            }
        }

        match pair_at(book, taker, price, &mut budget, params.lot_size)? {
            Pairing::SelfTrade(maker) => steps.push(MatchStep::SelfTradeCancel(maker)),
            Pairing::Fill(fill) => steps.push(MatchStep::Fill(*fill)),
            Pairing::LevelGone => {}
            Pairing::Budget => break MatchStop::BudgetBound,
        }
    };

    Ok(MatchOutcome { steps, stop })
}

/// Execute one pairing against the head of the level at `price`.
fn pair_at(
    book: &mut OrderBook,
    taker: &mut Order,
    price: Amount,
    budget: &mut Option<Amount>,
    lot_size: Amount,
) -> Result<Pairing> {
    let level = match taker.side {
        Side::Buy => book.asks.get_mut(&price),
        Side::Sell => book.bids.get_mut(&Reverse(price)),
    };
    let Some(level) = level else {
        return Ok(Pairing::LevelGone);
    };

    // Self-trade prevention: cancel the maker, keep walking.
    if level.front().is_some_and(|m| m.user_id == taker.user_id) {
        let mut maker = level
            .pop_front()
            .ok_or_else(|| EngineError::Internal("level head vanished".to_string()))?;
        maker.state = OrderState::Cancelled;
        let maker_id = maker.id;
        let emptied = level.is_empty();
        book.unindex(maker_id);
        if emptied {
            remove_level(book, taker.side, price);
        }
        return Ok(Pairing::SelfTrade(maker));
    }

    let Some(maker) = level.front_mut() else {
        remove_level(book, taker.side, price);
        return Ok(Pairing::LevelGone);
    };

    let mut qty = taker.remaining_qty().min(maker.remaining_qty());
    if let Some(b) = *budget {
        let cost = price.checked_mul(qty)?;
        if cost > b {
            qty = b.affordable_qty(price, lot_size)?.min(qty);
            if qty.is_zero() {
                return Ok(Pairing::Budget);
            }
        }
    }
    let quote_amount = price.checked_mul(qty)?;

    maker.record_fill(qty)?;
    match maker.side {
        Side::Buy => maker.consume_reserved_quote(quote_amount)?,
        Side::Sell => maker.consume_reserved_base(qty)?,
    }
    let maker_done = maker.is_filled();
    let mut fill = Fill {
        maker_order_id: maker.id,
        maker_user_id: maker.user_id,
        maker_side: maker.side,
        price,
        qty,
        maker_filled_qty: maker.filled_qty,
        maker_remaining: maker.remaining_qty(),
        maker_done,
        maker_released_base: Amount::ZERO,
        maker_released_quote: Amount::ZERO,
        maker_removed: None,
    };
    level.note_fill(qty);

    if maker_done {
        let removed = level
            .pop_front()
            .ok_or_else(|| EngineError::Internal("filled maker vanished".to_string()))?;
        fill.maker_released_base = removed.reserved_base;
        fill.maker_released_quote = removed.reserved_quote;
        let emptied = level.is_empty();
        book.unindex(removed.id);
        fill.maker_removed = Some(removed);
        if emptied {
            remove_level(book, taker.side, price);
        }
    }

    taker.record_fill(qty)?;
    if let Some(b) = budget.as_mut() {
        *b = b.checked_sub(quote_amount)?;
    }
    Ok(Pairing::Fill(Box::new(fill)))
}

fn remove_level(book: &mut OrderBook, taker_side: Side, price: Amount) {
    match taker_side {
        Side::Buy => {
            book.asks.remove(&price);
        }
        Side::Sell => {
            book.bids.remove(&Reverse(price));
        }
    }
}

/// Side-effect-free depth probe for fill-or-kill pre-checks.
///
/// Sums opposing liquidity at marketable prices, excluding the user's
/// own resting orders (those would be cancelled, not filled). Stops as
/// soon as `want` is reachable.
#[must_use]
pub fn fillable_qty(
    book: &OrderBook,
    taker_side: Side,
    limit: Option<Amount>,
    user_id: AccountId,
    want: Amount,
) -> Amount {
    let mut acc = Amount::ZERO;
    let mut scan = |price: Amount, level: &crate::price_level::PriceLevel| -> bool {
        if let Some(limit) = limit {
            let crossed = match taker_side {
                Side::Buy => price <= limit,
                Side::Sell => price >= limit,
            };
            if !crossed {
                return false;
            }
        }
        for order in level.iter() {
            if order.user_id == user_id {
                continue;
            }
            acc = Amount::from_raw(acc.raw() + order.remaining_qty().raw());
            if acc >= want {
                return false;
            }
        }
        true
    };
    match taker_side {
        Side::Buy => {
            for (price, level) in &book.asks {
                if !scan(*price, level) {
                    break;
                }
            }
        }
        Side::Sell => {
            for (price, level) in &book.bids {
                if !scan(price.0, level) {
                    break;
                }
            }
        }
    }
    acc.min(want)
}
