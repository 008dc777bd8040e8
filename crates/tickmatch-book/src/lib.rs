//! # tickmatch-book
//!
//! **Per-symbol price-time-priority order book for TickMatch.**
//!
//! This crate is the pure matching plane — it has no balance checks, no
//! risk logic, and emits no events. It provides:
//!
//! - [`PriceLevel`]: FIFO queue of resting orders at one price
//! - [`OrderBook`]: two `BTreeMap` sides with an id index for O(log N)
//!   cancellation
//! - [`match_taker`]: the aggression loop — maker-price execution,
//!   cancel-maker self-trade prevention, protection-band and budget
//!   bounds, FOK dry runs
//!
//! The symbol engine drives this crate and turns its outcomes into
//! trades, settlement calls, and events.

pub mod book;
pub mod matcher;
pub mod price_level;

pub use book::{DepthLevel, DepthSnapshot, OrderBook};
pub use matcher::{fillable_qty, match_taker, Fill, MatchOutcome, MatchStep, MatchStop, TakerParams};
pub use price_level::PriceLevel;
