//! # tickmatch-types
//!
//! Shared types, errors, and configuration for the **TickMatch** matching
//! engine.
//!
//! This crate is the leaf dependency of the workspace — every other crate
//! depends on it. It defines:
//!
//! - **Amounts**: [`Amount`], the exact 8-decimal fixed-point numeric used
//!   for every price, quantity, and balance
//! - **Identifiers**: [`OrderId`], [`TradeId`], [`AccountId`], [`ClientId`], [`Symbol`]
//! - **Order model**: [`Order`], [`Side`], [`OrderType`], [`TimeInForce`], [`OrderState`]
//! - **Trade model**: [`Trade`]
//! - **Balance model**: [`BalanceEntry`], [`Asset`]
//! - **Event model**: [`EngineEvent`], [`SequencedEvent`], [`CancelReason`]
//! - **Configuration**: [`EngineConfig`], [`SymbolConfig`], [`SessionConfig`]
//! - **Errors**: [`EngineError`] with `TM_ERR_` prefix codes
//! - **Constants**: system-wide limits and defaults

pub mod amount;
pub mod asset;
pub mod balance;
pub mod config;
pub mod constants;
pub mod error;
pub mod event;
pub mod ids;
pub mod order;
pub mod trade;

// Re-export all primary types at crate root for ergonomic imports:
//   use tickmatch_types::{Amount, Order, Side, Trade, ...};

pub use amount::*;
pub use asset::*;
pub use balance::*;
pub use config::*;
pub use error::*;
pub use event::*;
pub use ids::*;
pub use order::*;
pub use trade::*;

// Constants are accessed via `tickmatch_types::constants::FOO`
// (not re-exported to avoid name collisions).
