//! # tickmatch-engine
//!
//! **The per-symbol matching-and-settlement pipeline of TickMatch.**
//!
//! One [`SymbolEngine`] per symbol owns that symbol's order book, trigger
//! registry, iceberg table, and event sequencer, and holds shared handles
//! to the [`Ledger`](tickmatch_ledger::Ledger) and
//! [`RiskGate`](tickmatch_risk::RiskGate). All mutations of a symbol's
//! state happen on its owning executor — the concurrency discipline that
//! keeps the hot path lock-free.
//!
//! Command flow per submit:
//!
//! ```text
//! Gateway → Command queue → SymbolEngine
//!   → validate → risk gate → reserve funds
//!   → OrderBook::match → Ledger::settle_trade per fill
//!   → TriggerRegistry cascade at the new last-trade price
//!   → sequenced events → audit + market-data rings
//! ```
//!
//! [`ExchangeCore`] is the thin runtime that binds each configured
//! symbol to its own thread behind a bounded MPSC queue. [`replay`]
//! rebuilds balances and depth from the event stream and digests it for
//! determinism checks.

pub mod command;
pub mod engine;
pub mod events;
pub mod iceberg;
pub mod market_data;
pub mod replay;
pub mod runtime;
pub mod triggers;

pub use command::{Command, OrderRequest};
pub use engine::SymbolEngine;
pub use events::{EventBus, EventSequencer};
pub use market_data::{MarketStats, MarketSummary};
pub use replay::{stream_digest, ReplayState};
pub use runtime::ExchangeCore;
pub use triggers::TriggerRegistry;
