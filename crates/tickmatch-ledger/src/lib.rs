//! # tickmatch-ledger
//!
//! **Shared settlement ledger for TickMatch.**
//!
//! One [`Ledger`] instance is shared by every symbol engine. It tracks
//! `(account, asset) → {available, locked}` and performs the atomic
//! transfers of the order lifecycle:
//!
//! 1. `reserve` — order accepted, funds move available → locked
//! 2. `settle_trade` — the four-legged asset/quote swap on every fill
//! 3. `release` — order cancelled or surplus returned, locked → available
//! 4. `mint` / `burn` — the external custody boundary; never reachable
//!    from the matching hot path
//!
//! Each entry carries its own lock; `settle_trade` acquires its four
//! entry locks in ascending `(asset, account)` order, so two settlements
//! can never deadlock. The [`ConservationTracker`] audits the supply
//! identity `Σ(available + locked) = mint − burn` per asset.

pub mod conservation;
pub mod ledger;

pub use conservation::ConservationTracker;
pub use ledger::Ledger;
