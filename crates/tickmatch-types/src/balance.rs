//! Balance tracking types for the TickMatch reservation model.
//!
//! Every account has an `available` balance (usable for new orders)
//! and a `locked` balance (reserved by open orders).

use serde::{Deserialize, Serialize};

use crate::amount::Amount;

/// A single balance entry for an (account, asset) pair.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BalanceEntry {
    /// Available for new orders / withdrawal.
    pub available: Amount,
    /// Locked behind open orders awaiting matching or settlement.
    pub locked: Amount,
}

impl BalanceEntry {
    /// Create a zero balance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total balance (available + locked). Saturating only in the sense
    /// that entries are individually bounded well below `i128` range.
    #[must_use]
    pub fn total(&self) -> Amount {
        Amount::from_raw(self.available.raw() + self.locked.raw())
    }

    /// Whether this entry has no balance at all.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.available.is_zero() && self.locked.is_zero()
    }
}
