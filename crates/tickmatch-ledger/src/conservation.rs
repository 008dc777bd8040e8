//! Asset conservation audit.
//!
//! Invariant checked after settlement batches:
//! ```text
//! ∀ asset: Σ(available + locked) == Σ(mint) − Σ(burn)
//! ```
//!
//! Trades move value between accounts but never create or destroy it;
//! only the custody boundary (`mint`/`burn`) changes an asset's total.
//! A violation means a settlement bug upstream and is fatal for the
//! symbol that observes it.

use std::collections::HashMap;

use tickmatch_types::{Amount, Asset, EngineError, Result};

/// Tracks per-asset supply totals from the custody boundary.
#[derive(Debug, Default)]
pub struct ConservationTracker {
    /// Total minted per asset since genesis.
    minted: HashMap<Asset, Amount>,
    /// Total burned per asset since genesis.
    burned: HashMap<Asset, Amount>,
}

impl ConservationTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a custody credit.
    pub fn record_mint(&mut self, asset: &str, amount: Amount) {
        let entry = self.minted.entry(asset.to_string()).or_default();
        *entry = Amount::from_raw(entry.raw() + amount.raw());
    }

    /// Record a custody debit.
    pub fn record_burn(&mut self, asset: &str, amount: Amount) {
        let entry = self.burned.entry(asset.to_string()).or_default();
        *entry = Amount::from_raw(entry.raw() + amount.raw());
    }

    /// Expected total supply for an asset: mint − burn.
    #[must_use]
    pub fn expected_supply(&self, asset: &str) -> Amount {
        let minted = self.minted.get(asset).copied().unwrap_or(Amount::ZERO);
        let burned = self.burned.get(asset).copied().unwrap_or(Amount::ZERO);
        Amount::from_raw(minted.raw() - burned.raw())
    }

    /// Verify that the actual supply (sum of all account balances)
    /// matches the expected supply for an asset.
    ///
    /// # Errors
    /// [`EngineError::ConservationViolation`] if actual ≠ expected.
    pub fn verify(&self, asset: &str, actual_supply: Amount) -> Result<()> {
        let expected = self.expected_supply(asset);
        if actual_supply != expected {
            return Err(EngineError::ConservationViolation {
                reason: format!(
                    "asset {asset}: actual supply {actual_supply} != expected {expected} \
                     (minted={}, burned={})",
                    self.minted.get(asset).copied().unwrap_or(Amount::ZERO),
                    self.burned.get(asset).copied().unwrap_or(Amount::ZERO),
                ),
            });
        }
        Ok(())
    }

    /// All assets that have crossed the custody boundary.
    #[must_use]
    pub fn tracked_assets(&self) -> Vec<Asset> {
        let mut assets: std::collections::HashSet<Asset> = self.minted.keys().cloned().collect();
        assets.extend(self.burned.keys().cloned());
        assets.into_iter().collect()
    }
}
