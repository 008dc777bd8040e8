//! The shared balance ledger.
//!
//! Balances live in a `(account, asset)` map; every entry carries its
//! own `parking_lot::Mutex`, created lazily on first credit. Single-entry
//! operations (`reserve`, `release`, `mint`, `burn`) take one lock.
//! [`Ledger::settle_trade`] takes four — two accounts × two assets —
//! always in ascending `(asset, account)` order, which makes deadlock
//! between concurrent settlements impossible.
//!
//! Failure severity is positional: `InsufficientAvailable` on `reserve`
//! is an ordinary client rejection, but any failure inside
//! `settle_trade` means a reservation upstream went missing and the
//! caller must halt its symbol.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};
use tickmatch_types::{
    AccountId, Amount, Asset, BalanceEntry, EngineError, Result, Trade,
};
use tracing::debug;

use crate::conservation::ConservationTracker;

type EntryKey = (AccountId, Asset);
type EntryHandle = Arc<Mutex<BalanceEntry>>;

/// The shared per-account, per-asset balance ledger.
#[derive(Debug, Default)]
pub struct Ledger {
    entries: RwLock<HashMap<EntryKey, EntryHandle>>,
    conservation: Mutex<ConservationTracker>,
}

impl Ledger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or lazily create the entry handle for `(account, asset)`.
    fn entry(&self, account: AccountId, asset: &str) -> EntryHandle {
        if let Some(handle) = self.entries.read().get(&(account, asset.to_string())) {
            return Arc::clone(handle);
        }
        let mut entries = self.entries.write();
        Arc::clone(
            entries
                .entry((account, asset.to_string()))
                .or_insert_with(|| Arc::new(Mutex::new(BalanceEntry::new()))),
        )
    }

    /// Read a balance. Returns a zero entry for unknown pairs without
    /// creating one.
    #[must_use]
    pub fn balance(&self, account: AccountId, asset: &str) -> BalanceEntry {
        self.entries
            .read()
            .get(&(account, asset.to_string()))
            .map(|handle| *handle.lock())
            .unwrap_or_default()
    }

    /// All balances held by one account.
    #[must_use]
    pub fn balances_for(&self, account: AccountId) -> HashMap<Asset, BalanceEntry> {
        self.entries
            .read()
            .iter()
            .filter(|((acct, _), _)| *acct == account)
            .map(|((_, asset), handle)| (asset.clone(), *handle.lock()))
            .collect()
    }

    /// Number of `(account, asset)` entries tracked.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries.read().len()
    }

    // =================================================================
    // Custody boundary (not reachable from the matching hot path)
    // =================================================================

    /// Credit a deposit.
    ///
    /// # Errors
    /// [`EngineError::InvalidOrder`] for a non-positive amount;
    /// [`EngineError::AmountOverflow`] on overflow.
    pub fn mint(&self, account: AccountId, asset: &str, amount: Amount) -> Result<()> {
        if !amount.is_positive() {
            return Err(EngineError::InvalidOrder {
                reason: "mint amount must be positive".to_string(),
            });
        }
        let handle = self.entry(account, asset);
        let mut entry = handle.lock();
        entry.available = entry.available.checked_add(amount)?;
        drop(entry);
        self.conservation.lock().record_mint(asset, amount);
        Ok(())
    }

    /// Debit a withdrawal from available balance.
    ///
    /// # Errors
    /// [`EngineError::InsufficientAvailable`] if short;
    /// [`EngineError::InvalidOrder`] for a non-positive amount.
    pub fn burn(&self, account: AccountId, asset: &str, amount: Amount) -> Result<()> {
        if !amount.is_positive() {
            return Err(EngineError::InvalidOrder {
                reason: "burn amount must be positive".to_string(),
            });
        }
        let handle = self.entry(account, asset);
        let mut entry = handle.lock();
        if entry.available < amount {
            return Err(EngineError::InsufficientAvailable {
                needed: amount,
                available: entry.available,
            });
        }
        entry.available = entry.available.checked_sub(amount)?;
        drop(entry);
        self.conservation.lock().record_burn(asset, amount);
        Ok(())
    }

    // =================================================================
    // Reservations
    // =================================================================

    /// Move `amount` from available to locked to back an open order.
    ///
    /// # Errors
    /// [`EngineError::InsufficientAvailable`] — a non-fatal client
    /// rejection.
    pub fn reserve(&self, account: AccountId, asset: &str, amount: Amount) -> Result<()> {
        if amount.is_zero() {
            return Ok(());
        }
        if amount.is_negative() {
            return Err(EngineError::InvalidOrder {
                reason: "reserve amount must not be negative".to_string(),
            });
        }
        let handle = self.entry(account, asset);
        let mut entry = handle.lock();
        if entry.available < amount {
            return Err(EngineError::InsufficientAvailable {
                needed: amount,
                available: entry.available,
            });
        }
        entry.available = entry.available.checked_sub(amount)?;
        entry.locked = entry.locked.checked_add(amount)?;
        Ok(())
    }

    /// Inverse of [`Ledger::reserve`]: cancel, expiry, or surplus return.
    /// A zero amount is a no-op.
    ///
    /// # Errors
    /// [`EngineError::InsufficientLocked`] if the reservation is short —
    /// a fatal sign of double release.
    pub fn release(&self, account: AccountId, asset: &str, amount: Amount) -> Result<()> {
        if amount.is_zero() {
            return Ok(());
        }
        if amount.is_negative() {
            return Err(EngineError::InvalidOrder {
                reason: "release amount must not be negative".to_string(),
            });
        }
        let handle = self.entry(account, asset);
        let mut entry = handle.lock();
        if entry.locked < amount {
            return Err(EngineError::InsufficientLocked {
                needed: amount,
                locked: entry.locked,
            });
        }
        entry.locked = entry.locked.checked_sub(amount)?;
        entry.available = entry.available.checked_add(amount)?;
        Ok(())
    }

    // =================================================================
    // Settlement
    // =================================================================

    /// The four-legged atomic swap for one trade:
    ///
    /// - buyer: `locked[quote] -= quote_amount`, `available[base] += qty`
    /// - seller: `locked[base] -= qty`, `available[quote] += quote_amount`
    ///
    /// All four entry locks are acquired in ascending `(asset, account)`
    /// order, all four mutations are validated before any is applied,
    /// and all four succeed or none do.
    ///
    /// # Errors
    /// Every error here is **fatal** for the calling symbol engine: a
    /// short lock means an upstream reservation bug, overflow means the
    /// fixed-point contract broke.
    pub fn settle_trade(&self, trade: &Trade) -> Result<()> {
        let buyer = trade.buyer();
        let seller = trade.seller();
        if buyer == seller {
            return Err(EngineError::Internal(
                "self-trade reached settlement".to_string(),
            ));
        }
        let base = trade.symbol.base.as_str();
        let quote = trade.symbol.quote.as_str();

        // Fixed total order over the four locks.
        let mut keys: Vec<(Asset, AccountId)> = vec![
            (base.to_string(), buyer),
            (base.to_string(), seller),
            (quote.to_string(), buyer),
            (quote.to_string(), seller),
        ];
        keys.sort();
        let handles: Vec<((Asset, AccountId), EntryHandle)> = keys
            .into_iter()
            .map(|(asset, acct)| {
                let handle = self.entry(acct, &asset);
                ((asset, acct), handle)
            })
            .collect();
        let mut guards: Vec<((&str, AccountId), MutexGuard<'_, BalanceEntry>)> = handles
            .iter()
            .map(|((asset, acct), handle)| ((asset.as_str(), *acct), handle.lock()))
            .collect();

        let find = |asset: &str, acct: AccountId| -> Result<usize> {
            guards
                .iter()
                .position(|((a, u), _)| *a == asset && *u == acct)
                .ok_or_else(|| EngineError::Internal("settlement leg missing".to_string()))
        };
        let bq = find(quote, buyer)?;
        let bb = find(base, buyer)?;
        let sb = find(base, seller)?;
        let sq = find(quote, seller)?;

        // Validate every leg before mutating any.
        if guards[bq].1.locked < trade.quote_amount {
            return Err(EngineError::InsufficientLocked {
                needed: trade.quote_amount,
                locked: guards[bq].1.locked,
            });
        }
        if guards[sb].1.locked < trade.qty {
            return Err(EngineError::InsufficientLocked {
                needed: trade.qty,
                locked: guards[sb].1.locked,
            });
        }
        let buyer_quote_locked = guards[bq].1.locked.checked_sub(trade.quote_amount)?;
        let buyer_base_avail = guards[bb].1.available.checked_add(trade.qty)?;
        let seller_base_locked = guards[sb].1.locked.checked_sub(trade.qty)?;
        let seller_quote_avail = guards[sq].1.available.checked_add(trade.quote_amount)?;

        guards[bq].1.locked = buyer_quote_locked;
        guards[bb].1.available = buyer_base_avail;
        guards[sb].1.locked = seller_base_locked;
        guards[sq].1.available = seller_quote_avail;

        debug!(trade = %trade.id, %buyer, %seller, qty = %trade.qty,
               quote = %trade.quote_amount, "settled");
        Ok(())
    }

    // =================================================================
    // Audit
    // =================================================================

    /// Σ(available + locked) over all accounts for one asset.
    #[must_use]
    pub fn total_supply(&self, asset: &str) -> Amount {
        let entries = self.entries.read();
        let mut total = 0i128;
        for ((_, entry_asset), handle) in entries.iter() {
            if entry_asset == asset {
                total += handle.lock().total().raw();
            }
        }
        Amount::from_raw(total)
    }

    /// Verify the conservation identity for every asset ever seen.
    ///
    /// # Errors
    /// [`EngineError::ConservationViolation`] naming the drifted asset.
    pub fn verify_conservation(&self) -> Result<()> {
        let mut assets: std::collections::HashSet<Asset> =
            self.conservation.lock().tracked_assets().into_iter().collect();
        assets.extend(
            self.entries
                .read()
                .keys()
                .map(|(_, asset)| asset.clone()),
        );
        let conservation = self.conservation.lock();
        for asset in assets {
            conservation.verify(&asset, self.total_supply(&asset))?;
        }
        Ok(())
    }
}
