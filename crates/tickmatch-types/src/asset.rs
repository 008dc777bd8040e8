//! Assets, trading symbols, and per-symbol market rules.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::amount::Amount;
use crate::error::{EngineError, Result};

/// Type alias for asset identifiers (e.g., "BTC", "USD", "DEC").
pub type Asset = String;

/// A trading symbol: an ordered (base, quote) pair (e.g., BTC/USD).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Symbol {
    pub base: Asset,
    pub quote: Asset,
}

impl Symbol {
    #[must_use]
    pub fn new(base: impl Into<Asset>, quote: impl Into<Asset>) -> Self {
        Self {
            base: base.into(),
            quote: quote.into(),
        }
    }

    #[must_use]
    pub fn pair(&self) -> String {
        format!("{}/{}", self.base, self.quote)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

/// Market rules for one symbol. The gateway is expected to round prices
/// and quantities onto the tick/lot grid *before* submission; the engine
/// rejects anything off-grid rather than rounding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolConfig {
    pub symbol: Symbol,
    /// Minimum price increment.
    pub tick_size: Amount,
    /// Minimum quantity increment.
    pub lot_size: Amount,
    /// Minimum `price × qty` for limit orders.
    pub min_notional: Amount,
    /// Maximum quantity for a single order.
    pub max_order_qty: Amount,
    /// Market-order protection band, in basis points off the best
    /// opposing price at entry.
    pub protection_band_bps: u32,
}

impl SymbolConfig {
    /// Validate a limit/stop price against the tick grid.
    ///
    /// # Errors
    /// [`EngineError::TickSizeViolation`] when off-grid or non-positive.
    pub fn check_price(&self, price: Amount) -> Result<()> {
        if !price.is_positive() || !price.is_step_multiple(self.tick_size) {
            return Err(EngineError::TickSizeViolation {
                price,
                tick_size: self.tick_size,
            });
        }
        Ok(())
    }

    /// Validate a quantity against the lot grid and the size cap.
    ///
    /// # Errors
    /// [`EngineError::LotSizeViolation`] when off-grid or non-positive;
    /// [`EngineError::MaxOrderQtyExceeded`] above the per-order cap.
    pub fn check_qty(&self, qty: Amount) -> Result<()> {
        if !qty.is_positive() || !qty.is_step_multiple(self.lot_size) {
            return Err(EngineError::LotSizeViolation {
                qty,
                lot_size: self.lot_size,
            });
        }
        if qty > self.max_order_qty {
            return Err(EngineError::MaxOrderQtyExceeded {
                qty,
                max: self.max_order_qty,
            });
        }
        Ok(())
    }

    /// Validate `price × qty` against the minimum notional.
    ///
    /// # Errors
    /// [`EngineError::MinNotionalViolation`] below the floor;
    /// [`EngineError::AmountOverflow`] if the product overflows.
    pub fn check_notional(&self, price: Amount, qty: Amount) -> Result<()> {
        let notional = price.checked_mul(qty)?;
        if notional < self.min_notional {
            return Err(EngineError::MinNotionalViolation {
                notional,
                min: self.min_notional,
            });
        }
        Ok(())
    }

    /// The worst acceptable execution price for a market order on `side`,
    /// anchored at `reference` (the best opposing price at entry).
    ///
    /// # Errors
    /// [`EngineError::AmountOverflow`] on intermediate overflow.
    pub fn band_limit(&self, side: crate::order::Side, reference: Amount) -> Result<Amount> {
        let shift = reference.bps(self.protection_band_bps)?;
        match side {
            crate::order::Side::Buy => reference.checked_add(shift),
            crate::order::Side::Sell => reference.checked_sub(shift),
        }
    }
}

/// Test helpers.
#[cfg(any(test, feature = "test-helpers"))]
impl SymbolConfig {
    /// BTC/USD with 0.01 tick, 10⁻⁸ lot, and a 5% protection band.
    #[must_use]
    pub fn btc_usd() -> Self {
        Self {
            symbol: Symbol::new("BTC", "USD"),
            tick_size: Amount::from_raw(1_000_000), // 0.01
            lot_size: Amount::from_raw(1),          // 0.00000001
            min_notional: Amount::ZERO,
            max_order_qty: Amount::from_int(1_000_000),
            protection_band_bps: crate::constants::DEFAULT_PROTECTION_BAND_BPS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::Side;

    fn amt(s: &str) -> Amount {
        s.parse().unwrap()
    }

    #[test]
    fn symbol_pair() {
        let s = Symbol::new("BTC", "USD");
        assert_eq!(s.pair(), "BTC/USD");
        assert_eq!(s.to_string(), "BTC/USD");
    }

    #[test]
    fn price_grid() {
        let cfg = SymbolConfig::btc_usd();
        assert!(cfg.check_price(amt("100.01")).is_ok());
        assert!(matches!(
            cfg.check_price(amt("100.015")),
            Err(EngineError::TickSizeViolation { .. })
        ));
        assert!(cfg.check_price(Amount::ZERO).is_err());
    }

    #[test]
    fn qty_grid_and_cap() {
        let mut cfg = SymbolConfig::btc_usd();
        cfg.lot_size = amt("0.001");
        cfg.max_order_qty = amt("10");
        assert!(cfg.check_qty(amt("0.005")).is_ok());
        assert!(matches!(
            cfg.check_qty(amt("0.0005")),
            Err(EngineError::LotSizeViolation { .. })
        ));
        assert!(matches!(
            cfg.check_qty(amt("11")),
            Err(EngineError::MaxOrderQtyExceeded { .. })
        ));
    }

    #[test]
    fn notional_floor() {
        let mut cfg = SymbolConfig::btc_usd();
        cfg.min_notional = amt("10");
        assert!(cfg.check_notional(amt("100"), amt("0.1")).is_ok());
        assert!(matches!(
            cfg.check_notional(amt("100"), amt("0.05")),
            Err(EngineError::MinNotionalViolation { .. })
        ));
    }

    #[test]
    fn band_limits_straddle_the_reference() {
        let cfg = SymbolConfig::btc_usd(); // 500 bps
        let buy = cfg.band_limit(Side::Buy, amt("100")).unwrap();
        let sell = cfg.band_limit(Side::Sell, amt("100")).unwrap();
        assert_eq!(buy, amt("105"));
        assert_eq!(sell, amt("95"));
    }
}
