//! Exact fixed-point arithmetic for prices, quantities, and balances.
//!
//! Every numeric in the engine is an [`Amount`]: a signed 128-bit integer
//! counting units of 10⁻⁸. Arithmetic on the hot path is checked — an
//! overflow is never silently wrapped, it surfaces as
//! [`EngineError::AmountOverflow`] and the caller decides whether that is
//! a client rejection or a fatal invariant breach.
//!
//! `rust_decimal` appears only at the text boundary: configuration files
//! and display surfaces speak decimal strings, the engine speaks raw
//! `i128`.

use std::fmt;
use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::constants::AMOUNT_SCALE;
use crate::error::{EngineError, Result};

/// Raw units per whole unit: 10^8.
pub const RAW_PER_UNIT: i128 = 100_000_000;

/// A fixed-point decimal with 8 fractional digits, stored as raw `i128`
/// units of 10⁻⁸.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Amount(i128);

impl Amount {
    pub const ZERO: Amount = Amount(0);
    pub const ONE: Amount = Amount(RAW_PER_UNIT);

    /// Wrap raw 10⁻⁸ units.
    #[must_use]
    pub const fn from_raw(raw: i128) -> Self {
        Self(raw)
    }

    /// The raw 10⁻⁸ unit count.
    #[must_use]
    pub const fn raw(self) -> i128 {
        self.0
    }

    /// Whole units (e.g. `Amount::from_int(100)` is `100.00000000`).
    #[must_use]
    pub const fn from_int(units: i64) -> Self {
        Self(units as i128 * RAW_PER_UNIT)
    }

    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }

    #[must_use]
    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    #[must_use]
    pub const fn abs(self) -> Self {
        Self(self.0.abs())
    }

    /// Checked addition.
    ///
    /// # Errors
    /// [`EngineError::AmountOverflow`] on `i128` overflow.
    pub fn checked_add(self, rhs: Self) -> Result<Self> {
        self.0
            .checked_add(rhs.0)
            .map(Self)
            .ok_or(EngineError::AmountOverflow)
    }

    /// Checked subtraction.
    ///
    /// # Errors
    /// [`EngineError::AmountOverflow`] on `i128` overflow.
    pub fn checked_sub(self, rhs: Self) -> Result<Self> {
        self.0
            .checked_sub(rhs.0)
            .map(Self)
            .ok_or(EngineError::AmountOverflow)
    }

    /// Checked negation.
    ///
    /// # Errors
    /// [`EngineError::AmountOverflow`] for `i128::MIN`.
    pub fn checked_neg(self) -> Result<Self> {
        self.0
            .checked_neg()
            .map(Self)
            .ok_or(EngineError::AmountOverflow)
    }

    /// `self × rhs` where `self` is a price and `rhs` a quantity.
    ///
    /// The exact product carries 16 fractional digits; the result is
    /// truncated toward zero back to the 8-digit grid. Reservation and
    /// settlement use this same function, so both sides of a trade always
    /// compute the identical quote amount.
    ///
    /// # Errors
    /// [`EngineError::AmountOverflow`] if the intermediate product
    /// exceeds `i128`.
    pub fn checked_mul(self, rhs: Self) -> Result<Self> {
        let product = self
            .0
            .checked_mul(rhs.0)
            .ok_or(EngineError::AmountOverflow)?;
        Ok(Self(product / RAW_PER_UNIT))
    }

    /// Largest quantity purchasable with `self` quote units at `price`,
    /// floored to a multiple of `lot`.
    ///
    /// # Errors
    /// [`EngineError::AmountOverflow`] on intermediate overflow;
    /// [`EngineError::InvalidOrder`] if `price` or `lot` is not positive.
    pub fn affordable_qty(self, price: Amount, lot: Amount) -> Result<Self> {
        if !price.is_positive() || !lot.is_positive() {
            return Err(EngineError::InvalidOrder {
                reason: "price and lot must be positive".to_string(),
            });
        }
        let scaled = self
            .0
            .checked_mul(RAW_PER_UNIT)
            .ok_or(EngineError::AmountOverflow)?;
        let qty_raw = scaled / price.0;
        Ok(Self(qty_raw - qty_raw.rem_euclid(lot.0)))
    }

    /// `self` shifted by `bps` basis points: `self × bps / 10_000`,
    /// truncated toward zero.
    ///
    /// # Errors
    /// [`EngineError::AmountOverflow`] on intermediate overflow.
    pub fn bps(self, bps: u32) -> Result<Self> {
        let product = self
            .0
            .checked_mul(i128::from(bps))
            .ok_or(EngineError::AmountOverflow)?;
        Ok(Self(product / 10_000))
    }

    /// Whether `self` lies on the grid defined by `step`
    /// (tick-size / lot-size checks). A non-positive step never matches.
    #[must_use]
    pub fn is_step_multiple(self, step: Self) -> bool {
        step.is_positive() && self.0.rem_euclid(step.0) == 0
    }

    /// Convert from a boundary `Decimal` (config files, text surfaces).
    ///
    /// # Errors
    /// [`EngineError::InvalidOrder`] if the value carries more than 8
    /// fractional digits (no rounding is ever applied);
    /// [`EngineError::AmountOverflow`] if it does not fit.
    pub fn from_decimal(value: Decimal) -> Result<Self> {
        let scaled = value
            .checked_mul(Decimal::from(RAW_PER_UNIT as i64))
            .ok_or(EngineError::AmountOverflow)?;
        if scaled.normalize().scale() != 0 {
            return Err(EngineError::InvalidOrder {
                reason: format!("{value} has more than {AMOUNT_SCALE} decimal places"),
            });
        }
        scaled
            .to_i128()
            .map(Self)
            .ok_or(EngineError::AmountOverflow)
    }

    /// Convert to a boundary `Decimal`.
    #[must_use]
    pub fn to_decimal(self) -> Decimal {
        Decimal::from_i128_with_scale(self.0, AMOUNT_SCALE).normalize()
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let units = abs / RAW_PER_UNIT.unsigned_abs();
        let frac = abs % RAW_PER_UNIT.unsigned_abs();
        if frac == 0 {
            write!(f, "{sign}{units}")
        } else {
            let frac = format!("{frac:08}");
            write!(f, "{sign}{units}.{}", frac.trim_end_matches('0'))
        }
    }
}

impl FromStr for Amount {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || EngineError::InvalidOrder {
            reason: format!("invalid amount: {s:?}"),
        };

        let (sign, body) = match s.strip_prefix('-') {
            Some(rest) => (-1i128, rest),
            None => (1i128, s),
        };
        let (int_part, frac_part) = match body.split_once('.') {
            Some((i, f)) => (i, f),
            None => (body, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid());
        }
        if frac_part.len() > AMOUNT_SCALE as usize {
            return Err(EngineError::InvalidOrder {
                reason: format!("{s:?} has more than {AMOUNT_SCALE} decimal places"),
            });
        }
        let units: i128 = if int_part.is_empty() {
            0
        } else {
            int_part.parse().map_err(|_| invalid())?
        };
        let mut frac: i128 = 0;
        if !frac_part.is_empty() {
            frac = frac_part.parse().map_err(|_| invalid())?;
            for _ in frac_part.len()..AMOUNT_SCALE as usize {
                frac *= 10;
            }
        }
        let raw = units
            .checked_mul(RAW_PER_UNIT)
            .and_then(|u| u.checked_add(frac))
            .ok_or(EngineError::AmountOverflow)?;
        Ok(Self(sign * raw))
    }
}

// Wire form is the decimal string, not the raw integer: logs and JSON
// surfaces stay human-readable and unambiguous about scale.
impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
