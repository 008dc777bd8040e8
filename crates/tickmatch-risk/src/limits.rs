//! Risk limits and rejection reasons.

use serde::{Deserialize, Serialize};
use tickmatch_types::{Amount, RiskTierConfig};

/// Limits enforced by the gate on every submit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    /// Maximum absolute position per symbol, in base asset.
    pub max_position: Amount,
    /// Maximum realized loss per session day, in quote asset.
    pub max_daily_loss: Amount,
    /// Maximum single-order quantity, in base asset.
    pub max_order_size: Amount,
    /// Open-notional ceiling as a multiple of available quote balance.
    pub max_leverage: u32,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_position: Amount::from_int(100),
            max_daily_loss: Amount::from_int(10_000),
            max_order_size: Amount::from_int(10),
            max_leverage: 1,
        }
    }
}

impl From<&RiskTierConfig> for RiskLimits {
    fn from(tier: &RiskTierConfig) -> Self {
        Self {
            max_position: tier.max_position,
            max_daily_loss: tier.max_daily_loss,
            max_order_size: tier.max_order_size,
            max_leverage: tier.max_leverage,
        }
    }
}

/// Reason the gate refused a submit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskRejection {
    /// Quantity exceeds `max_order_size`.
    OrderTooLarge { qty: Amount, limit: Amount },
    /// Resulting position would exceed `max_position`.
    PositionLimit {
        current: Amount,
        requested: Amount,
        limit: Amount,
    },
    /// Today's realized loss already breaches `max_daily_loss`.
    DailyLossBreached { loss: Amount, limit: Amount },
    /// Open notional would exceed `max_leverage ×` available quote.
    LeverageExceeded { notional: Amount, ceiling: Amount },
}

impl std::fmt::Display for RiskRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OrderTooLarge { qty, limit } => {
                write!(f, "order size {qty} exceeds limit {limit}")
            }
            Self::PositionLimit {
                current,
                requested,
                limit,
            } => write!(
                f,
                "position {current} + {requested} would exceed limit {limit}"
            ),
            Self::DailyLossBreached { loss, limit } => {
                write!(f, "daily loss {loss} exceeds limit {limit}")
            }
            Self::LeverageExceeded { notional, ceiling } => {
                write!(f, "open notional {notional} exceeds ceiling {ceiling}")
            }
        }
    }
}
