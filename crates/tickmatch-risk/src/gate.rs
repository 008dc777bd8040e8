//! The pre-trade risk gate.
//!
//! Per-user state lives behind per-user locks; the gate itself is shared
//! across symbol engines. Checks run in cost order: rate limit first
//! (cheapest, and a flood must burn a token even when another check
//! would also fail), then size, position, daily loss, and leverage.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tickmatch_types::{
    AccountId, Amount, EngineError, OrderId, RateLimitConfig, Result, RiskTierConfig, Side, Symbol,
};
use tracing::debug;

use crate::limits::{RiskLimits, RiskRejection};
use crate::token_bucket::TokenBucket;

/// Mutable per-user risk accounting.
#[derive(Debug)]
struct UserRiskState {
    limits: RiskLimits,
    bucket: TokenBucket,
    /// Outstanding notional per open order, in quote asset.
    open_orders: HashMap<OrderId, Amount>,
    /// Signed base position per symbol (long positive, short negative).
    positions: HashMap<Symbol, Amount>,
    /// Signed quote cost basis of each open position.
    cost_basis: HashMap<Symbol, Amount>,
    /// Realized profit-and-loss since the last session rollover
    /// (negative = loss).
    realized_today: Amount,
}

impl UserRiskState {
    fn new(limits: RiskLimits, rate: RateLimitConfig, now_ns: u64) -> Self {
        Self {
            limits,
            bucket: TokenBucket::new(rate.burst, rate.refill_per_sec, now_ns),
            open_orders: HashMap::new(),
            positions: HashMap::new(),
            cost_basis: HashMap::new(),
            realized_today: Amount::ZERO,
        }
    }

    fn open_notional(&self) -> Amount {
        Amount::from_raw(self.open_orders.values().map(|a| a.raw()).sum())
    }
}

/// The stateless-per-request pre-trade gate over stateful per-user
/// accounting.
pub struct RiskGate {
    tiers: HashMap<String, RiskLimits>,
    rate: RateLimitConfig,
    users: RwLock<HashMap<AccountId, Arc<Mutex<UserRiskState>>>>,
}

impl RiskGate {
    #[must_use]
    pub fn new(tiers: &[RiskTierConfig], rate: RateLimitConfig) -> Self {
        Self {
            tiers: tiers
                .iter()
                .map(|t| (t.name.clone(), RiskLimits::from(t)))
                .collect(),
            rate,
            users: RwLock::new(HashMap::new()),
        }
    }

    fn state(&self, user: AccountId, now_ns: u64) -> Arc<Mutex<UserRiskState>> {
        if let Some(state) = self.users.read().get(&user) {
            return Arc::clone(state);
        }
        let mut users = self.users.write();
        Arc::clone(users.entry(user).or_insert_with(|| {
            Arc::new(Mutex::new(UserRiskState::new(
                RiskLimits::default(),
                self.rate,
                now_ns,
            )))
        }))
    }

    /// Place a user in a configured tier.
    ///
    /// # Errors
    /// [`EngineError::Configuration`] for an unknown tier name.
    pub fn assign_tier(&self, user: AccountId, tier: &str) -> Result<()> {
        let limits = self
            .tiers
            .get(tier)
            .cloned()
            .ok_or_else(|| EngineError::Configuration(format!("unknown risk tier {tier:?}")))?;
        let state = self.state(user, 0);
        state.lock().limits = limits;
        Ok(())
    }

    /// The synchronous pre-trade check.
    ///
    /// `notional` is the order's estimated quote value (limit × qty, or
    /// band price × qty for market orders); `available_quote` is the
    /// user's current available quote balance as read from the ledger.
    ///
    /// # Errors
    /// [`EngineError::RateLimited`] or [`EngineError::RiskLimitExceeded`];
    /// both leave book and ledger untouched.
    #[allow(clippy::too_many_arguments)]
    pub fn check_submit(
        &self,
        user: AccountId,
        symbol: &Symbol,
        side: Side,
        qty: Amount,
        notional: Amount,
        available_quote: Amount,
        now_ns: u64,
    ) -> Result<()> {
        let state = self.state(user, now_ns);
        let mut state = state.lock();

        if !state.bucket.try_acquire(now_ns) {
            return Err(EngineError::RateLimited);
        }

        let limits = state.limits.clone();
        if qty > limits.max_order_size {
            return Err(reject(RiskRejection::OrderTooLarge {
                qty,
                limit: limits.max_order_size,
            }));
        }

        let position = state
            .positions
            .get(symbol)
            .copied()
            .unwrap_or(Amount::ZERO);
        let signed_qty = match side {
            Side::Buy => qty,
            Side::Sell => qty.checked_neg()?,
        };
        let projected = position.checked_add(signed_qty)?;
        if projected.abs() > limits.max_position {
            return Err(reject(RiskRejection::PositionLimit {
                current: position,
                requested: signed_qty,
                limit: limits.max_position,
            }));
        }

        if state.realized_today.is_negative()
            && state.realized_today.abs() >= limits.max_daily_loss
        {
            return Err(reject(RiskRejection::DailyLossBreached {
                loss: state.realized_today.abs(),
                limit: limits.max_daily_loss,
            }));
        }

        // Sells are fully collateralized by their base reservation; the
        // notional ceiling gates quote-funded (buy) exposure only.
        if side == Side::Buy {
            let open_after = state.open_notional().checked_add(notional)?;
            let ceiling = Amount::from_raw(
                available_quote
                    .raw()
                    .checked_mul(i128::from(limits.max_leverage))
                    .ok_or(EngineError::AmountOverflow)?,
            );
            if open_after > ceiling {
                return Err(reject(RiskRejection::LeverageExceeded {
                    notional: open_after,
                    ceiling,
                }));
            }
        }

        Ok(())
    }

    /// Record an accepted order's outstanding notional.
    pub fn on_accept(&self, user: AccountId, order_id: OrderId, notional: Amount) {
        let state = self.state(user, 0);
        state.lock().open_orders.insert(order_id, notional);
    }

    /// Record a fill: shrinks the order's outstanding notional and
    /// updates position and realized P&L using average-cost accounting.
    pub fn on_trade(
        &self,
        user: AccountId,
        order_id: OrderId,
        symbol: &Symbol,
        side: Side,
        qty: Amount,
        price: Amount,
    ) {
        let state = self.state(user, 0);
        let mut state = state.lock();

        let fill_notional = price.checked_mul(qty).unwrap_or(Amount::ZERO);
        if let Some(open) = state.open_orders.get_mut(&order_id) {
            *open = Amount::from_raw((open.raw() - fill_notional.raw()).max(0));
        }

        let position = state
            .positions
            .get(symbol)
            .copied()
            .unwrap_or(Amount::ZERO);
        let basis = state
            .cost_basis
            .get(symbol)
            .copied()
            .unwrap_or(Amount::ZERO);
        let (new_pos, new_basis, realized) =
            apply_fill(position, basis, side, qty, fill_notional);

        state.positions.insert(symbol.clone(), new_pos);
        state.cost_basis.insert(symbol.clone(), new_basis);
        if !realized.is_zero() {
            state.realized_today =
                Amount::from_raw(state.realized_today.raw() + realized.raw());
            debug!(%user, %symbol, pnl = %realized, "realized P&L");
        }
    }

    /// Drop an order's remaining outstanding notional (terminal state).
    pub fn on_terminal(&self, user: AccountId, order_id: OrderId) {
        let state = self.state(user, 0);
        state.lock().open_orders.remove(&order_id);
    }

    /// Session rollover: clears realized P&L counters.
    pub fn reset_daily(&self) {
        let users = self.users.read();
        for state in users.values() {
            state.lock().realized_today = Amount::ZERO;
        }
    }

    /// Current signed position (test / inspection surface).
    #[must_use]
    pub fn position(&self, user: AccountId, symbol: &Symbol) -> Amount {
        self.state(user, 0)
            .lock()
            .positions
            .get(symbol)
            .copied()
            .unwrap_or(Amount::ZERO)
    }

    /// Realized P&L since the last rollover (negative = loss).
    #[must_use]
    pub fn realized_today(&self, user: AccountId) -> Amount {
        self.state(user, 0).lock().realized_today
    }
}

fn reject(reason: RiskRejection) -> EngineError {
    EngineError::RiskLimitExceeded {
        reason: reason.to_string(),
    }
}

/// Average-cost position accounting for one fill.
///
/// Returns `(new_position, new_cost_basis, realized_pnl)`. Closing fills
/// realize `proceeds − basis_share`; a fill crossing through zero opens
/// the residual at the fill price.
fn apply_fill(
    position: Amount,
    basis: Amount,
    side: Side,
    qty: Amount,
    fill_notional: Amount,
) -> (Amount, Amount, Amount) {
    let pos = position.raw();
    let qty_raw = qty.raw();
    let signed = match side {
        Side::Buy => qty_raw,
        Side::Sell => -qty_raw,
    };
    let same_direction = pos == 0 || (pos > 0) == (signed > 0);

    if same_direction {
        // Extending: basis grows by the fill cost (signed with position).
        let basis_delta = match side {
            Side::Buy => fill_notional.raw(),
            Side::Sell => -fill_notional.raw(),
        };
        return (
            Amount::from_raw(pos + signed),
            Amount::from_raw(basis.raw() + basis_delta),
            Amount::ZERO,
        );
    }

    let closing = qty_raw.min(pos.abs());
    // Share of the existing basis attributed to the closed portion.
    let basis_share = if pos == 0 {
        0
    } else {
        basis.raw() * closing / pos.abs()
    };
    let proceeds = fill_notional.raw() * closing / qty_raw;
    // Long close: sell proceeds − cost. Short close: cost received
    // earlier − buyback spend.
    let realized = if pos > 0 {
        proceeds - basis_share
    } else {
        -basis_share - proceeds
    };

    let residual = qty_raw - closing;
    let new_pos = pos + signed;
    let new_basis = if residual == 0 {
        basis.raw() - basis_share
    } else {
        // Crossed through zero: the residual opens at the fill price.
        let residual_notional = fill_notional.raw() - proceeds;
        match side {
            Side::Buy => residual_notional,
            Side::Sell => -residual_notional,
        }
    };
    (
        Amount::from_raw(new_pos),
        Amount::from_raw(new_basis),
        Amount::from_raw(realized),
    )
}
