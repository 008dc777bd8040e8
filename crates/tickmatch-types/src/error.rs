//! Error types for the TickMatch engine.
//!
//! All errors use the `TM_ERR_` prefix convention for easy grepping in
//! logs. Error codes are grouped by subsystem:
//! - 1xx: Order / validation errors
//! - 2xx: Balance errors
//! - 3xx: Trigger / conditional-order errors
//! - 4xx: Engine / queue errors
//! - 5xx: Matching errors
//! - 6xx: Settlement / replay errors
//! - 8xx: Risk / rate-limit errors
//! - 9xx: General / internal errors
//!
//! Client errors (everything a gateway can provoke) are non-fatal and
//! surface as `Rejected`/`Cancelled` events. The 6xx settlement group is
//! fatal: it halts the symbol engine that observed it.

use thiserror::Error;

use crate::amount::Amount;
use crate::ids::OrderId;

/// Central error enum for all TickMatch operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    // =================================================================
    // Order / validation errors (1xx)
    // =================================================================
    /// The requested order was not found on the book or in the trigger
    /// registry.
    #[error("TM_ERR_100: unknown order: {0}")]
    UnknownOrder(OrderId),

    /// The order failed structural validation (missing fields, bad values).
    #[error("TM_ERR_101: invalid order: {reason}")]
    InvalidOrder { reason: String },

    /// An order with this id already exists on the book.
    #[error("TM_ERR_102: duplicate order: {0}")]
    DuplicateOrder(OrderId),

    /// The order is already in a terminal state.
    #[error("TM_ERR_103: order already terminal: {0}")]
    AlreadyTerminal(OrderId),

    /// The command's user does not own the referenced order.
    #[error("TM_ERR_104: not the owner of order {0}")]
    NotOwner(OrderId),

    /// Price is not a positive multiple of the symbol's tick size.
    #[error("TM_ERR_105: price {price} violates tick size {tick_size}")]
    TickSizeViolation { price: Amount, tick_size: Amount },

    /// Quantity is not a positive multiple of the symbol's lot size.
    #[error("TM_ERR_106: quantity {qty} violates lot size {lot_size}")]
    LotSizeViolation { qty: Amount, lot_size: Amount },

    /// `price × qty` is below the symbol's minimum notional.
    #[error("TM_ERR_107: notional {notional} below minimum {min}")]
    MinNotionalViolation { notional: Amount, min: Amount },

    /// Quantity exceeds the symbol's per-order cap.
    #[error("TM_ERR_108: quantity {qty} exceeds maximum {max}")]
    MaxOrderQtyExceeded { qty: Amount, max: Amount },

    /// The symbol is not configured on this engine.
    #[error("TM_ERR_109: invalid symbol: {0}")]
    InvalidSymbol(String),

    // =================================================================
    // Balance errors (2xx)
    // =================================================================
    /// Not enough available balance to reserve.
    #[error("TM_ERR_200: insufficient available balance: need {needed}, have {available}")]
    InsufficientAvailable { needed: Amount, available: Amount },

    /// Not enough locked balance to release or settle. Inside
    /// settlement this is fatal — it means a reservation went missing.
    #[error("TM_ERR_201: insufficient locked balance: need {needed}, have {locked}")]
    InsufficientLocked { needed: Amount, locked: Amount },

    /// A balance mutation would produce a negative value.
    #[error("TM_ERR_202: balance underflow for {asset}")]
    NegativeBalance { asset: String },

    /// Fixed-point arithmetic overflowed 128 bits.
    #[error("TM_ERR_203: amount overflow")]
    AmountOverflow,

    // =================================================================
    // Trigger errors (3xx)
    // =================================================================
    /// A conditional order is structurally invalid (e.g. missing stop
    /// price, trail distance, or display quantity).
    #[error("TM_ERR_300: invalid trigger: {reason}")]
    InvalidTrigger { reason: String },

    /// The named OCO sibling does not exist or is already paired.
    #[error("TM_ERR_301: OCO sibling unavailable: {0}")]
    OcoSiblingUnavailable(OrderId),

    // =================================================================
    // Engine / queue errors (4xx)
    // =================================================================
    /// The command waited in the queue past its deadline.
    #[error("TM_ERR_400: deadline exceeded")]
    DeadlineExceeded,

    /// The symbol's command queue is full.
    #[error("TM_ERR_401: command queue full for {symbol}")]
    QueueFull { symbol: String },

    /// The symbol engine has halted and refuses all commands.
    #[error("TM_ERR_402: symbol halted: {symbol}")]
    SymbolHalted { symbol: String },

    // =================================================================
    // Matching errors (5xx)
    // =================================================================
    /// A post-only order would have crossed the book on entry.
    #[error("TM_ERR_500: post-only order would cross")]
    PostOnlyCrossed,

    /// A fill-or-kill order could not be fully filled.
    #[error("TM_ERR_501: fill-or-kill unfillable")]
    FokUnfillable,

    // =================================================================
    // Settlement / replay errors (6xx) — fatal
    // =================================================================
    /// Asset conservation failed: Σ(available + locked) drifted from
    /// mint − burn. Halts the symbol engine.
    #[error("TM_ERR_600: conservation violation: {reason}")]
    ConservationViolation { reason: String },

    /// The mandatory audit consumer fell behind and its ring filled.
    #[error("TM_ERR_601: audit backpressure on {symbol}")]
    AuditBackpressure { symbol: String },

    /// Event sequence numbers are not contiguous.
    #[error("TM_ERR_602: sequence gap: expected {expected}, got {got}")]
    SequenceGap { expected: u64, got: u64 },

    // =================================================================
    // Risk errors (8xx)
    // =================================================================
    /// A pre-trade risk limit was breached.
    #[error("TM_ERR_800: risk limit exceeded: {reason}")]
    RiskLimitExceeded { reason: String },

    /// The user's token bucket is empty.
    #[error("TM_ERR_801: rate limited")]
    RateLimited,

    // =================================================================
    // General / internal (9xx)
    // =================================================================
    /// Unrecoverable internal error.
    #[error("TM_ERR_900: internal error: {0}")]
    Internal(String),

    /// Configuration error — raised at startup only, never on the hot
    /// path.
    #[error("TM_ERR_902: configuration error: {0}")]
    Configuration(String),
}

impl EngineError {
    /// Whether this error must halt the observing symbol engine.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConservationViolation { .. }
                | Self::AuditBackpressure { .. }
                | Self::SequenceGap { .. }
                | Self::NegativeBalance { .. }
                | Self::Internal(_)
        )
    }
}

/// Crate-wide `Result` alias.
pub type Result<T> = std::result::Result<T, EngineError>;
