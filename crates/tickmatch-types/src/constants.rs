//! System-wide constants for the TickMatch engine.

/// Fractional decimal digits in every amount (prices and quantities).
pub const AMOUNT_SCALE: u32 = 8;

/// Default bound of a symbol's inbound command queue.
pub const DEFAULT_QUEUE_DEPTH: usize = 65_536;

/// Default bound of each consumer's event ring.
pub const DEFAULT_EVENT_RING_DEPTH: usize = 65_536;

/// Default token-bucket burst per user.
pub const DEFAULT_RATE_BURST: u32 = 100;

/// Default token-bucket refill per second per user.
pub const DEFAULT_RATE_REFILL_PER_SEC: u32 = 50;

/// Default market-order protection band in basis points (5%).
pub const DEFAULT_PROTECTION_BAND_BPS: u32 = 500;

/// Terminal orders retained per symbol for post-hoc inspection.
pub const ORDER_HISTORY_DEPTH: usize = 16_384;

/// Maximum depth levels returned by a book snapshot.
pub const MAX_SNAPSHOT_DEPTH: usize = 100;

/// Version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Engine name.
pub const ENGINE_NAME: &str = "TickMatch";
