//! Configuration for the TickMatch engine.
//!
//! Configuration problems are startup errors ([`EngineError::Configuration`])
//! and are never raised on the hot path.

use chrono::{DateTime, FixedOffset, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::amount::Amount;
use crate::asset::{Symbol, SymbolConfig};
use crate::constants;
use crate::error::{EngineError, Result};

/// Engine sizing knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Bound of each symbol's inbound command queue.
    pub per_symbol_queue_depth: usize,
    /// Bound of each event consumer's ring.
    pub event_ring_depth: usize,
    /// Default per-user rate limit.
    pub rate_limit_default: RateLimitConfig,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            per_symbol_queue_depth: constants::DEFAULT_QUEUE_DEPTH,
            event_ring_depth: constants::DEFAULT_EVENT_RING_DEPTH,
            rate_limit_default: RateLimitConfig::default(),
        }
    }
}

/// Token-bucket parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Bucket capacity (burst).
    pub burst: u32,
    /// Tokens restored per second.
    pub refill_per_sec: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst: constants::DEFAULT_RATE_BURST,
            refill_per_sec: constants::DEFAULT_RATE_REFILL_PER_SEC,
        }
    }
}

/// A named risk tier. Users map to tiers; the risk gate enforces the
/// tier's limits on every submit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskTierConfig {
    pub name: String,
    /// Maximum absolute position per symbol, in base asset.
    pub max_position: Amount,
    /// Maximum realized loss per session day, in quote asset.
    pub max_daily_loss: Amount,
    /// Maximum single-order quantity, in base asset.
    pub max_order_size: Amount,
    /// Open-notional ceiling as a multiple of available quote balance.
    pub max_leverage: u32,
}

/// Trading-session window controlling DAY expiry and daily-counter
/// resets. The window is half-open `[start, end)` in the configured
/// timezone; `end < start` describes an overnight session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub start: NaiveTime,
    pub end: NaiveTime,
    /// `"UTC"` or a fixed offset such as `"+05:30"` / `"-04:00"`.
    pub timezone: String,
}

impl SessionConfig {
    /// Parse the configured timezone.
    ///
    /// # Errors
    /// [`EngineError::Configuration`] for an unrecognized timezone string.
    pub fn offset(&self) -> Result<FixedOffset> {
        parse_offset(&self.timezone)
    }

    /// Whether `ts` falls inside the trading session.
    ///
    /// # Errors
    /// [`EngineError::Configuration`] if the timezone fails to parse.
    pub fn contains(&self, ts: DateTime<Utc>) -> Result<bool> {
        let local = ts.with_timezone(&self.offset()?).time();
        Ok(if self.start <= self.end {
            local >= self.start && local < self.end
        } else {
            local >= self.start || local < self.end
        })
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            start: NaiveTime::MIN,
            // 24h markets: the whole day is in session.
            end: NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN),
            timezone: "UTC".to_string(),
        }
    }
}

fn parse_offset(tz: &str) -> Result<FixedOffset> {
    let bad = || EngineError::Configuration(format!("unrecognized timezone {tz:?}"));
    if tz.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0).ok_or_else(bad);
    }
    let (sign, rest) = if let Some(rest) = tz.strip_prefix('+') {
        (1, rest)
    } else if let Some(rest) = tz.strip_prefix('-') {
        (-1, rest)
    } else {
        return Err(bad());
    };
    let (hh, mm) = rest.split_once(':').ok_or_else(bad)?;
    let hours: i32 = hh.parse().map_err(|_| bad())?;
    let minutes: i32 = mm.parse().map_err(|_| bad())?;
    if hours > 14 || minutes > 59 {
        return Err(bad());
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(bad)
}

/// Self-trade prevention policy. Only `cancel_maker` is implemented;
/// the enum exists so configs state the policy explicitly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelfTradePolicy {
    #[default]
    CancelMaker,
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    pub symbols: Vec<SymbolConfig>,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub risk_tiers: Vec<RiskTierConfig>,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub self_trade_policy: SelfTradePolicy,
}

impl EngineConfig {
    /// Startup validation: every symbol well-formed, no duplicates,
    /// timezone parseable.
    ///
    /// # Errors
    /// [`EngineError::Configuration`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.symbols.is_empty() {
            return Err(EngineError::Configuration(
                "no symbols configured".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for cfg in &self.symbols {
            if !seen.insert(cfg.symbol.clone()) {
                return Err(EngineError::Configuration(format!(
                    "duplicate symbol {}",
                    cfg.symbol
                )));
            }
            if !cfg.tick_size.is_positive() || !cfg.lot_size.is_positive() {
                return Err(EngineError::Configuration(format!(
                    "{}: tick_size and lot_size must be positive",
                    cfg.symbol
                )));
            }
            if !cfg.max_order_qty.is_positive() {
                return Err(EngineError::Configuration(format!(
                    "{}: max_order_qty must be positive",
                    cfg.symbol
                )));
            }
            if cfg.min_notional.is_negative() {
                return Err(EngineError::Configuration(format!(
                    "{}: min_notional must not be negative",
                    cfg.symbol
                )));
            }
        }
        for tier in &self.risk_tiers {
            if tier.max_leverage == 0 {
                return Err(EngineError::Configuration(format!(
                    "tier {:?}: max_leverage must be at least 1",
                    tier.name
                )));
            }
        }
        self.session.offset()?;
        Ok(())
    }

    /// Look up the configuration for a symbol.
    #[must_use]
    pub fn symbol_config(&self, symbol: &Symbol) -> Option<&SymbolConfig> {
        self.symbols.iter().find(|c| &c.symbol == symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_session_is_all_day_utc() {
        let session = SessionConfig::default();
        assert!(session.contains(Utc::now()).unwrap());
    }

    #[test]
    fn offset_parsing() {
        assert_eq!(parse_offset("UTC").unwrap().local_minus_utc(), 0);
        assert_eq!(parse_offset("+05:30").unwrap().local_minus_utc(), 19800);
        assert_eq!(parse_offset("-04:00").unwrap().local_minus_utc(), -14400);
        assert!(parse_offset("EST").is_err());
        assert!(parse_offset("+25:00").is_err());
    }

    #[test]
    fn overnight_session_wraps_midnight() {
        let session = SessionConfig {
            start: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(2, 0, 0).unwrap(),
            timezone: "UTC".to_string(),
        };
        let inside = "2026-08-01T23:30:00Z".parse::<DateTime<Utc>>().unwrap();
        let outside = "2026-08-01T12:00:00Z".parse::<DateTime<Utc>>().unwrap();
        assert!(session.contains(inside).unwrap());
        assert!(!session.contains(outside).unwrap());
    }

    #[test]
    fn validate_rejects_empty_symbols() {
        let cfg = EngineConfig::default();
        assert!(matches!(
            cfg.validate(),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn validate_rejects_duplicates() {
        let cfg = EngineConfig {
            symbols: vec![SymbolConfig::btc_usd(), SymbolConfig::btc_usd()],
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_accepts_well_formed() {
        let cfg = EngineConfig {
            symbols: vec![SymbolConfig::btc_usd()],
            risk_tiers: vec![RiskTierConfig {
                name: "retail".into(),
                max_position: "10".parse().unwrap(),
                max_daily_loss: "1000".parse().unwrap(),
                max_order_size: "1".parse().unwrap(),
                max_leverage: 1,
            }],
            ..Default::default()
        };
        cfg.validate().unwrap();
        assert!(cfg
            .symbol_config(&Symbol::new("BTC", "USD"))
            .is_some());
        assert!(cfg.symbol_config(&Symbol::new("ETH", "USD")).is_none());
    }

    #[test]
    fn config_serde_roundtrip() {
        let cfg = EngineConfig {
            symbols: vec![SymbolConfig::btc_usd()],
            ..Default::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.symbols.len(), 1);
        assert_eq!(back.self_trade_policy, SelfTradePolicy::CancelMaker);
    }
}
