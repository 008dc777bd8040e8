//! Per-symbol market statistics.
//!
//! Last-trade price plus session high/low/volume accumulators. Snapshots
//! are taken by the engine between command processings, so a summary is
//! always consistent with the event stream up to that point.

use serde::{Deserialize, Serialize};
use tickmatch_types::{Amount, Symbol};

/// Running session accumulators.
#[derive(Debug, Default, Clone)]
pub struct MarketStats {
    pub last_trade_price: Option<Amount>,
    pub session_high: Option<Amount>,
    pub session_low: Option<Amount>,
    pub base_volume: Amount,
    pub quote_volume: Amount,
    pub trade_count: u64,
}

impl MarketStats {
    pub fn on_trade(&mut self, price: Amount, qty: Amount, quote_amount: Amount) {
        self.last_trade_price = Some(price);
        self.session_high = Some(match self.session_high {
            Some(high) => high.max(price),
            None => price,
        });
        self.session_low = Some(match self.session_low {
            Some(low) => low.min(price),
            None => price,
        });
        self.base_volume = Amount::from_raw(self.base_volume.raw() + qty.raw());
        self.quote_volume = Amount::from_raw(self.quote_volume.raw() + quote_amount.raw());
        self.trade_count += 1;
    }

    /// Session rollover: accumulators reset, last price carries over.
    pub fn reset_session(&mut self) {
        self.session_high = self.last_trade_price;
        self.session_low = self.last_trade_price;
        self.base_volume = Amount::ZERO;
        self.quote_volume = Amount::ZERO;
        self.trade_count = 0;
    }
}

/// Snapshot served to market-data consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSummary {
    pub symbol: Symbol,
    pub last_trade_price: Option<Amount>,
    pub session_high: Option<Amount>,
    pub session_low: Option<Amount>,
    pub base_volume: Amount,
    pub quote_volume: Amount,
    pub trade_count: u64,
}

impl MarketSummary {
    #[must_use]
    pub fn from_stats(symbol: Symbol, stats: &MarketStats) -> Self {
        Self {
            symbol,
            last_trade_price: stats.last_trade_price,
            session_high: stats.session_high,
            session_low: stats.session_low,
            base_volume: stats.base_volume,
            quote_volume: stats.quote_volume,
            trade_count: stats.trade_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amt(s: &str) -> Amount {
        s.parse().unwrap()
    }

    #[test]
    fn tracks_high_low_volume() {
        let mut stats = MarketStats::default();
        stats.on_trade(amt("100"), amt("1"), amt("100"));
        stats.on_trade(amt("105"), amt("2"), amt("210"));
        stats.on_trade(amt("95"), amt("1"), amt("95"));

        assert_eq!(stats.last_trade_price, Some(amt("95")));
        assert_eq!(stats.session_high, Some(amt("105")));
        assert_eq!(stats.session_low, Some(amt("95")));
        assert_eq!(stats.base_volume, amt("4"));
        assert_eq!(stats.quote_volume, amt("405"));
        assert_eq!(stats.trade_count, 3);
    }

    #[test]
    fn session_reset_keeps_last_price() {
        let mut stats = MarketStats::default();
        stats.on_trade(amt("100"), amt("1"), amt("100"));
        stats.reset_session();

        assert_eq!(stats.last_trade_price, Some(amt("100")));
        assert_eq!(stats.session_high, Some(amt("100")));
        assert_eq!(stats.base_volume, Amount::ZERO);
        assert_eq!(stats.trade_count, 0);
    }
}
