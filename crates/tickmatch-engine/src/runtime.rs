//! The multi-symbol runtime.
//!
//! Parallel across symbols, single-threaded per symbol: every configured
//! symbol gets one engine thread fed by a bounded MPSC command queue.
//! The ledger and risk gate are shared across all of them; book,
//! triggers, and counters are exclusive to each engine.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tickmatch_ledger::Ledger;
use tickmatch_risk::RiskGate;
use tickmatch_types::{
    AccountId, Amount, EngineConfig, EngineError, OrderId, Result, SequencedEvent, Symbol,
};
use tracing::{info, warn};

use crate::command::{Command, OrderRequest};
use crate::engine::SymbolEngine;

struct SymbolHandle {
    tx: Sender<Command>,
}

/// Owns one engine thread per configured symbol plus the shared ledger
/// and risk gate.
pub struct ExchangeCore {
    handles: HashMap<Symbol, SymbolHandle>,
    ledger: Arc<Ledger>,
    risk: Arc<RiskGate>,
    threads: Vec<JoinHandle<()>>,
}

impl ExchangeCore {
    /// Validate the configuration, spawn one engine thread per symbol,
    /// and return the core plus each symbol's mandatory audit receiver.
    ///
    /// # Errors
    /// [`EngineError::Configuration`] from config validation;
    /// [`EngineError::Internal`] if a thread fails to spawn.
    pub fn start(
        config: EngineConfig,
    ) -> Result<(Self, HashMap<Symbol, Receiver<SequencedEvent>>)> {
        config.validate()?;
        let ledger = Arc::new(Ledger::new());
        let risk = Arc::new(RiskGate::new(
            &config.risk_tiers,
            config.engine.rate_limit_default,
        ));

        let mut handles = HashMap::new();
        let mut audits = HashMap::new();
        let mut threads = Vec::new();
        for symbol_cfg in &config.symbols {
            let symbol = symbol_cfg.symbol.clone();
            let (mut engine, audit_rx) = SymbolEngine::new(
                symbol_cfg.clone(),
                &config.engine,
                config.session.clone(),
                Arc::clone(&ledger),
                Arc::clone(&risk),
            );
            let (tx, rx) = bounded::<Command>(config.engine.per_symbol_queue_depth);
            let thread_symbol = symbol.clone();
            let thread = std::thread::Builder::new()
                .name(format!("tickmatch-{thread_symbol}"))
                .spawn(move || {
                    while let Ok(cmd) = rx.recv() {
                        if let Err(err) = engine.process(cmd) {
                            // Halted engines keep draining so senders
                            // see queue-level rejection, not a hang.
                            warn!(symbol = %thread_symbol, %err, "command dropped");
                        }
                    }
                    info!(symbol = %thread_symbol, "engine thread stopped");
                })
                .map_err(|e| EngineError::Internal(format!("spawn failed: {e}")))?;

            handles.insert(symbol.clone(), SymbolHandle { tx });
            audits.insert(symbol, audit_rx);
            threads.push(thread);
        }

        info!(symbols = handles.len(), "exchange core started");
        Ok((
            Self {
                handles,
                ledger,
                risk,
                threads,
            },
            audits,
        ))
    }

    fn send(&self, symbol: &Symbol, cmd: Command) -> Result<()> {
        let handle = self
            .handles
            .get(symbol)
            .ok_or_else(|| EngineError::InvalidSymbol(symbol.to_string()))?;
        match handle.tx.try_send(cmd) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(EngineError::QueueFull {
                symbol: symbol.to_string(),
            }),
            Err(TrySendError::Disconnected(_)) => Err(EngineError::SymbolHalted {
                symbol: symbol.to_string(),
            }),
        }
    }

    /// Enqueue a submit.
    ///
    /// # Errors
    /// [`EngineError::InvalidSymbol`], [`EngineError::QueueFull`], or
    /// [`EngineError::SymbolHalted`].
    pub fn submit(&self, request: OrderRequest) -> Result<()> {
        let symbol = request.symbol.clone();
        self.send(&symbol, Command::Submit(Box::new(request)))
    }

    /// Enqueue a cancel.
    ///
    /// # Errors
    /// See [`ExchangeCore::submit`].
    pub fn cancel(&self, symbol: &Symbol, user_id: AccountId, order_id: OrderId) -> Result<()> {
        self.send(symbol, Command::Cancel { user_id, order_id })
    }

    /// Enqueue a modify.
    ///
    /// # Errors
    /// See [`ExchangeCore::submit`].
    pub fn modify(
        &self,
        symbol: &Symbol,
        user_id: AccountId,
        order_id: OrderId,
        new_qty: Option<Amount>,
        new_price: Option<Amount>,
    ) -> Result<()> {
        self.send(
            symbol,
            Command::Modify {
                user_id,
                order_id,
                new_qty,
                new_price,
            },
        )
    }

    /// Broadcast a session tick to every symbol.
    ///
    /// # Errors
    /// First queue error encountered.
    pub fn tick_all(&self, now: DateTime<Utc>) -> Result<()> {
        for symbol in self.handles.keys() {
            self.send(symbol, Command::Tick { now })?;
        }
        Ok(())
    }

    /// The shared settlement ledger (custody boundary lives here).
    #[must_use]
    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// The shared risk gate (tier assignment lives here).
    #[must_use]
    pub fn risk(&self) -> &Arc<RiskGate> {
        &self.risk
    }

    /// Configured symbols.
    #[must_use]
    pub fn symbols(&self) -> Vec<Symbol> {
        self.handles.keys().cloned().collect()
    }

    /// Close all queues and join the engine threads.
    pub fn shutdown(mut self) {
        self.handles.clear();
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                warn!("engine thread panicked during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tickmatch_types::{EngineEvent, Side, SymbolConfig};

    use super::*;

    fn amt(s: &str) -> Amount {
        s.parse().unwrap()
    }

    fn config() -> EngineConfig {
        EngineConfig {
            symbols: vec![SymbolConfig::btc_usd()],
            ..Default::default()
        }
    }

    #[test]
    fn start_rejects_bad_config() {
        let result = ExchangeCore::start(EngineConfig::default());
        assert!(matches!(result, Err(EngineError::Configuration(_))));
    }

    #[test]
    fn unknown_symbol_is_rejected_at_the_queue() {
        let (core, _audits) = ExchangeCore::start(config()).unwrap();
        let err = core
            .cancel(&Symbol::new("ETH", "USD"), AccountId::new(), OrderId(1))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidSymbol(_)));
        core.shutdown();
    }

    #[test]
    fn crossing_orders_settle_end_to_end() {
        let symbol = Symbol::new("BTC", "USD");
        let (core, mut audits) = ExchangeCore::start(config()).unwrap();
        let audit = audits.remove(&symbol).unwrap();

        let buyer = AccountId::new();
        let seller = AccountId::new();
        core.ledger().mint(buyer, "USD", amt("1000")).unwrap();
        core.ledger().mint(seller, "BTC", amt("1")).unwrap();

        core.submit(OrderRequest::limit(
            seller,
            symbol.clone(),
            Side::Sell,
            amt("1"),
            amt("100"),
        ))
        .unwrap();
        core.submit(OrderRequest::limit(
            buyer,
            symbol.clone(),
            Side::Buy,
            amt("1"),
            amt("100.5"),
        ))
        .unwrap();

        // Drain the audit stream until both fills are visible.
        let mut filled = 0;
        let mut trade_price = None;
        while filled < 2 {
            let ev = audit
                .recv_timeout(std::time::Duration::from_secs(5))
                .expect("audit stream stalled");
            match ev.event {
                EngineEvent::Filled { .. } => filled += 1,
                EngineEvent::Trade(trade) => trade_price = Some(trade.price),
                _ => {}
            }
        }
        assert_eq!(trade_price, Some(amt("100")), "maker price execution");

        let ledger = Arc::clone(core.ledger());
        core.shutdown();

        assert_eq!(ledger.balance(buyer, "BTC").available, amt("1"));
        assert_eq!(ledger.balance(seller, "USD").available, amt("100"));
        // Paid 100 against a 100.50 reservation; the surplus came back.
        assert_eq!(ledger.balance(buyer, "USD").available, amt("900"));
        ledger.verify_conservation().unwrap();
    }
}
