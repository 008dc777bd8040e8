//! Integration test: event-stream replay
//!
//! The stream is the source of truth: replaying it from sequence 0 must
//! reconstruct the ledger and book state the live engine reached, and
//! the canonical digest must be stable.

use std::sync::Arc;

use crossbeam_channel::Receiver;
use tickmatch_engine::{stream_digest, Command, OrderRequest, ReplayState, SymbolEngine};
use tickmatch_ledger::Ledger;
use tickmatch_risk::RiskGate;
use tickmatch_types::{
    AccountId, Amount, EngineError, EngineSettings, OrderId, RateLimitConfig, SequencedEvent,
    SessionConfig, Side, Symbol, SymbolConfig, TimeInForce,
};

fn amt(s: &str) -> Amount {
    s.parse().unwrap()
}

fn symbol() -> Symbol {
    Symbol::new("BTC", "USD")
}

struct Harness {
    engine: SymbolEngine,
    ledger: Arc<Ledger>,
    log: Vec<SequencedEvent>,
    mints: Vec<(AccountId, &'static str, Amount)>,
    _audit: Receiver<SequencedEvent>,
}

impl Harness {
    fn new() -> Self {
        let ledger = Arc::new(Ledger::new());
        let risk = Arc::new(RiskGate::new(
            &[],
            RateLimitConfig {
                burst: 1_000_000,
                refill_per_sec: 1_000_000,
            },
        ));
        let (engine, audit) = SymbolEngine::new(
            SymbolConfig::btc_usd(),
            &EngineSettings::default(),
            SessionConfig::default(),
            Arc::clone(&ledger),
            risk,
        );
        Self {
            engine,
            ledger,
            log: Vec::new(),
            mints: Vec::new(),
            _audit: audit,
        }
    }

    fn fund(&mut self, usd: &str, btc: &str) -> AccountId {
        let user = AccountId::new();
        if amt(usd).is_positive() {
            self.ledger.mint(user, "USD", amt(usd)).unwrap();
            self.mints.push((user, "USD", amt(usd)));
        }
        if amt(btc).is_positive() {
            self.ledger.mint(user, "BTC", amt(btc)).unwrap();
            self.mints.push((user, "BTC", amt(btc)));
        }
        user
    }

    fn run(&mut self, cmd: Command) {
        let events = self.engine.process(cmd).unwrap();
        self.log.extend(events);
    }

    fn replay(&self) -> ReplayState {
        let mut state = ReplayState::new();
        for (user, asset, amount) in &self.mints {
            state.seed_mint(*user, asset, *amount);
        }
        state.apply_all(&self.log).unwrap();
        state
    }
}

fn scripted_flow(h: &mut Harness) -> Vec<AccountId> {
    let a = h.fund("10000", "0");
    let b = h.fund("0", "10");
    let c = h.fund("10000", "5");

    h.run(Command::Submit(Box::new(OrderRequest::limit(
        b,
        symbol(),
        Side::Sell,
        amt("2"),
        amt("100"),
    ))));
    h.run(Command::Submit(Box::new(OrderRequest::limit(
        a,
        symbol(),
        Side::Buy,
        amt("1"),
        amt("100.5"),
    ))));
    h.run(Command::Submit(Box::new(OrderRequest::limit(
        c,
        symbol(),
        Side::Buy,
        amt("3"),
        amt("99"),
    ))));
    h.run(Command::Submit(Box::new(
        OrderRequest::limit(b, symbol(), Side::Sell, amt("1"), amt("99"))
            .with_tif(TimeInForce::Ioc),
    )));
    h.run(Command::Modify {
        user_id: c,
        order_id: OrderId(3),
        new_qty: Some(amt("2")),
        new_price: None,
    });
    h.run(Command::Cancel {
        user_id: b,
        order_id: OrderId(1),
    });
    vec![a, b, c]
}

#[test]
fn replay_reconstructs_ledger_state() {
    let mut h = Harness::new();
    let users = scripted_flow(&mut h);
    let replayed = h.replay();

    for user in users {
        for asset in ["USD", "BTC"] {
            let live = h.ledger.balance(user, asset);
            let rebuilt = replayed.balance(user, asset);
            assert_eq!(
                live, rebuilt,
                "replayed balance diverged for {asset}"
            );
        }
    }
}

#[test]
fn replay_reconstructs_book_depth() {
    let mut h = Harness::new();
    scripted_flow(&mut h);
    let replayed = h.replay();

    let live = h.engine.depth(10);
    assert_eq!(replayed.best_bid(), live.bids.first().map(|l| l.price));
    assert_eq!(replayed.best_ask(), live.asks.first().map(|l| l.price));
    for level in &live.bids {
        assert_eq!(replayed.depth_at(Side::Buy, level.price), level.qty);
    }
    for level in &live.asks {
        assert_eq!(replayed.depth_at(Side::Sell, level.price), level.qty);
    }
}

#[test]
fn digest_is_stable_across_replays() {
    let mut h = Harness::new();
    scripted_flow(&mut h);

    let first = stream_digest(&h.log).unwrap();
    let second = stream_digest(&h.log).unwrap();
    assert_eq!(first, second);
    assert_eq!(h.replay().applied(), h.log.len() as u64);
}

#[test]
fn replay_detects_a_sequence_gap() {
    let mut h = Harness::new();
    let users = scripted_flow(&mut h);
    let _ = users;

    let mut state = ReplayState::new();
    for (user, asset, amount) in &h.mints {
        state.seed_mint(*user, asset, *amount);
    }
    // Drop one event from the middle of the stream.
    let mut broken = h.log.clone();
    broken.remove(2);
    let err = state.apply_all(&broken).unwrap_err();
    assert!(matches!(err, EngineError::SequenceGap { .. }));
}
