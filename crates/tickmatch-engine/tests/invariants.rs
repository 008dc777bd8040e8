//! Integration test: system invariants
//!
//! After every command: balances non-negative, conservation holds, the
//! book never crosses, fills are monotone, no self-trades, trades print
//! at maker prices, and sequence numbers stay contiguous.

use std::sync::Arc;

use crossbeam_channel::Receiver;
use tickmatch_engine::{Command, OrderRequest, SymbolEngine};
use tickmatch_ledger::Ledger;
use tickmatch_risk::RiskGate;
use tickmatch_types::{
    AccountId, Amount, EngineEvent, EngineSettings, OrderId, RateLimitConfig, SequencedEvent,
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
    users: Vec<AccountId>,
    log: Vec<SequencedEvent>,
    _audit: Receiver<SequencedEvent>,
}

impl Harness {
    fn new(user_count: usize) -> Self {
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
        let users: Vec<AccountId> = (0..user_count).map(|_| AccountId::new()).collect();
        for user in &users {
            ledger.mint(*user, "USD", amt("100000")).unwrap();
            ledger.mint(*user, "BTC", amt("50")).unwrap();
        }
        Self {
            engine,
            ledger,
            users,
            log: Vec::new(),
            _audit: audit,
        }
    }

    fn run(&mut self, cmd: Command) {
        let events = self.engine.process(cmd).unwrap();
        self.log.extend(events);
        self.check_invariants();
    }

    fn check_invariants(&self) {
        // Balance non-negativity and asset conservation.
        for user in &self.users {
            for asset in ["USD", "BTC"] {
                let bal = self.ledger.balance(*user, asset);
                assert!(!bal.available.is_negative(), "negative available");
                assert!(!bal.locked.is_negative(), "negative locked");
            }
        }
        self.ledger.verify_conservation().unwrap();

        // The book never crosses.
        let depth = self.engine.depth(1);
        if let (Some(bid), Some(ask)) = (depth.bids.first(), depth.asks.first()) {
            assert!(bid.price < ask.price, "crossed book: {bid:?} vs {ask:?}");
        }
    }
}

#[test]
fn invariants_hold_through_a_mixed_flow() {
    let mut h = Harness::new(4);
    let [a, b, c, d] = [h.users[0], h.users[1], h.users[2], h.users[3]];

    // A scripted mix of resting, crossing, conditional, iceberg, and
    // cancel/modify traffic. Invariants are checked after every step.
    let steps: Vec<Command> = vec![
        Command::Submit(Box::new(OrderRequest::limit(
            a,
            symbol(),
            Side::Buy,
            amt("2"),
            amt("99"),
        ))),
        Command::Submit(Box::new(OrderRequest::limit(
            b,
            symbol(),
            Side::Sell,
            amt("2"),
            amt("101"),
        ))),
        Command::Submit(Box::new(OrderRequest::limit(
            c,
            symbol(),
            Side::Sell,
            amt("1"),
            amt("99"),
        ))),
        Command::Submit(Box::new(OrderRequest::stop(
            d,
            symbol(),
            Side::Sell,
            amt("1"),
            amt("98"),
        ))),
        Command::Submit(Box::new(OrderRequest::iceberg(
            c,
            symbol(),
            Side::Buy,
            amt("6"),
            amt("98"),
            amt("1"),
        ))),
        Command::Submit(Box::new(
            OrderRequest::limit(d, symbol(), Side::Buy, amt("3"), amt("101"))
                .with_tif(TimeInForce::Ioc),
        )),
        Command::Modify {
            user_id: a,
            order_id: OrderId(1),
            new_qty: Some(amt("1.5")),
            new_price: None,
        },
        Command::Submit(Box::new(OrderRequest::market(
            b,
            symbol(),
            Side::Sell,
            amt("2"),
        ))),
        Command::Cancel {
            user_id: c,
            order_id: OrderId(5),
        },
        Command::Tick { now: chrono::Utc::now() },
    ];
    for cmd in steps {
        h.run(cmd);
    }

    // Stream-level invariants over everything the flow produced.
    let mut expected_seq = 0;
    for event in &h.log {
        assert_eq!(event.seq, expected_seq, "sequence gap");
        expected_seq += 1;
    }

    let mut filled_so_far: std::collections::HashMap<OrderId, Amount> =
        std::collections::HashMap::new();
    for event in &h.log {
        match &event.event {
            EngineEvent::Trade(trade) => {
                assert_ne!(
                    trade.maker_user_id, trade.taker_user_id,
                    "self-trade slipped through"
                );
                assert_eq!(
                    trade.quote_amount,
                    trade.price.checked_mul(trade.qty).unwrap(),
                );
            }
            EngineEvent::PartiallyFilled {
                order_id,
                filled_qty,
                ..
            } => {
                let prev = filled_so_far
                    .get(order_id)
                    .copied()
                    .unwrap_or(Amount::ZERO);
                assert!(*filled_qty >= prev, "filled_qty regressed");
                filled_so_far.insert(*order_id, *filled_qty);
            }
            _ => {}
        }
    }
}

#[test]
fn trades_always_print_at_a_maker_price() {
    let mut h = Harness::new(2);
    let [maker, taker] = [h.users[0], h.users[1]];

    // Ladder of resting asks at known prices.
    for (i, price) in ["100", "100.5", "101"].iter().enumerate() {
        h.run(Command::Submit(Box::new(OrderRequest::limit(
            maker,
            symbol(),
            Side::Sell,
            amt("1"),
            amt(price),
        ))));
        assert_eq!(h.engine.depth(3).asks.len(), i + 1);
    }

    // A deep crossing buy sweeps all three levels.
    h.run(Command::Submit(Box::new(OrderRequest::limit(
        taker,
        symbol(),
        Side::Buy,
        amt("3"),
        amt("102"),
    ))));

    let prices: Vec<Amount> = h
        .log
        .iter()
        .filter_map(|e| match &e.event {
            EngineEvent::Trade(t) => Some(t.price),
            _ => None,
        })
        .collect();
    assert_eq!(prices, vec![amt("100"), amt("100.5"), amt("101")]);
}

#[test]
fn locked_balances_drain_to_zero_when_everything_terminates() {
    let mut h = Harness::new(2);
    let [a, b] = [h.users[0], h.users[1]];

    h.run(Command::Submit(Box::new(OrderRequest::limit(
        a,
        symbol(),
        Side::Buy,
        amt("2"),
        amt("99"),
    ))));
    h.run(Command::Submit(Box::new(OrderRequest::stop(
        b,
        symbol(),
        Side::Sell,
        amt("1"),
        amt("90"),
    ))));
    h.run(Command::Submit(Box::new(OrderRequest::iceberg(
        a,
        symbol(),
        Side::Buy,
        amt("4"),
        amt("98"),
        amt("1"),
    ))));

    // Cancel all three open orders.
    for (user, id) in [(a, 1), (b, 2), (a, 3)] {
        h.run(Command::Cancel {
            user_id: user,
            order_id: OrderId(id),
        });
    }

    // Nothing open: every lock must be released.
    for user in [a, b] {
        for asset in ["USD", "BTC"] {
            assert_eq!(
                h.ledger.balance(user, asset).locked,
                Amount::ZERO,
                "dangling lock for {asset}"
            );
        }
    }
    assert_eq!(h.ledger.balance(a, "USD").available, amt("100000"));
    assert_eq!(h.ledger.balance(b, "BTC").available, amt("50"));
}
