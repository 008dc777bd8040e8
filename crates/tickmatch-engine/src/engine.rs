//! The per-symbol matching engine.
//!
//! One [`SymbolEngine`] owns a symbol's book, trigger registry, iceberg
//! table, and event stream, and drives the submit pipeline:
//!
//! ```text
//! validate → deadline → risk gate → reserve → match → settle → cascade
//! ```
//!
//! Handlers convert every client-recoverable condition into a
//! `Rejected`/`Cancelled` event and return `Ok`; an `Err` escaping a
//! handler is by construction a fatal invariant breach and halts the
//! symbol — `HaltedSymbol` is sealed as its final event and all further
//! commands are refused. Early returns release reservations in the
//! exact inverse order they were taken.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use crossbeam_channel::Receiver;
use tickmatch_book::{
    fillable_qty, match_taker, DepthSnapshot, Fill, MatchStep, MatchStop, OrderBook, TakerParams,
};
use tickmatch_ledger::Ledger;
use tickmatch_risk::RiskGate;
use tickmatch_types::{
    constants, AccountId, Amount, CancelReason, EngineError, EngineEvent, EngineSettings, Order,
    OrderId, OrderState, OrderType, Result, SequencedEvent, SessionConfig, Side, Symbol,
    SymbolConfig, TimeInForce, Trade, TradeId,
};
use tracing::{error, info, warn};

use crate::command::{Command, OrderRequest};
use crate::events::{EventBus, EventSequencer};
use crate::iceberg::{IcebergState, IcebergTable};
use crate::market_data::{MarketStats, MarketSummary};
use crate::triggers::TriggerRegistry;

/// Pre-computed routing facts for one submit, derived with no side
/// effects so a failure at any later stage has nothing to unwind beyond
/// the reservation itself.
#[derive(Debug, Clone, Copy)]
struct SubmitPlan {
    /// Worst acceptable execution price for immediate activation
    /// (limit, or protection-band price for market forms).
    effective_limit: Option<Amount>,
    reserve_base: Amount,
    reserve_quote: Amount,
    /// Estimated quote notional used by the risk gate.
    est_notional: Amount,
}

/// How an open order leaves the engine.
enum Removal {
    Cancel(CancelReason),
    Expire,
}

/// The engine for one symbol. All mutations happen on the owning
/// executor thread.
pub struct SymbolEngine {
    cfg: SymbolConfig,
    session: SessionConfig,
    book: OrderBook,
    triggers: TriggerRegistry,
    icebergs: IcebergTable,
    /// Live OCO pairings, both directions.
    oco_links: HashMap<OrderId, OrderId>,
    ledger: Arc<Ledger>,
    risk: Arc<RiskGate>,
    sequencer: EventSequencer,
    bus: EventBus,
    next_order_id: u64,
    next_trade_id: u64,
    /// Strictly monotonic nanosecond counter: the sole time-priority key.
    clock_ns: u64,
    halted: bool,
    in_session: bool,
    stats: MarketStats,
    /// Bounded ring of terminal orders for post-hoc inspection.
    history: VecDeque<Order>,
}

impl SymbolEngine {
    /// Create the engine and its mandatory audit receiver.
    #[must_use]
    pub fn new(
        cfg: SymbolConfig,
        settings: &EngineSettings,
        session: SessionConfig,
        ledger: Arc<Ledger>,
        risk: Arc<RiskGate>,
    ) -> (Self, Receiver<SequencedEvent>) {
        let symbol = cfg.symbol.clone();
        let (bus, audit_rx) = EventBus::new(symbol.clone(), settings.event_ring_depth);
        let engine = Self {
            book: OrderBook::new(symbol.clone()),
            triggers: TriggerRegistry::new(),
            icebergs: IcebergTable::new(),
            oco_links: HashMap::new(),
            ledger,
            risk,
            sequencer: EventSequencer::new(symbol),
            bus,
            next_order_id: 1,
            next_trade_id: 1,
            clock_ns: 0,
            halted: false,
            in_session: true,
            stats: MarketStats::default(),
            history: VecDeque::with_capacity(constants::ORDER_HISTORY_DEPTH),
            cfg,
            session,
        };
        (engine, audit_rx)
    }

    /// Attach a best-effort market-data consumer.
    pub fn subscribe_feed(&mut self, name: impl Into<String>) -> Receiver<SequencedEvent> {
        self.bus.subscribe(name)
    }

    #[must_use]
    pub fn symbol(&self) -> &Symbol {
        &self.cfg.symbol
    }

    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Top-N depth at a consistent point (between commands).
    #[must_use]
    pub fn depth(&self, levels: usize) -> DepthSnapshot {
        self.book
            .snapshot(levels.min(constants::MAX_SNAPSHOT_DEPTH))
    }

    /// Session market-data summary.
    #[must_use]
    pub fn summary(&self) -> MarketSummary {
        MarketSummary::from_stats(self.cfg.symbol.clone(), &self.stats)
    }

    /// Process one command, returning the atomic batch of sealed events
    /// it produced (cascades included).
    ///
    /// # Errors
    /// [`EngineError::SymbolHalted`] once the engine has halted.
    pub fn process(&mut self, cmd: Command) -> Result<Vec<SequencedEvent>> {
        if self.halted {
            return Err(EngineError::SymbolHalted {
                symbol: self.cfg.symbol.to_string(),
            });
        }

        let mut events = Vec::new();
        let result = match cmd {
            Command::Submit(req) => self.handle_submit(*req, None, &mut events),
            Command::Cancel { user_id, order_id } => {
                self.handle_cancel(user_id, order_id, &mut events)
            }
            Command::Modify {
                user_id,
                order_id,
                new_qty,
                new_price,
            } => self.handle_modify(user_id, order_id, new_qty, new_price, &mut events),
            Command::Tick { now } => self.handle_tick(now, &mut events),
        };

        if let Err(err) = result {
            error!(symbol = %self.cfg.symbol, %err, "fatal engine error, halting symbol");
            self.halted = true;
            events.push(EngineEvent::HaltedSymbol {
                reason: err.to_string(),
            });
        }

        let mut sealed: Vec<SequencedEvent> = events
            .into_iter()
            .map(|ev| self.sequencer.seal(ev))
            .collect();

        let mut publish_failure = None;
        for ev in &sealed {
            if let Err(err) = self.bus.publish(ev) {
                publish_failure = Some(err);
                break;
            }
        }
        if let Some(err) = publish_failure {
            if !self.halted {
                error!(symbol = %self.cfg.symbol, %err, "audit backpressure, halting symbol");
                self.halted = true;
                let halt = self.sequencer.seal(EngineEvent::HaltedSymbol {
                    reason: err.to_string(),
                });
                let _ = self.bus.publish(&halt);
                sealed.push(halt);
            }
        }
        Ok(sealed)
    }

    // =================================================================
    // Clocks
    // =================================================================

    fn wall_now_ns() -> u64 {
        Utc::now()
            .timestamp_nanos_opt()
            .map_or(0, |n| n.max(0) as u64)
    }

    /// Next `accepted_ts`: wall nanoseconds, bumped to stay strictly
    /// monotonic.
    fn next_ts(&mut self) -> u64 {
        self.clock_ns = Self::wall_now_ns().max(self.clock_ns + 1);
        self.clock_ns
    }

    // =================================================================
    // Submit
    // =================================================================

    fn handle_submit(
        &mut self,
        req: OrderRequest,
        forced_id: Option<OrderId>,
        events: &mut Vec<EngineEvent>,
    ) -> Result<()> {
        let plan = match self.plan_submit(&req) {
            Ok(plan) => plan,
            Err(err) => {
                self.reject_submit(&req, &err, events);
                return Ok(());
            }
        };

        // OCO pairing must name a live, unpaired leg of the same user.
        if let Some(sibling_id) = req.oco_sibling_id {
            if !self.oco_sibling_available(&req, sibling_id) {
                self.reject_submit(
                    &req,
                    &EngineError::OcoSiblingUnavailable(sibling_id),
                    events,
                );
                return Ok(());
            }
        }

        let now_ns = Self::wall_now_ns();
        let available_quote = self
            .ledger
            .balance(req.user_id, &self.cfg.symbol.quote)
            .available;
        if let Err(err) = self.risk.check_submit(
            req.user_id,
            &req.symbol,
            req.side,
            req.qty,
            plan.est_notional,
            available_quote,
            now_ns,
        ) {
            self.reject_submit(&req, &err, events);
            return Ok(());
        }

        let order_id = forced_id.unwrap_or_else(|| {
            let id = OrderId(self.next_order_id);
            self.next_order_id += 1;
            id
        });
        let accepted_ts = self.next_ts();
        let mut order = Order {
            id: order_id,
            client_id: req.client_id,
            user_id: req.user_id,
            symbol: req.symbol.clone(),
            side: req.side,
            order_type: req.order_type,
            time_in_force: req.time_in_force,
            post_only: req.post_only,
            state: OrderState::New,
            qty: req.qty,
            filled_qty: Amount::ZERO,
            limit_price: req.limit_price,
            stop_price: req.stop_price,
            trail_amount: req.trail_amount,
            trail_percent: req.trail_percent,
            display_qty: req.display_qty,
            oco_sibling_id: req.oco_sibling_id,
            accepted_ts,
            reserved_base: plan.reserve_base,
            reserved_quote: plan.reserve_quote,
            created_at: Utc::now(),
        };

        let (reserve_asset, reserve_amount) = match order.side {
            Side::Buy => (self.cfg.symbol.quote.clone(), plan.reserve_quote),
            Side::Sell => (self.cfg.symbol.base.clone(), plan.reserve_base),
        };
        if let Err(err) = self.ledger.reserve(order.user_id, &reserve_asset, reserve_amount) {
            match err {
                EngineError::InsufficientAvailable { .. } => {
                    self.reject_submit(&req, &err, events);
                    return Ok(());
                }
                other => return Err(other),
            }
        }
        // Open-notional tracking gates quote-funded exposure; sells are
        // collateralized in base and carry no open notional.
        let open_notional = match order.side {
            Side::Buy => plan.est_notional,
            Side::Sell => Amount::ZERO,
        };
        self.risk.on_accept(order.user_id, order.id, open_notional);

        info!(symbol = %self.cfg.symbol, order = %order.id, side = %order.side,
              kind = %order.order_type, qty = %order.qty, "accepted");
        events.push(EngineEvent::Accepted {
            order: order.clone(),
        });

        if let Some(sibling_id) = req.oco_sibling_id {
            self.oco_links.insert(sibling_id, order.id);
            self.oco_links.insert(order.id, sibling_id);
        }

        let conditional = order.order_type.is_conditional()
            || (order.order_type == OrderType::OcoLeg && order.stop_price.is_some());
        if conditional {
            order.state = OrderState::PendingTrigger;
            self.triggers.insert(order, self.stats.last_trade_price)?;
        } else if order.order_type == OrderType::Iceberg {
            self.activate_iceberg(order, plan.effective_limit, events)?;
        } else {
            self.activate(order, plan.effective_limit, events)?;
        }

        self.run_cascades(events)
    }

    /// Pure validation and routing math. Every error returned here is a
    /// client rejection; nothing has been reserved yet.
    fn plan_submit(&self, req: &OrderRequest) -> Result<SubmitPlan> {
        if req.symbol != self.cfg.symbol {
            return Err(EngineError::InvalidSymbol(req.symbol.to_string()));
        }
        if let Some(deadline) = req.deadline_ns {
            if Self::wall_now_ns() > deadline {
                return Err(EngineError::DeadlineExceeded);
            }
        }
        self.cfg.check_qty(req.qty)?;

        let immediate = matches!(req.order_type, OrderType::Limit | OrderType::Market);
        if matches!(req.time_in_force, TimeInForce::Ioc | TimeInForce::Fok) && !immediate {
            return Err(EngineError::InvalidOrder {
                reason: format!("{} cannot be IOC/FOK", req.order_type),
            });
        }
        if req.post_only && req.order_type != OrderType::Limit {
            return Err(EngineError::InvalidOrder {
                reason: "post-only applies to limit orders".to_string(),
            });
        }
        if req.oco_sibling_id.is_some() && req.order_type != OrderType::OcoLeg {
            return Err(EngineError::InvalidOrder {
                reason: "oco_sibling_id requires an OCO leg".to_string(),
            });
        }

        let need = |field: Option<Amount>, what: &str| -> Result<Amount> {
            field.ok_or_else(|| EngineError::InvalidOrder {
                reason: format!("{} requires {what}", req.order_type),
            })
        };
        let forbid = |field: Option<Amount>, what: &str| -> Result<()> {
            if field.is_some() {
                return Err(EngineError::InvalidOrder {
                    reason: format!("{} does not take {what}", req.order_type),
                });
            }
            Ok(())
        };

        // The worst price a buy could pay / the price a sell commits at,
        // used for reservations and the risk notional.
        let commit_price = match req.order_type {
            OrderType::Limit => {
                let limit = need(req.limit_price, "a limit price")?;
                forbid(req.stop_price, "a stop price")?;
                forbid(req.display_qty, "a display quantity")?;
                self.cfg.check_price(limit)?;
                self.cfg.check_notional(limit, req.qty)?;
                limit
            }
            OrderType::Market => {
                forbid(req.limit_price, "a limit price")?;
                forbid(req.stop_price, "a stop price")?;
                let reference = self.market_reference(req.side)?;
                self.cfg.band_limit(req.side, reference)?
            }
            OrderType::Stop => {
                let stop = need(req.stop_price, "a stop price")?;
                forbid(req.limit_price, "a limit price")?;
                self.cfg.check_price(stop)?;
                self.cfg.band_limit(req.side, stop)?
            }
            OrderType::StopLimit => {
                let stop = need(req.stop_price, "a stop price")?;
                let limit = need(req.limit_price, "a limit price")?;
                self.cfg.check_price(stop)?;
                self.cfg.check_price(limit)?;
                self.cfg.check_notional(limit, req.qty)?;
                limit
            }
            OrderType::TrailingStop => {
                forbid(req.limit_price, "a limit price")?;
                let trigger = self.trailing_seed_trigger(req)?;
                self.cfg.band_limit(req.side, trigger)?
            }
            OrderType::TakeProfit => {
                let target = need(req.stop_price, "a target price")?;
                self.cfg.check_price(target)?;
                match req.limit_price {
                    Some(limit) => {
                        self.cfg.check_price(limit)?;
                        self.cfg.check_notional(limit, req.qty)?;
                        limit
                    }
                    None => self.cfg.band_limit(req.side, target)?,
                }
            }
            OrderType::Iceberg => {
                let limit = need(req.limit_price, "a limit price")?;
                let display = need(req.display_qty, "a display quantity")?;
                self.cfg.check_price(limit)?;
                self.cfg.check_notional(limit, req.qty)?;
                if !display.is_positive()
                    || !display.is_step_multiple(self.cfg.lot_size)
                    || display > req.qty
                {
                    return Err(EngineError::InvalidOrder {
                        reason: "display quantity must be a lot multiple within qty".to_string(),
                    });
                }
                limit
            }
            OrderType::OcoLeg => match (req.limit_price, req.stop_price) {
                (Some(limit), None) => {
                    self.cfg.check_price(limit)?;
                    self.cfg.check_notional(limit, req.qty)?;
                    limit
                }
                (None, Some(stop)) => {
                    self.cfg.check_price(stop)?;
                    self.cfg.band_limit(req.side, stop)?
                }
                _ => {
                    return Err(EngineError::InvalidOrder {
                        reason: "an OCO leg takes exactly one of limit or stop price".to_string(),
                    })
                }
            },
        };

        let (reserve_base, reserve_quote, est_notional) = match req.side {
            Side::Buy => {
                let quote = commit_price.checked_mul(req.qty)?;
                (Amount::ZERO, quote, quote)
            }
            Side::Sell => {
                let est = commit_price.checked_mul(req.qty)?;
                (req.qty, Amount::ZERO, est)
            }
        };

        let effective_limit = match req.order_type {
            OrderType::Limit | OrderType::Iceberg => req.limit_price,
            OrderType::Market => Some(commit_price),
            OrderType::OcoLeg => req.limit_price,
            // Conditionals compute their limit at fire time.
            _ => None,
        };

        // Pre-checks with book access but no side effects.
        if req.post_only {
            if let Some(limit) = req.limit_price {
                let crossed = match req.side {
                    Side::Buy => self.book.best_ask().is_some_and(|ask| ask <= limit),
                    Side::Sell => self.book.best_bid().is_some_and(|bid| bid >= limit),
                };
                if crossed {
                    return Err(EngineError::PostOnlyCrossed);
                }
            }
        }
        if req.time_in_force == TimeInForce::Fok {
            let available =
                fillable_qty(&self.book, req.side, effective_limit, req.user_id, req.qty);
            if available < req.qty {
                return Err(EngineError::FokUnfillable);
            }
        }

        Ok(SubmitPlan {
            effective_limit,
            reserve_base,
            reserve_quote,
            est_notional,
        })
    }

    /// Reference price for a market order entering now.
    fn market_reference(&self, side: Side) -> Result<Amount> {
        let opposing = match side {
            Side::Buy => self.book.best_ask(),
            Side::Sell => self.book.best_bid(),
        };
        opposing
            .or(self.stats.last_trade_price)
            .ok_or_else(|| EngineError::InvalidOrder {
                reason: "no reference price for market order".to_string(),
            })
    }

    /// Initial effective trigger of a trailing stop, for reservations.
    fn trailing_seed_trigger(&self, req: &OrderRequest) -> Result<Amount> {
        let fixed = req.trail_amount.filter(|a| a.is_positive());
        let pct = req.trail_percent.filter(|p| p.is_positive());
        if fixed.is_some() == pct.is_some() {
            return Err(EngineError::InvalidTrigger {
                reason: "trailing stop takes exactly one of trail_amount or trail_percent"
                    .to_string(),
            });
        }
        let mark = self
            .stats
            .last_trade_price
            .or(req.stop_price)
            .ok_or_else(|| EngineError::InvalidTrigger {
                reason: "trailing stop needs a reference price".to_string(),
            })?;
        let delta = match fixed {
            Some(amount) => amount,
            None => {
                let pct = pct.unwrap_or(Amount::ZERO);
                let raw = mark
                    .raw()
                    .checked_mul(pct.raw())
                    .ok_or(EngineError::AmountOverflow)?
                    / (100 * tickmatch_types::RAW_PER_UNIT);
                Amount::from_raw(raw)
            }
        };
        match req.side {
            Side::Sell => mark.checked_sub(delta),
            Side::Buy => mark.checked_add(delta),
        }
    }

    fn reject_submit(&self, req: &OrderRequest, err: &EngineError, events: &mut Vec<EngineEvent>) {
        warn!(symbol = %self.cfg.symbol, client = %req.client_id, %err, "submit rejected");
        events.push(EngineEvent::Rejected {
            client_id: Some(req.client_id),
            order_id: None,
            user_id: req.user_id,
            reason: err.to_string(),
        });
    }

    fn reject_command(
        &self,
        user_id: AccountId,
        order_id: OrderId,
        err: &EngineError,
        events: &mut Vec<EngineEvent>,
    ) {
        warn!(symbol = %self.cfg.symbol, order = %order_id, %err, "command rejected");
        events.push(EngineEvent::Rejected {
            client_id: None,
            order_id: Some(order_id),
            user_id,
            reason: err.to_string(),
        });
    }

    fn oco_sibling_available(&self, req: &OrderRequest, sibling_id: OrderId) -> bool {
        let sibling = self
            .book
            .get(sibling_id)
            .or_else(|| self.triggers.get(sibling_id));
        match sibling {
            Some(order) => {
                order.order_type == OrderType::OcoLeg
                    && order.user_id == req.user_id
                    && !self.oco_links.contains_key(&sibling_id)
            }
            None => false,
        }
    }

    // =================================================================
    // Activation (the taker phase)
    // =================================================================

    /// Run `order` as a taker, then settle, narrate, and dispose of the
    /// residual per its time-in-force.
    fn activate(
        &mut self,
        mut order: Order,
        effective_limit: Option<Amount>,
        events: &mut Vec<EngineEvent>,
    ) -> Result<()> {
        order.state = OrderState::Active;
        let quote_budget = if order.side == Side::Buy && order.limit_price.is_none() {
            Some(order.reserved_quote)
        } else {
            None
        };
        let params = TakerParams {
            limit: effective_limit,
            quote_budget,
            lot_size: self.cfg.lot_size,
        };
        let outcome = match_taker(&mut self.book, &mut order, &params)?;
        self.apply_steps(&mut order, outcome.steps, events)?;

        if order.is_filled() {
            self.finish_taker(order, events)?;
            return Ok(());
        }

        if matches!(
            order.time_in_force,
            TimeInForce::Ioc | TimeInForce::Fok
        ) {
            return self.cancel_taker_residual(order, CancelReason::IocResidual, events);
        }
        if order.limit_price.is_none() {
            let reason = match outcome.stop {
                MatchStop::BookExhausted => CancelReason::NoLiquidity,
                _ => CancelReason::ProtectionBand,
            };
            return self.cancel_taker_residual(order, reason, events);
        }

        // GTC / DAY limit residual rests.
        if order.filled_qty.is_positive() {
            events.push(EngineEvent::PartiallyFilled {
                order_id: order.id,
                filled_qty: order.filled_qty,
                remaining_qty: order.remaining_qty(),
            });
        }
        let price = order.limit_price.ok_or_else(|| {
            EngineError::Internal("resting order lost its limit price".to_string())
        })?;
        events.push(EngineEvent::Resting {
            order_id: order.id,
            side: order.side,
            price,
            qty: order.remaining_qty(),
        });
        self.book.insert(order)?;
        Ok(())
    }

    /// Iceberg activation: take liquidity with the full quantity first,
    /// then display the first slice of the residual.
    fn activate_iceberg(
        &mut self,
        mut order: Order,
        effective_limit: Option<Amount>,
        events: &mut Vec<EngineEvent>,
    ) -> Result<()> {
        order.state = OrderState::Active;
        let display_qty = order.display_qty.ok_or_else(|| {
            EngineError::Internal("iceberg without display quantity".to_string())
        })?;
        let params = TakerParams {
            limit: effective_limit,
            quote_budget: None,
            lot_size: self.cfg.lot_size,
        };
        let outcome = match_taker(&mut self.book, &mut order, &params)?;
        self.apply_steps(&mut order, outcome.steps, events)?;

        if order.is_filled() {
            return self.finish_taker(order, events);
        }

        if order.filled_qty.is_positive() {
            events.push(EngineEvent::PartiallyFilled {
                order_id: order.id,
                filled_qty: order.filled_qty,
                remaining_qty: order.remaining_qty(),
            });
        }
        let mut state = IcebergState::new(order, display_qty);
        let slice_ts = self.next_ts();
        if let Some(slice) = state.carve_slice(slice_ts)? {
            let price = slice.limit_price.ok_or_else(|| {
                EngineError::Internal("iceberg slice lost its limit price".to_string())
            })?;
            events.push(EngineEvent::Resting {
                order_id: slice.id,
                side: slice.side,
                price,
                qty: slice.qty,
            });
            self.book.insert(slice)?;
        }
        self.icebergs.insert(state);
        Ok(())
    }

    /// Settle and narrate the matcher's steps in execution order.
    fn apply_steps(
        &mut self,
        taker: &mut Order,
        steps: Vec<MatchStep>,
        events: &mut Vec<EngineEvent>,
    ) -> Result<()> {
        let mut taker_had_fill = false;
        for step in steps {
            match step {
                MatchStep::SelfTradeCancel(maker) => {
                    self.cancel_self_trade_maker(maker, events)?;
                }
                MatchStep::Fill(fill) => {
                    self.settle_fill(taker, &fill, events)?;
                    if !taker_had_fill {
                        taker_had_fill = true;
                        if taker.order_type == OrderType::OcoLeg {
                            self.cancel_oco_sibling(taker.id, events)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn cancel_self_trade_maker(
        &mut self,
        maker: Order,
        events: &mut Vec<EngineEvent>,
    ) -> Result<()> {
        // A self-trade against an iceberg slice cancels the whole
        // iceberg, hidden reserve included.
        let (mut record, released_base, released_quote) =
            if let Some(state) = self.icebergs.remove(maker.id) {
                let released_base = Amount::from_raw(
                    maker.reserved_base.raw() + state.parent.reserved_base.raw(),
                );
                let released_quote = Amount::from_raw(
                    maker.reserved_quote.raw() + state.parent.reserved_quote.raw(),
                );
                (state.parent, released_base, released_quote)
            } else {
                (maker.clone(), maker.reserved_base, maker.reserved_quote)
            };

        self.ledger
            .release(record.user_id, &self.cfg.symbol.base, released_base)?;
        self.ledger
            .release(record.user_id, &self.cfg.symbol.quote, released_quote)?;
        self.risk.on_terminal(record.user_id, record.id);
        self.unlink_oco(record.id);

        record.state = OrderState::Cancelled;
        record.reserved_base = Amount::ZERO;
        record.reserved_quote = Amount::ZERO;
        events.push(EngineEvent::Cancelled {
            order_id: record.id,
            reason: CancelReason::SelfTradePrevention,
            side: record.side,
            resting_price: record.limit_price,
            remaining_qty: record.remaining_qty(),
            released_base,
            released_quote,
        });
        self.push_history(record);
        Ok(())
    }

    /// One fill: build the trade, settle it (fatal on failure), adjust
    /// the taker's reservation, and narrate the maker's progress.
    fn settle_fill(
        &mut self,
        taker: &mut Order,
        fill: &Fill,
        events: &mut Vec<EngineEvent>,
    ) -> Result<()> {
        let quote_amount = fill.price.checked_mul(fill.qty)?;
        let trade = Trade {
            id: TradeId(self.next_trade_id),
            symbol: self.cfg.symbol.clone(),
            maker_order_id: fill.maker_order_id,
            maker_user_id: fill.maker_user_id,
            taker_order_id: taker.id,
            taker_user_id: taker.user_id,
            price: fill.price,
            qty: fill.qty,
            quote_amount,
            maker_side: fill.maker_side,
            executed_at: Utc::now(),
        };
        self.next_trade_id += 1;

        self.ledger.settle_trade(&trade)?;
        match taker.side {
            Side::Buy => taker.consume_reserved_quote(quote_amount)?,
            Side::Sell => taker.consume_reserved_base(fill.qty)?,
        }
        self.stats.on_trade(fill.price, fill.qty, quote_amount);
        self.risk.on_trade(
            fill.maker_user_id,
            fill.maker_order_id,
            &self.cfg.symbol,
            fill.maker_side,
            fill.qty,
            fill.price,
        );
        self.risk.on_trade(
            taker.user_id,
            taker.id,
            &self.cfg.symbol,
            taker.side,
            fill.qty,
            fill.price,
        );
        events.push(EngineEvent::Trade(trade));

        if self.icebergs.contains(fill.maker_order_id) {
            return self.narrate_iceberg_maker(fill, events);
        }

        if fill.maker_done {
            self.ledger.release(
                fill.maker_user_id,
                &self.cfg.symbol.base,
                fill.maker_released_base,
            )?;
            self.ledger.release(
                fill.maker_user_id,
                &self.cfg.symbol.quote,
                fill.maker_released_quote,
            )?;
            self.risk.on_terminal(fill.maker_user_id, fill.maker_order_id);
            events.push(EngineEvent::Filled {
                order_id: fill.maker_order_id,
                released_base: fill.maker_released_base,
                released_quote: fill.maker_released_quote,
            });
            self.cancel_oco_sibling(fill.maker_order_id, events)?;
            if let Some(mut removed) = fill.maker_removed.clone() {
                removed.reserved_base = Amount::ZERO;
                removed.reserved_quote = Amount::ZERO;
                self.push_history(removed);
            }
        } else {
            events.push(EngineEvent::PartiallyFilled {
                order_id: fill.maker_order_id,
                filled_qty: fill.maker_filled_qty,
                remaining_qty: fill.maker_remaining,
            });
            // First fill of an OCO leg drops the sibling.
            self.cancel_oco_sibling(fill.maker_order_id, events)?;
        }
        Ok(())
    }

    /// Maker-side narration when the filled maker is an iceberg slice:
    /// progress is reported against the parent, and an exhausted slice
    /// re-issues the next one with a fresh `accepted_ts` so hidden
    /// quantity never keeps its queue position.
    fn narrate_iceberg_maker(
        &mut self,
        fill: &Fill,
        events: &mut Vec<EngineEvent>,
    ) -> Result<()> {
        let slice_ts = self.next_ts();
        let mut parent_done: Option<Order> = None;
        let mut new_slice: Option<Order> = None;
        let mut progress: Option<(Amount, Amount)> = None;
        {
            let state = self
                .icebergs
                .get_mut(fill.maker_order_id)
                .ok_or_else(|| EngineError::Internal("iceberg state vanished".to_string()))?;
            state.note_slice_fill(fill.qty)?;
            if state.parent.is_filled() {
                parent_done = Some(state.parent.clone());
            } else {
                progress = Some((state.parent.filled_qty, state.parent.remaining_qty()));
                if fill.maker_done {
                    new_slice = state.carve_slice(slice_ts)?;
                }
            }
        }

        if let Some(mut parent) = parent_done {
            self.icebergs.remove(parent.id);
            let released_base = Amount::from_raw(
                fill.maker_released_base.raw() + parent.reserved_base.raw(),
            );
            let released_quote = Amount::from_raw(
                fill.maker_released_quote.raw() + parent.reserved_quote.raw(),
            );
            self.ledger
                .release(parent.user_id, &self.cfg.symbol.base, released_base)?;
            self.ledger
                .release(parent.user_id, &self.cfg.symbol.quote, released_quote)?;
            self.risk.on_terminal(parent.user_id, parent.id);
            events.push(EngineEvent::Filled {
                order_id: parent.id,
                released_base,
                released_quote,
            });
            parent.reserved_base = Amount::ZERO;
            parent.reserved_quote = Amount::ZERO;
            self.push_history(parent);
            return Ok(());
        }

        if let Some((filled_qty, remaining_qty)) = progress {
            events.push(EngineEvent::PartiallyFilled {
                order_id: fill.maker_order_id,
                filled_qty,
                remaining_qty,
            });
        }
        if let Some(slice) = new_slice {
            let price = slice.limit_price.ok_or_else(|| {
                EngineError::Internal("iceberg slice lost its limit price".to_string())
            })?;
            events.push(EngineEvent::Resting {
                order_id: slice.id,
                side: slice.side,
                price,
                qty: slice.qty,
            });
            self.book.insert(slice)?;
        }
        Ok(())
    }

    /// Fully filled taker: release the reservation surplus (price
    /// improvement, band slack, truncation dust) and close out.
    fn finish_taker(&mut self, mut order: Order, events: &mut Vec<EngineEvent>) -> Result<()> {
        let released_base = order.reserved_base;
        let released_quote = order.reserved_quote;
        self.ledger
            .release(order.user_id, &self.cfg.symbol.base, released_base)?;
        self.ledger
            .release(order.user_id, &self.cfg.symbol.quote, released_quote)?;
        self.risk.on_terminal(order.user_id, order.id);
        events.push(EngineEvent::Filled {
            order_id: order.id,
            released_base,
            released_quote,
        });
        order.reserved_base = Amount::ZERO;
        order.reserved_quote = Amount::ZERO;
        self.push_history(order);
        Ok(())
    }

    /// Cancel a taker's unfilled remainder (IOC, exhausted market,
    /// protection band) and release what backs it.
    fn cancel_taker_residual(
        &mut self,
        mut order: Order,
        reason: CancelReason,
        events: &mut Vec<EngineEvent>,
    ) -> Result<()> {
        if order.filled_qty.is_positive() {
            events.push(EngineEvent::PartiallyFilled {
                order_id: order.id,
                filled_qty: order.filled_qty,
                remaining_qty: order.remaining_qty(),
            });
        }
        let released_base = order.reserved_base;
        let released_quote = order.reserved_quote;
        self.ledger
            .release(order.user_id, &self.cfg.symbol.base, released_base)?;
        self.ledger
            .release(order.user_id, &self.cfg.symbol.quote, released_quote)?;
        self.risk.on_terminal(order.user_id, order.id);
        events.push(EngineEvent::Cancelled {
            order_id: order.id,
            reason,
            side: order.side,
            resting_price: None,
            remaining_qty: order.remaining_qty(),
            released_base,
            released_quote,
        });
        order.state = OrderState::Cancelled;
        order.reserved_base = Amount::ZERO;
        order.reserved_quote = Amount::ZERO;
        self.push_history(order);
        Ok(())
    }

    // =================================================================
    // Trigger cascades
    // =================================================================

    /// Fire every trigger crossed by the current last-trade price, and
    /// keep going while promotions keep trading. Completes before the
    /// triggering command returns.
    fn run_cascades(&mut self, events: &mut Vec<EngineEvent>) -> Result<()> {
        loop {
            let Some(last) = self.stats.last_trade_price else {
                return Ok(());
            };
            let fired = self.triggers.fire(last);
            if fired.is_empty() {
                return Ok(());
            }
            for (order, trigger_price) in fired {
                self.promote(order, trigger_price, events)?;
            }
        }
    }

    /// Promote a fired conditional: cancel its OCO sibling, re-check
    /// risk (stale triggers cancel instead of trading), and re-enter it
    /// as a taker in its configured form.
    fn promote(
        &mut self,
        mut order: Order,
        trigger_price: Amount,
        events: &mut Vec<EngineEvent>,
    ) -> Result<()> {
        info!(symbol = %self.cfg.symbol, order = %order.id, %trigger_price, "trigger fired");
        events.push(EngineEvent::Triggered {
            order_id: order.id,
            trigger_price,
        });
        self.cancel_oco_sibling(order.id, events)?;

        let est_notional = match order.side {
            Side::Buy => order.reserved_quote,
            Side::Sell => trigger_price
                .checked_mul(order.remaining_qty())
                .unwrap_or(Amount::ZERO),
        };
        let available_quote = self
            .ledger
            .balance(order.user_id, &self.cfg.symbol.quote)
            .available;
        if self
            .risk
            .check_submit(
                order.user_id,
                &self.cfg.symbol,
                order.side,
                order.remaining_qty(),
                est_notional,
                available_quote,
                Self::wall_now_ns(),
            )
            .is_err()
        {
            let released_base = order.reserved_base;
            let released_quote = order.reserved_quote;
            self.ledger
                .release(order.user_id, &self.cfg.symbol.base, released_base)?;
            self.ledger
                .release(order.user_id, &self.cfg.symbol.quote, released_quote)?;
            self.risk.on_terminal(order.user_id, order.id);
            events.push(EngineEvent::Cancelled {
                order_id: order.id,
                reason: CancelReason::StaleTrigger,
                side: order.side,
                resting_price: None,
                remaining_qty: order.remaining_qty(),
                released_base,
                released_quote,
            });
            order.state = OrderState::Cancelled;
            order.reserved_base = Amount::ZERO;
            order.reserved_quote = Amount::ZERO;
            self.push_history(order);
            return Ok(());
        }

        let effective_limit = match order.order_type {
            OrderType::StopLimit => order.limit_price,
            OrderType::TakeProfit if order.limit_price.is_some() => order.limit_price,
            // Market forms: bounded by the protection band anchored at
            // the best price available right now.
            _ => {
                let reference = self.market_reference(order.side).unwrap_or(trigger_price);
                Some(self.cfg.band_limit(order.side, reference)?)
            }
        };
        self.activate(order, effective_limit, events)
    }

    // =================================================================
    // Cancel / Modify / Tick
    // =================================================================

    fn handle_cancel(
        &mut self,
        user_id: AccountId,
        order_id: OrderId,
        events: &mut Vec<EngineEvent>,
    ) -> Result<()> {
        let owner = self.open_order_owner(order_id);
        match owner {
            None => {
                let err = if self.historical_order(order_id).is_some() {
                    EngineError::AlreadyTerminal(order_id)
                } else {
                    EngineError::UnknownOrder(order_id)
                };
                self.reject_command(user_id, order_id, &err, events);
                return Ok(());
            }
            Some(owner) if owner != user_id => {
                self.reject_command(user_id, order_id, &EngineError::NotOwner(order_id), events);
                return Ok(());
            }
            Some(_) => {}
        }

        // Cancelling one OCO leg drops the whole pair.
        let sibling = self.oco_links.get(&order_id).copied();
        self.remove_open_order(order_id, &Removal::Cancel(CancelReason::UserRequested), events)?;
        if let Some(sibling_id) = sibling {
            self.remove_open_order(
                sibling_id,
                &Removal::Cancel(CancelReason::OcoSibling),
                events,
            )?;
        }
        Ok(())
    }

    fn handle_modify(
        &mut self,
        user_id: AccountId,
        order_id: OrderId,
        new_qty: Option<Amount>,
        new_price: Option<Amount>,
        events: &mut Vec<EngineEvent>,
    ) -> Result<()> {
        if self.triggers.contains(order_id) || self.icebergs.contains(order_id) {
            self.reject_command(
                user_id,
                order_id,
                &EngineError::InvalidOrder {
                    reason: "modify applies to resting limit orders only".to_string(),
                },
                events,
            );
            return Ok(());
        }
        let Some(existing) = self.book.get(order_id).cloned() else {
            let err = if self.historical_order(order_id).is_some() {
                EngineError::AlreadyTerminal(order_id)
            } else {
                EngineError::UnknownOrder(order_id)
            };
            self.reject_command(user_id, order_id, &err, events);
            return Ok(());
        };
        if existing.user_id != user_id {
            self.reject_command(user_id, order_id, &EngineError::NotOwner(order_id), events);
            return Ok(());
        }
        if new_qty.is_none() && new_price.is_none() {
            self.reject_command(
                user_id,
                order_id,
                &EngineError::InvalidOrder {
                    reason: "modify requires a new quantity or price".to_string(),
                },
                events,
            );
            return Ok(());
        }

        let price_unchanged = new_price.is_none() || new_price == existing.limit_price;
        let shrinking = new_qty.is_some_and(|q| q < existing.qty);

        if price_unchanged && shrinking {
            let target = new_qty.unwrap_or(existing.qty);
            return self.reduce_in_place(existing, target, events);
        }

        // Everything else is cancel + resubmit and loses time priority.
        if existing.order_type != OrderType::Limit {
            self.reject_command(
                user_id,
                order_id,
                &EngineError::InvalidOrder {
                    reason: format!("{} cannot be replaced", existing.order_type),
                },
                events,
            );
            return Ok(());
        }
        let req = OrderRequest {
            client_id: existing.client_id,
            user_id,
            symbol: existing.symbol.clone(),
            side: existing.side,
            order_type: OrderType::Limit,
            qty: new_qty.unwrap_or(existing.remaining_qty()),
            limit_price: new_price.or(existing.limit_price),
            stop_price: None,
            trail_amount: None,
            trail_percent: None,
            display_qty: None,
            oco_sibling_id: None,
            time_in_force: existing.time_in_force,
            post_only: existing.post_only,
            deadline_ns: None,
        };
        self.remove_open_order(order_id, &Removal::Cancel(CancelReason::Replaced), events)?;
        self.handle_submit(req, Some(order_id), events)
    }

    /// Quantity-only shrink: keeps queue position and `accepted_ts`,
    /// releases only the reservation delta.
    fn reduce_in_place(
        &mut self,
        existing: Order,
        new_qty: Amount,
        events: &mut Vec<EngineEvent>,
    ) -> Result<()> {
        if let Err(err) = self.cfg.check_qty(new_qty) {
            self.reject_command(existing.user_id, existing.id, &err, events);
            return Ok(());
        }
        let snapshot = match self.book.reduce(existing.id, new_qty) {
            Ok(snapshot) => snapshot,
            Err(err @ (EngineError::InvalidOrder { .. } | EngineError::UnknownOrder(_))) => {
                self.reject_command(existing.user_id, existing.id, &err, events);
                return Ok(());
            }
            Err(other) => return Err(other),
        };

        let delta_qty = existing.qty.checked_sub(new_qty)?;
        let (released_base, released_quote) = match snapshot.side {
            Side::Buy => {
                let price = snapshot.limit_price.ok_or_else(|| {
                    EngineError::Internal("resting order lost its limit price".to_string())
                })?;
                (Amount::ZERO, price.checked_mul(delta_qty)?)
            }
            Side::Sell => (delta_qty, Amount::ZERO),
        };
        self.book
            .consume_reservation(existing.id, released_base, released_quote)?;
        self.ledger
            .release(existing.user_id, &self.cfg.symbol.base, released_base)?;
        self.ledger
            .release(existing.user_id, &self.cfg.symbol.quote, released_quote)?;

        // Refresh the risk gate's outstanding-notional estimate.
        if snapshot.side == Side::Buy {
            if let Some(price) = snapshot.limit_price {
                let est = price
                    .checked_mul(snapshot.remaining_qty())
                    .unwrap_or(Amount::ZERO);
                self.risk.on_accept(existing.user_id, existing.id, est);
            }
        }

        events.push(EngineEvent::Reduced {
            order_id: existing.id,
            side: snapshot.side,
            price: snapshot.limit_price,
            new_qty,
            released_base,
            released_quote,
        });
        Ok(())
    }

    fn handle_tick(&mut self, now: DateTime<Utc>, events: &mut Vec<EngineEvent>) -> Result<()> {
        let in_session = self.session.contains(now)?;
        if self.in_session && !in_session {
            info!(symbol = %self.cfg.symbol, "session end: expiring DAY orders");
            let day = |o: &Order| o.time_in_force == TimeInForce::Day;
            let mut ids = self.book.order_ids_where(day);
            ids.extend(self.triggers.ids_where(day));
            ids.extend(self.icebergs.ids_where(day));
            ids.sort();
            ids.dedup();
            for id in ids {
                self.remove_open_order(id, &Removal::Expire, events)?;
            }
            self.stats.reset_session();
            self.risk.reset_daily();
        }
        self.in_session = in_session;
        Ok(())
    }

    // =================================================================
    // Open-order removal
    // =================================================================

    fn open_order_owner(&self, order_id: OrderId) -> Option<AccountId> {
        if let Some(state) = self.icebergs.get(order_id) {
            return Some(state.parent.user_id);
        }
        if let Some(order) = self.book.get(order_id) {
            return Some(order.user_id);
        }
        self.triggers.get(order_id).map(|o| o.user_id)
    }

    /// Remove an open order from wherever it lives, release its
    /// reservations, and emit the terminal event. Returns whether it was
    /// found. Defensively unlinks any OCO pairing without touching the
    /// sibling.
    fn remove_open_order(
        &mut self,
        order_id: OrderId,
        removal: &Removal,
        events: &mut Vec<EngineEvent>,
    ) -> Result<bool> {
        self.unlink_oco(order_id);

        let (mut record, released_base, released_quote, resting_price) =
            if let Some(state) = self.icebergs.remove(order_id) {
                // The active display slice rests on the book under the
                // same id; fold its reservation back into the parent's.
                let slice = self.book.cancel(order_id).ok();
                let (slice_base, slice_quote) = slice
                    .map(|s| (s.reserved_base, s.reserved_quote))
                    .unwrap_or((Amount::ZERO, Amount::ZERO));
                let released_base =
                    Amount::from_raw(state.parent.reserved_base.raw() + slice_base.raw());
                let released_quote =
                    Amount::from_raw(state.parent.reserved_quote.raw() + slice_quote.raw());
                let price = state.parent.limit_price;
                (state.parent, released_base, released_quote, price)
            } else if self.book.contains(order_id) {
                let order = self.book.cancel(order_id)?;
                let released = (order.reserved_base, order.reserved_quote);
                let price = order.limit_price;
                (order, released.0, released.1, price)
            } else if let Some(order) = self.triggers.cancel(order_id) {
                let released = (order.reserved_base, order.reserved_quote);
                (order, released.0, released.1, None)
            } else {
                return Ok(false);
            };

        self.ledger
            .release(record.user_id, &self.cfg.symbol.base, released_base)?;
        self.ledger
            .release(record.user_id, &self.cfg.symbol.quote, released_quote)?;
        self.risk.on_terminal(record.user_id, record.id);

        let remaining_qty = record.remaining_qty();
        match removal {
            Removal::Cancel(reason) => {
                record.state = OrderState::Cancelled;
                events.push(EngineEvent::Cancelled {
                    order_id: record.id,
                    reason: *reason,
                    side: record.side,
                    resting_price,
                    remaining_qty,
                    released_base,
                    released_quote,
                });
            }
            Removal::Expire => {
                record.state = OrderState::Expired;
                events.push(EngineEvent::Expired {
                    order_id: record.id,
                    side: record.side,
                    resting_price,
                    remaining_qty,
                    released_base,
                    released_quote,
                });
            }
        }
        record.reserved_base = Amount::ZERO;
        record.reserved_quote = Amount::ZERO;
        self.push_history(record);
        Ok(true)
    }

    fn unlink_oco(&mut self, order_id: OrderId) -> Option<OrderId> {
        let sibling = self.oco_links.remove(&order_id)?;
        self.oco_links.remove(&sibling);
        Some(sibling)
    }

    /// Fill or trigger of one OCO leg cancels the other.
    fn cancel_oco_sibling(
        &mut self,
        order_id: OrderId,
        events: &mut Vec<EngineEvent>,
    ) -> Result<()> {
        if let Some(sibling) = self.unlink_oco(order_id) {
            self.remove_open_order(sibling, &Removal::Cancel(CancelReason::OcoSibling), events)?;
        }
        Ok(())
    }

    fn push_history(&mut self, order: Order) {
        if self.history.len() == constants::ORDER_HISTORY_DEPTH {
            self.history.pop_front();
        }
        self.history.push_back(order);
    }

    /// Terminal-order lookup in the bounded history ring.
    #[must_use]
    pub fn historical_order(&self, order_id: OrderId) -> Option<&Order> {
        self.history.iter().rev().find(|o| o.id == order_id)
    }
}
