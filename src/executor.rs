// ===============================
// src/executor.rs
// ===============================
//
// Sniper Executor.
// - Bus events become jobs on a per-symbol lane (serialized per symbol),
//   lanes share a global semaphore (`SNIPER_WORKERS`).
// - PENDING -> ARMED after pre-checks, ARMED -> SUBMITTED only after the
//   exchange acked, committed together with the order row.
// - The client order id is derived from the intent, so every retry and
//   every restart talks about the same exchange order.
// - A validated order holds its notional in the risk book from validation
//   until it settles; orders that never reach the exchange give it back.
// - Idle lanes retire; the next job for the symbol starts a fresh one.
//
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use async_trait::async_trait;
use futures_util::FutureExt;
use rust_decimal::Decimal;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::bus::{panic_message, Handler};
use crate::catalog::Catalog;
use crate::config::SniperCfg;
use crate::domain::{
    now_ms, IntentState, ListingEvent, ListingKind, NewIntent, Order, OrderAck, OrderReq, OrderStatus, Side,
    SnipeIntent, Symbol, SymbolId, SymbolStatus,
};
use crate::error::{CoreError, ErrorKind, GatewayError, Result};
use crate::gateway::{CallCtx, ExchangeGateway};
use crate::metrics::{DEAD_LETTERS, HANDLER_PANICS, INTENTS, LAT_OPEN_ACK, ORDERS, PLACE_RETRIES};
use crate::store::Store;
use crate::validator::{check_price_guard, floor_to_step, OrderProposal, OrderValidator};

#[derive(Debug, Clone, PartialEq)]
pub enum Job {
    /// DISCOVERED: try to arm PENDING intents.
    Arm { symbol: SymbolId },
    /// TRADING_OPEN: arm what is still pending, then place ARMED intents.
    Fire {
        symbol: SymbolId,
        event_id: Option<u64>,
        detected_at: Option<i64>,
    },
}

impl Job {
    pub fn symbol(&self) -> &SymbolId {
        match self {
            Job::Arm { symbol } | Job::Fire { symbol, .. } => symbol,
        }
    }

    fn event_id(&self) -> Option<u64> {
        match self {
            Job::Fire { event_id, .. } => *event_id,
            Job::Arm { .. } => None,
        }
    }
}

struct PlaceFailure {
    error: GatewayError,
    attempts: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// ARMED intents whose order the exchange already had.
    pub recovered: usize,
    /// ARMED intents re-fired because their symbol already trades.
    pub resumed: usize,
    /// SUBMITTED intents refreshed from the exchange.
    pub polled: usize,
    pub inconsistent: usize,
}

pub struct Executor {
    gw: Arc<dyn ExchangeGateway>,
    store: Store,
    catalog: Arc<Catalog>,
    validator: OrderValidator,
    cfg: SniperCfg,
    call_timeout: Duration,
    permits: Arc<Semaphore>,
    lanes: Mutex<HashMap<SymbolId, mpsc::UnboundedSender<Job>>>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Executor {
    pub fn new(
        gw: Arc<dyn ExchangeGateway>,
        store: Store,
        catalog: Arc<Catalog>,
        validator: OrderValidator,
        cfg: SniperCfg,
        call_timeout: Duration,
    ) -> Arc<Self> {
        let workers = cfg.workers.max(1);
        Arc::new(Executor {
            gw,
            store,
            catalog,
            validator,
            cfg,
            call_timeout,
            permits: Arc::new(Semaphore::new(workers)),
            lanes: Mutex::new(HashMap::new()),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        })
    }

    fn ctx(&self) -> CallCtx {
        CallCtx::new(&self.cancel, self.call_timeout)
    }

    fn lanes(&self) -> MutexGuard<'_, HashMap<SymbolId, mpsc::UnboundedSender<Job>>> {
        match self.lanes.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // ================= operator operations =================

    /// Stores a PENDING intent and arms it right away when the symbol is known.
    pub async fn create_intent(&self, new: NewIntent) -> Result<SnipeIntent> {
        if new.quote_budget <= Decimal::ZERO || new.max_price <= Decimal::ZERO {
            return Err(CoreError::InvalidState("budget and max price must be positive".into()));
        }
        let intent = self.store.insert_intent(&new).await?;
        INTENTS.with_label_values(&[IntentState::Pending.as_str()]).inc();
        info!(intent = intent.id, symbol = %intent.symbol, budget = %intent.quote_budget, max_price = %intent.max_price, "intent created");
        if self.catalog.get(&intent.symbol).is_some() {
            self.arm_intent(&intent).await?;
        }
        self.store
            .get_intent(intent.id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("intent {}", intent.id)))
    }

    /// PENDING/ARMED -> CANCELLED. For SUBMITTED the exchange order is
    /// cancelled and the terminal state follows from polling.
    pub async fn cancel_intent(&self, id: i64) -> Result<SnipeIntent> {
        let intent = self
            .store
            .get_intent(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("intent {id}")))?;
        match intent.state {
            IntentState::Pending | IntentState::Armed => {
                if !self
                    .store
                    .transition_intent(id, intent.state, IntentState::Cancelled, Some("cancelled by operator"))
                    .await?
                {
                    return Err(CoreError::InvalidState(format!("intent {id} changed while cancelling")));
                }
                INTENTS.with_label_values(&[IntentState::Cancelled.as_str()]).inc();
                info!(intent = id, symbol = %intent.symbol, "intent cancelled");
            }
            IntentState::Submitted => {
                let cid = intent
                    .client_order_id
                    .clone()
                    .unwrap_or_else(|| intent.derive_client_order_id());
                self.gw.cancel_order(&self.ctx(), intent.symbol.ticker(), &cid).await?;
                info!(intent = id, client_order_id = %cid, "exchange cancel requested");
            }
            s => return Err(CoreError::InvalidState(format!("intent {id} is already {s}"))),
        }
        self.store
            .get_intent(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("intent {id}")))
    }

    pub async fn list_intents(&self) -> Result<Vec<SnipeIntent>> {
        self.store.list_intents().await
    }

    // ================= dispatch =================

    /// Queues `job` on its symbol's lane. Never waits.
    pub fn dispatch(self: &Arc<Self>, job: Job) {
        let symbol = job.symbol().clone();
        let mut lanes = self.lanes();
        let job = match lanes.get(&symbol) {
            Some(tx) => match tx.send(job) {
                Ok(()) => return,
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };
        let tx = self.spawn_lane(symbol.clone());
        if tx.send(job).is_err() {
            warn!(%symbol, "executor lane refused job");
        }
        lanes.insert(symbol, tx);
    }

    /// Lanes currently alive.
    pub fn lane_count(&self) -> usize {
        self.lanes().len()
    }

    fn spawn_lane(self: &Arc<Self>, symbol: SymbolId) -> mpsc::UnboundedSender<Job> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let me = Arc::clone(self);
        self.tracker.spawn(async move {
            debug!(%symbol, "executor lane started");
            loop {
                let job = tokio::select! {
                    _ = me.cancel.cancelled() => break,
                    job = timeout(me.cfg.lane_idle, rx.recv()) => match job {
                        Ok(Some(j)) => j,
                        Ok(None) => break,
                        Err(_) => match me.retire_lane(&symbol, &mut rx) {
                            Some(j) => j,
                            None => break,
                        },
                    },
                };
                let Ok(_permit) = me.permits.clone().acquire_owned().await else {
                    break;
                };
                let res = AssertUnwindSafe(me.run_job(job.clone())).catch_unwind().await;
                if let Err(payload) = res {
                    let reason = panic_message(payload.as_ref());
                    HANDLER_PANICS.with_label_values(&["executor"]).inc();
                    DEAD_LETTERS.inc();
                    error!(%symbol, ?job, %reason, "executor job panicked, lane continues");
                    if let Err(e) = me.store.record_dead_letter(job.event_id(), "executor", &reason).await {
                        error!(?e, "failed to persist dead letter");
                    }
                }
            }
            debug!(%symbol, "executor lane stopped");
        });
        tx
    }

    // dispatch sends under the same lock, so an empty queue here stays empty
    fn retire_lane(&self, symbol: &SymbolId, rx: &mut mpsc::UnboundedReceiver<Job>) -> Option<Job> {
        let mut lanes = self.lanes();
        match rx.try_recv() {
            Ok(job) => Some(job),
            Err(TryRecvError::Empty) => {
                lanes.remove(symbol);
                debug!(%symbol, "executor lane idle, retiring");
                None
            }
            // sender already dropped by shutdown; the map entry is not ours
            Err(TryRecvError::Disconnected) => None,
        }
    }

    async fn run_job(&self, job: Job) {
        let res = match &job {
            Job::Arm { symbol } => self.arm_pending(symbol).await,
            Job::Fire { symbol, detected_at, .. } => self.fire_symbol(symbol, *detected_at).await,
        };
        if let Err(e) = res {
            warn!(symbol = %job.symbol(), error = %e, kind = %e.kind(), "executor job failed");
        }
    }

    // ================= arming =================

    async fn arm_pending(&self, symbol: &SymbolId) -> Result<()> {
        for intent in self.store.intents_for_symbol(symbol, IntentState::Pending).await? {
            self.arm_intent(&intent).await?;
        }
        Ok(())
    }

    /// Pre-checks: the symbol exists and the budget fits the free balance.
    async fn arm_intent(&self, intent: &SnipeIntent) -> Result<bool> {
        let Some(sym) = self.catalog.get(&intent.symbol) else {
            self.store
                .note_intent_error(intent.id, &format!("symbol {} not in catalog", intent.symbol))
                .await?;
            return Ok(false);
        };
        let free = match self.gw.free_balance(&self.ctx(), &sym.quote).await {
            Ok(f) => f,
            Err(e) => {
                self.store
                    .note_intent_error(intent.id, &format!("balance check failed: {e}"))
                    .await?;
                return Ok(false);
            }
        };
        if intent.quote_budget > free {
            let msg = format!("budget {} exceeds free balance {} {}", intent.quote_budget, free, sym.quote);
            info!(intent = intent.id, symbol = %intent.symbol, %msg, "intent not armed");
            self.store.note_intent_error(intent.id, &msg).await?;
            return Ok(false);
        }
        let armed = self
            .store
            .transition_intent(intent.id, IntentState::Pending, IntentState::Armed, None)
            .await?;
        if armed {
            INTENTS.with_label_values(&[IntentState::Armed.as_str()]).inc();
            info!(intent = intent.id, symbol = %intent.symbol, "intent armed");
        }
        Ok(armed)
    }

    // ================= placement =================

    async fn fire_symbol(&self, symbol: &SymbolId, detected_at: Option<i64>) -> Result<()> {
        self.arm_pending(symbol).await?;
        for intent in self.store.intents_for_symbol(symbol, IntentState::Armed).await? {
            self.fire(&intent, detected_at).await?;
        }
        Ok(())
    }

    async fn fail(&self, intent: &SnipeIntent, attempts: u32, why: &str, attempted: Option<&Order>) -> Result<()> {
        if self
            .store
            .fail_intent(intent.id, IntentState::Armed, attempts, why, attempted)
            .await?
        {
            INTENTS.with_label_values(&[IntentState::Failed.as_str()]).inc();
            if let Some(o) = attempted {
                ORDERS.with_label_values(&[o.status.as_str()]).inc();
            }
            warn!(intent = intent.id, symbol = %intent.symbol, attempts, reason = %why, "snipe failed");
        }
        Ok(())
    }

    async fn fire(&self, intent: &SnipeIntent, detected_at: Option<i64>) -> Result<()> {
        let Some(sym) = self.catalog.get(&intent.symbol) else {
            let err = CoreError::NotFound(format!("symbol {}", intent.symbol));
            return self.fail(intent, 0, &err.to_string(), None).await;
        };

        let proposal = OrderProposal::sized(intent.order_type, intent.quote_budget, intent.max_price, &sym);
        let order = match self.validator.validate_and_reserve(&proposal, &sym) {
            Ok(v) => v,
            Err(e) => {
                info!(intent = intent.id, symbol = %sym.id, kind = %e.kind(), error = %e, "order refused before placement");
                return self.fail(intent, 0, &e.to_string(), None).await;
            }
        };
        let risk = self.validator.risk();

        if self.cfg.price_guard {
            match self.gw.ticker(&self.ctx(), sym.id.ticker()).await {
                Ok(t) => {
                    if let Err(e) = check_price_guard(t.price, intent.max_price) {
                        risk.release(&sym.id, order.notional);
                        return self.fail(intent, 0, &e.to_string(), None).await;
                    }
                }
                Err(e) => debug!(symbol = %sym.id, error = %e, "ticker unavailable, price guard skipped"),
            }
        }

        let req = OrderReq {
            ticker: sym.id.ticker().to_string(),
            side: Side::Buy,
            order_type: order.order_type,
            qty: order.qty,
            price: order.price,
            client_order_id: intent.derive_client_order_id(),
        };
        info!(
            intent = intent.id,
            symbol = %sym.id,
            order_type = %req.order_type,
            qty = %req.qty,
            price = ?req.price,
            client_order_id = %req.client_order_id,
            "placing snipe order"
        );

        match self.place_with_retry(&req).await {
            Ok((ack, attempts)) => self.on_ack(intent, &req, ack, attempts, detected_at).await,
            Err(PlaceFailure { error, attempts }) => {
                risk.release(&sym.id, order.notional);
                match error.kind() {
                    ErrorKind::Cancelled => {
                        // left ARMED, reconcile decides on the next start
                        self.store
                            .note_intent_error(intent.id, "placement interrupted by shutdown")
                            .await
                    }
                    ErrorKind::Transient => {
                        let err = CoreError::Exhausted { attempts, last: error };
                        let attempted = Order::unplaced(&req, &sym.id, OrderStatus::Expired);
                        self.fail(intent, attempts, &err.to_string(), Some(&attempted)).await
                    }
                    _ => {
                        let rejected = Order::unplaced(&req, &sym.id, OrderStatus::Rejected);
                        self.fail(intent, attempts, &error.to_string(), Some(&rejected)).await
                    }
                }
            }
        }
    }

    /// PlaceOrder with backoff on transient errors. After an ambiguous
    /// failure the exchange is asked by client order id before trying again.
    async fn place_with_retry(&self, req: &OrderReq) -> std::result::Result<(OrderAck, u32), PlaceFailure> {
        let max = self.cfg.max_attempts.max(1);
        let mut attempt = 0;
        let mut maybe_landed = false;
        loop {
            attempt += 1;
            let error = match self.gw.place_order(&self.ctx(), req).await {
                Ok(ack) => return Ok((ack, attempt)),
                Err(e) => e,
            };
            maybe_landed |= error.is_ambiguous();

            if error.kind() != ErrorKind::Transient {
                // a duplicate-id refusal after a lost ack still means we own an order
                if maybe_landed {
                    if let Ok(Some(ack)) = self.query(req).await {
                        return Ok((ack, attempt));
                    }
                }
                return Err(PlaceFailure { error, attempts: attempt });
            }
            if attempt >= max {
                // the last attempt may have landed too
                if maybe_landed {
                    match self.query(req).await {
                        Ok(Some(ack)) => {
                            info!(client_order_id = %req.client_order_id, "order found on exchange after last attempt");
                            return Ok((ack, attempt));
                        }
                        Ok(None) => {}
                        Err(e) => warn!(client_order_id = %req.client_order_id, error = %e, "order lookup after last attempt failed"),
                    }
                }
                return Err(PlaceFailure { error, attempts: attempt });
            }

            let delay = self.cfg.retry.delay(attempt);
            PLACE_RETRIES.inc();
            warn!(
                client_order_id = %req.client_order_id,
                attempt,
                max,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "transient placement failure, retrying"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(PlaceFailure { error: GatewayError::Cancelled, attempts: attempt });
                }
                _ = sleep(delay) => {}
            }

            if error.is_ambiguous() {
                match self.query(req).await {
                    Ok(Some(ack)) => {
                        info!(client_order_id = %req.client_order_id, "order found on exchange after ambiguous failure");
                        return Ok((ack, attempt));
                    }
                    Ok(None) => {}
                    Err(e) => debug!(error = %e, "order lookup failed, resubmitting"),
                }
            }
        }
    }

    async fn query(&self, req: &OrderReq) -> std::result::Result<Option<OrderAck>, GatewayError> {
        self.gw
            .query_order(&self.ctx(), &req.ticker, &req.client_order_id)
            .await
    }

    async fn on_ack(
        &self,
        intent: &SnipeIntent,
        req: &OrderReq,
        ack: OrderAck,
        attempts: u32,
        detected_at: Option<i64>,
    ) -> Result<()> {
        let order = Order::from_ack(req, &intent.symbol, &ack);
        // a store error keeps the reservation: the order is live on the exchange
        if !self.store.commit_submission(intent.id, attempts, &order).await? {
            self.validator.risk().release(&intent.symbol, reserved_notional(intent, &order));
            // the exchange has an order for an intent that is no longer ARMED
            let err = CoreError::Inconsistent(format!(
                "intent {} left ARMED while order {} was placed",
                intent.id, order.client_order_id
            ));
            error!(alert = "inconsistent", intent = intent.id, error = %err, "order placed for a moved intent, cancelling it");
            if let Err(e) = self
                .gw
                .cancel_order(&self.ctx(), &req.ticker, &order.client_order_id)
                .await
            {
                warn!(error = %e, "cancel of orphan order failed");
            }
            return Err(err);
        }
        INTENTS.with_label_values(&[IntentState::Submitted.as_str()]).inc();
        ORDERS.with_label_values(&[order.status.as_str()]).inc();
        if let Some(t) = detected_at {
            LAT_OPEN_ACK.observe((now_ms() - t).max(0) as f64);
        }
        info!(
            intent = intent.id,
            symbol = %intent.symbol,
            client_order_id = %order.client_order_id,
            exchange_order_id = ?order.exchange_order_id,
            status = %order.status,
            attempts,
            "snipe submitted"
        );
        if ack.status.is_terminal() || order.is_fully_filled() {
            self.settle(intent, &ack).await?;
        }
        Ok(())
    }

    /// Applies an exchange report to a SUBMITTED intent and its order.
    async fn settle(&self, intent: &SnipeIntent, ack: &OrderAck) -> Result<()> {
        let Some(order) = self.store.apply_order_update(ack).await? else {
            return Err(CoreError::Inconsistent(format!(
                "no local order for client order id {}",
                ack.client_order_id
            )));
        };
        if order.is_fully_filled() {
            if self
                .store
                .transition_intent(intent.id, IntentState::Submitted, IntentState::Filled, None)
                .await?
            {
                INTENTS.with_label_values(&[IntentState::Filled.as_str()]).inc();
                ORDERS.with_label_values(&[order.status.as_str()]).inc();
                self.validator.risk().record_fill(
                    &intent.symbol,
                    reserved_notional(intent, &order),
                    order.executed_quote_qty,
                );
                info!(
                    intent = intent.id,
                    symbol = %intent.symbol,
                    qty = %order.executed_qty,
                    quote = %order.executed_quote_qty,
                    "snipe filled"
                );
            }
        } else if order.status.is_terminal() {
            let why = format!("order {} by exchange", order.status);
            if self
                .store
                .fail_intent(intent.id, IntentState::Submitted, intent.attempts, &why, None)
                .await?
            {
                INTENTS.with_label_values(&[IntentState::Failed.as_str()]).inc();
                ORDERS.with_label_values(&[order.status.as_str()]).inc();
                self.validator.risk().record_fill(
                    &intent.symbol,
                    reserved_notional(intent, &order),
                    order.executed_quote_qty,
                );
                warn!(intent = intent.id, symbol = %intent.symbol, status = %order.status, "snipe order closed without full fill");
            }
        }
        Ok(())
    }

    // ================= polling / reconcile =================

    async fn poll_intent(&self, intent: &SnipeIntent) -> Result<bool> {
        let cid = intent
            .client_order_id
            .clone()
            .unwrap_or_else(|| intent.derive_client_order_id());
        match self
            .gw
            .query_order(&self.ctx(), intent.symbol.ticker(), &cid)
            .await?
        {
            Some(ack) => {
                self.settle(intent, &ack).await?;
                Ok(true)
            }
            None => {
                let err = CoreError::Inconsistent(format!("exchange has no order {cid}"));
                error!(alert = "inconsistent", intent = intent.id, error = %err, "submitted order unknown to exchange");
                if self
                    .store
                    .fail_intent(intent.id, IntentState::Submitted, intent.attempts, &err.to_string(), None)
                    .await?
                {
                    INTENTS.with_label_values(&[IntentState::Failed.as_str()]).inc();
                    let reserved = match self.store.get_order(&cid).await? {
                        Some(o) => reserved_notional(intent, &o),
                        None => intent.quote_budget,
                    };
                    self.validator.risk().release(&intent.symbol, reserved);
                }
                Ok(false)
            }
        }
    }

    /// One pass over SUBMITTED intents.
    pub async fn poll_once(&self) -> Result<usize> {
        let submitted = self.store.intents_in_state(IntentState::Submitted).await?;
        let mut done = 0;
        for intent in &submitted {
            match self.poll_intent(intent).await {
                Ok(_) => done += 1,
                Err(e) if e.kind() == ErrorKind::Inconsistent => {
                    error!(alert = "inconsistent", intent = intent.id, error = %e, "order state mismatch");
                    self.store.note_intent_error(intent.id, &e.to_string()).await?;
                }
                Err(e) => debug!(intent = intent.id, error = %e, "order poll failed"),
            }
        }
        Ok(done)
    }

    pub async fn run_poller(self: Arc<Self>) {
        let mut tick = interval(self.cfg.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            if let Err(e) = self.poll_once().await {
                warn!(error = %e, "order polling pass failed");
            }
            if let Err(e) = self.mark_to_market().await {
                debug!(error = %e, "mark to market failed");
            }
        }
        debug!("order poller stopped");
    }

    /// Start-up pass: learn what the exchange did with ARMED intents while
    /// we were down, and refresh SUBMITTED ones.
    pub async fn reconcile(self: &Arc<Self>) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        self.restore_exposure().await?;

        for intent in self.store.intents_in_state(IntentState::Armed).await? {
            let cid = intent.derive_client_order_id();
            let found = match self.gw.query_order(&self.ctx(), intent.symbol.ticker(), &cid).await {
                Ok(f) => f,
                Err(e) => {
                    warn!(intent = intent.id, error = %e, "reconcile lookup failed, intent stays ARMED");
                    continue;
                }
            };
            let sym = self.catalog.get(&intent.symbol);
            match found {
                Some(ack) => {
                    let req = rebuild_request(&intent, sym.as_ref(), &ack, cid);
                    let attempts = intent.attempts.max(1);
                    let recovered = Order::from_ack(&req, &intent.symbol, &ack);
                    self.validator
                        .risk()
                        .reserve(&intent.symbol, reserved_notional(&intent, &recovered));
                    match self.on_ack(&intent, &req, ack, attempts, None).await {
                        Ok(()) => {
                            report.recovered += 1;
                            info!(intent = intent.id, client_order_id = %req.client_order_id, "recovered order placed before restart");
                        }
                        Err(e) if e.kind() == ErrorKind::Inconsistent => report.inconsistent += 1,
                        Err(e) => return Err(e),
                    }
                }
                None => {
                    let trading = sym.map_or(false, |s| s.status == SymbolStatus::Trading);
                    if trading && self.cfg.resume_on_restart {
                        info!(intent = intent.id, symbol = %intent.symbol, "symbol already trading, resuming snipe");
                        self.dispatch(Job::Fire { symbol: intent.symbol.clone(), event_id: None, detected_at: None });
                        report.resumed += 1;
                    }
                }
            }
        }

        for intent in self.store.intents_in_state(IntentState::Submitted).await? {
            match self.poll_intent(&intent).await {
                Ok(true) => report.polled += 1,
                Ok(false) => report.inconsistent += 1,
                Err(e) if e.kind() == ErrorKind::Inconsistent => {
                    report.inconsistent += 1;
                    error!(alert = "inconsistent", intent = intent.id, error = %e, "reconcile mismatch");
                    self.store.note_intent_error(intent.id, &e.to_string()).await?;
                }
                Err(e) => warn!(intent = intent.id, error = %e, "reconcile poll failed"),
            }
        }

        info!(?report, "reconcile finished");
        Ok(report)
    }

    /// Rebuilds the risk book from the store: live orders at their reserved
    /// notional, settled ones at what they spent.
    async fn restore_exposure(&self) -> Result<()> {
        let risk = self.validator.risk();
        let mut live = HashSet::new();
        for intent in self.store.intents_in_state(IntentState::Submitted).await? {
            let cid = intent
                .client_order_id
                .clone()
                .unwrap_or_else(|| intent.derive_client_order_id());
            let reserved = match self.store.get_order(&cid).await? {
                Some(o) => reserved_notional(&intent, &o),
                None => intent.quote_budget,
            };
            risk.reserve(&intent.symbol, reserved);
            live.insert(cid);
        }
        let mut settled = 0;
        for o in self.store.orders_with_fills().await? {
            if !live.contains(&o.client_order_id) {
                risk.record_fill(&o.symbol, Decimal::ZERO, o.executed_quote_qty);
                settled += 1;
            }
        }
        info!(live = live.len(), settled, "risk exposure restored");
        Ok(())
    }

    /// Marks today's fills at the last price and hands the loss to the
    /// daily-loss gate.
    pub async fn mark_to_market(&self) -> Result<Decimal> {
        let day_start = now_ms() - now_ms().rem_euclid(DAY_MS);
        let mut held: HashMap<SymbolId, (Decimal, Decimal)> = HashMap::new();
        for o in self.store.orders_with_fills().await? {
            if o.updated_at >= day_start {
                let e = held.entry(o.symbol.clone()).or_default();
                e.0 += o.executed_qty;
                e.1 += o.executed_quote_qty;
            }
        }
        let mut loss = Decimal::ZERO;
        for (symbol, (qty, cost)) in &held {
            match self.gw.ticker(&self.ctx(), symbol.ticker()).await {
                Ok(t) => loss += (*cost - *qty * t.price).max(Decimal::ZERO),
                Err(e) => debug!(%symbol, error = %e, "no price for mark to market"),
            }
        }
        self.validator.risk().mark_loss(loss);
        Ok(loss)
    }

    /// Lets queued jobs finish within `deadline`, then cancels what is left.
    pub async fn shutdown(&self, deadline: Duration) {
        self.lanes().clear();
        self.tracker.close();
        if timeout(deadline, self.tracker.wait()).await.is_err() {
            warn!("executor lanes still busy at deadline, cancelling");
            self.cancel.cancel();
            let _ = timeout(Duration::from_secs(2), self.tracker.wait()).await;
        }
        self.cancel.cancel();
        info!("executor stopped");
    }
}

const DAY_MS: i64 = 86_400_000;

// quote booked in the risk book for an order
fn reserved_notional(intent: &SnipeIntent, order: &Order) -> Decimal {
    match order.price {
        Some(p) => p * order.qty,
        None => intent.quote_budget,
    }
}

// the request as it must have been sent, for an order found by client id
fn rebuild_request(intent: &SnipeIntent, sym: Option<&Symbol>, ack: &OrderAck, cid: String) -> OrderReq {
    let price = if intent.order_type.needs_price() {
        Some(match sym {
            Some(s) => floor_to_step(intent.max_price, s.tick_size),
            None => intent.max_price,
        })
    } else {
        None
    };
    OrderReq {
        ticker: intent.symbol.ticker().to_string(),
        side: Side::Buy,
        order_type: intent.order_type,
        qty: ack.orig_qty,
        price,
        client_order_id: cid,
    }
}

/// Bus subscriber feeding the executor.
pub struct ExecutorHandler(pub Arc<Executor>);

#[async_trait]
impl Handler for ExecutorHandler {
    async fn handle(&self, event: Arc<ListingEvent>) {
        let job = match event.kind {
            ListingKind::Discovered => Job::Arm { symbol: event.symbol.clone() },
            ListingKind::TradingOpen => Job::Fire {
                symbol: event.symbol.clone(),
                event_id: Some(event.id),
                detected_at: Some(event.detected_at),
            },
            ListingKind::StatusChanged(_) => return,
        };
        self.0.dispatch(job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Limits;
    use crate::domain::{OrderStatus, OrderType, EXCHANGE_MEXC};
    use crate::gateway::MockGateway;
    use crate::risk::LimitRisk;
    use rust_decimal_macros::dec;

    fn symbol(ticker: &str) -> Symbol {
        Symbol {
            id: SymbolId::new(EXCHANGE_MEXC, ticker),
            base: ticker.trim_end_matches("USDT").into(),
            quote: "USDT".into(),
            status: SymbolStatus::Trading,
            listing_ts: None,
            trading_ts: None,
            price_precision: 4,
            qty_precision: 1,
            min_qty: dec!(0.1),
            max_qty: dec!(1000000),
            min_notional: dec!(5),
            tick_size: dec!(0.0001),
            step_size: dec!(0.1),
            allowed_order_types: vec![],
            updated_at: 0,
        }
    }

    struct Rig {
        gw: Arc<MockGateway>,
        store: Store,
        risk: Arc<LimitRisk>,
        exec: Arc<Executor>,
    }

    async fn rig(cfg: SniperCfg, syms: &[Symbol]) -> Rig {
        rig_with(cfg, syms, MockGateway::new(), Limits::default(), Store::memory().await.expect("store")).await
    }

    async fn rig_with(cfg: SniperCfg, syms: &[Symbol], gw: MockGateway, limits: Limits, store: Store) -> Rig {
        let gw = Arc::new(gw);
        for s in syms {
            gw.add_symbol(s.clone());
            store.upsert_symbol(s).await.expect("upsert");
        }
        let (tx, _rx) = mpsc::channel(16);
        let dyn_gw: Arc<dyn ExchangeGateway> = gw.clone();
        let catalog = Catalog::load(
            dyn_gw.clone(),
            store.clone(),
            tx,
            false,
            Duration::from_secs(1),
            CancellationToken::new(),
        )
        .await
        .expect("catalog");
        let risk = Arc::new(LimitRisk::new(limits));
        let validator = OrderValidator::new(risk.clone(), cfg.allow_pre_listed);
        let exec = Executor::new(dyn_gw, store.clone(), catalog, validator, cfg, Duration::from_secs(2));
        Rig { gw, store, risk, exec }
    }

    fn new_intent(ticker: &str, budget: Decimal, max_price: Decimal) -> NewIntent {
        NewIntent {
            symbol: SymbolId::new(EXCHANGE_MEXC, ticker),
            quote_budget: budget,
            max_price,
            order_type: OrderType::Market,
        }
    }

    fn fast_cfg() -> SniperCfg {
        SniperCfg {
            retry: crate::backoff::BackoffPolicy::new(Duration::from_millis(5), Duration::from_millis(20), 2.0, 0.2),
            ..SniperCfg::default()
        }
    }

    #[tokio::test]
    async fn create_arms_when_balance_allows() {
        let r = rig(fast_cfg(), &[symbol("FOOUSDT")]).await;
        let armed = r
            .exec
            .create_intent(new_intent("FOOUSDT", dec!(10), dec!(1)))
            .await
            .expect("create");
        assert_eq!(armed.state, IntentState::Armed);

        r.gw.set_balance("USDT", dec!(5));
        r.exec.cancel_intent(armed.id).await.expect("cancel");
        let pending = r
            .exec
            .create_intent(new_intent("FOOUSDT", dec!(10), dec!(1)))
            .await
            .expect("create");
        assert_eq!(pending.state, IntentState::Pending);
        assert!(pending.last_error.unwrap_or_default().contains("exceeds free balance"));
    }

    #[tokio::test]
    async fn unknown_symbol_stays_pending() {
        let r = rig(fast_cfg(), &[]).await;
        let i = r
            .exec
            .create_intent(new_intent("NEWUSDT", dec!(10), dec!(1)))
            .await
            .expect("create");
        assert_eq!(i.state, IntentState::Pending);
        assert!(r
            .exec
            .create_intent(new_intent("NEWUSDT", dec!(10), dec!(1)))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn fire_fills_market_order() {
        let r = rig(fast_cfg(), &[symbol("FOOUSDT")]).await;
        r.gw.set_ticker("FOOUSDT", dec!(1));
        let i = r
            .exec
            .create_intent(new_intent("FOOUSDT", dec!(10), dec!(1.00)))
            .await
            .expect("create");
        r.exec
            .fire_symbol(&i.symbol, Some(now_ms()))
            .await
            .expect("fire");

        let i = r.store.get_intent(i.id).await.expect("get").expect("row");
        assert_eq!(i.state, IntentState::Filled);
        assert_eq!(i.attempts, 1);
        let placed = r.gw.placed();
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].qty, dec!(10));
        let o = r
            .store
            .get_order(&i.derive_client_order_id())
            .await
            .expect("get")
            .expect("order");
        assert_eq!(o.status, OrderStatus::Filled);
        assert_eq!(o.executed_quote_qty, dec!(10));
    }

    #[tokio::test]
    async fn price_guard_blocks_expensive_open() {
        let r = rig(fast_cfg(), &[symbol("FOOUSDT")]).await;
        r.gw.set_ticker("FOOUSDT", dec!(1.5));
        let i = r
            .exec
            .create_intent(new_intent("FOOUSDT", dec!(10), dec!(1)))
            .await
            .expect("create");
        r.exec.fire_symbol(&i.symbol, None).await.expect("fire");
        let i = r.store.get_intent(i.id).await.expect("get").expect("row");
        assert_eq!(i.state, IntentState::Failed);
        assert!(i.last_error.unwrap_or_default().starts_with("PriceAboveMax"));
        assert!(r.gw.placed().is_empty());
    }

    #[tokio::test]
    async fn rejected_order_is_linked_to_failed_intent() {
        let r = rig(fast_cfg(), &[symbol("FOOUSDT")]).await;
        r.gw.fail_next_placements(vec![GatewayError::Http {
            status: 400,
            code: Some(-1013),
            msg: "filter failure".into(),
        }]);
        let i = r
            .exec
            .create_intent(new_intent("FOOUSDT", dec!(10), dec!(1)))
            .await
            .expect("create");
        r.exec.fire_symbol(&i.symbol, None).await.expect("fire");

        let i = r.store.get_intent(i.id).await.expect("get").expect("row");
        assert_eq!(i.state, IntentState::Failed);
        assert_eq!(i.attempts, 1);
        let cid = i.client_order_id.clone().expect("linked");
        let o = r.store.get_order(&cid).await.expect("get").expect("order");
        assert_eq!(o.status, OrderStatus::Rejected);
    }

    #[tokio::test]
    async fn max_attempts_boundary() {
        let mut cfg = fast_cfg();
        cfg.max_attempts = 3;
        let r = rig(cfg, &[symbol("FOOUSDT"), symbol("BARUSDT")]).await;
        let busy = || GatewayError::Http { status: 429, code: None, msg: "busy".into() };

        // succeeds on the last allowed attempt
        r.gw.fail_next_placements(vec![busy(), busy()]);
        let a = r
            .exec
            .create_intent(new_intent("FOOUSDT", dec!(10), dec!(1)))
            .await
            .expect("create");
        r.exec.fire_symbol(&a.symbol, None).await.expect("fire");
        let a = r.store.get_intent(a.id).await.expect("get").expect("row");
        assert_eq!(a.state, IntentState::Filled);
        assert_eq!(a.attempts, 3);

        // one failure more is exhaustion
        r.gw.fail_next_placements(vec![busy(), busy(), busy()]);
        let b = r
            .exec
            .create_intent(new_intent("BARUSDT", dec!(10), dec!(1)))
            .await
            .expect("create");
        r.exec.fire_symbol(&b.symbol, None).await.expect("fire");
        let b = r.store.get_intent(b.id).await.expect("get").expect("row");
        assert_eq!(b.state, IntentState::Failed);
        assert_eq!(b.attempts, 3);
        assert!(b.last_error.clone().unwrap_or_default().starts_with("Exhausted"));
        let cid = b.client_order_id.clone().expect("linked");
        let o = r.store.get_order(&cid).await.expect("get").expect("attempted order");
        assert_eq!(o.status, OrderStatus::Expired);
        assert_eq!(r.risk.exposure(&b.symbol), Decimal::ZERO);
    }

    #[tokio::test]
    async fn lost_ack_on_last_attempt_is_found_by_client_id() {
        let mut cfg = fast_cfg();
        cfg.max_attempts = 1;
        let r = rig(cfg, &[symbol("FOOUSDT")]).await;
        r.gw.lose_next_acks(vec![GatewayError::Http { status: 503, code: None, msg: "unavailable".into() }]);
        let i = r
            .exec
            .create_intent(new_intent("FOOUSDT", dec!(10), dec!(1)))
            .await
            .expect("create");
        r.exec.fire_symbol(&i.symbol, None).await.expect("fire");

        let i = r.store.get_intent(i.id).await.expect("get").expect("row");
        assert_eq!(i.state, IntentState::Filled);
        assert_eq!(r.gw.accepted_orders(), 1);
        assert_eq!(r.gw.placed().len(), 1);
        let o = r
            .store
            .get_order(&i.derive_client_order_id())
            .await
            .expect("get")
            .expect("order");
        assert_eq!(o.exchange_order_id.as_deref(), Some("E1"));
    }

    #[tokio::test]
    async fn unknown_outcome_after_last_attempt_links_the_attempt() {
        let mut cfg = fast_cfg();
        cfg.max_attempts = 1;
        let r = rig(cfg, &[symbol("FOOUSDT")]).await;
        r.gw.fail_next_placements(vec![GatewayError::DeadlineExceeded]);
        let i = r
            .exec
            .create_intent(new_intent("FOOUSDT", dec!(10), dec!(1)))
            .await
            .expect("create");
        r.exec.fire_symbol(&i.symbol, None).await.expect("fire");

        let i = r.store.get_intent(i.id).await.expect("get").expect("row");
        assert_eq!(i.state, IntentState::Failed);
        assert_eq!(i.client_order_id.as_deref(), Some(i.derive_client_order_id().as_str()));
        assert!(r.store.get_order(&i.derive_client_order_id()).await.expect("get").is_some());
        assert_eq!(r.gw.accepted_orders(), 0);
    }

    #[tokio::test]
    async fn open_orders_count_against_position_cap() {
        let limits = Limits {
            max_position_quote: dec!(500),
            ..Limits::default()
        };
        let gw = MockGateway::new().with_fill_after(Duration::from_secs(60));
        let store = Store::memory().await.expect("store");
        let r = rig_with(fast_cfg(), &[symbol("AAAUSDT"), symbol("BBBUSDT")], gw, limits.clone(), store.clone()).await;

        let a = r
            .exec
            .create_intent(new_intent("AAAUSDT", dec!(400), dec!(1)))
            .await
            .expect("create");
        let b = r
            .exec
            .create_intent(new_intent("BBBUSDT", dec!(400), dec!(1)))
            .await
            .expect("create");
        r.exec.fire_symbol(&a.symbol, None).await.expect("fire a");
        r.exec.fire_symbol(&b.symbol, None).await.expect("fire b");

        let a = r.store.get_intent(a.id).await.expect("get").expect("row");
        let b = r.store.get_intent(b.id).await.expect("get").expect("row");
        assert_eq!(a.state, IntentState::Submitted);
        assert_eq!(b.state, IntentState::Failed);
        assert_eq!(b.last_error.as_deref(), Some("RiskBlocked: position"));
        assert_eq!(r.gw.placed().len(), 1);
        assert_eq!(r.risk.total_exposure(), dec!(400));

        // a fresh process sees the open order before it places anything
        let again = rig_with(fast_cfg(), &[symbol("AAAUSDT")], MockGateway::new().with_fill_after(Duration::from_secs(60)), limits, store).await;
        again.exec.restore_exposure().await.expect("restore");
        assert_eq!(again.risk.exposure(&a.symbol), dec!(400));
        assert_eq!(again.risk.total_exposure(), dec!(400));
    }

    #[tokio::test]
    async fn unfilled_close_releases_reservation() {
        let gw = MockGateway::new().with_fill_after(Duration::from_secs(60));
        let r = rig_with(fast_cfg(), &[symbol("FOOUSDT")], gw, Limits::default(), Store::memory().await.expect("store")).await;
        let i = r
            .exec
            .create_intent(new_intent("FOOUSDT", dec!(300), dec!(1)))
            .await
            .expect("create");
        r.exec.fire_symbol(&i.symbol, None).await.expect("fire");
        assert_eq!(r.risk.exposure(&i.symbol), dec!(300));

        r.exec.cancel_intent(i.id).await.expect("cancel");
        r.exec.poll_once().await.expect("poll");
        assert_eq!(
            r.store.get_intent(i.id).await.expect("get").expect("row").state,
            IntentState::Failed
        );
        assert_eq!(r.risk.exposure(&i.symbol), Decimal::ZERO);
    }

    #[tokio::test]
    async fn falling_price_feeds_daily_loss_gate() {
        let limits = Limits {
            max_daily_loss_quote: dec!(3),
            ..Limits::default()
        };
        let store = Store::memory().await.expect("store");
        let r = rig_with(fast_cfg(), &[symbol("FOOUSDT"), symbol("BARUSDT")], MockGateway::new(), limits, store).await;
        r.gw.set_ticker("FOOUSDT", dec!(1));
        let i = r
            .exec
            .create_intent(new_intent("FOOUSDT", dec!(10), dec!(1)))
            .await
            .expect("create");
        r.exec.fire_symbol(&i.symbol, None).await.expect("fire");
        assert_eq!(r.exec.mark_to_market().await.expect("mark"), Decimal::ZERO);

        // 10 units bought at 1, now worth 0.6
        r.gw.set_ticker("FOOUSDT", dec!(0.6));
        assert_eq!(r.exec.mark_to_market().await.expect("mark"), dec!(4));

        r.gw.set_ticker("BARUSDT", dec!(1));
        let j = r
            .exec
            .create_intent(new_intent("BARUSDT", dec!(10), dec!(1)))
            .await
            .expect("create");
        r.exec.fire_symbol(&j.symbol, None).await.expect("fire");
        let j = r.store.get_intent(j.id).await.expect("get").expect("row");
        assert_eq!(j.state, IntentState::Failed);
        assert_eq!(j.last_error.as_deref(), Some("RiskBlocked: daily_loss"));
    }

    #[tokio::test]
    async fn idle_lanes_retire() {
        let mut cfg = fast_cfg();
        cfg.lane_idle = Duration::from_millis(50);
        let r = rig(cfg, &[symbol("FOOUSDT"), symbol("BARUSDT")]).await;
        r.exec.dispatch(Job::Arm { symbol: SymbolId::new(EXCHANGE_MEXC, "FOOUSDT") });
        r.exec.dispatch(Job::Arm { symbol: SymbolId::new(EXCHANGE_MEXC, "BARUSDT") });
        assert_eq!(r.exec.lane_count(), 2);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(r.exec.lane_count(), 0);

        // a later job gets a fresh lane and still runs
        let i = r
            .exec
            .create_intent(new_intent("FOOUSDT", dec!(10), dec!(1)))
            .await
            .expect("create");
        r.exec.dispatch(Job::Fire { symbol: i.symbol.clone(), event_id: None, detected_at: None });
        assert_eq!(r.exec.lane_count(), 1);
        r.exec.shutdown(Duration::from_secs(5)).await;
        assert_eq!(
            r.store.get_intent(i.id).await.expect("get").expect("row").state,
            IntentState::Filled
        );
    }

    #[tokio::test]
    async fn poller_completes_delayed_fill() {
        let r = rig(fast_cfg(), &[symbol("FOOUSDT")]).await;
        let gw = Arc::new(MockGateway::new().with_fill_after(Duration::from_millis(50)));
        gw.add_symbol(symbol("FOOUSDT"));
        let dyn_gw: Arc<dyn ExchangeGateway> = gw.clone();
        let (tx, _rx) = mpsc::channel(16);
        let catalog = Catalog::load(dyn_gw.clone(), r.store.clone(), tx, false, Duration::from_secs(1), CancellationToken::new())
            .await
            .expect("catalog");
        let exec = Executor::new(
            dyn_gw,
            r.store.clone(),
            catalog,
            OrderValidator::new(Arc::new(LimitRisk::new(Limits::default())), false),
            fast_cfg(),
            Duration::from_secs(2),
        );
        let i = exec
            .create_intent(new_intent("FOOUSDT", dec!(10), dec!(1)))
            .await
            .expect("create");
        exec.fire_symbol(&i.symbol, None).await.expect("fire");
        assert_eq!(
            r.store.get_intent(i.id).await.expect("get").expect("row").state,
            IntentState::Submitted
        );

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(exec.poll_once().await.expect("poll"), 1);
        assert_eq!(
            r.store.get_intent(i.id).await.expect("get").expect("row").state,
            IntentState::Filled
        );
    }

    #[tokio::test]
    async fn cancelling_submitted_intent_cancels_on_exchange() {
        let r = rig(fast_cfg(), &[]).await;
        let gw = Arc::new(MockGateway::new().with_fill_after(Duration::from_secs(60)));
        gw.add_symbol(symbol("FOOUSDT"));
        r.store.upsert_symbol(&symbol("FOOUSDT")).await.expect("upsert");
        let dyn_gw: Arc<dyn ExchangeGateway> = gw.clone();
        let (tx, _rx) = mpsc::channel(16);
        let catalog = Catalog::load(dyn_gw.clone(), r.store.clone(), tx, false, Duration::from_secs(1), CancellationToken::new())
            .await
            .expect("catalog");
        let exec = Executor::new(
            dyn_gw,
            r.store.clone(),
            catalog,
            OrderValidator::new(Arc::new(LimitRisk::new(Limits::default())), false),
            fast_cfg(),
            Duration::from_secs(2),
        );
        let i = exec
            .create_intent(new_intent("FOOUSDT", dec!(10), dec!(1)))
            .await
            .expect("create");
        exec.fire_symbol(&i.symbol, None).await.expect("fire");
        let i = exec.cancel_intent(i.id).await.expect("cancel");
        assert_eq!(i.state, IntentState::Submitted);

        exec.poll_once().await.expect("poll");
        let i = r.store.get_intent(i.id).await.expect("get").expect("row");
        assert_eq!(i.state, IntentState::Failed);
        assert!(exec.cancel_intent(i.id).await.is_err());
    }

    #[tokio::test]
    async fn lanes_run_dispatched_jobs() {
        let r = rig(fast_cfg(), &[symbol("FOOUSDT")]).await;
        let i = r
            .exec
            .create_intent(new_intent("FOOUSDT", dec!(10), dec!(1)))
            .await
            .expect("create");
        r.exec.dispatch(Job::Fire { symbol: i.symbol.clone(), event_id: Some(1), detected_at: None });
        r.exec.dispatch(Job::Fire { symbol: i.symbol.clone(), event_id: Some(2), detected_at: None });
        r.exec.shutdown(Duration::from_secs(5)).await;

        // the second job found nothing ARMED: one order only
        assert_eq!(r.gw.placed().len(), 1);
        let i = r.store.get_intent(i.id).await.expect("get").expect("row");
        assert_eq!(i.state, IntentState::Filled);
    }
}
