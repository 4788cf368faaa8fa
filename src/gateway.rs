// ===============================
// src/gateway.rs
// ===============================
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use rand::Rng;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{GatewayCfg, GatewayMode};
use crate::domain::{
    now_ms, OrderAck, OrderBook, OrderReq, OrderStatus, OrderType, PriceLevel, RawListing, Symbol,
    SymbolStatus, Ticker, EXCHANGE_MEXC,
};
use crate::error::GatewayError;
use crate::gateway_mexc::MexcGateway;
use crate::metrics::CLOCK_SKEW_MS;

pub type GatewayResult<T> = Result<T, GatewayError>;

pub const MAX_CLOCK_SKEW_MS: i64 = 1_000;

/// Deadline + cancellation carried by every gateway call.
#[derive(Clone, Debug)]
pub struct CallCtx {
    pub deadline: Instant,
    pub cancel: CancellationToken,
}

impl CallCtx {
    /// Child of `parent`: cancelling the parent cancels the call.
    pub fn new(parent: &CancellationToken, timeout: Duration) -> Self {
        CallCtx {
            deadline: Instant::now() + timeout,
            cancel: parent.child_token(),
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub async fn run<T, F>(&self, fut: F) -> GatewayResult<T>
    where
        F: Future<Output = GatewayResult<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(GatewayError::Cancelled),
            _ = sleep_until(self.deadline) => Err(GatewayError::DeadlineExceeded),
            r = fut => r,
        }
    }
}

/// Typed access to one exchange.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    fn exchange(&self) -> &str;

    async fn exchange_info(&self, ctx: &CallCtx) -> GatewayResult<Vec<Symbol>>;
    async fn ticker(&self, ctx: &CallCtx, ticker: &str) -> GatewayResult<Ticker>;
    async fn order_book(&self, ctx: &CallCtx, ticker: &str, depth: u32) -> GatewayResult<OrderBook>;
    async fn place_order(&self, ctx: &CallCtx, req: &OrderReq) -> GatewayResult<OrderAck>;
    async fn cancel_order(&self, ctx: &CallCtx, ticker: &str, client_order_id: &str) -> GatewayResult<()>;
    /// `Ok(None)` when the exchange has never seen `client_order_id`.
    async fn query_order(
        &self,
        ctx: &CallCtx,
        ticker: &str,
        client_order_id: &str,
    ) -> GatewayResult<Option<OrderAck>>;
    async fn free_balance(&self, ctx: &CallCtx, asset: &str) -> GatewayResult<Decimal>;
    async fn server_time(&self, ctx: &CallCtx) -> GatewayResult<i64>;

    /// Push stream of listing messages. Ends when `cancel` fires.
    async fn subscribe_listings(&self, cancel: CancellationToken) -> GatewayResult<mpsc::Receiver<RawListing>>;

    fn stream_connected(&self) -> bool;

    /// Operator action after `AuthFailed`.
    fn rekey(&self, api_key: String, api_secret: String);

    async fn close(&self);
}

/// Builds the variant selected by config.
pub fn build(cfg: &GatewayCfg, cancel: &CancellationToken) -> GatewayResult<Arc<dyn ExchangeGateway>> {
    match cfg.mode {
        GatewayMode::Mock => {
            let gw = Arc::new(MockGateway::new().with_balance("USDT", cfg.mock_quote_balance));
            if let Some(every) = cfg.mock_demo_every {
                tokio::spawn(gw.clone().run_demo(every, cancel.child_token()));
            }
            Ok(gw)
        }
        GatewayMode::Mexc => Ok(Arc::new(MexcGateway::new(cfg.clone(), cancel.child_token())?)),
    }
}

/// Local clock minus exchange clock, measured at the round-trip midpoint.
pub async fn check_clock_skew(gw: &dyn ExchangeGateway, ctx: &CallCtx) -> GatewayResult<i64> {
    let t0 = now_ms();
    let server = gw.server_time(ctx).await?;
    let t1 = now_ms();
    let skew = (t0 + t1) / 2 - server;
    CLOCK_SKEW_MS.set(skew);
    if skew.abs() > MAX_CLOCK_SKEW_MS {
        warn!(skew_ms = skew, rtt_ms = t1 - t0, "clock skew beyond +/-1s relative to exchange");
    }
    Ok(skew)
}

// =====================================================================
// Mock venue (ACK -> Filled after delay)
// =====================================================================

#[derive(Debug, Clone)]
struct MockOrder {
    ack: OrderAck,
    fill_price: Decimal,
    fills_at: Option<Instant>,
    cancelled: bool,
}

#[derive(Default)]
struct MockState {
    symbols: Vec<Symbol>,
    tickers: HashMap<String, Decimal>,
    books: HashMap<String, OrderBook>,
    balances: HashMap<String, Decimal>,
    place_script: VecDeque<GatewayError>,
    ack_script: VecDeque<GatewayError>,
    info_script: VecDeque<GatewayError>,
    orders: HashMap<String, MockOrder>,
    placed: Vec<OrderReq>,
    listing_txs: Vec<mpsc::Sender<RawListing>>,
    clock_offset_ms: i64,
}

/// In-memory venue for tests and dry runs.
pub struct MockGateway {
    exchange: String,
    fill_after: Duration,
    latency: Duration,
    state: Mutex<MockState>,
    connected: AtomicBool,
    info_calls: AtomicU64,
    next_order_id: AtomicU64,
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGateway {
    pub fn new() -> Self {
        let mut state = MockState::default();
        state.balances.insert("USDT".to_string(), Decimal::from(10_000));
        MockGateway {
            exchange: EXCHANGE_MEXC.to_string(),
            fill_after: Duration::ZERO,
            latency: Duration::ZERO,
            state: Mutex::new(state),
            connected: AtomicBool::new(false),
            info_calls: AtomicU64::new(0),
            next_order_id: AtomicU64::new(1),
        }
    }

    pub fn with_exchange(mut self, exchange: &str) -> Self {
        self.exchange = exchange.to_ascii_uppercase();
        self
    }

    /// Market orders ack as NEW and report FILLED after `d`.
    pub fn with_fill_after(mut self, d: Duration) -> Self {
        self.fill_after = d;
        self
    }

    /// Round-trip delay for exchangeInfo and order placement.
    pub fn with_latency(mut self, d: Duration) -> Self {
        self.latency = d;
        self
    }

    async fn lag(&self) {
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }
    }

    pub fn with_balance(self, asset: &str, amount: Decimal) -> Self {
        self.set_balance(asset, amount);
        self
    }

    fn st(&self) -> MutexGuard<'_, MockState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn set_symbols(&self, symbols: Vec<Symbol>) {
        self.st().symbols = symbols;
    }

    pub fn add_symbol(&self, symbol: Symbol) {
        let mut st = self.st();
        st.symbols.retain(|s| s.id != symbol.id);
        st.symbols.push(symbol);
    }

    pub fn set_status(&self, ticker: &str, status: SymbolStatus) {
        let mut st = self.st();
        for s in st.symbols.iter_mut().filter(|s| s.id.ticker() == ticker) {
            s.status = status;
        }
    }

    pub fn set_ticker(&self, ticker: &str, price: Decimal) {
        self.st().tickers.insert(ticker.to_ascii_uppercase(), price);
    }

    pub fn set_order_book(&self, book: OrderBook) {
        self.st().books.insert(book.ticker.clone(), book);
    }

    pub fn set_balance(&self, asset: &str, amount: Decimal) {
        self.st().balances.insert(asset.to_ascii_uppercase(), amount);
    }

    pub fn set_clock_offset(&self, offset_ms: i64) {
        self.st().clock_offset_ms = offset_ms;
    }

    /// Next placements fail with these errors, in order.
    pub fn fail_next_placements(&self, errors: Vec<GatewayError>) {
        self.st().place_script.extend(errors);
    }

    /// Next placements are booked, but the caller gets these errors
    /// instead of the ack.
    pub fn lose_next_acks(&self, errors: Vec<GatewayError>) {
        self.st().ack_script.extend(errors);
    }

    pub fn fail_next_exchange_info(&self, err: GatewayError) {
        self.st().info_script.push_back(err);
    }

    /// Placement attempts that reached the venue, failed ones included.
    pub fn placed(&self) -> Vec<OrderReq> {
        self.st().placed.clone()
    }

    /// Orders the venue accepted.
    pub fn accepted_orders(&self) -> usize {
        self.st().orders.len()
    }

    pub fn exchange_info_calls(&self) -> u64 {
        self.info_calls.load(Ordering::Relaxed)
    }

    /// Delivers a message on every open listing subscription.
    pub async fn push_listing(&self, raw: RawListing) {
        let txs: Vec<mpsc::Sender<RawListing>> = {
            let mut st = self.st();
            st.listing_txs.retain(|tx| !tx.is_closed());
            st.listing_txs.clone()
        };
        for tx in txs {
            let _ = tx.send(raw.clone()).await;
        }
    }

    fn status_now(order: &MockOrder) -> (OrderStatus, Decimal, Decimal) {
        if order.cancelled {
            return (OrderStatus::Cancelled, order.ack.executed_qty, order.ack.executed_quote_qty);
        }
        match order.fills_at {
            Some(at) if Instant::now() >= at => (
                OrderStatus::Filled,
                order.ack.orig_qty,
                order.ack.orig_qty * order.fill_price,
            ),
            _ => (order.ack.status, order.ack.executed_qty, order.ack.executed_quote_qty),
        }
    }

    fn accept(&self, req: &OrderReq) -> GatewayResult<OrderAck> {
        let mut st = self.st();
        st.placed.push(req.clone());

        if let Some(err) = st.place_script.pop_front() {
            return Err(err);
        }
        if st.orders.contains_key(&req.client_order_id) {
            return Err(GatewayError::Http {
                status: 400,
                code: Some(-2010),
                msg: "duplicate clientOrderId".into(),
            });
        }
        if !st.symbols.iter().any(|s| s.id.ticker() == req.ticker) {
            return Err(GatewayError::Http {
                status: 400,
                code: Some(-1121),
                msg: format!("invalid symbol {}", req.ticker),
            });
        }

        let last = st.tickers.get(&req.ticker).copied();
        let fill_price = match (req.order_type, req.price, last) {
            (OrderType::Market, _, Some(p)) => p,
            (OrderType::Market, _, None) => Decimal::ONE,
            (_, Some(limit), Some(p)) if p <= limit => p,
            (_, Some(limit), None) => limit,
            (_, _, _) => Decimal::ZERO,
        };
        let crosses = fill_price > Decimal::ZERO;
        let now = Instant::now();

        let (status, fills_at) = match req.order_type {
            OrderType::Ioc if !crosses => (OrderStatus::Expired, None),
            _ if !crosses => (OrderStatus::New, None),
            _ if self.fill_after.is_zero() => (OrderStatus::Filled, None),
            _ => (OrderStatus::New, Some(now + self.fill_after)),
        };
        let (executed_qty, executed_quote_qty) = if status == OrderStatus::Filled {
            (req.qty, req.qty * fill_price)
        } else {
            (Decimal::ZERO, Decimal::ZERO)
        };

        let id = self.next_order_id.fetch_add(1, Ordering::Relaxed);
        let ack = OrderAck {
            ticker: req.ticker.clone(),
            client_order_id: req.client_order_id.clone(),
            exchange_order_id: Some(format!("E{id}")),
            status,
            orig_qty: req.qty,
            executed_qty,
            executed_quote_qty,
            ts: now_ms(),
        };
        st.orders.insert(
            req.client_order_id.clone(),
            MockOrder { ack: ack.clone(), fill_price, fills_at, cancelled: false },
        );
        if let Some(err) = st.ack_script.pop_front() {
            return Err(err);
        }
        Ok(ack)
    }

    /// Announces a fake listing every `every` (dry-run mode).
    pub async fn run_demo(self: Arc<Self>, every: Duration, cancel: CancellationToken) {
        let mut n: u32 = 0;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(every) => {}
            }
            n += 1;
            // jangan simpan ThreadRng melewati .await
            let suffix: u16 = rand::thread_rng().gen_range(100..1000);
            let ticker = format!("DEMO{suffix}{n}USDT");
            let open_in = rand::thread_rng().gen_range(3_000..10_000);
            let raw = RawListing::new_listing(&ticker, &format!("DEMO{suffix}{n}"), "USDT", Some(now_ms() + open_in));
            let mut sym = Symbol::from_listing(&self.exchange, &raw);
            sym.min_notional = Decimal::ONE;
            self.add_symbol(sym);
            self.set_ticker(&ticker, Decimal::new(rand::thread_rng().gen_range(1..500), 3));
            info!(%ticker, open_in_ms = open_in, "mock: announcing demo listing");
            self.push_listing(raw).await;
        }
    }
}

#[async_trait]
impl ExchangeGateway for MockGateway {
    fn exchange(&self) -> &str {
        &self.exchange
    }

    async fn exchange_info(&self, ctx: &CallCtx) -> GatewayResult<Vec<Symbol>> {
        ctx.run(async {
            self.info_calls.fetch_add(1, Ordering::Relaxed);
            self.lag().await;
            let mut st = self.st();
            if let Some(err) = st.info_script.pop_front() {
                return Err(err);
            }
            Ok(st.symbols.clone())
        })
        .await
    }

    async fn ticker(&self, ctx: &CallCtx, ticker: &str) -> GatewayResult<Ticker> {
        ctx.run(async {
            let price = self.st().tickers.get(ticker).copied();
            price
                .map(|price| Ticker { ticker: ticker.to_string(), price, ts: now_ms() })
                .ok_or_else(|| GatewayError::Http {
                    status: 400,
                    code: Some(-1121),
                    msg: format!("no ticker for {ticker}"),
                })
        })
        .await
    }

    async fn order_book(&self, ctx: &CallCtx, ticker: &str, depth: u32) -> GatewayResult<OrderBook> {
        ctx.run(async {
            let st = self.st();
            let mut book = match st.books.get(ticker) {
                Some(b) => b.clone(),
                None => {
                    let price = st.tickers.get(ticker).copied().unwrap_or(Decimal::ONE);
                    OrderBook {
                        ticker: ticker.to_string(),
                        bids: vec![PriceLevel { price, qty: Decimal::from(1_000) }],
                        asks: vec![PriceLevel { price, qty: Decimal::from(1_000) }],
                        ts: now_ms(),
                    }
                }
            };
            book.bids.truncate(depth as usize);
            book.asks.truncate(depth as usize);
            Ok(book)
        })
        .await
    }

    async fn place_order(&self, ctx: &CallCtx, req: &OrderReq) -> GatewayResult<OrderAck> {
        ctx.run(async {
            self.lag().await;
            self.accept(req)
        })
        .await
    }

    async fn cancel_order(&self, ctx: &CallCtx, _ticker: &str, client_order_id: &str) -> GatewayResult<()> {
        ctx.run(async {
            let mut st = self.st();
            match st.orders.get_mut(client_order_id) {
                Some(o) => {
                    let (status, _, _) = Self::status_now(o);
                    if status.is_terminal() {
                        return Err(GatewayError::Http {
                            status: 400,
                            code: Some(-2011),
                            msg: "order already closed".into(),
                        });
                    }
                    o.cancelled = true;
                    Ok(())
                }
                None => Err(GatewayError::Http {
                    status: 400,
                    code: Some(-2013),
                    msg: "order does not exist".into(),
                }),
            }
        })
        .await
    }

    async fn query_order(
        &self,
        ctx: &CallCtx,
        _ticker: &str,
        client_order_id: &str,
    ) -> GatewayResult<Option<OrderAck>> {
        ctx.run(async {
            let st = self.st();
            Ok(st.orders.get(client_order_id).map(|o| {
                let (status, executed_qty, executed_quote_qty) = Self::status_now(o);
                OrderAck { status, executed_qty, executed_quote_qty, ..o.ack.clone() }
            }))
        })
        .await
    }

    async fn free_balance(&self, ctx: &CallCtx, asset: &str) -> GatewayResult<Decimal> {
        ctx.run(async {
            Ok(self
                .st()
                .balances
                .get(&asset.to_ascii_uppercase())
                .copied()
                .unwrap_or(Decimal::ZERO))
        })
        .await
    }

    async fn server_time(&self, ctx: &CallCtx) -> GatewayResult<i64> {
        ctx.run(async { Ok(now_ms() - self.st().clock_offset_ms) }).await
    }

    async fn subscribe_listings(&self, cancel: CancellationToken) -> GatewayResult<mpsc::Receiver<RawListing>> {
        let (inner_tx, mut inner_rx) = mpsc::channel(1024);
        let (tx, rx) = mpsc::channel(1024);
        self.st().listing_txs.push(inner_tx);
        self.connected.store(true, Ordering::Relaxed);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = inner_rx.recv() => match msg {
                        Some(raw) => {
                            if tx.send(raw).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });
        Ok(rx)
    }

    fn stream_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn rekey(&self, _api_key: String, _api_secret: String) {}

    async fn close(&self) {
        self.connected.store(false, Ordering::Relaxed);
        self.st().listing_txs.clear();
    }
}
