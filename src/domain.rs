// ===============================
// src/domain.rs
// ===============================
use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const EXCHANGE_MEXC: &str = "MEXC";

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// `EXCHANGE:TICKER`, e.g. `MEXC:FOOUSDT`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SymbolId(String);

impl SymbolId {
    pub fn new(exchange: &str, ticker: &str) -> Self {
        SymbolId(format!(
            "{}:{}",
            exchange.trim().to_ascii_uppercase(),
            ticker.trim().to_ascii_uppercase()
        ))
    }

    pub fn parse(s: &str) -> Option<Self> {
        let (ex, tk) = s.split_once(':')?;
        if ex.is_empty() || tk.is_empty() {
            return None;
        }
        Some(SymbolId::new(ex, tk))
    }

    pub fn exchange(&self) -> &str {
        self.0.split_once(':').map(|(e, _)| e).unwrap_or("")
    }

    pub fn ticker(&self) -> &str {
        self.0.split_once(':').map(|(_, t)| t).unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SymbolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SymbolStatus {
    PreListed,
    Trading,
    Break,
    Delisted,
}

impl SymbolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SymbolStatus::PreListed => "PRE_LISTED",
            SymbolStatus::Trading => "TRADING",
            SymbolStatus::Break => "BREAK",
            SymbolStatus::Delisted => "DELISTED",
        }
    }

    /// Tie-break order used by the catalog diff.
    pub fn priority(&self) -> u8 {
        match self {
            SymbolStatus::PreListed => 0,
            SymbolStatus::Trading => 1,
            SymbolStatus::Break => 2,
            SymbolStatus::Delisted => 3,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, SymbolStatus::Break | SymbolStatus::Delisted)
    }

    /// Accepts our own labels plus the spellings MEXC uses on the wire.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PRE_LISTED" | "PRE_TRADING" | "PRE_OPEN" | "PENDING" => Some(SymbolStatus::PreListed),
            "TRADING" | "ENABLED" | "1" => Some(SymbolStatus::Trading),
            "BREAK" | "HALT" | "PAUSE" | "2" => Some(SymbolStatus::Break),
            "DELISTED" | "OFFLINE" | "CLOSED" | "3" => Some(SymbolStatus::Delisted),
            _ => None,
        }
    }
}

impl fmt::Display for SymbolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
    Ioc,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::Ioc => "IOC",
        }
    }

    /// Name used by the MEXC order endpoint and in `orderTypes`.
    pub fn wire_name(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::Ioc => "IMMEDIATE_OR_CANCEL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MARKET" => Some(OrderType::Market),
            "LIMIT" => Some(OrderType::Limit),
            "IOC" | "IMMEDIATE_OR_CANCEL" => Some(OrderType::Ioc),
            _ => None,
        }
    }

    pub fn needs_price(&self) -> bool {
        !matches!(self, OrderType::Market)
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BUY" => Some(Side::Buy),
            "SELL" => Some(Side::Sell),
            _ => None,
        }
    }
}

// ---- Symbol ----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Symbol {
    pub id: SymbolId,
    pub base: String,
    pub quote: String,
    pub status: SymbolStatus,
    pub listing_ts: Option<i64>,
    pub trading_ts: Option<i64>,
    pub price_precision: u32,
    pub qty_precision: u32,
    pub min_qty: Decimal,
    pub max_qty: Decimal,
    pub min_notional: Decimal,
    pub tick_size: Decimal,
    pub step_size: Decimal,
    /// Empty means the exchange did not restrict order types.
    pub allowed_order_types: Vec<OrderType>,
    pub updated_at: i64,
}

impl Symbol {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.tick_size <= Decimal::ZERO {
            return Err(format!("{}: tick_size must be > 0", self.id));
        }
        if self.step_size <= Decimal::ZERO {
            return Err(format!("{}: step_size must be > 0", self.id));
        }
        if self.min_qty > self.max_qty {
            return Err(format!("{}: min_qty {} > max_qty {}", self.id, self.min_qty, self.max_qty));
        }
        if self.min_qty < Decimal::ZERO || self.min_notional < Decimal::ZERO {
            return Err(format!("{}: negative minimums", self.id));
        }
        Ok(())
    }

    pub fn allows(&self, t: OrderType) -> bool {
        self.allowed_order_types.is_empty() || self.allowed_order_types.contains(&t)
    }

    /// Builds a row from a pushed listing. Filters the push omits are derived
    /// from the precisions, the way MEXC defines its grid.
    pub fn from_listing(exchange: &str, raw: &RawListing) -> Symbol {
        let f = raw.filters.clone().unwrap_or_default();
        let price_precision = f.price_precision.unwrap_or(8).min(28);
        let qty_precision = f.qty_precision.unwrap_or(2).min(28);
        let step = f.step_size.unwrap_or_else(|| Decimal::new(1, qty_precision));
        let quote = raw.quote.clone().unwrap_or_else(|| guess_quote(&raw.ticker).to_string());
        let base = raw.base.clone().unwrap_or_else(|| {
            raw.ticker
                .strip_suffix(quote.as_str())
                .unwrap_or(&raw.ticker)
                .to_string()
        });
        Symbol {
            id: SymbolId::new(exchange, &raw.ticker),
            base,
            quote,
            status: raw.status.unwrap_or(SymbolStatus::PreListed),
            listing_ts: raw.listing_ts,
            trading_ts: raw.trading_ts,
            price_precision,
            qty_precision,
            min_qty: f.min_qty.unwrap_or(step),
            max_qty: f.max_qty.unwrap_or_else(|| Decimal::from(9_000_000_000u64)),
            min_notional: f.min_notional.unwrap_or(Decimal::ONE),
            tick_size: f.tick_size.unwrap_or_else(|| Decimal::new(1, price_precision)),
            step_size: step,
            allowed_order_types: Vec::new(),
            updated_at: raw.received_at,
        }
    }
}

fn guess_quote(ticker: &str) -> &'static str {
    for q in ["USDT", "USDC", "BTC", "ETH"] {
        if ticker.len() > q.len() && ticker.ends_with(q) {
            return q;
        }
    }
    "USDT"
}

// ---- Listing events ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ListingKind {
    Discovered,
    TradingOpen,
    StatusChanged(SymbolStatus),
}

impl ListingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingKind::Discovered => "DISCOVERED",
            ListingKind::TradingOpen => "TRADING_OPEN",
            ListingKind::StatusChanged(_) => "STATUS_CHANGED",
        }
    }

    /// Filter key used by bus subscriptions.
    pub fn tag(&self) -> KindTag {
        match self {
            ListingKind::Discovered => KindTag::Discovered,
            ListingKind::TradingOpen => KindTag::TradingOpen,
            ListingKind::StatusChanged(_) => KindTag::StatusChanged,
        }
    }

    pub fn new_status(&self) -> Option<SymbolStatus> {
        match self {
            ListingKind::StatusChanged(s) => Some(*s),
            _ => None,
        }
    }

    /// DISCOVERED before TRADING_OPEN before STATUS_CHANGED.
    pub fn priority(&self) -> u8 {
        match self {
            ListingKind::Discovered => 0,
            ListingKind::TradingOpen => 1,
            ListingKind::StatusChanged(_) => 2,
        }
    }

    pub fn from_parts(kind: &str, status: Option<&str>) -> Option<Self> {
        match kind {
            "DISCOVERED" => Some(ListingKind::Discovered),
            "TRADING_OPEN" => Some(ListingKind::TradingOpen),
            "STATUS_CHANGED" => status.and_then(SymbolStatus::parse).map(ListingKind::StatusChanged),
            _ => None,
        }
    }
}

impl fmt::Display for ListingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListingKind::StatusChanged(s) => write!(f, "STATUS_CHANGED({s})"),
            k => f.write_str(k.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KindTag {
    Discovered,
    TradingOpen,
    StatusChanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Rest,
    Stream,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Rest => "rest",
            Source::Stream => "stream",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "rest" => Some(Source::Rest),
            "stream" => Some(Source::Stream),
            _ => None,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingEvent {
    pub id: u64,
    pub symbol: SymbolId,
    pub kind: ListingKind,
    pub source: Source,
    pub detected_at: i64,
    pub trading_ts: Option<i64>,
    pub payload_hash: String,
}

/// Stable hash over (exchange, ticker, kind, trading-start-ts).
/// The new status is part of the kind for STATUS_CHANGED.
pub fn payload_hash(symbol: &SymbolId, kind: ListingKind, trading_ts: Option<i64>) -> String {
    let kind_label = match kind {
        ListingKind::StatusChanged(s) => format!("STATUS_CHANGED:{}", s.as_str()),
        k => k.as_str().to_string(),
    };
    let mut h = Sha256::new();
    h.update(symbol.exchange().as_bytes());
    h.update(b"|");
    h.update(symbol.ticker().as_bytes());
    h.update(b"|");
    h.update(kind_label.as_bytes());
    h.update(b"|");
    h.update(trading_ts.map(|t| t.to_string()).unwrap_or_default().as_bytes());
    let digest = h.finalize();
    hex::encode(&digest[..16])
}

// ---- Snipe intents ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentState {
    Pending,
    Armed,
    Submitted,
    Filled,
    Failed,
    Cancelled,
}

impl IntentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentState::Pending => "PENDING",
            IntentState::Armed => "ARMED",
            IntentState::Submitted => "SUBMITTED",
            IntentState::Filled => "FILLED",
            IntentState::Failed => "FAILED",
            IntentState::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(IntentState::Pending),
            "ARMED" => Some(IntentState::Armed),
            "SUBMITTED" => Some(IntentState::Submitted),
            "FILLED" => Some(IntentState::Filled),
            "FAILED" => Some(IntentState::Failed),
            "CANCELLED" => Some(IntentState::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, IntentState::Filled | IntentState::Failed | IntentState::Cancelled)
    }
}

impl fmt::Display for IntentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnipeIntent {
    pub id: i64,
    pub symbol: SymbolId,
    pub quote_budget: Decimal,
    pub max_price: Decimal,
    pub order_type: OrderType,
    pub state: IntentState,
    pub client_order_id: Option<String>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl SnipeIntent {
    /// Same id for every attempt of this intent, so the exchange sees one order.
    pub fn derive_client_order_id(&self) -> String {
        client_order_id_for(self.id, &self.symbol)
    }
}

pub fn client_order_id_for(intent_id: i64, symbol: &SymbolId) -> String {
    let name = format!("snipe:{}:{}", intent_id, symbol);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
        .simple()
        .to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewIntent {
    pub symbol: SymbolId,
    pub quote_budget: Decimal,
    pub max_price: Decimal,
    pub order_type: OrderType,
}

// ---- Orders ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NEW" => Some(OrderStatus::New),
            "PARTIALLY_FILLED" => Some(OrderStatus::PartiallyFilled),
            "FILLED" => Some(OrderStatus::Filled),
            "CANCELED" | "CANCELLED" | "PARTIALLY_CANCELED" => Some(OrderStatus::Cancelled),
            "REJECTED" => Some(OrderStatus::Rejected),
            "EXPIRED" => Some(OrderStatus::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
    pub symbol: SymbolId,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: Decimal,
    pub price: Option<Decimal>,
    pub status: OrderStatus,
    pub executed_qty: Decimal,
    pub executed_quote_qty: Decimal,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Order {
    pub fn from_ack(req: &OrderReq, symbol: &SymbolId, ack: &OrderAck) -> Order {
        let now = now_ms();
        Order {
            id: Uuid::new_v4(),
            client_order_id: req.client_order_id.clone(),
            exchange_order_id: ack.exchange_order_id.clone(),
            symbol: symbol.clone(),
            side: req.side,
            order_type: req.order_type,
            qty: req.qty,
            price: req.price,
            status: ack.status,
            executed_qty: ack.executed_qty.min(req.qty),
            executed_quote_qty: ack.executed_quote_qty,
            created_at: now,
            updated_at: now,
        }
    }

    /// Row for a placement the exchange never acknowledged: refused
    /// (`Rejected`) or given up on after retries (`Expired`).
    pub fn unplaced(req: &OrderReq, symbol: &SymbolId, status: OrderStatus) -> Order {
        let now = now_ms();
        Order {
            id: Uuid::new_v4(),
            client_order_id: req.client_order_id.clone(),
            exchange_order_id: None,
            symbol: symbol.clone(),
            side: req.side,
            order_type: req.order_type,
            qty: req.qty,
            price: req.price,
            status,
            executed_qty: Decimal::ZERO,
            executed_quote_qty: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_fully_filled(&self) -> bool {
        self.status == OrderStatus::Filled || (self.qty > Decimal::ZERO && self.executed_qty >= self.qty)
    }
}

// ---- Gateway payloads ----

#[derive(Debug, Clone, PartialEq)]
pub struct Ticker {
    pub ticker: String,
    pub price: Decimal,
    pub ts: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PriceLevel {
    pub price: Decimal,
    pub qty: Decimal,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct OrderBook {
    pub ticker: String,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub ts: i64,
}

impl OrderBook {
    pub fn best_ask(&self) -> Option<&PriceLevel> {
        self.asks.first()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderReq {
    pub ticker: String,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: Decimal,
    pub price: Option<Decimal>,
    pub client_order_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    pub ticker: String,
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
    pub status: OrderStatus,
    pub orig_qty: Decimal,
    pub executed_qty: Decimal,
    pub executed_quote_qty: Decimal,
    pub ts: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawListingKind {
    NewListing,
    StatusChange,
    TradingOpen,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListingFilters {
    pub price_precision: Option<u32>,
    pub qty_precision: Option<u32>,
    pub min_qty: Option<Decimal>,
    pub max_qty: Option<Decimal>,
    pub min_notional: Option<Decimal>,
    pub tick_size: Option<Decimal>,
    pub step_size: Option<Decimal>,
}

/// One message from the listing push stream, already decoded from the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct RawListing {
    pub kind: RawListingKind,
    pub ticker: String,
    pub base: Option<String>,
    pub quote: Option<String>,
    pub status: Option<SymbolStatus>,
    pub listing_ts: Option<i64>,
    pub trading_ts: Option<i64>,
    pub filters: Option<ListingFilters>,
    pub received_at: i64,
}

impl RawListing {
    pub fn new_listing(ticker: &str, base: &str, quote: &str, trading_ts: Option<i64>) -> Self {
        RawListing {
            kind: RawListingKind::NewListing,
            ticker: ticker.to_ascii_uppercase(),
            base: Some(base.to_string()),
            quote: Some(quote.to_string()),
            status: Some(SymbolStatus::PreListed),
            listing_ts: None,
            trading_ts,
            filters: None,
            received_at: now_ms(),
        }
    }

    pub fn status_change(ticker: &str, status: SymbolStatus) -> Self {
        RawListing {
            kind: RawListingKind::StatusChange,
            ticker: ticker.to_ascii_uppercase(),
            base: None,
            quote: None,
            status: Some(status),
            listing_ts: None,
            trading_ts: None,
            filters: None,
            received_at: now_ms(),
        }
    }
}

/// Parses a decimal the way exchanges print them ("0.00010000", "1e-4").
pub fn parse_decimal(s: &str) -> Option<Decimal> {
    let s = s.trim();
    Decimal::from_str(s)
        .or_else(|_| Decimal::from_scientific(s))
        .ok()
}
