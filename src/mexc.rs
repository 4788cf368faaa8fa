// ===============================
// src/mexc.rs
// ===============================
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;

use crate::domain::{
    parse_decimal, OrderAck, OrderBook, OrderStatus, OrderType, PriceLevel, Symbol, SymbolId,
    SymbolStatus, Ticker,
};
use crate::error::GatewayError;

pub const API_KEY_HEADER: &str = "X-MEXC-APIKEY";

pub fn sign_query(secret: &str, query: &str) -> Result<String, GatewayError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| GatewayError::InvalidRequest(format!("HMAC key: {e}")))?;
    mac.update(query.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// `k=v&k=v` in the order given, values percent-encoded.
pub fn canonical_query(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Appends `timestamp` and `recvWindow`, then the signature over everything before it.
pub fn signed_query(
    params: &[(&str, String)],
    secret: &str,
    timestamp_ms: i64,
    recv_window_ms: u64,
) -> Result<String, GatewayError> {
    let mut all: Vec<(&str, String)> = params.to_vec();
    all.push(("recvWindow", recv_window_ms.to_string()));
    all.push(("timestamp", timestamp_ms.to_string()));
    let query = canonical_query(&all);
    let sig = sign_query(secret, &query)?;
    Ok(format!("{query}&signature={sig}"))
}

// ---- REST models ----

#[derive(Debug, Deserialize)]
pub struct ErrorBody {
    pub code: Option<i64>,
    #[serde(default)]
    pub msg: String,
}

/// Splits an error response body into MEXC `{code,msg}` when possible.
pub fn parse_error_body(body: &str) -> (Option<i64>, String) {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(e) => (e.code, if e.msg.is_empty() { body.to_string() } else { e.msg }),
        Err(_) => (None, body.chars().take(256).collect()),
    }
}

#[derive(Debug, Deserialize)]
pub struct ServerTime {
    #[serde(rename = "serverTime")]
    pub server_time: i64,
}

#[derive(Debug, Deserialize)]
pub struct ExchangeInfo {
    #[serde(default)]
    pub symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInfo {
    pub symbol: String,
    #[serde(default)]
    pub status: Option<Value>,
    #[serde(default)]
    pub base_asset: String,
    #[serde(default)]
    pub quote_asset: String,
    #[serde(default)]
    pub base_asset_precision: Option<u32>,
    #[serde(default)]
    pub quote_precision: Option<u32>,
    #[serde(default)]
    pub base_size_precision: Option<String>,
    #[serde(default)]
    pub quote_amount_precision: Option<String>,
    #[serde(default)]
    pub order_types: Vec<String>,
    #[serde(default)]
    pub filters: Vec<Value>,
    #[serde(default, alias = "listingTime")]
    pub listing_ts: Option<i64>,
    #[serde(default, alias = "tradingStartTime", alias = "openTime")]
    pub trading_ts: Option<i64>,
}

fn filter_field(filters: &[Value], filter_type: &[&str], field: &str) -> Option<Decimal> {
    filters
        .iter()
        .filter(|f| {
            f.get("filterType")
                .and_then(|t| t.as_str())
                .map_or(false, |t| filter_type.contains(&t))
        })
        .find_map(|f| value_decimal(f.get(field)?))
}

fn value_decimal(v: &Value) -> Option<Decimal> {
    match v {
        Value::String(s) => parse_decimal(s),
        Value::Number(n) => parse_decimal(&n.to_string()),
        _ => None,
    }
}

fn value_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn unit(precision: u32) -> Decimal {
    Decimal::new(1, precision.min(28))
}

impl SymbolInfo {
    pub fn to_symbol(&self, exchange: &str, now: i64) -> Result<Symbol, String> {
        let status = self
            .status
            .as_ref()
            .and_then(value_string)
            .and_then(|s| SymbolStatus::parse(&s))
            .ok_or_else(|| format!("{}: unknown status {:?}", self.symbol, self.status))?;

        let tick = filter_field(&self.filters, &["PRICE_FILTER"], "tickSize")
            .or_else(|| self.quote_precision.map(unit))
            .ok_or_else(|| format!("{}: no tick size", self.symbol))?;
        let step = filter_field(&self.filters, &["LOT_SIZE"], "stepSize")
            .or_else(|| self.base_size_precision.as_deref().and_then(parse_decimal))
            .filter(|d| *d > Decimal::ZERO)
            .or_else(|| self.base_asset_precision.map(unit))
            .ok_or_else(|| format!("{}: no step size", self.symbol))?;
        let min_qty = filter_field(&self.filters, &["LOT_SIZE"], "minQty").unwrap_or(step);
        let max_qty = filter_field(&self.filters, &["LOT_SIZE"], "maxQty")
            .unwrap_or_else(|| Decimal::from(9_000_000_000u64));
        let min_notional = filter_field(&self.filters, &["MIN_NOTIONAL", "NOTIONAL"], "minNotional")
            .or_else(|| self.quote_amount_precision.as_deref().and_then(parse_decimal))
            .unwrap_or(Decimal::ZERO);

        let symbol = Symbol {
            id: SymbolId::new(exchange, &self.symbol),
            base: self.base_asset.clone(),
            quote: self.quote_asset.clone(),
            status,
            listing_ts: self.listing_ts,
            trading_ts: self.trading_ts,
            price_precision: self.quote_precision.unwrap_or_else(|| tick.normalize().scale()),
            qty_precision: self.base_asset_precision.unwrap_or_else(|| step.normalize().scale()),
            min_qty,
            max_qty,
            min_notional,
            tick_size: tick,
            step_size: step,
            allowed_order_types: self.order_types.iter().filter_map(|t| OrderType::parse(t)).collect(),
            updated_at: now,
        };
        symbol.validate()?;
        Ok(symbol)
    }
}

#[derive(Debug, Deserialize)]
pub struct TickerPrice {
    pub symbol: String,
    pub price: String,
}

impl TickerPrice {
    pub fn to_ticker(&self, now: i64) -> Result<Ticker, GatewayError> {
        let price = parse_decimal(&self.price)
            .ok_or_else(|| GatewayError::Decode(format!("ticker price {:?}", self.price)))?;
        Ok(Ticker { ticker: self.symbol.clone(), price, ts: now })
    }
}

#[derive(Debug, Deserialize)]
pub struct Depth {
    #[serde(default)]
    pub bids: Vec<Vec<Value>>,
    #[serde(default)]
    pub asks: Vec<Vec<Value>>,
}

impl Depth {
    pub fn to_book(&self, ticker: &str, now: i64) -> OrderBook {
        let levels = |side: &[Vec<Value>]| -> Vec<PriceLevel> {
            side.iter()
                .filter_map(|lvl| {
                    let price = value_decimal(lvl.first()?)?;
                    let qty = value_decimal(lvl.get(1)?)?;
                    Some(PriceLevel { price, qty })
                })
                .collect()
        };
        OrderBook {
            ticker: ticker.to_string(),
            bids: levels(&self.bids),
            asks: levels(&self.asks),
            ts: now,
        }
    }
}

/// Response of POST/GET `/api/v3/order`. Placement returns a subset.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRsp {
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub order_id: Option<Value>,
    #[serde(default)]
    pub client_order_id: Option<String>,
    #[serde(default)]
    pub orig_qty: Option<String>,
    #[serde(default)]
    pub executed_qty: Option<String>,
    #[serde(default, alias = "cumulativeQuoteQty")]
    pub cummulative_quote_qty: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub transact_time: Option<i64>,
    #[serde(default)]
    pub update_time: Option<i64>,
}

impl OrderRsp {
    pub fn to_ack(&self, fallback_client_id: &str, now: i64) -> OrderAck {
        let dec = |s: &Option<String>| s.as_deref().and_then(parse_decimal).unwrap_or(Decimal::ZERO);
        OrderAck {
            ticker: self.symbol.clone(),
            client_order_id: self
                .client_order_id
                .clone()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| fallback_client_id.to_string()),
            exchange_order_id: self.order_id.as_ref().and_then(value_string),
            status: self
                .status
                .as_deref()
                .and_then(OrderStatus::parse)
                .unwrap_or(OrderStatus::New),
            orig_qty: dec(&self.orig_qty),
            executed_qty: dec(&self.executed_qty),
            executed_quote_qty: dec(&self.cummulative_quote_qty),
            ts: self.update_time.or(self.transact_time).unwrap_or(now),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Account {
    #[serde(default)]
    pub balances: Vec<Balance>,
}

#[derive(Debug, Deserialize)]
pub struct Balance {
    pub asset: String,
    pub free: String,
}

impl Account {
    pub fn free(&self, asset: &str) -> Decimal {
        self.balances
            .iter()
            .find(|b| b.asset.eq_ignore_ascii_case(asset))
            .and_then(|b| parse_decimal(&b.free))
            .unwrap_or(Decimal::ZERO)
    }
}
