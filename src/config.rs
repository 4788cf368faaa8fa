// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : listing_sniper — new-listing detection & sniper execution in Rust
Module  : <module_name>.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Detects new MEXC listings from a polled REST catalog and a push
          stream, deduplicates them, fans them out on an in-process bus and
          places one-shot buy orders under exchange filters and risk gates.
=============================================================================
*/
use std::env;
use std::str::FromStr;
use std::time::Duration;

use dotenvy::dotenv;
use rust_decimal::Decimal;
use thiserror::Error;
use url::Url;

use crate::backoff::BackoffPolicy;
use crate::domain::OrderType;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{key}: invalid value {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("{0} is required")]
    Missing(&'static str),
}

/// Venue yang dipakai: mock in-memory atau MEXC asli
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GatewayMode {
    Mock,
    Mexc,
}

impl GatewayMode {
    pub fn parse(s: &str) -> Option<GatewayMode> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mock" => Some(GatewayMode::Mock),
            "mexc" | "mexc_mainnet" => Some(GatewayMode::Mexc),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayMode::Mock => "mock",
            GatewayMode::Mexc => "mexc",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Clone, Debug)]
pub struct GatewayCfg {
    pub mode: GatewayMode,
    pub rest_url: String,
    pub ws_url: String,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub recv_window_ms: u64,
    pub timeout: Duration,
    pub rate_rpm: u32,
    pub rate_burst: u32,
    pub reconnect: BackoffPolicy,
    pub mock_quote_balance: Decimal,
    pub mock_demo_every: Option<Duration>,
}

#[derive(Clone, Debug)]
pub struct SniperCfg {
    pub workers: usize,
    pub retry: BackoffPolicy,
    pub max_attempts: u32,
    pub poll_interval: Duration,
    pub price_guard: bool,
    pub allow_pre_listed: bool,
    pub resume_on_restart: bool,
    /// A per-symbol lane with no job for this long stops.
    pub lane_idle: Duration,
}

impl Default for SniperCfg {
    fn default() -> Self {
        Self {
            workers: 16,
            retry: BackoffPolicy::retry_default(),
            max_attempts: 5,
            poll_interval: Duration::from_millis(1000),
            price_guard: true,
            allow_pre_listed: false,
            resume_on_restart: true,
            lane_idle: Duration::from_secs(300),
        }
    }
}

/// Rule that creates an intent for every discovered symbol quoted in one
/// of `quote_assets`.
#[derive(Clone, Debug, PartialEq)]
pub struct AutoSnipeCfg {
    pub quote_assets: Vec<String>,
    pub quote_budget: Decimal,
    pub max_price: Decimal,
    pub order_type: OrderType,
}

impl AutoSnipeCfg {
    pub fn matches_quote(&self, quote: &str) -> bool {
        self.quote_assets.iter().any(|q| q.eq_ignore_ascii_case(quote))
    }
}

#[derive(Clone, Debug)]
pub struct Args {
    // catalog / detector
    pub refresh_interval: Duration,
    pub refresh_baseline_on_empty: bool,
    pub dedup_window: Duration,
    pub dedup_lru_size: usize,
    pub bus_subscriber_queue: usize,

    pub gateway: GatewayCfg,
    pub sniper: SniperCfg,
    pub auto_snipe: Option<AutoSnipeCfg>,

    // storage
    pub database_url: String,
    pub db_max_connections: u32,
    pub db_min_connections: u32,

    // files/metrics
    pub record_file: Option<String>,
    pub metrics_port: u16,
    pub shutdown_drain: Duration,
    pub log_format: LogFormat,
}

/// Batas risk (dalam quote asset, mis. USDT)
#[derive(Clone, Debug, PartialEq)]
pub struct Limits {
    pub max_position_quote: Decimal,
    pub max_symbol_quote: Decimal,
    pub max_daily_loss_quote: Decimal,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_position_quote: Decimal::from(1000),
            max_symbol_quote: Decimal::from(500),
            max_daily_loss_quote: Decimal::from(200),
        }
    }
}

pub const MIN_LRU_SIZE: usize = 10_000;

pub fn load() -> Result<(Args, Limits), ConfigError> {
    // Pastikan .env dibaca (agar MEXC_API_KEY, DATABASE_URL, dll ter-load)
    let _ = dotenv();
    load_from(|k| env::var(k).ok())
}

/// Same as `load` but reads keys through `lookup` (tests pass a map).
pub fn load_from<F>(lookup: F) -> Result<(Args, Limits), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let r = Reader { lookup: &lookup };

    // ===== Catalog / detector / bus =====
    let refresh_interval_sec: u64 = r.parse("REFRESH_INTERVAL_SEC", 60)?;
    let refresh_baseline_on_empty = r.flag("REFRESH_BASELINE_ON_EMPTY", true)?;
    let dedup_window_hours: u64 = r.parse("DEDUP_WINDOW_HOURS", 24)?;
    let dedup_lru_size: usize = r.parse("DEDUP_LRU_SIZE", MIN_LRU_SIZE)?;
    let bus_subscriber_queue: usize = r.parse("BUS_SUBSCRIBER_QUEUE", 1024)?;

    // ===== Gateway =====
    let mode = match r.get("GATEWAY_MODE") {
        Some(v) => GatewayMode::parse(&v).ok_or(ConfigError::Invalid {
            key: "GATEWAY_MODE",
            value: v.clone(),
            reason: "expected mock|mexc".into(),
        })?,
        None => GatewayMode::Mock,
    };
    let rest_url = r.get("MEXC_REST_URL").unwrap_or_else(|| "https://api.mexc.com".to_string());
    let ws_url = r.get("MEXC_WS_URL").unwrap_or_else(|| "wss://wbs.mexc.com/ws".to_string());
    let reconnect = BackoffPolicy::new(
        Duration::from_secs(r.parse("GATEWAY_STREAM_RECONNECT_INITIAL_SEC", 1)?),
        Duration::from_secs(r.parse("GATEWAY_STREAM_RECONNECT_CAP_SEC", 60)?),
        2.0,
        r.parse("GATEWAY_STREAM_RECONNECT_JITTER", 0.2)?,
    );
    let demo_sec: u64 = r.parse("MOCK_DEMO_LISTING_SEC", 0)?;
    let gateway = GatewayCfg {
        mode,
        rest_url,
        ws_url,
        api_key: r.get("MEXC_API_KEY").filter(|s| !s.is_empty()),
        api_secret: r.get("MEXC_API_SECRET").filter(|s| !s.is_empty()),
        recv_window_ms: r.parse("MEXC_RECV_WINDOW", 5000)?,
        timeout: Duration::from_millis(r.parse("GATEWAY_TIMEOUT_MS", 5000)?),
        rate_rpm: r.parse("GATEWAY_RATE_RPM", 1200)?,
        rate_burst: r.parse("GATEWAY_RATE_BURST", 20)?,
        reconnect,
        mock_quote_balance: r.parse("MOCK_QUOTE_BALANCE", Decimal::from(10_000))?,
        mock_demo_every: (demo_sec > 0).then(|| Duration::from_secs(demo_sec)),
    };

    // ===== Sniper =====
    let retry = BackoffPolicy::new(
        Duration::from_millis(r.parse("SNIPER_RETRY_INITIAL_MS", 200)?),
        Duration::from_millis(r.parse("SNIPER_RETRY_CAP_MS", 5000)?),
        r.parse("SNIPER_RETRY_FACTOR", 2.0)?,
        r.parse("SNIPER_RETRY_JITTER", 0.2)?,
    );
    let sniper = SniperCfg {
        workers: r.parse("SNIPER_WORKERS", 16)?,
        retry,
        max_attempts: r.parse("SNIPER_RETRY_MAX_ATTEMPTS", 5)?,
        poll_interval: Duration::from_millis(r.parse("SNIPER_POLL_INTERVAL_MS", 1000)?),
        price_guard: r.flag("SNIPER_PRICE_GUARD", true)?,
        allow_pre_listed: r.flag("SNIPER_ALLOW_PRE_LISTED", false)?,
        resume_on_restart: r.flag("SNIPER_RESUME_ON_RESTART", true)?,
        lane_idle: Duration::from_secs(r.parse("SNIPER_LANE_IDLE_SEC", 300)?),
    };

    // ===== Auto-snipe (rule-created intents) =====
    let auto_snipe = if r.flag("AUTO_SNIPE_ENABLED", false)? {
        let order_type = match r.get("AUTO_SNIPE_ORDER_TYPE") {
            Some(v) if !v.is_empty() => OrderType::parse(&v).ok_or(ConfigError::Invalid {
                key: "AUTO_SNIPE_ORDER_TYPE",
                value: v.clone(),
                reason: "expected market|limit|ioc".into(),
            })?,
            _ => OrderType::Market,
        };
        Some(AutoSnipeCfg {
            quote_assets: r
                .get("AUTO_SNIPE_QUOTE_ASSETS")
                .unwrap_or_else(|| "USDT".to_string())
                .split(',')
                .map(|q| q.trim().to_ascii_uppercase())
                .filter(|q| !q.is_empty())
                .collect(),
            quote_budget: r.parse("AUTO_SNIPE_BUDGET_QUOTE", Decimal::from(10))?,
            max_price: match r.get("AUTO_SNIPE_MAX_PRICE") {
                Some(v) if !v.is_empty() => r.parse("AUTO_SNIPE_MAX_PRICE", Decimal::ZERO)?,
                _ => return Err(ConfigError::Missing("AUTO_SNIPE_MAX_PRICE")),
            },
            order_type,
        })
    } else {
        None
    };

    let log_format = match r.get("LOG_FORMAT").map(|s| s.to_ascii_lowercase()) {
        Some(ref s) if s == "json" => LogFormat::Json,
        _ => LogFormat::Pretty,
    };

    let args = Args {
        refresh_interval: Duration::from_secs(refresh_interval_sec),
        refresh_baseline_on_empty,
        dedup_window: Duration::from_secs(dedup_window_hours * 3600),
        dedup_lru_size,
        bus_subscriber_queue,
        gateway,
        sniper,
        auto_snipe,
        database_url: r.get("DATABASE_URL").unwrap_or_else(|| "sqlite://sniper.db".to_string()),
        db_max_connections: r.parse("DB_MAX_CONNECTIONS", 8)?,
        db_min_connections: r.parse("DB_MIN_CONNECTIONS", 1)?,
        record_file: r.get("RECORD_FILE").filter(|s| !s.is_empty()),
        metrics_port: r.parse("METRICS_PORT", 9898)?,
        shutdown_drain: Duration::from_secs(r.parse("SHUTDOWN_DRAIN_SEC", 30)?),
        log_format,
    };

    // ===== Limits =====
    let defaults = Limits::default();
    let limits = Limits {
        max_position_quote: r.parse("RISK_MAX_POSITION_QUOTE", defaults.max_position_quote)?,
        max_symbol_quote: r.parse("RISK_MAX_SYMBOL_QUOTE", defaults.max_symbol_quote)?,
        max_daily_loss_quote: r.parse("RISK_MAX_DAILY_LOSS_QUOTE", defaults.max_daily_loss_quote)?,
    };

    validate(&args)?;
    Ok((args, limits))
}

fn validate(a: &Args) -> Result<(), ConfigError> {
    fn bad(key: &'static str, value: impl ToString, reason: &str) -> ConfigError {
        ConfigError::Invalid { key, value: value.to_string(), reason: reason.to_string() }
    }

    if a.refresh_interval.is_zero() {
        return Err(bad("REFRESH_INTERVAL_SEC", 0, "must be > 0"));
    }
    if a.dedup_lru_size < MIN_LRU_SIZE {
        return Err(bad("DEDUP_LRU_SIZE", a.dedup_lru_size, "must be >= 10000"));
    }
    if a.bus_subscriber_queue == 0 {
        return Err(bad("BUS_SUBSCRIBER_QUEUE", 0, "must be > 0"));
    }
    if a.sniper.workers == 0 {
        return Err(bad("SNIPER_WORKERS", 0, "must be > 0"));
    }
    if a.sniper.max_attempts == 0 {
        return Err(bad("SNIPER_RETRY_MAX_ATTEMPTS", 0, "must be > 0"));
    }
    if a.sniper.retry.factor < 1.0 {
        return Err(bad("SNIPER_RETRY_FACTOR", a.sniper.retry.factor, "must be >= 1"));
    }
    for (key, j) in [
        ("SNIPER_RETRY_JITTER", a.sniper.retry.jitter),
        ("GATEWAY_STREAM_RECONNECT_JITTER", a.gateway.reconnect.jitter),
    ] {
        if !(0.0..1.0).contains(&j) {
            return Err(bad(key, j, "must be in [0, 1)"));
        }
    }
    if a.gateway.rate_rpm == 0 || a.gateway.rate_burst == 0 {
        return Err(bad("GATEWAY_RATE_RPM", a.gateway.rate_rpm, "rpm and burst must be > 0"));
    }
    if a.db_min_connections > a.db_max_connections || a.db_max_connections == 0 {
        return Err(bad("DB_MAX_CONNECTIONS", a.db_max_connections, "must be > 0 and >= DB_MIN_CONNECTIONS"));
    }
    if a.sniper.lane_idle.is_zero() {
        return Err(bad("SNIPER_LANE_IDLE_SEC", 0, "must be > 0"));
    }
    if let Some(auto) = &a.auto_snipe {
        if auto.quote_budget <= Decimal::ZERO {
            return Err(bad("AUTO_SNIPE_BUDGET_QUOTE", auto.quote_budget, "must be > 0"));
        }
        if auto.max_price <= Decimal::ZERO {
            return Err(bad("AUTO_SNIPE_MAX_PRICE", auto.max_price, "must be > 0"));
        }
        if auto.quote_assets.is_empty() {
            return Err(bad("AUTO_SNIPE_QUOTE_ASSETS", "", "needs at least one asset"));
        }
    }
    Url::parse(&a.gateway.rest_url).map_err(|e| bad("MEXC_REST_URL", &a.gateway.rest_url, &e.to_string()))?;
    Url::parse(&a.gateway.ws_url).map_err(|e| bad("MEXC_WS_URL", &a.gateway.ws_url, &e.to_string()))?;

    if a.gateway.mode == GatewayMode::Mexc {
        if a.gateway.api_key.is_none() {
            return Err(ConfigError::Missing("MEXC_API_KEY"));
        }
        if a.gateway.api_secret.is_none() {
            return Err(ConfigError::Missing("MEXC_API_SECRET"));
        }
    }
    Ok(())
}

struct Reader<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<'a, F: Fn(&str) -> Option<String>> Reader<'a, F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).map(|s| s.trim().to_string())
    }

    fn parse<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(v) if v.is_empty() => Ok(default),
            Some(v) => v.parse::<T>().map_err(|e| ConfigError::Invalid {
                key,
                value: v.clone(),
                reason: e.to_string(),
            }),
        }
    }

    fn flag(&self, key: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.get(key).map(|s| s.to_ascii_lowercase()) {
            None => Ok(default),
            Some(v) => match v.as_str() {
                "" => Ok(default),
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::Invalid { key, value: v, reason: "expected a boolean".into() }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ahash::AHashMap as HashMap;
    use rust_decimal_macros::dec;

    fn load_map(pairs: &[(&str, &str)]) -> Result<(Args, Limits), ConfigError> {
        let m: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        load_from(|k| m.get(k).cloned())
    }

    #[test]
    fn defaults_match_documented_values() {
        let (a, l) = load_map(&[]).expect("defaults load");
        assert_eq!(a.refresh_interval, Duration::from_secs(60));
        assert_eq!(a.dedup_window, Duration::from_secs(24 * 3600));
        assert_eq!(a.dedup_lru_size, 10_000);
        assert_eq!(a.bus_subscriber_queue, 1024);
        assert_eq!(a.sniper.workers, 16);
        assert_eq!(a.sniper.max_attempts, 5);
        assert_eq!(a.sniper.retry, BackoffPolicy::retry_default());
        assert_eq!(a.gateway.reconnect, BackoffPolicy::stream_default());
        assert_eq!(a.gateway.mode, GatewayMode::Mock);
        assert_eq!(a.shutdown_drain, Duration::from_secs(30));
        assert_eq!(l.max_symbol_quote, dec!(500));
    }

    #[test]
    fn overrides_are_parsed() {
        let (a, l) = load_map(&[
            ("REFRESH_INTERVAL_SEC", "15"),
            ("SNIPER_RETRY_INITIAL_MS", "50"),
            ("SNIPER_RETRY_JITTER", "0.1"),
            ("SNIPER_PRICE_GUARD", "off"),
            ("GATEWAY_RATE_BURST", "5"),
            ("RISK_MAX_SYMBOL_QUOTE", "250.5"),
            ("LOG_FORMAT", "JSON"),
        ])
        .expect("load");
        assert_eq!(a.refresh_interval, Duration::from_secs(15));
        assert_eq!(a.sniper.retry.initial, Duration::from_millis(50));
        assert!(!a.sniper.price_guard);
        assert_eq!(a.gateway.rate_burst, 5);
        assert_eq!(l.max_symbol_quote, dec!(250.5));
        assert_eq!(a.log_format, LogFormat::Json);
    }

    #[test]
    fn rejects_bad_values() {
        let err = load_map(&[("SNIPER_WORKERS", "lots")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "SNIPER_WORKERS", .. }));

        let err = load_map(&[("DEDUP_LRU_SIZE", "100")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "DEDUP_LRU_SIZE", .. }));

        let err = load_map(&[("SNIPER_RETRY_JITTER", "1.5")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "SNIPER_RETRY_JITTER", .. }));
    }

    #[test]
    fn auto_snipe_rule() {
        let (a, _) = load_map(&[]).expect("load");
        assert_eq!(a.auto_snipe, None);

        let err = load_map(&[("AUTO_SNIPE_ENABLED", "true")]).unwrap_err();
        assert_eq!(err, ConfigError::Missing("AUTO_SNIPE_MAX_PRICE"));

        let (a, _) = load_map(&[
            ("AUTO_SNIPE_ENABLED", "1"),
            ("AUTO_SNIPE_QUOTE_ASSETS", "usdt, usdc"),
            ("AUTO_SNIPE_BUDGET_QUOTE", "25"),
            ("AUTO_SNIPE_MAX_PRICE", "0.5"),
            ("AUTO_SNIPE_ORDER_TYPE", "ioc"),
        ])
        .expect("load");
        let auto = a.auto_snipe.expect("enabled");
        assert_eq!(auto.quote_assets, vec!["USDT".to_string(), "USDC".to_string()]);
        assert_eq!(auto.quote_budget, dec!(25));
        assert_eq!(auto.max_price, dec!(0.5));
        assert_eq!(auto.order_type, OrderType::Ioc);
        assert!(auto.matches_quote("usdc"));
        assert!(!auto.matches_quote("BTC"));

        let err = load_map(&[("AUTO_SNIPE_ENABLED", "1"), ("AUTO_SNIPE_MAX_PRICE", "-1")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "AUTO_SNIPE_MAX_PRICE", .. }));
    }

    #[test]
    fn mexc_mode_needs_credentials() {
        let err = load_map(&[("GATEWAY_MODE", "mexc")]).unwrap_err();
        assert_eq!(err, ConfigError::Missing("MEXC_API_KEY"));

        let (a, _) = load_map(&[
            ("GATEWAY_MODE", "mexc"),
            ("MEXC_API_KEY", "k"),
            ("MEXC_API_SECRET", "s"),
        ])
        .expect("load");
        assert_eq!(a.gateway.mode, GatewayMode::Mexc);
    }
}
