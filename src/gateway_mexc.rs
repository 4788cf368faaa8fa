// ===============================
// src/gateway_mexc.rs
// ===============================
//
// MEXC spot gateway: signed REST v3 + public websocket listing push.
// Every REST call takes a rate-limit token first and runs under the
// caller's deadline. A credential rejection turns signing off until
// an operator calls `rekey`.
//
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant as StdInstant;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::Method;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::{Backoff, BackoffPolicy};
use crate::codec::{decode_frame, CHANNEL_NEW_LISTINGS, CHANNEL_SYMBOL_STATUS};
use crate::config::GatewayCfg;
use crate::domain::{now_ms, OrderAck, OrderBook, OrderReq, RawListing, Symbol, Ticker, EXCHANGE_MEXC};
use crate::error::{ErrorKind, GatewayError};
use crate::gateway::{CallCtx, ExchangeGateway, GatewayResult};
use crate::metrics::{AUTH_FAILURES, GW_LATENCY, GW_REQUESTS, STREAM_CONNECTED, STREAM_MESSAGES, STREAM_RECONNECTS};
use crate::mexc::{
    parse_error_body, signed_query, canonical_query, Account, Depth, ExchangeInfo, OrderRsp, ServerTime,
    TickerPrice, API_KEY_HEADER,
};
use crate::ratelimit::RateLimiter;

const PING_EVERY: Duration = Duration::from_secs(20);
const ORDER_NOT_FOUND: i64 = -2013;

#[derive(Clone, Default)]
struct Credentials {
    api_key: String,
    api_secret: String,
}

pub struct MexcGateway {
    exchange: String,
    rest_url: String,
    ws_url: String,
    recv_window_ms: u64,
    reconnect: BackoffPolicy,
    http: reqwest::Client,
    limiter: RateLimiter,
    creds: RwLock<Credentials>,
    signing_disabled: AtomicBool,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl MexcGateway {
    pub fn new(cfg: GatewayCfg, shutdown: CancellationToken) -> GatewayResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| GatewayError::InvalidRequest(format!("http client: {e}")))?;
        Ok(MexcGateway {
            exchange: EXCHANGE_MEXC.to_string(),
            rest_url: cfg.rest_url.trim_end_matches('/').to_string(),
            ws_url: cfg.ws_url.clone(),
            recv_window_ms: cfg.recv_window_ms,
            reconnect: cfg.reconnect.clone(),
            http,
            limiter: RateLimiter::new(cfg.rate_rpm, cfg.rate_burst),
            creds: RwLock::new(Credentials {
                api_key: cfg.api_key.clone().unwrap_or_default(),
                api_secret: cfg.api_secret.clone().unwrap_or_default(),
            }),
            signing_disabled: AtomicBool::new(false),
            connected: Arc::new(AtomicBool::new(false)),
            shutdown,
        })
    }

    pub fn signing_enabled(&self) -> bool {
        !self.signing_disabled.load(Ordering::Acquire)
    }

    fn credentials(&self) -> Credentials {
        match self.creds.read() {
            Ok(c) => c.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn disable_signing(&self, op: &str, err: &GatewayError) {
        if !self.signing_disabled.swap(true, Ordering::AcqRel) {
            AUTH_FAILURES.inc();
            error!(alert = "auth_failed", op, ?err, "MEXC rejected credentials, signed calls disabled until re-keyed");
        }
    }

    /// One REST round trip. Returns the body of a 2xx response.
    async fn call(
        &self,
        ctx: &CallCtx,
        op: &'static str,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        signed: bool,
    ) -> GatewayResult<String> {
        let started = StdInstant::now();
        let res = self.call_inner(ctx, op, method, path, params, signed).await;
        GW_LATENCY.observe(started.elapsed().as_secs_f64() * 1000.0);
        let outcome = match &res {
            Ok(_) => "ok",
            Err(e) => e.kind().as_str(),
        };
        GW_REQUESTS.with_label_values(&[op, outcome]).inc();
        res
    }

    async fn call_inner(
        &self,
        ctx: &CallCtx,
        op: &'static str,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        signed: bool,
    ) -> GatewayResult<String> {
        if signed && !self.signing_enabled() {
            return Err(GatewayError::SigningDisabled);
        }
        self.limiter.acquire(ctx.deadline, &ctx.cancel).await?;

        let creds = self.credentials();
        let query = if signed {
            signed_query(params, &creds.api_secret, now_ms(), self.recv_window_ms)?
        } else {
            canonical_query(params)
        };
        let url = if query.is_empty() {
            format!("{}{}", self.rest_url, path)
        } else {
            format!("{}{}?{}", self.rest_url, path, query)
        };

        let mut req = self.http.request(method, url).timeout(ctx.remaining());
        if signed {
            req = req
                .header(API_KEY_HEADER, creds.api_key.as_str())
                .header(reqwest::header::CONTENT_TYPE, "application/json");
        }

        let (status, body) = ctx
            .run(async {
                let rsp = req.send().await?;
                let status = rsp.status().as_u16();
                let body = rsp.text().await?;
                Ok((status, body))
            })
            .await?;

        if (200..300).contains(&status) {
            return Ok(body);
        }
        let (code, msg) = parse_error_body(&body);
        let err = GatewayError::Http { status, code, msg };
        if signed && err.kind() == ErrorKind::AuthFailed {
            self.disable_signing(op, &err);
            return Err(GatewayError::AuthFailed(err.to_string()));
        }
        debug!(op, ?err, "MEXC call failed");
        Err(err)
    }

    fn decode<T: DeserializeOwned>(body: &str) -> GatewayResult<T> {
        serde_json::from_str(body).map_err(|e| GatewayError::Decode(e.to_string()))
    }
}

fn is_order_not_found(err: &GatewayError) -> bool {
    match err {
        GatewayError::Http { code: Some(c), .. } if *c == ORDER_NOT_FOUND => true,
        GatewayError::Http { status: 400, msg, .. } => msg.to_ascii_lowercase().contains("not exist"),
        _ => false,
    }
}

#[async_trait]
impl ExchangeGateway for MexcGateway {
    fn exchange(&self) -> &str {
        &self.exchange
    }

    async fn exchange_info(&self, ctx: &CallCtx) -> GatewayResult<Vec<Symbol>> {
        let body = self.call(ctx, "exchange_info", Method::GET, "/api/v3/exchangeInfo", &[], false).await?;
        let info: ExchangeInfo = Self::decode(&body)?;
        let now = now_ms();
        let mut out = Vec::with_capacity(info.symbols.len());
        let mut skipped = 0usize;
        for s in &info.symbols {
            match s.to_symbol(&self.exchange, now) {
                Ok(sym) => out.push(sym),
                Err(reason) => {
                    skipped += 1;
                    debug!(%reason, "skipping symbol");
                }
            }
        }
        if skipped > 0 {
            warn!(skipped, kept = out.len(), "exchangeInfo entries failed validation");
        }
        Ok(out)
    }

    async fn ticker(&self, ctx: &CallCtx, ticker: &str) -> GatewayResult<Ticker> {
        let params = [("symbol", ticker.to_string())];
        let body = self.call(ctx, "ticker", Method::GET, "/api/v3/ticker/price", &params, false).await?;
        Self::decode::<TickerPrice>(&body)?.to_ticker(now_ms())
    }

    async fn order_book(&self, ctx: &CallCtx, ticker: &str, depth: u32) -> GatewayResult<OrderBook> {
        let params = [("symbol", ticker.to_string()), ("limit", depth.max(1).to_string())];
        let body = self.call(ctx, "order_book", Method::GET, "/api/v3/depth", &params, false).await?;
        Ok(Self::decode::<Depth>(&body)?.to_book(ticker, now_ms()))
    }

    async fn place_order(&self, ctx: &CallCtx, req: &OrderReq) -> GatewayResult<OrderAck> {
        let mut params = vec![
            ("symbol", req.ticker.clone()),
            ("side", req.side.as_str().to_string()),
            ("type", req.order_type.wire_name().to_string()),
            ("quantity", req.qty.normalize().to_string()),
        ];
        if let Some(px) = req.price {
            params.push(("price", px.normalize().to_string()));
        } else if req.order_type.needs_price() {
            return Err(GatewayError::InvalidRequest(format!("{} order needs a price", req.order_type)));
        }
        params.push(("newClientOrderId", req.client_order_id.clone()));

        let body = self.call(ctx, "place_order", Method::POST, "/api/v3/order", &params, true).await?;
        let mut ack = Self::decode::<OrderRsp>(&body)?.to_ack(&req.client_order_id, now_ms());
        if ack.ticker.is_empty() {
            ack.ticker = req.ticker.clone();
        }
        if ack.orig_qty.is_zero() {
            ack.orig_qty = req.qty;
        }
        Ok(ack)
    }

    async fn cancel_order(&self, ctx: &CallCtx, ticker: &str, client_order_id: &str) -> GatewayResult<()> {
        let params = [("symbol", ticker.to_string()), ("origClientOrderId", client_order_id.to_string())];
        self.call(ctx, "cancel_order", Method::DELETE, "/api/v3/order", &params, true).await?;
        Ok(())
    }

    async fn query_order(
        &self,
        ctx: &CallCtx,
        ticker: &str,
        client_order_id: &str,
    ) -> GatewayResult<Option<OrderAck>> {
        let params = [("symbol", ticker.to_string()), ("origClientOrderId", client_order_id.to_string())];
        match self.call(ctx, "query_order", Method::GET, "/api/v3/order", &params, true).await {
            Ok(body) => Ok(Some(Self::decode::<OrderRsp>(&body)?.to_ack(client_order_id, now_ms()))),
            Err(e) if is_order_not_found(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn free_balance(&self, ctx: &CallCtx, asset: &str) -> GatewayResult<Decimal> {
        let body = self.call(ctx, "account", Method::GET, "/api/v3/account", &[], true).await?;
        Ok(Self::decode::<Account>(&body)?.free(asset))
    }

    async fn server_time(&self, ctx: &CallCtx) -> GatewayResult<i64> {
        let body = self.call(ctx, "server_time", Method::GET, "/api/v3/time", &[], false).await?;
        Ok(Self::decode::<ServerTime>(&body)?.server_time)
    }

    async fn subscribe_listings(&self, cancel: CancellationToken) -> GatewayResult<mpsc::Receiver<RawListing>> {
        let (tx, rx) = mpsc::channel(1024);
        let stream = ListingStream {
            ws_url: self.ws_url.clone(),
            topics: vec![CHANNEL_NEW_LISTINGS.to_string(), CHANNEL_SYMBOL_STATUS.to_string()],
            reconnect: self.reconnect.clone(),
            connected: self.connected.clone(),
        };
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move { stream.run(tx, cancel, shutdown).await });
        Ok(rx)
    }

    fn stream_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn rekey(&self, api_key: String, api_secret: String) {
        match self.creds.write() {
            Ok(mut c) => *c = Credentials { api_key, api_secret },
            Err(poisoned) => *poisoned.into_inner() = Credentials { api_key, api_secret },
        }
        self.signing_disabled.store(false, Ordering::Release);
        info!("MEXC credentials replaced, signed calls enabled");
    }

    async fn close(&self) {
        self.shutdown.cancel();
        self.connected.store(false, Ordering::Relaxed);
        STREAM_CONNECTED.set(0);
    }
}

// =====================================================================
// Listing push stream
// =====================================================================

struct ListingStream {
    ws_url: String,
    topics: Vec<String>,
    reconnect: BackoffPolicy,
    connected: Arc<AtomicBool>,
}

enum SessionEnd {
    /// Cancelled or nobody is reading anymore.
    Stop,
    Dropped,
}

impl ListingStream {
    fn set_connected(&self, up: bool) {
        self.connected.store(up, Ordering::Relaxed);
        STREAM_CONNECTED.set(up as i64);
    }

    async fn run(self, tx: mpsc::Sender<RawListing>, cancel: CancellationToken, shutdown: CancellationToken) {
        let mut backoff = Backoff::new(self.reconnect.clone());
        loop {
            if cancel.is_cancelled() || shutdown.is_cancelled() {
                break;
            }
            info!(ws_url = %self.ws_url, "connecting MEXC listing stream");
            let end = tokio::select! {
                _ = cancel.cancelled() => SessionEnd::Stop,
                _ = shutdown.cancelled() => SessionEnd::Stop,
                end = self.session(&tx, &mut backoff) => end,
            };
            self.set_connected(false);
            if matches!(end, SessionEnd::Stop) {
                break;
            }

            let delay = backoff.next_delay();
            STREAM_RECONNECTS.inc();
            warn!(attempt = backoff.attempt(), delay_ms = delay.as_millis() as u64, "listing stream down, reconnecting");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = shutdown.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }
        self.set_connected(false);
        info!("listing stream stopped");
    }

    async fn session(&self, tx: &mpsc::Sender<RawListing>, backoff: &mut Backoff) -> SessionEnd {
        let mut ws = match connect_async(self.ws_url.as_str()).await {
            Ok((ws, _resp)) => ws,
            Err(e) => {
                error!(?e, "listing stream connect failed");
                return SessionEnd::Dropped;
            }
        };

        // resubscribe everything on every connect
        let sub = serde_json::json!({ "method": "SUBSCRIPTION", "params": self.topics });
        if let Err(e) = ws.send(Message::Text(sub.to_string())).await {
            error!(?e, "listing stream subscribe failed");
            return SessionEnd::Dropped;
        }
        self.set_connected(true);
        backoff.reset();
        info!(topics = ?self.topics, "listing stream connected");

        let mut ping = interval(PING_EVERY);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ping.tick().await;

        loop {
            let frame = tokio::select! {
                _ = ping.tick() => {
                    let ping_msg = serde_json::json!({ "method": "PING" }).to_string();
                    if let Err(e) = ws.send(Message::Text(ping_msg)).await {
                        warn!(?e, "listing stream ping failed");
                        return SessionEnd::Dropped;
                    }
                    continue;
                }
                frame = ws.next() => frame,
            };

            match frame {
                Some(Ok(Message::Binary(bytes))) => match decode_frame(&bytes) {
                    Ok(msgs) => {
                        let received_at = now_ms();
                        for m in msgs {
                            let Some(raw) = m.to_raw(received_at) else {
                                continue;
                            };
                            STREAM_MESSAGES.inc();
                            if tx.send(raw).await.is_err() {
                                return SessionEnd::Stop;
                            }
                        }
                    }
                    Err(e) => warn!(?e, len = bytes.len(), "undecodable listing frame"),
                },
                Some(Ok(Message::Text(txt))) => debug!(%txt, "listing stream control message"),
                Some(Ok(Message::Ping(payload))) => {
                    let _ = ws.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(reason))) => {
                    info!(?reason, "listing stream closed by server");
                    return SessionEnd::Dropped;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(?e, "listing stream read error");
                    return SessionEnd::Dropped;
                }
                None => return SessionEnd::Dropped,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_frame, PushWrapper};
    use crate::config::GatewayMode;
    use crate::domain::{OrderStatus, OrderType, RawListingKind, Side};
    use mockito::Matcher;
    use rust_decimal_macros::dec;
    use tokio::net::TcpListener;

    fn cfg(rest_url: &str, ws_url: &str) -> GatewayCfg {
        GatewayCfg {
            mode: GatewayMode::Mexc,
            rest_url: rest_url.to_string(),
            ws_url: ws_url.to_string(),
            api_key: Some("key".into()),
            api_secret: Some("secret".into()),
            recv_window_ms: 5000,
            timeout: Duration::from_secs(2),
            rate_rpm: 1200,
            rate_burst: 20,
            reconnect: BackoffPolicy::new(Duration::from_millis(50), Duration::from_millis(200), 2.0, 0.0),
            mock_quote_balance: Decimal::ZERO,
            mock_demo_every: None,
        }
    }

    fn ctx() -> CallCtx {
        CallCtx::new(&CancellationToken::new(), Duration::from_secs(2))
    }

    #[tokio::test]
    async fn place_order_is_signed() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("POST", Matcher::Regex("^/api/v3/order".into()))
            .match_header("X-MEXC-APIKEY", "key")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("symbol".into(), "FOOUSDT".into()),
                Matcher::UrlEncoded("type".into(), "LIMIT".into()),
                Matcher::UrlEncoded("price".into(), "0.0123".into()),
                Matcher::UrlEncoded("newClientOrderId".into(), "cid1".into()),
                Matcher::Regex("signature=[0-9a-f]{64}".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"symbol":"FOOUSDT","orderId":"C02__1","clientOrderId":"cid1","status":"NEW"}"#)
            .create_async()
            .await;

        let gw = MexcGateway::new(cfg(&server.url(), "ws://127.0.0.1:1"), CancellationToken::new()).expect("gw");
        let req = OrderReq {
            ticker: "FOOUSDT".into(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            qty: dec!(100),
            price: Some(dec!(0.01230)),
            client_order_id: "cid1".into(),
        };
        let ack = gw.place_order(&ctx(), &req).await.expect("ack");
        assert_eq!(ack.exchange_order_id.as_deref(), Some("C02__1"));
        assert_eq!(ack.status, OrderStatus::New);
        assert_eq!(ack.orig_qty, dec!(100));
        m.assert_async().await;
    }

    #[tokio::test]
    async fn credential_rejection_disables_signing_until_rekey() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("GET", Matcher::Regex("^/api/v3/account".into()))
            .with_status(400)
            .with_body(r#"{"code":700002,"msg":"Signature for this request is not valid."}"#)
            .expect(1)
            .create_async()
            .await;

        let gw = MexcGateway::new(cfg(&server.url(), "ws://127.0.0.1:1"), CancellationToken::new()).expect("gw");
        let err = gw.free_balance(&ctx(), "USDT").await.unwrap_err();
        assert!(matches!(err, GatewayError::AuthFailed(_)));
        assert!(!gw.signing_enabled());

        // never reaches the server
        let err = gw.free_balance(&ctx(), "USDT").await.unwrap_err();
        assert!(matches!(err, GatewayError::SigningDisabled));
        m.assert_async().await;

        gw.rekey("key2".into(), "secret2".into());
        assert!(gw.signing_enabled());
    }

    #[tokio::test]
    async fn unknown_order_is_none() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", Matcher::Regex("^/api/v3/order".into()))
            .with_status(400)
            .with_body(r#"{"code":-2013,"msg":"Order does not exist."}"#)
            .create_async()
            .await;

        let gw = MexcGateway::new(cfg(&server.url(), "ws://127.0.0.1:1"), CancellationToken::new()).expect("gw");
        let got = gw.query_order(&ctx(), "FOOUSDT", "nope").await.expect("query");
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", Matcher::Regex("^/api/v3/ticker/price".into()))
            .with_status(503)
            .with_body("upstream unavailable")
            .create_async()
            .await;

        let gw = MexcGateway::new(cfg(&server.url(), "ws://127.0.0.1:1"), CancellationToken::new()).expect("gw");
        let err = gw.ticker(&ctx(), "FOOUSDT").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(err.is_ambiguous());
        assert!(gw.signing_enabled());
    }

    #[tokio::test]
    async fn exchange_info_skips_invalid_entries() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v3/exchangeInfo")
            .with_status(200)
            .with_body(
                r#"{"timezone":"CST","symbols":[
                    {"symbol":"FOOUSDT","status":"1","baseAsset":"FOO","quoteAsset":"USDT",
                     "baseAssetPrecision":2,"quotePrecision":4,"quoteAmountPrecision":"5"},
                    {"symbol":"BADUSDT","status":"1","baseAsset":"BAD","quoteAsset":"USDT"}
                ]}"#,
            )
            .create_async()
            .await;

        let gw = MexcGateway::new(cfg(&server.url(), "ws://127.0.0.1:1"), CancellationToken::new()).expect("gw");
        let symbols = gw.exchange_info(&ctx()).await.expect("info");
        assert_eq!(symbols.len(), 1);
        assert_eq!(symbols[0].id.as_str(), "MEXC:FOOUSDT");
        assert_eq!(symbols[0].step_size, dec!(0.01));
    }

    #[tokio::test]
    async fn stream_subscribes_and_decodes_pushes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.expect("accept");
            let mut ws = tokio_tungstenite::accept_async(tcp).await.expect("handshake");
            let sub = ws.next().await.expect("frame").expect("ok");
            let txt = sub.into_text().expect("text");
            assert!(txt.contains("SUBSCRIPTION"));
            assert!(txt.contains(CHANNEL_NEW_LISTINGS));
            let frame = encode_frame(&[PushWrapper::new_listing("NEWUSDT", "NEW", "USDT", Some(42))]);
            ws.send(Message::Binary(frame)).await.expect("send");
            // keep the socket open until the client goes away
            while let Some(Ok(_)) = ws.next().await {}
        });

        let shutdown = CancellationToken::new();
        let gw = MexcGateway::new(cfg("http://127.0.0.1:1", &format!("ws://{addr}")), shutdown.clone()).expect("gw");
        let cancel = CancellationToken::new();
        let mut rx = gw.subscribe_listings(cancel.clone()).await.expect("subscribe");

        let raw = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("in time")
            .expect("message");
        assert_eq!(raw.kind, RawListingKind::NewListing);
        assert_eq!(raw.ticker, "NEWUSDT");
        assert_eq!(raw.trading_ts, Some(42));
        assert!(gw.stream_connected());

        cancel.cancel();
        let end = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.expect("closed in time");
        assert!(end.is_none());
        server.abort();
    }
}
