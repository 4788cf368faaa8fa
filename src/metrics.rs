// ===============================
// src/metrics.rs
// ===============================
use std::convert::Infallible;
use std::net::SocketAddr;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::health::HealthStatus;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Detector --------
pub static EVENTS_ACCEPTED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("listing_events_accepted_total", "listing events delivered to the bus"),
        &["kind", "source"],
    )
    .unwrap()
});

pub static EVENTS_SUPPRESSED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("listing_events_suppressed_total", "duplicate listing events dropped"),
        &["source"],
    )
    .unwrap()
});

pub static DETECTOR_TRACKED: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("detector_tracked_symbols", "symbols in the detector state machine").unwrap());

// -------- Bus --------
pub static BUS_PUBLISHED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("bus_published_total", "events accepted by the bus").unwrap());

pub static BUS_DROPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("bus_dropped_total", "events dropped on subscriber queue overflow"),
        &["subscriber"],
    )
    .unwrap()
});

pub static HANDLER_PANICS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("handler_panics_total", "panics caught at a worker root"),
        &["worker"],
    )
    .unwrap()
});

pub static DEAD_LETTERS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("dead_letters_total", "events moved to dead letters").unwrap());

// -------- Catalog --------
pub static CATALOG_REFRESHES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("catalog_refresh_total", "catalog refreshes by outcome"),
        &["outcome"],
    )
    .unwrap()
});

pub static CATALOG_SYMBOLS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("catalog_symbols", "symbols in the current snapshot").unwrap());

pub static CATALOG_ADDED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("catalog_symbols_added_total", "Symbol.Added emitted").unwrap());

// -------- Gateway --------
pub static GW_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("gateway_requests_total", "gateway calls (labels: op, outcome)"),
        &["op", "outcome"],
    )
    .unwrap()
});

pub static GW_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(HistogramOpts::new(
        "gateway_request_latency_ms",
        "REST round trip (ms)",
    ))
    .unwrap()
});

pub static RATE_LIMIT_WAITS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("gateway_rate_limit_waits_total", "calls that waited for a token").unwrap());

pub static STREAM_CONNECTED: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("stream_connected", "1 if the listing stream is connected").unwrap());

pub static STREAM_RECONNECTS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("stream_reconnects_total", "listing stream reconnects").unwrap());

pub static STREAM_MESSAGES: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("stream_messages_total", "decoded listing stream messages").unwrap());

pub static CLOCK_SKEW_MS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("clock_skew_ms", "local clock minus exchange clock (ms)").unwrap());

pub static AUTH_FAILURES: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("auth_failures_total", "signed calls rejected for credentials").unwrap());

// -------- Sniper --------
pub static ORDERS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("orders_total", "orders recorded by status"),
        &["status"],
    )
    .unwrap()
});

pub static PLACE_RETRIES: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("place_order_retries_total", "PlaceOrder retries after transient errors").unwrap());

pub static INTENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("snipe_intents_total", "intent transitions by target state"),
        &["state"],
    )
    .unwrap()
});

// Latency from TRADING_OPEN detection -> ack (milliseconds)
pub static LAT_OPEN_ACK: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(HistogramOpts::new(
        "latency_open_to_ack_ms",
        "Latency from TRADING_OPEN detection to order ack (ms)",
    ))
    .unwrap()
});

// -------- Health / config --------
pub static HEALTH: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("component_health", "1 healthy, 0 degraded"),
        &["component"],
    )
    .unwrap()
});

pub static CONFIG_GATEWAY_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_gateway_mode", "gateway mode (label: mode)"),
        &["mode"],
    )
    .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(EVENTS_ACCEPTED.clone())),
        REGISTRY.register(Box::new(EVENTS_SUPPRESSED.clone())),
        REGISTRY.register(Box::new(DETECTOR_TRACKED.clone())),
        REGISTRY.register(Box::new(BUS_PUBLISHED.clone())),
        REGISTRY.register(Box::new(BUS_DROPPED.clone())),
        REGISTRY.register(Box::new(HANDLER_PANICS.clone())),
        REGISTRY.register(Box::new(DEAD_LETTERS.clone())),
        REGISTRY.register(Box::new(CATALOG_REFRESHES.clone())),
        REGISTRY.register(Box::new(CATALOG_SYMBOLS.clone())),
        REGISTRY.register(Box::new(CATALOG_ADDED.clone())),
        REGISTRY.register(Box::new(GW_REQUESTS.clone())),
        REGISTRY.register(Box::new(GW_LATENCY.clone())),
        REGISTRY.register(Box::new(RATE_LIMIT_WAITS.clone())),
        REGISTRY.register(Box::new(STREAM_CONNECTED.clone())),
        REGISTRY.register(Box::new(STREAM_RECONNECTS.clone())),
        REGISTRY.register(Box::new(STREAM_MESSAGES.clone())),
        REGISTRY.register(Box::new(CLOCK_SKEW_MS.clone())),
        REGISTRY.register(Box::new(AUTH_FAILURES.clone())),
        REGISTRY.register(Box::new(ORDERS.clone())),
        REGISTRY.register(Box::new(PLACE_RETRIES.clone())),
        REGISTRY.register(Box::new(INTENTS.clone())),
        REGISTRY.register(Box::new(LAT_OPEN_ACK.clone())),
        REGISTRY.register(Box::new(HEALTH.clone())),
        REGISTRY.register(Box::new(CONFIG_GATEWAY_MODE.clone())),
    ] {
        // already registered on a second init() is fine
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

fn respond(req: &Request<Body>, health: &watch::Receiver<HealthStatus>) -> Response<Body> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/") | (&Method::GET, "/metrics") => {
            let mut rsp = Response::new(Body::from(encode_metrics()));
            if let Ok(v) = "text/plain; version=0.0.4; charset=utf-8".parse() {
                rsp.headers_mut().insert(hyper::header::CONTENT_TYPE, v);
            }
            rsp
        }
        (&Method::GET, "/health") => {
            let status = *health.borrow();
            let mut rsp = Response::new(Body::from(status.as_str()));
            if status != HealthStatus::Healthy {
                *rsp.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
            }
            rsp
        }
        _ => {
            let mut rsp = Response::new(Body::from("not found"));
            *rsp.status_mut() = StatusCode::NOT_FOUND;
            rsp
        }
    }
}

/// Serves `/metrics` and `/health` until `cancel` fires.
pub async fn serve_metrics(port: u16, health: watch::Receiver<HealthStatus>, cancel: CancellationToken) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let make_svc = make_service_fn(move |_conn| {
        let health = health.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let rsp = respond(&req, &health);
                async move { Ok::<_, Infallible>(rsp) }
            }))
        }
    });

    let builder = match Server::try_bind(&addr) {
        Ok(b) => b,
        Err(e) => {
            error!(?e, %addr, "metrics bind failed");
            return;
        }
    };
    info!("metrics listening on http://{addr}/metrics (and /health)");
    let server = builder
        .serve(make_svc)
        .with_graceful_shutdown(async move { cancel.cancelled().await });
    if let Err(e) = server.await {
        error!(?e, "metrics server error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_registered_metrics() {
        init();
        init();
        BUS_PUBLISHED.inc();
        let text = String::from_utf8(encode_metrics()).expect("utf8");
        assert!(text.contains("bus_published_total"));
    }

    #[test]
    fn health_endpoint_reflects_status() {
        let (tx, rx) = watch::channel(HealthStatus::Healthy);
        let req = Request::get("/health").body(Body::empty()).expect("request");
        assert_eq!(respond(&req, &rx).status(), StatusCode::OK);

        let _ = tx.send(HealthStatus::Degraded);
        let req = Request::get("/health").body(Body::empty()).expect("request");
        assert_eq!(respond(&req, &rx).status(), StatusCode::SERVICE_UNAVAILABLE);

        let req = Request::get("/nope").body(Body::empty()).expect("request");
        assert_eq!(respond(&req, &rx).status(), StatusCode::NOT_FOUND);
    }
}
