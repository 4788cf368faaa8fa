// ===============================
// src/detector.rs
// ===============================
//
// Listing Detector: one task merges catalog changes (REST) and the push
// stream into deduplicated ListingEvents and hands them to the bus.
// The task owns the per-symbol state machine and the dedup LRU; other
// components ask it questions through `DetectorHandle`.
//
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap as HashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::catalog::{Catalog, CatalogEvent, SymbolChange};
use crate::dedup::DedupCache;
use crate::domain::{
    now_ms, payload_hash, ListingEvent, ListingKind, RawListing, RawListingKind, Source, Symbol, SymbolId,
    SymbolStatus,
};
use crate::error::Result;
use crate::gateway::ExchangeGateway;
use crate::health::Activity;
use crate::metrics::{DETECTOR_TRACKED, EVENTS_ACCEPTED, EVENTS_SUPPRESSED};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Discovered,
    Open,
    Closed(SymbolStatus),
}

impl Phase {
    /// Where a symbol already in the catalog starts after a restart.
    pub fn from_status(status: SymbolStatus) -> Phase {
        match status {
            SymbolStatus::PreListed => Phase::Discovered,
            SymbolStatus::Trading => Phase::Open,
            s => Phase::Closed(s),
        }
    }
}

/// One normalized sighting of a symbol, from either source or the open timer.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub symbol: SymbolId,
    pub status: Option<SymbolStatus>,
    pub trading_ts: Option<i64>,
    /// The source said trading is open, whatever the status field says.
    pub explicit_open: bool,
    pub source: Source,
    pub timer: bool,
    /// When the source saw it: stream receive time, or fetch time for REST.
    pub observed_at: i64,
}

impl Observation {
    pub fn from_symbol(s: &Symbol, source: Source) -> Self {
        Observation {
            symbol: s.id.clone(),
            status: Some(s.status),
            trading_ts: s.trading_ts,
            explicit_open: false,
            source,
            timer: false,
            observed_at: now_ms(),
        }
    }

    pub fn from_raw(exchange: &str, raw: &RawListing) -> Self {
        let open = raw.kind == RawListingKind::TradingOpen;
        Observation {
            symbol: SymbolId::new(exchange, &raw.ticker),
            status: if open { Some(SymbolStatus::Trading) } else { raw.status },
            trading_ts: raw.trading_ts,
            explicit_open: open,
            source: Source::Stream,
            timer: false,
            observed_at: raw.received_at,
        }
    }
}

/// Per-symbol state machine. `prev == None` is UNKNOWN. Returns the next
/// phase and the events to emit, in DISCOVERED, TRADING_OPEN,
/// STATUS_CHANGED order.
pub fn transition(
    prev: Option<Phase>,
    obs: &Observation,
    trading_ts: Option<i64>,
    now: i64,
) -> (Phase, Vec<ListingKind>) {
    let mut out = Vec::new();
    let mut phase = match prev {
        Some(p) => p,
        None => {
            out.push(ListingKind::Discovered);
            Phase::Discovered
        }
    };

    if let Some(s) = obs.status.filter(|s| s.is_closed()) {
        if phase != Phase::Closed(s) {
            out.push(ListingKind::StatusChanged(s));
            phase = Phase::Closed(s);
        }
        return (phase, out);
    }

    let said_open = obs.explicit_open || obs.status == Some(SymbolStatus::Trading);
    let due = trading_ts.map_or(false, |t| now >= t);
    match phase {
        Phase::Discovered if said_open || due || obs.timer => {
            out.push(ListingKind::TradingOpen);
            phase = Phase::Open;
        }
        // a reopened market is a status change, not a second listing
        Phase::Closed(_) if said_open => {
            out.push(ListingKind::StatusChanged(SymbolStatus::Trading));
            phase = Phase::Open;
        }
        _ => {}
    }
    (phase, out)
}

#[derive(Debug, Clone, Copy)]
struct Tracked {
    phase: Phase,
    trading_ts: Option<i64>,
    source: Source,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectorStats {
    pub accepted: u64,
    pub suppressed: u64,
    pub tracked: usize,
    pub stream_connected: bool,
    pub last_activity_ms: i64,
}

enum Query {
    Seen { hash: String, reply: oneshot::Sender<bool> },
    Stats(oneshot::Sender<DetectorStats>),
}

/// Request/response access to the detector task.
#[derive(Clone)]
pub struct DetectorHandle {
    tx: mpsc::Sender<Query>,
}

impl DetectorHandle {
    /// None once the detector has stopped.
    pub async fn seen(&self, hash: &str) -> Option<bool> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Query::Seen { hash: hash.to_string(), reply }).await.ok()?;
        rx.await.ok()
    }

    pub async fn stats(&self) -> Option<DetectorStats> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Query::Stats(reply)).await.ok()?;
        rx.await.ok()
    }
}

#[derive(Debug, Clone)]
pub struct DetectorCfg {
    pub window: Duration,
    pub lru_size: usize,
}

pub struct Detector {
    window_ms: i64,
    store: Store,
    catalog: Arc<Catalog>,
    bus: Arc<EventBus>,
    gw: Arc<dyn ExchangeGateway>,
    activity: Activity,
    dedup: DedupCache,
    states: HashMap<SymbolId, Tracked>,
    timers: BinaryHeap<Reverse<(i64, SymbolId)>>,
    next_id: u64,
    accepted: u64,
    suppressed: u64,
    query_tx: mpsc::Sender<Query>,
    query_rx: Option<mpsc::Receiver<Query>>,
}

impl Detector {
    /// Rebuilds state from the catalog and the persisted dedup snapshot.
    pub async fn new(
        cfg: DetectorCfg,
        store: Store,
        catalog: Arc<Catalog>,
        bus: Arc<EventBus>,
        gw: Arc<dyn ExchangeGateway>,
        activity: Activity,
    ) -> Result<Self> {
        let window_ms = i64::try_from(cfg.window.as_millis()).unwrap_or(i64::MAX);
        let now = now_ms();
        let mut dedup = DedupCache::new(cfg.lru_size, window_ms);
        let restored = store.load_dedup_snapshot(now.saturating_sub(window_ms)).await?;
        let restored_len = restored.len();
        dedup.restore(restored);

        let next_id = store.max_event_id().await?;
        let (query_tx, query_rx) = mpsc::channel(64);
        let mut det = Detector {
            window_ms,
            store,
            catalog,
            bus,
            gw,
            activity,
            dedup,
            states: HashMap::new(),
            timers: BinaryHeap::new(),
            next_id,
            accepted: 0,
            suppressed: 0,
            query_tx,
            query_rx: Some(query_rx),
        };
        let adopted = det.adopt_catalog(now);
        info!(symbols = adopted, dedup_restored = restored_len, next_id, "detector state rebuilt");
        Ok(det)
    }

    pub fn handle(&self) -> DetectorHandle {
        DetectorHandle { tx: self.query_tx.clone() }
    }

    // silently track catalog symbols we have no state for (restart, baseline)
    fn adopt_catalog(&mut self, now: i64) -> usize {
        let snap = self.catalog.snapshot();
        let mut adopted = 0;
        for s in snap.symbols.values() {
            if self.states.contains_key(&s.id) {
                continue;
            }
            let phase = Phase::from_status(s.status);
            self.states.insert(s.id.clone(), Tracked { phase, trading_ts: s.trading_ts, source: Source::Rest });
            if phase == Phase::Discovered {
                if let Some(ts) = s.trading_ts {
                    self.timers.push(Reverse((ts.max(now), s.id.clone())));
                }
            }
            adopted += 1;
        }
        DETECTOR_TRACKED.set(self.states.len() as i64);
        adopted
    }

    fn stats(&self) -> DetectorStats {
        DetectorStats {
            accepted: self.accepted,
            suppressed: self.suppressed,
            tracked: self.states.len(),
            stream_connected: self.gw.stream_connected(),
            last_activity_ms: self.activity.last_ms(),
        }
    }

    fn suppress(&mut self, symbol: &SymbolId, source: Source, why: &str) {
        self.suppressed += 1;
        EVENTS_SUPPRESSED.with_label_values(&[source.as_str()]).inc();
        debug!(%symbol, %source, why, "listing observation suppressed");
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers.peek().map(|Reverse((ts, _))| {
            let wait = (*ts - now_ms()).max(0) as u64;
            Instant::now() + Duration::from_millis(wait)
        })
    }

    /// Runs until `cancel` fires and hands back the dedup cache for persisting.
    pub async fn run(
        mut self,
        catalog_rx: mpsc::Receiver<CatalogEvent>,
        stream_rx: Option<mpsc::Receiver<RawListing>>,
        cancel: CancellationToken,
    ) -> DedupCache {
        let mut catalog_rx = Some(catalog_rx);
        let mut stream_rx = stream_rx;
        let mut queries = self.query_rx.take();
        if stream_rx.is_none() {
            warn!("detector running without the listing stream, REST only");
        }
        info!("detector started");

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                q = recv_opt(&mut queries) => match q {
                    Some(q) => self.answer(q),
                    None => queries = None,
                },
                ev = recv_opt(&mut catalog_rx) => match ev {
                    Some(ev) => self.on_catalog(ev).await,
                    None => {
                        warn!("catalog channel closed");
                        catalog_rx = None;
                    }
                },
                raw = recv_opt(&mut stream_rx) => match raw {
                    Some(raw) => self.on_stream(raw).await,
                    None => {
                        warn!("listing stream ended, continuing on REST only");
                        stream_rx = None;
                    }
                },
                _ = sleep_opt(deadline) => self.fire_timers().await,
            }
        }

        self.dedup.purge_expired(now_ms());
        info!(
            accepted = self.accepted,
            suppressed = self.suppressed,
            dedup = self.dedup.len(),
            "detector stopped"
        );
        self.dedup
    }

    fn answer(&self, q: Query) {
        match q {
            Query::Seen { hash, reply } => {
                let _ = reply.send(self.dedup.contains(&hash, now_ms()));
            }
            Query::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
        }
    }

    async fn on_catalog(&mut self, ev: CatalogEvent) {
        self.activity.touch();
        match ev {
            CatalogEvent::Changed(change) => {
                let obs = Observation::from_symbol(change.symbol(), Source::Rest);
                if let SymbolChange::StatusChanged { from, .. } = &change {
                    debug!(symbol = %obs.symbol, %from, "REST status transition");
                }
                self.observe(obs, None).await;
            }
            CatalogEvent::RefreshCompleted { symbols } => {
                let now = now_ms();
                let adopted = self.adopt_catalog(now);
                let purged = self.dedup.purge_expired(now);
                debug!(symbols, adopted, purged, "refresh completed");
            }
        }
    }

    async fn on_stream(&mut self, raw: RawListing) {
        self.activity.touch();
        let obs = Observation::from_raw(self.catalog_exchange(), &raw);
        let unknown = self.catalog.get(&obs.symbol).is_none();
        let new_symbol = unknown.then(|| {
            let mut s = Symbol::from_listing(obs.symbol.exchange(), &raw);
            if obs.explicit_open {
                s.status = SymbolStatus::Trading;
            }
            s
        });
        self.observe(obs, new_symbol).await;
    }

    fn catalog_exchange(&self) -> &str {
        self.gw.exchange()
    }

    async fn fire_timers(&mut self) {
        let now = now_ms();
        let mut due = Vec::new();
        // the head is due by construction, the tokio clock decided that
        if let Some(Reverse((ts, id))) = self.timers.pop() {
            let cutoff = ts.max(now);
            due.push((ts, id));
            while let Some(Reverse((ts, _))) = self.timers.peek() {
                if *ts > cutoff {
                    break;
                }
                if let Some(Reverse(entry)) = self.timers.pop() {
                    due.push(entry);
                }
            }
        }
        for (ts, id) in due {
            let Some(t) = self.states.get(&id).copied() else {
                continue;
            };
            if t.phase != Phase::Discovered || t.trading_ts.map_or(false, |cur| cur > ts) {
                continue;
            }
            self.activity.touch();
            let obs = Observation {
                symbol: id,
                status: None,
                trading_ts: t.trading_ts,
                explicit_open: false,
                source: t.source,
                timer: true,
                observed_at: now,
            };
            self.observe(obs, None).await;
        }
    }

    async fn observe(&mut self, obs: Observation, new_symbol: Option<Symbol>) {
        let now = now_ms();
        let prev = self.states.get(&obs.symbol).copied();
        let trading_ts = obs.trading_ts.or(prev.and_then(|t| t.trading_ts));
        let (phase, kinds) = transition(prev.map(|t| t.phase), &obs, trading_ts, now);

        let source = prev.map_or(obs.source, |t| t.source);
        self.states.insert(obs.symbol.clone(), Tracked { phase, trading_ts, source });
        DETECTOR_TRACKED.set(self.states.len() as i64);
        if phase == Phase::Discovered {
            if let Some(ts) = trading_ts.filter(|ts| *ts > now) {
                let changed = prev.map_or(true, |t| t.trading_ts != Some(ts) || t.phase != Phase::Discovered);
                if changed {
                    debug!(symbol = %obs.symbol, trading_ts = ts, "open timer armed");
                    self.timers.push(Reverse((ts, obs.symbol.clone())));
                }
            }
        }

        if kinds.is_empty() {
            if !obs.timer {
                self.suppress(&obs.symbol, obs.source, "no state change");
            }
            return;
        }

        // the executor reads the catalog when the event lands, so it goes first
        if let Some(sym) = new_symbol {
            let id = sym.id.clone();
            match self.catalog.upsert_symbol(sym).await {
                Ok(()) => info!(symbol = %id, "stream-first symbol added to catalog"),
                Err(e) => warn!(symbol = %id, error = %e, "failed to store stream-first symbol"),
            }
            let catalog = self.catalog.clone();
            tokio::spawn(async move {
                if let Err(e) = catalog.refresh().await {
                    debug!(error = %e, "on-demand refresh failed");
                }
            });
        }

        // Both feeds are drained by this one task, so the first observation
        // processed takes the DISCOVERED tag. detected_at keeps the time the
        // source itself saw the listing.
        let detected_at = if obs.observed_at > 0 { obs.observed_at.min(now) } else { now };
        for kind in kinds {
            self.emit(&obs.symbol, kind, obs.source, trading_ts, detected_at, now).await;
        }
    }

    async fn emit(
        &mut self,
        symbol: &SymbolId,
        kind: ListingKind,
        source: Source,
        trading_ts: Option<i64>,
        detected_at: i64,
        now: i64,
    ) {
        let hash = payload_hash(symbol, kind, trading_ts);
        if !self.dedup.check_and_insert(&hash, now) {
            self.suppress(symbol, source, "payload hash seen");
            return;
        }

        let status = match kind {
            ListingKind::TradingOpen => Some(SymbolStatus::Trading),
            ListingKind::StatusChanged(s) => Some(s),
            ListingKind::Discovered => None,
        };
        if let Some(status) = status {
            if let Err(e) = self.catalog.set_status(symbol, status).await {
                warn!(%symbol, %status, error = %e, "catalog status update failed");
            }
        }

        self.next_id += 1;
        let ev = ListingEvent {
            id: self.next_id,
            symbol: symbol.clone(),
            kind,
            source,
            detected_at,
            trading_ts,
            payload_hash: hash,
        };
        match self.store.record_event(&ev, now.saturating_sub(self.window_ms)).await {
            Ok(true) => {}
            Ok(false) => {
                self.suppress(symbol, source, "already persisted");
                return;
            }
            // delivery beats durability here; the hash is still in the LRU
            Err(e) => warn!(%symbol, %kind, error = %e, "failed to persist listing event, publishing anyway"),
        }

        self.accepted += 1;
        EVENTS_ACCEPTED.with_label_values(&[kind.as_str(), source.as_str()]).inc();
        info!(%symbol, %kind, %source, event_id = ev.id, ?trading_ts, "listing event");
        if !self.bus.publish(ev) {
            debug!(%symbol, "bus closed, event not delivered");
        }
    }
}

async fn recv_opt<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_opt(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::FnHandler;
    use crate::domain::EXCHANGE_MEXC;
    use crate::gateway::MockGateway;
    use rust_decimal_macros::dec;
    use tokio::time::timeout;

    fn obs(status: Option<SymbolStatus>) -> Observation {
        Observation {
            symbol: SymbolId::new(EXCHANGE_MEXC, "FOOUSDT"),
            status,
            trading_ts: None,
            explicit_open: false,
            source: Source::Rest,
            timer: false,
            observed_at: 0,
        }
    }

    #[test]
    fn unknown_trading_symbol_is_discovered_then_opened() {
        let (p, k) = transition(None, &obs(Some(SymbolStatus::Trading)), None, 0);
        assert_eq!(p, Phase::Open);
        assert_eq!(k, vec![ListingKind::Discovered, ListingKind::TradingOpen]);
    }

    #[test]
    fn prelisted_waits_for_trading_ts() {
        let o = obs(Some(SymbolStatus::PreListed));
        let (p, k) = transition(None, &o, Some(1_000), 999);
        assert_eq!((p, k), (Phase::Discovered, vec![ListingKind::Discovered]));
        let (p, k) = transition(Some(Phase::Discovered), &o, Some(1_000), 1_000);
        assert_eq!((p, k), (Phase::Open, vec![ListingKind::TradingOpen]));
    }

    #[test]
    fn closing_and_reopening() {
        let (p, k) = transition(Some(Phase::Open), &obs(Some(SymbolStatus::Break)), None, 0);
        assert_eq!(p, Phase::Closed(SymbolStatus::Break));
        assert_eq!(k, vec![ListingKind::StatusChanged(SymbolStatus::Break)]);

        let (p, k) = transition(Some(p), &obs(Some(SymbolStatus::Break)), None, 0);
        assert_eq!(p, Phase::Closed(SymbolStatus::Break));
        assert!(k.is_empty());

        // time alone does not reopen a closed market
        let (p2, k) = transition(Some(p), &obs(None), Some(0), 10);
        assert_eq!(p2, p);
        assert!(k.is_empty());

        let (p, k) = transition(Some(p), &obs(Some(SymbolStatus::Trading)), None, 0);
        assert_eq!(p, Phase::Open);
        assert_eq!(k, vec![ListingKind::StatusChanged(SymbolStatus::Trading)]);
    }

    #[test]
    fn open_symbol_ignores_repeats() {
        let (p, k) = transition(Some(Phase::Open), &obs(Some(SymbolStatus::Trading)), None, 0);
        assert_eq!(p, Phase::Open);
        assert!(k.is_empty());
    }

    struct Rig {
        gw: Arc<MockGateway>,
        store: Store,
        catalog: Arc<Catalog>,
        catalog_tx: mpsc::Sender<CatalogEvent>,
        handle: DetectorHandle,
        events: mpsc::UnboundedReceiver<Arc<ListingEvent>>,
        bus: Arc<EventBus>,
        cancel: CancellationToken,
        task: tokio::task::JoinHandle<DedupCache>,
    }

    async fn rig_with(store: Store) -> Rig {
        let gw = Arc::new(MockGateway::new());
        let cancel = CancellationToken::new();
        let (catalog_tx, catalog_rx) = mpsc::channel(64);
        let dyn_gw: Arc<dyn ExchangeGateway> = gw.clone();
        let catalog = Catalog::load(
            dyn_gw.clone(),
            store.clone(),
            catalog_tx.clone(),
            true,
            Duration::from_secs(1),
            cancel.clone(),
        )
        .await
        .expect("catalog");

        let bus = Arc::new(EventBus::new(1024, None));
        let (tx, events) = mpsc::unbounded_channel();
        bus.subscribe(
            "tap",
            &[],
            Arc::new(FnHandler(move |e: Arc<ListingEvent>| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(e);
                }
            })),
        );

        let det = Detector::new(
            DetectorCfg { window: Duration::from_secs(24 * 3600), lru_size: 10_000 },
            store.clone(),
            catalog.clone(),
            bus.clone(),
            dyn_gw.clone(),
            Activity::new(),
        )
        .await
        .expect("detector");
        let handle = det.handle();
        let stream = dyn_gw.subscribe_listings(cancel.clone()).await.expect("stream");
        let task = tokio::spawn(det.run(catalog_rx, Some(stream), cancel.clone()));
        Rig { gw, store, catalog, catalog_tx, handle, events, bus, cancel, task }
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Arc<ListingEvent>>) -> Arc<ListingEvent> {
        timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("event in time")
            .expect("bus open")
    }

    #[tokio::test]
    async fn stream_open_before_rest_synthesizes_discovered() {
        let store = Store::memory().await.expect("store");
        let mut rig = rig_with(store).await;
        let mut raw = RawListing::status_change("FOOUSDT", SymbolStatus::Trading);
        raw.kind = RawListingKind::TradingOpen;
        rig.gw.push_listing(raw).await;

        let a = next(&mut rig.events).await;
        let b = next(&mut rig.events).await;
        assert_eq!(a.kind, ListingKind::Discovered);
        assert_eq!(b.kind, ListingKind::TradingOpen);
        assert!(a.id < b.id);
        assert_eq!(a.source, Source::Stream);

        let id = SymbolId::new(EXCHANGE_MEXC, "FOOUSDT");
        let sym = rig.catalog.get(&id).expect("catalog has stream symbol");
        assert_eq!(sym.status, SymbolStatus::Trading);
        assert_eq!(rig.store.events_for(&id).await.expect("events").len(), 2);
        assert_eq!(rig.handle.seen(&a.payload_hash).await, Some(true));
        rig.cancel.cancel();
        let _ = rig.task.await;
    }

    #[tokio::test]
    async fn rest_and_stream_race_yields_one_discovered() {
        let store = Store::memory().await.expect("store");
        let mut rig = rig_with(store).await;
        let mut raw = RawListing::new_listing("BARUSDT", "BAR", "USDT", None);
        let sym = Symbol::from_listing(EXCHANGE_MEXC, &raw);
        raw.received_at += 50;

        rig.catalog_tx
            .send(CatalogEvent::Changed(SymbolChange::Added(sym)))
            .await
            .expect("send");
        rig.gw.push_listing(raw).await;

        let first = next(&mut rig.events).await;
        assert_eq!(first.kind, ListingKind::Discovered);
        assert_eq!(first.source, Source::Rest);

        // wait until the stream copy has been judged
        let mut stats = rig.handle.stats().await.expect("stats");
        for _ in 0..50 {
            if stats.suppressed == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            stats = rig.handle.stats().await.expect("stats");
        }
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.suppressed, 1);
        assert!(rig.events.try_recv().is_err());
        rig.cancel.cancel();
        let _ = rig.task.await;
    }

    #[tokio::test]
    async fn stream_event_keeps_receive_time() {
        let store = Store::memory().await.expect("store");
        let mut rig = rig_with(store).await;
        let mut raw = RawListing::new_listing("QUXUSDT", "QUX", "USDT", None);
        raw.received_at = now_ms() - 400;
        let seen_at = raw.received_at;
        rig.gw.push_listing(raw).await;

        let ev = next(&mut rig.events).await;
        assert_eq!(ev.kind, ListingKind::Discovered);
        assert_eq!(ev.source, Source::Stream);
        assert_eq!(ev.detected_at, seen_at);
        rig.cancel.cancel();
        let _ = rig.task.await;
    }

    #[tokio::test]
    async fn trading_ts_timer_opens_market() {
        let store = Store::memory().await.expect("store");
        let mut rig = rig_with(store).await;
        let t = now_ms() + 150;
        rig.gw
            .push_listing(RawListing::new_listing("FOOUSDT", "FOO", "USDT", Some(t)))
            .await;

        let a = next(&mut rig.events).await;
        assert_eq!(a.kind, ListingKind::Discovered);
        let b = next(&mut rig.events).await;
        assert_eq!(b.kind, ListingKind::TradingOpen);
        assert_eq!(b.trading_ts, Some(t));
        assert!(b.detected_at >= t - 5);
        rig.cancel.cancel();
        let _ = rig.task.await;
    }

    #[tokio::test]
    async fn close_and_reopen_from_rest() {
        let store = Store::memory().await.expect("store");
        let mut rig = rig_with(store).await;
        let mut sym = Symbol::from_listing(
            EXCHANGE_MEXC,
            &RawListing::new_listing("BAZUSDT", "BAZ", "USDT", None),
        );
        sym.status = SymbolStatus::Trading;
        sym.min_notional = dec!(5);
        rig.catalog_tx
            .send(CatalogEvent::Changed(SymbolChange::Added(sym.clone())))
            .await
            .expect("send");
        assert_eq!(next(&mut rig.events).await.kind, ListingKind::Discovered);
        assert_eq!(next(&mut rig.events).await.kind, ListingKind::TradingOpen);

        let mut halted = sym.clone();
        halted.status = SymbolStatus::Break;
        rig.catalog_tx
            .send(CatalogEvent::Changed(SymbolChange::StatusChanged {
                symbol: halted,
                from: SymbolStatus::Trading,
            }))
            .await
            .expect("send");
        assert_eq!(
            next(&mut rig.events).await.kind,
            ListingKind::StatusChanged(SymbolStatus::Break)
        );
        assert_eq!(rig.catalog.get(&sym.id).map(|s| s.status), Some(SymbolStatus::Break));

        rig.catalog_tx
            .send(CatalogEvent::Changed(SymbolChange::StatusChanged {
                symbol: sym.clone(),
                from: SymbolStatus::Break,
            }))
            .await
            .expect("send");
        assert_eq!(
            next(&mut rig.events).await.kind,
            ListingKind::StatusChanged(SymbolStatus::Trading)
        );
        rig.cancel.cancel();
        let _ = rig.task.await;
    }

    #[tokio::test]
    async fn restart_keeps_state_and_dedup() {
        let store = Store::memory().await.expect("store");
        let mut rig = rig_with(store.clone()).await;
        rig.gw
            .push_listing(RawListing::new_listing("QUXUSDT", "QUX", "USDT", None))
            .await;
        let first = next(&mut rig.events).await;
        rig.cancel.cancel();
        let dedup = rig.task.await.expect("join");
        store
            .save_dedup_snapshot(&dedup.snapshot(now_ms()))
            .await
            .expect("snapshot");
        rig.bus.shutdown(Duration::from_secs(1)).await;

        let mut again = rig_with(store).await;
        assert_eq!(again.handle.seen(&first.payload_hash).await, Some(true));
        again
            .gw
            .push_listing(RawListing::new_listing("QUXUSDT", "QUX", "USDT", None))
            .await;
        let mut stats = again.handle.stats().await.expect("stats");
        for _ in 0..50 {
            if stats.suppressed == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            stats = again.handle.stats().await.expect("stats");
        }
        assert_eq!(stats.accepted, 0);
        assert_eq!(stats.suppressed, 1);
        assert!(again.events.try_recv().is_err());
        again.cancel.cancel();
        let _ = again.task.await;
    }
}
