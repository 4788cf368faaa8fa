// ===============================
// src/catalog.rs
// ===============================
//
// Symbol Catalog: the local view of everything the exchange lists.
// Readers get a stable `Arc<Snapshot>`; writers upsert in the store first,
// then swap in a new snapshot. `refresh` is single-flight.
//
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ahash::AHashMap as HashMap;
use arc_swap::ArcSwap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::{Symbol, SymbolId, SymbolStatus};
use crate::error::{CoreError, ErrorKind};
use crate::gateway::{check_clock_skew, CallCtx, ExchangeGateway};
use crate::metrics::{CATALOG_ADDED, CATALOG_REFRESHES, CATALOG_SYMBOLS};
use crate::store::Store;

#[derive(Debug, Clone, PartialEq)]
pub enum SymbolChange {
    /// `Symbol.Added`: not in the previous snapshot.
    Added(Symbol),
    StatusChanged { symbol: Symbol, from: SymbolStatus },
}

impl SymbolChange {
    pub fn symbol(&self) -> &Symbol {
        match self {
            SymbolChange::Added(s) => s,
            SymbolChange::StatusChanged { symbol, .. } => symbol,
        }
    }
}

/// What the catalog tells the detector.
#[derive(Debug, Clone, PartialEq)]
pub enum CatalogEvent {
    Changed(SymbolChange),
    /// Sent after every successful refresh, changes or not.
    RefreshCompleted { symbols: usize },
}

#[derive(Debug, Default, Clone)]
pub struct Snapshot {
    pub symbols: HashMap<SymbolId, Symbol>,
    pub version: u64,
}

impl Snapshot {
    pub fn get(&self, id: &SymbolId) -> Option<&Symbol> {
        self.symbols.get(id)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub total: usize,
    pub added: usize,
    pub status_changed: usize,
    pub baseline: bool,
}

#[derive(Debug, Clone, Error)]
#[error("catalog refresh failed: {0}")]
pub struct RefreshError(pub Arc<CoreError>);

impl RefreshError {
    pub fn kind(&self) -> ErrorKind {
        self.0.kind()
    }
}

type RefreshFuture = Shared<BoxFuture<'static, Result<RefreshReport, RefreshError>>>;

/// New entries and status transitions of `curr` relative to `prev`,
/// ordered by identity, ties broken by status priority. Symbols missing
/// from `curr` are not reported.
pub fn diff(prev: &HashMap<SymbolId, Symbol>, curr: &[Symbol]) -> Vec<SymbolChange> {
    let mut sorted: Vec<&Symbol> = curr.iter().collect();
    sorted.sort_by(|a, b| {
        a.id.cmp(&b.id)
            .then_with(|| a.status.priority().cmp(&b.status.priority()))
    });
    // a listing repeated in one response collapses to its furthest status
    sorted.dedup_by(|later, earlier| {
        if later.id == earlier.id {
            *earlier = *later;
            true
        } else {
            false
        }
    });

    sorted
        .into_iter()
        .filter_map(|s| match prev.get(&s.id) {
            None => Some(SymbolChange::Added(s.clone())),
            Some(p) if p.status != s.status => Some(SymbolChange::StatusChanged {
                symbol: s.clone(),
                from: p.status,
            }),
            Some(_) => None,
        })
        .collect()
}

/// A symbol already TRADING stays TRADING when the exchange still lists it
/// as pre-listed (its open time has passed, the listing data lags).
/// Returns how many fetched entries were corrected.
pub fn hold_open_status(prev: &HashMap<SymbolId, Symbol>, fetched: &mut [Symbol]) -> usize {
    let mut held = 0;
    for s in fetched.iter_mut() {
        let was_open = prev.get(&s.id).map_or(false, |p| p.status == SymbolStatus::Trading);
        if was_open && s.status == SymbolStatus::PreListed {
            s.status = SymbolStatus::Trading;
            held += 1;
        }
    }
    held
}

pub struct Catalog {
    gw: Arc<dyn ExchangeGateway>,
    store: Store,
    snapshot: ArcSwap<Snapshot>,
    events: mpsc::Sender<CatalogEvent>,
    inflight: Mutex<Option<RefreshFuture>>,
    baseline_on_empty: bool,
    call_timeout: Duration,
    cancel: CancellationToken,
}

impl Catalog {
    /// Loads the persisted symbols as the first snapshot.
    pub async fn load(
        gw: Arc<dyn ExchangeGateway>,
        store: Store,
        events: mpsc::Sender<CatalogEvent>,
        baseline_on_empty: bool,
        call_timeout: Duration,
        cancel: CancellationToken,
    ) -> crate::error::Result<Arc<Self>> {
        let rows = store.load_symbols().await?;
        let symbols: HashMap<SymbolId, Symbol> = rows.into_iter().map(|s| (s.id.clone(), s)).collect();
        CATALOG_SYMBOLS.set(symbols.len() as i64);
        info!(symbols = symbols.len(), "catalog loaded from store");
        Ok(Arc::new(Catalog {
            gw,
            store,
            snapshot: ArcSwap::from_pointee(Snapshot { symbols, version: 0 }),
            events,
            inflight: Mutex::new(None),
            baseline_on_empty,
            call_timeout,
            cancel,
        }))
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.load_full()
    }

    pub fn get(&self, id: &SymbolId) -> Option<Symbol> {
        self.snapshot.load().get(id).cloned()
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<RefreshFuture>> {
        match self.inflight.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Fetch, upsert, diff, announce. Overlapping callers share one run.
    pub async fn refresh(self: &Arc<Self>) -> Result<RefreshReport, RefreshError> {
        let fut = {
            let mut slot = self.slot();
            match slot.as_ref() {
                Some(f) => f.clone(),
                None => {
                    let me = Arc::clone(self);
                    let f: RefreshFuture = async move {
                        let res = me.refresh_once().await.map_err(|e| RefreshError(Arc::new(e)));
                        *me.slot() = None;
                        res
                    }
                    .boxed()
                    .shared();
                    *slot = Some(f.clone());
                    f
                }
            }
        };
        fut.await
    }

    async fn refresh_once(&self) -> crate::error::Result<RefreshReport> {
        let ctx = CallCtx::new(&self.cancel, self.call_timeout);
        let fetched = match self.gw.exchange_info(&ctx).await {
            Ok(s) => s,
            Err(e) => {
                CATALOG_REFRESHES.with_label_values(&["error"]).inc();
                return Err(e.into());
            }
        };

        let prev = self.snapshot.load_full();
        let mut fetched = fetched;
        let held = hold_open_status(&prev.symbols, &mut fetched);
        if held > 0 {
            debug!(held, "exchange still reports opened symbols as pre-listed, keeping TRADING");
        }
        let baseline = self.baseline_on_empty && prev.is_empty() && self.store.symbol_count().await? == 0;
        let changes = if baseline { Vec::new() } else { diff(&prev.symbols, &fetched) };

        if let Err(e) = self.store.upsert_symbols(&fetched).await {
            CATALOG_REFRESHES.with_label_values(&["error"]).inc();
            return Err(e);
        }
        let next = self.publish(|snap| {
            for s in &fetched {
                snap.symbols.insert(s.id.clone(), s.clone());
            }
        });

        let mut report = RefreshReport { total: fetched.len(), baseline, ..Default::default() };
        for change in changes {
            match &change {
                SymbolChange::Added(s) => {
                    report.added += 1;
                    CATALOG_ADDED.inc();
                    info!(symbol = %s.id, status = %s.status, "Symbol.Added");
                }
                SymbolChange::StatusChanged { symbol, from } => {
                    report.status_changed += 1;
                    info!(symbol = %symbol.id, from = %from, to = %symbol.status, "symbol status changed");
                }
            }
            if self.events.send(CatalogEvent::Changed(change)).await.is_err() {
                debug!("catalog event receiver gone");
            }
        }
        let _ = self
            .events
            .send(CatalogEvent::RefreshCompleted { symbols: next.len() })
            .await;

        CATALOG_REFRESHES
            .with_label_values(&[if baseline { "baseline" } else { "ok" }])
            .inc();
        if baseline {
            info!(symbols = fetched.len(), "baseline refresh, existing symbols stored without announcing");
        } else {
            debug!(?report, "catalog refreshed");
        }
        Ok(report)
    }

    /// Copy-on-write update of the snapshot.
    fn publish<F>(&self, f: F) -> Arc<Snapshot>
    where
        F: Fn(&mut Snapshot),
    {
        self.snapshot.rcu(|cur| {
            let mut next = Snapshot::clone(cur);
            f(&mut next);
            next.version = cur.version + 1;
            next
        });
        let next = self.snapshot.load_full();
        CATALOG_SYMBOLS.set(next.len() as i64);
        next
    }

    /// Stores a symbol first seen on the push stream.
    pub async fn upsert_symbol(&self, symbol: Symbol) -> crate::error::Result<()> {
        self.store.upsert_symbol(&symbol).await?;
        self.publish(|snap| {
            snap.symbols.insert(symbol.id.clone(), symbol.clone());
        });
        Ok(())
    }

    pub async fn set_status(&self, id: &SymbolId, status: SymbolStatus) -> crate::error::Result<()> {
        if self.get(id).map_or(false, |s| s.status == status) {
            return Ok(());
        }
        self.store.update_symbol_status(id, status).await?;
        self.publish(|snap| {
            if let Some(s) = snap.symbols.get_mut(id) {
                s.status = status;
            }
        });
        Ok(())
    }

    /// Periodic refresh + clock skew check until cancelled.
    pub async fn run_refresh_loop(self: Arc<Self>, every: Duration, cancel: CancellationToken) {
        let mut tick = interval(every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            match self.refresh().await {
                Ok(r) if r.added > 0 || r.status_changed > 0 => {
                    info!(added = r.added, status_changed = r.status_changed, total = r.total, "refresh found changes")
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, kind = %e.kind(), "catalog refresh failed"),
            }
            let ctx = CallCtx::new(&cancel, self.call_timeout);
            if let Err(e) = check_clock_skew(self.gw.as_ref(), &ctx).await {
                debug!(?e, "clock skew check failed");
            }
        }
        info!("catalog refresh loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OrderType, EXCHANGE_MEXC};
    use crate::error::GatewayError;
    use crate::gateway::MockGateway;
    use rust_decimal_macros::dec;

    fn sym(ticker: &str, status: SymbolStatus) -> Symbol {
        Symbol {
            id: SymbolId::new(EXCHANGE_MEXC, ticker),
            base: ticker.trim_end_matches("USDT").into(),
            quote: "USDT".into(),
            status,
            listing_ts: None,
            trading_ts: None,
            price_precision: 4,
            qty_precision: 1,
            min_qty: dec!(0.1),
            max_qty: dec!(100000),
            min_notional: dec!(5),
            tick_size: dec!(0.0001),
            step_size: dec!(0.1),
            allowed_order_types: vec![OrderType::Market],
            updated_at: 0,
        }
    }

    async fn setup(
        baseline: bool,
    ) -> (Arc<MockGateway>, Arc<Catalog>, mpsc::Receiver<CatalogEvent>) {
        let gw = Arc::new(MockGateway::new().with_latency(Duration::from_millis(20)));
        let store = Store::memory().await.expect("store");
        let (tx, rx) = mpsc::channel(64);
        let cat = Catalog::load(
            gw.clone(),
            store,
            tx,
            baseline,
            Duration::from_secs(2),
            CancellationToken::new(),
        )
        .await
        .expect("catalog");
        (gw, cat, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<CatalogEvent>) -> Vec<CatalogEvent> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    #[test]
    fn diff_is_ordered_and_reports_transitions() {
        let mut prev = HashMap::new();
        let b = sym("BBBUSDT", SymbolStatus::PreListed);
        prev.insert(b.id.clone(), b);
        let gone = sym("ZZZUSDT", SymbolStatus::Trading);
        prev.insert(gone.id.clone(), gone);

        let curr = vec![
            sym("CCCUSDT", SymbolStatus::Trading),
            sym("BBBUSDT", SymbolStatus::Trading),
            sym("AAAUSDT", SymbolStatus::Trading),
            sym("AAAUSDT", SymbolStatus::PreListed),
        ];
        let changes = diff(&prev, &curr);
        assert_eq!(changes.len(), 3);
        assert!(matches!(&changes[0], SymbolChange::Added(s) if s.id.ticker() == "AAAUSDT" && s.status == SymbolStatus::Trading));
        assert!(matches!(&changes[1], SymbolChange::StatusChanged { symbol, from: SymbolStatus::PreListed } if symbol.id.ticker() == "BBBUSDT"));
        assert!(matches!(&changes[2], SymbolChange::Added(s) if s.id.ticker() == "CCCUSDT"));

        // same input, same output
        assert_eq!(diff(&prev, &curr), changes);
    }

    #[tokio::test]
    async fn baseline_then_incremental() {
        let (gw, cat, mut rx) = setup(true).await;
        gw.set_symbols(vec![sym("AAAUSDT", SymbolStatus::Trading), sym("BBBUSDT", SymbolStatus::Trading)]);

        let r = cat.refresh().await.expect("refresh");
        assert!(r.baseline);
        assert_eq!(r.added, 0);
        assert_eq!(cat.snapshot().len(), 2);
        assert_eq!(drain(&mut rx), vec![CatalogEvent::RefreshCompleted { symbols: 2 }]);

        gw.add_symbol(sym("NEWUSDT", SymbolStatus::PreListed));
        let r = cat.refresh().await.expect("refresh");
        assert!(!r.baseline);
        assert_eq!(r.added, 1);
        let evs = drain(&mut rx);
        assert!(matches!(&evs[0], CatalogEvent::Changed(SymbolChange::Added(s)) if s.id.ticker() == "NEWUSDT"));

        // no exchange-side change -> no-op
        let r = cat.refresh().await.expect("refresh");
        assert_eq!((r.added, r.status_changed), (0, 0));
        assert_eq!(drain(&mut rx), vec![CatalogEvent::RefreshCompleted { symbols: 3 }]);

        gw.set_status("NEWUSDT", SymbolStatus::Trading);
        let r = cat.refresh().await.expect("refresh");
        assert_eq!(r.status_changed, 1);
        let id = SymbolId::new(EXCHANGE_MEXC, "NEWUSDT");
        assert_eq!(cat.get(&id).map(|s| s.status), Some(SymbolStatus::Trading));
    }

    #[tokio::test]
    async fn without_baseline_first_refresh_announces_everything() {
        let (gw, cat, mut rx) = setup(false).await;
        gw.set_symbols(vec![sym("AAAUSDT", SymbolStatus::Trading)]);
        let r = cat.refresh().await.expect("refresh");
        assert_eq!(r.added, 1);
        assert_eq!(drain(&mut rx).len(), 2);
    }

    #[tokio::test]
    async fn overlapping_refreshes_share_one_fetch() {
        let (gw, cat, _rx) = setup(true).await;
        gw.set_symbols(vec![sym("AAAUSDT", SymbolStatus::Trading)]);
        let (a, b) = tokio::join!(cat.refresh(), cat.refresh());
        assert_eq!(a.expect("a"), b.expect("b"));
        assert_eq!(gw.exchange_info_calls(), 1);

        cat.refresh().await.expect("later");
        assert_eq!(gw.exchange_info_calls(), 2);
    }

    #[tokio::test]
    async fn failed_fetch_leaves_snapshot_alone() {
        let (gw, cat, _rx) = setup(true).await;
        gw.fail_next_exchange_info(GatewayError::Http { status: 503, code: None, msg: "down".into() });
        let err = cat.refresh().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(cat.snapshot().is_empty());
    }

    #[tokio::test]
    async fn stream_symbols_survive_refresh() {
        let (gw, cat, _rx) = setup(true).await;
        gw.set_symbols(vec![sym("AAAUSDT", SymbolStatus::Trading)]);
        cat.refresh().await.expect("baseline");

        cat.upsert_symbol(sym("PUSHUSDT", SymbolStatus::PreListed)).await.expect("upsert");
        cat.refresh().await.expect("refresh");
        let id = SymbolId::new(EXCHANGE_MEXC, "PUSHUSDT");
        assert!(cat.get(&id).is_some());

        cat.set_status(&id, SymbolStatus::Trading).await.expect("status");
        assert_eq!(cat.get(&id).map(|s| s.status), Some(SymbolStatus::Trading));
        assert!(cat.snapshot().version >= 3);
    }

    #[tokio::test]
    async fn refresh_does_not_reclose_an_opened_symbol() {
        let (gw, cat, mut rx) = setup(true).await;
        gw.set_symbols(vec![sym("OPNUSDT", SymbolStatus::PreListed)]);
        cat.refresh().await.expect("baseline");
        let id = SymbolId::new(EXCHANGE_MEXC, "OPNUSDT");

        // open time passed locally, exchange data still says pre-listed
        cat.set_status(&id, SymbolStatus::Trading).await.expect("status");
        drain(&mut rx);
        let r = cat.refresh().await.expect("refresh");
        assert_eq!(r.status_changed, 0);
        assert_eq!(cat.get(&id).map(|s| s.status), Some(SymbolStatus::Trading));
        assert_eq!(drain(&mut rx), vec![CatalogEvent::RefreshCompleted { symbols: 1 }]);

        // closing still goes through
        gw.set_status("OPNUSDT", SymbolStatus::Break);
        let r = cat.refresh().await.expect("refresh");
        assert_eq!(r.status_changed, 1);
        assert_eq!(cat.get(&id).map(|s| s.status), Some(SymbolStatus::Break));
    }
}
