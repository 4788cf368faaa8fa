// ===============================
// src/app.rs
// ===============================
//
// Wiring: leaves first (store, gateway), then catalog, bus, executor,
// auto-snipe, recorder, detector. Shutdown runs the other way round.
//
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::autosnipe::AutoSnipe;
use crate::bus::{DeadLetterSink, EventBus};
use crate::catalog::{Catalog, CatalogEvent};
use crate::config::{Args, Limits};
use crate::dedup::DedupCache;
use crate::detector::{Detector, DetectorCfg, DetectorHandle};
use crate::domain::{now_ms, KindTag};
use crate::error::Result;
use crate::executor::{Executor, ExecutorHandler};
use crate::gateway::{self, ExchangeGateway};
use crate::health::{self, Activity, HealthStatus};
use crate::metrics;
use crate::recorder;
use crate::risk::LimitRisk;
use crate::store::Store;
use crate::validator::OrderValidator;

const CATALOG_EVENT_QUEUE: usize = 1024;

pub struct App {
    pub args: Args,
    pub gw: Arc<dyn ExchangeGateway>,
    pub store: Store,
    pub catalog: Arc<Catalog>,
    pub bus: Arc<EventBus>,
    pub executor: Arc<Executor>,
    pub detector: DetectorHandle,
    pub health: watch::Receiver<HealthStatus>,
    cancel: CancellationToken,
    // gateway background tasks (stream, mock demo); outlive the drain
    gw_cancel: CancellationToken,
    detector_task: JoinHandle<DedupCache>,
    tasks: Vec<JoinHandle<()>>,
}

/// Store + gateway + catalog + executor without the pipeline, for one-shot
/// operator commands.
pub struct Control {
    pub gw: Arc<dyn ExchangeGateway>,
    pub store: Store,
    pub catalog: Arc<Catalog>,
    pub executor: Arc<Executor>,
    cancel: CancellationToken,
}

impl Control {
    pub async fn open(args: &Args, limits: Limits) -> Result<Control> {
        let cancel = CancellationToken::new();
        let store = Store::connect(&args.database_url, args.db_max_connections, args.db_min_connections).await?;
        let gw = gateway::build(&args.gateway, &cancel)?;

        // nobody reacts to catalog changes here
        let (cat_tx, mut cat_rx) = mpsc::channel::<CatalogEvent>(CATALOG_EVENT_QUEUE);
        tokio::spawn(async move { while cat_rx.recv().await.is_some() {} });

        let catalog = Catalog::load(
            gw.clone(),
            store.clone(),
            cat_tx,
            args.refresh_baseline_on_empty,
            args.gateway.timeout,
            cancel.clone(),
        )
        .await?;
        let validator = OrderValidator::new(Arc::new(LimitRisk::new(limits)), args.sniper.allow_pre_listed);
        let executor = Executor::new(
            gw.clone(),
            store.clone(),
            catalog.clone(),
            validator,
            args.sniper.clone(),
            args.gateway.timeout,
        );
        Ok(Control { gw, store, catalog, executor, cancel })
    }

    pub async fn close(self) {
        self.executor.shutdown(Duration::from_secs(1)).await;
        self.cancel.cancel();
        self.gw.close().await;
        self.store.close().await;
    }
}

impl App {
    /// Connects the configured store and gateway, then starts everything.
    pub async fn start(args: Args, limits: Limits) -> Result<App> {
        let store = Store::connect(&args.database_url, args.db_max_connections, args.db_min_connections).await?;
        let gw_cancel = CancellationToken::new();
        let gw = gateway::build(&args.gateway, &gw_cancel)?;
        Self::assemble(args, limits, gw, store, gw_cancel).await
    }

    /// Starts the pipeline on an already built gateway and store.
    pub async fn start_with(args: Args, limits: Limits, gw: Arc<dyn ExchangeGateway>, store: Store) -> Result<App> {
        Self::assemble(args, limits, gw, store, CancellationToken::new()).await
    }

    async fn assemble(
        args: Args,
        limits: Limits,
        gw: Arc<dyn ExchangeGateway>,
        store: Store,
        gw_cancel: CancellationToken,
    ) -> Result<App> {
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        // ---- health ----
        let activity = Activity::new();
        let (health_tx, health_rx) = watch::channel(HealthStatus::Healthy);
        tasks.push(tokio::spawn(health::run_monitor(
            activity.clone(),
            args.refresh_interval * 2,
            health_tx,
            cancel.clone(),
        )));
        if args.metrics_port != 0 {
            tasks.push(tokio::spawn(metrics::serve_metrics(
                args.metrics_port,
                health_rx.clone(),
                cancel.clone(),
            )));
        }

        // ---- catalog ----
        let (cat_tx, cat_rx) = mpsc::channel::<CatalogEvent>(CATALOG_EVENT_QUEUE);
        let catalog = Catalog::load(
            gw.clone(),
            store.clone(),
            cat_tx,
            args.refresh_baseline_on_empty,
            args.gateway.timeout,
            cancel.clone(),
        )
        .await?;

        // ---- bus ----
        let sink: Arc<dyn DeadLetterSink> = Arc::new(store.clone());
        let bus = Arc::new(EventBus::new(args.bus_subscriber_queue, Some(sink)));

        // ---- executor ----
        let validator = OrderValidator::new(Arc::new(LimitRisk::new(limits)), args.sniper.allow_pre_listed);
        let executor = Executor::new(
            gw.clone(),
            store.clone(),
            catalog.clone(),
            validator,
            args.sniper.clone(),
            args.gateway.timeout,
        );
        bus.subscribe(
            "executor",
            &[KindTag::Discovered, KindTag::TradingOpen],
            Arc::new(ExecutorHandler(executor.clone())),
        );
        match executor.reconcile().await {
            Ok(r) => info!(recovered = r.recovered, resumed = r.resumed, polled = r.polled, "startup reconcile done"),
            Err(e) => warn!(error = %e, kind = %e.kind(), "startup reconcile failed"),
        }
        tasks.push(tokio::spawn(executor.clone().run_poller()));
        if let Some(rule) = args.auto_snipe.clone() {
            info!(quotes = ?rule.quote_assets, budget = %rule.quote_budget, max_price = %rule.max_price, "auto-snipe rule active");
            bus.subscribe(
                "auto_snipe",
                &[KindTag::Discovered],
                Arc::new(AutoSnipe::new(rule, executor.clone(), catalog.clone())),
            );
        }

        // ---- recorder (optional) ----
        if let Some(path) = args.record_file.clone() {
            let (handler, task) = recorder::recorder(path, args.bus_subscriber_queue);
            bus.subscribe("recorder", &[], Arc::new(handler));
            tasks.push(tokio::spawn(task));
        }

        // ---- detector ----
        let detector = Detector::new(
            DetectorCfg { window: args.dedup_window, lru_size: args.dedup_lru_size },
            store.clone(),
            catalog.clone(),
            bus.clone(),
            gw.clone(),
            activity,
        )
        .await?;
        let handle = detector.handle();
        let stream_rx = match gw.subscribe_listings(cancel.child_token()).await {
            Ok(rx) => Some(rx),
            Err(e) => {
                warn!(error = %e, "listing stream unavailable, detector runs on REST refresh only");
                None
            }
        };
        let detector_task = tokio::spawn(detector.run(cat_rx, stream_rx, cancel.clone()));

        // ---- sources ----
        tasks.push(tokio::spawn(catalog.clone().run_refresh_loop(args.refresh_interval, cancel.clone())));

        info!(
            exchange = gw.exchange(),
            symbols = catalog.snapshot().len(),
            refresh_sec = args.refresh_interval.as_secs(),
            workers = args.sniper.workers,
            "listing sniper started"
        );

        Ok(App {
            args,
            gw,
            store,
            catalog,
            bus,
            executor,
            detector: handle,
            health: health_rx,
            cancel,
            gw_cancel,
            detector_task,
            tasks,
        })
    }

    /// Token that stops detection; `shutdown` fires it too.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn shutdown(self) {
        info!("shutdown: stopping sources");
        self.cancel.cancel();

        let dedup = match self.detector_task.await {
            Ok(d) => Some(d),
            Err(e) => {
                warn!(?e, "detector task ended abnormally");
                None
            }
        };

        let aborted = self.bus.shutdown(self.args.shutdown_drain).await;
        if aborted > 0 {
            warn!(aborted, "bus subscribers aborted at drain deadline");
        }
        self.executor.shutdown(self.args.shutdown_drain).await;

        if let Some(d) = dedup {
            let entries = d.snapshot(now_ms());
            match self.store.save_dedup_snapshot(&entries).await {
                Ok(()) => info!(entries = entries.len(), "dedup snapshot saved"),
                Err(e) => warn!(error = %e, "dedup snapshot not saved"),
            }
        }

        for t in self.tasks {
            if timeout(Duration::from_secs(2), t).await.is_err() {
                warn!("background task did not stop in time");
            }
        }
        self.gw.close().await;
        self.gw_cancel.cancel();
        self.store.close().await;
        info!("shutdown complete");
    }
}
