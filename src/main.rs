// ===============================
// src/main.rs
// ===============================
/*
 cd listing_sniper

 # jalankan pipeline (mock gateway, demo listing tiap 30 detik)
 GATEWAY_MODE=mock MOCK_DEMO_LISTING_SEC=30 cargo run -- run

 # pasang intent untuk symbol yang belum listing
 cargo run -- arm --symbol FOOUSDT --budget 10 --max-price 1.00

curl -s localhost:9898/metrics | egrep '^(listing_events_accepted_total|snipe_intents_total|orders_total)'
curl -s localhost:9898/health
*/
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
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use listing_sniper::app::{App, Control};
use listing_sniper::config::{self, Args, LogFormat, Limits};
use listing_sniper::domain::{NewIntent, OrderType, SnipeIntent, SymbolId};
use listing_sniper::metrics;

#[derive(Parser, Debug)]
#[command(name = "listing_sniper", version, about = "New-listing detection and sniper execution")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run detection and execution until Ctrl-C (default).
    Run,
    /// Refresh the symbol catalog once and print the result.
    Refresh,
    /// Create a snipe intent; it is armed right away when the symbol is known.
    Arm {
        #[arg(long)]
        symbol: String,
        /// Quote amount to spend, e.g. 10 (USDT).
        #[arg(long)]
        budget: Decimal,
        #[arg(long)]
        max_price: Decimal,
        #[arg(long, default_value = "market", value_parser = parse_order_type)]
        order_type: OrderType,
    },
    /// Cancel an intent (exchange cancel when already submitted).
    Cancel { id: i64 },
    /// List all intents.
    Intents,
}

fn parse_order_type(s: &str) -> Result<OrderType, String> {
    OrderType::parse(s).ok_or_else(|| format!("unknown order type {s:?} (market|limit|ioc)"))
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_current_span(false)
            .with_env_filter(filter)
            .init(),
    }
}

fn print_intent(i: &SnipeIntent) {
    println!(
        "{:>5}  {:<20} {:<10} budget={} max_price={} type={} attempts={} cid={} {}",
        i.id,
        i.symbol,
        i.state,
        i.quote_budget,
        i.max_price,
        i.order_type,
        i.attempts,
        i.client_order_id.as_deref().unwrap_or("-"),
        i.last_error.as_deref().unwrap_or(""),
    );
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // ---- Load config & limits ----
    let (args, limits) = match config::load() {
        Ok(v) => v,
        Err(e) => {
            eprintln!("config error: {e}");
            return ExitCode::from(2);
        }
    };

    // ---- Logging ----
    init_logging(args.log_format);

    let res = match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(args, limits).await,
        cmd => control(cmd, &args, limits).await,
    };
    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, kind = %e.kind(), "fatal");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args, limits: Limits) -> listing_sniper::error::Result<()> {
    // ---- Metrics ----
    metrics::init();
    metrics::CONFIG_GATEWAY_MODE
        .with_label_values(&[args.gateway.mode.as_str()])
        .set(1);

    info!(
        gateway = args.gateway.mode.as_str(),
        rest = %args.gateway.rest_url,
        ws = %args.gateway.ws_url,
        db = %args.database_url,
        refresh_sec = args.refresh_interval.as_secs(),
        dedup_window_h = args.dedup_window.as_secs() / 3600,
        workers = args.sniper.workers,
        max_attempts = args.sniper.max_attempts,
        auto_snipe = args.auto_snipe.is_some(),
        limits = ?limits,
        "startup config"
    );

    let app = App::start(args, limits).await?;
    wait_for_shutdown(&app).await;
    app.shutdown().await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown(app: &App) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hup = match signal(SignalKind::hangup()) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!(?e, "SIGHUP handler not installed, re-keying disabled");
            None
        }
    };
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Some(_) = async { match hup.as_mut() { Some(h) => h.recv().await, None => std::future::pending().await } } => {
                rekey(app);
            }
        }
    }
    info!("shutdown requested");
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_app: &App) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
}

// SIGHUP: baca ulang .env lalu ganti kredensial
#[cfg(unix)]
fn rekey(app: &App) {
    let _ = dotenvy::dotenv_override();
    match (std::env::var("MEXC_API_KEY"), std::env::var("MEXC_API_SECRET")) {
        (Ok(k), Ok(s)) if !k.is_empty() && !s.is_empty() => {
            app.gw.rekey(k, s);
            info!("credentials reloaded");
        }
        _ => warn!("SIGHUP: MEXC_API_KEY / MEXC_API_SECRET not set, keeping current credentials"),
    }
}

async fn control(cmd: Command, args: &Args, limits: Limits) -> listing_sniper::error::Result<()> {
    let ctl = Control::open(args, limits).await?;
    let res = match cmd {
        Command::Refresh => match ctl.catalog.refresh().await {
            Ok(r) => {
                println!(
                    "symbols={} added={} status_changed={} baseline={}",
                    r.total, r.added, r.status_changed, r.baseline
                );
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "refresh failed");
                Ok(())
            }
        },
        Command::Arm { symbol, budget, max_price, order_type } => {
            let new = NewIntent {
                symbol: SymbolId::new(ctl.gw.exchange(), &symbol),
                quote_budget: budget,
                max_price,
                order_type,
            };
            ctl.executor.create_intent(new).await.map(|i| print_intent(&i))
        }
        Command::Cancel { id } => ctl.executor.cancel_intent(id).await.map(|i| print_intent(&i)),
        Command::Intents => ctl.executor.list_intents().await.map(|all| {
            for i in &all {
                print_intent(i);
            }
        }),
        Command::Run => Ok(()),
    };
    ctl.close().await;
    res
}
