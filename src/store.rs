// ===============================
// src/store.rs
// ===============================
//
// SQLite persistence (sqlx, runtime queries).
// Decimal -> TEXT, timestamps -> INTEGER epoch ms.
// One transaction per logical operation; intent transitions are optimistic
// (`WHERE state = ?`) so a lost race shows up as `false`, never as a double move.
//
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, QueryBuilder, Sqlite};
use tracing::info;
use uuid::Uuid;

use crate::domain::{
    now_ms, parse_decimal, IntentState, ListingEvent, ListingKind, NewIntent, Order, OrderAck,
    OrderStatus, OrderType, Side, SnipeIntent, Source, Symbol, SymbolId, SymbolStatus,
};
use crate::error::{CoreError, Result};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS symbols (
        id TEXT PRIMARY KEY,
        exchange TEXT NOT NULL,
        ticker TEXT NOT NULL,
        base TEXT NOT NULL,
        quote TEXT NOT NULL,
        status TEXT NOT NULL,
        listing_ts INTEGER,
        trading_ts INTEGER,
        price_precision INTEGER NOT NULL CHECK (price_precision >= 0),
        qty_precision INTEGER NOT NULL CHECK (qty_precision >= 0),
        min_qty TEXT NOT NULL,
        max_qty TEXT NOT NULL,
        min_notional TEXT NOT NULL,
        tick_size TEXT NOT NULL,
        step_size TEXT NOT NULL,
        allowed_order_types TEXT NOT NULL DEFAULT '',
        updated_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS listing_events (
        id INTEGER PRIMARY KEY,
        symbol_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        status TEXT,
        source TEXT NOT NULL,
        payload_hash TEXT NOT NULL UNIQUE,
        trading_ts INTEGER,
        detected_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS ix_listing_events_symbol ON listing_events(symbol_id)",
    "CREATE TABLE IF NOT EXISTS snipe_intents (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        symbol_id TEXT NOT NULL,
        quote_budget TEXT NOT NULL,
        max_price TEXT NOT NULL,
        order_type TEXT NOT NULL DEFAULT 'MARKET',
        state TEXT NOT NULL,
        client_order_id TEXT UNIQUE,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    // at most one live intent per symbol
    "CREATE UNIQUE INDEX IF NOT EXISTS ux_snipe_intents_live ON snipe_intents(symbol_id)
        WHERE state IN ('PENDING', 'ARMED', 'SUBMITTED')",
    "CREATE TABLE IF NOT EXISTS orders (
        id TEXT PRIMARY KEY,
        client_order_id TEXT NOT NULL UNIQUE,
        exchange_order_id TEXT,
        symbol_id TEXT NOT NULL,
        side TEXT NOT NULL,
        type TEXT NOT NULL,
        qty TEXT NOT NULL,
        price TEXT,
        status TEXT NOT NULL,
        executed_qty TEXT NOT NULL,
        executed_quote_qty TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS dead_letters (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        event_id INTEGER,
        worker TEXT NOT NULL,
        reason TEXT NOT NULL,
        recorded_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS dedup_snapshot (
        payload_hash TEXT PRIMARY KEY,
        first_seen_at INTEGER NOT NULL
    )",
];

// sqlite default SQLITE_MAX_VARIABLE_NUMBER is 999 on older builds
const SNAPSHOT_CHUNK: usize = 400;

fn corrupt(what: &str, value: &str) -> sqlx::Error {
    sqlx::Error::Decode(format!("bad {what} in row: {value:?}").into())
}

fn dec_col(what: &str, s: &str) -> std::result::Result<Decimal, sqlx::Error> {
    parse_decimal(s).ok_or_else(|| corrupt(what, s))
}

// ---- rows ----

#[derive(Debug, FromRow)]
struct SymbolRow {
    id: String,
    base: String,
    quote: String,
    status: String,
    listing_ts: Option<i64>,
    trading_ts: Option<i64>,
    price_precision: i64,
    qty_precision: i64,
    min_qty: String,
    max_qty: String,
    min_notional: String,
    tick_size: String,
    step_size: String,
    allowed_order_types: String,
    updated_at: i64,
}

impl TryFrom<SymbolRow> for Symbol {
    type Error = sqlx::Error;

    fn try_from(r: SymbolRow) -> std::result::Result<Self, Self::Error> {
        Ok(Symbol {
            id: SymbolId::parse(&r.id).ok_or_else(|| corrupt("symbol id", &r.id))?,
            base: r.base,
            quote: r.quote,
            status: SymbolStatus::parse(&r.status).ok_or_else(|| corrupt("status", &r.status))?,
            listing_ts: r.listing_ts,
            trading_ts: r.trading_ts,
            price_precision: r.price_precision.max(0) as u32,
            qty_precision: r.qty_precision.max(0) as u32,
            min_qty: dec_col("min_qty", &r.min_qty)?,
            max_qty: dec_col("max_qty", &r.max_qty)?,
            min_notional: dec_col("min_notional", &r.min_notional)?,
            tick_size: dec_col("tick_size", &r.tick_size)?,
            step_size: dec_col("step_size", &r.step_size)?,
            allowed_order_types: r
                .allowed_order_types
                .split(',')
                .filter_map(OrderType::parse)
                .collect(),
            updated_at: r.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct EventRow {
    id: i64,
    symbol_id: String,
    kind: String,
    status: Option<String>,
    source: String,
    payload_hash: String,
    trading_ts: Option<i64>,
    detected_at: i64,
}

impl TryFrom<EventRow> for ListingEvent {
    type Error = sqlx::Error;

    fn try_from(r: EventRow) -> std::result::Result<Self, Self::Error> {
        Ok(ListingEvent {
            id: r.id.max(0) as u64,
            symbol: SymbolId::parse(&r.symbol_id).ok_or_else(|| corrupt("symbol id", &r.symbol_id))?,
            kind: ListingKind::from_parts(&r.kind, r.status.as_deref()).ok_or_else(|| corrupt("kind", &r.kind))?,
            source: Source::parse(&r.source).ok_or_else(|| corrupt("source", &r.source))?,
            detected_at: r.detected_at,
            trading_ts: r.trading_ts,
            payload_hash: r.payload_hash,
        })
    }
}

#[derive(Debug, FromRow)]
struct IntentRow {
    id: i64,
    symbol_id: String,
    quote_budget: String,
    max_price: String,
    order_type: String,
    state: String,
    client_order_id: Option<String>,
    attempts: i64,
    last_error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<IntentRow> for SnipeIntent {
    type Error = sqlx::Error;

    fn try_from(r: IntentRow) -> std::result::Result<Self, Self::Error> {
        Ok(SnipeIntent {
            id: r.id,
            symbol: SymbolId::parse(&r.symbol_id).ok_or_else(|| corrupt("symbol id", &r.symbol_id))?,
            quote_budget: dec_col("quote_budget", &r.quote_budget)?,
            max_price: dec_col("max_price", &r.max_price)?,
            order_type: OrderType::parse(&r.order_type).ok_or_else(|| corrupt("order type", &r.order_type))?,
            state: IntentState::parse(&r.state).ok_or_else(|| corrupt("state", &r.state))?,
            client_order_id: r.client_order_id,
            attempts: r.attempts.max(0) as u32,
            last_error: r.last_error,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct OrderRow {
    id: String,
    client_order_id: String,
    exchange_order_id: Option<String>,
    symbol_id: String,
    side: String,
    #[sqlx(rename = "type")]
    order_type: String,
    qty: String,
    price: Option<String>,
    status: String,
    executed_qty: String,
    executed_quote_qty: String,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<OrderRow> for Order {
    type Error = sqlx::Error;

    fn try_from(r: OrderRow) -> std::result::Result<Self, Self::Error> {
        Ok(Order {
            id: Uuid::parse_str(&r.id).map_err(|_| corrupt("order id", &r.id))?,
            client_order_id: r.client_order_id,
            exchange_order_id: r.exchange_order_id,
            symbol: SymbolId::parse(&r.symbol_id).ok_or_else(|| corrupt("symbol id", &r.symbol_id))?,
            side: Side::parse(&r.side).ok_or_else(|| corrupt("side", &r.side))?,
            order_type: OrderType::parse(&r.order_type).ok_or_else(|| corrupt("order type", &r.order_type))?,
            qty: dec_col("qty", &r.qty)?,
            price: match r.price {
                Some(p) => Some(dec_col("price", &p)?),
                None => None,
            },
            status: OrderStatus::parse(&r.status).ok_or_else(|| corrupt("order status", &r.status))?,
            executed_qty: dec_col("executed_qty", &r.executed_qty)?,
            executed_quote_qty: dec_col("executed_quote_qty", &r.executed_quote_qty)?,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct DeadLetter {
    pub id: i64,
    pub event_id: Option<i64>,
    pub worker: String,
    pub reason: String,
    pub recorded_at: i64,
}

fn collect<R, T>(rows: Vec<R>) -> Result<Vec<T>>
where
    T: TryFrom<R, Error = sqlx::Error>,
{
    rows.into_iter()
        .map(|r| T::try_from(r).map_err(CoreError::from))
        .collect()
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

const ORDER_COLS: &str = "id, client_order_id, exchange_order_id, symbol_id, side, type, qty, price, status, \
                          executed_qty, executed_quote_qty, created_at, updated_at";
const INTENT_COLS: &str = "id, symbol_id, quote_budget, max_price, order_type, state, client_order_id, attempts, \
                           last_error, created_at, updated_at";

#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens (creating if missing) and migrates. `max`/`min` size the pool.
    pub async fn connect(url: &str, max: u32, min: u32) -> Result<Self> {
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let mut opts = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        if !in_memory {
            opts = opts.journal_mode(SqliteJournalMode::Wal);
        }

        // every connection to sqlite::memory: is its own database
        let pool = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(opts)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(max.max(1))
                .min_connections(min.min(max))
                .connect_with(opts)
                .await?
        };

        let store = Store { pool };
        store.migrate().await?;
        info!(%url, "store ready");
        Ok(store)
    }

    pub async fn memory() -> Result<Self> {
        Self::connect("sqlite::memory:", 1, 1).await
    }

    async fn migrate(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ================= symbols =================

    pub async fn load_symbols(&self) -> Result<Vec<Symbol>> {
        let rows: Vec<SymbolRow> = sqlx::query_as(
            "SELECT id, base, quote, status, listing_ts, trading_ts, price_precision, qty_precision,
                    min_qty, max_qty, min_notional, tick_size, step_size, allowed_order_types, updated_at
             FROM symbols ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        collect(rows)
    }

    pub async fn get_symbol(&self, id: &SymbolId) -> Result<Option<Symbol>> {
        let row: Option<SymbolRow> = sqlx::query_as(
            "SELECT id, base, quote, status, listing_ts, trading_ts, price_precision, qty_precision,
                    min_qty, max_qty, min_notional, tick_size, step_size, allowed_order_types, updated_at
             FROM symbols WHERE id = ?",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Symbol::try_from).transpose()?)
    }

    pub async fn symbol_count(&self) -> Result<i64> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM symbols")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    /// Upserts every row by identity in one transaction.
    pub async fn upsert_symbols(&self, symbols: &[Symbol]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for s in symbols {
            upsert_symbol_q(s).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn upsert_symbol(&self, symbol: &Symbol) -> Result<()> {
        upsert_symbol_q(symbol).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn update_symbol_status(&self, id: &SymbolId, status: SymbolStatus) -> Result<bool> {
        let res = sqlx::query("UPDATE symbols SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now_ms())
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    // ================= listing events =================

    pub async fn max_event_id(&self) -> Result<u64> {
        let (max,): (Option<i64>,) = sqlx::query_as("SELECT MAX(id) FROM listing_events")
            .fetch_one(&self.pool)
            .await?;
        Ok(max.unwrap_or(0).max(0) as u64)
    }

    /// Inserts the event unless its hash was recorded after `window_start`.
    /// Returns false for such a duplicate. Older rows with the same hash are
    /// replaced, since they fell out of the dedup window.
    pub async fn record_event(&self, ev: &ListingEvent, window_start: i64) -> Result<bool> {
        let res = sqlx::query(
            "INSERT INTO listing_events (id, symbol_id, kind, status, source, payload_hash, trading_ts, detected_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(payload_hash) DO UPDATE SET
                id = excluded.id,
                symbol_id = excluded.symbol_id,
                kind = excluded.kind,
                status = excluded.status,
                source = excluded.source,
                trading_ts = excluded.trading_ts,
                detected_at = excluded.detected_at
             WHERE listing_events.detected_at < ?",
        )
        .bind(ev.id as i64)
        .bind(ev.symbol.as_str())
        .bind(ev.kind.as_str())
        .bind(ev.kind.new_status().map(|s| s.as_str()))
        .bind(ev.source.as_str())
        .bind(&ev.payload_hash)
        .bind(ev.trading_ts)
        .bind(ev.detected_at)
        .bind(window_start)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn events_for(&self, symbol: &SymbolId) -> Result<Vec<ListingEvent>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            "SELECT id, symbol_id, kind, status, source, payload_hash, trading_ts, detected_at
             FROM listing_events WHERE symbol_id = ? ORDER BY id",
        )
        .bind(symbol.as_str())
        .fetch_all(&self.pool)
        .await?;
        collect(rows)
    }

    // ================= snipe intents =================

    /// New intents start PENDING. A second live intent for the same symbol
    /// is refused.
    pub async fn insert_intent(&self, new: &NewIntent) -> Result<SnipeIntent> {
        let now = now_ms();
        let res = sqlx::query(
            "INSERT INTO snipe_intents (symbol_id, quote_budget, max_price, order_type, state, attempts, created_at, updated_at)
             VALUES (?, ?, ?, ?, 'PENDING', 0, ?, ?)",
        )
        .bind(new.symbol.as_str())
        .bind(new.quote_budget.to_string())
        .bind(new.max_price.to_string())
        .bind(new.order_type.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;
        let res = match res {
            Ok(r) => r,
            Err(e) if is_unique_violation(&e) => {
                return Err(CoreError::InvalidState(format!("{} already has a live intent", new.symbol)))
            }
            Err(e) => return Err(e.into()),
        };
        let id = res.last_insert_rowid();
        self.get_intent(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("intent {id}")))
    }

    pub async fn get_intent(&self, id: i64) -> Result<Option<SnipeIntent>> {
        let row: Option<IntentRow> = sqlx::query_as(&format!("SELECT {INTENT_COLS} FROM snipe_intents WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(SnipeIntent::try_from).transpose()?)
    }

    pub async fn list_intents(&self) -> Result<Vec<SnipeIntent>> {
        let rows: Vec<IntentRow> = sqlx::query_as(&format!("SELECT {INTENT_COLS} FROM snipe_intents ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;
        collect(rows)
    }

    pub async fn intents_in_state(&self, state: IntentState) -> Result<Vec<SnipeIntent>> {
        let rows: Vec<IntentRow> =
            sqlx::query_as(&format!("SELECT {INTENT_COLS} FROM snipe_intents WHERE state = ? ORDER BY id"))
                .bind(state.as_str())
                .fetch_all(&self.pool)
                .await?;
        collect(rows)
    }

    pub async fn intents_for_symbol(&self, symbol: &SymbolId, state: IntentState) -> Result<Vec<SnipeIntent>> {
        let rows: Vec<IntentRow> = sqlx::query_as(&format!(
            "SELECT {INTENT_COLS} FROM snipe_intents WHERE symbol_id = ? AND state = ? ORDER BY id"
        ))
        .bind(symbol.as_str())
        .bind(state.as_str())
        .fetch_all(&self.pool)
        .await?;
        collect(rows)
    }

    /// Optimistic move `from -> to`. False when the intent was not in `from`.
    pub async fn transition_intent(
        &self,
        id: i64,
        from: IntentState,
        to: IntentState,
        last_error: Option<&str>,
    ) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE snipe_intents SET state = ?, last_error = COALESCE(?, last_error), updated_at = ?
             WHERE id = ? AND state = ?",
        )
        .bind(to.as_str())
        .bind(last_error)
        .bind(now_ms())
        .bind(id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Records why a pre-check failed without changing state.
    pub async fn note_intent_error(&self, id: i64, last_error: &str) -> Result<()> {
        sqlx::query("UPDATE snipe_intents SET last_error = ?, updated_at = ? WHERE id = ?")
            .bind(last_error)
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// ARMED -> SUBMITTED together with the client order id and the order row.
    /// Only called after the exchange acknowledged the order.
    pub async fn commit_submission(&self, intent_id: i64, attempts: u32, order: &Order) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let res = sqlx::query(
            "UPDATE snipe_intents
             SET state = 'SUBMITTED', client_order_id = ?, attempts = ?, last_error = NULL, updated_at = ?
             WHERE id = ? AND state = 'ARMED'",
        )
        .bind(&order.client_order_id)
        .bind(attempts as i64)
        .bind(now_ms())
        .bind(intent_id)
        .execute(&mut *tx)
        .await?;
        if res.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        insert_order_q(order).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Terminal failure of an intent in state `from`. The attempted order,
    /// if any, is stored and linked through its client order id.
    pub async fn fail_intent(
        &self,
        intent_id: i64,
        from: IntentState,
        attempts: u32,
        last_error: &str,
        attempted: Option<&Order>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let res = sqlx::query(
            "UPDATE snipe_intents
             SET state = 'FAILED', attempts = ?, last_error = ?,
                 client_order_id = COALESCE(?, client_order_id), updated_at = ?
             WHERE id = ? AND state = ?",
        )
        .bind(attempts as i64)
        .bind(last_error)
        .bind(attempted.map(|o| o.client_order_id.as_str()))
        .bind(now_ms())
        .bind(intent_id)
        .bind(from.as_str())
        .execute(&mut *tx)
        .await?;
        if res.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        if let Some(order) = attempted {
            insert_order_q(order).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    // ================= orders =================

    pub async fn get_order(&self, client_order_id: &str) -> Result<Option<Order>> {
        let row: Option<OrderRow> = sqlx::query_as(&format!("SELECT {ORDER_COLS} FROM orders WHERE client_order_id = ?"))
            .bind(client_order_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Order::try_from).transpose()?)
    }

    pub async fn orders_for_symbol(&self, symbol: &SymbolId) -> Result<Vec<Order>> {
        let rows: Vec<OrderRow> =
            sqlx::query_as(&format!("SELECT {ORDER_COLS} FROM orders WHERE symbol_id = ? ORDER BY created_at"))
                .bind(symbol.as_str())
                .fetch_all(&self.pool)
                .await?;
        collect(rows)
    }

    /// Orders that traded anything, oldest first.
    pub async fn orders_with_fills(&self) -> Result<Vec<Order>> {
        // decimals are stored as text, filter after decoding
        let rows: Vec<OrderRow> = sqlx::query_as(&format!("SELECT {ORDER_COLS} FROM orders ORDER BY created_at"))
            .fetch_all(&self.pool)
            .await?;
        let orders: Vec<Order> = collect(rows)?;
        Ok(orders.into_iter().filter(|o| o.executed_qty > Decimal::ZERO).collect())
    }

    /// Applies an exchange status report. Terminal rows are never touched;
    /// returns the row as stored afterwards, or None when it is unknown.
    pub async fn apply_order_update(&self, ack: &OrderAck) -> Result<Option<Order>> {
        let mut tx = self.pool.begin().await?;
        let row: Option<OrderRow> =
            sqlx::query_as(&format!("SELECT {ORDER_COLS} FROM orders WHERE client_order_id = ?"))
                .bind(&ack.client_order_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let mut order = Order::try_from(row)?;
        if order.status.is_terminal() {
            tx.rollback().await?;
            return Ok(Some(order));
        }

        order.status = ack.status;
        order.executed_qty = ack.executed_qty.min(order.qty);
        order.executed_quote_qty = ack.executed_quote_qty;
        if order.exchange_order_id.is_none() {
            order.exchange_order_id = ack.exchange_order_id.clone();
        }
        order.updated_at = now_ms();

        sqlx::query(
            "UPDATE orders SET status = ?, executed_qty = ?, executed_quote_qty = ?, exchange_order_id = ?, updated_at = ?
             WHERE client_order_id = ?",
        )
        .bind(order.status.as_str())
        .bind(order.executed_qty.to_string())
        .bind(order.executed_quote_qty.to_string())
        .bind(order.exchange_order_id.as_deref())
        .bind(order.updated_at)
        .bind(&order.client_order_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(Some(order))
    }

    // ================= dead letters =================

    pub async fn record_dead_letter(&self, event_id: Option<u64>, worker: &str, reason: &str) -> Result<()> {
        sqlx::query("INSERT INTO dead_letters (event_id, worker, reason, recorded_at) VALUES (?, ?, ?, ?)")
            .bind(event_id.map(|id| id as i64))
            .bind(worker)
            .bind(reason)
            .bind(now_ms())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        let rows: Vec<DeadLetter> =
            sqlx::query_as("SELECT id, event_id, worker, reason, recorded_at FROM dead_letters ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    // ================= dedup snapshot =================

    /// Replaces the stored snapshot with `entries` (hash, first_seen_at).
    pub async fn save_dedup_snapshot(&self, entries: &[(String, i64)]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM dedup_snapshot").execute(&mut *tx).await?;
        for chunk in entries.chunks(SNAPSHOT_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("INSERT OR REPLACE INTO dedup_snapshot (payload_hash, first_seen_at) ");
            qb.push_values(chunk, |mut b, (hash, seen)| {
                b.push_bind(hash.as_str()).push_bind(*seen);
            });
            qb.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn load_dedup_snapshot(&self, since: i64) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT payload_hash, first_seen_at FROM dedup_snapshot WHERE first_seen_at >= ? ORDER BY first_seen_at",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

fn upsert_symbol_q(s: &Symbol) -> sqlx::query::Query<'_, Sqlite, sqlx::sqlite::SqliteArguments<'_>> {
    let order_types = s
        .allowed_order_types
        .iter()
        .map(|t| t.as_str())
        .collect::<Vec<_>>()
        .join(",");
    sqlx::query(
        "INSERT INTO symbols (id, exchange, ticker, base, quote, status, listing_ts, trading_ts, price_precision,
                              qty_precision, min_qty, max_qty, min_notional, tick_size, step_size,
                              allowed_order_types, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
            base = excluded.base,
            quote = excluded.quote,
            status = excluded.status,
            listing_ts = COALESCE(excluded.listing_ts, symbols.listing_ts),
            trading_ts = COALESCE(excluded.trading_ts, symbols.trading_ts),
            price_precision = excluded.price_precision,
            qty_precision = excluded.qty_precision,
            min_qty = excluded.min_qty,
            max_qty = excluded.max_qty,
            min_notional = excluded.min_notional,
            tick_size = excluded.tick_size,
            step_size = excluded.step_size,
            allowed_order_types = excluded.allowed_order_types,
            updated_at = excluded.updated_at",
    )
    .bind(s.id.as_str())
    .bind(s.id.exchange())
    .bind(s.id.ticker())
    .bind(&s.base)
    .bind(&s.quote)
    .bind(s.status.as_str())
    .bind(s.listing_ts)
    .bind(s.trading_ts)
    .bind(s.price_precision as i64)
    .bind(s.qty_precision as i64)
    .bind(s.min_qty.to_string())
    .bind(s.max_qty.to_string())
    .bind(s.min_notional.to_string())
    .bind(s.tick_size.to_string())
    .bind(s.step_size.to_string())
    .bind(order_types)
    .bind(s.updated_at)
}

fn insert_order_q(o: &Order) -> sqlx::query::Query<'_, Sqlite, sqlx::sqlite::SqliteArguments<'_>> {
    sqlx::query(
        "INSERT INTO orders (id, client_order_id, exchange_order_id, symbol_id, side, type, qty, price, status,
                             executed_qty, executed_quote_qty, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(o.id.to_string())
    .bind(&o.client_order_id)
    .bind(o.exchange_order_id.as_deref())
    .bind(o.symbol.as_str())
    .bind(o.side.as_str())
    .bind(o.order_type.as_str())
    .bind(o.qty.to_string())
    .bind(o.price.map(|p| p.to_string()))
    .bind(o.status.as_str())
    .bind(o.executed_qty.to_string())
    .bind(o.executed_quote_qty.to_string())
    .bind(o.created_at)
    .bind(o.updated_at)
}
