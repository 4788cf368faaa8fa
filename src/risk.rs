// ===============================
// src/risk.rs
// ===============================
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use ahash::AHashMap as HashMap;
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::config::Limits;
use crate::domain::SymbolId;

/// Which pre-trade gate refused the order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RiskGate {
    Position,
    Concentration,
    DailyLoss,
}

impl RiskGate {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskGate::Position => "position",
            RiskGate::Concentration => "concentration",
            RiskGate::DailyLoss => "daily_loss",
        }
    }
}

impl fmt::Display for RiskGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Block(RiskGate),
}

/// Pre-trade risk port consumed by the validator. Amounts are in the
/// quote asset. Calls are synchronous and must not do I/O.
pub trait RiskPort: Send + Sync {
    fn position_size(&self, symbol: &SymbolId, quote: Decimal) -> Decision;
    fn concentration(&self, symbol: &SymbolId, quote: Decimal) -> Decision;
    fn daily_loss(&self, symbol: &SymbolId, quote: Decimal) -> Decision;

    /// Runs the gates and, when they pass, books `quote` as reserved.
    fn try_reserve(&self, symbol: &SymbolId, quote: Decimal) -> Result<(), RiskGate> {
        evaluate(self, symbol, quote)?;
        self.reserve(symbol, quote);
        Ok(())
    }

    /// Books `quote` for an order that is live on the exchange.
    fn reserve(&self, _symbol: &SymbolId, _quote: Decimal) {}

    /// Drops a reservation whose order never reached the exchange.
    fn release(&self, symbol: &SymbolId, quote: Decimal) {
        self.record_fill(symbol, quote, Decimal::ZERO);
    }

    /// Replaces a reservation with what the order actually spent.
    fn record_fill(&self, _symbol: &SymbolId, _reserved: Decimal, _spent: Decimal) {}

    /// Current mark-to-market loss of today's fills.
    fn mark_loss(&self, _quote: Decimal) {}
}

/// Runs the gates in order, first block wins.
pub fn evaluate<P: RiskPort + ?Sized>(port: &P, symbol: &SymbolId, quote: Decimal) -> Result<(), RiskGate> {
    for decision in [
        port.position_size(symbol, quote),
        port.concentration(symbol, quote),
        port.daily_loss(symbol, quote),
    ] {
        if let Decision::Block(gate) = decision {
            return Err(gate);
        }
    }
    Ok(())
}

#[derive(Debug, Default)]
struct Book {
    total: Decimal,
    per_symbol: HashMap<SymbolId, Decimal>,
    day: Option<NaiveDate>,
    loss_today: Decimal,
}

impl Book {
    // loss counter restarts at UTC midnight
    fn roll(&mut self, today: NaiveDate) {
        if self.day != Some(today) {
            if self.day.is_some() && self.loss_today > Decimal::ZERO {
                info!(loss = %self.loss_today, "risk: daily loss counter reset");
            }
            self.day = Some(today);
            self.loss_today = Decimal::ZERO;
        }
    }

    fn held(&self, symbol: &SymbolId) -> Decimal {
        self.per_symbol.get(symbol).copied().unwrap_or_default()
    }

    fn add(&mut self, symbol: &SymbolId, delta: Decimal) {
        self.total = (self.total + delta).max(Decimal::ZERO);
        let held = (self.held(symbol) + delta).max(Decimal::ZERO);
        if held.is_zero() {
            self.per_symbol.remove(symbol);
        } else {
            self.per_symbol.insert(symbol.clone(), held);
        }
    }
}

/// Limit-based risk using the configured caps. Exposure counts live
/// orders at their reserved notional and settled buys at what they spent.
#[derive(Debug)]
pub struct LimitRisk {
    limits: Limits,
    book: Mutex<Book>,
}

impl LimitRisk {
    pub fn new(limits: Limits) -> Self {
        LimitRisk { limits, book: Mutex::new(Book::default()) }
    }

    fn book(&self) -> MutexGuard<'_, Book> {
        let mut g = match self.book.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        g.roll(Utc::now().date_naive());
        g
    }

    pub fn exposure(&self, symbol: &SymbolId) -> Decimal {
        self.book().held(symbol)
    }

    pub fn total_exposure(&self) -> Decimal {
        self.book().total
    }

    fn check(&self, b: &Book, symbol: &SymbolId, quote: Decimal) -> Result<(), RiskGate> {
        if b.total + quote > self.limits.max_position_quote {
            return Err(RiskGate::Position);
        }
        if b.held(symbol) + quote > self.limits.max_symbol_quote {
            return Err(RiskGate::Concentration);
        }
        if b.loss_today >= self.limits.max_daily_loss_quote {
            return Err(RiskGate::DailyLoss);
        }
        Ok(())
    }
}

impl RiskPort for LimitRisk {
    fn position_size(&self, _symbol: &SymbolId, quote: Decimal) -> Decision {
        if self.book().total + quote > self.limits.max_position_quote {
            return Decision::Block(RiskGate::Position);
        }
        Decision::Allow
    }

    fn concentration(&self, symbol: &SymbolId, quote: Decimal) -> Decision {
        if self.book().held(symbol) + quote > self.limits.max_symbol_quote {
            return Decision::Block(RiskGate::Concentration);
        }
        Decision::Allow
    }

    fn daily_loss(&self, _symbol: &SymbolId, _quote: Decimal) -> Decision {
        if self.book().loss_today >= self.limits.max_daily_loss_quote {
            return Decision::Block(RiskGate::DailyLoss);
        }
        Decision::Allow
    }

    // one lock for check and booking, so parallel lanes cannot both pass
    fn try_reserve(&self, symbol: &SymbolId, quote: Decimal) -> Result<(), RiskGate> {
        let mut b = self.book();
        self.check(&b, symbol, quote)?;
        b.add(symbol, quote);
        debug!(%symbol, %quote, total = %b.total, "risk: notional reserved");
        Ok(())
    }

    fn reserve(&self, symbol: &SymbolId, quote: Decimal) {
        let mut b = self.book();
        b.add(symbol, quote);
        debug!(%symbol, %quote, total = %b.total, "risk: notional reserved");
    }

    fn record_fill(&self, symbol: &SymbolId, reserved: Decimal, spent: Decimal) {
        let mut b = self.book();
        b.add(symbol, spent - reserved);
        if spent > Decimal::ZERO {
            info!(%symbol, %spent, total = %b.total, "risk: exposure recorded");
        }
    }

    fn mark_loss(&self, quote: Decimal) {
        let mut b = self.book();
        b.loss_today = quote.abs();
        if b.loss_today >= self.limits.max_daily_loss_quote {
            warn!(loss = %b.loss_today, cap = %self.limits.max_daily_loss_quote, "risk: daily loss cap reached");
        }
    }
}
