// ===============================
// src/autosnipe.rs
// ===============================
//
// Rule-created intents: every DISCOVERED symbol quoted in one of the
// configured assets gets an intent with the rule's budget and price cap.
// Runs as an ordinary bus subscriber next to the executor.
//
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::bus::Handler;
use crate::catalog::Catalog;
use crate::config::AutoSnipeCfg;
use crate::domain::{IntentState, ListingEvent, ListingKind, NewIntent, SymbolStatus};
use crate::error::ErrorKind;
use crate::executor::{Executor, Job};

pub struct AutoSnipe {
    rule: AutoSnipeCfg,
    executor: Arc<Executor>,
    catalog: Arc<Catalog>,
}

impl AutoSnipe {
    pub fn new(rule: AutoSnipeCfg, executor: Arc<Executor>, catalog: Arc<Catalog>) -> Self {
        AutoSnipe { rule, executor, catalog }
    }
}

#[async_trait]
impl Handler for AutoSnipe {
    async fn handle(&self, event: Arc<ListingEvent>) {
        if event.kind != ListingKind::Discovered {
            return;
        }
        let Some(sym) = self.catalog.get(&event.symbol) else {
            debug!(symbol = %event.symbol, "auto-snipe: symbol not in catalog");
            return;
        };
        if !self.rule.matches_quote(&sym.quote) {
            return;
        }

        let new = NewIntent {
            symbol: sym.id.clone(),
            quote_budget: self.rule.quote_budget,
            max_price: self.rule.max_price,
            order_type: self.rule.order_type,
        };
        let intent = match self.executor.create_intent(new).await {
            Ok(i) => i,
            // one live intent per symbol; an operator got there first
            Err(e) if e.kind() == ErrorKind::InputInvalid => {
                debug!(symbol = %sym.id, error = %e, "auto-snipe: intent not created");
                return;
            }
            Err(e) => {
                warn!(symbol = %sym.id, error = %e, kind = %e.kind(), "auto-snipe: intent not created");
                return;
            }
        };
        info!(
            intent = intent.id,
            symbol = %sym.id,
            budget = %intent.quote_budget,
            max_price = %intent.max_price,
            state = %intent.state,
            "auto-snipe intent created"
        );

        // TRADING_OPEN may already have gone past the executor
        let open = self
            .catalog
            .get(&sym.id)
            .map_or(false, |s| s.status == SymbolStatus::Trading);
        if open && intent.state == IntentState::Armed {
            self.executor.dispatch(Job::Fire { symbol: sym.id, event_id: Some(event.id), detected_at: None });
        }
    }
}
