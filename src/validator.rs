// ===============================
// src/validator.rs
// ===============================
//
// Order Validator: symbol filters first, then the risk gates.
// All grid math is exact decimal; quantities are floored, never rounded up.
//
use std::sync::Arc;

use rust_decimal::Decimal;
use thiserror::Error;

use crate::domain::{OrderType, Symbol, SymbolStatus};
use crate::error::ErrorKind;
use crate::risk::{self, RiskGate, RiskPort};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("TickMisaligned: price {price} is not a multiple of tick {tick}")]
    TickMisaligned { price: Decimal, tick: Decimal },

    #[error("StepMisaligned: quantity {qty} is not a multiple of step {step}")]
    StepMisaligned { qty: Decimal, step: Decimal },

    #[error("BelowMin: quantity {qty} below min {min}")]
    BelowMin { qty: Decimal, min: Decimal },

    #[error("AboveMax: quantity {qty} above max {max}")]
    AboveMax { qty: Decimal, max: Decimal },

    #[error("BelowMinNotional: notional {notional} below {min}")]
    BelowMinNotional { notional: Decimal, min: Decimal },

    #[error("NotTrading: symbol status is {0}")]
    NotTrading(SymbolStatus),

    #[error("OrderTypeNotAllowed: {0}")]
    OrderTypeNotAllowed(OrderType),

    #[error("InvalidPrice: {0}")]
    InvalidPrice(String),

    #[error("PriceAboveMax: last price {last} above max {max}")]
    PriceAboveMax { last: Decimal, max: Decimal },

    #[error("RiskBlocked: {0}")]
    RiskBlocked(RiskGate),
}

impl ValidationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ValidationError::RiskBlocked(_) => ErrorKind::RiskBlocked,
            _ => ErrorKind::InputInvalid,
        }
    }
}

/// Numeric tolerance for the tick check.
pub fn tick_tolerance() -> Decimal {
    Decimal::new(1, 12)
}

/// Largest multiple of `step` that is <= `value`.
pub fn floor_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    match value.checked_div(step) {
        Some(n) => (n.floor() * step).normalize(),
        None => Decimal::ZERO,
    }
}

/// `floor(budget / max_price / step) * step`
pub fn quantity_for(budget: Decimal, max_price: Decimal, step: Decimal) -> Decimal {
    if max_price <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    match budget.checked_div(max_price) {
        Some(units) => floor_to_step(units, step),
        None => Decimal::ZERO,
    }
}

fn on_grid(value: Decimal, grid: Decimal) -> bool {
    match value.checked_div(grid) {
        Some(ratio) => ratio - ratio.floor() <= tick_tolerance(),
        None => false,
    }
}

/// What the executor wants to place.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderProposal {
    pub order_type: OrderType,
    pub quote_budget: Decimal,
    pub max_price: Decimal,
    pub qty: Decimal,
    /// Required for LIMIT and IOC.
    pub price: Option<Decimal>,
}

impl OrderProposal {
    /// Sizes a buy from a budget: quantity floored to the step grid,
    /// limit price floored to the tick grid.
    pub fn sized(order_type: OrderType, quote_budget: Decimal, max_price: Decimal, symbol: &Symbol) -> Self {
        let price = order_type
            .needs_price()
            .then(|| floor_to_step(max_price, symbol.tick_size));
        let qty = quantity_for(quote_budget, price.unwrap_or(max_price), symbol.step_size);
        OrderProposal { order_type, quote_budget, max_price, qty, price }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedOrder {
    pub order_type: OrderType,
    pub qty: Decimal,
    pub price: Option<Decimal>,
    /// Quote amount put at risk.
    pub notional: Decimal,
}

pub struct OrderValidator {
    risk: Arc<dyn RiskPort>,
    allow_pre_listed: bool,
}

impl OrderValidator {
    pub fn new(risk: Arc<dyn RiskPort>, allow_pre_listed: bool) -> Self {
        OrderValidator { risk, allow_pre_listed }
    }

    pub fn risk(&self) -> &Arc<dyn RiskPort> {
        &self.risk
    }

    /// Filters, then the risk gates. Books nothing.
    pub fn validate(&self, p: &OrderProposal, s: &Symbol) -> Result<ValidatedOrder, ValidationError> {
        let order = self.check_filters(p, s)?;
        risk::evaluate(self.risk.as_ref(), &s.id, order.notional).map_err(ValidationError::RiskBlocked)?;
        Ok(order)
    }

    /// Like `validate`, but a passing order keeps its notional reserved in
    /// the risk book. The caller owns the reservation from then on.
    pub fn validate_and_reserve(&self, p: &OrderProposal, s: &Symbol) -> Result<ValidatedOrder, ValidationError> {
        let order = self.check_filters(p, s)?;
        self.risk
            .try_reserve(&s.id, order.notional)
            .map_err(ValidationError::RiskBlocked)?;
        Ok(order)
    }

    fn check_filters(&self, p: &OrderProposal, s: &Symbol) -> Result<ValidatedOrder, ValidationError> {
        // status
        match s.status {
            SymbolStatus::Trading => {}
            SymbolStatus::PreListed if self.allow_pre_listed => {}
            other => return Err(ValidationError::NotTrading(other)),
        }
        if !s.allows(p.order_type) {
            return Err(ValidationError::OrderTypeNotAllowed(p.order_type));
        }

        // price
        let price = if p.order_type.needs_price() {
            let price = p
                .price
                .ok_or_else(|| ValidationError::InvalidPrice(format!("{} order without price", p.order_type)))?;
            if price <= Decimal::ZERO {
                return Err(ValidationError::InvalidPrice(format!("non-positive price {price}")));
            }
            if !on_grid(price, s.tick_size) {
                return Err(ValidationError::TickMisaligned { price, tick: s.tick_size });
            }
            Some(price)
        } else {
            None
        };

        // quantity
        let floored = floor_to_step(p.qty, s.step_size);
        if floored <= Decimal::ZERO || floored < s.min_qty {
            return Err(ValidationError::BelowMin { qty: p.qty, min: s.min_qty });
        }
        if floored > s.max_qty {
            return Err(ValidationError::AboveMax { qty: floored, max: s.max_qty });
        }
        if floored != p.qty {
            return Err(ValidationError::StepMisaligned { qty: p.qty, step: s.step_size });
        }

        // notional
        let notional = match price {
            Some(px) => {
                let n = px * p.qty;
                if n < s.min_notional {
                    return Err(ValidationError::BelowMinNotional { notional: n, min: s.min_notional });
                }
                n
            }
            None => {
                if p.quote_budget < s.min_notional {
                    return Err(ValidationError::BelowMinNotional {
                        notional: p.quote_budget,
                        min: s.min_notional,
                    });
                }
                p.quote_budget
            }
        };

        Ok(ValidatedOrder { order_type: p.order_type, qty: p.qty, price, notional })
    }
}

/// Refuses to buy when the market already trades above the intent's cap.
pub fn check_price_guard(last: Decimal, max_price: Decimal) -> Result<(), ValidationError> {
    if last > max_price {
        return Err(ValidationError::PriceAboveMax { last, max: max_price });
    }
    Ok(())
}
