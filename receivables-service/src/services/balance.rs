//! Outstanding-balance arithmetic.
//!
//! `total_outstanding` is a client-level aggregate replicated onto invoice
//! rows. Everything here is pure; the ledger decides which rows to load and
//! writes the result back inside the same unit of work.

use crate::models::{amount_limit, Invoice, Scope};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::fmt;
use std::str::FromStr;

fn overflow() -> AppError {
    AppError::BadRequest(anyhow::anyhow!("Amount is out of range"))
}

/// Rejects amounts a money column cannot hold.
pub fn within_range(amount: Decimal) -> Result<Decimal, AppError> {
    if amount.abs() < amount_limit() {
        Ok(amount)
    } else {
        Err(overflow())
    }
}

/// `rate * quantity`, exactly.
pub fn line_total(rate: Decimal, quantity: Decimal) -> Result<Decimal, AppError> {
    rate.checked_mul(quantity)
        .ok_or_else(overflow)
        .and_then(within_range)
}

/// Exact sum of a sequence of amounts. Not range-bound; ledger-wide reports use it.
pub fn sum(amounts: impl IntoIterator<Item = Decimal>) -> Result<Decimal, AppError> {
    amounts
        .into_iter()
        .try_fold(Decimal::ZERO, |acc, amount| acc.checked_add(amount))
        .ok_or_else(overflow)
}

/// Exact sum that will be stamped onto rows.
pub fn bounded_sum(amounts: impl IntoIterator<Item = Decimal>) -> Result<Decimal, AppError> {
    sum(amounts).and_then(within_range)
}

/// Σ `line_total` over the live invoices in `scope`. Zero when there are none.
pub fn recompute(scope: Scope, invoices: &[Invoice]) -> Result<Decimal, AppError> {
    bounded_sum(invoices
        .iter()
        .filter(|i| i.is_live() && i.scope() == scope)
        .map(|i| i.line_total))
}

/// The aggregate currently stamped on the scope, read from its first live row.
pub fn current_aggregate(scope: Scope, invoices: &[Invoice]) -> Decimal {
    invoices
        .iter()
        .find(|i| i.is_live() && i.scope() == scope)
        .map(|i| i.total_outstanding)
        .unwrap_or(Decimal::ZERO)
}

/// `existing - old + new`.
pub fn delta_adjust(existing: Decimal, old: Decimal, new: Decimal) -> Result<Decimal, AppError> {
    existing
        .checked_sub(old)
        .and_then(|v| v.checked_add(new))
        .ok_or_else(overflow)
        .and_then(within_range)
}

/// How an edit rewrites `total_outstanding`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecomputePolicy {
    /// Σ over every live row in the scope, written to the whole scope.
    Recompute,
    /// Previous aggregate minus the touched rows' old line totals plus their
    /// new ones, written to the whole scope.
    DeltaAdjust,
    /// The touched rows' new line totals alone, written to the whole scope.
    Replace,
    /// The touched rows' new line totals alone, written to the touched rows only.
    BatchLocal,
    /// A recurring successor starts its own cycle from its own line total.
    FreshCycle,
}

/// Where a computed aggregate is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateTarget {
    Scope,
    TouchedRows,
}

/// Line totals of the rows an edit touched, plus the aggregate before the edit.
#[derive(Debug, Clone, Copy, Default)]
pub struct Adjustment {
    pub existing: Decimal,
    pub old: Decimal,
    pub new: Decimal,
}

impl RecomputePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecomputePolicy::Recompute => "recompute",
            RecomputePolicy::DeltaAdjust => "delta_adjust",
            RecomputePolicy::Replace => "replace",
            RecomputePolicy::BatchLocal => "batch_local",
            RecomputePolicy::FreshCycle => "fresh_cycle",
        }
    }

    pub fn target(&self) -> AggregateTarget {
        match self {
            RecomputePolicy::Recompute | RecomputePolicy::DeltaAdjust | RecomputePolicy::Replace => {
                AggregateTarget::Scope
            }
            RecomputePolicy::BatchLocal | RecomputePolicy::FreshCycle => {
                AggregateTarget::TouchedRows
            }
        }
    }

    /// New aggregate for an edit in `scope`. `scope_after` holds the scope's
    /// live rows as they are once the edit has been written.
    pub fn aggregate(
        &self,
        scope: Scope,
        adjustment: Adjustment,
        scope_after: &[Invoice],
    ) -> Result<Decimal, AppError> {
        match self {
            RecomputePolicy::Recompute => recompute(scope, scope_after),
            RecomputePolicy::DeltaAdjust => {
                delta_adjust(adjustment.existing, adjustment.old, adjustment.new)
            }
            RecomputePolicy::Replace
            | RecomputePolicy::BatchLocal
            | RecomputePolicy::FreshCycle => within_range(adjustment.new),
        }
    }
}

impl fmt::Display for RecomputePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecomputePolicy {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "recompute" => Ok(RecomputePolicy::Recompute),
            "delta_adjust" => Ok(RecomputePolicy::DeltaAdjust),
            "replace" => Ok(RecomputePolicy::Replace),
            "batch_local" => Ok(RecomputePolicy::BatchLocal),
            "fresh_cycle" => Ok(RecomputePolicy::FreshCycle),
            other => Err(AppError::ConfigError(anyhow::anyhow!(
                "Unknown recompute policy '{}'",
                other
            ))),
        }
    }
}

/// Policies for the edit paths whose business rule is configurable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecomputePolicies {
    /// Editing a draft without promoting it.
    pub draft_update: RecomputePolicy,
    /// Editing several rows of one invoice number at once.
    pub batch_update: RecomputePolicy,
}

impl Default for RecomputePolicies {
    fn default() -> Self {
        Self {
            draft_update: RecomputePolicy::Replace,
            batch_update: RecomputePolicy::BatchLocal,
        }
    }
}

impl RecomputePolicies {
    /// Successor generation owns `fresh_cycle`; edits may not use it.
    pub fn new(
        draft_update: RecomputePolicy,
        batch_update: RecomputePolicy,
    ) -> Result<Self, AppError> {
        for policy in [draft_update, batch_update] {
            if policy == RecomputePolicy::FreshCycle {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Policy '{}' only applies to recurring successors",
                    policy
                )));
            }
        }
        Ok(Self {
            draft_update,
            batch_update,
        })
    }
}
