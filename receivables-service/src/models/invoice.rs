//! Invoice model for receivables-service.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::{Validate, ValidationError};

/// Aggregation scope. Draft and final invoices are summed separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Final,
    Draft,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Final => "final",
            Scope::Draft => "draft",
        }
    }

    pub fn from_is_draft(is_draft: bool) -> Self {
        if is_draft {
            Scope::Draft
        } else {
            Scope::Final
        }
    }

    pub fn is_draft(&self) -> bool {
        matches!(self, Scope::Draft)
    }
}

/// Invoice row.
///
/// `total_outstanding` is the client's aggregate for this row's scope,
/// replicated onto every row rather than a per-invoice residual.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invoice {
    pub invoice_id: Uuid,
    pub invoice_number: String,
    pub client_id: Uuid,
    pub description: String,
    pub rate: Decimal,
    pub quantity: Decimal,
    pub line_total: Decimal,
    pub total_outstanding: Decimal,
    pub is_draft: bool,
    pub is_recurring: bool,
    pub issued_date: DateTime<Utc>,
    pub due_date: DateTime<Utc>,
    pub notes: Option<String>,
    pub terms: Option<String>,
    pub predecessor_id: Option<Uuid>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
    pub deleted_utc: Option<DateTime<Utc>>,
}

impl Invoice {
    pub fn is_live(&self) -> bool {
        self.deleted_utc.is_none()
    }

    pub fn scope(&self) -> Scope {
        Scope::from_is_draft(self.is_draft)
    }
}

/// Exclusive bound on the magnitude of any stored amount. Money columns are
/// `NUMERIC(19,4)`, which leaves fifteen integer digits.
pub fn amount_limit() -> Decimal {
    Decimal::from(1_000_000_000_000_000i64)
}

fn out_of_range() -> ValidationError {
    let mut err = ValidationError::new("amount_range");
    err.message = Some("Amount is out of range".into());
    err
}

/// Rates and quantities carry at most two decimal places and stay within range.
fn validate_amount(value: &Decimal) -> Result<(), ValidationError> {
    if value.normalize().scale() > 2 {
        let mut err = ValidationError::new("two_decimal_places");
        err.message = Some("Must have no more than 2 decimal places".into());
        return Err(err);
    }
    if value.abs() >= amount_limit() {
        return Err(out_of_range());
    }
    Ok(())
}

/// `rate * quantity` must itself fit a money column.
fn validate_line_total(rate: Decimal, quantity: Decimal) -> Result<(), ValidationError> {
    match rate.checked_mul(quantity) {
        Some(total) if total.abs() < amount_limit() => Ok(()),
        _ => Err(out_of_range()),
    }
}

fn validate_input_total(input: &InvoiceInput) -> Result<(), ValidationError> {
    validate_line_total(input.rate, input.quantity)
}

fn validate_patch_total(patch: &InvoicePatch) -> Result<(), ValidationError> {
    validate_line_total(patch.rate, patch.quantity)
}

/// Input for one invoice line in a create or draft batch.
#[derive(Debug, Clone, Deserialize, Validate)]
#[validate(schema(function = "validate_input_total"))]
pub struct InvoiceInput {
    #[validate(length(
        min = 3,
        max = 255,
        message = "Description must be between 3 and 255 characters"
    ))]
    pub description: String,
    #[validate(custom(function = "validate_amount"))]
    pub rate: Decimal,
    #[validate(custom(function = "validate_amount"))]
    pub quantity: Decimal,
    pub due_date: DateTime<Utc>,
    pub notes: Option<String>,
    pub terms: Option<String>,
    #[serde(default)]
    pub is_recurring: bool,
}

/// Edit of an existing invoice. `None` leaves notes, terms, and the recurring flag unchanged.
#[derive(Debug, Clone, Deserialize, Validate)]
#[validate(schema(function = "validate_patch_total"))]
pub struct InvoicePatch {
    #[validate(length(
        min = 3,
        max = 255,
        message = "Description must be between 3 and 255 characters"
    ))]
    pub description: String,
    #[validate(custom(function = "validate_amount"))]
    pub rate: Decimal,
    #[validate(custom(function = "validate_amount"))]
    pub quantity: Decimal,
    pub due_date: DateTime<Utc>,
    pub notes: Option<String>,
    pub terms: Option<String>,
    pub is_recurring: Option<bool>,
}

/// One entry of a bulk update. Every entry must name the invoice it edits.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct BatchInvoicePatch {
    pub id: Option<Uuid>,
    #[serde(flatten)]
    #[validate(nested)]
    pub patch: InvoicePatch,
}

/// Row written when an invoice is created.
#[derive(Debug, Clone)]
pub struct NewInvoice {
    pub invoice_id: Uuid,
    pub invoice_number: String,
    pub client_id: Uuid,
    pub description: String,
    pub rate: Decimal,
    pub quantity: Decimal,
    pub line_total: Decimal,
    pub total_outstanding: Decimal,
    pub is_draft: bool,
    pub is_recurring: bool,
    pub issued_date: DateTime<Utc>,
    pub due_date: DateTime<Utc>,
    pub notes: Option<String>,
    pub terms: Option<String>,
    pub predecessor_id: Option<Uuid>,
}

/// Column values written when an invoice is edited.
#[derive(Debug, Clone)]
pub struct InvoiceChanges {
    pub description: String,
    pub rate: Decimal,
    pub quantity: Decimal,
    pub line_total: Decimal,
    pub due_date: DateTime<Utc>,
    pub notes: Option<String>,
    pub terms: Option<String>,
    pub is_draft: bool,
    pub is_recurring: bool,
}

impl InvoiceChanges {
    pub fn from_patch(current: &Invoice, patch: &InvoicePatch, line_total: Decimal) -> Self {
        Self {
            description: patch.description.clone(),
            rate: patch.rate,
            quantity: patch.quantity,
            line_total,
            due_date: patch.due_date,
            notes: patch.notes.clone().or_else(|| current.notes.clone()),
            terms: patch.terms.clone().or_else(|| current.terms.clone()),
            is_draft: current.is_draft,
            is_recurring: patch.is_recurring.unwrap_or(current.is_recurring),
        }
    }

    pub fn promoted(mut self) -> Self {
        self.is_draft = false;
        self
    }
}

/// Result of deleting an invoice: the deleted row and the rows whose aggregate was rewritten.
#[derive(Debug, Clone, Serialize)]
pub struct InvoiceDeletion {
    pub deleted_invoice: Invoice,
    pub updated_invoices: Vec<Invoice>,
}

/// Search and pagination parameters shared by client and invoice listings.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub query: String,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

impl SearchFilter {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn with_page(mut self, page: u32, limit: u32) -> Self {
        self.page = Some(page);
        self.limit = Some(limit);
        self
    }

    pub fn trimmed_query(&self) -> &str {
        self.query.trim()
    }

    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(10).clamp(1, 100) as i64
    }

    pub fn offset(&self) -> i64 {
        let page = self.page.unwrap_or(1).max(1) as i64;
        (page - 1) * self.limit()
    }

    /// The query as a calendar date, when it is one.
    pub fn query_date(&self) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(self.trimmed_query(), "%Y-%m-%d").ok()
    }

    /// The query as an amount, when it is one.
    pub fn query_amount(&self) -> Option<Decimal> {
        self.trimmed_query().parse::<Decimal>().ok()
    }
}

/// A recurring template that could not be regenerated.
#[derive(Debug, Clone, Serialize)]
pub struct RecurringFailure {
    pub invoice_id: Uuid,
    pub error: String,
}

/// Outcome of one recurring generation run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecurringRunReport {
    pub scanned: usize,
    pub generated: Vec<Invoice>,
    pub skipped: usize,
    pub failures: Vec<RecurringFailure>,
}

impl RecurringRunReport {
    pub fn status(&self) -> &'static str {
        match (self.generated.is_empty(), self.failures.is_empty()) {
            (_, true) => "completed",
            (true, false) => "failed",
            (false, false) => "partial",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn input(rate: Decimal, quantity: Decimal) -> InvoiceInput {
        InvoiceInput {
            description: "Consulting".to_string(),
            rate,
            quantity,
            due_date: Utc::now(),
            notes: None,
            terms: None,
            is_recurring: false,
        }
    }

    #[test]
    fn two_decimal_places_are_accepted() {
        assert!(input(dec!(99.99), dec!(1.50)).validate().is_ok());
        assert!(input(dec!(100.000), dec!(2)).validate().is_ok());
    }

    #[test]
    fn three_decimal_places_are_rejected() {
        let errors = input(dec!(10.005), dec!(1)).validate().unwrap_err();
        assert!(errors.field_errors().contains_key("rate"));
    }

    #[test]
    fn amounts_past_the_column_range_are_rejected() {
        let rate = input(dec!(70000000000000), dec!(1000000000000000))
            .validate()
            .unwrap_err();
        assert!(rate.field_errors().contains_key("quantity"));

        let product = input(dec!(70000000000000), dec!(1000)).validate().unwrap_err();
        assert!(product.field_errors().contains_key("__all__"));

        assert!(input(dec!(999999999999.99), dec!(999)).validate().is_ok());
        assert!(input(dec!(-1000000000000000), dec!(1)).validate().is_err());
    }

    #[test]
    fn short_description_is_rejected() {
        let mut invoice = input(dec!(1), dec!(1));
        invoice.description = "ab".to_string();
        assert!(invoice.validate().is_err());
    }

    #[test]
    fn search_filter_pages_are_clamped() {
        let filter = SearchFilter::new("acme").with_page(3, 500);
        assert_eq!(filter.limit(), 100);
        assert_eq!(filter.offset(), 200);

        let first = SearchFilter::new("").with_page(0, 0);
        assert_eq!(first.limit(), 1);
        assert_eq!(first.offset(), 0);
    }

    #[test]
    fn search_filter_recognises_dates_and_amounts() {
        assert!(SearchFilter::new("2025-03-01").query_date().is_some());
        assert_eq!(SearchFilter::new(" 150 ").query_amount(), Some(dec!(150)));
        assert!(SearchFilter::new("LWS-25").query_amount().is_none());
    }

    #[test]
    fn report_status_reflects_failures() {
        let mut report = RecurringRunReport::default();
        assert_eq!(report.status(), "completed");
        report.failures.push(RecurringFailure {
            invoice_id: Uuid::new_v4(),
            error: "boom".to_string(),
        });
        assert_eq!(report.status(), "failed");
    }
}
