//! Persistence seam for the ledger.
//!
//! Every ledger operation runs inside one [`LedgerTx`]. Nothing is durable
//! until [`LedgerTx::commit`]; dropping an uncommitted unit of work rolls it back.

use crate::models::{
    Client, ClientDetails, Invoice, InvoiceChanges, NewInvoice, Scope, SearchFilter,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use uuid::Uuid;

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Open a unit of work.
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, AppError>;

    async fn health_check(&self) -> Result<(), AppError>;
}

/// Reads and writes inside one unit of work. Reads only ever see live rows
/// unless a method says otherwise.
#[async_trait]
pub trait LedgerTx: Send {
    // -------------------------------------------------------------------------
    // Clients
    // -------------------------------------------------------------------------

    async fn insert_client(
        &mut self,
        client_id: Uuid,
        details: &ClientDetails,
        now: DateTime<Utc>,
    ) -> Result<Client, AppError>;

    async fn find_client(&mut self, client_id: Uuid) -> Result<Option<Client>, AppError>;

    /// Like `find_client`, but also serialises every later mutation of this
    /// client's invoices behind this unit of work.
    async fn lock_client(&mut self, client_id: Uuid) -> Result<Option<Client>, AppError>;

    async fn update_client(
        &mut self,
        client_id: Uuid,
        details: &ClientDetails,
        now: DateTime<Utc>,
    ) -> Result<Option<Client>, AppError>;

    /// Soft-delete the client and every live invoice it owns.
    async fn soft_delete_client(
        &mut self,
        client_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Client>, AppError>;

    /// One page of live clients, newest first, and the total match count. A
    /// client matches on its names or e-mail, on any live invoice matching as
    /// in [`LedgerTx::list_invoices`], or by having no live invoice at all.
    async fn list_clients(&mut self, filter: &SearchFilter)
        -> Result<(Vec<Client>, i64), AppError>;

    // -------------------------------------------------------------------------
    // Invoices
    // -------------------------------------------------------------------------

    async fn find_invoice(&mut self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError>;

    /// Live invoices of a client, newest first.
    async fn client_invoices(&mut self, client_id: Uuid) -> Result<Vec<Invoice>, AppError>;

    /// Live invoices of a client in one aggregation scope.
    async fn scope_invoices(
        &mut self,
        client_id: Uuid,
        scope: Scope,
    ) -> Result<Vec<Invoice>, AppError>;

    /// Live invoices of a client sharing an invoice number.
    async fn numbered_invoices(
        &mut self,
        client_id: Uuid,
        invoice_number: &str,
    ) -> Result<Vec<Invoice>, AppError>;

    /// The subset of `ids` that are live, belong to the client and carry the invoice number.
    async fn invoices_by_ids(
        &mut self,
        client_id: Uuid,
        invoice_number: &str,
        ids: &[Uuid],
    ) -> Result<Vec<Invoice>, AppError>;

    /// Fails with `Contention` when the predecessor already has a successor.
    async fn insert_invoice(
        &mut self,
        invoice: &NewInvoice,
        now: DateTime<Utc>,
    ) -> Result<Invoice, AppError>;

    async fn update_invoice(
        &mut self,
        invoice_id: Uuid,
        changes: &InvoiceChanges,
        now: DateTime<Utc>,
    ) -> Result<Option<Invoice>, AppError>;

    async fn soft_delete_invoice(
        &mut self,
        invoice_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Invoice>, AppError>;

    /// Write `total` onto every live invoice of the client in `scope`.
    async fn set_scope_outstanding(
        &mut self,
        client_id: Uuid,
        scope: Scope,
        total: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Vec<Invoice>, AppError>;

    /// Write `total` onto the listed live invoices only.
    async fn set_invoices_outstanding(
        &mut self,
        invoice_ids: &[Uuid],
        total: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Vec<Invoice>, AppError>;

    /// Live, final, recurring invoices due at or before `now` with no successor, oldest due first.
    async fn due_recurring_invoices(&mut self, now: DateTime<Utc>)
        -> Result<Vec<Invoice>, AppError>;

    /// Whether any invoice, deleted or not, was spawned from this one.
    async fn has_successor(&mut self, invoice_id: Uuid) -> Result<bool, AppError>;

    async fn list_invoices(
        &mut self,
        filter: &SearchFilter,
    ) -> Result<(Vec<Invoice>, i64), AppError>;

    /// Live invoices of the given clients that match `filter`, newest first.
    async fn matching_invoices(
        &mut self,
        client_ids: &[Uuid],
        filter: &SearchFilter,
    ) -> Result<Vec<Invoice>, AppError>;

    /// Σ line_total over live invoices in `scope` system-wide, optionally only those due by a cut-off.
    async fn sum_line_totals(
        &mut self,
        scope: Scope,
        due_on_or_before: Option<DateTime<Utc>>,
    ) -> Result<Decimal, AppError>;

    // -------------------------------------------------------------------------
    // Invoice numbers
    // -------------------------------------------------------------------------

    /// Highest allocated number starting with `prefix`, compared numerically.
    /// Includes numbers whose invoices were later deleted.
    async fn last_invoice_number(&mut self, prefix: &str) -> Result<Option<String>, AppError>;

    /// Record a number as allocated. Fails with `Contention` if it already was.
    async fn reserve_invoice_number(
        &mut self,
        invoice_number: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AppError>;

    async fn commit(self: Box<Self>) -> Result<(), AppError>;
}
