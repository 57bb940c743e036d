//! A store wrapper that loses invoice number races on demand.
//!
//! When armed, the next reservation fails with the store's own `Contention`
//! error, as if another writer had claimed the number first. That writer's
//! reservation is committed before the following unit of work opens.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use receivables_service::models::{
    Client, ClientDetails, Invoice, InvoiceChanges, NewInvoice, Scope, SearchFilter,
};
use receivables_service::services::{InMemoryStore, LedgerStore, LedgerTx};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Clone, Default)]
pub struct ContestedStore {
    inner: InMemoryStore,
    races: Arc<AtomicUsize>,
    pending: Arc<Mutex<Vec<String>>>,
    lost: Arc<Mutex<Vec<String>>>,
}

impl ContestedStore {
    pub fn new(inner: InMemoryStore) -> Self {
        Self {
            inner,
            ..Default::default()
        }
    }

    /// Lose the next `count` reservations.
    pub fn arm(&self, count: usize) {
        self.races.store(count, Ordering::SeqCst);
    }

    /// Numbers claimed by the competing writer, in order.
    pub fn lost_numbers(&self) -> Vec<String> {
        self.lost.lock().unwrap().clone()
    }
}

#[async_trait]
impl LedgerStore for ContestedStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, AppError> {
        let claimed: Vec<String> = self.pending.lock().unwrap().drain(..).collect();
        if !claimed.is_empty() {
            let mut rival = self.inner.begin().await?;
            for number in &claimed {
                rival.reserve_invoice_number(number, Utc::now()).await?;
            }
            rival.commit().await?;
        }

        Ok(Box::new(ContestedTx {
            inner: self.inner.begin().await?,
            store: self.clone(),
        }))
    }

    async fn health_check(&self) -> Result<(), AppError> {
        self.inner.health_check().await
    }
}

struct ContestedTx {
    inner: Box<dyn LedgerTx>,
    store: ContestedStore,
}

impl ContestedTx {
    fn should_lose(&self) -> bool {
        self.store
            .races
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl LedgerTx for ContestedTx {
    async fn insert_client(
        &mut self,
        client_id: Uuid,
        details: &ClientDetails,
        now: DateTime<Utc>,
    ) -> Result<Client, AppError> {
        self.inner.insert_client(client_id, details, now).await
    }

    async fn find_client(&mut self, client_id: Uuid) -> Result<Option<Client>, AppError> {
        self.inner.find_client(client_id).await
    }

    async fn lock_client(&mut self, client_id: Uuid) -> Result<Option<Client>, AppError> {
        self.inner.lock_client(client_id).await
    }

    async fn update_client(
        &mut self,
        client_id: Uuid,
        details: &ClientDetails,
        now: DateTime<Utc>,
    ) -> Result<Option<Client>, AppError> {
        self.inner.update_client(client_id, details, now).await
    }

    async fn soft_delete_client(
        &mut self,
        client_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Client>, AppError> {
        self.inner.soft_delete_client(client_id, now).await
    }

    async fn list_clients(
        &mut self,
        filter: &SearchFilter,
    ) -> Result<(Vec<Client>, i64), AppError> {
        self.inner.list_clients(filter).await
    }

    async fn find_invoice(&mut self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError> {
        self.inner.find_invoice(invoice_id).await
    }

    async fn client_invoices(&mut self, client_id: Uuid) -> Result<Vec<Invoice>, AppError> {
        self.inner.client_invoices(client_id).await
    }

    async fn scope_invoices(
        &mut self,
        client_id: Uuid,
        scope: Scope,
    ) -> Result<Vec<Invoice>, AppError> {
        self.inner.scope_invoices(client_id, scope).await
    }

    async fn numbered_invoices(
        &mut self,
        client_id: Uuid,
        invoice_number: &str,
    ) -> Result<Vec<Invoice>, AppError> {
        self.inner.numbered_invoices(client_id, invoice_number).await
    }

    async fn invoices_by_ids(
        &mut self,
        client_id: Uuid,
        invoice_number: &str,
        ids: &[Uuid],
    ) -> Result<Vec<Invoice>, AppError> {
        self.inner
            .invoices_by_ids(client_id, invoice_number, ids)
            .await
    }

    async fn insert_invoice(
        &mut self,
        invoice: &NewInvoice,
        now: DateTime<Utc>,
    ) -> Result<Invoice, AppError> {
        self.inner.insert_invoice(invoice, now).await
    }

    async fn update_invoice(
        &mut self,
        invoice_id: Uuid,
        changes: &InvoiceChanges,
        now: DateTime<Utc>,
    ) -> Result<Option<Invoice>, AppError> {
        self.inner.update_invoice(invoice_id, changes, now).await
    }

    async fn soft_delete_invoice(
        &mut self,
        invoice_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Invoice>, AppError> {
        self.inner.soft_delete_invoice(invoice_id, now).await
    }

    async fn set_scope_outstanding(
        &mut self,
        client_id: Uuid,
        scope: Scope,
        total: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Vec<Invoice>, AppError> {
        self.inner
            .set_scope_outstanding(client_id, scope, total, now)
            .await
    }

    async fn set_invoices_outstanding(
        &mut self,
        invoice_ids: &[Uuid],
        total: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Vec<Invoice>, AppError> {
        self.inner
            .set_invoices_outstanding(invoice_ids, total, now)
            .await
    }

    async fn due_recurring_invoices(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Invoice>, AppError> {
        self.inner.due_recurring_invoices(now).await
    }

    async fn has_successor(&mut self, invoice_id: Uuid) -> Result<bool, AppError> {
        self.inner.has_successor(invoice_id).await
    }

    async fn list_invoices(
        &mut self,
        filter: &SearchFilter,
    ) -> Result<(Vec<Invoice>, i64), AppError> {
        self.inner.list_invoices(filter).await
    }

    async fn matching_invoices(
        &mut self,
        client_ids: &[Uuid],
        filter: &SearchFilter,
    ) -> Result<Vec<Invoice>, AppError> {
        self.inner.matching_invoices(client_ids, filter).await
    }

    async fn sum_line_totals(
        &mut self,
        scope: Scope,
        due_on_or_before: Option<DateTime<Utc>>,
    ) -> Result<Decimal, AppError> {
        self.inner.sum_line_totals(scope, due_on_or_before).await
    }

    async fn last_invoice_number(&mut self, prefix: &str) -> Result<Option<String>, AppError> {
        self.inner.last_invoice_number(prefix).await
    }

    async fn reserve_invoice_number(
        &mut self,
        invoice_number: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        if self.should_lose() {
            // Claim it here first so the second reservation fails inside the store.
            self.inner
                .reserve_invoice_number(invoice_number, now)
                .await?;
            let result = self.inner.reserve_invoice_number(invoice_number, now).await;
            self.store
                .pending
                .lock()
                .unwrap()
                .push(invoice_number.to_string());
            self.store
                .lost
                .lock()
                .unwrap()
                .push(invoice_number.to_string());
            return result;
        }
        self.inner.reserve_invoice_number(invoice_number, now).await
    }

    async fn commit(self: Box<Self>) -> Result<(), AppError> {
        self.inner.commit().await
    }
}
