//! In-process ledger store.
//!
//! Units of work are serialised behind one async mutex and operate on a
//! private copy of the state, which replaces the shared state on commit.

use super::balance;
use super::store::{LedgerStore, LedgerTx};
use crate::models::{
    Client, ClientDetails, Invoice, InvoiceChanges, NewInvoice, Scope, SearchFilter,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
struct MemoryState {
    clients: Vec<Client>,
    invoices: Vec<Invoice>,
    invoice_numbers: BTreeSet<String>,
}

/// Ledger store held entirely in memory. Clones share the same state.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for InMemoryStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, AppError> {
        let guard = self.state.clone().lock_owned().await;
        let working = (*guard).clone();
        Ok(Box::new(MemoryTx { guard, working }))
    }

    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
}

fn contains_ci(haystack: &str, needle_lower: &str) -> bool {
    haystack.to_lowercase().contains(needle_lower)
}

/// Newest first; later insertions win ties.
fn newest_first<T: Clone>(rows: &[T], created: impl Fn(&T) -> DateTime<Utc>) -> Vec<T> {
    let mut out: Vec<T> = rows.iter().rev().cloned().collect();
    out.sort_by(|a, b| created(b).cmp(&created(a)));
    out
}

fn page<T>(rows: Vec<T>, filter: &SearchFilter) -> (Vec<T>, i64) {
    let total = rows.len() as i64;
    let items = rows
        .into_iter()
        .skip(filter.offset() as usize)
        .take(filter.limit() as usize)
        .collect();
    (items, total)
}

fn sequence_key(number: &str) -> (usize, &str) {
    (number.len(), number)
}

impl MemoryTx {
    fn live_client_mut(&mut self, client_id: Uuid) -> Option<&mut Client> {
        self.working
            .clients
            .iter_mut()
            .find(|c| c.client_id == client_id && c.is_live())
    }

    fn live_invoice_mut(&mut self, invoice_id: Uuid) -> Option<&mut Invoice> {
        self.working
            .invoices
            .iter_mut()
            .find(|i| i.invoice_id == invoice_id && i.is_live())
    }

    fn invoice_matches(invoice: &Invoice, filter: &SearchFilter, needle: &str) -> bool {
        if needle.is_empty() {
            return true;
        }
        if contains_ci(&invoice.invoice_number, needle) || contains_ci(&invoice.description, needle)
        {
            return true;
        }
        if let Some(date) = filter.query_date() {
            if invoice.issued_date.date_naive() == date || invoice.due_date.date_naive() == date {
                return true;
            }
        }
        if let Some(amount) = filter.query_amount() {
            if invoice.total_outstanding == amount {
                return true;
            }
        }
        false
    }
}

#[async_trait]
impl LedgerTx for MemoryTx {
    async fn insert_client(
        &mut self,
        client_id: Uuid,
        details: &ClientDetails,
        now: DateTime<Utc>,
    ) -> Result<Client, AppError> {
        if self.working.clients.iter().any(|c| c.client_id == client_id) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Client {} already exists",
                client_id
            )));
        }
        let client = Client {
            client_id,
            firstname: details.firstname.clone(),
            lastname: details.lastname.clone(),
            company_name: details.company_name.clone(),
            email: details.email.clone(),
            phone_number: details.phone_number.clone(),
            business_phone: details.business_phone.clone(),
            mobile_phone: details.mobile_phone.clone(),
            address: details.address.clone(),
            created_utc: now,
            updated_utc: now,
            deleted_utc: None,
        };
        self.working.clients.push(client.clone());
        Ok(client)
    }

    async fn find_client(&mut self, client_id: Uuid) -> Result<Option<Client>, AppError> {
        Ok(self.live_client_mut(client_id).map(|c| c.clone()))
    }

    async fn lock_client(&mut self, client_id: Uuid) -> Result<Option<Client>, AppError> {
        // The whole store is already locked for this unit of work.
        self.find_client(client_id).await
    }

    async fn update_client(
        &mut self,
        client_id: Uuid,
        details: &ClientDetails,
        now: DateTime<Utc>,
    ) -> Result<Option<Client>, AppError> {
        Ok(self.live_client_mut(client_id).map(|client| {
            client.firstname = details.firstname.clone();
            client.lastname = details.lastname.clone();
            client.company_name = details.company_name.clone();
            client.email = details.email.clone();
            client.phone_number = details.phone_number.clone();
            client.business_phone = details.business_phone.clone();
            client.mobile_phone = details.mobile_phone.clone();
            client.address = details.address.clone();
            client.updated_utc = now;
            client.clone()
        }))
    }

    async fn soft_delete_client(
        &mut self,
        client_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Client>, AppError> {
        let Some(client) = self.live_client_mut(client_id) else {
            return Ok(None);
        };
        client.deleted_utc = Some(now);
        client.updated_utc = now;
        let client = client.clone();

        for invoice in self
            .working
            .invoices
            .iter_mut()
            .filter(|i| i.client_id == client_id && i.is_live())
        {
            invoice.deleted_utc = Some(now);
            invoice.updated_utc = now;
        }

        Ok(Some(client))
    }

    async fn list_clients(
        &mut self,
        filter: &SearchFilter,
    ) -> Result<(Vec<Client>, i64), AppError> {
        let needle = filter.trimmed_query().to_lowercase();
        let invoices = &self.working.invoices;
        let matching: Vec<Client> = self
            .working
            .clients
            .iter()
            .filter(|c| c.is_live())
            .filter(|c| {
                needle.is_empty()
                    || contains_ci(&c.firstname, &needle)
                    || contains_ci(&c.lastname, &needle)
                    || contains_ci(&c.company_name, &needle)
                    || c.email.as_deref().is_some_and(|e| contains_ci(e, &needle))
                    || {
                        let live: Vec<&Invoice> = invoices
                            .iter()
                            .filter(|i| i.client_id == c.client_id && i.is_live())
                            .collect();
                        live.is_empty()
                            || live
                                .iter()
                                .any(|i| Self::invoice_matches(i, filter, &needle))
                    }
            })
            .cloned()
            .collect();

        Ok(page(newest_first(&matching, |c| c.created_utc), filter))
    }

    async fn find_invoice(&mut self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError> {
        Ok(self.live_invoice_mut(invoice_id).map(|i| i.clone()))
    }

    async fn client_invoices(&mut self, client_id: Uuid) -> Result<Vec<Invoice>, AppError> {
        let rows: Vec<Invoice> = self
            .working
            .invoices
            .iter()
            .filter(|i| i.client_id == client_id && i.is_live())
            .cloned()
            .collect();
        Ok(newest_first(&rows, |i| i.created_utc))
    }

    async fn scope_invoices(
        &mut self,
        client_id: Uuid,
        scope: Scope,
    ) -> Result<Vec<Invoice>, AppError> {
        Ok(self
            .working
            .invoices
            .iter()
            .filter(|i| i.client_id == client_id && i.is_live() && i.scope() == scope)
            .cloned()
            .collect())
    }

    async fn numbered_invoices(
        &mut self,
        client_id: Uuid,
        invoice_number: &str,
    ) -> Result<Vec<Invoice>, AppError> {
        Ok(self
            .working
            .invoices
            .iter()
            .filter(|i| {
                i.client_id == client_id && i.is_live() && i.invoice_number == invoice_number
            })
            .cloned()
            .collect())
    }

    async fn invoices_by_ids(
        &mut self,
        client_id: Uuid,
        invoice_number: &str,
        ids: &[Uuid],
    ) -> Result<Vec<Invoice>, AppError> {
        Ok(self
            .working
            .invoices
            .iter()
            .filter(|i| {
                ids.contains(&i.invoice_id)
                    && i.client_id == client_id
                    && i.is_live()
                    && i.invoice_number == invoice_number
            })
            .cloned()
            .collect())
    }

    async fn insert_invoice(
        &mut self,
        invoice: &NewInvoice,
        now: DateTime<Utc>,
    ) -> Result<Invoice, AppError> {
        if !self.working.invoice_numbers.contains(&invoice.invoice_number) {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "Invoice number {} was never allocated",
                invoice.invoice_number
            )));
        }
        if let Some(predecessor_id) = invoice.predecessor_id {
            if self
                .working
                .invoices
                .iter()
                .any(|i| i.predecessor_id == Some(predecessor_id))
            {
                return Err(AppError::Contention(anyhow::anyhow!(
                    "Invoice {} already has a successor",
                    predecessor_id
                )));
            }
        }

        let row = Invoice {
            invoice_id: invoice.invoice_id,
            invoice_number: invoice.invoice_number.clone(),
            client_id: invoice.client_id,
            description: invoice.description.clone(),
            rate: invoice.rate,
            quantity: invoice.quantity,
            line_total: invoice.line_total,
            total_outstanding: invoice.total_outstanding,
            is_draft: invoice.is_draft,
            is_recurring: invoice.is_recurring,
            issued_date: invoice.issued_date,
            due_date: invoice.due_date,
            notes: invoice.notes.clone(),
            terms: invoice.terms.clone(),
            predecessor_id: invoice.predecessor_id,
            created_utc: now,
            updated_utc: now,
            deleted_utc: None,
        };
        self.working.invoices.push(row.clone());
        Ok(row)
    }

    async fn update_invoice(
        &mut self,
        invoice_id: Uuid,
        changes: &InvoiceChanges,
        now: DateTime<Utc>,
    ) -> Result<Option<Invoice>, AppError> {
        Ok(self.live_invoice_mut(invoice_id).map(|invoice| {
            invoice.description = changes.description.clone();
            invoice.rate = changes.rate;
            invoice.quantity = changes.quantity;
            invoice.line_total = changes.line_total;
            invoice.due_date = changes.due_date;
            invoice.notes = changes.notes.clone();
            invoice.terms = changes.terms.clone();
            invoice.is_draft = changes.is_draft;
            invoice.is_recurring = changes.is_recurring;
            invoice.updated_utc = now;
            invoice.clone()
        }))
    }

    async fn soft_delete_invoice(
        &mut self,
        invoice_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Invoice>, AppError> {
        Ok(self.live_invoice_mut(invoice_id).map(|invoice| {
            invoice.deleted_utc = Some(now);
            invoice.updated_utc = now;
            invoice.clone()
        }))
    }

    async fn set_scope_outstanding(
        &mut self,
        client_id: Uuid,
        scope: Scope,
        total: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Vec<Invoice>, AppError> {
        let mut updated = Vec::new();
        for invoice in self
            .working
            .invoices
            .iter_mut()
            .filter(|i| i.client_id == client_id && i.is_live() && i.scope() == scope)
        {
            invoice.total_outstanding = total;
            invoice.updated_utc = now;
            updated.push(invoice.clone());
        }
        Ok(updated)
    }

    async fn set_invoices_outstanding(
        &mut self,
        invoice_ids: &[Uuid],
        total: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Vec<Invoice>, AppError> {
        let mut updated = Vec::new();
        for invoice in self
            .working
            .invoices
            .iter_mut()
            .filter(|i| invoice_ids.contains(&i.invoice_id) && i.is_live())
        {
            invoice.total_outstanding = total;
            invoice.updated_utc = now;
            updated.push(invoice.clone());
        }
        Ok(updated)
    }

    async fn due_recurring_invoices(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Invoice>, AppError> {
        let invoices = &self.working.invoices;
        let mut due: Vec<Invoice> = invoices
            .iter()
            .filter(|i| i.is_live() && i.is_recurring && !i.is_draft && i.due_date <= now)
            .filter(|i| {
                !invoices
                    .iter()
                    .any(|s| s.predecessor_id == Some(i.invoice_id))
            })
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            a.due_date
                .cmp(&b.due_date)
                .then(a.invoice_id.cmp(&b.invoice_id))
        });
        Ok(due)
    }

    async fn has_successor(&mut self, invoice_id: Uuid) -> Result<bool, AppError> {
        Ok(self
            .working
            .invoices
            .iter()
            .any(|i| i.predecessor_id == Some(invoice_id)))
    }

    async fn list_invoices(
        &mut self,
        filter: &SearchFilter,
    ) -> Result<(Vec<Invoice>, i64), AppError> {
        let needle = filter.trimmed_query().to_lowercase();
        let matching: Vec<Invoice> = self
            .working
            .invoices
            .iter()
            .filter(|i| i.is_live() && Self::invoice_matches(i, filter, &needle))
            .cloned()
            .collect();
        Ok(page(newest_first(&matching, |i| i.created_utc), filter))
    }

    async fn matching_invoices(
        &mut self,
        client_ids: &[Uuid],
        filter: &SearchFilter,
    ) -> Result<Vec<Invoice>, AppError> {
        let needle = filter.trimmed_query().to_lowercase();
        let matching: Vec<Invoice> = self
            .working
            .invoices
            .iter()
            .filter(|i| i.is_live() && client_ids.contains(&i.client_id))
            .filter(|i| Self::invoice_matches(i, filter, &needle))
            .cloned()
            .collect();
        Ok(newest_first(&matching, |i| i.created_utc))
    }

    async fn sum_line_totals(
        &mut self,
        scope: Scope,
        due_on_or_before: Option<DateTime<Utc>>,
    ) -> Result<Decimal, AppError> {
        balance::sum(
            self.working
                .invoices
                .iter()
                .filter(|i| i.is_live() && i.scope() == scope)
                .filter(|i| due_on_or_before.is_none_or(|cutoff| i.due_date <= cutoff))
                .map(|i| i.line_total),
        )
    }

    async fn last_invoice_number(&mut self, prefix: &str) -> Result<Option<String>, AppError> {
        Ok(self
            .working
            .invoice_numbers
            .iter()
            .filter(|n| n.starts_with(prefix))
            .max_by(|a, b| sequence_key(a).cmp(&sequence_key(b)))
            .cloned())
    }

    async fn reserve_invoice_number(
        &mut self,
        invoice_number: &str,
        _now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        if !self
            .working
            .invoice_numbers
            .insert(invoice_number.to_string())
        {
            return Err(AppError::Contention(anyhow::anyhow!(
                "Invoice number {} is already allocated",
                invoice_number
            )));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), AppError> {
        let MemoryTx {
            mut guard,
            working,
        } = *self;
        *guard = working;
        Ok(())
    }
}
