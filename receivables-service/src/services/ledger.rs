//! Invoice lifecycle and client operations.
//!
//! Every operation runs in one unit of work. Mutations of a client's invoices
//! lock the client first, so aggregate recomputation never sees another
//! operation's half-written rows.

use super::balance::{self, Adjustment, AggregateTarget, RecomputePolicies, RecomputePolicy};
use super::clock::Clock;
use super::metrics::{record_invoice_amount, record_operation};
use super::numbering;
use super::store::{LedgerStore, LedgerTx};
use crate::models::{
    BatchInvoicePatch, Client, ClientDetails, ClientWithInvoices, CreateClient, Invoice,
    InvoiceChanges, InvoiceDeletion, InvoiceInput, InvoicePatch, NewInvoice, Page, Scope,
    SearchFilter, UpdateClient,
};
use chrono::{DateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use service_core::retry::{retry_on_conflict, RetryConfig};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

/// Tunables for the ledger.
#[derive(Debug, Clone)]
pub struct LedgerSettings {
    pub policies: RecomputePolicies,
    /// Fresh attempts after an invoice number race is lost.
    pub number_allocation_retries: u32,
    /// Upper bound on successors generated per recurring run. `None` processes every due template.
    pub recurring_max_per_run: Option<usize>,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            policies: RecomputePolicies::default(),
            number_allocation_retries: 3,
            recurring_max_per_run: None,
        }
    }
}

#[derive(Clone)]
pub struct LedgerService {
    pub(crate) store: Arc<dyn LedgerStore>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) settings: LedgerSettings,
}

pub(crate) fn client_not_found(client_id: Uuid) -> AppError {
    AppError::NotFound(anyhow::anyhow!("Client {} not found", client_id))
}

pub(crate) fn invoice_not_found(invoice_id: Uuid) -> AppError {
    AppError::NotFound(anyhow::anyhow!("Invoice {} not found", invoice_id))
}

/// Run a ledger operation and count its outcome.
pub(crate) async fn observed<T, Fut>(operation: &str, fut: Fut) -> Result<T, AppError>
where
    Fut: Future<Output = Result<T, AppError>>,
{
    let result = fut.await;
    record_operation(operation, &result);
    result
}

impl LedgerService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        settings: LedgerSettings,
    ) -> Self {
        Self {
            store,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &LedgerSettings {
        &self.settings
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub async fn health_check(&self) -> Result<(), AppError> {
        self.store.health_check().await
    }

    pub(crate) fn retry_config(&self) -> RetryConfig {
        RetryConfig::with_max_retries(self.settings.number_allocation_retries)
    }

    // -------------------------------------------------------------------------
    // Client Operations
    // -------------------------------------------------------------------------

    #[instrument(skip(self, input))]
    pub async fn create_client(&self, input: CreateClient) -> Result<Client, AppError> {
        observed("create_client", async {
            let input = input.normalized();
            input.validate()?;

            let mut tx = self.store.begin().await?;
            let client = tx
                .insert_client(Uuid::new_v4(), &ClientDetails::from(input), self.clock.now())
                .await?;
            tx.commit().await?;

            info!(client_id = %client.client_id, "Client created");
            Ok(client)
        })
        .await
    }

    #[instrument(skip(self), fields(client_id = %client_id))]
    pub async fn get_client(&self, client_id: Uuid) -> Result<Client, AppError> {
        let mut tx = self.store.begin().await?;
        let client = tx
            .find_client(client_id)
            .await?
            .ok_or_else(|| client_not_found(client_id))?;
        tx.commit().await?;
        Ok(client)
    }

    #[instrument(skip(self), fields(client_id = %client_id))]
    pub async fn get_client_with_invoices(
        &self,
        client_id: Uuid,
    ) -> Result<ClientWithInvoices, AppError> {
        let mut tx = self.store.begin().await?;
        let client = tx
            .find_client(client_id)
            .await?
            .ok_or_else(|| client_not_found(client_id))?;
        let invoices = tx.client_invoices(client_id).await?;
        tx.commit().await?;
        Ok(ClientWithInvoices { client, invoices })
    }

    #[instrument(skip(self, input), fields(client_id = %client_id))]
    pub async fn update_client(
        &self,
        client_id: Uuid,
        input: UpdateClient,
    ) -> Result<Client, AppError> {
        observed("update_client", async {
            let input = input.normalized();
            input.validate()?;

            let mut tx = self.store.begin().await?;
            let client = tx
                .update_client(client_id, &ClientDetails::from(input), self.clock.now())
                .await?
                .ok_or_else(|| client_not_found(client_id))?;
            tx.commit().await?;

            info!(client_id = %client_id, "Client updated");
            Ok(client)
        })
        .await
    }

    /// Soft-delete a client together with all of its invoices.
    #[instrument(skip(self), fields(client_id = %client_id))]
    pub async fn delete_client(&self, client_id: Uuid) -> Result<Client, AppError> {
        observed("delete_client", async {
            let mut tx = self.store.begin().await?;
            tx.lock_client(client_id)
                .await?
                .ok_or_else(|| client_not_found(client_id))?;
            let client = tx
                .soft_delete_client(client_id, self.clock.now())
                .await?
                .ok_or_else(|| client_not_found(client_id))?;
            tx.commit().await?;

            info!(client_id = %client_id, "Client deleted");
            Ok(client)
        })
        .await
    }

    /// Clients with their matching live invoices, newest first.
    #[instrument(skip(self, filter), fields(query = %filter.trimmed_query()))]
    pub async fn list_clients(
        &self,
        filter: &SearchFilter,
    ) -> Result<Page<ClientWithInvoices>, AppError> {
        let mut tx = self.store.begin().await?;
        let (clients, total) = tx.list_clients(filter).await?;
        let ids: Vec<Uuid> = clients.iter().map(|c| c.client_id).collect();
        let mut by_client: HashMap<Uuid, Vec<Invoice>> = HashMap::new();
        for invoice in tx.matching_invoices(&ids, filter).await? {
            by_client.entry(invoice.client_id).or_default().push(invoice);
        }
        tx.commit().await?;

        let items = clients
            .into_iter()
            .map(|client| ClientWithInvoices {
                invoices: by_client.remove(&client.client_id).unwrap_or_default(),
                client,
            })
            .collect();
        Ok(Page { items, total })
    }

    // -------------------------------------------------------------------------
    // Invoice Reads
    // -------------------------------------------------------------------------

    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn get_invoice(&self, invoice_id: Uuid) -> Result<Invoice, AppError> {
        let mut tx = self.store.begin().await?;
        let invoice = tx
            .find_invoice(invoice_id)
            .await?
            .ok_or_else(|| invoice_not_found(invoice_id))?;
        tx.commit().await?;
        Ok(invoice)
    }

    #[instrument(skip(self, filter), fields(query = %filter.trimmed_query()))]
    pub async fn list_invoices(&self, filter: &SearchFilter) -> Result<Page<Invoice>, AppError> {
        let mut tx = self.store.begin().await?;
        let (items, total) = tx.list_invoices(filter).await?;
        tx.commit().await?;
        Ok(Page { items, total })
    }

    /// Σ line totals of every live final invoice.
    pub async fn sum_total_outstanding(&self) -> Result<Decimal, AppError> {
        self.sum_line_totals(Scope::Final, None).await
    }

    /// Σ line totals of every live draft.
    pub async fn sum_draft_total_outstanding(&self) -> Result<Decimal, AppError> {
        self.sum_line_totals(Scope::Draft, None).await
    }

    /// Σ line totals of live final invoices due by the start of today (UTC).
    pub async fn sum_due_total_outstanding(&self) -> Result<Decimal, AppError> {
        let today = self
            .clock
            .now()
            .date_naive()
            .and_time(NaiveTime::MIN)
            .and_utc();
        self.sum_line_totals(Scope::Final, Some(today)).await
    }

    #[instrument(skip(self), fields(scope = scope.as_str()))]
    async fn sum_line_totals(
        &self,
        scope: Scope,
        due_on_or_before: Option<DateTime<Utc>>,
    ) -> Result<Decimal, AppError> {
        let mut tx = self.store.begin().await?;
        let total = tx.sum_line_totals(scope, due_on_or_before).await?;
        tx.commit().await?;
        Ok(total)
    }

    // -------------------------------------------------------------------------
    // Invoice Lifecycle
    // -------------------------------------------------------------------------

    /// Create final invoices sharing one freshly allocated number.
    #[instrument(skip(self, inputs), fields(client_id = %client_id, count = inputs.len()))]
    pub async fn create_many(
        &self,
        client_id: Uuid,
        inputs: Vec<InvoiceInput>,
    ) -> Result<Vec<Invoice>, AppError> {
        observed("create_invoices", self.create_batch(client_id, inputs, Scope::Final)).await
    }

    /// Create drafts sharing one freshly allocated number.
    #[instrument(skip(self, inputs), fields(client_id = %client_id, count = inputs.len()))]
    pub async fn draft_many(
        &self,
        client_id: Uuid,
        inputs: Vec<InvoiceInput>,
    ) -> Result<Vec<Invoice>, AppError> {
        observed("draft_invoices", self.create_batch(client_id, inputs, Scope::Draft)).await
    }

    async fn create_batch(
        &self,
        client_id: Uuid,
        inputs: Vec<InvoiceInput>,
        scope: Scope,
    ) -> Result<Vec<Invoice>, AppError> {
        if inputs.is_empty() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "At least one invoice is required"
            )));
        }
        for input in &inputs {
            input.validate()?;
        }

        let created = retry_on_conflict(&self.retry_config(), "create_invoice_batch", || {
            self.create_batch_once(client_id, &inputs, scope)
        })
        .await?;

        for invoice in &created {
            record_invoice_amount(scope.as_str(), invoice.line_total);
        }
        info!(
            client_id = %client_id,
            invoice_number = created.first().map(|i| i.invoice_number.as_str()).unwrap_or_default(),
            count = created.len(),
            scope = scope.as_str(),
            "Invoices created"
        );

        Ok(created)
    }

    async fn create_batch_once(
        &self,
        client_id: Uuid,
        inputs: &[InvoiceInput],
        scope: Scope,
    ) -> Result<Vec<Invoice>, AppError> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;

        tx.lock_client(client_id)
            .await?
            .ok_or_else(|| client_not_found(client_id))?;

        let invoice_number = numbering::allocate(&mut *tx, now).await?.to_string();

        let mut created_ids = Vec::with_capacity(inputs.len());
        for input in inputs {
            let row = NewInvoice {
                invoice_id: Uuid::new_v4(),
                invoice_number: invoice_number.clone(),
                client_id,
                description: input.description.clone(),
                rate: input.rate,
                quantity: input.quantity,
                line_total: balance::line_total(input.rate, input.quantity)?,
                total_outstanding: Decimal::ZERO,
                is_draft: scope.is_draft(),
                is_recurring: input.is_recurring,
                issued_date: now,
                due_date: input.due_date,
                notes: input.notes.clone(),
                terms: input.terms.clone(),
                predecessor_id: None,
            };
            created_ids.push(tx.insert_invoice(&row, now).await?.invoice_id);
        }

        let scope_rows = tx.scope_invoices(client_id, scope).await?;
        let total = RecomputePolicy::Recompute.aggregate(scope, Adjustment::default(), &scope_rows)?;
        let updated = tx
            .set_scope_outstanding(client_id, scope, total, now)
            .await?;
        tx.commit().await?;

        Ok(in_order(&created_ids, updated))
    }

    /// Edit an invoice. A draft edited through this path becomes final.
    #[instrument(skip(self, patch), fields(invoice_id = %invoice_id))]
    pub async fn update_invoice(
        &self,
        invoice_id: Uuid,
        patch: InvoicePatch,
    ) -> Result<Invoice, AppError> {
        observed("update_invoice", async {
            patch.validate()?;
            let now = self.clock.now();
            let mut tx = self.store.begin().await?;
            let current = lock_invoice(&mut *tx, invoice_id).await?;

            let new_line_total = balance::line_total(patch.rate, patch.quantity)?;
            let was_draft = current.is_draft;
            let existing = balance::current_aggregate(
                Scope::Final,
                &tx.scope_invoices(current.client_id, Scope::Final).await?,
            );
            let changes = InvoiceChanges::from_patch(&current, &patch, new_line_total).promoted();
            tx.update_invoice(invoice_id, &changes, now)
                .await?
                .ok_or_else(|| invoice_not_found(invoice_id))?;

            let adjustment = Adjustment {
                existing,
                old: if was_draft {
                    Decimal::ZERO
                } else {
                    current.line_total
                },
                new: new_line_total,
            };
            apply_policy(
                &mut *tx,
                RecomputePolicy::DeltaAdjust,
                current.client_id,
                Scope::Final,
                adjustment,
                &[invoice_id],
                now,
            )
            .await?;

            if was_draft {
                let drafts = tx.scope_invoices(current.client_id, Scope::Draft).await?;
                let total = balance::recompute(Scope::Draft, &drafts)?;
                tx.set_scope_outstanding(current.client_id, Scope::Draft, total, now)
                    .await?;
            }

            let invoice = tx
                .find_invoice(invoice_id)
                .await?
                .ok_or_else(|| invoice_not_found(invoice_id))?;
            tx.commit().await?;

            info!(
                invoice_id = %invoice_id,
                client_id = %invoice.client_id,
                promoted = was_draft,
                total_outstanding = %invoice.total_outstanding,
                "Invoice updated"
            );
            Ok(invoice)
        })
        .await
    }

    /// Edit a draft without promoting it. Final invoices are not found here.
    #[instrument(skip(self, patch), fields(invoice_id = %invoice_id))]
    pub async fn update_draft_invoice(
        &self,
        invoice_id: Uuid,
        patch: InvoicePatch,
    ) -> Result<Invoice, AppError> {
        observed("update_draft_invoice", async {
            patch.validate()?;
            let now = self.clock.now();
            let mut tx = self.store.begin().await?;
            let current = lock_invoice(&mut *tx, invoice_id).await?;
            if !current.is_draft {
                return Err(AppError::NotFound(anyhow::anyhow!(
                    "Draft invoice {} not found",
                    invoice_id
                )));
            }

            let new_line_total = balance::line_total(patch.rate, patch.quantity)?;
            let existing = balance::current_aggregate(
                Scope::Draft,
                &tx.scope_invoices(current.client_id, Scope::Draft).await?,
            );
            let changes = InvoiceChanges::from_patch(&current, &patch, new_line_total);
            tx.update_invoice(invoice_id, &changes, now)
                .await?
                .ok_or_else(|| invoice_not_found(invoice_id))?;

            let adjustment = Adjustment {
                existing,
                old: current.line_total,
                new: new_line_total,
            };
            apply_policy(
                &mut *tx,
                self.settings.policies.draft_update,
                current.client_id,
                Scope::Draft,
                adjustment,
                &[invoice_id],
                now,
            )
            .await?;

            let invoice = tx
                .find_invoice(invoice_id)
                .await?
                .ok_or_else(|| invoice_not_found(invoice_id))?;
            tx.commit().await?;

            info!(
                invoice_id = %invoice_id,
                policy = %self.settings.policies.draft_update,
                total_outstanding = %invoice.total_outstanding,
                "Draft invoice updated"
            );
            Ok(invoice)
        })
        .await
    }

    /// Edit several rows that share an invoice number.
    ///
    /// The ids must name exactly the client's live rows carrying `invoice_number`
    /// that the caller wants to change; any that do not resolve fail the whole batch.
    #[instrument(skip(self, patches), fields(client_id = %client_id, invoice_number = %invoice_number, count = patches.len()))]
    pub async fn update_many(
        &self,
        client_id: Uuid,
        invoice_number: &str,
        patches: Vec<BatchInvoicePatch>,
    ) -> Result<Vec<Invoice>, AppError> {
        observed("update_invoices", async {
            if patches.is_empty() {
                return Err(AppError::BadRequest(anyhow::anyhow!(
                    "At least one invoice is required"
                )));
            }
            let mut edits = Vec::with_capacity(patches.len());
            for entry in &patches {
                let id = entry.id.ok_or_else(|| {
                    AppError::BadRequest(anyhow::anyhow!("All invoices must include an id"))
                })?;
                entry.validate()?;
                edits.push((id, &entry.patch));
            }

            let now = self.clock.now();
            let mut tx = self.store.begin().await?;
            tx.lock_client(client_id)
                .await?
                .ok_or_else(|| client_not_found(client_id))?;

            let ids: Vec<Uuid> = edits.iter().map(|(id, _)| *id).collect();
            let unique: HashSet<Uuid> = ids.iter().copied().collect();
            let found = tx.invoices_by_ids(client_id, invoice_number, &ids).await?;
            if unique.len() != ids.len() || found.len() != ids.len() {
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "Expected {} invoices numbered {} for client {}, found {}",
                    ids.len(),
                    invoice_number,
                    client_id,
                    found.len()
                )));
            }

            let policy = self.settings.policies.batch_update;
            let mut existing = [Decimal::ZERO; 2];
            for scope in [Scope::Final, Scope::Draft] {
                existing[scope_index(scope)] = balance::current_aggregate(
                    scope,
                    &tx.scope_invoices(client_id, scope).await?,
                );
            }

            let mut old = [Vec::new(), Vec::new()];
            let mut new = [Vec::new(), Vec::new()];
            let mut touched: [Vec<Uuid>; 2] = [Vec::new(), Vec::new()];
            for (id, patch) in &edits {
                let current = found
                    .iter()
                    .find(|i| i.invoice_id == *id)
                    .ok_or_else(|| invoice_not_found(*id))?;
                let line_total = balance::line_total(patch.rate, patch.quantity)?;
                let changes = InvoiceChanges::from_patch(current, patch, line_total);
                tx.update_invoice(*id, &changes, now)
                    .await?
                    .ok_or_else(|| invoice_not_found(*id))?;

                let slot = scope_index(current.scope());
                old[slot].push(current.line_total);
                new[slot].push(line_total);
                touched[slot].push(*id);
            }

            match policy.target() {
                AggregateTarget::TouchedRows => {
                    let total = balance::bounded_sum(new.iter().flatten().copied())?;
                    tx.set_invoices_outstanding(&ids, total, now).await?;
                }
                AggregateTarget::Scope => {
                    for scope in [Scope::Final, Scope::Draft] {
                        let slot = scope_index(scope);
                        if touched[slot].is_empty() {
                            continue;
                        }
                        let adjustment = Adjustment {
                            existing: existing[slot],
                            old: balance::sum(old[slot].iter().copied())?,
                            new: balance::sum(new[slot].iter().copied())?,
                        };
                        apply_policy(
                            &mut *tx,
                            policy,
                            client_id,
                            scope,
                            adjustment,
                            &touched[slot],
                            now,
                        )
                        .await?;
                    }
                }
            }

            let mut updated = Vec::with_capacity(ids.len());
            for id in &ids {
                updated.push(
                    tx.find_invoice(*id)
                        .await?
                        .ok_or_else(|| invoice_not_found(*id))?,
                );
            }
            tx.commit().await?;

            info!(
                client_id = %client_id,
                invoice_number = %invoice_number,
                count = updated.len(),
                policy = %policy,
                "Invoice batch updated"
            );
            Ok(updated)
        })
        .await
    }

    /// Soft-delete an invoice and recompute the aggregate of the scope it left.
    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn delete_invoice(&self, invoice_id: Uuid) -> Result<InvoiceDeletion, AppError> {
        observed("delete_invoice", async {
            let now = self.clock.now();
            let mut tx = self.store.begin().await?;
            let current = lock_invoice(&mut *tx, invoice_id).await?;

            let deleted_invoice = tx
                .soft_delete_invoice(invoice_id, now)
                .await?
                .ok_or_else(|| invoice_not_found(invoice_id))?;

            let scope = current.scope();
            let remaining = tx.scope_invoices(current.client_id, scope).await?;
            let total = balance::recompute(scope, &remaining)?;
            let updated_invoices = tx
                .set_scope_outstanding(current.client_id, scope, total, now)
                .await?;
            tx.commit().await?;

            info!(
                invoice_id = %invoice_id,
                client_id = %current.client_id,
                total_outstanding = %total,
                "Invoice deleted"
            );
            Ok(InvoiceDeletion {
                deleted_invoice,
                updated_invoices,
            })
        })
        .await
    }
}

fn scope_index(scope: Scope) -> usize {
    match scope {
        Scope::Final => 0,
        Scope::Draft => 1,
    }
}

/// Load a live invoice and lock its client, re-reading the invoice once the lock is held.
async fn lock_invoice(tx: &mut dyn LedgerTx, invoice_id: Uuid) -> Result<Invoice, AppError> {
    let invoice = tx
        .find_invoice(invoice_id)
        .await?
        .ok_or_else(|| invoice_not_found(invoice_id))?;
    tx.lock_client(invoice.client_id)
        .await?
        .ok_or_else(|| client_not_found(invoice.client_id))?;
    tx.find_invoice(invoice_id)
        .await?
        .ok_or_else(|| invoice_not_found(invoice_id))
}

/// Compute the aggregate for an edit already written and stamp it where the policy says.
async fn apply_policy(
    tx: &mut dyn LedgerTx,
    policy: RecomputePolicy,
    client_id: Uuid,
    scope: Scope,
    adjustment: Adjustment,
    touched: &[Uuid],
    now: DateTime<Utc>,
) -> Result<Vec<Invoice>, AppError> {
    let scope_after = tx.scope_invoices(client_id, scope).await?;
    let total = policy.aggregate(scope, adjustment, &scope_after)?;
    match policy.target() {
        AggregateTarget::Scope => tx.set_scope_outstanding(client_id, scope, total, now).await,
        AggregateTarget::TouchedRows => tx.set_invoices_outstanding(touched, total, now).await,
    }
}

/// Rows of `rows` whose ids appear in `ids`, in the order of `ids`.
fn in_order(ids: &[Uuid], rows: Vec<Invoice>) -> Vec<Invoice> {
    ids.iter()
        .filter_map(|id| rows.iter().find(|r| r.invoice_id == *id).cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn row(id: Uuid) -> Invoice {
        let now = Utc::now();
        Invoice {
            invoice_id: id,
            invoice_number: "LWS-25-0001".to_string(),
            client_id: Uuid::nil(),
            description: "Audit".to_string(),
            rate: Decimal::ONE,
            quantity: Decimal::ONE,
            line_total: Decimal::ONE,
            total_outstanding: Decimal::ONE,
            is_draft: false,
            is_recurring: false,
            issued_date: now,
            due_date: now,
            notes: None,
            terms: None,
            predecessor_id: None,
            created_utc: now,
            updated_utc: now,
            deleted_utc: None,
        }
    }

    #[test]
    fn in_order_follows_requested_ids() {
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let rows = vec![row(c), row(a), row(b)];
        let ordered: Vec<Uuid> = in_order(&[a, b], rows)
            .into_iter()
            .map(|r| r.invoice_id)
            .collect();
        assert_eq!(ordered, vec![a, b]);
    }

    #[test]
    fn default_settings_match_observed_behaviour() {
        let settings = LedgerSettings::default();
        assert_eq!(settings.policies.draft_update, RecomputePolicy::Replace);
        assert_eq!(settings.policies.batch_update, RecomputePolicy::BatchLocal);
        assert_eq!(settings.number_allocation_retries, 3);
        assert!(settings.recurring_max_per_run.is_none());
    }
}
