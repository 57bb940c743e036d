//! Recurring invoice regeneration.

use super::balance::{self, Adjustment, RecomputePolicy};
use super::ledger::{client_not_found, observed, LedgerService};
use super::metrics::{record_invoice_amount, RECURRING_INVOICES_TOTAL};
use super::numbering;
use crate::models::{Invoice, NewInvoice, RecurringFailure, RecurringRunReport, Scope};
use chrono::Months;
use service_core::error::AppError;
use service_core::retry::retry_on_conflict;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

impl LedgerService {
    /// Spawn a successor for every recurring template that has come due.
    ///
    /// Each template is handled in its own unit of work. A template that fails
    /// is logged and reported without stopping the rest of the run.
    #[instrument(skip(self))]
    pub async fn generate_recurring_invoices(&self) -> Result<RecurringRunReport, AppError> {
        observed("generate_recurring_invoices", async {
            let now = self.clock.now();
            let candidates = {
                let mut tx = self.store.begin().await?;
                let due = tx.due_recurring_invoices(now).await?;
                tx.commit().await?;
                due
            };

            let mut report = RecurringRunReport {
                scanned: candidates.len(),
                ..Default::default()
            };

            for template in &candidates {
                if let Some(max) = self.settings.recurring_max_per_run {
                    if report.generated.len() >= max {
                        info!(max_per_run = max, "Recurring run limit reached");
                        break;
                    }
                }

                let outcome = retry_on_conflict(
                    &self.retry_config(),
                    "spawn_recurring_invoice",
                    || self.spawn_successor(template.invoice_id),
                )
                .await;

                match outcome {
                    Ok(Some(successor)) => {
                        RECURRING_INVOICES_TOTAL
                            .with_label_values(&["generated"])
                            .inc();
                        record_invoice_amount(Scope::Final.as_str(), successor.line_total);
                        info!(
                            template_id = %template.invoice_id,
                            invoice_id = %successor.invoice_id,
                            invoice_number = %successor.invoice_number,
                            due_date = %successor.due_date,
                            "Recurring invoice generated"
                        );
                        report.generated.push(successor);
                    }
                    Ok(None) => {
                        RECURRING_INVOICES_TOTAL.with_label_values(&["skipped"]).inc();
                        report.skipped += 1;
                    }
                    Err(e) => {
                        RECURRING_INVOICES_TOTAL.with_label_values(&["failed"]).inc();
                        error!(
                            template_id = %template.invoice_id,
                            error = %e,
                            "Failed to generate recurring invoice"
                        );
                        report.failures.push(RecurringFailure {
                            invoice_id: template.invoice_id,
                            error: e.to_string(),
                        });
                    }
                }
            }

            Ok(report)
        })
        .await
    }

    /// Create the successor of one template. `None` when the template no longer qualifies.
    async fn spawn_successor(&self, template_id: Uuid) -> Result<Option<Invoice>, AppError> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;

        let Some(template) = tx.find_invoice(template_id).await? else {
            return Ok(None);
        };
        tx.lock_client(template.client_id)
            .await?
            .ok_or_else(|| client_not_found(template.client_id))?;
        let Some(template) = tx.find_invoice(template_id).await? else {
            return Ok(None);
        };

        if !template.is_recurring
            || template.is_draft
            || template.due_date > now
            || tx.has_successor(template_id).await?
        {
            warn!(template_id = %template_id, "Recurring template no longer due, skipping");
            return Ok(None);
        }

        let line_total = balance::line_total(template.rate, template.quantity)?;
        let due_date = now.checked_add_months(Months::new(1)).ok_or_else(|| {
            AppError::InternalError(anyhow::anyhow!("Due date after {} is out of range", now))
        })?;
        let invoice_number = numbering::allocate(&mut *tx, now).await?.to_string();
        let total_outstanding = RecomputePolicy::FreshCycle.aggregate(
            Scope::Final,
            Adjustment {
                new: line_total,
                ..Default::default()
            },
            &[],
        )?;

        let successor = tx
            .insert_invoice(
                &NewInvoice {
                    invoice_id: Uuid::new_v4(),
                    invoice_number,
                    client_id: template.client_id,
                    description: template.description.clone(),
                    rate: template.rate,
                    quantity: template.quantity,
                    line_total,
                    total_outstanding,
                    is_draft: false,
                    is_recurring: true,
                    issued_date: now,
                    due_date,
                    notes: template.notes.clone(),
                    terms: template.terms.clone(),
                    predecessor_id: Some(template_id),
                },
                now,
            )
            .await?;

        // The template's own invoice number keeps its own running total.
        let group = tx
            .numbered_invoices(template.client_id, &template.invoice_number)
            .await?;
        let group_total = balance::bounded_sum(group.iter().map(|i| i.line_total))?;
        let group_ids: Vec<Uuid> = group.iter().map(|i| i.invoice_id).collect();
        tx.set_invoices_outstanding(&group_ids, group_total, now)
            .await?;

        tx.commit().await?;
        Ok(Some(successor))
    }
}
