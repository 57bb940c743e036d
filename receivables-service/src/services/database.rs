//! PostgreSQL ledger store for receivables-service.

use super::store::{LedgerStore, LedgerTx};
use crate::models::{
    Client, ClientDetails, Invoice, InvoiceChanges, NewInvoice, Scope, SearchFilter,
};
use crate::services::metrics::DB_QUERY_DURATION;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

const CLIENT_COLUMNS: &str = "client_id, firstname, lastname, company_name, email, phone_number, \
     business_phone, mobile_phone, address, created_utc, updated_utc, deleted_utc";

const INVOICE_COLUMNS: &str = "invoice_id, invoice_number, client_id, description, rate, quantity, \
     line_total, total_outstanding, is_draft, is_recurring, issued_date, due_date, notes, terms, \
     predecessor_id, created_utc, updated_utc, deleted_utc";

const INVOICE_SEARCH: &str = r#"
    deleted_utc IS NULL
    AND (
        $1 = ''
        OR invoice_number ILIKE $2
        OR description ILIKE $2
        OR ($3::date IS NOT NULL AND (
            (issued_date AT TIME ZONE 'UTC')::date = $3
            OR (due_date AT TIME ZONE 'UTC')::date = $3
        ))
        OR ($4::numeric IS NOT NULL AND total_outstanding = $4)
    )
"#;

/// Live clients matching on their own fields, on any live invoice, or
/// having no live invoice at all. Takes the same parameters as [`INVOICE_SEARCH`].
fn client_search() -> String {
    format!(
        r#"
        c.deleted_utc IS NULL
        AND (
            $1 = ''
            OR c.firstname ILIKE $2
            OR c.lastname ILIKE $2
            OR c.company_name ILIKE $2
            OR c.email ILIKE $2
            OR EXISTS (
                SELECT 1 FROM invoices
                WHERE client_id = c.client_id AND {INVOICE_SEARCH}
            )
            OR NOT EXISTS (
                SELECT 1 FROM invoices
                WHERE client_id = c.client_id AND deleted_utc IS NULL
            )
        )
        "#
    )
}

fn db_error(action: &str, e: sqlx::Error) -> AppError {
    AppError::DatabaseError(anyhow::anyhow!("Failed to {}: {}", action, e))
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "receivables-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(acquire_timeout)
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for Database {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, AppError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("begin transaction", e))?;
        Ok(Box::new(PgLedgerTx { tx }))
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }
}

/// One PostgreSQL transaction. Rolled back on drop unless committed.
pub struct PgLedgerTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    // -------------------------------------------------------------------------
    // Client Operations
    // -------------------------------------------------------------------------

    #[instrument(skip(self, details), fields(client_id = %client_id))]
    async fn insert_client(
        &mut self,
        client_id: Uuid,
        details: &ClientDetails,
        now: DateTime<Utc>,
    ) -> Result<Client, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_client"])
            .start_timer();

        let sql = format!(
            r#"
            INSERT INTO clients (client_id, firstname, lastname, company_name, email, phone_number,
                business_phone, mobile_phone, address, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)
            RETURNING {CLIENT_COLUMNS}
            "#
        );
        let client = sqlx::query_as::<_, Client>(&sql)
            .bind(client_id)
            .bind(&details.firstname)
            .bind(&details.lastname)
            .bind(&details.company_name)
            .bind(&details.email)
            .bind(&details.phone_number)
            .bind(&details.business_phone)
            .bind(&details.mobile_phone)
            .bind(&details.address)
            .bind(now)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                    AppError::Conflict(anyhow::anyhow!("Client {} already exists", client_id))
                }
                _ => db_error("create client", e),
            })?;

        timer.observe_duration();

        Ok(client)
    }

    #[instrument(skip(self), fields(client_id = %client_id))]
    async fn find_client(&mut self, client_id: Uuid) -> Result<Option<Client>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_client"])
            .start_timer();

        let sql = format!(
            "SELECT {CLIENT_COLUMNS} FROM clients WHERE client_id = $1 AND deleted_utc IS NULL"
        );
        let client = sqlx::query_as::<_, Client>(&sql)
            .bind(client_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| db_error("get client", e))?;

        timer.observe_duration();

        Ok(client)
    }

    #[instrument(skip(self), fields(client_id = %client_id))]
    async fn lock_client(&mut self, client_id: Uuid) -> Result<Option<Client>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["lock_client"])
            .start_timer();

        let sql = format!(
            "SELECT {CLIENT_COLUMNS} FROM clients \
             WHERE client_id = $1 AND deleted_utc IS NULL FOR UPDATE"
        );
        let client = sqlx::query_as::<_, Client>(&sql)
            .bind(client_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| db_error("lock client", e))?;

        timer.observe_duration();

        Ok(client)
    }

    #[instrument(skip(self, details), fields(client_id = %client_id))]
    async fn update_client(
        &mut self,
        client_id: Uuid,
        details: &ClientDetails,
        now: DateTime<Utc>,
    ) -> Result<Option<Client>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_client"])
            .start_timer();

        let sql = format!(
            r#"
            UPDATE clients
            SET firstname = $2, lastname = $3, company_name = $4, email = $5, phone_number = $6,
                business_phone = $7, mobile_phone = $8, address = $9, updated_utc = $10
            WHERE client_id = $1 AND deleted_utc IS NULL
            RETURNING {CLIENT_COLUMNS}
            "#
        );
        let client = sqlx::query_as::<_, Client>(&sql)
            .bind(client_id)
            .bind(&details.firstname)
            .bind(&details.lastname)
            .bind(&details.company_name)
            .bind(&details.email)
            .bind(&details.phone_number)
            .bind(&details.business_phone)
            .bind(&details.mobile_phone)
            .bind(&details.address)
            .bind(now)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| db_error("update client", e))?;

        timer.observe_duration();

        Ok(client)
    }

    #[instrument(skip(self), fields(client_id = %client_id))]
    async fn soft_delete_client(
        &mut self,
        client_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Client>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["soft_delete_client"])
            .start_timer();

        let sql = format!(
            r#"
            UPDATE clients SET deleted_utc = $2, updated_utc = $2
            WHERE client_id = $1 AND deleted_utc IS NULL
            RETURNING {CLIENT_COLUMNS}
            "#
        );
        let client = sqlx::query_as::<_, Client>(&sql)
            .bind(client_id)
            .bind(now)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| db_error("delete client", e))?;

        if client.is_some() {
            let cascaded = sqlx::query(
                r#"
                UPDATE invoices SET deleted_utc = $2, updated_utc = $2
                WHERE client_id = $1 AND deleted_utc IS NULL
                "#,
            )
            .bind(client_id)
            .bind(now)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| db_error("delete client invoices", e))?;

            info!(
                client_id = %client_id,
                invoices = cascaded.rows_affected(),
                "Client invoices soft-deleted"
            );
        }

        timer.observe_duration();

        Ok(client)
    }

    #[instrument(skip(self, filter))]
    async fn list_clients(
        &mut self,
        filter: &SearchFilter,
    ) -> Result<(Vec<Client>, i64), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_clients"])
            .start_timer();

        let query = filter.trimmed_query();
        let pattern = format!("%{}%", query);
        let date = filter.query_date();
        let amount = filter.query_amount();
        let search = client_search();

        let total: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM clients c WHERE {search}"
        ))
        .bind(query)
        .bind(&pattern)
        .bind(date)
        .bind(amount)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| db_error("count clients", e))?;

        let columns = CLIENT_COLUMNS
            .split(", ")
            .map(|c| format!("c.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {columns} FROM clients c WHERE {search} \
             ORDER BY c.created_utc DESC LIMIT $5 OFFSET $6"
        );
        let clients = sqlx::query_as::<_, Client>(&sql)
            .bind(query)
            .bind(&pattern)
            .bind(date)
            .bind(amount)
            .bind(filter.limit())
            .bind(filter.offset())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| db_error("list clients", e))?;

        timer.observe_duration();

        Ok((clients, total))
    }

    // -------------------------------------------------------------------------
    // Invoice Operations
    // -------------------------------------------------------------------------

    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    async fn find_invoice(&mut self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_invoice"])
            .start_timer();

        let sql = format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE invoice_id = $1 AND deleted_utc IS NULL"
        );
        let invoice = sqlx::query_as::<_, Invoice>(&sql)
            .bind(invoice_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| db_error("get invoice", e))?;

        timer.observe_duration();

        Ok(invoice)
    }

    #[instrument(skip(self), fields(client_id = %client_id))]
    async fn client_invoices(&mut self, client_id: Uuid) -> Result<Vec<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["client_invoices"])
            .start_timer();

        let sql = format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices \
             WHERE client_id = $1 AND deleted_utc IS NULL \
             ORDER BY created_utc DESC"
        );
        let invoices = sqlx::query_as::<_, Invoice>(&sql)
            .bind(client_id)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| db_error("list client invoices", e))?;

        timer.observe_duration();

        Ok(invoices)
    }

    #[instrument(skip(self), fields(client_id = %client_id, scope = scope.as_str()))]
    async fn scope_invoices(
        &mut self,
        client_id: Uuid,
        scope: Scope,
    ) -> Result<Vec<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["scope_invoices"])
            .start_timer();

        let sql = format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices \
             WHERE client_id = $1 AND is_draft = $2 AND deleted_utc IS NULL \
             ORDER BY created_utc"
        );
        let invoices = sqlx::query_as::<_, Invoice>(&sql)
            .bind(client_id)
            .bind(scope.is_draft())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| db_error("list scope invoices", e))?;

        timer.observe_duration();

        Ok(invoices)
    }

    #[instrument(skip(self), fields(client_id = %client_id, invoice_number = %invoice_number))]
    async fn numbered_invoices(
        &mut self,
        client_id: Uuid,
        invoice_number: &str,
    ) -> Result<Vec<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["numbered_invoices"])
            .start_timer();

        let sql = format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices \
             WHERE client_id = $1 AND invoice_number = $2 AND deleted_utc IS NULL \
             ORDER BY created_utc"
        );
        let invoices = sqlx::query_as::<_, Invoice>(&sql)
            .bind(client_id)
            .bind(invoice_number)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| db_error("list numbered invoices", e))?;

        timer.observe_duration();

        Ok(invoices)
    }

    #[instrument(skip(self, ids), fields(client_id = %client_id, invoice_number = %invoice_number))]
    async fn invoices_by_ids(
        &mut self,
        client_id: Uuid,
        invoice_number: &str,
        ids: &[Uuid],
    ) -> Result<Vec<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["invoices_by_ids"])
            .start_timer();

        let sql = format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices \
             WHERE invoice_id = ANY($1) AND client_id = $2 AND invoice_number = $3 \
               AND deleted_utc IS NULL"
        );
        let invoices = sqlx::query_as::<_, Invoice>(&sql)
            .bind(ids)
            .bind(client_id)
            .bind(invoice_number)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| db_error("load batch invoices", e))?;

        timer.observe_duration();

        Ok(invoices)
    }

    #[instrument(skip(self, invoice), fields(invoice_id = %invoice.invoice_id, client_id = %invoice.client_id))]
    async fn insert_invoice(
        &mut self,
        invoice: &NewInvoice,
        now: DateTime<Utc>,
    ) -> Result<Invoice, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_invoice"])
            .start_timer();

        let sql = format!(
            r#"
            INSERT INTO invoices (
                invoice_id, invoice_number, client_id, description, rate, quantity, line_total,
                total_outstanding, is_draft, is_recurring, issued_date, due_date, notes, terms,
                predecessor_id, created_utc, updated_utc
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $16)
            RETURNING {INVOICE_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, Invoice>(&sql)
            .bind(invoice.invoice_id)
            .bind(&invoice.invoice_number)
            .bind(invoice.client_id)
            .bind(&invoice.description)
            .bind(invoice.rate)
            .bind(invoice.quantity)
            .bind(invoice.line_total)
            .bind(invoice.total_outstanding)
            .bind(invoice.is_draft)
            .bind(invoice.is_recurring)
            .bind(invoice.issued_date)
            .bind(invoice.due_date)
            .bind(&invoice.notes)
            .bind(&invoice.terms)
            .bind(invoice.predecessor_id)
            .bind(now)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                    AppError::Contention(anyhow::anyhow!(
                        "Invoice {} already has a successor",
                        invoice.predecessor_id.unwrap_or(invoice.invoice_id)
                    ))
                }
                _ => db_error("create invoice", e),
            })?;

        timer.observe_duration();

        Ok(row)
    }

    #[instrument(skip(self, changes), fields(invoice_id = %invoice_id))]
    async fn update_invoice(
        &mut self,
        invoice_id: Uuid,
        changes: &InvoiceChanges,
        now: DateTime<Utc>,
    ) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_invoice"])
            .start_timer();

        let sql = format!(
            r#"
            UPDATE invoices
            SET description = $2, rate = $3, quantity = $4, line_total = $5, due_date = $6,
                notes = $7, terms = $8, is_draft = $9, is_recurring = $10, updated_utc = $11
            WHERE invoice_id = $1 AND deleted_utc IS NULL
            RETURNING {INVOICE_COLUMNS}
            "#
        );
        let invoice = sqlx::query_as::<_, Invoice>(&sql)
            .bind(invoice_id)
            .bind(&changes.description)
            .bind(changes.rate)
            .bind(changes.quantity)
            .bind(changes.line_total)
            .bind(changes.due_date)
            .bind(&changes.notes)
            .bind(&changes.terms)
            .bind(changes.is_draft)
            .bind(changes.is_recurring)
            .bind(now)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| db_error("update invoice", e))?;

        timer.observe_duration();

        Ok(invoice)
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    async fn soft_delete_invoice(
        &mut self,
        invoice_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["soft_delete_invoice"])
            .start_timer();

        let sql = format!(
            r#"
            UPDATE invoices SET deleted_utc = $2, updated_utc = $2
            WHERE invoice_id = $1 AND deleted_utc IS NULL
            RETURNING {INVOICE_COLUMNS}
            "#
        );
        let invoice = sqlx::query_as::<_, Invoice>(&sql)
            .bind(invoice_id)
            .bind(now)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| db_error("delete invoice", e))?;

        timer.observe_duration();

        Ok(invoice)
    }

    #[instrument(skip(self), fields(client_id = %client_id, scope = scope.as_str(), total = %total))]
    async fn set_scope_outstanding(
        &mut self,
        client_id: Uuid,
        scope: Scope,
        total: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Vec<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_scope_outstanding"])
            .start_timer();

        let sql = format!(
            r#"
            UPDATE invoices SET total_outstanding = $3, updated_utc = $4
            WHERE client_id = $1 AND is_draft = $2 AND deleted_utc IS NULL
            RETURNING {INVOICE_COLUMNS}
            "#
        );
        let invoices = sqlx::query_as::<_, Invoice>(&sql)
            .bind(client_id)
            .bind(scope.is_draft())
            .bind(total)
            .bind(now)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| db_error("update outstanding totals", e))?;

        timer.observe_duration();

        Ok(invoices)
    }

    #[instrument(skip(self, invoice_ids), fields(count = invoice_ids.len(), total = %total))]
    async fn set_invoices_outstanding(
        &mut self,
        invoice_ids: &[Uuid],
        total: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Vec<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_invoices_outstanding"])
            .start_timer();

        let sql = format!(
            r#"
            UPDATE invoices SET total_outstanding = $2, updated_utc = $3
            WHERE invoice_id = ANY($1) AND deleted_utc IS NULL
            RETURNING {INVOICE_COLUMNS}
            "#
        );
        let invoices = sqlx::query_as::<_, Invoice>(&sql)
            .bind(invoice_ids)
            .bind(total)
            .bind(now)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| db_error("update outstanding totals", e))?;

        timer.observe_duration();

        Ok(invoices)
    }

    #[instrument(skip(self))]
    async fn due_recurring_invoices(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["due_recurring_invoices"])
            .start_timer();

        let sql = format!(
            r#"
            SELECT {INVOICE_COLUMNS} FROM invoices t
            WHERE t.deleted_utc IS NULL
              AND t.is_recurring = TRUE
              AND t.is_draft = FALSE
              AND t.due_date <= $1
              AND NOT EXISTS (SELECT 1 FROM invoices s WHERE s.predecessor_id = t.invoice_id)
            ORDER BY t.due_date, t.invoice_id
            "#
        );
        let invoices = sqlx::query_as::<_, Invoice>(&sql)
            .bind(now)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| db_error("scan recurring invoices", e))?;

        timer.observe_duration();

        Ok(invoices)
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    async fn has_successor(&mut self, invoice_id: Uuid) -> Result<bool, AppError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM invoices WHERE predecessor_id = $1)",
        )
        .bind(invoice_id)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| db_error("check successor", e))?;

        Ok(exists)
    }

    #[instrument(skip(self, filter))]
    async fn list_invoices(
        &mut self,
        filter: &SearchFilter,
    ) -> Result<(Vec<Invoice>, i64), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_invoices"])
            .start_timer();

        let query = filter.trimmed_query();
        let pattern = format!("%{}%", query);
        let date = filter.query_date();
        let amount = filter.query_amount();

        let total: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM invoices WHERE {INVOICE_SEARCH}"
        ))
        .bind(query)
        .bind(&pattern)
        .bind(date)
        .bind(amount)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| db_error("count invoices", e))?;

        let sql = format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE {INVOICE_SEARCH} \
             ORDER BY created_utc DESC LIMIT $5 OFFSET $6"
        );
        let invoices = sqlx::query_as::<_, Invoice>(&sql)
            .bind(query)
            .bind(&pattern)
            .bind(date)
            .bind(amount)
            .bind(filter.limit())
            .bind(filter.offset())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| db_error("list invoices", e))?;

        timer.observe_duration();

        Ok((invoices, total))
    }

    #[instrument(skip(self, client_ids, filter), fields(clients = client_ids.len()))]
    async fn matching_invoices(
        &mut self,
        client_ids: &[Uuid],
        filter: &SearchFilter,
    ) -> Result<Vec<Invoice>, AppError> {
        if client_ids.is_empty() {
            return Ok(Vec::new());
        }
        let timer = DB_QUERY_DURATION
            .with_label_values(&["matching_invoices"])
            .start_timer();

        let query = filter.trimmed_query();
        let sql = format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices \
             WHERE client_id = ANY($5) AND {INVOICE_SEARCH} \
             ORDER BY created_utc DESC"
        );
        let invoices = sqlx::query_as::<_, Invoice>(&sql)
            .bind(query)
            .bind(format!("%{}%", query))
            .bind(filter.query_date())
            .bind(filter.query_amount())
            .bind(client_ids)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| db_error("list matching invoices", e))?;

        timer.observe_duration();

        Ok(invoices)
    }

    #[instrument(skip(self), fields(scope = scope.as_str()))]
    async fn sum_line_totals(
        &mut self,
        scope: Scope,
        due_on_or_before: Option<DateTime<Utc>>,
    ) -> Result<Decimal, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["sum_line_totals"])
            .start_timer();

        let total: Decimal = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(line_total), 0) FROM invoices
            WHERE deleted_utc IS NULL
              AND is_draft = $1
              AND ($2::timestamptz IS NULL OR due_date <= $2)
            "#,
        )
        .bind(scope.is_draft())
        .bind(due_on_or_before)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| db_error("sum outstanding totals", e))?;

        timer.observe_duration();

        Ok(total)
    }

    // -------------------------------------------------------------------------
    // Invoice Number Operations
    // -------------------------------------------------------------------------

    #[instrument(skip(self))]
    async fn last_invoice_number(&mut self, prefix: &str) -> Result<Option<String>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["last_invoice_number"])
            .start_timer();

        let number: Option<String> = sqlx::query_scalar(
            r#"
            SELECT invoice_number FROM invoice_numbers
            WHERE starts_with(invoice_number, $1)
            ORDER BY LENGTH(invoice_number) DESC, invoice_number DESC
            LIMIT 1
            "#,
        )
        .bind(prefix)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| db_error("read last invoice number", e))?;

        timer.observe_duration();

        Ok(number)
    }

    #[instrument(skip(self))]
    async fn reserve_invoice_number(
        &mut self,
        invoice_number: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["reserve_invoice_number"])
            .start_timer();

        sqlx::query("INSERT INTO invoice_numbers (invoice_number, allocated_utc) VALUES ($1, $2)")
            .bind(invoice_number)
            .bind(now)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                    AppError::Contention(anyhow::anyhow!(
                        "Invoice number {} is already allocated",
                        invoice_number
                    ))
                }
                _ => db_error("reserve invoice number", e),
            })?;

        timer.observe_duration();

        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), AppError> {
        self.tx
            .commit()
            .await
            .map_err(|e| db_error("commit transaction", e))
    }
}
