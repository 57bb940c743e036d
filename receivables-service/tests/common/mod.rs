//! Test helper module for receivables-service integration tests.
//!
//! Builds the ledger over the in-memory store and a clock the test controls.

#![allow(dead_code)]

pub mod contested;

use chrono::{DateTime, Duration, TimeZone, Utc};
use receivables_service::models::{
    Client, CreateClient, Invoice, InvoiceInput, InvoicePatch, Scope,
};
use receivables_service::services::{
    init_metrics, FixedClock, InMemoryStore, LedgerService, LedgerSettings,
};
use receivables_service::startup::probe_router;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::net::TcpListener;
use uuid::Uuid;

use contested::ContestedStore;

/// 2025-03-15 10:00:00 UTC.
pub fn start_of_tests() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 15, 10, 0, 0).unwrap()
}

/// Test application wrapper for integration tests.
pub struct TestApp {
    pub ledger: LedgerService,
    pub clock: Arc<FixedClock>,
    pub store: InMemoryStore,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(LedgerSettings::default()).await
    }

    pub async fn spawn_with(settings: LedgerSettings) -> Self {
        init_metrics();

        let store = InMemoryStore::new();
        let clock = Arc::new(FixedClock::new(start_of_tests()));
        let ledger = LedgerService::new(Arc::new(store.clone()), clock.clone(), settings);

        Self {
            ledger,
            clock,
            store,
        }
    }

    /// Ledger over a store that loses invoice number races when armed.
    pub async fn spawn_contested() -> (Self, ContestedStore) {
        init_metrics();

        let store = InMemoryStore::new();
        let contested = ContestedStore::new(store.clone());
        let clock = Arc::new(FixedClock::new(start_of_tests()));
        let ledger = LedgerService::new(
            Arc::new(contested.clone()),
            clock.clone(),
            LedgerSettings::default(),
        );

        (
            Self {
                ledger,
                clock,
                store,
            },
            contested,
        )
    }

    /// Serve the probe router on a random local port and return its base URL.
    pub async fn serve_probes(&self) -> String {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind random port");
        let port = listener.local_addr().unwrap().port();
        let router = probe_router(self.ledger.clone(), "receivables-service");

        tokio::spawn(async move {
            axum::serve(listener, router)
                .await
                .expect("Probe server failed");
        });

        format!("http://127.0.0.1:{}", port)
    }

    pub fn now(&self) -> DateTime<Utc> {
        use receivables_service::services::Clock;
        self.clock.now()
    }

    pub async fn create_client(&self, company_name: &str) -> Client {
        self.ledger
            .create_client(client_input(company_name))
            .await
            .expect("Failed to create client")
    }

    /// Live invoices of a client in one scope.
    pub async fn scope_rows(&self, client_id: Uuid, scope: Scope) -> Vec<Invoice> {
        self.ledger
            .get_client_with_invoices(client_id)
            .await
            .expect("Failed to load client")
            .invoices
            .into_iter()
            .filter(|i| i.scope() == scope)
            .collect()
    }

    /// Every live row in `scope` carries Σ line_total of the scope.
    pub async fn assert_aggregate_consistent(&self, client_id: Uuid, scope: Scope) {
        let rows = self.scope_rows(client_id, scope).await;
        let expected: Decimal = rows.iter().map(|i| i.line_total).sum();
        for row in &rows {
            assert_eq!(
                row.total_outstanding, expected,
                "invoice {} carries {} but the {} scope sums to {}",
                row.invoice_id,
                row.total_outstanding,
                scope.as_str(),
                expected
            );
        }
    }
}

pub fn client_input(company_name: &str) -> CreateClient {
    CreateClient {
        firstname: "Grace".to_string(),
        lastname: "Hopper".to_string(),
        company_name: company_name.to_string(),
        email: Some(format!(
            "billing@{}.example.com",
            company_name.to_lowercase().replace(' ', "-")
        )),
        phone_number: None,
        business_phone: None,
        mobile_phone: None,
        address: None,
    }
}

pub fn invoice_input(description: &str, rate: Decimal, quantity: Decimal) -> InvoiceInput {
    InvoiceInput {
        description: description.to_string(),
        rate,
        quantity,
        due_date: start_of_tests() + Duration::days(30),
        notes: None,
        terms: Some("Net 30".to_string()),
        is_recurring: false,
    }
}

pub fn recurring_input(
    description: &str,
    rate: Decimal,
    quantity: Decimal,
    due_date: DateTime<Utc>,
) -> InvoiceInput {
    InvoiceInput {
        due_date,
        is_recurring: true,
        ..invoice_input(description, rate, quantity)
    }
}

pub fn patch(description: &str, rate: Decimal, quantity: Decimal) -> InvoicePatch {
    InvoicePatch {
        description: description.to_string(),
        rate,
        quantity,
        due_date: start_of_tests() + Duration::days(30),
        notes: None,
        terms: None,
        is_recurring: None,
    }
}
