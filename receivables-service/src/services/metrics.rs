//! Prometheus metrics for receivables-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_counter, CounterVec, HistogramVec,
    IntCounter, TextEncoder,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Ledger operation counter by operation and status.
pub static LEDGER_OPERATIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "receivables_ledger_operations_total",
        "Total number of ledger operations",
        &["operation", "status"]
    )
    .expect("Failed to register ledger_operations_total")
});

/// Database query duration histogram.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "receivables_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to register db_query_duration")
});

/// Invoice number allocations that lost a race and were retried.
pub static INVOICE_NUMBER_CONFLICTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "receivables_invoice_number_conflicts_total",
        "Total number of invoice number allocation conflicts"
    )
    .expect("Failed to register invoice_number_conflicts_total")
});

/// Recurring generation runs by status.
pub static RECURRING_RUNS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "receivables_recurring_runs_total",
        "Total number of recurring generation runs",
        &["status"] // completed, partial, failed
    )
    .expect("Failed to register recurring_runs_total")
});

/// Recurring templates processed by result.
pub static RECURRING_INVOICES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "receivables_recurring_invoices_total",
        "Total number of recurring templates processed",
        &["result"] // generated, skipped, failed
    )
    .expect("Failed to register recurring_invoices_total")
});

/// Error counter for alerting.
pub static ERRORS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "receivables_errors_total",
        "Total number of errors by type",
        &["error_type"]
    )
    .expect("Failed to register errors_total")
});

/// Invoiced line amounts by scope.
pub static INVOICE_AMOUNT_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "receivables_invoice_amount_total",
        "Total invoiced line amount by scope",
        &["scope"]
    )
    .expect("Failed to register invoice_amount_total")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&LEDGER_OPERATIONS_TOTAL);
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&INVOICE_NUMBER_CONFLICTS_TOTAL);
    Lazy::force(&RECURRING_RUNS_TOTAL);
    Lazy::force(&RECURRING_INVOICES_TOTAL);
    Lazy::force(&ERRORS_TOTAL);
    Lazy::force(&INVOICE_AMOUNT_TOTAL);
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}

/// Record the outcome of a ledger operation.
pub fn record_operation<T>(operation: &str, result: &Result<T, service_core::error::AppError>) {
    match result {
        Ok(_) => {
            LEDGER_OPERATIONS_TOTAL
                .with_label_values(&[operation, "success"])
                .inc();
        }
        Err(e) => {
            LEDGER_OPERATIONS_TOTAL
                .with_label_values(&[operation, "error"])
                .inc();
            ERRORS_TOTAL.with_label_values(&[e.kind().as_str()]).inc();
        }
    }
}

/// Record an invoiced amount. Negative amounts are not counted.
pub fn record_invoice_amount(scope: &str, amount: Decimal) {
    let value = amount.to_f64().unwrap_or(0.0);
    if value > 0.0 {
        INVOICE_AMOUNT_TOTAL.with_label_values(&[scope]).inc_by(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use service_core::error::AppError;

    #[test]
    fn metrics_are_exported_in_text_format() {
        init_metrics();
        record_operation::<()>("create_invoices", &Ok(()));
        record_operation::<()>(
            "create_invoices",
            &Err(AppError::NotFound(anyhow::anyhow!("missing"))),
        );
        record_invoice_amount("final", dec!(12.50));

        let text = get_metrics();
        assert!(text.contains("receivables_ledger_operations_total"));
        assert!(text.contains("receivables_errors_total"));
        assert!(text.contains("receivables_invoice_amount_total"));
    }
}
