//! Invoice create, update, promote, and delete tests.

mod common;

use common::{invoice_input, patch, TestApp};
use receivables_service::models::{InvoicePatch, Scope};
use rust_decimal_macros::dec;
use service_core::error::{AppError, ErrorKind};
use uuid::Uuid;

#[tokio::test]
async fn batch_create_shares_one_number_and_stamps_the_client_total() {
    let app = TestApp::spawn().await;
    let client = app.create_client("Acme Corp").await;

    let invoices = app
        .ledger
        .create_many(
            client.client_id,
            vec![
                invoice_input("Design sprint", dec!(100), dec!(2)),
                invoice_input("Hosting", dec!(50), dec!(1)),
            ],
        )
        .await
        .unwrap();

    assert_eq!(invoices.len(), 2);
    assert_eq!(invoices[0].line_total, dec!(200));
    assert_eq!(invoices[1].line_total, dec!(50));
    for invoice in &invoices {
        assert_eq!(invoice.invoice_number, "LWS-25-0001");
        assert_eq!(invoice.total_outstanding, dec!(250));
        assert!(!invoice.is_draft);
        assert_eq!(invoice.issued_date, app.now());
    }
}

#[tokio::test]
async fn editing_an_invoice_delta_adjusts_the_client_total() {
    let app = TestApp::spawn().await;
    let client = app.create_client("Acme Corp").await;
    let invoices = app
        .ledger
        .create_many(
            client.client_id,
            vec![
                invoice_input("Design sprint", dec!(100), dec!(2)),
                invoice_input("Hosting", dec!(50), dec!(1)),
            ],
        )
        .await
        .unwrap();

    let updated = app
        .ledger
        .update_invoice(invoices[0].invoice_id, patch("Design sprint", dec!(100), dec!(1)))
        .await
        .unwrap();

    assert_eq!(updated.line_total, dec!(100));
    assert_eq!(updated.total_outstanding, dec!(150));
    for row in app.scope_rows(client.client_id, Scope::Final).await {
        assert_eq!(row.total_outstanding, dec!(150));
    }
}

#[tokio::test]
async fn deleting_an_invoice_recomputes_from_what_remains() {
    let app = TestApp::spawn().await;
    let client = app.create_client("Acme Corp").await;
    let invoices = app
        .ledger
        .create_many(
            client.client_id,
            vec![
                invoice_input("Design sprint", dec!(100), dec!(2)),
                invoice_input("Hosting", dec!(50), dec!(1)),
            ],
        )
        .await
        .unwrap();
    app.ledger
        .update_invoice(invoices[0].invoice_id, patch("Design sprint", dec!(100), dec!(1)))
        .await
        .unwrap();

    let deletion = app
        .ledger
        .delete_invoice(invoices[1].invoice_id)
        .await
        .unwrap();

    assert_eq!(deletion.deleted_invoice.invoice_id, invoices[1].invoice_id);
    assert!(deletion.deleted_invoice.deleted_utc.is_some());
    assert_eq!(deletion.updated_invoices.len(), 1);
    assert_eq!(deletion.updated_invoices[0].invoice_id, invoices[0].invoice_id);
    assert_eq!(deletion.updated_invoices[0].total_outstanding, dec!(100));
}

#[tokio::test]
async fn deleted_invoices_disappear_from_reads_and_sums() {
    let app = TestApp::spawn().await;
    let client = app.create_client("Acme Corp").await;
    let invoices = app
        .ledger
        .create_many(
            client.client_id,
            vec![
                invoice_input("Design sprint", dec!(100), dec!(2)),
                invoice_input("Hosting", dec!(50), dec!(1)),
            ],
        )
        .await
        .unwrap();

    app.ledger
        .delete_invoice(invoices[0].invoice_id)
        .await
        .unwrap();

    let err = app
        .ledger
        .get_invoice(invoices[0].invoice_id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(app.ledger.sum_total_outstanding().await.unwrap(), dec!(50));
    assert_eq!(app.scope_rows(client.client_id, Scope::Final).await.len(), 1);

    let again = app.ledger.delete_invoice(invoices[0].invoice_id).await;
    assert!(matches!(again, Err(AppError::NotFound(_))));
}

#[tokio::test]
async fn drafts_and_finals_are_aggregated_separately() {
    let app = TestApp::spawn().await;
    let client = app.create_client("Acme Corp").await;

    app.ledger
        .create_many(
            client.client_id,
            vec![invoice_input("Design sprint", dec!(100), dec!(2))],
        )
        .await
        .unwrap();
    let drafts = app
        .ledger
        .draft_many(
            client.client_id,
            vec![
                invoice_input("Proposal A", dec!(30), dec!(1)),
                invoice_input("Proposal B", dec!(20), dec!(2)),
            ],
        )
        .await
        .unwrap();

    assert!(drafts.iter().all(|d| d.is_draft));
    assert!(drafts.iter().all(|d| d.total_outstanding == dec!(70)));
    assert_eq!(drafts[0].invoice_number, "LWS-25-0002");
    for row in app.scope_rows(client.client_id, Scope::Final).await {
        assert_eq!(row.total_outstanding, dec!(200));
    }
    assert_eq!(app.ledger.sum_draft_total_outstanding().await.unwrap(), dec!(70));
}

#[tokio::test]
async fn generic_update_promotes_a_draft_to_final() {
    let app = TestApp::spawn().await;
    let client = app.create_client("Acme Corp").await;
    app.ledger
        .create_many(
            client.client_id,
            vec![invoice_input("Design sprint", dec!(100), dec!(2))],
        )
        .await
        .unwrap();
    let drafts = app
        .ledger
        .draft_many(
            client.client_id,
            vec![
                invoice_input("Proposal A", dec!(30), dec!(1)),
                invoice_input("Proposal B", dec!(20), dec!(2)),
            ],
        )
        .await
        .unwrap();

    let promoted = app
        .ledger
        .update_invoice(drafts[0].invoice_id, patch("Proposal A", dec!(30), dec!(2)))
        .await
        .unwrap();

    assert!(!promoted.is_draft);
    assert_eq!(promoted.line_total, dec!(60));
    assert_eq!(promoted.total_outstanding, dec!(260));
    app.assert_aggregate_consistent(client.client_id, Scope::Final).await;
    app.assert_aggregate_consistent(client.client_id, Scope::Draft).await;

    let remaining = app.scope_rows(client.client_id, Scope::Draft).await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].total_outstanding, dec!(40));

    // A promoted invoice stays final through the draft-only path.
    let err = app
        .ledger
        .update_draft_invoice(promoted.invoice_id, patch("Proposal A", dec!(1), dec!(1)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn aggregates_hold_after_a_mixed_sequence_of_edits() {
    let app = TestApp::spawn().await;
    let client = app.create_client("Acme Corp").await;
    let other = app.create_client("Globex Inc").await;

    let batch = app
        .ledger
        .create_many(
            client.client_id,
            vec![
                invoice_input("Line one", dec!(12.50), dec!(4)),
                invoice_input("Line two", dec!(0.10), dec!(3)),
            ],
        )
        .await
        .unwrap();
    let more = app
        .ledger
        .create_many(client.client_id, vec![invoice_input("Line three", dec!(99.99), dec!(1))])
        .await
        .unwrap();
    app.ledger
        .create_many(other.client_id, vec![invoice_input("Elsewhere", dec!(1000), dec!(1))])
        .await
        .unwrap();

    app.ledger
        .update_invoice(batch[1].invoice_id, patch("Line two", dec!(0.20), dec!(3)))
        .await
        .unwrap();
    app.ledger
        .delete_invoice(more[0].invoice_id)
        .await
        .unwrap();
    app.ledger
        .update_invoice(batch[0].invoice_id, patch("Line one", dec!(12.50), dec!(2)))
        .await
        .unwrap();

    app.assert_aggregate_consistent(client.client_id, Scope::Final).await;
    app.assert_aggregate_consistent(other.client_id, Scope::Final).await;

    let rows = app.scope_rows(client.client_id, Scope::Final).await;
    assert!(rows.iter().all(|r| r.total_outstanding == dec!(25.60)));
    for row in &rows {
        assert_eq!(row.line_total, row.rate * row.quantity);
    }
    let others = app.scope_rows(other.client_id, Scope::Final).await;
    assert_eq!(others[0].total_outstanding, dec!(1000));
}

#[tokio::test]
async fn patch_keeps_notes_and_terms_when_omitted() {
    let app = TestApp::spawn().await;
    let client = app.create_client("Acme Corp").await;
    let invoices = app
        .ledger
        .create_many(client.client_id, vec![invoice_input("Audit", dec!(10), dec!(1))])
        .await
        .unwrap();

    let updated = app
        .ledger
        .update_invoice(
            invoices[0].invoice_id,
            InvoicePatch {
                notes: Some("Paid by wire".to_string()),
                ..patch("Audit", dec!(10), dec!(1))
            },
        )
        .await
        .unwrap();

    assert_eq!(updated.terms.as_deref(), Some("Net 30"));
    assert_eq!(updated.notes.as_deref(), Some("Paid by wire"));
}

#[tokio::test]
async fn unknown_client_or_invoice_is_not_found() {
    let app = TestApp::spawn().await;

    let err = app
        .ledger
        .create_many(Uuid::new_v4(), vec![invoice_input("Audit", dec!(10), dec!(1))])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = app
        .ledger
        .update_invoice(Uuid::new_v4(), patch("Audit", dec!(10), dec!(1)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn invalid_input_is_rejected_before_any_write() {
    let app = TestApp::spawn().await;
    let client = app.create_client("Acme Corp").await;

    let empty = app.ledger.create_many(client.client_id, vec![]).await;
    assert!(matches!(empty, Err(AppError::BadRequest(_))));

    let bad = app
        .ledger
        .create_many(
            client.client_id,
            vec![
                invoice_input("Fine line", dec!(10), dec!(1)),
                invoice_input("Precise", dec!(10.001), dec!(1)),
            ],
        )
        .await;
    assert!(matches!(bad, Err(AppError::ValidationError(_))));

    let details = app
        .ledger
        .get_client_with_invoices(client.client_id)
        .await
        .unwrap();
    assert!(details.invoices.is_empty());

    // No number was consumed by the rejected batches.
    let ok = app
        .ledger
        .create_many(client.client_id, vec![invoice_input("Fine line", dec!(10), dec!(1))])
        .await
        .unwrap();
    assert_eq!(ok[0].invoice_number, "LWS-25-0001");
}
