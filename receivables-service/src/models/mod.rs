//! Domain models for receivables-service.

mod client;
mod invoice;

pub use client::{Client, ClientDetails, ClientWithInvoices, CreateClient, Page, UpdateClient};
pub use invoice::{
    amount_limit, BatchInvoicePatch, Invoice, InvoiceChanges, InvoiceDeletion, InvoiceInput,
    InvoicePatch, NewInvoice, RecurringFailure, RecurringRunReport, Scope, SearchFilter,
};
