//! Receivables Service - Client invoicing with a recomputed outstanding balance.

pub mod config;
pub mod models;
pub mod services;
pub mod startup;
