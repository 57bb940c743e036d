//! Services module for receivables-service.

pub mod balance;
pub mod clock;
pub mod database;
pub mod ledger;
pub mod memory;
pub mod metrics;
pub mod numbering;
mod recurring;
pub mod scheduler;
pub mod store;

pub use clock::{Clock, FixedClock, SystemClock};
pub use database::Database;
pub use ledger::{LedgerService, LedgerSettings};
pub use memory::InMemoryStore;
pub use metrics::{get_metrics, init_metrics};
pub use scheduler::RecurringScheduler;
pub use store::{LedgerStore, LedgerTx};
