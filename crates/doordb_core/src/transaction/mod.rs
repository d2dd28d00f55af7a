//! Transactions and the transaction coordinator.

mod coordinator;
mod handle;

pub use coordinator::{CommitHook, CommitReport, TransactionCoordinator};
pub use handle::Transaction;
