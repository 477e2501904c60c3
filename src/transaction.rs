//! Transaction management: ids, per-transaction state and the manager that
//! begins, commits and aborts transactions.

pub mod id;
pub mod manager;
pub mod state;

pub use id::{TransactionId, TransactionIdGenerator};
pub use manager::{TransactionError, TransactionManager};
pub use state::{Transaction, TransactionState, WriteKind, WriteRecord};
