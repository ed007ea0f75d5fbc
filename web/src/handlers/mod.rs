//! HTTP request handlers.

pub mod accounts;
pub mod health;
pub mod transactions;

pub use accounts::{get_account, list_transactions, open_account};
pub use health::health_check;
pub use transactions::{get_transaction, submit_transaction};
