//! Data models for Monarch transactions.
//!
//! - `Transaction`: a transaction record as served by the bridge
//! - `TransactionUpdate`: a partial update; unset fields are left untouched

pub mod transaction;

pub use transaction::{Transaction, TransactionUpdate};
