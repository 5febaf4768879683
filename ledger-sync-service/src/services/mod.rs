//! Services module for ledger-sync-service.

pub mod database;
pub mod metrics;
pub mod provider;
pub mod store;

pub use database::Database;
pub use metrics::{
    get_metrics, init_metrics, record_error, record_provider_request, record_sync_pass,
    record_sync_records,
};
pub use provider::{FinanceProvider, PlaidClient, ProviderError};
pub use store::{LedgerStore, StoreError};
