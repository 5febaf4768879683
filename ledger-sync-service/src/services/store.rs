//! Storage interface consumed by the reconciliation engine.
//!
//! Every write is atomic on its own. Page-level consistency comes from the
//! engine persisting the cursor last, not from a surrounding transaction.

use crate::models::{
    Account, Connection, NewTransaction, QuarantinedTransaction, Transaction, TransactionChanges,
    UpsertAccount,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("{0} not found")]
    NotFound(String),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => AppError::NotFound(anyhow::anyhow!("{} not found", what)),
            other => AppError::DatabaseError(anyhow::Error::new(other)),
        }
    }
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    // Connections
    async fn get_connection(&self, connection_id: i64) -> Result<Option<Connection>, StoreError>;
    async fn list_connections(&self) -> Result<Vec<Connection>, StoreError>;
    async fn create_connection(
        &self,
        user_id: i64,
        access_token: &str,
    ) -> Result<Connection, StoreError>;
    async fn update_connection_cursor(
        &self,
        connection_id: i64,
        cursor: &str,
    ) -> Result<(), StoreError>;
    async fn mark_connection_synced(
        &self,
        connection_id: i64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    // Accounts
    async fn get_account_by_external_id(
        &self,
        user_id: i64,
        external_id: &str,
    ) -> Result<Option<Account>, StoreError>;
    async fn upsert_account(&self, account: &UpsertAccount) -> Result<Account, StoreError>;

    // Transactions
    async fn get_transaction_by_external_id(
        &self,
        user_id: i64,
        external_id: &str,
    ) -> Result<Option<Transaction>, StoreError>;
    async fn insert_transaction(&self, txn: &NewTransaction) -> Result<Transaction, StoreError>;
    /// Returns `false` when the row no longer exists.
    async fn update_transaction(
        &self,
        transaction_id: i64,
        changes: &TransactionChanges,
    ) -> Result<bool, StoreError>;
    /// Returns `false` when the row no longer exists.
    async fn delete_transaction(&self, transaction_id: i64) -> Result<bool, StoreError>;

    // Quarantine
    async fn quarantine_transaction(
        &self,
        record: &QuarantinedTransaction,
    ) -> Result<(), StoreError>;
    async fn list_quarantined(
        &self,
        connection_id: i64,
    ) -> Result<Vec<QuarantinedTransaction>, StoreError>;
    async fn release_quarantined(
        &self,
        connection_id: i64,
        external_id: &str,
    ) -> Result<bool, StoreError>;
}
