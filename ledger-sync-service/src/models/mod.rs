//! Domain models for ledger-sync-service.
//!
//! Money is always integer minor units (cents). External ids are the
//! provider-issued identities; `None` marks a user-entered row.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: i64,
    pub name: String,
}

// ============================================================================
// Connection (linked provider item)
// ============================================================================

/// One linked item at the provider. The cursor is opaque; empty means the
/// next pass starts from the beginning of history.
#[derive(Clone, FromRow)]
pub struct Connection {
    pub id: i64,
    pub user_id: i64,
    pub access_token: String,
    pub cursor: String,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
    pub last_synced_utc: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("access_token", &"[REDACTED]")
            .field("cursor", &self.cursor)
            .field("last_synced_utc", &self.last_synced_utc)
            .finish()
    }
}

// ============================================================================
// Accounts
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct Account {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub balance: i64,
    pub external_id: Option<String>,
}

/// Provider-sourced account values, keyed by `(user_id, external_id)`.
#[derive(Debug, Clone)]
pub struct UpsertAccount {
    pub user_id: i64,
    pub external_id: String,
    pub name: String,
    pub balance: i64,
}

// ============================================================================
// Transactions
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct Transaction {
    pub id: i64,
    pub date: String,
    pub description: String,
    pub amount: i64,
    pub account_id: i64,
    pub user_id: i64,
    pub category_id: Option<i64>,
    pub provider_category: String,
    pub external_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub date: String,
    pub description: String,
    pub amount: i64,
    pub account_id: i64,
    pub user_id: i64,
    pub category_id: Option<i64>,
    pub provider_category: String,
    pub external_id: Option<String>,
}

/// Fields a provider "modified" event overwrites. `category_id` is left
/// alone since it is assigned locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionChanges {
    pub date: String,
    pub description: String,
    pub amount: i64,
    pub account_id: i64,
    pub provider_category: String,
}

// ============================================================================
// Quarantine
// ============================================================================

/// A provider transaction whose account could not be resolved locally.
/// Held until the account shows up or the provider removes the record.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct QuarantinedTransaction {
    pub connection_id: i64,
    pub user_id: i64,
    pub external_id: String,
    pub external_account_id: String,
    pub date: String,
    pub description: String,
    pub amount: i64,
    pub provider_category: String,
    pub reason: String,
}
