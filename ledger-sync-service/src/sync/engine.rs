//! Reconciliation engine.
//!
//! Applies the provider's incremental transaction stream and account
//! balances to the local ledger. A page is applied record by record and the
//! cursor is persisted only after the whole page went through, so an
//! interrupted pass is redone from the last persisted cursor. Every record
//! operation is idempotent under re-delivery.

use crate::config::SyncConfig;
use crate::models::{Connection, NewTransaction, QuarantinedTransaction, TransactionChanges, UpsertAccount};
use crate::services::metrics::{record_error, record_sync_pass, record_sync_records};
use crate::services::provider::{
    to_local_amount, to_local_balance, ExternalTransaction, FinanceProvider, ProviderError,
    SyncPage,
};
use crate::services::store::{LedgerStore, StoreError};
use chrono::Utc;
use service_core::error::AppError;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};

const UNKNOWN_ACCOUNT: &str = "unknown_account";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("connection {0} not found")]
    ConnectionNotFound(i64),

    #[error("pass stopped after {limit} pages with more pending")]
    PageLimitExceeded { limit: u32 },
}

impl SyncError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Provider(e) => e.kind(),
            Self::Store(_) => "store",
            Self::ConnectionNotFound(_) => "connection_not_found",
            Self::PageLimitExceeded { .. } => "page_limit_exceeded",
        }
    }
}

impl From<SyncError> for AppError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Store(e) => e.into(),
            SyncError::ConnectionNotFound(id) => {
                AppError::NotFound(anyhow::anyhow!("Connection {} not found", id))
            }
            other => AppError::BadGateway(other.to_string()),
        }
    }
}

/// A provider transaction that references an account with no local
/// counterpart. Reported and quarantined, never fatal to the pass.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("transaction {external_id} references unknown account {external_account_id}")]
pub struct MappingError {
    pub external_id: String,
    pub external_account_id: String,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_pages_per_pass: u32,
    pub eligible_account_types: Vec<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        SyncConfig::default().into()
    }
}

impl From<SyncConfig> for EngineSettings {
    fn from(config: SyncConfig) -> Self {
        Self {
            max_pages_per_pass: config.max_pages_per_pass,
            eligible_account_types: config.eligible_account_types,
        }
    }
}

/// Outcome of one transaction pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub pages: u32,
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub duplicates: usize,
    pub skipped: Vec<MappingError>,
    pub cursor: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountReport {
    pub upserted: usize,
    pub ineligible: usize,
}

/// Outcome of a full connection sync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub accounts: AccountReport,
    pub released: usize,
    pub transactions: PassReport,
}

/// A provider transaction converted to local units, before account resolution.
struct IncomingTransaction {
    external_id: String,
    external_account_id: String,
    date: String,
    description: String,
    amount: i64,
    provider_category: String,
}

impl IncomingTransaction {
    fn from_external(txn: &ExternalTransaction) -> Result<Self, ProviderError> {
        Ok(Self {
            external_id: txn.transaction_id.clone(),
            external_account_id: txn.account_id.clone(),
            date: txn.date.clone(),
            description: txn.name.clone(),
            amount: to_local_amount(txn.amount)?,
            provider_category: txn.category_label().to_string(),
        })
    }

    fn from_quarantine(record: &QuarantinedTransaction) -> Self {
        Self {
            external_id: record.external_id.clone(),
            external_account_id: record.external_account_id.clone(),
            date: record.date.clone(),
            description: record.description.clone(),
            amount: record.amount,
            provider_category: record.provider_category.clone(),
        }
    }

    fn new_transaction(&self, user_id: i64, account_id: i64) -> NewTransaction {
        NewTransaction {
            date: self.date.clone(),
            description: self.description.clone(),
            amount: self.amount,
            account_id,
            user_id,
            category_id: None,
            provider_category: self.provider_category.clone(),
            external_id: Some(self.external_id.clone()),
        }
    }

    fn changes(&self, account_id: i64) -> TransactionChanges {
        TransactionChanges {
            date: self.date.clone(),
            description: self.description.clone(),
            amount: self.amount,
            account_id,
            provider_category: self.provider_category.clone(),
        }
    }

    fn quarantined(&self, connection: &Connection) -> QuarantinedTransaction {
        QuarantinedTransaction {
            connection_id: connection.id,
            user_id: connection.user_id,
            external_id: self.external_id.clone(),
            external_account_id: self.external_account_id.clone(),
            date: self.date.clone(),
            description: self.description.clone(),
            amount: self.amount,
            provider_category: self.provider_category.clone(),
            reason: UNKNOWN_ACCOUNT.to_string(),
        }
    }

    fn mapping_error(&self) -> MappingError {
        MappingError {
            external_id: self.external_id.clone(),
            external_account_id: self.external_account_id.clone(),
        }
    }
}

/// A page converted up front so a bad amount fails the page before any write.
struct PreparedPage {
    added: Vec<IncomingTransaction>,
    modified: Vec<IncomingTransaction>,
    removed: Vec<String>,
}

impl PreparedPage {
    fn prepare(page: &SyncPage) -> Result<Self, ProviderError> {
        Ok(Self {
            added: page
                .added
                .iter()
                .map(IncomingTransaction::from_external)
                .collect::<Result<_, _>>()?,
            modified: page
                .modified
                .iter()
                .map(IncomingTransaction::from_external)
                .collect::<Result<_, _>>()?,
            removed: page
                .removed
                .iter()
                .map(|r| r.transaction_id.clone())
                .collect(),
        })
    }
}

#[derive(Clone)]
pub struct ReconciliationEngine {
    store: Arc<dyn LedgerStore>,
    provider: Arc<dyn FinanceProvider>,
    settings: EngineSettings,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        provider: Arc<dyn FinanceProvider>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            provider,
            settings,
        }
    }

    /// Accounts, then quarantine replay, then transactions. Accounts go first
    /// so the transaction pass can resolve freshly linked accounts.
    #[instrument(skip(self))]
    pub async fn sync_connection(&self, connection_id: i64) -> Result<SyncReport, SyncError> {
        let connection = self.load_connection(connection_id).await?;

        let accounts = self.reconcile_accounts(&connection).await?;
        let released = self.replay_quarantine(&connection).await?;
        let transactions = self.run_transaction_pass(&connection).await?;

        self.store
            .mark_connection_synced(connection.id, Utc::now())
            .await?;

        Ok(SyncReport {
            accounts,
            released,
            transactions,
        })
    }

    /// Upsert every eligible provider account under the connection.
    #[instrument(skip(self))]
    pub async fn sync_accounts(&self, connection_id: i64) -> Result<AccountReport, SyncError> {
        let connection = self.load_connection(connection_id).await?;
        self.reconcile_accounts(&connection).await
    }

    /// Drain the transaction stream from the persisted cursor.
    #[instrument(skip(self))]
    pub async fn sync_transactions(&self, connection_id: i64) -> Result<PassReport, SyncError> {
        let connection = self.load_connection(connection_id).await?;
        self.run_transaction_pass(&connection).await
    }

    async fn load_connection(&self, connection_id: i64) -> Result<Connection, SyncError> {
        self.store
            .get_connection(connection_id)
            .await?
            .ok_or(SyncError::ConnectionNotFound(connection_id))
    }

    async fn reconcile_accounts(&self, connection: &Connection) -> Result<AccountReport, SyncError> {
        let result = self.apply_accounts(connection).await;
        finish_pass("accounts", connection.id, &result);
        result
    }

    async fn apply_accounts(&self, connection: &Connection) -> Result<AccountReport, SyncError> {
        let accounts = self
            .provider
            .fetch_account_balances(&connection.access_token)
            .await?;

        let mut report = AccountReport::default();
        for account in accounts {
            if !self.is_eligible(&account.account_type) {
                report.ineligible += 1;
                continue;
            }

            let balance = match account.balances.current {
                Some(current) => to_local_balance(current)?,
                None => self
                    .store
                    .get_account_by_external_id(connection.user_id, &account.account_id)
                    .await?
                    .map(|existing| existing.balance)
                    .unwrap_or(0),
            };

            self.store
                .upsert_account(&UpsertAccount {
                    user_id: connection.user_id,
                    external_id: account.account_id,
                    name: account.name,
                    balance,
                })
                .await?;
            report.upserted += 1;
        }

        info!(
            connection_id = connection.id,
            upserted = report.upserted,
            ineligible = report.ineligible,
            "Accounts reconciled"
        );
        Ok(report)
    }

    fn is_eligible(&self, account_type: &str) -> bool {
        self.settings
            .eligible_account_types
            .iter()
            .any(|t| t.eq_ignore_ascii_case(account_type))
    }

    /// Retry quarantined records whose account now resolves, applying each
    /// the way a modified record is applied.
    async fn replay_quarantine(&self, connection: &Connection) -> Result<usize, SyncError> {
        let held = self.store.list_quarantined(connection.id).await?;
        let mut released = 0;

        for record in &held {
            let incoming = IncomingTransaction::from_quarantine(record);
            let Some(account_id) = self
                .resolve_account(connection.user_id, &incoming.external_account_id)
                .await?
            else {
                continue;
            };

            let existing = self
                .store
                .get_transaction_by_external_id(connection.user_id, &incoming.external_id)
                .await?;
            let updated = match existing {
                Some(existing) => {
                    self.store
                        .update_transaction(existing.id, &incoming.changes(account_id))
                        .await?
                }
                None => false,
            };
            if !updated {
                self.store
                    .insert_transaction(&incoming.new_transaction(connection.user_id, account_id))
                    .await?;
            }

            if self
                .store
                .release_quarantined(connection.id, &incoming.external_id)
                .await?
            {
                released += 1;
            }
        }

        if released > 0 {
            info!(
                connection_id = connection.id,
                released,
                still_held = held.len() - released,
                "Released quarantined transactions"
            );
        }
        record_sync_records("released", released);
        Ok(released)
    }

    async fn run_transaction_pass(&self, connection: &Connection) -> Result<PassReport, SyncError> {
        let result = self.drain_pages(connection).await;
        finish_pass("transactions", connection.id, &result);
        if let Ok(report) = &result {
            record_sync_records("inserted", report.inserted);
            record_sync_records("updated", report.updated);
            record_sync_records("deleted", report.deleted);
            record_sync_records("duplicate", report.duplicates);
            record_sync_records("skipped", report.skipped.len());
        }
        result
    }

    async fn drain_pages(&self, connection: &Connection) -> Result<PassReport, SyncError> {
        let mut report = PassReport {
            cursor: connection.cursor.clone(),
            ..Default::default()
        };

        loop {
            let page = self
                .provider
                .fetch_transaction_page(&connection.access_token, &report.cursor)
                .await?;
            let prepared = PreparedPage::prepare(&page)?;

            self.apply_page(connection, prepared, &mut report).await?;

            // The page is fully applied; only now may the cursor move.
            self.store
                .update_connection_cursor(connection.id, &page.next_cursor)
                .await?;
            report.cursor = page.next_cursor;
            report.pages += 1;

            if !page.has_more {
                break;
            }
            if report.pages >= self.settings.max_pages_per_pass {
                warn!(
                    connection_id = connection.id,
                    pages = report.pages,
                    "Page limit reached with more pages pending"
                );
                return Err(SyncError::PageLimitExceeded {
                    limit: self.settings.max_pages_per_pass,
                });
            }
        }

        info!(
            connection_id = connection.id,
            pages = report.pages,
            inserted = report.inserted,
            updated = report.updated,
            deleted = report.deleted,
            duplicates = report.duplicates,
            skipped = report.skipped.len(),
            "Transaction pass complete"
        );
        Ok(report)
    }

    async fn apply_page(
        &self,
        connection: &Connection,
        page: PreparedPage,
        report: &mut PassReport,
    ) -> Result<(), StoreError> {
        for incoming in &page.added {
            let existing = self
                .store
                .get_transaction_by_external_id(connection.user_id, &incoming.external_id)
                .await?;
            if existing.is_some() {
                report.duplicates += 1;
                continue;
            }
            self.insert_or_quarantine(connection, incoming, report)
                .await?;
        }

        for incoming in &page.modified {
            let existing = self
                .store
                .get_transaction_by_external_id(connection.user_id, &incoming.external_id)
                .await?;
            let Some(existing) = existing else {
                if self
                    .insert_or_quarantine(connection, incoming, report)
                    .await?
                {
                    self.store
                        .release_quarantined(connection.id, &incoming.external_id)
                        .await?;
                }
                continue;
            };

            let Some(account_id) = self
                .resolve_account(connection.user_id, &incoming.external_account_id)
                .await?
            else {
                self.quarantine(connection, incoming, report).await?;
                continue;
            };

            if self
                .store
                .update_transaction(existing.id, &incoming.changes(account_id))
                .await?
            {
                report.updated += 1;
            } else {
                // Deleted between lookup and update.
                self.store
                    .insert_transaction(&incoming.new_transaction(connection.user_id, account_id))
                    .await?;
                report.inserted += 1;
            }
            // A held copy of this record is now stale.
            self.store
                .release_quarantined(connection.id, &incoming.external_id)
                .await?;
        }

        for external_id in &page.removed {
            let existing = self
                .store
                .get_transaction_by_external_id(connection.user_id, external_id)
                .await?;
            if let Some(existing) = existing {
                if self.store.delete_transaction(existing.id).await? {
                    report.deleted += 1;
                }
            }
            self.store
                .release_quarantined(connection.id, external_id)
                .await?;
        }

        Ok(())
    }

    /// Returns `true` when the record was inserted, `false` when quarantined.
    async fn insert_or_quarantine(
        &self,
        connection: &Connection,
        incoming: &IncomingTransaction,
        report: &mut PassReport,
    ) -> Result<bool, StoreError> {
        match self
            .resolve_account(connection.user_id, &incoming.external_account_id)
            .await?
        {
            Some(account_id) => {
                self.store
                    .insert_transaction(&incoming.new_transaction(connection.user_id, account_id))
                    .await?;
                report.inserted += 1;
                Ok(true)
            }
            None => {
                self.quarantine(connection, incoming, report).await?;
                Ok(false)
            }
        }
    }

    async fn quarantine(
        &self,
        connection: &Connection,
        incoming: &IncomingTransaction,
        report: &mut PassReport,
    ) -> Result<(), StoreError> {
        let mapping = incoming.mapping_error();
        warn!(
            connection_id = connection.id,
            external_id = %mapping.external_id,
            external_account_id = %mapping.external_account_id,
            "Skipping transaction for unknown account"
        );
        self.store
            .quarantine_transaction(&incoming.quarantined(connection))
            .await?;
        report.skipped.push(mapping);
        Ok(())
    }

    async fn resolve_account(
        &self,
        user_id: i64,
        external_account_id: &str,
    ) -> Result<Option<i64>, StoreError> {
        Ok(self
            .store
            .get_account_by_external_id(user_id, external_account_id)
            .await?
            .map(|account| account.id))
    }
}

fn finish_pass<T>(kind: &str, connection_id: i64, result: &Result<T, SyncError>) {
    match result {
        Ok(_) => record_sync_pass(kind, "success"),
        Err(e) => {
            record_sync_pass(kind, "failure");
            record_error(e.kind());
            warn!(connection_id, pass = kind, error = %e, "Pass failed");
        }
    }
}
