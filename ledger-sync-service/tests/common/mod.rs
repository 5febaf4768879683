//! Common test utilities for ledger-sync-service integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledger_sync_service::config::{DatabaseConfig, ProviderConfig, SyncConfig, SyncServiceConfig};
use ledger_sync_service::models::{
    Account, Connection, NewTransaction, QuarantinedTransaction, Transaction, TransactionChanges,
    UpsertAccount, User,
};
use ledger_sync_service::services::provider::{
    ExternalAccount, ExternalBalances, ExternalTransaction, FinanceProvider,
    PersonalFinanceCategory, ProviderError, RemovedTransaction, SyncPage,
};
use ledger_sync_service::services::{Database, LedgerStore, StoreError};
use ledger_sync_service::startup::Application;
use ledger_sync_service::sync::{EngineSettings, ReconciliationEngine};
use rust_decimal::Decimal;
use secrecy::Secret;
use service_core::config::Config as CommonConfig;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use wiremock::MockServer;

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,ledger_sync_service=debug,sqlx=warn")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// A migrated SQLite database in a temporary directory, removed on drop.
pub struct TestDb {
    pub db: Arc<Database>,
    pub url: String,
    _dir: TempDir,
}

pub async fn test_db() -> TestDb {
    init_tracing();

    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let url = format!("sqlite://{}", dir.path().join("ledger.db").display());
    let db = Database::new(&url, 2, 1)
        .await
        .expect("Failed to open test database");
    db.run_migrations().await.expect("Failed to run migrations");

    TestDb {
        db: Arc::new(db),
        url,
        _dir: dir,
    }
}

// ============================================================================
// Spawned application
// ============================================================================

/// A running service whose provider base URL points at a mock server.
pub struct TestApp {
    pub address: String,
    pub db: Arc<Database>,
    pub plaid: MockServer,
    pub client: reqwest::Client,
    _dir: TempDir,
}

impl TestApp {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.address, path)
    }
}

/// Spawn the service with background sync disabled; manual triggers still run.
pub async fn spawn_app() -> TestApp {
    init_tracing();

    let plaid = MockServer::start().await;
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let url = format!("sqlite://{}", dir.path().join("ledger.db").display());

    let config = SyncServiceConfig {
        common: CommonConfig {
            host: "127.0.0.1".parse().expect("Invalid host"),
            port: 0,
        },
        service_name: "ledger-sync-service-test".to_string(),
        service_version: "test".to_string(),
        log_level: "debug".to_string(),
        otlp_endpoint: None,
        database: DatabaseConfig {
            url: url.clone(),
            max_connections: 2,
            min_connections: 1,
        },
        provider: ProviderConfig {
            client_id: "test-client".to_string(),
            secret: Secret::new("test-secret".to_string()),
            environment: "sandbox".to_string(),
            base_url: plaid.uri(),
            timeout: Duration::from_secs(5),
            client_name: "Budget Tracker".to_string(),
            country_codes: vec!["US".to_string()],
            language: "en".to_string(),
        },
        sync: SyncConfig {
            enabled: false,
            ..Default::default()
        },
    };

    let app = Application::build(config)
        .await
        .expect("Failed to build application");
    let address = format!("http://127.0.0.1:{}", app.http_port());

    tokio::spawn(async move {
        app.run_until_stopped().await.ok();
    });

    let db = Database::new(&url, 2, 1)
        .await
        .expect("Failed to open application database");

    TestApp {
        address,
        db: Arc::new(db),
        plaid,
        client: reqwest::Client::new(),
        _dir: dir,
    }
}

// ============================================================================
// Seed helpers
// ============================================================================

pub async fn seed_user(db: &Database, name: &str) -> User {
    db.create_user(name).await.expect("Failed to create user")
}

pub async fn seed_connection(db: &Database, user_id: i64) -> Connection {
    db.create_connection(user_id, "access-sandbox-test")
        .await
        .expect("Failed to create connection")
}

/// An account already linked to the provider under `external_id`.
pub async fn seed_linked_account(db: &Database, user_id: i64, external_id: &str) -> Account {
    db.upsert_account(&UpsertAccount {
        user_id,
        external_id: external_id.to_string(),
        name: format!("Checking {}", external_id),
        balance: 0,
    })
    .await
    .expect("Failed to seed account")
}

pub async fn cursor_of(db: &Database, connection_id: i64) -> String {
    db.get_connection(connection_id)
        .await
        .expect("Failed to load connection")
        .expect("Connection missing")
        .cursor
}

pub fn engine(
    store: Arc<dyn LedgerStore>,
    provider: Arc<dyn FinanceProvider>,
    max_pages_per_pass: u32,
) -> ReconciliationEngine {
    ReconciliationEngine::new(
        store,
        provider,
        EngineSettings {
            max_pages_per_pass,
            ..Default::default()
        },
    )
}

// ============================================================================
// Provider record builders
// ============================================================================

pub fn dec(value: &str) -> Decimal {
    Decimal::from_str(value).expect("Invalid decimal literal")
}

pub fn txn(id: &str, account_id: &str, amount: &str, name: &str) -> ExternalTransaction {
    ExternalTransaction {
        account_id: account_id.to_string(),
        transaction_id: id.to_string(),
        amount: dec(amount),
        date: "2024-01-05".to_string(),
        name: name.to_string(),
        personal_finance_category: Some(PersonalFinanceCategory {
            primary: "GENERAL_MERCHANDISE".to_string(),
        }),
    }
}

pub fn removed(id: &str) -> RemovedTransaction {
    RemovedTransaction {
        transaction_id: id.to_string(),
    }
}

pub fn page(next_cursor: &str, has_more: bool) -> SyncPage {
    SyncPage {
        next_cursor: next_cursor.to_string(),
        has_more,
        added: Vec::new(),
        modified: Vec::new(),
        removed: Vec::new(),
    }
}

pub fn external_account(
    id: &str,
    name: &str,
    account_type: &str,
    current: Option<&str>,
) -> ExternalAccount {
    ExternalAccount {
        account_id: id.to_string(),
        name: name.to_string(),
        account_type: account_type.to_string(),
        balances: ExternalBalances {
            current: current.map(dec),
            available: None,
        },
    }
}

// ============================================================================
// Scripted provider
// ============================================================================

/// In-process provider with pages keyed by the cursor they answer. The same
/// cursor always yields the same page, like the real stream.
#[derive(Default)]
pub struct ScriptedProvider {
    pages: Mutex<HashMap<String, SyncPage>>,
    accounts: Mutex<Vec<ExternalAccount>>,
    page_failures: Mutex<HashMap<String, u32>>,
    account_failures: AtomicU32,
    requested_cursors: Mutex<Vec<String>>,
    account_calls: AtomicU32,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl ScriptedProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer `cursor` with `page`.
    pub fn on_cursor(&self, cursor: &str, page: SyncPage) {
        self.pages.lock().unwrap().insert(cursor.to_string(), page);
    }

    pub fn set_accounts(&self, accounts: Vec<ExternalAccount>) {
        *self.accounts.lock().unwrap() = accounts;
    }

    /// Fail the next `times` requests for `cursor` with a timeout.
    pub fn fail_cursor(&self, cursor: &str, times: u32) {
        self.page_failures
            .lock()
            .unwrap()
            .insert(cursor.to_string(), times);
    }

    pub fn fail_accounts(&self, times: u32) {
        self.account_failures.store(times, Ordering::SeqCst);
    }

    /// Hold every account fetch until the returned semaphore gets permits.
    pub fn hold(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn requested_cursors(&self) -> Vec<String> {
        self.requested_cursors.lock().unwrap().clone()
    }

    pub fn account_calls(&self) -> u32 {
        self.account_calls.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl FinanceProvider for ScriptedProvider {
    async fn create_link_token(&self, user_id: i64) -> Result<String, ProviderError> {
        Ok(format!("link-sandbox-{}", user_id))
    }

    async fn exchange_public_token(&self, public_token: &str) -> Result<String, ProviderError> {
        Ok(format!("access-{}", public_token))
    }

    async fn fetch_account_balances(
        &self,
        _access_token: &str,
    ) -> Result<Vec<ExternalAccount>, ProviderError> {
        self.account_calls.fetch_add(1, Ordering::SeqCst);

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await.expect("gate closed");
        }

        if Self::take_failure(&self.account_failures) {
            return Err(ProviderError::Timeout);
        }
        Ok(self.accounts.lock().unwrap().clone())
    }

    async fn fetch_transaction_page(
        &self,
        _access_token: &str,
        cursor: &str,
    ) -> Result<SyncPage, ProviderError> {
        self.requested_cursors
            .lock()
            .unwrap()
            .push(cursor.to_string());

        {
            let mut failures = self.page_failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(cursor) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ProviderError::Timeout);
                }
            }
        }

        // An unscripted cursor means the stream is drained.
        Ok(self
            .pages
            .lock()
            .unwrap()
            .get(cursor)
            .cloned()
            .unwrap_or_else(|| page(cursor, false)))
    }
}

// ============================================================================
// Store with injected faults
// ============================================================================

/// Delegates to a real database but fails selected writes.
pub struct FlakyStore {
    inner: Arc<Database>,
    cursor_update_failures: AtomicU32,
    failing_insert: Mutex<Option<String>>,
}

impl FlakyStore {
    pub fn new(inner: Arc<Database>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            cursor_update_failures: AtomicU32::new(0),
            failing_insert: Mutex::new(None),
        })
    }

    pub fn fail_cursor_updates(&self, times: u32) {
        self.cursor_update_failures.store(times, Ordering::SeqCst);
    }

    /// Fail every insert of the transaction with this external id.
    pub fn fail_insert_of(&self, external_id: Option<&str>) {
        *self.failing_insert.lock().unwrap() = external_id.map(str::to_string);
    }

    fn injected() -> StoreError {
        StoreError::Database(sqlx::Error::PoolTimedOut)
    }
}

#[async_trait]
impl LedgerStore for FlakyStore {
    async fn get_connection(&self, connection_id: i64) -> Result<Option<Connection>, StoreError> {
        self.inner.get_connection(connection_id).await
    }

    async fn list_connections(&self) -> Result<Vec<Connection>, StoreError> {
        self.inner.list_connections().await
    }

    async fn create_connection(
        &self,
        user_id: i64,
        access_token: &str,
    ) -> Result<Connection, StoreError> {
        self.inner.create_connection(user_id, access_token).await
    }

    async fn update_connection_cursor(
        &self,
        connection_id: i64,
        cursor: &str,
    ) -> Result<(), StoreError> {
        if ScriptedProvider::take_failure(&self.cursor_update_failures) {
            return Err(Self::injected());
        }
        self.inner.update_connection_cursor(connection_id, cursor).await
    }

    async fn mark_connection_synced(
        &self,
        connection_id: i64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.inner.mark_connection_synced(connection_id, at).await
    }

    async fn get_account_by_external_id(
        &self,
        user_id: i64,
        external_id: &str,
    ) -> Result<Option<Account>, StoreError> {
        self.inner.get_account_by_external_id(user_id, external_id).await
    }

    async fn upsert_account(&self, account: &UpsertAccount) -> Result<Account, StoreError> {
        self.inner.upsert_account(account).await
    }

    async fn get_transaction_by_external_id(
        &self,
        user_id: i64,
        external_id: &str,
    ) -> Result<Option<Transaction>, StoreError> {
        self.inner
            .get_transaction_by_external_id(user_id, external_id)
            .await
    }

    async fn insert_transaction(&self, txn: &NewTransaction) -> Result<Transaction, StoreError> {
        let failing = self.failing_insert.lock().unwrap().clone();
        if failing.is_some() && failing == txn.external_id {
            return Err(Self::injected());
        }
        self.inner.insert_transaction(txn).await
    }

    async fn update_transaction(
        &self,
        transaction_id: i64,
        changes: &TransactionChanges,
    ) -> Result<bool, StoreError> {
        self.inner.update_transaction(transaction_id, changes).await
    }

    async fn delete_transaction(&self, transaction_id: i64) -> Result<bool, StoreError> {
        self.inner.delete_transaction(transaction_id).await
    }

    async fn quarantine_transaction(
        &self,
        record: &QuarantinedTransaction,
    ) -> Result<(), StoreError> {
        self.inner.quarantine_transaction(record).await
    }

    async fn list_quarantined(
        &self,
        connection_id: i64,
    ) -> Result<Vec<QuarantinedTransaction>, StoreError> {
        self.inner.list_quarantined(connection_id).await
    }

    async fn release_quarantined(
        &self,
        connection_id: i64,
        external_id: &str,
    ) -> Result<bool, StoreError> {
        self.inner.release_quarantined(connection_id, external_id).await
    }
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
