//! Database service for ledger-sync-service.

use crate::models::{
    Account, Connection, NewTransaction, QuarantinedTransaction, Transaction, TransactionChanges,
    UpsertAccount, User,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::{LedgerStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use prometheus::HistogramTimer;
use service_core::error::AppError;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument};

const CONNECTION_COLUMNS: &str =
    "id, user_id, access_token, cursor, created_utc, updated_utc, last_synced_utc";
const ACCOUNT_COLUMNS: &str = "id, user_id, name, balance, external_id";
const TRANSACTION_COLUMNS: &str = "id, date, description, amount, account_id, user_id, \
     category_id, provider_category, external_id";
const QUARANTINE_COLUMNS: &str = "connection_id, user_id, external_id, external_account_id, \
     date, description, amount, provider_category, reason";

fn query_timer(operation: &str) -> HistogramTimer {
    DB_QUERY_DURATION
        .with_label_values(&[operation])
        .start_timer()
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the SQLite database at `database_url`.
    #[instrument(skip(database_url), fields(service = "ledger-sync-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Opening SQLite database"
        );

        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!("Invalid DATABASE_URL: {}", e)))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect_with(options)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("SQLite connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        let _timer = query_timer("health_check");

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    // =========================================================================
    // Users and user-entered rows (the CRUD side; not used by the engine)
    // =========================================================================

    #[instrument(skip(self))]
    pub async fn create_user(&self, name: &str) -> Result<User, StoreError> {
        let _timer = query_timer("create_user");

        let user = sqlx::query_as::<_, User>(
            "INSERT INTO users (name) VALUES (?) RETURNING id, name",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        Ok(user)
    }

    #[instrument(skip(self))]
    pub async fn get_user_by_name(&self, name: &str) -> Result<Option<User>, StoreError> {
        let _timer = query_timer("get_user_by_name");

        let user = sqlx::query_as::<_, User>("SELECT id, name FROM users WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        Ok(user)
    }

    #[instrument(skip(self))]
    pub async fn get_user(&self, user_id: i64) -> Result<Option<User>, StoreError> {
        let _timer = query_timer("get_user");

        let user = sqlx::query_as::<_, User>("SELECT id, name FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(user)
    }

    /// Create an account that is not linked to the provider.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn create_account(
        &self,
        user_id: i64,
        name: &str,
        balance: i64,
    ) -> Result<Account, StoreError> {
        let _timer = query_timer("create_account");

        let sql = format!(
            "INSERT INTO accounts (user_id, name, balance, external_id) VALUES (?, ?, ?, NULL) \
             RETURNING {ACCOUNT_COLUMNS}"
        );
        let account = sqlx::query_as::<_, Account>(&sql)
            .bind(user_id)
            .bind(name)
            .bind(balance)
            .fetch_one(&self.pool)
            .await?;

        Ok(account)
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn list_accounts(&self, user_id: i64) -> Result<Vec<Account>, StoreError> {
        let _timer = query_timer("list_accounts");

        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE user_id = ? ORDER BY id");
        let accounts = sqlx::query_as::<_, Account>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(accounts)
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn list_transactions(&self, user_id: i64) -> Result<Vec<Transaction>, StoreError> {
        let _timer = query_timer("list_transactions");

        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE user_id = ? ORDER BY date, id"
        );
        let transactions = sqlx::query_as::<_, Transaction>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(transactions)
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn create_category(&self, user_id: i64, name: &str) -> Result<i64, StoreError> {
        let _timer = query_timer("create_category");

        let id: i64 =
            sqlx::query_scalar("INSERT INTO categories (user_id, name) VALUES (?, ?) RETURNING id")
                .bind(user_id)
                .bind(name)
                .fetch_one(&self.pool)
                .await?;

        Ok(id)
    }

    /// User-side categorisation of a transaction.
    #[instrument(skip(self))]
    pub async fn assign_category(
        &self,
        transaction_id: i64,
        category_id: Option<i64>,
    ) -> Result<bool, StoreError> {
        let _timer = query_timer("assign_category");

        let result = sqlx::query("UPDATE transactions SET category_id = ? WHERE id = ?")
            .bind(category_id)
            .bind(transaction_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn list_connections_for_user(
        &self,
        user_id: i64,
    ) -> Result<Vec<Connection>, StoreError> {
        let _timer = query_timer("list_connections_for_user");

        let sql =
            format!("SELECT {CONNECTION_COLUMNS} FROM connections WHERE user_id = ? ORDER BY id");
        let connections = sqlx::query_as::<_, Connection>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(connections)
    }
}

#[async_trait]
impl LedgerStore for Database {
    // =========================================================================
    // Connection Operations
    // =========================================================================

    #[instrument(skip(self))]
    async fn get_connection(&self, connection_id: i64) -> Result<Option<Connection>, StoreError> {
        let _timer = query_timer("get_connection");

        let sql = format!("SELECT {CONNECTION_COLUMNS} FROM connections WHERE id = ?");
        let connection = sqlx::query_as::<_, Connection>(&sql)
            .bind(connection_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(connection)
    }

    #[instrument(skip(self))]
    async fn list_connections(&self) -> Result<Vec<Connection>, StoreError> {
        let _timer = query_timer("list_connections");

        let sql = format!("SELECT {CONNECTION_COLUMNS} FROM connections ORDER BY id");
        let connections = sqlx::query_as::<_, Connection>(&sql)
            .fetch_all(&self.pool)
            .await?;

        Ok(connections)
    }

    #[instrument(skip(self, access_token), fields(user_id = %user_id))]
    async fn create_connection(
        &self,
        user_id: i64,
        access_token: &str,
    ) -> Result<Connection, StoreError> {
        let _timer = query_timer("create_connection");

        let now = Utc::now();
        let sql = format!(
            "INSERT INTO connections (user_id, access_token, cursor, created_utc, updated_utc) \
             VALUES (?, ?, '', ?, ?) RETURNING {CONNECTION_COLUMNS}"
        );
        let connection = sqlx::query_as::<_, Connection>(&sql)
            .bind(user_id)
            .bind(access_token)
            .bind(now)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;

        info!(connection_id = connection.id, "Connection created");

        Ok(connection)
    }

    #[instrument(skip(self))]
    async fn update_connection_cursor(
        &self,
        connection_id: i64,
        cursor: &str,
    ) -> Result<(), StoreError> {
        let _timer = query_timer("update_connection_cursor");

        let result = sqlx::query("UPDATE connections SET cursor = ?, updated_utc = ? WHERE id = ?")
            .bind(cursor)
            .bind(Utc::now())
            .bind(connection_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("connection {}", connection_id)));
        }

        Ok(())
    }

    #[instrument(skip(self))]
    async fn mark_connection_synced(
        &self,
        connection_id: i64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let _timer = query_timer("mark_connection_synced");

        let result =
            sqlx::query("UPDATE connections SET last_synced_utc = ?, updated_utc = ? WHERE id = ?")
                .bind(at)
                .bind(at)
                .bind(connection_id)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("connection {}", connection_id)));
        }

        Ok(())
    }

    // =========================================================================
    // Account Operations
    // =========================================================================

    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn get_account_by_external_id(
        &self,
        user_id: i64,
        external_id: &str,
    ) -> Result<Option<Account>, StoreError> {
        let _timer = query_timer("get_account_by_external_id");

        let sql = format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE user_id = ? AND external_id = ?"
        );
        let account = sqlx::query_as::<_, Account>(&sql)
            .bind(user_id)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(account)
    }

    #[instrument(skip(self, account), fields(user_id = %account.user_id, external_id = %account.external_id))]
    async fn upsert_account(&self, account: &UpsertAccount) -> Result<Account, StoreError> {
        let _timer = query_timer("upsert_account");

        let sql = format!(
            "INSERT INTO accounts (user_id, name, balance, external_id) VALUES (?, ?, ?, ?) \
             ON CONFLICT (user_id, external_id) \
             DO UPDATE SET name = excluded.name, balance = excluded.balance \
             RETURNING {ACCOUNT_COLUMNS}"
        );
        let stored = sqlx::query_as::<_, Account>(&sql)
            .bind(account.user_id)
            .bind(&account.name)
            .bind(account.balance)
            .bind(&account.external_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(stored)
    }

    // =========================================================================
    // Transaction Operations
    // =========================================================================

    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn get_transaction_by_external_id(
        &self,
        user_id: i64,
        external_id: &str,
    ) -> Result<Option<Transaction>, StoreError> {
        let _timer = query_timer("get_transaction_by_external_id");

        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE user_id = ? AND external_id = ?"
        );
        let transaction = sqlx::query_as::<_, Transaction>(&sql)
            .bind(user_id)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(transaction)
    }

    #[instrument(skip(self, txn), fields(user_id = %txn.user_id, external_id = ?txn.external_id))]
    async fn insert_transaction(&self, txn: &NewTransaction) -> Result<Transaction, StoreError> {
        let _timer = query_timer("insert_transaction");

        let sql = format!(
            "INSERT INTO transactions (date, description, amount, account_id, user_id, \
             category_id, provider_category, external_id) VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             RETURNING {TRANSACTION_COLUMNS}"
        );
        let transaction = sqlx::query_as::<_, Transaction>(&sql)
            .bind(&txn.date)
            .bind(&txn.description)
            .bind(txn.amount)
            .bind(txn.account_id)
            .bind(txn.user_id)
            .bind(txn.category_id)
            .bind(&txn.provider_category)
            .bind(&txn.external_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(transaction)
    }

    #[instrument(skip(self, changes))]
    async fn update_transaction(
        &self,
        transaction_id: i64,
        changes: &TransactionChanges,
    ) -> Result<bool, StoreError> {
        let _timer = query_timer("update_transaction");

        let result = sqlx::query(
            "UPDATE transactions SET date = ?, description = ?, amount = ?, account_id = ?, \
             provider_category = ? WHERE id = ?",
        )
        .bind(&changes.date)
        .bind(&changes.description)
        .bind(changes.amount)
        .bind(changes.account_id)
        .bind(&changes.provider_category)
        .bind(transaction_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn delete_transaction(&self, transaction_id: i64) -> Result<bool, StoreError> {
        let _timer = query_timer("delete_transaction");

        let result = sqlx::query("DELETE FROM transactions WHERE id = ?")
            .bind(transaction_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Quarantine Operations
    // =========================================================================

    #[instrument(skip(self, record), fields(connection_id = %record.connection_id, external_id = %record.external_id))]
    async fn quarantine_transaction(
        &self,
        record: &QuarantinedTransaction,
    ) -> Result<(), StoreError> {
        let _timer = query_timer("quarantine_transaction");

        let now = Utc::now();
        sqlx::query(
            "INSERT INTO quarantined_transactions (connection_id, user_id, external_id, \
             external_account_id, date, description, amount, provider_category, reason, \
             first_seen_utc, last_seen_utc) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (connection_id, external_id) DO UPDATE SET \
             external_account_id = excluded.external_account_id, date = excluded.date, \
             description = excluded.description, amount = excluded.amount, \
             provider_category = excluded.provider_category, reason = excluded.reason, \
             last_seen_utc = excluded.last_seen_utc",
        )
        .bind(record.connection_id)
        .bind(record.user_id)
        .bind(&record.external_id)
        .bind(&record.external_account_id)
        .bind(&record.date)
        .bind(&record.description)
        .bind(record.amount)
        .bind(&record.provider_category)
        .bind(&record.reason)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_quarantined(
        &self,
        connection_id: i64,
    ) -> Result<Vec<QuarantinedTransaction>, StoreError> {
        let _timer = query_timer("list_quarantined");

        let sql = format!(
            "SELECT {QUARANTINE_COLUMNS} FROM quarantined_transactions \
             WHERE connection_id = ? ORDER BY first_seen_utc, external_id"
        );
        let records = sqlx::query_as::<_, QuarantinedTransaction>(&sql)
            .bind(connection_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    #[instrument(skip(self))]
    async fn release_quarantined(
        &self,
        connection_id: i64,
        external_id: &str,
    ) -> Result<bool, StoreError> {
        let _timer = query_timer("release_quarantined");

        let result = sqlx::query(
            "DELETE FROM quarantined_transactions WHERE connection_id = ? AND external_id = ?",
        )
        .bind(connection_id)
        .bind(external_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
