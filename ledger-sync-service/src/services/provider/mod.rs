//! Upstream financial-data provider abstraction.
//!
//! The provider speaks decimal major units with outflows positive. Local
//! storage uses integer cents with outflows negative; [`to_local_amount`]
//! and [`to_local_balance`] do the conversion.

pub mod plaid;

pub use plaid::PlaidClient;

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use thiserror::Error;

/// Error type for provider operations.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Network error: {0}")]
    Transport(String),

    #[error("Request timed out")]
    Timeout,

    #[error("API error ({status}): {code} - {message}")]
    Status {
        status: u16,
        code: String,
        message: String,
    },

    #[error("Malformed response: {0}")]
    MalformedBody(String),
}

impl ProviderError {
    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotConfigured(_) => "not_configured",
            Self::Transport(_) => "transport",
            Self::Timeout => "timeout",
            Self::Status { .. } => "status",
            Self::MalformedBody(_) => "malformed_body",
        }
    }
}

impl From<ProviderError> for AppError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::NotConfigured(_) => AppError::ServiceUnavailable,
            other => AppError::BadGateway(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalBalances {
    #[serde(default)]
    pub current: Option<Decimal>,
    #[serde(default)]
    pub available: Option<Decimal>,
}

/// An account as reported by `/accounts/balance/get`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalAccount {
    pub account_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub account_type: String,
    pub balances: ExternalBalances,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonalFinanceCategory {
    pub primary: String,
}

/// An added or modified transaction from `/transactions/sync`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalTransaction {
    pub account_id: String,
    pub transaction_id: String,
    pub amount: Decimal,
    pub date: String,
    pub name: String,
    #[serde(default)]
    pub personal_finance_category: Option<PersonalFinanceCategory>,
}

impl ExternalTransaction {
    pub fn category_label(&self) -> &str {
        self.personal_finance_category
            .as_ref()
            .map(|c| c.primary.as_str())
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovedTransaction {
    pub transaction_id: String,
}

/// One page of the incremental transaction stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPage {
    pub next_cursor: String,
    pub has_more: bool,
    #[serde(default)]
    pub added: Vec<ExternalTransaction>,
    #[serde(default)]
    pub modified: Vec<ExternalTransaction>,
    #[serde(default)]
    pub removed: Vec<RemovedTransaction>,
}

/// Stateless request/response access to the provider. Implementations do
/// not retry; callers decide what to do with a failure.
#[async_trait]
pub trait FinanceProvider: Send + Sync {
    /// Create a link token for the client-side link flow.
    async fn create_link_token(&self, user_id: i64) -> Result<String, ProviderError>;

    /// Exchange a public token from the link flow for an access credential.
    async fn exchange_public_token(&self, public_token: &str) -> Result<String, ProviderError>;

    /// Fetch every account under the credential with its current balance.
    async fn fetch_account_balances(
        &self,
        access_token: &str,
    ) -> Result<Vec<ExternalAccount>, ProviderError>;

    /// Fetch the page following `cursor` (empty = start of history).
    async fn fetch_transaction_page(
        &self,
        access_token: &str,
        cursor: &str,
    ) -> Result<SyncPage, ProviderError>;
}

/// Major units to minor units, rounding half away from zero.
pub fn to_minor_units(amount: Decimal) -> Result<i64, ProviderError> {
    amount
        .checked_mul(Decimal::ONE_HUNDRED)
        .map(|cents| cents.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero))
        .and_then(|cents| cents.to_i64())
        .ok_or_else(|| ProviderError::MalformedBody(format!("amount {} out of range", amount)))
}

/// Provider transaction amount to a local signed amount (outflows negative).
pub fn to_local_amount(provider_amount: Decimal) -> Result<i64, ProviderError> {
    to_minor_units(provider_amount).map(|cents| -cents)
}

/// Provider balance to local cents. Balances keep their sign.
pub fn to_local_balance(balance: Decimal) -> Result<i64, ProviderError> {
    to_minor_units(balance)
}
