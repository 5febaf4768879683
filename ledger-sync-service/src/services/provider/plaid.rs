//! Plaid provider client.
//!
//! Every endpoint is a JSON POST carrying `client_id` and `secret` in the
//! body. One call is one HTTP request; nothing is retried here.

use super::{ExternalAccount, FinanceProvider, ProviderError, SyncPage};
use crate::config::ProviderConfig;
use crate::services::metrics::record_provider_request;
use async_trait::async_trait;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Plaid client for interacting with the Plaid API.
#[derive(Clone)]
pub struct PlaidClient {
    client: Client,
    config: ProviderConfig,
}

/// Request envelope: credentials plus the endpoint-specific body.
#[derive(Serialize)]
struct AuthenticatedRequest<'a, T: Serialize> {
    client_id: &'a str,
    secret: &'a str,
    #[serde(flatten)]
    body: T,
}

#[derive(Serialize)]
struct LinkTokenUser {
    client_user_id: String,
}

#[derive(Serialize)]
struct LinkTokenCreateRequest<'a> {
    client_name: &'a str,
    user: LinkTokenUser,
    products: [&'a str; 1],
    country_codes: &'a [String],
    language: &'a str,
}

#[derive(Deserialize)]
struct LinkTokenCreateResponse {
    link_token: String,
}

#[derive(Serialize)]
struct PublicTokenExchangeRequest<'a> {
    public_token: &'a str,
}

#[derive(Deserialize)]
struct PublicTokenExchangeResponse {
    access_token: String,
}

#[derive(Serialize)]
struct AccessTokenRequest<'a> {
    access_token: &'a str,
}

#[derive(Deserialize)]
struct AccountsBalanceResponse {
    accounts: Vec<ExternalAccount>,
}

#[derive(Serialize)]
struct TransactionsSyncRequest<'a> {
    access_token: &'a str,
    cursor: &'a str,
}

/// Plaid API error response.
#[derive(Debug, Deserialize)]
pub struct PlaidErrorBody {
    #[serde(default)]
    pub error_type: String,
    #[serde(default)]
    pub error_code: String,
    #[serde(default)]
    pub error_message: String,
}

impl PlaidClient {
    /// Create a new Plaid client with the configured request timeout.
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderError::Transport(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    /// Check if Plaid is configured (credentials are set).
    pub fn is_configured(&self) -> bool {
        !self.config.client_id.is_empty() && !self.config.secret.expose_secret().is_empty()
    }

    /// POST `body` to `path` and decode a successful response.
    async fn post<B, R>(&self, path: &str, body: B) -> Result<R, ProviderError>
    where
        B: Serialize,
        R: DeserializeOwned,
    {
        if !self.is_configured() {
            return Err(ProviderError::NotConfigured(
                "PLAID_CLIENT_ID and PLAID_SECRET must be set".to_string(),
            ));
        }

        let request = AuthenticatedRequest {
            client_id: &self.config.client_id,
            secret: self.config.secret.expose_secret(),
            body,
        };
        let url = format!("{}{}", self.config.base_url, path);
        let start = Instant::now();

        let response = match self.client.post(&url).json(&request).send().await {
            Ok(response) => response,
            Err(e) => {
                let err = transport_error(e);
                record_provider_request(path, err.kind(), start.elapsed().as_secs_f64());
                return Err(err);
            }
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                let err = transport_error(e);
                record_provider_request(path, err.kind(), start.elapsed().as_secs_f64());
                return Err(err);
            }
        };

        record_provider_request(path, status.as_str(), start.elapsed().as_secs_f64());
        tracing::debug!(endpoint = path, status = %status, "Plaid response received");

        if !status.is_success() {
            let error = serde_json::from_str::<PlaidErrorBody>(&body).unwrap_or(PlaidErrorBody {
                error_type: String::new(),
                error_code: "UNKNOWN".to_string(),
                error_message: body.clone(),
            });
            tracing::warn!(
                endpoint = path,
                status = status.as_u16(),
                error_type = %error.error_type,
                error_code = %error.error_code,
                "Plaid request failed"
            );
            return Err(ProviderError::Status {
                status: status.as_u16(),
                code: error.error_code,
                message: error.error_message,
            });
        }

        serde_json::from_str(&body).map_err(|e| {
            tracing::warn!(endpoint = path, error = %e, "Plaid response did not parse");
            ProviderError::MalformedBody(e.to_string())
        })
    }
}

fn transport_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Transport(e.to_string())
    }
}

#[async_trait]
impl FinanceProvider for PlaidClient {
    async fn create_link_token(&self, user_id: i64) -> Result<String, ProviderError> {
        let response: LinkTokenCreateResponse = self
            .post(
                "/link/token/create",
                LinkTokenCreateRequest {
                    client_name: &self.config.client_name,
                    user: LinkTokenUser {
                        client_user_id: user_id.to_string(),
                    },
                    products: ["transactions"],
                    country_codes: &self.config.country_codes,
                    language: &self.config.language,
                },
            )
            .await?;

        Ok(response.link_token)
    }

    async fn exchange_public_token(&self, public_token: &str) -> Result<String, ProviderError> {
        let response: PublicTokenExchangeResponse = self
            .post(
                "/item/public_token/exchange",
                PublicTokenExchangeRequest { public_token },
            )
            .await?;

        tracing::info!("Public token exchanged for access token");
        Ok(response.access_token)
    }

    async fn fetch_account_balances(
        &self,
        access_token: &str,
    ) -> Result<Vec<ExternalAccount>, ProviderError> {
        let response: AccountsBalanceResponse = self
            .post("/accounts/balance/get", AccessTokenRequest { access_token })
            .await?;

        Ok(response.accounts)
    }

    async fn fetch_transaction_page(
        &self,
        access_token: &str,
        cursor: &str,
    ) -> Result<SyncPage, ProviderError> {
        let page: SyncPage = self
            .post(
                "/transactions/sync",
                TransactionsSyncRequest {
                    access_token,
                    cursor,
                },
            )
            .await?;

        tracing::debug!(
            added = page.added.len(),
            modified = page.modified.len(),
            removed = page.removed.len(),
            has_more = page.has_more,
            "Fetched transaction page"
        );
        Ok(page)
    }
}
