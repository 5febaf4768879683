//! Plaid client tests against a mock HTTP server.

mod common;

use common::init_tracing;
use ledger_sync_service::config::ProviderConfig;
use ledger_sync_service::services::provider::{
    to_local_amount, FinanceProvider, PlaidClient, ProviderError,
};
use rust_decimal::Decimal;
use secrecy::Secret;
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer, timeout: Duration) -> PlaidClient {
    init_tracing();
    PlaidClient::new(ProviderConfig {
        client_id: "test-client".to_string(),
        secret: Secret::new("test-secret".to_string()),
        environment: "sandbox".to_string(),
        base_url: server.uri(),
        timeout,
        client_name: "Budget Tracker".to_string(),
        country_codes: vec!["US".to_string()],
        language: "en".to_string(),
    })
    .expect("Failed to build client")
}

#[tokio::test]
async fn transaction_page_is_requested_with_credentials_and_cursor() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/transactions/sync"))
        .and(body_partial_json(json!({
            "client_id": "test-client",
            "secret": "test-secret",
            "access_token": "access-1",
            "cursor": "c1"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "next_cursor": "c2",
            "has_more": true,
            "added": [{
                "account_id": "acc-1",
                "transaction_id": "t1",
                "amount": 12.34,
                "date": "2024-01-05",
                "name": "Groceries",
                "personal_finance_category": {"primary": "FOOD_AND_DRINK", "detailed": "X"}
            }],
            "modified": [],
            "removed": [{"transaction_id": "t0"}],
            "request_id": "req-1"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server, Duration::from_secs(5));
    let page = client
        .fetch_transaction_page("access-1", "c1")
        .await
        .unwrap();

    assert_eq!(page.next_cursor, "c2");
    assert!(page.has_more);
    assert_eq!(page.added.len(), 1);
    assert_eq!(page.added[0].transaction_id, "t1");
    assert_eq!(to_local_amount(page.added[0].amount).unwrap(), -1234);
    assert_eq!(page.removed[0].transaction_id, "t0");
}

#[tokio::test]
async fn balances_are_parsed_with_nullable_current() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/accounts/balance/get"))
        .and(body_partial_json(json!({"access_token": "access-1"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "accounts": [
                {
                    "account_id": "acc-1",
                    "name": "Checking",
                    "type": "depository",
                    "subtype": "checking",
                    "balances": {"current": 110.5, "available": 100}
                },
                {
                    "account_id": "acc-2",
                    "name": "Card",
                    "type": "credit",
                    "balances": {"current": null}
                }
            ]
        })))
        .mount(&server)
        .await;

    let accounts = client_for(&server, Duration::from_secs(5))
        .fetch_account_balances("access-1")
        .await
        .unwrap();

    assert_eq!(accounts.len(), 2);
    assert_eq!(accounts[0].account_type, "depository");
    assert_eq!(accounts[0].balances.current, Some(Decimal::new(1105, 1)));
    assert_eq!(accounts[1].balances.current, None);
}

#[tokio::test]
async fn link_token_request_asks_for_transactions_product() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/link/token/create"))
        .and(body_partial_json(json!({
            "client_name": "Budget Tracker",
            "user": {"client_user_id": "7"},
            "products": ["transactions"],
            "country_codes": ["US"],
            "language": "en"
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"link_token": "link-sandbox-abc", "expiration": "x"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let token = client_for(&server, Duration::from_secs(5))
        .create_link_token(7)
        .await
        .unwrap();
    assert_eq!(token, "link-sandbox-abc");
}

#[tokio::test]
async fn public_token_is_exchanged_for_access_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/item/public_token/exchange"))
        .and(body_partial_json(json!({"public_token": "public-1"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "access-sandbox-1",
            "item_id": "item-1"
        })))
        .mount(&server)
        .await;

    let access = client_for(&server, Duration::from_secs(5))
        .exchange_public_token("public-1")
        .await
        .unwrap();
    assert_eq!(access, "access-sandbox-1");
}

#[tokio::test]
async fn error_body_is_carried_in_status_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/transactions/sync"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error_type": "ITEM_ERROR",
            "error_code": "ITEM_LOGIN_REQUIRED",
            "error_message": "the login details of this item have changed"
        })))
        .mount(&server)
        .await;

    let err = client_for(&server, Duration::from_secs(5))
        .fetch_transaction_page("access-1", "")
        .await
        .unwrap_err();

    match err {
        ProviderError::Status {
            status,
            code,
            message,
        } => {
            assert_eq!(status, 400);
            assert_eq!(code, "ITEM_LOGIN_REQUIRED");
            assert!(message.contains("login details"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn non_json_error_body_is_kept_as_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/accounts/balance/get"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream unavailable"))
        .mount(&server)
        .await;

    let err = client_for(&server, Duration::from_secs(5))
        .fetch_account_balances("access-1")
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ProviderError::Status { status: 503, ref message, .. } if message == "upstream unavailable"
    ));
}

#[tokio::test]
async fn malformed_success_body_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/transactions/sync"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"unexpected": true})))
        .mount(&server)
        .await;

    let err = client_for(&server, Duration::from_secs(5))
        .fetch_transaction_page("access-1", "")
        .await
        .unwrap_err();

    assert!(matches!(err, ProviderError::MalformedBody(_)));
}

#[tokio::test]
async fn slow_response_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/transactions/sync"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"next_cursor": "c1", "has_more": false}))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let err = client_for(&server, Duration::from_millis(200))
        .fetch_transaction_page("access-1", "")
        .await
        .unwrap_err();

    assert!(matches!(err, ProviderError::Timeout));
}

#[tokio::test]
async fn unreachable_host_is_a_transport_error() {
    let server = MockServer::start().await;
    let client = client_for(&server, Duration::from_secs(2));
    drop(server);

    let err = client
        .fetch_transaction_page("access-1", "")
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ProviderError::Transport(_) | ProviderError::Timeout
    ));
}
