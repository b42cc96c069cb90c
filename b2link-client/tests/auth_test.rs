// Copyright 2024 The NativeLink Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use core::time::Duration;
use std::sync::Arc;

use b2link_client::auth::{Credentials, DEFAULT_AUTH_TTL, SessionTokenProvider};
use b2link_client::client::B2Client;
use b2link_client::mocks::{
    AUTHORIZE_ACCOUNT, MOCK_ACCOUNT_ID, MOCK_API_URL, MOCK_APPLICATION_KEY, MOCK_AUTH_BASE_URL,
    MOCK_KEY_ID, MockTransport, api_url,
};
use b2link_client::types::ClientCache;
use b2link_config::client::ClientSpec;
use b2link_error::{Code, Error};
use b2link_macro::b2link_test;
use b2link_util::instant_wrapper::MockInstantWrapped;
use b2link_util::single_flight_cache::DEFAULT_LOCK_GRACE;
use futures::future::join_all;
use http::header::AUTHORIZATION;
use mock_instant::thread_local::MockClock;
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

fn client_spec() -> ClientSpec {
    ClientSpec {
        key_id: MOCK_KEY_ID.to_string(),
        application_key: MOCK_APPLICATION_KEY.to_string(),
        auth_base_url: Some(MOCK_AUTH_BASE_URL.to_string()),
        ..ClientSpec::default()
    }
}

#[b2link_test(start_paused = true)]
async fn concurrent_callers_share_one_authorization() -> Result<(), Error> {
    let transport =
        Arc::new(MockTransport::default().with_authorize_delay(Duration::from_millis(250)));
    let client = B2Client::with_transport(&client_spec(), transport.clone());
    let cancel = CancellationToken::new();

    let results = join_all((0..10).map(|_| client.authorize(&cancel))).await;

    assert_eq!(transport.call_count(AUTHORIZE_ACCOUNT), 1);
    let tokens = results
        .into_iter()
        .map(|result| result.map(|auth| auth.token))
        .collect::<Result<Vec<_>, Error>>()?;
    assert_eq!(tokens, vec!["auth-token-1".to_string(); 10]);
    Ok(())
}

#[b2link_test]
async fn authorization_populates_context() -> Result<(), Error> {
    let transport = Arc::new(MockTransport::default().with_part_sizes(1000, 100));
    let client = B2Client::with_transport(&client_spec(), transport.clone());

    let auth = client.authorize(&CancellationToken::new()).await?;

    assert_eq!(auth.account_id, MOCK_ACCOUNT_ID);
    assert_eq!(auth.api_base_url, format!("{MOCK_API_URL}/b2api/v2"));
    assert_eq!(auth.recommended_part_size, 1000);
    assert_eq!(auth.absolute_min_part_size, 100);
    assert_eq!(
        auth.api_url("b2_start_large_file"),
        api_url("b2_start_large_file")
    );

    let requests = transport.requests_for(AUTHORIZE_ACCOUNT);
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].url,
        format!("{MOCK_AUTH_BASE_URL}/b2_authorize_account")
    );
    assert_eq!(
        requests[0].headers.get(AUTHORIZATION).map(|v| v.as_bytes().to_vec()),
        // base64 of "mock-key-id:mock-application-key"
        Some(b"Basic bW9jay1rZXktaWQ6bW9jay1hcHBsaWNhdGlvbi1rZXk=".to_vec())
    );
    Ok(())
}

#[b2link_test]
async fn blank_credentials_fail_without_request() -> Result<(), Error> {
    let transport = Arc::new(MockTransport::default());
    let spec = ClientSpec {
        application_key: "  ".to_string(),
        ..client_spec()
    };
    let client = B2Client::with_transport(&spec, transport.clone());

    let err = client
        .authorize(&CancellationToken::new())
        .await
        .expect_err("Blank application key must be rejected");

    assert_eq!(err.code, Code::Unauthenticated);
    assert!(transport.requests().is_empty());

    let spec = ClientSpec {
        key_id: String::new(),
        ..client_spec()
    };
    let client = B2Client::with_transport(&spec, transport.clone());
    let err = client
        .authorize(&CancellationToken::new())
        .await
        .expect_err("Missing key id must be rejected");
    assert_eq!(err.code, Code::Unauthenticated);
    assert!(transport.requests().is_empty());
    Ok(())
}

#[b2link_test]
async fn rejected_key_pairing_gets_pairing_advice() -> Result<(), Error> {
    let transport = Arc::new(MockTransport::new("account-id", MOCK_APPLICATION_KEY));
    let client = B2Client::with_transport(&client_spec(), transport.clone());

    let err = client
        .authorize(&CancellationToken::new())
        .await
        .expect_err("Mismatched key id must be rejected");

    assert_eq!(err.code, Code::Unauthenticated);
    let message = err.message_string();
    assert!(
        message.contains("An application key must be used with its own key id"),
        "unexpected message: {message}"
    );
    Ok(())
}

#[b2link_test]
async fn other_authorization_failures_carry_raw_body() -> Result<(), Error> {
    let transport = Arc::new(MockTransport::default());
    transport.fail_next(AUTHORIZE_ACCOUNT, 503, "service_unavailable", "try later");
    let client = B2Client::with_transport(&client_spec(), transport.clone());
    let cancel = CancellationToken::new();

    let err = client
        .authorize(&cancel)
        .await
        .expect_err("Injected failure must surface");

    assert_eq!(err.code, Code::Unauthenticated);
    let message = err.message_string();
    assert!(message.contains("status 503"), "unexpected message: {message}");
    assert!(
        message.contains(r#""code":"service_unavailable""#),
        "unexpected message: {message}"
    );

    // The failure was not cached.
    assert_eq!(client.authorize(&cancel).await?.token, "auth-token-1");
    assert_eq!(transport.call_count(AUTHORIZE_ACCOUNT), 2);
    Ok(())
}

#[b2link_test]
async fn invalidated_authorization_is_refreshed() -> Result<(), Error> {
    let transport = Arc::new(MockTransport::default());
    let client = B2Client::with_transport(&client_spec(), transport.clone());
    let cancel = CancellationToken::new();

    let stale = client.authorize(&cancel).await?;
    assert!(client.token_provider().invalidate(&stale));
    // A second report of the same stale value is a no-op.
    assert!(!client.token_provider().invalidate(&stale));

    let fresh = client.authorize(&cancel).await?;
    assert_eq!(fresh.token, "auth-token-2");
    assert_eq!(transport.call_count(AUTHORIZE_ACCOUNT), 2);

    // A stale value reported after the refresh keeps the fresh entry.
    assert!(!client.token_provider().invalidate(&stale));
    assert_eq!(client.authorize(&cancel).await?, fresh);
    Ok(())
}

#[b2link_test]
async fn authorization_expires_after_ttl() -> Result<(), Error> {
    let transport = Arc::new(MockTransport::default());
    let cache = Arc::new(ClientCache::with_anchor(
        MockInstantWrapped::default(),
        DEFAULT_LOCK_GRACE,
    ));
    let client = B2Client::with_cache(&client_spec(), transport.clone(), cache);
    let cancel = CancellationToken::new();

    client.authorize(&cancel).await?;
    MockClock::advance(DEFAULT_AUTH_TTL - Duration::from_secs(1));
    assert_eq!(client.authorize(&cancel).await?.token, "auth-token-1");
    assert_eq!(transport.call_count(AUTHORIZE_ACCOUNT), 1);

    MockClock::advance(Duration::from_secs(1));
    assert_eq!(client.authorize(&cancel).await?.token, "auth-token-2");
    assert_eq!(transport.call_count(AUTHORIZE_ACCOUNT), 2);
    Ok(())
}

#[b2link_test]
async fn credential_sets_do_not_share_entries() -> Result<(), Error> {
    let transport = Arc::new(MockTransport::default());
    let cache = Arc::new(ClientCache::new());
    let cancel = CancellationToken::new();
    let provider = SessionTokenProvider::new(
        transport.clone(),
        cache.clone(),
        Credentials::new(MOCK_KEY_ID, MOCK_APPLICATION_KEY),
        MOCK_AUTH_BASE_URL,
        Duration::from_secs(10),
        Duration::from_secs(60),
    );
    let other = SessionTokenProvider::new(
        transport.clone(),
        cache.clone(),
        Credentials::new("other-key-id", "other-secret"),
        MOCK_AUTH_BASE_URL,
        Duration::from_secs(10),
        Duration::from_secs(60),
    );

    provider.get_auth(&cancel).await?;
    let err = other
        .get_auth(&cancel)
        .await
        .expect_err("Unknown key id must not reuse another key's entry");

    assert_eq!(err.code, Code::Unauthenticated);
    assert_eq!(transport.call_count(AUTHORIZE_ACCOUNT), 2);
    assert_eq!(cache.len(), 1);
    Ok(())
}

#[b2link_test]
async fn cancelled_authorization_fails_with_cancelled() -> Result<(), Error> {
    let transport = Arc::new(MockTransport::default());
    let client = B2Client::with_transport(&client_spec(), transport.clone());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = client
        .authorize(&cancel)
        .await
        .expect_err("Cancelled call must fail");

    assert_eq!(err.code, Code::Cancelled);
    assert!(transport.requests().is_empty());
    Ok(())
}
