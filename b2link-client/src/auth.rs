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
use std::time::Instant;

use b2link_config::client::{ClientSpec, DEFAULT_AUTH_BASE_URL};
use b2link_error::{Code, Error, ResultExt, make_err};
use b2link_util::instant_wrapper::InstantWrapper;
use b2link_util::task::cancellable;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use http::Method;
use http::header::{AUTHORIZATION, HeaderValue};
use tokio_util::sync::CancellationToken;
use tracing::{Level, event};

use crate::api::{decode_error_body, decode_response};
use crate::transport::{DEFAULT_REQUEST_TIMEOUT, HttpRequest, HttpResponse, Transport};
use crate::types::{
    API_VERSION_PATH, AuthContext, AuthorizeAccountResponse, CacheKey, CachedValue, ClientCache,
    UNAUTHORIZED_ERROR_CODE,
};

pub const DEFAULT_AUTH_LOCK_WAIT_BUFFER: Duration = Duration::from_secs(5);

// 0.95 of a day, comfortably under the 24h the service grants a token.
pub const DEFAULT_AUTH_TTL: Duration = Duration::from_secs(82_080);

/// A key id and its secret.
#[derive(Clone)]
pub struct Credentials {
    pub key_id: String,
    pub application_key: String,
}

impl core::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Credentials")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl Credentials {
    pub fn new(key_id: impl Into<String>, application_key: impl Into<String>) -> Self {
        Self {
            key_id: key_id.into(),
            application_key: application_key.into(),
        }
    }

    fn validate(&self) -> Result<(), Error> {
        if self.key_id.trim().is_empty() {
            return Err(make_err!(
                Code::Unauthenticated,
                "No key id configured, refusing to authorize"
            ));
        }
        if self.application_key.trim().is_empty() {
            return Err(make_err!(
                Code::Unauthenticated,
                "No application key configured for key id {}, refusing to authorize",
                self.key_id
            ));
        }
        Ok(())
    }

    fn basic_auth_header(&self) -> Result<HeaderValue, Error> {
        let encoded = STANDARD.encode(format!("{}:{}", self.key_id, self.application_key));
        let mut value = HeaderValue::from_str(&format!("Basic {encoded}"))?;
        value.set_sensitive(true);
        Ok(value)
    }
}

/// Hands out the current account authorization, refreshing it through the
/// shared cache at most once at a time per credential set.
#[derive(Debug)]
pub struct SessionTokenProvider<I: InstantWrapper = Instant> {
    transport: Arc<dyn Transport>,
    cache: Arc<ClientCache<I>>,
    credentials: Credentials,
    authorize_url: String,
    lock_wait: Duration,
    ttl: Duration,
}

impl<I: InstantWrapper> SessionTokenProvider<I> {
    pub fn new(
        transport: Arc<dyn Transport>,
        cache: Arc<ClientCache<I>>,
        credentials: Credentials,
        auth_base_url: &str,
        lock_wait: Duration,
        ttl: Duration,
    ) -> Self {
        Self {
            transport,
            cache,
            credentials,
            authorize_url: format!(
                "{}/b2_authorize_account",
                auth_base_url.trim_end_matches('/')
            ),
            lock_wait,
            ttl,
        }
    }

    /// Lock wait is the request timeout plus a buffer, so a waiter gives up
    /// only once the authorization it is waiting on must have timed out.
    pub fn from_spec(
        spec: &ClientSpec,
        transport: Arc<dyn Transport>,
        cache: Arc<ClientCache<I>>,
    ) -> Self {
        let request_timeout = match spec.request_timeout {
            0 => DEFAULT_REQUEST_TIMEOUT,
            secs => Duration::from_secs(secs),
        };
        let buffer = match spec.cache.auth_lock_wait_buffer {
            0 => DEFAULT_AUTH_LOCK_WAIT_BUFFER,
            secs => Duration::from_secs(secs),
        };
        let ttl = match spec.cache.auth_ttl {
            0 => DEFAULT_AUTH_TTL,
            secs => Duration::from_secs(secs),
        };
        Self::new(
            transport,
            cache,
            Credentials::new(spec.key_id.clone(), spec.application_key.clone()),
            spec.auth_base_url.as_deref().unwrap_or(DEFAULT_AUTH_BASE_URL),
            request_timeout.saturating_add(buffer),
            ttl,
        )
    }

    pub const fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    fn cache_key(&self) -> CacheKey {
        CacheKey::Auth {
            key_id: self.credentials.key_id.clone(),
            authorize_url: self.authorize_url.clone(),
        }
    }

    /// Returns the cached authorization or authorizes the account.
    pub async fn get_auth(&self, cancel: &CancellationToken) -> Result<AuthContext, Error> {
        self.credentials.validate()?;
        let value = self
            .cache
            .get_or_compute(self.cache_key(), self.lock_wait, self.ttl, cancel, || {
                self.authorize(cancel)
            })
            .await?;
        match value {
            CachedValue::Auth(auth) => Ok(auth),
            CachedValue::UploadLocation(_) => Err(make_err!(
                Code::Internal,
                "Cache entry for key id {} does not hold an authorization",
                self.credentials.key_id
            )),
        }
    }

    /// Forgets `stale` after the service rejected it. The next `get_auth`
    /// authorizes again unless another caller already did.
    pub fn invalidate(&self, stale: &AuthContext) -> bool {
        self.cache
            .invalidate_if_eq(&self.cache_key(), &CachedValue::Auth(stale.clone()))
    }

    async fn authorize(&self, cancel: &CancellationToken) -> Result<CachedValue, Error> {
        let mut request = HttpRequest::new(Method::GET, self.authorize_url.clone());
        request
            .headers
            .insert(AUTHORIZATION, self.credentials.basic_auth_header()?);

        let response = cancellable(cancel, "b2_authorize_account", self.transport.send(request))
            .await
            .err_tip(|| format!("Authorizing key id {}", self.credentials.key_id))?;
        if !response.status.is_success() {
            return Err(classify_authorize_failure(&self.credentials.key_id, &response));
        }

        let body: AuthorizeAccountResponse = decode_response(&response, "b2_authorize_account")?;
        event!(
            Level::INFO,
            key_id = %self.credentials.key_id,
            account_id = %body.account_id,
            "Authorized account"
        );
        Ok(CachedValue::Auth(AuthContext {
            account_id: body.account_id,
            api_base_url: format!("{}{API_VERSION_PATH}", body.api_url.trim_end_matches('/')),
            download_base_url: body.download_url,
            token: body.authorization_token,
            min_part_size: body
                .minimum_part_size
                .unwrap_or(body.recommended_part_size),
            recommended_part_size: body.recommended_part_size,
            absolute_min_part_size: body.absolute_minimum_part_size,
        }))
    }
}

/// Turns a failed authorization into an error. A rejected key pairing gets a
/// message telling the user which id goes with which key. Anything else
/// carries the raw response body.
pub fn classify_authorize_failure(key_id: &str, response: &HttpResponse) -> Error {
    let status = response.status.as_u16();
    match decode_error_body(response) {
        Some(body) if status == 401 && body.code == UNAUTHORIZED_ERROR_CODE => make_err!(
            Code::Unauthenticated,
            "Key id {key_id} was rejected together with the given application key ({}). \
             An application key must be used with its own key id. Only the master \
             application key is used with the account id.",
            body.message
        ),
        _ => make_err!(
            Code::Unauthenticated,
            "Authorizing key id {key_id} failed with status {status}: {}",
            response.body_text()
        ),
    }
}
