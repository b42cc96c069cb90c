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

use b2link_config::client::ClientSpec;
use b2link_error::{Code, Error, ResultExt, make_err};
use b2link_util::instant_wrapper::InstantWrapper;
use tokio_util::sync::CancellationToken;
use tracing::{Level, event};

use crate::api::post_json;
use crate::auth::SessionTokenProvider;
use crate::transport::Transport;
use crate::types::{
    AuthContext, CacheKey, CachedValue, ClientCache, GetUploadUrlRequest, GetUploadUrlResponse,
    LaneKey, UploadLocation, resolve_bucket,
};

pub const DEFAULT_UPLOAD_LOCATION_LOCK_WAIT: Duration = Duration::from_secs(120);

// 0.9 of a day, under the 24h an upload url stays valid.
pub const DEFAULT_UPLOAD_LOCATION_TTL: Duration = Duration::from_secs(77_760);

/// Upload locations for regular uploads, one per bucket and lane.
///
/// The service serializes concurrent uploads sent to one location. Callers
/// uploading in parallel pick a distinct lane each and get distinct
/// locations. A location may still be rejected before its local lifetime
/// ends; callers then `invalidate` it and ask again.
#[derive(Debug)]
pub struct UploadLocationPool<I: InstantWrapper = Instant> {
    transport: Arc<dyn Transport>,
    cache: Arc<ClientCache<I>>,
    token_provider: Arc<SessionTokenProvider<I>>,
    default_bucket_id: Option<String>,
    lock_wait: Duration,
    ttl: Duration,
}

impl<I: InstantWrapper> UploadLocationPool<I> {
    pub const fn new(
        transport: Arc<dyn Transport>,
        cache: Arc<ClientCache<I>>,
        token_provider: Arc<SessionTokenProvider<I>>,
        default_bucket_id: Option<String>,
        lock_wait: Duration,
        ttl: Duration,
    ) -> Self {
        Self {
            transport,
            cache,
            token_provider,
            default_bucket_id,
            lock_wait,
            ttl,
        }
    }

    pub fn from_spec(
        spec: &ClientSpec,
        transport: Arc<dyn Transport>,
        cache: Arc<ClientCache<I>>,
        token_provider: Arc<SessionTokenProvider<I>>,
    ) -> Self {
        let lock_wait = match spec.cache.upload_location_lock_wait {
            0 => DEFAULT_UPLOAD_LOCATION_LOCK_WAIT,
            secs => Duration::from_secs(secs),
        };
        let ttl = match spec.cache.upload_location_ttl {
            0 => DEFAULT_UPLOAD_LOCATION_TTL,
            secs => Duration::from_secs(secs),
        };
        Self::new(
            transport,
            cache,
            token_provider,
            spec.default_bucket_id.clone(),
            lock_wait,
            ttl,
        )
    }

    fn cache_key(&self, lane_key: LaneKey) -> CacheKey {
        CacheKey::UploadLocation {
            key_id: self.token_provider.credentials().key_id.clone(),
            lane_key,
        }
    }

    pub async fn get_upload_location(
        &self,
        bucket_id: Option<&str>,
        lane: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<UploadLocation, Error> {
        let lane_key = LaneKey {
            bucket_id: resolve_bucket(bucket_id, self.default_bucket_id.as_deref())?,
            lane: lane.map(ToString::to_string),
        };
        // Resolved before taking the cache lock: the token provider shares
        // the same cache and its lock is not re-entrant.
        let auth = self.token_provider.get_auth(cancel).await?;

        let value = self
            .cache
            .get_or_compute(
                self.cache_key(lane_key.clone()),
                self.lock_wait,
                self.ttl,
                cancel,
                || self.request_upload_location(auth, lane_key, cancel),
            )
            .await?;
        match value {
            CachedValue::UploadLocation(location) => Ok(location),
            CachedValue::Auth(_) => Err(make_err!(
                Code::Internal,
                "Cache entry for an upload location holds an authorization"
            )),
        }
    }

    /// Forgets `stale` after the service rejected an upload sent to it.
    pub fn invalidate(&self, stale: &UploadLocation) -> bool {
        self.cache.invalidate_if_eq(
            &self.cache_key(stale.lane_key.clone()),
            &CachedValue::UploadLocation(stale.clone()),
        )
    }

    async fn request_upload_location(
        &self,
        auth: AuthContext,
        lane_key: LaneKey,
        cancel: &CancellationToken,
    ) -> Result<CachedValue, Error> {
        let response: Result<GetUploadUrlResponse, Error> = post_json(
            self.transport.as_ref(),
            auth.api_url("b2_get_upload_url"),
            &auth.token,
            &GetUploadUrlRequest {
                bucket_id: lane_key.bucket_id.clone(),
            },
            cancel,
            "b2_get_upload_url",
        )
        .await;
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                if e.code == Code::Unauthenticated {
                    self.token_provider.invalidate(&auth);
                }
                return Err(e).err_tip(|| format!("Getting upload url for {lane_key:?}"));
            }
        };

        event!(Level::INFO, ?lane_key, "Refreshed upload location");
        Ok(CachedValue::UploadLocation(UploadLocation {
            bucket_id: lane_key.bucket_id.clone(),
            lane_key,
            url: response.upload_url,
            token: response.authorization_token,
        }))
    }
}
