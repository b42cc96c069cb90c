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
use b2link_error::Error;
use b2link_util::instant_wrapper::{InstantWrapper, default_instant_wrapper};
use b2link_util::retry::Retrier;
use b2link_util::single_flight_cache::DEFAULT_LOCK_GRACE;
use bytes::Bytes;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use crate::auth::SessionTokenProvider;
use crate::large_file::LargeFileCoordinator;
use crate::part_uploader::PartUploader;
use crate::transport::{HyperTransport, Transport};
use crate::types::{AuthContext, ClientCache, FileVersion, UploadLocation};
use crate::upload_location::UploadLocationPool;
use crate::uploader::{LargeFileUploader, UploadRequest};

/// Lock grace configured in `spec`, or the default.
pub fn lock_grace(spec: &ClientSpec) -> Duration {
    match spec.cache.lock_grace {
        0 => DEFAULT_LOCK_GRACE,
        secs => Duration::from_secs(secs),
    }
}

/// A storage client. Its token provider and upload location pool share one
/// cache, owned by the client unless one is passed in.
#[derive(Debug)]
pub struct B2Client<I: InstantWrapper = Instant> {
    token_provider: Arc<SessionTokenProvider<I>>,
    upload_locations: Arc<UploadLocationPool<I>>,
    large_files: Arc<LargeFileCoordinator<I>>,
    uploader: LargeFileUploader<I>,
}

impl B2Client<Instant> {
    pub fn new(spec: &ClientSpec) -> Result<Self, Error> {
        let transport = Arc::new(HyperTransport::new(spec)?);
        Ok(Self::with_transport(spec, transport))
    }

    pub fn with_transport(spec: &ClientSpec, transport: Arc<dyn Transport>) -> Self {
        let cache = Arc::new(ClientCache::with_anchor(
            default_instant_wrapper(),
            lock_grace(spec),
        ));
        Self::with_cache(spec, transport, cache)
    }
}

impl<I: InstantWrapper> B2Client<I> {
    /// Builds a client on top of an existing cache, for example one shared
    /// with other clients of the same process.
    pub fn with_cache(
        spec: &ClientSpec,
        transport: Arc<dyn Transport>,
        cache: Arc<ClientCache<I>>,
    ) -> Self {
        let token_provider = Arc::new(SessionTokenProvider::from_spec(
            spec,
            transport.clone(),
            cache.clone(),
        ));
        let upload_locations = Arc::new(UploadLocationPool::from_spec(
            spec,
            transport.clone(),
            cache,
            token_provider.clone(),
        ));
        let large_files = Arc::new(LargeFileCoordinator::new(
            transport.clone(),
            token_provider.clone(),
            spec.default_bucket_id.clone(),
        ));
        let uploader = LargeFileUploader::new(
            large_files.clone(),
            token_provider.clone(),
            upload_locations.clone(),
            PartUploader::new(transport),
            &spec.upload,
            Retrier::from_config(spec.upload.retry.clone()),
        );
        Self {
            token_provider,
            upload_locations,
            large_files,
            uploader,
        }
    }

    pub const fn token_provider(&self) -> &Arc<SessionTokenProvider<I>> {
        &self.token_provider
    }

    pub const fn upload_locations(&self) -> &Arc<UploadLocationPool<I>> {
        &self.upload_locations
    }

    pub const fn large_files(&self) -> &Arc<LargeFileCoordinator<I>> {
        &self.large_files
    }

    pub const fn uploader(&self) -> &LargeFileUploader<I> {
        &self.uploader
    }

    pub async fn authorize(&self, cancel: &CancellationToken) -> Result<AuthContext, Error> {
        self.token_provider.get_auth(cancel).await
    }

    pub async fn get_upload_location(
        &self,
        bucket_id: Option<&str>,
        lane: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<UploadLocation, Error> {
        self.upload_locations
            .get_upload_location(bucket_id, lane, cancel)
            .await
    }

    /// Uploads a small file in a single request.
    pub async fn upload_file(
        &self,
        request: &UploadRequest,
        data: Bytes,
        cancel: &CancellationToken,
    ) -> Result<FileVersion, Error> {
        self.uploader.upload_bytes(request, data, cancel).await
    }

    /// Uploads everything `reader` yields, as a large file when it does not
    /// fit in one part.
    pub async fn upload<R>(
        &self,
        request: &UploadRequest,
        reader: R,
        cancel: &CancellationToken,
    ) -> Result<FileVersion, Error>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.uploader.upload(request, reader, cancel).await
    }
}
