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

use core::future::Future;
use core::sync::atomic::{AtomicBool, Ordering};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use b2link_config::client::LargeFileUploadSpec;
use b2link_error::{Code, Error, ResultExt, error_if};
use b2link_util::instant_wrapper::InstantWrapper;
use b2link_util::retry::{Retrier, RetryResult};
use bytes::Bytes;
use futures::future;
use futures::stream::{self, StreamExt, TryStreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{Level, event};

use crate::auth::SessionTokenProvider;
use crate::large_file::{LargeFileCoordinator, LargeFileSession, UnfinishedLargeFile};
use crate::part_uploader::PartUploader;
use crate::types::{
    AuthContext, FileVersion, LARGE_FILE_SHA1_INFO, MAX_PART_NUMBER, Part, PartUploadLocation,
};
use crate::upload_location::UploadLocationPool;

pub const DEFAULT_MAX_CONCURRENT_PART_UPLOADS: usize = 4;

/// Initial capacity of a chunk buffer. Buffers grow as content arrives, so
/// small content never holds a whole part worth of memory.
const INITIAL_CHUNK_CAPACITY: usize = 64 * 1024;

/// Whether a request that failed with `err` may still have been applied by
/// the service. A rejected token or a rate limit means it was not.
const fn may_have_applied(err: &Error) -> bool {
    err.is_transient() && !matches!(err.code, Code::ResourceExhausted)
}

/// What to upload and where.
#[derive(Clone, Debug, Default)]
pub struct UploadRequest {
    /// Falls back to the configured default bucket.
    pub bucket_id: Option<String>,
    pub file_name: String,
    pub content_type: Option<String>,
    pub file_info: HashMap<String, String>,
    /// Lane of the upload location used when the content fits in one
    /// request.
    pub lane: Option<String>,
    /// SHA1 of the whole content, stored with large files when known.
    pub large_file_sha1: Option<String>,
}

/// Uploads whole files. Content that fits in one part goes out as one
/// regular upload; anything bigger is split into parts of a large file
/// that are uploaded concurrently.
///
/// Every request is retried according to the configured policy. A rejected
/// upload location is never used again.
#[derive(Debug)]
pub struct LargeFileUploader<I: InstantWrapper = Instant> {
    coordinator: Arc<LargeFileCoordinator<I>>,
    token_provider: Arc<SessionTokenProvider<I>>,
    upload_locations: Arc<UploadLocationPool<I>>,
    part_uploader: PartUploader,
    part_size: u64,
    max_concurrent_part_uploads: usize,
    retrier: Retrier,
}

/// Reads up to `size` bytes. Fewer are returned only at the end of the
/// content.
pub async fn read_chunk<R>(reader: &mut R, size: usize) -> Result<Bytes, Error>
where
    R: AsyncRead + Unpin + Send,
{
    let mut buffer = Vec::with_capacity(size.min(INITIAL_CHUNK_CAPACITY));
    (&mut *reader)
        .take(size as u64)
        .read_to_end(&mut buffer)
        .await
        .err_tip(|| "Reading upload content")?;
    Ok(Bytes::from(buffer))
}

impl<I: InstantWrapper> LargeFileUploader<I> {
    pub fn new(
        coordinator: Arc<LargeFileCoordinator<I>>,
        token_provider: Arc<SessionTokenProvider<I>>,
        upload_locations: Arc<UploadLocationPool<I>>,
        part_uploader: PartUploader,
        spec: &LargeFileUploadSpec,
        retrier: Retrier,
    ) -> Self {
        Self {
            coordinator,
            token_provider,
            upload_locations,
            part_uploader,
            part_size: spec.part_size,
            max_concurrent_part_uploads: match spec.max_concurrent_part_uploads {
                0 => DEFAULT_MAX_CONCURRENT_PART_UPLOADS,
                n => n,
            },
            retrier,
        }
    }

    /// Runs `attempt` until it succeeds or the retry policy gives up.
    async fn with_retry<T, F, Fut>(&self, attempt: F) -> Result<T, Error>
    where
        T: Send,
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, Error>> + Send,
    {
        self.retrier
            .retry(stream::repeat_with(attempt).then(|attempt| async move {
                match attempt.await {
                    Ok(value) => RetryResult::Ok(value),
                    Err(e) => RetryResult::Retry(e),
                }
            }))
            .await
    }

    /// The configured part size, or the recommended one if none is
    /// configured, never below the service's absolute minimum.
    pub fn part_size(&self, auth: &AuthContext) -> u64 {
        let part_size = match self.part_size {
            0 => auth.recommended_part_size,
            size => size,
        };
        part_size.max(auth.absolute_min_part_size).max(1)
    }

    pub async fn upload<R>(
        &self,
        request: &UploadRequest,
        mut reader: R,
        cancel: &CancellationToken,
    ) -> Result<FileVersion, Error>
    where
        R: AsyncRead + Unpin + Send,
    {
        let auth = self.token_provider.get_auth(cancel).await?;
        let part_size = usize::try_from(self.part_size(&auth))?;

        let first = read_chunk(&mut reader, part_size).await?;
        let second = if first.len() < part_size {
            Bytes::new()
        } else {
            read_chunk(&mut reader, part_size).await?
        };
        if second.is_empty() {
            return self.upload_bytes(request, first, cancel).await;
        }

        let mut file_info = request.file_info.clone();
        if let Some(sha1) = &request.large_file_sha1 {
            file_info.insert(LARGE_FILE_SHA1_INFO.to_string(), sha1.clone());
        }
        let session = self.start_session(request, &file_info, cancel).await?;

        let result = match self
            .upload_parts(&session, [first, second], &mut reader, part_size, cancel)
            .await
        {
            Ok(checksums) => self.finish_session(&session, &checksums, cancel).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(file) => Ok(file),
            Err(e) => {
                event!(
                    Level::WARN,
                    file_id = %session.file_id(),
                    ?e,
                    "Large file upload failed, cancelling it"
                );
                // The caller's token may already be cancelled.
                let cleanup = CancellationToken::new();
                if let Err(cancel_err) = self.coordinator.cancel(&session, &cleanup).await {
                    return Err(e.merge(cancel_err));
                }
                Err(e)
            }
        }
    }

    /// Unfinished large files of the request's bucket named exactly like
    /// the requested file.
    async fn unfinished_with_name(
        &self,
        request: &UploadRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<UnfinishedLargeFile>, Error> {
        let files = self
            .coordinator
            .list_unfinished(
                request.bucket_id.as_deref(),
                Some(request.file_name.as_str()),
                cancel,
            )
            .await?;
        Ok(files
            .into_iter()
            .filter(|file| file.file_name == request.file_name)
            .collect())
    }

    /// Starts the large file. A start that failed ambiguously may still
    /// have created a file on the service, so before starting again every
    /// file with this name that was not there before the first attempt is
    /// cancelled.
    async fn start_session(
        &self,
        request: &UploadRequest,
        file_info: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<Arc<LargeFileSession>, Error> {
        let known: HashSet<String> = self
            .with_retry(|| self.unfinished_with_name(request, cancel))
            .await?
            .into_iter()
            .map(|file| file.file_id)
            .collect();
        let ambiguous = AtomicBool::new(false);
        self.with_retry(|| async {
            if ambiguous.swap(false, Ordering::Relaxed) {
                if let Err(e) = self.cancel_orphans(request, &known, cancel).await {
                    ambiguous.store(true, Ordering::Relaxed);
                    return Err(e);
                }
            }
            let result = self
                .coordinator
                .start(
                    request.bucket_id.as_deref(),
                    &request.file_name,
                    request.content_type.as_deref(),
                    file_info.clone(),
                    cancel,
                )
                .await;
            if let Err(e) = &result {
                if may_have_applied(e) {
                    ambiguous.store(true, Ordering::Relaxed);
                }
            }
            result
        })
        .await
    }

    async fn cancel_orphans(
        &self,
        request: &UploadRequest,
        known: &HashSet<String>,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        for file in self.unfinished_with_name(request, cancel).await? {
            if known.contains(&file.file_id) {
                continue;
            }
            event!(
                Level::WARN,
                file_id = %file.file_id,
                file_name = %file.file_name,
                "Cancelling large file left by a failed start"
            );
            self.coordinator.cancel_by_id(&file.file_id, cancel).await?;
        }
        Ok(())
    }

    /// Finishes the large file. After a finish that failed ambiguously the
    /// service is asked whether the file was finished before sending the
    /// request again.
    async fn finish_session(
        &self,
        session: &LargeFileSession,
        checksums: &[String],
        cancel: &CancellationToken,
    ) -> Result<FileVersion, Error> {
        let ambiguous = AtomicBool::new(false);
        self.with_retry(|| async {
            if ambiguous.swap(false, Ordering::Relaxed) {
                match self.coordinator.confirm_finished(session, cancel).await {
                    Ok(Some(file)) => return Ok(file),
                    Ok(None) => {}
                    Err(e) => {
                        ambiguous.store(true, Ordering::Relaxed);
                        return Err(e);
                    }
                }
            }
            let result = self.coordinator.finish(session, checksums, cancel).await;
            if let Err(e) = &result {
                if may_have_applied(e) {
                    ambiguous.store(true, Ordering::Relaxed);
                }
            }
            result
        })
        .await
    }

    /// Uploads `data` as one file in one request, using the upload
    /// location of the request's lane.
    pub async fn upload_bytes(
        &self,
        request: &UploadRequest,
        data: Bytes,
        cancel: &CancellationToken,
    ) -> Result<FileVersion, Error> {
        self.with_retry(|| async {
            let location = self
                .upload_locations
                .get_upload_location(request.bucket_id.as_deref(), request.lane.as_deref(), cancel)
                .await?;
            let result = self
                .part_uploader
                .upload_file(
                    &location,
                    &request.file_name,
                    request.content_type.as_deref(),
                    &request.file_info,
                    data.clone(),
                    cancel,
                )
                .await;
            if let Err(e) = &result {
                if e.is_transient() || e.code == Code::Unauthenticated {
                    self.upload_locations.invalidate(&location);
                }
            }
            result
        })
        .await
    }

    /// Uploads the leading chunks and the rest of `reader` as parts 1..=N,
    /// returning the checksums to finish the file with.
    async fn upload_parts<R>(
        &self,
        session: &LargeFileSession,
        leading: [Bytes; 2],
        reader: &mut R,
        part_size: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, Error>
    where
        R: AsyncRead + Unpin + Send,
    {
        // One part upload location per concurrent worker. A location is
        // handed back only after a successful upload.
        let locations = Mutex::new(Vec::with_capacity(self.max_concurrent_part_uploads));
        let remaining = stream::try_unfold(reader, move |reader| async move {
            let chunk = read_chunk(reader, part_size).await?;
            Ok::<_, Error>((!chunk.is_empty()).then_some((chunk, reader)))
        });
        // The next chunk is read while earlier parts are still uploading.
        stream::iter(leading.map(Ok))
            .chain(remaining)
            .zip(stream::iter(1u32..))
            .map(|(chunk, part_number)| -> Result<_, Error> {
                let chunk = chunk?;
                error_if!(
                    part_number > MAX_PART_NUMBER,
                    "Content of {} needs more than {MAX_PART_NUMBER} parts of {part_size} bytes",
                    session.file_name()
                );
                Ok(self.upload_part(session, part_number, chunk, &locations, cancel))
            })
            .try_buffer_unordered(self.max_concurrent_part_uploads)
            .try_for_each(|_| future::ready(Ok(())))
            .await?;
        Ok(session.ordered_checksums())
    }

    async fn upload_part(
        &self,
        session: &LargeFileSession,
        part_number: u32,
        data: Bytes,
        locations: &Mutex<Vec<PartUploadLocation>>,
        cancel: &CancellationToken,
    ) -> Result<Part, Error> {
        self.with_retry(|| async {
            let reused = locations.lock().pop();
            let location = match reused {
                Some(location) => location,
                None => self.coordinator.get_part_location(session, cancel).await?,
            };
            let part = self
                .coordinator
                .upload_part(session, part_number, data.clone(), &location, cancel)
                .await?;
            // A rejected location is dropped; the next attempt asks for a
            // fresh one.
            locations.lock().push(location);
            Ok::<_, Error>(part)
        })
        .await
        .err_tip(|| format!("Uploading part {part_number} of {}", session.file_id()))
    }
}
