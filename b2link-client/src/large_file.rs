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

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use b2link_error::{Code, Error, ResultExt, error_if, make_err, make_input_err};
use b2link_util::instant_wrapper::InstantWrapper;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{Level, event};

use crate::api::post_json;
use crate::auth::SessionTokenProvider;
use crate::part_uploader::{PartUploader, validate_file_info, validate_part_number};
use crate::transport::Transport;
use crate::types::{
    CancelLargeFileResponse, DEFAULT_CONTENT_TYPE, FileIdRequest, FileVersion,
    FinishLargeFileRequest, GetUploadPartUrlResponse, LIST_PARTS_PAGE_SIZE,
    LIST_UNFINISHED_PAGE_SIZE, ListPartsRequest, ListPartsResponse,
    ListUnfinishedLargeFilesRequest, ListUnfinishedLargeFilesResponse, Part, PartUploadLocation,
    StartLargeFileRequest, resolve_bucket,
};

/// Where a large file session is in its lifecycle. A session only exists
/// once the service has started the file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Started,
    PartUploading,
    Finished,
    Cancelled,
    Failed,
}

impl SessionState {
    const fn accepts_parts(self) -> bool {
        matches!(self, Self::Started | Self::PartUploading)
    }

    const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Cancelled)
    }
}

#[derive(Debug)]
struct SessionInner {
    state: SessionState,
    parts: BTreeMap<u32, Part>,
    // Part numbers currently being uploaded.
    in_flight: BTreeSet<u32>,
}

/// One large file being uploaded. Only the coordinator mutates it.
#[derive(Debug)]
pub struct LargeFileSession {
    file_id: String,
    bucket_id: String,
    file_name: String,
    inner: Mutex<SessionInner>,
}

impl LargeFileSession {
    fn new(file_id: String, bucket_id: String, file_name: String, parts: Vec<Part>) -> Self {
        let state = if parts.is_empty() {
            SessionState::Started
        } else {
            SessionState::PartUploading
        };
        Self {
            file_id,
            bucket_id,
            file_name,
            inner: Mutex::new(SessionInner {
                state,
                parts: parts.into_iter().map(|part| (part.number, part)).collect(),
                in_flight: BTreeSet::new(),
            }),
        }
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn bucket_id(&self) -> &str {
        &self.bucket_id
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// Recorded parts, ascending by part number.
    pub fn parts(&self) -> Vec<Part> {
        self.inner.lock().parts.values().cloned().collect()
    }

    /// Checksums of the recorded parts in the order `finish` expects them.
    pub fn ordered_checksums(&self) -> Vec<String> {
        self.inner
            .lock()
            .parts
            .values()
            .map(|part| part.checksum.clone())
            .collect()
    }

    fn check_accepts_parts(&self, operation: &str) -> Result<(), Error> {
        let state = self.state();
        if state.accepts_parts() {
            return Ok(());
        }
        Err(make_err!(
            Code::FailedPrecondition,
            "Cannot {operation} for large file {} in state {state:?}",
            self.file_id
        ))
    }

    fn reserve_part(&self, part_number: u32) -> Result<PartReservation<'_>, Error> {
        let mut inner = self.inner.lock();
        if !inner.state.accepts_parts() {
            return Err(make_err!(
                Code::FailedPrecondition,
                "Cannot upload part {part_number} of large file {} in state {:?}",
                self.file_id,
                inner.state
            ));
        }
        error_if!(
            inner.parts.contains_key(&part_number),
            "Part {part_number} of large file {} was already uploaded",
            self.file_id
        );
        error_if!(
            !inner.in_flight.insert(part_number),
            "Part {part_number} of large file {} is already being uploaded",
            self.file_id
        );
        Ok(PartReservation {
            session: self,
            part_number,
        })
    }

    /// Checks `ordered_checksums` against the recorded parts. Part numbers
    /// must run 1..=N without gaps and the checksums must match in order.
    fn validate_finish(&self, ordered_checksums: &[String]) -> Result<(), Error> {
        let inner = self.inner.lock();
        if !inner.state.accepts_parts() {
            return Err(make_err!(
                Code::FailedPrecondition,
                "Cannot finish large file {} in state {:?}",
                self.file_id,
                inner.state
            ));
        }
        if !inner.in_flight.is_empty() {
            return Err(make_err!(
                Code::FailedPrecondition,
                "Cannot finish large file {} while parts {:?} are still uploading",
                self.file_id,
                inner.in_flight
            ));
        }
        error_if!(
            ordered_checksums.is_empty(),
            "Cannot finish large file {} without any part",
            self.file_id
        );
        error_if!(
            ordered_checksums.len() != inner.parts.len(),
            "Finishing large file {} with {} checksums but {} parts were uploaded",
            self.file_id,
            ordered_checksums.len(),
            inner.parts.len()
        );
        for (expected_number, checksum) in (1u32..).zip(ordered_checksums) {
            let part = inner.parts.get(&expected_number).ok_or_else(|| {
                make_input_err!(
                    "Part {expected_number} of large file {} was never uploaded",
                    self.file_id
                )
            })?;
            error_if!(
                !part.checksum.eq_ignore_ascii_case(checksum),
                "Checksum {checksum} at position {expected_number} does not match part {expected_number} ({}) of large file {}",
                part.checksum,
                self.file_id
            );
        }
        Ok(())
    }

    fn set_state(&self, state: SessionState) {
        self.inner.lock().state = state;
    }
}

/// Marks a part number as in flight until it is recorded or dropped. A
/// dropped upload (cancelled, or abandoned after a sibling part failed)
/// frees the number again.
#[derive(Debug)]
struct PartReservation<'a> {
    session: &'a LargeFileSession,
    part_number: u32,
}

impl PartReservation<'_> {
    fn complete(self, part: Part) -> Part {
        let mut inner = self.session.inner.lock();
        inner.parts.insert(self.part_number, part.clone());
        if inner.state == SessionState::Started {
            inner.state = SessionState::PartUploading;
        }
        part
    }
}

impl Drop for PartReservation<'_> {
    fn drop(&mut self) {
        self.session.inner.lock().in_flight.remove(&self.part_number);
    }
}

/// An unfinished large file as listed by the service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnfinishedLargeFile {
    pub file_id: String,
    pub bucket_id: String,
    pub file_name: String,
    pub content_type: Option<String>,
    pub file_info: HashMap<String, String>,
}

/// Drives the start, upload part, finish or cancel protocol of large files.
///
/// Holds no durable state. A session interrupted by a crash is found again
/// with `list_unfinished` and picked up with `resume`.
#[derive(Debug)]
pub struct LargeFileCoordinator<I: InstantWrapper = Instant> {
    transport: Arc<dyn Transport>,
    token_provider: Arc<SessionTokenProvider<I>>,
    part_uploader: PartUploader,
    default_bucket_id: Option<String>,
}

impl<I: InstantWrapper> LargeFileCoordinator<I> {
    pub fn new(
        transport: Arc<dyn Transport>,
        token_provider: Arc<SessionTokenProvider<I>>,
        default_bucket_id: Option<String>,
    ) -> Self {
        Self {
            part_uploader: PartUploader::new(transport.clone()),
            transport,
            token_provider,
            default_bucket_id,
        }
    }

    /// Sends one API call with the current authorization. A rejected token
    /// is dropped from the cache so the caller's next attempt re-authorizes.
    async fn call<B, R>(
        &self,
        operation: &'static str,
        body: &B,
        cancel: &CancellationToken,
    ) -> Result<R, Error>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let auth = self.token_provider.get_auth(cancel).await?;
        let result = post_json(
            self.transport.as_ref(),
            auth.api_url(operation),
            &auth.token,
            body,
            cancel,
            operation,
        )
        .await;
        if let Err(e) = &result {
            if e.code == Code::Unauthenticated {
                self.token_provider.invalidate(&auth);
            }
        }
        result
    }

    pub async fn start(
        &self,
        bucket_id: Option<&str>,
        file_name: &str,
        content_type: Option<&str>,
        file_info: HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<Arc<LargeFileSession>, Error> {
        let bucket_id = resolve_bucket(bucket_id, self.default_bucket_id.as_deref())?;
        error_if!(file_name.is_empty(), "File name must not be empty");
        validate_file_info(&file_info)?;

        let file: FileVersion = self
            .call(
                "b2_start_large_file",
                &StartLargeFileRequest {
                    bucket_id: bucket_id.clone(),
                    file_name: file_name.to_string(),
                    content_type: content_type.unwrap_or(DEFAULT_CONTENT_TYPE).to_string(),
                    file_info,
                },
                cancel,
            )
            .await
            .err_tip(|| format!("Starting large file {file_name}"))?;

        event!(Level::INFO, file_id = %file.file_id, file_name, "Started large file");
        Ok(Arc::new(LargeFileSession::new(
            file.file_id,
            bucket_id,
            file.file_name,
            Vec::new(),
        )))
    }

    /// Gets a location to upload parts of `session` to. Locations are tied
    /// to the file and are not shared through the upload location pool.
    pub async fn get_part_location(
        &self,
        session: &LargeFileSession,
        cancel: &CancellationToken,
    ) -> Result<PartUploadLocation, Error> {
        session.check_accepts_parts("get a part upload url")?;
        let response: GetUploadPartUrlResponse = self
            .call(
                "b2_get_upload_part_url",
                &FileIdRequest {
                    file_id: session.file_id.clone(),
                },
                cancel,
            )
            .await
            .err_tip(|| format!("Getting part upload url for {}", session.file_id))?;
        Ok(PartUploadLocation {
            file_id: response.file_id,
            url: response.upload_url,
            token: response.authorization_token,
        })
    }

    /// Uploads and records one part. A failed upload records nothing, so the
    /// same part number may be tried again, ideally with a fresh location.
    pub async fn upload_part(
        &self,
        session: &LargeFileSession,
        part_number: u32,
        data: Bytes,
        location: &PartUploadLocation,
        cancel: &CancellationToken,
    ) -> Result<Part, Error> {
        validate_part_number(part_number)?;
        error_if!(
            location.file_id != session.file_id,
            "Part upload url for {} used for large file {}",
            location.file_id,
            session.file_id
        );
        let reservation = session.reserve_part(part_number)?;

        let result = self
            .part_uploader
            .upload_part(location, part_number, data, cancel)
            .await?;
        Ok(reservation.complete(Part {
            number: part_number,
            checksum: result.checksum,
            byte_length: result.length,
        }))
    }

    /// Finishes `session`. The checksums must list every recorded part in
    /// ascending part number order; the service checks them again.
    pub async fn finish(
        &self,
        session: &LargeFileSession,
        ordered_checksums: &[String],
        cancel: &CancellationToken,
    ) -> Result<FileVersion, Error> {
        session.validate_finish(ordered_checksums)?;

        let result: Result<FileVersion, Error> = self
            .call(
                "b2_finish_large_file",
                &FinishLargeFileRequest {
                    file_id: session.file_id.clone(),
                    part_sha1_array: ordered_checksums.to_vec(),
                },
                cancel,
            )
            .await;
        match result {
            Ok(file) => {
                session.set_state(SessionState::Finished);
                event!(
                    Level::INFO,
                    file_id = %session.file_id,
                    parts = ordered_checksums.len(),
                    "Finished large file"
                );
                Ok(file)
            }
            Err(e) => {
                // The service refused the parts themselves; retrying the same
                // request will not help.
                if !e.is_transient() && !matches!(e.code, Code::Unauthenticated | Code::Cancelled) {
                    session.set_state(SessionState::Failed);
                }
                Err(e).err_tip(|| format!("Finishing large file {}", session.file_id))
            }
        }
    }

    /// Checks whether the service already finished `session`, for when a
    /// finish request failed without telling whether it took effect.
    /// Returns the finished file and marks the session finished if so.
    pub async fn confirm_finished(
        &self,
        session: &LargeFileSession,
        cancel: &CancellationToken,
    ) -> Result<Option<FileVersion>, Error> {
        let still_unfinished = self
            .list_unfinished(
                Some(session.bucket_id.as_str()),
                Some(session.file_name.as_str()),
                cancel,
            )
            .await?
            .iter()
            .any(|file| file.file_id == session.file_id);
        if still_unfinished {
            return Ok(None);
        }
        let file = self
            .get_file_info(&session.file_id, cancel)
            .await
            .err_tip(|| format!("Confirming large file {} was finished", session.file_id))?;
        session.set_state(SessionState::Finished);
        event!(
            Level::INFO,
            file_id = %session.file_id,
            "Large file was already finished"
        );
        Ok(Some(file))
    }

    pub async fn get_file_info(
        &self,
        file_id: &str,
        cancel: &CancellationToken,
    ) -> Result<FileVersion, Error> {
        self.call(
            "b2_get_file_info",
            &FileIdRequest {
                file_id: file_id.to_string(),
            },
            cancel,
        )
        .await
        .err_tip(|| format!("Getting file info of {file_id}"))
    }

    /// Cancels `session` and releases its uploaded parts on the service.
    pub async fn cancel(
        &self,
        session: &LargeFileSession,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let state = session.state();
        if state.is_terminal() {
            return Err(make_err!(
                Code::FailedPrecondition,
                "Cannot cancel large file {} in state {state:?}",
                session.file_id
            ));
        }
        self.cancel_by_id(&session.file_id, cancel).await?;
        session.set_state(SessionState::Cancelled);
        Ok(())
    }

    /// Cancels an unfinished large file known only by its id.
    pub async fn cancel_by_id(&self, file_id: &str, cancel: &CancellationToken) -> Result<(), Error> {
        let response: CancelLargeFileResponse = self
            .call(
                "b2_cancel_large_file",
                &FileIdRequest {
                    file_id: file_id.to_string(),
                },
                cancel,
            )
            .await
            .err_tip(|| format!("Cancelling large file {file_id}"))?;
        event!(
            Level::INFO,
            file_id = %response.file_id,
            file_name = %response.file_name,
            "Cancelled large file"
        );
        Ok(())
    }

    /// Lists the unfinished large files of a bucket, following every page.
    pub async fn list_unfinished(
        &self,
        bucket_id: Option<&str>,
        name_prefix: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Vec<UnfinishedLargeFile>, Error> {
        let bucket_id = resolve_bucket(bucket_id, self.default_bucket_id.as_deref())?;
        let mut files = Vec::new();
        let mut start_file_id = None;
        loop {
            let page: ListUnfinishedLargeFilesResponse = self
                .call(
                    "b2_list_unfinished_large_files",
                    &ListUnfinishedLargeFilesRequest {
                        bucket_id: bucket_id.clone(),
                        name_prefix: name_prefix.map(ToString::to_string),
                        start_file_id: start_file_id.take(),
                        max_file_count: LIST_UNFINISHED_PAGE_SIZE,
                    },
                    cancel,
                )
                .await
                .err_tip(|| format!("Listing unfinished large files of {bucket_id}"))?;
            files.extend(page.files.into_iter().map(|file| UnfinishedLargeFile {
                file_id: file.file_id,
                bucket_id: file.bucket_id.unwrap_or_else(|| bucket_id.clone()),
                file_name: file.file_name,
                content_type: file.content_type,
                file_info: file.file_info,
            }));
            match page.next_file_id {
                Some(next) => start_file_id = Some(next),
                None => return Ok(files),
            }
        }
    }

    /// Lists the parts the service holds for an unfinished large file,
    /// following every page.
    pub async fn list_parts(
        &self,
        file_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Part>, Error> {
        let mut parts = Vec::new();
        let mut start_part_number = None;
        loop {
            let page: ListPartsResponse = self
                .call(
                    "b2_list_parts",
                    &ListPartsRequest {
                        file_id: file_id.to_string(),
                        start_part_number: start_part_number.take(),
                        max_part_count: LIST_PARTS_PAGE_SIZE,
                    },
                    cancel,
                )
                .await
                .err_tip(|| format!("Listing parts of large file {file_id}"))?;
            parts.extend(page.parts.into_iter().map(|part| Part {
                number: part.part_number,
                checksum: part.content_sha1,
                byte_length: part.content_length,
            }));
            match page.next_part_number {
                Some(next) => start_part_number = Some(next),
                None => break,
            }
        }
        parts.sort_by_key(|part| part.number);
        Ok(parts)
    }

    /// Rebuilds the session of an unfinished large file from the parts the
    /// service already holds.
    pub async fn resume(
        &self,
        file: &UnfinishedLargeFile,
        cancel: &CancellationToken,
    ) -> Result<Arc<LargeFileSession>, Error> {
        let parts = self.list_parts(&file.file_id, cancel).await?;
        for part in &parts {
            validate_part_number(part.number)
                .err_tip(|| format!("Resuming large file {}", file.file_id))?;
        }
        event!(
            Level::INFO,
            file_id = %file.file_id,
            parts = parts.len(),
            "Resumed large file"
        );
        Ok(Arc::new(LargeFileSession::new(
            file.file_id.clone(),
            file.bucket_id.clone(),
            file.file_name.clone(),
            parts,
        )))
    }

    /// Looks `file_id` up among the unfinished large files of the bucket and
    /// resumes it.
    pub async fn resume_by_id(
        &self,
        bucket_id: Option<&str>,
        file_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<LargeFileSession>, Error> {
        let file = self
            .list_unfinished(bucket_id, None, cancel)
            .await?
            .into_iter()
            .find(|file| file.file_id == file_id)
            .ok_or_else(|| {
                make_err!(
                    Code::NotFound,
                    "No unfinished large file with id {file_id}"
                )
            })?;
        self.resume(&file, cancel).await
    }
}
