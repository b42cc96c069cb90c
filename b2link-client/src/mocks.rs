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

//! In-memory stand-in for the storage service, used by tests.

use core::time::Duration;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use b2link_error::{Code, Error, make_err};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, HeaderValue};
use http::{HeaderMap, StatusCode};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::part_uploader::sha1_hex;
use crate::transport::{HttpRequest, HttpResponse, Transport};
use crate::types::{
    API_VERSION_PATH, CancelLargeFileResponse, ErrorBody, FileIdRequest, FileVersion,
    FinishLargeFileRequest, GetUploadPartUrlResponse, GetUploadUrlRequest, GetUploadUrlResponse,
    HEADER_CONTENT_SHA1, HEADER_FILE_NAME, HEADER_INFO_PREFIX, HEADER_PART_NUMBER,
    ListPartsRequest, ListPartsResponse, ListUnfinishedLargeFilesRequest,
    ListUnfinishedLargeFilesResponse, MAX_PART_NUMBER, MIN_PART_NUMBER, StartLargeFileRequest,
    UploadPartResponse,
};

pub const MOCK_KEY_ID: &str = "mock-key-id";
pub const MOCK_APPLICATION_KEY: &str = "mock-application-key";
pub const MOCK_ACCOUNT_ID: &str = "mock-account";
pub const MOCK_AUTH_BASE_URL: &str = "https://auth.mock/b2api/v2";
pub const MOCK_API_URL: &str = "https://api.mock";
pub const MOCK_DOWNLOAD_URL: &str = "https://download.mock";
const MOCK_FILE_UPLOAD_URL: &str = "https://upload.mock/file/";
const MOCK_PART_UPLOAD_URL: &str = "https://upload.mock/part/";

pub const AUTHORIZE_ACCOUNT: &str = "b2_authorize_account";
pub const UPLOAD_FILE: &str = "b2_upload_file";
pub const UPLOAD_PART: &str = "b2_upload_part";

type Rejection = (u16, &'static str, String);

/// A scripted failure returned instead of handling the next matching call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MockFailure {
    pub status: u16,
    pub code: String,
    pub message: String,
}

#[derive(Debug)]
struct MockLargeFile {
    bucket_id: String,
    file_name: String,
    content_type: String,
    file_info: HashMap<String, String>,
    // part number -> (sha1, length)
    parts: BTreeMap<u32, (String, u64)>,
}

#[derive(Debug, Default)]
struct MockState {
    counter: u64,
    large_file_counter: u64,
    valid_auth_tokens: HashSet<String>,
    valid_upload_tokens: HashSet<String>,
    unfinished: BTreeMap<String, MockLargeFile>,
    finished: Vec<FileVersion>,
    failures: HashMap<String, VecDeque<MockFailure>>,
    calls: HashMap<String, usize>,
    requests: Vec<HttpRequest>,
}

impl MockState {
    fn next_id(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }
}

/// Fake of the storage service's HTTP API. Keeps large files, parts and
/// tokens in memory, counts calls per operation and can be told to fail the
/// next calls of an operation.
#[derive(Debug)]
pub struct MockTransport {
    key_id: String,
    application_key: String,
    recommended_part_size: u64,
    absolute_min_part_size: u64,
    authorize_delay: Duration,
    state: Mutex<MockState>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new(MOCK_KEY_ID, MOCK_APPLICATION_KEY)
    }
}

impl MockTransport {
    pub fn new(key_id: &str, application_key: &str) -> Self {
        Self {
            key_id: key_id.to_string(),
            application_key: application_key.to_string(),
            recommended_part_size: 100 * 1024 * 1024,
            absolute_min_part_size: 5 * 1024 * 1024,
            authorize_delay: Duration::ZERO,
            state: Mutex::new(MockState::default()),
        }
    }

    #[must_use]
    pub const fn with_part_sizes(mut self, recommended: u64, absolute_minimum: u64) -> Self {
        self.recommended_part_size = recommended;
        self.absolute_min_part_size = absolute_minimum;
        self
    }

    /// Makes every authorization take `delay` before it answers.
    #[must_use]
    pub const fn with_authorize_delay(mut self, delay: Duration) -> Self {
        self.authorize_delay = delay;
        self
    }

    /// Fails the next call of `operation` with the given error body.
    pub fn fail_next(&self, operation: &str, status: u16, code: &str, message: &str) {
        self.state
            .lock()
            .failures
            .entry(operation.to_string())
            .or_default()
            .push_back(MockFailure {
                status,
                code: code.to_string(),
                message: message.to_string(),
            });
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.state.lock().calls.get(operation).copied().unwrap_or(0)
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.state.lock().requests.clone()
    }

    /// Requests sent for `operation`, in order.
    pub fn requests_for(&self, operation: &str) -> Vec<HttpRequest> {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|request| operation_name(&request.url) == operation)
            .cloned()
            .collect()
    }

    /// Rejects every authorization token handed out so far.
    pub fn expire_auth_tokens(&self) {
        self.state.lock().valid_auth_tokens.clear();
    }

    /// Rejects every upload and part upload token handed out so far.
    pub fn expire_upload_tokens(&self) {
        self.state.lock().valid_upload_tokens.clear();
    }

    pub fn unfinished_file_ids(&self) -> Vec<String> {
        self.state.lock().unfinished.keys().cloned().collect()
    }

    /// Part numbers stored for an unfinished large file.
    pub fn stored_parts(&self, file_id: &str) -> Vec<u32> {
        self.state
            .lock()
            .unfinished
            .get(file_id)
            .map(|file| file.parts.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn finished_files(&self) -> Vec<FileVersion> {
        self.state.lock().finished.clone()
    }

    fn handle(&self, state: &mut MockState, operation: &str, request: &HttpRequest) -> Result<Bytes, Rejection> {
        match operation {
            AUTHORIZE_ACCOUNT => self.authorize(state, request),
            UPLOAD_PART => upload_part(state, request),
            UPLOAD_FILE => upload_file(state, request),
            _ => {
                let token = header(&request.headers, AUTHORIZATION.as_str());
                if !state.valid_auth_tokens.contains(&token) {
                    return Err((401, "expired_auth_token", "Authorization token expired".into()));
                }
                match operation {
                    "b2_get_upload_url" => get_upload_url(state, parse(request)?),
                    "b2_start_large_file" => start_large_file(state, parse(request)?),
                    "b2_get_upload_part_url" => get_upload_part_url(state, parse(request)?),
                    "b2_finish_large_file" => finish_large_file(state, parse(request)?),
                    "b2_cancel_large_file" => cancel_large_file(state, parse(request)?),
                    "b2_list_unfinished_large_files" => list_unfinished(state, parse(request)?),
                    "b2_list_parts" => list_parts(state, parse(request)?),
                    "b2_get_file_info" => get_file_info(state, parse(request)?),
                    _ => Err((404, "not_found", format!("Unknown operation {operation}"))),
                }
            }
        }
    }

    fn authorize(&self, state: &mut MockState, request: &HttpRequest) -> Result<Bytes, Rejection> {
        let expected = format!(
            "Basic {}",
            STANDARD.encode(format!("{}:{}", self.key_id, self.application_key))
        );
        if header(&request.headers, AUTHORIZATION.as_str()) != expected {
            return Err((401, "unauthorized", String::new()));
        }
        let token = format!("auth-token-{}", state.next_id());
        state.valid_auth_tokens.insert(token.clone());
        to_body(&json!({
            "accountId": MOCK_ACCOUNT_ID,
            "apiUrl": MOCK_API_URL,
            "authorizationToken": token,
            "downloadUrl": MOCK_DOWNLOAD_URL,
            "recommendedPartSize": self.recommended_part_size,
            "absoluteMinimumPartSize": self.absolute_min_part_size,
            "minimumPartSize": self.recommended_part_size,
        }))
    }
}

/// Name of the operation a request targets, as used by `fail_next` and
/// `call_count`.
pub fn operation_name(url: &str) -> &str {
    if url.starts_with(MOCK_FILE_UPLOAD_URL) {
        return UPLOAD_FILE;
    }
    if url.starts_with(MOCK_PART_UPLOAD_URL) {
        return UPLOAD_PART;
    }
    url.rsplit('/').next().unwrap_or(url)
}

fn header(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn parse<T: DeserializeOwned>(request: &HttpRequest) -> Result<T, Rejection> {
    serde_json::from_slice(&request.body)
        .map_err(|e| (400, "bad_request", format!("Invalid request body: {e}")))
}

fn to_body<T: Serialize>(value: &T) -> Result<Bytes, Rejection> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| (500, "internal_error", e.to_string()))
}

fn get_upload_url(state: &mut MockState, request: GetUploadUrlRequest) -> Result<Bytes, Rejection> {
    let id = state.next_id();
    let token = format!("upload-token-{id}");
    state.valid_upload_tokens.insert(token.clone());
    to_body(&GetUploadUrlResponse {
        upload_url: format!("{MOCK_FILE_UPLOAD_URL}{}/{id}", request.bucket_id),
        bucket_id: Some(request.bucket_id),
        authorization_token: token,
    })
}

fn start_large_file(state: &mut MockState, request: StartLargeFileRequest) -> Result<Bytes, Rejection> {
    state.large_file_counter += 1;
    let file_id = format!("F{}", state.large_file_counter);
    let response = FileVersion {
        file_id: file_id.clone(),
        file_name: request.file_name.clone(),
        account_id: Some(MOCK_ACCOUNT_ID.to_string()),
        bucket_id: Some(request.bucket_id.clone()),
        content_type: Some(request.content_type.clone()),
        file_info: request.file_info.clone(),
        action: Some("start".to_string()),
        ..FileVersion::default()
    };
    state.unfinished.insert(
        file_id,
        MockLargeFile {
            bucket_id: request.bucket_id,
            file_name: request.file_name,
            content_type: request.content_type,
            file_info: request.file_info,
            parts: BTreeMap::new(),
        },
    );
    to_body(&response)
}

fn get_upload_part_url(state: &mut MockState, request: FileIdRequest) -> Result<Bytes, Rejection> {
    if !state.unfinished.contains_key(&request.file_id) {
        return Err((400, "bad_request", format!("No active upload for {}", request.file_id)));
    }
    let id = state.next_id();
    let token = format!("part-token-{id}");
    state.valid_upload_tokens.insert(token.clone());
    to_body(&GetUploadPartUrlResponse {
        upload_url: format!("{MOCK_PART_UPLOAD_URL}{}/{id}", request.file_id),
        file_id: request.file_id,
        authorization_token: token,
    })
}

fn check_upload_token(state: &MockState, request: &HttpRequest) -> Result<(), Rejection> {
    let token = header(&request.headers, AUTHORIZATION.as_str());
    if state.valid_upload_tokens.contains(&token) {
        Ok(())
    } else {
        Err((401, "expired_auth_token", "Upload token expired".into()))
    }
}

fn check_sha1(request: &HttpRequest) -> Result<String, Rejection> {
    let sha1 = header(&request.headers, HEADER_CONTENT_SHA1);
    if sha1 != sha1_hex(&request.body) {
        return Err((400, "bad_request", "Sha1 did not match data received".into()));
    }
    let length = header(&request.headers, CONTENT_LENGTH.as_str());
    if length != request.body.len().to_string() {
        return Err((400, "bad_request", "Content-Length did not match data received".into()));
    }
    Ok(sha1)
}

fn upload_part(state: &mut MockState, request: &HttpRequest) -> Result<Bytes, Rejection> {
    check_upload_token(state, request)?;
    let file_id = request
        .url
        .trim_start_matches(MOCK_PART_UPLOAD_URL)
        .split('/')
        .next()
        .unwrap_or_default()
        .to_string();
    let part_number: u32 = header(&request.headers, HEADER_PART_NUMBER)
        .parse()
        .map_err(|_| (400, "bad_request", "Missing part number".to_string()))?;
    if !(MIN_PART_NUMBER..=MAX_PART_NUMBER).contains(&part_number) {
        return Err((400, "bad_request", format!("Invalid part number {part_number}")));
    }
    let sha1 = check_sha1(request)?;
    let length = request.body.len() as u64;
    let file = state
        .unfinished
        .get_mut(&file_id)
        .ok_or_else(|| (400, "bad_request", format!("No active upload for {file_id}")))?;
    file.parts.insert(part_number, (sha1.clone(), length));
    to_body(&UploadPartResponse {
        file_id,
        part_number,
        content_length: length,
        content_sha1: sha1,
        upload_timestamp: None,
    })
}

fn upload_file(state: &mut MockState, request: &HttpRequest) -> Result<Bytes, Rejection> {
    check_upload_token(state, request)?;
    let bucket_id = request
        .url
        .trim_start_matches(MOCK_FILE_UPLOAD_URL)
        .split('/')
        .next()
        .unwrap_or_default()
        .to_string();
    let file_name = urlencoding::decode(&header(&request.headers, HEADER_FILE_NAME))
        .map_err(|e| (400, "bad_request", e.to_string()))?
        .into_owned();
    let sha1 = check_sha1(request)?;
    let file_info = request
        .headers
        .iter()
        .filter_map(|(name, value)| {
            let key = name.as_str().strip_prefix(HEADER_INFO_PREFIX)?;
            let value = urlencoding::decode(value.to_str().ok()?).ok()?;
            Some((key.to_string(), value.into_owned()))
        })
        .collect();
    let file = FileVersion {
        file_id: format!("S{}", state.next_id()),
        file_name,
        account_id: Some(MOCK_ACCOUNT_ID.to_string()),
        bucket_id: Some(bucket_id),
        content_type: Some(header(&request.headers, CONTENT_TYPE.as_str())),
        content_length: Some(request.body.len() as u64),
        content_sha1: Some(sha1),
        file_info,
        action: Some("upload".to_string()),
        upload_timestamp: None,
    };
    state.finished.push(file.clone());
    to_body(&file)
}

fn finish_large_file(state: &mut MockState, request: FinishLargeFileRequest) -> Result<Bytes, Rejection> {
    let file = state
        .unfinished
        .get(&request.file_id)
        .ok_or_else(|| (400, "bad_request", format!("No active upload for {}", request.file_id)))?;
    let contiguous = file.parts.keys().copied().eq(1..=file.parts.len() as u32);
    let checksums: Vec<&String> = file.parts.values().map(|(sha1, _)| sha1).collect();
    let matches = checksums.len() == request.part_sha1_array.len()
        && checksums
            .iter()
            .zip(&request.part_sha1_array)
            .all(|(stored, given)| *stored == given);
    if !contiguous || !matches {
        return Err((400, "bad_request", "Part sha1 array does not match the uploaded parts".into()));
    }
    let Some(file) = state.unfinished.remove(&request.file_id) else {
        return Err((400, "bad_request", format!("No active upload for {}", request.file_id)));
    };
    let finished = FileVersion {
        file_id: request.file_id,
        file_name: file.file_name,
        account_id: Some(MOCK_ACCOUNT_ID.to_string()),
        bucket_id: Some(file.bucket_id),
        content_type: Some(file.content_type),
        content_length: Some(file.parts.values().map(|(_, length)| length).sum()),
        content_sha1: Some("none".to_string()),
        file_info: file.file_info,
        action: Some("upload".to_string()),
        upload_timestamp: None,
    };
    state.finished.push(finished.clone());
    to_body(&finished)
}

fn get_file_info(state: &MockState, request: FileIdRequest) -> Result<Bytes, Rejection> {
    let file = state
        .finished
        .iter()
        .find(|file| file.file_id == request.file_id)
        .ok_or_else(|| (404, "not_found", format!("No file with id {}", request.file_id)))?;
    to_body(file)
}

fn cancel_large_file(state: &mut MockState, request: FileIdRequest) -> Result<Bytes, Rejection> {
    let file = state
        .unfinished
        .remove(&request.file_id)
        .ok_or_else(|| (400, "bad_request", format!("No active upload for {}", request.file_id)))?;
    to_body(&CancelLargeFileResponse {
        file_id: request.file_id,
        account_id: Some(MOCK_ACCOUNT_ID.to_string()),
        bucket_id: file.bucket_id,
        file_name: file.file_name,
    })
}

fn list_unfinished(
    state: &MockState,
    request: ListUnfinishedLargeFilesRequest,
) -> Result<Bytes, Rejection> {
    let max = request.max_file_count.max(1) as usize;
    let mut files: Vec<FileVersion> = state
        .unfinished
        .iter()
        .filter(|(file_id, file)| {
            file.bucket_id == request.bucket_id
                && request
                    .start_file_id
                    .as_ref()
                    .is_none_or(|start| *file_id >= start)
                && request
                    .name_prefix
                    .as_ref()
                    .is_none_or(|prefix| file.file_name.starts_with(prefix.as_str()))
        })
        .take(max + 1)
        .map(|(file_id, file)| FileVersion {
            file_id: file_id.clone(),
            file_name: file.file_name.clone(),
            account_id: Some(MOCK_ACCOUNT_ID.to_string()),
            bucket_id: Some(file.bucket_id.clone()),
            content_type: Some(file.content_type.clone()),
            file_info: file.file_info.clone(),
            action: Some("start".to_string()),
            ..FileVersion::default()
        })
        .collect();
    let next_file_id = if files.len() > max {
        files.pop().map(|file| file.file_id)
    } else {
        None
    };
    to_body(&ListUnfinishedLargeFilesResponse {
        files,
        next_file_id,
    })
}

fn list_parts(state: &MockState, request: ListPartsRequest) -> Result<Bytes, Rejection> {
    let file = state
        .unfinished
        .get(&request.file_id)
        .ok_or_else(|| (400, "bad_request", format!("No active upload for {}", request.file_id)))?;
    let max = request.max_part_count.max(1) as usize;
    let mut parts: Vec<UploadPartResponse> = file
        .parts
        .range(request.start_part_number.unwrap_or(MIN_PART_NUMBER)..)
        .take(max + 1)
        .map(|(number, (sha1, length))| UploadPartResponse {
            file_id: request.file_id.clone(),
            part_number: *number,
            content_length: *length,
            content_sha1: sha1.clone(),
            upload_timestamp: None,
        })
        .collect();
    let next_part_number = if parts.len() > max {
        parts.pop().map(|part| part.part_number)
    } else {
        None
    };
    to_body(&ListPartsResponse {
        parts,
        next_part_number,
    })
}

fn response(status: u16, body: Bytes) -> Result<HttpResponse, Error> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(HttpResponse {
        status: StatusCode::from_u16(status)
            .map_err(|e| make_err!(Code::Internal, "Invalid mock status {status}: {e}"))?,
        headers,
        body,
    })
}

fn error_response(status: u16, code: &str, message: String) -> Result<HttpResponse, Error> {
    let body = serde_json::to_vec(&ErrorBody {
        status,
        code: code.to_string(),
        message,
    })?;
    response(status, Bytes::from(body))
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, Error> {
        let operation = operation_name(&request.url).to_string();
        {
            let mut state = self.state.lock();
            state.requests.push(request.clone());
            *state.calls.entry(operation.clone()).or_default() += 1;
        }
        if operation == AUTHORIZE_ACCOUNT && !self.authorize_delay.is_zero() {
            tokio::time::sleep(self.authorize_delay).await;
        }

        let mut state = self.state.lock();
        if let Some(failure) = state
            .failures
            .get_mut(&operation)
            .and_then(VecDeque::pop_front)
        {
            return error_response(failure.status, &failure.code, failure.message);
        }
        match self.handle(&mut state, &operation, &request) {
            Ok(body) => response(200, body),
            Err((status, code, message)) => error_response(status, code, message),
        }
    }
}

/// Url of an API operation as the client computes it from the mock's
/// authorization.
pub fn api_url(operation: &str) -> String {
    format!("{MOCK_API_URL}{API_VERSION_PATH}/{operation}")
}
