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

use std::collections::HashMap;
use std::time::Instant;

use b2link_error::{Error, make_input_err};
use b2link_util::single_flight_cache::SingleFlightCache;
use serde::{Deserialize, Serialize};

/// Lowest part number the service accepts.
pub const MIN_PART_NUMBER: u32 = 1;

/// Highest part number the service accepts.
pub const MAX_PART_NUMBER: u32 = 10_000;

/// Maximum number of custom `fileInfo` entries on one file.
pub const MAX_FILE_INFO_ENTRIES: usize = 10;

/// Path appended to the `apiUrl` returned at authorization time.
pub const API_VERSION_PATH: &str = "/b2api/v2";

/// Content type that lets the service pick one from the file name.
pub const DEFAULT_CONTENT_TYPE: &str = "b2/x-auto";

/// `fileInfo` key under which the SHA1 of a whole large file is stored.
pub const LARGE_FILE_SHA1_INFO: &str = "large_file_sha1";

// Header names are lowercase so they can be used with `HeaderName::from_static`.
pub const HEADER_PART_NUMBER: &str = "x-bz-part-number";
pub const HEADER_CONTENT_SHA1: &str = "x-bz-content-sha1";
pub const HEADER_FILE_NAME: &str = "x-bz-file-name";
pub const HEADER_INFO_PREFIX: &str = "x-bz-info-";

/// Page size used when listing parts of a large file.
pub const LIST_PARTS_PAGE_SIZE: u32 = 1000;

/// Page size used when listing unfinished large files.
pub const LIST_UNFINISHED_PAGE_SIZE: u32 = 100;

/// Remote error code returned when a key id is paired with a secret of the
/// wrong kind (or simply a wrong secret).
pub const UNAUTHORIZED_ERROR_CODE: &str = "unauthorized";

/// Picks the explicit bucket, falling back to the configured default. An
/// empty id counts as missing.
pub fn resolve_bucket(
    bucket_id: Option<&str>,
    default_bucket_id: Option<&str>,
) -> Result<String, Error> {
    bucket_id
        .or(default_bucket_id)
        .filter(|bucket_id| !bucket_id.is_empty())
        .map(ToString::to_string)
        .ok_or_else(|| make_input_err!("No bucket id given and no default bucket id configured"))
}

/// Result of a successful account authorization.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub account_id: String,
    /// `apiUrl` with the API version path appended.
    pub api_base_url: String,
    pub download_base_url: String,
    pub token: String,
    pub min_part_size: u64,
    pub recommended_part_size: u64,
    pub absolute_min_part_size: u64,
}

impl core::fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AuthContext")
            .field("account_id", &self.account_id)
            .field("api_base_url", &self.api_base_url)
            .field("download_base_url", &self.download_base_url)
            .field("recommended_part_size", &self.recommended_part_size)
            .field("absolute_min_part_size", &self.absolute_min_part_size)
            .finish_non_exhaustive()
    }
}

impl AuthContext {
    pub fn api_url(&self, operation: &str) -> String {
        format!("{}/{operation}", self.api_base_url)
    }
}

/// Bucket plus an optional caller chosen lane name. Uploaders sharing a lane
/// share an upload location.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LaneKey {
    pub bucket_id: String,
    pub lane: Option<String>,
}

/// Location regular (non-chunked) uploads to a bucket are sent to.
#[derive(Clone, PartialEq, Eq)]
pub struct UploadLocation {
    pub bucket_id: String,
    pub lane_key: LaneKey,
    pub url: String,
    pub token: String,
}

impl core::fmt::Debug for UploadLocation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("UploadLocation")
            .field("lane_key", &self.lane_key)
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

/// Location the parts of one large file are sent to. Never cached: each
/// concurrent part uploader asks for its own.
#[derive(Clone, PartialEq, Eq)]
pub struct PartUploadLocation {
    pub file_id: String,
    pub url: String,
    pub token: String,
}

impl core::fmt::Debug for PartUploadLocation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PartUploadLocation")
            .field("file_id", &self.file_id)
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

/// A part recorded against a large file session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Part {
    pub number: u32,
    pub checksum: String,
    pub byte_length: u64,
}

/// What a single part upload exchange produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartResult {
    pub checksum: String,
    pub length: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// Keyed by credential identity and the endpoint it was used against.
    Auth { key_id: String, authorize_url: String },
    UploadLocation { key_id: String, lane_key: LaneKey },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CachedValue {
    Auth(AuthContext),
    UploadLocation(UploadLocation),
}

/// The cache shared by the token provider and the upload location pool of a
/// client. Clients constructed with the same cache share their entries.
pub type ClientCache<I = Instant> = SingleFlightCache<CacheKey, CachedValue, I>;

// Wire models.

/// Body of every non-success response.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ErrorBody {
    #[serde(default)]
    pub status: u16,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeAccountResponse {
    pub account_id: String,
    pub api_url: String,
    pub authorization_token: String,
    pub download_url: String,
    pub recommended_part_size: u64,
    pub absolute_minimum_part_size: u64,
    #[serde(default)]
    pub minimum_part_size: Option<u64>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetUploadUrlRequest {
    pub bucket_id: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetUploadUrlResponse {
    #[serde(default)]
    pub bucket_id: Option<String>,
    pub upload_url: String,
    pub authorization_token: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartLargeFileRequest {
    pub bucket_id: String,
    pub file_name: String,
    pub content_type: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub file_info: HashMap<String, String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileIdRequest {
    pub file_id: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetUploadPartUrlResponse {
    pub file_id: String,
    pub upload_url: String,
    pub authorization_token: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadPartResponse {
    pub file_id: String,
    pub part_number: u32,
    pub content_length: u64,
    pub content_sha1: String,
    #[serde(default)]
    pub upload_timestamp: Option<u64>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishLargeFileRequest {
    pub file_id: String,
    pub part_sha1_array: Vec<String>,
}

/// File version as returned by start, finish, upload and listing calls.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileVersion {
    pub file_id: String,
    pub file_name: String,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub bucket_id: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub content_length: Option<u64>,
    #[serde(default)]
    pub content_sha1: Option<String>,
    #[serde(default)]
    pub file_info: HashMap<String, String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub upload_timestamp: Option<u64>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelLargeFileResponse {
    pub file_id: String,
    #[serde(default)]
    pub account_id: Option<String>,
    pub bucket_id: String,
    pub file_name: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListUnfinishedLargeFilesRequest {
    pub bucket_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_file_id: Option<String>,
    pub max_file_count: u32,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListUnfinishedLargeFilesResponse {
    pub files: Vec<FileVersion>,
    #[serde(default)]
    pub next_file_id: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPartsRequest {
    pub file_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_part_number: Option<u32>,
    pub max_part_count: u32,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPartsResponse {
    pub parts: Vec<UploadPartResponse>,
    #[serde(default)]
    pub next_part_number: Option<u32>,
}
