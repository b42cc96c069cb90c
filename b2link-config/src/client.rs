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

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::serde_utils::{
    convert_data_size_with_shellexpand, convert_duration_with_shellexpand,
    convert_numeric_with_shellexpand, convert_optional_string_with_shellexpand,
    convert_string_with_shellexpand,
};

/// Default location of the account authorization endpoint.
pub const DEFAULT_AUTH_BASE_URL: &str = "https://api.backblazeb2.com/b2api/v2";

/// Configuration of a storage client.
///
/// **Example JSON Config:**
/// ```json
/// {
///   "key_id": "${B2_KEY_ID}",
///   "application_key": "${B2_APPLICATION_KEY}",
///   "default_bucket_id": "4a48fe8875c6214145260818",
///   "request_timeout": "100s",
///   "upload": {
///     "part_size": "100MB",
///     "max_concurrent_part_uploads": 4,
///     "retry": { "max_retries": 3, "delay": 1.0, "jitter": 0.5 }
///   }
/// }
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct ClientSpec {
    /// Identifier of the key used to authorize the account. Either the
    /// account id (primary key) or an application key id.
    #[serde(default, deserialize_with = "convert_string_with_shellexpand")]
    pub key_id: String,

    /// Secret paired with `key_id`.
    #[serde(default, deserialize_with = "convert_string_with_shellexpand")]
    pub application_key: String,

    /// Base url of the authorization service.
    ///
    /// Default: <https://api.backblazeb2.com/b2api/v2>
    #[serde(default, deserialize_with = "convert_optional_string_with_shellexpand")]
    pub auth_base_url: Option<String>,

    /// Bucket used when an operation is not given an explicit bucket id.
    #[serde(default, deserialize_with = "convert_optional_string_with_shellexpand")]
    pub default_bucket_id: Option<String>,

    /// Timeout applied to every request sent to the service.
    ///
    /// Default: 100s
    #[serde(default, deserialize_with = "convert_duration_with_shellexpand")]
    pub request_timeout: u64,

    /// Lifetimes of cached authorization and upload locations.
    #[serde(default)]
    pub cache: CacheSpec,

    /// Settings used when uploading whole files as large files.
    #[serde(default)]
    pub upload: LargeFileUploadSpec,

    /// Allow unencrypted HTTP connections. Only use this for local testing.
    ///
    /// Default: false
    #[serde(default)]
    pub insecure_allow_http: bool,

    /// Disable http/2 connections and only use http/1.1.
    ///
    /// Default: false
    #[serde(default)]
    pub disable_http2: bool,
}

/// Cached values are a soft optimization: the service may reject a cached
/// token or upload location before the local lifetime runs out, and callers
/// must refresh in that case.
///
/// Any value left at zero falls back to the client's default.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default)]
#[serde(deny_unknown_fields)]
pub struct CacheSpec {
    /// Added to `request_timeout` to bound how long a caller waits for
    /// another caller's authorization to finish.
    ///
    /// Default: 5s
    #[serde(default, deserialize_with = "convert_duration_with_shellexpand")]
    pub auth_lock_wait_buffer: u64,

    /// How long an account authorization is reused.
    ///
    /// Default: 0.95 of a day
    #[serde(default, deserialize_with = "convert_duration_with_shellexpand")]
    pub auth_ttl: u64,

    /// How long a caller waits for another caller's upload location
    /// request to finish.
    ///
    /// Default: 2m
    #[serde(default, deserialize_with = "convert_duration_with_shellexpand")]
    pub upload_location_lock_wait: u64,

    /// How long an upload location is reused.
    ///
    /// Default: 0.9 of a day
    #[serde(default, deserialize_with = "convert_duration_with_shellexpand")]
    pub upload_location_ttl: u64,

    /// Slack added on top of every lock wait.
    ///
    /// Default: 1s
    #[serde(default, deserialize_with = "convert_duration_with_shellexpand")]
    pub lock_grace: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct LargeFileUploadSpec {
    /// Size of every part except the last one. Zero uses the part size
    /// recommended by the service at authorization time. Values below the
    /// service's absolute minimum part size are raised to it.
    ///
    /// Default: 0
    #[serde(default, deserialize_with = "convert_data_size_with_shellexpand")]
    pub part_size: u64,

    /// Maximum number of parts of one file uploaded at the same time.
    ///
    /// Default: 4
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub max_concurrent_part_uploads: usize,

    /// Retry policy applied to each part upload.
    #[serde(default)]
    pub retry: Retry,
}

/// Retry configuration. This configuration is exponential and each iteration
/// a jitter as a percentage is applied of the calculated delay. For example:
/// ```haskell
/// Retry{
///   max_retries: 7,
///   delay: 0.1,
///   jitter: 0.5,
/// }
/// ```
/// will result in:
/// Attempt - Delay
/// 1         0ms
/// 2         75ms - 125ms
/// 3         150ms - 250ms
/// 4         300ms - 500ms
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct Retry {
    /// Maximum number of retries until retrying stops.
    /// Setting this to zero will always attempt 1 time, but not retry.
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub max_retries: usize,

    /// Delay in seconds for exponential back off.
    #[serde(default)]
    pub delay: f32,

    /// Amount of jitter to add as a percentage in decimal form.
    #[serde(default)]
    pub jitter: f32,

    /// A list of error codes to retry on, if this is not set then the default
    /// error codes to retry on are used. These default codes are the most
    /// likely to be non-permanent.
    ///  - `Unknown`
    ///  - `DeadlineExceeded`
    ///  - `ResourceExhausted`
    ///  - `Aborted`
    ///  - `Unavailable`
    ///  - `Unauthenticated`
    #[serde(default)]
    pub retry_on_errors: Option<Vec<ErrorCode>>,
}

impl Retry {
    pub fn make_jitter_fn(&self) -> Arc<dyn Fn(Duration) -> Duration + Send + Sync> {
        if self.jitter == 0f32 {
            Arc::new(move |delay: Duration| delay)
        } else {
            let local_jitter = self.jitter;
            Arc::new(move |delay: Duration| {
                delay.mul_f32(local_jitter.mul_add(rand::rng().random::<f32>() - 0.5, 1.))
            })
        }
    }
}

/// The possible error codes that might occur on an upstream request.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
    // Note: This list is duplicated from b2link-error/lib.rs.
}
