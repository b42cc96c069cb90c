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
use std::sync::Arc;

use b2link_error::{Code, Error, ResultExt, error_if, make_err};
use b2link_util::task::cancellable;
use bytes::Bytes;
use http::Method;
use http::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, HeaderName, HeaderValue};
use sha1::{Digest, Sha1};
use tokio_util::sync::CancellationToken;
use tracing::{Level, event};

use crate::api::decode_response;
use crate::transport::{HttpRequest, Transport};
use crate::types::{
    DEFAULT_CONTENT_TYPE, FileVersion, HEADER_CONTENT_SHA1, HEADER_FILE_NAME, HEADER_INFO_PREFIX,
    HEADER_PART_NUMBER, MAX_FILE_INFO_ENTRIES, MAX_PART_NUMBER, MIN_PART_NUMBER, PartResult,
    PartUploadLocation, UploadLocation, UploadPartResponse,
};

/// Rejects part numbers the service would refuse.
pub fn validate_part_number(part_number: u32) -> Result<(), Error> {
    error_if!(
        !(MIN_PART_NUMBER..=MAX_PART_NUMBER).contains(&part_number),
        "Part number {part_number} is outside of [{MIN_PART_NUMBER}, {MAX_PART_NUMBER}]"
    );
    Ok(())
}

pub fn validate_file_info(file_info: &HashMap<String, String>) -> Result<(), Error> {
    error_if!(
        file_info.len() > MAX_FILE_INFO_ENTRIES,
        "At most {MAX_FILE_INFO_ENTRIES} file info entries are allowed, got {}",
        file_info.len()
    );
    for key in file_info.keys() {
        error_if!(
            key.is_empty() || !key.bytes().all(|b| b.is_ascii_alphanumeric() || b"-_.".contains(&b)),
            "Invalid file info key {key:?}"
        );
    }
    Ok(())
}

/// Hex encoded SHA1 of `data`, the checksum the service verifies.
pub fn sha1_hex(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

/// Percent-encodes a file name for the `X-Bz-File-Name` header. Slashes
/// are kept as they are.
pub fn encode_file_name(file_name: &str) -> String {
    urlencoding::encode(file_name).replace("%2F", "/")
}

/// Single upload exchanges: one part of a large file, or one whole small
/// file. Holds no state and is safe to share between concurrent uploads.
#[derive(Debug, Clone)]
pub struct PartUploader {
    transport: Arc<dyn Transport>,
}

impl PartUploader {
    pub const fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub async fn upload_part(
        &self,
        location: &PartUploadLocation,
        part_number: u32,
        data: Bytes,
        cancel: &CancellationToken,
    ) -> Result<PartResult, Error> {
        validate_part_number(part_number)?;
        let checksum = sha1_hex(&data);
        let length = data.len() as u64;

        let mut request = HttpRequest::new(Method::POST, location.url.clone());
        request
            .headers
            .insert(AUTHORIZATION, HeaderValue::from_str(&location.token)?);
        request.headers.insert(
            HeaderName::from_static(HEADER_PART_NUMBER),
            HeaderValue::from(part_number),
        );
        request.headers.insert(
            HeaderName::from_static(HEADER_CONTENT_SHA1),
            HeaderValue::from_str(&checksum)?,
        );
        request
            .headers
            .insert(CONTENT_LENGTH, HeaderValue::from(length));
        request.body = data;

        let response = cancellable(cancel, "b2_upload_part", self.transport.send(request))
            .await
            .err_tip(|| format!("Uploading part {part_number} of {}", location.file_id))?;
        let response: UploadPartResponse = decode_response(&response, "b2_upload_part")
            .err_tip(|| format!("Uploading part {part_number} of {}", location.file_id))?;

        if response.part_number != part_number
            || !response.content_sha1.eq_ignore_ascii_case(&checksum)
            || response.content_length != length
        {
            return Err(make_err!(
                Code::DataLoss,
                "Service recorded part {} ({} bytes, sha1 {}) for part {part_number} ({length} bytes, sha1 {checksum}) of {}",
                response.part_number,
                response.content_length,
                response.content_sha1,
                location.file_id
            ));
        }

        event!(
            Level::DEBUG,
            file_id = %location.file_id,
            part_number,
            length,
            "Uploaded part"
        );
        Ok(PartResult { checksum, length })
    }

    /// Uploads a whole file in one request to a regular upload location.
    pub async fn upload_file(
        &self,
        location: &UploadLocation,
        file_name: &str,
        content_type: Option<&str>,
        file_info: &HashMap<String, String>,
        data: Bytes,
        cancel: &CancellationToken,
    ) -> Result<FileVersion, Error> {
        error_if!(file_name.is_empty(), "File name must not be empty");
        validate_file_info(file_info)?;
        let checksum = sha1_hex(&data);

        let mut request = HttpRequest::new(Method::POST, location.url.clone());
        request
            .headers
            .insert(AUTHORIZATION, HeaderValue::from_str(&location.token)?);
        request.headers.insert(
            HeaderName::from_static(HEADER_FILE_NAME),
            HeaderValue::from_str(&encode_file_name(file_name))?,
        );
        request.headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_str(content_type.unwrap_or(DEFAULT_CONTENT_TYPE))?,
        );
        request.headers.insert(
            HeaderName::from_static(HEADER_CONTENT_SHA1),
            HeaderValue::from_str(&checksum)?,
        );
        request
            .headers
            .insert(CONTENT_LENGTH, HeaderValue::from(data.len()));
        for (key, value) in file_info {
            let name = HeaderName::from_bytes(format!("{HEADER_INFO_PREFIX}{key}").as_bytes())
                .map_err(|e| make_err!(Code::InvalidArgument, "Invalid file info key {key:?}: {e}"))?;
            request
                .headers
                .insert(name, HeaderValue::from_str(&urlencoding::encode(value))?);
        }
        request.body = data;

        let response = cancellable(cancel, "b2_upload_file", self.transport.send(request))
            .await
            .err_tip(|| format!("Uploading {file_name}"))?;
        let file: FileVersion =
            decode_response(&response, "b2_upload_file").err_tip(|| format!("Uploading {file_name}"))?;

        event!(Level::INFO, file_id = %file.file_id, file_name, "Uploaded file");
        Ok(file)
    }
}
