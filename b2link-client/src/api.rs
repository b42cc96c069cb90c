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

use b2link_error::{Code, Error, ResultExt, make_err};
use b2link_util::task::cancellable;
use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_TYPE, HeaderValue};
use http::Method;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::transport::{HttpRequest, HttpResponse, Transport};
use crate::types::ErrorBody;

/// Builds an authorized JSON `POST` for one of the service's API calls.
pub fn json_request<B: Serialize>(url: String, token: &str, body: &B) -> Result<HttpRequest, Error> {
    let mut request = HttpRequest::new(Method::POST, url);
    request
        .headers
        .insert(AUTHORIZATION, HeaderValue::from_str(token)?);
    request
        .headers
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    request.body = Bytes::from(serde_json::to_vec(body)?);
    Ok(request)
}

/// Sends a JSON API call and decodes its response.
pub async fn post_json<B, R>(
    transport: &dyn Transport,
    url: String,
    token: &str,
    body: &B,
    cancel: &CancellationToken,
    what: &str,
) -> Result<R, Error>
where
    B: Serialize + Sync,
    R: DeserializeOwned,
{
    let request = json_request(url, token, body).err_tip(|| format!("Building {what}"))?;
    let response = cancellable(cancel, what, transport.send(request)).await?;
    decode_response(&response, what)
}

/// Decodes a success body, or turns anything else into a remote error.
pub fn decode_response<R: DeserializeOwned>(response: &HttpResponse, what: &str) -> Result<R, Error> {
    if !response.status.is_success() {
        return Err(remote_error(response, what));
    }
    serde_json::from_slice(&response.body).err_tip(|| format!("Decoding response of {what}"))
}

/// Parses the `{status, code, message}` body of a failed call, if it has one.
pub fn decode_error_body(response: &HttpResponse) -> Option<ErrorBody> {
    serde_json::from_slice::<ErrorBody>(&response.body)
        .ok()
        .filter(|body| !body.code.is_empty())
}

/// Error for a non-success response. The code follows the HTTP status.
pub fn remote_error(response: &HttpResponse, what: &str) -> Error {
    let status = response.status.as_u16();
    let code = Code::from_http_status(status);
    match decode_error_body(response) {
        Some(body) => make_err!(
            code,
            "{what} failed with status {status}: {} ({})",
            body.code,
            body.message
        ),
        None => make_err!(
            code,
            "{what} failed with status {status}: {}",
            response.body_text()
        ),
    }
}
