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

use core::fmt::Debug;
use core::time::Duration;

use async_trait::async_trait;
use b2link_config::client::ClientSpec;
use b2link_error::{Code, Error, ResultExt, make_err, make_input_err};
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client as LegacyClient;
use hyper_util::client::legacy::connect::HttpConnector as LegacyHttpConnector;
use hyper_util::rt::TokioExecutor;
use tracing::{Level, event};

/// Default timeout of a single request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(100);

// Default idle timeout
const IDLE_TIMEOUT: Duration = Duration::from_secs(15);

// Maximum number of idle connections per host
const MAX_IDLE_PER_HOST: usize = 32;

#[derive(Clone, Debug)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Sends one request and returns the full response. Any status is a
/// successful exchange; only failures to talk to the remote side are errors.
#[async_trait]
pub trait Transport: Debug + Send + Sync + 'static {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, Error>;
}

#[derive(Clone)]
pub struct HyperTransport {
    client: LegacyClient<HttpsConnector<LegacyHttpConnector>, Full<Bytes>>,
    request_timeout: Duration,
}

impl Debug for HyperTransport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HyperTransport")
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl HyperTransport {
    pub fn new(spec: &ClientSpec) -> Result<Self, Error> {
        let connector_with_roots = HttpsConnectorBuilder::new().with_platform_verifier();

        let connector_with_schemes = if spec.insecure_allow_http {
            connector_with_roots.https_or_http()
        } else {
            connector_with_roots.https_only()
        };

        let connector = if spec.disable_http2 {
            connector_with_schemes.enable_http1().build()
        } else {
            connector_with_schemes.enable_http1().enable_http2().build()
        };

        let client = LegacyClient::builder(TokioExecutor::new())
            .pool_idle_timeout(IDLE_TIMEOUT)
            .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
            .build(connector);

        let request_timeout = if spec.request_timeout == 0 {
            DEFAULT_REQUEST_TIMEOUT
        } else {
            Duration::from_secs(spec.request_timeout)
        };

        Ok(Self {
            client,
            request_timeout,
        })
    }

    fn build(request: HttpRequest) -> Result<hyper::Request<Full<Bytes>>, Error> {
        let uri: Uri = request
            .url
            .parse()
            .map_err(|e| make_input_err!("Invalid url {}: {e}", request.url))?;
        let mut req_builder = hyper::Request::builder().method(request.method).uri(uri);
        if let Some(headers) = req_builder.headers_mut() {
            headers.extend(request.headers);
        }
        Ok(req_builder.body(Full::new(request.body))?)
    }
}

#[async_trait]
impl Transport for HyperTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, Error> {
        let method = request.method.clone();
        let url = request.url.clone();
        let hyper_request = Self::build(request)?;

        let exchange = async {
            let response = self
                .client
                .request(hyper_request)
                .await
                .map_err(|e| make_err!(Code::Unavailable, "Request failed: {e:?}"))?;
            let (parts, body) = response.into_parts();
            let body = body
                .collect()
                .await
                .map_err(|e| make_err!(Code::Unavailable, "Failed to read response body: {e}"))?
                .to_bytes();
            Ok::<_, Error>(HttpResponse {
                status: parts.status,
                headers: parts.headers,
                body,
            })
        };

        let response = tokio::time::timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| {
                make_err!(
                    Code::Unavailable,
                    "Request timed out after {:?}",
                    self.request_timeout
                )
            })?
            .err_tip(|| format!("{method} {url}"))?;

        event!(Level::TRACE, %method, %url, status = %response.status, "Received response");
        Ok(response)
    }
}
