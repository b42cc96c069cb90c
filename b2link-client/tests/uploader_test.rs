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

use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use b2link_client::client::B2Client;
use b2link_client::mocks::{
    AUTHORIZE_ACCOUNT, MOCK_APPLICATION_KEY, MOCK_AUTH_BASE_URL, MOCK_KEY_ID, MockTransport,
    UPLOAD_FILE, UPLOAD_PART, operation_name,
};
use b2link_client::part_uploader::sha1_hex;
use b2link_client::transport::{HttpRequest, HttpResponse, Transport};
use b2link_client::types::LARGE_FILE_SHA1_INFO;
use b2link_client::uploader::{UploadRequest, read_chunk};
use b2link_config::client::{ClientSpec, LargeFileUploadSpec, Retry};
use b2link_error::{Code, Error, make_err};
use b2link_macro::b2link_test;
use bytes::Bytes;
use pretty_assertions::assert_eq;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

const BUCKET: &str = "bucket-1";
const START: &str = "b2_start_large_file";
const GET_UPLOAD_URL: &str = "b2_get_upload_url";
const GET_UPLOAD_PART_URL: &str = "b2_get_upload_part_url";
const CANCEL: &str = "b2_cancel_large_file";
const FINISH: &str = "b2_finish_large_file";

fn client_spec(part_size: u64, max_retries: usize) -> ClientSpec {
    ClientSpec {
        key_id: MOCK_KEY_ID.to_string(),
        application_key: MOCK_APPLICATION_KEY.to_string(),
        auth_base_url: Some(MOCK_AUTH_BASE_URL.to_string()),
        default_bucket_id: Some(BUCKET.to_string()),
        upload: LargeFileUploadSpec {
            part_size,
            max_concurrent_part_uploads: 3,
            retry: Retry {
                max_retries,
                delay: 0.,
                jitter: 0.,
                retry_on_errors: None,
            },
        },
        ..ClientSpec::default()
    }
}

/// Service that recommends 10 byte parts and accepts 5 byte parts.
fn setup(part_size: u64, max_retries: usize) -> (Arc<MockTransport>, B2Client) {
    let transport = Arc::new(MockTransport::default().with_part_sizes(10, 5));
    let client = B2Client::with_transport(&client_spec(part_size, max_retries), transport.clone());
    (transport, client)
}

/// Forwards everything to the mock service but loses the response to the
/// first successful request of `operation`, like a connection reset after
/// the service applied it.
#[derive(Debug)]
struct LostResponseTransport {
    service: Arc<MockTransport>,
    operation: &'static str,
    lost: AtomicBool,
}

impl LostResponseTransport {
    fn new(service: Arc<MockTransport>, operation: &'static str) -> Self {
        Self {
            service,
            operation,
            lost: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Transport for LostResponseTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, Error> {
        let targeted = operation_name(&request.url) == self.operation;
        let response = self.service.send(request).await?;
        if targeted && response.status.is_success() && !self.lost.swap(true, Ordering::Relaxed) {
            return Err(make_err!(
                Code::Unavailable,
                "Connection reset while reading the response to {}",
                self.operation
            ));
        }
        Ok(response)
    }
}

fn request(file_name: &str) -> UploadRequest {
    UploadRequest {
        file_name: file_name.to_string(),
        ..UploadRequest::default()
    }
}

#[b2link_test]
async fn content_within_one_part_is_uploaded_in_one_request() -> Result<(), Error> {
    let (transport, client) = setup(0, 0);
    let request = UploadRequest {
        file_name: "docs/read me.txt".to_string(),
        content_type: Some("text/plain".to_string()),
        file_info: HashMap::from([("author".to_string(), "jane doe".to_string())]),
        lane: Some("docs".to_string()),
        ..UploadRequest::default()
    };
    let data = b"exactly10!";

    let file = client
        .upload(&request, &data[..], &CancellationToken::new())
        .await?;

    assert_eq!(file.file_name, "docs/read me.txt");
    assert_eq!(file.content_length, Some(10));
    assert_eq!(file.content_sha1, Some(sha1_hex(data)));
    assert_eq!(file.content_type.as_deref(), Some("text/plain"));
    assert_eq!(file.file_info.get("author").map(String::as_str), Some("jane doe"));
    assert_eq!(transport.call_count(UPLOAD_FILE), 1);
    assert_eq!(transport.call_count(START), 0);

    let sent = &transport.requests_for(UPLOAD_FILE)[0];
    assert_eq!(
        sent.headers.get("x-bz-file-name").map(|v| v.as_bytes().to_vec()),
        Some(b"docs/read%20me.txt".to_vec())
    );
    Ok(())
}

#[b2link_test]
async fn empty_content_is_uploaded_as_empty_file() -> Result<(), Error> {
    let (transport, client) = setup(0, 0);

    let file = client
        .upload(&request("empty"), &b""[..], &CancellationToken::new())
        .await?;

    assert_eq!(file.content_length, Some(0));
    assert_eq!(transport.call_count(UPLOAD_FILE), 1);
    Ok(())
}

#[b2link_test]
async fn larger_content_is_uploaded_as_large_file() -> Result<(), Error> {
    let (transport, client) = setup(5, 0);
    let data: Vec<u8> = (0u8..23).collect();
    let request = UploadRequest {
        large_file_sha1: Some(sha1_hex(&data)),
        ..request("big.bin")
    };

    let file = client
        .upload(&request, &data[..], &CancellationToken::new())
        .await?;

    assert_eq!(file.file_id, "F1");
    assert_eq!(file.content_length, Some(23));
    assert_eq!(
        file.file_info.get(LARGE_FILE_SHA1_INFO),
        Some(&sha1_hex(&data))
    );
    assert_eq!(transport.call_count(UPLOAD_PART), 5);
    assert_eq!(transport.call_count(UPLOAD_FILE), 0);
    assert!(transport.call_count(GET_UPLOAD_PART_URL) <= 3);
    assert!(transport.unfinished_file_ids().is_empty());

    let part_lengths: Vec<usize> = transport
        .requests_for(UPLOAD_PART)
        .iter()
        .map(|sent| sent.body.len())
        .collect();
    assert_eq!(part_lengths.iter().sum::<usize>(), 23);
    assert!(part_lengths.iter().all(|len| *len == 5 || *len == 3));
    Ok(())
}

#[b2link_test]
async fn recommended_part_size_is_used_by_default() -> Result<(), Error> {
    let (transport, client) = setup(0, 0);
    let data = vec![7u8; 25];

    client
        .upload(&request("recommended.bin"), &data[..], &CancellationToken::new())
        .await?;

    assert_eq!(transport.call_count(UPLOAD_PART), 3);
    Ok(())
}

#[b2link_test]
async fn part_size_is_never_below_absolute_minimum() -> Result<(), Error> {
    let (_transport, client) = setup(1, 0);

    let auth = client.authorize(&CancellationToken::new()).await?;

    assert_eq!(client.uploader().part_size(&auth), 5);
    Ok(())
}

#[b2link_test]
async fn rejected_part_is_retried_on_fresh_location() -> Result<(), Error> {
    let (transport, client) = setup(5, 2);
    transport.fail_next(UPLOAD_PART, 503, "service_unavailable", "busy");
    let data = vec![1u8; 12];

    let file = client
        .upload(&request("retried.bin"), &data[..], &CancellationToken::new())
        .await?;

    assert_eq!(file.content_length, Some(12));
    assert_eq!(transport.call_count(UPLOAD_PART), 4);
    assert_eq!(transport.call_count(GET_UPLOAD_PART_URL), 2);
    Ok(())
}

#[b2link_test]
async fn expired_authorization_is_refreshed_between_attempts() -> Result<(), Error> {
    let (transport, client) = setup(5, 1);
    let cancel = CancellationToken::new();
    client.authorize(&cancel).await?;
    transport.expire_auth_tokens();

    client
        .upload(&request("reauth.bin"), &vec![1u8; 12][..], &cancel)
        .await?;

    assert_eq!(transport.call_count(AUTHORIZE_ACCOUNT), 2);
    Ok(())
}

#[b2link_test]
async fn permanent_part_failure_cancels_large_file() -> Result<(), Error> {
    let (transport, client) = setup(5, 2);
    transport.fail_next(UPLOAD_PART, 400, "bad_request", "broken part");
    let data = vec![1u8; 12];

    let err = client
        .upload(&request("broken.bin"), &data[..], &CancellationToken::new())
        .await
        .expect_err("Permanent failure must not be retried");

    assert_eq!(err.code, Code::FailedPrecondition);
    assert_eq!(transport.call_count(UPLOAD_PART), 1);
    assert_eq!(transport.call_count(CANCEL), 1);
    assert!(transport.unfinished_file_ids().is_empty());
    Ok(())
}

#[b2link_test]
async fn rejected_upload_location_is_replaced() -> Result<(), Error> {
    let (transport, client) = setup(0, 1);
    let cancel = CancellationToken::new();
    let request = UploadRequest {
        lane: Some("lane1".to_string()),
        ..request("small.txt")
    };

    client
        .upload_file(&request, Bytes::from_static(b"one"), &cancel)
        .await?;
    transport.expire_upload_tokens();
    client
        .upload_file(&request, Bytes::from_static(b"two"), &cancel)
        .await?;

    assert_eq!(transport.call_count(UPLOAD_FILE), 3);
    assert_eq!(transport.call_count(GET_UPLOAD_URL), 2);
    assert_eq!(transport.finished_files().len(), 2);
    Ok(())
}

#[b2link_test]
async fn missing_bucket_is_not_retried() -> Result<(), Error> {
    let transport = Arc::new(MockTransport::default());
    let spec = ClientSpec {
        default_bucket_id: None,
        ..client_spec(0, 3)
    };
    let client = B2Client::with_transport(&spec, transport.clone());

    let err = client
        .upload_file(&request("nowhere"), Bytes::from_static(b"x"), &CancellationToken::new())
        .await
        .expect_err("Upload without bucket must fail");

    assert_eq!(err.code, Code::InvalidArgument);
    assert!(transport.requests().is_empty());
    Ok(())
}

#[b2link_test]
async fn finish_with_lost_response_is_confirmed_not_repeated() -> Result<(), Error> {
    let service = Arc::new(MockTransport::default().with_part_sizes(10, 5));
    let transport = Arc::new(LostResponseTransport::new(service.clone(), FINISH));
    let client = B2Client::with_transport(&client_spec(5, 2), transport);

    let file = client
        .upload(&request("finished.bin"), &vec![3u8; 12][..], &CancellationToken::new())
        .await?;

    assert_eq!(file.file_id, "F1");
    assert_eq!(file.content_length, Some(12));
    assert_eq!(service.call_count(FINISH), 1);
    assert_eq!(service.call_count(CANCEL), 0);
    assert_eq!(service.finished_files().len(), 1);
    assert!(service.unfinished_file_ids().is_empty());
    Ok(())
}

#[b2link_test]
async fn start_with_lost_response_leaves_no_orphaned_file() -> Result<(), Error> {
    let service = Arc::new(MockTransport::default().with_part_sizes(10, 5));
    let transport = Arc::new(LostResponseTransport::new(service.clone(), START));
    let client = B2Client::with_transport(&client_spec(5, 2), transport);
    let cancel = CancellationToken::new();
    // Another upload of the same name that is still in progress.
    let other = B2Client::with_transport(&client_spec(5, 0), service.clone())
        .large_files()
        .start(None, "started.bin", None, HashMap::new(), &cancel)
        .await?;
    assert_eq!(other.file_id(), "F1");

    let file = client
        .upload(&request("started.bin"), &vec![4u8; 12][..], &cancel)
        .await?;

    // F2 was started but its response was lost.
    assert_eq!(file.file_id, "F3");
    assert_eq!(service.call_count(START), 3);
    assert_eq!(service.call_count(CANCEL), 1);
    assert_eq!(service.unfinished_file_ids(), vec!["F1".to_string()]);
    assert_eq!(service.finished_files().len(), 1);
    Ok(())
}

#[b2link_test]
async fn chunk_buffer_grows_with_content() -> Result<(), Error> {
    let part_size = 100 * 1024 * 1024;

    let chunk = read_chunk(&mut &b"tiny"[..], part_size).await?;

    assert_eq!(&chunk[..], b"tiny");
    let buffer = chunk
        .try_into_mut()
        .map_err(|_| make_err!(Code::Internal, "Chunk buffer is shared"))?;
    assert!(buffer.capacity() < part_size);
    Ok(())
}

#[b2link_test]
async fn parts_upload_while_next_chunk_is_read() -> Result<(), Error> {
    let (transport, client) = setup(5, 0);
    let (reader, mut writer) = tokio::io::duplex(64);
    let service = transport.clone();
    let feeder = tokio::spawn(async move {
        writer.write_all(&[1u8; 10]).await?;
        // The rest of the content only arrives once both leading parts
        // reached the service.
        while service.call_count(UPLOAD_PART) < 2 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        writer.write_all(&[2u8; 2]).await?;
        Ok::<_, std::io::Error>(())
    });

    let file = tokio::time::timeout(
        Duration::from_secs(10),
        client.upload(&request("streamed.bin"), reader, &CancellationToken::new()),
    )
    .await
    .map_err(|_| make_err!(Code::DeadlineExceeded, "Upload stalled waiting for content"))??;
    feeder.await??;

    assert_eq!(file.content_length, Some(12));
    assert_eq!(transport.call_count(UPLOAD_PART), 3);
    Ok(())
}
