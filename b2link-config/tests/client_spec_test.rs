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

use b2link_config::client::{ClientSpec, ErrorCode};
use b2link_config::serde_utils::{
    convert_data_size_with_shellexpand, convert_duration_with_shellexpand,
};
use pretty_assertions::assert_eq;
use serde::Deserialize;

#[derive(Deserialize)]
struct DurationEntity {
    #[serde(default, deserialize_with = "convert_duration_with_shellexpand")]
    duration: u64,
}

#[derive(Deserialize)]
struct DataSizeEntity {
    #[serde(default, deserialize_with = "convert_data_size_with_shellexpand")]
    data_size: u64,
}

#[test]
fn test_duration_human_readable_deserialize() {
    let deserialized: DurationEntity = serde_json5::from_str(r#"{"duration": "1m 10s"}"#).unwrap();
    assert_eq!(deserialized.duration, 70);
}

#[test]
fn test_duration_numeric_deserialize() {
    let deserialized: DurationEntity = serde_json5::from_str(r#"{"duration": 10}"#).unwrap();
    assert_eq!(deserialized.duration, 10);
}

#[test]
fn test_data_size_unit_deserialize() {
    let deserialized: DataSizeEntity =
        serde_json5::from_str(r#"{"data_size": "1KiB"}"#).unwrap();
    assert_eq!(deserialized.data_size, 1024);
}

#[test]
fn test_data_size_numeric_deserialize() {
    let deserialized: DataSizeEntity = serde_json5::from_str(r#"{"data_size": 10}"#).unwrap();
    assert_eq!(deserialized.data_size, 10);
}

#[test]
fn test_client_spec_full_deserialize() {
    let spec: ClientSpec = serde_json5::from_str(
        r#"{
            key_id: "0012345abcdef0000000001",
            application_key: "K001secret",
            default_bucket_id: "bucket-1",
            request_timeout: "30s",
            cache: {
                auth_ttl: "1h",
                upload_location_lock_wait: 90,
            },
            upload: {
                part_size: "100MB",
                max_concurrent_part_uploads: 8,
                retry: {
                    max_retries: 2,
                    delay: 0.5,
                    retry_on_errors: ["Unavailable"],
                },
            },
        }"#,
    )
    .unwrap();

    assert_eq!(spec.key_id, "0012345abcdef0000000001");
    assert_eq!(spec.application_key, "K001secret");
    assert_eq!(spec.auth_base_url, None);
    assert_eq!(spec.default_bucket_id.as_deref(), Some("bucket-1"));
    assert_eq!(spec.request_timeout, 30);
    assert_eq!(spec.cache.auth_ttl, 3600);
    assert_eq!(spec.cache.upload_location_lock_wait, 90);
    assert_eq!(spec.cache.upload_location_ttl, 0);
    assert_eq!(spec.upload.part_size, 100_000_000);
    assert_eq!(spec.upload.max_concurrent_part_uploads, 8);
    assert_eq!(spec.upload.retry.max_retries, 2);
    assert_eq!(
        spec.upload.retry.retry_on_errors,
        Some(vec![ErrorCode::Unavailable])
    );
}

#[test]
fn test_client_spec_rejects_unknown_fields() {
    let result = serde_json5::from_str::<ClientSpec>(r#"{ key_id: "a", bucket: "b" }"#);
    assert!(result.is_err());
}

#[test]
fn test_client_spec_shellexpand() {
    // SAFETY: Tests in this file do not read this variable concurrently.
    unsafe {
        std::env::set_var("B2LINK_TEST_KEY_ID", "expanded-key-id");
    }
    let spec: ClientSpec =
        serde_json5::from_str(r#"{ key_id: "$B2LINK_TEST_KEY_ID", default_bucket_id: "" }"#)
            .unwrap();
    assert_eq!(spec.key_id, "expanded-key-id");
    assert_eq!(spec.default_bucket_id, None);
}

#[test]
fn test_retry_without_jitter_keeps_delay() {
    let spec: ClientSpec = serde_json5::from_str(r#"{ upload: { retry: { delay: 1.0 } } }"#).unwrap();
    let jitter_fn = spec.upload.retry.make_jitter_fn();
    assert_eq!(jitter_fn(Duration::from_secs(2)), Duration::from_secs(2));
}

#[test]
fn test_retry_jitter_stays_in_range() {
    let spec: ClientSpec =
        serde_json5::from_str(r#"{ upload: { retry: { delay: 1.0, jitter: 0.5 } } }"#).unwrap();
    let jitter_fn = spec.upload.retry.make_jitter_fn();
    for _ in 0..100 {
        let delay = jitter_fn(Duration::from_secs(4));
        assert!(delay >= Duration::from_secs(3), "{delay:?}");
        assert!(delay <= Duration::from_secs(5), "{delay:?}");
    }
}
