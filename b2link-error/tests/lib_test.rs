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

use b2link_error::{Code, Error, ResultExt, error_if, make_err, make_input_err};
use pretty_assertions::assert_eq;

#[test]
fn test_err_tip_with_code_some() {
    let option = Some(42);
    let result: Result<i32, Error> =
        option.err_tip_with_code(|_error| (Code::Unknown, "Should not appear"));
    assert_eq!(result, Ok(42));
}

#[test]
fn test_err_tip_with_code_none() {
    let option: Option<i32> = None;
    let error = option
        .err_tip_with_code(|_error| (Code::InvalidArgument, "Missing value in option"))
        .unwrap_err();
    assert_eq!(error.code, Code::InvalidArgument);
    assert_eq!(error.messages, vec!["Missing value in option".to_string()]);
}

#[test]
fn test_err_tip_keeps_code_and_appends_message() {
    let result: Result<(), Error> = Err(make_err!(Code::NotFound, "no such file"));
    let error = result.err_tip(|| "In finish_large_file").unwrap_err();
    assert_eq!(error.code, Code::NotFound);
    assert_eq!(
        error.messages,
        vec!["no such file".to_string(), "In finish_large_file".to_string()]
    );
}

#[test]
fn test_make_input_err_is_invalid_argument() {
    let error = make_input_err!("part number {} out of range", 0);
    assert_eq!(error.code, Code::InvalidArgument);
    assert_eq!(error.message_string(), "part number 0 out of range");
}

#[test]
fn test_error_if_short_circuits() {
    fn check(value: u32) -> Result<u32, Error> {
        error_if!(value > 10, "value {value} too large");
        Ok(value)
    }
    assert_eq!(check(3), Ok(3));
    assert_eq!(check(11).unwrap_err().code, Code::InvalidArgument);
}

#[test]
fn test_code_to_error_conversion() {
    let error: Error = Code::Cancelled.into();
    assert_eq!(error.code, Code::Cancelled);
    assert!(error.messages.is_empty());
}

#[test]
fn test_merge_results() {
    let first: Result<(), Error> = Err(make_err!(Code::Unavailable, "upload failed"));
    let second: Result<(), Error> = Err(make_err!(Code::NotFound, "cancel failed"));
    let merged = first.merge(second).unwrap_err();
    assert_eq!(merged.code, Code::Unavailable);
    assert_eq!(
        merged.messages,
        vec![
            "upload failed".to_string(),
            "---".to_string(),
            "cancel failed".to_string()
        ]
    );
}

#[test]
fn test_http_status_classification() {
    assert_eq!(Code::from_http_status(200), Code::Ok);
    assert_eq!(Code::from_http_status(400), Code::FailedPrecondition);
    assert_eq!(Code::from_http_status(401), Code::Unauthenticated);
    assert_eq!(Code::from_http_status(403), Code::PermissionDenied);
    assert_eq!(Code::from_http_status(404), Code::NotFound);
    assert_eq!(Code::from_http_status(408), Code::Unavailable);
    assert_eq!(Code::from_http_status(429), Code::ResourceExhausted);
    assert_eq!(Code::from_http_status(503), Code::Unavailable);
}

#[test]
fn test_is_transient() {
    assert!(make_err!(Code::Unavailable, "busy").is_transient());
    assert!(make_err!(Code::ResourceExhausted, "too many requests").is_transient());
    assert!(!make_input_err!("bad part number").is_transient());
    assert!(!make_err!(Code::Unauthenticated, "expired").is_transient());
}

#[test]
fn test_json_error_maps_to_internal() {
    let err: Error = serde_json::from_str::<u32>("not json").unwrap_err().into();
    assert_eq!(err.code, Code::Internal);
    assert!(err.message_string().starts_with("Failed to parse json"));
}

#[test]
fn test_io_error_round_trip_kind() {
    let err: Error = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow").into();
    assert_eq!(err.code, Code::DeadlineExceeded);
    let io_err: std::io::Error = err.into();
    assert_eq!(io_err.kind(), std::io::ErrorKind::TimedOut);
}
