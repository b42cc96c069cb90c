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

use core::sync::atomic::{AtomicUsize, Ordering};
use core::time::Duration;
use std::sync::{Arc, Mutex};

use b2link_config::client::{ErrorCode, Retry};
use b2link_error::{Code, Error, make_err};
use b2link_macro::b2link_test;
use b2link_util::retry::{Retrier, RetryResult};
use futures::stream::unfold;
use pretty_assertions::assert_eq;

fn make_retrier(config: Retry) -> (Retrier, Arc<Mutex<Vec<Duration>>>) {
    let sleeps = Arc::new(Mutex::new(Vec::new()));
    let recorded = sleeps.clone();
    let retrier = Retrier::new(
        Arc::new(move |duration| {
            recorded.lock().unwrap().push(duration);
            Box::pin(futures::future::ready(()))
        }),
        Arc::new(|duration| duration),
        config,
    );
    (retrier, sleeps)
}

#[b2link_test]
async fn retries_until_success() -> Result<(), Error> {
    let (retrier, sleeps) = make_retrier(Retry {
        max_retries: 5,
        delay: 1.,
        ..Default::default()
    });
    let attempts = AtomicUsize::new(0);

    let result = retrier
        .retry(unfold((), |()| async {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < 2 {
                Some((RetryResult::Retry(make_err!(Code::Unavailable, "busy")), ()))
            } else {
                Some((RetryResult::Ok(attempt), ()))
            }
        }))
        .await?;

    assert_eq!(result, 2);
    assert_eq!(
        *sleeps.lock().unwrap(),
        vec![Duration::from_secs(1), Duration::from_secs(2)]
    );
    Ok(())
}

#[b2link_test]
async fn permanent_error_is_not_retried() -> Result<(), Error> {
    let (retrier, sleeps) = make_retrier(Retry {
        max_retries: 5,
        delay: 1.,
        ..Default::default()
    });

    let err = retrier
        .retry(unfold((), |()| async {
            Some((
                RetryResult::<()>::Retry(make_err!(Code::InvalidArgument, "bad part")),
                (),
            ))
        }))
        .await
        .unwrap_err();

    assert_eq!(err.code, Code::InvalidArgument);
    assert!(sleeps.lock().unwrap().is_empty());
    Ok(())
}

#[b2link_test]
async fn gives_up_after_max_retries() -> Result<(), Error> {
    let (retrier, sleeps) = make_retrier(Retry {
        max_retries: 2,
        delay: 0.5,
        ..Default::default()
    });
    let attempts = AtomicUsize::new(0);

    let err = retrier
        .retry(unfold((), |()| async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Some((
                RetryResult::<()>::Retry(make_err!(Code::Unauthenticated, "expired")),
                (),
            ))
        }))
        .await
        .unwrap_err();

    assert_eq!(err.code, Code::Unauthenticated);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(sleeps.lock().unwrap().len(), 2);
    Ok(())
}

#[b2link_test]
async fn configured_codes_override_defaults() -> Result<(), Error> {
    let (retrier, _sleeps) = make_retrier(Retry {
        max_retries: 3,
        retry_on_errors: Some(vec![ErrorCode::NotFound]),
        ..Default::default()
    });
    let attempts = AtomicUsize::new(0);

    let err = retrier
        .retry(unfold((), |()| async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Some((
                RetryResult::<()>::Retry(make_err!(Code::Unavailable, "busy")),
                (),
            ))
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::Unavailable);
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    Ok(())
}

#[b2link_test]
async fn hard_error_stops_immediately() -> Result<(), Error> {
    let (retrier, sleeps) = make_retrier(Retry {
        max_retries: 3,
        ..Default::default()
    });

    let err = retrier
        .retry(unfold((), |()| async {
            Some((
                RetryResult::<()>::Err(make_err!(Code::DataLoss, "checksum mismatch")),
                (),
            ))
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::DataLoss);
    assert_eq!(
        err.messages,
        vec!["checksum mismatch".to_string(), "On attempt 1".to_string()]
    );
    assert!(sleeps.lock().unwrap().is_empty());
    Ok(())
}
