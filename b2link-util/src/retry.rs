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

use core::pin::Pin;
use core::time::Duration;
use std::sync::Arc;

use b2link_config::client::{ErrorCode, Retry};
use b2link_error::{Code, Error, make_err};
use futures::future::Future;
use futures::stream::StreamExt;
use tracing::{Level, event};

struct ExponentialBackoff {
    current: Duration,
}

impl ExponentialBackoff {
    const fn new(base: Duration) -> Self {
        Self { current: base }
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let delay = self.current;
        self.current = self.current.saturating_mul(2);
        Some(delay)
    }
}

pub type SleepFn = Arc<dyn Fn(Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> + Sync + Send>;
pub type JitterFn = Arc<dyn Fn(Duration) -> Duration + Send + Sync>;

#[derive(PartialEq, Eq, Debug)]
pub enum RetryResult<T> {
    Ok(T),
    Retry(Error),
    Err(Error),
}

/// Retries a job with a sleep function in between each attempt.
///
/// Nothing in the client retries on its own; this is the policy a caller
/// layers on top of exchanges it knows are safe to repeat.
#[derive(Clone)]
pub struct Retrier {
    sleep_fn: SleepFn,
    jitter_fn: JitterFn,
    config: Retry,
}

impl core::fmt::Debug for Retrier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Retrier")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

const fn to_code(code: ErrorCode) -> Code {
    match code {
        ErrorCode::Cancelled => Code::Cancelled,
        ErrorCode::Unknown => Code::Unknown,
        ErrorCode::InvalidArgument => Code::InvalidArgument,
        ErrorCode::DeadlineExceeded => Code::DeadlineExceeded,
        ErrorCode::NotFound => Code::NotFound,
        ErrorCode::AlreadyExists => Code::AlreadyExists,
        ErrorCode::PermissionDenied => Code::PermissionDenied,
        ErrorCode::ResourceExhausted => Code::ResourceExhausted,
        ErrorCode::FailedPrecondition => Code::FailedPrecondition,
        ErrorCode::Aborted => Code::Aborted,
        ErrorCode::OutOfRange => Code::OutOfRange,
        ErrorCode::Unimplemented => Code::Unimplemented,
        ErrorCode::Internal => Code::Internal,
        ErrorCode::Unavailable => Code::Unavailable,
        ErrorCode::DataLoss => Code::DataLoss,
        ErrorCode::Unauthenticated => Code::Unauthenticated,
    }
}

impl Retrier {
    pub fn new(sleep_fn: SleepFn, jitter_fn: JitterFn, config: Retry) -> Self {
        Self {
            sleep_fn,
            jitter_fn,
            config,
        }
    }

    /// Builds a retrier that sleeps on the tokio timer.
    pub fn from_config(config: Retry) -> Self {
        let jitter_fn = config.make_jitter_fn();
        Self::new(
            Arc::new(|duration| Box::pin(tokio::time::sleep(duration))),
            jitter_fn,
            config,
        )
    }

    /// This should only return true if the error code should be interpreted as
    /// temporary.
    fn should_retry(&self, code: Code) -> bool {
        if code == Code::Ok {
            false
        } else if let Some(retry_codes) = &self.config.retry_on_errors {
            retry_codes.iter().any(|retry_code| to_code(*retry_code) == code)
        } else {
            // An expired token or upload location shows up as Unauthenticated
            // and is fixed by fetching a fresh one before the next attempt.
            matches!(
                code,
                Code::Unknown
                    | Code::DeadlineExceeded
                    | Code::ResourceExhausted
                    | Code::Aborted
                    | Code::Unavailable
                    | Code::Unauthenticated
            )
        }
    }

    fn get_retry_config(&self) -> impl Iterator<Item = Duration> + '_ {
        ExponentialBackoff::new(Duration::from_secs_f32(self.config.delay.max(0.)))
            .map(|d| (self.jitter_fn)(d))
            .take(self.config.max_retries) // Remember this is number of retries, so will run max_retries + 1.
    }

    pub async fn retry<T, Fut>(&self, operation: Fut) -> Result<T, Error>
    where
        Fut: futures::stream::Stream<Item = RetryResult<T>> + Send,
        T: Send,
    {
        let mut iter = self.get_retry_config();
        let mut operation = Box::pin(operation);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation.next().await {
                None => {
                    return Err(make_err!(
                        Code::Internal,
                        "Retry stream ended abruptly on attempt {attempt}",
                    ));
                }
                Some(RetryResult::Ok(value)) => return Ok(value),
                Some(RetryResult::Err(e)) => {
                    return Err(e.append(format!("On attempt {attempt}")));
                }
                Some(RetryResult::Retry(e)) => {
                    if !self.should_retry(e.code) {
                        event!(Level::DEBUG, ?attempt, ?e, "Not retrying permanent error");
                        return Err(e);
                    }
                    let Some(delay) = iter.next() else {
                        return Err(e.append(format!("On attempt {attempt}")));
                    };
                    event!(Level::INFO, ?attempt, ?delay, ?e, "Retrying after error");
                    (self.sleep_fn)(delay).await;
                }
            }
        }
    }
}
