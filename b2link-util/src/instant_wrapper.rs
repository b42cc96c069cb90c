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
use std::time::Instant;

use mock_instant::thread_local::Instant as MockInstant;

/// Wrapper used to abstract away which underlying Instant impl we are using.
/// This is needed for testing.
pub trait InstantWrapper: Send + Sync + Unpin + 'static {
    /// Monotonic time passed since this anchor was created.
    fn elapsed(&self) -> Duration;
}

impl InstantWrapper for Instant {
    fn elapsed(&self) -> Duration {
        Self::elapsed(self)
    }
}

pub fn default_instant_wrapper() -> Instant {
    Instant::now()
}

/// Our mocked out instant that we can pass to a `SingleFlightCache`.
/// Time only moves when the test calls `MockClock::advance`.
#[derive(Debug)]
pub struct MockInstantWrapped(MockInstant);

impl Default for MockInstantWrapped {
    fn default() -> Self {
        Self(MockInstant::now())
    }
}

impl InstantWrapper for MockInstantWrapped {
    fn elapsed(&self) -> Duration {
        self.0.elapsed()
    }
}
