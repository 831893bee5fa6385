// Licensed under the Apache-2.0 license

extern crate alloc;
use alloc::boxed::Box;
use async_trait::async_trait;

/// Per-context monotonic clock and sleep facility.
///
/// One handle per context; deadlines for different connections never
/// alias. `now_ms` must be monotonic and high-resolution enough for
/// heartbeat periods expressed in seconds.
#[async_trait]
pub trait SpdmTimer: Send + Sync {
    /// Monotonic milliseconds since an arbitrary epoch.
    fn now_ms(&self) -> u64;

    /// Suspend the current exchange for at least `ms` milliseconds.
    async fn sleep_ms(&self, ms: u64);
}
