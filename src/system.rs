//! Operating system services used by the helper.
//!
//! All time keeping of a helper instance, such as PIN cache expiry and poll
//! scheduling, goes through [`SystemServices`] so that an embedding
//! application or a test can supply its own clock.
//!
//! Memory allocation is not part of this interface. An application that
//! needs to control it installs its own `#[global_allocator]`.

use std::{
    fmt, thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, Utc};

pub trait SystemServices: Send + Sync + fmt::Debug {
    /// The current wall clock time.
    fn now(&self) -> DateTime<Utc>;

    /// The time elapsed since the Unix epoch.
    fn gettimeofday(&self) -> Duration;

    fn sleep(&self, duration: Duration);
}

//------------ OsSystem ------------------------------------------------------

/// The services of the operating system the helper runs on.
#[derive(Clone, Copy, Debug, Default)]
pub struct OsSystem;

impl SystemServices for OsSystem {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn gettimeofday(&self) -> Duration {
        // A clock before 1970 is reported as the epoch itself.
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration)
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clocks_agree() {
        let system = OsSystem;
        let now = system.now().timestamp();
        let tod = system.gettimeofday().as_secs() as i64;
        assert!((now - tod).abs() <= 1);
    }
}
