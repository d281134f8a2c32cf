//! Retrying read-only token queries that failed for a transient reason.
//!
//! Only queries without side effects go through here: opening a session,
//! searching objects and reading attributes. Login and private key
//! operations are never retried this way.

use std::time::Duration;

use backoff::ExponentialBackoff;
use log::{error, warn};

use crate::constants::{RETRY_REQ_AFTER, RETRY_REQ_AFTER_MULTIPLIER, RETRY_REQ_UNTIL_MAX};

use super::ModuleError;

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub multiplier: f64,

    /// Zero disables retrying.
    pub max_elapsed: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            initial_interval: RETRY_REQ_AFTER,
            multiplier: RETRY_REQ_AFTER_MULTIPLIER,
            max_elapsed: RETRY_REQ_UNTIL_MAX,
        }
    }
}

impl RetryPolicy {
    pub fn never() -> Self {
        RetryPolicy {
            max_elapsed: Duration::ZERO,
            ..Default::default()
        }
    }

    /// Performs `op`, retrying with backoff while it fails with a transient
    /// status.
    pub fn run<T, F>(&self, desc: &str, mut op: F) -> Result<T, ModuleError>
    where
        F: FnMut() -> Result<T, ModuleError>,
    {
        if self.max_elapsed.is_zero() {
            return op();
        }

        let backoff_policy = ExponentialBackoff {
            initial_interval: self.initial_interval,
            multiplier: self.multiplier,
            max_elapsed_time: Some(self.max_elapsed),
            ..Default::default()
        };

        let notify = |err: ModuleError, next: Duration| {
            warn!("{} failed, retrying in {} ms: {}", desc, next.as_millis(), err);
        };

        let attempt = || {
            op().map_err(|err| {
                if err.rv.is_transient() {
                    backoff::Error::transient(err)
                } else {
                    backoff::Error::permanent(err)
                }
            })
        };

        backoff::retry_notify(backoff_policy, attempt, notify).map_err(|err| match err {
            backoff::Error::Permanent(err) => err,
            backoff::Error::Transient { err, .. } => {
                error!("{} failed, retries exhausted: {}", desc, err);
                err
            }
        })
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::module::Rv;

    fn quick() -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_millis(1),
            multiplier: 1.0,
            max_elapsed: Duration::from_millis(500),
        }
    }

    #[test]
    fn transient_errors_are_retried() {
        let calls = Cell::new(0);
        let res = quick().run("test", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(ModuleError::new(Rv::DeviceMemory, "C_FindObjects"))
            } else {
                Ok(42)
            }
        });
        assert_eq!(res.unwrap(), 42);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn token_removal_is_not_retried() {
        let calls = Cell::new(0);
        let res: Result<(), _> = quick().run("test", || {
            calls.set(calls.get() + 1);
            Err(ModuleError::new(Rv::TokenNotPresent, "C_OpenSession"))
        });
        assert_eq!(res.unwrap_err().rv, Rv::TokenNotPresent);
        assert_eq!(calls.get(), 1);
    }
}
