//! Various helper-wide constants.

use std::time::Duration;

//------------ Binary Names -------------------------------------------------

/// The friendly name of the `p11helper` binary.
pub const P11HELPER_CLIENT_APP: &str = "PKCS#11 Helper Client";

//------------ Config Files Paths -------------------------------------------

/// The default path to the `p11helper` config file.
pub const P11HELPER_DEFAULT_CONFIG_FILE: &str = "/etc/p11helper.conf";

//------------ Environment Variables ----------------------------------------

/// The environment variable with the log level.
///
/// The variable should contain the name of a [`log::LevelFilter`]. It will
/// be overwritten by the config file. The default is “warn.”
pub const P11HELPER_ENV_LOG_LEVEL: &str = "P11HELPER_LOG_LEVEL";

/// The environment variable with the path to the config file.
pub const P11HELPER_ENV_CONFIG: &str = "P11HELPER_CONFIG";

/// The environment variable that enables tracing of every PKCS#11 call.
///
/// Without it, the PKCS#11 call traces are left out even at log level
/// “trace.”
pub const P11HELPER_ENV_TRACE_CALLS: &str = "P11HELPER_TRACE_CALLS";

//------------ Login --------------------------------------------------------

/// How many times a user is asked for a PIN before login gives up.
pub const DEFAULT_MAX_LOGIN_RETRIES: u32 = 3;

/// How many times a user is asked to insert a missing token.
pub const DEFAULT_MAX_TOKEN_PROMPTS: u32 = 3;

/// How long a cached PIN stays valid under the timeout policy.
pub const DEFAULT_PIN_CACHE_TIMEOUT: Duration = Duration::from_secs(300);

//------------ Slot Events --------------------------------------------------

/// The slot scan interval for providers in poll mode that did not set one.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1_000);

/// The longest a trigger-mode wait blocks before checking for shutdown.
pub const DEFAULT_TRIGGER_WAIT_GRANULARITY: Duration = Duration::from_millis(250);

//------------ Retries ------------------------------------------------------

/// The time to wait between an initial and subsequent attempt at a token
/// read that failed with a transient error.
pub const RETRY_REQ_AFTER: Duration = Duration::from_secs(2);

/// How much longer should we wait from one attempt to the next compared to
/// the previous wait?
pub const RETRY_REQ_AFTER_MULTIPLIER: f64 = 1.5;

/// The maximum amount of time to keep retrying a failed token read.
pub const RETRY_REQ_UNTIL_MAX: Duration = Duration::from_secs(30);
