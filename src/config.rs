//! Configuration of a helper instance and of logging, read from TOML.

use std::{
    env, fmt,
    fs::File,
    io::{self, Read},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use log::{LevelFilter, error};
use serde::{de, Deserialize, Deserializer};
#[cfg(unix)]
use syslog::Facility;

use crate::constants::{
    DEFAULT_MAX_LOGIN_RETRIES, DEFAULT_MAX_TOKEN_PROMPTS, DEFAULT_PIN_CACHE_TIMEOUT, DEFAULT_POLL_INTERVAL,
    DEFAULT_TRIGGER_WAIT_GRANULARITY, P11HELPER_ENV_LOG_LEVEL, P11HELPER_ENV_TRACE_CALLS, RETRY_REQ_AFTER, RETRY_REQ_AFTER_MULTIPLIER,
    RETRY_REQ_UNTIL_MAX,
};
use crate::crypto::EngineId;
use crate::ext_serde;
use crate::module::retry::RetryPolicy;
use crate::session::PinCachePolicy;
use crate::token::{PrivateMode, ProviderSettings, SlotEventMethod};

//------------ ConfigDefaults ------------------------------------------------

pub struct ConfigDefaults;

impl ConfigDefaults {
    fn log_level() -> LevelFilter {
        match env::var(P11HELPER_ENV_LOG_LEVEL) {
            Ok(level) => match LevelFilter::from_str(&level) {
                Ok(level) => level,
                Err(_) => {
                    eprintln!("Unrecognized value for log level in env var {}", P11HELPER_ENV_LOG_LEVEL);
                    LevelFilter::Warn
                }
            },
            _ => LevelFilter::Warn,
        }
    }
    fn log_type() -> LogType {
        LogType::Stderr
    }
    fn log_file() -> PathBuf {
        PathBuf::from("./p11helper.log")
    }
    fn syslog_facility() -> String {
        "user".to_string()
    }
    fn crypto_engine() -> EngineId {
        EngineId::Auto
    }
    fn pin_cache_policy() -> PinCachePolicy {
        PinCachePolicy::Session
    }
    fn pin_cache_timeout() -> Duration {
        DEFAULT_PIN_CACHE_TIMEOUT
    }
    fn max_login_retries() -> u32 {
        DEFAULT_MAX_LOGIN_RETRIES
    }
    fn max_token_prompts() -> u32 {
        DEFAULT_MAX_TOKEN_PROMPTS
    }
    fn allow_prompt() -> bool {
        true
    }
    fn poll_interval() -> Duration {
        DEFAULT_POLL_INTERVAL
    }
    fn trigger_wait_granularity() -> Duration {
        DEFAULT_TRIGGER_WAIT_GRANULARITY
    }
    fn retry_initial_interval() -> Duration {
        RETRY_REQ_AFTER
    }
    fn retry_multiplier() -> f64 {
        RETRY_REQ_AFTER_MULTIPLIER
    }
    fn retry_max_elapsed() -> Duration {
        RETRY_REQ_UNTIL_MAX
    }
    fn allow_removal_while_sessions_open() -> bool {
        true
    }
}

//------------ HelperConfig --------------------------------------------------

/// Everything a helper instance and the application's logging can be
/// configured with.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HelperConfig {
    #[serde(
        default = "ConfigDefaults::log_level",
        deserialize_with = "ext_serde::de_level_filter"
    )]
    pub log_level: LevelFilter,

    #[serde(default = "ConfigDefaults::log_type")]
    pub log_type: LogType,

    #[serde(default = "ConfigDefaults::log_file")]
    pub log_file: PathBuf,

    #[serde(default = "ConfigDefaults::syslog_facility")]
    pub syslog_facility: String,

    #[serde(default = "ConfigDefaults::crypto_engine")]
    pub crypto_engine: EngineId,

    #[serde(default = "ConfigDefaults::pin_cache_policy")]
    pub pin_cache_policy: PinCachePolicy,

    #[serde(
        default = "ConfigDefaults::pin_cache_timeout",
        deserialize_with = "ext_serde::de_duration_secs"
    )]
    pub pin_cache_timeout: Duration,

    #[serde(default = "ConfigDefaults::max_login_retries")]
    pub max_login_retries: u32,

    #[serde(default = "ConfigDefaults::max_token_prompts")]
    pub max_token_prompts: u32,

    #[serde(default = "ConfigDefaults::allow_prompt")]
    pub allow_pin_prompt: bool,

    #[serde(default = "ConfigDefaults::allow_prompt")]
    pub allow_token_prompt: bool,

    #[serde(
        default = "ConfigDefaults::poll_interval",
        deserialize_with = "ext_serde::de_duration_millis"
    )]
    pub poll_interval: Duration,

    #[serde(
        default = "ConfigDefaults::trigger_wait_granularity",
        deserialize_with = "ext_serde::de_duration_millis"
    )]
    pub trigger_wait_granularity: Duration,

    #[serde(
        default = "ConfigDefaults::retry_initial_interval",
        deserialize_with = "ext_serde::de_duration_millis"
    )]
    pub retry_initial_interval: Duration,

    #[serde(default = "ConfigDefaults::retry_multiplier")]
    pub retry_multiplier: f64,

    #[serde(
        default = "ConfigDefaults::retry_max_elapsed",
        deserialize_with = "ext_serde::de_duration_secs"
    )]
    pub retry_max_elapsed: Duration,

    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl Default for HelperConfig {
    fn default() -> Self {
        HelperConfig {
            log_level: ConfigDefaults::log_level(),
            log_type: ConfigDefaults::log_type(),
            log_file: ConfigDefaults::log_file(),
            syslog_facility: ConfigDefaults::syslog_facility(),
            crypto_engine: ConfigDefaults::crypto_engine(),
            pin_cache_policy: ConfigDefaults::pin_cache_policy(),
            pin_cache_timeout: ConfigDefaults::pin_cache_timeout(),
            max_login_retries: ConfigDefaults::max_login_retries(),
            max_token_prompts: ConfigDefaults::max_token_prompts(),
            allow_pin_prompt: ConfigDefaults::allow_prompt(),
            allow_token_prompt: ConfigDefaults::allow_prompt(),
            poll_interval: ConfigDefaults::poll_interval(),
            trigger_wait_granularity: ConfigDefaults::trigger_wait_granularity(),
            retry_initial_interval: ConfigDefaults::retry_initial_interval(),
            retry_multiplier: ConfigDefaults::retry_multiplier(),
            retry_max_elapsed: ConfigDefaults::retry_max_elapsed(),
            providers: Vec::new(),
        }
    }
}

impl HelperConfig {
    pub fn read_config(file: &Path) -> Result<Self, ConfigError> {
        let mut s = String::new();
        let mut f = File::open(file)?;
        f.read_to_string(&mut s)?;
        Self::parse_str(&s)
    }

    pub fn parse_str(s: &str) -> Result<Self, ConfigError> {
        let c: HelperConfig = toml::from_str(s)?;
        c.verify()?;
        Ok(c)
    }

    pub fn verify(&self) -> Result<(), ConfigError> {
        if self.max_login_retries < 1 {
            return Err(ConfigError::other("max_login_retries must be at least 1"));
        }
        if self.trigger_wait_granularity.is_zero() {
            return Err(ConfigError::other("trigger_wait_granularity must not be 0"));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::other("poll_interval must not be 0"));
        }
        if self.retry_multiplier < 1.0 {
            return Err(ConfigError::other("retry_multiplier must be at least 1.0"));
        }
        if self.pin_cache_policy == PinCachePolicy::Timeout && self.pin_cache_timeout.is_zero() {
            return Err(ConfigError::other(
                "pin_cache_timeout must not be 0 with pin_cache_policy \"timeout\"",
            ));
        }
        for provider in &self.providers {
            if provider.path.is_empty() {
                return Err(ConfigError::other("provider path must not be empty"));
            }
            if provider.poll_interval.is_some_and(|interval| interval.is_zero()) {
                return Err(ConfigError::Other(format!(
                    "poll_interval of provider '{}' must not be 0",
                    provider.path
                )));
            }
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_interval: self.retry_initial_interval,
            multiplier: self.retry_multiplier,
            max_elapsed: self.retry_max_elapsed,
        }
    }

    pub fn init_logging(&self) -> Result<(), ConfigError> {
        match self.log_type {
            LogType::File => self.file_logger(&self.log_file),
            LogType::Stderr => self.stderr_logger(),
            #[cfg(unix)]
            LogType::Syslog => {
                let facility = Facility::from_str(&self.syslog_facility)
                    .map_err(|_| ConfigError::other("Invalid syslog_facility"))?;
                self.syslog_logger(facility)
            }
            #[cfg(not(unix))]
            LogType::Syslog => Err(ConfigError::other("syslog is not supported on this platform")),
        }
    }

    /// Creates a stderr logger.
    fn stderr_logger(&self) -> Result<(), ConfigError> {
        self.fern_logger()
            .chain(io::stderr())
            .apply()
            .map_err(|e| ConfigError::Other(format!("Failed to init stderr logging: {}", e)))
    }

    /// Creates a file logger using the file provided by `path`.
    fn file_logger(&self, path: &Path) -> Result<(), ConfigError> {
        let file = match fern::log_file(path) {
            Ok(file) => file,
            Err(err) => {
                let error_string = format!("Failed to open log file '{}': {}", path.display(), err);
                error!("{}", error_string.as_str());
                return Err(ConfigError::Other(error_string));
            }
        };
        self.fern_logger()
            .chain(file)
            .apply()
            .map_err(|e| ConfigError::Other(format!("Failed to init file logging: {}", e)))
    }

    /// Creates a syslog logger and configures correctly.
    #[cfg(unix)]
    fn syslog_logger(&self, facility: Facility) -> Result<(), ConfigError> {
        let process = env::current_exe()
            .ok()
            .and_then(|path| {
                path.file_name()
                    .and_then(std::ffi::OsStr::to_str)
                    .map(ToString::to_string)
            })
            .unwrap_or_else(|| String::from("p11helper"));
        let formatter = syslog::Formatter3164 {
            facility,
            hostname: None,
            process,
            pid: std::process::id(),
        };
        let logger = syslog::unix(formatter.clone())
            .or_else(|_| syslog::tcp(formatter.clone(), ("127.0.0.1", 601)))
            .or_else(|_| syslog::udp(formatter, ("127.0.0.1", 0), ("127.0.0.1", 514)));
        match logger {
            Ok(logger) => self
                .fern_logger()
                .chain(logger)
                .apply()
                .map_err(|e| ConfigError::Other(format!("Failed to init syslog: {}", e))),
            Err(err) => {
                let msg = format!("Cannot connect to syslog: {}", err);
                Err(ConfigError::Other(msg))
            }
        }
    }

    /// Creates and returns a fern logger with log level tweaks
    fn fern_logger(&self) -> fern::Dispatch {
        self.fern_dispatch(env::var(P11HELPER_ENV_TRACE_CALLS).is_ok())
    }

    fn fern_dispatch(&self, trace_calls: bool) -> fern::Dispatch {
        // every PKCS#11 call is traced, too noisy unless asked for
        let call_level = if trace_calls {
            self.log_level
        } else {
            self.log_level.min(LevelFilter::Debug)
        };
        let framework_level = self.log_level.min(LevelFilter::Warn);

        let show_target = self.log_level == LevelFilter::Trace || self.log_level == LevelFilter::Debug;
        fern::Dispatch::new()
            .format(move |out, message, record| {
                if show_target {
                    out.finish(format_args!(
                        "{} [{}] [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        record.target(),
                        message
                    ))
                } else {
                    out.finish(format_args!(
                        "{} [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        message
                    ))
                }
            })
            .level(self.log_level)
            .level_for("cryptoki", framework_level)
            .level_for("libloading", framework_level)
            .level_for("pkcs11_helper::token::provider", call_level)
            .level_for("pkcs11_helper::module::cryptoki", call_level)
    }
}

//------------ ProviderConfig ------------------------------------------------

/// A provider to add when the helper starts, see
/// [`Pkcs11Helper::add_configured_providers`](crate::Pkcs11Helper::add_configured_providers).
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    pub path: String,

    pub name: Option<String>,

    #[serde(default)]
    pub protected_auth: bool,

    #[serde(default)]
    pub private_mode: PrivateMode,

    #[serde(default)]
    pub slot_event: SlotEventMethod,

    #[serde(default, deserialize_with = "ext_serde::de_duration_millis_opt")]
    pub poll_interval: Option<Duration>,

    #[serde(default = "ConfigDefaults::allow_removal_while_sessions_open")]
    pub allow_removal_while_sessions_open: bool,

    #[serde(default)]
    pub cert_is_private: bool,

    #[serde(default)]
    pub reject_duplicate: bool,
}

impl ProviderConfig {
    pub fn settings(&self) -> ProviderSettings {
        ProviderSettings {
            name: self.name.clone(),
            protected_auth: self.protected_auth,
            private_mode: self.private_mode,
            slot_event: self.slot_event,
            poll_interval: self.poll_interval,
            allow_removal_while_sessions_open: self.allow_removal_while_sessions_open,
            cert_is_private: self.cert_is_private,
            reject_duplicate: self.reject_duplicate,
        }
    }
}

//------------ LogType -------------------------------------------------------

/// The target to log to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogType {
    Stderr,
    File,
    Syslog,
}

impl<'de> Deserialize<'de> for LogType {
    fn deserialize<D>(d: D) -> Result<LogType, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(d)?;
        match string.as_str() {
            "stderr" => Ok(LogType::Stderr),
            "file" => Ok(LogType::File),
            "syslog" => Ok(LogType::Syslog),
            _ => Err(de::Error::custom(format!(
                "expected \"stderr\", \"file\" or \"syslog\", found: \"{}\"",
                string
            ))),
        }
    }
}

//------------ ConfigError ---------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    IoError(io::Error),
    TomlError(toml::de::Error),
    Other(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "{}", e),
            ConfigError::TomlError(e) => write!(f, "{}", e),
            ConfigError::Other(s) => write!(f, "{}", s),
        }
    }
}

impl ConfigError {
    pub fn other(s: &str) -> ConfigError {
        ConfigError::Other(s.to_string())
    }
}

impl std::error::Error for ConfigError {}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::IoError(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::TomlError(e)
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn should_parse_default_config_file() {
        let c = HelperConfig::read_config(Path::new("./defaults/p11helper.conf")).unwrap();
        assert_eq!(c.max_login_retries, 3);
        assert_eq!(c.pin_cache_policy, PinCachePolicy::Session);
        assert_eq!(c.providers.len(), 1);
        assert_eq!(c.providers[0].slot_event, SlotEventMethod::Auto);
    }

    #[test]
    fn should_parse_providers() {
        let c = HelperConfig::parse_str(
            r#"
            log_level = "debug"
            crypto_engine = "gpl"
            pin_cache_policy = "timeout"
            pin_cache_timeout = 60
            poll_interval = 500

            [[providers]]
            path = "/usr/lib/opensc-pkcs11.so"
            name = "OpenSC"
            slot_event = "poll"
            poll_interval = 2000
            private_mode = ["sign", "decrypt"]

            [[providers]]
            path = "/usr/lib/softhsm/libsofthsm2.so"
            private_mode = "sign"
            allow_removal_while_sessions_open = false
            "#,
        )
        .unwrap();

        assert_eq!(c.log_level, LevelFilter::Debug);
        assert_eq!(c.crypto_engine, EngineId::GplOnly);
        assert_eq!(c.pin_cache_timeout, Duration::from_secs(60));
        assert_eq!(c.poll_interval, Duration::from_millis(500));

        let opensc = c.providers[0].settings();
        assert_eq!(opensc.name.as_deref(), Some("OpenSC"));
        assert_eq!(opensc.slot_event, SlotEventMethod::Poll);
        assert_eq!(opensc.poll_interval, Some(Duration::from_millis(2000)));
        assert_eq!(opensc.private_mode, PrivateMode::SIGN.with(PrivateMode::DECRYPT));
        assert!(opensc.allow_removal_while_sessions_open);

        let softhsm = c.providers[1].settings();
        assert_eq!(softhsm.private_mode, PrivateMode::SIGN);
        assert!(!softhsm.allow_removal_while_sessions_open);
    }

    #[test]
    fn should_reject_bad_values() {
        assert!(HelperConfig::parse_str("max_login_retries = 0").is_err());
        assert!(HelperConfig::parse_str("log_type = \"journal\"").is_err());
        assert!(HelperConfig::parse_str("crypto_engine = \"nss\"").is_err());
        assert!(HelperConfig::parse_str("[[providers]]\npath = \"\"").is_err());
        assert!(HelperConfig::parse_str("[[providers]]\npath = \"/x.so\"\nslot_event = \"sometimes\"").is_err());
        assert!(HelperConfig::parse_str("no_such_setting = 1").is_err());
    }

    #[test]
    fn should_read_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_token_prompts = 5").unwrap();
        let c = HelperConfig::read_config(file.path()).unwrap();
        assert_eq!(c.max_token_prompts, 5);

        let err = HelperConfig::read_config(Path::new("/no/such/p11helper.conf")).unwrap_err();
        assert!(matches!(err, ConfigError::IoError(_)));
    }

    #[test]
    fn should_set_correct_log_levels() {
        use log::Level as LL;

        fn void_logger(config: &str, trace_calls: bool) -> Box<dyn log::Log> {
            let c = HelperConfig::parse_str(config).unwrap();
            let void_output = fern::Output::writer(Box::new(io::sink()), "");
            let (_, void_logger) = c.fern_dispatch(trace_calls).chain(void_output).into_log();
            void_logger
        }

        fn void_logger_from_config(config: &str) -> Box<dyn log::Log> {
            void_logger(config, false)
        }

        fn for_target_at_level(target: &str, level: LL) -> log::Metadata {
            log::Metadata::builder().target(target).level(level).build()
        }

        for config_level in &["error", "warn"] {
            let log = void_logger_from_config(&format!(r#"log_level = "{}""#, config_level));
            let config_level = LL::from_str(config_level).unwrap();
            for level in &[LL::Error, LL::Warn, LL::Info, LL::Debug, LL::Trace] {
                for target in &["pkcs11_helper", "pkcs11_helper::token::provider", "cryptoki"] {
                    assert_eq!(
                        *level <= config_level,
                        log.enabled(&for_target_at_level(target, *level)),
                        "{} at {}",
                        target,
                        level
                    );
                }
            }
        }

        let log = void_logger_from_config(r#"log_level = "trace""#);
        assert!(log.enabled(&for_target_at_level("pkcs11_helper::token", LL::Trace)));
        assert!(log.enabled(&for_target_at_level("pkcs11_helper::token::provider", LL::Debug)));
        assert!(!log.enabled(&for_target_at_level("pkcs11_helper::token::provider", LL::Trace)));
        assert!(!log.enabled(&for_target_at_level("pkcs11_helper::module::cryptoki", LL::Trace)));
        assert!(log.enabled(&for_target_at_level("pkcs11_helper::module::retry", LL::Trace)));
        assert!(!log.enabled(&for_target_at_level("cryptoki", LL::Info)));
        assert!(log.enabled(&for_target_at_level("cryptoki", LL::Warn)));

        let log = void_logger(r#"log_level = "trace""#, true);
        assert!(log.enabled(&for_target_at_level("pkcs11_helper::token::provider", LL::Trace)));
        assert!(log.enabled(&for_target_at_level("pkcs11_helper::module::cryptoki", LL::Trace)));
    }
}
