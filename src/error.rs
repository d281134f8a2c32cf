//! The result code vocabulary and the error type returned by every public
//! operation.

use std::fmt;
use std::sync::PoisonError;

use serde::Serialize;

use crate::config::ConfigError;
use crate::crypto::{CryptoError, Mechanism};
use crate::module::{ModuleError, Rv};

//------------ ResultCode ----------------------------------------------------

/// Helper specific codes live in the PKCS#11 vendor defined range.
const VENDOR: u64 = 0x8000_0000;

/// The closed set of result codes a public operation can end with.
///
/// Codes that have a PKCS#11 counterpart carry its `CKR_*` value.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
pub enum ResultCode {
    Ok,
    Cancelled,
    NoEvent,
    Timeout,
    SessionHandleInvalid,
    AttributeValueInvalid,
    FunctionFailed,
    ArgumentsBad,
    PinIncorrect,
    PinLocked,
    TokenNotPresent,
    DeviceError,
    GeneralError,
    FunctionNotSupported,
    MechanismInvalid,
    KeyFunctionNotPermitted,
    AlreadyInitialized,
    NotInitialized,
    InvalidState,
    EngineUnavailable,
    ProviderLoadFailed,
    ProviderNotFound,
    ProviderAlreadyLoaded,
    ProviderBusy,
    CertificateNotFound,
    KeyNotFound,
    SessionInvalidated,
    OperationFailed,
    FatalError,
}

impl ResultCode {
    const ALL: [ResultCode; 29] = [
        ResultCode::Ok,
        ResultCode::Cancelled,
        ResultCode::NoEvent,
        ResultCode::Timeout,
        ResultCode::SessionHandleInvalid,
        ResultCode::AttributeValueInvalid,
        ResultCode::FunctionFailed,
        ResultCode::ArgumentsBad,
        ResultCode::PinIncorrect,
        ResultCode::PinLocked,
        ResultCode::TokenNotPresent,
        ResultCode::DeviceError,
        ResultCode::GeneralError,
        ResultCode::FunctionNotSupported,
        ResultCode::MechanismInvalid,
        ResultCode::KeyFunctionNotPermitted,
        ResultCode::AlreadyInitialized,
        ResultCode::NotInitialized,
        ResultCode::InvalidState,
        ResultCode::EngineUnavailable,
        ResultCode::ProviderLoadFailed,
        ResultCode::ProviderNotFound,
        ResultCode::ProviderAlreadyLoaded,
        ResultCode::ProviderBusy,
        ResultCode::CertificateNotFound,
        ResultCode::KeyNotFound,
        ResultCode::SessionInvalidated,
        ResultCode::OperationFailed,
        ResultCode::FatalError,
    ];

    /// Returns the numeric value of the code.
    pub fn value(self) -> u64 {
        match self {
            ResultCode::Ok => 0x0000_0000,
            ResultCode::Cancelled => 0x0000_0050,
            ResultCode::NoEvent => 0x0000_0008,
            ResultCode::SessionHandleInvalid => 0x0000_00b3,
            ResultCode::AttributeValueInvalid => 0x0000_0013,
            ResultCode::FunctionFailed => 0x0000_0006,
            ResultCode::ArgumentsBad => 0x0000_0007,
            ResultCode::PinIncorrect => 0x0000_00a0,
            ResultCode::PinLocked => 0x0000_00a4,
            ResultCode::TokenNotPresent => 0x0000_00e0,
            ResultCode::DeviceError => 0x0000_0030,
            ResultCode::GeneralError => 0x0000_0005,
            ResultCode::FunctionNotSupported => 0x0000_0054,
            ResultCode::MechanismInvalid => 0x0000_0070,
            ResultCode::KeyFunctionNotPermitted => 0x0000_0068,
            ResultCode::NotInitialized => 0x0000_0190,
            ResultCode::AlreadyInitialized => 0x0000_0191,
            ResultCode::Timeout => VENDOR + 1,
            ResultCode::InvalidState => VENDOR + 2,
            ResultCode::EngineUnavailable => VENDOR + 3,
            ResultCode::ProviderLoadFailed => VENDOR + 4,
            ResultCode::ProviderNotFound => VENDOR + 5,
            ResultCode::ProviderAlreadyLoaded => VENDOR + 6,
            ResultCode::ProviderBusy => VENDOR + 7,
            ResultCode::CertificateNotFound => VENDOR + 8,
            ResultCode::KeyNotFound => VENDOR + 9,
            ResultCode::SessionInvalidated => VENDOR + 10,
            ResultCode::OperationFailed => VENDOR + 11,
            ResultCode::FatalError => VENDOR + 12,
        }
    }

    /// Looks up the code for a numeric value.
    pub fn from_value(value: u64) -> Option<ResultCode> {
        Self::ALL.iter().copied().find(|code| code.value() == value)
    }

    pub fn is_ok(self) -> bool {
        self == ResultCode::Ok
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} (0x{:08x})", get_message(*self), self.value())
    }
}

/// Maps a result code to a human readable message for logging.
pub fn get_message(code: ResultCode) -> &'static str {
    match code {
        ResultCode::Ok => "Success",
        ResultCode::Cancelled => "Cancelled by user",
        ResultCode::NoEvent => "No slot event occurred",
        ResultCode::Timeout => "Operation timed out",
        ResultCode::SessionHandleInvalid => "Session handle invalid",
        ResultCode::AttributeValueInvalid => "Attribute value invalid",
        ResultCode::FunctionFailed => "Function failed",
        ResultCode::ArgumentsBad => "Bad arguments",
        ResultCode::PinIncorrect => "PIN incorrect",
        ResultCode::PinLocked => "PIN locked",
        ResultCode::TokenNotPresent => "Token not present",
        ResultCode::DeviceError => "Device error",
        ResultCode::GeneralError => "General error",
        ResultCode::FunctionNotSupported => "Function not supported",
        ResultCode::MechanismInvalid => "Mechanism not supported by token or engine",
        ResultCode::KeyFunctionNotPermitted => "Key does not permit this operation",
        ResultCode::AlreadyInitialized => "Library already initialized",
        ResultCode::NotInitialized => "Library not initialized",
        ResultCode::InvalidState => "Operation not allowed in the current state",
        ResultCode::EngineUnavailable => "Crypto engine not available",
        ResultCode::ProviderLoadFailed => "Cannot load PKCS#11 provider",
        ResultCode::ProviderNotFound => "PKCS#11 provider not registered",
        ResultCode::ProviderAlreadyLoaded => "PKCS#11 provider already registered",
        ResultCode::ProviderBusy => "PKCS#11 provider has open sessions",
        ResultCode::CertificateNotFound => "Certificate not found",
        ResultCode::KeyNotFound => "Private key not found",
        ResultCode::SessionInvalidated => "Session invalidated by token removal",
        ResultCode::OperationFailed => "Token operation failed",
        ResultCode::FatalError => "Fatal internal error, restart the library",
    }
}

//------------ Error ---------------------------------------------------------

#[derive(Debug)]
pub enum Error {
    AlreadyInitialized,
    NotInitialized,
    InvalidState(String),
    EngineUnavailable(String),
    ProviderLoadFailed { path: String, reason: String },
    ProviderNotFound(String),
    ProviderAlreadyLoaded(String),
    ProviderBusy { path: String, sessions: usize },
    ArgumentsBad(String),
    Cancelled,
    Timeout,
    PinIncorrect { token: String, retries_left: Option<u32> },
    PinLocked { token: String },
    TokenNotPresent { label: String },
    SessionInvalidated { token: String },
    CertificateNotFound,
    KeyNotFound { token: String },
    MechanismInvalid(Mechanism),
    KeyFunctionNotPermitted(&'static str),
    OperationFailed(ModuleError),
    Module(ModuleError),
    Crypto(CryptoError),
    Config(ConfigError),
    Fatal(String),
}

impl Error {
    pub fn invalid_state(s: &str) -> Self {
        Error::InvalidState(s.to_string())
    }

    pub fn bad_args(s: &str) -> Self {
        Error::ArgumentsBad(s.to_string())
    }

    /// The result code this error surfaces as.
    pub fn code(&self) -> ResultCode {
        match self {
            Error::AlreadyInitialized => ResultCode::AlreadyInitialized,
            Error::NotInitialized => ResultCode::NotInitialized,
            Error::InvalidState(_) => ResultCode::InvalidState,
            Error::EngineUnavailable(_) => ResultCode::EngineUnavailable,
            Error::ProviderLoadFailed { .. } => ResultCode::ProviderLoadFailed,
            Error::ProviderNotFound(_) => ResultCode::ProviderNotFound,
            Error::ProviderAlreadyLoaded(_) => ResultCode::ProviderAlreadyLoaded,
            Error::ProviderBusy { .. } => ResultCode::ProviderBusy,
            Error::ArgumentsBad(_) => ResultCode::ArgumentsBad,
            Error::Cancelled => ResultCode::Cancelled,
            Error::Timeout => ResultCode::Timeout,
            Error::PinIncorrect { .. } => ResultCode::PinIncorrect,
            Error::PinLocked { .. } => ResultCode::PinLocked,
            Error::TokenNotPresent { .. } => ResultCode::TokenNotPresent,
            Error::SessionInvalidated { .. } => ResultCode::SessionInvalidated,
            Error::CertificateNotFound => ResultCode::CertificateNotFound,
            Error::KeyNotFound { .. } => ResultCode::KeyNotFound,
            Error::MechanismInvalid(_) => ResultCode::MechanismInvalid,
            Error::KeyFunctionNotPermitted(_) => ResultCode::KeyFunctionNotPermitted,
            Error::OperationFailed(_) => ResultCode::OperationFailed,
            Error::Module(err) => err.rv.result_code(),
            Error::Crypto(_) => ResultCode::FunctionFailed,
            Error::Config(_) => ResultCode::ArgumentsBad,
            Error::Fatal(_) => ResultCode::FatalError,
        }
    }

    /// Fatal errors leave the library in an unknown state, the caller should
    /// terminate it and start over.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }

    /// The status code of the PKCS#11 module, if the error came from one.
    pub fn provider_status(&self) -> Option<u64> {
        match self {
            Error::OperationFailed(err) | Error::Module(err) => Some(err.rv.value()),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::AlreadyInitialized => write!(f, "Library is already initialized"),
            Error::NotInitialized => write!(f, "Library is not initialized"),
            Error::InvalidState(s) => write!(f, "Invalid state: {}", s),
            Error::EngineUnavailable(s) => write!(f, "Crypto engine '{}' is not available", s),
            Error::ProviderLoadFailed { path, reason } => {
                write!(f, "Cannot load PKCS#11 provider '{}': {}", path, reason)
            }
            Error::ProviderNotFound(path) => write!(f, "No PKCS#11 provider registered for '{}'", path),
            Error::ProviderAlreadyLoaded(path) => write!(f, "PKCS#11 provider '{}' is already registered", path),
            Error::ProviderBusy { path, sessions } => write!(
                f,
                "PKCS#11 provider '{}' cannot be removed while {} session(s) are open",
                path, sessions
            ),
            Error::ArgumentsBad(s) => write!(f, "Bad arguments: {}", s),
            Error::Cancelled => write!(f, "Cancelled by user"),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::PinIncorrect { token, retries_left } => match retries_left {
                Some(n) => write!(f, "Incorrect PIN for token '{}', {} attempt(s) left", token, n),
                None => write!(f, "Incorrect PIN for token '{}'", token),
            },
            Error::PinLocked { token } => write!(f, "PIN of token '{}' is locked", token),
            Error::TokenNotPresent { label } => write!(f, "Token '{}' is not present", label),
            Error::SessionInvalidated { token } => {
                write!(f, "Session with token '{}' was invalidated by token removal", token)
            }
            Error::CertificateNotFound => write!(f, "No certificate matches the criteria"),
            Error::KeyNotFound { token } => write!(f, "No private key for certificate on token '{}'", token),
            Error::MechanismInvalid(mech) => write!(f, "Mechanism {} is not supported", mech),
            Error::KeyFunctionNotPermitted(op) => write!(f, "Key does not permit '{}'", op),
            Error::OperationFailed(err) => write!(f, "Token operation failed: {}", err),
            Error::Module(err) => write!(f, "{}", err),
            Error::Crypto(err) => write!(f, "{}", err),
            Error::Config(err) => write!(f, "Configuration error: {}", err),
            Error::Fatal(s) => write!(f, "Fatal error: {}", s),
        }
    }
}

impl std::error::Error for Error {}

impl From<ModuleError> for Error {
    fn from(err: ModuleError) -> Self {
        Error::Module(err)
    }
}

impl From<CryptoError> for Error {
    fn from(err: CryptoError) -> Self {
        Error::Crypto(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(err: PoisonError<T>) -> Self {
        Error::Fatal(format!("lock poisoned: {}", err))
    }
}

impl Rv {
    /// The public result code a raw module status surfaces as.
    pub fn result_code(self) -> ResultCode {
        match self {
            Rv::FunctionCanceled => ResultCode::Cancelled,
            Rv::NoEvent => ResultCode::NoEvent,
            Rv::SessionHandleInvalid | Rv::SessionClosed => ResultCode::SessionHandleInvalid,
            Rv::AttributeValueInvalid => ResultCode::AttributeValueInvalid,
            Rv::ArgumentsBad => ResultCode::ArgumentsBad,
            Rv::PinIncorrect => ResultCode::PinIncorrect,
            Rv::PinLocked => ResultCode::PinLocked,
            Rv::TokenNotPresent | Rv::DeviceRemoved => ResultCode::TokenNotPresent,
            Rv::DeviceError | Rv::DeviceMemory => ResultCode::DeviceError,
            Rv::GeneralError => ResultCode::GeneralError,
            Rv::FunctionNotSupported => ResultCode::FunctionNotSupported,
            Rv::MechanismInvalid => ResultCode::MechanismInvalid,
            Rv::KeyFunctionNotPermitted => ResultCode::KeyFunctionNotPermitted,
            Rv::CryptokiNotInitialized => ResultCode::NotInitialized,
            Rv::CryptokiAlreadyInitialized => ResultCode::AlreadyInitialized,
            _ => ResultCode::FunctionFailed,
        }
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_code_has_a_message_and_unique_value() {
        let mut seen = std::collections::HashSet::new();
        for code in ResultCode::ALL {
            assert!(!get_message(code).is_empty());
            assert!(seen.insert(code.value()), "duplicate value for {:?}", code);
            assert_eq!(ResultCode::from_value(code.value()), Some(code));
        }
    }

    #[test]
    fn standard_codes_match_pkcs11() {
        assert_eq!(ResultCode::PinIncorrect.value(), 0xa0);
        assert_eq!(ResultCode::TokenNotPresent.value(), 0xe0);
        assert_eq!(ResultCode::AlreadyInitialized.value(), 0x191);
        assert!(ResultCode::ProviderLoadFailed.value() >= VENDOR);
    }

    #[test]
    fn module_errors_keep_the_provider_status() {
        let err = Error::OperationFailed(ModuleError::new(Rv::DataLenRange, "C_Sign"));
        assert_eq!(err.code(), ResultCode::OperationFailed);
        assert_eq!(err.provider_status(), Some(0x21));

        let err = Error::Module(ModuleError::new(Rv::PinLocked, "C_Login"));
        assert_eq!(err.code(), ResultCode::PinLocked);
    }

    #[test]
    fn pin_incorrect_mentions_retries() {
        let err = Error::PinIncorrect {
            token: "My Token".to_string(),
            retries_left: Some(2),
        };
        assert_eq!(err.to_string(), "Incorrect PIN for token 'My Token', 2 attempt(s) left");
    }
}
