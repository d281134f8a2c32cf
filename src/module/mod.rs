//! Access to loaded PKCS#11 modules.
//!
//! The [`Module`] trait is the seam between the token logic of this crate
//! and the actual PKCS#11 library. [`cryptoki::CryptokiLoader`] loads real
//! shared libraries, [`soft::SoftModuleLoader`] hands out in-process
//! software tokens.

pub mod cryptoki;
pub mod retry;
pub mod soft;

use std::{fmt, sync::Arc, time::Duration};

use secrecy::SecretString;

use crate::crypto::Mechanism;

pub type SlotId = u64;
pub type SessionHandle = u64;
pub type ObjectHandle = u64;

//------------ Rv ------------------------------------------------------------

/// A PKCS#11 return value other than `CKR_OK`.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Rv {
    HostMemory,
    SlotIdInvalid,
    GeneralError,
    FunctionFailed,
    ArgumentsBad,
    NoEvent,
    AttributeTypeInvalid,
    AttributeValueInvalid,
    DataInvalid,
    DataLenRange,
    DeviceError,
    DeviceMemory,
    DeviceRemoved,
    EncryptedDataInvalid,
    FunctionCanceled,
    FunctionNotSupported,
    KeyHandleInvalid,
    KeyTypeInconsistent,
    KeyFunctionNotPermitted,
    MechanismInvalid,
    ObjectHandleInvalid,
    OperationActive,
    PinIncorrect,
    PinExpired,
    PinLocked,
    SessionClosed,
    SessionCount,
    SessionHandleInvalid,
    TokenNotPresent,
    TokenNotRecognized,
    UserAlreadyLoggedIn,
    UserNotLoggedIn,
    UserPinNotInitialized,
    CryptokiNotInitialized,
    CryptokiAlreadyInitialized,
    Other(u64),
}

impl Rv {
    pub fn value(self) -> u64 {
        match self {
            Rv::HostMemory => 0x02,
            Rv::SlotIdInvalid => 0x03,
            Rv::GeneralError => 0x05,
            Rv::FunctionFailed => 0x06,
            Rv::ArgumentsBad => 0x07,
            Rv::NoEvent => 0x08,
            Rv::AttributeTypeInvalid => 0x12,
            Rv::AttributeValueInvalid => 0x13,
            Rv::DataInvalid => 0x20,
            Rv::DataLenRange => 0x21,
            Rv::DeviceError => 0x30,
            Rv::DeviceMemory => 0x31,
            Rv::DeviceRemoved => 0x32,
            Rv::EncryptedDataInvalid => 0x40,
            Rv::FunctionCanceled => 0x50,
            Rv::FunctionNotSupported => 0x54,
            Rv::KeyHandleInvalid => 0x60,
            Rv::KeyTypeInconsistent => 0x63,
            Rv::KeyFunctionNotPermitted => 0x68,
            Rv::MechanismInvalid => 0x70,
            Rv::ObjectHandleInvalid => 0x82,
            Rv::OperationActive => 0x90,
            Rv::PinIncorrect => 0xa0,
            Rv::PinExpired => 0xa3,
            Rv::PinLocked => 0xa4,
            Rv::SessionClosed => 0xb0,
            Rv::SessionCount => 0xb1,
            Rv::SessionHandleInvalid => 0xb3,
            Rv::TokenNotPresent => 0xe0,
            Rv::TokenNotRecognized => 0xe1,
            Rv::UserAlreadyLoggedIn => 0x100,
            Rv::UserNotLoggedIn => 0x101,
            Rv::UserPinNotInitialized => 0x102,
            Rv::CryptokiNotInitialized => 0x190,
            Rv::CryptokiAlreadyInitialized => 0x191,
            Rv::Other(value) => value,
        }
    }

    /// Statuses telling that the token or the session with it is gone.
    ///
    /// These are never retried by the library. The caller decides whether
    /// to wait for the token to come back.
    pub fn is_token_gone(self) -> bool {
        matches!(
            self,
            Rv::TokenNotPresent
                | Rv::TokenNotRecognized
                | Rv::DeviceRemoved
                | Rv::SessionClosed
                | Rv::SessionHandleInvalid
        )
    }

    /// Statuses for which an immediate retry of a read-only query might
    /// succeed.
    pub fn is_transient(self) -> bool {
        match self {
            Rv::HostMemory => true,
            Rv::SlotIdInvalid => true, // the slot may be in the middle of being created
            Rv::GeneralError => true,
            Rv::FunctionFailed => true,
            Rv::DeviceError => true,
            Rv::DeviceMemory => true,
            Rv::OperationActive => true,
            Rv::SessionCount => true, // another session may close in the meantime
            _ => false,
        }
    }
}

impl fmt::Display for Rv {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Rv::Other(value) => write!(f, "CKR 0x{:08x}", value),
            other => write!(f, "{:?} (0x{:08x})", other, other.value()),
        }
    }
}

//------------ ModuleError ---------------------------------------------------

/// A PKCS#11 call that did not return `CKR_OK`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ModuleError {
    pub rv: Rv,
    pub function: &'static str,
    pub detail: Option<String>,
}

impl ModuleError {
    pub fn new(rv: Rv, function: &'static str) -> Self {
        ModuleError {
            rv,
            function,
            detail: None,
        }
    }

    pub fn with_detail(rv: Rv, function: &'static str, detail: impl fmt::Display) -> Self {
        ModuleError {
            rv,
            function,
            detail: Some(detail.to_string()),
        }
    }
}

impl fmt::Display for ModuleError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}() returned {}: {}", self.function, self.rv, detail),
            None => write!(f, "{}() returned {}", self.function, self.rv),
        }
    }
}

impl std::error::Error for ModuleError {}

//------------ Info structures -----------------------------------------------

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ModuleInfo {
    pub manufacturer: String,
    pub description: String,
    pub library_version: String,
    pub cryptoki_version: String,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SlotInfo {
    pub description: String,
    pub token_present: bool,
    pub removable: bool,
    pub hardware: bool,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TokenInfo {
    pub label: String,
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
    pub login_required: bool,
    pub protected_auth_path: bool,
    pub user_pin_locked: bool,
    pub user_pin_final_try: bool,
    pub user_pin_count_low: bool,

    /// Modules that know the exact number of remaining PIN attempts report
    /// it here, others only set the flags above.
    pub user_pin_retries_left: Option<u32>,
}

impl TokenInfo {
    /// The best known number of remaining PIN attempts.
    pub fn retries_left(&self) -> Option<u32> {
        if self.user_pin_retries_left.is_some() {
            self.user_pin_retries_left
        } else if self.user_pin_locked {
            Some(0)
        } else if self.user_pin_final_try {
            Some(1)
        } else {
            None
        }
    }
}

//------------ Objects and attributes ----------------------------------------

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ObjectClass {
    Certificate,
    PublicKey,
    PrivateKey,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum KeyType {
    Rsa,
    Ec,
    Other,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum AttributeType {
    Class,
    Id,
    Label,
    Value,
    KeyType,
    Modulus,
    Sign,
    Decrypt,
    Private,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Attribute {
    Class(ObjectClass),
    Id(Vec<u8>),
    Label(String),
    Value(Vec<u8>),
    KeyType(KeyType),
    Modulus(Vec<u8>),
    Sign(bool),
    Decrypt(bool),
    Private(bool),
}

impl Attribute {
    pub fn attribute_type(&self) -> AttributeType {
        match self {
            Attribute::Class(_) => AttributeType::Class,
            Attribute::Id(_) => AttributeType::Id,
            Attribute::Label(_) => AttributeType::Label,
            Attribute::Value(_) => AttributeType::Value,
            Attribute::KeyType(_) => AttributeType::KeyType,
            Attribute::Modulus(_) => AttributeType::Modulus,
            Attribute::Sign(_) => AttributeType::Sign,
            Attribute::Decrypt(_) => AttributeType::Decrypt,
            Attribute::Private(_) => AttributeType::Private,
        }
    }
}

//------------ Module --------------------------------------------------------

/// One loaded and initialized PKCS#11 module.
///
/// Implementations map each function onto the matching `C_*` call and
/// report failures as [`ModuleError`]s. Callers serialize access through a
/// provider wide lock when [`Module::is_thread_safe`] returns false.
pub trait Module: Send + Sync + fmt::Debug {
    fn info(&self) -> Result<ModuleInfo, ModuleError>;

    fn slots(&self, token_present: bool) -> Result<Vec<SlotId>, ModuleError>;

    fn slot_info(&self, slot: SlotId) -> Result<SlotInfo, ModuleError>;

    fn token_info(&self, slot: SlotId) -> Result<TokenInfo, ModuleError>;

    fn mechanisms(&self, slot: SlotId) -> Result<Vec<Mechanism>, ModuleError>;

    /// Whether [`Module::wait_for_slot_event`] is backed by the module.
    fn supports_slot_events(&self) -> bool;

    /// Waits at most `timeout` for a slot event, returning the slot it
    /// happened in.
    fn wait_for_slot_event(&self, timeout: Duration) -> Result<Option<SlotId>, ModuleError>;

    fn is_thread_safe(&self) -> bool {
        true
    }

    fn open_session(&self, slot: SlotId) -> Result<SessionHandle, ModuleError>;

    fn close_session(&self, session: SessionHandle) -> Result<(), ModuleError>;

    /// Whether the token considers the user logged in on this session.
    fn is_logged_in(&self, session: SessionHandle) -> Result<bool, ModuleError>;

    /// Logs the user in. A `None` PIN uses the protected authentication
    /// path of the token.
    fn login(&self, session: SessionHandle, pin: Option<&SecretString>) -> Result<(), ModuleError>;

    fn logout(&self, session: SessionHandle) -> Result<(), ModuleError>;

    fn find_objects(&self, session: SessionHandle, template: &[Attribute]) -> Result<Vec<ObjectHandle>, ModuleError>;

    /// Reads attributes of an object. Attributes the object does not have
    /// are left out of the result.
    fn attributes(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        types: &[AttributeType],
    ) -> Result<Vec<Attribute>, ModuleError>;

    fn sign(
        &self,
        session: SessionHandle,
        mechanism: Mechanism,
        key: ObjectHandle,
        data: &[u8],
    ) -> Result<Vec<u8>, ModuleError>;

    fn decrypt(
        &self,
        session: SessionHandle,
        mechanism: Mechanism,
        key: ObjectHandle,
        data: &[u8],
    ) -> Result<Vec<u8>, ModuleError>;
}

//------------ ModuleLoader --------------------------------------------------

/// Turns a provider path into a loaded, initialized module.
pub trait ModuleLoader: Send + Sync + fmt::Debug {
    fn load(&self, path: &str) -> Result<Arc<dyn Module>, LoadError>;
}

#[derive(Clone, Debug)]
pub struct LoadError(pub String);

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Finds an attribute of the given type in a list returned by
/// [`Module::attributes`].
pub fn find_attribute(attributes: &[Attribute], attr_type: AttributeType) -> Option<&Attribute> {
    attributes.iter().find(|attr| attr.attribute_type() == attr_type)
}
