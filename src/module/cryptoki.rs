//! PKCS#11 modules loaded from shared libraries through the `cryptoki`
//! crate.

use std::{
    collections::HashMap,
    fmt,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    thread,
    time::{Duration, Instant},
};

use cryptoki::{
    context::{CInitializeArgs, Pkcs11},
    error::{Error as CkError, RvError},
    mechanism::{Mechanism as CkMechanism, MechanismType},
    object::{
        Attribute as CkAttribute, AttributeType as CkAttributeType, KeyType as CkKeyType,
        ObjectClass as CkObjectClass, ObjectHandle as CkObjectHandle,
    },
    session::{Session, SessionState, UserType},
    slot::Slot,
};
use lazy_static::lazy_static;
use log::{debug, error, trace, warn};
use secrecy::SecretString;

use crate::crypto::Mechanism;

use super::{
    Attribute, AttributeType, KeyType, LoadError, Module, ModuleError, ModuleInfo, ModuleLoader, ObjectClass,
    ObjectHandle, Rv, SessionHandle, SlotId, SlotInfo, TokenInfo,
};

/// How often the non-blocking slot event call is repeated while waiting.
const SLOT_EVENT_POLL: Duration = Duration::from_millis(50);

lazy_static! {
    /// Loaded libraries by file name.
    ///
    /// Each library must be initialized only once per process, however many
    /// providers register it. Prior to initialization the only thing that
    /// tells libraries apart is their path, and two paths can point at the
    /// same file. The file name is used as the key so that two copies of one
    /// library are never loaded side by side. The map holds weak references
    /// so a library is finalized and unloaded when its last provider goes.
    static ref LIBRARIES: Mutex<HashMap<String, Weak<CryptokiLibrary>>> = Mutex::new(HashMap::new());
}

//------------ CryptokiLibrary -----------------------------------------------

struct CryptokiLibrary {
    lib_file_name: String,
    pkcs11: Pkcs11,
    slot_events: bool,
}

impl fmt::Debug for CryptokiLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptokiLibrary")
            .field("lib_file_name", &self.lib_file_name)
            .field("slot_events", &self.slot_events)
            .finish()
    }
}

impl CryptokiLibrary {
    fn get_or_load(lib_path: &Path) -> Result<Arc<Self>, LoadError> {
        let lib_file_name = lib_path
            .file_name()
            .ok_or_else(|| {
                LoadError(format!(
                    "PKCS#11 library path '{}' does not point to a file",
                    lib_path.display()
                ))
            })?
            .to_string_lossy()
            .to_string();

        let mut libraries = LIBRARIES
            .lock()
            .map_err(|_| LoadError("PKCS#11 library registry lock poisoned".to_string()))?;

        if let Some(library) = libraries.get(&lib_file_name).and_then(Weak::upgrade) {
            debug!("Reusing loaded PKCS#11 library '{}'", lib_file_name);
            return Ok(library);
        }

        let pkcs11 = Pkcs11::new(lib_path).map_err(|err| {
            error!("Failed to load PKCS#11 library '{}': {}", lib_path.display(), err);
            LoadError(err.to_string())
        })?;

        match pkcs11.initialize(CInitializeArgs::OsThreads) {
            Ok(()) => {}
            Err(CkError::Pkcs11(RvError::CryptokiAlreadyInitialized, ..)) => {
                warn!(
                    "PKCS#11 library '{}' was already initialized by another component of this process",
                    lib_file_name
                );
            }
            Err(err) => {
                error!("Failed to initialize PKCS#11 library '{}': {}", lib_file_name, err);
                return Err(LoadError(format!("C_Initialize failed: {}", err)));
            }
        }

        // Checked once per load, before any provider has scanned the
        // library. An event taken here is covered by that first scan.
        let slot_events = match pkcs11.get_slot_event() {
            Ok(_) => true,
            Err(CkError::NotSupported) | Err(CkError::Pkcs11(RvError::FunctionNotSupported, ..)) => false,
            Err(err) => {
                debug!(
                    "Non-blocking C_WaitForSlotEvent() for '{}' failed, assuming no support: {}",
                    lib_file_name, err
                );
                false
            }
        };

        let library = Arc::new(CryptokiLibrary {
            lib_file_name: lib_file_name.clone(),
            pkcs11,
            slot_events,
        });
        libraries.insert(lib_file_name, Arc::downgrade(&library));
        Ok(library)
    }
}

//------------ CryptokiLoader ------------------------------------------------

/// Loads PKCS#11 shared libraries from the file system.
#[derive(Debug, Default)]
pub struct CryptokiLoader;

impl ModuleLoader for CryptokiLoader {
    fn load(&self, path: &str) -> Result<Arc<dyn Module>, LoadError> {
        let library = CryptokiLibrary::get_or_load(Path::new(path))?;
        Ok(Arc::new(CryptokiModule::new(library)))
    }
}

//------------ CryptokiModule ------------------------------------------------

struct OpenSession {
    session: Session,

    /// Object handles handed out for this session, indexed by the
    /// [`ObjectHandle`] value given to the caller.
    objects: Vec<CkObjectHandle>,
}

pub struct CryptokiModule {
    library: Arc<CryptokiLibrary>,
    slots: Mutex<HashMap<SlotId, Slot>>,
    sessions: Mutex<HashMap<SessionHandle, Arc<Mutex<OpenSession>>>>,
    next_session: AtomicU64,
}

impl fmt::Debug for CryptokiModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptokiModule")
            .field("library", &self.library)
            .finish()
    }
}

impl CryptokiModule {
    fn new(library: Arc<CryptokiLibrary>) -> Self {
        CryptokiModule {
            library,
            slots: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
        }
    }

    fn pkcs11(&self) -> &Pkcs11 {
        &self.library.pkcs11
    }

    fn slot(&self, id: SlotId) -> Result<Slot, ModuleError> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| ModuleError::new(Rv::GeneralError, "C_GetSlotList"))?;
        if let Some(slot) = slots.get(&id) {
            return Ok(*slot);
        }
        for slot in self.pkcs11().get_all_slots().map_err(ck_err("C_GetSlotList"))? {
            slots.insert(slot.id(), slot);
        }
        slots
            .get(&id)
            .copied()
            .ok_or_else(|| ModuleError::new(Rv::SlotIdInvalid, "C_GetSlotList"))
    }

    fn session(&self, handle: SessionHandle, function: &'static str) -> Result<Arc<Mutex<OpenSession>>, ModuleError> {
        let sessions = self
            .sessions
            .lock()
            .map_err(|_| ModuleError::new(Rv::GeneralError, function))?;
        sessions
            .get(&handle)
            .cloned()
            .ok_or_else(|| ModuleError::new(Rv::SessionHandleInvalid, function))
    }

    fn with_session<T, F>(&self, handle: SessionHandle, function: &'static str, op: F) -> Result<T, ModuleError>
    where
        F: FnOnce(&mut OpenSession) -> Result<T, ModuleError>,
    {
        let session = self.session(handle, function)?;
        let mut session = session
            .lock()
            .map_err(|_| ModuleError::new(Rv::GeneralError, function))?;
        let res = op(&mut session);
        trace!("{}() on session {}: {}", function, handle, if res.is_ok() { "ok" } else { "failed" });
        res
    }

    fn object(session: &OpenSession, handle: ObjectHandle, function: &'static str) -> Result<CkObjectHandle, ModuleError> {
        session
            .objects
            .get(handle as usize)
            .copied()
            .ok_or_else(|| ModuleError::new(Rv::ObjectHandleInvalid, function))
    }
}

impl Module for CryptokiModule {
    fn info(&self) -> Result<ModuleInfo, ModuleError> {
        let info = self.pkcs11().get_library_info().map_err(ck_err("C_GetInfo"))?;
        trace!("C_GetInfo(): {:?}", info);
        Ok(ModuleInfo {
            manufacturer: info.manufacturer_id().trim().to_string(),
            description: info.library_description().trim().to_string(),
            library_version: format!("{}.{}", info.library_version().major(), info.library_version().minor()),
            cryptoki_version: format!("{}.{}", info.cryptoki_version().major(), info.cryptoki_version().minor()),
        })
    }

    fn slots(&self, token_present: bool) -> Result<Vec<SlotId>, ModuleError> {
        let slots = if token_present {
            self.pkcs11().get_slots_with_token()
        } else {
            self.pkcs11().get_all_slots()
        }
        .map_err(ck_err("C_GetSlotList"))?;

        let mut known = self
            .slots
            .lock()
            .map_err(|_| ModuleError::new(Rv::GeneralError, "C_GetSlotList"))?;
        let mut ids = Vec::with_capacity(slots.len());
        for slot in slots {
            known.insert(slot.id(), slot);
            ids.push(slot.id());
        }
        Ok(ids)
    }

    fn slot_info(&self, slot: SlotId) -> Result<SlotInfo, ModuleError> {
        let info = self
            .pkcs11()
            .get_slot_info(self.slot(slot)?)
            .map_err(ck_err("C_GetSlotInfo"))?;
        trace!("C_GetSlotInfo({}): {:?}", slot, info);
        Ok(SlotInfo {
            description: info.slot_description().trim().to_string(),
            token_present: info.token_present(),
            removable: info.removable_device(),
            hardware: info.hardware_slot(),
        })
    }

    fn token_info(&self, slot: SlotId) -> Result<TokenInfo, ModuleError> {
        let info = self
            .pkcs11()
            .get_token_info(self.slot(slot)?)
            .map_err(ck_err("C_GetTokenInfo"))?;
        trace!("C_GetTokenInfo({}): {:?}", slot, info);
        Ok(TokenInfo {
            label: info.label().trim().to_string(),
            manufacturer: info.manufacturer_id().trim().to_string(),
            model: info.model().trim().to_string(),
            serial: info.serial_number().trim().to_string(),
            login_required: info.login_required(),
            protected_auth_path: info.protected_authentication_path(),
            user_pin_locked: info.user_pin_locked(),
            user_pin_final_try: info.user_pin_final_try(),
            user_pin_count_low: info.user_pin_count_low(),
            user_pin_retries_left: None,
        })
    }

    fn mechanisms(&self, slot: SlotId) -> Result<Vec<Mechanism>, ModuleError> {
        let types = self
            .pkcs11()
            .get_mechanism_list(self.slot(slot)?)
            .map_err(ck_err("C_GetMechanismList"))?;
        Ok(types.iter().filter_map(mechanism_from_ck).collect())
    }

    fn supports_slot_events(&self) -> bool {
        self.library.slot_events
    }

    fn wait_for_slot_event(&self, timeout: Duration) -> Result<Option<SlotId>, ModuleError> {
        // The blocking variant of C_WaitForSlotEvent cannot be interrupted
        // short of finalizing the library, so poll the non-blocking one.
        let started = Instant::now();
        loop {
            if let Some(slot) = self.pkcs11().get_slot_event().map_err(ck_err("C_WaitForSlotEvent"))? {
                return Ok(Some(slot.id()));
            }
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Ok(None);
            }
            thread::sleep(SLOT_EVENT_POLL.min(timeout - elapsed));
        }
    }

    fn open_session(&self, slot: SlotId) -> Result<SessionHandle, ModuleError> {
        let session = self
            .pkcs11()
            .open_ro_session(self.slot(slot)?)
            .map_err(ck_err("C_OpenSession"))?;

        let handle = self.next_session.fetch_add(1, Ordering::Relaxed);
        self.sessions
            .lock()
            .map_err(|_| ModuleError::new(Rv::GeneralError, "C_OpenSession"))?
            .insert(
                handle,
                Arc::new(Mutex::new(OpenSession {
                    session,
                    objects: Vec::new(),
                })),
            );
        trace!("C_OpenSession({}): session {}", slot, handle);
        Ok(handle)
    }

    fn close_session(&self, session: SessionHandle) -> Result<(), ModuleError> {
        // C_CloseSession is called when the cryptoki session is dropped.
        let removed = self
            .sessions
            .lock()
            .map_err(|_| ModuleError::new(Rv::GeneralError, "C_CloseSession"))?
            .remove(&session);
        match removed {
            Some(_) => {
                trace!("C_CloseSession({})", session);
                Ok(())
            }
            None => Err(ModuleError::new(Rv::SessionHandleInvalid, "C_CloseSession")),
        }
    }

    fn is_logged_in(&self, session: SessionHandle) -> Result<bool, ModuleError> {
        self.with_session(session, "C_GetSessionInfo", |open| {
            let info = open.session.get_session_info().map_err(ck_err("C_GetSessionInfo"))?;
            Ok(matches!(
                info.session_state(),
                SessionState::RoUser | SessionState::RwUser | SessionState::RwSecurityOfficer
            ))
        })
    }

    fn login(&self, session: SessionHandle, pin: Option<&SecretString>) -> Result<(), ModuleError> {
        self.with_session(session, "C_Login", |open| {
            open.session.login(UserType::User, pin).map_err(ck_err("C_Login"))
        })
    }

    fn logout(&self, session: SessionHandle) -> Result<(), ModuleError> {
        self.with_session(session, "C_Logout", |open| open.session.logout().map_err(ck_err("C_Logout")))
    }

    fn find_objects(&self, session: SessionHandle, template: &[Attribute]) -> Result<Vec<ObjectHandle>, ModuleError> {
        let template: Vec<CkAttribute> = template.iter().filter_map(attribute_to_ck).collect();
        self.with_session(session, "C_FindObjects", |open| {
            let found = open.session.find_objects(&template).map_err(ck_err("C_FindObjects"))?;
            let mut handles = Vec::with_capacity(found.len());
            for object in found {
                let index = match open.objects.iter().position(|known| *known == object) {
                    Some(index) => index,
                    None => {
                        open.objects.push(object);
                        open.objects.len() - 1
                    }
                };
                handles.push(index as ObjectHandle);
            }
            Ok(handles)
        })
    }

    fn attributes(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        types: &[AttributeType],
    ) -> Result<Vec<Attribute>, ModuleError> {
        let types: Vec<CkAttributeType> = types.iter().map(|t| attribute_type_to_ck(*t)).collect();
        self.with_session(session, "C_GetAttributeValue", |open| {
            let object = Self::object(open, object, "C_GetAttributeValue")?;
            let attributes = open
                .session
                .get_attributes(object, &types)
                .map_err(ck_err("C_GetAttributeValue"))?;
            Ok(attributes.iter().filter_map(attribute_from_ck).collect())
        })
    }

    fn sign(
        &self,
        session: SessionHandle,
        mechanism: Mechanism,
        key: ObjectHandle,
        data: &[u8],
    ) -> Result<Vec<u8>, ModuleError> {
        self.with_session(session, "C_Sign", |open| {
            let key = Self::object(open, key, "C_Sign")?;
            open.session
                .sign(&mechanism_to_ck(mechanism), key, data)
                .map_err(ck_err("C_Sign"))
        })
    }

    fn decrypt(
        &self,
        session: SessionHandle,
        mechanism: Mechanism,
        key: ObjectHandle,
        data: &[u8],
    ) -> Result<Vec<u8>, ModuleError> {
        self.with_session(session, "C_Decrypt", |open| {
            let key = Self::object(open, key, "C_Decrypt")?;
            open.session
                .decrypt(&mechanism_to_ck(mechanism), key, data)
                .map_err(ck_err("C_Decrypt"))
        })
    }
}

//------------ Conversions ---------------------------------------------------

fn ck_err(function: &'static str) -> impl Fn(CkError) -> ModuleError {
    move |err| match &err {
        CkError::Pkcs11(rv, ..) => ModuleError::new(rv_from_ck(rv), function),
        CkError::NotSupported => ModuleError::new(Rv::FunctionNotSupported, function),
        _ => ModuleError::with_detail(Rv::FunctionFailed, function, &err),
    }
}

fn rv_from_ck(rv: &RvError) -> Rv {
    match rv {
        RvError::HostMemory => Rv::HostMemory,
        RvError::SlotIdInvalid => Rv::SlotIdInvalid,
        RvError::GeneralError => Rv::GeneralError,
        RvError::FunctionFailed => Rv::FunctionFailed,
        RvError::ArgumentsBad => Rv::ArgumentsBad,
        RvError::NoEvent => Rv::NoEvent,
        RvError::AttributeTypeInvalid => Rv::AttributeTypeInvalid,
        RvError::AttributeValueInvalid => Rv::AttributeValueInvalid,
        RvError::DataInvalid => Rv::DataInvalid,
        RvError::DataLenRange => Rv::DataLenRange,
        RvError::DeviceError => Rv::DeviceError,
        RvError::DeviceMemory => Rv::DeviceMemory,
        RvError::DeviceRemoved => Rv::DeviceRemoved,
        RvError::EncryptedDataInvalid => Rv::EncryptedDataInvalid,
        RvError::FunctionCanceled => Rv::FunctionCanceled,
        RvError::FunctionNotSupported => Rv::FunctionNotSupported,
        RvError::KeyHandleInvalid => Rv::KeyHandleInvalid,
        RvError::KeyTypeInconsistent => Rv::KeyTypeInconsistent,
        RvError::KeyFunctionNotPermitted => Rv::KeyFunctionNotPermitted,
        RvError::MechanismInvalid => Rv::MechanismInvalid,
        RvError::ObjectHandleInvalid => Rv::ObjectHandleInvalid,
        RvError::OperationActive => Rv::OperationActive,
        RvError::PinIncorrect => Rv::PinIncorrect,
        RvError::PinExpired => Rv::PinExpired,
        RvError::PinLocked => Rv::PinLocked,
        RvError::SessionClosed => Rv::SessionClosed,
        RvError::SessionCount => Rv::SessionCount,
        RvError::SessionHandleInvalid => Rv::SessionHandleInvalid,
        RvError::TokenNotPresent => Rv::TokenNotPresent,
        RvError::TokenNotRecognized => Rv::TokenNotRecognized,
        RvError::UserAlreadyLoggedIn => Rv::UserAlreadyLoggedIn,
        RvError::UserNotLoggedIn => Rv::UserNotLoggedIn,
        RvError::UserPinNotInitialized => Rv::UserPinNotInitialized,
        RvError::CryptokiNotInitialized => Rv::CryptokiNotInitialized,
        RvError::CryptokiAlreadyInitialized => Rv::CryptokiAlreadyInitialized,
        _ => Rv::FunctionFailed,
    }
}

fn mechanism_to_ck(mechanism: Mechanism) -> CkMechanism<'static> {
    match mechanism {
        Mechanism::RsaPkcs => CkMechanism::RsaPkcs,
        Mechanism::RsaX509 => CkMechanism::RsaX509,
        Mechanism::Sha1RsaPkcs => CkMechanism::Sha1RsaPkcs,
        Mechanism::Sha256RsaPkcs => CkMechanism::Sha256RsaPkcs,
        Mechanism::Sha384RsaPkcs => CkMechanism::Sha384RsaPkcs,
        Mechanism::Sha512RsaPkcs => CkMechanism::Sha512RsaPkcs,
    }
}

fn mechanism_from_ck(mechanism_type: &MechanismType) -> Option<Mechanism> {
    let known = [
        (MechanismType::RSA_PKCS, Mechanism::RsaPkcs),
        (MechanismType::RSA_X_509, Mechanism::RsaX509),
        (MechanismType::SHA1_RSA_PKCS, Mechanism::Sha1RsaPkcs),
        (MechanismType::SHA256_RSA_PKCS, Mechanism::Sha256RsaPkcs),
        (MechanismType::SHA384_RSA_PKCS, Mechanism::Sha384RsaPkcs),
        (MechanismType::SHA512_RSA_PKCS, Mechanism::Sha512RsaPkcs),
    ];
    known
        .iter()
        .find(|(ck, _)| ck == mechanism_type)
        .map(|(_, mechanism)| *mechanism)
}

fn attribute_type_to_ck(attr_type: AttributeType) -> CkAttributeType {
    match attr_type {
        AttributeType::Class => CkAttributeType::Class,
        AttributeType::Id => CkAttributeType::Id,
        AttributeType::Label => CkAttributeType::Label,
        AttributeType::Value => CkAttributeType::Value,
        AttributeType::KeyType => CkAttributeType::KeyType,
        AttributeType::Modulus => CkAttributeType::Modulus,
        AttributeType::Sign => CkAttributeType::Sign,
        AttributeType::Decrypt => CkAttributeType::Decrypt,
        AttributeType::Private => CkAttributeType::Private,
    }
}

fn attribute_to_ck(attr: &Attribute) -> Option<CkAttribute> {
    let attr = match attr {
        Attribute::Class(ObjectClass::Certificate) => CkAttribute::Class(CkObjectClass::CERTIFICATE),
        Attribute::Class(ObjectClass::PublicKey) => CkAttribute::Class(CkObjectClass::PUBLIC_KEY),
        Attribute::Class(ObjectClass::PrivateKey) => CkAttribute::Class(CkObjectClass::PRIVATE_KEY),
        Attribute::Id(id) => CkAttribute::Id(id.clone()),
        Attribute::Label(label) => CkAttribute::Label(label.as_bytes().to_vec()),
        Attribute::Value(value) => CkAttribute::Value(value.clone()),
        Attribute::KeyType(KeyType::Rsa) => CkAttribute::KeyType(CkKeyType::RSA),
        Attribute::KeyType(KeyType::Ec) => CkAttribute::KeyType(CkKeyType::EC),
        Attribute::KeyType(KeyType::Other) => return None,
        Attribute::Modulus(modulus) => CkAttribute::Modulus(modulus.clone()),
        Attribute::Sign(sign) => CkAttribute::Sign(*sign),
        Attribute::Decrypt(decrypt) => CkAttribute::Decrypt(*decrypt),
        Attribute::Private(private) => CkAttribute::Private(*private),
    };
    Some(attr)
}

fn attribute_from_ck(attr: &CkAttribute) -> Option<Attribute> {
    let attr = match attr {
        CkAttribute::Class(class) if *class == CkObjectClass::CERTIFICATE => Attribute::Class(ObjectClass::Certificate),
        CkAttribute::Class(class) if *class == CkObjectClass::PUBLIC_KEY => Attribute::Class(ObjectClass::PublicKey),
        CkAttribute::Class(class) if *class == CkObjectClass::PRIVATE_KEY => Attribute::Class(ObjectClass::PrivateKey),
        CkAttribute::Id(id) => Attribute::Id(id.clone()),
        CkAttribute::Label(label) => Attribute::Label(String::from_utf8_lossy(label).trim_end().to_string()),
        CkAttribute::Value(value) => Attribute::Value(value.clone()),
        CkAttribute::KeyType(key_type) if *key_type == CkKeyType::RSA => Attribute::KeyType(KeyType::Rsa),
        CkAttribute::KeyType(key_type) if *key_type == CkKeyType::EC => Attribute::KeyType(KeyType::Ec),
        CkAttribute::KeyType(_) => Attribute::KeyType(KeyType::Other),
        CkAttribute::Modulus(modulus) => Attribute::Modulus(modulus.clone()),
        CkAttribute::Sign(sign) => Attribute::Sign(*sign),
        CkAttribute::Decrypt(decrypt) => Attribute::Decrypt(*decrypt),
        CkAttribute::Private(private) => Attribute::Private(*private),
        _ => return None,
    };
    Some(attr)
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_library_fails_to_load() {
        let err = CryptokiLoader.load("/fake/libfoo.so").unwrap_err();
        assert!(!err.to_string().is_empty());
    }

    #[test]
    fn directory_path_is_rejected() {
        let err = CryptokiLoader.load("/").unwrap_err();
        assert!(err.to_string().contains("does not point to a file"));
    }

    #[test]
    fn status_mapping_keeps_token_removal() {
        assert_eq!(rv_from_ck(&RvError::TokenNotPresent), Rv::TokenNotPresent);
        assert_eq!(rv_from_ck(&RvError::DeviceRemoved), Rv::DeviceRemoved);
        assert_eq!(rv_from_ck(&RvError::PinIncorrect), Rv::PinIncorrect);
    }

    #[test]
    #[cfg(feature = "hsm-tests-pkcs11")]
    fn second_registration_shares_slot_event_support() {
        const SOFTHSM: &str = "/usr/lib/softhsm/libsofthsm2.so";

        let first = CryptokiLibrary::get_or_load(Path::new(SOFTHSM)).unwrap();
        let second = CryptokiLibrary::get_or_load(Path::new(SOFTHSM)).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let modules = [CryptokiModule::new(first), CryptokiModule::new(second)];
        assert_eq!(modules[0].supports_slot_events(), modules[1].supports_slot_events());
    }
}
