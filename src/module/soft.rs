//! An in-process software token.
//!
//! [`SoftModule`] behaves like a PKCS#11 module with removable tokens: slots
//! can be filled and emptied at any time, slot events are raised, the PIN
//! has a retry counter and the login state is shared by all sessions with a
//! token. It is used by the test suite and for trying the helper without
//! hardware.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Condvar, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use openssl::{
    asn1::Asn1Time,
    bn::{BigNum, MsbOption},
    error::ErrorStack,
    hash::{hash, MessageDigest},
    pkey::{PKey, Private},
    rsa::{Padding, Rsa},
    x509::{X509NameBuilder, X509},
};
use secrecy::{ExposeSecret, SecretString};

use crate::crypto::{pkcs1, DigestAlgorithm, Mechanism};

use super::{
    Attribute, AttributeType, KeyType, LoadError, Module, ModuleError, ModuleInfo, ModuleLoader,
    ObjectClass, ObjectHandle, Rv, SessionHandle, SlotId, SlotInfo, TokenInfo,
};

//------------ SoftObject ----------------------------------------------------

#[derive(Clone)]
pub struct SoftObject {
    class: ObjectClass,
    id: Vec<u8>,
    label: String,
    value: Vec<u8>,
    key: Option<PKey<Private>>,
    private: bool,
    sign: bool,
    decrypt: bool,
}

impl SoftObject {
    fn attribute(&self, attr_type: AttributeType) -> Option<Attribute> {
        let is_key = self.class != ObjectClass::Certificate;
        match attr_type {
            AttributeType::Class => Some(Attribute::Class(self.class)),
            AttributeType::Id => Some(Attribute::Id(self.id.clone())),
            AttributeType::Label => Some(Attribute::Label(self.label.clone())),
            AttributeType::Value if !is_key => Some(Attribute::Value(self.value.clone())),
            AttributeType::KeyType if is_key => Some(Attribute::KeyType(KeyType::Rsa)),
            AttributeType::Modulus if is_key => {
                let rsa = self.key.as_ref()?.rsa().ok()?;
                Some(Attribute::Modulus(rsa.n().to_vec()))
            }
            AttributeType::Sign if is_key => Some(Attribute::Sign(self.sign)),
            AttributeType::Decrypt if is_key => Some(Attribute::Decrypt(self.decrypt)),
            AttributeType::Private => Some(Attribute::Private(self.private)),
            _ => None,
        }
    }

    fn matches(&self, template: &[Attribute]) -> bool {
        template
            .iter()
            .all(|wanted| self.attribute(wanted.attribute_type()).as_ref() == Some(wanted))
    }
}

//------------ SoftToken -----------------------------------------------------

/// A software token that can be inserted into a [`SoftModule`] slot.
#[derive(Clone)]
pub struct SoftToken {
    label: String,
    manufacturer: String,
    model: String,
    serial: String,
    user_pin: String,
    max_pin_retries: u32,
    pin_retries_left: u32,
    protected_auth: bool,
    login_required: bool,
    mechanisms: Vec<Mechanism>,
    objects: Vec<SoftObject>,
    logged_in: bool,
}

impl SoftToken {
    pub fn new(label: &str, serial: &str, user_pin: &str) -> Self {
        SoftToken {
            label: label.to_string(),
            manufacturer: "NLnet Labs".to_string(),
            model: "SoftToken".to_string(),
            serial: serial.to_string(),
            user_pin: user_pin.to_string(),
            max_pin_retries: 3,
            pin_retries_left: 3,
            protected_auth: false,
            login_required: true,
            mechanisms: Mechanism::ALL.to_vec(),
            objects: Vec::new(),
            logged_in: false,
        }
    }

    /// Adds a certificate and its private key under the same `CKA_ID`.
    pub fn with_identity(mut self, id: &[u8], label: &str, cert_der: Vec<u8>, key: PKey<Private>) -> Self {
        self.objects.push(SoftObject {
            class: ObjectClass::Certificate,
            id: id.to_vec(),
            label: label.to_string(),
            value: cert_der,
            key: None,
            private: false,
            sign: false,
            decrypt: false,
        });
        self.objects.push(SoftObject {
            class: ObjectClass::PrivateKey,
            id: id.to_vec(),
            label: label.to_string(),
            value: Vec::new(),
            key: Some(key),
            private: true,
            sign: true,
            decrypt: true,
        });
        self
    }

    /// Only offers these mechanisms.
    pub fn with_mechanisms(mut self, mechanisms: &[Mechanism]) -> Self {
        self.mechanisms = mechanisms.to_vec();
        self
    }

    /// Sets which operations the private keys permit.
    pub fn with_key_usage(mut self, sign: bool, decrypt: bool) -> Self {
        for object in self.objects.iter_mut().filter(|o| o.class == ObjectClass::PrivateKey) {
            object.sign = sign;
            object.decrypt = decrypt;
        }
        self
    }

    /// Makes certificates visible only after login.
    pub fn with_private_certificates(mut self) -> Self {
        for object in self.objects.iter_mut().filter(|o| o.class == ObjectClass::Certificate) {
            object.private = true;
        }
        self
    }

    /// PIN entry happens on the token, login takes no PIN.
    pub fn with_protected_auth(mut self) -> Self {
        self.protected_auth = true;
        self
    }

    pub fn with_max_pin_retries(mut self, retries: u32) -> Self {
        self.max_pin_retries = retries;
        self.pin_retries_left = retries;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn info(&self) -> TokenInfo {
        TokenInfo {
            label: self.label.clone(),
            manufacturer: self.manufacturer.clone(),
            model: self.model.clone(),
            serial: self.serial.clone(),
            login_required: self.login_required,
            protected_auth_path: self.protected_auth,
            user_pin_locked: self.pin_retries_left == 0,
            user_pin_final_try: self.pin_retries_left == 1,
            user_pin_count_low: self.pin_retries_left < self.max_pin_retries,
            user_pin_retries_left: Some(self.pin_retries_left),
        }
    }

    fn visible(&self, object: &SoftObject) -> bool {
        !object.private || self.logged_in
    }
}

/// Creates an RSA key and a self-signed certificate for it.
pub fn self_signed_identity(common_name: &str, bits: u32) -> Result<(Vec<u8>, PKey<Private>), ErrorStack> {
    let key = PKey::from_rsa(Rsa::generate(bits)?)?;

    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_text("O", "NLnet Labs")?;
    name.append_entry_by_text("CN", common_name)?;
    let name = name.build();

    let mut serial = BigNum::new()?;
    serial.rand(64, MsbOption::MAYBE_ZERO, false)?;

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    builder.set_serial_number(serial.to_asn1_integer()?.as_ref())?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(&key)?;
    builder.set_not_before(Asn1Time::days_from_now(0)?.as_ref())?;
    builder.set_not_after(Asn1Time::days_from_now(365)?.as_ref())?;
    builder.sign(&key, MessageDigest::sha256())?;

    Ok((builder.build().to_der()?, key))
}

//------------ SoftModule ----------------------------------------------------

struct SoftSlot {
    description: String,
    token: Option<SoftToken>,

    /// Bumped on every insertion so sessions opened with an earlier token
    /// are recognized as gone.
    insertion: u64,
}

struct SoftSession {
    slot: SlotId,
    insertion: u64,
}

#[derive(Default)]
struct SoftState {
    slots: BTreeMap<SlotId, SoftSlot>,
    sessions: HashMap<SessionHandle, SoftSession>,
    next_session: SessionHandle,
    pending_events: VecDeque<SlotId>,
    calls: HashMap<&'static str, u64>,
}

pub struct SoftModule {
    name: String,
    slot_events: bool,
    thread_safe: bool,
    state: Mutex<SoftState>,
    event: Condvar,
}

impl std::fmt::Debug for SoftModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftModule").field("name", &self.name).finish()
    }
}

// test interface
impl SoftModule {
    pub fn new(name: &str) -> Self {
        SoftModule {
            name: name.to_string(),
            slot_events: true,
            thread_safe: true,
            state: Mutex::new(SoftState {
                next_session: 1,
                ..Default::default()
            }),
            event: Condvar::new(),
        }
    }

    /// Whether the module pretends to implement `C_WaitForSlotEvent`.
    pub fn with_slot_events(mut self, slot_events: bool) -> Self {
        self.slot_events = slot_events;
        self
    }

    /// Whether the module declares it can be called from several threads
    /// at once.
    pub fn with_thread_safety(mut self, thread_safe: bool) -> Self {
        self.thread_safe = thread_safe;
        self
    }

    fn lock(&self) -> MutexGuard<'_, SoftState> {
        // The soft token has no invariants a panicking test could break.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn add_slot(&self, description: &str) -> SlotId {
        let mut state = self.lock();
        let id = state.slots.keys().next_back().map(|id| id + 1).unwrap_or(0);
        state.slots.insert(
            id,
            SoftSlot {
                description: description.to_string(),
                token: None,
                insertion: 0,
            },
        );
        id
    }

    pub fn insert_token(&self, slot: SlotId, token: SoftToken) {
        let mut state = self.lock();
        if let Some(entry) = state.slots.get_mut(&slot) {
            entry.token = Some(token);
            entry.insertion += 1;
            state.pending_events.push_back(slot);
            self.event.notify_all();
        }
    }

    /// Pulls the token out. All sessions with it are gone.
    pub fn remove_token(&self, slot: SlotId) -> Option<SoftToken> {
        let mut state = self.lock();
        let mut token = state.slots.get_mut(&slot)?.token.take();
        if let Some(token) = token.as_mut() {
            token.logged_in = false;
            state.sessions.retain(|_, session| session.slot != slot);
            state.pending_events.push_back(slot);
            self.event.notify_all();
        }
        token
    }

    /// Logs the token out behind the helper's back, as a token with an
    /// inactivity timeout would.
    pub fn logout_token(&self, slot: SlotId) {
        let mut state = self.lock();
        if let Some(token) = state.slots.get_mut(&slot).and_then(|s| s.token.as_mut()) {
            token.logged_in = false;
        }
    }

    pub fn set_user_pin(&self, slot: SlotId, pin: &str) {
        let mut state = self.lock();
        if let Some(token) = state.slots.get_mut(&slot).and_then(|s| s.token.as_mut()) {
            token.user_pin = pin.to_string();
        }
    }

    /// The number of times a `C_*` function was called.
    pub fn calls(&self, function: &str) -> u64 {
        self.lock().calls.get(function).copied().unwrap_or(0)
    }

    pub fn open_session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    fn enter(&self, function: &'static str) -> MutexGuard<'_, SoftState> {
        let mut state = self.lock();
        *state.calls.entry(function).or_insert(0) += 1;
        state
    }
}

impl SoftState {
    fn token(&self, slot: SlotId, function: &'static str) -> Result<&SoftToken, ModuleError> {
        self.slots
            .get(&slot)
            .ok_or_else(|| ModuleError::new(Rv::SlotIdInvalid, function))?
            .token
            .as_ref()
            .ok_or_else(|| ModuleError::new(Rv::TokenNotPresent, function))
    }

    fn session_slot(&self, session: SessionHandle, function: &'static str) -> Result<SlotId, ModuleError> {
        let entry = self
            .sessions
            .get(&session)
            .ok_or_else(|| ModuleError::new(Rv::SessionHandleInvalid, function))?;
        let slot = self
            .slots
            .get(&entry.slot)
            .ok_or_else(|| ModuleError::new(Rv::SessionHandleInvalid, function))?;
        match slot.token {
            None => Err(ModuleError::new(Rv::DeviceRemoved, function)),
            Some(_) if slot.insertion != entry.insertion => Err(ModuleError::new(Rv::SessionHandleInvalid, function)),
            Some(_) => Ok(entry.slot),
        }
    }

    fn session_token(&mut self, session: SessionHandle, function: &'static str) -> Result<&mut SoftToken, ModuleError> {
        let slot = self.session_slot(session, function)?;
        self.slots
            .get_mut(&slot)
            .and_then(|s| s.token.as_mut())
            .ok_or_else(|| ModuleError::new(Rv::DeviceRemoved, function))
    }

    fn private_key(
        &mut self,
        session: SessionHandle,
        mechanism: Mechanism,
        key: ObjectHandle,
        function: &'static str,
    ) -> Result<(SoftObject, bool), ModuleError> {
        let token = self.session_token(session, function)?;
        if !token.mechanisms.contains(&mechanism) {
            return Err(ModuleError::new(Rv::MechanismInvalid, function));
        }
        let object = token
            .objects
            .get(key as usize)
            .filter(|o| o.class == ObjectClass::PrivateKey)
            .ok_or_else(|| ModuleError::new(Rv::KeyHandleInvalid, function))?
            .clone();
        let allowed = !token.login_required || token.logged_in;
        Ok((object, allowed))
    }
}

fn rsa_error(function: &'static str) -> impl Fn(ErrorStack) -> ModuleError {
    move |err| ModuleError::with_detail(Rv::DataInvalid, function, err)
}

impl Module for SoftModule {
    fn info(&self) -> Result<ModuleInfo, ModuleError> {
        let _state = self.enter("C_GetInfo");
        Ok(ModuleInfo {
            manufacturer: "NLnet Labs".to_string(),
            description: format!("Soft token module '{}'", self.name),
            library_version: "1.0".to_string(),
            cryptoki_version: "2.40".to_string(),
        })
    }

    fn slots(&self, token_present: bool) -> Result<Vec<SlotId>, ModuleError> {
        let state = self.enter("C_GetSlotList");
        Ok(state
            .slots
            .iter()
            .filter(|(_, slot)| !token_present || slot.token.is_some())
            .map(|(id, _)| *id)
            .collect())
    }

    fn slot_info(&self, slot: SlotId) -> Result<SlotInfo, ModuleError> {
        let state = self.enter("C_GetSlotInfo");
        let entry = state
            .slots
            .get(&slot)
            .ok_or_else(|| ModuleError::new(Rv::SlotIdInvalid, "C_GetSlotInfo"))?;
        Ok(SlotInfo {
            description: entry.description.clone(),
            token_present: entry.token.is_some(),
            removable: true,
            hardware: false,
        })
    }

    fn token_info(&self, slot: SlotId) -> Result<TokenInfo, ModuleError> {
        let state = self.enter("C_GetTokenInfo");
        Ok(state.token(slot, "C_GetTokenInfo")?.info())
    }

    fn mechanisms(&self, slot: SlotId) -> Result<Vec<Mechanism>, ModuleError> {
        let state = self.enter("C_GetMechanismList");
        Ok(state.token(slot, "C_GetMechanismList")?.mechanisms.clone())
    }

    fn supports_slot_events(&self) -> bool {
        self.slot_events
    }

    fn wait_for_slot_event(&self, timeout: Duration) -> Result<Option<SlotId>, ModuleError> {
        let mut state = self.enter("C_WaitForSlotEvent");
        if !self.slot_events {
            return Err(ModuleError::new(Rv::FunctionNotSupported, "C_WaitForSlotEvent"));
        }
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(slot) = state.pending_events.pop_front() {
                return Ok(Some(slot));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            state = match self.event.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn is_thread_safe(&self) -> bool {
        self.thread_safe
    }

    fn open_session(&self, slot: SlotId) -> Result<SessionHandle, ModuleError> {
        let mut state = self.enter("C_OpenSession");
        state.token(slot, "C_OpenSession")?;
        let insertion = state.slots.get(&slot).map(|s| s.insertion).unwrap_or_default();
        let handle = state.next_session;
        state.next_session += 1;
        state.sessions.insert(handle, SoftSession { slot, insertion });
        Ok(handle)
    }

    fn close_session(&self, session: SessionHandle) -> Result<(), ModuleError> {
        let mut state = self.enter("C_CloseSession");
        let closed = state
            .sessions
            .remove(&session)
            .ok_or_else(|| ModuleError::new(Rv::SessionHandleInvalid, "C_CloseSession"))?;

        // Closing the last session with a token returns it to public state.
        if !state.sessions.values().any(|s| s.slot == closed.slot) {
            if let Some(token) = state.slots.get_mut(&closed.slot).and_then(|s| s.token.as_mut()) {
                token.logged_in = false;
            }
        }
        Ok(())
    }

    fn is_logged_in(&self, session: SessionHandle) -> Result<bool, ModuleError> {
        let mut state = self.enter("C_GetSessionInfo");
        Ok(state.session_token(session, "C_GetSessionInfo")?.logged_in)
    }

    fn login(&self, session: SessionHandle, pin: Option<&SecretString>) -> Result<(), ModuleError> {
        let mut state = self.enter("C_Login");
        let token = state.session_token(session, "C_Login")?;
        if token.pin_retries_left == 0 {
            return Err(ModuleError::new(Rv::PinLocked, "C_Login"));
        }
        if token.logged_in {
            return Err(ModuleError::new(Rv::UserAlreadyLoggedIn, "C_Login"));
        }
        let correct = match pin {
            None if token.protected_auth => true,
            None => return Err(ModuleError::new(Rv::ArgumentsBad, "C_Login")),
            Some(pin) => pin.expose_secret() == &token.user_pin,
        };
        if correct {
            token.pin_retries_left = token.max_pin_retries;
            token.logged_in = true;
            Ok(())
        } else {
            token.pin_retries_left -= 1;
            if token.pin_retries_left == 0 {
                Err(ModuleError::new(Rv::PinLocked, "C_Login"))
            } else {
                Err(ModuleError::new(Rv::PinIncorrect, "C_Login"))
            }
        }
    }

    fn logout(&self, session: SessionHandle) -> Result<(), ModuleError> {
        let mut state = self.enter("C_Logout");
        let token = state.session_token(session, "C_Logout")?;
        if !token.logged_in {
            return Err(ModuleError::new(Rv::UserNotLoggedIn, "C_Logout"));
        }
        token.logged_in = false;
        Ok(())
    }

    fn find_objects(&self, session: SessionHandle, template: &[Attribute]) -> Result<Vec<ObjectHandle>, ModuleError> {
        let mut state = self.enter("C_FindObjects");
        let token = state.session_token(session, "C_FindObjects")?;
        Ok(token
            .objects
            .iter()
            .enumerate()
            .filter(|(_, object)| token.visible(object) && object.matches(template))
            .map(|(index, _)| index as ObjectHandle)
            .collect())
    }

    fn attributes(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        types: &[AttributeType],
    ) -> Result<Vec<Attribute>, ModuleError> {
        let mut state = self.enter("C_GetAttributeValue");
        let token = state.session_token(session, "C_GetAttributeValue")?;
        let object = token
            .objects
            .get(object as usize)
            .filter(|o| token.visible(o))
            .ok_or_else(|| ModuleError::new(Rv::ObjectHandleInvalid, "C_GetAttributeValue"))?;
        Ok(types.iter().filter_map(|t| object.attribute(*t)).collect())
    }

    fn sign(
        &self,
        session: SessionHandle,
        mechanism: Mechanism,
        key: ObjectHandle,
        data: &[u8],
    ) -> Result<Vec<u8>, ModuleError> {
        let (object, allowed) = self.enter("C_Sign").private_key(session, mechanism, key, "C_Sign")?;
        if !allowed {
            return Err(ModuleError::new(Rv::UserNotLoggedIn, "C_Sign"));
        }
        if !object.sign {
            return Err(ModuleError::new(Rv::KeyFunctionNotPermitted, "C_Sign"));
        }
        let rsa = object
            .key
            .as_ref()
            .ok_or_else(|| ModuleError::new(Rv::KeyHandleInvalid, "C_Sign"))?
            .rsa()
            .map_err(rsa_error("C_Sign"))?;
        let k = rsa.size() as usize;

        let (input, padding) = match mechanism.digest() {
            Some(alg) => {
                let md = match alg {
                    DigestAlgorithm::Sha1 => MessageDigest::sha1(),
                    DigestAlgorithm::Sha256 => MessageDigest::sha256(),
                    DigestAlgorithm::Sha384 => MessageDigest::sha384(),
                    DigestAlgorithm::Sha512 => MessageDigest::sha512(),
                };
                let digest = hash(md, data).map_err(rsa_error("C_Sign"))?;
                (pkcs1::digest_info(alg, &digest), Padding::PKCS1)
            }
            None if mechanism == Mechanism::RsaX509 => {
                let block = pkcs1::left_pad(data, k).map_err(|_| ModuleError::new(Rv::DataLenRange, "C_Sign"))?;
                (block, Padding::NONE)
            }
            None => {
                if data.len() + 11 > k {
                    return Err(ModuleError::new(Rv::DataLenRange, "C_Sign"));
                }
                (data.to_vec(), Padding::PKCS1)
            }
        };

        let mut out = vec![0u8; k];
        let len = rsa
            .private_encrypt(&input, &mut out, padding)
            .map_err(rsa_error("C_Sign"))?;
        out.truncate(len);
        Ok(out)
    }

    fn decrypt(
        &self,
        session: SessionHandle,
        mechanism: Mechanism,
        key: ObjectHandle,
        data: &[u8],
    ) -> Result<Vec<u8>, ModuleError> {
        let (object, allowed) = self.enter("C_Decrypt").private_key(session, mechanism, key, "C_Decrypt")?;
        if !allowed {
            return Err(ModuleError::new(Rv::UserNotLoggedIn, "C_Decrypt"));
        }
        if !object.decrypt {
            return Err(ModuleError::new(Rv::KeyFunctionNotPermitted, "C_Decrypt"));
        }
        let padding = match mechanism {
            Mechanism::RsaPkcs => Padding::PKCS1,
            Mechanism::RsaX509 => Padding::NONE,
            _ => return Err(ModuleError::new(Rv::MechanismInvalid, "C_Decrypt")),
        };
        let rsa = object
            .key
            .as_ref()
            .ok_or_else(|| ModuleError::new(Rv::KeyHandleInvalid, "C_Decrypt"))?
            .rsa()
            .map_err(rsa_error("C_Decrypt"))?;
        let k = rsa.size() as usize;
        let input = pkcs1::left_pad(data, k).map_err(|_| ModuleError::new(Rv::EncryptedDataInvalid, "C_Decrypt"))?;

        let mut out = vec![0u8; k];
        let len = rsa
            .private_decrypt(&input, &mut out, padding)
            .map_err(|_| ModuleError::new(Rv::EncryptedDataInvalid, "C_Decrypt"))?;
        out.truncate(len);
        if padding == Padding::NONE {
            return pkcs1::left_pad(&out, k).map_err(|_| ModuleError::new(Rv::EncryptedDataInvalid, "C_Decrypt"));
        }
        Ok(out)
    }
}

//------------ SoftModuleLoader ----------------------------------------------

/// Hands out registered soft modules by path.
#[derive(Debug, Default)]
pub struct SoftModuleLoader {
    modules: Mutex<HashMap<String, Arc<SoftModule>>>,
}

impl SoftModuleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, path: &str, module: Arc<SoftModule>) {
        if let Ok(mut modules) = self.modules.lock() {
            modules.insert(path.to_string(), module);
        }
    }
}

impl ModuleLoader for SoftModuleLoader {
    fn load(&self, path: &str) -> Result<Arc<dyn Module>, LoadError> {
        let modules = self
            .modules
            .lock()
            .map_err(|_| LoadError("soft module registry lock poisoned".to_string()))?;
        match modules.get(path) {
            Some(module) => Ok(module.clone()),
            None => Err(LoadError(format!("{}: No such file or directory", path))),
        }
    }
}

//------------ Tests ---------------------------------------------------------
