use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, TryLockError,
    },
};

use log::debug;
use secrecy::SecretString;

use crate::crypto::Mechanism;
use crate::error::Error;
use crate::hooks::{PinRequest, PinResponse};
use crate::module::{
    find_attribute, Attribute, AttributeType, KeyType, ModuleError, ObjectClass, ObjectHandle, Rv, SessionHandle,
    SlotId, TokenInfo,
};
use crate::token::{provider::Provider, TokenId};

use super::{pin::PinCache, SessionContext};

//------------ LoginState ----------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LoginState {
    LoggedOut,
    LoggingIn,
    LoggedIn,
}

//------------ TokenCertificate ----------------------------------------------

/// A certificate object as found on a token.
#[derive(Clone, Debug)]
pub(crate) struct TokenCertificate {
    pub id: Vec<u8>,
    pub label: String,
    pub value: Vec<u8>,
}

//------------ KeyAttributes -------------------------------------------------

/// What a private key is and what it may be used for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct KeyAttributes {
    pub key_type: KeyType,

    /// The length of the RSA modulus in bytes.
    pub modulus_len: Option<usize>,
    pub can_sign: bool,
    pub can_decrypt: bool,
}

impl KeyAttributes {
    fn from_attributes(attrs: &[Attribute]) -> Self {
        let key_type = match find_attribute(attrs, AttributeType::KeyType) {
            Some(Attribute::KeyType(key_type)) => *key_type,
            _ => KeyType::Rsa,
        };
        let modulus_len = match find_attribute(attrs, AttributeType::Modulus) {
            Some(Attribute::Modulus(modulus)) => {
                let first = modulus.iter().position(|b| *b != 0).unwrap_or(modulus.len());
                Some(modulus.len() - first).filter(|len| *len > 0)
            }
            _ => None,
        };
        // Modules that leave these out do not restrict the key.
        let can_sign = !matches!(find_attribute(attrs, AttributeType::Sign), Some(Attribute::Sign(false)));
        let can_decrypt = !matches!(
            find_attribute(attrs, AttributeType::Decrypt),
            Some(Attribute::Decrypt(false))
        );
        KeyAttributes {
            key_type,
            modulus_len,
            can_sign,
            can_decrypt,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct PrivateKey {
    handle: ObjectHandle,
    attributes: KeyAttributes,
}

//------------ Session -------------------------------------------------------

struct SessionState {
    handle: Option<SessionHandle>,
    login: LoginState,
    pin: PinCache,

    /// All PIN attempts of this generation failed, do not prompt again.
    exhausted: bool,
    mechanisms: Option<Vec<Mechanism>>,
    certificates: Option<Vec<TokenCertificate>>,
    keys: HashMap<Vec<u8>, PrivateKey>,
}

/// The one session of a helper instance with a token of a provider.
///
/// The PKCS#11 session is opened on first use. All work on the session is
/// serialized by its state lock. Once the token is removed the session is
/// invalidated for good: users obtain a new one, of a new generation, from
/// the token manager.
pub(crate) struct Session {
    provider: Arc<Provider>,
    token: TokenId,
    slot: SlotId,
    generation: u64,
    ctx: Arc<SessionContext>,
    invalidated: AtomicBool,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(provider: Arc<Provider>, token: TokenId, slot: SlotId, generation: u64, ctx: Arc<SessionContext>) -> Self {
        Session {
            provider,
            token,
            slot,
            generation,
            ctx,
            invalidated: AtomicBool::new(false),
            state: Mutex::new(SessionState {
                handle: None,
                login: LoginState::LoggedOut,
                pin: PinCache::default(),
                exhausted: false,
                mechanisms: None,
                certificates: None,
                keys: HashMap::new(),
            }),
        }
    }

    pub fn provider(&self) -> &Arc<Provider> {
        &self.provider
    }

    pub fn token(&self) -> &TokenId {
        &self.token
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::SeqCst)
    }

    /// Marks the session as unusable. Does not wait for running operations.
    pub fn invalidate(&self) {
        if !self.invalidated.swap(true, Ordering::SeqCst) {
            debug!(
                "Session generation {} with token '{}' invalidated",
                self.generation,
                self.token.label()
            );
        }
    }

    /// Closes the PKCS#11 session of an invalidated session.
    ///
    /// Does not wait for a running operation, which may be stuck in a PIN
    /// prompt. Such an operation fails once it continues and the PKCS#11
    /// session is closed when the session is dropped.
    pub fn close(&self) -> Result<(), Error> {
        let mut state = match self.state.try_lock() {
            Ok(state) => state,
            Err(TryLockError::WouldBlock) => {
                debug!(
                    "Session generation {} with token '{}' is busy, closing it later",
                    self.generation,
                    self.token.label()
                );
                return Ok(());
            }
            Err(TryLockError::Poisoned(err)) => return Err(err.into()),
        };
        state.login = LoginState::LoggedOut;
        state.pin.clear();
        if let Some(handle) = state.handle.take() {
            if let Err(err) = self.provider.call("C_CloseSession", |m| m.close_session(handle)) {
                debug!("Closing session with token '{}': {}", self.token.label(), err);
            }
        }
        Ok(())
    }

    pub fn login_state(&self) -> Result<LoginState, Error> {
        Ok(self.lock()?.login)
    }

    /// Logs in unless already logged in.
    pub fn login(&self) -> Result<(), Error> {
        let mut state = self.lock()?;
        let handle = self.ready(&mut state)?;
        self.ensure_login(&mut state, handle)
    }

    /// Logs out and forgets the cached PIN.
    pub fn logout(&self) -> Result<(), Error> {
        let mut state = self.lock()?;
        if let (Some(handle), LoginState::LoggedIn) = (state.handle, state.login) {
            match self.provider.call("C_Logout", |m| m.logout(handle)) {
                Ok(()) => {}
                Err(err) if err.rv == Rv::UserNotLoggedIn || err.rv.is_token_gone() => {}
                Err(err) => return Err(Error::Module(err)),
            }
        }
        state.login = LoginState::LoggedOut;
        state.pin.clear();
        state.exhausted = false;
        state.keys.clear();
        Ok(())
    }

    pub fn mechanisms(&self) -> Result<Vec<Mechanism>, Error> {
        let mut state = self.lock()?;
        self.check_valid()?;
        if let Some(mechanisms) = &state.mechanisms {
            return Ok(mechanisms.clone());
        }
        let mechanisms = self
            .provider
            .query("C_GetMechanismList", |m| m.mechanisms(self.slot))
            .map_err(|err| self.module_error(err))?;
        state.mechanisms = Some(mechanisms.clone());
        Ok(mechanisms)
    }

    /// The certificates on the token.
    pub fn certificates(&self) -> Result<Vec<TokenCertificate>, Error> {
        let mut state = self.lock()?;
        let handle = self.ready(&mut state)?;
        if let Some(certificates) = &state.certificates {
            return Ok(certificates.clone());
        }
        if self.provider.settings.cert_is_private {
            self.ensure_login(&mut state, handle)?;
        }

        let template = [Attribute::Class(ObjectClass::Certificate)];
        let objects = self
            .provider
            .query("C_FindObjects", |m| m.find_objects(handle, &template))
            .map_err(|err| self.module_error(err))?;

        let mut certificates = Vec::with_capacity(objects.len());
        for object in objects {
            let attrs = self
                .provider
                .query("C_GetAttributeValue", |m| {
                    m.attributes(
                        handle,
                        object,
                        &[AttributeType::Id, AttributeType::Label, AttributeType::Value],
                    )
                })
                .map_err(|err| self.module_error(err))?;

            let value = match find_attribute(&attrs, AttributeType::Value) {
                Some(Attribute::Value(value)) => value.clone(),
                _ => {
                    debug!("Certificate object without value on token '{}'", self.token.label());
                    continue;
                }
            };
            let id = match find_attribute(&attrs, AttributeType::Id) {
                Some(Attribute::Id(id)) => id.clone(),
                _ => Vec::new(),
            };
            let label = match find_attribute(&attrs, AttributeType::Label) {
                Some(Attribute::Label(label)) => label.clone(),
                _ => String::new(),
            };
            certificates.push(TokenCertificate { id, label, value });
        }

        debug!(
            "Found {} certificate(s) on token '{}'",
            certificates.len(),
            self.token.label()
        );
        state.certificates = Some(certificates.clone());
        Ok(certificates)
    }

    /// The attributes of the private key with the given `CKA_ID`.
    pub fn key_attributes(&self, id: &[u8]) -> Result<KeyAttributes, Error> {
        let mut state = self.lock()?;
        let handle = self.ready(&mut state)?;
        self.ensure_login(&mut state, handle)?;
        Ok(self.find_key(&mut state, handle, id)?.attributes)
    }

    pub fn sign(&self, key_id: &[u8], mechanism: Mechanism, data: &[u8]) -> Result<Vec<u8>, Error> {
        self.private_op(key_id, "C_Sign", |m, session, key| m.sign(session, mechanism, key, data))
    }

    pub fn decrypt(&self, key_id: &[u8], mechanism: Mechanism, data: &[u8]) -> Result<Vec<u8>, Error> {
        self.private_op(key_id, "C_Decrypt", |m, session, key| {
            m.decrypt(session, mechanism, key, data)
        })
    }

    /// Runs a private key operation, logging in first if needed.
    ///
    /// A token that forgot about the login, after a timeout for instance,
    /// gets one new login and the operation is retried once.
    fn private_op<F>(&self, key_id: &[u8], function: &str, op: F) -> Result<Vec<u8>, Error>
    where
        F: Fn(&dyn crate::module::Module, SessionHandle, ObjectHandle) -> Result<Vec<u8>, ModuleError>,
    {
        let mut state = self.lock()?;
        let handle = self.ready(&mut state)?;
        self.ensure_login(&mut state, handle)?;
        let key = self.find_key(&mut state, handle, key_id)?;
        self.check_valid()?;

        match self.provider.call(function, |m| op(m, handle, key.handle)) {
            Err(err) if err.rv == Rv::UserNotLoggedIn => {
                debug!(
                    "Token '{}' no longer logged in, logging in again for {}",
                    self.token.label(),
                    function
                );
                state.login = LoginState::LoggedOut;
                self.ensure_login(&mut state, handle)?;
                self.provider
                    .call(function, |m| op(m, handle, key.handle))
                    .map_err(|err| self.operation_error(err))
            }
            res => res.map_err(|err| self.operation_error(err)),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, SessionState>, Error> {
        Ok(self.state.lock()?)
    }

    fn check_valid(&self) -> Result<(), Error> {
        if self.is_invalidated() {
            Err(Error::SessionInvalidated {
                token: self.token.label().to_string(),
            })
        } else {
            Ok(())
        }
    }

    /// Makes sure the session is valid and open, returning its handle.
    fn ready(&self, state: &mut SessionState) -> Result<SessionHandle, Error> {
        self.check_valid()?;
        if let Some(handle) = state.handle {
            return Ok(handle);
        }
        match self.provider.query("C_OpenSession", |m| m.open_session(self.slot)) {
            Ok(handle) => {
                debug!(
                    "Opened session generation {} with token '{}' in slot {} of '{}'",
                    self.generation,
                    self.token.label(),
                    self.slot,
                    self.provider.name
                );
                state.handle = Some(handle);
                Ok(handle)
            }
            Err(err) if err.rv.is_token_gone() => {
                self.invalidate();
                Err(Error::TokenNotPresent {
                    label: self.token.label().to_string(),
                })
            }
            Err(err) => Err(Error::Module(err)),
        }
    }

    fn ensure_login(&self, state: &mut SessionState, handle: SessionHandle) -> Result<(), Error> {
        if state.login == LoginState::LoggedIn {
            return Ok(());
        }

        // Logins are per token, another application may have done it.
        let logged_in = self
            .provider
            .call("C_GetSessionInfo", |m| m.is_logged_in(handle))
            .map_err(|err| self.module_error(err))?;
        let info = self.token_info()?;
        if logged_in || !info.login_required {
            state.login = LoginState::LoggedIn;
            return Ok(());
        }
        if info.user_pin_locked {
            return Err(Error::PinLocked {
                token: self.token.label().to_string(),
            });
        }
        if state.exhausted {
            return Err(Error::PinIncorrect {
                token: self.token.label().to_string(),
                retries_left: info.retries_left(),
            });
        }

        state.login = LoginState::LoggingIn;
        let res = self.authenticate(state, handle, &info);
        state.login = match res {
            Ok(()) => {
                self.ctx
                    .diag
                    .info(format_args!("Logged in to token '{}'", self.token.label()));
                LoginState::LoggedIn
            }
            Err(_) => LoginState::LoggedOut,
        };
        res
    }

    fn authenticate(&self, state: &mut SessionState, handle: SessionHandle, info: &TokenInfo) -> Result<(), Error> {
        if self.provider.settings.protected_auth || info.protected_auth_path {
            debug!(
                "Logging in to token '{}' through its protected authentication path",
                self.token.label()
            );
            return match self.try_login(handle, None)? {
                true => Ok(()),
                false => Err(self.pin_incorrect()),
            };
        }

        let policy = &self.ctx.login;
        let now = self.ctx.system.now();
        let cached = state
            .pin
            .get(policy.pin_cache_policy, policy.pin_cache_timeout, now)
            .cloned();
        let tried_cached = cached.is_some();
        if let Some(pin) = cached {
            if self.try_login(handle, Some(&pin))? {
                return Ok(());
            }
            debug!("Cached PIN for token '{}' was rejected", self.token.label());
            state.pin.clear();
        }

        let hook = match self.ctx.hooks.pin_prompt() {
            Some(hook) if policy.allow_pin_prompt => hook,
            _ => {
                self.ctx.diag.warn(format_args!(
                    "Token '{}' needs a PIN but no PIN prompt is available",
                    self.token.label()
                ));
                return if tried_cached {
                    Err(self.pin_incorrect())
                } else {
                    Err(Error::Cancelled)
                };
            }
        };

        let max_attempts = policy.max_login_retries;
        for attempt in 1..=max_attempts {
            let request = PinRequest {
                token: self.token.clone(),
                attempt,
                max_attempts,
                retries_left: self.token_info().ok().and_then(|info| info.retries_left()),
            };
            let response = hook(&request);
            // The provider may have been removed while the user was asked.
            self.check_valid()?;
            let pin: SecretString = match response {
                PinResponse::Pin(pin) => pin,
                PinResponse::UseCached => {
                    let now = self.ctx.system.now();
                    match state
                        .pin
                        .get(policy.pin_cache_policy, policy.pin_cache_timeout, now)
                        .cloned()
                    {
                        Some(pin) => pin,
                        None => {
                            debug!("No cached PIN for token '{}'", self.token.label());
                            return Err(Error::Cancelled);
                        }
                    }
                }
                PinResponse::Cancel => {
                    debug!("PIN entry for token '{}' cancelled", self.token.label());
                    return Err(Error::Cancelled);
                }
            };

            if self.try_login(handle, Some(&pin))? {
                state.pin.store(pin, policy.pin_cache_policy, self.ctx.system.now());
                return Ok(());
            }
            self.ctx.diag.warn(format_args!(
                "Incorrect PIN for token '{}', attempt {} of {}",
                self.token.label(),
                attempt,
                max_attempts
            ));
        }

        state.exhausted = true;
        Err(self.pin_incorrect())
    }

    /// Tries one login. Returns whether the PIN was accepted.
    fn try_login(&self, handle: SessionHandle, pin: Option<&SecretString>) -> Result<bool, Error> {
        match self.provider.call("C_Login", |m| m.login(handle, pin)) {
            Ok(()) => Ok(true),
            Err(err) => match err.rv {
                Rv::UserAlreadyLoggedIn => Ok(true),
                Rv::PinIncorrect => Ok(false),
                Rv::PinLocked => Err(Error::PinLocked {
                    token: self.token.label().to_string(),
                }),
                Rv::FunctionCanceled => Err(Error::Cancelled),
                _ => Err(self.module_error(err)),
            },
        }
    }

    fn find_key(&self, state: &mut SessionState, handle: SessionHandle, id: &[u8]) -> Result<PrivateKey, Error> {
        if let Some(key) = state.keys.get(id) {
            return Ok(*key);
        }

        let template = [Attribute::Class(ObjectClass::PrivateKey), Attribute::Id(id.to_vec())];
        let objects = self
            .provider
            .query("C_FindObjects", |m| m.find_objects(handle, &template))
            .map_err(|err| self.module_error(err))?;
        let object = *objects.first().ok_or_else(|| Error::KeyNotFound {
            token: self.token.label().to_string(),
        })?;

        let attrs = self
            .provider
            .query("C_GetAttributeValue", |m| {
                m.attributes(
                    handle,
                    object,
                    &[
                        AttributeType::KeyType,
                        AttributeType::Modulus,
                        AttributeType::Sign,
                        AttributeType::Decrypt,
                    ],
                )
            })
            .map_err(|err| self.module_error(err))?;

        let key = PrivateKey {
            handle: object,
            attributes: KeyAttributes::from_attributes(&attrs),
        };
        state.keys.insert(id.to_vec(), key);
        Ok(key)
    }

    fn token_info(&self) -> Result<TokenInfo, Error> {
        self.provider
            .call("C_GetTokenInfo", |m| m.token_info(self.slot))
            .map_err(|err| self.module_error(err))
    }

    fn pin_incorrect(&self) -> Error {
        Error::PinIncorrect {
            token: self.token.label().to_string(),
            retries_left: self.token_info().ok().and_then(|info| info.retries_left()),
        }
    }

    /// Maps the failure of a supporting call.
    fn module_error(&self, err: ModuleError) -> Error {
        if err.rv.is_token_gone() {
            self.invalidate();
            Error::SessionInvalidated {
                token: self.token.label().to_string(),
            }
        } else {
            Error::Module(err)
        }
    }

    /// Maps the failure of the private key operation itself.
    fn operation_error(&self, err: ModuleError) -> Error {
        if err.rv.is_token_gone() {
            self.module_error(err)
        } else {
            self.ctx.diag.warn(format_args!(
                "Private key operation on token '{}' failed: {}",
                self.token.label(),
                err
            ));
            Error::OperationFailed(err)
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let handle = match self.state.get_mut() {
            Ok(state) => state.handle.take(),
            Err(poisoned) => poisoned.into_inner().handle.take(),
        };
        if let Some(handle) = handle {
            // The token may be long gone, nothing to do about failures.
            let _ = self.provider.call("C_CloseSession", |m| m.close_session(handle));
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Session")
            .field("provider", &self.provider.name)
            .field("token", &self.token)
            .field("slot", &self.slot)
            .field("generation", &self.generation)
            .field("invalidated", &self.is_invalidated())
            .finish()
    }
}
