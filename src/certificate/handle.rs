use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use log::{debug, trace};

use crate::crypto::{pkcs1, CertificateInfo, Mechanism};
use crate::error::Error;
use crate::session::{KeyAttributes, LoginState, Session, TokenSession};
use crate::token::manager::TokenManager;

use super::CertificateId;

//------------ CertificateHandle ---------------------------------------------

/// A certificate on a token together with its private key.
///
/// The handle holds a reference to the session with the token. If the token
/// is removed the next operation looks the token up again. When it is back,
/// possibly in another slot, the handle continues with a new session.
/// Otherwise the operation fails with `TokenNotPresent`.
///
/// Cloning a handle adds a session reference, dropping one gives it up.
pub struct CertificateHandle {
    id: CertificateId,
    label: String,
    value: Arc<Vec<u8>>,
    manager: Arc<TokenManager>,
    session: Mutex<TokenSession>,
}

impl CertificateHandle {
    pub(crate) fn new(
        id: CertificateId,
        label: String,
        value: Vec<u8>,
        session: TokenSession,
        manager: Arc<TokenManager>,
    ) -> Self {
        CertificateHandle {
            id,
            label,
            value: Arc::new(value),
            manager,
            session: Mutex::new(session),
        }
    }

    pub fn id(&self) -> &CertificateId {
        &self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// The certificate in DER encoding.
    pub fn certificate_der(&self) -> &[u8] {
        &self.value
    }

    pub fn info(&self) -> Result<CertificateInfo, Error> {
        Ok(self.manager.ctx().engine.certificate_info(&self.value)?)
    }

    /// The attributes of the private key. Needs a login.
    pub fn key_attributes(&self) -> Result<KeyAttributes, Error> {
        self.session()?.key_attributes(self.id.id())
    }

    pub fn login(&self) -> Result<(), Error> {
        self.session()?.login()
    }

    pub fn login_state(&self) -> Result<LoginState, Error> {
        self.session()?.login_state()
    }

    /// The generation of the session currently used.
    pub fn session_generation(&self) -> Result<u64, Error> {
        Ok(self.lock()?.session().generation())
    }

    /// Signs `data` with the private key.
    ///
    /// A mechanism the token lacks is performed with the help of the crypto
    /// engine: hash-and-sign mechanisms are hashed by the engine and signed
    /// with `CKM_RSA_PKCS`, and `CKM_RSA_PKCS` is padded by the engine and
    /// signed with `CKM_RSA_X_509`.
    pub fn sign(&self, mechanism: Mechanism, data: &[u8]) -> Result<Vec<u8>, Error> {
        let session = self.session()?;
        let key_id = self.id.id();
        let attrs = session.key_attributes(key_id)?;
        if !session.provider().settings.private_mode.allows_sign(attrs.can_sign) {
            return Err(Error::KeyFunctionNotPermitted("sign"));
        }

        let native = session.mechanisms()?;
        if native.contains(&mechanism) {
            return session.sign(key_id, mechanism, data);
        }

        let engine = &self.manager.ctx().engine;
        let payload = match mechanism.digest() {
            Some(alg) => {
                trace!("Hashing with {} for {} on token '{}'", engine.name(), mechanism, self.id.token().label());
                engine.digest_info(alg, data)?
            }
            None if mechanism == Mechanism::RsaPkcs => data.to_vec(),
            None => return Err(Error::MechanismInvalid(mechanism)),
        };

        if native.contains(&Mechanism::RsaPkcs) {
            session.sign(key_id, Mechanism::RsaPkcs, &payload)
        } else if native.contains(&Mechanism::RsaX509) {
            let k = self.modulus_len(&attrs)?;
            let block = pkcs1::pad_type1(&payload, k)?;
            session.sign(key_id, Mechanism::RsaX509, &block)
        } else {
            Err(Error::MechanismInvalid(mechanism))
        }
    }

    /// Decrypts a PKCS#1 v1.5 encrypted block with the private key.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let session = self.session()?;
        let key_id = self.id.id();
        let attrs = session.key_attributes(key_id)?;
        if !session.provider().settings.private_mode.allows_decrypt(attrs.can_decrypt) {
            return Err(Error::KeyFunctionNotPermitted("decrypt"));
        }

        let native = session.mechanisms()?;
        if native.contains(&Mechanism::RsaPkcs) {
            session.decrypt(key_id, Mechanism::RsaPkcs, data)
        } else if native.contains(&Mechanism::RsaX509) {
            let k = self.modulus_len(&attrs)?;
            let raw = session.decrypt(key_id, Mechanism::RsaX509, data)?;
            let block = pkcs1::left_pad(&raw, k)?;
            Ok(pkcs1::unpad_type2(&block)?.to_vec())
        } else {
            Err(Error::MechanismInvalid(Mechanism::RsaPkcs))
        }
    }

    /// Checks a signature against the public key of the certificate.
    pub fn verify(&self, mechanism: Mechanism, data: &[u8], signature: &[u8]) -> Result<bool, Error> {
        Ok(self
            .manager
            .ctx()
            .engine
            .verify(&self.value, mechanism, data, signature)?)
    }

    fn modulus_len(&self, attrs: &KeyAttributes) -> Result<usize, Error> {
        match attrs.modulus_len {
            Some(len) => Ok(len),
            None => Ok(self.manager.ctx().engine.rsa_modulus_len(&self.value)?),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, TokenSession>, Error> {
        Ok(self.session.lock()?)
    }

    /// The session to use, replaced by a new one if the token was removed.
    fn session(&self) -> Result<Arc<Session>, Error> {
        self.manager.fetch()?;

        let mut current = self.lock()?;
        if current.is_invalidated() {
            debug!(
                "Session for certificate '{}' was invalidated, looking for token '{}'",
                self.label,
                self.id.token().label()
            );
            let session = self.manager.acquire_with_prompt(self.id.token())?;
            *current = TokenSession::new(session, self.manager.clone());
            debug!(
                "Certificate '{}' continues with session generation {}",
                self.label,
                current.session().generation()
            );
        }
        Ok(current.session().clone())
    }
}

impl Clone for CertificateHandle {
    fn clone(&self) -> Self {
        let session = self
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        CertificateHandle {
            id: self.id.clone(),
            label: self.label.clone(),
            value: self.value.clone(),
            manager: self.manager.clone(),
            session: Mutex::new(session),
        }
    }
}

impl fmt::Debug for CertificateHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CertificateHandle")
            .field("id", &self.id.to_string())
            .field("label", &self.label)
            .finish()
    }
}
