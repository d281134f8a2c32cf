//! Sessions with tokens: login, PIN caching and private key operations.

pub mod pin;
mod state;

use std::{fmt, sync::Arc, time::Duration};

pub use self::pin::PinCachePolicy;
pub(crate) use self::state::{Session, TokenCertificate};
pub use self::state::{KeyAttributes, LoginState};

use crate::crypto::CryptoEngine;
use crate::error::Error;
use crate::hooks::{Diagnostics, Hooks};
use crate::system::SystemServices;
use crate::token::{manager::TokenManager, TokenId};

//------------ LoginPolicy ---------------------------------------------------

#[derive(Clone, Debug)]
pub(crate) struct LoginPolicy {
    pub pin_cache_policy: PinCachePolicy,
    pub pin_cache_timeout: Duration,
    pub max_login_retries: u32,
    pub allow_pin_prompt: bool,
}

//------------ SessionContext ------------------------------------------------

/// What sessions need from the helper instance that owns them.
pub(crate) struct SessionContext {
    pub login: LoginPolicy,
    pub hooks: Arc<Hooks>,
    pub system: Arc<dyn SystemServices>,
    pub engine: Arc<dyn CryptoEngine>,
    pub diag: Arc<Diagnostics>,
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("login", &self.login)
            .field("engine", &self.engine.name())
            .finish()
    }
}

//------------ TokenSession --------------------------------------------------

/// A reference to the session with a token.
///
/// Holding one keeps the session, and with it the login, alive. The
/// reference is given up when the value is dropped.
pub struct TokenSession {
    session: Arc<Session>,
    manager: Arc<TokenManager>,
}

impl TokenSession {
    pub(crate) fn new(session: Arc<Session>, manager: Arc<TokenManager>) -> Self {
        TokenSession { session, manager }
    }

    pub fn token(&self) -> &TokenId {
        self.session.token()
    }

    pub(crate) fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Logs in, asking for a PIN through the PIN prompt hook if needed.
    pub fn login(&self) -> Result<(), Error> {
        self.session.login()
    }

    pub fn logout(&self) -> Result<(), Error> {
        self.session.logout()
    }

    pub fn login_state(&self) -> Result<LoginState, Error> {
        self.session.login_state()
    }

    /// Whether the token was removed since the session was opened.
    pub fn is_invalidated(&self) -> bool {
        self.session.is_invalidated()
    }
}

impl Clone for TokenSession {
    fn clone(&self) -> Self {
        self.manager.retain(&self.session);
        TokenSession {
            session: self.session.clone(),
            manager: self.manager.clone(),
        }
    }
}

impl Drop for TokenSession {
    fn drop(&mut self) {
        self.manager.release(&self.session);
    }
}

impl fmt::Debug for TokenSession {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("TokenSession").field(&self.session).finish()
    }
}
