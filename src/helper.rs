//! The helper instance and its builder.
//!
//! A [`Pkcs11Helper`] owns everything that would otherwise be process wide:
//! the system services, the crypto engine, the hooks and the registry of
//! providers. Several instances can live side by side, each with their own
//! providers and sessions.

use std::{
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};

use log::{Level, LevelFilter, debug, error, warn};

use crate::certificate::{self, CertificateCriteria, CertificateHandle, CertificateSummary};
use crate::config::HelperConfig;
use crate::constants::{
    DEFAULT_MAX_LOGIN_RETRIES, DEFAULT_MAX_TOKEN_PROMPTS, DEFAULT_PIN_CACHE_TIMEOUT, DEFAULT_POLL_INTERVAL,
    DEFAULT_TRIGGER_WAIT_GRANULARITY,
};
use crate::crypto::{self, EngineSelection, Mechanism};
use crate::error::Error;
use crate::hooks::{Diagnostics, Hooks, PinRequest, PinResponse, SlotEvent, TokenPromptRequest, TokenPromptResponse};
use crate::module::{cryptoki::CryptokiLoader, retry::RetryPolicy, ModuleLoader};
use crate::session::{LoginPolicy, PinCachePolicy, SessionContext, TokenSession};
use crate::system::{OsSystem, SystemServices};
use crate::token::manager::{ManagerSettings, TokenManager};
use crate::token::{ProviderId, ProviderSettings, TokenId, TokenSummary};

//------------ HelperBuilder -------------------------------------------------

/// Collects the settings of a helper instance.
pub struct HelperBuilder {
    system: Arc<dyn SystemServices>,
    crypto: EngineSelection,
    loader: Arc<dyn ModuleLoader>,
    login: LoginPolicy,
    manager: ManagerSettings,
    log_level: LevelFilter,
}

impl Default for HelperBuilder {
    fn default() -> Self {
        HelperBuilder {
            system: Arc::new(OsSystem),
            crypto: EngineSelection::default(),
            loader: Arc::new(CryptokiLoader),
            login: LoginPolicy {
                pin_cache_policy: PinCachePolicy::Session,
                pin_cache_timeout: DEFAULT_PIN_CACHE_TIMEOUT,
                max_login_retries: DEFAULT_MAX_LOGIN_RETRIES,
                allow_pin_prompt: true,
            },
            manager: ManagerSettings {
                poll_interval: DEFAULT_POLL_INTERVAL,
                trigger_wait_granularity: DEFAULT_TRIGGER_WAIT_GRANULARITY,
                max_token_prompts: DEFAULT_MAX_TOKEN_PROMPTS,
                allow_token_prompt: true,
                retry: RetryPolicy::default(),
            },
            log_level: LevelFilter::Info,
        }
    }
}

impl HelperBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes every instance setting from a configuration.
    ///
    /// Providers are not added, see
    /// [`Pkcs11Helper::add_configured_providers`].
    pub fn from_config(config: &HelperConfig) -> Self {
        HelperBuilder::new()
            .with_crypto(config.crypto_engine)
            .pin_cache(config.pin_cache_policy, config.pin_cache_timeout)
            .max_login_retries(config.max_login_retries)
            .max_token_prompts(config.max_token_prompts)
            .allow_pin_prompt(config.allow_pin_prompt)
            .allow_token_prompt(config.allow_token_prompt)
            .poll_interval(config.poll_interval)
            .trigger_wait_granularity(config.trigger_wait_granularity)
            .retry(config.retry_policy())
            .log_level(config.log_level)
    }

    pub fn with_system(mut self, system: Arc<dyn SystemServices>) -> Self {
        self.system = system;
        self
    }

    pub fn with_crypto(mut self, crypto: impl Into<EngineSelection>) -> Self {
        self.crypto = crypto.into();
        self
    }

    /// Replaces the loader of PKCS#11 shared libraries.
    pub fn with_loader(mut self, loader: Arc<dyn ModuleLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn pin_cache(mut self, policy: PinCachePolicy, timeout: Duration) -> Self {
        self.login.pin_cache_policy = policy;
        self.login.pin_cache_timeout = timeout;
        self
    }

    /// How often the PIN prompt hook is asked before login gives up.
    /// At least one attempt is always made.
    pub fn max_login_retries(mut self, retries: u32) -> Self {
        self.login.max_login_retries = retries.max(1);
        self
    }

    pub fn max_token_prompts(mut self, prompts: u32) -> Self {
        self.manager.max_token_prompts = prompts;
        self
    }

    pub fn allow_pin_prompt(mut self, allow: bool) -> Self {
        self.login.allow_pin_prompt = allow;
        self
    }

    pub fn allow_token_prompt(mut self, allow: bool) -> Self {
        self.manager.allow_token_prompt = allow;
        self
    }

    /// The poll interval of providers in poll mode that have none of their
    /// own.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.manager.poll_interval = interval;
        self
    }

    pub fn trigger_wait_granularity(mut self, granularity: Duration) -> Self {
        self.manager.trigger_wait_granularity = granularity;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.manager.retry = retry;
        self
    }

    pub fn log_level(mut self, level: LevelFilter) -> Self {
        self.log_level = level;
        self
    }

    /// Creates the instance. It still needs to be initialized.
    pub fn build(self) -> Pkcs11Helper {
        Pkcs11Helper {
            setup: Mutex::new(Setup {
                system: self.system,
                crypto: self.crypto,
                loader: self.loader,
                login: self.login,
                manager: self.manager,
            }),
            hooks: Arc::new(Hooks::default()),
            diag: Arc::new(Diagnostics::new(self.log_level)),
            running: Mutex::new(None),
        }
    }
}

//------------ Pkcs11Helper --------------------------------------------------

/// What is fixed when the instance is initialized.
struct Setup {
    system: Arc<dyn SystemServices>,
    crypto: EngineSelection,
    loader: Arc<dyn ModuleLoader>,
    login: LoginPolicy,
    manager: ManagerSettings,
}

/// A helper instance.
///
/// Hooks and the log level can be changed at any time. The system services
/// and crypto engine can only be set before [`initialize`](Self::initialize).
/// All other operations need an initialized instance.
pub struct Pkcs11Helper {
    setup: Mutex<Setup>,
    hooks: Arc<Hooks>,
    diag: Arc<Diagnostics>,
    running: Mutex<Option<Arc<TokenManager>>>,
}

impl Pkcs11Helper {
    pub fn builder() -> HelperBuilder {
        HelperBuilder::new()
    }

    //--- Lifecycle

    pub fn initialize(&self) -> Result<(), Error> {
        let mut running = self.running.lock()?;
        if running.is_some() {
            return Err(Error::AlreadyInitialized);
        }

        let setup = self.setup.lock()?;
        let engine = crypto::select(&setup.crypto)?;
        let ctx = Arc::new(SessionContext {
            login: setup.login.clone(),
            hooks: self.hooks.clone(),
            system: setup.system.clone(),
            engine,
            diag: self.diag.clone(),
        });
        self.diag.info(format_args!(
            "PKCS#11 helper initialized, crypto engine '{}'",
            ctx.engine.name()
        ));
        *running = Some(TokenManager::new(ctx, setup.manager.clone(), setup.loader.clone()));
        Ok(())
    }

    /// Stops slot event detection, closes all sessions and releases all
    /// providers.
    ///
    /// Certificate handles still held fail with `TokenNotPresent`
    /// afterwards.
    pub fn terminate(&self) -> Result<(), Error> {
        let manager = self.running.lock()?.take().ok_or(Error::NotInitialized)?;
        manager.shutdown()?;
        self.diag.info(format_args!("PKCS#11 helper terminated"));
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.running.lock().map(|running| running.is_some()).unwrap_or(false)
    }

    pub fn set_system(&self, system: Arc<dyn SystemServices>) -> Result<(), Error> {
        self.before_init(|setup| setup.system = system)
    }

    pub fn set_crypto(&self, crypto: impl Into<EngineSelection>) -> Result<(), Error> {
        let crypto = crypto.into();
        // An unavailable engine is reported right away.
        crypto::select(&crypto)?;
        self.before_init(|setup| setup.crypto = crypto)
    }

    /// The name of the crypto engine in use.
    pub fn crypto_engine(&self) -> Result<String, Error> {
        Ok(self.manager()?.ctx().engine.name().to_string())
    }

    fn before_init(&self, change: impl FnOnce(&mut Setup)) -> Result<(), Error> {
        let running = self.running.lock()?;
        if running.is_some() {
            return Err(Error::invalid_state(
                "system services and crypto engine can only be set before initialize",
            ));
        }
        let mut setup = self.setup.lock()?;
        change(&mut *setup);
        Ok(())
    }

    fn manager(&self) -> Result<Arc<TokenManager>, Error> {
        self.running.lock()?.clone().ok_or(Error::NotInitialized)
    }

    //--- Hooks

    /// Registers the hook called once for every token insertion and
    /// removal. Replaces any hook registered before.
    pub fn set_slot_event_hook<F>(&self, hook: F)
    where
        F: Fn(&SlotEvent) + Send + Sync + 'static,
    {
        self.hooks.set_slot_event(Some(Arc::new(hook)));
    }

    pub fn clear_slot_event_hook(&self) {
        self.hooks.set_slot_event(None);
    }

    /// Registers the hook asked for a PIN when a token needs a login.
    /// Replaces any hook registered before.
    pub fn set_pin_prompt_hook<F>(&self, hook: F)
    where
        F: Fn(&PinRequest) -> PinResponse + Send + Sync + 'static,
    {
        self.hooks.set_pin_prompt(Some(Arc::new(hook)));
    }

    pub fn clear_pin_prompt_hook(&self) {
        self.hooks.set_pin_prompt(None);
    }

    /// Registers the hook asked to insert a token that is needed but not
    /// present. Replaces any hook registered before.
    pub fn set_token_prompt_hook<F>(&self, hook: F)
    where
        F: Fn(&TokenPromptRequest) -> TokenPromptResponse + Send + Sync + 'static,
    {
        self.hooks.set_token_prompt(Some(Arc::new(hook)));
    }

    pub fn clear_token_prompt_hook(&self) {
        self.hooks.set_token_prompt(None);
    }

    /// Registers the hook receiving the messages of this instance up to the
    /// instance log level. Replaces any hook registered before.
    pub fn set_log_hook<F>(&self, hook: F)
    where
        F: Fn(Level, &str) + Send + Sync + 'static,
    {
        self.diag.set_hook(Some(Arc::new(hook)));
    }

    pub fn clear_log_hook(&self) {
        self.diag.set_hook(None);
    }

    pub fn set_log_level(&self, level: LevelFilter) {
        self.diag.set_level(level);
    }

    pub fn log_level(&self) -> LevelFilter {
        self.diag.level()
    }

    //--- Providers

    pub fn add_provider(&self, path: &str, settings: ProviderSettings) -> Result<ProviderId, Error> {
        self.manager()?.add_provider(path, settings)
    }

    /// Removes every registration of `path`, closing their sessions.
    pub fn remove_provider(&self, path: &str) -> Result<(), Error> {
        self.manager()?.remove_provider(path)
    }

    /// Adds the providers of a configuration, in order.
    pub fn add_configured_providers(&self, config: &HelperConfig) -> Result<Vec<ProviderId>, Error> {
        config
            .providers
            .iter()
            .map(|provider| self.add_provider(&provider.path, provider.settings()))
            .collect()
    }

    //--- Tokens

    /// The present tokens, in provider order, then by slot.
    pub fn tokens(&self) -> Result<Vec<TokenSummary>, Error> {
        let manager = self.manager()?;
        manager.fetch()?;
        Ok(manager.tokens()?.into_iter().map(TokenSummary::from_present).collect())
    }

    /// A reference to the session with a token, for logging in ahead of
    /// time.
    pub fn open_session(&self, token: &TokenId) -> Result<TokenSession, Error> {
        let manager = self.manager()?;
        manager.fetch()?;
        let session = manager.acquire_with_prompt(token)?;
        Ok(TokenSession::new(session, manager))
    }

    /// Logs out of every token and forgets all cached PINs. Sessions in use
    /// are replaced by new ones on their next use.
    pub fn logout(&self) -> Result<(), Error> {
        self.manager()?.logout_all()
    }

    /// Rescans the slots of every provider, whatever its slot event method.
    pub fn refresh(&self) -> Result<(), Error> {
        self.manager()?.refresh_all()
    }

    /// The number of references to the current session with a token.
    pub fn session_references(&self, token: &TokenId) -> Result<usize, Error> {
        Ok(self.manager()?.references(token))
    }

    //--- Certificates

    /// Every certificate matching the criteria.
    pub fn certificates(&self, criteria: &CertificateCriteria) -> Result<Vec<CertificateSummary>, Error> {
        let manager = self.manager()?;
        let found = certificate::search(&manager, criteria)?;
        let mut summaries = Vec::with_capacity(found.len());
        for certificate in &found {
            match certificate.summary(&manager) {
                Ok(summary) => summaries.push(summary),
                Err(err) => warn!("Skipping certificate {}: {}", certificate.certificate_id(), err),
            }
        }
        Ok(summaries)
    }

    /// Finds a certificate and its private key.
    ///
    /// If several certificates match, the first one found is returned. The
    /// order in which certificates are found is not specified. Use
    /// [`CertificateCriteria::unique`] to get an error instead.
    pub fn find_certificate(&self, criteria: &CertificateCriteria) -> Result<CertificateHandle, Error> {
        let manager = self.manager()?;
        let mut found = certificate::search(&manager, criteria)?;
        if criteria.is_unique() && found.len() > 1 {
            return Err(Error::ArgumentsBad(format!(
                "{} certificates match where one was expected",
                found.len()
            )));
        }
        if found.is_empty() {
            return Err(Error::CertificateNotFound);
        }
        let first = found.swap_remove(0);
        debug!("Using certificate {}", first.certificate_id());
        Ok(first.into_handle(manager))
    }

    pub fn sign(&self, handle: &CertificateHandle, mechanism: Mechanism, data: &[u8]) -> Result<Vec<u8>, Error> {
        self.manager()?;
        handle.sign(mechanism, data)
    }

    pub fn decrypt(&self, handle: &CertificateHandle, data: &[u8]) -> Result<Vec<u8>, Error> {
        self.manager()?;
        handle.decrypt(data)
    }
}

impl Drop for Pkcs11Helper {
    fn drop(&mut self) {
        if self.is_initialized() {
            if let Err(err) = self.terminate() {
                error!("Terminating PKCS#11 helper failed: {}", err);
            }
        }
    }
}

impl fmt::Debug for Pkcs11Helper {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Pkcs11Helper")
            .field("initialized", &self.is_initialized())
            .field("hooks", &self.hooks)
            .field("diagnostics", &self.diag)
            .finish()
    }
}
