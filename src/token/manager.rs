//! The registry of providers and of the sessions with their tokens.
//!
//! Locking: the registry lock guards structural changes, i.e. the provider
//! list and the session table. Each provider has its own snapshot lock,
//! held while its slots are rescanned. When both are needed, the snapshot
//! lock is taken first. No lock of the manager is held while a hook runs.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Duration,
};

use log::{debug, trace, warn};

use crate::error::Error;
use crate::hooks::{SlotEventKind, TokenPromptRequest, TokenPromptResponse};
use crate::module::{retry::RetryPolicy, ModuleLoader, SlotId};
use crate::session::{Session, SessionContext};
use crate::system::SystemServices;

use super::events::{diff, EventQueue};
use super::provider::{KnownToken, Provider, ProviderId, ProviderSettings, SlotEventMethod};
use super::watcher::Watcher;
use super::TokenId;

//------------ ManagerSettings -----------------------------------------------

#[derive(Clone, Debug)]
pub(crate) struct ManagerSettings {
    pub poll_interval: Duration,
    pub trigger_wait_granularity: Duration,
    pub max_token_prompts: u32,
    pub allow_token_prompt: bool,
    pub retry: RetryPolicy,
}

//------------ Registry ------------------------------------------------------

type SessionKey = (ProviderId, TokenId);

struct SessionEntry {
    session: Arc<Session>,
    refs: usize,
}

#[derive(Default)]
struct Registry {
    providers: Vec<Arc<Provider>>,
    next_provider: u64,
    next_generation: u64,
    sessions: HashMap<SessionKey, SessionEntry>,
}

impl Registry {
    fn open_sessions(&self, provider: ProviderId) -> usize {
        self.sessions
            .iter()
            .filter(|((id, _), entry)| *id == provider && entry.refs > 0)
            .count()
    }

    /// The table entry, if it still holds this session.
    fn current_entry(&mut self, session: &Arc<Session>) -> Option<&mut SessionEntry> {
        let key = (session.provider().id, session.token().clone());
        self.sessions
            .get_mut(&key)
            .filter(|entry| Arc::ptr_eq(&entry.session, session))
    }
}

/// A token present in a slot, as listed by [`TokenManager::tokens`].
#[derive(Clone, Debug)]
pub(crate) struct PresentToken {
    pub provider: Arc<Provider>,
    pub slot: SlotId,
    pub token: KnownToken,
}

//------------ TokenManager --------------------------------------------------

pub(crate) struct TokenManager {
    me: Weak<TokenManager>,
    ctx: Arc<SessionContext>,
    settings: ManagerSettings,
    loader: Arc<dyn ModuleLoader>,
    registry: Mutex<Registry>,
    events: EventQueue,
    watcher: Watcher,
}

impl TokenManager {
    pub fn new(ctx: Arc<SessionContext>, settings: ManagerSettings, loader: Arc<dyn ModuleLoader>) -> Arc<Self> {
        Arc::new_cyclic(|me| TokenManager {
            me: me.clone(),
            ctx,
            watcher: Watcher::new(settings.trigger_wait_granularity),
            settings,
            loader,
            registry: Mutex::new(Registry::default()),
            events: EventQueue::default(),
        })
    }

    pub fn ctx(&self) -> &Arc<SessionContext> {
        &self.ctx
    }

    pub fn system(&self) -> Arc<dyn SystemServices> {
        self.ctx.system.clone()
    }

    fn registry(&self) -> Result<MutexGuard<'_, Registry>, Error> {
        Ok(self.registry.lock()?)
    }

    pub fn providers(&self) -> Vec<Arc<Provider>> {
        match self.registry.lock() {
            Ok(registry) => registry.providers.clone(),
            Err(_) => Vec::new(),
        }
    }

    //--- Providers

    pub fn add_provider(&self, path: &str, settings: ProviderSettings) -> Result<ProviderId, Error> {
        if settings.reject_duplicate && self.providers().iter().any(|p| p.path == path) {
            return Err(Error::ProviderAlreadyLoaded(path.to_string()));
        }

        let module = self.loader.load(path).map_err(|err| {
            self.ctx
                .diag
                .error(format_args!("Cannot load PKCS#11 provider '{}': {}", path, err));
            Error::ProviderLoadFailed {
                path: path.to_string(),
                reason: err.to_string(),
            }
        })?;

        let id = {
            let mut registry = self.registry()?;
            registry.next_provider += 1;
            ProviderId::new(registry.next_provider)
        };
        let provider = Arc::new(Provider::new(
            id,
            path,
            settings,
            module,
            self.settings.poll_interval,
            self.settings.retry.clone(),
        ));

        match provider.call("C_GetInfo", |m| m.info()) {
            Ok(info) => debug!(
                "Provider '{}' is '{}' by '{}', library version {}, Cryptoki {}",
                provider.name, info.description, info.manufacturer, info.library_version, info.cryptoki_version
            ),
            Err(err) => debug!("No module info for provider '{}': {}", provider.name, err),
        }

        // The initial scan establishes the baseline and raises no events.
        {
            let mut snapshot = provider.snapshot()?;
            match provider.scan() {
                Ok(found) => *snapshot = found,
                Err(err) => self.ctx.diag.warn(format_args!(
                    "Cannot scan slots of provider '{}': {}",
                    provider.name, err
                )),
            }
        }

        {
            let mut registry = self.registry()?;
            if provider.settings.reject_duplicate && registry.providers.iter().any(|p| p.path == path) {
                return Err(Error::ProviderAlreadyLoaded(path.to_string()));
            }
            registry.providers.push(provider.clone());
        }
        self.watcher.watch(self.me.clone(), provider.clone())?;

        self.ctx.diag.info(format_args!(
            "Added PKCS#11 provider '{}' ({}), slot events: {}",
            provider.name, path, provider.method
        ));
        Ok(id)
    }

    /// Removes every registration of `path`.
    pub fn remove_provider(&self, path: &str) -> Result<(), Error> {
        let (providers, sessions) = {
            let mut registry = self.registry()?;
            let matching: Vec<Arc<Provider>> = registry.providers.iter().filter(|p| p.path == path).cloned().collect();
            if matching.is_empty() {
                return Err(Error::ProviderNotFound(path.to_string()));
            }
            for provider in &matching {
                let open = registry.open_sessions(provider.id);
                if open > 0 && !provider.settings.allow_removal_while_sessions_open {
                    return Err(Error::ProviderBusy {
                        path: path.to_string(),
                        sessions: open,
                    });
                }
            }

            registry.providers.retain(|p| p.path != path);
            let ids: Vec<ProviderId> = matching.iter().map(|p| p.id).collect();
            let keys: Vec<SessionKey> = registry
                .sessions
                .keys()
                .filter(|(id, _)| ids.contains(id))
                .cloned()
                .collect();
            let sessions: Vec<Arc<Session>> = keys
                .iter()
                .filter_map(|key| registry.sessions.remove(key))
                .map(|entry| entry.session)
                .collect();
            (matching, sessions)
        };

        for provider in &providers {
            provider.mark_removed();
            self.watcher.unwatch(provider.id)?;
        }
        for session in sessions {
            session.invalidate();
            session.close()?;
        }

        self.ctx
            .diag
            .info(format_args!("Removed PKCS#11 provider '{}'", path));
        Ok(())
    }

    //--- Tokens

    /// The present tokens, in provider order, then by slot.
    pub fn tokens(&self) -> Result<Vec<PresentToken>, Error> {
        let mut tokens = Vec::new();
        for provider in self.providers() {
            let snapshot = provider.snapshot()?;
            for (slot, token) in snapshot.iter() {
                tokens.push(PresentToken {
                    provider: provider.clone(),
                    slot: *slot,
                    token: token.clone(),
                });
            }
        }
        Ok(tokens)
    }

    fn locate(&self, token: &TokenId) -> Result<Option<(Arc<Provider>, SlotId)>, Error> {
        for provider in self.providers() {
            let snapshot = provider.snapshot()?;
            if let Some((slot, _)) = snapshot.iter().find(|(_, known)| &known.id == token) {
                return Ok(Some((provider.clone(), *slot)));
            }
        }
        Ok(None)
    }

    //--- Slot events

    /// Rescans the slots of a provider and delivers the resulting events.
    pub fn refresh_provider(&self, provider: &Arc<Provider>) -> Result<(), Error> {
        if provider.is_removed() {
            return Ok(());
        }

        let events = {
            let mut snapshot = provider.snapshot()?;
            let found = provider.scan()?;
            let events = diff(provider, &snapshot, &found);
            for event in events.iter().filter(|e| e.kind == SlotEventKind::Removed) {
                self.invalidate_token(provider.id, &event.token)?;
            }
            *snapshot = found;
            events
        };

        for event in &events {
            self.ctx.diag.info(format_args!("Slot event: {}", event));
        }
        self.events.push(events);
        self.events.deliver(&self.ctx.hooks);
        Ok(())
    }

    /// Rescans every provider regardless of its detection method.
    pub fn refresh_all(&self) -> Result<(), Error> {
        for provider in self.providers() {
            if let Err(err) = self.refresh_provider(&provider) {
                if err.is_fatal() {
                    return Err(err);
                }
                warn!("Cannot rescan provider '{}': {}", provider.name, err);
            }
        }
        Ok(())
    }

    /// Rescans the providers that detect slot events on use.
    pub fn fetch(&self) -> Result<(), Error> {
        for provider in self.providers() {
            if provider.method == SlotEventMethod::Fetch {
                if let Err(err) = self.refresh_provider(&provider) {
                    if err.is_fatal() {
                        return Err(err);
                    }
                    warn!("Cannot rescan provider '{}': {}", provider.name, err);
                }
            }
        }
        Ok(())
    }

    fn invalidate_token(&self, provider: ProviderId, token: &TokenId) -> Result<(), Error> {
        let removed = self.registry()?.sessions.remove(&(provider, token.clone()));
        if let Some(entry) = removed {
            entry.session.invalidate();
        }
        Ok(())
    }

    //--- Sessions

    /// Gets a reference to the session with a token, creating it if needed.
    pub fn acquire(&self, token: &TokenId) -> Result<Arc<Session>, Error> {
        let (provider, slot) = self.locate(token)?.ok_or_else(|| Error::TokenNotPresent {
            label: token.label().to_string(),
        })?;

        let mut registry = self.registry()?;
        let key = (provider.id, token.clone());
        if let Some(entry) = registry.sessions.get_mut(&key) {
            if !entry.session.is_invalidated() {
                entry.refs += 1;
                trace!(
                    "Session with token '{}' now has {} reference(s)",
                    token.label(),
                    entry.refs
                );
                return Ok(entry.session.clone());
            }
        }

        registry.next_generation += 1;
        let generation = registry.next_generation;
        let session = Arc::new(Session::new(provider, token.clone(), slot, generation, self.ctx.clone()));
        registry.sessions.insert(
            key,
            SessionEntry {
                session: session.clone(),
                refs: 1,
            },
        );
        drop(registry);
        self.ctx.diag.debug(format_args!(
            "Created session generation {} for token '{}'",
            generation,
            token.label()
        ));
        Ok(session)
    }

    /// Like [`acquire`](Self::acquire), but asks the user to insert a
    /// missing token through the token prompt hook.
    pub fn acquire_with_prompt(&self, token: &TokenId) -> Result<Arc<Session>, Error> {
        let hook = match self.ctx.hooks.token_prompt() {
            Some(hook) if self.settings.allow_token_prompt => hook,
            _ => return self.acquire(token),
        };

        for attempt in 1..=self.settings.max_token_prompts {
            match self.acquire(token) {
                Err(Error::TokenNotPresent { .. }) => {}
                res => return res,
            }
            let request = TokenPromptRequest {
                token: token.clone(),
                attempt,
            };
            match hook(&request) {
                TokenPromptResponse::Retry => self.refresh_all()?,
                TokenPromptResponse::Cancel => return Err(Error::Cancelled),
            }
        }
        self.acquire(token)
    }

    /// Adds a reference to a session already held.
    pub fn retain(&self, session: &Arc<Session>) {
        let mut registry = self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(entry) = registry.current_entry(session) {
            entry.refs += 1;
        }
    }

    /// Gives up a reference. The last one removes the session from the
    /// table, the PKCS#11 session closes once nobody uses it any more.
    pub fn release(&self, session: &Arc<Session>) {
        let removed = {
            let mut registry = self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let last = match registry.current_entry(session) {
                Some(entry) => {
                    entry.refs = entry.refs.saturating_sub(1);
                    entry.refs == 0
                }
                None => false,
            };
            if last {
                let key = (session.provider().id, session.token().clone());
                registry.sessions.remove(&key)
            } else {
                None
            }
        };
        if removed.is_some() {
            debug!("Last reference to session with token '{}' released", session.token().label());
        }
    }

    /// The number of references to the current session with a token.
    pub fn references(&self, token: &TokenId) -> usize {
        match self.registry.lock() {
            Ok(registry) => registry
                .sessions
                .iter()
                .filter(|((_, id), _)| id == token)
                .map(|(_, entry)| entry.refs)
                .sum(),
            Err(_) => 0,
        }
    }

    /// Logs out of every token and starts over with new sessions.
    pub fn logout_all(&self) -> Result<(), Error> {
        let sessions: Vec<Arc<Session>> = self
            .registry()?
            .sessions
            .drain()
            .map(|(_, entry)| entry.session)
            .collect();
        for session in sessions {
            if let Err(err) = session.logout() {
                warn!("Logout from token '{}' failed: {}", session.token().label(), err);
            }
            session.invalidate();
            session.close()?;
        }
        Ok(())
    }

    /// Stops all slot event detection and closes all sessions.
    pub fn shutdown(&self) -> Result<(), Error> {
        self.watcher.shutdown()?;

        let (providers, sessions) = {
            let mut registry = self.registry()?;
            let providers = std::mem::take(&mut registry.providers);
            let sessions: Vec<Arc<Session>> = registry.sessions.drain().map(|(_, entry)| entry.session).collect();
            (providers, sessions)
        };
        for session in sessions {
            session.invalidate();
            session.close()?;
        }
        for provider in providers {
            provider.mark_removed();
            debug!("Released provider '{}'", provider.name);
        }
        Ok(())
    }
}
