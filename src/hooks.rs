//! Callbacks an application registers with a helper instance.
//!
//! Registering a hook replaces any hook registered before. Hooks are called
//! from whatever thread ran into the condition: the caller's thread for
//! foreground operations, a background thread for slot events detected by
//! trigger or poll mode. Hooks must therefore be `Send + Sync`.
//!
//! Slot event and log hooks are called without any helper lock held and may
//! call back into the helper. The PIN prompt hook runs while the session
//! with the token is locked, so it must not use that same token.

use std::{
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use log::{Level, LevelFilter, log, log_enabled};
use secrecy::SecretString;
use serde::Serialize;

use crate::module::SlotId;
use crate::token::TokenId;

//------------ SlotEvent -----------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotEventKind {
    Inserted,
    Removed,
}

impl fmt::Display for SlotEventKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SlotEventKind::Inserted => write!(f, "inserted"),
            SlotEventKind::Removed => write!(f, "removed"),
        }
    }
}

/// A token appeared in or disappeared from a slot.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct SlotEvent {
    pub kind: SlotEventKind,

    /// The friendly name of the provider.
    pub provider: String,
    pub slot: SlotId,
    pub token: TokenId,
}

impl fmt::Display for SlotEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "token '{}' {} in slot {} of provider '{}'",
            self.token.label(),
            self.kind,
            self.slot,
            self.provider
        )
    }
}

pub type SlotEventHook = Arc<dyn Fn(&SlotEvent) + Send + Sync>;

//------------ PIN prompt ----------------------------------------------------

/// What the PIN prompt hook is asked for.
#[derive(Clone, Debug)]
pub struct PinRequest {
    pub token: TokenId,

    /// Starts at 1 and goes up to the configured maximum login retries.
    pub attempt: u32,
    pub max_attempts: u32,

    /// Remaining PIN tries as reported by the token, if it reports them.
    pub retries_left: Option<u32>,
}

pub enum PinResponse {
    Pin(SecretString),

    /// Use the PIN cached for this token, if any.
    UseCached,
    Cancel,
}

pub type PinPromptHook = Arc<dyn Fn(&PinRequest) -> PinResponse + Send + Sync>;

//------------ Token prompt --------------------------------------------------

/// Asks the user to insert a token that is needed but not present.
#[derive(Clone, Debug)]
pub struct TokenPromptRequest {
    pub token: TokenId,
    pub attempt: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TokenPromptResponse {
    /// The token should be there now, look again.
    Retry,
    Cancel,
}

pub type TokenPromptHook = Arc<dyn Fn(&TokenPromptRequest) -> TokenPromptResponse + Send + Sync>;

//------------ LogHook -------------------------------------------------------

pub type LogHook = Arc<dyn Fn(Level, &str) + Send + Sync>;

//------------ Hooks ---------------------------------------------------------

/// The hooks registered with one helper instance.
#[derive(Default)]
pub(crate) struct Hooks {
    slot_event: Mutex<Option<SlotEventHook>>,
    pin_prompt: Mutex<Option<PinPromptHook>>,
    token_prompt: Mutex<Option<TokenPromptHook>>,
}

impl Hooks {
    pub fn set_slot_event(&self, hook: Option<SlotEventHook>) {
        Self::replace(&self.slot_event, hook)
    }

    pub fn set_pin_prompt(&self, hook: Option<PinPromptHook>) {
        Self::replace(&self.pin_prompt, hook)
    }

    pub fn set_token_prompt(&self, hook: Option<TokenPromptHook>) {
        Self::replace(&self.token_prompt, hook)
    }

    pub fn slot_event(&self) -> Option<SlotEventHook> {
        Self::current(&self.slot_event)
    }

    pub fn pin_prompt(&self) -> Option<PinPromptHook> {
        Self::current(&self.pin_prompt)
    }

    pub fn token_prompt(&self) -> Option<TokenPromptHook> {
        Self::current(&self.token_prompt)
    }

    // A hook slot only ever holds an Arc, a poisoned lock cannot leave it
    // half written.
    fn replace<T>(slot: &Mutex<Option<T>>, hook: Option<T>) {
        match slot.lock() {
            Ok(mut guard) => *guard = hook,
            Err(poisoned) => *poisoned.into_inner() = hook,
        }
    }

    fn current<T: Clone>(slot: &Mutex<Option<T>>) -> Option<T> {
        match slot.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("slot_event", &self.slot_event().is_some())
            .field("pin_prompt", &self.pin_prompt().is_some())
            .field("token_prompt", &self.token_prompt().is_some())
            .finish()
    }
}

//------------ Diagnostics ---------------------------------------------------

/// Routes the messages of a helper instance.
///
/// Every message goes to the `log` facade. Messages at or above the instance
/// log level also go to the log hook, if one is registered.
pub(crate) struct Diagnostics {
    level: AtomicUsize,
    hook: Mutex<Option<LogHook>>,
}

impl Diagnostics {
    pub fn new(level: LevelFilter) -> Self {
        Diagnostics {
            level: AtomicUsize::new(level as usize),
            hook: Mutex::new(None),
        }
    }

    pub fn set_level(&self, level: LevelFilter) {
        self.level.store(level as usize, Ordering::Relaxed);
    }

    pub fn level(&self) -> LevelFilter {
        match self.level.load(Ordering::Relaxed) {
            0 => LevelFilter::Off,
            1 => LevelFilter::Error,
            2 => LevelFilter::Warn,
            3 => LevelFilter::Info,
            4 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }

    pub fn set_hook(&self, hook: Option<LogHook>) {
        Hooks::replace(&self.hook, hook)
    }

    pub fn log(&self, level: Level, msg: fmt::Arguments) {
        let hook = if level <= self.level() {
            Hooks::current(&self.hook)
        } else {
            None
        };
        if hook.is_none() && !log_enabled!(level) {
            return;
        }

        let msg = msg.to_string();
        log!(level, "{}", msg);
        if let Some(hook) = hook {
            hook(level, &msg);
        }
    }

    pub fn error(&self, msg: fmt::Arguments) {
        self.log(Level::Error, msg)
    }

    pub fn warn(&self, msg: fmt::Arguments) {
        self.log(Level::Warn, msg)
    }

    pub fn info(&self, msg: fmt::Arguments) {
        self.log(Level::Info, msg)
    }

    pub fn debug(&self, msg: fmt::Arguments) {
        self.log(Level::Debug, msg)
    }
}

impl fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Diagnostics").field("level", &self.level()).finish()
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_hook_respects_level() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let diag = Diagnostics::new(LevelFilter::Info);
        let sink = seen.clone();
        diag.set_hook(Some(Arc::new(move |level, msg: &str| {
            sink.lock().unwrap().push((level, msg.to_string()));
        })));

        diag.info(format_args!("provider {} added", "soft"));
        diag.debug(format_args!("hidden"));
        diag.set_level(LevelFilter::Debug);
        diag.debug(format_args!("shown"));

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                (Level::Info, "provider soft added".to_string()),
                (Level::Debug, "shown".to_string())
            ]
        );
    }

    #[test]
    fn second_registration_replaces_first() {
        let hooks = Hooks::default();
        hooks.set_token_prompt(Some(Arc::new(|_| TokenPromptResponse::Retry)));
        hooks.set_token_prompt(Some(Arc::new(|_| TokenPromptResponse::Cancel)));

        let request = TokenPromptRequest {
            token: TokenId::new("m", "model", "1", "label"),
            attempt: 1,
        };
        assert_eq!((hooks.token_prompt().unwrap())(&request), TokenPromptResponse::Cancel);
    }
}
