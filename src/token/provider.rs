use std::{
    collections::BTreeMap,
    fmt,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use log::{trace, warn};
use serde::{de, Deserialize, Deserializer, Serialize};

use crate::error::Error;
use crate::module::{retry::RetryPolicy, Module, ModuleError, SlotId, TokenInfo};

use super::TokenId;

//------------ SlotEventMethod -----------------------------------------------

/// How insertion and removal of tokens is detected.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotEventMethod {
    /// Trigger if the module supports waiting for slot events and can be
    /// called from several threads, poll otherwise.
    #[default]
    Auto,

    /// A background thread waits for slot events of the module.
    Trigger,

    /// A background thread rescans the slots at an interval.
    Poll,

    /// Slots are rescanned at the start of every helper operation.
    Fetch,

    /// Slots are only scanned when the provider is added and on an
    /// explicit refresh.
    None,
}

impl fmt::Display for SlotEventMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SlotEventMethod::Auto => write!(f, "auto"),
            SlotEventMethod::Trigger => write!(f, "trigger"),
            SlotEventMethod::Poll => write!(f, "poll"),
            SlotEventMethod::Fetch => write!(f, "fetch"),
            SlotEventMethod::None => write!(f, "none"),
        }
    }
}

impl FromStr for SlotEventMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(SlotEventMethod::Auto),
            "trigger" => Ok(SlotEventMethod::Trigger),
            "poll" => Ok(SlotEventMethod::Poll),
            "fetch" => Ok(SlotEventMethod::Fetch),
            "none" => Ok(SlotEventMethod::None),
            _ => Err(format!(
                "expected \"auto\", \"trigger\", \"poll\", \"fetch\" or \"none\", found: \"{}\"",
                s
            )),
        }
    }
}

impl<'de> Deserialize<'de> for SlotEventMethod {
    fn deserialize<D>(d: D) -> Result<SlotEventMethod, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(d)?;
        SlotEventMethod::from_str(&string).map_err(de::Error::custom)
    }
}

//------------ PrivateMode ---------------------------------------------------

/// Which private key operations the keys of a provider are used for.
///
/// The automatic mode follows the `CKA_SIGN` and `CKA_DECRYPT` attributes
/// of each key. Naming operations overrides the attributes, for modules
/// that do not set them properly.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PrivateMode {
    sign: bool,
    decrypt: bool,
}

impl PrivateMode {
    pub const AUTO: PrivateMode = PrivateMode {
        sign: false,
        decrypt: false,
    };
    pub const SIGN: PrivateMode = PrivateMode {
        sign: true,
        decrypt: false,
    };
    pub const DECRYPT: PrivateMode = PrivateMode {
        sign: false,
        decrypt: true,
    };

    pub fn with(self, other: PrivateMode) -> Self {
        PrivateMode {
            sign: self.sign || other.sign,
            decrypt: self.decrypt || other.decrypt,
        }
    }

    pub fn is_auto(self) -> bool {
        self == Self::AUTO
    }

    pub fn allows_sign(self, key_can_sign: bool) -> bool {
        if self.is_auto() { key_can_sign } else { self.sign }
    }

    pub fn allows_decrypt(self, key_can_decrypt: bool) -> bool {
        if self.is_auto() { key_can_decrypt } else { self.decrypt }
    }
}

impl fmt::Display for PrivateMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (self.sign, self.decrypt) {
            (false, false) => write!(f, "auto"),
            (true, false) => write!(f, "sign"),
            (false, true) => write!(f, "decrypt"),
            (true, true) => write!(f, "sign,decrypt"),
        }
    }
}

impl FromStr for PrivateMode {
    type Err = String;

    /// Parses a comma separated list of `auto`, `sign` and `decrypt`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(',').map(str::trim).try_fold(PrivateMode::AUTO, |mode, part| match part {
            "auto" => Ok(mode),
            "sign" => Ok(mode.with(PrivateMode::SIGN)),
            "decrypt" => Ok(mode.with(PrivateMode::DECRYPT)),
            _ => Err(format!(
                "expected \"auto\", \"sign\" or \"decrypt\", found: \"{}\"",
                part
            )),
        })
    }
}

impl<'de> Deserialize<'de> for PrivateMode {
    fn deserialize<D>(d: D) -> Result<PrivateMode, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            One(String),
            Many(Vec<String>),
        }

        let joined = match Repr::deserialize(d)? {
            Repr::One(s) => s,
            Repr::Many(list) => list.join(","),
        };
        PrivateMode::from_str(&joined).map_err(de::Error::custom)
    }
}

impl Serialize for PrivateMode {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        s.collect_str(self)
    }
}

//------------ ProviderSettings ----------------------------------------------

/// How a provider is to be used, given when it is added.
#[derive(Clone, Debug)]
pub struct ProviderSettings {
    /// The friendly name. Defaults to the path.
    pub name: Option<String>,

    /// PIN entry happens on the token's own PIN pad.
    pub protected_auth: bool,
    pub private_mode: PrivateMode,
    pub slot_event: SlotEventMethod,

    /// The poll interval in poll mode. Defaults to the helper wide setting.
    pub poll_interval: Option<Duration>,
    pub allow_removal_while_sessions_open: bool,

    /// Certificates are private objects, log in before looking for them.
    pub cert_is_private: bool,

    /// Refuse to add the provider if its path is already registered.
    pub reject_duplicate: bool,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        ProviderSettings {
            name: None,
            protected_auth: false,
            private_mode: PrivateMode::AUTO,
            slot_event: SlotEventMethod::Auto,
            poll_interval: None,
            allow_removal_while_sessions_open: true,
            cert_is_private: false,
            reject_duplicate: false,
        }
    }
}

//------------ ProviderId ----------------------------------------------------

/// Tells apart registrations, including several of the same path.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ProviderId(u64);

impl ProviderId {
    pub(crate) fn new(serial: u64) -> Self {
        ProviderId(serial)
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

//------------ Provider ------------------------------------------------------

/// A token seen in a slot at the last scan.
#[derive(Clone, Debug)]
pub(crate) struct KnownToken {
    pub id: TokenId,
    pub info: TokenInfo,

    /// The description of the slot, usually the name of the reader.
    pub reader: String,
}

pub(crate) type Snapshot = BTreeMap<SlotId, KnownToken>;

/// One registration of a loaded PKCS#11 module.
pub(crate) struct Provider {
    pub id: ProviderId,
    pub path: String,
    pub name: String,
    pub settings: ProviderSettings,

    /// The detection method `Auto` was resolved into.
    pub method: SlotEventMethod,
    pub poll_interval: Duration,
    module: Arc<dyn Module>,
    retry: RetryPolicy,

    /// Serializes all calls into modules that are not thread safe.
    call_lock: Option<Mutex<()>>,

    /// The tokens seen at the last scan. Held for the whole of a rescan.
    snapshot: Mutex<Snapshot>,
    removed: AtomicBool,
}

impl Provider {
    pub fn new(
        id: ProviderId,
        path: &str,
        settings: ProviderSettings,
        module: Arc<dyn Module>,
        default_poll_interval: Duration,
        retry: RetryPolicy,
    ) -> Self {
        let name = settings.name.clone().unwrap_or_else(|| path.to_string());
        let thread_safe = module.is_thread_safe();
        let method = match settings.slot_event {
            SlotEventMethod::Auto if module.supports_slot_events() && thread_safe => SlotEventMethod::Trigger,
            SlotEventMethod::Auto => SlotEventMethod::Poll,
            other => other,
        };
        let poll_interval = settings.poll_interval.unwrap_or(default_poll_interval);

        Provider {
            id,
            path: path.to_string(),
            name,
            settings,
            method,
            poll_interval,
            module,
            retry,
            call_lock: if thread_safe { None } else { Some(Mutex::new(())) },
            snapshot: Mutex::new(Snapshot::new()),
            removed: AtomicBool::new(false),
        }
    }

    /// Calls into the module.
    pub fn call<T, F>(&self, function: &str, op: F) -> Result<T, ModuleError>
    where
        F: FnOnce(&dyn Module) -> Result<T, ModuleError>,
    {
        // The lock guards no data, poisoning leaves nothing inconsistent.
        let _guard = self
            .call_lock
            .as_ref()
            .map(|lock| lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner()));

        let res = op(self.module.as_ref());
        match &res {
            Ok(_) => trace!("{} on provider '{}': ok", function, self.name),
            Err(err) => trace!("{} on provider '{}': {}", function, self.name, err),
        }
        res
    }

    /// Calls a read-only function, retrying transient failures.
    pub fn query<T, F>(&self, function: &str, mut op: F) -> Result<T, ModuleError>
    where
        F: FnMut(&dyn Module) -> Result<T, ModuleError>,
    {
        let desc = format!("{} on provider '{}'", function, self.name);
        self.retry.run(&desc, || self.call(function, &mut op))
    }

    pub fn snapshot(&self) -> Result<MutexGuard<'_, Snapshot>, Error> {
        Ok(self.snapshot.lock()?)
    }

    /// Reads which tokens are present right now.
    pub fn scan(&self) -> Result<Snapshot, ModuleError> {
        let slots = self.query("C_GetSlotList", |m| m.slots(true))?;
        let mut found = Snapshot::new();
        for slot in slots {
            // The token may be pulled between listing and looking at it.
            match self.call("C_GetTokenInfo", |m| m.token_info(slot)) {
                Ok(info) => {
                    let reader = match self.call("C_GetSlotInfo", |m| m.slot_info(slot)) {
                        Ok(slot_info) => slot_info.description,
                        Err(_) => String::new(),
                    };
                    found.insert(
                        slot,
                        KnownToken {
                            id: TokenId::from_info(&info),
                            info,
                            reader,
                        },
                    );
                }
                Err(err) if err.rv.is_token_gone() => {}
                Err(err) => warn!("Skipping slot {} of provider '{}': {}", slot, self.name, err),
            }
        }
        Ok(found)
    }

    pub fn mark_removed(&self) {
        self.removed.store(true, Ordering::SeqCst);
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Provider")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("name", &self.name)
            .field("method", &self.method)
            .finish()
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::soft::SoftModule;

    #[test]
    fn private_mode_parsing() {
        assert_eq!(PrivateMode::from_str("auto").unwrap(), PrivateMode::AUTO);
        assert_eq!(
            PrivateMode::from_str("sign, decrypt").unwrap(),
            PrivateMode::SIGN.with(PrivateMode::DECRYPT)
        );
        assert!(PrivateMode::from_str("wrap").is_err());

        assert!(PrivateMode::AUTO.allows_sign(true));
        assert!(!PrivateMode::AUTO.allows_decrypt(false));
        assert!(PrivateMode::DECRYPT.allows_decrypt(false));
        assert!(!PrivateMode::DECRYPT.allows_sign(true));
    }

    #[test]
    fn auto_resolves_by_module_capabilities() {
        let provider = |module: SoftModule| {
            Provider::new(
                ProviderId::new(1),
                "/soft.so",
                ProviderSettings::default(),
                Arc::new(module),
                Duration::from_secs(1),
                RetryPolicy::never(),
            )
        };
        assert_eq!(provider(SoftModule::new("a")).method, SlotEventMethod::Trigger);
        assert_eq!(
            provider(SoftModule::new("b").with_slot_events(false)).method,
            SlotEventMethod::Poll
        );
        assert_eq!(
            provider(SoftModule::new("c").with_thread_safety(false)).method,
            SlotEventMethod::Poll
        );
    }
}
