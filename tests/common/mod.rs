#![allow(dead_code)] // Different tests use different parts.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use chrono::{DateTime, TimeDelta, Utc};
use secrecy::SecretString;

use pkcs11_helper::module::soft::{self_signed_identity, SoftModule, SoftModuleLoader, SoftToken};
use pkcs11_helper::module::SlotId;
use pkcs11_helper::{
    HelperBuilder, PinRequest, PinResponse, Pkcs11Helper, ProviderSettings, SlotEvent, SlotEventMethod,
    SystemServices, TokenId,
};

pub const USER_PIN: &str = "1234";
pub const SOFT_PATH: &str = "/soft/libsoft-pkcs11.so";

pub fn init_logging() {
    let _ = stderrlog::new().verbosity(2).init();
}

//------------ Tokens --------------------------------------------------------

/// A token holding one identity with `CKA_ID` 01 and the given label.
pub fn token_with_identity(label: &str, serial: &str, common_name: &str) -> SoftToken {
    let (cert, key) = self_signed_identity(common_name, 1024).unwrap();
    SoftToken::new(label, serial, USER_PIN).with_identity(&[0x01], common_name, cert, key)
}

/// The id the helper gives a token made by [`token_with_identity`].
pub fn token_id(label: &str, serial: &str) -> TokenId {
    TokenId::new("NLnet Labs", "SoftToken", serial, label)
}

//------------ TestBed -------------------------------------------------------

/// An initialized helper with one soft module registered as a provider.
pub struct TestBed {
    pub helper: Pkcs11Helper,
    pub module: Arc<SoftModule>,
    pub slot: SlotId,
    pub loader: Arc<SoftModuleLoader>,
}

impl TestBed {
    pub fn new(method: SlotEventMethod) -> Self {
        Self::with_builder(Pkcs11Helper::builder(), SoftModule::new("soft"), method)
    }

    pub fn with_builder(builder: HelperBuilder, module: SoftModule, method: SlotEventMethod) -> Self {
        init_logging();

        let module = Arc::new(module);
        let slot = module.add_slot("Soft Reader 0");
        let loader = Arc::new(SoftModuleLoader::new());
        loader.register(SOFT_PATH, module.clone());

        let helper = builder
            .with_loader(loader.clone())
            .poll_interval(Duration::from_millis(50))
            .trigger_wait_granularity(Duration::from_millis(20))
            .build();
        helper.initialize().unwrap();

        let settings = ProviderSettings {
            slot_event: method,
            ..Default::default()
        };
        helper.add_provider(SOFT_PATH, settings).unwrap();

        TestBed {
            helper,
            module,
            slot,
            loader,
        }
    }

    pub fn insert(&self, token: SoftToken) {
        self.module.insert_token(self.slot, token);
    }

    pub fn remove(&self) {
        self.module.remove_token(self.slot);
    }

    /// Answers every PIN prompt with `pin` and counts the prompts.
    pub fn answer_pin(&self, pin: &str) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let prompts = count.clone();
        let pin = pin.to_string();
        self.helper.set_pin_prompt_hook(move |_: &PinRequest| {
            prompts.fetch_add(1, Ordering::SeqCst);
            PinResponse::Pin(SecretString::new(pin.clone()))
        });
        count
    }

    /// Collects the slot events in the order the hook sees them.
    pub fn record_events(&self) -> Arc<Mutex<Vec<SlotEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        self.helper.set_slot_event_hook(move |event: &SlotEvent| {
            sink.lock().unwrap().push(event.clone());
        });
        events
    }
}

/// Waits until `condition` holds, panicking after a few seconds.
pub fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let until = Instant::now() + Duration::from_secs(5);
    while !condition() {
        if Instant::now() > until {
            panic!("timed out waiting for {}", what);
        }
        thread::sleep(Duration::from_millis(10));
    }
}

//------------ FakeClock -----------------------------------------------------

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct FakeClock {
    now: Mutex<DateTime<Utc>>,
}

impl FakeClock {
    pub fn new() -> Self {
        FakeClock {
            now: Mutex::new(Utc::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += TimeDelta::from_std(by).unwrap();
    }
}

impl SystemServices for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    fn gettimeofday(&self) -> Duration {
        let now = self.now();
        Duration::from_millis(now.timestamp_millis() as u64)
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration)
    }
}
