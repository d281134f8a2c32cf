//! Background detection of slot events.
//!
//! Every provider in trigger mode gets a thread that waits for slot events
//! of its module. All providers in poll mode share one thread that rescans
//! each of them at its interval. Waits are bounded so that a stop request
//! is noticed within the trigger wait granularity.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, Weak,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, error, warn};

use crate::error::Error;
use crate::module::Rv;

use super::manager::TokenManager;
use super::provider::{Provider, ProviderId, SlotEventMethod};

#[derive(Default)]
struct Wakeup {
    woken: Mutex<bool>,
    cond: Condvar,
}

impl Wakeup {
    fn notify(&self) {
        let mut woken = self.woken.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *woken = true;
        self.cond.notify_all();
    }

    fn wait(&self, timeout: Duration) {
        let mut woken = self.woken.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !*woken {
            woken = match self.cond.wait_timeout(woken, timeout) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        *woken = false;
    }
}

pub(crate) struct Watcher {
    granularity: Duration,
    stop: Arc<AtomicBool>,
    wakeup: Arc<Wakeup>,
    triggers: Mutex<Vec<(ProviderId, JoinHandle<()>)>>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl Watcher {
    pub fn new(granularity: Duration) -> Self {
        Watcher {
            granularity,
            stop: Arc::new(AtomicBool::new(false)),
            wakeup: Arc::new(Wakeup::default()),
            triggers: Mutex::new(Vec::new()),
            poller: Mutex::new(None),
        }
    }

    /// Starts watching a newly added provider.
    pub fn watch(&self, manager: Weak<TokenManager>, provider: Arc<Provider>) -> Result<(), Error> {
        match provider.method {
            SlotEventMethod::Trigger => {
                let id = provider.id;
                let handle = self.spawn_trigger(manager, provider)?;
                self.triggers.lock()?.push((id, handle));
            }
            SlotEventMethod::Poll => {
                let mut poller = self.poller.lock()?;
                if poller.is_none() {
                    *poller = Some(self.spawn_poller(manager)?);
                } else {
                    self.wakeup.notify();
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Waits for the trigger thread of a removed provider to finish.
    pub fn unwatch(&self, id: ProviderId) -> Result<(), Error> {
        let handles: Vec<JoinHandle<()>> = {
            let mut triggers = self.triggers.lock()?;
            let (stopped, running) = triggers.drain(..).partition(|(provider, _)| *provider == id);
            *triggers = running;
            stopped.into_iter().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            Self::join(handle);
        }
        Ok(())
    }

    /// Stops all threads and waits for them.
    pub fn shutdown(&self) -> Result<(), Error> {
        self.stop.store(true, Ordering::SeqCst);
        self.wakeup.notify();

        let triggers: Vec<_> = self.triggers.lock()?.drain(..).collect();
        for (_, handle) in triggers {
            Self::join(handle);
        }
        if let Some(handle) = self.poller.lock()?.take() {
            Self::join(handle);
        }
        Ok(())
    }

    /// A hook running on a watcher thread may remove the provider or
    /// terminate the helper, that thread cannot wait for itself.
    fn join(handle: JoinHandle<()>) {
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            error!("Slot event thread panicked");
        }
    }

    fn spawn_trigger(&self, manager: Weak<TokenManager>, provider: Arc<Provider>) -> Result<JoinHandle<()>, Error> {
        let stop = self.stop.clone();
        let granularity = self.granularity;
        thread::Builder::new()
            .name(format!("p11-trigger-{}", provider.id))
            .spawn(move || {
                debug!("Waiting for slot events of provider '{}'", provider.name);
                trigger_loop(&manager, &provider, &stop, granularity);
                debug!("Stopped waiting for slot events of provider '{}'", provider.name);
            })
            .map_err(|err| Error::Fatal(format!("cannot start slot event thread: {}", err)))
    }

    fn spawn_poller(&self, manager: Weak<TokenManager>) -> Result<JoinHandle<()>, Error> {
        let stop = self.stop.clone();
        let wakeup = self.wakeup.clone();
        let granularity = self.granularity;
        thread::Builder::new()
            .name("p11-poll".to_string())
            .spawn(move || poll_loop(&manager, &stop, &wakeup, granularity))
            .map_err(|err| Error::Fatal(format!("cannot start slot poll thread: {}", err)))
    }
}

fn trigger_loop(manager: &Weak<TokenManager>, provider: &Arc<Provider>, stop: &AtomicBool, granularity: Duration) {
    let running = || !stop.load(Ordering::SeqCst) && !provider.is_removed();

    while running() {
        match provider.call("C_WaitForSlotEvent", |m| m.wait_for_slot_event(granularity)) {
            Ok(None) => {}
            Ok(Some(slot)) => {
                debug!("Slot event in slot {} of provider '{}'", slot, provider.name);
                let Some(manager) = manager.upgrade() else { break };
                if let Err(err) = manager.refresh_provider(provider) {
                    warn!("Cannot rescan provider '{}': {}", provider.name, err);
                }
            }
            Err(err) if err.rv == Rv::FunctionNotSupported => {
                warn!(
                    "Provider '{}' cannot wait for slot events, polling instead",
                    provider.name
                );
                fallback_poll(manager, provider, &running, granularity);
                return;
            }
            Err(err) => {
                warn!("Waiting for slot events of provider '{}': {}", provider.name, err);
                thread::sleep(granularity);
            }
        }
    }
}

/// Polls a single provider from its trigger thread.
fn fallback_poll(
    manager: &Weak<TokenManager>,
    provider: &Arc<Provider>,
    running: &dyn Fn() -> bool,
    granularity: Duration,
) {
    let step = granularity.min(provider.poll_interval).max(Duration::from_millis(1));
    let mut waited = Duration::ZERO;
    while running() {
        thread::sleep(step);
        waited += step;
        if waited < provider.poll_interval {
            continue;
        }
        waited = Duration::ZERO;
        let Some(manager) = manager.upgrade() else { break };
        if let Err(err) = manager.refresh_provider(provider) {
            warn!("Cannot rescan provider '{}': {}", provider.name, err);
        }
    }
}

fn poll_loop(manager: &Weak<TokenManager>, stop: &AtomicBool, wakeup: &Wakeup, granularity: Duration) {
    let mut next_due: HashMap<ProviderId, Duration> = HashMap::new();

    while !stop.load(Ordering::SeqCst) {
        let Some(strong) = manager.upgrade() else { break };
        let system = strong.system();
        let providers: Vec<Arc<Provider>> = strong
            .providers()
            .into_iter()
            .filter(|p| p.method == SlotEventMethod::Poll && !p.is_removed())
            .collect();
        next_due.retain(|id, _| providers.iter().any(|p| p.id == *id));

        let mut wait = granularity.max(Duration::from_secs(1));
        for provider in providers {
            let now = system.gettimeofday();
            // The provider was scanned when it was added.
            let due = next_due.entry(provider.id).or_insert(now + provider.poll_interval);
            if now >= *due {
                if let Err(err) = strong.refresh_provider(&provider) {
                    warn!("Cannot rescan provider '{}': {}", provider.name, err);
                }
                *due = system.gettimeofday() + provider.poll_interval;
            }
            wait = wait.min(due.saturating_sub(now));
        }
        drop(strong);

        wakeup.wait(wait.max(Duration::from_millis(1)));
    }
    debug!("Stopped polling for slot events");
}
