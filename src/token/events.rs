//! Delivery of slot events to the slot event hook.

use std::{collections::VecDeque, mem, sync::Mutex};

use log::trace;

use crate::hooks::{Hooks, SlotEvent, SlotEventKind};

use super::provider::{Provider, Snapshot};

/// Works out the events that turn `old` into `new`.
///
/// A slot whose token was swapped for another between two scans yields a
/// removal followed by an insertion.
pub(crate) fn diff(provider: &Provider, old: &Snapshot, new: &Snapshot) -> Vec<SlotEvent> {
    let event = |kind, slot, token: &super::TokenId| SlotEvent {
        kind,
        provider: provider.name.clone(),
        slot,
        token: token.clone(),
    };

    let mut events = Vec::new();
    for (slot, known) in old {
        match new.get(slot) {
            Some(now) if now.id == known.id => {}
            _ => events.push(event(SlotEventKind::Removed, *slot, &known.id)),
        }
    }
    for (slot, known) in new {
        match old.get(slot) {
            Some(before) if before.id == known.id => {}
            _ => events.push(event(SlotEventKind::Inserted, *slot, &known.id)),
        }
    }
    events
}

//------------ EventQueue ----------------------------------------------------

#[derive(Default)]
struct QueueState {
    pending: VecDeque<SlotEvent>,
    delivering: bool,
}

/// Hands queued events to the hook one at a time, in order.
///
/// Whoever finds the queue idle becomes the deliverer and drains it,
/// including events queued by others in the meantime. A hook that causes
/// new events, directly or by calling back into the helper, sees them after
/// it returns rather than nested inside its own call.
#[derive(Default)]
pub(crate) struct EventQueue {
    state: Mutex<QueueState>,
}

impl EventQueue {
    pub fn push(&self, events: Vec<SlotEvent>) {
        if events.is_empty() {
            return;
        }
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.pending.extend(events);
    }

    pub fn deliver(&self, hooks: &Hooks) {
        {
            let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if state.delivering {
                return;
            }
            state.delivering = true;
        }
        let delivering = Delivering(self);

        loop {
            let event = {
                let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                match state.pending.pop_front() {
                    Some(event) => event,
                    None => {
                        // Cleared under the lock that saw the queue empty.
                        state.delivering = false;
                        break;
                    }
                }
            };
            trace!("Delivering slot event: {}", event);
            if let Some(hook) = hooks.slot_event() {
                hook(&event);
            }
        }
        mem::forget(delivering);
    }
}

/// Gives up the deliverer role when a hook panics.
struct Delivering<'a>(&'a EventQueue);

impl Drop for Delivering<'_> {
    fn drop(&mut self) {
        let mut state = self.0.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.delivering = false;
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;
    use crate::module::{retry::RetryPolicy, soft::SoftModule, TokenInfo};
    use crate::token::provider::{KnownToken, ProviderId, ProviderSettings};
    use crate::token::TokenId;

    fn provider() -> Provider {
        Provider::new(
            ProviderId::new(1),
            "/soft.so",
            ProviderSettings::default(),
            Arc::new(SoftModule::new("soft")),
            Duration::from_secs(1),
            RetryPolicy::never(),
        )
    }

    fn known(label: &str) -> KnownToken {
        KnownToken {
            id: TokenId::new("m", "model", "1", label),
            info: TokenInfo::default(),
            reader: String::new(),
        }
    }

    #[test]
    fn swapped_token_is_removal_then_insertion() {
        let provider = provider();
        let old: Snapshot = [(0, known("a")), (1, known("b"))].into_iter().collect();
        let new: Snapshot = [(0, known("a")), (1, known("c")), (2, known("d"))].into_iter().collect();

        let events = diff(&provider, &old, &new);
        let summary: Vec<_> = events.iter().map(|e| (e.kind, e.slot, e.token.label().to_string())).collect();
        assert_eq!(
            summary,
            vec![
                (SlotEventKind::Removed, 1, "b".to_string()),
                (SlotEventKind::Inserted, 1, "c".to_string()),
                (SlotEventKind::Inserted, 2, "d".to_string()),
            ]
        );
    }

    #[test]
    fn concurrent_pushes_are_all_delivered() {
        use std::sync::{
            atomic::{AtomicUsize, Ordering},
            Barrier,
        };
        use std::thread;

        let provider = Arc::new(provider());
        let queue = Arc::new(EventQueue::default());
        let hooks = Arc::new(Hooks::default());
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = delivered.clone();
        hooks.set_slot_event(Some(Arc::new(move |_: &SlotEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        let rounds = 2000;
        for round in 0..rounds {
            let barrier = Arc::new(Barrier::new(2));
            let workers: Vec<_> = ["x", "y"]
                .into_iter()
                .map(|label| {
                    let (q, h, p, b) = (queue.clone(), hooks.clone(), provider.clone(), barrier.clone());
                    thread::spawn(move || {
                        let new: Snapshot = [(0, known(label))].into_iter().collect();
                        let events = diff(&p, &Snapshot::new(), &new);
                        b.wait();
                        q.push(events);
                        q.deliver(&h);
                    })
                })
                .collect();
            for worker in workers {
                worker.join().unwrap();
            }
            assert_eq!(delivered.load(Ordering::SeqCst), 2 * (round + 1), "round {}", round);
        }
    }

    #[test]
    fn events_queued_by_the_hook_come_after_it() {
        let provider = Arc::new(provider());
        let queue = Arc::new(EventQueue::default());
        let hooks = Arc::new(Hooks::default());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let (q, h, p, s) = (queue.clone(), hooks.clone(), provider.clone(), seen.clone());
        hooks.set_slot_event(Some(Arc::new(move |event: &SlotEvent| {
            s.lock().unwrap().push(event.token.label().to_string());
            if event.token.label() == "a" {
                let old = Snapshot::new();
                let new: Snapshot = [(5, known("nested"))].into_iter().collect();
                q.push(diff(&p, &old, &new));
                q.deliver(&h);
                s.lock().unwrap().push("after nested deliver".to_string());
            }
        })));

        let new: Snapshot = [(0, known("a")), (1, known("b"))].into_iter().collect();
        queue.push(diff(&provider, &Snapshot::new(), &new));
        queue.deliver(&hooks);

        assert_eq!(*seen.lock().unwrap(), vec!["a", "after nested deliver", "b", "nested"]);
    }
}
