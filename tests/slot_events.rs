mod common;

use std::sync::{Arc, Mutex};

use pkcs11_helper::module::soft::SoftModule;
use pkcs11_helper::{Pkcs11Helper, SlotEventKind, SlotEventMethod};

use common::{token_id, token_with_identity, wait_for, TestBed};

fn assert_insert_then_remove(bed: &TestBed, events: &[pkcs11_helper::SlotEvent]) {
    assert_eq!(events.len(), 2, "events: {:?}", events);
    assert_eq!(events[0].kind, SlotEventKind::Inserted);
    assert_eq!(events[1].kind, SlotEventKind::Removed);
    for event in events {
        assert_eq!(event.slot, bed.slot);
        assert_eq!(event.token, token_id("Work", "0001"));
        assert_eq!(event.provider, common::SOFT_PATH);
    }
}

#[test]
fn trigger_reports_insert_and_remove_once() {
    let bed = TestBed::new(SlotEventMethod::Trigger);
    let events = bed.record_events();

    bed.insert(token_with_identity("Work", "0001", "Alice"));
    wait_for("insert event", || events.lock().unwrap().len() == 1);

    bed.remove();
    wait_for("remove event", || events.lock().unwrap().len() == 2);

    assert_insert_then_remove(&bed, &events.lock().unwrap());
}

#[test]
fn poll_reports_insert_and_remove_once() {
    let bed = TestBed::new(SlotEventMethod::Poll);
    let events = bed.record_events();

    bed.insert(token_with_identity("Work", "0001", "Alice"));
    wait_for("insert event", || events.lock().unwrap().len() == 1);

    bed.remove();
    wait_for("remove event", || events.lock().unwrap().len() == 2);

    assert_insert_then_remove(&bed, &events.lock().unwrap());
}

#[test]
fn fetch_reports_on_use() {
    let bed = TestBed::new(SlotEventMethod::Fetch);
    let events = bed.record_events();

    bed.insert(token_with_identity("Work", "0001", "Alice"));
    assert!(events.lock().unwrap().is_empty());

    let tokens = bed.helper.tokens().unwrap();
    assert_eq!(tokens.len(), 1);
    assert_eq!(events.lock().unwrap().len(), 1);

    bed.remove();
    assert!(bed.helper.tokens().unwrap().is_empty());

    assert_insert_then_remove(&bed, &events.lock().unwrap());
}

#[test]
fn none_reports_on_refresh_only() {
    let bed = TestBed::new(SlotEventMethod::None);
    let events = bed.record_events();

    bed.insert(token_with_identity("Work", "0001", "Alice"));
    assert!(bed.helper.tokens().unwrap().is_empty());
    assert!(events.lock().unwrap().is_empty());

    bed.helper.refresh().unwrap();
    assert_eq!(bed.helper.tokens().unwrap().len(), 1);

    bed.remove();
    bed.helper.refresh().unwrap();
    assert!(bed.helper.tokens().unwrap().is_empty());

    assert_insert_then_remove(&bed, &events.lock().unwrap());
}

#[test]
fn auto_polls_without_wait_for_slot_event() {
    let bed = TestBed::with_builder(
        Pkcs11Helper::builder(),
        SoftModule::new("soft").with_slot_events(false),
        SlotEventMethod::Auto,
    );
    let events = bed.record_events();

    bed.insert(token_with_identity("Work", "0001", "Alice"));
    wait_for("insert event", || events.lock().unwrap().len() == 1);
    assert_eq!(bed.module.calls("C_WaitForSlotEvent"), 0);
}

#[test]
fn tokens_present_at_add_raise_no_event() {
    let bed = TestBed::new(SlotEventMethod::Fetch);
    bed.insert(token_with_identity("Work", "0001", "Alice"));
    bed.helper.remove_provider(common::SOFT_PATH).unwrap();

    let events = bed.record_events();
    bed.helper.add_provider(common::SOFT_PATH, Default::default()).unwrap();

    assert_eq!(bed.helper.tokens().unwrap().len(), 1);
    assert!(events.lock().unwrap().is_empty());
}

#[test]
fn hook_may_call_back_into_helper() {
    let bed = Arc::new(TestBed::new(SlotEventMethod::Fetch));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let sink = seen.clone();
    let inner = bed.clone();
    bed.helper.set_slot_event_hook(move |_| {
        let count = inner.helper.tokens().map(|tokens| tokens.len()).unwrap_or(usize::MAX);
        sink.lock().unwrap().push(count);
    });

    bed.insert(token_with_identity("Work", "0001", "Alice"));
    bed.helper.tokens().unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![1]);

    bed.helper.clear_slot_event_hook();
}
