mod common;

use std::{
    sync::{mpsc, Mutex},
    thread,
    time::{Duration, Instant},
};

use secrecy::SecretString;

use pkcs11_helper::module::soft::SoftModule;
use pkcs11_helper::{
    get_message, CertificateCriteria, Error, Mechanism, PinRequest, PinResponse, Pkcs11Helper, ProviderSettings,
    ResultCode, SlotEventMethod,
};

use common::{token_with_identity, TestBed, SOFT_PATH, USER_PIN};

#[test]
fn missing_library_fails_to_load() {
    common::init_logging();
    let helper = Pkcs11Helper::builder().build();
    helper.initialize().unwrap();

    let err = helper
        .add_provider("/fake/libfoo.so", ProviderSettings::default())
        .unwrap_err();
    assert_eq!(err.code(), ResultCode::ProviderLoadFailed);
    assert!(!get_message(err.code()).is_empty());
    assert!(helper.tokens().unwrap().is_empty());

    let err = helper.remove_provider("/fake/libfoo.so").unwrap_err();
    assert_eq!(err.code(), ResultCode::ProviderNotFound);
}

#[test]
fn busy_provider_is_kept() {
    let bed = TestBed::new(SlotEventMethod::Fetch);
    bed.helper.remove_provider(SOFT_PATH).unwrap();
    let settings = ProviderSettings {
        slot_event: SlotEventMethod::Fetch,
        allow_removal_while_sessions_open: false,
        ..Default::default()
    };
    bed.helper.add_provider(SOFT_PATH, settings).unwrap();
    bed.insert(token_with_identity("Work", "0001", "Alice"));

    let cert = bed.helper.find_certificate(&CertificateCriteria::new()).unwrap();
    match bed.helper.remove_provider(SOFT_PATH) {
        Err(Error::ProviderBusy { sessions, .. }) => assert_eq!(sessions, 1),
        other => panic!("expected ProviderBusy, got {:?}", other),
    }

    drop(cert);
    bed.helper.remove_provider(SOFT_PATH).unwrap();
    assert_eq!(bed.module.open_session_count(), 0);
}

#[test]
fn removal_leaves_handles_without_token() {
    let bed = TestBed::new(SlotEventMethod::Fetch);
    bed.insert(token_with_identity("Work", "0001", "Alice"));
    bed.answer_pin(USER_PIN);

    let cert = bed.helper.find_certificate(&CertificateCriteria::new()).unwrap();
    let other = bed.helper.find_certificate(&CertificateCriteria::new()).unwrap();
    bed.helper.sign(&cert, Mechanism::Sha256RsaPkcs, b"data").unwrap();
    let generation = cert.session_generation().unwrap();

    bed.helper.remove_provider(SOFT_PATH).unwrap();
    for handle in [&cert, &other] {
        let err = bed.helper.sign(handle, Mechanism::Sha256RsaPkcs, b"data").unwrap_err();
        assert_eq!(err.code(), ResultCode::TokenNotPresent);
    }

    // Adding the provider back brings the handle back to life.
    bed.helper
        .add_provider(SOFT_PATH, ProviderSettings {
            slot_event: SlotEventMethod::Fetch,
            ..Default::default()
        })
        .unwrap();
    bed.helper.sign(&cert, Mechanism::Sha256RsaPkcs, b"data").unwrap();
    assert!(cert.session_generation().unwrap() > generation);
    bed.helper.sign(&other, Mechanism::Sha256RsaPkcs, b"data").unwrap();
}

/// Runs `stop` while a signing thread sits in the PIN prompt.
fn stop_during_pin_prompt(stop: impl FnOnce(&TestBed)) {
    let bed = TestBed::new(SlotEventMethod::Fetch);
    bed.insert(token_with_identity("Work", "0001", "Alice"));

    let (asked_tx, asked_rx) = mpsc::channel();
    let (answer_tx, answer_rx) = mpsc::channel::<()>();
    let asked_tx = Mutex::new(asked_tx);
    let answer_rx = Mutex::new(answer_rx);
    bed.helper.set_pin_prompt_hook(move |_: &PinRequest| {
        let _ = asked_tx.lock().unwrap().send(());
        let _ = answer_rx.lock().unwrap().recv_timeout(Duration::from_secs(10));
        PinResponse::Pin(SecretString::new(USER_PIN.to_string()))
    });

    let cert = bed.helper.find_certificate(&CertificateCriteria::new()).unwrap();
    let err = thread::scope(|scope| {
        let signer = scope.spawn(|| cert.sign(Mechanism::Sha256RsaPkcs, b"data"));
        asked_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let started = Instant::now();
        stop(&bed);
        assert!(started.elapsed() < Duration::from_secs(2));

        answer_tx.send(()).unwrap();
        signer.join().unwrap().unwrap_err()
    });
    assert_eq!(err.code(), ResultCode::SessionInvalidated);
    assert_eq!(bed.module.calls("C_Sign"), 0);

    drop(cert);
    assert_eq!(bed.module.open_session_count(), 0);
}

#[test]
fn removal_does_not_wait_for_pin_prompt() {
    stop_during_pin_prompt(|bed| bed.helper.remove_provider(SOFT_PATH).unwrap());
}

#[test]
fn terminate_does_not_wait_for_pin_prompt() {
    stop_during_pin_prompt(|bed| bed.helper.terminate().unwrap());
}

#[test]
fn token_moved_to_another_slot_is_followed() {
    let bed = TestBed::new(SlotEventMethod::Fetch);
    let other = bed.module.add_slot("Soft Reader 1");
    bed.insert(token_with_identity("Work", "0001", "Alice"));
    let prompts = bed.answer_pin(USER_PIN);

    let cert = bed.helper.find_certificate(&CertificateCriteria::new()).unwrap();
    let before = bed.helper.sign(&cert, Mechanism::Sha256RsaPkcs, b"data").unwrap();
    let generation = cert.session_generation().unwrap();

    let token = bed.module.remove_token(bed.slot).unwrap();
    assert_eq!(
        bed.helper.sign(&cert, Mechanism::Sha256RsaPkcs, b"data").unwrap_err().code(),
        ResultCode::TokenNotPresent
    );

    bed.module.insert_token(other, token);
    let after = bed.helper.sign(&cert, Mechanism::Sha256RsaPkcs, b"data").unwrap();
    assert_eq!(before, after);
    assert!(cert.session_generation().unwrap() > generation);

    // A new session means a new login.
    assert_eq!(prompts.load(std::sync::atomic::Ordering::SeqCst), 2);
}

#[test]
fn duplicate_registrations() {
    let bed = TestBed::new(SlotEventMethod::Fetch);
    bed.insert(token_with_identity("Work", "0001", "Alice"));

    let strict = ProviderSettings {
        reject_duplicate: true,
        ..Default::default()
    };
    let err = bed.helper.add_provider(SOFT_PATH, strict).unwrap_err();
    assert_eq!(err.code(), ResultCode::ProviderAlreadyLoaded);

    let second = ProviderSettings {
        name: Some("again".to_string()),
        slot_event: SlotEventMethod::Fetch,
        ..Default::default()
    };
    bed.helper.add_provider(SOFT_PATH, second).unwrap();
    let tokens = bed.helper.tokens().unwrap();
    assert_eq!(tokens.len(), 2);
    assert_eq!(tokens[0].provider, SOFT_PATH);
    assert_eq!(tokens[1].provider, "again");

    bed.helper.remove_provider(SOFT_PATH).unwrap();
    assert!(bed.helper.tokens().unwrap().is_empty());
}

#[test]
fn serialized_module_is_shared_by_threads() {
    let bed = TestBed::with_builder(
        Pkcs11Helper::builder(),
        SoftModule::new("soft").with_thread_safety(false),
        SlotEventMethod::Auto,
    );
    bed.insert(token_with_identity("Work", "0001", "Alice"));
    bed.helper.refresh().unwrap();
    bed.answer_pin(USER_PIN);

    let cert = bed.helper.find_certificate(&CertificateCriteria::new()).unwrap();
    thread::scope(|scope| {
        for _ in 0..4 {
            let cert = cert.clone();
            let helper = &bed.helper;
            scope.spawn(move || {
                for _ in 0..10 {
                    let signature = helper.sign(&cert, Mechanism::Sha256RsaPkcs, b"data").unwrap();
                    assert!(cert.verify(Mechanism::Sha256RsaPkcs, b"data", &signature).unwrap());
                }
            });
        }
    });
    assert_eq!(bed.module.calls("C_Sign"), 40);
    assert_eq!(bed.module.calls("C_Login"), 1);
}
