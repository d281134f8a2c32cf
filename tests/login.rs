mod common;

use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use secrecy::SecretString;

use pkcs11_helper::module::soft::SoftModule;
use pkcs11_helper::{
    CertificateCriteria, CertificateHandle, Error, LoginState, Mechanism, PinCachePolicy, PinRequest, PinResponse,
    Pkcs11Helper, ResultCode, SlotEventMethod,
};

use common::{token_with_identity, FakeClock, TestBed, USER_PIN};

fn alice(bed: &TestBed) -> CertificateHandle {
    bed.helper
        .find_certificate(&CertificateCriteria::new().subject("Alice"))
        .unwrap()
}

fn sign(bed: &TestBed, cert: &CertificateHandle) -> Result<Vec<u8>, Error> {
    bed.helper.sign(cert, Mechanism::Sha256RsaPkcs, b"to be signed")
}

#[test]
fn pin_is_asked_once_and_cached() {
    let bed = TestBed::new(SlotEventMethod::Fetch);
    bed.insert(token_with_identity("Work", "0001", "Alice"));
    let prompts = bed.answer_pin(USER_PIN);

    let cert = alice(&bed);
    assert_eq!(cert.login_state().unwrap(), LoginState::LoggedOut);
    sign(&bed, &cert).unwrap();
    sign(&bed, &cert).unwrap();
    assert_eq!(prompts.load(Ordering::SeqCst), 1);
    assert_eq!(cert.login_state().unwrap(), LoginState::LoggedIn);

    // The token forgets the login, the cached PIN logs in again.
    bed.module.logout_token(bed.slot);
    sign(&bed, &cert).unwrap();
    assert_eq!(prompts.load(Ordering::SeqCst), 1);
    assert_eq!(bed.module.calls("C_Login"), 2);
}

#[test]
fn wrong_pin_gives_pin_incorrect() {
    let bed = TestBed::new(SlotEventMethod::Fetch);
    bed.insert(token_with_identity("Work", "0001", "Alice").with_max_pin_retries(10));
    let prompts = bed.answer_pin("0000");

    let cert = alice(&bed);
    match sign(&bed, &cert) {
        Err(err @ Error::PinIncorrect { .. }) => {
            assert_eq!(err.code(), ResultCode::PinIncorrect);
            if let Error::PinIncorrect { retries_left, .. } = err {
                assert_eq!(retries_left, Some(7));
            }
        }
        other => panic!("expected PinIncorrect, got {:?}", other),
    }
    assert_eq!(prompts.load(Ordering::SeqCst), 3);

    // No more prompts until the application logs out.
    assert!(matches!(sign(&bed, &cert), Err(Error::PinIncorrect { .. })));
    assert_eq!(prompts.load(Ordering::SeqCst), 3);

    bed.helper.logout().unwrap();
    let prompts = bed.answer_pin(USER_PIN);
    sign(&bed, &cert).unwrap();
    assert_eq!(prompts.load(Ordering::SeqCst), 1);
}

#[test]
fn rejected_cached_pin_falls_back_to_prompts() {
    let bed = TestBed::new(SlotEventMethod::Fetch);
    bed.insert(token_with_identity("Work", "0001", "Alice").with_max_pin_retries(10));
    let prompts = bed.answer_pin(USER_PIN);

    let cert = alice(&bed);
    sign(&bed, &cert).unwrap();
    assert_eq!(prompts.load(Ordering::SeqCst), 1);

    // The PIN changes behind the helper's back and the token logs out.
    bed.module.set_user_pin(bed.slot, "4321");
    bed.module.logout_token(bed.slot);
    assert!(matches!(sign(&bed, &cert), Err(Error::PinIncorrect { .. })));
    assert_eq!(prompts.load(Ordering::SeqCst), 4);
    assert_eq!(bed.module.calls("C_Login"), 5);

    bed.helper.logout().unwrap();
    let prompts = bed.answer_pin("4321");
    sign(&bed, &cert).unwrap();
    assert_eq!(prompts.load(Ordering::SeqCst), 1);
}

#[test]
fn prompt_is_retried_until_pin_is_right() {
    let bed = TestBed::new(SlotEventMethod::Fetch);
    bed.insert(token_with_identity("Work", "0001", "Alice"));

    let attempts = Arc::new(Mutex::new(Vec::new()));
    let seen = attempts.clone();
    bed.helper.set_pin_prompt_hook(move |request: &PinRequest| {
        seen.lock().unwrap().push((request.attempt, request.max_attempts));
        if request.attempt == 1 {
            PinResponse::Pin(SecretString::new("0000".to_string()))
        } else {
            PinResponse::Pin(SecretString::new(USER_PIN.to_string()))
        }
    });

    let cert = alice(&bed);
    sign(&bed, &cert).unwrap();
    assert_eq!(*attempts.lock().unwrap(), vec![(1, 3), (2, 3)]);
}

#[test]
fn max_login_retries_is_honored() {
    let bed = TestBed::with_builder(
        Pkcs11Helper::builder().max_login_retries(5),
        SoftModule::new("soft"),
        SlotEventMethod::Fetch,
    );
    bed.insert(token_with_identity("Work", "0001", "Alice").with_max_pin_retries(10));
    let prompts = bed.answer_pin("0000");

    let cert = alice(&bed);
    assert!(matches!(sign(&bed, &cert), Err(Error::PinIncorrect { .. })));
    assert_eq!(prompts.load(Ordering::SeqCst), 5);
}

#[test]
fn locked_pin_is_reported() {
    let bed = TestBed::new(SlotEventMethod::Fetch);
    bed.insert(token_with_identity("Work", "0001", "Alice").with_max_pin_retries(2));
    bed.answer_pin("0000");

    let cert = alice(&bed);
    let err = sign(&bed, &cert).unwrap_err();
    assert_eq!(err.code(), ResultCode::PinLocked);
}

#[test]
fn cancel_and_missing_prompt_give_cancelled() {
    let bed = TestBed::new(SlotEventMethod::Fetch);
    bed.insert(token_with_identity("Work", "0001", "Alice"));
    let cert = alice(&bed);

    assert!(matches!(sign(&bed, &cert), Err(Error::Cancelled)));

    bed.helper.set_pin_prompt_hook(|_: &PinRequest| PinResponse::Cancel);
    assert!(matches!(sign(&bed, &cert), Err(Error::Cancelled)));
    assert_eq!(bed.module.calls("C_Login"), 0);
}

#[test]
fn protected_auth_needs_no_pin() {
    let bed = TestBed::new(SlotEventMethod::Fetch);
    bed.insert(token_with_identity("Work", "0001", "Alice").with_protected_auth());
    let prompts = bed.answer_pin(USER_PIN);

    let cert = alice(&bed);
    sign(&bed, &cert).unwrap();
    assert_eq!(prompts.load(Ordering::SeqCst), 0);
}

#[test]
fn never_policy_asks_every_login() {
    let bed = TestBed::with_builder(
        Pkcs11Helper::builder().pin_cache(PinCachePolicy::Never, Duration::ZERO),
        SoftModule::new("soft"),
        SlotEventMethod::Fetch,
    );
    bed.insert(token_with_identity("Work", "0001", "Alice"));
    let prompts = bed.answer_pin(USER_PIN);

    let cert = alice(&bed);
    sign(&bed, &cert).unwrap();
    bed.module.logout_token(bed.slot);
    sign(&bed, &cert).unwrap();
    assert_eq!(prompts.load(Ordering::SeqCst), 2);
}

#[test]
fn timeout_policy_expires_cached_pin() {
    let clock = Arc::new(FakeClock::new());
    let bed = TestBed::with_builder(
        Pkcs11Helper::builder()
            .with_system(clock.clone())
            .pin_cache(PinCachePolicy::Timeout, Duration::from_secs(60)),
        SoftModule::new("soft"),
        SlotEventMethod::Fetch,
    );
    bed.insert(token_with_identity("Work", "0001", "Alice"));
    let prompts = bed.answer_pin(USER_PIN);

    let cert = alice(&bed);
    sign(&bed, &cert).unwrap();

    clock.advance(Duration::from_secs(30));
    bed.module.logout_token(bed.slot);
    sign(&bed, &cert).unwrap();
    assert_eq!(prompts.load(Ordering::SeqCst), 1);

    clock.advance(Duration::from_secs(31));
    bed.module.logout_token(bed.slot);
    sign(&bed, &cert).unwrap();
    assert_eq!(prompts.load(Ordering::SeqCst), 2);
}

#[test]
fn use_cached_without_cache_cancels() {
    let bed = TestBed::new(SlotEventMethod::Fetch);
    bed.insert(token_with_identity("Work", "0001", "Alice"));
    let asked = Arc::new(AtomicU32::new(0));
    let counter = asked.clone();
    bed.helper.set_pin_prompt_hook(move |_: &PinRequest| {
        counter.fetch_add(1, Ordering::SeqCst);
        PinResponse::UseCached
    });

    let cert = alice(&bed);
    assert!(matches!(sign(&bed, &cert), Err(Error::Cancelled)));
    assert_eq!(asked.load(Ordering::SeqCst), 1);
}

#[test]
fn login_is_shared_between_handles() {
    let bed = TestBed::new(SlotEventMethod::Fetch);
    bed.insert(token_with_identity("Work", "0001", "Alice"));
    let prompts = bed.answer_pin(USER_PIN);

    let first = alice(&bed);
    let second = alice(&bed);
    first.login().unwrap();
    sign(&bed, &second).unwrap();
    assert_eq!(prompts.load(Ordering::SeqCst), 1);
}
