mod common;

use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Barrier,
    },
    thread,
};

use openssl::{hash::MessageDigest, x509::X509};

use pkcs11_helper::{
    CertificateCriteria, Error, ProviderSettings, ResultCode, SlotEventMethod, TokenPromptRequest,
    TokenPromptResponse,
};

use common::{token_id, token_with_identity, TestBed, SOFT_PATH, USER_PIN};

/// Alice on "Work" in slot 0, Bob on "Home" in slot 1.
fn two_tokens() -> TestBed {
    let bed = TestBed::new(SlotEventMethod::Fetch);
    let second = bed.module.add_slot("Soft Reader 1");
    bed.insert(token_with_identity("Work", "0001", "Alice"));
    bed.module.insert_token(second, token_with_identity("Home", "0002", "Bob"));
    bed
}

#[test]
fn certificates_are_listed_in_slot_order() {
    let bed = two_tokens();

    let all = bed.helper.certificates(&CertificateCriteria::new()).unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].label, "Alice");
    assert_eq!(all[0].subject, "O=NLnet Labs, CN=Alice");
    assert_eq!(all[0].id.token(), &token_id("Work", "0001"));
    assert_eq!(all[1].label, "Bob");
    assert_eq!(all[1].issuer, "O=NLnet Labs, CN=Bob");

    // Listing holds on to no sessions.
    assert_eq!(bed.helper.session_references(&token_id("Work", "0001")).unwrap(), 0);
}

#[test]
fn tokens_name_their_reader() {
    let bed = two_tokens();
    let readers: Vec<_> = bed.helper.tokens().unwrap().into_iter().map(|token| token.reader).collect();
    assert_eq!(readers, vec!["Soft Reader 0", "Soft Reader 1"]);
}

#[test]
fn criteria_narrow_the_search() {
    let bed = two_tokens();
    let count = |criteria: CertificateCriteria| bed.helper.certificates(&criteria).unwrap().len();

    assert_eq!(count(CertificateCriteria::new().id(&[0x01])), 2);
    assert_eq!(count(CertificateCriteria::new().subject("Bob")), 1);
    assert_eq!(count(CertificateCriteria::new().issuer("CN=Alice")), 1);
    assert_eq!(count(CertificateCriteria::new().label("Alice")), 1);
    assert_eq!(count(CertificateCriteria::new().label("alice")), 0);
    assert_eq!(count(CertificateCriteria::new().token(token_id("Home", "0002"))), 1);
    assert_eq!(count(CertificateCriteria::new().id(&[0x02])), 0);
}

#[test]
fn fingerprint_selects_one_certificate() {
    let bed = two_tokens();
    let bob = bed
        .helper
        .find_certificate(&CertificateCriteria::new().subject("Bob"))
        .unwrap();
    let fingerprint = X509::from_der(bob.certificate_der())
        .unwrap()
        .digest(MessageDigest::sha256())
        .unwrap();

    let found = bed
        .helper
        .certificates(&CertificateCriteria::new().fingerprint(&fingerprint))
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].label, "Bob");
}

#[test]
fn unique_criteria_reject_ambiguity() {
    let bed = two_tokens();

    let err = bed
        .helper
        .find_certificate(&CertificateCriteria::new().id(&[0x01]).unique())
        .unwrap_err();
    assert_eq!(err.code(), ResultCode::ArgumentsBad);

    let err = bed
        .helper
        .find_certificate(&CertificateCriteria::new().subject("Carol"))
        .unwrap_err();
    assert_eq!(err.code(), ResultCode::CertificateNotFound);

    // Without unique the first one is taken.
    let first = bed
        .helper
        .find_certificate(&CertificateCriteria::new().id(&[0x01]))
        .unwrap();
    assert_eq!(first.label(), "Alice");
}

#[test]
fn serialized_id_finds_the_same_certificate() {
    let bed = two_tokens();
    let summary = bed
        .helper
        .certificates(&CertificateCriteria::new().subject("Bob"))
        .unwrap()
        .remove(0);

    let text = summary.id.to_string();
    let id = text.parse().unwrap();
    let handle = bed
        .helper
        .find_certificate(&CertificateCriteria::from_certificate_id(&id))
        .unwrap();
    assert_eq!(handle.id(), &summary.id);
    assert_eq!(handle.label(), "Bob");
}

#[test]
fn every_handle_holds_one_session_reference() {
    let bed = two_tokens();
    let work = token_id("Work", "0001");
    let criteria = CertificateCriteria::new().subject("Alice");

    let first = bed.helper.find_certificate(&criteria).unwrap();
    assert_eq!(bed.helper.session_references(&work).unwrap(), 1);

    let second = bed.helper.find_certificate(&criteria).unwrap();
    let third = second.clone();
    assert_eq!(bed.helper.session_references(&work).unwrap(), 3);
    assert_eq!(first.session_generation().unwrap(), third.session_generation().unwrap());

    drop(second);
    drop(third);
    assert_eq!(bed.helper.session_references(&work).unwrap(), 1);
    drop(first);
    assert_eq!(bed.helper.session_references(&work).unwrap(), 0);

    // A search matching several certificates keeps only the one returned.
    let _any = bed.helper.find_certificate(&CertificateCriteria::new()).unwrap();
    assert_eq!(bed.helper.session_references(&work).unwrap(), 1);
    assert_eq!(bed.helper.session_references(&token_id("Home", "0002")).unwrap(), 0);
}

#[test]
fn concurrent_searches_share_one_session() {
    let bed = two_tokens();
    let work = token_id("Work", "0001");
    let criteria = CertificateCriteria::new().subject("Alice");
    let barrier = Barrier::new(2);

    let handles = thread::scope(|scope| {
        let searches: Vec<_> = (0..2)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    bed.helper.find_certificate(&criteria).unwrap()
                })
            })
            .collect();
        searches.into_iter().map(|search| search.join().unwrap()).collect::<Vec<_>>()
    });

    assert_eq!(bed.helper.session_references(&work).unwrap(), 2);
    assert_eq!(
        handles[0].session_generation().unwrap(),
        handles[1].session_generation().unwrap()
    );

    drop(handles);
    assert_eq!(bed.helper.session_references(&work).unwrap(), 0);
}

#[test]
fn private_certificates_need_login() {
    let bed = TestBed::new(SlotEventMethod::Fetch);
    bed.helper.remove_provider(SOFT_PATH).unwrap();
    let settings = ProviderSettings {
        slot_event: SlotEventMethod::Fetch,
        cert_is_private: true,
        ..Default::default()
    };
    bed.helper.add_provider(SOFT_PATH, settings).unwrap();
    bed.insert(token_with_identity("Work", "0001", "Alice").with_private_certificates());

    assert!(matches!(
        bed.helper.certificates(&CertificateCriteria::new().token(token_id("Work", "0001"))),
        Err(Error::Cancelled)
    ));

    let prompts = bed.answer_pin(USER_PIN);
    let found = bed.helper.certificates(&CertificateCriteria::new()).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(prompts.load(Ordering::SeqCst), 1);
}

#[test]
fn missing_token_is_asked_for() {
    let bed = TestBed::new(SlotEventMethod::Fetch);
    let criteria = CertificateCriteria::new().token(token_id("Work", "0001"));

    let err = bed.helper.find_certificate(&criteria).unwrap_err();
    assert_eq!(err.code(), ResultCode::TokenNotPresent);

    let asked = Arc::new(AtomicU32::new(0));
    let counter = asked.clone();
    let module = bed.module.clone();
    let slot = bed.slot;
    bed.helper.set_token_prompt_hook(move |request: &TokenPromptRequest| {
        assert_eq!(request.token.label(), "Work");
        counter.fetch_add(1, Ordering::SeqCst);
        module.insert_token(slot, token_with_identity("Work", "0001", "Alice"));
        TokenPromptResponse::Retry
    });

    let handle = bed.helper.find_certificate(&criteria).unwrap();
    assert_eq!(handle.label(), "Alice");
    assert_eq!(asked.load(Ordering::SeqCst), 1);
}

#[test]
fn token_prompt_may_cancel_or_give_up() {
    let bed = TestBed::new(SlotEventMethod::Fetch);
    let criteria = CertificateCriteria::new().token(token_id("Work", "0001"));

    bed.helper
        .set_token_prompt_hook(|_: &TokenPromptRequest| TokenPromptResponse::Cancel);
    assert!(matches!(bed.helper.find_certificate(&criteria), Err(Error::Cancelled)));

    let asked = Arc::new(AtomicU32::new(0));
    let counter = asked.clone();
    bed.helper.set_token_prompt_hook(move |_: &TokenPromptRequest| {
        counter.fetch_add(1, Ordering::SeqCst);
        TokenPromptResponse::Retry
    });
    let err = bed.helper.find_certificate(&criteria).unwrap_err();
    assert_eq!(err.code(), ResultCode::TokenNotPresent);
    assert_eq!(asked.load(Ordering::SeqCst), 3);

    bed.helper.clear_token_prompt_hook();
}
