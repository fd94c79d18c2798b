//! End-to-end protocol scenarios, driven over the wire through a session.

use std::sync::{Arc, Mutex};

use ed25519_dalek::SigningKey;
use testresult::TestResult;

use libssha::agent::{Connection, Session};
use libssha::key::factory;
use libssha::key::lock::Argon2LockProvider;
use libssha::key::manager::{
    KeyEntry, KeyManager, KeyManagerObserver, PubKeyItem, SharedKeyManager,
};
use libssha::proto::extension::{
    DestinationConstraint, HopDescriptor, HopKey, RestrictDestination, SessionBind,
};
use libssha::proto::message::{
    AddIdentity, AddIdentityConstrained, ExtensionMessage, KeyConstraint, RemoveIdentity, Request,
    Response, SignRequest,
};
use libssha::proto::{Deserializer, Serializer};
use libssha::SecureBytes;

/// Test transport half: collects framed replies, scripts confirmations.
#[derive(Clone)]
struct Harness {
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    confirm: bool,
}

impl Default for Harness {
    fn default() -> Self {
        Self {
            sent: Arc::new(Mutex::new(vec![])),
            confirm: true,
        }
    }
}

#[libssha::async_trait]
impl Connection for Harness {
    async fn confirm_request(&mut self, _key: &PubKeyItem) -> bool {
        self.confirm
    }

    async fn send(&mut self, data: &[u8]) -> bool {
        self.sent.lock().unwrap().push(data.to_vec());
        true
    }

    fn client(&self) -> String {
        "test-client".into()
    }
}

impl Harness {
    fn replies(&self) -> Vec<Response> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|frame| {
                Response::decode(&mut Deserializer::new(&frame[4..])).expect("well-formed reply")
            })
            .collect()
    }

    /// The single reply produced since the last call.
    fn last_reply(&self) -> Response {
        self.replies().last().expect("a reply was sent").clone()
    }
}

fn new_session() -> (Session<Harness>, Harness, SharedKeyManager) {
    let manager = KeyManager::new(Box::<Argon2LockProvider>::default());
    let harness = Harness::default();
    (
        Session::new(Arc::clone(&manager), harness.clone()),
        harness,
        manager,
    )
}

/// An ed25519 keypair with its agent wire encodings.
struct TestKey {
    public_blob: Vec<u8>,
    private_section: SecureBytes,
}

fn test_key(seed_byte: u8) -> TestKey {
    let seed = [seed_byte; 32];
    let signing = SigningKey::from_bytes(&seed);
    let public = signing.verifying_key().to_bytes();

    let mut blob = Serializer::new();
    blob.write_string("ssh-ed25519").unwrap();
    blob.write_blob(&public).unwrap();
    let public_blob = blob.into_vec();

    let mut keypair = Vec::with_capacity(64);
    keypair.extend_from_slice(&seed);
    keypair.extend_from_slice(&public);
    let mut section = Serializer::new();
    section.write_blob(&public).unwrap();
    section.write_blob(&keypair).unwrap();

    TestKey {
        public_blob,
        private_section: section.into_secure(),
    }
}

fn add_request(key: &TestKey, comment: &str) -> Request {
    Request::AddIdentity(AddIdentity {
        key_type: "ssh-ed25519".into(),
        key_blob: key.private_section.clone(),
        comment: comment.into(),
    })
}

fn add_constrained_request(
    key: &TestKey,
    comment: &str,
    constraints: Vec<KeyConstraint>,
) -> Request {
    Request::AddIdConstrained(AddIdentityConstrained {
        identity: AddIdentity {
            key_type: "ssh-ed25519".into(),
            key_blob: key.private_section.clone(),
            comment: comment.into(),
        },
        constraints,
    })
}

/// A `restrict-destination` constraint permitting `hostname` via `host_keys`.
fn restrict_to(hostname: &str, host_keys: &[&[u8]]) -> KeyConstraint {
    let to = HopDescriptor {
        user: String::new(),
        hostname: hostname.into(),
        keys: host_keys
            .iter()
            .map(|k| HopKey {
                key: k.to_vec(),
                is_ca: false,
            })
            .collect(),
    };
    let constraint =
        DestinationConstraint::new(HopDescriptor::default(), to).expect("valid constraint");
    let payload = RestrictDestination {
        constraints: vec![constraint],
    };
    KeyConstraint::Extension {
        name: "restrict-destination-v00@openssh.com".into(),
        payload: Arc::new(payload),
    }
}

/// A signed session-bind extension frame for `host`.
fn session_bind_request(host: &TestKey, session_id: &[u8], forwarded: bool) -> Request {
    let host_key =
        factory::create_key("ssh-ed25519", &host.private_section).expect("host key parses");
    let signature = host_key.sign(session_id, 0).expect("host key signs");
    let bind = SessionBind {
        host_key: host.public_blob.clone(),
        session_id: session_id.to_vec(),
        signature,
        is_forwarding: forwarded,
    };
    Request::Extension(ExtensionMessage::from_payload(&bind).expect("encodable payload"))
}

fn sign_request(key: &TestKey, data: &[u8]) -> Request {
    Request::SignRequest(SignRequest {
        key_blob: key.public_blob.clone(),
        data: data.to_vec(),
        flags: 0,
    })
}

/// The to-be-signed payload of a hostbound publickey userauth request.
fn userauth_payload(session_id: &[u8], username: &str, host_key_blob: &[u8]) -> Vec<u8> {
    let mut s = Serializer::new();
    s.write_blob(session_id).unwrap();
    s.write_byte(50).unwrap(); // SSH_MSG_USERAUTH_REQUEST
    s.write_string(username).unwrap();
    s.write_string("ssh-connection").unwrap();
    s.write_string("publickey-hostbound-v00@openssh.com").unwrap();
    s.write_byte(1).unwrap();
    s.write_string("ssh-ed25519").unwrap();
    s.write_blob(b"client-public-key").unwrap();
    s.write_blob(host_key_blob).unwrap();
    s.into_vec()
}

async fn drive(session: &mut Session<Harness>, request: &Request) {
    let frame = request.to_frame().expect("encodable request");
    session.process(&frame).await.expect("session stays alive");
}

#[tokio::test]
async fn list_then_sign_ed25519() -> TestResult {
    let (mut session, harness, _manager) = new_session();
    let key = test_key(0x42);

    drive(&mut session, &add_request(&key, "k1")).await;
    assert_eq!(harness.last_reply(), Response::Success);

    drive(&mut session, &Request::RequestIdentities).await;
    let Response::IdentitiesAnswer(identities) = harness.last_reply() else {
        panic!("expected identities answer");
    };
    assert_eq!(identities.len(), 1);
    assert_eq!(identities[0].comment, "k1");
    assert_eq!(identities[0].pubkey_blob, key.public_blob);
    // Blob layout: string "ssh-ed25519" ‖ blob(32-byte public key).
    let mut d = Deserializer::new(&identities[0].pubkey_blob);
    assert_eq!(d.read_string()?, "ssh-ed25519");
    assert_eq!(d.read_blob()?.len(), 32);

    drive(&mut session, &sign_request(&key, b"hello")).await;
    let Response::SignResponse(signature) = harness.last_reply() else {
        panic!("expected a signature");
    };
    let pubkey = factory::create_public_key(&key.public_blob)?;
    pubkey.verify(b"hello", &signature)?;
    Ok(())
}

#[tokio::test]
async fn constrained_key_refuses_signing_without_bindings() -> TestResult {
    let (mut session, harness, _manager) = new_session();
    let key = test_key(0x01);
    let host = test_key(0x02);

    let constraint = restrict_to("example.com", &[&host.public_blob]);
    drive(
        &mut session,
        &add_constrained_request(&key, "restricted", vec![constraint]),
    )
    .await;
    assert_eq!(harness.last_reply(), Response::Success);

    drive(&mut session, &sign_request(&key, b"anything")).await;
    assert_eq!(harness.last_reply(), Response::Failure);
    Ok(())
}

#[tokio::test]
async fn session_bind_then_sign_checks_session_id() -> TestResult {
    let (mut session, harness, _manager) = new_session();
    let key = test_key(0x03);
    let host = test_key(0x04);
    let s1 = vec![0x11; 32];
    let s2 = vec![0x22; 32];

    let constraint = restrict_to("example.com", &[&host.public_blob]);
    drive(
        &mut session,
        &add_constrained_request(&key, "restricted", vec![constraint]),
    )
    .await;
    assert_eq!(harness.last_reply(), Response::Success);

    drive(&mut session, &session_bind_request(&host, &s1, false)).await;
    assert_eq!(harness.last_reply(), Response::Success);
    assert_eq!(session.bindings().len(), 1);

    // User-auth payload bound to a different session id: refused.
    let mismatched = userauth_payload(&s2, "git", &host.public_blob);
    drive(&mut session, &sign_request(&key, &mismatched)).await;
    assert_eq!(harness.last_reply(), Response::Failure);

    // The matching session id signs fine.
    let matching = userauth_payload(&s1, "git", &host.public_blob);
    drive(&mut session, &sign_request(&key, &matching)).await;
    let Response::SignResponse(signature) = harness.last_reply() else {
        panic!("expected a signature");
    };
    factory::create_public_key(&key.public_blob)?.verify(&matching, &signature)?;
    Ok(())
}

#[tokio::test]
async fn failed_bind_poisons_the_session() -> TestResult {
    let (mut session, harness, _manager) = new_session();
    let key = test_key(0x05);
    let host = test_key(0x06);
    let s1 = vec![0x11; 32];

    let constraint = restrict_to("example.com", &[&host.public_blob]);
    drive(
        &mut session,
        &add_constrained_request(&key, "restricted", vec![constraint]),
    )
    .await;

    // A bind with a corrupted signature fails and clears the chain.
    let good = session_bind_request(&host, &s1, false);
    let Request::Extension(mut ext) = good else {
        unreachable!()
    };
    let last = ext.body.len() - 2;
    ext.body[last] ^= 0x01; // corrupt the signature bytes
    drive(&mut session, &Request::Extension(ext)).await;
    assert_eq!(harness.last_reply(), Response::Failure);
    assert!(session.binding_failed());
    assert!(session.bindings().is_empty());

    // A later valid bind is accepted on the wire, but the poisoned flag
    // still refuses constrained signatures.
    drive(&mut session, &session_bind_request(&host, &s1, false)).await;
    assert_eq!(harness.last_reply(), Response::Success);
    let payload = userauth_payload(&s1, "git", &host.public_blob);
    drive(&mut session, &sign_request(&key, &payload)).await;
    assert_eq!(harness.last_reply(), Response::Failure);
    Ok(())
}

#[tokio::test]
async fn lock_gate_blocks_everything_but_unlock() -> TestResult {
    let (mut session, harness, _manager) = new_session();
    let key = test_key(0x07);

    drive(&mut session, &add_request(&key, "k")).await;
    drive(
        &mut session,
        &Request::Lock(SecureBytes::from_slice(b"pw")),
    )
    .await;
    assert_eq!(harness.last_reply(), Response::Success);

    drive(&mut session, &sign_request(&key, b"hello")).await;
    assert_eq!(harness.last_reply(), Response::Failure);
    drive(&mut session, &Request::RequestIdentities).await;
    assert_eq!(harness.last_reply(), Response::Failure);

    drive(
        &mut session,
        &Request::Unlock(SecureBytes::from_slice(b"pw")),
    )
    .await;
    assert_eq!(harness.last_reply(), Response::Success);

    drive(&mut session, &sign_request(&key, b"hello")).await;
    let Response::SignResponse(signature) = harness.last_reply() else {
        panic!("expected a signature after unlock");
    };
    factory::create_public_key(&key.public_blob)?.verify(b"hello", &signature)?;
    Ok(())
}

#[tokio::test]
async fn unlock_throttles_after_repeated_failures() -> TestResult {
    // Slow test: waits out the ⌊1.8³⌋-second back-off window.
    let (mut session, harness, _manager) = new_session();
    let key = test_key(0x08);

    drive(&mut session, &add_request(&key, "k")).await;
    drive(
        &mut session,
        &Request::Lock(SecureBytes::from_slice(b"pw")),
    )
    .await;
    assert_eq!(harness.last_reply(), Response::Success);

    for _ in 0..5 {
        drive(
            &mut session,
            &Request::Unlock(SecureBytes::from_slice(b"bad")),
        )
        .await;
        assert_eq!(harness.last_reply(), Response::Failure);
    }

    // Correct passphrase inside the window is still refused.
    drive(
        &mut session,
        &Request::Unlock(SecureBytes::from_slice(b"pw")),
    )
    .await;
    assert_eq!(harness.last_reply(), Response::Failure);

    tokio::time::sleep(std::time::Duration::from_secs(6)).await;
    drive(
        &mut session,
        &Request::Unlock(SecureBytes::from_slice(b"pw")),
    )
    .await;
    assert_eq!(harness.last_reply(), Response::Success);
    Ok(())
}

#[tokio::test]
async fn confirm_required_key_respects_the_prompt() -> TestResult {
    let (mut session, harness, manager) = new_session();
    let key = test_key(0x09);

    drive(
        &mut session,
        &add_constrained_request(&key, "guarded", vec![KeyConstraint::Confirm]),
    )
    .await;
    assert_eq!(harness.last_reply(), Response::Success);

    let declined = Arc::new(Mutex::new(Vec::<String>::new()));
    struct DeclineWatcher(Arc<Mutex<Vec<String>>>);
    impl KeyManagerObserver for DeclineWatcher {
        fn on_key_declined(&self, key: &KeyEntry, client: &str) {
            self.0
                .lock()
                .unwrap()
                .push(format!("{}@{client}", key.comment()));
        }
    }
    let observer: Arc<dyn KeyManagerObserver> =
        Arc::new(DeclineWatcher(Arc::clone(&declined)));
    manager
        .lock()
        .unwrap()
        .register_observer(&observer);

    // Harness declines: FAILURE plus an observer event.
    let mut declining = Session::new(Arc::clone(&manager), Harness {
        sent: harness.sent.clone(),
        confirm: false,
    });
    drive(&mut declining, &sign_request(&key, b"hello")).await;
    assert_eq!(harness.last_reply(), Response::Failure);
    assert_eq!(
        declined.lock().unwrap().as_slice(),
        ["guarded@test-client"]
    );

    // The original (accepting) session signs.
    drive(&mut session, &sign_request(&key, b"hello")).await;
    assert!(matches!(harness.last_reply(), Response::SignResponse(_)));
    Ok(())
}

#[tokio::test]
async fn remove_all_fires_observers_in_order() -> TestResult {
    let (mut session, harness, manager) = new_session();
    let k1 = test_key(0x0A);
    let k2 = test_key(0x0B);

    drive(&mut session, &add_request(&k1, "k1")).await;
    drive(&mut session, &add_request(&k2, "k2")).await;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);
    impl KeyManagerObserver for Recorder {
        fn on_key_pre_remove(&self, key: &KeyEntry) {
            self.0.lock().unwrap().push(format!("pre:{}", key.comment()));
        }
        fn on_key_removed(&self, fingerprint: &str) {
            self.0.lock().unwrap().push(format!("removed:{fingerprint}"));
        }
        fn on_keys_cleared(&self) {
            self.0.lock().unwrap().push("cleared".into());
        }
    }

    let recorder = Arc::new(Recorder::default());
    let as_dyn: Arc<dyn KeyManagerObserver> = recorder.clone();
    let (fp1, fp2) = {
        let mut km = manager.lock().unwrap();
        km.register_observer(&as_dyn);
        (
            km.get_key(&k1.public_blob).unwrap().fingerprint().to_string(),
            km.get_key(&k2.public_blob).unwrap().fingerprint().to_string(),
        )
    };

    drive(&mut session, &Request::RemoveAllIdentities).await;
    assert_eq!(harness.last_reply(), Response::Success);

    assert_eq!(
        recorder.0.lock().unwrap().as_slice(),
        [
            "pre:k1".to_string(),
            "pre:k2".to_string(),
            format!("removed:{fp1}"),
            format!("removed:{fp2}"),
            "cleared".to_string(),
        ]
    );

    drive(&mut session, &Request::RequestIdentities).await;
    assert_eq!(harness.last_reply(), Response::IdentitiesAnswer(vec![]));
    Ok(())
}

#[tokio::test]
async fn remove_identity_and_deprecated_remove_all() -> TestResult {
    let (mut session, harness, _manager) = new_session();
    let k1 = test_key(0x0C);
    let k2 = test_key(0x0D);

    drive(&mut session, &add_request(&k1, "k1")).await;
    drive(&mut session, &add_request(&k2, "k2")).await;

    drive(
        &mut session,
        &Request::RemoveIdentity(RemoveIdentity {
            key_blob: k1.public_blob.clone(),
        }),
    )
    .await;
    assert_eq!(harness.last_reply(), Response::Success);

    drive(&mut session, &Request::RemoveAllRsaIdentities).await;
    assert_eq!(harness.last_reply(), Response::Success);

    drive(&mut session, &Request::RequestIdentities).await;
    assert_eq!(harness.last_reply(), Response::IdentitiesAnswer(vec![]));
    Ok(())
}

#[tokio::test]
async fn lifetime_constraint_expires_the_key() -> TestResult {
    let (mut session, harness, manager) = new_session();
    let key = test_key(0x0E);

    drive(
        &mut session,
        &add_constrained_request(&key, "ephemeral", vec![KeyConstraint::Lifetime(1)]),
    )
    .await;
    assert_eq!(harness.last_reply(), Response::Success);

    tokio::time::sleep(std::time::Duration::from_millis(1200)).await;
    manager.lock().unwrap().cleanup_expired_keys();

    drive(&mut session, &Request::RequestIdentities).await;
    assert_eq!(harness.last_reply(), Response::IdentitiesAnswer(vec![]));
    Ok(())
}
