// test-only module included via protocol/mod.rs
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::config::RegistrationPolicy;
use crate::core::codec::FrameCodec;
use crate::error::ChannelError;
use crate::protocol::handshake::*;
use crate::protocol::message::*;
use crate::store::IdentityStore;
use crate::utils::crypto::Cipher;

fn cipher() -> Cipher {
    Cipher::new(b"1234567897654321").unwrap()
}

fn device(hwid: &str) -> DeviceInfo {
    DeviceInfo {
        host_name: "h".into(),
        ip_address: "10.0.0.2".into(),
        mac_address: "aa:bb:cc:dd:ee:ff".into(),
        hardware_id: hwid.into(),
    }
}

// =================== Wire shape ===================

#[test]
fn test_envelope_json_shape() {
    let env = Envelope::with_id(
        7,
        Message::Hello {
            identity: "abc".into(),
        },
    );
    let json: serde_json::Value = serde_json::from_slice(&env.to_bytes().unwrap()).unwrap();
    assert_eq!(
        json,
        serde_json::json!({"id": 7, "type": "hello", "data": {"identity": "abc"}})
    );
}

#[test]
fn test_push_has_null_id() {
    let env = Envelope::push(Message::command("PING"));
    let json: serde_json::Value = serde_json::from_slice(&env.to_bytes().unwrap()).unwrap();
    assert!(json["id"].is_null());
    assert_eq!(json["data"]["text"], "PING");
}

#[test]
fn test_device_info_field_names() {
    let json = serde_json::to_value(Message::Register(device("abc"))).unwrap();
    assert_eq!(json["type"], "register");
    assert_eq!(json["data"]["hostName"], "h");
    assert_eq!(json["data"]["hardwareID"], "abc");
}

#[test]
fn test_unit_variant_roundtrip() {
    let env = Envelope::from_bytes(br#"{"id":3,"type":"ack"}"#).unwrap();
    assert_eq!(env, Envelope::with_id(3, Message::Ack));
}

#[test]
fn test_unknown_type_rejected() {
    assert!(Envelope::from_bytes(br#"{"id":1,"type":"reboot","data":{}}"#).is_err());
}

#[test]
fn test_data_shape_fixed_by_type() {
    // hello requires an identity field
    assert!(Envelope::from_bytes(br#"{"id":1,"type":"hello","data":{"line":"x"}}"#).is_err());
}

// =================== Server state machine ===================

#[tokio::test]
async fn test_register_hello_auth_flow() {
    let store = Arc::new(IdentityStore::in_memory());
    let mut hs = ServerHandshake::new(store.clone(), RegistrationPolicy::ReuseExisting);
    assert_eq!(hs.state(), &HandshakeState::Unregistered);

    let (identity, code) = match hs.handle(Message::Register(device("abc"))).await.unwrap() {
        Message::RegisterAck { identity, code } => (identity, code),
        other => panic!("expected RegisterAck, got {other:?}"),
    };
    assert_eq!(code, "001");
    assert!(matches!(hs.state(), HandshakeState::Registered { .. }));

    let key = match hs
        .handle(Message::Hello {
            identity: identity.clone(),
        })
        .await
        .unwrap()
    {
        Message::KeyIssued { key: Some(key) } => key,
        other => panic!("expected KeyIssued, got {other:?}"),
    };
    assert_eq!(key.len(), 32);
    assert_eq!(
        hs.state(),
        &HandshakeState::AwaitingAuth {
            identity: identity.clone()
        }
    );
    let stored = store.lookup(&identity).unwrap();
    assert_eq!(stored.key.as_deref(), Some(key.as_str()));
    assert!(!stored.authenticated);

    let reply = hs
        .handle(Message::Auth {
            identity: identity.clone(),
            key,
        })
        .await
        .unwrap();
    assert!(matches!(reply, Message::AuthResult { success: true, .. }));
    assert!(hs.is_authenticated());
    assert!(store.lookup(&identity).unwrap().authenticated);
}

#[tokio::test]
async fn test_second_registration_same_hardware() {
    let store = Arc::new(IdentityStore::in_memory());
    let mut first = ServerHandshake::new(store.clone(), RegistrationPolicy::ReuseExisting);
    let mut second = ServerHandshake::new(store.clone(), RegistrationPolicy::ReuseExisting);

    let a = first.handle(Message::Register(device("abc"))).await.unwrap();
    let b = second.handle(Message::Register(device("abc"))).await.unwrap();
    assert_eq!(a, b);
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn test_always_mint_policy() {
    let store = Arc::new(IdentityStore::in_memory());
    let mut hs = ServerHandshake::new(store.clone(), RegistrationPolicy::AlwaysMint);

    let a = hs.handle(Message::Register(device("abc"))).await.unwrap();
    let b = hs.handle(Message::Register(device("abc"))).await.unwrap();
    assert_ne!(a, b);
    assert_eq!(store.len(), 2);
}

#[tokio::test]
async fn test_non_handshake_rejected_before_auth() {
    let store = Arc::new(IdentityStore::in_memory());
    let mut hs = ServerHandshake::new(store, RegistrationPolicy::ReuseExisting);

    for msg in [
        Message::Log {
            identity: "x".into(),
            line: "l".into(),
        },
        Message::RequestOtp {
            identity: "x".into(),
        },
        Message::command("PING"),
        Message::Ack,
    ] {
        let reply = hs.handle(msg).await.unwrap();
        assert!(matches!(
            reply,
            Message::Error {
                kind: ErrorKind::Auth,
                ..
            }
        ));
    }
    assert_eq!(hs.state(), &HandshakeState::Unregistered);
}

#[tokio::test]
async fn test_bad_key_keeps_awaiting_auth() {
    let store = Arc::new(IdentityStore::in_memory());
    let mut hs = ServerHandshake::new(store.clone(), RegistrationPolicy::ReuseExisting);
    let record = store
        .register(device("abc"), RegistrationPolicy::ReuseExisting)
        .await
        .unwrap();

    let key = match hs
        .handle(Message::Hello {
            identity: record.id.clone(),
        })
        .await
        .unwrap()
    {
        Message::KeyIssued { key: Some(key) } => key,
        other => panic!("expected key, got {other:?}"),
    };

    let reply = hs
        .handle(Message::Auth {
            identity: record.id.clone(),
            key: "wrong".into(),
        })
        .await
        .unwrap();
    assert!(matches!(reply, Message::AuthResult { success: false, .. }));
    assert!(matches!(hs.state(), HandshakeState::AwaitingAuth { .. }));

    let retry = hs
        .handle(Message::Auth {
            identity: record.id,
            key,
        })
        .await
        .unwrap();
    assert!(matches!(retry, Message::AuthResult { success: true, .. }));
}

#[tokio::test]
async fn test_hello_unknown_identity() {
    let store = Arc::new(IdentityStore::in_memory());
    let mut hs = ServerHandshake::new(store, RegistrationPolicy::ReuseExisting);
    let reply = hs
        .handle(Message::Hello {
            identity: "ghost".into(),
        })
        .await
        .unwrap();
    assert!(matches!(
        reply,
        Message::Error {
            kind: ErrorKind::NotRegistered,
            ..
        }
    ));
}

#[tokio::test]
async fn test_existing_key_not_resent() {
    let store = Arc::new(IdentityStore::in_memory());
    let record = store
        .register(device("abc"), RegistrationPolicy::ReuseExisting)
        .await
        .unwrap();
    store.upsert_key(&record.id, "k").await.unwrap();

    let mut hs = ServerHandshake::new(store, RegistrationPolicy::ReuseExisting);
    let reply = hs
        .handle(Message::Hello {
            identity: record.id,
        })
        .await
        .unwrap();
    assert_eq!(reply, Message::KeyIssued { key: None });
}

#[tokio::test]
async fn test_auth_without_hello() {
    let store = Arc::new(IdentityStore::in_memory());
    let mut hs = ServerHandshake::new(store, RegistrationPolicy::ReuseExisting);
    let reply = hs
        .handle(Message::Auth {
            identity: "x".into(),
            key: "k".into(),
        })
        .await
        .unwrap();
    assert!(matches!(reply, Message::AuthResult { success: false, .. }));
}

// =================== Client driver ===================

type Seen = Arc<Mutex<Vec<&'static str>>>;

async fn serve(io: DuplexStream, store: Arc<IdentityStore>, seen: Seen) {
    let (r, w) = tokio::io::split(io);
    let mut reader = FramedRead::new(r, FrameCodec::new(Some(cipher())));
    let mut writer = FramedWrite::new(w, FrameCodec::new(Some(cipher())));
    let mut hs = ServerHandshake::new(store, RegistrationPolicy::ReuseExisting);

    while let Some(Ok(frame)) = reader.next().await {
        let env = Envelope::from_bytes(&frame).unwrap();
        seen.lock().unwrap().push(env.message.kind());
        let reply = hs.handle(env.message.clone()).await.unwrap();
        if writer.send(env.reply(reply).to_bytes().unwrap()).await.is_err() {
            break;
        }
    }
}

async fn run_client(
    store: Arc<IdentityStore>,
    cached: Option<ClientCredentials>,
) -> (Result<ClientCredentials, ChannelError>, Vec<&'static str>) {
    let (client_io, server_io) = tokio::io::duplex(4096);
    let seen: Seen = Arc::default();
    let server = tokio::spawn(serve(server_io, store, seen.clone()));

    let (r, w) = tokio::io::split(client_io);
    let mut reader = FramedRead::new(r, FrameCodec::new(Some(cipher())));
    let mut writer = FramedWrite::new(w, FrameCodec::new(Some(cipher())));
    let result = client_handshake(
        &mut reader,
        &mut writer,
        cached,
        &device("abc"),
        Duration::from_secs(5),
    )
    .await;

    drop(reader);
    drop(writer);
    server.await.unwrap();
    let seen = seen.lock().unwrap().clone();
    (result, seen)
}

#[tokio::test]
async fn test_client_without_identity_registers_first() {
    let store = Arc::new(IdentityStore::in_memory());
    let (result, seen) = run_client(store.clone(), None).await;
    let creds = result.unwrap();

    assert_eq!(seen, vec!["register", "hello", "auth"]);
    assert!(creds.key.is_some());
    assert!(store.lookup(&creds.identity).unwrap().authenticated);
}

#[tokio::test]
async fn test_cached_identity_skips_register() {
    let store = Arc::new(IdentityStore::in_memory());
    let (first, _) = run_client(store.clone(), None).await;
    let creds = first.unwrap();

    let (second, seen) = run_client(store, Some(creds.clone())).await;
    assert_eq!(seen, vec!["hello", "auth"]);
    assert_eq!(second.unwrap(), creds);
}

#[tokio::test]
async fn test_unknown_cached_identity_reregisters() {
    let store = Arc::new(IdentityStore::in_memory());
    let stale = ClientCredentials {
        identity: "gone".into(),
        code: "009".into(),
        key: Some("k".into()),
    };
    let (result, seen) = run_client(store, Some(stale)).await;
    assert_eq!(seen, vec!["hello", "register", "hello", "auth"]);
    assert_ne!(result.unwrap().identity, "gone");
}

#[tokio::test]
async fn test_rejected_key_reregisters_once() {
    let store = Arc::new(IdentityStore::in_memory());
    let (first, _) = run_client(store.clone(), None).await;
    let mut creds = first.unwrap();
    creds.key = Some("not-the-key".into());

    let (result, seen) = run_client(store, Some(creds.clone())).await;
    assert_eq!(seen, vec!["hello", "auth", "register", "hello", "auth"]);
    let fresh = result.unwrap();
    assert_eq!(fresh.identity, creds.identity);
    assert_ne!(fresh.key, creds.key);
}

#[tokio::test]
async fn test_lost_key_reregisters() {
    let store = Arc::new(IdentityStore::in_memory());
    let (first, _) = run_client(store.clone(), None).await;
    let mut creds = first.unwrap();
    creds.key = None;

    let (result, seen) = run_client(store, Some(creds)).await;
    assert_eq!(seen, vec!["hello", "register", "hello", "auth"]);
    assert!(result.unwrap().key.is_some());
}
