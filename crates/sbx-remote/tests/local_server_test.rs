//! End-to-end account, mail and storage flows through the OpenDAL-backed server.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use sbx_core::api::{AccountService, DirectoryService, MessageService, StorageService};
use sbx_core::config::{Backend, RemoteConfig};
use sbx_core::types::{Identity, MessageKind};
use sbx_core::SbxError;
use sbx_crypto::{
    change_password, login, setup_account, CryptoError, Decrypter, Encrypter, KeyParams,
    PrimitiveProvider, PublicKeyDirectory, Recipients, RustCryptoProvider, Session, MAIL_SERVICE,
};
use sbx_remote::{build_operator, LocalServer};
use secrecy::SecretString;
use serde_json::{json, Value};

const DOMAIN: &str = "example.com";

fn params() -> KeyParams {
    KeyParams {
        modulus_bits: 1024,
        kdf_rounds: 10,
    }
}

fn provider() -> Arc<dyn PrimitiveProvider> {
    Arc::new(RustCryptoProvider::new())
}

fn pw(s: &str) -> SecretString {
    SecretString::from(s.to_owned())
}

fn memory_server() -> Arc<LocalServer> {
    let remote = RemoteConfig {
        backend: Backend::Memory,
        ..Default::default()
    };
    Arc::new(LocalServer::new(build_operator(&remote, None).unwrap(), provider()))
}

async fn register(server: &LocalServer, user: &str, password: &str) {
    let setup = setup_account(&provider(), &Identity::new(user, DOMAIN), &pw(password), params())
        .await
        .unwrap();
    server.register(setup.registration().unwrap()).await.unwrap();
}

async fn session(server: &LocalServer, user: &str, password: &str) -> Session {
    let session = Session::new(provider(), params());
    login(
        &session,
        server,
        &Identity::new(user, DOMAIN),
        &pw(password),
        &[MAIL_SERVICE],
    )
    .await
    .unwrap();
    session
}

#[tokio::test]
async fn mail_roundtrip_through_server() {
    let server = memory_server();
    register(&server, "alice", "alice-pw").await;
    register(&server, "bob", "bob-pw").await;

    let alice = session(&server, "alice", "alice-pw").await;
    let alice_dir = PublicKeyDirectory::new(MAIL_SERVICE, server.clone(), 10);
    let recipients = Recipients::new(vec!["bob@example.com".into()], "alice");
    let envelope = Encrypter::new(&alice, &alice_dir)
        .encrypt(&json!({"subject": "hi", "body": "hello bob"}), &recipients, false)
        .await
        .unwrap();
    let uuid = server
        .send_message(MessageKind::Message, envelope.upload(&recipients).unwrap())
        .await
        .unwrap();

    let bob = session(&server, "bob", "bob-pw").await;
    let bob_dir = PublicKeyDirectory::new(MAIL_SERVICE, server.clone(), 10);
    let blob = server.fetch_message(&uuid, "bob").await.unwrap();
    let mail: Value = Decrypter::new(&bob, &bob_dir)
        .decrypt_message(&blob, "alice")
        .await
        .unwrap();
    assert_eq!(mail["body"], "hello bob");

    // The sender holds a key to the sent copy
    let own = server.fetch_message(&uuid, "alice").await.unwrap();
    let sent: Value = Decrypter::new(&alice, &alice_dir)
        .decrypt_message(&own, "alice")
        .await
        .unwrap();
    assert_eq!(sent["subject"], "hi");

    // Outsiders cannot even fetch it
    register(&server, "eve", "eve-pw").await;
    assert!(matches!(
        server.fetch_message(&uuid, "eve").await,
        Err(SbxError::NotFound(_))
    ));
}

#[tokio::test]
async fn duplicate_registration_rejected() {
    let server = memory_server();
    register(&server, "alice", "pw").await;
    let setup = setup_account(&provider(), &Identity::new("alice", DOMAIN), &pw("other"), params())
        .await
        .unwrap();
    assert!(server.register(setup.registration().unwrap()).await.is_err());
    // The original account still works
    session(&server, "alice", "pw").await;
}

#[tokio::test]
async fn repeated_failures_block_the_account() {
    let server = Arc::new(
        LocalServer::new(
            build_operator(
                &RemoteConfig {
                    backend: Backend::Memory,
                    ..Default::default()
                },
                None,
            )
            .unwrap(),
            provider(),
        )
        .with_lockout(3, Duration::from_secs(600)),
    );
    register(&server, "alice", "right").await;

    for _ in 0..2 {
        let err = login(
            &Session::new(provider(), params()),
            server.as_ref(),
            &Identity::new("alice", DOMAIN),
            &pw("wrong"),
            &[MAIL_SERVICE],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CryptoError::Authentication));
    }
    let third = login(
        &Session::new(provider(), params()),
        server.as_ref(),
        &Identity::new("alice", DOMAIN),
        &pw("wrong"),
        &[MAIL_SERVICE],
    )
    .await
    .unwrap_err();
    assert!(matches!(third, CryptoError::Blocked));
    assert!(third.to_string().contains("temporarily blocked"));

    // Even the right password is refused while blocked
    let blocked = login(
        &Session::new(provider(), params()),
        server.as_ref(),
        &Identity::new("alice", DOMAIN),
        &pw("right"),
        &[MAIL_SERVICE],
    )
    .await
    .unwrap_err();
    assert!(matches!(blocked, CryptoError::Blocked));
}

#[tokio::test]
async fn unknown_user_and_wrong_password_look_the_same() {
    let server = memory_server();
    register(&server, "alice", "pw").await;

    let a = server.authenticate("alice", "not-the-hash").await.unwrap_err();
    let b = server.authenticate("nobody", "not-the-hash").await.unwrap_err();
    assert_eq!(a.to_string(), b.to_string());
    assert!(matches!(a, SbxError::Unauthorized));
}

#[tokio::test]
async fn password_change_persists_on_server() {
    let server = memory_server();
    register(&server, "alice", "old").await;
    let alice = session(&server, "alice", "old").await;

    change_password(
        &alice,
        server.as_ref(),
        &Identity::new("alice", DOMAIN),
        &pw("old"),
        &pw("new"),
    )
    .await
    .unwrap();

    session(&server, "alice", "new").await;
    let stale = login(
        &Session::new(provider(), params()),
        server.as_ref(),
        &Identity::new("alice", DOMAIN),
        &pw("old"),
        &[MAIL_SERVICE],
    )
    .await;
    assert!(matches!(stale, Err(CryptoError::Authentication)));
}

#[tokio::test]
async fn directory_batch_skips_unknown_users() {
    let server = memory_server();
    register(&server, "alice", "pw").await;
    register(&server, "bob", "pw").await;

    let entries = server
        .fetch_public_keys_batch(
            MAIL_SERVICE,
            &["alice".to_string(), "ghost".to_string(), "bob".to_string()],
        )
        .await
        .unwrap();
    let names: Vec<_> = entries.iter().map(|e| e.username.as_str()).collect();
    assert_eq!(names, vec!["alice", "bob"]);
    assert!(matches!(
        server.fetch_public_keys(MAIL_SERVICE, "ghost").await,
        Err(SbxError::NotFound(_))
    ));
}

#[tokio::test]
async fn storage_items_and_parts_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let remote = RemoteConfig {
        backend: Backend::Fs,
        root: dir.path().to_path_buf(),
        ..Default::default()
    };
    let server = LocalServer::new(build_operator(&remote, None).unwrap(), provider());

    let id = server
        .add_item("alice", "{\"v\":1}".into(), Some("d3JhcHBlZA==".into()))
        .await
        .unwrap();
    server.update_item(&id, "{\"v\":2}".into()).await.unwrap();
    let item = server.get_item(&id).await.unwrap();
    assert_eq!(item.meta, "{\"v\":2}");
    assert_eq!(item.item_key.as_deref(), Some("d3JhcHBlZA=="));

    server
        .upload_part(&id, 0, Bytes::from_static(b"ciphertext-0"))
        .await
        .unwrap();
    assert_eq!(
        server.download_part(&id, 0).await.unwrap(),
        Bytes::from_static(b"ciphertext-0")
    );
    assert!(matches!(
        server.download_part(&id, 1).await,
        Err(SbxError::NotFound(_))
    ));
    assert!(dir.path().join(format!("items/{id}/parts/0")).exists());
}
