//! In-memory account server and directory for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use sbx_core::api::{AccountService, DirectoryService};
use sbx_core::types::{
    DirectoryEntry, Identity, PasswordUpdate, PublicKeyBundle, Registration, ServiceKeyUpload,
    SessionInfo,
};
use sbx_core::{SbxError, SbxResult};
use sbx_crypto::{
    login, setup_account, AccountSetup, KeyParams, PrimitiveProvider, PublicKeyDirectory,
    RustCryptoProvider, Session, MAIL_SERVICE,
};
use secrecy::SecretString;

pub const DOMAIN: &str = "example.com";

pub fn params() -> KeyParams {
    KeyParams {
        modulus_bits: 1024,
        kdf_rounds: 10,
    }
}

pub fn provider() -> Arc<dyn PrimitiveProvider> {
    Arc::new(RustCryptoProvider::new())
}

pub fn password(s: &str) -> SecretString {
    SecretString::from(s.to_owned())
}

struct Account {
    account_password: String,
    wrapped_ik: Vec<u8>,
    public: HashMap<String, PublicKeyBundle>,
    private: HashMap<String, Vec<u8>>,
}

#[derive(Default)]
pub struct MockServer {
    accounts: Mutex<HashMap<String, Account>>,
    pub fail_updates: AtomicBool,
    /// Directory requests answer as if the session timed out
    pub expire_sessions: AtomicBool,
    pub directory_calls: AtomicUsize,
    pub key_fetches: AtomicUsize,
}

impl MockServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn wrapped_ik(&self, username: &str) -> Option<Vec<u8>> {
        self.accounts
            .lock()
            .unwrap()
            .get(username)
            .map(|a| a.wrapped_ik.clone())
    }

    /// Swap a user's published keys, simulating key rotation.
    pub fn replace_public_keys(&self, username: &str, service: &str, keys: PublicKeyBundle) {
        if let Some(account) = self.accounts.lock().unwrap().get_mut(username) {
            account.public.insert(service.to_owned(), keys);
        }
    }
}

#[async_trait]
impl AccountService for MockServer {
    async fn authenticate(&self, username: &str, account_password: &str) -> SbxResult<SessionInfo> {
        let accounts = self.accounts.lock().unwrap();
        match accounts.get(username) {
            Some(a) if a.account_password == account_password => Ok(SessionInfo {
                iak: STANDARD.encode(&a.wrapped_ik),
                extra: [("_token".to_string(), serde_json::json!("csrf-1"))].into(),
            }),
            _ => Err(SbxError::Unauthorized),
        }
    }

    async fn register(&self, registration: Registration) -> SbxResult<()> {
        let mut accounts = self.accounts.lock().unwrap();
        if accounts.contains_key(&registration.username) {
            return Err(SbxError::Remote("username taken".into()));
        }
        accounts.insert(
            registration.username,
            Account {
                account_password: registration.account_password,
                wrapped_ik: registration.key,
                public: [(MAIL_SERVICE.to_string(), registration.public_keys)].into(),
                private: [(MAIL_SERVICE.to_string(), registration.private_keys)].into(),
            },
        );
        Ok(())
    }

    async fn update_password(&self, update: PasswordUpdate) -> SbxResult<()> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(SbxError::Remote("server unavailable".into()));
        }
        let mut accounts = self.accounts.lock().unwrap();
        let account = accounts
            .get_mut(&update.username)
            .ok_or(SbxError::Unauthorized)?;
        if account.account_password != update.current_password {
            return Err(SbxError::Unauthorized);
        }
        account.account_password = update.new_password;
        account.wrapped_ik = STANDARD
            .decode(&update.key)
            .map_err(|e| SbxError::Remote(e.to_string()))?;
        Ok(())
    }

    async fn fetch_private_keys(&self, username: &str, service: &str) -> SbxResult<Bytes> {
        self.key_fetches.fetch_add(1, Ordering::SeqCst);
        self.accounts
            .lock()
            .unwrap()
            .get(username)
            .and_then(|a| a.private.get(service).cloned())
            .map(Bytes::from)
            .ok_or_else(|| SbxError::NotFound(format!("{service} keys of {username}")))
    }

    async fn store_service_keys(
        &self,
        username: &str,
        service: &str,
        keys: ServiceKeyUpload,
    ) -> SbxResult<()> {
        let mut accounts = self.accounts.lock().unwrap();
        let account = accounts
            .get_mut(username)
            .ok_or_else(|| SbxError::NotFound(username.to_owned()))?;
        account.public.insert(service.to_owned(), keys.public_keys);
        account.private.insert(service.to_owned(), keys.private_keys);
        Ok(())
    }
}

#[async_trait]
impl DirectoryService for MockServer {
    async fn fetch_public_keys(&self, service: &str, username: &str) -> SbxResult<PublicKeyBundle> {
        self.directory_calls.fetch_add(1, Ordering::SeqCst);
        if self.expire_sessions.load(Ordering::SeqCst) {
            return Err(SbxError::SessionExpired);
        }
        self.accounts
            .lock()
            .unwrap()
            .get(username)
            .and_then(|a| a.public.get(service).cloned())
            .ok_or_else(|| SbxError::NotFound(username.to_owned()))
    }

    async fn fetch_public_keys_batch(
        &self,
        service: &str,
        usernames: &[String],
    ) -> SbxResult<Vec<DirectoryEntry>> {
        self.directory_calls.fetch_add(1, Ordering::SeqCst);
        if self.expire_sessions.load(Ordering::SeqCst) {
            return Err(SbxError::SessionExpired);
        }
        let accounts = self.accounts.lock().unwrap();
        Ok(usernames
            .iter()
            .filter_map(|u| {
                accounts.get(u).and_then(|a| a.public.get(service)).map(|keys| DirectoryEntry {
                    username: u.clone(),
                    public_keys: keys.clone(),
                })
            })
            .collect())
    }
}

/// Create and register an account.
pub async fn register(server: &MockServer, username: &str, pw: &str) -> AccountSetup {
    let setup = setup_account(
        &provider(),
        &Identity::new(username, DOMAIN),
        &password(pw),
        params(),
    )
    .await
    .expect("account setup");
    server
        .register(setup.registration().expect("registration"))
        .await
        .expect("register");
    setup
}

/// A logged-in user with a mail directory.
pub struct Client {
    pub session: Session,
    pub directory: PublicKeyDirectory,
}

pub async fn client_with(
    server: &Arc<MockServer>,
    provider: Arc<dyn PrimitiveProvider>,
    username: &str,
    pw: &str,
) -> Client {
    let session = Session::new(provider, params());
    login(
        &session,
        server.as_ref(),
        &Identity::new(username, DOMAIN),
        &password(pw),
        &[MAIL_SERVICE],
    )
    .await
    .expect("login");
    let directory = PublicKeyDirectory::new(MAIL_SERVICE, server.clone(), 10);
    Client { session, directory }
}

pub async fn client(server: &Arc<MockServer>, username: &str, pw: &str) -> Client {
    client_with(server, provider(), username, pw).await
}
