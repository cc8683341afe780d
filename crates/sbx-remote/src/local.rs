//! In-process strongbox server over an OpenDAL operator
//!
//! Object layout:
//! ```text
//! accounts/{user}.json                  AccountRecord (salted verifier, wrapped IK, lockout)
//! keys/{service}/{user}/public.json     PublicKeyBundle
//! keys/{service}/{user}/private.bin     private key bundle blob
//! messages/{uuid}/blob                  envelope with a zero-filled key slot
//! messages/{uuid}/keys/{user}           that user's wrapped session key
//! messages/{uuid}/meta.json             kind + recipients
//! items/{id}/meta.json                  ItemRecord
//! items/{id}/parts/{n}                  part ciphertext
//! ```
//!
//! The server stores a salted PBKDF2 verifier of the derived account password,
//! never the password itself. Repeated failed logins block the account for a
//! while.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use opendal::{ErrorKind, Operator};
use sbx_core::api::{AccountService, DirectoryService, MessageService, StorageService};
use sbx_core::types::{
    DirectoryEntry, MessageKind, MessageUpload, PasswordUpdate, PublicKeyBundle, Registration,
    ServiceKeyUpload, SessionInfo, StoredItem,
};
use sbx_core::{SbxError, SbxResult};
use sbx_crypto::{MessageBlob, PrimitiveProvider, MAIL_SERVICE};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// PBKDF2 rounds for the stored login verifier
pub const VERIFIER_ROUNDS: u32 = 1000;

/// Consecutive failed logins before the account is blocked
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

pub const DEFAULT_BLOCK_DURATION: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AccountRecord {
    username: String,
    salt: String,
    verifier: String,
    /// Wrapped-IK blob, base64
    iak: String,
    #[serde(default)]
    failed_attempts: u32,
    #[serde(default)]
    blocked_until: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MessageRecord {
    kind: MessageKind,
    recipients: String,
    holders: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ItemRecord {
    owner: String,
    meta: String,
    item_key: Option<String>,
}

fn storage_err(path: &str, e: opendal::Error) -> SbxError {
    if e.kind() == ErrorKind::NotFound {
        SbxError::NotFound(path.to_owned())
    } else {
        SbxError::Storage(format!("{path}: {e}"))
    }
}

fn json_err(path: &str, e: serde_json::Error) -> SbxError {
    SbxError::Storage(format!("{path}: malformed record: {e}"))
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Usernames become object path segments.
/// Equality without an early exit on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn check_name(kind: &str, name: &str) -> SbxResult<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        && !name.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(SbxError::Remote(format!("invalid {kind}: {name:?}")))
    }
}

pub struct LocalServer {
    op: Operator,
    provider: Arc<dyn PrimitiveProvider>,
    max_attempts: u32,
    block_for: Duration,
    /// Serializes read-modify-write of account records
    accounts: Mutex<()>,
}

impl LocalServer {
    pub fn new(op: Operator, provider: Arc<dyn PrimitiveProvider>) -> Self {
        Self {
            op,
            provider,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            block_for: DEFAULT_BLOCK_DURATION,
            accounts: Mutex::new(()),
        }
    }

    pub fn with_lockout(mut self, max_attempts: u32, block_for: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.block_for = block_for;
        self
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }

    async fn read(&self, path: &str) -> SbxResult<Bytes> {
        let buf = self.op.read(path).await.map_err(|e| storage_err(path, e))?;
        Ok(buf.to_bytes())
    }

    async fn write(&self, path: &str, data: impl Into<Bytes>) -> SbxResult<()> {
        let data: Bytes = data.into();
        self.op
            .write(path, data)
            .await
            .map(|_| ())
            .map_err(|e| storage_err(path, e))
    }

    async fn exists(&self, path: &str) -> SbxResult<bool> {
        self.op.exists(path).await.map_err(|e| storage_err(path, e))
    }

    async fn read_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> SbxResult<T> {
        let bytes = self.read(path).await?;
        serde_json::from_slice(&bytes).map_err(|e| json_err(path, e))
    }

    async fn write_json<T: Serialize>(&self, path: &str, value: &T) -> SbxResult<()> {
        let bytes = serde_json::to_vec(value).map_err(|e| json_err(path, e))?;
        self.write(path, bytes).await
    }

    fn account_path(username: &str) -> String {
        format!("accounts/{username}.json")
    }

    fn public_path(service: &str, username: &str) -> String {
        format!("keys/{service}/{username}/public.json")
    }

    fn private_path(service: &str, username: &str) -> String {
        format!("keys/{service}/{username}/private.bin")
    }

    fn verifier_bytes(&self, salt: &str, account_password: &str) -> [u8; 32] {
        let mut out = [0u8; 32];
        self.provider.pbkdf2_sha256(
            account_password.as_bytes(),
            salt.as_bytes(),
            VERIFIER_ROUNDS,
            &mut out,
        );
        out
    }

    fn verifier(&self, salt: &str, account_password: &str) -> String {
        hex::encode(self.verifier_bytes(salt, account_password))
    }

    fn verifier_matches(&self, record: &AccountRecord, account_password: &str) -> bool {
        let Ok(stored) = hex::decode(&record.verifier) else {
            return false;
        };
        constant_time_eq(&self.verifier_bytes(&record.salt, account_password), &stored)
    }

    fn new_verifier(&self, account_password: &str) -> (String, String) {
        let mut salt = [0u8; 16];
        self.provider.random_bytes(&mut salt);
        let salt = hex::encode(salt);
        let verifier = self.verifier(&salt, account_password);
        (salt, verifier)
    }

    async fn load_account(&self, username: &str) -> SbxResult<Option<AccountRecord>> {
        if check_name("username", username).is_err() {
            return Ok(None);
        }
        match self.read_json(&Self::account_path(username)).await {
            Ok(record) => Ok(Some(record)),
            Err(SbxError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Check credentials and maintain the lockout counters.
    async fn check_password(
        &self,
        username: &str,
        account_password: &str,
    ) -> SbxResult<AccountRecord> {
        let _guard = self.accounts.lock().await;
        let Some(mut record) = self.load_account(username).await? else {
            return Err(SbxError::Unauthorized);
        };

        let now = now_secs();
        if record.blocked_until.is_some_and(|until| now < until) {
            warn!(user = %username, "login attempt on blocked account");
            return Err(SbxError::Blocked);
        }

        if self.verifier_matches(&record, account_password) {
            if record.failed_attempts > 0 || record.blocked_until.is_some() {
                record.failed_attempts = 0;
                record.blocked_until = None;
                self.write_json(&Self::account_path(username), &record).await?;
            }
            return Ok(record);
        }

        record.failed_attempts += 1;
        let blocked = record.failed_attempts >= self.max_attempts;
        if blocked {
            record.failed_attempts = 0;
            record.blocked_until = Some(now + self.block_for.as_secs());
            warn!(user = %username, "too many failed logins, account blocked");
        }
        self.write_json(&Self::account_path(username), &record).await?;
        Err(if blocked {
            SbxError::Blocked
        } else {
            SbxError::Unauthorized
        })
    }
}

#[async_trait]
impl AccountService for LocalServer {
    async fn authenticate(&self, username: &str, account_password: &str) -> SbxResult<SessionInfo> {
        let record = self.check_password(username, account_password).await?;
        debug!(user = %username, "authenticated");
        Ok(SessionInfo {
            iak: record.iak,
            extra: [
                ("_token".to_string(), serde_json::json!(uuid::Uuid::new_v4().to_string())),
                ("username".to_string(), serde_json::json!(record.username)),
            ]
            .into(),
        })
    }

    async fn register(&self, registration: Registration) -> SbxResult<()> {
        check_name("username", &registration.username)?;
        let _guard = self.accounts.lock().await;
        let path = Self::account_path(&registration.username);
        if self.exists(&path).await? {
            return Err(SbxError::Remote(format!(
                "username {} is already taken",
                registration.username
            )));
        }

        let (salt, verifier) = self.new_verifier(&registration.account_password);
        let user = &registration.username;
        self.write_json(&Self::public_path(MAIL_SERVICE, user), &registration.public_keys)
            .await?;
        self.write(&Self::private_path(MAIL_SERVICE, user), registration.private_keys)
            .await?;
        self.write_json(
            &path,
            &AccountRecord {
                username: user.clone(),
                salt,
                verifier,
                iak: STANDARD.encode(&registration.key),
                failed_attempts: 0,
                blocked_until: None,
            },
        )
        .await?;
        info!(user = %user, "account registered");
        Ok(())
    }

    async fn update_password(&self, update: PasswordUpdate) -> SbxResult<()> {
        let mut record = self
            .check_password(&update.username, &update.current_password)
            .await?;
        STANDARD
            .decode(&update.key)
            .map_err(|e| SbxError::Remote(format!("wrapped key is not base64: {e}")))?;

        let _guard = self.accounts.lock().await;
        let (salt, verifier) = self.new_verifier(&update.new_password);
        record.salt = salt;
        record.verifier = verifier;
        record.iak = update.key;
        self.write_json(&Self::account_path(&update.username), &record)
            .await?;
        info!(user = %update.username, "password updated");
        Ok(())
    }

    async fn fetch_private_keys(&self, username: &str, service: &str) -> SbxResult<Bytes> {
        check_name("username", username)?;
        check_name("service", service)?;
        self.read(&Self::private_path(service, username)).await
    }

    async fn store_service_keys(
        &self,
        username: &str,
        service: &str,
        keys: ServiceKeyUpload,
    ) -> SbxResult<()> {
        check_name("username", username)?;
        check_name("service", service)?;
        if self.load_account(username).await?.is_none() {
            return Err(SbxError::NotFound(username.to_owned()));
        }
        self.write_json(&Self::public_path(service, username), &keys.public_keys)
            .await?;
        self.write(&Self::private_path(service, username), keys.private_keys)
            .await?;
        info!(user = %username, service, "service key store saved");
        Ok(())
    }
}

#[async_trait]
impl DirectoryService for LocalServer {
    async fn fetch_public_keys(&self, service: &str, username: &str) -> SbxResult<PublicKeyBundle> {
        check_name("username", username).map_err(|_| SbxError::NotFound(username.to_owned()))?;
        check_name("service", service)?;
        self.read_json(&Self::public_path(service, username)).await
    }

    async fn fetch_public_keys_batch(
        &self,
        service: &str,
        usernames: &[String],
    ) -> SbxResult<Vec<DirectoryEntry>> {
        let mut entries = Vec::with_capacity(usernames.len());
        for username in usernames {
            match self.fetch_public_keys(service, username).await {
                Ok(public_keys) => entries.push(DirectoryEntry {
                    username: username.clone(),
                    public_keys,
                }),
                Err(SbxError::NotFound(_)) => debug!(user = %username, "no public keys"),
                Err(e) => return Err(e),
            }
        }
        Ok(entries)
    }
}

#[async_trait]
impl MessageService for LocalServer {
    async fn send_message(&self, kind: MessageKind, upload: MessageUpload) -> SbxResult<String> {
        if upload.keys.is_empty() {
            return Err(SbxError::Remote("message has no recipient keys".into()));
        }
        for (user, _) in &upload.keys {
            check_name("recipient", user)?;
        }

        let uuid = uuid::Uuid::new_v4().to_string();
        let holders = upload.keys.iter().map(|(u, _)| u.clone()).collect();
        for (user, key) in upload.keys {
            self.write(&format!("messages/{uuid}/keys/{user}"), key).await?;
        }
        self.write(&format!("messages/{uuid}/blob"), upload.blob).await?;
        self.write_json(
            &format!("messages/{uuid}/meta.json"),
            &MessageRecord {
                kind,
                recipients: upload.recipients,
                holders,
            },
        )
        .await?;
        debug!(%uuid, ?kind, "message stored");
        Ok(uuid)
    }

    async fn fetch_message(&self, uuid: &str, username: &str) -> SbxResult<Bytes> {
        check_name("message id", uuid)?;
        check_name("username", username).map_err(|_| SbxError::NotFound(uuid.to_owned()))?;
        let key = match self.read(&format!("messages/{uuid}/keys/{username}")).await {
            Ok(key) => key,
            // Not a recipient: indistinguishable from a missing message
            Err(SbxError::NotFound(_)) => return Err(SbxError::NotFound(uuid.to_owned())),
            Err(e) => return Err(e),
        };
        let mut blob = self.read(&format!("messages/{uuid}/blob")).await?.to_vec();
        MessageBlob::substitute_key(&mut blob, &key)
            .map_err(|e| SbxError::Storage(format!("message {uuid}: {e}")))?;
        Ok(Bytes::from(blob))
    }
}

#[async_trait]
impl StorageService for LocalServer {
    async fn add_item(
        &self,
        owner: &str,
        meta: String,
        item_key: Option<String>,
    ) -> SbxResult<String> {
        check_name("owner", owner)?;
        let id = uuid::Uuid::new_v4().to_string();
        self.write_json(
            &format!("items/{id}/meta.json"),
            &ItemRecord {
                owner: owner.to_owned(),
                meta,
                item_key,
            },
        )
        .await?;
        debug!(item = %id, owner, "item added");
        Ok(id)
    }

    async fn update_item(&self, item_id: &str, meta: String) -> SbxResult<()> {
        check_name("item id", item_id)?;
        let path = format!("items/{item_id}/meta.json");
        let mut record: ItemRecord = self.read_json(&path).await?;
        record.meta = meta;
        self.write_json(&path, &record).await
    }

    async fn get_item(&self, item_id: &str) -> SbxResult<StoredItem> {
        check_name("item id", item_id)?;
        let record: ItemRecord = self.read_json(&format!("items/{item_id}/meta.json")).await?;
        Ok(StoredItem {
            id: item_id.to_owned(),
            meta: record.meta,
            item_key: record.item_key,
        })
    }

    async fn upload_part(&self, item_id: &str, part: u64, data: Bytes) -> SbxResult<()> {
        check_name("item id", item_id)?;
        self.write(&format!("items/{item_id}/parts/{part}"), data).await
    }

    async fn download_part(&self, item_id: &str, part: u64) -> SbxResult<Bytes> {
        check_name("item id", item_id)?;
        self.read(&format!("items/{item_id}/parts/{part}")).await
    }
}
