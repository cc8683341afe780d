//! Collaborator contracts: "send bytes to endpoint X, get JSON/blob back".
//!
//! The crypto core only ever sees wrapped key material, ciphertext and
//! public keys through these traits. `sbx-remote` provides an HTTP client
//! and an in-process server over OpenDAL.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::SbxResult;
use crate::types::{
    DirectoryEntry, MessageKind, MessageUpload, PasswordUpdate, PublicKeyBundle, Registration,
    ServiceKeyUpload, SessionInfo, StoredItem,
};

/// Account lifecycle: `POST /sessions`, `/users/setup`, `/users/update`, `GET /keys/private`.
#[async_trait]
pub trait AccountService: Send + Sync {
    /// Authenticate with the derived account password.
    ///
    /// Returns [`SbxError::Unauthorized`](crate::SbxError::Unauthorized) for any
    /// bad username/password combination and `Blocked` when throttled.
    async fn authenticate(&self, username: &str, account_password: &str) -> SbxResult<SessionInfo>;

    async fn register(&self, registration: Registration) -> SbxResult<()>;

    /// Replace the account password and the wrapped IK in one step.
    async fn update_password(&self, update: PasswordUpdate) -> SbxResult<()>;

    /// Private key bundle blob for `service`.
    async fn fetch_private_keys(&self, username: &str, service: &str) -> SbxResult<Bytes>;

    async fn store_service_keys(
        &self,
        username: &str,
        service: &str,
        keys: ServiceKeyUpload,
    ) -> SbxResult<()>;
}

/// Public key directory: `GET /keys/public/{username}`, `GET /keys/public?usernames=`.
#[async_trait]
pub trait DirectoryService: Send + Sync {
    async fn fetch_public_keys(&self, service: &str, username: &str) -> SbxResult<PublicKeyBundle>;

    /// Unknown usernames are omitted from the result rather than failing the batch.
    async fn fetch_public_keys_batch(
        &self,
        service: &str,
        usernames: &[String],
    ) -> SbxResult<Vec<DirectoryEntry>>;
}

/// Encrypted mail: `POST /messages/{message|draft}`, `GET /messages/{uuid}`.
#[async_trait]
pub trait MessageService: Send + Sync {
    async fn send_message(&self, kind: MessageKind, upload: MessageUpload) -> SbxResult<String>;

    /// Message blob with the caller's wrapped key placed in the key slot.
    async fn fetch_message(&self, uuid: &str, username: &str) -> SbxResult<Bytes>;
}

/// Encrypted storage: `POST /storage/{item|update-item|upload-item|download-item}`.
#[async_trait]
pub trait StorageService: Send + Sync {
    /// Store new item metadata; `item_key` is the item key wrapped to the owner.
    async fn add_item(
        &self,
        owner: &str,
        meta: String,
        item_key: Option<String>,
    ) -> SbxResult<String>;

    async fn update_item(&self, item_id: &str, meta: String) -> SbxResult<()>;

    async fn get_item(&self, item_id: &str) -> SbxResult<StoredItem>;

    async fn upload_part(&self, item_id: &str, part: u64, data: Bytes) -> SbxResult<()>;

    async fn download_part(&self, item_id: &str, part: u64) -> SbxResult<Bytes>;
}
