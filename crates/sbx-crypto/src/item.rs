//! Storage item codec
//!
//! A storage item's metadata (`ItemBody`) is sealed under an item key and
//! signed by its owner. The item key reaches other readers either inside a
//! parent directory (`ChildRef.k`) or OAEP-wrapped per user (assignment).

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use sbx_core::types::SealedItem;

use crate::directory::PublicKeyDirectory;
use crate::envelope::{from_json_bytes, to_json_bytes, Decrypter, Encrypter, Recipients, Sealed};
use crate::error::{CryptoError, CryptoResult};
use crate::keys::SymmetricKey;
use crate::keystore::Session;
use crate::wire::decode_iv;

/// Metadata format version written by this codec
pub const ITEM_VERSION: u32 = 1;

/// A freshly sealed item and its new item key.
#[derive(Debug)]
pub struct SealedNewItem {
    pub meta: SealedItem,
    pub key: SymmetricKey,
    /// The item key wrapped to the owner (assignments only)
    pub wrapped_key: Option<Vec<u8>>,
}

/// An item key wrapped for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemKeyGrant {
    pub username: String,
    /// OAEP-wrapped item key, base64
    pub key: String,
}

/// Plaintext of an assigned item plus the item key that opened it.
#[derive(Debug)]
pub struct OpenedAssignment<T = serde_json::Value> {
    pub json: T,
    pub key: SymmetricKey,
}

pub fn parse_meta(meta: &str) -> CryptoResult<SealedItem> {
    serde_json::from_str(meta).map_err(|e| CryptoError::format("item metadata", e.to_string()))
}

pub fn to_meta(item: &SealedItem) -> CryptoResult<String> {
    serde_json::to_string(item).map_err(|e| CryptoError::format("item metadata", e.to_string()))
}

pub struct ItemCodec<'a> {
    session: &'a Session,
    encrypter: Encrypter<'a>,
    decrypter: Decrypter<'a>,
}

impl<'a> ItemCodec<'a> {
    /// `directory` must be the storage service's directory.
    pub fn new(session: &'a Session, directory: &'a PublicKeyDirectory) -> Self {
        Self {
            session,
            encrypter: Encrypter::new(session, directory),
            decrypter: Decrypter::new(session, directory),
        }
    }

    async fn to_sealed_item(&self, sealed: &Sealed) -> CryptoResult<SealedItem> {
        Ok(SealedItem {
            s: STANDARD.encode(&sealed.signature),
            so: self.session.username().await?,
            iv: STANDARD.encode(sealed.iv),
            v: ITEM_VERSION,
            d: STANDARD.encode(&sealed.ciphertext),
        })
    }

    /// Seal `body` under a new random item key.
    pub async fn encrypt_new_item<T: Serialize + ?Sized>(
        &self,
        body: &T,
    ) -> CryptoResult<SealedNewItem> {
        let sealed = self.encrypter.seal(&to_json_bytes(body)?).await?;
        let meta = self.to_sealed_item(&sealed).await?;
        Ok(SealedNewItem {
            meta,
            key: sealed.session_key,
            wrapped_key: None,
        })
    }

    /// Seal `body` under a new item key and wrap that key to the owner, for
    /// items reachable without a parent (e.g. the root directory).
    pub async fn encrypt_new_item_assignment<T: Serialize + ?Sized>(
        &self,
        body: &T,
    ) -> CryptoResult<SealedNewItem> {
        let owner = self.session.username().await?;
        let mut item = self.encrypt_new_item(body).await?;
        let mut keys = self.encrypter.wrap_for(&item.key, &[owner]).await?;
        item.wrapped_key = keys.pop().map(|(_, k)| k);
        Ok(item)
    }

    /// Re-seal an updated body under its existing item key. A fresh IV is
    /// drawn on every update.
    pub async fn encrypt_existing_item<T: Serialize + ?Sized>(
        &self,
        key: &SymmetricKey,
        body: &T,
    ) -> CryptoResult<SealedItem> {
        let sealed = self
            .encrypter
            .seal_with_key(key.clone(), &to_json_bytes(body)?)
            .await?;
        self.to_sealed_item(&sealed).await
    }

    /// Share an existing item key with `recipients`.
    pub async fn encrypt_item_assignment(
        &self,
        key: &SymmetricKey,
        recipients: &[String],
    ) -> CryptoResult<Vec<ItemKeyGrant>> {
        let users = Recipients {
            to: recipients.to_vec(),
            ..Recipients::default()
        }
        .validate(false)?;

        let grants = self
            .encrypter
            .wrap_for(key, &users)
            .await?
            .into_iter()
            .map(|(username, wrapped)| ItemKeyGrant {
                username,
                key: STANDARD.encode(wrapped),
            })
            .collect::<Vec<_>>();
        debug!(grants = grants.len(), "item key shared");
        Ok(grants)
    }

    /// Verify the owner's signature and decrypt with a known item key.
    pub async fn decrypt_item<T: DeserializeOwned>(
        &self,
        meta: &SealedItem,
        key: &SymmetricKey,
    ) -> CryptoResult<T> {
        let iv = decode_iv("item metadata", &meta.iv)?;
        let ciphertext = STANDARD.decode(&meta.d)?;
        self.decrypter
            .verify(&meta.so, &ciphertext, &STANDARD.decode(&meta.s)?)
            .await?;
        let plaintext = self.decrypter.decrypt_with_key(key, &iv, &ciphertext)?;
        from_json_bytes(&plaintext)
    }

    /// Verify, unwrap the assigned item key, decrypt.
    pub async fn decrypt_item_assignment<T: DeserializeOwned>(
        &self,
        meta: &SealedItem,
        wrapped_key: &[u8],
    ) -> CryptoResult<OpenedAssignment<T>> {
        let opened = self
            .decrypter
            .open(
                &meta.so,
                wrapped_key,
                &decode_iv("item metadata", &meta.iv)?,
                &STANDARD.decode(&meta.d)?,
                &STANDARD.decode(&meta.s)?,
            )
            .await?;
        Ok(OpenedAssignment {
            json: from_json_bytes(&opened.plaintext)?,
            key: opened.session_key,
        })
    }
}
