//! Envelope codec: encrypt-then-sign, per-recipient key fan-out, verify-then-decrypt
//!
//! Every envelope follows the same pipeline:
//!
//! ```text
//! encrypt: check recipients → session key → AES-CBC(payload) → sign(ciphertext)
//!          → OAEP(session key) per recipient
//! decrypt: verify(ciphertext, signature) → OAEP⁻¹(session key) → AES-CBC⁻¹ → deserialize
//! ```
//!
//! Verification always runs first; nothing is decrypted for an envelope whose
//! signature does not check out.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use sbx_core::types::MessageUpload;

use crate::directory::{normalize_username, KeyType, PublicKeyDirectory};
use crate::error::{CryptoError, CryptoResult};
use crate::keys::SymmetricKey;
use crate::keystore::Session;
use crate::provider::{offload, PrimitiveProvider};
use crate::wire::{decode_iv, ChatEnvelope, MessageBlob, RecipientKey, SignatureEnvelope};
use crate::{IV_SIZE, KEY_SIZE, MAX_RECIPIENTS};

/// Addressing of one message. Entries may be full addresses or bare usernames.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipients {
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    #[serde(default)]
    pub from: Vec<String>,
}

impl Recipients {
    pub fn new(to: Vec<String>, from: impl Into<String>) -> Self {
        Self {
            to,
            from: vec![from.into()],
            ..Self::default()
        }
    }

    fn distinct<'a>(lists: impl IntoIterator<Item = &'a Vec<String>>) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for name in lists.into_iter().flatten().map(|e| normalize_username(e)) {
            if !name.is_empty() && !out.contains(&name) {
                out.push(name);
            }
        }
        out
    }

    /// Distinct addressees in to, cc and bcc.
    pub fn addressed(&self) -> Vec<String> {
        Self::distinct([&self.to, &self.cc, &self.bcc])
    }

    /// Everyone who gets a wrapped session key. In plain mode only the
    /// sender keeps a decryptable copy.
    pub fn key_holders(&self, plain_mode: bool) -> Vec<String> {
        if plain_mode {
            return Self::distinct(std::iter::once(&self.from))
                .into_iter()
                .take(1)
                .collect();
        }
        Self::distinct([&self.to, &self.cc, &self.bcc, &self.from])
    }

    /// Fail-fast recipient checks, run before any crypto or network work.
    pub fn validate(&self, plain_mode: bool) -> CryptoResult<Vec<String>> {
        let addressed = self.addressed();
        if addressed.len() > MAX_RECIPIENTS {
            return Err(CryptoError::TooManyRecipients {
                count: addressed.len(),
                max: MAX_RECIPIENTS,
            });
        }
        if !plain_mode && addressed.is_empty() {
            return Err(CryptoError::NoRecipients);
        }
        let holders = self.key_holders(plain_mode);
        if holders.is_empty() {
            return Err(CryptoError::NoRecipients);
        }
        Ok(holders)
    }
}

/// An encrypted payload plus one wrapped session key per key holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    /// `(username, OAEP-wrapped session key)`
    pub keys: Vec<(String, Vec<u8>)>,
    pub iv: [u8; IV_SIZE],
    pub ciphertext: Vec<u8>,
    pub signature: Vec<u8>,
}

impl MessageEnvelope {
    pub fn key_for(&self, username: &str) -> Option<&[u8]> {
        let username = normalize_username(username);
        self.keys
            .iter()
            .find(|(u, _)| *u == username)
            .map(|(_, k)| k.as_slice())
    }

    /// The blob as `username` would fetch it, with their key in the key slot.
    pub fn for_recipient(&self, username: &str) -> CryptoResult<MessageBlob> {
        let key = self
            .key_for(username)
            .ok_or_else(|| CryptoError::Unwrap(format!("no session key addressed to {username}")))?;
        Ok(MessageBlob {
            key: key.to_vec(),
            signature: self.signature.clone(),
            iv: self.iv,
            ciphertext: self.ciphertext.clone(),
        })
    }

    /// Server-bound blob: the key slot is zero-filled at modulus length and
    /// filled in per recipient when fetched.
    pub fn server_blob(&self) -> CryptoResult<Vec<u8>> {
        let slot = self.keys.first().map(|(_, k)| k.len()).unwrap_or_default();
        MessageBlob {
            key: vec![0u8; slot],
            signature: self.signature.clone(),
            iv: self.iv,
            ciphertext: self.ciphertext.clone(),
        }
        .to_bytes()
    }

    pub fn upload(&self, recipients: &Recipients) -> CryptoResult<MessageUpload> {
        Ok(MessageUpload {
            recipients: serde_json::to_string(recipients)
                .map_err(|e| CryptoError::format("recipients", e.to_string()))?,
            blob: self.server_blob()?,
            keys: self.keys.clone(),
        })
    }

    pub fn recipient_keys(&self) -> Vec<RecipientKey> {
        self.keys
            .iter()
            .map(|(u, k)| RecipientKey {
                u: u.clone(),
                k: STANDARD.encode(k),
            })
            .collect()
    }

    pub fn to_chat(&self) -> ChatEnvelope {
        ChatEnvelope {
            m: STANDARD.encode(&self.ciphertext),
            iv: STANDARD.encode(self.iv),
            s: STANDARD.encode(&self.signature),
            keys: self.recipient_keys(),
        }
    }

    pub fn to_signature_envelope(&self) -> CryptoResult<SignatureEnvelope> {
        let (_, key) = self.keys.first().ok_or(CryptoError::NoRecipients)?;
        Ok(SignatureEnvelope {
            m: STANDARD.encode(&self.ciphertext),
            iv: STANDARD.encode(self.iv),
            s: STANDARD.encode(&self.signature),
            k: STANDARD.encode(key),
        })
    }
}

/// Ciphertext and signature under a session key, before any key wrapping.
pub(crate) struct Sealed {
    pub session_key: SymmetricKey,
    pub iv: [u8; IV_SIZE],
    pub ciphertext: Vec<u8>,
    pub signature: Vec<u8>,
}

pub(crate) fn to_json_bytes<T: Serialize + ?Sized>(payload: &T) -> CryptoResult<Vec<u8>> {
    serde_json::to_vec(payload).map_err(|e| CryptoError::format("payload", e.to_string()))
}

pub(crate) fn from_json_bytes<T: DeserializeOwned>(bytes: &[u8]) -> CryptoResult<T> {
    serde_json::from_slice(bytes).map_err(|e| CryptoError::format("payload", e.to_string()))
}

/// Encrypt side of the codec for one service's key store.
pub struct Encrypter<'a> {
    session: &'a Session,
    directory: &'a PublicKeyDirectory,
}

impl<'a> Encrypter<'a> {
    pub fn new(session: &'a Session, directory: &'a PublicKeyDirectory) -> Self {
        Self { session, directory }
    }

    fn provider(&self) -> &dyn PrimitiveProvider {
        self.session.provider().as_ref()
    }

    fn service(&self) -> &str {
        self.directory.service()
    }

    /// Encrypt under `session_key` with a fresh IV and sign the ciphertext.
    pub(crate) async fn seal_with_key(
        &self,
        session_key: SymmetricKey,
        plaintext: &[u8],
    ) -> CryptoResult<Sealed> {
        let mut iv = [0u8; IV_SIZE];
        self.provider().random_bytes(&mut iv);
        let ciphertext = self
            .provider()
            .aes_cbc_encrypt(session_key.as_bytes(), &iv, plaintext)?;

        let sign_key = self.session.private_sign_key(self.service()).await?;
        let (ciphertext, signature) = offload(self.session.provider(), move |p| {
            let signature = p.rsa_sign(&sign_key, &ciphertext)?;
            Ok((ciphertext, signature))
        })
        .await?;

        Ok(Sealed {
            session_key,
            iv,
            ciphertext,
            signature,
        })
    }

    pub(crate) async fn seal(&self, plaintext: &[u8]) -> CryptoResult<Sealed> {
        let session_key = SymmetricKey::generate(self.provider());
        self.seal_with_key(session_key, plaintext).await
    }

    /// OAEP-wrap `session_key` for each user.
    pub(crate) async fn wrap_for(
        &self,
        session_key: &SymmetricKey,
        users: &[String],
    ) -> CryptoResult<Vec<(String, Vec<u8>)>> {
        let mut keys = Vec::with_capacity(users.len());
        for user in users {
            let lookup = self.directory.get_public_key(user, KeyType::Encrypt).await;
            let public = self.session.observe_with(&[self.directory], lookup).await?;
            let wrapped = self
                .provider()
                .rsa_oaep_encrypt(&public, session_key.as_bytes())?;
            keys.push((user.clone(), wrapped));
        }
        Ok(keys)
    }

    /// Resolve every key holder before any crypto runs, so an unknown
    /// recipient fails the send without a wasted signature.
    async fn prefetch(&self, users: &[String]) -> CryptoResult<()> {
        for chunk in users.chunks(self.directory.max_batch()) {
            let fetched = self.directory.get_recipients_public_keys(chunk).await;
            self.session.observe_with(&[self.directory], fetched).await?;
        }
        for user in users {
            let resolved = self.directory.lookup(user).await;
            self.session.observe_with(&[self.directory], resolved).await?;
        }
        Ok(())
    }

    /// Encrypt `payload` for every key holder of `recipients`.
    pub async fn encrypt<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        recipients: &Recipients,
        plain_mode: bool,
    ) -> CryptoResult<MessageEnvelope> {
        let holders = recipients.validate(plain_mode)?;
        self.prefetch(&holders).await?;

        let sealed = self.seal(&to_json_bytes(payload)?).await?;
        let keys = self.wrap_for(&sealed.session_key, &holders).await?;
        debug!(recipients = keys.len(), bytes = sealed.ciphertext.len(), "envelope sealed");

        Ok(MessageEnvelope {
            keys,
            iv: sealed.iv,
            ciphertext: sealed.ciphertext,
            signature: sealed.signature,
        })
    }

    /// Chat message: the sender and every participant get a key inline.
    pub async fn encrypt_chat<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        participants: &[String],
    ) -> CryptoResult<ChatEnvelope> {
        let own = self.session.username().await?;
        let recipients = Recipients::new(participants.to_vec(), own);
        Ok(self.encrypt(payload, &recipients, false).await?.to_chat())
    }

    /// Single-recipient envelope `{m, iv, s, k}`.
    pub async fn encrypt_signature<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        recipient: &str,
    ) -> CryptoResult<SignatureEnvelope> {
        let recipients = Recipients {
            from: vec![recipient.to_owned()],
            ..Recipients::default()
        };
        self.encrypt(payload, &recipients, true)
            .await?
            .to_signature_envelope()
    }

    /// Sign an outgoing request body with the service signing key (hex).
    pub async fn sign_request(&self, body: &[u8]) -> CryptoResult<String> {
        let sign_key = self.session.private_sign_key(self.service()).await?;
        let body = body.to_vec();
        let signature =
            offload(self.session.provider(), move |p| p.rsa_sign(&sign_key, &body)).await?;
        Ok(hex::encode(signature))
    }
}

/// Result of opening an envelope, with the session key for callers that
/// need to re-use it (item assignments).
pub(crate) struct Opened {
    pub session_key: SymmetricKey,
    pub plaintext: Vec<u8>,
}

/// One inbox entry for [`Decrypter::decrypt_batch`].
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub id: String,
    pub sender: String,
    /// Message blob as fetched (own key in the key slot)
    pub blob: Vec<u8>,
}

/// Per-item outcome of a batch decrypt. Failed items carry a placeholder
/// payload with a `subject` explaining the failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecryptedItem {
    pub id: String,
    pub failed: bool,
    pub payload: serde_json::Value,
}

impl DecryptedItem {
    fn failure(id: &str, error: &CryptoError) -> Self {
        let subject = match error {
            CryptoError::Verification
            | CryptoError::Unwrap(_)
            | CryptoError::DirectoryLookup { .. } => "Incorrect key!!",
            CryptoError::Decrypt(_) => "Could not decrypt message!!",
            _ => "Something went wrong!!",
        };
        Self {
            id: id.to_owned(),
            failed: true,
            payload: json!({ "subject": subject }),
        }
    }
}

/// Decrypt side of the codec for one service's key store.
pub struct Decrypter<'a> {
    session: &'a Session,
    directory: &'a PublicKeyDirectory,
}

impl<'a> Decrypter<'a> {
    pub fn new(session: &'a Session, directory: &'a PublicKeyDirectory) -> Self {
        Self { session, directory }
    }

    fn provider(&self) -> &dyn PrimitiveProvider {
        self.session.provider().as_ref()
    }

    fn service(&self) -> &str {
        self.directory.service()
    }

    /// Check `signature` over `ciphertext` against `sender`'s verify key.
    pub(crate) async fn verify(
        &self,
        sender: &str,
        ciphertext: &[u8],
        signature: &[u8],
    ) -> CryptoResult<()> {
        let lookup = self.directory.get_public_key(sender, KeyType::Verify).await;
        let verify_key = self.session.observe_with(&[self.directory], lookup).await?;
        if !self.provider().rsa_verify(&verify_key, ciphertext, signature)? {
            warn!(sender, "signature verification failed");
            return Err(CryptoError::Verification);
        }
        Ok(())
    }

    /// Decrypt with a known session key. Any cipher failure is `Decrypt`.
    pub(crate) fn decrypt_with_key(
        &self,
        session_key: &SymmetricKey,
        iv: &[u8; IV_SIZE],
        ciphertext: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        self.provider()
            .aes_cbc_decrypt(session_key.as_bytes(), iv, ciphertext)
            .map_err(|e| match e {
                CryptoError::Decrypt(reason) => CryptoError::Decrypt(reason),
                other => CryptoError::Decrypt(other.to_string()),
            })
    }

    /// OAEP-unwrap a session key with this service's private decryption key.
    pub(crate) async fn unwrap_session_key(&self, wrapped: &[u8]) -> CryptoResult<SymmetricKey> {
        let private = self.session.private_decryption_key(self.service()).await?;
        let wrapped = wrapped.to_vec();
        let raw = offload(self.session.provider(), move |p| {
            p.rsa_oaep_decrypt(&private, &wrapped).map(zeroize::Zeroizing::new)
        })
        .await?;
        if raw.len() != KEY_SIZE {
            return Err(CryptoError::Unwrap(format!(
                "session key is {} bytes, expected {KEY_SIZE}",
                raw.len()
            )));
        }
        SymmetricKey::from_slice(&raw)
    }

    /// The full verify → unwrap → decrypt pipeline.
    pub(crate) async fn open(
        &self,
        sender: &str,
        wrapped_key: &[u8],
        iv: &[u8; IV_SIZE],
        ciphertext: &[u8],
        signature: &[u8],
    ) -> CryptoResult<Opened> {
        self.verify(sender, ciphertext, signature).await?;
        let session_key = self.unwrap_session_key(wrapped_key).await?;
        let plaintext = self.decrypt_with_key(&session_key, iv, ciphertext)?;
        Ok(Opened {
            session_key,
            plaintext,
        })
    }

    /// Decrypt a fetched message blob from `sender`.
    pub async fn decrypt_blob<T: DeserializeOwned>(
        &self,
        blob: &MessageBlob,
        sender: &str,
    ) -> CryptoResult<T> {
        let opened = self
            .open(sender, &blob.key, &blob.iv, &blob.ciphertext, &blob.signature)
            .await?;
        from_json_bytes(&opened.plaintext)
    }

    pub async fn decrypt_message<T: DeserializeOwned>(
        &self,
        blob: &[u8],
        sender: &str,
    ) -> CryptoResult<T> {
        self.decrypt_blob(&MessageBlob::from_bytes(blob)?, sender).await
    }

    pub async fn decrypt_chat<T: DeserializeOwned>(
        &self,
        envelope: &ChatEnvelope,
        sender: &str,
    ) -> CryptoResult<T> {
        let own = self.session.username().await?;
        let key = envelope
            .key_for(&own)
            .ok_or_else(|| CryptoError::Unwrap(format!("no session key addressed to {own}")))?;

        let opened = self
            .open(
                sender,
                &STANDARD.decode(key)?,
                &decode_iv("chat envelope", &envelope.iv)?,
                &STANDARD.decode(&envelope.m)?,
                &STANDARD.decode(&envelope.s)?,
            )
            .await?;
        from_json_bytes(&opened.plaintext)
    }

    pub async fn decrypt_signature<T: DeserializeOwned>(
        &self,
        envelope: &SignatureEnvelope,
        sender: &str,
    ) -> CryptoResult<T> {
        let opened = self
            .open(
                sender,
                &STANDARD.decode(&envelope.k)?,
                &decode_iv("signature envelope", &envelope.iv)?,
                &STANDARD.decode(&envelope.m)?,
                &STANDARD.decode(&envelope.s)?,
            )
            .await?;
        from_json_bytes(&opened.plaintext)
    }

    async fn decrypt_tolerant(&self, item: &BatchItem) -> DecryptedItem {
        match self.decrypt_message::<serde_json::Value>(&item.blob, &item.sender).await {
            Ok(payload) => DecryptedItem {
                id: item.id.clone(),
                failed: false,
                payload,
            },
            Err(e) => {
                warn!(id = %item.id, error = %e, "batch item failed");
                DecryptedItem::failure(&item.id, &e)
            }
        }
    }

    /// Decrypt many envelopes concurrently. One bad envelope yields one
    /// failed item; it never fails the batch. Output order follows input.
    pub async fn decrypt_batch(&self, items: &[BatchItem]) -> Vec<DecryptedItem> {
        let results = join_all(items.iter().map(|item| self.decrypt_tolerant(item))).await;
        let failed = results.iter().filter(|r| r.failed).count();
        debug!(total = results.len(), failed, "batch decrypted");
        results
    }
}

// ── Attachments ───────────────────────────────────────────────────────────────

/// An attachment sealed under a random key and authenticated with HMAC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedAttachment {
    /// `[16 iv][ciphertext]`
    pub blob: Vec<u8>,
    /// AES/HMAC key, hex
    pub key: String,
    /// HMAC-SHA256 over the ciphertext, hex
    pub hmac: String,
}

pub fn encrypt_attachment(
    provider: &dyn PrimitiveProvider,
    data: &[u8],
) -> CryptoResult<EncryptedAttachment> {
    let key = SymmetricKey::generate(provider);
    let mut iv = [0u8; IV_SIZE];
    provider.random_bytes(&mut iv);

    let ciphertext = provider.aes_cbc_encrypt(key.as_bytes(), &iv, data)?;
    let mac = provider.hmac_sha256(key.as_bytes(), &ciphertext)?;

    let mut blob = Vec::with_capacity(IV_SIZE + ciphertext.len());
    blob.extend_from_slice(&iv);
    blob.extend_from_slice(&ciphertext);
    Ok(EncryptedAttachment {
        blob,
        key: key.to_hex(),
        hmac: hex::encode(mac),
    })
}

/// Verify the attachment HMAC, then decrypt.
pub fn decrypt_attachment(
    provider: &dyn PrimitiveProvider,
    blob: &[u8],
    key_hex: &str,
    hmac_hex: &str,
) -> CryptoResult<Vec<u8>> {
    if blob.len() <= IV_SIZE {
        return Err(CryptoError::format("attachment", "blob shorter than one IV"));
    }
    let key = SymmetricKey::from_hex(key_hex)?;
    let tag = hex::decode(hmac_hex)
        .map_err(|e| CryptoError::format("attachment hmac", e.to_string()))?;
    let (iv, ciphertext) = blob.split_at(IV_SIZE);

    if !provider.hmac_sha256_verify(key.as_bytes(), ciphertext, &tag)? {
        return Err(CryptoError::Verification);
    }
    let iv: [u8; IV_SIZE] = iv
        .try_into()
        .map_err(|_| CryptoError::format("attachment", "bad IV"))?;
    provider.aes_cbc_decrypt(key.as_bytes(), &iv, ciphertext)
}
