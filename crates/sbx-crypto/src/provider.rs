//! Cryptographic primitive provider
//!
//! Everything above this module talks to a `dyn PrimitiveProvider` only. The
//! provider is chosen once at startup by [`detect`] and shared as an `Arc`.
//!
//! Primitives are synchronous CPU work. Async callers push the expensive ones
//! (PBKDF2, RSA key generation, RSA private-key operations) onto the blocking
//! pool through [`offload`] so the runtime is never stalled.

use std::sync::{Arc, Mutex};

use aes::Aes256;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use tracing::info;

use crate::error::{CryptoError, CryptoResult};
use crate::{IV_SIZE, MAC_SIZE};

type HmacSha256 = Hmac<Sha256>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// The capability set every engine must provide.
pub trait PrimitiveProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fill `out` from a CSPRNG.
    fn random_bytes(&self, out: &mut [u8]);

    /// AES-256-CBC with PKCS#7 padding.
    fn aes_cbc_encrypt(
        &self,
        key: &[u8],
        iv: &[u8; IV_SIZE],
        plaintext: &[u8],
    ) -> CryptoResult<Vec<u8>>;

    /// Inverse of [`aes_cbc_encrypt`](Self::aes_cbc_encrypt). Bad padding is a `Decrypt` error.
    fn aes_cbc_decrypt(
        &self,
        key: &[u8],
        iv: &[u8; IV_SIZE],
        ciphertext: &[u8],
    ) -> CryptoResult<Vec<u8>>;

    fn hmac_sha256(&self, key: &[u8], data: &[u8]) -> CryptoResult<[u8; MAC_SIZE]>;

    /// Constant-time tag comparison.
    fn hmac_sha256_verify(&self, key: &[u8], data: &[u8], tag: &[u8]) -> CryptoResult<bool>;

    fn pbkdf2_sha256(&self, password: &[u8], salt: &[u8], rounds: u32, out: &mut [u8]);

    fn generate_rsa_key(&self, modulus_bits: usize) -> CryptoResult<RsaPrivateKey>;

    /// RSA-OAEP with SHA-256 (MGF1-SHA-256).
    fn rsa_oaep_encrypt(&self, key: &RsaPublicKey, data: &[u8]) -> CryptoResult<Vec<u8>>;

    /// Failure here means the wrapped key was not meant for `key` (`Unwrap`).
    fn rsa_oaep_decrypt(&self, key: &RsaPrivateKey, data: &[u8]) -> CryptoResult<Vec<u8>>;

    /// RSASSA-PKCS1-v1_5 with SHA-256.
    fn rsa_sign(&self, key: &RsaPrivateKey, data: &[u8]) -> CryptoResult<Vec<u8>>;

    fn rsa_verify(&self, key: &RsaPublicKey, data: &[u8], signature: &[u8]) -> CryptoResult<bool>;

    /// Wrap key material under a symmetric key.
    fn wrap_key(
        &self,
        wrapping_key: &[u8],
        iv: &[u8; IV_SIZE],
        key: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        self.aes_cbc_encrypt(wrapping_key, iv, key)
    }

    /// Unwrap key material. Any failure is reported as `Unwrap`.
    fn unwrap_key(
        &self,
        wrapping_key: &[u8],
        iv: &[u8; IV_SIZE],
        wrapped: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        self.aes_cbc_decrypt(wrapping_key, iv, wrapped)
            .map_err(|_| CryptoError::Unwrap("invalid wrapping key or corrupted data".into()))
    }
}

/// CPU features relevant to the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// AES instructions available (AES-NI / ARMv8 AES)
    pub aes_hw: bool,
}

impl Capabilities {
    pub fn from_host() -> Self {
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        let aes_hw = std::arch::is_x86_feature_detected!("aes");
        #[cfg(target_arch = "aarch64")]
        let aes_hw = std::arch::is_aarch64_feature_detected!("aes");
        #[cfg(not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64")))]
        let aes_hw = false;

        Self { aes_hw }
    }
}

/// Inspect the CPU once and build the shared provider.
pub fn detect() -> Arc<dyn PrimitiveProvider> {
    let caps = Capabilities::from_host();
    let provider = RustCryptoProvider::with_capabilities(caps);
    info!(
        provider = provider.name(),
        aes_hw = caps.aes_hw,
        "crypto provider selected"
    );
    Arc::new(provider)
}

/// RustCrypto engine. The `aes` crate dispatches to hardware instructions at
/// runtime when [`Capabilities::aes_hw`] is set and to its constant-time
/// software implementation otherwise.
#[derive(Debug, Clone, Default)]
pub struct RustCryptoProvider {
    caps: Capabilities,
}

impl RustCryptoProvider {
    pub fn new() -> Self {
        Self::with_capabilities(Capabilities::from_host())
    }

    pub fn with_capabilities(caps: Capabilities) -> Self {
        Self { caps }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }
}

impl PrimitiveProvider for RustCryptoProvider {
    fn name(&self) -> &'static str {
        if self.caps.aes_hw {
            "rustcrypto-aesni"
        } else {
            "rustcrypto-soft"
        }
    }

    fn random_bytes(&self, out: &mut [u8]) {
        rand::thread_rng().fill_bytes(out);
    }

    fn aes_cbc_encrypt(
        &self,
        key: &[u8],
        iv: &[u8; IV_SIZE],
        plaintext: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        let cipher = Aes256CbcEnc::new_from_slices(key, iv)
            .map_err(|e| CryptoError::Primitive(format!("AES-CBC key setup: {e}")))?;
        Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
    }

    fn aes_cbc_decrypt(
        &self,
        key: &[u8],
        iv: &[u8; IV_SIZE],
        ciphertext: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        if ciphertext.is_empty() || ciphertext.len() % IV_SIZE != 0 {
            return Err(CryptoError::Decrypt(format!(
                "ciphertext length {} is not a positive multiple of the block size",
                ciphertext.len()
            )));
        }
        let cipher = Aes256CbcDec::new_from_slices(key, iv)
            .map_err(|e| CryptoError::Primitive(format!("AES-CBC key setup: {e}")))?;
        cipher
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| {
                CryptoError::Decrypt("bad padding: wrong key, IV, or corrupted data".into())
            })
    }

    fn hmac_sha256(&self, key: &[u8], data: &[u8]) -> CryptoResult<[u8; MAC_SIZE]> {
        let mut mac = HmacSha256::new_from_slice(key)
            .map_err(|e| CryptoError::Primitive(format!("HMAC key setup: {e}")))?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().into())
    }

    fn hmac_sha256_verify(&self, key: &[u8], data: &[u8], tag: &[u8]) -> CryptoResult<bool> {
        let mut mac = HmacSha256::new_from_slice(key)
            .map_err(|e| CryptoError::Primitive(format!("HMAC key setup: {e}")))?;
        mac.update(data);
        Ok(mac.verify_slice(tag).is_ok())
    }

    fn pbkdf2_sha256(&self, password: &[u8], salt: &[u8], rounds: u32, out: &mut [u8]) {
        pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, rounds, out);
    }

    fn generate_rsa_key(&self, modulus_bits: usize) -> CryptoResult<RsaPrivateKey> {
        RsaPrivateKey::new(&mut rand::thread_rng(), modulus_bits)
            .map_err(|e| CryptoError::Primitive(format!("RSA key generation: {e}")))
    }

    fn rsa_oaep_encrypt(&self, key: &RsaPublicKey, data: &[u8]) -> CryptoResult<Vec<u8>> {
        key.encrypt(&mut rand::thread_rng(), Oaep::new::<Sha256>(), data)
            .map_err(|e| CryptoError::Primitive(format!("RSA-OAEP encrypt: {e}")))
    }

    fn rsa_oaep_decrypt(&self, key: &RsaPrivateKey, data: &[u8]) -> CryptoResult<Vec<u8>> {
        key.decrypt(Oaep::new::<Sha256>(), data)
            .map_err(|_| {
                CryptoError::Unwrap("session key not addressed to this private key".into())
            })
    }

    fn rsa_sign(&self, key: &RsaPrivateKey, data: &[u8]) -> CryptoResult<Vec<u8>> {
        let signing_key = SigningKey::<Sha256>::new(key.clone());
        let signature = signing_key
            .try_sign(data)
            .map_err(|e| CryptoError::Primitive(format!("RSA sign: {e}")))?;
        Ok(signature.to_vec())
    }

    fn rsa_verify(&self, key: &RsaPublicKey, data: &[u8], signature: &[u8]) -> CryptoResult<bool> {
        let verifying_key = VerifyingKey::<Sha256>::new(key.clone());
        let Ok(signature) = Signature::try_from(signature) else {
            return Ok(false);
        };
        Ok(verifying_key.verify(data, &signature).is_ok())
    }
}

/// Decorator that records every primitive invoked on the inner provider, in order.
///
/// Lets callers assert pipeline ordering, e.g. that no RSA operation ran
/// before a recipient check or that nothing was decrypted after a failed
/// signature verification.
pub struct RecordingProvider<P> {
    inner: P,
    calls: Mutex<Vec<&'static str>>,
}

impl<P: PrimitiveProvider> RecordingProvider<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Every call so far, oldest first.
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls().iter().filter(|c| **c == op).count()
    }

    pub fn reset(&self) {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    fn record(&self, op: &'static str) {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).push(op);
    }
}

impl<P: PrimitiveProvider> PrimitiveProvider for RecordingProvider<P> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn random_bytes(&self, out: &mut [u8]) {
        self.record("random_bytes");
        self.inner.random_bytes(out)
    }

    fn aes_cbc_encrypt(
        &self,
        key: &[u8],
        iv: &[u8; IV_SIZE],
        plaintext: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        self.record("aes_cbc_encrypt");
        self.inner.aes_cbc_encrypt(key, iv, plaintext)
    }

    fn aes_cbc_decrypt(
        &self,
        key: &[u8],
        iv: &[u8; IV_SIZE],
        ciphertext: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        self.record("aes_cbc_decrypt");
        self.inner.aes_cbc_decrypt(key, iv, ciphertext)
    }

    fn hmac_sha256(&self, key: &[u8], data: &[u8]) -> CryptoResult<[u8; MAC_SIZE]> {
        self.record("hmac_sha256");
        self.inner.hmac_sha256(key, data)
    }

    fn hmac_sha256_verify(&self, key: &[u8], data: &[u8], tag: &[u8]) -> CryptoResult<bool> {
        self.record("hmac_sha256_verify");
        self.inner.hmac_sha256_verify(key, data, tag)
    }

    fn pbkdf2_sha256(&self, password: &[u8], salt: &[u8], rounds: u32, out: &mut [u8]) {
        self.record("pbkdf2_sha256");
        self.inner.pbkdf2_sha256(password, salt, rounds, out)
    }

    fn generate_rsa_key(&self, modulus_bits: usize) -> CryptoResult<RsaPrivateKey> {
        self.record("generate_rsa_key");
        self.inner.generate_rsa_key(modulus_bits)
    }

    fn rsa_oaep_encrypt(&self, key: &RsaPublicKey, data: &[u8]) -> CryptoResult<Vec<u8>> {
        self.record("rsa_oaep_encrypt");
        self.inner.rsa_oaep_encrypt(key, data)
    }

    fn rsa_oaep_decrypt(&self, key: &RsaPrivateKey, data: &[u8]) -> CryptoResult<Vec<u8>> {
        self.record("rsa_oaep_decrypt");
        self.inner.rsa_oaep_decrypt(key, data)
    }

    fn rsa_sign(&self, key: &RsaPrivateKey, data: &[u8]) -> CryptoResult<Vec<u8>> {
        self.record("rsa_sign");
        self.inner.rsa_sign(key, data)
    }

    fn rsa_verify(&self, key: &RsaPublicKey, data: &[u8], signature: &[u8]) -> CryptoResult<bool> {
        self.record("rsa_verify");
        self.inner.rsa_verify(key, data, signature)
    }
}

/// Run CPU-bound primitive work on the blocking pool.
pub(crate) async fn offload<T, F>(provider: &Arc<dyn PrimitiveProvider>, work: F) -> CryptoResult<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn PrimitiveProvider) -> CryptoResult<T> + Send + 'static,
{
    let provider = Arc::clone(provider);
    tokio::task::spawn_blocking(move || work(provider.as_ref()))
        .await
        .map_err(|e| CryptoError::Primitive(format!("blocking task failed: {e}")))?
}
