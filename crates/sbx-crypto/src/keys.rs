//! Key material types: symmetric keys, RSA key import/export

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use sbx_core::types::Jwk;
use zeroize::{Zeroize, Zeroizing};

use crate::error::{CryptoError, CryptoResult};
use crate::provider::PrimitiveProvider;
use crate::KEY_SIZE;

/// A 256-bit symmetric key (IK, session key, part key). Zeroized on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey {
    bytes: [u8; KEY_SIZE],
}

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            CryptoError::format(
                "key",
                format!("expected {KEY_SIZE} bytes, got {}", bytes.len()),
            )
        })?;
        Ok(Self { bytes })
    }

    /// Generate a fresh random key.
    pub fn generate(provider: &dyn PrimitiveProvider) -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        provider.random_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    pub fn from_hex(s: &str) -> CryptoResult<Self> {
        let decoded = Zeroizing::new(
            hex::decode(s).map_err(|e| CryptoError::format("hex key", e.to_string()))?,
        );
        Self::from_slice(&decoded)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    pub fn from_base64(s: &str) -> CryptoResult<Self> {
        let decoded = Zeroizing::new(STANDARD.decode(s)?);
        Self::from_slice(&decoded)
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.bytes)
    }
}

impl Drop for SymmetricKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymmetricKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// What a published public key is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyUse {
    /// RSA-OAEP-256 key wrapping
    Encrypt,
    /// RSASSA-PKCS1-v1_5 SHA-256 verification
    Verify,
}

impl KeyUse {
    fn alg(self) -> &'static str {
        match self {
            KeyUse::Encrypt => "RSA-OAEP-256",
            KeyUse::Verify => "RS256",
        }
    }

    fn op(self) -> &'static str {
        match self {
            KeyUse::Encrypt => "encrypt",
            KeyUse::Verify => "verify",
        }
    }
}

/// Export an RSA public key as a JWK.
pub fn public_key_to_jwk(key: &RsaPublicKey, usage: KeyUse) -> Jwk {
    Jwk {
        kty: "RSA".into(),
        alg: usage.alg().into(),
        n: URL_SAFE_NO_PAD.encode(key.n().to_bytes_be()),
        e: URL_SAFE_NO_PAD.encode(key.e().to_bytes_be()),
        ext: true,
        key_ops: vec![usage.op().into()],
    }
}

/// Import an RSA public key from a JWK.
pub fn jwk_to_public_key(jwk: &Jwk) -> CryptoResult<RsaPublicKey> {
    if jwk.kty != "RSA" {
        return Err(CryptoError::format("jwk", format!("unsupported kty {:?}", jwk.kty)));
    }
    let n = URL_SAFE_NO_PAD
        .decode(jwk.n.trim_end_matches('='))
        .map_err(|e| CryptoError::format("jwk", format!("modulus: {e}")))?;
    let e = URL_SAFE_NO_PAD
        .decode(jwk.e.trim_end_matches('='))
        .map_err(|e| CryptoError::format("jwk", format!("exponent: {e}")))?;

    RsaPublicKey::new(BigUint::from_bytes_be(&n), BigUint::from_bytes_be(&e))
        .map_err(|e| CryptoError::format("jwk", e.to_string()))
}

/// Serialize a private key for wrapping (PKCS#8 DER).
pub fn private_key_to_der(key: &RsaPrivateKey) -> CryptoResult<Zeroizing<Vec<u8>>> {
    let doc = key
        .to_pkcs8_der()
        .map_err(|e| CryptoError::Primitive(format!("PKCS#8 export: {e}")))?;
    Ok(Zeroizing::new(doc.as_bytes().to_vec()))
}

/// Parse an unwrapped private key. Garbage here means the wrapping key was wrong.
pub fn private_key_from_der(der: &[u8]) -> CryptoResult<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs8_der(der)
        .map_err(|_| CryptoError::Unwrap("unwrapped private key is not valid PKCS#8".into()))
}
