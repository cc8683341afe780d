//! Wire formats: wrapped-IK blob, private key bundle, message blob, JSON envelopes
//!
//! Binary length prefixes are little-endian `u16`.
//!
//! ```text
//! wrapped IK:      [16 iv][wrapped IK]
//! private bundle:  [u16 len(pdk)][16 ivPDK][16 ivPSK][wrapped pdk][wrapped psk]
//! message blob:    [u16 keyLen][u16 sigLen][key][signature][16 iv][ciphertext]
//! ```

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{CryptoError, CryptoResult};
use crate::IV_SIZE;

fn read_u16(data: &[u8], at: usize) -> Option<usize> {
    data.get(at..at + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]) as usize)
}

fn length_prefix(what: &'static str, len: usize) -> CryptoResult<[u8; 2]> {
    u16::try_from(len)
        .map(u16::to_le_bytes)
        .map_err(|_| CryptoError::format(what, format!("field of {len} bytes exceeds u16 prefix")))
}

fn take_iv(what: &'static str, bytes: &[u8]) -> CryptoResult<[u8; IV_SIZE]> {
    bytes
        .try_into()
        .map_err(|_| {
            CryptoError::format(what, format!("IV must be {IV_SIZE} bytes, got {}", bytes.len()))
        })
}

/// Decode a base64 IV from a JSON envelope field.
pub fn decode_iv(what: &'static str, b64: &str) -> CryptoResult<[u8; IV_SIZE]> {
    let bytes = STANDARD.decode(b64)?;
    take_iv(what, &bytes)
}

// ── Wrapped intermediate key ──────────────────────────────────────────────────

/// The IK wrapped under the mail key. Stored server-side, returned as `iak`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedIntermediateKey {
    pub iv: [u8; IV_SIZE],
    pub wrapped: Vec<u8>,
}

impl WrappedIntermediateKey {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(IV_SIZE + self.wrapped.len());
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.wrapped);
        out
    }

    pub fn from_bytes(data: &[u8]) -> CryptoResult<Self> {
        if data.len() <= IV_SIZE {
            return Err(CryptoError::format(
                "wrapped IK",
                format!("{} bytes is too short", data.len()),
            ));
        }
        let (iv, wrapped) = data.split_at(IV_SIZE);
        Ok(Self {
            iv: take_iv("wrapped IK", iv)?,
            wrapped: wrapped.to_vec(),
        })
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.to_bytes())
    }

    pub fn from_base64(s: &str) -> CryptoResult<Self> {
        Self::from_bytes(&STANDARD.decode(s)?)
    }
}

// ── Private key bundle ────────────────────────────────────────────────────────

/// Both private keys of one service, each wrapped under the IK with its own IV.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateKeyBundle {
    pub iv_pdk: [u8; IV_SIZE],
    pub iv_psk: [u8; IV_SIZE],
    /// Wrapped private decryption key
    pub wrapped_pdk: Vec<u8>,
    /// Wrapped private signing key
    pub wrapped_psk: Vec<u8>,
}

impl PrivateKeyBundle {
    const HEADER: usize = 2 + 2 * IV_SIZE;

    pub fn to_bytes(&self) -> CryptoResult<Vec<u8>> {
        let prefix = length_prefix("private key bundle", self.wrapped_pdk.len())?;
        let mut out =
            Vec::with_capacity(Self::HEADER + self.wrapped_pdk.len() + self.wrapped_psk.len());
        out.extend_from_slice(&prefix);
        out.extend_from_slice(&self.iv_pdk);
        out.extend_from_slice(&self.iv_psk);
        out.extend_from_slice(&self.wrapped_pdk);
        out.extend_from_slice(&self.wrapped_psk);
        Ok(out)
    }

    pub fn from_bytes(data: &[u8]) -> CryptoResult<Self> {
        let pdk_len = read_u16(data, 0)
            .ok_or_else(|| CryptoError::format("private key bundle", "missing length prefix"))?;
        let pdk_end = Self::HEADER + pdk_len;
        if data.len() <= pdk_end {
            return Err(CryptoError::format(
                "private key bundle",
                format!("{} bytes, declared decryption key of {pdk_len}", data.len()),
            ));
        }

        Ok(Self {
            iv_pdk: take_iv("private key bundle", &data[2..2 + IV_SIZE])?,
            iv_psk: take_iv("private key bundle", &data[2 + IV_SIZE..Self::HEADER])?,
            wrapped_pdk: data[Self::HEADER..pdk_end].to_vec(),
            wrapped_psk: data[pdk_end..].to_vec(),
        })
    }
}

// ── Message blob ──────────────────────────────────────────────────────────────

/// Binary message envelope as stored and fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBlob {
    /// Wrapped session key of whoever the blob was fetched for
    pub key: Vec<u8>,
    pub signature: Vec<u8>,
    pub iv: [u8; IV_SIZE],
    pub ciphertext: Vec<u8>,
}

impl MessageBlob {
    pub fn to_bytes(&self) -> CryptoResult<Vec<u8>> {
        let key_len = length_prefix("message blob", self.key.len())?;
        let sig_len = length_prefix("message blob", self.signature.len())?;

        let mut out = Vec::with_capacity(
            4 + self.key.len() + self.signature.len() + IV_SIZE + self.ciphertext.len(),
        );
        out.extend_from_slice(&key_len);
        out.extend_from_slice(&sig_len);
        out.extend_from_slice(&self.key);
        out.extend_from_slice(&self.signature);
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.ciphertext);
        Ok(out)
    }

    pub fn from_bytes(data: &[u8]) -> CryptoResult<Self> {
        let (Some(key_len), Some(sig_len)) = (read_u16(data, 0), read_u16(data, 2)) else {
            return Err(CryptoError::format("message blob", "missing length header"));
        };
        let key_end = 4 + key_len;
        let sig_end = key_end + sig_len;
        let iv_end = sig_end + IV_SIZE;
        if data.len() < iv_end {
            return Err(CryptoError::format(
                "message blob",
                format!(
                    "{} bytes, header declares key {key_len} and signature {sig_len}",
                    data.len()
                ),
            ));
        }

        Ok(Self {
            key: data[4..key_end].to_vec(),
            signature: data[key_end..sig_end].to_vec(),
            iv: take_iv("message blob", &data[sig_end..iv_end])?,
            ciphertext: data[iv_end..].to_vec(),
        })
    }

    /// Replace the key slot, e.g. with the wrapped key of the fetching recipient.
    pub fn with_key(mut self, key: Vec<u8>) -> Self {
        self.key = key;
        self
    }

    /// Overwrite the key slot in serialized form without a full re-encode.
    ///
    /// The new key must have the same length as the slot.
    pub fn substitute_key(blob: &mut [u8], key: &[u8]) -> CryptoResult<()> {
        let key_len = read_u16(blob, 0)
            .ok_or_else(|| CryptoError::format("message blob", "missing length header"))?;
        if key_len != key.len() || blob.len() < 4 + key_len {
            return Err(CryptoError::format(
                "message blob",
                format!("key slot of {key_len} bytes cannot hold {}", key.len()),
            ));
        }
        blob[4..4 + key_len].copy_from_slice(key);
        Ok(())
    }
}

// ── JSON envelopes ────────────────────────────────────────────────────────────

/// One recipient's wrapped session key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientKey {
    /// Username
    pub u: String,
    /// Wrapped session key, base64
    pub k: String,
}

/// Chat message envelope: every participant's key travels inline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEnvelope {
    /// Ciphertext, base64
    pub m: String,
    pub iv: String,
    /// Signature over the ciphertext, base64
    pub s: String,
    pub keys: Vec<RecipientKey>,
}

impl ChatEnvelope {
    pub fn key_for(&self, username: &str) -> Option<&str> {
        self.keys
            .iter()
            .find(|rk| rk.u == username)
            .map(|rk| rk.k.as_str())
    }
}

/// Single-recipient envelope used for encrypted signatures and similar blobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureEnvelope {
    pub m: String,
    pub iv: String,
    pub s: String,
    pub k: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_wrapped_ik_layout() {
        let wik = WrappedIntermediateKey {
            iv: [1u8; IV_SIZE],
            wrapped: vec![2u8; 48],
        };
        let bytes = wik.to_bytes();
        assert_eq!(bytes.len(), 64);
        assert_eq!(&bytes[..IV_SIZE], &[1u8; IV_SIZE]);
        assert_eq!(WrappedIntermediateKey::from_base64(&wik.to_base64()).unwrap(), wik);
    }

    #[test]
    fn test_wrapped_ik_too_short() {
        assert!(WrappedIntermediateKey::from_bytes(&[0u8; IV_SIZE]).is_err());
    }

    #[test]
    fn test_private_bundle_layout() {
        let bundle = PrivateKeyBundle {
            iv_pdk: [0xAA; IV_SIZE],
            iv_psk: [0xBB; IV_SIZE],
            wrapped_pdk: vec![1u8; 300],
            wrapped_psk: vec![2u8; 260],
        };
        let bytes = bundle.to_bytes().unwrap();

        assert_eq!(&bytes[..2], &300u16.to_le_bytes(), "little-endian length prefix");
        assert_eq!(&bytes[2..18], &[0xAA; IV_SIZE]);
        assert_eq!(&bytes[18..34], &[0xBB; IV_SIZE]);
        assert_eq!(bytes.len(), 34 + 300 + 260);
        assert_eq!(PrivateKeyBundle::from_bytes(&bytes).unwrap(), bundle);
    }

    #[test]
    fn test_private_bundle_truncated() {
        let bundle = PrivateKeyBundle {
            iv_pdk: [0; IV_SIZE],
            iv_psk: [0; IV_SIZE],
            wrapped_pdk: vec![1u8; 64],
            wrapped_psk: vec![2u8; 64],
        };
        let bytes = bundle.to_bytes().unwrap();
        assert!(PrivateKeyBundle::from_bytes(&bytes[..34 + 64]).is_err());
        assert!(PrivateKeyBundle::from_bytes(&bytes[..1]).is_err());
    }

    #[test]
    fn test_message_blob_layout() {
        let blob = MessageBlob {
            key: vec![7u8; 256],
            signature: vec![8u8; 256],
            iv: [9u8; IV_SIZE],
            ciphertext: vec![10u8; 48],
        };
        let bytes = blob.to_bytes().unwrap();
        assert_eq!(&bytes[..2], &256u16.to_le_bytes());
        assert_eq!(&bytes[2..4], &256u16.to_le_bytes());
        assert_eq!(bytes.len(), 4 + 256 + 256 + 16 + 48);
        assert_eq!(MessageBlob::from_bytes(&bytes).unwrap(), blob);
    }

    #[test]
    fn test_substitute_key_slot() {
        let blob = MessageBlob {
            key: vec![0u8; 128],
            signature: vec![8u8; 128],
            iv: [9u8; IV_SIZE],
            ciphertext: vec![10u8; 16],
        };
        let mut bytes = blob.clone().to_bytes().unwrap();
        MessageBlob::substitute_key(&mut bytes, &[5u8; 128]).unwrap();

        let parsed = MessageBlob::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, blob.with_key(vec![5u8; 128]));
        assert!(MessageBlob::substitute_key(&mut bytes, &[5u8; 64]).is_err());
    }

    #[test]
    fn test_chat_envelope_json_shape() {
        let env = ChatEnvelope {
            m: "bQ==".into(),
            iv: "aXY=".into(),
            s: "cw==".into(),
            keys: vec![
                RecipientKey { u: "alice".into(), k: "a2E=".into() },
                RecipientKey { u: "bob".into(), k: "a2I=".into() },
            ],
        };
        let json: serde_json::Value = serde_json::to_value(&env).unwrap();
        assert_eq!(json["keys"][1]["u"], "bob");
        assert_eq!(env.key_for("bob"), Some("a2I="));
        assert_eq!(env.key_for("carol"), None);
    }

    proptest! {
        #[test]
        fn prop_message_blob_decoder_never_panics(
            data in proptest::collection::vec(any::<u8>(), 0..600)
        ) {
            let _ = MessageBlob::from_bytes(&data);
        }

        #[test]
        fn prop_private_bundle_decoder_never_panics(
            data in proptest::collection::vec(any::<u8>(), 0..600)
        ) {
            let _ = PrivateKeyBundle::from_bytes(&data);
        }

        #[test]
        fn prop_substitute_key_never_panics(
            mut data in proptest::collection::vec(any::<u8>(), 0..64),
            key in proptest::collection::vec(any::<u8>(), 0..64),
        ) {
            let _ = MessageBlob::substitute_key(&mut data, &key);
        }
    }
}
