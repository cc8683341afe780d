//! File part encryption with content-derived keys
//!
//! Each part of a file is keyed by its own plaintext:
//! ```text
//! raw_key    = HMAC-SHA256(key = 32 zero bytes, plaintext)
//! ciphertext = AES-256-CBC(raw_key, PART_IV, plaintext)
//! mac        = HMAC-SHA256(raw_key, ciphertext)
//! ```
//!
//! The IV is a constant; every part has its own key, so no (key, IV) pair
//! repeats for different plaintexts. Identical parts encrypt identically.
//!
//! [`PartKeying::DomainSeparated`] derives separate cipher and MAC subkeys from
//! `raw_key` with HKDF instead of using it for both roles. It is not wire
//! compatible with parts written in [`PartKeying::Compatible`] mode.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

use sbx_core::config::PartKeying;
use sbx_core::types::PartMeta;

use crate::error::{CryptoError, CryptoResult};
use crate::keys::SymmetricKey;
use crate::provider::PrimitiveProvider;
use crate::{IV_SIZE, KEY_SIZE};

/// Fixed IV for all file parts
pub const PART_IV: [u8; IV_SIZE] = *b"strongbox-part01";

/// Default plaintext bytes per part (4 MiB)
pub const DEFAULT_PART_SIZE: u64 = 4 * 1024 * 1024;

const ZERO_KEY: [u8; KEY_SIZE] = [0u8; KEY_SIZE];
const ENC_INFO: &[u8] = b"strongbox-part-enc";
const MAC_INFO: &[u8] = b"strongbox-part-mac";

/// Number of parts for a file of `size` bytes. Empty files have none.
pub fn part_count(size: u64, part_size: u64) -> u64 {
    if part_size == 0 {
        return 0;
    }
    size.div_ceil(part_size)
}

/// One encrypted part. `key` and `mac` travel in the item metadata, the
/// ciphertext goes to the part store.
#[derive(Debug, Clone)]
pub struct EncryptedPart {
    pub part: u64,
    pub ciphertext: Vec<u8>,
    pub key: SymmetricKey,
    pub mac: [u8; KEY_SIZE],
}

impl EncryptedPart {
    pub fn meta(&self) -> PartMeta {
        PartMeta {
            part: self.part,
            key: self.key.to_base64(),
            mac: STANDARD.encode(self.mac),
        }
    }
}

fn hkdf_derive(ikm: &[u8; KEY_SIZE], info: &[u8]) -> CryptoResult<Zeroizing<[u8; KEY_SIZE]>> {
    let hkdf = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = Zeroizing::new([0u8; KEY_SIZE]);
    hkdf.expand(info, &mut okm[..])
        .map_err(|e| CryptoError::Primitive(format!("HKDF expand failed: {e}")))?;
    Ok(okm)
}

/// (cipher key, MAC key) for a raw part key.
fn subkeys(
    raw: &SymmetricKey,
    keying: PartKeying,
) -> CryptoResult<(Zeroizing<[u8; KEY_SIZE]>, Zeroizing<[u8; KEY_SIZE]>)> {
    match keying {
        PartKeying::Compatible => Ok((
            Zeroizing::new(*raw.as_bytes()),
            Zeroizing::new(*raw.as_bytes()),
        )),
        PartKeying::DomainSeparated => Ok((
            hkdf_derive(raw.as_bytes(), ENC_INFO)?,
            hkdf_derive(raw.as_bytes(), MAC_INFO)?,
        )),
    }
}

/// Encrypt and authenticate one part.
pub fn encrypt_file_part(
    provider: &dyn PrimitiveProvider,
    part: u64,
    plaintext: &[u8],
    keying: PartKeying,
) -> CryptoResult<EncryptedPart> {
    let raw = SymmetricKey::from_bytes(provider.hmac_sha256(&ZERO_KEY, plaintext)?);
    let (enc_key, mac_key) = subkeys(&raw, keying)?;

    let ciphertext = provider.aes_cbc_encrypt(&enc_key[..], &PART_IV, plaintext)?;
    let mac = provider.hmac_sha256(&mac_key[..], &ciphertext)?;

    Ok(EncryptedPart {
        part,
        ciphertext,
        key: raw,
        mac,
    })
}

/// Verify a part's MAC, then decrypt it.
///
/// A MAC mismatch is `CorruptedPart`; nothing is decrypted in that case.
pub fn decrypt_file_part(
    provider: &dyn PrimitiveProvider,
    meta: &PartMeta,
    ciphertext: &[u8],
    keying: PartKeying,
) -> CryptoResult<Vec<u8>> {
    let raw = SymmetricKey::from_base64(&meta.key)?;
    let mac = STANDARD.decode(&meta.mac)?;
    let (enc_key, mac_key) = subkeys(&raw, keying)?;

    if !provider.hmac_sha256_verify(&mac_key[..], ciphertext, &mac)? {
        return Err(CryptoError::CorruptedPart { part: meta.part });
    }
    provider
        .aes_cbc_decrypt(&enc_key[..], &PART_IV, ciphertext)
        .map_err(|_| CryptoError::CorruptedPart { part: meta.part })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{RecordingProvider, RustCryptoProvider};

    #[test]
    fn test_part_count() {
        assert_eq!(part_count(0, DEFAULT_PART_SIZE), 0);
        assert_eq!(part_count(1, DEFAULT_PART_SIZE), 1);
        assert_eq!(part_count(DEFAULT_PART_SIZE, DEFAULT_PART_SIZE), 1);
        assert_eq!(part_count(DEFAULT_PART_SIZE + 1, DEFAULT_PART_SIZE), 2);
        assert_eq!(part_count(10 * DEFAULT_PART_SIZE, DEFAULT_PART_SIZE), 10);
    }

    #[test]
    fn test_part_roundtrip() {
        let p = RustCryptoProvider::new();
        for keying in [PartKeying::Compatible, PartKeying::DomainSeparated] {
            let part = encrypt_file_part(&p, 3, b"some file bytes", keying).unwrap();
            let meta = part.meta();
            assert_eq!(meta.part, 3);
            let plain = decrypt_file_part(&p, &meta, &part.ciphertext, keying).unwrap();
            assert_eq!(plain, b"some file bytes");
        }
    }

    #[test]
    fn test_content_derived_key() {
        let p = RustCryptoProvider::new();
        let a = encrypt_file_part(&p, 0, b"same bytes", PartKeying::Compatible).unwrap();
        let b = encrypt_file_part(&p, 7, b"same bytes", PartKeying::Compatible).unwrap();
        let c = encrypt_file_part(&p, 0, b"other bytes", PartKeying::Compatible).unwrap();

        assert_eq!(a.key, b.key, "identical plaintext must derive the same key");
        assert_eq!(a.ciphertext, b.ciphertext);
        assert_ne!(a.key, c.key);

        let expected = p.hmac_sha256(&[0u8; 32], b"same bytes").unwrap();
        assert_eq!(a.key.as_bytes(), &expected);
    }

    #[test]
    fn test_keying_modes_differ_on_wire() {
        let p = RustCryptoProvider::new();
        let compat = encrypt_file_part(&p, 0, b"data", PartKeying::Compatible).unwrap();
        let separated = encrypt_file_part(&p, 0, b"data", PartKeying::DomainSeparated).unwrap();
        assert_eq!(compat.key, separated.key, "raw key is the same");
        assert_ne!(compat.ciphertext, separated.ciphertext);

        let result = decrypt_file_part(
            &p,
            &separated.meta(),
            &separated.ciphertext,
            PartKeying::Compatible,
        );
        assert!(matches!(result, Err(CryptoError::CorruptedPart { part: 0 })));
    }

    #[test]
    fn test_corrupted_part_is_never_decrypted() {
        let rec = RecordingProvider::new(RustCryptoProvider::new());
        let part = encrypt_file_part(&rec, 5, b"payload", PartKeying::Compatible).unwrap();

        let mut corrupted = part.ciphertext.clone();
        corrupted[0] ^= 0x80;
        rec.reset();

        let err =
            decrypt_file_part(&rec, &part.meta(), &corrupted, PartKeying::Compatible).unwrap_err();
        assert!(matches!(err, CryptoError::CorruptedPart { part: 5 }));
        assert!(err.to_string().contains("file corrupted"));
        assert_eq!(rec.count("aes_cbc_decrypt"), 0);
    }
}
