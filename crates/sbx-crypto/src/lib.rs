//! sbx-crypto: client-side E2E encryption for strongbox mail and storage
//!
//! Architecture: encrypt-then-sign envelopes with per-recipient RSA-OAEP key fan-out
//!
//! Key hierarchy:
//! ```text
//! password ──PBKDF2-SHA256(5000, salt=user@domain)──────► account password (auth only)
//!          └─PBKDF2-SHA256(5000, salt=user@domain+user)─► mail key
//!                                                         └── wraps IK (AES-256-CBC, random IV)
//! Intermediate Key (IK, 256-bit random, fixed for the account lifetime)
//!   ├── wraps private decryption key  (RSA-OAEP-SHA256, AES-256-CBC, ivPDK)
//!   └── wraps private signing key     (RSASSA-PKCS1-v1_5-SHA256, AES-256-CBC, ivPSK)
//! Envelope: session key (random) ─AES-256-CBC─► ciphertext ─sign─► signature
//!           session key ─RSA-OAEP(recipient)─► wrapped key, one per recipient
//! File part: raw key = HMAC(zero key, plaintext); AES-CBC(raw key, fixed IV); HMAC(raw key, ct)
//! ```
//!
//! A password change re-wraps the IK only; private keys and historical
//! envelopes are untouched.

pub mod directory;
pub mod envelope;
pub mod error;
pub mod item;
pub mod kdf;
pub mod keys;
pub mod keystore;
pub mod part;
pub mod provider;
pub mod wire;

pub use directory::{normalize_username, KeyType, PublicKeyDirectory, PublicKeys};
pub use envelope::{
    decrypt_attachment, encrypt_attachment, BatchItem, DecryptedItem, Decrypter,
    EncryptedAttachment, Encrypter, MessageEnvelope, Recipients,
};
pub use error::{CryptoError, CryptoResult};
pub use item::{ItemCodec, OpenedAssignment, SealedNewItem};
pub use kdf::{derive, Credentials};
pub use keys::SymmetricKey;
pub use keystore::{
    change_password, login, setup_account, AccountSetup, KeyParams, Session, MAIL_SERVICE,
    STORAGE_SERVICE,
};
pub use part::{decrypt_file_part, encrypt_file_part, part_count, EncryptedPart};
pub use provider::{detect, Capabilities, PrimitiveProvider, RecordingProvider, RustCryptoProvider};
pub use wire::{ChatEnvelope, MessageBlob, PrivateKeyBundle, RecipientKey, WrappedIntermediateKey};

/// Size of every symmetric key in the system (256-bit)
pub const KEY_SIZE: usize = 32;

/// AES-CBC IV / block size
pub const IV_SIZE: usize = 16;

/// HMAC-SHA256 tag size
pub const MAC_SIZE: usize = 32;

/// Maximum recipients per envelope and usernames per directory batch
pub const MAX_RECIPIENTS: usize = 10;
