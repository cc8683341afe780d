use sbx_core::SbxError;
use thiserror::Error;

pub type CryptoResult<T> = Result<T, CryptoError>;

/// Failure taxonomy of the crypto core.
///
/// Each pipeline stage fails with its own variant so that callers can tell a
/// forged envelope (`Verification`) from a wrong key (`Unwrap`) from a
/// corrupted ciphertext (`Decrypt`).
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("derivation error: {0}")]
    Derivation(String),

    #[error("sender could not be verified")]
    Verification,

    #[error("key unwrapping failed: {0}")]
    Unwrap(String),

    #[error("decryption failed: {0}")]
    Decrypt(String),

    #[error("public key lookup failed for {user:?}: {reason}")]
    DirectoryLookup { user: String, reason: String },

    #[error("too many recipients: {count} (max {max})")]
    TooManyRecipients { count: usize, max: usize },

    #[error("no recipients")]
    NoRecipients,

    #[error("file corrupted (part {part})")]
    CorruptedPart { part: u64 },

    #[error("malformed {what}: {reason}")]
    Format { what: &'static str, reason: String },

    #[error("crypto primitive failed: {0}")]
    Primitive(String),

    #[error("key store not loaded: {0}")]
    NotLoaded(&'static str),

    #[error("Username and/or password incorrect.")]
    Authentication,

    #[error("Account temporarily blocked after too many login attempts, try again later.")]
    Blocked,

    #[error("session expired")]
    SessionExpired,

    #[error("remote error: {0}")]
    Remote(String),
}

impl CryptoError {
    pub(crate) fn format(what: &'static str, reason: impl Into<String>) -> Self {
        CryptoError::Format {
            what,
            reason: reason.into(),
        }
    }
}

impl From<SbxError> for CryptoError {
    fn from(e: SbxError) -> Self {
        match e {
            SbxError::Unauthorized => CryptoError::Authentication,
            SbxError::Blocked => CryptoError::Blocked,
            SbxError::SessionExpired => CryptoError::SessionExpired,
            other => CryptoError::Remote(other.to_string()),
        }
    }
}

impl From<base64::DecodeError> for CryptoError {
    fn from(e: base64::DecodeError) -> Self {
        CryptoError::format("base64", e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_auth_errors_keep_generic_wording() {
        let e: CryptoError = SbxError::Unauthorized.into();
        assert!(matches!(e, CryptoError::Authentication));
        assert_eq!(e.to_string(), SbxError::Unauthorized.to_string());
    }

    #[test]
    fn remote_expiry_maps_to_session_expired() {
        let e: CryptoError = SbxError::SessionExpired.into();
        assert!(matches!(e, CryptoError::SessionExpired));
    }

    #[test]
    fn corrupted_part_mentions_file_corrupted() {
        let e = CryptoError::CorruptedPart { part: 3 };
        assert!(e.to_string().contains("file corrupted"));
    }
}
