use sbx_core::SbxError;
use sbx_crypto::CryptoError;
use thiserror::Error;

/// Why a single part failed.
#[derive(Debug, Error)]
pub enum PartError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Remote(#[from] SbxError),
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transfer cancelled")]
    Cancelled,

    #[error("part {part} failed: {source}")]
    Part {
        part: u64,
        #[source]
        source: PartError,
    },

    #[error("job queue error: {0}")]
    Queue(String),

    #[error("inconsistent file metadata: {0}")]
    Manifest(String),
}

impl TransferError {
    pub fn part(part: u64, source: impl Into<PartError>) -> Self {
        TransferError::Part {
            part,
            source: source.into(),
        }
    }

    /// Cancellation, corrupted metadata and parts that fail authentication
    /// are final; remote and queue failures may be worth resubmitting.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::Cancelled | TransferError::Manifest(_) => false,
            TransferError::Part {
                source: PartError::Crypto(_),
                ..
            } => false,
            TransferError::Part {
                source: PartError::Remote(e),
                ..
            } => !e.is_session_fatal(),
            TransferError::Queue(_) => true,
        }
    }

    /// The session died underneath the transfer; the caller must log in again.
    pub fn is_session_expired(&self) -> bool {
        matches!(
            self,
            TransferError::Part {
                source: PartError::Remote(SbxError::SessionExpired),
                ..
            } | TransferError::Part {
                source: PartError::Crypto(CryptoError::SessionExpired),
                ..
            }
        )
    }
}
