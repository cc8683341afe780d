use thiserror::Error;

pub type SbxResult<T> = Result<T, SbxError>;

/// Errors raised by collaborators (account server, key directory, storage backends).
///
/// Authentication failures deliberately share one message so that a caller
/// cannot tell a wrong username from a wrong password.
#[derive(Debug, Error)]
pub enum SbxError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("Username and/or password incorrect.")]
    Unauthorized,

    #[error("Account temporarily blocked after too many login attempts, try again later.")]
    Blocked,

    #[error("session expired")]
    SessionExpired,

    #[error("transfer error: {0}")]
    Transfer(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SbxError {
    /// True for failures that must wipe session key material.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, SbxError::SessionExpired)
    }
}
