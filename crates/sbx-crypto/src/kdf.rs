//! Key derivation: password → account password + mail key (PBKDF2-HMAC-SHA256)

use std::sync::Arc;

use sbx_core::types::Identity;
use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroize;

use crate::error::{CryptoError, CryptoResult};
use crate::keys::SymmetricKey;
use crate::provider::{offload, PrimitiveProvider};
use crate::KEY_SIZE;

/// Default PBKDF2 round count
pub const DEFAULT_KDF_ROUNDS: u32 = 5000;

/// Derive a 256-bit key from `password` and `salt`, returned as lower-case hex.
///
/// Deterministic: the same inputs always give the same output.
pub fn derive(
    provider: &dyn PrimitiveProvider,
    salt: &str,
    password: &SecretString,
    rounds: u32,
) -> CryptoResult<SecretString> {
    if salt.is_empty() {
        return Err(CryptoError::Derivation("empty salt".into()));
    }
    if password.expose_secret().is_empty() {
        return Err(CryptoError::Derivation("empty password".into()));
    }
    if rounds == 0 {
        return Err(CryptoError::Derivation("round count must be positive".into()));
    }

    let mut out = [0u8; KEY_SIZE];
    provider.pbkdf2_sha256(
        password.expose_secret().as_bytes(),
        salt.as_bytes(),
        rounds,
        &mut out,
    );
    let derived = hex::encode(out);
    out.zeroize();
    Ok(SecretString::from(derived))
}

/// The two passwords derived from one user password.
///
/// `account_password` authenticates against the server; `mail_password`
/// never leaves the client and keys the wrapping of the intermediate key.
pub struct Credentials {
    account_password: SecretString,
    mail_password: SecretString,
}

impl Credentials {
    /// Derive both passwords on the blocking pool.
    pub async fn derive(
        provider: &Arc<dyn PrimitiveProvider>,
        identity: &Identity,
        password: &SecretString,
        rounds: u32,
    ) -> CryptoResult<Self> {
        if identity.username.is_empty() || identity.domain.is_empty() {
            return Err(CryptoError::Derivation("username and domain are required".into()));
        }

        let account_salt = identity.account_salt();
        let mail_salt = identity.mail_salt();
        let password = SecretString::from(password.expose_secret().to_owned());

        offload(provider, move |p| {
            let account_password = derive(p, &account_salt, &password, rounds)?;
            let mail_password = derive(p, &mail_salt, &password, rounds)?;
            Ok(Credentials {
                account_password,
                mail_password,
            })
        })
        .await
    }

    pub fn account_password(&self) -> &SecretString {
        &self.account_password
    }

    pub fn mail_password(&self) -> &SecretString {
        &self.mail_password
    }

    /// The AES-256 key that wraps the intermediate key (hex-decoded mail password).
    pub fn mail_key(&self) -> CryptoResult<SymmetricKey> {
        SymmetricKey::from_hex(self.mail_password.expose_secret())
            .map_err(|e| CryptoError::Derivation(format!("mail key: {e}")))
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("account_password", &"[REDACTED]")
            .field("mail_password", &"[REDACTED]")
            .finish()
    }
}
