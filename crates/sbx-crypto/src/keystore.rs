//! Key hierarchy: account setup, login-time IK retrieval, password change
//!
//! The [`Session`] owns everything that exists only for the lifetime of a
//! login: the identity, the unwrapped intermediate key and the wrapped
//! private key bundles of each service. Private keys are unwrapped from the
//! bundle on every use and dropped (zeroized) afterwards, unless signing key
//! caching is switched on explicitly.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use rsa::{RsaPrivateKey, RsaPublicKey};
use sbx_core::api::AccountService;
use sbx_core::config::CryptoConfig;
use sbx_core::types::{
    Identity, PasswordUpdate, PublicKeyBundle, Registration, ServiceKeyUpload, SessionInfo,
};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::directory::PublicKeyDirectory;
use crate::error::{CryptoError, CryptoResult};
use crate::kdf::{Credentials, DEFAULT_KDF_ROUNDS};
use crate::keys::{
    private_key_from_der, private_key_to_der, public_key_to_jwk, KeyUse, SymmetricKey,
};
use crate::provider::{offload, PrimitiveProvider};
use crate::wire::{PrivateKeyBundle, WrappedIntermediateKey};
use crate::{IV_SIZE, KEY_SIZE};

/// Key store of the mail service, loaded at every login
pub const MAIL_SERVICE: &str = "mail";

/// Key store of the storage service, set up on first use
pub const STORAGE_SERVICE: &str = "storage";

/// Parameters for generating and protecting key material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyParams {
    pub modulus_bits: usize,
    pub kdf_rounds: u32,
}

impl Default for KeyParams {
    fn default() -> Self {
        Self {
            modulus_bits: 2048,
            kdf_rounds: DEFAULT_KDF_ROUNDS,
        }
    }
}

impl From<&CryptoConfig> for KeyParams {
    fn from(config: &CryptoConfig) -> Self {
        Self {
            modulus_bits: config.rsa_modulus_bits,
            kdf_rounds: config.kdf_rounds,
        }
    }
}

/// Output of [`setup_account`]. Everything in here is safe to send to the
/// server except `credentials`, of which only the account password may leave.
#[derive(Debug)]
pub struct AccountSetup {
    pub identity: Identity,
    pub credentials: Credentials,
    pub public_keys: PublicKeyBundle,
    pub private_keys: PrivateKeyBundle,
    pub wrapped_ik: WrappedIntermediateKey,
}

impl AccountSetup {
    /// Build the registration request for the account service.
    pub fn registration(&self) -> CryptoResult<Registration> {
        Ok(Registration {
            username: self.identity.username.clone(),
            account_password: self.credentials.account_password().expose_secret().to_owned(),
            public_keys: self.public_keys.clone(),
            private_keys: self.private_keys.to_bytes()?,
            key: self.wrapped_ik.to_bytes(),
        })
    }
}

struct ServiceKeys {
    bundle: PrivateKeyBundle,
    public: Option<PublicKeyBundle>,
    cached_sign_key: Option<RsaPrivateKey>,
}

#[derive(Default)]
struct SessionState {
    identity: Option<Identity>,
    ik: Option<SymmetricKey>,
    services: HashMap<String, ServiceKeys>,
    info: BTreeMap<String, serde_json::Value>,
    cache_sign_key: bool,
}

/// Session-scoped key material, shared by every envelope operation.
pub struct Session {
    provider: Arc<dyn PrimitiveProvider>,
    params: KeyParams,
    state: RwLock<SessionState>,
}

impl Session {
    pub fn new(provider: Arc<dyn PrimitiveProvider>, params: KeyParams) -> Self {
        Self {
            provider,
            params,
            state: RwLock::new(SessionState::default()),
        }
    }

    pub fn provider(&self) -> &Arc<dyn PrimitiveProvider> {
        &self.provider
    }

    pub fn params(&self) -> KeyParams {
        self.params
    }

    pub async fn identity(&self) -> Option<Identity> {
        self.state.read().await.identity.clone()
    }

    /// Username of the logged-in account.
    pub async fn username(&self) -> CryptoResult<String> {
        self.state
            .read()
            .await
            .identity
            .as_ref()
            .map(|id| id.username.clone())
            .ok_or(CryptoError::NotLoaded("identity"))
    }

    pub async fn set_identity(&self, identity: Identity) {
        self.state.write().await.identity = Some(identity);
    }

    /// Unwrap the IK with the mail key and keep it for this session.
    ///
    /// A wrong password shows up here as an `Unwrap` error; the session is
    /// cleared so no partial key state survives.
    pub async fn retrieve_intermediate_key(
        &self,
        wrapped: &WrappedIntermediateKey,
        credentials: &Credentials,
    ) -> CryptoResult<()> {
        match unwrap_intermediate_key(self.provider.as_ref(), wrapped, credentials) {
            Ok(ik) => {
                self.state.write().await.ik = Some(ik);
                debug!("intermediate key staged");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "intermediate key retrieval failed, clearing session");
                self.clear().await;
                Err(e)
            }
        }
    }

    pub async fn has_intermediate_key(&self) -> bool {
        self.state.read().await.ik.is_some()
    }

    /// Store a service's wrapped private key bundle as fetched from the server.
    pub async fn load_private_keys(&self, service: &str, bundle: &[u8]) -> CryptoResult<()> {
        let bundle = PrivateKeyBundle::from_bytes(bundle)?;
        let mut state = self.state.write().await;
        let public = state.services.remove(service).and_then(|s| s.public);
        state.services.insert(
            service.to_owned(),
            ServiceKeys {
                bundle,
                public,
                cached_sign_key: None,
            },
        );
        debug!(service, "private key bundle loaded");
        Ok(())
    }

    /// Record the account's own public keys for `service`.
    pub async fn set_public_keys(&self, service: &str, keys: PublicKeyBundle) -> CryptoResult<()> {
        let mut state = self.state.write().await;
        let entry = state
            .services
            .get_mut(service)
            .ok_or(CryptoError::NotLoaded("private keys"))?;
        entry.public = Some(keys);
        Ok(())
    }

    pub async fn public_keys(&self, service: &str) -> Option<PublicKeyBundle> {
        self.state
            .read()
            .await
            .services
            .get(service)
            .and_then(|s| s.public.clone())
    }

    /// True once both the IK and the service's private key bundle are present.
    pub async fn is_loaded(&self, service: &str) -> bool {
        let state = self.state.read().await;
        state.ik.is_some() && state.services.contains_key(service)
    }

    /// Unwrap the private decryption key of `service` for a single operation.
    pub async fn private_decryption_key(&self, service: &str) -> CryptoResult<RsaPrivateKey> {
        let (ik, iv, wrapped) = {
            let state = self.state.read().await;
            let ik = state.ik.clone().ok_or(CryptoError::NotLoaded("intermediate key"))?;
            let keys = state
                .services
                .get(service)
                .ok_or(CryptoError::NotLoaded("private keys"))?;
            (ik, keys.bundle.iv_pdk, keys.bundle.wrapped_pdk.clone())
        };
        offload(&self.provider, move |p| unwrap_private_key(p, &ik, &iv, &wrapped)).await
    }

    /// Unwrap the private signing key of `service`.
    ///
    /// Re-unwrapped on every call unless caching was enabled with
    /// [`set_cache_sign_key`](Self::set_cache_sign_key).
    pub async fn private_sign_key(&self, service: &str) -> CryptoResult<RsaPrivateKey> {
        let (ik, iv, wrapped, cache) = {
            let state = self.state.read().await;
            let ik = state.ik.clone().ok_or(CryptoError::NotLoaded("intermediate key"))?;
            let keys = state
                .services
                .get(service)
                .ok_or(CryptoError::NotLoaded("private keys"))?;
            if let Some(cached) = &keys.cached_sign_key {
                return Ok(cached.clone());
            }
            (
                ik,
                keys.bundle.iv_psk,
                keys.bundle.wrapped_psk.clone(),
                state.cache_sign_key,
            )
        };

        let key =
            offload(&self.provider, move |p| unwrap_private_key(p, &ik, &iv, &wrapped)).await?;
        if cache {
            if let Some(entry) = self.state.write().await.services.get_mut(service) {
                entry.cached_sign_key = Some(key.clone());
            }
        }
        Ok(key)
    }

    /// Keep the unwrapped signing key between operations (bulk storage work).
    /// Turning caching off drops any cached key immediately.
    pub async fn set_cache_sign_key(&self, cache: bool) {
        let mut state = self.state.write().await;
        state.cache_sign_key = cache;
        if !cache {
            for keys in state.services.values_mut() {
                keys.cached_sign_key = None;
            }
        }
    }

    /// Generate and register a key store for an additional service, wrapped
    /// under the session's existing IK.
    pub async fn setup_service_keys(
        &self,
        accounts: &dyn AccountService,
        service: &str,
    ) -> CryptoResult<PublicKeyBundle> {
        let (username, ik) = {
            let state = self.state.read().await;
            let username = state
                .identity
                .as_ref()
                .map(|id| id.username.clone())
                .ok_or(CryptoError::NotLoaded("identity"))?;
            let ik = state.ik.clone().ok_or(CryptoError::NotLoaded("intermediate key"))?;
            (username, ik)
        };

        let bits = self.params.modulus_bits;
        let (public_keys, bundle) =
            offload(&self.provider, move |p| generate_key_store(p, &ik, bits)).await?;

        let upload = ServiceKeyUpload {
            public_keys: public_keys.clone(),
            private_keys: bundle.to_bytes()?,
        };
        let stored = accounts.store_service_keys(&username, service, upload).await;
        self.observe(stored.map_err(CryptoError::from)).await?;

        self.state.write().await.services.insert(
            service.to_owned(),
            ServiceKeys {
                bundle,
                public: Some(public_keys.clone()),
                cached_sign_key: None,
            },
        );
        info!(user = %username, service, "service key store created");
        Ok(public_keys)
    }

    /// Opaque session fields returned by authentication (token etc.).
    pub async fn info(&self, key: &str) -> Option<serde_json::Value> {
        self.state.read().await.info.get(key).cloned()
    }

    pub async fn set_info(&self, info: BTreeMap<String, serde_json::Value>) {
        self.state.write().await.info = info;
    }

    /// Drop all key material. Keys zeroize themselves on drop.
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        let cache_sign_key = state.cache_sign_key;
        *state = SessionState {
            cache_sign_key,
            ..SessionState::default()
        };
        debug!("session cleared");
    }

    /// The server rejected the session: wipe the key material held here.
    ///
    /// Public key caches live in each [`PublicKeyDirectory`]; use
    /// [`teardown`](Self::teardown) to drop those as well.
    pub async fn handle_session_expired(&self) {
        warn!("session expired, wiping key material");
        self.clear().await;
    }

    /// Expiry handling for the session and every directory filled under it.
    pub async fn teardown(&self, directories: &[&PublicKeyDirectory]) {
        self.handle_session_expired().await;
        for directory in directories {
            directory.clear().await;
        }
    }

    /// Pass a result through, wiping the session if it reports expiry.
    pub(crate) async fn observe<T>(&self, result: CryptoResult<T>) -> CryptoResult<T> {
        self.observe_with(&[], result).await
    }

    /// [`observe`](Self::observe), also clearing `directories` on expiry.
    pub(crate) async fn observe_with<T>(
        &self,
        directories: &[&PublicKeyDirectory],
        result: CryptoResult<T>,
    ) -> CryptoResult<T> {
        if matches!(result, Err(CryptoError::SessionExpired)) {
            self.teardown(directories).await;
        }
        result
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("provider", &self.provider.name())
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

// ── Wrapping helpers ──────────────────────────────────────────────────────────

fn random_iv(p: &dyn PrimitiveProvider) -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    p.random_bytes(&mut iv);
    iv
}

/// Wrap the IK under the mail key with a fresh IV.
pub fn wrap_intermediate_key(
    p: &dyn PrimitiveProvider,
    ik: &SymmetricKey,
    credentials: &Credentials,
) -> CryptoResult<WrappedIntermediateKey> {
    let mail_key = credentials.mail_key()?;
    let iv = random_iv(p);
    let wrapped = p.wrap_key(mail_key.as_bytes(), &iv, ik.as_bytes())?;
    Ok(WrappedIntermediateKey { iv, wrapped })
}

pub fn unwrap_intermediate_key(
    p: &dyn PrimitiveProvider,
    wrapped: &WrappedIntermediateKey,
    credentials: &Credentials,
) -> CryptoResult<SymmetricKey> {
    let mail_key = credentials.mail_key()?;
    let raw = zeroize::Zeroizing::new(p.unwrap_key(
        mail_key.as_bytes(),
        &wrapped.iv,
        &wrapped.wrapped,
    )?);
    if raw.len() != KEY_SIZE {
        return Err(CryptoError::Unwrap("intermediate key has the wrong length".into()));
    }
    SymmetricKey::from_slice(&raw)
}

fn wrap_private_key(
    p: &dyn PrimitiveProvider,
    ik: &SymmetricKey,
    key: &RsaPrivateKey,
) -> CryptoResult<([u8; IV_SIZE], Vec<u8>)> {
    let der = private_key_to_der(key)?;
    let iv = random_iv(p);
    let wrapped = p.wrap_key(ik.as_bytes(), &iv, &der)?;
    Ok((iv, wrapped))
}

fn unwrap_private_key(
    p: &dyn PrimitiveProvider,
    ik: &SymmetricKey,
    iv: &[u8; IV_SIZE],
    wrapped: &[u8],
) -> CryptoResult<RsaPrivateKey> {
    let der = zeroize::Zeroizing::new(p.unwrap_key(ik.as_bytes(), iv, wrapped)?);
    private_key_from_der(&der)
}

/// Generate both key pairs of a service and wrap their private halves under `ik`.
fn generate_key_store(
    p: &dyn PrimitiveProvider,
    ik: &SymmetricKey,
    modulus_bits: usize,
) -> CryptoResult<(PublicKeyBundle, PrivateKeyBundle)> {
    let encrypt_pair = p.generate_rsa_key(modulus_bits)?;
    let (iv_pdk, wrapped_pdk) = wrap_private_key(p, ik, &encrypt_pair)?;

    let sign_pair = p.generate_rsa_key(modulus_bits)?;
    let (iv_psk, wrapped_psk) = wrap_private_key(p, ik, &sign_pair)?;

    let public_keys = PublicKeyBundle {
        encrypt: public_key_to_jwk(&RsaPublicKey::from(&encrypt_pair), KeyUse::Encrypt),
        verify: public_key_to_jwk(&RsaPublicKey::from(&sign_pair), KeyUse::Verify),
    };
    let bundle = PrivateKeyBundle {
        iv_pdk,
        iv_psk,
        wrapped_pdk,
        wrapped_psk,
    };
    Ok((public_keys, bundle))
}

// ── Account flows ─────────────────────────────────────────────────────────────

/// Create all key material of a new account.
///
/// Nothing is kept on failure: every intermediate value is local to this
/// call and zeroized when dropped.
pub async fn setup_account(
    provider: &Arc<dyn PrimitiveProvider>,
    identity: &Identity,
    password: &SecretString,
    params: KeyParams,
) -> CryptoResult<AccountSetup> {
    let credentials = Credentials::derive(provider, identity, password, params.kdf_rounds).await?;

    let ik = SymmetricKey::generate(provider.as_ref());
    let wrapped_ik = wrap_intermediate_key(provider.as_ref(), &ik, &credentials)?;

    let bits = params.modulus_bits;
    let (public_keys, private_keys) =
        offload(provider, move |p| generate_key_store(p, &ik, bits)).await?;

    info!(user = %identity.username, bits, "account key material generated");
    Ok(AccountSetup {
        identity: identity.clone(),
        credentials,
        public_keys,
        private_keys,
        wrapped_ik,
    })
}

/// Authenticate and stage the session's key material.
///
/// Any failure leaves the session cleared. Authentication failures keep the
/// account service's generic wording.
pub async fn login(
    session: &Session,
    accounts: &dyn AccountService,
    identity: &Identity,
    password: &SecretString,
    services: &[&str],
) -> CryptoResult<SessionInfo> {
    session.clear().await;

    let result = stage_login(session, accounts, identity, password, services).await;
    match &result {
        Ok(_) => info!(user = %identity.username, ?services, "logged in"),
        Err(e) => {
            warn!(user = %identity.username, error = %e, "login failed");
            session.clear().await;
        }
    }
    result
}

async fn stage_login(
    session: &Session,
    accounts: &dyn AccountService,
    identity: &Identity,
    password: &SecretString,
    services: &[&str],
) -> CryptoResult<SessionInfo> {
    let credentials = Credentials::derive(
        session.provider(),
        identity,
        password,
        session.params().kdf_rounds,
    )
    .await?;

    let info = accounts
        .authenticate(&identity.username, credentials.account_password().expose_secret())
        .await?;
    let wrapped = WrappedIntermediateKey::from_base64(&info.iak)?;

    session.set_identity(identity.clone()).await;
    session.retrieve_intermediate_key(&wrapped, &credentials).await?;

    for service in services {
        let bundle = accounts.fetch_private_keys(&identity.username, service).await?;
        session.load_private_keys(service, &bundle).await?;
    }
    session.set_info(info.extra.clone()).await;
    Ok(info)
}

/// Re-wrap the (unchanged) IK under a new password.
///
/// Private keys and historical envelopes are untouched. The old wrapped IK
/// stays authoritative until the account service accepts the update; the
/// session is not modified either way.
pub async fn change_password(
    session: &Session,
    accounts: &dyn AccountService,
    identity: &Identity,
    old_password: &SecretString,
    new_password: &SecretString,
) -> CryptoResult<WrappedIntermediateKey> {
    let provider = session.provider();
    let rounds = session.params().kdf_rounds;
    let old = Credentials::derive(provider, identity, old_password, rounds).await?;
    let new = Credentials::derive(provider, identity, new_password, rounds).await?;

    let authenticated = accounts
        .authenticate(&identity.username, old.account_password().expose_secret())
        .await
        .map_err(CryptoError::from);
    let info = session.observe(authenticated).await?;

    let current = WrappedIntermediateKey::from_base64(&info.iak)?;
    let ik = unwrap_intermediate_key(provider.as_ref(), &current, &old)?;
    let rewrapped = wrap_intermediate_key(provider.as_ref(), &ik, &new)?;

    let update = PasswordUpdate {
        username: identity.username.clone(),
        current_password: old.account_password().expose_secret().to_owned(),
        new_password: new.account_password().expose_secret().to_owned(),
        key: rewrapped.to_base64(),
    };
    let updated = accounts.update_password(update).await.map_err(CryptoError::from);
    session.observe(updated).await?;

    info!(user = %identity.username, "password changed, intermediate key re-wrapped");
    Ok(rewrapped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::RustCryptoProvider;

    fn test_params() -> KeyParams {
        KeyParams {
            modulus_bits: 1024,
            kdf_rounds: 10,
        }
    }

    fn provider() -> Arc<dyn PrimitiveProvider> {
        Arc::new(RustCryptoProvider::new())
    }

    async fn loaded_session() -> (Session, AccountSetup) {
        let p = provider();
        let id = Identity::new("alice", "example.com");
        let setup = setup_account(&p, &id, &SecretString::from("hunter2"), test_params())
            .await
            .unwrap();

        let session = Session::new(p, test_params());
        session.set_identity(id).await;
        session
            .retrieve_intermediate_key(&setup.wrapped_ik, &setup.credentials)
            .await
            .unwrap();
        session
            .load_private_keys(MAIL_SERVICE, &setup.private_keys.to_bytes().unwrap())
            .await
            .unwrap();
        (session, setup)
    }

    #[tokio::test]
    async fn test_setup_produces_wrapped_artifacts() {
        let (_, setup) = loaded_session().await;
        assert_eq!(setup.wrapped_ik.wrapped.len(), 48, "32-byte IK plus a padding block");
        assert_ne!(setup.private_keys.iv_pdk, setup.private_keys.iv_psk, "independent IVs");
        assert_eq!(setup.public_keys.encrypt.alg, "RSA-OAEP-256");
        assert_eq!(setup.public_keys.verify.alg, "RS256");

        let reg = setup.registration().unwrap();
        assert_eq!(reg.username, "alice");
        assert_eq!(reg.key.len(), IV_SIZE + 48);
    }

    #[tokio::test]
    async fn test_private_keys_unwrap_per_call() {
        let (session, setup) = loaded_session().await;
        assert!(session.is_loaded(MAIL_SERVICE).await);

        let pdk = session.private_decryption_key(MAIL_SERVICE).await.unwrap();
        let published = crate::keys::jwk_to_public_key(&setup.public_keys.encrypt).unwrap();
        assert_eq!(RsaPublicKey::from(&pdk), published);

        let psk = session.private_sign_key(MAIL_SERVICE).await.unwrap();
        let verify = crate::keys::jwk_to_public_key(&setup.public_keys.verify).unwrap();
        assert_eq!(RsaPublicKey::from(&psk), verify);
    }

    #[tokio::test]
    async fn test_wrong_password_clears_session() {
        let (session, setup) = loaded_session().await;
        let wrong = Credentials::derive(
            session.provider(),
            &setup.identity,
            &SecretString::from("not-the-password"),
            test_params().kdf_rounds,
        )
        .await
        .unwrap();

        let result = session
            .retrieve_intermediate_key(&setup.wrapped_ik, &wrong)
            .await;
        assert!(matches!(result, Err(CryptoError::Unwrap(_))));
        assert!(!session.has_intermediate_key().await);
        assert!(session.identity().await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_service_not_loaded() {
        let (session, _) = loaded_session().await;
        assert!(matches!(
            session.private_decryption_key(STORAGE_SERVICE).await,
            Err(CryptoError::NotLoaded(_))
        ));
    }

    #[tokio::test]
    async fn test_clear_wipes_everything() {
        let (session, _) = loaded_session().await;
        session.clear().await;
        assert!(!session.is_loaded(MAIL_SERVICE).await);
        assert!(matches!(
            session.private_sign_key(MAIL_SERVICE).await,
            Err(CryptoError::NotLoaded("intermediate key"))
        ));
    }

    #[tokio::test]
    async fn test_sign_key_cache_toggle() {
        let (session, _) = loaded_session().await;
        session.set_cache_sign_key(true).await;
        let first = session.private_sign_key(MAIL_SERVICE).await.unwrap();
        let second = session.private_sign_key(MAIL_SERVICE).await.unwrap();
        assert_eq!(first, second);

        session.set_cache_sign_key(false).await;
        let state = session.state.read().await;
        assert!(state.services[MAIL_SERVICE].cached_sign_key.is_none());
    }

    #[tokio::test]
    async fn test_ik_rewrap_uses_fresh_iv() {
        let p = RustCryptoProvider::new();
        let creds = Credentials::derive(
            &provider(),
            &Identity::new("bob", "example.com"),
            &SecretString::from("pw"),
            10,
        )
        .await
        .unwrap();
        let ik = SymmetricKey::generate(&p);

        let a = wrap_intermediate_key(&p, &ik, &creds).unwrap();
        let b = wrap_intermediate_key(&p, &ik, &creds).unwrap();
        assert_ne!(a.iv, b.iv);
        assert_eq!(unwrap_intermediate_key(&p, &a, &creds).unwrap(), ik);
        assert_eq!(unwrap_intermediate_key(&p, &b, &creds).unwrap(), ik);
    }
}
