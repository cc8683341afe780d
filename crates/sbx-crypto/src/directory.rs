//! Public key directory cache
//!
//! Maps normalized usernames to imported public keys for one service. Entries
//! are fetched lazily and kept until the session ends, except that
//! [`PublicKeyDirectory::invalidate`] drops a single entry when its owner is
//! known to have rotated keys.

use std::collections::HashMap;
use std::sync::Arc;

use rsa::RsaPublicKey;
use sbx_core::api::DirectoryService;
use sbx_core::config::DirectoryConfig;
use sbx_core::types::PublicKeyBundle;
use sbx_core::SbxError;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{CryptoError, CryptoResult};
use crate::keys::jwk_to_public_key;
use crate::MAX_RECIPIENTS;

/// Which half of a user's published keys to return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Encrypt,
    Verify,
}

/// A user's imported public keys.
#[derive(Debug, Clone, PartialEq)]
pub struct PublicKeys {
    pub encrypt: RsaPublicKey,
    pub verify: RsaPublicKey,
}

impl PublicKeys {
    pub fn from_bundle(bundle: &PublicKeyBundle) -> CryptoResult<Self> {
        Ok(Self {
            encrypt: jwk_to_public_key(&bundle.encrypt)?,
            verify: jwk_to_public_key(&bundle.verify)?,
        })
    }

    pub fn get(&self, kind: KeyType) -> &RsaPublicKey {
        match kind {
            KeyType::Encrypt => &self.encrypt,
            KeyType::Verify => &self.verify,
        }
    }
}

/// `alice@example.com` → `alice`. Whitespace around the local part is dropped.
pub fn normalize_username(email: &str) -> String {
    email.split('@').next().unwrap_or_default().trim().to_owned()
}

fn lookup_error(user: &str, e: SbxError) -> CryptoError {
    match e {
        SbxError::SessionExpired => CryptoError::SessionExpired,
        other => CryptoError::DirectoryLookup {
            user: user.to_owned(),
            reason: other.to_string(),
        },
    }
}

pub struct PublicKeyDirectory {
    service: String,
    remote: Arc<dyn DirectoryService>,
    max_batch: usize,
    cache: RwLock<HashMap<String, Arc<PublicKeys>>>,
}

impl PublicKeyDirectory {
    /// `max_batch` is clamped to the platform fan-out limit.
    pub fn new(
        service: impl Into<String>,
        remote: Arc<dyn DirectoryService>,
        max_batch: usize,
    ) -> Self {
        Self {
            service: service.into(),
            remote,
            max_batch: max_batch.clamp(1, MAX_RECIPIENTS),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(
        service: impl Into<String>,
        remote: Arc<dyn DirectoryService>,
        config: &DirectoryConfig,
    ) -> Self {
        Self::new(service, remote, config.max_batch)
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Largest username list a single batch lookup accepts.
    pub fn max_batch(&self) -> usize {
        self.max_batch
    }

    /// Return one of `user`'s public keys, fetching them on a cache miss.
    pub async fn get_public_key(&self, user: &str, kind: KeyType) -> CryptoResult<RsaPublicKey> {
        let keys = self.lookup(user).await?;
        Ok(keys.get(kind).clone())
    }

    /// Cached entry for `user`, or a single-user fetch on a miss.
    pub async fn lookup(&self, user: &str) -> CryptoResult<Arc<PublicKeys>> {
        let username = normalize_username(user);
        if let Some(hit) = self.cache.read().await.get(&username) {
            return Ok(Arc::clone(hit));
        }

        debug!(user = %username, service = %self.service, "public key cache miss");
        let bundle = self
            .remote
            .fetch_public_keys(&self.service, &username)
            .await
            .map_err(|e| lookup_error(&username, e))?;
        let keys = Arc::new(PublicKeys::from_bundle(&bundle).map_err(|e| {
            CryptoError::DirectoryLookup {
                user: username.clone(),
                reason: e.to_string(),
            }
        })?);

        self.cache
            .write()
            .await
            .insert(username, Arc::clone(&keys));
        Ok(keys)
    }

    /// Warm the cache for a recipient list with a single batch request.
    ///
    /// Already-cached and empty usernames are skipped. Users the directory
    /// does not know are simply absent afterwards; a later
    /// [`get_public_key`](Self::get_public_key) for them fails with
    /// `DirectoryLookup`. Returns the number of entries fetched.
    pub async fn get_recipients_public_keys<S: AsRef<str>>(
        &self,
        emails: &[S],
    ) -> CryptoResult<usize> {
        if emails.is_empty() {
            return Err(CryptoError::NoRecipients);
        }
        if emails.len() > self.max_batch {
            return Err(CryptoError::TooManyRecipients {
                count: emails.len(),
                max: self.max_batch,
            });
        }

        let missing: Vec<String> = {
            let cache = self.cache.read().await;
            let mut missing: Vec<String> = Vec::new();
            for email in emails {
                let username = normalize_username(email.as_ref());
                if username.is_empty()
                    || cache.contains_key(&username)
                    || missing.contains(&username)
                {
                    continue;
                }
                missing.push(username);
            }
            missing
        };
        if missing.is_empty() {
            return Ok(0);
        }

        let entries = self
            .remote
            .fetch_public_keys_batch(&self.service, &missing)
            .await
            .map_err(|e| lookup_error(&missing.join(","), e))?;

        let mut fetched = 0;
        let mut cache = self.cache.write().await;
        for entry in entries {
            match PublicKeys::from_bundle(&entry.public_keys) {
                Ok(keys) => {
                    cache.insert(normalize_username(&entry.username), Arc::new(keys));
                    fetched += 1;
                }
                Err(e) => {
                    warn!(user = %entry.username, error = %e, "skipping unusable public keys")
                }
            }
        }
        debug!(requested = missing.len(), fetched, "public keys fetched");
        Ok(fetched)
    }

    /// Seed the cache, e.g. with the account's own keys after login.
    pub async fn insert(&self, user: &str, bundle: &PublicKeyBundle) -> CryptoResult<()> {
        let keys = PublicKeys::from_bundle(bundle)?;
        self.cache
            .write()
            .await
            .insert(normalize_username(user), Arc::new(keys));
        Ok(())
    }

    /// Forget `user`'s keys so the next lookup refetches them.
    pub async fn invalidate(&self, user: &str) -> bool {
        self.cache
            .write()
            .await
            .remove(&normalize_username(user))
            .is_some()
    }

    pub async fn clear(&self) {
        self.cache.write().await.clear();
    }

    pub async fn is_cached(&self, user: &str) -> bool {
        self.cache.read().await.contains_key(&normalize_username(user))
    }

    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.cache.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{public_key_to_jwk, KeyUse};
    use crate::provider::{PrimitiveProvider, RustCryptoProvider};
    use async_trait::async_trait;
    use sbx_core::types::DirectoryEntry;
    use sbx_core::SbxResult;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeDirectory {
        bundle: PublicKeyBundle,
        known: Vec<&'static str>,
        single_calls: AtomicUsize,
        batch_calls: AtomicUsize,
    }

    #[async_trait]
    impl DirectoryService for FakeDirectory {
        async fn fetch_public_keys(
            &self,
            _service: &str,
            username: &str,
        ) -> SbxResult<PublicKeyBundle> {
            self.single_calls.fetch_add(1, Ordering::SeqCst);
            if self.known.contains(&username) {
                Ok(self.bundle.clone())
            } else {
                Err(SbxError::NotFound(username.to_owned()))
            }
        }

        async fn fetch_public_keys_batch(
            &self,
            _service: &str,
            usernames: &[String],
        ) -> SbxResult<Vec<DirectoryEntry>> {
            self.batch_calls.fetch_add(1, Ordering::SeqCst);
            Ok(usernames
                .iter()
                .filter(|u| self.known.contains(&u.as_str()))
                .map(|u| DirectoryEntry {
                    username: u.clone(),
                    public_keys: self.bundle.clone(),
                })
                .collect())
        }
    }

    fn fake(known: Vec<&'static str>) -> Arc<FakeDirectory> {
        let p = RustCryptoProvider::new();
        let key = RsaPublicKey::from(&p.generate_rsa_key(1024).unwrap());
        Arc::new(FakeDirectory {
            bundle: PublicKeyBundle {
                encrypt: public_key_to_jwk(&key, KeyUse::Encrypt),
                verify: public_key_to_jwk(&key, KeyUse::Verify),
            },
            known,
            single_calls: AtomicUsize::new(0),
            batch_calls: AtomicUsize::new(0),
        })
    }

    #[test]
    fn test_normalize_username() {
        assert_eq!(normalize_username("alice@example.com"), "alice");
        assert_eq!(normalize_username(" bob "), "bob");
        assert_eq!(normalize_username("carol@a@b"), "carol");
        assert_eq!(normalize_username("@example.com"), "");
    }

    #[tokio::test]
    async fn test_lookup_caches() {
        let remote = fake(vec!["alice"]);
        let dir = PublicKeyDirectory::new("mail", remote.clone(), 10);

        dir.get_public_key("alice@example.com", KeyType::Encrypt).await.unwrap();
        dir.get_public_key("alice", KeyType::Verify).await.unwrap();
        assert_eq!(remote.single_calls.load(Ordering::SeqCst), 1, "second lookup is a cache hit");
    }

    #[tokio::test]
    async fn test_unknown_user_is_lookup_error() {
        let dir = PublicKeyDirectory::new("mail", fake(vec![]), 10);
        let err = dir.get_public_key("mallory", KeyType::Encrypt).await.unwrap_err();
        assert!(matches!(err, CryptoError::DirectoryLookup { ref user, .. } if user == "mallory"));
    }

    #[tokio::test]
    async fn test_batch_skips_cached_and_empty() {
        let remote = fake(vec!["alice", "bob"]);
        let dir = PublicKeyDirectory::new("mail", remote.clone(), 10);
        dir.get_public_key("alice", KeyType::Encrypt).await.unwrap();

        let fetched = dir
            .get_recipients_public_keys(&["alice@x.org", "bob@x.org", "@x.org", "bob", "zed"])
            .await
            .unwrap();
        assert_eq!(fetched, 1, "only bob is new and known");
        assert!(dir.is_cached("bob").await);
        assert!(!dir.is_cached("zed").await);
        assert_eq!(remote.batch_calls.load(Ordering::SeqCst), 1);

        assert_eq!(dir.get_recipients_public_keys(&["alice", "bob"]).await.unwrap(), 0);
        assert_eq!(remote.batch_calls.load(Ordering::SeqCst), 1, "fully cached list makes no call");
    }

    #[tokio::test]
    async fn test_batch_limits() {
        let remote = fake(vec![]);
        let dir = PublicKeyDirectory::new("mail", remote.clone(), 10);

        let empty: [&str; 0] = [];
        assert!(matches!(
            dir.get_recipients_public_keys(&empty).await,
            Err(CryptoError::NoRecipients)
        ));

        let eleven: Vec<String> = (0..11).map(|i| format!("user{i}")).collect();
        assert!(matches!(
            dir.get_recipients_public_keys(&eleven).await,
            Err(CryptoError::TooManyRecipients { count: 11, max: 10 })
        ));
        assert_eq!(remote.batch_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let remote = fake(vec!["alice"]);
        let dir = PublicKeyDirectory::new("mail", remote.clone(), 10);
        dir.lookup("alice").await.unwrap();

        assert!(dir.invalidate("alice@example.com").await);
        assert!(!dir.invalidate("alice").await);
        dir.lookup("alice").await.unwrap();
        assert_eq!(remote.single_calls.load(Ordering::SeqCst), 2);

        dir.clear().await;
        assert!(dir.is_empty().await);
    }
}
