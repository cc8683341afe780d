use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level client configuration (loaded from strongbox.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StrongboxConfig {
    pub client: ClientConfig,
    pub remote: RemoteConfig,
    pub crypto: CryptoConfig,
    pub transfer: TransferConfig,
    pub directory: DirectoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
    /// Where the CLI remembers the last account address
    pub state_dir: PathBuf,
}

/// Which collaborator implementation backs the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// In-process server over an in-memory store (tests, demos)
    Memory,
    /// In-process server over a local directory
    Fs,
    /// In-process server over an S3-compatible bucket
    S3,
    /// Remote webmail server over HTTPS
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub backend: Backend,
    /// Base URL of the webmail server (http backend)
    pub base_url: String,
    /// Root directory for the fs backend
    pub root: PathBuf,
    /// S3 endpoint (s3 backend)
    pub endpoint: String,
    /// S3 region (default: us-east-1)
    pub region: String,
    /// S3 bucket
    pub bucket: String,
    /// Refuse plaintext HTTP endpoints instead of warning
    pub enforce_tls: bool,
    /// Key store service name: "mail" or "storage"
    pub service: String,
}

/// How per-part AES and HMAC keys are obtained from the content-derived raw key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartKeying {
    /// Raw key used directly for both AES and HMAC (wire compatible with stored data)
    #[default]
    Compatible,
    /// Separate AES and HMAC subkeys expanded from the raw key with HKDF-SHA256
    DomainSeparated,
}

/// E2E encryption configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// PBKDF2-HMAC-SHA256 rounds for password derivation (default: 5000)
    pub kdf_rounds: u32,
    /// RSA modulus size for new key pairs (default: 2048)
    pub rsa_modulus_bits: usize,
    /// File part size in bytes (default: 4 MiB)
    pub part_size: u64,
    pub part_keying: PartKeying,
    /// Keep the unwrapped signing key for the rest of the session
    pub cache_sign_key: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueOrder {
    #[default]
    Fifo,
    Lifo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Maximum concurrent part uploads (default: 5)
    pub max_upload_jobs: usize,
    /// Maximum concurrent part downloads (default: 5)
    pub max_download_jobs: usize,
    pub queue_order: QueueOrder,
    /// Times a failed part job is resubmitted (default: 0)
    pub max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Maximum usernames per batch public key lookup (default: 10)
    pub max_batch: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            log_format: "text".into(),
            state_dir: PathBuf::from("~/.local/share/strongbox"),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Fs,
            base_url: "https://localhost:8443".into(),
            root: PathBuf::from("~/.local/share/strongbox/server"),
            endpoint: "http://localhost:8333".into(),
            region: "us-east-1".into(),
            bucket: "strongbox".into(),
            enforce_tls: false,
            service: "mail".into(),
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            kdf_rounds: 5000,
            rsa_modulus_bits: 2048,
            part_size: 4 * 1024 * 1024,
            part_keying: PartKeying::Compatible,
            cache_sign_key: false,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_upload_jobs: 5,
            max_download_jobs: 5,
            queue_order: QueueOrder::Fifo,
            max_retries: 0,
        }
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self { max_batch: 10 }
    }
}
