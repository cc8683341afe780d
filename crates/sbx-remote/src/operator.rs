//! OpenDAL Operator factory for the local server backends

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use opendal::Operator;
use sbx_core::config::{Backend, RemoteConfig};

/// S3 credentials, read from the environment by the caller
#[derive(Debug, Clone)]
pub struct S3Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

/// `~/x` → `$HOME/x`; other paths are returned unchanged.
pub fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}

fn finish<B: opendal::Builder>(builder: B, what: &str) -> Result<Operator> {
    let op = Operator::new(builder)
        .with_context(|| format!("creating OpenDAL {what} operator"))?
        .layer(opendal::layers::LoggingLayer::default())
        .layer(
            opendal::layers::RetryLayer::new()
                .with_max_times(5)
                .with_jitter(),
        )
        .finish();
    Ok(op)
}

/// Build the operator behind a [`LocalServer`](crate::LocalServer).
///
/// The S3 backend needs `credentials`. If `enforce_tls` is set, a plaintext
/// `http://` S3 endpoint is an error; otherwise it is logged as a warning.
pub fn build_operator(
    remote: &RemoteConfig,
    credentials: Option<&S3Credentials>,
) -> Result<Operator> {
    match remote.backend {
        Backend::Memory => finish(opendal::services::Memory::default(), "memory"),
        Backend::Fs => {
            let root = expand_home(&remote.root);
            let root = root
                .to_str()
                .with_context(|| format!("server root is not valid UTF-8: {}", root.display()))?;
            finish(opendal::services::Fs::default().root(root), "fs")
        }
        Backend::S3 => {
            if remote.endpoint.starts_with("http://") {
                if remote.enforce_tls {
                    anyhow::bail!(
                        "S3 endpoint uses plaintext HTTP ({}), but enforce_tls is enabled. \
                         Use an HTTPS endpoint or set remote.enforce_tls = false \
                         for local development.",
                        remote.endpoint
                    );
                }
                tracing::warn!(
                    endpoint = %remote.endpoint,
                    "S3 endpoint uses plaintext HTTP; \
                     set remote.enforce_tls = true and use HTTPS in production"
                );
            }
            let creds = credentials.context(
                "S3 credentials not set\n\
                 Set AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY environment variables.",
            )?;
            // Path-style addressing is the default, as SeaweedFS and MinIO need
            let builder = opendal::services::S3::default()
                .endpoint(&remote.endpoint)
                .region(&remote.region)
                .bucket(&remote.bucket)
                .access_key_id(&creds.access_key_id)
                .secret_access_key(&creds.secret_access_key);
            finish(builder, "S3")
        }
        Backend::Http => {
            anyhow::bail!("the http backend talks to a remote server and has no local store")
        }
    }
}
