//! strongbox: end-to-end encrypted mail and file storage client
//!
//! Account commands:
//!   setup               - generate key material and register an account
//!   login               - authenticate and unlock the key stores
//!   passwd              - change the password (re-wraps the intermediate key)
//!
//! Mail commands:
//!   seal --to <user> <file>   - encrypt a message for its recipients and send it
//!   open <uuid> --from <user> - fetch, verify and decrypt a message
//!
//! Storage commands:
//!   put <file>          - encrypt and upload a file in parts
//!   get <item> <out>    - download, verify and decrypt a file item

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use sbx_core::api::{AccountService, DirectoryService, MessageService, StorageService};
use sbx_core::config::{Backend, StrongboxConfig};
use sbx_core::types::{FileBody, Identity, ItemBody, MessageKind};
use sbx_core::SbxError;
use sbx_crypto::item::{parse_meta, to_meta};
use sbx_crypto::{
    change_password, login, setup_account, Decrypter, Encrypter, ItemCodec, KeyParams,
    PrimitiveProvider, PublicKeyDirectory, Recipients, Session, MAIL_SERVICE, STORAGE_SERVICE,
};
use sbx_remote::operator::expand_home;
use sbx_remote::{build_operator, HttpApi, LocalServer, S3Credentials};
use sbx_transfer::{
    download_file, download_file_lenient, upload_file, JobQueue, PartPipeline, ProgressFn,
};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "strongbox",
    version,
    about = "End-to-end encrypted mail and file storage client"
)]
struct Cli {
    /// Path to strongbox.toml configuration file
    #[arg(long, short = 'c', env = "SBX_CONFIG", default_value = "~/.config/strongbox/config.toml")]
    config: PathBuf,

    /// Log level or filter directive (overrides config client.log_level)
    #[arg(long, env = "SBX_LOG")]
    log: Option<String>,

    /// Log output format (overrides config client.log_format)
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// Account as user@domain (default: the last account logged in)
    #[arg(long, short = 'u', env = "SBX_USER", global = true)]
    user: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create an account: key material is generated locally, only wrapped
    /// keys and the derived account password reach the server
    Setup,

    /// Authenticate and unlock the mail key store
    Login,

    /// Change the account password
    Passwd,

    /// Encrypt a message and send it
    ///
    /// The file is sent as-is when it holds a JSON object, otherwise it
    /// becomes the message body.
    Seal {
        /// Message file
        file: PathBuf,
        #[arg(long, value_delimiter = ',', required_unless_present = "plain")]
        to: Vec<String>,
        #[arg(long, value_delimiter = ',')]
        cc: Vec<String>,
        #[arg(long, value_delimiter = ',')]
        bcc: Vec<String>,
        /// Subject for plain text bodies
        #[arg(long, short = 's', default_value = "")]
        subject: String,
        /// Store as a draft instead of sending
        #[arg(long)]
        draft: bool,
        /// Only the sender can decrypt (external recipients)
        #[arg(long)]
        plain: bool,
    },

    /// Fetch and decrypt a message
    Open {
        /// Message UUID
        uuid: String,
        /// Expected sender; the signature is checked against their key
        #[arg(long)]
        from: String,
    },

    /// Encrypt and upload a file
    Put {
        file: PathBuf,
        /// MIME type stored with the file
        #[arg(long, default_value = "application/octet-stream")]
        mime: String,
    },

    /// Download and decrypt a file item
    Get {
        /// Item id printed by `put`
        item: String,
        /// Destination path
        out: PathBuf,
        /// Check every part and report the damaged ones instead of stopping
        /// at the first failure
        #[arg(long)]
        lenient: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = expand_home(&cli.config);
    let loaded = load_config(&config_path).await?;
    let config = loaded.clone().unwrap_or_default();

    let level = cli.log.as_deref().unwrap_or(&config.client.log_level);
    let format = cli.log_format.unwrap_or(match config.client.log_format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    });
    init_logging(level, format);
    if loaded.is_none() {
        warn!("config file not found: {}  (using defaults)", config_path.display());
    }

    let user = cli.user.as_deref();
    match cli.command {
        Commands::Config { action: ConfigAction::Show } => {
            cmd_config_show(&config, &config_path, loaded.is_some())
        }
        Commands::Setup => cmd_setup(&config, user).await,
        Commands::Login => cmd_login(&config, user).await,
        Commands::Passwd => cmd_passwd(&config, user).await,
        Commands::Seal { file, to, cc, bcc, subject, draft, plain } => {
            let recipients = Recipients { to, cc, bcc, from: Vec::new() };
            cmd_seal(&config, user, &file, recipients, &subject, draft, plain).await
        }
        Commands::Open { uuid, from } => cmd_open(&config, user, &uuid, &from).await,
        Commands::Put { file, mime } => cmd_put(&config, user, &file, &mime).await,
        Commands::Get { item, out, lenient } => cmd_get(&config, user, &item, &out, lenient).await,
    }
}

fn init_logging(level: &str, format: LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    // Logs go to stderr so decrypted output on stdout stays clean
    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

// ── Config loading ────────────────────────────────────────────────────────────

/// `None` when no file exists at `path`.
async fn load_config(path: &Path) -> Result<Option<StrongboxConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading config: {}", path.display()))?;
    let config = toml::from_str(&content)
        .with_context(|| format!("parsing config: {}", path.display()))?;
    Ok(Some(config))
}

// ── Identity and passwords ────────────────────────────────────────────────────

fn parse_identity(address: &str) -> Result<Identity> {
    match address.trim().split_once('@') {
        Some((user, domain)) if !user.is_empty() && !domain.is_empty() => {
            Ok(Identity::new(user, domain))
        }
        _ => anyhow::bail!("expected an account address like alice@example.com, got {address:?}"),
    }
}

fn identity_file(config: &StrongboxConfig) -> PathBuf {
    expand_home(&config.client.state_dir).join("identity")
}

/// CLI flag > last account logged in on this machine.
fn resolve_identity(config: &StrongboxConfig, user: Option<&str>) -> Result<Identity> {
    if let Some(address) = user {
        return parse_identity(address);
    }
    let path = identity_file(config);
    let remembered = std::fs::read_to_string(&path).with_context(|| {
        format!(
            "no account given: pass --user or run `strongbox login` first ({})",
            path.display()
        )
    })?;
    parse_identity(&remembered)
}

/// Only the address is kept; keys never touch the disk.
fn remember_identity(config: &StrongboxConfig, identity: &Identity) -> Result<()> {
    let path = identity_file(config);
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating state dir: {}", dir.display()))?;
    }
    std::fs::write(&path, identity.email()).with_context(|| format!("writing {}", path.display()))
}

fn read_password(prompt: &str) -> Result<SecretString> {
    if let Ok(password) = std::env::var("SBX_PASSWORD") {
        return Ok(SecretString::from(password));
    }
    let password = rpassword::prompt_password(prompt).context("reading password")?;
    Ok(SecretString::from(password))
}

/// New password from `SBX_NEW_PASSWORD`, or prompted twice.
fn read_new_password() -> Result<SecretString> {
    let password = match std::env::var("SBX_NEW_PASSWORD") {
        Ok(password) => password,
        Err(_) => {
            let first = rpassword::prompt_password("New password: ").context("reading password")?;
            let second =
                rpassword::prompt_password("Repeat new password: ").context("reading password")?;
            if first != second {
                anyhow::bail!("passwords do not match");
            }
            first
        }
    };
    if password.is_empty() {
        anyhow::bail!("password must not be empty");
    }
    Ok(SecretString::from(password))
}

// ── Remote services ───────────────────────────────────────────────────────────

/// The four server-side collaborators, all backed by the same object.
struct Remote {
    accounts: Arc<dyn AccountService>,
    directory: Arc<dyn DirectoryService>,
    messages: Arc<dyn MessageService>,
    storage: Arc<dyn StorageService>,
}

impl Remote {
    fn from_impl<S>(server: Arc<S>) -> Self
    where
        S: AccountService + DirectoryService + MessageService + StorageService + 'static,
    {
        Self {
            accounts: server.clone(),
            directory: server.clone(),
            messages: server.clone(),
            storage: server,
        }
    }
}

/// Reads AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY (standard S3 env vars).
fn s3_credentials_from_env() -> Option<S3Credentials> {
    let access_key_id = std::env::var("AWS_ACCESS_KEY_ID").ok()?;
    let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY").ok()?;
    Some(S3Credentials {
        access_key_id,
        secret_access_key,
    })
}

fn connect(config: &StrongboxConfig, provider: &Arc<dyn PrimitiveProvider>) -> Result<Remote> {
    let remote = &config.remote;
    match remote.backend {
        Backend::Http => {
            let api = HttpApi::from_config(remote).context("creating HTTP client")?;
            info!(url = %remote.base_url, "using remote server");
            Ok(Remote::from_impl(Arc::new(api)))
        }
        backend => {
            if backend == Backend::Memory {
                warn!("memory backend: nothing outlives this process");
            }
            let op = build_operator(remote, s3_credentials_from_env().as_ref())
                .context("building storage operator")?;
            Ok(Remote::from_impl(Arc::new(LocalServer::new(op, provider.clone()))))
        }
    }
}

/// Everything one invocation needs: provider, services and an unlocked session.
struct Client {
    config: StrongboxConfig,
    provider: Arc<dyn PrimitiveProvider>,
    remote: Remote,
    identity: Identity,
    session: Session,
}

impl Client {
    async fn login(
        config: &StrongboxConfig,
        user: Option<&str>,
        password: &SecretString,
    ) -> Result<Self> {
        let identity = resolve_identity(config, user)?;
        let provider = sbx_crypto::detect();
        let remote = connect(config, &provider)?;

        let session = Session::new(provider.clone(), KeyParams::from(&config.crypto));
        session.set_cache_sign_key(config.crypto.cache_sign_key).await;
        login(&session, remote.accounts.as_ref(), &identity, password, &[MAIL_SERVICE])
            .await
            .with_context(|| format!("logging in as {}", identity.email()))?;

        Ok(Self {
            config: config.clone(),
            provider,
            remote,
            identity,
            session,
        })
    }

    fn directory(&self, service: &str) -> PublicKeyDirectory {
        PublicKeyDirectory::from_config(
            service,
            self.remote.directory.clone(),
            &self.config.directory,
        )
    }

    /// Load the storage key store, creating it on first use.
    async fn unlock_storage(&self) -> Result<()> {
        let user = &self.identity.username;
        match self.remote.accounts.fetch_private_keys(user, STORAGE_SERVICE).await {
            Ok(bundle) => self.session.load_private_keys(STORAGE_SERVICE, &bundle).await?,
            Err(SbxError::NotFound(_)) => {
                info!(user = %user, "no storage key store yet, creating one");
                self.session
                    .setup_service_keys(self.remote.accounts.as_ref(), STORAGE_SERVICE)
                    .await
                    .context("creating storage key store")?;
            }
            Err(e) => return Err(e).context("fetching storage keys"),
        }
        Ok(())
    }

    fn pipeline(&self) -> PartPipeline {
        PartPipeline::from_config(
            self.remote.storage.clone(),
            self.provider.clone(),
            &self.config.crypto,
            &self.config.transfer,
        )
    }
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_interrupt() -> CancellationToken {
    let token = CancellationToken::new();
    let on_signal = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling transfer");
            on_signal.cancel();
        }
    });
    token
}

// ── Progress bar helpers ──────────────────────────────────────────────────────

fn make_progress_bar(total: u64, prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::with_template(
        "{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
    )
    .map(|s| s.progress_chars("=>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn progress_for(pb: &ProgressBar) -> ProgressFn {
    let pb = pb.clone();
    Box::new(move |done, total, msg| {
        pb.set_length(total);
        pb.set_position(done);
        pb.set_message(msg.to_string());
    })
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

// ── `strongbox setup` / `login` / `passwd` ────────────────────────────────────

async fn cmd_setup(config: &StrongboxConfig, user: Option<&str>) -> Result<()> {
    let address = user.context("setup needs the new account address: --user alice@example.com")?;
    let identity = parse_identity(address)?;
    let password = read_new_password()?;

    let provider = sbx_crypto::detect();
    let remote = connect(config, &provider)?;

    println!(
        "Generating {}-bit key pairs for {}...",
        config.crypto.rsa_modulus_bits,
        identity.email()
    );
    let setup = setup_account(&provider, &identity, &password, KeyParams::from(&config.crypto))
        .await
        .context("generating key material")?;
    remote
        .accounts
        .register(setup.registration()?)
        .await
        .with_context(|| format!("registering {}", identity.email()))?;
    remember_identity(config, &identity)?;

    println!("Account {} created.", identity.email());
    Ok(())
}

async fn cmd_login(config: &StrongboxConfig, user: Option<&str>) -> Result<()> {
    let password = read_password("Password: ")?;
    let client = Client::login(config, user, &password).await?;
    remember_identity(config, &client.identity)?;

    println!("Logged in as {}", client.identity.email());
    if let Some(keys) = client.session.public_keys(MAIL_SERVICE).await {
        println!("  encrypt key: {}…", &keys.encrypt.n[..16.min(keys.encrypt.n.len())]);
        println!("  verify key:  {}…", &keys.verify.n[..16.min(keys.verify.n.len())]);
    }
    Ok(())
}

async fn cmd_passwd(config: &StrongboxConfig, user: Option<&str>) -> Result<()> {
    let old = read_password("Current password: ")?;
    let new = read_new_password()?;
    if old.expose_secret() == new.expose_secret() {
        anyhow::bail!("new password is the same as the current one");
    }

    let client = Client::login(config, user, &old).await?;
    change_password(
        &client.session,
        client.remote.accounts.as_ref(),
        &client.identity,
        &old,
        &new,
    )
    .await
    .context("changing password")?;

    println!("Password changed for {}.", client.identity.email());
    Ok(())
}

// ── `strongbox seal` / `open` ─────────────────────────────────────────────────

/// JSON objects are sent as-is; anything else becomes `{subject, body}`.
fn message_payload(content: &str, subject: &str) -> Value {
    match serde_json::from_str::<Value>(content) {
        Ok(value) if value.is_object() => value,
        _ => json!({ "subject": subject, "body": content }),
    }
}

async fn cmd_seal(
    config: &StrongboxConfig,
    user: Option<&str>,
    file: &Path,
    mut recipients: Recipients,
    subject: &str,
    draft: bool,
    plain: bool,
) -> Result<()> {
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    let payload = message_payload(&content, subject);

    let password = read_password("Password: ")?;
    let client = Client::login(config, user, &password).await?;
    recipients.from = vec![client.identity.username.clone()];

    let directory = client.directory(MAIL_SERVICE);
    let envelope = Encrypter::new(&client.session, &directory)
        .encrypt(&payload, &recipients, plain)
        .await
        .context("encrypting message")?;

    let kind = if draft { MessageKind::Draft } else { MessageKind::Message };
    let uuid = client
        .remote
        .messages
        .send_message(kind, envelope.upload(&recipients)?)
        .await
        .context("sending message")?;

    println!("{uuid}");
    info!(uuid = %uuid, holders = envelope.keys.len(), ?kind, "message stored");
    Ok(())
}

async fn cmd_open(
    config: &StrongboxConfig,
    user: Option<&str>,
    uuid: &str,
    from: &str,
) -> Result<()> {
    let password = read_password("Password: ")?;
    let client = Client::login(config, user, &password).await?;

    let blob = client
        .remote
        .messages
        .fetch_message(uuid, &client.identity.username)
        .await
        .with_context(|| format!("fetching message {uuid}"))?;
    let directory = client.directory(MAIL_SERVICE);
    let message: Value = Decrypter::new(&client.session, &directory)
        .decrypt_message(&blob, from)
        .await
        .with_context(|| format!("opening message {uuid}"))?;

    println!("{}", serde_json::to_string_pretty(&message)?);
    Ok(())
}

// ── `strongbox put` / `get` ───────────────────────────────────────────────────

fn unix_millis(time: std::io::Result<SystemTime>) -> i64 {
    time.ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

async fn cmd_put(
    config: &StrongboxConfig,
    user: Option<&str>,
    file: &Path,
    mime: &str,
) -> Result<()> {
    let metadata = tokio::fs::metadata(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    if !metadata.is_file() {
        anyhow::bail!("not a regular file: {}", file.display());
    }
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .context("file has no name")?;
    let created = unix_millis(metadata.created());
    let modified = unix_millis(metadata.modified());
    let data = Bytes::from(
        tokio::fs::read(file)
            .await
            .with_context(|| format!("reading {}", file.display()))?,
    );

    let password = read_password("Password: ")?;
    let client = Client::login(config, user, &password).await?;
    client.unlock_storage().await?;
    let directory = client.directory(STORAGE_SERVICE);
    let codec = ItemCodec::new(&client.session, &directory);

    // The item id names the parts, so the item exists (empty) before upload
    let pipeline = client.pipeline();
    let empty = ItemBody::File(FileBody {
        name: name.clone(),
        created,
        modified,
        size: 0,
        mime_type: mime.to_owned(),
        part_size: pipeline.part_size(),
        parts: Vec::new(),
    });
    let sealed = codec.encrypt_new_item_assignment(&empty).await?;
    let item_id = client
        .remote
        .storage
        .add_item(
            &client.identity.username,
            to_meta(&sealed.meta)?,
            sealed.wrapped_key.as_deref().map(|k| STANDARD.encode(k)),
        )
        .await
        .context("creating item")?;

    println!("Uploading {} → item {}", file.display(), item_id);
    let pb = make_progress_bar(data.len() as u64, "put");
    let progress = progress_for(&pb);
    let queue = JobQueue::uploads(&client.config.transfer);
    let cancel = cancel_on_interrupt();
    let result = upload_file(&pipeline, &queue, &item_id, data, &cancel, Some(&progress))
        .await
        .with_context(|| format!("uploading {}", file.display()))?;
    pb.finish_with_message("done".to_string());

    let body = ItemBody::File(result.file_body(&name, mime, created, modified));
    let updated = codec.encrypt_existing_item(&sealed.key, &body).await?;
    client
        .remote
        .storage
        .update_item(&item_id, to_meta(&updated)?)
        .await
        .context("storing part metadata")?;

    println!("  item:   {}", item_id);
    println!("  parts:  {}", result.parts.len());
    println!("  bytes:  {}", fmt_bytes(result.bytes));
    Ok(())
}

async fn cmd_get(
    config: &StrongboxConfig,
    user: Option<&str>,
    item_id: &str,
    out: &Path,
    lenient: bool,
) -> Result<()> {
    let password = read_password("Password: ")?;
    let client = Client::login(config, user, &password).await?;
    client.unlock_storage().await?;
    let directory = client.directory(STORAGE_SERVICE);
    let codec = ItemCodec::new(&client.session, &directory);

    let stored = client
        .remote
        .storage
        .get_item(item_id)
        .await
        .with_context(|| format!("fetching item {item_id}"))?;
    let wrapped = stored
        .item_key
        .as_deref()
        .with_context(|| format!("item {item_id} holds no key for {}", client.identity.username))?;
    let opened = codec
        .decrypt_item_assignment::<ItemBody>(&parse_meta(&stored.meta)?, &STANDARD.decode(wrapped)?)
        .await
        .with_context(|| format!("opening item {item_id}"))?;
    let ItemBody::File(file) = opened.json else {
        anyhow::bail!("item {item_id} is a directory");
    };

    println!("Downloading {} ({}) → {}", file.name, fmt_bytes(file.size), out.display());
    let pb = make_progress_bar(file.size, "get");
    let progress = progress_for(&pb);
    let pipeline = client.pipeline();
    let queue = JobQueue::downloads(&client.config.transfer);
    let cancel = cancel_on_interrupt();

    let data = if lenient {
        let partial =
            download_file_lenient(&pipeline, &queue, item_id, &file, &cancel, Some(&progress))
                .await?;
        if !partial.is_complete() {
            pb.abandon_with_message("damaged".to_string());
            anyhow::bail!("item {item_id}: parts {:?} failed verification", partial.failed_parts());
        }
        partial.assemble()?
    } else {
        download_file(&pipeline, &queue, item_id, &file, &cancel, Some(&progress))
            .await
            .with_context(|| format!("downloading item {item_id}"))?
    };
    pb.finish_with_message("done".to_string());

    tokio::fs::write(out, &data)
        .await
        .with_context(|| format!("writing {}", out.display()))?;
    println!("  local:  {}", out.display());
    println!("  bytes:  {}", fmt_bytes(data.len() as u64));
    Ok(())
}

// ── `strongbox config show` ───────────────────────────────────────────────────

fn cmd_config_show(config: &StrongboxConfig, config_path: &Path, from_file: bool) -> Result<()> {
    if from_file {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_identity() {
        let id = parse_identity("alice@example.com").unwrap();
        assert_eq!(id.username, "alice");
        assert_eq!(id.domain, "example.com");
        assert!(parse_identity("alice").is_err());
        assert!(parse_identity("@example.com").is_err());
        assert!(parse_identity("alice@").is_err());
    }

    #[test]
    fn test_message_payload() {
        let obj = message_payload(r#"{"subject":"s","body":"b","attachments":[]}"#, "ignored");
        assert_eq!(obj["subject"], "s");

        let text = message_payload("hello there", "greeting");
        assert_eq!(text, json!({"subject": "greeting", "body": "hello there"}));

        // JSON that is not an object is still just text
        let array = message_payload("[1,2]", "");
        assert_eq!(array["body"], "[1,2]");
    }

    #[test]
    fn test_remembered_identity() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = StrongboxConfig::default();
        config.client.state_dir = dir.path().to_path_buf();

        assert!(resolve_identity(&config, None).is_err());
        remember_identity(&config, &Identity::new("bob", "example.org")).unwrap();
        let id = resolve_identity(&config, None).unwrap();
        assert_eq!(id.email(), "bob@example.org");

        // The flag wins over the remembered account
        let id = resolve_identity(&config, Some("carol@example.org")).unwrap();
        assert_eq!(id.username, "carol");
    }

    #[tokio::test]
    async fn test_load_config() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("none.toml");
        assert!(load_config(&missing).await.unwrap().is_none());

        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[remote]\nbackend = \"memory\"\n\n[transfer]\nmax_retries = 2\n",
        )
        .unwrap();
        let config = load_config(&path).await.unwrap().unwrap();
        assert_eq!(config.remote.backend, Backend::Memory);
        assert_eq!(config.transfer.max_retries, 2);
        assert_eq!(config.crypto.kdf_rounds, 5000);

        std::fs::write(&path, "[remote\n").unwrap();
        assert!(load_config(&path).await.is_err());
    }

    #[test]
    fn test_fmt_bytes() {
        assert_eq!(fmt_bytes(512), "512 B");
        assert_eq!(fmt_bytes(4 * 1024 * 1024), "4.0 MB");
    }

    #[test]
    fn test_cli_parses_seal() {
        let cli = Cli::try_parse_from([
            "strongbox",
            "--user",
            "alice@example.com",
            "seal",
            "msg.txt",
            "--to",
            "bob,carol",
            "--bcc",
            "dave",
        ])
        .unwrap();
        match cli.command {
            Commands::Seal { to, bcc, draft, .. } => {
                assert_eq!(to, vec!["bob", "carol"]);
                assert_eq!(bcc, vec!["dave"]);
                assert!(!draft);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
