//! HTTP client for a remote strongbox/webmail server
//!
//! Every request carries the current CSRF token in `X-CSRF-Token`. The token
//! is rotated whenever a response carries a new one, either in the same
//! header or as a `_token` field of a JSON body.
//!
//! Status mapping: 401 during login is a bad password, 401 afterwards means
//! the session expired (the caller must wipe its keys); 403 is a temporary
//! block; 404 is `NotFound`.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use sbx_core::api::{AccountService, DirectoryService, MessageService, StorageService};
use sbx_core::config::RemoteConfig;
use sbx_core::types::{
    DirectoryEntry, MessageKind, MessageUpload, PasswordUpdate, PublicKeyBundle, Registration,
    ServiceKeyUpload, SessionInfo, StoredItem,
};
use sbx_core::{SbxError, SbxResult};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

pub const CSRF_HEADER: &str = "X-CSRF-Token";

/// Field name of a rotated CSRF token in JSON responses
pub const TOKEN_FIELD: &str = "_token";

fn status_error(status: StatusCode, body: &str, login: bool) -> SbxError {
    match status {
        StatusCode::UNAUTHORIZED if login => SbxError::Unauthorized,
        StatusCode::UNAUTHORIZED => SbxError::SessionExpired,
        StatusCode::FORBIDDEN => SbxError::Blocked,
        StatusCode::NOT_FOUND => SbxError::NotFound(body.to_owned()),
        _ => SbxError::Remote(format!("HTTP {status}: {body}")),
    }
}

fn token_from_json(value: &Value) -> Option<&str> {
    value
        .get(TOKEN_FIELD)
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
}

#[derive(Deserialize)]
struct BatchResponse {
    keys: Vec<DirectoryEntry>,
}

#[derive(Deserialize)]
struct IdResponse {
    #[serde(alias = "uuid")]
    id: String,
}

pub struct HttpApi {
    client: reqwest::Client,
    base_url: String,
    token: RwLock<Option<String>>,
}

impl HttpApi {
    /// `enforce_tls` rejects `http://` base URLs; otherwise they are logged.
    pub fn new(base_url: &str, enforce_tls: bool) -> anyhow::Result<Self> {
        if base_url.starts_with("http://") {
            if enforce_tls {
                anyhow::bail!(
                    "server URL uses plaintext HTTP ({base_url}), but enforce_tls is enabled"
                );
            }
            warn!(
                url = %base_url,
                "server URL uses plaintext HTTP; credentials travel unencrypted"
            );
        }
        let client = reqwest::Client::builder()
            .user_agent(concat!("strongbox/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            token: RwLock::new(None),
        })
    }

    pub fn from_config(remote: &RemoteConfig) -> anyhow::Result<Self> {
        Self::new(&remote.base_url, remote.enforce_tls)
    }

    /// Current CSRF token, if any response has provided one.
    pub fn token(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn set_token(&self, token: Option<String>) {
        *self
            .token
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = token;
    }

    fn rotate(&self, token: &str) {
        if self.token().as_deref() != Some(token) {
            debug!("csrf token rotated");
            self.set_token(Some(token.to_owned()));
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let req = self.client.request(method, self.url(path));
        match self.token() {
            Some(token) => req.header(CSRF_HEADER, token),
            None => req,
        }
    }

    async fn send(&self, req: RequestBuilder, login: bool) -> SbxResult<Response> {
        let resp = req
            .send()
            .await
            .map_err(|e| SbxError::Remote(format!("request failed: {e}")))?;

        if let Some(token) = resp
            .headers()
            .get(CSRF_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|t| !t.is_empty())
        {
            self.rotate(token);
        }

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        let err = status_error(status, &body, login);
        if matches!(err, SbxError::SessionExpired) {
            self.set_token(None);
        }
        Err(err)
    }

    async fn json<T: DeserializeOwned>(&self, req: RequestBuilder, login: bool) -> SbxResult<T> {
        let resp = self.send(req, login).await?;
        let value: Value = resp
            .json()
            .await
            .map_err(|e| SbxError::Remote(format!("malformed response: {e}")))?;
        if let Some(token) = token_from_json(&value) {
            self.rotate(token);
        }
        serde_json::from_value(value)
            .map_err(|e| SbxError::Remote(format!("unexpected response: {e}")))
    }

    async fn bytes(&self, req: RequestBuilder) -> SbxResult<Bytes> {
        self.send(req, false)
            .await?
            .bytes()
            .await
            .map_err(|e| SbxError::Remote(format!("reading response body: {e}")))
    }

    async fn unit(&self, req: RequestBuilder) -> SbxResult<()> {
        let resp = self.send(req, false).await?;
        // Some endpoints answer with a JSON body only to rotate the token
        if let Ok(value) = resp.json::<Value>().await {
            if let Some(token) = token_from_json(&value) {
                self.rotate(token);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl AccountService for HttpApi {
    async fn authenticate(&self, username: &str, account_password: &str) -> SbxResult<SessionInfo> {
        let req = self
            .request(Method::POST, "sessions")
            .json(&json!({ "username": username, "password": account_password }));
        self.json(req, true).await
    }

    async fn register(&self, registration: Registration) -> SbxResult<()> {
        let req = self.request(Method::POST, "users/setup").json(&json!({
            "username": registration.username,
            "password": registration.account_password,
            "publicKeys": registration.public_keys,
            "privateKeys": STANDARD.encode(&registration.private_keys),
            "key": STANDARD.encode(&registration.key),
        }));
        self.unit(req).await
    }

    async fn update_password(&self, update: PasswordUpdate) -> SbxResult<()> {
        let req = self.request(Method::POST, "users/update").json(&json!({
            "username": update.username,
            "currentPassword": update.current_password,
            "newPassword": update.new_password,
            "key": update.key,
        }));
        self.unit(req).await
    }

    async fn fetch_private_keys(&self, username: &str, service: &str) -> SbxResult<Bytes> {
        let req = self
            .request(Method::GET, "keys/private")
            .query(&[("username", username), ("service", service)]);
        self.bytes(req).await
    }

    async fn store_service_keys(
        &self,
        username: &str,
        service: &str,
        keys: ServiceKeyUpload,
    ) -> SbxResult<()> {
        let req = self.request(Method::POST, "keys/setup").json(&json!({
            "username": username,
            "service": service,
            "publicKeys": keys.public_keys,
            "privateKeys": STANDARD.encode(&keys.private_keys),
        }));
        self.unit(req).await
    }
}

#[async_trait]
impl DirectoryService for HttpApi {
    async fn fetch_public_keys(&self, service: &str, username: &str) -> SbxResult<PublicKeyBundle> {
        let req = self
            .request(Method::GET, &format!("keys/public/{username}"))
            .query(&[("service", service)]);
        self.json(req, false).await
    }

    async fn fetch_public_keys_batch(
        &self,
        service: &str,
        usernames: &[String],
    ) -> SbxResult<Vec<DirectoryEntry>> {
        let joined = usernames.join(",");
        let req = self
            .request(Method::GET, "keys/public")
            .query(&[("service", service), ("usernames", joined.as_str())]);
        let batch: BatchResponse = self.json(req, false).await?;
        Ok(batch.keys)
    }
}

/// Message upload body: recipients, blob, and one `key_<user>` field per
/// key holder.
fn message_body(upload: MessageUpload) -> Value {
    let mut body = BTreeMap::new();
    body.insert("recipients".to_string(), json!(upload.recipients));
    body.insert("blob".to_string(), json!(STANDARD.encode(&upload.blob)));
    for (user, key) in upload.keys {
        body.insert(format!("key_{user}"), json!(STANDARD.encode(key)));
    }
    json!(body)
}

#[async_trait]
impl MessageService for HttpApi {
    async fn send_message(&self, kind: MessageKind, upload: MessageUpload) -> SbxResult<String> {
        let path = match kind {
            MessageKind::Message => "messages/message",
            MessageKind::Draft => "messages/draft",
        };
        let req = self.request(Method::POST, path).json(&message_body(upload));
        let created: IdResponse = self.json(req, false).await?;
        Ok(created.id)
    }

    async fn fetch_message(&self, uuid: &str, username: &str) -> SbxResult<Bytes> {
        let req = self
            .request(Method::GET, &format!("messages/{uuid}"))
            .query(&[("username", username)]);
        self.bytes(req).await
    }
}

#[async_trait]
impl StorageService for HttpApi {
    async fn add_item(
        &self,
        owner: &str,
        meta: String,
        item_key: Option<String>,
    ) -> SbxResult<String> {
        let req = self.request(Method::POST, "storage/item").json(&json!({
            "owner": owner,
            "meta": meta,
            "itemKey": item_key,
        }));
        let created: IdResponse = self.json(req, false).await?;
        Ok(created.id)
    }

    async fn update_item(&self, item_id: &str, meta: String) -> SbxResult<()> {
        let req = self
            .request(Method::POST, "storage/update-item")
            .json(&json!({ "id": item_id, "meta": meta }));
        self.unit(req).await
    }

    async fn get_item(&self, item_id: &str) -> SbxResult<StoredItem> {
        let req = self.request(Method::GET, &format!("storage/item/{item_id}"));
        self.json(req, false).await
    }

    async fn upload_part(&self, item_id: &str, part: u64, data: Bytes) -> SbxResult<()> {
        let req = self
            .request(Method::POST, &format!("storage/upload-item/{item_id}/{part}"))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(data);
        self.unit(req).await
    }

    async fn download_part(&self, item_id: &str, part: u64) -> SbxResult<Bytes> {
        let req = self.request(Method::GET, &format!("storage/download-item/{item_id}/{part}"));
        self.bytes(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, "", true),
            SbxError::Unauthorized
        ));
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, "", false),
            SbxError::SessionExpired
        ));
        assert!(matches!(
            status_error(StatusCode::FORBIDDEN, "", true),
            SbxError::Blocked
        ));
        assert!(matches!(
            status_error(StatusCode::NOT_FOUND, "no such user", false),
            SbxError::NotFound(m) if m == "no such user"
        ));
        assert!(matches!(
            status_error(StatusCode::BAD_GATEWAY, "", false),
            SbxError::Remote(_)
        ));
    }

    #[test]
    fn test_token_from_json() {
        assert_eq!(token_from_json(&json!({"_token": "abc"})), Some("abc"));
        assert_eq!(token_from_json(&json!({"_token": ""})), None);
        assert_eq!(token_from_json(&json!({"other": 1})), None);
        assert_eq!(token_from_json(&json!([1, 2])), None);
    }

    #[test]
    fn test_url_and_tls() {
        let api = HttpApi::new("https://mail.example.com/api/", true).unwrap();
        assert_eq!(api.url("/keys/public"), "https://mail.example.com/api/keys/public");
        assert!(HttpApi::new("http://mail.example.com", true).is_err());
        assert!(HttpApi::new("http://localhost:8080", false).is_ok());
    }

    #[test]
    fn test_message_body_key_fields() {
        let body = message_body(MessageUpload {
            recipients: "{\"to\":[\"bob\"]}".into(),
            blob: vec![1, 2, 3],
            keys: vec![("bob".into(), vec![9]), ("alice".into(), vec![8])],
        });
        assert_eq!(body["blob"], "AQID");
        assert_eq!(body["key_bob"], "CQ==");
        assert_eq!(body["key_alice"], "CA==");
    }
}
