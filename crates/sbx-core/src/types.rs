use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An account identity. Both derived passwords are salted from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub username: String,
    pub domain: String,
}

impl Identity {
    pub fn new(username: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            domain: domain.into(),
        }
    }

    /// `username@domain`
    pub fn email(&self) -> String {
        format!("{}@{}", self.username, self.domain)
    }

    /// Salt for the account (authentication) password.
    pub fn account_salt(&self) -> String {
        self.email()
    }

    /// Salt for the mail (IK wrapping) password: `username@domain` + `username`.
    pub fn mail_salt(&self) -> String {
        format!("{}{}", self.email(), self.username)
    }
}

/// RSA public key in JSON Web Key form (RFC 7517), as published to the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub alg: String,
    /// Modulus, base64url without padding
    pub n: String,
    /// Public exponent, base64url without padding
    pub e: String,
    #[serde(default)]
    pub ext: bool,
    #[serde(default)]
    pub key_ops: Vec<String>,
}

/// The public half of an account's key material: `{encrypt, verify}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyBundle {
    pub encrypt: Jwk,
    pub verify: Jwk,
}

/// One row of a batch public key lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub username: String,
    pub public_keys: PublicKeyBundle,
}

/// Session payload returned by a successful authentication.
///
/// `iak` is the base64 wrapped-IK blob; every other field is opaque session
/// state kept by the client for the lifetime of the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub iak: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Account creation request (`POST /users/setup`).
#[derive(Debug, Clone)]
pub struct Registration {
    pub username: String,
    /// Derived account password (hex); the server never sees the real password
    pub account_password: String,
    pub public_keys: PublicKeyBundle,
    pub private_keys: Vec<u8>,
    /// Wrapped-IK blob `[16 iv][wrapped IK]`
    pub key: Vec<u8>,
}

/// Password change request (`POST /users/update`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasswordUpdate {
    pub username: String,
    pub current_password: String,
    pub new_password: String,
    /// New wrapped-IK blob, base64
    pub key: String,
}

/// Key material for an additional service key store (e.g. storage).
#[derive(Debug, Clone)]
pub struct ServiceKeyUpload {
    pub public_keys: PublicKeyBundle,
    pub private_keys: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Message,
    Draft,
}

/// An encrypted message on its way to the server.
#[derive(Debug, Clone)]
pub struct MessageUpload {
    /// Recipients JSON as entered by the sender
    pub recipients: String,
    /// Wire blob with a zero-filled key slot
    pub blob: Vec<u8>,
    /// Per-recipient wrapped session keys `(username, key)`
    pub keys: Vec<(String, Vec<u8>)>,
}

// ── Storage items ─────────────────────────────────────────────────────────────

/// Item metadata as stored on the server: `d` is the base64 ciphertext of an
/// [`ItemBody`], `s` the signature over it, `so` the signing owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedItem {
    pub s: String,
    pub so: String,
    pub iv: String,
    pub v: u32,
    pub d: String,
}

/// Plaintext body of a storage item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "lowercase")]
pub enum ItemBody {
    Directory(DirectoryBody),
    File(FileBody),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryBody {
    #[serde(rename = "n")]
    pub name: String,
    #[serde(rename = "c")]
    pub created: i64,
    #[serde(rename = "m")]
    pub modified: i64,
    #[serde(rename = "ch", default)]
    pub children: Vec<ChildRef>,
}

/// A directory's pointer to a child item and the child's item key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildRef {
    /// Reference id
    #[serde(rename = "r")]
    pub reference: String,
    /// Child item key, base64
    #[serde(rename = "k")]
    pub key: String,
    /// Child type: "file" or "directory"
    #[serde(rename = "t")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileBody {
    #[serde(rename = "n")]
    pub name: String,
    #[serde(rename = "c")]
    pub created: i64,
    #[serde(rename = "m")]
    pub modified: i64,
    #[serde(rename = "s")]
    pub size: u64,
    #[serde(rename = "mt")]
    pub mime_type: String,
    #[serde(rename = "ps")]
    pub part_size: u64,
    #[serde(rename = "p", default)]
    pub parts: Vec<PartMeta>,
}

/// Out-of-band metadata of one encrypted file part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartMeta {
    #[serde(rename = "p")]
    pub part: u64,
    /// Raw part key, base64
    #[serde(rename = "k")]
    pub key: String,
    /// HMAC over the part ciphertext, base64
    #[serde(rename = "m")]
    pub mac: String,
}

/// An item as returned by the storage service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredItem {
    pub id: String,
    /// JSON-serialized [`SealedItem`]
    pub meta: String,
    /// Item key wrapped to the requesting user, base64 (assigned items only)
    pub item_key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_salts() {
        let id = Identity::new("alice", "example.com");
        assert_eq!(id.account_salt(), "alice@example.com");
        assert_eq!(id.mail_salt(), "alice@example.comalice");
        assert_ne!(id.account_salt(), id.mail_salt());
    }

    #[test]
    fn test_file_body_short_field_names() {
        let body = ItemBody::File(FileBody {
            name: "report.pdf".into(),
            created: 1,
            modified: 2,
            size: 10,
            mime_type: "application/pdf".into(),
            part_size: 4194304,
            parts: vec![PartMeta {
                part: 0,
                key: "a2V5".into(),
                mac: "bWFj".into(),
            }],
        });

        let json: serde_json::Value = serde_json::to_value(&body).unwrap();
        assert_eq!(json["t"], "file");
        assert_eq!(json["n"], "report.pdf");
        assert_eq!(json["ps"], 4194304);
        assert_eq!(json["p"][0]["k"], "a2V5");
        assert_eq!(json["p"][0]["m"], "bWFj");
    }

    #[test]
    fn test_directory_body_parses_without_children() {
        let json = r#"{"t":"directory","n":"root","c":10,"m":20}"#;
        let body: ItemBody = serde_json::from_str(json).unwrap();
        match body {
            ItemBody::Directory(dir) => {
                assert_eq!(dir.name, "root");
                assert!(dir.children.is_empty());
            }
            ItemBody::File(_) => panic!("expected directory"),
        }
    }

    #[test]
    fn test_session_info_keeps_extra_fields() {
        let json = r#"{"iak":"AAAA","_token":"t1","username":"alice"}"#;
        let info: SessionInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.iak, "AAAA");
        assert_eq!(info.extra["_token"], "t1");
        assert_eq!(info.extra.len(), 2);
    }
}
