//! sbx-core: types shared by every strongbox crate
//!
//! - [`config`]: TOML configuration schema
//! - [`error`]: collaborator-facing error type
//! - [`types`]: identities, key bundles, session payloads, storage item metadata
//! - [`api`]: the narrow traits through which the crypto core talks to a server

pub mod api;
pub mod config;
pub mod error;
pub mod types;

pub use error::{SbxError, SbxResult};
