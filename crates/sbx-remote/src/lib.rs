//! sbx-remote: implementations of the strongbox collaborator traits
//!
//! - [`local::LocalServer`]: a self-contained account, directory, message and
//!   storage server over an OpenDAL operator (memory, filesystem or S3)
//! - [`http::HttpApi`]: a client for a remote webmail server
//!
//! Both only ever see derived account passwords, wrapped key material and
//! ciphertext.

pub mod http;
pub mod local;
pub mod operator;

pub use http::HttpApi;
pub use local::LocalServer;
pub use operator::{build_operator, S3Credentials};
