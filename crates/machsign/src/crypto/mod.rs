//! Signing identities and CMS generation.

pub mod cert;
pub mod cms;

pub use cert::{parse_private_key, SigningCredentials, SigningIdentity};
