//! Error types for machsign operations.
//!
//! This module defines the [`enum@Error`] enum covering every failure of the
//! load-command editor and the signing pipeline: I/O, Mach-O layout,
//! cryptography, provisioning and configuration errors.
//!
//! The C surface in [`crate::ffi`] collapses these into boolean flags and
//! integer status codes; Rust callers can match on the variants.
//!
//! # See Also
//!
//! - [`crate::Result`] - Convenience type alias using this error

use std::path::PathBuf;
use thiserror::Error;

/// Error type for machsign operations.
///
/// # Examples
///
/// ```no_run
/// use machsign::{macho, Error};
///
/// match macho::uninstall_dylibs("Payload/App.app", &["@rpath/Tweak.dylib"]) {
///     Ok(removed) => println!("removed {removed}"),
///     Err(Error::DylibNotFound(path)) => eprintln!("not linked: {path}"),
///     Err(e) => eprintln!("failed: {e}"),
/// }
/// ```
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or unsupported Mach-O binary format.
    #[error("Invalid Mach-O: {0}")]
    MachO(String),

    /// The load-command region has no room for the requested edit.
    ///
    /// Mach-O load commands must end before the first file-backed section,
    /// so new or longer commands can only use the padding left by the linker.
    #[error("Not enough load command space: need {needed} bytes, {available} available")]
    NoLoadCommandSpace {
        /// Bytes the edit requires.
        needed: usize,
        /// Bytes free between the load commands and the first section.
        available: usize,
    },

    /// A dylib path was not referenced by any load command.
    #[error("Dylib not referenced by binary: {0}")]
    DylibNotFound(String),

    /// No app bundle or main executable could be located.
    #[error("Bundle not found: {}", .0.display())]
    BundleNotFound(PathBuf),

    /// Code signing operation failed.
    #[error("Signing failed: {0}")]
    Signing(String),

    /// Invalid or malformed certificate or private key.
    #[error("Invalid certificate: {0}")]
    Certificate(String),

    /// Incorrect password for a private key or PKCS#12 container.
    #[error("Invalid password for private key or PKCS#12")]
    InvalidPassword,

    /// Required credentials not configured.
    #[error("Missing credentials: {0}")]
    MissingCredentials(String),

    /// Invalid builder configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid argument passed across the C boundary or to a public API.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid or malformed provisioning profile.
    #[error("Invalid provisioning profile: {0}")]
    ProvisioningProfile(String),

    /// Property list parsing failed.
    #[error("Plist error: {0}")]
    Plist(#[from] plist::Error),

    /// ZIP archive operation failed.
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

impl Error {
    pub(crate) fn macho(msg: impl Into<String>) -> Self {
        Error::MachO(msg.into())
    }
}

impl From<goblin::error::Error> for Error {
    fn from(e: goblin::error::Error) -> Self {
        Error::MachO(e.to_string())
    }
}
