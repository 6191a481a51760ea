//! App bundle handling.
//!
//! - [`info`]: Info.plist access, executable lookup and metadata overrides
//! - [`code_resources`]: `_CodeSignature/CodeResources` generation
//! - [`signer`]: signing every binary of a bundle in dependency order
//!
//! ```no_run
//! use machsign::bundle::{BundleSigner, CodeResourcesBuilder};
//! use machsign::crypto::SigningIdentity;
//!
//! let plist = CodeResourcesBuilder::new("Payload/App.app").scan()?.build()?;
//! BundleSigner::new(&SigningIdentity::AdHoc).sign("Payload/App.app".as_ref())?;
//! # Ok::<(), machsign::Error>(())
//! ```

pub mod code_resources;
pub mod info;
pub mod signer;

pub use code_resources::CodeResourcesBuilder;
pub use info::{apply_overrides, bundle_executable, find_app_bundle, BundleOverrides, InfoPlist};
pub use signer::BundleSigner;
