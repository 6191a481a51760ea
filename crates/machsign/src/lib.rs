//! Mach-O dylib load-command editing and iOS app re-signing.
//!
//! - [`macho`]: inject, uninstall, list and rename dylib dependencies, and
//!   sign Mach-O files (thin or FAT)
//! - [`bundle`]: Info.plist overrides, CodeResources and bundle-wide signing
//! - [`ZSign`]: one builder tying identity, profile, overrides and IPA
//!   handling together
//! - [`ffi`]: the same operations behind a C ABI
//!
//! ```no_run
//! use machsign::{macho, ZSign};
//!
//! macho::inject_dylib("Payload/App.app", "@executable_path/Tweak.dylib", false)?;
//! ZSign::new()
//!     .pkcs12("identity.p12")
//!     .password("secret")
//!     .provisioning_profile("App.mobileprovision")
//!     .sign("Payload/App.app", None)?;
//! # Ok::<(), machsign::Error>(())
//! ```

pub mod builder;
pub mod bundle;
pub mod codesign;
pub mod crypto;
pub mod error;
pub mod ffi;
pub mod ipa;
pub mod macho;
pub mod provision;

pub use builder::ZSign;
pub use bundle::{BundleOverrides, BundleSigner, CodeResourcesBuilder};
pub use crypto::{SigningCredentials, SigningIdentity};
pub use error::Error;
pub use ipa::{create_ipa, extract_ipa, validate_ipa, CompressionLevel};
pub use macho::{DylibKind, InjectOutcome};
pub use provision::ProvisioningProfile;

pub type Result<T> = std::result::Result<T, Error>;
