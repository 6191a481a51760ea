//! IPA (zipped `Payload/*.app`) extraction and creation.

pub mod archive;
pub mod extract;

pub use archive::{create_ipa, CompressionLevel};
pub use extract::{extract_ipa, is_ipa, validate_ipa};
