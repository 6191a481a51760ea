//! Apple code signature structures: CodeDirectory, requirement sets,
//! entitlement blobs and the SuperBlob that holds them.

pub mod code_directory;
pub mod constants;
pub mod der;
pub mod requirements;
pub mod superblob;

pub use code_directory::{CodeDirectoryBuilder, HashType};
pub use superblob::SuperBlobBuilder;
