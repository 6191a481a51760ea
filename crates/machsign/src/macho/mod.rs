//! Mach-O parsing, load-command editing and signature embedding.

pub mod dylib;
pub mod parser;
pub mod signer;
pub mod writer;

#[cfg(test)]
pub(crate) mod testutil;

pub use dylib::{
    change_dylib_path, change_dylib_path_bytes, inject_dylib, inject_dylib_bytes, list_dylibs,
    list_dylibs_bytes, resolve_binary, uninstall_dylibs, uninstall_dylibs_bytes, DylibInfo,
    DylibKind, InjectOutcome,
};
pub use parser::{is_macho_magic, ArchSlice, MachOFile};
pub use signer::{sign_macho, sign_macho_data, SignOptions};
