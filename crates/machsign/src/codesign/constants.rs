//! Code signature magic numbers, slot numbers and flags.
//!
//! Values follow `<Security/CSCommonPriv.h>` and `cs_blobs.h`. Only what the
//! signer emits is listed here.

// Blob magics

/// SuperBlob referenced by LC_CODE_SIGNATURE
pub const CSMAGIC_EMBEDDED_SIGNATURE: u32 = 0xfade0cc0;
pub const CSMAGIC_CODEDIRECTORY: u32 = 0xfade0c02;
/// Requirement set (`Requirements`)
pub const CSMAGIC_REQUIREMENTS: u32 = 0xfade0c01;
/// Single requirement expression
pub const CSMAGIC_REQUIREMENT: u32 = 0xfade0c00;
/// XML entitlements
pub const CSMAGIC_EMBEDDED_ENTITLEMENTS: u32 = 0xfade7171;
/// DER entitlements
pub const CSMAGIC_EMBEDDED_DER_ENTITLEMENTS: u32 = 0xfade7172;
/// CMS wrapper
pub const CSMAGIC_BLOBWRAPPER: u32 = 0xfade0b01;

// SuperBlob index slots

pub const CSSLOT_CODEDIRECTORY: u32 = 0x0000;
pub const CSSLOT_REQUIREMENTS: u32 = 0x0002;
pub const CSSLOT_ENTITLEMENTS: u32 = 0x0005;
pub const CSSLOT_DER_ENTITLEMENTS: u32 = 0x0007;
/// First alternate CodeDirectory (SHA-256 here)
pub const CSSLOT_ALTERNATE_CODEDIRECTORIES: u32 = 0x1000;
pub const CSSLOT_SIGNATURESLOT: u32 = 0x10000;

// Hash types and sizes

pub const CS_HASHTYPE_SHA1: u8 = 1;
pub const CS_HASHTYPE_SHA256: u8 = 2;
pub const CS_SHA1_LEN: usize = 20;
pub const CS_SHA256_LEN: usize = 32;

// CodeDirectory flags

/// Signed without an identity
pub const CS_ADHOC: u32 = 0x0000_0002;

// Exec segment flags

/// Main executable of a bundle
pub const CS_EXECSEG_MAIN_BINARY: u64 = 0x0001;
/// Set together with `get-task-allow`
pub const CS_EXECSEG_ALLOW_UNSIGNED: u64 = 0x0010;

/// CodeDirectory version with exec segment fields.
pub const CODEDIRECTORY_VERSION: u32 = 0x20400;

/// Page size used for code hashes.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SIZE_LOG2: u8 = 12;

// Requirement language

/// Requirement type of the designated requirement
pub const CSREQ_DESIGNATED: u32 = 3;
/// Expression kind of a single requirement
pub const REQ_EXPR_FORM: u32 = 1;

pub const OP_IDENT: u32 = 2;
pub const OP_AND: u32 = 6;
pub const OP_CERT_FIELD: u32 = 11;
pub const OP_CERT_GENERIC: u32 = 14;
pub const OP_APPLE_GENERIC_ANCHOR: u32 = 15;

pub const MATCH_EXISTS: u32 = 0;
pub const MATCH_EQUAL: u32 = 1;
