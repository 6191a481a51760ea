//! CodeDirectory blob builder.
//!
//! A CodeDirectory holds one hash per 4 KiB code page plus "special slot"
//! hashes that bind Info.plist, the requirement set, CodeResources and the
//! entitlement blobs to the binary. Every signature carries two of them: a
//! SHA-1 CodeDirectory in slot 0 and a SHA-256 alternate in slot 0x1000.

use super::constants::*;
use rayon::prelude::*;
use sha1::{Digest, Sha1};
use sha2::Sha256;

/// Size of the version 0x20400 header (with exec segment fields).
pub const CODEDIRECTORY_HEADER_SIZE: usize = 88;

/// Hash algorithm of a CodeDirectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashType {
    Sha1,
    Sha256,
}

impl HashType {
    /// `hashType` field value.
    pub fn code(self) -> u8 {
        match self {
            HashType::Sha1 => CS_HASHTYPE_SHA1,
            HashType::Sha256 => CS_HASHTYPE_SHA256,
        }
    }

    /// Digest length in bytes.
    pub fn digest_len(self) -> usize {
        match self {
            HashType::Sha1 => CS_SHA1_LEN,
            HashType::Sha256 => CS_SHA256_LEN,
        }
    }

    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            HashType::Sha1 => Sha1::digest(data).to_vec(),
            HashType::Sha256 => Sha256::digest(data).to_vec(),
        }
    }
}

/// Special slots, numbered as negative indices into the hash array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpecialSlot {
    Info = 1,
    Requirements = 2,
    Resources = 3,
    Entitlements = 5,
    DerEntitlements = 7,
}

/// Builds CodeDirectory blobs over borrowed code and special-slot data.
///
/// Special-slot inputs are the raw bytes (Info.plist file, requirement
/// blob, ...); they are hashed with the algorithm passed to
/// [`CodeDirectoryBuilder::build`], so one builder yields both the SHA-1 and
/// SHA-256 directory.
///
/// ```ignore
/// let cd = CodeDirectoryBuilder::new("com.example.app", &code)
///     .team_id("TEAMID1234")
///     .requirements(&requirements)
///     .exec_seg(0x4000, CS_EXECSEG_MAIN_BINARY)
///     .build(HashType::Sha256);
/// ```
pub struct CodeDirectoryBuilder<'a> {
    identifier: &'a str,
    team_id: Option<&'a str>,
    code: &'a [u8],
    specials: [Option<&'a [u8]>; 7],
    exec_seg_limit: u64,
    exec_seg_flags: u64,
    flags: u32,
}

impl<'a> CodeDirectoryBuilder<'a> {
    /// `code` is everything up to the signature; its length becomes `codeLimit`.
    pub fn new(identifier: &'a str, code: &'a [u8]) -> Self {
        Self {
            identifier,
            team_id: None,
            code,
            specials: [None; 7],
            exec_seg_limit: 0,
            exec_seg_flags: 0,
            flags: 0,
        }
    }

    pub fn team_id(mut self, team_id: &'a str) -> Self {
        self.team_id = Some(team_id);
        self
    }

    pub fn flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    /// `execSegLimit` (the `__TEXT` size) and `execSegFlags`.
    pub fn exec_seg(mut self, limit: u64, flags: u64) -> Self {
        self.exec_seg_limit = limit;
        self.exec_seg_flags = flags;
        self
    }

    pub fn info_plist(self, data: &'a [u8]) -> Self {
        self.special(SpecialSlot::Info, data)
    }

    pub fn requirements(self, blob: &'a [u8]) -> Self {
        self.special(SpecialSlot::Requirements, blob)
    }

    pub fn code_resources(self, data: &'a [u8]) -> Self {
        self.special(SpecialSlot::Resources, data)
    }

    pub fn entitlements(self, blob: &'a [u8]) -> Self {
        self.special(SpecialSlot::Entitlements, blob)
    }

    pub fn der_entitlements(self, blob: &'a [u8]) -> Self {
        self.special(SpecialSlot::DerEntitlements, blob)
    }

    fn special(mut self, slot: SpecialSlot, data: &'a [u8]) -> Self {
        self.specials[slot as usize - 1] = Some(data);
        self
    }

    fn is_main_executable(&self) -> bool {
        self.exec_seg_flags & CS_EXECSEG_MAIN_BINARY != 0
    }

    /// Number of special slots: the highest populated slot, at least 3.
    /// Slots above 5 only exist for main executables.
    fn special_slot_count(&self) -> usize {
        let max = if self.is_main_executable() { 7 } else { 5 };
        let highest = (1..=max)
            .rev()
            .find(|&n| self.specials[n - 1].is_some())
            .unwrap_or(0);
        highest.max(3)
    }

    /// Size of the blob [`CodeDirectoryBuilder::build`] will produce.
    pub fn size(&self, hash: HashType) -> usize {
        let pages = self.code.len().div_ceil(PAGE_SIZE);
        CODEDIRECTORY_HEADER_SIZE
            + self.identifier.len()
            + 1
            + self.team_id.map_or(0, |t| t.len() + 1)
            + (self.special_slot_count() + pages) * hash.digest_len()
    }

    pub fn build(&self, hash: HashType) -> Vec<u8> {
        let n_special = self.special_slot_count();
        let n_code = self.code.len().div_ceil(PAGE_SIZE);

        let ident_offset = CODEDIRECTORY_HEADER_SIZE;
        let team_offset = match self.team_id {
            Some(_) => ident_offset + self.identifier.len() + 1,
            None => 0,
        };
        let strings_end = ident_offset
            + self.identifier.len()
            + 1
            + self.team_id.map_or(0, |t| t.len() + 1);
        let hash_offset = strings_end + n_special * hash.digest_len();
        let total = self.size(hash);

        let mut buf = Vec::with_capacity(total);
        for v in [
            CSMAGIC_CODEDIRECTORY,
            total as u32,
            CODEDIRECTORY_VERSION,
            self.flags,
            hash_offset as u32,
            ident_offset as u32,
            n_special as u32,
            n_code as u32,
            self.code.len() as u32,
        ] {
            buf.extend_from_slice(&v.to_be_bytes());
        }
        buf.extend_from_slice(&[hash.digest_len() as u8, hash.code(), 0, PAGE_SIZE_LOG2]);
        // spare2, scatterOffset
        buf.extend_from_slice(&[0u8; 8]);
        buf.extend_from_slice(&(team_offset as u32).to_be_bytes());
        // spare3, codeLimit64, execSegBase
        buf.extend_from_slice(&[0u8; 20]);
        buf.extend_from_slice(&self.exec_seg_limit.to_be_bytes());
        buf.extend_from_slice(&self.exec_seg_flags.to_be_bytes());
        debug_assert_eq!(buf.len(), CODEDIRECTORY_HEADER_SIZE);

        buf.extend_from_slice(self.identifier.as_bytes());
        buf.push(0);
        if let Some(team) = self.team_id {
            buf.extend_from_slice(team.as_bytes());
            buf.push(0);
        }

        // Stored from -n up to -1; unused slots are zero.
        for n in (1..=n_special).rev() {
            match self.specials[n - 1] {
                Some(data) => buf.extend(hash.digest(data)),
                None => buf.resize(buf.len() + hash.digest_len(), 0),
            }
        }

        let pages: Vec<Vec<u8>> = self
            .code
            .par_chunks(PAGE_SIZE)
            .map(|page| hash.digest(page))
            .collect();
        for page in pages {
            buf.extend(page);
        }

        buf
    }
}

/// CDHash: digest of a whole CodeDirectory blob.
pub fn cdhash(hash: HashType, code_directory: &[u8]) -> Vec<u8> {
    hash.digest(code_directory)
}
