//! SuperBlob assembly.
//!
//! ```text
//! magic 0xfade0cc0 | length | count
//! (slot, offset) * count
//! blob data...
//! ```
//!
//! All integers are big-endian. Every embedded blob starts with its own
//! magic and length.

use super::constants::*;
use crate::{Error, Result};

const SUPERBLOB_HEADER_SIZE: usize = 12;
const INDEX_ENTRY_SIZE: usize = 8;

/// One blob of a SuperBlob.
#[derive(Debug, Clone)]
pub struct BlobEntry {
    /// `CSSLOT_*` value
    pub slot: u32,
    /// Blob data including its magic and length
    pub data: Vec<u8>,
}

/// Prefix `payload` with a generic blob header.
pub fn wrap_blob(magic: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + payload.len());
    buf.extend_from_slice(&magic.to_be_bytes());
    buf.extend_from_slice(&(8 + payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

pub fn build_entitlements_blob(plist_xml: &[u8]) -> Vec<u8> {
    wrap_blob(CSMAGIC_EMBEDDED_ENTITLEMENTS, plist_xml)
}

pub fn build_der_entitlements_blob(der: &[u8]) -> Vec<u8> {
    wrap_blob(CSMAGIC_EMBEDDED_DER_ENTITLEMENTS, der)
}

/// CMS wrapper. Ad-hoc signatures use an empty payload.
pub fn build_signature_blob(cms: &[u8]) -> Vec<u8> {
    wrap_blob(CSMAGIC_BLOBWRAPPER, cms)
}

/// Serialize `entries` in the given order.
pub fn build_superblob(entries: &[BlobEntry]) -> Vec<u8> {
    let header = SUPERBLOB_HEADER_SIZE + entries.len() * INDEX_ENTRY_SIZE;
    let total = header + entries.iter().map(|e| e.data.len()).sum::<usize>();

    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(&CSMAGIC_EMBEDDED_SIGNATURE.to_be_bytes());
    buf.extend_from_slice(&(total as u32).to_be_bytes());
    buf.extend_from_slice(&(entries.len() as u32).to_be_bytes());

    let mut offset = header;
    for entry in entries {
        buf.extend_from_slice(&entry.slot.to_be_bytes());
        buf.extend_from_slice(&(offset as u32).to_be_bytes());
        offset += entry.data.len();
    }
    for entry in entries {
        buf.extend_from_slice(&entry.data);
    }
    buf
}

/// Split a SuperBlob into `(slot, blob)` pairs.
pub fn parse_superblob(data: &[u8]) -> Result<Vec<(u32, &[u8])>> {
    let be32 = |at: usize| -> Result<u32> {
        data.get(at..at + 4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            .ok_or_else(|| Error::Signing("truncated SuperBlob".into()))
    };

    if be32(0)? != CSMAGIC_EMBEDDED_SIGNATURE {
        return Err(Error::Signing("bad SuperBlob magic".into()));
    }
    let length = be32(4)? as usize;
    let count = be32(8)? as usize;
    if length > data.len() {
        return Err(Error::Signing("SuperBlob length exceeds data".into()));
    }

    let mut blobs = Vec::with_capacity(count);
    for i in 0..count {
        let entry = SUPERBLOB_HEADER_SIZE + i * INDEX_ENTRY_SIZE;
        let slot = be32(entry)?;
        let offset = be32(entry + 4)? as usize;
        let blob_len = be32(offset + 4)? as usize;
        let blob = data
            .get(offset..offset + blob_len)
            .filter(|_| offset + blob_len <= length)
            .ok_or_else(|| Error::Signing(format!("blob in slot {:#x} out of range", slot)))?;
        blobs.push((slot, blob));
    }
    Ok(blobs)
}

/// Collects signature components and emits them in `codesign` order:
/// CodeDirectory, requirements, entitlements, DER entitlements, alternate
/// CodeDirectory, CMS.
#[derive(Debug, Default)]
pub struct SuperBlobBuilder {
    code_directory: Option<Vec<u8>>,
    requirements: Option<Vec<u8>>,
    entitlements: Option<Vec<u8>>,
    der_entitlements: Option<Vec<u8>>,
    alternate_code_directory: Option<Vec<u8>>,
    signature: Option<Vec<u8>>,
}

impl SuperBlobBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Primary (SHA-1) CodeDirectory; the CMS signs this one.
    pub fn code_directory(mut self, cd: Vec<u8>) -> Self {
        self.code_directory = Some(cd);
        self
    }

    /// SHA-256 CodeDirectory in slot 0x1000.
    pub fn alternate_code_directory(mut self, cd: Vec<u8>) -> Self {
        self.alternate_code_directory = Some(cd);
        self
    }

    pub fn requirements(mut self, blob: Vec<u8>) -> Self {
        self.requirements = Some(blob);
        self
    }

    pub fn entitlements(mut self, blob: Vec<u8>) -> Self {
        self.entitlements = Some(blob);
        self
    }

    pub fn der_entitlements(mut self, blob: Vec<u8>) -> Self {
        self.der_entitlements = Some(blob);
        self
    }

    /// Wrapped CMS blob (see [`build_signature_blob`]).
    pub fn signature(mut self, blob: Vec<u8>) -> Self {
        self.signature = Some(blob);
        self
    }

    pub fn build(self) -> Vec<u8> {
        let entries: Vec<BlobEntry> = [
            (CSSLOT_CODEDIRECTORY, self.code_directory),
            (CSSLOT_REQUIREMENTS, self.requirements),
            (CSSLOT_ENTITLEMENTS, self.entitlements),
            (CSSLOT_DER_ENTITLEMENTS, self.der_entitlements),
            (CSSLOT_ALTERNATE_CODEDIRECTORIES, self.alternate_code_directory),
            (CSSLOT_SIGNATURESLOT, self.signature),
        ]
        .into_iter()
        .filter_map(|(slot, data)| data.map(|data| BlobEntry { slot, data }))
        .collect();

        build_superblob(&entries)
    }
}

/// Size of a SuperBlob holding blobs of the given sizes.
pub fn superblob_size(blob_sizes: &[usize]) -> usize {
    SUPERBLOB_HEADER_SIZE + blob_sizes.len() * INDEX_ENTRY_SIZE + blob_sizes.iter().sum::<usize>()
}
