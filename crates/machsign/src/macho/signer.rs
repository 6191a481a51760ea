//! Mach-O signing.
//!
//! Every architecture slice gets its own SuperBlob:
//!
//! - SHA-1 CodeDirectory (slot 0) and SHA-256 alternate (slot 0x1000)
//! - requirement set (designated requirement, or empty when ad-hoc)
//! - XML and DER entitlements when given
//! - CMS over the SHA-1 CodeDirectory, or an empty wrapper when ad-hoc
//!
//! Signature space is reserved before hashing (see [`super::writer`]) so the
//! page hashes cover the final load commands.

use super::parser::{ArchSlice, MachOFile};
use super::writer::{assemble_fat, finish_slice, prepare_slice, FatSlice};
use crate::codesign::code_directory::cdhash;
use crate::codesign::constants::*;
use crate::codesign::der::entitlements_to_der;
use crate::codesign::requirements::{designated_requirements, empty_requirements};
use crate::codesign::superblob::{
    build_der_entitlements_blob, build_entitlements_blob, build_signature_blob, superblob_size,
};
use crate::codesign::{CodeDirectoryBuilder, HashType, SuperBlobBuilder};
use crate::crypto::cms::{self, CMS_OVERHEAD};
use crate::crypto::SigningIdentity;
use crate::Result;
use plist::Value;
use std::path::Path;
use tracing::{debug, info};

/// Inputs for signing one Mach-O file.
pub struct SignOptions<'a> {
    /// Signing identifier, normally the bundle identifier
    pub identifier: &'a str,
    pub identity: &'a SigningIdentity,
    /// Overrides the certificate's team id
    pub team_id: Option<&'a str>,
    /// Entitlements as an XML or binary plist
    pub entitlements: Option<&'a [u8]>,
    /// Info.plist file contents (special slot 1)
    pub info_plist: Option<&'a [u8]>,
    /// `_CodeSignature/CodeResources` contents (special slot 3)
    pub code_resources: Option<&'a [u8]>,
}

impl<'a> SignOptions<'a> {
    pub fn new(identifier: &'a str, identity: &'a SigningIdentity) -> Self {
        Self {
            identifier,
            identity,
            team_id: None,
            entitlements: None,
            info_plist: None,
            code_resources: None,
        }
    }

    pub fn team_id(mut self, team_id: Option<&'a str>) -> Self {
        self.team_id = team_id;
        self
    }

    pub fn entitlements(mut self, plist: &'a [u8]) -> Self {
        self.entitlements = Some(plist);
        self
    }

    pub fn info_plist(mut self, data: &'a [u8]) -> Self {
        self.info_plist = Some(data);
        self
    }

    pub fn code_resources(mut self, data: &'a [u8]) -> Self {
        self.code_resources = Some(data);
        self
    }

    fn effective_team_id(&self) -> Option<&str> {
        if self.identity.is_adhoc() {
            return None;
        }
        self.team_id
            .or_else(|| self.identity.credentials().and_then(|c| c.team_id.as_deref()))
    }
}

/// Blobs shared by every slice of one file.
struct SliceBlobs {
    requirements: Vec<u8>,
    entitlements: Option<Vec<u8>>,
    der_entitlements: Option<Vec<u8>>,
    get_task_allow: bool,
}

impl SliceBlobs {
    fn new(options: &SignOptions<'_>) -> Result<Self> {
        let requirements = match options.identity.credentials().and_then(|c| c.common_name()) {
            Some(cn) => designated_requirements(options.identifier, &cn),
            None => empty_requirements(),
        };

        let (entitlements, der_entitlements, get_task_allow) = match options.entitlements {
            Some(plist) => {
                let value = Value::from_reader(std::io::Cursor::new(plist))?;
                let get_task_allow = value
                    .as_dictionary()
                    .and_then(|d| d.get("get-task-allow"))
                    .and_then(Value::as_boolean)
                    .unwrap_or(false);
                let mut xml = Vec::new();
                plist::to_writer_xml(&mut xml, &value)?;
                (
                    Some(build_entitlements_blob(&xml)),
                    Some(build_der_entitlements_blob(&entitlements_to_der(&value)?)),
                    get_task_allow,
                )
            }
            None => (None, None, false),
        };

        Ok(Self {
            requirements,
            entitlements,
            der_entitlements,
            get_task_allow,
        })
    }
}

fn code_directory<'a>(
    options: &'a SignOptions<'_>,
    team_id: Option<&'a str>,
    blobs: &'a SliceBlobs,
    slice: &ArchSlice,
    code: &'a [u8],
) -> CodeDirectoryBuilder<'a> {
    let mut exec_flags = 0;
    if slice.is_executable {
        exec_flags |= CS_EXECSEG_MAIN_BINARY;
        if blobs.get_task_allow {
            exec_flags |= CS_EXECSEG_ALLOW_UNSIGNED;
        }
    }

    let mut cd = CodeDirectoryBuilder::new(options.identifier, code)
        .flags(if options.identity.is_adhoc() { CS_ADHOC } else { 0 })
        .exec_seg(slice.text_segment_size, exec_flags)
        .requirements(&blobs.requirements);
    if let Some(team) = team_id {
        cd = cd.team_id(team);
    }
    if let Some(info) = options.info_plist {
        cd = cd.info_plist(info);
    }
    if let Some(res) = options.code_resources {
        cd = cd.code_resources(res);
    }
    if let Some(ent) = &blobs.entitlements {
        cd = cd.entitlements(ent);
    }
    if slice.is_executable {
        if let Some(der) = &blobs.der_entitlements {
            cd = cd.der_entitlements(der);
        }
    }
    cd
}

fn sign_slice(
    bytes: &[u8],
    slice: &ArchSlice,
    options: &SignOptions<'_>,
    blobs: &SliceBlobs,
) -> Result<Vec<u8>> {
    let team_id = options.effective_team_id();
    let cms_budget = options
        .identity
        .credentials()
        .map_or(0, |c| CMS_OVERHEAD + c.certificates_size());

    // codeLimit does not depend on the reservation, so size against a probe.
    let probe = prepare_slice(bytes, 0)?;
    let sizing = code_directory(options, team_id, blobs, slice, probe.code());
    let mut sizes = vec![
        sizing.size(HashType::Sha1),
        sizing.size(HashType::Sha256),
        blobs.requirements.len(),
        8 + cms_budget,
    ];
    sizes.extend(blobs.entitlements.as_ref().map(Vec::len));
    if slice.is_executable {
        sizes.extend(blobs.der_entitlements.as_ref().map(Vec::len));
    }
    let reserved = (superblob_size(&sizes) + 15) & !15;

    let prepared = prepare_slice(bytes, reserved)?;
    let cd = code_directory(options, team_id, blobs, slice, prepared.code());
    let cd_sha1 = cd.build(HashType::Sha1);
    let cd_sha256 = cd.build(HashType::Sha256);

    let signature = match options.identity.credentials() {
        Some(creds) => {
            let cms = cms::sign_code_directory(
                &cd_sha1,
                creds,
                &cdhash(HashType::Sha1, &cd_sha1),
                &cdhash(HashType::Sha256, &cd_sha256),
            )?;
            build_signature_blob(&cms)
        }
        None => build_signature_blob(&[]),
    };

    let mut superblob = SuperBlobBuilder::new()
        .code_directory(cd_sha1)
        .alternate_code_directory(cd_sha256)
        .requirements(blobs.requirements.clone())
        .signature(signature);
    if let Some(ent) = &blobs.entitlements {
        superblob = superblob.entitlements(ent.clone());
    }
    if slice.is_executable {
        if let Some(der) = &blobs.der_entitlements {
            superblob = superblob.der_entitlements(der.clone());
        }
    }
    let superblob = superblob.build();

    debug!(
        cpu_type = slice.cpu_type,
        signature = superblob.len(),
        reserved,
        "signed slice"
    );
    finish_slice(prepared, &superblob)
}

/// Sign a thin or FAT image and return the signed bytes.
pub fn sign_macho_data(data: Vec<u8>, options: &SignOptions<'_>) -> Result<Vec<u8>> {
    let file = MachOFile::parse(data)?;
    let blobs = SliceBlobs::new(options)?;

    let mut signed = Vec::with_capacity(file.slices().len());
    for slice in file.slices() {
        signed.push(FatSlice {
            cpu_type: slice.cpu_type,
            cpu_subtype: slice.cpu_subtype,
            align: slice.align,
            data: sign_slice(file.slice_bytes(slice), slice, options, &blobs)?,
        });
    }

    if !file.is_fat() {
        if let Some(only) = signed.pop() {
            return Ok(only.data);
        }
    }
    Ok(assemble_fat(&signed))
}

/// Sign the Mach-O file at `path` in place.
pub fn sign_macho(path: impl AsRef<Path>, options: &SignOptions<'_>) -> Result<()> {
    let path = path.as_ref();
    let signed = sign_macho_data(std::fs::read(path)?, options)?;
    std::fs::write(path, signed)?;
    info!(path = %path.display(), identifier = options.identifier, "signed binary");
    Ok(())
}
