//! Shared helpers for the integration tests.

#![allow(dead_code)]

use plist::{Dictionary, Value};
use std::fs;
use std::path::{Path, PathBuf};

pub const MH_EXECUTE: u32 = 2;
pub const MH_DYLIB: u32 = 6;

const LC_SEGMENT_64: u32 = 0x19;
const LC_ID_DYLIB: u32 = 0x0d;
const TEXT_SIZE: usize = 0x4000;
const TEXT_OFFSET: usize = 0x400;
const LINKEDIT_SIZE: usize = 0x100;

pub fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
}

/// A little-endian arm64 image: `__TEXT` with one section, `__LINKEDIT`
/// and, for dylibs, an `LC_ID_DYLIB`.
pub fn macho_image(filetype: u32, install_name: Option<&str>) -> Vec<u8> {
    let id = install_name.map(|name| {
        let cmdsize = 24 + name.len() + (8 - name.len() % 8);
        let mut cmd = Vec::new();
        for v in [LC_ID_DYLIB, cmdsize as u32, 24, 2, 0x0001_0000, 0x0001_0000] {
            cmd.extend_from_slice(&v.to_le_bytes());
        }
        cmd.extend_from_slice(name.as_bytes());
        cmd.resize(cmdsize, 0);
        cmd
    });
    let sizeofcmds = 152 + 72 + id.as_ref().map_or(0, Vec::len);

    let mut out = Vec::new();
    for v in [0xfeed_facf, 0x0100_000c, 0, filetype] {
        out.extend_from_slice(&u32::to_le_bytes(v));
    }
    let ncmds = 2 + id.is_some() as u32;
    for v in [ncmds, sizeofcmds as u32, 0x0020_0085, 0] {
        out.extend_from_slice(&u32::to_le_bytes(v));
    }

    let base = 0x1_0000_0000u64;
    out.extend(segment(b"__TEXT", base, TEXT_SIZE as u64, 0, TEXT_SIZE as u64, 5, 1));
    out.extend_from_slice(&name16(b"__text"));
    out.extend_from_slice(&name16(b"__TEXT"));
    out.extend_from_slice(&(base + TEXT_OFFSET as u64).to_le_bytes());
    out.extend_from_slice(&((TEXT_SIZE - TEXT_OFFSET) as u64).to_le_bytes());
    for v in [TEXT_OFFSET as u32, 2, 0, 0, 0x8000_0400, 0, 0, 0] {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out.extend(segment(
        b"__LINKEDIT",
        base + TEXT_SIZE as u64,
        0x4000,
        TEXT_SIZE as u64,
        LINKEDIT_SIZE as u64,
        1,
        0,
    ));
    if let Some(cmd) = id {
        out.extend(cmd);
    }

    out.resize(TEXT_OFFSET, 0);
    out.extend((TEXT_OFFSET..TEXT_SIZE).map(|i| (i % 251) as u8));
    out.extend((0..LINKEDIT_SIZE).map(|i| (i % 13) as u8 + 1));
    out
}

fn name16(name: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..name.len()].copy_from_slice(name);
    out
}

fn segment(
    name: &[u8],
    vmaddr: u64,
    vmsize: u64,
    fileoff: u64,
    filesize: u64,
    prot: u32,
    nsects: u32,
) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&LC_SEGMENT_64.to_le_bytes());
    out.extend_from_slice(&(72 + 80 * nsects).to_le_bytes());
    out.extend_from_slice(&name16(name));
    for v in [vmaddr, vmsize, fileoff, filesize] {
        out.extend_from_slice(&v.to_le_bytes());
    }
    for v in [prot, prot, nsects, 0] {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

pub fn write_info(bundle: &Path, id: &str, executable: &str) {
    fs::create_dir_all(bundle).unwrap();
    let mut d = Dictionary::new();
    d.insert("CFBundleIdentifier".into(), Value::String(id.into()));
    d.insert("CFBundleExecutable".into(), Value::String(executable.into()));
    d.insert("CFBundleVersion".into(), Value::String("1.0".into()));
    Value::Dictionary(d).to_file_xml(bundle.join("Info.plist")).unwrap();
}

/// `root/Payload/Demo.app` with a main executable, a framework and a
/// plug-in.
pub fn demo_app(root: &Path) -> PathBuf {
    let app = root.join("Payload/Demo.app");
    write_info(&app, "com.example.demo", "Demo");
    fs::write(app.join("Demo"), macho_image(MH_EXECUTE, None)).unwrap();
    fs::write(app.join("Assets.car"), b"assets").unwrap();

    let kit = app.join("Frameworks/Kit.framework");
    write_info(&kit, "com.example.demo.Kit", "Kit");
    fs::write(kit.join("Kit"), macho_image(MH_DYLIB, Some("@rpath/Kit.framework/Kit"))).unwrap();

    let ext = app.join("PlugIns/Share.appex");
    write_info(&ext, "com.example.demo.share", "Share");
    fs::write(ext.join("Share"), macho_image(MH_EXECUTE, None)).unwrap();
    app
}

/// Code-signature SuperBlob of the first slice, or `None` when unsigned.
pub fn superblob(binary: &Path) -> Option<Vec<u8>> {
    let data = fs::read(binary).unwrap();
    let file = machsign::macho::MachOFile::parse(data.clone()).unwrap();
    let slice = &file.slices()[0];
    let start = slice.offset + slice.code_sig_offset? as usize;
    let end = start + slice.code_sig_size? as usize;
    Some(data[start..end].to_vec())
}

/// The blob stored in `slot` of a SuperBlob.
pub fn blob(superblob: &[u8], slot: u32) -> Option<Vec<u8>> {
    machsign::codesign::superblob::parse_superblob(superblob)
        .unwrap()
        .into_iter()
        .find(|(s, _)| *s == slot)
        .map(|(_, b)| b.to_vec())
}
