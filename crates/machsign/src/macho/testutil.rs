//! Synthetic Mach-O images for unit tests.

use goblin::mach::load_command::{LC_ID_DYLIB, LC_SEGMENT_64};

const TEXT_SIZE: usize = 0x4000;
const LINKEDIT_SIZE: usize = 0x100;
const VM_BASE: u64 = 0x1_0000_0000;

/// Builds a little-endian 64-bit image with `__TEXT`, `__LINKEDIT` and
/// optional dylib commands.
pub(crate) struct MachOBuilder {
    cpu: u32,
    filetype: u32,
    install_name: Option<String>,
    dylibs: Vec<(u32, String)>,
    slack: Option<usize>,
}

impl MachOBuilder {
    /// File offset of `__text` unless [`MachOBuilder::slack`] is used.
    pub const TEXT_SECTION_OFFSET: usize = 0x400;

    pub fn new() -> Self {
        Self {
            cpu: 0x0100_000c,
            filetype: 2,
            install_name: None,
            dylibs: Vec::new(),
            slack: None,
        }
    }

    pub fn cpu(mut self, cpu: u32) -> Self {
        self.cpu = cpu;
        self
    }

    /// Make a `MH_DYLIB` with an `LC_ID_DYLIB`.
    pub fn install_name(mut self, name: &str) -> Self {
        self.filetype = 6;
        self.install_name = Some(name.to_string());
        self
    }

    pub fn dylib(mut self, cmd: u32, path: &str) -> Self {
        self.dylibs.push((cmd, path.to_string()));
        self
    }

    /// Place `__text` this many bytes after the last load command.
    pub fn slack(mut self, bytes: usize) -> Self {
        self.slack = Some(bytes);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut dylib_cmds = Vec::new();
        if let Some(name) = &self.install_name {
            dylib_cmds.push(dylib_command(LC_ID_DYLIB, name));
        }
        for (cmd, path) in &self.dylibs {
            dylib_cmds.push(dylib_command(*cmd, path));
        }

        let sizeofcmds = (72 + 80) + 72 + dylib_cmds.iter().map(Vec::len).sum::<usize>();
        let text_offset = match self.slack {
            Some(slack) => 32 + sizeofcmds + slack,
            None => Self::TEXT_SECTION_OFFSET,
        };
        assert!(32 + sizeofcmds <= text_offset, "load commands overflow __text");

        let mut out = Vec::with_capacity(TEXT_SIZE + LINKEDIT_SIZE);
        for v in [0xfeed_facf, self.cpu, 0, self.filetype] {
            out.extend_from_slice(&u32::to_le_bytes(v));
        }
        out.extend_from_slice(&(2 + dylib_cmds.len() as u32).to_le_bytes());
        out.extend_from_slice(&(sizeofcmds as u32).to_le_bytes());
        out.extend_from_slice(&0x0020_0085u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());

        out.extend(segment(b"__TEXT", VM_BASE, TEXT_SIZE as u64, 0, TEXT_SIZE as u64, 5, 1));
        out.extend(section(
            b"__text",
            b"__TEXT",
            VM_BASE + text_offset as u64,
            (TEXT_SIZE - text_offset) as u64,
            text_offset as u32,
        ));
        out.extend(segment(
            b"__LINKEDIT",
            VM_BASE + TEXT_SIZE as u64,
            0x4000,
            TEXT_SIZE as u64,
            LINKEDIT_SIZE as u64,
            1,
            0,
        ));
        for cmd in dylib_cmds {
            out.extend(cmd);
        }

        out.resize(text_offset, 0);
        out.extend((text_offset..TEXT_SIZE).map(|i| (i % 251) as u8));
        out.extend((0..LINKEDIT_SIZE).map(|i| (i % 13) as u8 + 1));
        out
    }
}

/// Wrap slices into a FAT container with 16 KiB alignment.
pub(crate) fn fat(slices: &[Vec<u8>]) -> Vec<u8> {
    const ALIGN: usize = 0x4000;
    let mut out = Vec::new();
    out.extend_from_slice(&0xcafe_babeu32.to_be_bytes());
    out.extend_from_slice(&(slices.len() as u32).to_be_bytes());

    let mut offset = ALIGN;
    let mut offsets = Vec::new();
    for slice in slices {
        let cpu = u32::from_le_bytes([slice[4], slice[5], slice[6], slice[7]]);
        for v in [cpu, 0, offset as u32, slice.len() as u32, 14] {
            out.extend_from_slice(&v.to_be_bytes());
        }
        offsets.push(offset);
        offset = (offset + slice.len() + ALIGN - 1) & !(ALIGN - 1);
    }
    for (slice, at) in slices.iter().zip(offsets) {
        out.resize(at, 0);
        out.extend_from_slice(slice);
    }
    out
}

fn dylib_command(cmd: u32, path: &str) -> Vec<u8> {
    let cmdsize = 24 + path.len() + (8 - path.len() % 8);
    let mut out = Vec::with_capacity(cmdsize);
    for v in [cmd, cmdsize as u32, 24, 2, 0x0001_0000, 0x0001_0000] {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out.extend_from_slice(path.as_bytes());
    out.resize(cmdsize, 0);
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

fn section(name: &[u8], seg: &[u8], addr: u64, size: u64, offset: u32) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&name16(name));
    out.extend_from_slice(&name16(seg));
    out.extend_from_slice(&addr.to_le_bytes());
    out.extend_from_slice(&size.to_le_bytes());
    for v in [offset, 2, 0, 0, 0x8000_0400, 0, 0, 0] {
        out.extend_from_slice(&u32::to_le_bytes(v));
    }
    out
}
