//! Mach-O file parsing using goblin.
//!
//! [`MachOFile`] splits a thin or FAT binary into [`ArchSlice`]s. For edits
//! that touch raw load commands, [`LoadCommandMap`] records where every
//! command lives inside a slice and how much padding the linker left before
//! the first section.

use crate::{Error, Result};
use goblin::mach::header::{MH_CIGAM_64, MH_EXECUTE, MH_MAGIC_64};
use goblin::mach::load_command::CommandVariant;
use goblin::mach::{Mach, MachO};
use std::ops::Range;
use std::path::Path;

/// Size of a 32-bit `mach_header`.
pub const MACH_HEADER_SIZE: usize = 28;

/// Size of a 64-bit `mach_header_64`.
pub const MACH_HEADER_64_SIZE: usize = 32;

/// Default slice alignment (log2) for thin binaries, 16 KiB.
const DEFAULT_ALIGN_LOG2: u32 = 14;

/// Represents a parsed Mach-O file
pub struct MachOFile {
    /// Raw file data
    data: Vec<u8>,
    /// Is FAT binary
    is_fat: bool,
    /// Architecture slices
    slices: Vec<ArchSlice>,
}

/// A single architecture slice
#[derive(Debug, Clone)]
pub struct ArchSlice {
    /// Offset of the slice in the file (0 for thin binaries)
    pub offset: usize,
    /// Size of the slice
    pub size: usize,
    /// CPU type
    pub cpu_type: u32,
    /// CPU subtype
    pub cpu_subtype: u32,
    /// Alignment of the slice inside a FAT container (log2)
    pub align: u32,
    /// Is 64-bit
    pub is_64: bool,
    /// Is executable (MH_EXECUTE)
    pub is_executable: bool,
    /// Code signature offset, relative to the slice
    pub code_sig_offset: Option<u32>,
    /// Code signature size
    pub code_sig_size: Option<u32>,
    /// __TEXT segment size (for execSegLimit)
    pub text_segment_size: u64,
    /// Code length (to signature or end of slice)
    pub code_length: usize,
}

impl MachOFile {
    /// Open and parse a Mach-O file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        Self::parse(data)
    }

    /// Parse Mach-O from bytes
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        let mach = Mach::parse(&data).map_err(|e| Error::macho(format!("Failed to parse: {}", e)))?;

        let (is_fat, slices) = match mach {
            Mach::Binary(macho) => {
                let cpu = (macho.header.cputype, macho.header.cpusubtype);
                let slice = Self::describe_slice(&macho, 0, data.len(), cpu, DEFAULT_ALIGN_LOG2);
                (false, vec![slice])
            }
            Mach::Fat(fat) => {
                let mut slices = Vec::new();
                for (i, arch) in fat.iter_arches().enumerate() {
                    let arch = arch.map_err(|e| Error::macho(format!("Fat arch {}: {}", i, e)))?;
                    let offset = arch.offset as usize;
                    let size = arch.size as usize;
                    let slice_data = data
                        .get(offset..offset + size)
                        .ok_or_else(|| Error::macho(format!("Slice {} extends past end of file", i)))?;

                    let macho = MachO::parse(slice_data, 0)
                        .map_err(|e| Error::macho(format!("Slice {}: {}", i, e)))?;

                    // The container's arch record is authoritative for cpu type.
                    let cpu = (arch.cputype, arch.cpusubtype);
                    slices.push(Self::describe_slice(&macho, offset, size, cpu, arch.align));
                }
                if slices.is_empty() {
                    return Err(Error::macho("Empty FAT binary"));
                }
                (true, slices)
            }
        };

        Ok(Self { data, is_fat, slices })
    }

    fn describe_slice(
        macho: &MachO,
        offset: usize,
        size: usize,
        (cpu_type, cpu_subtype): (u32, u32),
        align: u32,
    ) -> ArchSlice {
        let mut code_sig_offset = None;
        let mut code_sig_size = None;
        let mut text_segment_size = 0u64;

        for lc in &macho.load_commands {
            match lc.command {
                CommandVariant::CodeSignature(cs) => {
                    code_sig_offset = Some(cs.dataoff);
                    code_sig_size = Some(cs.datasize);
                }
                CommandVariant::Segment64(ref seg) if seg.segname.starts_with(b"__TEXT\0") => {
                    text_segment_size = seg.vmsize;
                }
                CommandVariant::Segment32(ref seg) if seg.segname.starts_with(b"__TEXT\0") => {
                    text_segment_size = seg.vmsize as u64;
                }
                _ => {}
            }
        }

        let code_length = code_sig_offset
            .map(|o| (o as usize).min(size))
            .unwrap_or(size);

        ArchSlice {
            offset,
            size,
            cpu_type,
            cpu_subtype,
            align,
            is_64: macho.header.magic == MH_MAGIC_64 || macho.header.magic == MH_CIGAM_64,
            is_executable: macho.header.filetype == MH_EXECUTE,
            code_sig_offset,
            code_sig_size,
            text_segment_size,
            code_length,
        }
    }

    /// Get raw data
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consume the file and return its bytes.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Is FAT binary
    pub fn is_fat(&self) -> bool {
        self.is_fat
    }

    /// Get architecture slices
    pub fn slices(&self) -> &[ArchSlice] {
        &self.slices
    }

    /// Bytes of a whole slice.
    pub fn slice_bytes(&self, slice: &ArchSlice) -> &[u8] {
        &self.data[slice.offset..slice.offset + slice.size]
    }

    /// Mutable bytes of a whole slice.
    pub fn slice_bytes_mut(&mut self, index: usize) -> Option<&mut [u8]> {
        let slice = self.slices.get(index)?;
        let range = slice.offset..slice.offset + slice.size;
        self.data.get_mut(range)
    }

    /// Get code bytes for a slice (up to signature)
    pub fn code_bytes(&self, slice: &ArchSlice) -> &[u8] {
        let start = slice.offset;
        &self.data[start..start + slice.code_length]
    }
}

/// A load command as it sits in the slice bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawCommand {
    /// Offset of the command from the start of the slice
    pub offset: usize,
    /// `cmd` field
    pub cmd: u32,
    /// `cmdsize` field
    pub cmdsize: usize,
}

/// Location of every load command in a single-architecture slice.
#[derive(Debug, Clone)]
pub struct LoadCommandMap {
    /// 64-bit header
    pub is_64: bool,
    /// Byte order of the slice
    pub little_endian: bool,
    /// `mach_header` / `mach_header_64` size
    pub header_size: usize,
    /// Header `ncmds`
    pub ncmds: u32,
    /// Header `sizeofcmds`
    pub sizeofcmds: u32,
    /// Commands in file order
    pub commands: Vec<RawCommand>,
    /// First file offset occupied by segment or section content
    pub data_start: usize,
}

impl LoadCommandMap {
    /// Build the map for a single-architecture Mach-O slice.
    pub fn parse(slice: &[u8]) -> Result<Self> {
        let macho = MachO::parse(slice, 0)?;
        let is_64 = macho.is_64;
        let little_endian = macho.little_endian;
        let header_size = if is_64 { MACH_HEADER_64_SIZE } else { MACH_HEADER_SIZE };

        let mut commands = Vec::with_capacity(macho.load_commands.len());
        let mut data_start = slice.len();

        for lc in &macho.load_commands {
            commands.push(RawCommand {
                offset: lc.offset,
                cmd: lc.command.cmd(),
                cmdsize: lc.command.cmdsize(),
            });

            // Section structs follow the segment command: section_64 is 80
            // bytes with `offset` at +48, section is 68 bytes with it at +40.
            let (fileoff, filesize, nsects, first_sect, sect_size, off_field) = match &lc.command {
                CommandVariant::Segment64(seg) => {
                    (seg.fileoff, seg.filesize, seg.nsects as usize, lc.offset + 72, 80, 48)
                }
                CommandVariant::Segment32(seg) => (
                    seg.fileoff as u64,
                    seg.filesize as u64,
                    seg.nsects as usize,
                    lc.offset + 56,
                    68,
                    40,
                ),
                _ => continue,
            };

            if fileoff > 0 && filesize > 0 {
                data_start = data_start.min(fileoff as usize);
            }
            for i in 0..nsects {
                let field = first_sect + i * sect_size + off_field;
                if field + 4 > slice.len() {
                    break;
                }
                let sect_offset = read_u32(slice, field, little_endian) as usize;
                if sect_offset > 0 {
                    data_start = data_start.min(sect_offset);
                }
            }
        }

        Ok(Self {
            is_64,
            little_endian,
            header_size,
            ncmds: macho.header.ncmds as u32,
            sizeofcmds: macho.header.sizeofcmds,
            commands,
            data_start,
        })
    }

    /// Offset one past the last load command.
    pub fn commands_end(&self) -> usize {
        self.header_size + self.sizeofcmds as usize
    }

    /// Padding available for new or larger load commands.
    pub fn free_space(&self) -> usize {
        self.data_start.saturating_sub(self.commands_end())
    }

    /// Write `ncmds` and `sizeofcmds` back into the header.
    pub(crate) fn write_header_counts(&self, slice: &mut [u8], ncmds: u32, sizeofcmds: u32) {
        write_u32(slice, 16, ncmds, self.little_endian);
        write_u32(slice, 20, sizeofcmds, self.little_endian);
    }
}

/// Byte ranges of every architecture slice in a thin or FAT image.
pub fn slice_ranges(data: &[u8]) -> Result<Vec<Range<usize>>> {
    match Mach::parse(data)? {
        Mach::Binary(_) => Ok(vec![0..data.len()]),
        Mach::Fat(fat) => {
            let mut ranges = Vec::new();
            for arch in fat.iter_arches() {
                let arch = arch?;
                let range = arch.offset as usize..arch.offset as usize + arch.size as usize;
                if range.end > data.len() {
                    return Err(Error::macho("FAT slice extends past end of file"));
                }
                ranges.push(range);
            }
            Ok(ranges)
        }
    }
}

/// Check the first four bytes for a Mach-O or FAT magic.
pub fn is_macho_magic(magic: [u8; 4]) -> bool {
    matches!(
        magic,
        [0xfe, 0xed, 0xfa, 0xce]
            | [0xfe, 0xed, 0xfa, 0xcf]
            | [0xce, 0xfa, 0xed, 0xfe]
            | [0xcf, 0xfa, 0xed, 0xfe]
            | [0xca, 0xfe, 0xba, 0xbe]
            | [0xbe, 0xba, 0xfe, 0xca]
    )
}

pub(crate) fn read_u32(data: &[u8], offset: usize, little_endian: bool) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[offset..offset + 4]);
    if little_endian {
        u32::from_le_bytes(bytes)
    } else {
        u32::from_be_bytes(bytes)
    }
}

pub(crate) fn read_u64(data: &[u8], offset: usize, little_endian: bool) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    if little_endian {
        u64::from_le_bytes(bytes)
    } else {
        u64::from_be_bytes(bytes)
    }
}

pub(crate) fn write_u32(data: &mut [u8], offset: usize, value: u32, little_endian: bool) {
    let bytes = if little_endian {
        value.to_le_bytes()
    } else {
        value.to_be_bytes()
    };
    data[offset..offset + 4].copy_from_slice(&bytes);
}

pub(crate) fn write_u64(data: &mut [u8], offset: usize, value: u64, little_endian: bool) {
    let bytes = if little_endian {
        value.to_le_bytes()
    } else {
        value.to_be_bytes()
    };
    data[offset..offset + 8].copy_from_slice(&bytes);
}
