//! Signature embedding.
//!
//! Signing happens in two steps per slice so that page hashes cover the
//! final header bytes:
//!
//! 1. [`prepare_slice`] truncates the slice at the end of its code, points
//!    `LC_CODE_SIGNATURE` at a 16-byte aligned offset with room for
//!    `reserved` bytes and grows `__LINKEDIT` to cover it.
//! 2. The caller hashes [`PreparedSlice::code`] and builds the SuperBlob.
//! 3. [`finish_slice`] appends the SuperBlob, zero-padded to the reservation.
//!
//! FAT binaries are re-assembled with [`assemble_fat`] since slices grow.

use super::parser::{read_u32, read_u64, write_u32, write_u64, LoadCommandMap};
use crate::{Error, Result};
use goblin::mach::load_command::{LC_CODE_SIGNATURE, LC_SEGMENT, LC_SEGMENT_64};
use tracing::debug;

/// Size of a `linkedit_data_command`.
const LINKEDIT_DATA_COMMAND_SIZE: usize = 16;

const FAT_MAGIC: u32 = 0xcafe_babe;
const FAT_ARCH_SIZE: usize = 20;

/// `__LINKEDIT` vmsize granularity.
const SEGMENT_ALIGN: usize = 0x4000;

/// A slice with its signature space reserved.
#[derive(Debug)]
pub struct PreparedSlice {
    data: Vec<u8>,
    reserved: usize,
}

impl PreparedSlice {
    /// Bytes covered by the CodeDirectory; `code().len()` is `codeLimit`.
    pub fn code(&self) -> &[u8] {
        &self.data
    }

    pub fn reserved(&self) -> usize {
        self.reserved
    }
}

struct Segment {
    offset: usize,
    fileoff: u64,
    filesize: u64,
    is_linkedit: bool,
}

fn segments(slice: &[u8], map: &LoadCommandMap) -> Vec<Segment> {
    let le = map.little_endian;
    map.commands
        .iter()
        .filter_map(|cmd| {
            let (fileoff, filesize) = match cmd.cmd {
                LC_SEGMENT_64 => (
                    read_u64(slice, cmd.offset + 40, le),
                    read_u64(slice, cmd.offset + 48, le),
                ),
                LC_SEGMENT => (
                    read_u32(slice, cmd.offset + 32, le) as u64,
                    read_u32(slice, cmd.offset + 36, le) as u64,
                ),
                _ => return None,
            };
            Some(Segment {
                offset: cmd.offset,
                fileoff,
                filesize,
                is_linkedit: slice[cmd.offset + 8..cmd.offset + 24].starts_with(b"__LINKEDIT\0"),
            })
        })
        .collect()
}

/// Reserve `reserved` bytes of signature space at the end of `slice`.
///
/// An existing signature is dropped and its `LC_CODE_SIGNATURE` reused;
/// otherwise a new command is added after the last load command.
pub fn prepare_slice(slice: &[u8], reserved: usize) -> Result<PreparedSlice> {
    let map = LoadCommandMap::parse(slice)?;
    let le = map.little_endian;
    let segments = segments(slice, &map);

    let existing = map.commands.iter().find(|c| c.cmd == LC_CODE_SIGNATURE).copied();
    let code_end = match existing {
        Some(cmd) => read_u32(slice, cmd.offset + 8, le) as usize,
        None => segments
            .iter()
            .map(|s| (s.fileoff + s.filesize) as usize)
            .max()
            .unwrap_or(slice.len()),
    }
    .min(slice.len());

    let linkedit = segments
        .iter()
        .find(|s| s.is_linkedit)
        .ok_or_else(|| Error::macho("no __LINKEDIT segment"))?;

    if code_end < map.commands_end() || (code_end as u64) < linkedit.fileoff {
        return Err(Error::macho(format!(
            "code signature offset {:#x} lies outside __LINKEDIT",
            code_end
        )));
    }

    let sig_offset = align_to(code_end, 16);
    let mut data = slice[..code_end].to_vec();
    data.resize(sig_offset, 0);

    let cmd_offset = match existing {
        Some(cmd) => cmd.offset,
        None => {
            if map.free_space() < LINKEDIT_DATA_COMMAND_SIZE {
                return Err(Error::NoLoadCommandSpace {
                    needed: LINKEDIT_DATA_COMMAND_SIZE,
                    available: map.free_space(),
                });
            }
            let at = map.commands_end();
            write_u32(&mut data, at, LC_CODE_SIGNATURE, le);
            write_u32(&mut data, at + 4, LINKEDIT_DATA_COMMAND_SIZE as u32, le);
            map.write_header_counts(
                &mut data,
                map.ncmds + 1,
                map.sizeofcmds + LINKEDIT_DATA_COMMAND_SIZE as u32,
            );
            at
        }
    };
    write_u32(&mut data, cmd_offset + 8, sig_offset as u32, le);
    write_u32(&mut data, cmd_offset + 12, reserved as u32, le);

    let filesize = ((sig_offset + reserved) as u64)
        .checked_sub(linkedit.fileoff)
        .ok_or_else(|| Error::macho("__LINKEDIT starts past the signature"))?;
    let vmsize = align_to(filesize as usize, SEGMENT_ALIGN) as u64;
    if map.is_64 {
        write_u64(&mut data, linkedit.offset + 32, vmsize, le);
        write_u64(&mut data, linkedit.offset + 48, filesize, le);
    } else {
        write_u32(&mut data, linkedit.offset + 28, vmsize as u32, le);
        write_u32(&mut data, linkedit.offset + 36, filesize as u32, le);
    }

    debug!(
        code_limit = sig_offset,
        reserved,
        reused = existing.is_some(),
        "reserved signature space"
    );
    Ok(PreparedSlice { data, reserved })
}

/// Append `superblob` to a prepared slice.
pub fn finish_slice(prepared: PreparedSlice, superblob: &[u8]) -> Result<Vec<u8>> {
    if superblob.len() > prepared.reserved {
        return Err(Error::Signing(format!(
            "signature of {} bytes exceeds reserved {} bytes",
            superblob.len(),
            prepared.reserved
        )));
    }
    let end = prepared.data.len() + prepared.reserved;
    let mut data = prepared.data;
    data.extend_from_slice(superblob);
    data.resize(end, 0);
    Ok(data)
}

/// One architecture of a FAT container.
#[derive(Debug, Clone)]
pub struct FatSlice {
    pub cpu_type: u32,
    pub cpu_subtype: u32,
    /// log2 alignment
    pub align: u32,
    pub data: Vec<u8>,
}

/// Lay out `slices` in a new big-endian FAT container. The first slice
/// starts on a 16 KiB boundary; each slice honours its own alignment.
pub fn assemble_fat(slices: &[FatSlice]) -> Vec<u8> {
    let header_size = 8 + slices.len() * FAT_ARCH_SIZE;
    let mut offset = align_to(header_size, SEGMENT_ALIGN);
    let mut placed = Vec::with_capacity(slices.len());
    for slice in slices {
        offset = align_to(offset, 1usize << slice.align);
        placed.push(offset);
        offset += slice.data.len();
    }

    let mut out = vec![0u8; offset];
    out[0..4].copy_from_slice(&FAT_MAGIC.to_be_bytes());
    out[4..8].copy_from_slice(&(slices.len() as u32).to_be_bytes());
    for (i, (slice, &at)) in slices.iter().zip(&placed).enumerate() {
        let entry = 8 + i * FAT_ARCH_SIZE;
        for (j, v) in [slice.cpu_type, slice.cpu_subtype, at as u32, slice.data.len() as u32, slice.align]
            .into_iter()
            .enumerate()
        {
            out[entry + j * 4..entry + j * 4 + 4].copy_from_slice(&v.to_be_bytes());
        }
        out[at..at + slice.data.len()].copy_from_slice(&slice.data);
    }
    out
}

fn align_to(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macho::parser::{slice_ranges, MachOFile};
    use crate::macho::testutil::MachOBuilder;

    #[test]
    fn test_align_to() {
        assert_eq!(align_to(0, 16), 0);
        assert_eq!(align_to(1, 16), 16);
        assert_eq!(align_to(17, 16), 32);
        assert_eq!(align_to(100, 0x4000), 0x4000);
    }

    #[test]
    fn test_prepare_adds_code_signature_command() {
        let original = MachOBuilder::new().build();
        let before = LoadCommandMap::parse(&original).unwrap();

        let prepared = prepare_slice(&original, 0x200).unwrap();
        assert_eq!(prepared.code().len(), 0x4100);

        let signed = finish_slice(prepared, &[0xaa; 0x80]).unwrap();
        assert_eq!(signed.len(), 0x4100 + 0x200);
        assert_eq!(&signed[0x4100..0x4180], &[0xaa; 0x80][..]);
        assert!(signed[0x4180..].iter().all(|&b| b == 0));

        let after = LoadCommandMap::parse(&signed).unwrap();
        assert_eq!(after.ncmds, before.ncmds + 1);
        assert_eq!(after.sizeofcmds, before.sizeofcmds + 16);

        let file = MachOFile::parse(signed).unwrap();
        let slice = &file.slices()[0];
        assert_eq!(slice.code_sig_offset, Some(0x4100));
        assert_eq!(slice.code_sig_size, Some(0x200));

        let linkedit = segments(file.data(), &after).into_iter().find(|s| s.is_linkedit).unwrap();
        assert_eq!(linkedit.fileoff + linkedit.filesize, 0x4300);
    }

    #[test]
    fn test_prepare_reuses_existing_signature() {
        let first = finish_slice(prepare_slice(&MachOBuilder::new().build(), 0x100).unwrap(), &[1; 0x40]).unwrap();
        let ncmds = LoadCommandMap::parse(&first).unwrap().ncmds;

        let prepared = prepare_slice(&first, 0x300).unwrap();
        assert_eq!(prepared.code().len(), 0x4100);
        assert_eq!(prepared.reserved(), 0x300);

        let second = finish_slice(prepared, &[2; 0x40]).unwrap();
        assert_eq!(LoadCommandMap::parse(&second).unwrap().ncmds, ncmds);
        assert_eq!(second.len(), 0x4400);
    }

    #[test]
    fn test_prepare_rejects_bad_signature_offset() {
        let signed = finish_slice(prepare_slice(&MachOBuilder::new().build(), 0x100).unwrap(), &[1; 0x40]).unwrap();
        let map = LoadCommandMap::parse(&signed).unwrap();
        let cs = map.commands.iter().find(|c| c.cmd == LC_CODE_SIGNATURE).unwrap().offset;

        // Inside the load commands, then inside __TEXT.
        for dataoff in [0u32, 0x1000] {
            let mut bad = signed.clone();
            write_u32(&mut bad, cs + 8, dataoff, true);
            assert!(matches!(prepare_slice(&bad, 0x100), Err(Error::MachO(_))));
        }
    }

    #[test]
    fn test_prepare_without_room() {
        let tight = MachOBuilder::new().slack(8).build();
        assert!(matches!(
            prepare_slice(&tight, 0x100),
            Err(Error::NoLoadCommandSpace { needed: 16, available: 8 })
        ));
    }

    #[test]
    fn test_finish_rejects_oversized_signature() {
        let prepared = prepare_slice(&MachOBuilder::new().build(), 0x10).unwrap();
        assert!(finish_slice(prepared, &[0; 0x20]).is_err());
    }

    #[test]
    fn test_assemble_fat() {
        let a = MachOBuilder::new().build();
        let b = MachOBuilder::new().cpu(0x0100_0007).build();
        let fat = assemble_fat(&[
            FatSlice { cpu_type: 0x0100_000c, cpu_subtype: 0, align: 14, data: a.clone() },
            FatSlice { cpu_type: 0x0100_0007, cpu_subtype: 3, align: 14, data: b.clone() },
        ]);

        let ranges = slice_ranges(&fat).unwrap();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].start, 0x4000);
        assert_eq!(ranges[1].start % 0x4000, 0);
        assert_eq!(&fat[ranges[0].clone()], &a[..]);
        assert_eq!(&fat[ranges[1].clone()], &b[..]);

        let file = MachOFile::parse(fat).unwrap();
        assert!(file.is_fat());
        assert_eq!(file.slices()[1].cpu_subtype, 3);
    }
}
