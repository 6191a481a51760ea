//! Dynamic-library load command editing.
//!
//! Works in the spirit of `install_name_tool`: references are added,
//! removed, listed and renamed by rewriting the load-command region in
//! place. Slices never change size, so FAT offsets stay valid; any edit
//! has to fit in the padding between the last load command and the first
//! section.
//!
//! Every edit invalidates an existing code signature. Re-sign afterwards.

use super::parser::{read_u32, slice_ranges, write_u32, LoadCommandMap};
use crate::{Error, Result};
use goblin::mach::load_command::{
    LC_LAZY_LOAD_DYLIB, LC_LOAD_DYLIB, LC_LOAD_UPWARD_DYLIB, LC_LOAD_WEAK_DYLIB,
    LC_REEXPORT_DYLIB,
};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// `sizeof(struct dylib_command)`
const DYLIB_COMMAND_SIZE: usize = 24;

/// Timestamp written into injected commands.
const INJECTED_TIMESTAMP: u32 = 2;

/// How a dependency is linked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DylibKind {
    /// `LC_LOAD_DYLIB`
    Load,
    /// `LC_LOAD_WEAK_DYLIB`
    Weak,
    /// `LC_REEXPORT_DYLIB`
    Reexport,
    /// `LC_LAZY_LOAD_DYLIB`
    Lazy,
    /// `LC_LOAD_UPWARD_DYLIB`
    Upward,
}

impl DylibKind {
    /// Map a load command type to a dependency kind.
    pub fn from_cmd(cmd: u32) -> Option<Self> {
        match cmd {
            LC_LOAD_DYLIB => Some(Self::Load),
            LC_LOAD_WEAK_DYLIB => Some(Self::Weak),
            LC_REEXPORT_DYLIB => Some(Self::Reexport),
            LC_LAZY_LOAD_DYLIB => Some(Self::Lazy),
            LC_LOAD_UPWARD_DYLIB => Some(Self::Upward),
            _ => None,
        }
    }

    /// The load command type for this kind.
    pub fn cmd(self) -> u32 {
        match self {
            Self::Load => LC_LOAD_DYLIB,
            Self::Weak => LC_LOAD_WEAK_DYLIB,
            Self::Reexport => LC_REEXPORT_DYLIB,
            Self::Lazy => LC_LAZY_LOAD_DYLIB,
            Self::Upward => LC_LOAD_UPWARD_DYLIB,
        }
    }
}

/// A dependency as recorded in one slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DylibInfo {
    /// Install name of the dependency
    pub path: String,
    pub kind: DylibKind,
    /// Offset of the command from the start of its slice
    pub offset: usize,
    pub cmdsize: usize,
    pub timestamp: u32,
    pub current_version: u32,
    pub compatibility_version: u32,
}

/// Result of [`inject_dylib`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectOutcome {
    /// A new command was appended.
    Inserted,
    /// An existing reference was switched between weak and strong.
    Retyped,
    /// The reference already existed with the requested kind.
    AlreadyPresent,
}

impl InjectOutcome {
    fn merge(self, other: Self) -> Self {
        use InjectOutcome::*;
        match (self, other) {
            (Inserted, _) | (_, Inserted) => Inserted,
            (Retyped, _) | (_, Retyped) => Retyped,
            _ => AlreadyPresent,
        }
    }
}

/// Dependencies of a single slice in load order.
pub fn slice_dylibs(slice: &[u8]) -> Result<Vec<DylibInfo>> {
    let map = LoadCommandMap::parse(slice)?;
    collect_dylibs(slice, &map)
}

fn collect_dylibs(slice: &[u8], map: &LoadCommandMap) -> Result<Vec<DylibInfo>> {
    let le = map.little_endian;
    let mut dylibs = Vec::new();

    for command in &map.commands {
        let Some(kind) = DylibKind::from_cmd(command.cmd) else {
            continue;
        };
        if command.cmdsize < DYLIB_COMMAND_SIZE {
            return Err(Error::macho(format!(
                "dylib command at {:#x} is too small",
                command.offset
            )));
        }

        let name_offset = read_u32(slice, command.offset + 8, le) as usize;
        if name_offset < DYLIB_COMMAND_SIZE || name_offset >= command.cmdsize {
            return Err(Error::macho(format!(
                "dylib command at {:#x} has invalid name offset",
                command.offset
            )));
        }

        let raw = &slice[command.offset + name_offset..command.offset + command.cmdsize];
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        let path = std::str::from_utf8(&raw[..end])
            .map_err(|_| Error::macho("dylib path is not valid UTF-8"))?
            .to_string();

        dylibs.push(DylibInfo {
            path,
            kind,
            offset: command.offset,
            cmdsize: command.cmdsize,
            timestamp: read_u32(slice, command.offset + 12, le),
            current_version: read_u32(slice, command.offset + 16, le),
            compatibility_version: read_u32(slice, command.offset + 20, le),
        });
    }

    Ok(dylibs)
}

/// Encode a `dylib_command` with the path stored inline and NUL padded to
/// an 8-byte boundary.
fn encode_dylib_command(
    path: &str,
    kind: DylibKind,
    timestamp: u32,
    current_version: u32,
    compatibility_version: u32,
    little_endian: bool,
) -> Result<Vec<u8>> {
    if path.is_empty() || path.contains('\0') {
        return Err(Error::InvalidArgument(format!("invalid dylib path {:?}", path)));
    }

    let cmdsize = DYLIB_COMMAND_SIZE + path.len() + (8 - path.len() % 8);
    let mut command = vec![0u8; cmdsize];
    let fields = [
        kind.cmd(),
        cmdsize as u32,
        DYLIB_COMMAND_SIZE as u32,
        timestamp,
        current_version,
        compatibility_version,
    ];
    for (i, value) in fields.into_iter().enumerate() {
        write_u32(&mut command, i * 4, value, little_endian);
    }
    command[DYLIB_COMMAND_SIZE..DYLIB_COMMAND_SIZE + path.len()].copy_from_slice(path.as_bytes());
    Ok(command)
}

/// Replace the whole load-command region.
fn write_region(slice: &mut [u8], map: &LoadCommandMap, region: &[u8], ncmds: u32) -> Result<()> {
    let old_size = map.sizeofcmds as usize;
    let capacity = old_size + map.free_space();
    if region.len() > capacity {
        return Err(Error::NoLoadCommandSpace {
            needed: region.len() - old_size,
            available: map.free_space(),
        });
    }

    let start = map.header_size;
    let new_end = start + region.len();
    let old_end = map.commands_end();
    slice[start..new_end].copy_from_slice(region);
    if new_end < old_end {
        slice[new_end..old_end].fill(0);
    }
    map.write_header_counts(slice, ncmds, region.len() as u32);
    Ok(())
}

fn inject_slice(slice: &mut [u8], path: &str, weak: bool) -> Result<InjectOutcome> {
    let map = LoadCommandMap::parse(slice)?;
    let wanted = if weak { DylibKind::Weak } else { DylibKind::Load };

    let existing = collect_dylibs(slice, &map)?
        .into_iter()
        .find(|d| d.path == path && matches!(d.kind, DylibKind::Load | DylibKind::Weak));
    if let Some(existing) = existing {
        if existing.kind == wanted {
            return Ok(InjectOutcome::AlreadyPresent);
        }
        write_u32(slice, existing.offset, wanted.cmd(), map.little_endian);
        return Ok(InjectOutcome::Retyped);
    }

    let command = encode_dylib_command(path, wanted, INJECTED_TIMESTAMP, 0, 0, map.little_endian)?;
    let mut region = slice[map.header_size..map.commands_end()].to_vec();
    region.extend_from_slice(&command);
    write_region(slice, &map, &region, map.ncmds + 1)?;
    Ok(InjectOutcome::Inserted)
}

fn uninstall_slice<S: AsRef<str>>(slice: &mut [u8], paths: &[S]) -> Result<usize> {
    let map = LoadCommandMap::parse(slice)?;
    let doomed: Vec<usize> = collect_dylibs(slice, &map)?
        .into_iter()
        .filter(|d| paths.iter().any(|p| p.as_ref() == d.path))
        .map(|d| d.offset)
        .collect();
    if doomed.is_empty() {
        return Ok(0);
    }

    let mut region = Vec::with_capacity(map.sizeofcmds as usize);
    for command in map.commands.iter().filter(|c| !doomed.contains(&c.offset)) {
        region.extend_from_slice(&slice[command.offset..command.offset + command.cmdsize]);
    }
    write_region(slice, &map, &region, map.ncmds - doomed.len() as u32)?;
    Ok(doomed.len())
}

fn change_slice(slice: &mut [u8], old: &str, new: &str) -> Result<bool> {
    let map = LoadCommandMap::parse(slice)?;
    let Some(target) = collect_dylibs(slice, &map)?.into_iter().find(|d| d.path == old) else {
        return Ok(false);
    };

    let replacement = encode_dylib_command(
        new,
        target.kind,
        target.timestamp,
        target.current_version,
        target.compatibility_version,
        map.little_endian,
    )?;

    let mut region = Vec::with_capacity(map.sizeofcmds as usize + replacement.len());
    for command in &map.commands {
        if command.offset == target.offset {
            region.extend_from_slice(&replacement);
        } else {
            region.extend_from_slice(&slice[command.offset..command.offset + command.cmdsize]);
        }
    }
    write_region(slice, &map, &region, map.ncmds)?;
    Ok(true)
}

/// Add a dependency on `dylib` to every slice of `data`.
///
/// On error the buffer may be partially modified.
pub fn inject_dylib_bytes(data: &mut [u8], dylib: &str, weak: bool) -> Result<InjectOutcome> {
    let mut outcome = InjectOutcome::AlreadyPresent;
    for range in slice_ranges(data)? {
        outcome = outcome.merge(inject_slice(&mut data[range], dylib, weak)?);
    }
    Ok(outcome)
}

/// Remove every reference to `dylibs` from every slice. Returns how many
/// commands were removed.
pub fn uninstall_dylibs_bytes<S: AsRef<str>>(data: &mut [u8], dylibs: &[S]) -> Result<usize> {
    let mut removed = 0;
    for range in slice_ranges(data)? {
        removed += uninstall_slice(&mut data[range], dylibs)?;
    }
    if removed == 0 {
        let names: Vec<&str> = dylibs.iter().map(AsRef::as_ref).collect();
        return Err(Error::DylibNotFound(names.join(", ")));
    }
    Ok(removed)
}

/// Union of dependency paths across slices, in first-seen order.
pub fn list_dylibs_bytes(data: &[u8]) -> Result<Vec<String>> {
    let mut paths: Vec<String> = Vec::new();
    for range in slice_ranges(data)? {
        for dylib in slice_dylibs(&data[range])? {
            if !paths.contains(&dylib.path) {
                paths.push(dylib.path);
            }
        }
    }
    Ok(paths)
}

/// Rename the first reference to `old` in each slice.
pub fn change_dylib_path_bytes(data: &mut [u8], old: &str, new: &str) -> Result<()> {
    let mut changed = false;
    for range in slice_ranges(data)? {
        changed |= change_slice(&mut data[range], old, new)?;
    }
    if !changed {
        return Err(Error::DylibNotFound(old.to_string()));
    }
    Ok(())
}

/// Resolve an app path to the Mach-O it names.
///
/// Files are returned as-is; bundle directories resolve to their main
/// executable.
pub fn resolve_binary(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    if path.as_os_str().is_empty() {
        return Err(Error::InvalidArgument("empty path".into()));
    }
    if path.is_file() {
        return Ok(path.to_path_buf());
    }
    if path.is_dir() {
        return crate::bundle::bundle_executable(path);
    }
    Err(Error::BundleNotFound(path.to_path_buf()))
}

/// Inject a dependency on `dylib` into the binary at `app`.
pub fn inject_dylib(app: impl AsRef<Path>, dylib: &str, weak: bool) -> Result<InjectOutcome> {
    let binary = resolve_binary(app)?;
    let mut data = std::fs::read(&binary)?;
    let outcome = inject_dylib_bytes(&mut data, dylib, weak)?;
    if outcome != InjectOutcome::AlreadyPresent {
        std::fs::write(&binary, &data)?;
    }
    info!(binary = %binary.display(), dylib, weak, ?outcome, "inject");
    Ok(outcome)
}

/// Remove references to `dylibs` from the binary at `app`.
pub fn uninstall_dylibs<S: AsRef<str>>(app: impl AsRef<Path>, dylibs: &[S]) -> Result<usize> {
    let binary = resolve_binary(app)?;
    let mut data = std::fs::read(&binary)?;
    let removed = uninstall_dylibs_bytes(&mut data, dylibs)?;
    std::fs::write(&binary, &data)?;
    info!(binary = %binary.display(), removed, "uninstall");
    Ok(removed)
}

/// List the dependencies of the binary at `app`.
pub fn list_dylibs(app: impl AsRef<Path>) -> Result<Vec<String>> {
    let binary = resolve_binary(app)?;
    let data = std::fs::read(&binary)?;
    let paths = list_dylibs_bytes(&data)?;
    debug!(binary = %binary.display(), count = paths.len(), "list");
    Ok(paths)
}

/// Rename a dependency of the binary at `app`.
pub fn change_dylib_path(app: impl AsRef<Path>, old: &str, new: &str) -> Result<()> {
    let binary = resolve_binary(app)?;
    let mut data = std::fs::read(&binary)?;
    change_dylib_path_bytes(&mut data, old, new)?;
    std::fs::write(&binary, &data)?;
    info!(binary = %binary.display(), old, new, "change");
    Ok(())
}
