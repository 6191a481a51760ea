//! IPA extraction.
//!
//! The archive is memory-mapped and entries are inflated in parallel, each
//! worker opening its own `ZipArchive` over the shared map.

use crate::bundle::find_app_bundle;
use crate::{Error, Result};
use memmap2::Mmap;
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use tracing::debug;
use zip::result::ZipError;
use zip::ZipArchive;

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

struct Entry {
    index: usize,
    path: PathBuf,
    mode: Option<u32>,
}

impl Entry {
    fn is_symlink(&self) -> bool {
        self.mode.is_some_and(|m| m & S_IFMT == S_IFLNK)
    }
}

/// Extract `ipa` into `dest` and return the `Payload/*.app` path.
pub fn extract_ipa(ipa: impl AsRef<Path>, dest: impl AsRef<Path>) -> Result<PathBuf> {
    let ipa = ipa.as_ref();
    let dest = dest.as_ref();
    validate_ipa(ipa)?;

    let file = File::open(ipa)?;
    // SAFETY: the file is opened read-only and outlives the map.
    let mmap = unsafe { Mmap::map(&file)? };
    let mut archive = ZipArchive::new(Cursor::new(&mmap[..]))?;

    let mut dirs = BTreeSet::new();
    let mut files = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let entry = archive.by_index(index)?;
        let Some(name) = entry.enclosed_name() else {
            continue;
        };
        let path = dest.join(name);
        if entry.is_dir() {
            dirs.insert(path);
            continue;
        }
        if let Some(parent) = path.parent() {
            dirs.insert(parent.to_path_buf());
        }
        files.push(Entry {
            index,
            path,
            mode: entry.unix_mode(),
        });
    }

    for dir in &dirs {
        fs::create_dir_all(dir)?;
    }

    files.par_iter().try_for_each(|entry| -> Result<()> {
        let mut archive = ZipArchive::new(Cursor::new(&mmap[..]))?;
        let mut file = archive.by_index(entry.index)?;

        #[cfg(unix)]
        if entry.is_symlink() {
            let mut target = String::new();
            file.read_to_string(&mut target)?;
            if entry.path.symlink_metadata().is_ok() {
                fs::remove_file(&entry.path)?;
            }
            std::os::unix::fs::symlink(&target, &entry.path)?;
            return Ok(());
        }

        let mut out = File::create(&entry.path)?;
        io::copy(&mut file, &mut out)?;

        #[cfg(unix)]
        if let Some(mode) = entry.mode {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&entry.path, fs::Permissions::from_mode(mode & 0o7777))?;
        }
        Ok(())
    })?;

    debug!(ipa = %ipa.display(), files = files.len(), "extracted archive");

    if !dest.join("Payload").is_dir() {
        return Err(Error::Zip(ZipError::InvalidArchive("No Payload directory found in IPA".into())));
    }
    find_app_bundle(&dest.join("Payload"))
}

/// Check that `ipa` exists and starts with a ZIP signature.
pub fn validate_ipa(ipa: impl AsRef<Path>) -> Result<()> {
    let mut magic = [0u8; 2];
    File::open(ipa.as_ref())?.read_exact(&mut magic)?;
    if &magic != b"PK" {
        return Err(Error::Zip(ZipError::InvalidArchive("Not a valid ZIP/IPA file".into())));
    }
    Ok(())
}

/// Whether `path` names an `.ipa` file.
pub fn is_ipa(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .is_some_and(|e| e.eq_ignore_ascii_case("ipa") || e.eq_ignore_ascii_case("zip"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn write_ipa(path: &Path, with_payload: bool) {
        let mut zip = ZipWriter::new(File::create(path).unwrap());
        let options = SimpleFileOptions::default();
        let root = if with_payload { "Payload/Test.app" } else { "Other/Test.app" };
        zip.add_directory(format!("{}/", root), options).unwrap();
        zip.start_file(format!("{}/Info.plist", root), options).unwrap();
        zip.write_all(b"<?xml version=\"1.0\"?><plist><dict></dict></plist>").unwrap();
        zip.start_file(format!("{}/Test", root), options.unix_permissions(0o755)).unwrap();
        zip.write_all(b"binary").unwrap();
        zip.finish().unwrap();
    }

    #[test]
    fn test_validate_ipa() {
        let dir = TempDir::new().unwrap();
        let ipa = dir.path().join("test.ipa");
        write_ipa(&ipa, true);
        assert!(validate_ipa(&ipa).is_ok());
        assert!(is_ipa(&ipa));

        let bogus = dir.path().join("bogus.ipa");
        fs::write(&bogus, b"not a zip").unwrap();
        assert!(validate_ipa(&bogus).is_err());
        assert!(validate_ipa(dir.path().join("missing.ipa")).is_err());
    }

    #[test]
    fn test_extract_ipa() {
        let dir = TempDir::new().unwrap();
        let ipa = dir.path().join("test.ipa");
        write_ipa(&ipa, true);

        let app = extract_ipa(&ipa, dir.path().join("out")).unwrap();
        assert!(app.ends_with("Payload/Test.app"));
        assert_eq!(fs::read(app.join("Test")).unwrap(), b"binary");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(app.join("Test")).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    #[test]
    fn test_extract_without_payload() {
        let dir = TempDir::new().unwrap();
        let ipa = dir.path().join("test.ipa");
        write_ipa(&ipa, false);
        assert!(matches!(
            extract_ipa(&ipa, dir.path().join("out")),
            Err(Error::Zip(_))
        ));
    }

    #[test]
    #[cfg(unix)]
    fn test_extract_symlinks() {
        let dir = TempDir::new().unwrap();
        let ipa = dir.path().join("links.ipa");
        let mut zip = ZipWriter::new(File::create(&ipa).unwrap());
        let options = SimpleFileOptions::default();
        zip.start_file("Payload/Test.app/Frameworks/T.framework/Versions/A/T", options)
            .unwrap();
        zip.write_all(b"binary").unwrap();
        zip.add_symlink("Payload/Test.app/Frameworks/T.framework/Versions/Current", "A", options)
            .unwrap();
        zip.finish().unwrap();

        let app = extract_ipa(&ipa, dir.path().join("out")).unwrap();
        let link = app.join("Frameworks/T.framework/Versions/Current");
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("A"));
    }
}
