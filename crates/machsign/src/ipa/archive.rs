//! IPA creation: a ZIP with the app under `Payload/`.

use crate::{Error, Result};
use std::fs::{self, File};
use std::io;
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Deflate level, 0 (stored) to 9.
///
/// ```
/// use machsign::ipa::CompressionLevel;
///
/// assert_eq!(CompressionLevel::new(15).level(), 9);
/// assert_eq!(CompressionLevel::default(), CompressionLevel::DEFAULT);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionLevel(u32);

impl CompressionLevel {
    pub const NONE: CompressionLevel = CompressionLevel(0);
    pub const DEFAULT: CompressionLevel = CompressionLevel(6);
    pub const MAX: CompressionLevel = CompressionLevel(9);

    /// Values above 9 are clamped.
    #[must_use]
    pub fn new(level: u32) -> Self {
        CompressionLevel(level.min(9))
    }

    #[must_use]
    pub fn level(&self) -> u32 {
        self.0
    }

    fn options(self) -> SimpleFileOptions {
        match self.0 {
            0 => SimpleFileOptions::default().compression_method(CompressionMethod::Stored),
            level => SimpleFileOptions::default()
                .compression_method(CompressionMethod::Deflated)
                .compression_level(Some(level as i64)),
        }
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl From<u32> for CompressionLevel {
    fn from(level: u32) -> Self {
        CompressionLevel::new(level)
    }
}

/// Pack `app` into `output` as `Payload/<App>.app/...`, keeping symlinks
/// and Unix permissions.
pub fn create_ipa(
    app: impl AsRef<Path>,
    output: impl AsRef<Path>,
    compression: CompressionLevel,
) -> Result<()> {
    let app = app.as_ref();
    let output = output.as_ref();
    if !app.is_dir() {
        return Err(Error::BundleNotFound(app.to_path_buf()));
    }
    let app_name = app
        .file_name()
        .ok_or_else(|| Error::BundleNotFound(app.to_path_buf()))?
        .to_string_lossy()
        .into_owned();

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let options = compression.options();
    let mut zip = ZipWriter::new(File::create(output)?);
    zip.add_directory("Payload/", options)?;

    let mut count = 0usize;
    for entry in WalkDir::new(app).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::Io(io::Error::other(e.to_string())))?;
        let relative = entry
            .path()
            .strip_prefix(app)
            .map_err(|e| Error::Io(io::Error::other(e.to_string())))?
            .to_string_lossy()
            .replace('\\', "/");
        let name = match relative.is_empty() {
            true => format!("Payload/{}", app_name),
            false => format!("Payload/{}/{}", app_name, relative),
        };

        let file_type = entry.file_type();
        if file_type.is_dir() {
            zip.add_directory(format!("{}/", name), options)?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            zip.add_symlink(name, target.to_string_lossy(), options)?;
        } else {
            #[cfg(unix)]
            let options = {
                use std::os::unix::fs::PermissionsExt;
                options.unix_permissions(entry.metadata().map_err(io::Error::from)?.permissions().mode())
            };
            zip.start_file(name, options)?;
            io::copy(&mut File::open(entry.path())?, &mut zip)?;
            count += 1;
        }
    }

    zip.finish()?;
    debug!(output = %output.display(), files = count, level = compression.level(), "created archive");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipa::extract_ipa;
    use std::path::PathBuf;
    use tempfile::TempDir;
    use zip::ZipArchive;

    fn test_app(dir: &Path) -> PathBuf {
        let app = dir.join("Test.app");
        fs::create_dir_all(app.join("_CodeSignature")).unwrap();
        fs::write(app.join("Info.plist"), b"<plist></plist>").unwrap();
        fs::write(app.join("Test"), b"binary").unwrap();
        fs::write(app.join("_CodeSignature/CodeResources"), b"<plist></plist>").unwrap();
        app
    }

    fn names(ipa: &Path) -> Vec<String> {
        let mut archive = ZipArchive::new(File::open(ipa).unwrap()).unwrap();
        (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect()
    }

    #[test]
    fn test_layout() {
        let dir = TempDir::new().unwrap();
        let app = test_app(dir.path());
        let ipa = dir.path().join("out/test.ipa");
        create_ipa(&app, &ipa, CompressionLevel::DEFAULT).unwrap();

        let names = names(&ipa);
        assert_eq!(names[0], "Payload/");
        assert!(names.contains(&"Payload/Test.app/".to_string()));
        assert!(names.contains(&"Payload/Test.app/Test".to_string()));
        assert!(names.contains(&"Payload/Test.app/_CodeSignature/CodeResources".to_string()));
    }

    #[test]
    fn test_round_trip_every_level() {
        for level in [CompressionLevel::NONE, CompressionLevel::MAX] {
            let dir = TempDir::new().unwrap();
            let app = test_app(dir.path());
            let ipa = dir.path().join("test.ipa");
            create_ipa(&app, &ipa, level).unwrap();

            let back = extract_ipa(&ipa, dir.path().join("back")).unwrap();
            assert_eq!(fs::read(back.join("Test")).unwrap(), b"binary");
        }
    }

    #[test]
    fn test_missing_app() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("file.app");
        fs::write(&file, b"x").unwrap();
        for app in [dir.path().join("none.app"), file] {
            assert!(matches!(
                create_ipa(&app, dir.path().join("o.ipa"), CompressionLevel::DEFAULT),
                Err(Error::BundleNotFound(_))
            ));
        }
    }

    #[test]
    #[cfg(unix)]
    fn test_symlinks_preserved() {
        use std::os::unix::fs::symlink;

        let dir = TempDir::new().unwrap();
        let app = test_app(dir.path());
        fs::create_dir_all(app.join("Frameworks/T.framework/Versions/A")).unwrap();
        symlink("A", app.join("Frameworks/T.framework/Versions/Current")).unwrap();
        let ipa = dir.path().join("test.ipa");
        create_ipa(&app, &ipa, CompressionLevel::DEFAULT).unwrap();

        let mut archive = ZipArchive::new(File::open(&ipa).unwrap()).unwrap();
        let entry = archive
            .by_name("Payload/Test.app/Frameworks/T.framework/Versions/Current")
            .unwrap();
        assert_eq!(entry.unix_mode().unwrap() & 0o170000, 0o120000);
    }
}
