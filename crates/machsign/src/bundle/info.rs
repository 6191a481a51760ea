//! Info.plist access and bundle metadata overrides.

use crate::{Error, Result};
use plist::{Dictionary, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

pub const BUNDLE_EXTENSIONS: [&str; 3] = ["app", "appex", "framework"];

/// An Info.plist remembered together with its on-disk format.
#[derive(Debug, Clone)]
pub struct InfoPlist {
    path: PathBuf,
    dict: Dictionary,
    binary: bool,
}

impl InfoPlist {
    /// Load `<bundle>/Info.plist`.
    pub fn load(bundle: impl AsRef<Path>) -> Result<Self> {
        let path = bundle.as_ref().join("Info.plist");
        let data = fs::read(&path)?;
        let dict = Value::from_reader(std::io::Cursor::new(&data))?
            .into_dictionary()
            .ok_or_else(|| Error::Config(format!("{} is not a dictionary", path.display())))?;
        Ok(Self {
            binary: data.starts_with(b"bplist00"),
            path,
            dict,
        })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.dict.get(key).and_then(Value::as_string)
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.dict.insert(key.to_string(), Value::String(value.into()));
    }

    pub fn bundle_identifier(&self) -> Option<&str> {
        self.get("CFBundleIdentifier")
    }

    /// Write back in the format it was read in.
    pub fn save(&self) -> Result<()> {
        let value = Value::Dictionary(self.dict.clone());
        if self.binary {
            value.to_file_binary(&self.path)?;
        } else {
            value.to_file_xml(&self.path)?;
        }
        Ok(())
    }
}

/// Directory name ends in a bundle extension.
pub fn is_bundle_dir(path: &Path) -> bool {
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_lowercase();
            BUNDLE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Name of the bundle's main executable: `CFBundleExecutable`, else the
/// bundle's file stem.
pub fn executable_name(bundle: &Path) -> Result<String> {
    if bundle.join("Info.plist").is_file() {
        if let Some(name) = InfoPlist::load(bundle)?.get("CFBundleExecutable") {
            return Ok(name.to_string());
        }
    }
    bundle
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .ok_or_else(|| Error::BundleNotFound(bundle.to_path_buf()))
}

/// Locate the `.app` for `path`: the directory itself, or the single `.app`
/// under it or under its `Payload/`.
pub fn find_app_bundle(path: &Path) -> Result<PathBuf> {
    if is_bundle_dir(path) && path.is_dir() {
        return Ok(path.to_path_buf());
    }
    for dir in [path.join("Payload"), path.to_path_buf()] {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        let found = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .find(|p| p.is_dir() && p.extension().is_some_and(|e| e == "app"));
        if let Some(app) = found {
            return Ok(app);
        }
    }
    Err(Error::BundleNotFound(path.to_path_buf()))
}

/// Path of the main executable of the bundle at or below `path`.
pub fn bundle_executable(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    let bundle = find_app_bundle(path).unwrap_or_else(|_| path.to_path_buf());
    let executable = bundle.join(executable_name(&bundle)?);
    if !executable.is_file() {
        return Err(Error::BundleNotFound(executable));
    }
    Ok(executable)
}

/// Replacement values for the main bundle's Info.plist.
#[derive(Debug, Clone, Default)]
pub struct BundleOverrides {
    pub bundle_id: Option<String>,
    pub display_name: Option<String>,
    pub bundle_version: Option<String>,
}

impl BundleOverrides {
    pub fn is_empty(&self) -> bool {
        self.bundle_id.is_none() && self.display_name.is_none() && self.bundle_version.is_none()
    }
}

/// Apply `overrides` to the app at `app`.
///
/// A new bundle identifier is also pushed into nested bundles whose
/// identifier extends the old one, and into `WKCompanionAppBundleIdentifier`.
pub fn apply_overrides(app: &Path, overrides: &BundleOverrides) -> Result<()> {
    if overrides.is_empty() {
        return Ok(());
    }

    let mut main = InfoPlist::load(app)?;
    let old_id = main.bundle_identifier().map(str::to_string);

    if let Some(name) = &overrides.display_name {
        main.set("CFBundleDisplayName", name.as_str());
    }
    if let Some(version) = &overrides.bundle_version {
        main.set("CFBundleVersion", version.as_str());
        main.set("CFBundleShortVersionString", version.as_str());
    }
    if let Some(new_id) = &overrides.bundle_id {
        main.set("CFBundleIdentifier", new_id.as_str());
    }
    main.save()?;

    if let (Some(old_id), Some(new_id)) = (old_id, &overrides.bundle_id) {
        if &old_id != new_id {
            reprefix_nested(app, &old_id, new_id)?;
        }
        info!(from = %old_id, to = %new_id, "changed bundle identifier");
    }
    Ok(())
}

/// Swap `old` for `new` when `value` is `old` or a dotted child of it.
fn reprefix(value: &str, old: &str, new: &str) -> Option<String> {
    value
        .strip_prefix(old)
        .filter(|rest| rest.is_empty() || rest.starts_with('.'))
        .map(|rest| format!("{}{}", new, rest))
}

fn reprefix_nested(app: &Path, old: &str, new: &str) -> Result<()> {
    for entry in WalkDir::new(app).min_depth(1).into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();
        if !entry.file_type().is_dir() || !is_bundle_dir(path) || !path.join("Info.plist").is_file()
        {
            continue;
        }

        let mut plist = InfoPlist::load(path)?;
        let mut changed = false;
        for key in ["CFBundleIdentifier", "WKCompanionAppBundleIdentifier"] {
            if let Some(value) = plist.get(key).and_then(|v| reprefix(v, old, new)) {
                plist.set(key, value);
                changed = true;
            }
        }
        if changed {
            debug!(bundle = %path.display(), "re-prefixed nested bundle identifier");
            plist.save()?;
        }
    }
    Ok(())
}
