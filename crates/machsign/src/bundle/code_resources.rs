//! `_CodeSignature/CodeResources` generation.
//!
//! Every file of the bundle except the main executable and the bundle's own
//! `_CodeSignature/` is hashed. Files of nested bundles are listed too;
//! those bundles must be signed first so their hashes are final.

use super::info::executable_name;
use crate::{Error, Result};
use plist::{Dictionary, Value};
use rayon::prelude::*;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Rule table: `(pattern, optional, omit, weight)`. A weight of `None`
/// emits a bare `true`.
type Rule = (&'static str, bool, bool, Option<f64>);

const RULES: &[Rule] = &[
    ("^.*", false, false, None),
    ("^.*\\.lproj/", true, false, Some(1000.0)),
    ("^.*\\.lproj/locversion.plist$", false, true, Some(1100.0)),
    ("^Base\\.lproj/", false, false, Some(1010.0)),
    ("^version.plist$", false, false, None),
];

const RULES2: &[Rule] = &[
    ("^.*", false, false, None),
    (".*\\.dSYM($|/)", false, false, Some(11.0)),
    ("^(.*/)?\\.DS_Store$", false, true, Some(2000.0)),
    ("^.*\\.lproj/", true, false, Some(1000.0)),
    ("^.*\\.lproj/locversion.plist$", false, true, Some(1100.0)),
    ("^Base\\.lproj/", false, false, Some(1010.0)),
    ("^Info\\.plist$", false, true, Some(20.0)),
    ("^PkgInfo$", false, true, Some(20.0)),
    ("^embedded\\.provisionprofile$", false, false, Some(20.0)),
    ("^version\\.plist$", false, false, Some(20.0)),
];

fn rules_dict(rules: &[Rule]) -> Dictionary {
    let mut dict = Dictionary::new();
    for &(pattern, optional, omit, weight) in rules {
        let value = match weight {
            None => Value::Boolean(true),
            Some(weight) => {
                let mut rule = Dictionary::new();
                if optional {
                    rule.insert("optional".into(), Value::Boolean(true));
                }
                if omit {
                    rule.insert("omit".into(), Value::Boolean(true));
                }
                rule.insert("weight".into(), Value::Real(weight));
                Value::Dictionary(rule)
            }
        };
        dict.insert(pattern.into(), value);
    }
    dict
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FileEntry {
    File { sha1: [u8; 20], sha256: [u8; 32] },
    Symlink(String),
}

/// SHA-1 and SHA-256 of `data`.
pub fn hash_data(data: &[u8]) -> ([u8; 20], [u8; 32]) {
    (Sha1::digest(data).into(), Sha256::digest(data).into())
}

/// Collects file hashes for one bundle and renders the plist.
pub struct CodeResourcesBuilder {
    bundle_path: PathBuf,
    files: BTreeMap<String, FileEntry>,
    exclusions: Vec<String>,
    main_executable: Option<String>,
}

impl CodeResourcesBuilder {
    pub fn new(bundle_path: impl AsRef<Path>) -> Self {
        let bundle_path = bundle_path.as_ref().to_path_buf();
        let main_executable = match executable_name(&bundle_path) {
            Ok(name) => Some(name),
            Err(e) => {
                warn!(bundle = %bundle_path.display(), "cannot read main executable: {}", e);
                None
            }
        };
        Self {
            bundle_path,
            files: BTreeMap::new(),
            exclusions: Vec::new(),
            main_executable,
        }
    }

    /// Skip paths starting with `prefix`.
    pub fn exclude(mut self, prefix: impl Into<String>) -> Self {
        self.exclusions.push(prefix.into());
        self
    }

    fn should_exclude(&self, relative: &str) -> bool {
        relative == "_CodeSignature"
            || relative.starts_with("_CodeSignature/")
            || self.main_executable.as_deref() == Some(relative)
            || self.exclusions.iter().any(|p| relative.starts_with(p.as_str()))
    }

    /// Hash every file of the bundle. Any file that cannot be read fails
    /// the scan.
    pub fn scan(&mut self) -> Result<&mut Self> {
        let mut entries = Vec::new();
        for entry in WalkDir::new(&self.bundle_path).min_depth(1).follow_links(false) {
            let entry = entry.map_err(io::Error::from)?;
            if !entry.file_type().is_dir() {
                entries.push(entry);
            }
        }

        let hashed = entries
            .par_iter()
            .map(|entry| -> Result<Option<(String, FileEntry)>> {
                let relative = entry
                    .path()
                    .strip_prefix(&self.bundle_path)
                    .map_err(|e| Error::Io(io::Error::other(e.to_string())))?
                    .to_string_lossy()
                    .replace('\\', "/");
                if self.should_exclude(&relative) {
                    return Ok(None);
                }
                let file = if entry.path_is_symlink() {
                    let target = fs::read_link(entry.path())?;
                    FileEntry::Symlink(target.to_string_lossy().into_owned())
                } else {
                    let (sha1, sha256) = hash_data(&fs::read(entry.path())?);
                    FileEntry::File { sha1, sha256 }
                };
                Ok(Some((relative, file)))
            })
            .collect::<Result<Vec<_>>>()?;

        let before = self.files.len();
        self.files.extend(hashed.into_iter().flatten());
        debug!(
            bundle = %self.bundle_path.display(),
            files = self.files.len() - before,
            "hashed bundle resources"
        );
        Ok(self)
    }

    /// Add or replace one file's hashes.
    pub fn add_file(&mut self, relative_path: impl Into<String>, sha1: [u8; 20], sha256: [u8; 32]) {
        self.files
            .insert(relative_path.into(), FileEntry::File { sha1, sha256 });
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    /// Render the XML plist.
    pub fn build(&self) -> Result<Vec<u8>> {
        let mut files = Dictionary::new();
        let mut files2 = Dictionary::new();

        for (path, entry) in &self.files {
            let optional = path.contains(".lproj/");

            if let FileEntry::File { sha1, .. } = entry {
                let hash = Value::Data(sha1.to_vec());
                let value = if optional {
                    let mut d = Dictionary::new();
                    d.insert("hash".into(), hash);
                    d.insert("optional".into(), Value::Boolean(true));
                    Value::Dictionary(d)
                } else {
                    hash
                };
                files.insert(path.clone(), value);
            }

            if path == "Info.plist" || path == "PkgInfo" || path.ends_with(".DS_Store") {
                continue;
            }
            let mut d = Dictionary::new();
            match entry {
                FileEntry::File { sha1, sha256 } => {
                    d.insert("hash".into(), Value::Data(sha1.to_vec()));
                    d.insert("hash2".into(), Value::Data(sha256.to_vec()));
                }
                FileEntry::Symlink(target) => {
                    d.insert("symlink".into(), Value::String(target.clone()));
                }
            }
            if optional {
                d.insert("optional".into(), Value::Boolean(true));
            }
            files2.insert(path.clone(), Value::Dictionary(d));
        }

        let mut root = Dictionary::new();
        root.insert("files".into(), Value::Dictionary(files));
        root.insert("files2".into(), Value::Dictionary(files2));
        root.insert("rules".into(), Value::Dictionary(rules_dict(RULES)));
        root.insert("rules2".into(), Value::Dictionary(rules_dict(RULES2)));

        let mut buf = Vec::new();
        plist::to_writer_xml(&mut buf, &Value::Dictionary(root))?;
        Ok(buf)
    }

    /// Scan, render and write `_CodeSignature/CodeResources`. Returns the
    /// written bytes.
    pub fn write(bundle_path: impl AsRef<Path>) -> Result<Vec<u8>> {
        let bundle_path = bundle_path.as_ref();
        let data = Self::new(bundle_path).scan()?.build()?;
        let dir = bundle_path.join("_CodeSignature");
        fs::create_dir_all(&dir)?;
        fs::write(dir.join("CodeResources"), &data)?;
        Ok(data)
    }
}
