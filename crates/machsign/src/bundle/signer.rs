//! Signing of a whole `.app` bundle.
//!
//! Order matters because parents hash the files of their children:
//!
//! 1. every standalone `.dylib`
//! 2. bundles deepest first (`.appex`, `.framework`, then the app)
//! 3. inside a bundle: other Mach-O files, `CodeResources`, then the main
//!    executable bound to Info.plist and CodeResources

use super::code_resources::CodeResourcesBuilder;
use super::info::{executable_name, is_bundle_dir, InfoPlist};
use crate::crypto::SigningIdentity;
use crate::macho::{is_macho_magic, sign_macho, MachOFile, SignOptions};
use crate::provision::ProvisioningProfile;
use crate::{Error, Result};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub struct BundleSigner<'a> {
    identity: &'a SigningIdentity,
    profile: Option<&'a ProvisioningProfile>,
    embed_profile: bool,
}

impl<'a> BundleSigner<'a> {
    pub fn new(identity: &'a SigningIdentity) -> Self {
        Self {
            identity,
            profile: None,
            embed_profile: true,
        }
    }

    /// Source of entitlements and team id.
    pub fn provisioning_profile(mut self, profile: &'a ProvisioningProfile) -> Self {
        self.profile = Some(profile);
        self
    }

    /// Write the profile to `embedded.mobileprovision` (default true).
    pub fn embed_profile(mut self, embed: bool) -> Self {
        self.embed_profile = embed;
        self
    }

    /// Sign the app bundle at `app` in place.
    pub fn sign(&self, app: &Path) -> Result<()> {
        if !app.is_dir() {
            return Err(Error::BundleNotFound(app.to_path_buf()));
        }

        for dylib in standalone_dylibs(app) {
            let identifier = dylib
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let options = SignOptions::new(&identifier, self.identity).team_id(self.team_id());
            sign_macho(&dylib, &options)?;
        }

        let mut bundles = nested_bundles(app);
        bundles.sort_by(|a, b| b.1.cmp(&a.1));
        for (bundle, _) in &bundles {
            self.sign_bundle(bundle, bundle == app)?;
        }

        info!(app = %app.display(), bundles = bundles.len(), "signed bundle");
        Ok(())
    }

    fn team_id(&self) -> Option<&'a str> {
        self.profile.and_then(|p| p.team_identifier.as_deref())
    }

    fn sign_bundle(&self, bundle: &Path, is_main: bool) -> Result<()> {
        let info_plist = bundle.join("Info.plist");
        let identifier = match info_plist.is_file() {
            true => InfoPlist::load(bundle)?.bundle_identifier().map(str::to_string),
            false => None,
        }
        .or_else(|| bundle.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_default();
        let executable = bundle.join(executable_name(bundle)?);

        for binary in immediate_binaries(bundle) {
            if binary != executable {
                let options = SignOptions::new(&identifier, self.identity).team_id(self.team_id());
                sign_macho(&binary, &options)?;
            }
        }

        if is_main && self.embed_profile {
            if let Some(profile) = self.profile {
                fs::write(bundle.join("embedded.mobileprovision"), profile.raw())?;
            }
        }

        let code_resources = CodeResourcesBuilder::write(bundle)?;

        if !executable.is_file() {
            if is_main {
                return Err(Error::BundleNotFound(executable));
            }
            warn!(bundle = %bundle.display(), "bundle has no executable, skipped");
            return Ok(());
        }

        let info_data = match info_plist.is_file() {
            true => Some(fs::read(&info_plist)?),
            false => None,
        };
        let is_executable = MachOFile::open(&executable)?
            .slices()
            .first()
            .map_or(false, |s| s.is_executable);
        let entitlements = match (self.profile, is_executable) {
            (Some(profile), true) => Some(profile.entitlements_xml(Some(&identifier))?),
            _ => None,
        };

        let mut options = SignOptions::new(&identifier, self.identity)
            .team_id(self.team_id())
            .code_resources(&code_resources);
        if let Some(info) = &info_data {
            options = options.info_plist(info);
        }
        if let Some(ents) = &entitlements {
            options = options.entitlements(ents);
        }
        sign_macho(&executable, &options)?;
        debug!(bundle = %bundle.display(), identifier = %identifier, "signed main executable");
        Ok(())
    }
}

fn in_code_signature(path: &Path) -> bool {
    path.components().any(|c| c.as_os_str() == "_CodeSignature")
}

fn is_macho_file(path: &Path) -> bool {
    let mut magic = [0u8; 4];
    fs::File::open(path)
        .and_then(|mut f| f.read_exact(&mut magic))
        .map(|_| is_macho_magic(magic))
        .unwrap_or(false)
}

fn is_dylib(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == "dylib")
}

fn standalone_dylibs(app: &Path) -> Vec<PathBuf> {
    WalkDir::new(app)
        .min_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| is_dylib(p) && !in_code_signature(p) && is_macho_file(p))
        .collect()
}

/// The app and every bundle inside it, with the number of bundle
/// directories on the way down.
fn nested_bundles(app: &Path) -> Vec<(PathBuf, usize)> {
    let mut bundles = vec![(app.to_path_buf(), 0)];
    for entry in WalkDir::new(app).min_depth(1).into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();
        if entry.file_type().is_dir() && is_bundle_dir(path) {
            let depth = path
                .strip_prefix(app)
                .map(|rel| rel.iter().filter(|c| is_bundle_dir(Path::new(c))).count())
                .unwrap_or(0);
            bundles.push((path.to_path_buf(), depth));
        }
    }
    bundles
}

/// Mach-O files of `bundle` outside nested bundles, except `.dylib`s.
fn immediate_binaries(bundle: &Path) -> Vec<PathBuf> {
    WalkDir::new(bundle)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| !(e.file_type().is_dir() && is_bundle_dir(e.path())))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| !is_dylib(p) && !in_code_signature(p) && is_macho_file(p))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::code_resources::hash_data;
    use crate::codesign::constants::CSSLOT_CODEDIRECTORY;
    use crate::codesign::superblob::parse_superblob;
    use crate::macho::testutil::MachOBuilder;
    use plist::{Dictionary, Value};
    use tempfile::tempdir;

    fn write_info(dir: &Path, id: &str, exe: &str) {
        fs::create_dir_all(dir).unwrap();
        let mut d = Dictionary::new();
        d.insert("CFBundleIdentifier".into(), Value::String(id.into()));
        d.insert("CFBundleExecutable".into(), Value::String(exe.into()));
        Value::Dictionary(d).to_file_xml(dir.join("Info.plist")).unwrap();
    }

    fn demo_app(root: &Path) -> PathBuf {
        let app = root.join("Demo.app");
        write_info(&app, "com.example.demo", "Demo");
        fs::write(app.join("Demo"), MachOBuilder::new().build()).unwrap();

        let kit = app.join("Frameworks/Kit.framework");
        write_info(&kit, "com.example.kit", "Kit");
        fs::write(kit.join("Kit"), MachOBuilder::new().install_name("@rpath/Kit.framework/Kit").build())
            .unwrap();

        fs::create_dir_all(app.join("libs")).unwrap();
        fs::write(
            app.join("libs/Extra.dylib"),
            MachOBuilder::new().install_name("@executable_path/libs/Extra.dylib").build(),
        )
        .unwrap();
        fs::write(app.join("readme.txt"), b"not a binary").unwrap();
        app
    }

    fn code_directory(path: &Path) -> Vec<u8> {
        let data = fs::read(path).unwrap();
        let file = MachOFile::parse(data.clone()).unwrap();
        let slice = &file.slices()[0];
        let start = slice.code_sig_offset.expect("signed") as usize;
        let end = start + slice.code_sig_size.unwrap() as usize;
        parse_superblob(&data[start..end])
            .unwrap()
            .into_iter()
            .find(|(slot, _)| *slot == CSSLOT_CODEDIRECTORY)
            .unwrap()
            .1
            .to_vec()
    }

    /// SHA-1 special slot `n` of a CodeDirectory.
    fn special_slot(cd: &[u8], n: usize) -> &[u8] {
        let hash_offset = u32::from_be_bytes(cd[16..20].try_into().unwrap()) as usize;
        &cd[hash_offset - n * 20..hash_offset - (n - 1) * 20]
    }

    #[test]
    fn test_adhoc_bundle_signing() {
        let dir = tempdir().unwrap();
        let app = demo_app(dir.path());

        let identity = SigningIdentity::AdHoc;
        BundleSigner::new(&identity).sign(&app).unwrap();

        for binary in ["Demo", "Frameworks/Kit.framework/Kit", "libs/Extra.dylib"] {
            code_directory(&app.join(binary));
        }
        assert!(app.join("_CodeSignature/CodeResources").is_file());
        assert!(app.join("Frameworks/Kit.framework/_CodeSignature/CodeResources").is_file());
        assert!(!app.join("embedded.mobileprovision").exists());

        let cd = code_directory(&app.join("Demo"));
        let (info_sha1, _) = hash_data(&fs::read(app.join("Info.plist")).unwrap());
        let (res_sha1, _) = hash_data(&fs::read(app.join("_CodeSignature/CodeResources")).unwrap());
        assert_eq!(special_slot(&cd, 1), &info_sha1[..]);
        assert_eq!(special_slot(&cd, 3), &res_sha1[..]);

        // the framework was final before the app hashed it
        let resources: Value = plist::from_file(app.join("_CodeSignature/CodeResources")).unwrap();
        let kit = resources
            .as_dictionary()
            .and_then(|d| d.get("files2"))
            .and_then(Value::as_dictionary)
            .and_then(|d| d.get("Frameworks/Kit.framework/Kit"))
            .and_then(Value::as_dictionary)
            .and_then(|d| d.get("hash2"))
            .and_then(Value::as_data)
            .unwrap()
            .to_vec();
        let (_, kit_sha256) = hash_data(&fs::read(app.join("Frameworks/Kit.framework/Kit")).unwrap());
        assert_eq!(kit, kit_sha256.to_vec());
    }

    #[test]
    fn test_profile_embedding() {
        let profile = ProvisioningProfile::from_bytes(
            include_bytes!("../../tests/fixtures/test.mobileprovision").to_vec(),
        )
        .unwrap();
        let identity = SigningIdentity::AdHoc;

        let dir = tempdir().unwrap();
        let app = demo_app(dir.path());
        BundleSigner::new(&identity)
            .provisioning_profile(&profile)
            .sign(&app)
            .unwrap();
        assert_eq!(fs::read(app.join("embedded.mobileprovision")).unwrap(), profile.raw());
        // entitlements slot is populated on the main executable only
        let cd = code_directory(&app.join("Demo"));
        assert!(special_slot(&cd, 5).iter().any(|&b| b != 0));

        let dir = tempdir().unwrap();
        let app = demo_app(dir.path());
        BundleSigner::new(&identity)
            .provisioning_profile(&profile)
            .embed_profile(false)
            .sign(&app)
            .unwrap();
        assert!(!app.join("embedded.mobileprovision").exists());
    }

    #[test]
    fn test_missing_bundle() {
        let identity = SigningIdentity::AdHoc;
        let dir = tempdir().unwrap();
        assert!(matches!(
            BundleSigner::new(&identity).sign(&dir.path().join("Nope.app")),
            Err(Error::BundleNotFound(_))
        ));
    }

    #[test]
    fn test_bundle_depths() {
        let dir = tempdir().unwrap();
        let app = demo_app(dir.path());
        fs::create_dir_all(app.join("PlugIns/Share.appex/Frameworks/Inner.framework")).unwrap();

        let mut bundles = nested_bundles(&app);
        bundles.sort();
        let depths: Vec<usize> = bundles.iter().map(|(_, d)| *d).collect();
        assert_eq!(depths, vec![0, 1, 1, 2]);
    }
}
