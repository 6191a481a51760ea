//! ZSign builder API
//!
//! Typed front door to the re-signing pipeline: pick an identity, optionally
//! a provisioning profile, metadata overrides and dylibs to inject, then sign
//! an `.app`, a directory holding `Payload/*.app`, an `.ipa` or a bare
//! Mach-O file.

use crate::bundle::{apply_overrides, find_app_bundle, BundleOverrides, BundleSigner};
use crate::crypto::{SigningCredentials, SigningIdentity};
use crate::ipa::{create_ipa, extract_ipa, is_ipa, CompressionLevel};
use crate::macho::{self, sign_macho, SignOptions};
use crate::provision::ProvisioningProfile;
use crate::{Error, Result};
use secrecy::SecretString;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

/// iOS re-signing with a builder pattern API.
///
/// # Example
///
/// ```no_run
/// use machsign::ZSign;
///
/// ZSign::new()
///     .pkcs12("certificate.p12")
///     .password("secret")
///     .provisioning_profile("profile.mobileprovision")
///     .bundle_id("com.example.resigned")
///     .sign("App.ipa", Some("App-signed.ipa".as_ref()))?;
/// # Ok::<(), machsign::Error>(())
/// ```
#[derive(Clone)]
pub struct ZSign {
    certificate: Option<PathBuf>,
    private_key: Option<PathBuf>,
    pkcs12: Option<PathBuf>,
    provisioning_profile: Option<PathBuf>,
    password: Option<SecretString>,
    adhoc: bool,
    embed_profile: bool,
    overrides: BundleOverrides,
    dylibs: Vec<(PathBuf, bool)>,
    compression_level: CompressionLevel,
}

impl ZSign {
    /// Create a new ZSign builder.
    pub fn new() -> Self {
        Self {
            certificate: None,
            private_key: None,
            pkcs12: None,
            provisioning_profile: None,
            password: None,
            adhoc: false,
            embed_profile: true,
            overrides: BundleOverrides::default(),
            dylibs: Vec::new(),
            compression_level: CompressionLevel::DEFAULT,
        }
    }

    /// Set certificate file path (PEM or DER format).
    ///
    /// Use together with `private_key()`.
    pub fn certificate(mut self, path: impl AsRef<Path>) -> Self {
        self.certificate = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set private key file path (PEM or DER format).
    ///
    /// Without `certificate()` the file must also hold the certificate
    /// (PEM bundle) or be a PKCS#12 container.
    pub fn private_key(mut self, path: impl AsRef<Path>) -> Self {
        self.private_key = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set PKCS#12 file path (.p12 format).
    pub fn pkcs12(mut self, path: impl AsRef<Path>) -> Self {
        self.pkcs12 = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set provisioning profile path (.mobileprovision format).
    ///
    /// The profile supplies the entitlements and team identifier.
    pub fn provisioning_profile(mut self, path: impl AsRef<Path>) -> Self {
        self.provisioning_profile = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set password for private key or PKCS#12 file.
    ///
    /// The password is stored securely and will be zeroized when dropped.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(SecretString::new(password.into()));
        self
    }

    /// Sign without a certificate.
    pub fn adhoc(mut self, adhoc: bool) -> Self {
        self.adhoc = adhoc;
        self
    }

    /// Write `embedded.mobileprovision` into the main bundle (default true).
    pub fn embed_profile(mut self, embed: bool) -> Self {
        self.embed_profile = embed;
        self
    }

    pub fn bundle_id(mut self, id: impl Into<String>) -> Self {
        self.overrides.bundle_id = Some(id.into());
        self
    }

    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.overrides.display_name = Some(name.into());
        self
    }

    pub fn bundle_version(mut self, version: impl Into<String>) -> Self {
        self.overrides.bundle_version = Some(version.into());
        self
    }

    /// Copy `dylib` into the bundle root and link it from the main
    /// executable as `@executable_path/<name>` before signing.
    pub fn inject_dylib(mut self, dylib: impl AsRef<Path>, weak: bool) -> Self {
        self.dylibs.push((dylib.as_ref().to_path_buf(), weak));
        self
    }

    /// Set ZIP compression level for IPA output (0-9).
    pub fn compression_level(mut self, level: u32) -> Self {
        self.compression_level = CompressionLevel::new(level);
        self
    }

    /// Validate the builder configuration.
    ///
    /// Returns an error if:
    /// - ad-hoc signing is combined with credentials
    /// - both PKCS#12 and PEM credentials are specified
    /// - no credentials are specified and ad-hoc is off
    /// - a certificate is given without its private key
    pub fn validate(&self) -> Result<()> {
        let has_p12 = self.pkcs12.is_some();
        let has_pem = self.certificate.is_some() || self.private_key.is_some();

        if self.adhoc {
            if has_p12 || has_pem {
                return Err(Error::Config(
                    "Ad-hoc signing does not take a certificate or key".into(),
                ));
            }
            return Ok(());
        }

        if has_p12 && has_pem {
            return Err(Error::Config(
                "Cannot specify both PKCS#12 and PEM certificate/key".into(),
            ));
        }

        if !has_p12 && !has_pem {
            return Err(Error::MissingCredentials(
                "Must specify either PKCS#12, a private key, or ad-hoc".into(),
            ));
        }

        if self.certificate.is_some() && self.private_key.is_none() {
            return Err(Error::MissingCredentials(
                "A certificate needs its private key".into(),
            ));
        }

        Ok(())
    }

    /// Load the signing identity from the configured paths.
    fn load_identity(&self) -> Result<SigningIdentity> {
        self.validate()?;
        if self.adhoc {
            return Ok(SigningIdentity::AdHoc);
        }

        let credentials = if let Some(ref p12) = self.pkcs12 {
            let empty = SecretString::new(String::new());
            SigningCredentials::from_p12(&fs::read(p12)?, self.password.as_ref().unwrap_or(&empty))?
        } else {
            let key = self
                .private_key
                .as_ref()
                .ok_or_else(|| Error::MissingCredentials("No private key configured".into()))?;
            let key = fs::read(key)?;
            match self.certificate {
                Some(ref cert) => SigningCredentials::from_key_and_cert(
                    &key,
                    &fs::read(cert)?,
                    self.password.as_ref(),
                )?,
                None => SigningCredentials::from_combined(&key, self.password.as_ref())?,
            }
        };

        debug!(
            common_name = ?credentials.common_name(),
            team_id = ?credentials.team_id,
            "loaded signing identity"
        );
        Ok(SigningIdentity::Certificate(Box::new(credentials)))
    }

    fn load_profile(&self) -> Result<Option<ProvisioningProfile>> {
        self.provisioning_profile
            .as_ref()
            .map(ProvisioningProfile::open)
            .transpose()
    }

    /// Sign `input` and return the path that now holds the result.
    ///
    /// - `.ipa`: extracted to a temporary directory, signed and repacked to
    ///   `output`, or over `input` when `output` is `None`
    /// - directory: the `.app` at or under it is signed in place, then packed
    ///   to `output` when given
    /// - any other file: treated as a Mach-O and signed to `output` or in place
    pub fn sign(&self, input: impl AsRef<Path>, output: Option<&Path>) -> Result<PathBuf> {
        let input = input.as_ref();
        if input.as_os_str().is_empty() {
            return Err(Error::InvalidArgument("empty input path".into()));
        }

        if is_ipa(input) {
            let output = output.unwrap_or(input);
            self.sign_ipa(input, output)?;
            return Ok(output.to_path_buf());
        }

        if input.is_dir() {
            let app = self.sign_bundle(input)?;
            return match output {
                Some(output) => {
                    create_ipa(&app, output, self.compression_level)?;
                    Ok(output.to_path_buf())
                }
                None => Ok(app),
            };
        }

        let output = output.unwrap_or(input);
        self.sign_macho(input, output)?;
        Ok(output.to_path_buf())
    }

    /// Sign a single Mach-O binary.
    ///
    /// The signing identifier is the file stem; profile entitlements are
    /// embedded when a profile is configured.
    pub fn sign_macho(&self, input: impl AsRef<Path>, output: impl AsRef<Path>) -> Result<()> {
        let identity = self.load_identity()?;
        let profile = self.load_profile()?;
        let (input, output) = (input.as_ref(), output.as_ref());

        if input != output {
            fs::copy(input, output)?;
        }

        let identifier = input
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown");
        let entitlements = profile
            .as_ref()
            .map(|p| p.entitlements_xml(Some(identifier)))
            .transpose()?;

        let mut options = SignOptions::new(identifier, &identity)
            .team_id(profile.as_ref().and_then(|p| p.team_identifier.as_deref()));
        if let Some(ref ents) = entitlements {
            options = options.entitlements(ents);
        }
        sign_macho(output, &options)
    }

    /// Sign an IPA file.
    ///
    /// Extracts the IPA, signs the app bundle and repacks it into `output`.
    pub fn sign_ipa(&self, input: impl AsRef<Path>, output: impl AsRef<Path>) -> Result<()> {
        // Fail on credentials before spending time on extraction.
        self.validate()?;

        let workdir = TempDir::new()?;
        let app = extract_ipa(input.as_ref(), workdir.path())?;
        self.sign_bundle(&app)?;
        create_ipa(&app, output.as_ref(), self.compression_level)?;

        info!(
            input = %input.as_ref().display(),
            output = %output.as_ref().display(),
            "signed IPA"
        );
        Ok(())
    }

    /// Sign an app bundle in place and return its path.
    ///
    /// `path` may be the `.app` itself or a directory containing
    /// `Payload/*.app`.
    pub fn sign_bundle(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let identity = self.load_identity()?;
        let profile = self.load_profile()?;
        let app = find_app_bundle(path.as_ref())?;

        apply_overrides(&app, &self.overrides)?;
        self.inject_dylibs(&app)?;

        let mut signer = BundleSigner::new(&identity).embed_profile(self.embed_profile);
        if let Some(ref profile) = profile {
            signer = signer.provisioning_profile(profile);
        }
        signer.sign(&app)?;
        Ok(app)
    }

    fn inject_dylibs(&self, app: &Path) -> Result<()> {
        for (dylib, weak) in &self.dylibs {
            let name = dylib
                .file_name()
                .ok_or_else(|| Error::InvalidArgument(format!("not a file: {}", dylib.display())))?;
            fs::copy(dylib, app.join(name))?;

            let load_path = format!("@executable_path/{}", name.to_string_lossy());
            macho::inject_dylib(app, &load_path, *weak)?;
        }
        Ok(())
    }
}

impl Default for ZSign {
    fn default() -> Self {
        Self::new()
    }
}
