//! Signing identities.
//!
//! Credentials come from a PKCS#12 container or from a private key plus a
//! certificate. Keys may be PEM or DER: PKCS#8 (optionally encrypted),
//! PKCS#1 RSA or SEC1 P-256. Everything is normalised to PKCS#8 and loaded
//! into an [`InMemorySigningKeyPair`].
//!
//! ```no_run
//! use machsign::crypto::SigningCredentials;
//! use secrecy::SecretString;
//!
//! let p12 = std::fs::read("identity.p12")?;
//! let creds = SigningCredentials::from_p12(&p12, &SecretString::new("password".into()))?;
//! println!("team: {:?}", creds.team_id);
//! # Ok::<(), machsign::Error>(())
//! ```

use crate::{Error, Result};
use pkcs8::der::SecretDocument;
use pkcs8::EncryptedPrivateKeyInfo;
use secrecy::{ExposeSecret, SecretString};
use x509_certificate::{CapturedX509Certificate, InMemorySigningKeyPair, Sign};

/// Who signs.
pub enum SigningIdentity {
    /// No certificate; `CS_ADHOC` and an empty CMS wrapper.
    AdHoc,
    Certificate(Box<SigningCredentials>),
}

impl SigningIdentity {
    pub fn is_adhoc(&self) -> bool {
        matches!(self, SigningIdentity::AdHoc)
    }

    pub fn credentials(&self) -> Option<&SigningCredentials> {
        match self {
            SigningIdentity::AdHoc => None,
            SigningIdentity::Certificate(c) => Some(&**c),
        }
    }
}

impl std::fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SigningIdentity::AdHoc => f.write_str("AdHoc"),
            SigningIdentity::Certificate(c) => f
                .debug_struct("Certificate")
                .field("common_name", &c.common_name())
                .field("team_id", &c.team_id)
                .finish(),
        }
    }
}

/// Certificate, key and chain used for CMS signing.
///
/// Holds private key material; never log it.
pub struct SigningCredentials {
    pub certificate: CapturedX509Certificate,
    key: InMemorySigningKeyPair,
    /// Intermediate certificates embedded in the CMS blob
    pub chain: Vec<CapturedX509Certificate>,
    /// Team identifier from the certificate's OU
    pub team_id: Option<String>,
}

impl SigningCredentials {
    /// Load from a PKCS#12 container. The first key signs; the certificate
    /// holding its public key is the leaf and the others form the chain.
    pub fn from_p12(data: &[u8], password: &SecretString) -> Result<Self> {
        let pfx = p12::PFX::parse(data)
            .map_err(|e| Error::Certificate(format!("Failed to parse PKCS#12: {:?}", e)))?;

        let password = password.expose_secret();
        if !pfx.verify_mac(password) {
            return Err(Error::InvalidPassword);
        }

        let keys = pfx
            .key_bags(password)
            .map_err(|e| Error::Certificate(format!("Failed to read PKCS#12 keys: {:?}", e)))?;
        let certs = pfx
            .cert_x509_bags(password)
            .map_err(|e| Error::Certificate(format!("Failed to read PKCS#12 certs: {:?}", e)))?;

        let key_der = keys
            .first()
            .ok_or_else(|| Error::Certificate("No private key in PKCS#12".into()))?;
        let certs = certs
            .into_iter()
            .map(parse_cert_der)
            .collect::<Result<Vec<_>>>()?;

        Self::assemble(certs, key_from_pkcs8(key_der)?)
    }

    /// Load from a key and a certificate file (PEM or DER each). The
    /// certificate data may hold the chain in any order.
    pub fn from_key_and_cert(
        key: &[u8],
        cert: &[u8],
        password: Option<&SecretString>,
    ) -> Result<Self> {
        Self::assemble(parse_certs(cert)?, parse_private_key(key, password)?)
    }

    /// Load from a single file: a PKCS#12 container, or PEM holding both the
    /// certificate and the key.
    pub fn from_combined(data: &[u8], password: Option<&SecretString>) -> Result<Self> {
        if !contains_pem(data) {
            let empty = SecretString::new(String::new());
            return Self::from_p12(data, password.unwrap_or(&empty));
        }
        Self::from_key_and_cert(data, data, password)
    }

    /// Pair the key with the certificate carrying its public key.
    fn assemble(
        mut certs: Vec<CapturedX509Certificate>,
        key: InMemorySigningKeyPair,
    ) -> Result<Self> {
        if certs.is_empty() {
            return Err(Error::Certificate("No certificate found".into()));
        }
        let public_key = key.public_key_data();
        let leaf = certs
            .iter()
            .position(|c| c.public_key_data() == public_key)
            .ok_or_else(|| Error::Certificate("No certificate matches the private key".into()))?;
        let certificate = certs.remove(leaf);
        let chain = certs;
        let team_id = extract_team_id(&certificate);
        Ok(Self {
            certificate,
            key,
            chain,
            team_id,
        })
    }

    pub fn signing_key(&self) -> &InMemorySigningKeyPair {
        &self.key
    }

    /// Subject common name of the signing certificate.
    pub fn common_name(&self) -> Option<String> {
        self.certificate.subject_common_name()
    }

    /// DER size of every certificate that goes into the CMS blob.
    pub fn certificates_size(&self) -> usize {
        std::iter::once(&self.certificate)
            .chain(&self.chain)
            .map(|c| c.constructed_data().len())
            .sum()
    }
}

/// Team identifier from the certificate's first OU.
fn extract_team_id(cert: &CapturedX509Certificate) -> Option<String> {
    cert.subject_name()
        .iter_organizational_unit()
        .find_map(|atav| atav.to_string().ok())
}

fn contains_pem(data: &[u8]) -> bool {
    data.windows(11).any(|w| w == b"-----BEGIN ")
}

/// Split PEM text into `(label, block)` pairs.
fn pem_blocks(text: &str) -> Vec<(&str, &str)> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("-----BEGIN ") {
        let after = &rest[start + 11..];
        let Some(label_end) = after.find("-----") else {
            break;
        };
        let label = &after[..label_end];
        let end_marker = format!("-----END {}-----", label);
        let Some(end) = rest[start..].find(&end_marker) else {
            break;
        };
        let block_end = start + end + end_marker.len();
        blocks.push((label, &rest[start..block_end]));
        rest = &rest[block_end..];
    }
    blocks
}

fn parse_cert_der(der: Vec<u8>) -> Result<CapturedX509Certificate> {
    CapturedX509Certificate::from_der(der)
        .map_err(|e| Error::Certificate(format!("Failed to parse certificate: {}", e)))
}

fn parse_certs(data: &[u8]) -> Result<Vec<CapturedX509Certificate>> {
    if !contains_pem(data) {
        return Ok(vec![parse_cert_der(data.to_vec())?]);
    }
    let text = std::str::from_utf8(data)
        .map_err(|_| Error::Certificate("Certificate PEM is not UTF-8".into()))?;
    pem_blocks(text)
        .into_iter()
        .filter(|(label, _)| *label == "CERTIFICATE")
        .map(|(_, block)| {
            CapturedX509Certificate::from_pem(block)
                .map_err(|e| Error::Certificate(format!("Failed to parse certificate: {}", e)))
        })
        .collect()
}

fn key_from_pkcs8(der: &[u8]) -> Result<InMemorySigningKeyPair> {
    InMemorySigningKeyPair::from_pkcs8_der(der)
        .map_err(|e| Error::Certificate(format!("Unsupported private key: {}", e)))
}

fn rsa_pkcs1_to_pkcs8(der: &[u8]) -> Result<SecretDocument> {
    use rsa::pkcs1::DecodeRsaPrivateKey;
    use rsa::pkcs8::EncodePrivateKey;

    rsa::RsaPrivateKey::from_pkcs1_der(der)
        .map_err(|e| Error::Certificate(format!("Invalid RSA key: {}", e)))?
        .to_pkcs8_der()
        .map_err(|e| Error::Certificate(format!("Failed to re-encode RSA key: {}", e)))
}

fn ec_sec1_to_pkcs8(der: &[u8]) -> Result<SecretDocument> {
    use p256::pkcs8::EncodePrivateKey;

    p256::SecretKey::from_sec1_der(der)
        .map_err(|e| Error::Certificate(format!("Invalid EC key: {}", e)))?
        .to_pkcs8_der()
        .map_err(|e| Error::Certificate(format!("Failed to re-encode EC key: {}", e)))
}

fn decrypt_pkcs8(der: &[u8], password: Option<&SecretString>) -> Result<SecretDocument> {
    let password = password.ok_or(Error::InvalidPassword)?;
    EncryptedPrivateKeyInfo::try_from(der)
        .map_err(|e| Error::Certificate(format!("Invalid encrypted key: {}", e)))?
        .decrypt(password.expose_secret())
        .map_err(|_| Error::InvalidPassword)
}

/// Parse a private key in any supported encoding.
pub fn parse_private_key(
    data: &[u8],
    password: Option<&SecretString>,
) -> Result<InMemorySigningKeyPair> {
    if !contains_pem(data) {
        if let Ok(key) = InMemorySigningKeyPair::from_pkcs8_der(data) {
            return Ok(key);
        }
        if let Ok(doc) = rsa_pkcs1_to_pkcs8(data).or_else(|_| ec_sec1_to_pkcs8(data)) {
            return key_from_pkcs8(doc.as_bytes());
        }
        if let Ok(doc) = decrypt_pkcs8(data, password) {
            return key_from_pkcs8(doc.as_bytes());
        }
        return Err(Error::Certificate("Unrecognised private key format".into()));
    }

    let text = std::str::from_utf8(data)
        .map_err(|_| Error::Certificate("Private key PEM is not UTF-8".into()))?;
    for (label, block) in pem_blocks(text) {
        if !label.ends_with("PRIVATE KEY") {
            continue;
        }
        let (_, doc) = SecretDocument::from_pem(block)
            .map_err(|e| Error::Certificate(format!("Invalid PEM: {}", e)))?;
        let pkcs8 = match label {
            "PRIVATE KEY" => doc,
            "ENCRYPTED PRIVATE KEY" => decrypt_pkcs8(doc.as_bytes(), password)?,
            "RSA PRIVATE KEY" => rsa_pkcs1_to_pkcs8(doc.as_bytes())?,
            "EC PRIVATE KEY" => ec_sec1_to_pkcs8(doc.as_bytes())?,
            other => {
                return Err(Error::Certificate(format!("Unsupported key type: {}", other)));
            }
        };
        return key_from_pkcs8(pkcs8.as_bytes());
    }
    Err(Error::Certificate("No private key found".into()))
}
