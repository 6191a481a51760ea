//! CMS SignedData over the primary CodeDirectory.
//!
//! Besides the standard content-type, message-digest and signing-time
//! attributes, Apple verifiers expect two signed attributes naming the
//! CDHashes of every CodeDirectory in the signature:
//!
//! - `1.2.840.113635.100.9.1`: XML plist `{ cdhashes = [<sha1>, <sha256[..20]>] }`
//! - `1.2.840.113635.100.9.2`: `SEQUENCE { OID sha256, OCTET STRING <sha256> }`

use super::SigningCredentials;
use crate::{Error, Result};
use bcder::encode::PrimitiveContent;
use bcder::{Captured, Mode, OctetString, Oid};
use cryptographic_message_syntax::{Bytes, SignedDataBuilder, SignerBuilder};
use x509_certificate::rfc5652::AttributeValue;

/// 1.2.840.113635.100.9.1
const APPLE_CDHASH_OID: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x63, 0x64, 0x09, 0x01];

/// 1.2.840.113635.100.9.2
const APPLE_CDHASH_V2_OID: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x63, 0x64, 0x09, 0x02];

/// 2.16.840.1.101.3.4.2.1
const SHA256_OID: &[u8] = &[0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01];

/// Upper bound for the signed attributes, signature and CMS framing,
/// excluding certificates.
pub const CMS_OVERHEAD: usize = 4096;

fn oid(bytes: &'static [u8]) -> Oid {
    Oid(Bytes::from_static(bytes))
}

/// Sign `code_directory` (detached) and return the DER `ContentInfo`.
pub fn sign_code_directory(
    code_directory: &[u8],
    credentials: &SigningCredentials,
    cdhash_sha1: &[u8],
    cdhash_sha256: &[u8],
) -> Result<Vec<u8>> {
    let plist = build_cdhash_plist(cdhash_sha1, cdhash_sha256)?;
    let v1 = AttributeValue::new(Captured::from_values(
        Mode::Der,
        OctetString::encode_slice(&plist),
    ));

    let v2 = AttributeValue::new(cdhash_v2_value(cdhash_sha256));

    let signer = SignerBuilder::new(credentials.signing_key(), credentials.certificate.clone())
        .signed_attribute(oid(APPLE_CDHASH_OID), vec![v1])
        .signed_attribute(oid(APPLE_CDHASH_V2_OID), vec![v2]);

    let mut builder = SignedDataBuilder::default()
        .content_external(code_directory.to_vec())
        .signer(signer);
    for cert in &credentials.chain {
        builder = builder.certificate(cert.clone());
    }

    builder
        .build_der()
        .map_err(|e| Error::Signing(format!("Failed to build CMS signature: {}", e)))
}

/// The CDHash v2 attribute payload: `SEQUENCE { OID sha256, OCTET STRING }`.
fn cdhash_v2_value(sha256: &[u8]) -> Captured {
    let digest_oid = oid(SHA256_OID);
    Captured::from_values(
        Mode::Der,
        bcder::encode::sequence((digest_oid.encode(), OctetString::encode_slice(sha256))),
    )
}

/// The CDHash v1 attribute payload. Both entries are 20 bytes; the SHA-256
/// CDHash is truncated.
pub fn build_cdhash_plist(sha1: &[u8], sha256: &[u8]) -> Result<Vec<u8>> {
    use plist::{Dictionary, Value};

    let truncated = &sha256[..sha256.len().min(20)];
    let mut dict = Dictionary::new();
    dict.insert(
        "cdhashes".to_string(),
        Value::Array(vec![
            Value::Data(sha1.to_vec()),
            Value::Data(truncated.to_vec()),
        ]),
    );

    let mut buf = Vec::new();
    plist::to_writer_xml(&mut buf, &Value::Dictionary(dict))?;
    buf.push(b'\n');
    Ok(buf)
}
