//! Provisioning profile parsing.
//!
//! A `.mobileprovision` is a CMS SignedData whose encapsulated content is an
//! XML plist. The content is taken from the CMS structure when it parses,
//! otherwise from the first `<?xml ... </plist>` span in the file.

use crate::{Error, Result};
use plist::{Dictionary, Value};
use std::path::Path;
use tracing::debug;

/// A parsed provisioning profile.
#[derive(Debug, Clone)]
pub struct ProvisioningProfile {
    raw: Vec<u8>,
    entitlements: Dictionary,
    /// First `TeamIdentifier` entry, falling back to `com.apple.developer.team-identifier`
    pub team_identifier: Option<String>,
    /// `application-identifier` entitlement, e.g. `ABCDE12345.com.example.*`
    pub application_identifier: Option<String>,
    pub name: Option<String>,
    pub uuid: Option<String>,
}

impl ProvisioningProfile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_bytes(std::fs::read(path)?)
    }

    pub fn from_bytes(raw: Vec<u8>) -> Result<Self> {
        let content = signed_content(&raw)?;
        let plist = Value::from_reader(std::io::Cursor::new(content))
            .map_err(|e| Error::ProvisioningProfile(format!("Failed to parse plist: {}", e)))?;
        let mut dict = plist
            .into_dictionary()
            .ok_or_else(|| Error::ProvisioningProfile("Profile is not a dictionary".into()))?;

        let entitlements = dict
            .remove("Entitlements")
            .and_then(Value::into_dictionary)
            .ok_or_else(|| Error::ProvisioningProfile("No Entitlements in profile".into()))?;

        let string = |v: Option<&Value>| v.and_then(Value::as_string).map(str::to_string);
        let team_identifier = dict
            .get("TeamIdentifier")
            .and_then(Value::as_array)
            .and_then(|a| a.first())
            .and_then(Value::as_string)
            .map(str::to_string)
            .or_else(|| string(entitlements.get("com.apple.developer.team-identifier")));
        let application_identifier = string(entitlements.get("application-identifier"));

        let profile = Self {
            name: string(dict.get("Name")),
            uuid: string(dict.get("UUID")),
            raw,
            entitlements,
            team_identifier,
            application_identifier,
        };
        debug!(
            name = ?profile.name,
            team = ?profile.team_identifier,
            app_id = ?profile.application_identifier,
            "parsed provisioning profile"
        );
        Ok(profile)
    }

    /// The profile file as read, for `embedded.mobileprovision`.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn entitlements(&self) -> &Dictionary {
        &self.entitlements
    }

    /// Entitlements with `application-identifier` rewritten for `bundle_id`
    /// when the profile carries a wildcard app id.
    pub fn entitlements_for(&self, bundle_id: &str) -> Dictionary {
        let mut ents = self.entitlements.clone();
        if let Some(app_id) = &self.application_identifier {
            if let Some(prefix) = app_id.strip_suffix('*') {
                let team = prefix.trim_end_matches('.');
                ents.insert(
                    "application-identifier".into(),
                    Value::String(format!("{}.{}", team, bundle_id)),
                );
            }
        }
        ents
    }

    /// Entitlements serialized as an XML plist.
    pub fn entitlements_xml(&self, bundle_id: Option<&str>) -> Result<Vec<u8>> {
        let ents = match bundle_id {
            Some(id) => self.entitlements_for(id),
            None => self.entitlements.clone(),
        };
        let mut buf = Vec::new();
        plist::to_writer_xml(&mut buf, &Value::Dictionary(ents))?;
        Ok(buf)
    }
}

fn signed_content(raw: &[u8]) -> Result<Vec<u8>> {
    if let Ok(signed) = cryptographic_message_syntax::SignedData::parse_ber(raw) {
        if let Some(content) = signed.signed_content() {
            return Ok(content.to_vec());
        }
    }

    let start = raw
        .windows(5)
        .position(|w| w == b"<?xml")
        .ok_or_else(|| Error::ProvisioningProfile("No plist found in profile".into()))?;
    let end = raw[start..]
        .windows(8)
        .position(|w| w == b"</plist>")
        .map(|p| start + p + 8)
        .ok_or_else(|| Error::ProvisioningProfile("Unterminated plist in profile".into()))?;
    Ok(raw[start..end].to_vec())
}
