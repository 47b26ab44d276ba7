//! Provisioning profile handling.
//!
//! A `.mobileprovision` file is a CMS envelope around an XML plist. Only the
//! plist payload matters for signing: it carries `TeamIdentifier`,
//! `Entitlements`, `UUID` and `ExpirationDate`. The raw envelope is kept
//! verbatim so it can be written into the bundle as
//! `embedded.mobileprovision`.

use crate::{Error, Result};
use plist::{Dictionary, Value};

/// Parsed provisioning profile.
#[derive(Clone, Debug)]
pub struct ProvisioningProfile {
    raw: Vec<u8>,
    payload: Dictionary,
}

impl ProvisioningProfile {
    /// Parse a `.mobileprovision` file.
    ///
    /// The plist payload is located by scanning the CMS envelope for the XML
    /// document markers; a full CMS parse is not needed to read it.
    pub fn parse(raw: Vec<u8>) -> Result<Self> {
        let start = raw
            .windows(6)
            .position(|w| w == b"<?xml ")
            .ok_or_else(|| Error::Identity("no plist payload in provisioning profile".into()))?;
        let end = raw
            .windows(8)
            .rposition(|w| w == b"</plist>")
            .map(|p| p + 8)
            .ok_or_else(|| Error::Identity("unterminated plist in provisioning profile".into()))?;
        if start >= end {
            return Err(Error::Identity(
                "malformed plist payload in provisioning profile".into(),
            ));
        }

        let value: Value = plist::from_bytes(&raw[start..end])?;
        let payload = value
            .into_dictionary()
            .ok_or_else(|| Error::Identity("provisioning profile payload is not a dict".into()))?;

        Ok(Self { raw, payload })
    }

    /// The raw `.mobileprovision` bytes, for `embedded.mobileprovision`.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Decoded plist payload.
    pub fn payload(&self) -> &Dictionary {
        &self.payload
    }

    /// First entry of the `TeamIdentifier` array.
    pub fn team_identifier(&self) -> Option<&str> {
        match self.payload.get("TeamIdentifier")? {
            Value::Array(arr) => arr.first().and_then(Value::as_string),
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Profile UUID.
    pub fn uuid(&self) -> Option<&str> {
        self.payload.get("UUID").and_then(Value::as_string)
    }

    /// The `Entitlements` dictionary serialised as an XML plist.
    pub fn entitlements_xml(&self) -> Result<Vec<u8>> {
        let entitlements = self
            .payload
            .get("Entitlements")
            .ok_or_else(|| Error::Identity("provisioning profile has no Entitlements".into()))?;
        let mut buf = Vec::new();
        plist::to_writer_xml(&mut buf, entitlements)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile_bytes() -> Vec<u8> {
        let mut data = b"\x30\x82\x0a\x00 fake cms header ".to_vec();
        data.extend_from_slice(
            br#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>AppIDName</key>
    <string>Hello</string>
    <key>TeamIdentifier</key>
    <array>
        <string>ABC1234567</string>
    </array>
    <key>UUID</key>
    <string>c0ffee00-1234-5678-9abc-def012345678</string>
    <key>Entitlements</key>
    <dict>
        <key>application-identifier</key>
        <string>ABC1234567.com.ex.hello</string>
        <key>get-task-allow</key>
        <true/>
    </dict>
</dict>
</plist>"#,
        );
        data.extend_from_slice(b" trailing cms signature bytes");
        data
    }

    #[test]
    fn test_parse_extracts_payload() {
        let profile = ProvisioningProfile::parse(profile_bytes()).unwrap();
        assert_eq!(profile.team_identifier(), Some("ABC1234567"));
        assert_eq!(
            profile.uuid(),
            Some("c0ffee00-1234-5678-9abc-def012345678")
        );
    }

    #[test]
    fn test_raw_preserved_verbatim() {
        let bytes = profile_bytes();
        let profile = ProvisioningProfile::parse(bytes.clone()).unwrap();
        assert_eq!(profile.raw(), bytes.as_slice());
    }

    #[test]
    fn test_entitlements_reserialised() {
        let profile = ProvisioningProfile::parse(profile_bytes()).unwrap();
        let ent = profile.entitlements_xml().unwrap();
        let parsed: Value = plist::from_bytes(&ent).unwrap();
        let dict = parsed.as_dictionary().unwrap();
        assert_eq!(
            dict.get("application-identifier").and_then(Value::as_string),
            Some("ABC1234567.com.ex.hello")
        );
        assert_eq!(
            dict.get("get-task-allow").and_then(Value::as_boolean),
            Some(true)
        );
    }

    #[test]
    fn test_rejects_data_without_plist() {
        let result = ProvisioningProfile::parse(b"no markers here".to_vec());
        assert!(matches!(result, Err(Error::Identity(_))));
    }

    #[test]
    fn test_rejects_unterminated_plist() {
        let result =
            ProvisioningProfile::parse(b"<?xml version=\"1.0\"?><plist><dict>".to_vec());
        assert!(matches!(result, Err(Error::Identity(_))));
    }
}
