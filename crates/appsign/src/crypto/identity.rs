//! Signing identity: certificate, private key, Team ID, entitlements.
//!
//! Credentials load from a PKCS#12 (.p12) container or from separate PEM
//! certificate and PKCS#8 key files. The Apple Team ID comes from the
//! certificate subject's Organizational Unit; the Subject CN names the
//! identity in diagnostics.
//!
//! An identity is immutable for the duration of one signing run.

use crate::codesign::der::entitlements_to_der;
use crate::crypto::profile::ProvisioningProfile;
use crate::{Error, Result};
use x509_certificate::{CapturedX509Certificate, InMemorySigningKeyPair, KeyInfoSigner};

/// Everything needed to sign one bundle tree.
#[derive(Debug)]
pub struct SigningIdentity {
    /// Leaf signing certificate.
    certificate: CapturedX509Certificate,
    /// Private key matching the certificate.
    signing_key: InMemorySigningKeyPair,
    /// Intermediate certificates carried into the CMS signature.
    chain: Vec<CapturedX509Certificate>,
    /// Team ID from the certificate's OU.
    team_id: String,
    /// Subject common name.
    subject_cn: Option<String>,
    /// Provisioning profile, when supplied.
    profile: Option<ProvisioningProfile>,
    /// Entitlements as an XML plist.
    entitlements: Option<Vec<u8>>,
    /// Entitlements re-encoded as DER.
    entitlements_der: Option<Vec<u8>>,
}

impl SigningIdentity {
    /// Load an identity from PKCS#12 data.
    ///
    /// The container MAC is verified against `password` first, so a wrong
    /// password is reported as [`Error::InvalidPassword`] before any bag is
    /// decrypted.
    pub fn from_p12(p12_data: &[u8], password: &str) -> Result<Self> {
        let pfx = p12::PFX::parse(p12_data)
            .map_err(|e| Error::Identity(format!("not a PKCS#12 container: {:?}", e)))?;

        if !pfx.verify_mac(password) {
            return Err(Error::InvalidPassword);
        }

        let keys = pfx
            .key_bags(password)
            .map_err(|e| Error::Identity(format!("failed to read PKCS#12 key bags: {:?}", e)))?;
        let certs = pfx
            .cert_x509_bags(password)
            .map_err(|e| Error::Identity(format!("failed to read PKCS#12 cert bags: {:?}", e)))?;

        let key_der = keys
            .first()
            .ok_or_else(|| Error::Identity("no private key in PKCS#12".into()))?;
        let cert_der = certs
            .first()
            .ok_or_else(|| Error::Identity("no certificate in PKCS#12".into()))?;

        let certificate = CapturedX509Certificate::from_der(cert_der.clone())
            .map_err(|e| Error::Identity(format!("invalid certificate DER: {}", e)))?;
        let signing_key = InMemorySigningKeyPair::from_pkcs8_der(key_der)
            .map_err(|e| Error::Identity(format!("invalid private key: {}", e)))?;

        let chain = certs
            .iter()
            .skip(1)
            .filter_map(|der| CapturedX509Certificate::from_der(der.clone()).ok())
            .collect();

        Self::from_parts(certificate, signing_key, chain)
    }

    /// Load an identity from a PEM certificate and a PEM PKCS#8 private key.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let certificate = CapturedX509Certificate::from_pem(cert_pem)
            .map_err(|e| Error::Identity(format!("invalid certificate PEM: {}", e)))?;
        let key_str = std::str::from_utf8(key_pem)
            .map_err(|e| Error::Identity(format!("private key PEM is not UTF-8: {}", e)))?;
        let signing_key = InMemorySigningKeyPair::from_pkcs8_pem(key_str)
            .map_err(|e| Error::Identity(format!("invalid private key: {}", e)))?;

        Self::from_parts(certificate, signing_key, Vec::new())
    }

    /// Build an identity from already-loaded credentials.
    ///
    /// The certificate subject must carry an OU (the Team ID).
    pub fn from_parts(
        certificate: CapturedX509Certificate,
        signing_key: InMemorySigningKeyPair,
        chain: Vec<CapturedX509Certificate>,
    ) -> Result<Self> {
        let team_id = organizational_unit(&certificate)
            .ok_or_else(|| Error::Identity("certificate subject has no OU (Team ID)".into()))?;
        let subject_cn = common_name(&certificate);

        Ok(Self {
            certificate,
            signing_key,
            chain,
            team_id,
            subject_cn,
            profile: None,
            entitlements: None,
            entitlements_der: None,
        })
    }

    /// Attach a provisioning profile.
    ///
    /// The profile's `TeamIdentifier` must match the certificate's Team ID;
    /// mismatching identities are rejected. Entitlements are taken from the
    /// profile unless [`with_entitlements`] overrides them afterwards.
    ///
    /// [`with_entitlements`]: Self::with_entitlements
    pub fn with_provisioning_profile(mut self, profile_data: Vec<u8>) -> Result<Self> {
        let profile = ProvisioningProfile::parse(profile_data)?;

        match profile.team_identifier() {
            Some(team) if team == self.team_id => {}
            Some(team) => {
                return Err(Error::Identity(format!(
                    "Team ID mismatch: certificate has {}, profile has {}",
                    self.team_id, team
                )));
            }
            None => {
                return Err(Error::Identity(
                    "provisioning profile has no TeamIdentifier".into(),
                ));
            }
        }

        let entitlements = profile.entitlements_xml()?;
        self.entitlements_der = Some(entitlements_to_der(&entitlements)?);
        self.entitlements = Some(entitlements);
        self.profile = Some(profile);
        Ok(self)
    }

    /// Override entitlements with a caller-supplied XML plist.
    ///
    /// Takes precedence over the profile's entitlements; the DER form is
    /// re-encoded from the new plist.
    pub fn with_entitlements(mut self, entitlements_xml: Vec<u8>) -> Result<Self> {
        self.entitlements_der = Some(entitlements_to_der(&entitlements_xml)?);
        self.entitlements = Some(entitlements_xml);
        Ok(self)
    }

    /// Leaf signing certificate.
    pub fn certificate(&self) -> &CapturedX509Certificate {
        &self.certificate
    }

    /// The private key as a CMS-capable signer.
    pub fn signer(&self) -> &dyn KeyInfoSigner {
        &self.signing_key
    }

    /// Intermediate certificates for the CMS chain.
    pub fn chain(&self) -> &[CapturedX509Certificate] {
        &self.chain
    }

    /// 10-character Apple Team ID.
    pub fn team_id(&self) -> &str {
        &self.team_id
    }

    /// Certificate subject common name, if present.
    pub fn subject_cn(&self) -> Option<&str> {
        self.subject_cn.as_deref()
    }

    /// Attached provisioning profile.
    pub fn profile(&self) -> Option<&ProvisioningProfile> {
        self.profile.as_ref()
    }

    /// Effective entitlements (XML plist bytes).
    pub fn entitlements(&self) -> Option<&[u8]> {
        self.entitlements.as_deref()
    }

    /// Effective entitlements in DER form.
    pub fn entitlements_der(&self) -> Option<&[u8]> {
        self.entitlements_der.as_deref()
    }

    /// True when the entitlements set `get-task-allow`.
    pub fn get_task_allow(&self) -> bool {
        let Some(xml) = self.entitlements.as_deref() else {
            return false;
        };
        plist::from_bytes::<plist::Value>(xml)
            .ok()
            .and_then(|v| v.into_dictionary())
            .and_then(|d| d.get("get-task-allow").and_then(plist::Value::as_boolean))
            .unwrap_or(false)
    }
}

fn organizational_unit(cert: &CapturedX509Certificate) -> Option<String> {
    for atav in cert.subject_name().iter_organizational_unit() {
        if let Ok(value) = atav.to_string() {
            return Some(value);
        }
    }
    None
}

fn common_name(cert: &CapturedX509Certificate) -> Option<String> {
    for atav in cert.subject_name().iter_common_name() {
        if let Ok(value) = atav.to_string() {
            return Some(value);
        }
    }
    None
}
