//! Cryptographic material for re-signing.
//!
//! - [`SigningIdentity`] — certificate, private key, Team ID, provisioning
//!   profile and entitlements for one signing run
//! - [`profile`] — provisioning-profile payload extraction
//! - [`cms`] — detached CMS `SignedData` generation over CodeDirectory hashes

pub mod cms;
pub mod identity;
pub mod profile;

#[cfg(test)]
pub(crate) mod testutil;

pub use identity::SigningIdentity;
pub use profile::ProvisioningProfile;
