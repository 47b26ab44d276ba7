//! iOS application re-signing engine.
//!
//! Takes an unpacked `.app` bundle and a signing identity (certificate,
//! private key, provisioning profile, entitlements) and rewrites every
//! Mach-O executable and resource manifest so the result verifies under
//! the supplied identity.
//!
//! The crate is built from three subsystems:
//!
//! - [`macho`] — Mach-O parsing and rewriting: load commands, `__LINKEDIT`
//!   growth, dylib injection/removal, signature embedding
//! - [`codesign`] + [`crypto`] — CodeDirectory, SuperBlob, entitlements
//!   DER, and CMS signature generation
//! - [`bundle`] + [`SignCoordinator`] — bundle traversal, CodeResources
//!   generation, leaf-first orchestration
//!
//! # Example
//!
//! ```no_run
//! use appsign::{SignCoordinator, SignOptions, SigningIdentity};
//!
//! let p12 = std::fs::read("dev.p12")?;
//! let profile = std::fs::read("dev.mobileprovision")?;
//! let identity = SigningIdentity::from_p12(&p12, "password")?
//!     .with_provisioning_profile(profile)?;
//!
//! let options = SignOptions {
//!     bundle_id: Some("com.example.renamed".into()),
//!     ..Default::default()
//! };
//! SignCoordinator::new(&identity, options).sign("Payload/App.app".as_ref())?;
//! # Ok::<(), appsign::Error>(())
//! ```
//!
//! The coordinator signs nested bundles (plug-ins, frameworks, watch apps)
//! before their parents, since a parent's `CodeResources` records each
//! child's CDHash.
//!
//! Independent bundle trees may be signed concurrently with separate
//! coordinators and identities; nothing in the crate holds process-wide
//! mutable state.

pub mod bundle;
pub mod codesign;
pub mod coordinator;
pub mod crypto;
pub mod digest;
pub mod error;
pub mod macho;

pub use coordinator::{
    change_dylib_path, inject_dylib, list_dylibs, uninstall_dylibs, SignCoordinator, SignOptions,
};
pub use crypto::identity::SigningIdentity;
pub use error::Error;

/// Convenience alias used by every fallible function in this crate.
pub type Result<T> = std::result::Result<T, Error>;
