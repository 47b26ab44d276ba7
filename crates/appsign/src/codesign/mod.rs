//! Apple code-signature data structures.
//!
//! Builders for the blobs that make up an embedded signature: the
//! CodeDirectory (page hashes plus special slots), the entitlements and
//! requirements wrappers, the DER entitlements encoding, and the SuperBlob
//! container that holds them all together with the CMS signature.

pub mod code_directory;
pub mod constants;
pub mod der;
pub mod superblob;

pub use code_directory::{CodeDirectoryBuilder, SpecialSlots};
pub use superblob::SuperBlobBuilder;
