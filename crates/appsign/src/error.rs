//! Error types for signing operations.
//!
//! This module defines the [`enum@Error`] enum covering all failure cases
//! in re-signing operations: identity loading, Mach-O rewriting, signature
//! generation, and bundle processing.

use std::path::PathBuf;
use thiserror::Error;

/// Error type for signing operations.
///
/// All public functions in this crate return [`crate::Result<T>`], which uses
/// this error type. Match on variants to handle specific failure cases.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed.
    ///
    /// Occurs when reading input files, writing output files, or accessing
    /// the filesystem during signing operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The signing identity could not be loaded or is inconsistent.
    ///
    /// Covers missing certificate or key material and a Team ID mismatch
    /// between the certificate and the provisioning profile.
    #[error("Invalid signing identity: {0}")]
    Identity(String),

    /// Incorrect password for private key or PKCS#12 file.
    #[error("Invalid password for private key or PKCS#12")]
    InvalidPassword,

    /// The bundle directory is not a signable bundle.
    ///
    /// Missing `Info.plist`, missing main executable, or no `.app`
    /// directory at the given path.
    #[error("Malformed bundle: {0}")]
    MalformedBundle(String),

    /// Invalid or unsupported Mach-O binary format.
    ///
    /// Header / load-command inconsistencies: unrecognised magic, a declared
    /// span exceeding file bounds, or duplicate `LC_CODE_SIGNATURE` commands.
    #[error("Invalid Mach-O: {0}")]
    MachO(String),

    /// The load-command region cannot grow in place.
    ///
    /// There is not enough free space between the last load command and the
    /// first section data to hold the new command.
    #[error("No space in load commands region ({needed} bytes needed, {available} free)")]
    NoLoadCommandSpace {
        /// Bytes the new command would occupy.
        needed: usize,
        /// Free bytes after the last load command.
        available: usize,
    },

    /// Signature reservation retries exceeded.
    ///
    /// The assembled SuperBlob kept outgrowing its reserved space.
    #[error("Signature size diverged after {0} reservation retries")]
    SignatureSizeDiverged(u32),

    /// Cryptographic failure while producing the CMS signature.
    #[error("Signature creation failed: {0}")]
    Signing(String),

    /// Property list parsing or serialisation failed.
    #[error("Plist error: {0}")]
    Plist(#[from] plist::Error),

    /// A nested bundle failed to sign; propagated as the parent's failure.
    #[error("Failed to sign nested bundle {}: {source}", path.display())]
    ChildSign {
        /// Path of the nested bundle that failed.
        path: PathBuf,
        /// The underlying failure.
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Process exit code for the top-level `sign` operation.
    ///
    /// 0 is success; each taxonomy kind maps to a stable non-zero value.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Identity(_) | Error::InvalidPassword => 2,
            Error::MalformedBundle(_) => 3,
            Error::MachO(_) => 4,
            Error::NoLoadCommandSpace { .. } => 5,
            Error::SignatureSizeDiverged(_) => 6,
            Error::Signing(_) => 7,
            Error::Io(_) => 8,
            Error::Plist(_) => 9,
            Error::ChildSign { source, .. } => source.exit_code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_sign_exit_code_propagates() {
        let err = Error::ChildSign {
            path: PathBuf::from("PlugIns/Widget.appex"),
            source: Box::new(Error::MachO("truncated slice".into())),
        };
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn test_exit_codes_are_stable() {
        assert_eq!(Error::InvalidPassword.exit_code(), 2);
        assert_eq!(Error::Identity("team mismatch".into()).exit_code(), 2);
        assert_eq!(Error::SignatureSizeDiverged(3).exit_code(), 6);
    }

    #[test]
    fn test_no_load_command_space_message() {
        let err = Error::NoLoadCommandSpace {
            needed: 56,
            available: 48,
        };
        let msg = err.to_string();
        assert!(msg.contains("56"));
        assert!(msg.contains("48"));
    }
}
