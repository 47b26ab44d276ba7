//! SuperBlob assembly.
//!
//! The SuperBlob is the outer container of an embedded signature: a 12-byte
//! header (magic, total length, blob count), an index of
//! `(slot_type, offset)` pairs, then the blob payloads in index order. All
//! integers are big-endian.
//!
//! Slot order matches Apple's `codesign`: primary CodeDirectory (0x0),
//! requirements (0x2), XML entitlements (0x5), DER entitlements (0x7),
//! alternate CodeDirectory (0x1000), CMS signature (0x10000).

use super::constants::*;

const SUPERBLOB_HEADER_SIZE: usize = 12;
const INDEX_ENTRY_SIZE: usize = 8;

/// One sub-blob scheduled for inclusion in a SuperBlob.
#[derive(Debug, Clone)]
pub struct BlobEntry {
    /// Slot type (one of the `CSSLOT_*` constants).
    pub slot_type: u32,
    /// Raw blob bytes, including the blob's own magic and length header.
    pub data: Vec<u8>,
}

/// Serialise `entries` into a SuperBlob.
pub fn build_superblob(entries: &[BlobEntry]) -> Vec<u8> {
    let index_size = SUPERBLOB_HEADER_SIZE + entries.len() * INDEX_ENTRY_SIZE;
    let total: usize = index_size + entries.iter().map(|e| e.data.len()).sum::<usize>();

    let mut buf = Vec::with_capacity(total);
    buf.extend(&CSMAGIC_EMBEDDED_SIGNATURE.to_be_bytes());
    buf.extend(&(total as u32).to_be_bytes());
    buf.extend(&(entries.len() as u32).to_be_bytes());

    let mut offset = index_size as u32;
    for entry in entries {
        buf.extend(&entry.slot_type.to_be_bytes());
        buf.extend(&offset.to_be_bytes());
        offset += entry.data.len() as u32;
    }
    for entry in entries {
        buf.extend(&entry.data);
    }
    buf
}

/// Wrap XML entitlements plist bytes in an entitlements blob.
pub fn entitlements_blob(plist_data: &[u8]) -> Vec<u8> {
    wrap_blob(CSMAGIC_EMBEDDED_ENTITLEMENTS, plist_data)
}

/// Wrap DER-encoded entitlements in a DER entitlements blob.
pub fn der_entitlements_blob(der_data: &[u8]) -> Vec<u8> {
    wrap_blob(CSMAGIC_EMBEDDED_DER_ENTITLEMENTS, der_data)
}

/// Minimal empty requirements blob (header plus zero count).
pub fn requirements_blob() -> Vec<u8> {
    let mut buf = Vec::with_capacity(12);
    buf.extend(&CSMAGIC_REQUIREMENTS.to_be_bytes());
    buf.extend(&12u32.to_be_bytes());
    buf.extend(&0u32.to_be_bytes());
    buf
}

/// Wrap a DER-encoded CMS signature in a blob wrapper.
pub fn signature_blob(cms_der: &[u8]) -> Vec<u8> {
    wrap_blob(CSMAGIC_BLOBWRAPPER, cms_der)
}

fn wrap_blob(magic: u32, payload: &[u8]) -> Vec<u8> {
    let total = 8 + payload.len() as u32;
    let mut buf = Vec::with_capacity(total as usize);
    buf.extend(&magic.to_be_bytes());
    buf.extend(&total.to_be_bytes());
    buf.extend(payload);
    buf
}

/// Assembles the standard signature components in slot order.
#[derive(Debug, Default)]
pub struct SuperBlobBuilder {
    code_directory_sha1: Option<Vec<u8>>,
    code_directory_sha256: Option<Vec<u8>>,
    requirements: Option<Vec<u8>>,
    entitlements: Option<Vec<u8>>,
    der_entitlements: Option<Vec<u8>>,
    cms_signature: Option<Vec<u8>>,
}

impl SuperBlobBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Primary SHA-1 CodeDirectory (slot 0x0000).
    pub fn code_directory_sha1(mut self, cd: Vec<u8>) -> Self {
        self.code_directory_sha1 = Some(cd);
        self
    }

    /// Alternate SHA-256 CodeDirectory (slot 0x1000).
    pub fn code_directory_sha256(mut self, cd: Vec<u8>) -> Self {
        self.code_directory_sha256 = Some(cd);
        self
    }

    /// Requirements blob (slot 0x0002); an empty one is emitted if unset.
    pub fn requirements(mut self, blob: Vec<u8>) -> Self {
        self.requirements = Some(blob);
        self
    }

    /// XML entitlements blob (slot 0x0005).
    pub fn entitlements(mut self, blob: Vec<u8>) -> Self {
        self.entitlements = Some(blob);
        self
    }

    /// DER entitlements blob (slot 0x0007).
    pub fn der_entitlements(mut self, blob: Vec<u8>) -> Self {
        self.der_entitlements = Some(blob);
        self
    }

    /// CMS signature wrapper blob (slot 0x10000).
    pub fn cms_signature(mut self, blob: Vec<u8>) -> Self {
        self.cms_signature = Some(blob);
        self
    }

    /// Serialise all configured components into a SuperBlob.
    pub fn build(self) -> Vec<u8> {
        let mut entries = Vec::new();
        if let Some(cd) = self.code_directory_sha1 {
            entries.push(BlobEntry {
                slot_type: CSSLOT_CODEDIRECTORY,
                data: cd,
            });
        }
        entries.push(BlobEntry {
            slot_type: CSSLOT_REQUIREMENTS,
            data: self.requirements.unwrap_or_else(requirements_blob),
        });
        if let Some(ent) = self.entitlements {
            entries.push(BlobEntry {
                slot_type: CSSLOT_ENTITLEMENTS,
                data: ent,
            });
        }
        if let Some(der) = self.der_entitlements {
            entries.push(BlobEntry {
                slot_type: CSSLOT_DER_ENTITLEMENTS,
                data: der,
            });
        }
        if let Some(cd) = self.code_directory_sha256 {
            entries.push(BlobEntry {
                slot_type: CSSLOT_ALTERNATE_CODEDIRECTORIES,
                data: cd,
            });
        }
        if let Some(sig) = self.cms_signature {
            entries.push(BlobEntry {
                slot_type: CSSLOT_SIGNATURESLOT,
                data: sig,
            });
        }
        build_superblob(&entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn be32(buf: &[u8], off: usize) -> u32 {
        u32::from_be_bytes(buf[off..off + 4].try_into().unwrap())
    }

    #[test]
    fn test_superblob_header() {
        let entries = vec![
            BlobEntry {
                slot_type: CSSLOT_CODEDIRECTORY,
                data: vec![0xab; 100],
            },
            BlobEntry {
                slot_type: CSSLOT_REQUIREMENTS,
                data: vec![0xcd; 12],
            },
        ];
        let blob = build_superblob(&entries);
        assert_eq!(be32(&blob, 0), CSMAGIC_EMBEDDED_SIGNATURE);
        assert_eq!(be32(&blob, 4), (12 + 16 + 100 + 12) as u32);
        assert_eq!(be32(&blob, 8), 2);
    }

    #[test]
    fn test_superblob_offsets() {
        let entries = vec![
            BlobEntry {
                slot_type: CSSLOT_CODEDIRECTORY,
                data: vec![0; 50],
            },
            BlobEntry {
                slot_type: CSSLOT_REQUIREMENTS,
                data: vec![1; 30],
            },
            BlobEntry {
                slot_type: CSSLOT_ENTITLEMENTS,
                data: vec![2; 20],
            },
        ];
        let blob = build_superblob(&entries);
        // Header 12 + index 24 = payloads start at 36
        assert_eq!(be32(&blob, 16), 36);
        assert_eq!(be32(&blob, 24), 86);
        assert_eq!(be32(&blob, 32), 116);
        // First payload byte of second blob
        assert_eq!(blob[86], 1);
    }

    #[test]
    fn test_requirements_blob_shape() {
        let req = requirements_blob();
        assert_eq!(req.len(), 12);
        assert_eq!(be32(&req, 0), CSMAGIC_REQUIREMENTS);
        assert_eq!(be32(&req, 4), 12);
        assert_eq!(be32(&req, 8), 0);
    }

    #[test]
    fn test_entitlements_blob_wraps_payload() {
        let plist = b"<plist><dict/></plist>";
        let blob = entitlements_blob(plist);
        assert_eq!(be32(&blob, 0), CSMAGIC_EMBEDDED_ENTITLEMENTS);
        assert_eq!(be32(&blob, 4) as usize, 8 + plist.len());
        assert_eq!(&blob[8..], plist);
    }

    #[test]
    fn test_der_entitlements_blob_wraps_payload() {
        let der = [0x31, 0x00];
        let blob = der_entitlements_blob(&der);
        assert_eq!(be32(&blob, 0), CSMAGIC_EMBEDDED_DER_ENTITLEMENTS);
        assert_eq!(&blob[8..], &der);
    }

    #[test]
    fn test_signature_blob_wraps_payload() {
        let cms = [0x30, 0x82, 0x01, 0x00];
        let blob = signature_blob(&cms);
        assert_eq!(be32(&blob, 0), CSMAGIC_BLOBWRAPPER);
        assert_eq!(&blob[8..], &cms);
    }

    #[test]
    fn test_builder_slot_ordering() {
        let blob = SuperBlobBuilder::new()
            .cms_signature(signature_blob(&[]))
            .code_directory_sha256(vec![0x02; 10])
            .der_entitlements(der_entitlements_blob(&[]))
            .code_directory_sha1(vec![0x01; 10])
            .entitlements(entitlements_blob(b""))
            .build();

        // Insertion order must not matter; index is in slot order.
        assert_eq!(be32(&blob, 12), CSSLOT_CODEDIRECTORY);
        assert_eq!(be32(&blob, 20), CSSLOT_REQUIREMENTS);
        assert_eq!(be32(&blob, 28), CSSLOT_ENTITLEMENTS);
        assert_eq!(be32(&blob, 36), CSSLOT_DER_ENTITLEMENTS);
        assert_eq!(be32(&blob, 44), CSSLOT_ALTERNATE_CODEDIRECTORIES);
        assert_eq!(be32(&blob, 52), CSSLOT_SIGNATURESLOT);
    }

    #[test]
    fn test_builder_default_requirements() {
        let blob = SuperBlobBuilder::new()
            .code_directory_sha256(vec![0xaa; 80])
            .build();
        // Requirements auto-generated: 2 entries total
        assert_eq!(be32(&blob, 8), 2);
        assert_eq!(be32(&blob, 12), CSSLOT_REQUIREMENTS);
    }

    #[test]
    fn test_empty_superblob() {
        let blob = build_superblob(&[]);
        assert_eq!(blob.len(), 12);
        assert_eq!(be32(&blob, 4), 12);
        assert_eq!(be32(&blob, 8), 0);
    }
}
