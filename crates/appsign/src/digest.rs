//! SHA-1 / SHA-256 digests over whole buffers and page-sized slices.

use sha1::{Digest, Sha1};
use sha2::Sha256;

/// Hash algorithm used for CodeDirectory slots and resource hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestKind {
    /// SHA-1, 20-byte output. Primary CodeDirectory and legacy resource hashes.
    Sha1,
    /// SHA-256, 32-byte output. Alternate CodeDirectory and `hash2` entries.
    Sha256,
}

impl DigestKind {
    /// Digest output length in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            DigestKind::Sha1 => 20,
            DigestKind::Sha256 => 32,
        }
    }
}

/// Digest `data` with the given algorithm.
pub fn digest(kind: DigestKind, data: &[u8]) -> Vec<u8> {
    match kind {
        DigestKind::Sha1 => Sha1::digest(data).to_vec(),
        DigestKind::Sha256 => Sha256::digest(data).to_vec(),
    }
}

/// SHA-1 of `data` as a fixed array.
pub fn sha1(data: &[u8]) -> [u8; 20] {
    Sha1::digest(data).into()
}

/// SHA-256 of `data` as a fixed array.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// SHA-1 and SHA-256 of the same buffer in one pass over the input.
pub fn sha1_sha256(data: &[u8]) -> ([u8; 20], [u8; 32]) {
    let mut h1 = Sha1::new();
    let mut h2 = Sha256::new();
    h1.update(data);
    h2.update(data);
    (h1.finalize().into(), h2.finalize().into())
}

/// Hash `data` in `page_size` chunks, concatenating the digests.
///
/// The final chunk may be short; it is hashed as-is. An empty input yields
/// an empty output.
pub fn hash_pages(kind: DigestKind, data: &[u8], page_size: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len().div_ceil(page_size) * kind.output_len());
    for chunk in data.chunks(page_size) {
        out.extend(digest(kind, chunk));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_lengths() {
        assert_eq!(digest(DigestKind::Sha1, b"abc").len(), 20);
        assert_eq!(digest(DigestKind::Sha256, b"abc").len(), 32);
    }

    #[test]
    fn test_known_sha1() {
        // SHA-1("abc") = a9993e364706816aba3e25717850c26c9cd0d89d
        assert_eq!(
            hex::encode(sha1(b"abc")),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn test_known_sha256() {
        assert_eq!(
            hex::encode(sha256(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_sha1_sha256_matches_individual() {
        let data = b"some page content";
        let (h1, h2) = sha1_sha256(data);
        assert_eq!(h1, sha1(data));
        assert_eq!(h2, sha256(data));
    }

    #[test]
    fn test_hash_pages_chunking() {
        let data = vec![0xabu8; 4096 + 100];
        let hashes = hash_pages(DigestKind::Sha256, &data, 4096);
        assert_eq!(hashes.len(), 64);
        assert_eq!(&hashes[..32], sha256(&data[..4096]).as_slice());
        assert_eq!(&hashes[32..], sha256(&data[4096..]).as_slice());
    }

    #[test]
    fn test_hash_pages_empty() {
        assert!(hash_pages(DigestKind::Sha1, &[], 4096).is_empty());
    }

    #[test]
    fn test_hash_pages_exact_page() {
        let data = vec![1u8; 8192];
        let hashes = hash_pages(DigestKind::Sha1, &data, 4096);
        assert_eq!(hashes.len(), 40);
    }
}
