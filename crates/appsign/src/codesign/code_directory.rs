//! CodeDirectory blob builder.
//!
//! The CodeDirectory is the core structure of an Apple code signature: a
//! fixed header followed by the identifier and team strings, the special
//! slot hashes in reverse slot order, and one hash per 4KB page of the
//! binary up to `codeLimit`.
//!
//! Each binary carries two directories covering the identical byte range:
//! a SHA-1 primary (slot 0) and a SHA-256 alternate (slot 0x1000).

use super::constants::*;
use crate::digest::{digest, hash_pages, DigestKind};

/// Header size for version 0x20400 (through execSegFlags).
const CODEDIRECTORY_HEADER_SIZE: u32 = 88;

/// Hashes for the negatively-indexed special slots.
///
/// Each entry is a digest computed with the same algorithm the directory is
/// built with; `None` slots are emitted as zero bytes when a later slot
/// forces their presence, and trimmed otherwise.
#[derive(Debug, Default, Clone)]
pub struct SpecialSlots {
    /// Slot -1: Info.plist
    pub info_plist: Option<Vec<u8>>,
    /// Slot -2: requirements blob
    pub requirements: Option<Vec<u8>>,
    /// Slot -3: CodeResources
    pub resources: Option<Vec<u8>>,
    /// Slot -5: XML entitlements blob
    pub entitlements: Option<Vec<u8>>,
    /// Slot -7: DER entitlements blob
    pub der_entitlements: Option<Vec<u8>>,
}

/// Builder for CodeDirectory blobs.
///
/// Borrows the code bytes (the slice content up to `codeLimit`) so a fat
/// binary can build directories for each slice without copying.
pub struct CodeDirectoryBuilder<'a> {
    identifier: &'a str,
    team_id: Option<&'a str>,
    code: &'a [u8],
    slots: SpecialSlots,
    exec_seg_base: u64,
    exec_seg_limit: u64,
    exec_seg_flags: u64,
    flags: u32,
}

impl<'a> CodeDirectoryBuilder<'a> {
    /// Create a builder for `code`, the bytes covered by the directory.
    pub fn new(identifier: &'a str, code: &'a [u8]) -> Self {
        Self {
            identifier,
            team_id: None,
            code,
            slots: SpecialSlots::default(),
            exec_seg_base: 0,
            exec_seg_limit: 0,
            exec_seg_flags: 0,
            flags: 0,
        }
    }

    /// Team identifier carried after the identifier string.
    pub fn team_id(mut self, team_id: &'a str) -> Self {
        self.team_id = Some(team_id);
        self
    }

    /// Special slot hashes, matching the digest kind passed to [`build`].
    ///
    /// [`build`]: Self::build
    pub fn special_slots(mut self, slots: SpecialSlots) -> Self {
        self.slots = slots;
        self
    }

    /// Executable segment span (file offset and limit of `__TEXT`).
    pub fn exec_seg(mut self, base: u64, limit: u64) -> Self {
        self.exec_seg_base = base;
        self.exec_seg_limit = limit;
        self
    }

    /// Raw execSegFlags value (e.g. `CS_EXECSEG_MAIN_BINARY`).
    pub fn exec_seg_flags(mut self, flags: u64) -> Self {
        self.exec_seg_flags = flags;
        self
    }

    /// CodeDirectory flags word.
    pub fn flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    fn is_main_executable(&self) -> bool {
        self.exec_seg_flags & CS_EXECSEG_MAIN_BINARY != 0
    }

    /// Number of special slots, with trailing empty slots trimmed.
    ///
    /// Slots -7 and -6 only exist for main executables. At least slots
    /// -1..-3 are always present.
    fn count_special_slots(&self) -> usize {
        let mut present: Vec<bool> = Vec::with_capacity(7);
        if self.is_main_executable() {
            present.push(self.slots.der_entitlements.is_some()); // -7
            present.push(false); // -6
        }
        present.push(self.slots.entitlements.is_some()); // -5
        present.push(false); // -4
        present.push(self.slots.resources.is_some()); // -3
        present.push(self.slots.requirements.is_some()); // -2
        present.push(self.slots.info_plist.is_some()); // -1

        match present.iter().position(|&p| p) {
            Some(idx) => present.len() - idx,
            None => 3,
        }
    }

    /// Special slot hashes in storage order (-n up to -1).
    fn build_special_slots(&self, hash_len: usize) -> Vec<u8> {
        let empty = vec![0u8; hash_len];
        let pick = |slot: &Option<Vec<u8>>| slot.clone().unwrap_or_else(|| empty.clone());

        let n = self.count_special_slots();
        let mut out = Vec::with_capacity(n * hash_len);
        if n >= 7 {
            out.extend(pick(&self.slots.der_entitlements));
        }
        if n >= 6 {
            out.extend(&empty);
        }
        if n >= 5 {
            out.extend(pick(&self.slots.entitlements));
        }
        if n >= 4 {
            out.extend(&empty);
        }
        out.extend(pick(&self.slots.resources));
        out.extend(pick(&self.slots.requirements));
        out.extend(pick(&self.slots.info_plist));
        out
    }

    /// Serialise the CodeDirectory with the given hash algorithm.
    pub fn build(&self, kind: DigestKind) -> Vec<u8> {
        let hash_len = kind.output_len();
        let hash_type = match kind {
            DigestKind::Sha1 => CS_HASHTYPE_SHA1,
            DigestKind::Sha256 => CS_HASHTYPE_SHA256,
        };

        let code_limit = self.code.len() as u32;
        let n_code_slots = self.code.len().div_ceil(PAGE_SIZE) as u32;
        let n_special_slots = self.count_special_slots() as u32;

        let ident_offset = CODEDIRECTORY_HEADER_SIZE;
        let ident_len = self.identifier.len() as u32 + 1;
        let (team_offset, team_len) = match self.team_id {
            Some(team) => (ident_offset + ident_len, team.len() as u32 + 1),
            None => (0, 0),
        };
        let hash_offset =
            ident_offset + ident_len + team_len + n_special_slots * hash_len as u32;
        let total_len = hash_offset + n_code_slots * hash_len as u32;

        let mut buf = Vec::with_capacity(total_len as usize);

        // Header; every field big-endian.
        buf.extend(&CSMAGIC_CODEDIRECTORY.to_be_bytes());
        buf.extend(&total_len.to_be_bytes());
        buf.extend(&CODEDIRECTORY_VERSION.to_be_bytes());
        buf.extend(&self.flags.to_be_bytes());
        buf.extend(&hash_offset.to_be_bytes());
        buf.extend(&ident_offset.to_be_bytes());
        buf.extend(&n_special_slots.to_be_bytes());
        buf.extend(&n_code_slots.to_be_bytes());
        buf.extend(&code_limit.to_be_bytes());
        buf.push(hash_len as u8);
        buf.push(hash_type);
        buf.push(0); // platform
        buf.push(PAGE_SIZE_LOG2);
        buf.extend(&0u32.to_be_bytes()); // spare2
        buf.extend(&0u32.to_be_bytes()); // scatterOffset
        buf.extend(&team_offset.to_be_bytes());
        buf.extend(&0u32.to_be_bytes()); // spare3
        buf.extend(&0u64.to_be_bytes()); // codeLimit64
        buf.extend(&self.exec_seg_base.to_be_bytes());
        buf.extend(&self.exec_seg_limit.to_be_bytes());
        buf.extend(&self.exec_seg_flags.to_be_bytes());

        buf.extend(self.identifier.as_bytes());
        buf.push(0);
        if let Some(team) = self.team_id {
            buf.extend(team.as_bytes());
            buf.push(0);
        }

        buf.extend(self.build_special_slots(hash_len));
        buf.extend(hash_pages(kind, self.code, PAGE_SIZE));

        debug_assert_eq!(buf.len(), total_len as usize);
        buf
    }
}

/// CDHash of a serialised CodeDirectory: SHA-1 for the primary directory.
pub fn cdhash_sha1(code_directory: &[u8]) -> [u8; 20] {
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest(DigestKind::Sha1, code_directory));
    out
}

/// CDHash of a serialised CodeDirectory: SHA-256 for the alternate directory.
pub fn cdhash_sha256(code_directory: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest(DigestKind::Sha256, code_directory));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::sha256;

    // Header field offsets for version 0x20400:
    // magic 0, length 4, version 8, flags 12, hashOffset 16, identOffset 20,
    // nSpecialSlots 24, nCodeSlots 28, codeLimit 32, hashSize 36, hashType 37,
    // platform 38, pageSize 39, spare2 40, scatterOffset 44, teamOffset 48,
    // spare3 52, codeLimit64 56, execSegBase 64, execSegLimit 72, execSegFlags 80
    fn be32(cd: &[u8], off: usize) -> u32 {
        u32::from_be_bytes(cd[off..off + 4].try_into().unwrap())
    }

    fn be64(cd: &[u8], off: usize) -> u64 {
        u64::from_be_bytes(cd[off..off + 8].try_into().unwrap())
    }

    #[test]
    fn test_header_fields_sha256() {
        let code = vec![0u8; 8192];
        let cd = CodeDirectoryBuilder::new("com.example.app", &code).build(DigestKind::Sha256);

        assert_eq!(be32(&cd, 0), CSMAGIC_CODEDIRECTORY);
        assert_eq!(be32(&cd, 4), cd.len() as u32);
        assert_eq!(be32(&cd, 8), CODEDIRECTORY_VERSION);
        assert_eq!(cd[36], 32);
        assert_eq!(cd[37], CS_HASHTYPE_SHA256);
        assert_eq!(cd[39], PAGE_SIZE_LOG2);
        assert_eq!(be32(&cd, 28), 2); // nCodeSlots
        assert_eq!(be32(&cd, 32), 8192); // codeLimit
    }

    #[test]
    fn test_header_fields_sha1() {
        let code = vec![0u8; 4096];
        let cd = CodeDirectoryBuilder::new("com.example.app", &code).build(DigestKind::Sha1);
        assert_eq!(cd[36], 20);
        assert_eq!(cd[37], CS_HASHTYPE_SHA1);
    }

    #[test]
    fn test_partial_page_rounds_up() {
        let code = vec![0u8; 6144];
        let cd = CodeDirectoryBuilder::new("t", &code).build(DigestKind::Sha256);
        assert_eq!(be32(&cd, 28), 2);
        assert_eq!(be32(&cd, 32), 6144);
    }

    #[test]
    fn test_identifier_and_team_strings() {
        let code = vec![0u8; 4096];
        let cd = CodeDirectoryBuilder::new("com.ex.hello", &code)
            .team_id("ABC1234567")
            .build(DigestKind::Sha256);

        let ident_offset = be32(&cd, 20) as usize;
        let team_offset = be32(&cd, 48) as usize;
        assert_eq!(&cd[ident_offset..ident_offset + 13], b"com.ex.hello\0");
        assert_eq!(&cd[team_offset..team_offset + 11], b"ABC1234567\0");
        assert_eq!(team_offset, ident_offset + 13);
    }

    #[test]
    fn test_no_team_offset_when_absent() {
        let code = vec![0u8; 4096];
        let cd = CodeDirectoryBuilder::new("t", &code).build(DigestKind::Sha256);
        assert_eq!(be32(&cd, 48), 0);
    }

    #[test]
    fn test_minimum_three_special_slots() {
        let code = vec![0u8; 4096];
        let cd = CodeDirectoryBuilder::new("t", &code).build(DigestKind::Sha256);
        assert_eq!(be32(&cd, 24), 3);
    }

    #[test]
    fn test_five_slots_with_entitlements() {
        let code = vec![0u8; 4096];
        let cd = CodeDirectoryBuilder::new("t", &code)
            .special_slots(SpecialSlots {
                entitlements: Some(vec![0xaa; 32]),
                ..Default::default()
            })
            .build(DigestKind::Sha256);
        assert_eq!(be32(&cd, 24), 5);
    }

    #[test]
    fn test_seven_slots_for_executable_with_der() {
        let code = vec![0u8; 4096];
        let cd = CodeDirectoryBuilder::new("t", &code)
            .special_slots(SpecialSlots {
                entitlements: Some(vec![0xaa; 32]),
                der_entitlements: Some(vec![0xbb; 32]),
                ..Default::default()
            })
            .exec_seg_flags(CS_EXECSEG_MAIN_BINARY)
            .build(DigestKind::Sha256);
        assert_eq!(be32(&cd, 24), 7);
    }

    #[test]
    fn test_non_executable_caps_at_five_slots() {
        let code = vec![0u8; 4096];
        let cd = CodeDirectoryBuilder::new("t", &code)
            .special_slots(SpecialSlots {
                entitlements: Some(vec![0xaa; 32]),
                der_entitlements: Some(vec![0xbb; 32]),
                ..Default::default()
            })
            .build(DigestKind::Sha256);
        assert_eq!(be32(&cd, 24), 5);
    }

    #[test]
    fn test_code_slot_coverage() {
        // Slot i must equal H(code[i*4096 .. min((i+1)*4096, codeLimit)])
        let mut code = vec![0u8; 4096 + 1000];
        for (i, b) in code.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let cd = CodeDirectoryBuilder::new("t", &code).build(DigestKind::Sha256);

        let hash_offset = be32(&cd, 16) as usize;
        assert_eq!(&cd[hash_offset..hash_offset + 32], &sha256(&code[..4096]));
        assert_eq!(
            &cd[hash_offset + 32..hash_offset + 64],
            &sha256(&code[4096..])
        );
    }

    #[test]
    fn test_special_slot_placement() {
        // Special slots sit immediately before hashOffset, in reverse order,
        // so slot -1 is the last one before the code slots.
        let code = vec![0u8; 4096];
        let info = vec![0x11u8; 32];
        let cd = CodeDirectoryBuilder::new("t", &code)
            .special_slots(SpecialSlots {
                info_plist: Some(info.clone()),
                ..Default::default()
            })
            .build(DigestKind::Sha256);

        let hash_offset = be32(&cd, 16) as usize;
        assert_eq!(&cd[hash_offset - 32..hash_offset], info.as_slice());
        // Slots -2 and -3 are zero-filled
        assert!(cd[hash_offset - 96..hash_offset - 32].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_exec_seg_fields() {
        let code = vec![0u8; 4096];
        let cd = CodeDirectoryBuilder::new("t", &code)
            .exec_seg(0, 65536)
            .exec_seg_flags(CS_EXECSEG_MAIN_BINARY)
            .build(DigestKind::Sha256);
        assert_eq!(be64(&cd, 64), 0);
        assert_eq!(be64(&cd, 72), 65536);
        assert_eq!(be64(&cd, 80), CS_EXECSEG_MAIN_BINARY);
    }

    #[test]
    fn test_empty_code() {
        let cd = CodeDirectoryBuilder::new("t", &[]).build(DigestKind::Sha256);
        assert_eq!(be32(&cd, 28), 0);
        assert_eq!(be32(&cd, 32), 0);
        assert_eq!(cd.len(), be32(&cd, 4) as usize);
    }

    #[test]
    fn test_cdhash_deterministic() {
        let code = vec![0u8; 4096];
        let cd = CodeDirectoryBuilder::new("t", &code).build(DigestKind::Sha1);
        assert_eq!(cdhash_sha1(&cd), cdhash_sha1(&cd));
        assert_eq!(cdhash_sha256(&cd).len(), 32);
    }
}
