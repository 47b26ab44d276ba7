//! Mach-O signing: CodeDirectory production and SuperBlob embedding.
//!
//! Signing is self-referential: the CodeDirectory hashes every page up to
//! the signature offset, which includes the load commands describing the
//! signature itself. The reservation loop handles this — reserve space,
//! hash, sign, and retry with a larger reservation when the assembled
//! SuperBlob outgrows it. CMS output length varies between runs, so the
//! size is never predicted analytically.

use super::editor::reserve_signature_space;
use super::parser::MachOImage;
use crate::codesign::code_directory::{cdhash_sha1, cdhash_sha256, CodeDirectoryBuilder};
use crate::codesign::constants::{
    CS_EXECSEG_ALLOW_UNSIGNED, CS_EXECSEG_MAIN_BINARY, PAGE_SIZE,
};
use crate::codesign::superblob::{
    der_entitlements_blob, entitlements_blob, requirements_blob, signature_blob, SuperBlobBuilder,
};
use crate::crypto::cms::{cdhashes_plist, sign_cdhashes};
use crate::crypto::identity::SigningIdentity;
use crate::digest::{sha1, sha256, DigestKind};
use crate::{Error, Result};
use log::debug;

/// Reservation retries before giving up (`SignatureSizeDiverged`).
const MAX_RESERVE_RETRIES: u32 = 3;

/// Slack added on the estimation pass and after each overflow.
const RESERVE_SLACK: usize = 1024;

/// Baseline CMS allowance before certificates are accounted for.
const CMS_BASE_ESTIMATE: usize = 2048;

/// Per-binary signing inputs.
pub struct SliceSigningParams<'a> {
    /// Signing identifier (usually the bundle identifier).
    pub identifier: &'a str,
    /// Team ID written after the identifier; `None` for ad-hoc shapes.
    pub team_id: Option<&'a str>,
    /// Raw Info.plist bytes for special slot -1.
    pub info_plist: Option<&'a [u8]>,
    /// Raw CodeResources bytes for special slot -3.
    pub code_resources: Option<&'a [u8]>,
    /// XML entitlements for slot -5 and the entitlements blob.
    pub entitlements: Option<&'a [u8]>,
    /// DER entitlements for slot -7 and its blob.
    pub entitlements_der: Option<&'a [u8]>,
    /// `get-task-allow` grants unsigned executable memory.
    pub allow_unsigned_exec: bool,
    /// Identity providing the CMS signer.
    pub identity: &'a SigningIdentity,
}

/// A signed binary and the CDHash a parent bundle records for it.
pub struct SignedImage {
    /// Rewritten file bytes.
    pub data: Vec<u8>,
    /// SHA-1 CDHash of the first slice's primary CodeDirectory.
    pub cdhash: [u8; 20],
}

/// Sign every slice of `image`, returning the rewritten file bytes.
///
/// Each slice gets its own independent SuperBlob. Fat containers are
/// reassembled with recomputed arch offsets honouring each slice's
/// original alignment.
pub fn sign_image(image: MachOImage, params: &SliceSigningParams) -> Result<SignedImage> {
    let is_fat = image.is_fat();
    let slices = image.slices().to_vec();

    let mut signed: Vec<Vec<u8>> = Vec::with_capacity(slices.len());
    let mut first_cdhash = None;
    for slice in &slices {
        let thin = MachOImage::parse(image.slice_bytes(slice).to_vec())?;
        let (data, cdhash) = sign_slice(thin, params)?;
        first_cdhash.get_or_insert(cdhash);
        signed.push(data);
    }
    let cdhash = first_cdhash.expect("at least one slice parsed");

    let data = if is_fat {
        rebuild_fat(
            &slices.iter().map(|s| s.align).collect::<Vec<_>>(),
            &signed,
        )
    } else {
        signed.into_iter().next().expect("one slice parsed")
    };

    Ok(SignedImage { data, cdhash })
}

/// Sign one thin slice through the reservation loop.
fn sign_slice(
    mut thin: MachOImage,
    params: &SliceSigningParams,
) -> Result<(Vec<u8>, [u8; 20])> {
    let requirements = requirements_blob();
    let ent_blob = params.entitlements.map(entitlements_blob);
    let der_blob = params.entitlements_der.map(|der| der_entitlements_blob(der));

    let mut required = initial_estimate(&thin, params, &requirements, &ent_blob, &der_blob);

    for attempt in 0..=MAX_RESERVE_RETRIES {
        let sig_offset = reserve_signature_space(&mut thin, required)? as usize;
        let slice = thin.slices()[0].clone();
        let reserved = slice
            .code_signature
            .map(|cs| cs.datasize as usize)
            .unwrap_or(0);

        let code = &thin.data()[..sig_offset];
        let exec_seg_flags = if slice.is_executable {
            CS_EXECSEG_MAIN_BINARY
                | if params.allow_unsigned_exec {
                    CS_EXECSEG_ALLOW_UNSIGNED
                } else {
                    0
                }
        } else {
            0
        };
        let (exec_base, exec_limit) = slice
            .text
            .map(|t| (t.fileoff, t.vmsize))
            .unwrap_or((0, 0));

        let build_cd = |kind: DigestKind| {
            let hash = |data: &[u8]| match kind {
                DigestKind::Sha1 => sha1(data).to_vec(),
                DigestKind::Sha256 => sha256(data).to_vec(),
            };
            let slots = crate::codesign::code_directory::SpecialSlots {
                info_plist: params.info_plist.map(&hash),
                requirements: Some(hash(&requirements)),
                resources: params.code_resources.map(&hash),
                entitlements: ent_blob.as_deref().map(&hash),
                der_entitlements: der_blob.as_deref().map(&hash),
            };
            let mut builder = CodeDirectoryBuilder::new(params.identifier, code)
                .special_slots(slots)
                .exec_seg(exec_base, exec_limit)
                .exec_seg_flags(exec_seg_flags);
            if let Some(team) = params.team_id {
                builder = builder.team_id(team);
            }
            builder.build(kind)
        };

        let cd1 = build_cd(DigestKind::Sha1);
        let cd256 = build_cd(DigestKind::Sha256);

        let h1 = cdhash_sha1(&cd1);
        let h256 = cdhash_sha256(&cd256);
        let plist = cdhashes_plist(&h1, &h256)?;
        let cms = sign_cdhashes(params.identity, &plist, &h256)?;

        let mut builder = SuperBlobBuilder::new()
            .code_directory_sha1(cd1)
            .code_directory_sha256(cd256)
            .requirements(requirements.clone())
            .cms_signature(signature_blob(&cms));
        if let Some(blob) = &ent_blob {
            builder = builder.entitlements(blob.clone());
        }
        if let Some(blob) = &der_blob {
            builder = builder.der_entitlements(blob.clone());
        }
        let superblob = builder.build();

        if superblob.len() <= reserved {
            let data = thin.data_mut();
            data[sig_offset..sig_offset + superblob.len()].copy_from_slice(&superblob);
            // Tail up to the reservation stays zero.
            return Ok((thin.into_data(), h1));
        }

        debug!(
            "signature overflowed reservation ({} > {}), attempt {}",
            superblob.len(),
            reserved,
            attempt + 1
        );
        required = superblob.len() + RESERVE_SLACK;
    }

    Err(Error::SignatureSizeDiverged(MAX_RESERVE_RETRIES))
}

/// Worst-case first reservation: exact non-CMS blob sizes plus a CMS
/// allowance derived from the certificate chain length.
fn initial_estimate(
    thin: &MachOImage,
    params: &SliceSigningParams,
    requirements: &[u8],
    ent_blob: &Option<Vec<u8>>,
    der_blob: &Option<Vec<u8>>,
) -> usize {
    let slice = &thin.slices()[0];
    let provisional_limit = match slice.code_signature {
        Some(cs) => cs.dataoff as usize,
        None => {
            let end = slice
                .linkedit
                .map(|le| (le.fileoff + le.filesize) as usize)
                .unwrap_or(slice.len);
            (end + 15) & !15
        }
    };
    let n_pages = provisional_limit.div_ceil(PAGE_SIZE);

    let strings = params.identifier.len() + 1 + params.team_id.map(|t| t.len() + 1).unwrap_or(0);
    let cd_size = |hash_len: usize| 88 + strings + 7 * hash_len + n_pages * hash_len;

    let cert_total: usize = std::iter::once(params.identity.certificate())
        .chain(params.identity.chain().iter())
        .map(|cert| cert.encode_der().map(|der| der.len()).unwrap_or(2048))
        .sum();

    12 + 6 * 8
        + cd_size(20)
        + cd_size(32)
        + requirements.len()
        + ent_blob.as_ref().map(|b| b.len()).unwrap_or(0)
        + der_blob.as_ref().map(|b| b.len()).unwrap_or(0)
        + CMS_BASE_ESTIMATE
        + cert_total
        + RESERVE_SLACK
}

/// Reassemble a fat container from signed slices.
fn rebuild_fat(aligns: &[u32], slices: &[Vec<u8>]) -> Vec<u8> {
    let header_size = 8 + slices.len() * 20;

    let mut offsets = Vec::with_capacity(slices.len());
    let mut cursor = header_size;
    for (i, slice) in slices.iter().enumerate() {
        let align = 1usize << aligns[i].min(20);
        cursor = (cursor + align - 1) & !(align - 1);
        offsets.push(cursor);
        cursor += slice.len();
    }

    let mut out = vec![0u8; cursor];
    out[0..4].copy_from_slice(&0xcafe_babe_u32.to_be_bytes());
    out[4..8].copy_from_slice(&(slices.len() as u32).to_be_bytes());

    for (i, slice) in slices.iter().enumerate() {
        // cputype/cpusubtype are read back out of each slice header so the
        // fat entries always match the slices they describe.
        let thin = MachOImage::parse(slice.clone()).ok();
        let (cpu_type, cpu_subtype) = thin
            .as_ref()
            .and_then(|t| t.slices().first().map(|s| (s.cpu_type, s.cpu_subtype)))
            .unwrap_or((0, 0));

        let entry = 8 + i * 20;
        out[entry..entry + 4].copy_from_slice(&cpu_type.to_be_bytes());
        out[entry + 4..entry + 8].copy_from_slice(&cpu_subtype.to_be_bytes());
        out[entry + 8..entry + 12].copy_from_slice(&(offsets[i] as u32).to_be_bytes());
        out[entry + 12..entry + 16].copy_from_slice(&(slice.len() as u32).to_be_bytes());
        out[entry + 16..entry + 20].copy_from_slice(&aligns[i].to_be_bytes());
        out[offsets[i]..offsets[i] + slice.len()].copy_from_slice(slice);
    }
    out
}
