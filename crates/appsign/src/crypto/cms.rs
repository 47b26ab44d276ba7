//! CMS signature generation.
//!
//! Produces the detached PKCS#7/CMS `SignedData` that binds the
//! CodeDirectory hashes. The encapsulated content is absent; the
//! `messageDigest` signed attribute covers the CDHashes plist, and two
//! Apple-specific signed attributes carry the hashes themselves:
//!
//! - `1.2.840.113635.100.9.1` — OCTET STRING holding an XML plist with the
//!   truncated CDHashes
//! - `1.2.840.113635.100.9.2` — SEQUENCE of the SHA-256 algorithm OID and
//!   the full SHA-256 CDHash
//!
//! The top-level `digestAlgorithms` set advertises both SHA-1 and SHA-256.
//! The builder only records algorithms its signers use, so the SHA-1
//! identifier is spliced into the encoded structure afterwards.

use crate::crypto::identity::SigningIdentity;
use crate::{Error, Result};
use bcder::encode::PrimitiveContent;
use bcder::{ConstOid, Mode, OctetString, Oid};
use bytes::Bytes;
use cryptographic_message_syntax::{SignedDataBuilder, SignerBuilder};
use x509_certificate::rfc5652::AttributeValue;

/// 1.2.840.113635.100.9.1 — CDHashes plist attribute.
const CDHASHES_PLIST_OID: ConstOid = Oid(&[42, 134, 72, 134, 247, 99, 100, 9, 1]);

/// 1.2.840.113635.100.9.2 — CDHash SHA-256 attribute.
const CDHASH_SHA256_OID: ConstOid = Oid(&[42, 134, 72, 134, 247, 99, 100, 9, 2]);

/// 2.16.840.1.101.3.4.2.1 — SHA-256 algorithm identifier.
const SHA256_OID: ConstOid = Oid(&[96, 134, 72, 1, 101, 3, 4, 2, 1]);

/// Encoded `AlgorithmIdentifier` for SHA-1 (OID 1.3.14.3.2.26, absent
/// parameters, matching how the builder encodes digest algorithms).
const SHA1_DIGEST_ALGORITHM: &[u8] = &[0x30, 0x07, 0x06, 0x05, 0x2b, 0x0e, 0x03, 0x02, 0x1a];

/// Build the CDHashes plist referenced by the signed attributes.
///
/// Both entries are 20 bytes: the SHA-1 CDHash of the primary
/// CodeDirectory and the SHA-256 CDHash of the alternate directory
/// truncated to SHA-1 length.
pub fn cdhashes_plist(cdhash_sha1: &[u8; 20], cdhash_sha256: &[u8; 32]) -> Result<Vec<u8>> {
    let mut dict = plist::Dictionary::new();
    dict.insert(
        "cdhashes".to_string(),
        plist::Value::Array(vec![
            plist::Value::Data(cdhash_sha1.to_vec()),
            plist::Value::Data(cdhash_sha256[..20].to_vec()),
        ]),
    );

    let mut buf = Vec::new();
    plist::to_writer_xml(&mut buf, &plist::Value::Dictionary(dict))?;
    buf.push(b'\n');
    Ok(buf)
}

/// Encode the 9.2 attribute value: `SEQUENCE { OID sha256, OCTET STRING hash }`.
fn cdhash_sha256_attribute(cdhash_sha256: &[u8; 32]) -> AttributeValue {
    let oid = Oid(Bytes::copy_from_slice(SHA256_OID.as_ref()));
    let hash = OctetString::new(Bytes::copy_from_slice(cdhash_sha256));
    let captured = bcder::Captured::from_values(
        Mode::Der,
        bcder::encode::sequence((oid.encode(), hash.encode())),
    );
    AttributeValue::new(captured)
}

/// Produce the DER-encoded detached `SignedData` for one CodeDirectory pair.
///
/// `cdhash_plist` is the plist from [`cdhashes_plist`]; the signature's
/// `messageDigest` attribute is its SHA-256. The signer's certificate chain
/// is embedded so verifiers can rebuild the path.
pub fn sign_cdhashes(
    identity: &SigningIdentity,
    cdhash_plist: &[u8],
    cdhash_sha256: &[u8; 32],
) -> Result<Vec<u8>> {
    let signer = SignerBuilder::new(identity.signer(), identity.certificate().clone())
        .message_id_content(cdhash_plist.to_vec())
        .signed_attribute_octet_string(
            Oid(Bytes::copy_from_slice(CDHASHES_PLIST_OID.as_ref())),
            cdhash_plist,
        )
        .signed_attribute(
            Oid(Bytes::copy_from_slice(CDHASH_SHA256_OID.as_ref())),
            vec![cdhash_sha256_attribute(cdhash_sha256)],
        );

    let der = SignedDataBuilder::default()
        .signer(signer)
        .certificate(identity.certificate().clone())
        .certificates(identity.chain().iter().cloned())
        .build_der()
        .map_err(|e| Error::Signing(e.to_string()))?;

    add_sha1_digest_algorithm(&der)
}

/// Read a DER header: `(tag, content_start, content_len)`.
fn der_header(data: &[u8], pos: usize) -> Result<(u8, usize, usize)> {
    let truncated = || Error::Signing("truncated CMS structure".into());
    let tag = *data.get(pos).ok_or_else(truncated)?;
    let first = *data.get(pos + 1).ok_or_else(truncated)?;
    if first & 0x80 == 0 {
        return Ok((tag, pos + 2, first as usize));
    }
    let n = (first & 0x7f) as usize;
    if n == 0 || n > 4 || pos + 2 + n > data.len() {
        return Err(truncated());
    }
    let mut len = 0usize;
    for i in 0..n {
        len = (len << 8) | data[pos + 2 + i] as usize;
    }
    Ok((tag, pos + 2 + n, len))
}

fn expect_tag(actual: u8, wanted: u8) -> Result<()> {
    if actual == wanted {
        Ok(())
    } else {
        Err(Error::Signing(format!(
            "unexpected CMS tag {:#04x}, wanted {:#04x}",
            actual, wanted
        )))
    }
}

/// Re-encode a definite-length DER TLV.
fn der_tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 6);
    out.push(tag);
    if content.len() < 128 {
        out.push(content.len() as u8);
    } else {
        let byte_count = (64 - (content.len() as u64).leading_zeros() as usize).div_ceil(8);
        out.push(0x80 | byte_count as u8);
        for i in (0..byte_count).rev() {
            out.push(((content.len() >> (i * 8)) & 0xff) as u8);
        }
    }
    out.extend(content);
    out
}

/// Splice the SHA-1 identifier into the `digestAlgorithms` set of an
/// encoded `ContentInfo`/`SignedData`, re-encoding the enclosing lengths.
///
/// Layout walked here (RFC 5652): `SEQUENCE { OID id-signedData,
/// [0] EXPLICIT SEQUENCE { INTEGER version, SET digestAlgorithms, … } }`.
/// SET elements stay sorted: the SHA-1 identifier orders before every
/// SHA-2 identifier.
fn add_sha1_digest_algorithm(der: &[u8]) -> Result<Vec<u8>> {
    let (tag, ci_start, _) = der_header(der, 0)?;
    expect_tag(tag, 0x30)?;

    let (tag, oid_start, oid_len) = der_header(der, ci_start)?;
    expect_tag(tag, 0x06)?;
    let explicit_at = oid_start + oid_len;
    let content_type = &der[ci_start..explicit_at];

    let (tag, sd_at, _) = der_header(der, explicit_at)?;
    expect_tag(tag, 0xa0)?;

    let (tag, sd_start, sd_len) = der_header(der, sd_at)?;
    expect_tag(tag, 0x30)?;
    let sd_end = sd_start + sd_len;
    if sd_end > der.len() {
        return Err(Error::Signing("truncated CMS structure".into()));
    }

    let (tag, ver_start, ver_len) = der_header(der, sd_start)?;
    expect_tag(tag, 0x02)?;
    let set_at = ver_start + ver_len;
    let version = &der[sd_start..set_at];

    let (tag, set_start, set_len) = der_header(der, set_at)?;
    expect_tag(tag, 0x31)?;
    let set_end = set_start + set_len;
    if set_end > sd_end {
        return Err(Error::Signing("truncated CMS structure".into()));
    }
    let algorithms = &der[set_start..set_end];
    if algorithms
        .windows(SHA1_DIGEST_ALGORITHM.len())
        .any(|w| w == SHA1_DIGEST_ALGORITHM)
    {
        return Ok(der.to_vec());
    }

    let mut new_algorithms = SHA1_DIGEST_ALGORITHM.to_vec();
    new_algorithms.extend(algorithms);

    let mut sd_content = version.to_vec();
    sd_content.extend(der_tlv(0x31, &new_algorithms));
    sd_content.extend(&der[set_end..sd_end]);

    let mut ci_content = content_type.to_vec();
    ci_content.extend(der_tlv(0xa0, &der_tlv(0x30, &sd_content)));
    Ok(der_tlv(0x30, &ci_content))
}
