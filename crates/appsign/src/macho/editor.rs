//! In-place Mach-O load-command surgery.
//!
//! All edits are raw byte patches routed through the endian helpers in
//! [`parser`], applied to every architecture slice of an image. After each
//! operation the image is re-parsed so the recorded spans stay accurate.
//!
//! Invariants maintained by every edit: load commands stay contiguous,
//! `sizeofcmds` equals the sum of all command sizes, and segment offsets
//! keep their on-disk relationships.

use super::parser::{
    read_u32_at, write_u32_at, write_u64_at, ArchSlice, MachOImage, LC_CODE_SIGNATURE,
    LC_LOAD_DYLIB, LC_LOAD_WEAK_DYLIB, LC_SEGMENT, LC_SEGMENT_64,
};
use crate::{Error, Result};
use std::collections::BTreeSet;

/// sizeof(dylib_command): cmd, cmdsize, name offset, timestamp, two versions.
const DYLIB_COMMAND_SIZE: usize = 24;

/// sizeof(linkedit_data_command).
const LINKEDIT_DATA_COMMAND_SIZE: usize = 16;

/// ncmds / sizeofcmds offsets within the Mach header (same for 32/64-bit).
const NCMDS_OFFSET: usize = 16;
const SIZEOFCMDS_OFFSET: usize = 20;

fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Byte span of every load command in a slice: `(abs_offset, cmd, cmdsize)`.
fn command_ranges(data: &[u8], slice: &ArchSlice) -> Vec<(usize, u32, u32)> {
    let mut out = Vec::with_capacity(slice.ncmds as usize);
    let mut offset = slice.offset + slice.header_size;
    let end = slice.offset + slice.load_commands_end();
    for _ in 0..slice.ncmds {
        if offset + 8 > end {
            break;
        }
        let cmd = read_u32_at(data, offset, slice.big_endian);
        let cmdsize = read_u32_at(data, offset + 4, slice.big_endian);
        if cmdsize < 8 || offset + cmdsize as usize > end {
            break;
        }
        out.push((offset, cmd, cmdsize));
        offset += cmdsize as usize;
    }
    out
}

fn bump_header(
    data: &mut [u8],
    slice: &ArchSlice,
    ncmds_delta: i32,
    sizeofcmds_delta: i32,
) {
    let ncmds_at = slice.offset + NCMDS_OFFSET;
    let size_at = slice.offset + SIZEOFCMDS_OFFSET;
    let ncmds = read_u32_at(data, ncmds_at, slice.big_endian);
    let size = read_u32_at(data, size_at, slice.big_endian);
    write_u32_at(
        data,
        ncmds_at,
        ncmds.wrapping_add_signed(ncmds_delta),
        slice.big_endian,
    );
    write_u32_at(
        data,
        size_at,
        size.wrapping_add_signed(sizeofcmds_delta),
        slice.big_endian,
    );
}

/// Install paths referenced by the first slice, in load-command order.
pub fn list_dylibs(image: &MachOImage) -> Vec<String> {
    image
        .slices()
        .first()
        .map(|slice| slice.dylibs.iter().map(|d| d.path.clone()).collect())
        .unwrap_or_default()
}

/// Append an `LC_LOAD_DYLIB` (or weak variant) referencing `path`.
///
/// Applies to every slice. Returns `false` without modifying anything when
/// every slice already references `path`. Fails with
/// [`Error::NoLoadCommandSpace`] if any slice lacks room; no slice is
/// modified in that case.
pub fn inject_dylib(image: &mut MachOImage, path: &str, weak: bool) -> Result<bool> {
    let cmdsize = DYLIB_COMMAND_SIZE + round_up(path.len() + 1, 8);

    // Plan before patching so a failure leaves the image untouched.
    let mut targets = Vec::new();
    for (idx, slice) in image.slices().iter().enumerate() {
        if slice.dylibs.iter().any(|d| d.path == path) {
            continue;
        }
        if cmdsize >= slice.free_space {
            return Err(Error::NoLoadCommandSpace {
                needed: cmdsize,
                available: slice.free_space,
            });
        }
        targets.push(idx);
    }
    if targets.is_empty() {
        return Ok(false);
    }

    let slices = image.slices().to_vec();
    let data = image.data_mut();
    for idx in &targets {
        let slice = &slices[*idx];
        let at = slice.offset + slice.load_commands_end();
        let cmd = if weak {
            LC_LOAD_WEAK_DYLIB
        } else {
            LC_LOAD_DYLIB
        };
        write_u32_at(data, at, cmd, slice.big_endian);
        write_u32_at(data, at + 4, cmdsize as u32, slice.big_endian);
        write_u32_at(data, at + 8, DYLIB_COMMAND_SIZE as u32, slice.big_endian);
        write_u32_at(data, at + 12, 2, slice.big_endian); // timestamp
        write_u32_at(data, at + 16, 0x0001_0000, slice.big_endian);
        write_u32_at(data, at + 20, 0x0001_0000, slice.big_endian);

        let str_at = at + DYLIB_COMMAND_SIZE;
        data[str_at..str_at + path.len()].copy_from_slice(path.as_bytes());
        for b in &mut data[str_at + path.len()..at + cmdsize] {
            *b = 0;
        }

        bump_header(data, slice, 1, cmdsize as i32);
    }

    image.reparse()?;
    Ok(true)
}

/// Remove every dylib load command whose path basename is in `names`.
///
/// Later commands shift down and the freed tail is zero-filled, so the
/// region stays contiguous. Returns `true` if anything was removed.
pub fn remove_dylibs(image: &mut MachOImage, names: &BTreeSet<String>) -> Result<bool> {
    let slices = image.slices().to_vec();
    let mut removed_any = false;

    for slice in &slices {
        let ranges = command_ranges(image.data(), slice);
        let doomed: Vec<(usize, u32, u32)> = ranges
            .iter()
            .copied()
            .filter(|(offset, cmd, cmdsize)| {
                if *cmd != LC_LOAD_DYLIB && *cmd != LC_LOAD_WEAK_DYLIB {
                    return false;
                }
                let data = image.data();
                let name_off = read_u32_at(data, offset + 8, slice.big_endian) as usize;
                let bytes = &data[offset + name_off..offset + *cmdsize as usize];
                let nul = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
                let path = String::from_utf8_lossy(&bytes[..nul]).into_owned();
                names.contains(basename(&path))
            })
            .collect();

        if doomed.is_empty() {
            continue;
        }
        removed_any = true;

        // Rebuild the load-command region without the doomed commands.
        let region_start = slice.offset + slice.header_size;
        let region_end = slice.offset + slice.load_commands_end();
        let mut kept = Vec::with_capacity(slice.sizeofcmds as usize);
        for (offset, _, cmdsize) in &ranges {
            if doomed.iter().any(|(d, _, _)| d == offset) {
                continue;
            }
            kept.extend_from_slice(&image.data()[*offset..*offset + *cmdsize as usize]);
        }

        let removed_bytes: u32 = doomed.iter().map(|(_, _, s)| *s).sum();
        let data = image.data_mut();
        data[region_start..region_start + kept.len()].copy_from_slice(&kept);
        for b in &mut data[region_start + kept.len()..region_end] {
            *b = 0;
        }
        bump_header(data, slice, -(doomed.len() as i32), -(removed_bytes as i32));
    }

    if removed_any {
        image.reparse()?;
    }
    Ok(removed_any)
}

/// Rewrite the install path of the dylib command referencing `old`.
///
/// Done in place when the new path fits in the existing command; otherwise
/// later commands shift up, which requires free space for the growth.
/// Returns `true` if any slice referenced `old`.
pub fn change_dylib_path(image: &mut MachOImage, old: &str, new: &str) -> Result<bool> {
    let slices = image.slices().to_vec();
    let mut changed_any = false;

    // Validate growth against free space on every slice before patching.
    for slice in &slices {
        if let Some(dylib) = slice.dylibs.iter().find(|d| d.path == old) {
            let fits = DYLIB_COMMAND_SIZE + new.len() + 1 <= dylib.cmdsize as usize;
            if !fits {
                let new_cmdsize = DYLIB_COMMAND_SIZE + round_up(new.len() + 1, 8);
                let growth = new_cmdsize - dylib.cmdsize as usize;
                if growth >= slice.free_space {
                    return Err(Error::NoLoadCommandSpace {
                        needed: growth,
                        available: slice.free_space,
                    });
                }
            }
        }
    }

    for slice in &slices {
        let Some(dylib) = slice.dylibs.iter().find(|d| d.path == old).cloned() else {
            continue;
        };
        changed_any = true;
        let at = slice.offset + dylib.lc_offset;
        let old_cmdsize = dylib.cmdsize as usize;

        if DYLIB_COMMAND_SIZE + new.len() + 1 <= old_cmdsize {
            // New string fits: overwrite in place, keep cmdsize.
            let data = image.data_mut();
            let str_at = at + DYLIB_COMMAND_SIZE;
            data[str_at..str_at + new.len()].copy_from_slice(new.as_bytes());
            for b in &mut data[str_at + new.len()..at + old_cmdsize] {
                *b = 0;
            }
        } else {
            let new_cmdsize = DYLIB_COMMAND_SIZE + round_up(new.len() + 1, 8);
            let growth = new_cmdsize - old_cmdsize;
            let region_end = slice.offset + slice.load_commands_end();
            let data = image.data_mut();

            // Shift everything after this command up by the growth.
            data.copy_within(at + old_cmdsize..region_end, at + new_cmdsize);

            write_u32_at(data, at + 4, new_cmdsize as u32, slice.big_endian);
            let str_at = at + DYLIB_COMMAND_SIZE;
            data[str_at..str_at + new.len()].copy_from_slice(new.as_bytes());
            for b in &mut data[str_at + new.len()..at + new_cmdsize] {
                *b = 0;
            }
            bump_header(data, slice, 0, growth as i32);
        }
    }

    if changed_any {
        image.reparse()?;
    }
    Ok(changed_any)
}

/// Ensure the slice can hold a signature blob of `required` bytes.
///
/// Works on a thin image (one slice). Creates the `LC_CODE_SIGNATURE`
/// command if absent, verifies `__LINKEDIT` is the last segment by file
/// offset, grows its `filesize`/`vmsize` and the backing buffer, and
/// returns the 16-byte-aligned offset where the SuperBlob will be written.
pub(crate) fn reserve_signature_space(image: &mut MachOImage, required: usize) -> Result<u32> {
    let slice = image.slices()[0].clone();
    let big_endian = slice.big_endian;

    let linkedit = slice
        .linkedit
        .ok_or_else(|| Error::MachO("no __LINKEDIT segment".into()))?;

    // The signature lives at the end of __LINKEDIT, which must be the last
    // segment by file offset.
    for (offset, cmd, _) in command_ranges(image.data(), &slice) {
        if cmd == LC_SEGMENT || cmd == LC_SEGMENT_64 {
            let fileoff = if slice.is_64 {
                super::parser::read_u64_at(image.data(), offset + 40, big_endian)
            } else {
                read_u32_at(image.data(), offset + 32, big_endian) as u64
            };
            if fileoff > linkedit.fileoff {
                return Err(Error::MachO(
                    "__LINKEDIT is not the last segment by file offset".into(),
                ));
            }
        }
    }

    // Page hashing stops where the signature begins; reuse the existing
    // offset so repeated signings stay stable.
    let sig_offset = match slice.code_signature {
        Some(cs) => cs.dataoff as usize,
        None => round_up((linkedit.fileoff + linkedit.filesize) as usize, 16),
    };
    let reserved = round_up(required, 16);

    match slice.code_signature {
        Some(cs) => {
            let at = slice.offset + cs.lc_offset;
            let data = image.data_mut();
            write_u32_at(data, at + 8, sig_offset as u32, big_endian);
            write_u32_at(data, at + 12, reserved as u32, big_endian);
        }
        None => {
            if LINKEDIT_DATA_COMMAND_SIZE >= slice.free_space {
                return Err(Error::NoLoadCommandSpace {
                    needed: LINKEDIT_DATA_COMMAND_SIZE,
                    available: slice.free_space,
                });
            }
            let at = slice.offset + slice.load_commands_end();
            let data = image.data_mut();
            write_u32_at(data, at, LC_CODE_SIGNATURE, big_endian);
            write_u32_at(data, at + 4, LINKEDIT_DATA_COMMAND_SIZE as u32, big_endian);
            write_u32_at(data, at + 8, sig_offset as u32, big_endian);
            write_u32_at(data, at + 12, reserved as u32, big_endian);
            bump_header(data, &slice, 1, LINKEDIT_DATA_COMMAND_SIZE as i32);
        }
    }

    // Grow __LINKEDIT to cover the reservation.
    let new_filesize = (sig_offset + reserved) as u64 - linkedit.fileoff;
    let new_vmsize = round_up(new_filesize as usize, 0x1000) as u64;
    let lc_at = slice.offset + linkedit.lc_offset;
    let data = image.data_mut();
    if slice.is_64 {
        write_u64_at(data, lc_at + 32, new_vmsize, big_endian);
        write_u64_at(data, lc_at + 48, new_filesize, big_endian);
    } else {
        write_u32_at(data, lc_at + 28, new_vmsize as u32, big_endian);
        write_u32_at(data, lc_at + 36, new_filesize as u32, big_endian);
    }

    let new_len = slice.offset + sig_offset + reserved;
    data.resize(new_len, 0);
    // Zero the reserved region; stale signature bytes must not survive.
    for b in &mut data[slice.offset + sig_offset..new_len] {
        *b = 0;
    }

    image.reparse()?;
    Ok(sig_offset as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macho::testutil::{thin_image, ThinSpec};

    fn parse(spec: &ThinSpec) -> MachOImage {
        MachOImage::parse(thin_image(spec)).unwrap()
    }

    #[test]
    fn test_inject_appends_command() {
        let mut image = parse(&ThinSpec::default());
        let before = image.slices()[0].clone();

        assert!(inject_dylib(&mut image, "@rpath/libhook.dylib", false).unwrap());

        let after = &image.slices()[0];
        assert_eq!(after.ncmds, before.ncmds + 1);
        assert_eq!(
            after.sizeofcmds as usize,
            before.sizeofcmds as usize + 24 + 24
        );
        assert_eq!(after.dylibs.len(), 1);
        assert_eq!(after.dylibs[0].path, "@rpath/libhook.dylib");
        assert_eq!(after.dylibs[0].cmd, LC_LOAD_DYLIB);
    }

    #[test]
    fn test_inject_weak_uses_weak_command() {
        let mut image = parse(&ThinSpec::default());
        inject_dylib(&mut image, "@rpath/libweak.dylib", true).unwrap();
        assert_eq!(image.slices()[0].dylibs[0].cmd, LC_LOAD_WEAK_DYLIB);
    }

    #[test]
    fn test_inject_existing_is_noop() {
        let mut image = parse(&ThinSpec {
            dylibs: vec![("@rpath/libhook.dylib".into(), false)],
            ..Default::default()
        });
        let before = image.data().to_vec();
        assert!(!inject_dylib(&mut image, "@rpath/libhook.dylib", false).unwrap());
        assert_eq!(image.data(), before.as_slice());
    }

    #[test]
    fn test_inject_without_space_fails() {
        // 24-byte command header + 24 bytes of path storage does not fit
        // into 48 free bytes.
        let mut image = parse(&ThinSpec {
            free_space: 48,
            ..Default::default()
        });
        let before = image.data().to_vec();
        let err = inject_dylib(&mut image, "@rpath/libfoo.dylib", false).unwrap_err();
        assert!(matches!(
            err,
            Error::NoLoadCommandSpace {
                needed: 48,
                available: 48
            }
        ));
        assert_eq!(image.data(), before.as_slice());
    }

    #[test]
    fn test_inject_into_big_endian_slice() {
        let mut image = parse(&ThinSpec {
            cpu_type: 0x12,
            is_64: false,
            big_endian: true,
            ..Default::default()
        });
        inject_dylib(&mut image, "@rpath/libbe.dylib", false).unwrap();
        assert_eq!(list_dylibs(&image), vec!["@rpath/libbe.dylib"]);
        assert!(image.slices()[0].big_endian);
    }

    #[test]
    fn test_inject_then_remove_restores_region() {
        let spec = ThinSpec::default();
        let original = thin_image(&spec);
        let mut image = MachOImage::parse(original.clone()).unwrap();

        inject_dylib(&mut image, "@rpath/libfoo.dylib", false).unwrap();
        let names: BTreeSet<String> = ["libfoo.dylib".to_string()].into();
        assert!(remove_dylibs(&mut image, &names).unwrap());

        assert_eq!(image.data(), original.as_slice());
    }

    #[test]
    fn test_remove_matches_basename() {
        let mut image = parse(&ThinSpec {
            dylibs: vec![
                ("/usr/lib/libSystem.B.dylib".into(), false),
                ("@rpath/libfoo.dylib".into(), false),
            ],
            ..Default::default()
        });
        let names: BTreeSet<String> = ["libfoo.dylib".to_string()].into();
        assert!(remove_dylibs(&mut image, &names).unwrap());

        let paths = list_dylibs(&image);
        assert_eq!(paths, vec!["/usr/lib/libSystem.B.dylib"]);
    }

    #[test]
    fn test_remove_missing_is_noop() {
        let mut image = parse(&ThinSpec::default());
        let before = image.data().to_vec();
        let names: BTreeSet<String> = ["libabsent.dylib".to_string()].into();
        assert!(!remove_dylibs(&mut image, &names).unwrap());
        assert_eq!(image.data(), before.as_slice());
    }

    #[test]
    fn test_remove_keeps_later_commands_parseable() {
        let mut image = parse(&ThinSpec {
            dylibs: vec![
                ("@rpath/liba.dylib".into(), false),
                ("@rpath/libb.dylib".into(), false),
                ("@rpath/libc.dylib".into(), false),
            ],
            ..Default::default()
        });
        let names: BTreeSet<String> = ["libb.dylib".to_string()].into();
        remove_dylibs(&mut image, &names).unwrap();

        let paths = list_dylibs(&image);
        assert_eq!(paths, vec!["@rpath/liba.dylib", "@rpath/libc.dylib"]);
        // __LINKEDIT still resolves after the shift
        assert!(image.slices()[0].linkedit.is_some());
    }

    #[test]
    fn test_change_path_in_place() {
        let mut image = parse(&ThinSpec {
            dylibs: vec![("@rpath/liblongname.dylib".into(), false)],
            ..Default::default()
        });
        let sizeofcmds = image.slices()[0].sizeofcmds;

        assert!(change_dylib_path(&mut image, "@rpath/liblongname.dylib", "@rpath/lib.dylib")
            .unwrap());

        assert_eq!(list_dylibs(&image), vec!["@rpath/lib.dylib"]);
        assert_eq!(image.slices()[0].sizeofcmds, sizeofcmds);
    }

    #[test]
    fn test_change_path_grows_command() {
        let mut image = parse(&ThinSpec {
            dylibs: vec![("@rpath/a.dylib".into(), false)],
            ..Default::default()
        });
        let sizeofcmds = image.slices()[0].sizeofcmds;
        let long = "@rpath/a-very-long-replacement-name.dylib";

        assert!(change_dylib_path(&mut image, "@rpath/a.dylib", long).unwrap());

        assert_eq!(list_dylibs(&image), vec![long.to_string()]);
        assert!(image.slices()[0].sizeofcmds > sizeofcmds);
        // Commands after the grown one survive the shift
        assert!(image.slices()[0].linkedit.is_some());
    }

    #[test]
    fn test_change_path_growth_without_space_fails() {
        let mut image = parse(&ThinSpec {
            free_space: 8,
            dylibs: vec![("@rpath/a.dylib".into(), false)],
            ..Default::default()
        });
        let result = change_dylib_path(
            &mut image,
            "@rpath/a.dylib",
            "@rpath/a-very-long-replacement-name.dylib",
        );
        assert!(matches!(result, Err(Error::NoLoadCommandSpace { .. })));
    }

    #[test]
    fn test_change_path_missing_returns_false() {
        let mut image = parse(&ThinSpec::default());
        assert!(!change_dylib_path(&mut image, "@rpath/x.dylib", "@rpath/y.dylib").unwrap());
    }

    #[test]
    fn test_reserve_creates_signature_command() {
        let mut image = parse(&ThinSpec::default());
        let linkedit_end = {
            let le = image.slices()[0].linkedit.unwrap();
            (le.fileoff + le.filesize) as usize
        };

        let offset = reserve_signature_space(&mut image, 0x1000).unwrap();

        assert_eq!(offset as usize, round_up(linkedit_end, 16));
        let slice = &image.slices()[0];
        let cs = slice.code_signature.unwrap();
        assert_eq!(cs.dataoff, offset);
        assert_eq!(cs.datasize, 0x1000);
        assert_eq!(image.data().len(), offset as usize + 0x1000);
        let le = slice.linkedit.unwrap();
        assert_eq!(le.fileoff + le.filesize, image.data().len() as u64);
    }

    #[test]
    fn test_reserve_reuses_existing_offset() {
        let mut image = parse(&ThinSpec::default());
        let first = reserve_signature_space(&mut image, 0x1000).unwrap();
        let second = reserve_signature_space(&mut image, 0x2000).unwrap();
        assert_eq!(first, second);
        assert_eq!(image.slices()[0].code_signature.unwrap().datasize, 0x2000);
        assert_eq!(image.data().len(), second as usize + 0x2000);
    }

    #[test]
    fn test_reserve_rounds_to_sixteen() {
        let mut image = parse(&ThinSpec::default());
        reserve_signature_space(&mut image, 0x1001).unwrap();
        assert_eq!(image.slices()[0].code_signature.unwrap().datasize, 0x1010);
    }

    #[test]
    fn test_reserve_zeroes_reserved_region() {
        let mut image = parse(&ThinSpec::default());
        let offset = reserve_signature_space(&mut image, 64).unwrap();
        // Write junk, shrink-grow again, verify it is cleared.
        let at = offset as usize;
        image.data_mut()[at..at + 64].fill(0x5a);
        reserve_signature_space(&mut image, 64).unwrap();
        assert!(image.data()[at..at + 64].iter().all(|&b| b == 0));
    }
}
