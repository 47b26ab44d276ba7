//! Mach-O file parsing.
//!
//! Parses thin and fat (universal) binaries, 32- and 64-bit, both
//! endiannesses, into an arena model: [`MachOImage`] owns the backing
//! buffer; each [`ArchSlice`] carries offsets and lengths into it, never
//! pointers. Structural parsing is done with goblin; the spans recorded
//! here are what the editor and signer patch by hand.

use crate::{Error, Result};
use goblin::mach::header::{MH_CIGAM_64, MH_EXECUTE, MH_MAGIC_64};
use goblin::mach::load_command::CommandVariant;
use goblin::mach::{Mach, MachO};
use std::path::Path;

/// Mach-O load command numbers patched by this crate.
pub(crate) const LC_SEGMENT: u32 = 0x01;
pub(crate) const LC_SEGMENT_64: u32 = 0x19;
pub(crate) const LC_LOAD_DYLIB: u32 = 0x0c;
pub(crate) const LC_LOAD_WEAK_DYLIB: u32 = 0x8000_0018;
pub(crate) const LC_CODE_SIGNATURE: u32 = 0x1d;

/// A segment recorded during parsing.
#[derive(Debug, Clone, Copy)]
pub struct SegmentSpan {
    /// Offset of the segment load command within the slice.
    pub lc_offset: usize,
    /// Segment file offset (relative to the slice).
    pub fileoff: u64,
    /// Bytes occupied in the file.
    pub filesize: u64,
    /// Bytes occupied in memory.
    pub vmsize: u64,
}

/// The existing `LC_CODE_SIGNATURE` command, when present.
#[derive(Debug, Clone, Copy)]
pub struct CodeSignatureSpan {
    /// Offset of the load command within the slice.
    pub lc_offset: usize,
    /// Signature blob offset within the slice.
    pub dataoff: u32,
    /// Signature blob length.
    pub datasize: u32,
}

/// A dylib load command and its resolved path.
#[derive(Debug, Clone)]
pub struct DylibRef {
    /// Offset of the load command within the slice.
    pub lc_offset: usize,
    /// `LC_LOAD_DYLIB`, `LC_LOAD_WEAK_DYLIB` or `LC_REEXPORT_DYLIB`.
    pub cmd: u32,
    /// Total command size including the path string.
    pub cmdsize: u32,
    /// Referenced install path.
    pub path: String,
}

/// One architecture within a Mach-O file.
#[derive(Debug, Clone)]
pub struct ArchSlice {
    /// Byte offset of the slice within the enclosing file.
    pub offset: usize,
    /// Slice length in bytes.
    pub len: usize,
    /// CPU type from the Mach header.
    pub cpu_type: u32,
    /// CPU subtype from the Mach header.
    pub cpu_subtype: u32,
    /// Fat arch alignment as a power of two; page alignment for thin files.
    pub align: u32,
    /// 64-bit header and segment commands.
    pub is_64: bool,
    /// Integer fields are stored big-endian.
    pub big_endian: bool,
    /// Header filetype is `MH_EXECUTE`.
    pub is_executable: bool,
    /// Number of load commands.
    pub ncmds: u32,
    /// Total size of the load commands region.
    pub sizeofcmds: u32,
    /// Mach header size (28 or 32 bytes).
    pub header_size: usize,
    /// Free bytes between the last load command and the first section data.
    pub free_space: usize,
    /// `__TEXT` segment, when present.
    pub text: Option<SegmentSpan>,
    /// `__LINKEDIT` segment, when present.
    pub linkedit: Option<SegmentSpan>,
    /// Existing code signature command, when present.
    pub code_signature: Option<CodeSignatureSpan>,
    /// Every `LC_LOAD_DYLIB` / `LC_LOAD_WEAK_DYLIB` / `LC_REEXPORT_DYLIB`.
    pub dylibs: Vec<DylibRef>,
}

impl ArchSlice {
    /// End of the load-commands region, relative to the slice.
    pub fn load_commands_end(&self) -> usize {
        self.header_size + self.sizeofcmds as usize
    }

    /// File offset at which page hashing stops: the existing signature's
    /// start, or the slice end when unsigned.
    pub fn code_limit(&self) -> usize {
        match self.code_signature {
            Some(cs) => cs.dataoff as usize,
            None => self.len,
        }
    }
}

/// An in-memory Mach-O file: one thin slice or a fat container.
pub struct MachOImage {
    data: Vec<u8>,
    is_fat: bool,
    slices: Vec<ArchSlice>,
}

impl MachOImage {
    /// Read and parse a Mach-O file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        Self::parse(data)
    }

    /// Parse a Mach-O image from bytes, taking ownership of the buffer.
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        let mach = Mach::parse(&data)
            .map_err(|e| Error::MachO(format!("unrecognised header: {}", e)))?;

        let (is_fat, slices) = match mach {
            Mach::Binary(macho) => {
                let slice = parse_slice(&data, &macho, 0, data.len(), 12)?;
                (false, vec![slice])
            }
            Mach::Fat(fat) => {
                let mut slices = Vec::new();
                for (i, arch) in fat.iter_arches().enumerate() {
                    let arch = arch
                        .map_err(|e| Error::MachO(format!("fat arch {}: {}", i, e)))?;
                    let offset = arch.offset as usize;
                    let size = arch.size as usize;
                    if offset.checked_add(size).map_or(true, |end| end > data.len()) {
                        return Err(Error::MachO(format!(
                            "fat arch {} spans {}..{} beyond file length {}",
                            i,
                            offset,
                            offset + size,
                            data.len()
                        )));
                    }
                    let macho = MachO::parse(&data[offset..offset + size], 0)
                        .map_err(|e| Error::MachO(format!("fat arch {}: {}", i, e)))?;
                    slices.push(parse_slice(&data, &macho, offset, size, arch.align)?);
                }
                if slices.is_empty() {
                    return Err(Error::MachO("fat binary has no architectures".into()));
                }
                (true, slices)
            }
        };

        Ok(Self {
            data,
            is_fat,
            slices,
        })
    }

    /// The backing buffer, byte-identical to what was parsed.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consume the image, returning the backing buffer.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Mutable access for the editor; callers must re-parse after edits
    /// that change recorded spans.
    pub(crate) fn data_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    /// Whether this is a fat (universal) binary.
    pub fn is_fat(&self) -> bool {
        self.is_fat
    }

    /// Parsed architecture slices.
    pub fn slices(&self) -> &[ArchSlice] {
        &self.slices
    }

    /// Bytes of one slice.
    pub fn slice_bytes(&self, slice: &ArchSlice) -> &[u8] {
        &self.data[slice.offset..slice.offset + slice.len]
    }

    /// Re-parse the backing buffer, refreshing all recorded spans.
    pub(crate) fn reparse(&mut self) -> Result<()> {
        let data = std::mem::take(&mut self.data);
        *self = Self::parse(data)?;
        Ok(())
    }
}

/// Read a NUL-terminated string out of a load command.
fn read_lc_string(slice: &[u8], lc_offset: usize, cmdsize: usize, str_offset: usize) -> String {
    let start = lc_offset + str_offset;
    let end = (lc_offset + cmdsize).min(slice.len());
    if start >= end {
        return String::new();
    }
    let bytes = &slice[start..end];
    let nul = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..nul]).into_owned()
}

fn parse_slice(
    data: &[u8],
    macho: &MachO,
    offset: usize,
    len: usize,
    align: u32,
) -> Result<ArchSlice> {
    let slice = &data[offset..offset + len];
    let magic_bytes: [u8; 4] = slice[..4]
        .try_into()
        .map_err(|_| Error::MachO("slice shorter than a magic word".into()))?;
    let big_endian = matches!(
        magic_bytes,
        [0xfe, 0xed, 0xfa, 0xce] | [0xfe, 0xed, 0xfa, 0xcf]
    );
    let is_64 = macho.header.magic == MH_MAGIC_64 || macho.header.magic == MH_CIGAM_64;
    let header_size = if is_64 { 32 } else { 28 };

    let sizeofcmds = macho.header.sizeofcmds;
    let load_commands_end = header_size + sizeofcmds as usize;
    if load_commands_end > len {
        return Err(Error::MachO(format!(
            "load commands end at {} beyond slice length {}",
            load_commands_end, len
        )));
    }

    let mut text = None;
    let mut linkedit = None;
    let mut code_signature: Option<CodeSignatureSpan> = None;
    let mut dylibs = Vec::new();
    let mut first_data = len as u64;

    for lc in &macho.load_commands {
        match &lc.command {
            CommandVariant::Segment64(seg) => {
                let span = SegmentSpan {
                    lc_offset: lc.offset,
                    fileoff: seg.fileoff,
                    filesize: seg.filesize,
                    vmsize: seg.vmsize,
                };
                record_segment(
                    &mut text,
                    &mut linkedit,
                    &seg.segname,
                    span,
                    len,
                )?;
                // section_64 headers follow the command: 80 bytes each,
                // file offset at +48.
                for i in 0..seg.nsects as usize {
                    let sect = lc.offset + 72 + i * 80;
                    if sect + 80 <= load_commands_end {
                        let off = read_u32_at(slice, sect + 48, big_endian) as u64;
                        if off > 0 && off < first_data {
                            first_data = off;
                        }
                    }
                }
            }
            CommandVariant::Segment32(seg) => {
                let span = SegmentSpan {
                    lc_offset: lc.offset,
                    fileoff: seg.fileoff as u64,
                    filesize: seg.filesize as u64,
                    vmsize: seg.vmsize as u64,
                };
                record_segment(
                    &mut text,
                    &mut linkedit,
                    &seg.segname,
                    span,
                    len,
                )?;
                // section headers: 68 bytes each, file offset at +40.
                for i in 0..seg.nsects as usize {
                    let sect = lc.offset + 56 + i * 68;
                    if sect + 68 <= load_commands_end {
                        let off = read_u32_at(slice, sect + 40, big_endian) as u64;
                        if off > 0 && off < first_data {
                            first_data = off;
                        }
                    }
                }
            }
            CommandVariant::CodeSignature(cs) => {
                if code_signature.is_some() {
                    return Err(Error::MachO(
                        "more than one LC_CODE_SIGNATURE command".into(),
                    ));
                }
                if (cs.dataoff as usize)
                    .checked_add(cs.datasize as usize)
                    .map_or(true, |end| end > len)
                {
                    return Err(Error::MachO(format!(
                        "code signature spans {}..{} beyond slice length {}",
                        cs.dataoff,
                        cs.dataoff as u64 + cs.datasize as u64,
                        len
                    )));
                }
                code_signature = Some(CodeSignatureSpan {
                    lc_offset: lc.offset,
                    dataoff: cs.dataoff,
                    datasize: cs.datasize,
                });
            }
            CommandVariant::LoadDylib(dc)
            | CommandVariant::LoadWeakDylib(dc)
            | CommandVariant::ReexportDylib(dc) => {
                dylibs.push(DylibRef {
                    lc_offset: lc.offset,
                    cmd: dc.cmd,
                    cmdsize: dc.cmdsize,
                    path: read_lc_string(
                        slice,
                        lc.offset,
                        dc.cmdsize as usize,
                        dc.dylib.name as usize,
                    ),
                });
            }
            _ => {}
        }
    }

    // Without section data the first segment with a non-zero file offset
    // bounds the load-command region.
    if first_data == len as u64 {
        for span in [text.as_ref(), linkedit.as_ref()].into_iter().flatten() {
            if span.fileoff > 0 && span.fileoff < first_data {
                first_data = span.fileoff;
            }
        }
    }

    let free_space = (first_data as usize).saturating_sub(load_commands_end);

    Ok(ArchSlice {
        offset,
        len,
        cpu_type: macho.header.cputype as u32,
        cpu_subtype: macho.header.cpusubtype as u32,
        align,
        is_64,
        big_endian,
        is_executable: macho.header.filetype == MH_EXECUTE,
        ncmds: macho.header.ncmds as u32,
        sizeofcmds,
        header_size,
        free_space,
        text,
        linkedit,
        code_signature,
        dylibs,
    })
}

fn record_segment(
    text: &mut Option<SegmentSpan>,
    linkedit: &mut Option<SegmentSpan>,
    segname: &[u8; 16],
    span: SegmentSpan,
    slice_len: usize,
) -> Result<()> {
    if span
        .fileoff
        .checked_add(span.filesize)
        .map_or(true, |end| end > slice_len as u64)
    {
        return Err(Error::MachO(format!(
            "segment spans {}..{} beyond slice length {}",
            span.fileoff,
            span.fileoff + span.filesize,
            slice_len
        )));
    }
    if segname.starts_with(b"__TEXT\0") {
        *text = Some(span);
    } else if segname.starts_with(b"__LINKEDIT\0") {
        *linkedit = Some(span);
    }
    Ok(())
}

/// Read a u32 honouring the slice's endianness.
pub(crate) fn read_u32_at(data: &[u8], offset: usize, big_endian: bool) -> u32 {
    let bytes: [u8; 4] = data[offset..offset + 4]
        .try_into()
        .expect("caller bounds-checked");
    if big_endian {
        u32::from_be_bytes(bytes)
    } else {
        u32::from_le_bytes(bytes)
    }
}

/// Write a u32 honouring the slice's endianness.
pub(crate) fn write_u32_at(data: &mut [u8], offset: usize, value: u32, big_endian: bool) {
    let bytes = if big_endian {
        value.to_be_bytes()
    } else {
        value.to_le_bytes()
    };
    data[offset..offset + 4].copy_from_slice(&bytes);
}

/// Read a u64 honouring the slice's endianness.
pub(crate) fn read_u64_at(data: &[u8], offset: usize, big_endian: bool) -> u64 {
    let bytes: [u8; 8] = data[offset..offset + 8]
        .try_into()
        .expect("caller bounds-checked");
    if big_endian {
        u64::from_be_bytes(bytes)
    } else {
        u64::from_le_bytes(bytes)
    }
}

/// Write a u64 honouring the slice's endianness.
pub(crate) fn write_u64_at(data: &mut [u8], offset: usize, value: u64, big_endian: bool) {
    let bytes = if big_endian {
        value.to_be_bytes()
    } else {
        value.to_le_bytes()
    };
    data[offset..offset + 8].copy_from_slice(&bytes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macho::testutil::{fat_image, thin_image, ThinSpec};

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(MachOImage::parse(vec![0u8; 64]).is_err());
    }

    #[test]
    fn test_parse_thin_arm64() {
        let data = thin_image(&ThinSpec::default());
        let image = MachOImage::parse(data).unwrap();
        assert!(!image.is_fat());
        assert_eq!(image.slices().len(), 1);

        let slice = &image.slices()[0];
        assert!(slice.is_64);
        assert!(!slice.big_endian);
        assert!(slice.is_executable);
        assert_eq!(slice.header_size, 32);
        assert!(slice.text.is_some());
        assert!(slice.linkedit.is_some());
        assert!(slice.code_signature.is_none());
    }

    #[test]
    fn test_round_trip_is_byte_identical() {
        let data = thin_image(&ThinSpec::default());
        let image = MachOImage::parse(data.clone()).unwrap();
        assert_eq!(image.data(), data.as_slice());
        assert_eq!(image.into_data(), data);
    }

    #[test]
    fn test_free_space_measured_from_first_section() {
        let spec = ThinSpec {
            free_space: 128,
            ..Default::default()
        };
        let data = thin_image(&spec);
        let image = MachOImage::parse(data).unwrap();
        assert_eq!(image.slices()[0].free_space, 128);
    }

    #[test]
    fn test_parse_fat_two_slices() {
        let a = thin_image(&ThinSpec::default());
        let b = thin_image(&ThinSpec {
            cpu_type: 0x0000_000c, // CPU_TYPE_ARM
            is_64: false,
            ..Default::default()
        });
        let data = fat_image(&[a.clone(), b.clone()]);
        let image = MachOImage::parse(data).unwrap();

        assert!(image.is_fat());
        assert_eq!(image.slices().len(), 2);
        let s0 = &image.slices()[0];
        let s1 = &image.slices()[1];
        assert!(s0.is_64);
        assert!(!s1.is_64);
        assert_eq!(image.slice_bytes(s0), a.as_slice());
        assert_eq!(image.slice_bytes(s1), b.as_slice());
    }

    #[test]
    fn test_fat_round_trip_is_byte_identical() {
        let a = thin_image(&ThinSpec::default());
        let data = fat_image(&[a]);
        let image = MachOImage::parse(data.clone()).unwrap();
        assert_eq!(image.data(), data.as_slice());
    }

    #[test]
    fn test_truncated_fat_arch_rejected() {
        let a = thin_image(&ThinSpec::default());
        let mut data = fat_image(&[a]);
        data.truncate(data.len() - 64);
        assert!(MachOImage::parse(data).is_err());
    }

    #[test]
    fn test_dylib_paths_recorded() {
        let spec = ThinSpec {
            dylibs: vec![
                ("/usr/lib/libSystem.B.dylib".into(), false),
                ("@rpath/libswiftCore.dylib".into(), true),
            ],
            ..Default::default()
        };
        let data = thin_image(&spec);
        let image = MachOImage::parse(data).unwrap();
        let slice = &image.slices()[0];
        let paths: Vec<_> = slice.dylibs.iter().map(|d| d.path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["/usr/lib/libSystem.B.dylib", "@rpath/libswiftCore.dylib"]
        );
        assert_eq!(slice.dylibs[0].cmd, LC_LOAD_DYLIB);
        assert_eq!(slice.dylibs[1].cmd, LC_LOAD_WEAK_DYLIB);
    }

    #[test]
    fn test_parse_big_endian_32bit_slice() {
        let data = thin_image(&ThinSpec {
            cpu_type: 0x12, // CPU_TYPE_POWERPC
            is_64: false,
            big_endian: true,
            ..Default::default()
        });
        let image = MachOImage::parse(data).unwrap();
        let slice = &image.slices()[0];
        assert!(slice.big_endian);
        assert!(!slice.is_64);
        assert_eq!(slice.header_size, 28);
        assert_eq!(slice.free_space, 0x200);
        assert!(slice.text.is_some());
        assert!(slice.linkedit.is_some());
    }

    #[test]
    fn test_code_limit_without_signature_is_slice_len() {
        let data = thin_image(&ThinSpec::default());
        let image = MachOImage::parse(data).unwrap();
        let slice = &image.slices()[0];
        assert_eq!(slice.code_limit(), slice.len);
    }

    #[test]
    fn test_endian_helpers() {
        let mut buf = vec![0u8; 8];
        write_u32_at(&mut buf, 0, 0x1234_5678, false);
        assert_eq!(&buf[..4], &[0x78, 0x56, 0x34, 0x12]);
        assert_eq!(read_u32_at(&buf, 0, false), 0x1234_5678);

        write_u32_at(&mut buf, 0, 0x1234_5678, true);
        assert_eq!(&buf[..4], &[0x12, 0x34, 0x56, 0x78]);
        assert_eq!(read_u32_at(&buf, 0, true), 0x1234_5678);

        write_u64_at(&mut buf, 0, 0x0102_0304_0506_0708, true);
        assert_eq!(read_u64_at(&buf, 0, true), 0x0102_0304_0506_0708);
    }
}
