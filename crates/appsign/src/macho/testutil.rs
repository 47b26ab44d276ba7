//! Synthetic Mach-O builders for tests.
//!
//! Produces minimal but structurally valid binaries: a header, a `__TEXT`
//! segment with one section (whose file offset defines the free
//! load-command space), optional dylib load commands, and a trailing
//! `__LINKEDIT` segment.

/// Parameters for a synthetic thin Mach-O.
pub struct ThinSpec {
    pub cpu_type: u32,
    pub cpu_subtype: u32,
    pub is_64: bool,
    pub big_endian: bool,
    pub executable: bool,
    pub text_size: usize,
    pub linkedit_size: usize,
    pub free_space: usize,
    pub dylibs: Vec<(String, bool)>,
}

impl Default for ThinSpec {
    fn default() -> Self {
        Self {
            cpu_type: 0x0100_000c, // CPU_TYPE_ARM64
            cpu_subtype: 0,
            is_64: true,
            big_endian: false,
            executable: true,
            text_size: 0x4000,
            linkedit_size: 0x100,
            free_space: 0x200,
            dylibs: Vec::new(),
        }
    }
}

struct Writer {
    buf: Vec<u8>,
    be: bool,
}

impl Writer {
    fn u32(&mut self, v: u32) {
        if self.be {
            self.buf.extend(v.to_be_bytes());
        } else {
            self.buf.extend(v.to_le_bytes());
        }
    }

    fn u64(&mut self, v: u64) {
        if self.be {
            self.buf.extend(v.to_be_bytes());
        } else {
            self.buf.extend(v.to_le_bytes());
        }
    }

    fn name16(&mut self, name: &[u8]) {
        let mut field = [0u8; 16];
        field[..name.len()].copy_from_slice(name);
        self.buf.extend(field);
    }
}

fn round_up(v: usize, align: usize) -> usize {
    (v + align - 1) & !(align - 1)
}

/// Build a thin Mach-O per `spec`.
pub fn thin_image(spec: &ThinSpec) -> Vec<u8> {
    let header_size = if spec.is_64 { 32 } else { 28 };
    let seg_cmd_size = if spec.is_64 { 72 } else { 56 };
    let sect_size = if spec.is_64 { 80 } else { 68 };
    let dylib_cmd_sizes: Vec<usize> = spec
        .dylibs
        .iter()
        .map(|(path, _)| 24 + round_up(path.len() + 1, 8))
        .collect();

    let sizeofcmds = seg_cmd_size + sect_size // __TEXT + one section
        + dylib_cmd_sizes.iter().sum::<usize>()
        + seg_cmd_size; // __LINKEDIT
    let ncmds = 2 + spec.dylibs.len();
    let first_data = header_size + sizeofcmds + spec.free_space;
    assert!(first_data <= spec.text_size, "text segment too small");

    let mut w = Writer {
        buf: Vec::with_capacity(spec.text_size + spec.linkedit_size),
        be: spec.big_endian,
    };

    // mach_header
    w.u32(if spec.is_64 { 0xfeed_facf } else { 0xfeed_face });
    w.u32(spec.cpu_type);
    w.u32(spec.cpu_subtype);
    w.u32(if spec.executable { 2 } else { 6 }); // MH_EXECUTE / MH_DYLIB
    w.u32(ncmds as u32);
    w.u32(sizeofcmds as u32);
    w.u32(0); // flags
    if spec.is_64 {
        w.u32(0); // reserved
    }

    // __TEXT segment with one __text section
    w.u32(if spec.is_64 { 0x19 } else { 0x01 });
    w.u32((seg_cmd_size + sect_size) as u32);
    w.name16(b"__TEXT");
    if spec.is_64 {
        w.u64(0x1_0000_0000); // vmaddr
        w.u64(spec.text_size as u64); // vmsize
        w.u64(0); // fileoff
        w.u64(spec.text_size as u64); // filesize
    } else {
        w.u32(0x4000);
        w.u32(spec.text_size as u32);
        w.u32(0);
        w.u32(spec.text_size as u32);
    }
    w.u32(5); // maxprot r-x
    w.u32(5); // initprot
    w.u32(1); // nsects
    w.u32(0); // flags

    // __text section
    w.name16(b"__text");
    w.name16(b"__TEXT");
    let code_size = (spec.text_size - first_data) as u64;
    if spec.is_64 {
        w.u64(0x1_0000_0000 + first_data as u64); // addr
        w.u64(code_size); // size
        w.u32(first_data as u32); // offset
        w.u32(2); // align
        w.u32(0); // reloff
        w.u32(0); // nreloc
        w.u32(0x8000_0400); // flags: S_ATTR_PURE_INSTRUCTIONS | SOME_INSTRUCTIONS
        w.u32(0); // reserved1
        w.u32(0); // reserved2
        w.u32(0); // reserved3
    } else {
        w.u32(0x4000 + first_data as u32);
        w.u32(code_size as u32);
        w.u32(first_data as u32);
        w.u32(2);
        w.u32(0);
        w.u32(0);
        w.u32(0x8000_0400);
        w.u32(0);
        w.u32(0);
    }

    // dylib commands
    for (i, (path, weak)) in spec.dylibs.iter().enumerate() {
        w.u32(if *weak { 0x8000_0018 } else { 0x0c });
        w.u32(dylib_cmd_sizes[i] as u32);
        w.u32(24); // name offset
        w.u32(2); // timestamp
        w.u32(0x0001_0000); // current_version
        w.u32(0x0001_0000); // compatibility_version
        let mut name = path.as_bytes().to_vec();
        name.resize(dylib_cmd_sizes[i] - 24, 0);
        w.buf.extend(name);
    }

    // __LINKEDIT segment
    w.u32(if spec.is_64 { 0x19 } else { 0x01 });
    w.u32(seg_cmd_size as u32);
    w.name16(b"__LINKEDIT");
    if spec.is_64 {
        w.u64(0x1_0000_0000 + spec.text_size as u64);
        w.u64(round_up(spec.linkedit_size, 0x1000) as u64);
        w.u64(spec.text_size as u64);
        w.u64(spec.linkedit_size as u64);
    } else {
        w.u32(0x4000 + spec.text_size as u32);
        w.u32(round_up(spec.linkedit_size, 0x1000) as u32);
        w.u32(spec.text_size as u32);
        w.u32(spec.linkedit_size as u32);
    }
    w.u32(1); // maxprot r--
    w.u32(1); // initprot
    w.u32(0); // nsects
    w.u32(0); // flags

    let mut buf = w.buf;
    assert_eq!(buf.len(), header_size + sizeofcmds);

    // free space then patterned code bytes up to the text end
    buf.resize(first_data, 0);
    while buf.len() < spec.text_size {
        buf.push((buf.len() % 251) as u8);
    }
    // linkedit payload
    buf.resize(spec.text_size + spec.linkedit_size, 0xed);
    buf
}

/// Wrap thin slices into a fat container, 16KB-aligned.
pub fn fat_image(slices: &[Vec<u8>]) -> Vec<u8> {
    const ALIGN: usize = 0x4000;
    let header_size = 8 + slices.len() * 20;

    let mut offsets = Vec::new();
    let mut cursor = round_up(header_size, ALIGN);
    for slice in slices {
        offsets.push(cursor);
        cursor += slice.len();
        cursor = round_up(cursor, ALIGN);
    }

    let total = offsets
        .last()
        .map(|&o| o + slices.last().map(|s| s.len()).unwrap_or(0))
        .unwrap_or(header_size);
    let mut buf = vec![0u8; total];

    buf[0..4].copy_from_slice(&0xcafe_babe_u32.to_be_bytes());
    buf[4..8].copy_from_slice(&(slices.len() as u32).to_be_bytes());
    for (i, slice) in slices.iter().enumerate() {
        let entry = 8 + i * 20;
        // Slice headers are little-endian in these fixtures; read the cpu
        // type out of each to populate the fat_arch entry.
        let cpu_type = u32::from_le_bytes(slice[4..8].try_into().unwrap());
        let cpu_subtype = u32::from_le_bytes(slice[8..12].try_into().unwrap());
        buf[entry..entry + 4].copy_from_slice(&cpu_type.to_be_bytes());
        buf[entry + 4..entry + 8].copy_from_slice(&cpu_subtype.to_be_bytes());
        buf[entry + 8..entry + 12].copy_from_slice(&(offsets[i] as u32).to_be_bytes());
        buf[entry + 12..entry + 16].copy_from_slice(&(slice.len() as u32).to_be_bytes());
        buf[entry + 16..entry + 20].copy_from_slice(&14u32.to_be_bytes()); // 2^14
        buf[offsets[i]..offsets[i] + slice.len()].copy_from_slice(slice);
    }
    buf
}
