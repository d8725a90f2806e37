//! In-memory NCCH, NCSD and CIA images for the loader tests.

use crate::util::align;

const MU: usize = 0x200;

fn put(buf: &mut [u8], at: usize, bytes: &[u8]) {
    buf[at..at + bytes.len()].copy_from_slice(bytes);
}

fn pad_to_unit(buf: &mut Vec<u8>) {
    buf.resize(align(buf.len() as u64, MU as u64) as usize, 0);
}

/// Unencrypted NCCH with an extended header, an ExeFS and an optional RomFS
pub(crate) struct NcchBuilder {
    program_id: u64,
    sections: Vec<([u8; 8], Vec<u8>)>,
    logo: Option<Vec<u8>>,
    romfs_units: u32,
    compressed: bool,
    encrypted: bool,
    system_mode: u8,
}

impl NcchBuilder {
    pub fn new() -> Self {
        Self {
            program_id: 0x0004000000123400,
            sections: Vec::new(),
            logo: None,
            romfs_units: 0,
            compressed: false,
            encrypted: false,
            system_mode: 0,
        }
        .code(vec![0xE1; 0x100])
    }
    pub fn program_id(mut self, id: u64) -> Self {
        self.program_id = id;
        self
    }
    pub fn section(mut self, name: &[u8], data: Vec<u8>) -> Self {
        let mut padded = [0u8; 8];
        padded[..name.len()].copy_from_slice(name);
        match self.sections.iter_mut().find(|(n, _)| *n == padded) {
            Some(entry) => entry.1 = data,
            None => self.sections.push((padded, data)),
        }
        self
    }
    pub fn code(self, data: Vec<u8>) -> Self {
        self.section(b".code", data)
    }
    pub fn compressed(mut self) -> Self {
        self.compressed = true;
        self
    }
    pub fn encrypted(mut self) -> Self {
        self.encrypted = true;
        self
    }
    pub fn logo_region(mut self, data: Vec<u8>) -> Self {
        self.logo = Some(data);
        self
    }
    pub fn romfs_units(mut self, units: u32) -> Self {
        self.romfs_units = units;
        self
    }
    pub fn system_mode(mut self, mode: u8) -> Self {
        self.system_mode = mode;
        self
    }

    /// RomFS offset and size in media units as written to the header
    pub fn layout(&self) -> (u32, u32) {
        let image = self.build();
        let word = |at: usize| u32::from_le_bytes([image[at], image[at + 1], image[at + 2], image[at + 3]]);
        (word(0x1B0), word(0x1B4))
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = vec![0u8; 0xA00];

        put(&mut out, 0x100, b"NCCH");
        put(&mut out, 0x118, &self.program_id.to_le_bytes());
        put(&mut out, 0x150, b"CTR-P-TEST");
        put(&mut out, 0x180, &0x400u32.to_le_bytes());
        out[0x18D] = 0x3;
        out[0x18F] = if self.encrypted { 0x0 } else { 0x4 };

        // extended header
        put(&mut out, 0x200, b"test");
        out[0x20D] = self.compressed as u8;
        let code_size = self.sections[0].1.len() as u32;
        put(&mut out, 0x210, &0x0010_0000u32.to_le_bytes());
        put(&mut out, 0x214, &1u32.to_le_bytes());
        put(&mut out, 0x218, &code_size.to_le_bytes());
        put(&mut out, 0x21C, &0x4000u32.to_le_bytes());
        put(&mut out, 0x220, &0x0010_1000u32.to_le_bytes());
        put(&mut out, 0x224, &1u32.to_le_bytes());
        put(&mut out, 0x230, &0x0010_2000u32.to_le_bytes());
        put(&mut out, 0x23C, &0x1000u32.to_le_bytes());
        put(&mut out, 0x400, &self.program_id.to_le_bytes());
        out[0x40E] = self.system_mode << 4;
        out[0x40F] = 0x30;

        if let Some(logo) = &self.logo {
            let units = (out.len() / MU) as u32;
            out.extend_from_slice(logo);
            pad_to_unit(&mut out);
            put(&mut out, 0x198, &units.to_le_bytes());
            put(&mut out, 0x19C, &(align(logo.len() as u64, MU as u64) as u32 / MU as u32).to_le_bytes());
        }

        let exefs_units = (out.len() / MU) as u32;
        let mut exefs = vec![0u8; MU];
        let mut body = Vec::new();
        for (i, (name, data)) in self.sections.iter().enumerate() {
            put(&mut exefs, i * 0x10, name);
            put(&mut exefs, i * 0x10 + 0x8, &(body.len() as u32).to_le_bytes());
            put(&mut exefs, i * 0x10 + 0xC, &(data.len() as u32).to_le_bytes());
            body.extend_from_slice(data);
            pad_to_unit(&mut body);
        }
        exefs.extend(body);
        put(&mut out, 0x1A0, &exefs_units.to_le_bytes());
        put(&mut out, 0x1A4, &((exefs.len() / MU) as u32).to_le_bytes());
        out.extend(exefs);

        if self.romfs_units != 0 {
            let romfs_units = (out.len() / MU) as u32;
            put(&mut out, 0x1B0, &romfs_units.to_le_bytes());
            put(&mut out, 0x1B4, &self.romfs_units.to_le_bytes());
            out.resize(out.len() + self.romfs_units as usize * MU, 0x52);
        }

        let content_units = (out.len() / MU) as u32;
        put(&mut out, 0x104, &content_units.to_le_bytes());
        out
    }
}

/// NCSD image whose first partition starts at `offset_units`
pub(crate) fn ncsd_image(offset_units: u32, partition: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; offset_units as usize * MU];
    put(&mut out, 0x100, b"NCSD");
    put(&mut out, 0x108, &0x0004000000123400u64.to_le_bytes());
    put(&mut out, 0x120, &offset_units.to_le_bytes());
    put(&mut out, 0x124, &((partition.len() / MU) as u32).to_le_bytes());
    out.extend_from_slice(partition);
    let image_units = (out.len() / MU) as u32;
    put(&mut out, 0x104, &image_units.to_le_bytes());
    out
}

/// Section sizes of a CIA image, in bytes
#[derive(Clone, Copy)]
pub(crate) struct CiaSizes {
    pub header: u32,
    pub cert: u32,
    pub ticket: u32,
    pub tmd: u32,
}

impl Default for CiaSizes {
    fn default() -> Self {
        Self {
            header: 0x2020,
            cert: 0xA00,
            ticket: 0x350,
            tmd: 0xB34,
        }
    }
}

/// CIA image with `content` at the aligned content offset
pub(crate) fn cia_image(sizes: CiaSizes, content: &[u8]) -> Vec<u8> {
    let a = |v: u64| align(v, 0x40);
    let certs = a(sizes.header as u64);
    let ticket = a(certs + sizes.cert as u64);
    let tmd = a(ticket + sizes.ticket as u64);
    let content_offset = a(tmd + sizes.tmd as u64) as usize;

    let mut out = vec![0u8; content_offset];
    put(&mut out, 0x00, &sizes.header.to_le_bytes());
    put(&mut out, 0x08, &sizes.cert.to_le_bytes());
    put(&mut out, 0x0C, &sizes.ticket.to_le_bytes());
    put(&mut out, 0x10, &sizes.tmd.to_le_bytes());
    put(&mut out, 0x18, &(content.len() as u64).to_le_bytes());
    out[0x20] = 0x80;
    out.extend_from_slice(content);
    out
}
