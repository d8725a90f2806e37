use std::io::{self, Read};

use derivative::Derivative;
use static_assertions::assert_eq_size;

use crate::util;

pub const EXEFS_HEADER_SIZE: u64 = 0x200;

#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct ExeFsHeader {
    file_headers: [FileHeader; 8],
    #[derivative(Debug = "ignore")]
    _reserved: [u8; 0x80],
    #[derivative(Debug = "ignore")]
    file_hashes: [[u8; 0x20]; 8],
}
assert_eq_size!([u8; 0x200], ExeFsHeader);

impl ExeFsHeader {
    pub(crate) fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut file_headers = [FileHeader::default(); 8];
        for hdr in file_headers.iter_mut() {
            *hdr = FileHeader {
                name: util::bytes(r)?,
                offset: util::le_u32(r)?,
                size: util::le_u32(r)?,
            };
        }
        let _reserved = util::bytes(r)?;
        let mut file_hashes = [[0u8; 0x20]; 8];
        for hash in file_hashes.iter_mut() {
            *hash = util::bytes(r)?;
        }
        Ok(Self { file_headers, _reserved, file_hashes })
    }
    pub fn file_headers_used(&self) -> impl Iterator<Item = &FileHeader> {
        self.file_headers.iter().filter(|hdr| !hdr.is_unused())
    }
    pub fn file_header_by_name(&self, name: &[u8]) -> Option<&FileHeader> {
        if name.len() > 0x8 {
            return None;
        }
        let mut padded = [0u8; 0x8];
        padded[..name.len()].copy_from_slice(name);
        self.file_headers_used().find(|hdr| hdr.name == padded)
    }
    /// Hash slots are stored in reverse order of the file headers
    pub fn file_hash(&self, idx: usize) -> Option<&[u8; 0x20]> {
        self.file_hashes.get(7usize.checked_sub(idx)?)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FileHeader {
    name: [u8; 0x8],
    offset: u32,
    size: u32,
}
assert_eq_size!([u8; 0x10], FileHeader);

impl FileHeader {
    fn is_unused(&self) -> bool {
        self.name.iter().all(|v| *v == 0)
    }
    pub fn name(&self) -> &[u8] {
        let end = self.name.iter().position(|b| *b == 0).unwrap_or(self.name.len());
        &self.name[..end]
    }
    /// Offset from the end of the ExeFS header
    pub fn offset(&self) -> u32 {
        self.offset
    }
    pub fn size(&self) -> u32 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn finds_sections_by_name() {
        let mut raw = vec![0u8; 0x200];
        raw[..5].copy_from_slice(b".code");
        raw[0x8..0xC].copy_from_slice(&0u32.to_le_bytes());
        raw[0xC..0x10].copy_from_slice(&0x123u32.to_le_bytes());
        raw[0x10..0x14].copy_from_slice(b"icon");
        raw[0x18..0x1C].copy_from_slice(&0x200u32.to_le_bytes());
        raw[0x1C..0x20].copy_from_slice(&0x36c0u32.to_le_bytes());
        raw[0x1E0] = 0xAB;

        let hdr = ExeFsHeader::read(&mut Cursor::new(raw)).unwrap();
        assert_eq!(hdr.file_headers_used().count(), 2);

        let code = hdr.file_header_by_name(b".code").unwrap();
        assert_eq!((code.offset(), code.size()), (0, 0x123));
        assert_eq!(code.name(), b".code");
        assert_eq!(hdr.file_header_by_name(b"icon").unwrap().offset(), 0x200);
        assert!(hdr.file_header_by_name(b"banner").is_none());
        assert!(hdr.file_header_by_name(b"toolongname").is_none());
        assert_eq!(hdr.file_hash(0).unwrap()[0], 0xAB);
    }
}
