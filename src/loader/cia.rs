//! CTR Importable Archive.
//!
//! The header is followed by the certificate chain, ticket, TMD, contents and
//! meta sections, each starting on a 64 byte boundary. Only the first content
//! is loaded.

use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

use derivative::Derivative;
use static_assertions::assert_eq_size;
use tracing::{debug, warn};

use super::ncch::{NcchLoader, Old3dsSystemMode, NCCH_MAGIC};
use super::{AppLoader, FileType, RomFsRegion};
use crate::util::{self, align};
use crate::LoaderResult;

const CIA_ALIGNMENT: u64 = 0x40;
/// Some CIAs carry this much padding in front of the first content
const CONTENT_PADDING: u64 = 0x100;

#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct CiaHeader {
    hdr_size: u32,
    ty: u16,
    version: u16,
    cert_size: u32,
    ticket_size: u32,
    tmd_size: u32,
    meta_size: u32,
    content_size: u64,
    #[derivative(Debug = "ignore")]
    content_index: [u8; 0x2000],
}
assert_eq_size!([u8; 0x2020], CiaHeader);

impl CiaHeader {
    pub fn read<R: Read>(r: &mut R) -> LoaderResult<Self> {
        Ok(Self {
            hdr_size: util::le_u32(r)?,
            ty: util::le_u16(r)?,
            version: util::le_u16(r)?,
            cert_size: util::le_u32(r)?,
            ticket_size: util::le_u32(r)?,
            tmd_size: util::le_u32(r)?,
            meta_size: util::le_u32(r)?,
            content_size: util::le_u64(r)?,
            content_index: util::bytes(r)?,
        })
    }
    pub fn cert_chain_offset(&self) -> u64 {
        align(self.hdr_size as u64, CIA_ALIGNMENT)
    }
    pub fn ticket_offset(&self) -> u64 {
        align(self.cert_chain_offset() + self.cert_size as u64, CIA_ALIGNMENT)
    }
    pub fn tmd_offset(&self) -> u64 {
        align(self.ticket_offset() + self.ticket_size as u64, CIA_ALIGNMENT)
    }
    pub fn content_offset(&self) -> u64 {
        align(self.tmd_offset() + self.tmd_size as u64, CIA_ALIGNMENT)
    }
    pub fn meta_offset(&self) -> Option<u64> {
        if self.meta_size == 0 {
            None
        } else {
            self.content_offset()
                .checked_add(self.content_size)?
                .checked_next_multiple_of(CIA_ALIGNMENT)
        }
    }
    pub fn content_size(&self) -> u64 {
        self.content_size
    }
    /// Whether content `idx` is present, according to the content index bitmap
    pub fn has_content(&self, idx: u16) -> bool {
        let byte = self.content_index[idx as usize / 8];
        byte & (0x80 >> (idx % 8)) != 0
    }
}

/// Content offset of the CIA in `r`, if the NCCH magic is found where the
/// layout says the first content starts
fn find_content_offset<R: Read + Seek>(r: &mut R) -> std::io::Result<Option<u64>> {
    util::probe(r, |r| {
        let header = match CiaHeader::read(r) {
            Ok(header) => header,
            Err(_) => return Ok(None),
        };
        let offset = header.content_offset();

        for at in [offset, offset + CONTENT_PADDING] {
            if util::magic_at(r, at, NCCH_MAGIC)? {
                return Ok(Some(offset));
            }
        }
        Ok(None)
    })
}

pub fn identify_type<R: Read + Seek>(r: &mut R) -> FileType {
    match find_content_offset(r) {
        Ok(Some(_)) => FileType::Cia,
        _ => FileType::Error,
    }
}

/// Loads the first content of a CIA through an NCCH loader bound to its offset
pub struct CiaLoader<R> {
    ncch: NcchLoader<R>,
}

impl<R: Read + Seek> CiaLoader<R> {
    /// Never fails. A CIA whose content cannot be located is read as if the
    /// NCCH started at offset 0.
    pub fn new(mut reader: R, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let offset = match find_content_offset(&mut reader) {
            Ok(Some(offset)) => {
                debug!(offset, "found CIA content");
                offset
            }
            Ok(None) => {
                warn!(path = %path.display(), "CIA content not found, reading from offset 0");
                0
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "failed to probe CIA, reading from offset 0");
                0
            }
        };

        Self {
            ncch: NcchLoader::with_offset(reader, path, offset),
        }
    }
    pub fn ncch(&self) -> &NcchLoader<R> {
        &self.ncch
    }
    /// Parses the CIA header again from the start of the image
    pub fn header(&mut self) -> LoaderResult<CiaHeader> {
        let r = self.ncch.reader_mut();
        r.seek(SeekFrom::Start(0))?;
        CiaHeader::read(r)
    }
}

impl<R: Read + Seek> AppLoader for CiaLoader<R> {
    fn file_type(&mut self) -> FileType {
        identify_type(self.ncch.reader_mut())
    }
    fn load(&mut self) -> LoaderResult<()> {
        self.ncch.load()
    }
    fn load_kernel_system_mode(&mut self) -> LoaderResult<Old3dsSystemMode> {
        self.ncch.load_kernel_system_mode()
    }
    fn read_code(&mut self) -> LoaderResult<Vec<u8>> {
        self.ncch.read_code()
    }
    fn read_banner(&mut self) -> LoaderResult<Vec<u8>> {
        self.ncch.read_banner()
    }
    fn read_logo(&mut self) -> LoaderResult<Vec<u8>> {
        self.ncch.read_logo()
    }
    fn read_icon(&mut self) -> LoaderResult<Vec<u8>> {
        self.ncch.read_icon()
    }
    fn read_program_id(&mut self) -> LoaderResult<u64> {
        self.ncch.read_program_id()
    }
    fn read_romfs(&mut self) -> LoaderResult<RomFsRegion> {
        self.ncch.read_romfs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::testing::{cia_image, CiaSizes, NcchBuilder};
    use crate::LoaderError;
    use std::io::Cursor;

    #[test]
    fn section_offsets_are_aligned() {
        let image = cia_image(CiaSizes::default(), &NcchBuilder::new().build());
        let header = CiaHeader::read(&mut Cursor::new(image)).unwrap();
        assert_eq!(header.cert_chain_offset(), 0x2040);
        assert_eq!(header.ticket_offset(), 0x2A40);
        assert_eq!(header.tmd_offset(), 0x2DC0);
        assert_eq!(header.content_offset(), 0x3900);
        assert_eq!(header.meta_offset(), None);
        assert!(header.has_content(0));
        assert!(!header.has_content(1));
    }

    #[test]
    fn meta_offset_follows_content() {
        let mut image = cia_image(CiaSizes::default(), &[0u8; 0x200]);
        image[0x14..0x18].copy_from_slice(&0x3ACu32.to_le_bytes());
        image[0x18..0x20].copy_from_slice(&0x1234u64.to_le_bytes());
        let header = CiaHeader::read(&mut Cursor::new(image.clone())).unwrap();
        assert_eq!(header.meta_offset(), Some(0x3900 + 0x1240));

        image[0x18..0x20].copy_from_slice(&u64::MAX.to_le_bytes());
        let header = CiaHeader::read(&mut Cursor::new(image.clone())).unwrap();
        assert_eq!(header.meta_offset(), None);

        image[0x18..0x20].copy_from_slice(&(u64::MAX - 0x3900).to_le_bytes());
        let header = CiaHeader::read(&mut Cursor::new(image)).unwrap();
        assert_eq!(header.meta_offset(), None);
    }

    #[test]
    fn magic_exactly_at_content_offset() {
        let mut image = cia_image(CiaSizes::default(), &[0u8; 0x200]);
        image[0x3900..0x3904].copy_from_slice(b"NCCH");
        let mut cur = Cursor::new(image);
        assert_eq!(identify_type(&mut cur), FileType::Cia);
        assert_eq!(cur.position(), 0);
    }

    #[test]
    fn identification_is_repeatable() {
        let mut cur = Cursor::new(cia_image(CiaSizes::default(), &NcchBuilder::new().build()));
        for _ in 0..3 {
            assert_eq!(identify_type(&mut cur), FileType::Cia);
            assert_eq!(cur.position(), 0);
        }

        let misaligned = CiaSizes { tmd: 0xC00, ..CiaSizes::default() };
        let image = cia_image(misaligned, &NcchBuilder::new().build());
        // shift the content away from where the header says it is
        let image = [&image[..0x3000], &[0u8; 0x400][..], &image[0x3000..]].concat();
        assert_eq!(identify_type(&mut Cursor::new(image)), FileType::Error);
    }

    #[test]
    fn forwards_to_ncch_at_content_offset() {
        let ncch = NcchBuilder::new()
            .program_id(0x000400000F800100)
            .section(b"icon", vec![0x33; 0x40])
            .romfs_units(0x10)
            .build();
        let mut loader = CiaLoader::new(Cursor::new(cia_image(CiaSizes::default(), &ncch)), "title.cia");

        assert_eq!(loader.ncch().offset(), 0x3900);
        assert_eq!(loader.file_type(), FileType::Cia);
        assert_eq!(loader.header().unwrap().content_size(), ncch.len() as u64);
        assert_eq!(loader.read_program_id().unwrap(), 0x000400000F800100);
        assert_eq!(loader.read_icon().unwrap(), vec![0x33; 0x40]);
        assert!(matches!(loader.read_banner(), Err(LoaderError::NotUsed)));

        let (romfs_units, _) = NcchBuilder::new().section(b"icon", vec![0; 0x40]).romfs_units(0x10).layout();
        assert_eq!(loader.read_romfs().unwrap().offset, 0x3900 + romfs_units as u64 * 0x200 + 0x1000);

        loader.load().unwrap();
        assert!(matches!(loader.load(), Err(LoaderError::AlreadyLoaded)));
    }

    #[test]
    fn degrades_to_offset_zero() {
        let ncch = NcchBuilder::new().program_id(5).build();
        let mut loader = CiaLoader::new(Cursor::new(ncch), "not-really.cia");
        assert_eq!(loader.ncch().offset(), 0);
        assert_eq!(loader.read_program_id().unwrap(), 5);

        let mut empty = CiaLoader::new(Cursor::new(Vec::new()), "empty.cia");
        assert_eq!(empty.ncch().offset(), 0);
        assert!(matches!(empty.load(), Err(LoaderError::Truncated)));
    }
}
