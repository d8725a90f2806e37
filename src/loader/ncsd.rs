//! NCSD, the cartridge image format (`.3ds`/`.cci`).
//!
//! Only partition 0, the bootable NCCH, is loaded.

use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

use derivative::Derivative;
use static_assertions::assert_eq_size;
use tracing::{debug, warn};

use super::ncch::{NcchLoader, Old3dsSystemMode};
use super::{AppLoader, FileType, RomFsRegion};
use crate::util::{self, MEDIA_UNIT};
use crate::{LoaderError, LoaderResult};

pub const NCSD_MAGIC: &[u8; 4] = b"NCSD";

pub fn identify_type<R: Read + Seek>(r: &mut R) -> FileType {
    match util::probe(r, |r| util::magic_at(r, 0x100, NCSD_MAGIC)) {
        Ok(true) => FileType::Cci,
        _ => FileType::Error,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionEntry {
    offset: u32,
    size: u32,
}
assert_eq_size!([u8; 0x8], PartitionEntry);

impl PartitionEntry {
    pub fn offset_bytes(&self) -> u64 {
        self.offset as u64 * MEDIA_UNIT
    }
    pub fn size_bytes(&self) -> u64 {
        self.size as u64 * MEDIA_UNIT
    }
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct NcsdHeader {
    #[derivative(Debug = "ignore")]
    sig: [u8; 0x100],
    magic: [u8; 4],
    image_size: u32,
    media_id: u64,
    fs_types: [u8; 8],
    crypt_types: [u8; 8],
    partitions: [PartitionEntry; 8],
}
assert_eq_size!([u8; 0x160], NcsdHeader);

impl NcsdHeader {
    pub fn read<R: Read>(r: &mut R) -> LoaderResult<Self> {
        let sig = util::bytes(r)?;
        let magic = util::bytes(r)?;
        if &magic != NCSD_MAGIC {
            return Err(LoaderError::InvalidFormat("NCSD magic"));
        }
        let image_size = util::le_u32(r)?;
        let media_id = util::le_u64(r)?;
        let fs_types = util::bytes(r)?;
        let crypt_types = util::bytes(r)?;
        let mut partitions = [PartitionEntry::default(); 8];
        for part in partitions.iter_mut() {
            part.offset = util::le_u32(r)?;
            part.size = util::le_u32(r)?;
        }

        Ok(Self {
            sig,
            magic,
            image_size,
            media_id,
            fs_types,
            crypt_types,
            partitions,
        })
    }
    pub fn image_size(&self) -> u64 {
        self.image_size as u64 * MEDIA_UNIT
    }
    pub fn media_id(&self) -> u64 {
        self.media_id
    }
    pub fn partition(&self, idx: usize) -> Option<&PartitionEntry> {
        self.partitions.get(idx).filter(|p| !p.is_empty())
    }
    pub fn partitions(&self) -> impl Iterator<Item = (usize, &PartitionEntry)> {
        self.partitions.iter().enumerate().filter(|(_, p)| !p.is_empty())
    }
}

/// Byte offset of the boot partition
fn boot_partition_offset<R: Read + Seek>(r: &mut R) -> LoaderResult<u64> {
    r.seek(SeekFrom::Start(0))?;
    let header = NcsdHeader::read(r)?;
    let part = header.partition(0).ok_or(LoaderError::NotUsed)?;
    Ok(part.offset_bytes())
}

/// Loads partition 0 of a cartridge image through an NCCH loader
pub struct NcsdLoader<R> {
    ncch: NcchLoader<R>,
}

impl<R: Read + Seek> NcsdLoader<R> {
    /// Never fails. An image without a usable partition table is read as if
    /// the NCCH started at offset 0.
    pub fn new(mut reader: R, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let offset = match boot_partition_offset(&mut reader) {
            Ok(offset) => {
                debug!(offset, "found boot partition");
                offset
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "no boot partition, reading from offset 0");
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
    pub fn header(&mut self) -> LoaderResult<NcsdHeader> {
        let r = self.ncch.reader_mut();
        r.seek(SeekFrom::Start(0))?;
        NcsdHeader::read(r)
    }
}

impl<R: Read + Seek> AppLoader for NcsdLoader<R> {
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
