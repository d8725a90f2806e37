//! NCCH, the flat executable container every other title format wraps.

pub mod exefs;
pub mod lzss;

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use derivative::Derivative;
use static_assertions::assert_eq_size;
use tracing::{debug, warn};

use self::exefs::{ExeFsHeader, EXEFS_HEADER_SIZE};
use super::{AppLoader, FileType, RomFsRegion};
use crate::util::{self, MEDIA_UNIT};
use crate::{LoaderError, LoaderResult};

pub const NCCH_MAGIC: &[u8; 4] = b"NCCH";
pub const NCCH_HEADER_SIZE: u64 = 0x200;
/// Size of the system and access control info read from the extended header
pub const EXHEADER_SIZE: u64 = 0x400;
/// The RomFS region starts with an IVFC hash tree header which is skipped
const ROMFS_IVFC_SIZE: u64 = 0x1000;

/// Checks the magic at offset 0x100, which NCCH shares with NCSD
pub fn identify_type<R: Read + Seek>(r: &mut R) -> FileType {
    let magic = util::probe(r, |r| {
        r.seek(SeekFrom::Start(0x100))?;
        util::bytes::<4>(r)
    });
    match magic {
        Ok(ref m) if m == NCCH_MAGIC => FileType::Cxi,
        Ok(ref m) if m == b"NCSD" => FileType::Cci,
        _ => FileType::Error,
    }
}

#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct NcchHeader {
    #[derivative(Debug = "ignore")]
    sig: [u8; 0x100],
    magic: [u8; 4],
    content_size: u32,
    partition_id: u64,
    maker_code: [u8; 2],
    version: u16,
    #[derivative(Debug = "ignore")]
    content_lock_seed_hash: u32,
    program_id: u64,
    #[derivative(Debug = "ignore")]
    _reserved0: [u8; 0x10],
    #[derivative(Debug = "ignore")]
    logo_region_hash: [u8; 0x20],
    product_code: [u8; 0x10],
    #[derivative(Debug = "ignore")]
    exheader_hash: [u8; 0x20],
    exheader_size: u32,
    #[derivative(Debug = "ignore")]
    _reserved1: u32,
    flags: NcchFlags,
    plain_offset: u32,
    plain_size: u32,
    logo_offset: u32,
    logo_size: u32,
    exefs_offset: u32,
    exefs_size: u32,
    exefs_hash_size: u32,
    #[derivative(Debug = "ignore")]
    _reserved2: u32,
    romfs_offset: u32,
    romfs_size: u32,
    romfs_hash_size: u32,
    #[derivative(Debug = "ignore")]
    _reserved3: u32,
    #[derivative(Debug = "ignore")]
    exefs_super_hash: [u8; 0x20],
    #[derivative(Debug = "ignore")]
    romfs_super_hash: [u8; 0x20],
}
assert_eq_size!([u8; 0x200], NcchHeader);

impl NcchHeader {
    pub fn read<R: Read>(r: &mut R) -> LoaderResult<Self> {
        let sig = util::bytes(r)?;
        let magic = util::bytes(r)?;
        if &magic != NCCH_MAGIC {
            return Err(LoaderError::InvalidFormat("NCCH magic"));
        }

        Ok(Self {
            sig,
            magic,
            content_size: util::le_u32(r)?,
            partition_id: util::le_u64(r)?,
            maker_code: util::bytes(r)?,
            version: util::le_u16(r)?,
            content_lock_seed_hash: util::le_u32(r)?,
            program_id: util::le_u64(r)?,
            _reserved0: util::bytes(r)?,
            logo_region_hash: util::bytes(r)?,
            product_code: util::bytes(r)?,
            exheader_hash: util::bytes(r)?,
            exheader_size: util::le_u32(r)?,
            _reserved1: util::le_u32(r)?,
            flags: NcchFlags::read(r)?,
            plain_offset: util::le_u32(r)?,
            plain_size: util::le_u32(r)?,
            logo_offset: util::le_u32(r)?,
            logo_size: util::le_u32(r)?,
            exefs_offset: util::le_u32(r)?,
            exefs_size: util::le_u32(r)?,
            exefs_hash_size: util::le_u32(r)?,
            _reserved2: util::le_u32(r)?,
            romfs_offset: util::le_u32(r)?,
            romfs_size: util::le_u32(r)?,
            romfs_hash_size: util::le_u32(r)?,
            _reserved3: util::le_u32(r)?,
            exefs_super_hash: util::bytes(r)?,
            romfs_super_hash: util::bytes(r)?,
        })
    }
    pub fn program_id(&self) -> u64 {
        self.program_id
    }
    pub fn partition_id(&self) -> u64 {
        self.partition_id
    }
    pub fn product_code(&self) -> String {
        let end = self.product_code.iter().position(|b| *b == 0).unwrap_or(0x10);
        String::from_utf8_lossy(&self.product_code[..end]).into_owned()
    }
    pub fn content_size(&self) -> u64 {
        self.content_size as u64 * MEDIA_UNIT
    }
    pub fn flags(&self) -> &NcchFlags {
        &self.flags
    }
    pub fn is_encrypted(&self) -> bool {
        !self.flags.options.contains(NcchFlagsOptions::NO_CRYPTO)
    }
    pub fn has_exheader(&self) -> bool {
        self.exheader_size != 0
    }
    /// Byte range of a region given in media units, relative to the NCCH start
    fn region(offset: u32, size: u32) -> Option<(u64, u64)> {
        if offset == 0 || size == 0 {
            None
        } else {
            Some((offset as u64 * MEDIA_UNIT, size as u64 * MEDIA_UNIT))
        }
    }
    pub fn logo_region(&self) -> Option<(u64, u64)> {
        Self::region(self.logo_offset, self.logo_size)
    }
    pub fn exefs_region(&self) -> Option<(u64, u64)> {
        Self::region(self.exefs_offset, self.exefs_size)
    }
    pub fn romfs_region(&self) -> Option<(u64, u64)> {
        Self::region(self.romfs_offset, self.romfs_size)
    }
}

#[derive(Clone, Debug)]
pub struct NcchFlags {
    unk0: u8,
    unk1: u8,
    unk2: u8,
    crypto_method: u8,
    content_platform: u8,
    content_type: ContentType,
    content_unit_size: u8,
    options: NcchFlagsOptions,
}
assert_eq_size!([u8; 0x8], NcchFlags);

impl NcchFlags {
    fn read<R: Read>(r: &mut R) -> std::io::Result<Self> {
        let raw: [u8; 8] = util::bytes(r)?;
        let [unk0, unk1, unk2, crypto_method, content_platform, content_type, content_unit_size, options] = raw;
        Ok(Self {
            unk0,
            unk1,
            unk2,
            crypto_method,
            content_platform,
            content_type: ContentType::from_bits_retain(content_type),
            content_unit_size,
            options: NcchFlagsOptions::from_bits_retain(options),
        })
    }
    pub fn crypto_method(&self) -> u8 {
        self.crypto_method
    }
    pub fn content_platform(&self) -> u8 {
        self.content_platform
    }
    pub fn content_type(&self) -> ContentType {
        self.content_type
    }
    pub fn options(&self) -> NcchFlagsOptions {
        self.options
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ContentType: u8 {
        const DATA = 0x1;
        const EXECUTABLE = 0x2;
        const SYSTEMUPDATE = 0x4;
        const MANUAL = 0x8;
        const CHILD = 0x4 | 0x8;
        const TRIAL = 0x10;
        const _ = !0;
    }
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NcchFlagsOptions: u8 {
        const FIXED_CRYPTO_KEY = 0x1;
        const NO_MOUNT_ROM_FS = 0x2;
        const NO_CRYPTO = 0x4;
        const NEW_KEY_Y_GENERATOR = 0x20;
        const _ = !0;
    }
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExheaderFlags: u8 {
        const COMPRESS_EXEFS_CODE = 0x1;
        const SD_APPLICATION = 0x2;
        const _ = !0;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodeSetInfo {
    pub address: u32,
    pub num_max_pages: u32,
    pub code_size: u32,
}

impl CodeSetInfo {
    fn read<R: Read>(r: &mut R) -> std::io::Result<Self> {
        Ok(Self {
            address: util::le_u32(r)?,
            num_max_pages: util::le_u32(r)?,
            code_size: util::le_u32(r)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Old3dsSystemMode {
    Prod64Mb = 0,
    Undefined,
    Dev1_96Mb,
    Dev2_80Mb,
    Dev3_72Mb,
    Dev4_32Mb,
}

impl TryFrom<u8> for Old3dsSystemMode {
    type Error = LoaderError;

    fn try_from(v: u8) -> LoaderResult<Self> {
        match v {
            0 => Ok(Self::Prod64Mb),
            1 => Ok(Self::Undefined),
            2 => Ok(Self::Dev1_96Mb),
            3 => Ok(Self::Dev2_80Mb),
            4 => Ok(Self::Dev3_72Mb),
            5 => Ok(Self::Dev4_32Mb),
            _ => Err(LoaderError::InvalidFormat("system mode")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceLimitCategory {
    Application = 0,
    SysApplet = 1,
    LibApplet = 2,
    Other = 3,
}

impl From<u8> for ResourceLimitCategory {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::Application,
            1 => Self::SysApplet,
            2 => Self::LibApplet,
            _ => Self::Other,
        }
    }
}

/// System control info and the ARM11 local capabilities of the extended header
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct ExHeader {
    app_title: [u8; 8],
    flags: ExheaderFlags,
    remaster_version: u16,
    text: CodeSetInfo,
    stack_size: u32,
    rodata: CodeSetInfo,
    data: CodeSetInfo,
    bss_size: u32,
    #[derivative(Debug = "ignore")]
    dependencies: [u64; 0x30],
    savedata_size: u64,
    jump_id: u64,
    program_id: u64,
    core_version: u32,
    flag0: u8,
    priority: u8,
    resource_limit_category: ResourceLimitCategory,
}

impl ExHeader {
    pub fn read<R: Read>(r: &mut R) -> LoaderResult<Self> {
        let app_title = util::bytes(r)?;
        let _reserved0: [u8; 5] = util::bytes(r)?;
        let flags = ExheaderFlags::from_bits_retain(util::u8(r)?);
        let remaster_version = util::le_u16(r)?;
        let text = CodeSetInfo::read(r)?;
        let stack_size = util::le_u32(r)?;
        let rodata = CodeSetInfo::read(r)?;
        let _reserved1 = util::le_u32(r)?;
        let data = CodeSetInfo::read(r)?;
        let bss_size = util::le_u32(r)?;
        let mut dependencies = [0u64; 0x30];
        for dep in dependencies.iter_mut() {
            *dep = util::le_u64(r)?;
        }
        let savedata_size = util::le_u64(r)?;
        let jump_id = util::le_u64(r)?;
        let _reserved2: [u8; 0x30] = util::bytes(r)?;

        // ARM11 local system capabilities
        let program_id = util::le_u64(r)?;
        let core_version = util::le_u32(r)?;
        let _n3ds_mode = util::u8(r)?;
        let _flag1 = util::u8(r)?;
        let flag0 = util::u8(r)?;
        let priority = util::u8(r)?;
        // resource limits, storage info, service access list and padding
        let _skipped: [u8; 0x15F] = util::bytes(r)?;
        let resource_limit_category = ResourceLimitCategory::from(util::u8(r)?);

        Ok(Self {
            app_title,
            flags,
            remaster_version,
            text,
            stack_size,
            rodata,
            data,
            bss_size,
            dependencies,
            savedata_size,
            jump_id,
            program_id,
            core_version,
            flag0,
            priority,
            resource_limit_category,
        })
    }
    pub fn app_title(&self) -> String {
        let end = self.app_title.iter().position(|b| *b == 0).unwrap_or(8);
        String::from_utf8_lossy(&self.app_title[..end]).into_owned()
    }
    pub fn is_code_compressed(&self) -> bool {
        self.flags.contains(ExheaderFlags::COMPRESS_EXEFS_CODE)
    }
    pub fn remaster_version(&self) -> u16 {
        self.remaster_version
    }
    pub fn text(&self) -> CodeSetInfo {
        self.text
    }
    pub fn rodata(&self) -> CodeSetInfo {
        self.rodata
    }
    pub fn data(&self) -> CodeSetInfo {
        self.data
    }
    pub fn stack_size(&self) -> u32 {
        self.stack_size
    }
    pub fn bss_size(&self) -> u32 {
        self.bss_size
    }
    pub fn dependencies(&self) -> impl Iterator<Item = u64> + '_ {
        self.dependencies.iter().copied().filter(|id| *id != 0)
    }
    pub fn savedata_size(&self) -> u64 {
        self.savedata_size
    }
    pub fn jump_id(&self) -> u64 {
        self.jump_id
    }
    pub fn program_id(&self) -> u64 {
        self.program_id
    }
    pub fn core_version(&self) -> u32 {
        self.core_version
    }
    pub fn system_mode(&self) -> LoaderResult<Old3dsSystemMode> {
        Old3dsSystemMode::try_from(self.flag0 >> 4)
    }
    pub fn priority(&self) -> u8 {
        self.priority
    }
    pub fn resource_limit_category(&self) -> ResourceLimitCategory {
        self.resource_limit_category
    }
}

/// What [`NcchLoader::load`] hands over to process creation
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct ProgramImage {
    pub name: String,
    pub program_id: u64,
    pub text: CodeSetInfo,
    pub rodata: CodeSetInfo,
    pub data: CodeSetInfo,
    pub bss_size: u32,
    pub stack_size: u32,
    pub priority: u8,
    pub resource_limit_category: ResourceLimitCategory,
    #[derivative(Debug = "ignore")]
    pub code: Vec<u8>,
}

impl ProgramImage {
    /// Byte offsets of the text, rodata and data segments inside `code`
    pub fn segment_offsets(&self) -> [u64; 3] {
        const PAGE_SIZE: u64 = 0x1000;
        let rodata = self.text.num_max_pages as u64 * PAGE_SIZE;
        let data = rodata + self.rodata.num_max_pages as u64 * PAGE_SIZE;
        [0, rodata, data]
    }
}

/// Loader for a flat NCCH image starting `offset` bytes into its reader
pub struct NcchLoader<R> {
    reader: R,
    path: PathBuf,
    offset: u64,
    header: Option<NcchHeader>,
    exheader: Option<ExHeader>,
    exefs: Option<ExeFsHeader>,
    image: Option<ProgramImage>,
}

impl<R: Read + Seek> NcchLoader<R> {
    pub fn new(reader: R, path: impl Into<PathBuf>) -> Self {
        Self::with_offset(reader, path, 0)
    }
    pub fn with_offset(reader: R, path: impl Into<PathBuf>, offset: u64) -> Self {
        Self {
            reader,
            path: path.into(),
            offset,
            header: None,
            exheader: None,
            exefs: None,
            image: None,
        }
    }
    pub fn offset(&self) -> u64 {
        self.offset
    }
    pub fn path(&self) -> &Path {
        &self.path
    }
    pub fn header(&self) -> Option<&NcchHeader> {
        self.header.as_ref()
    }
    pub fn exheader(&self) -> Option<&ExHeader> {
        self.exheader.as_ref()
    }
    pub fn exefs(&self) -> Option<&ExeFsHeader> {
        self.exefs.as_ref()
    }
    pub fn image(&self) -> Option<&ProgramImage> {
        self.image.as_ref()
    }
    pub fn is_loaded(&self) -> bool {
        self.image.is_some()
    }
    pub(crate) fn reader_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    /// Parses the NCCH header, extended header and ExeFS header once
    fn load_headers(&mut self) -> LoaderResult<&NcchHeader> {
        if self.header.is_none() {
            self.reader.seek(SeekFrom::Start(self.offset))?;
            let header = NcchHeader::read(&mut self.reader)?;

            if header.is_encrypted() {
                warn!(path = %self.path.display(), "NCCH content is encrypted");
                return Err(LoaderError::Encrypted);
            }

            if header.has_exheader() {
                self.reader.seek(SeekFrom::Start(self.offset + NCCH_HEADER_SIZE))?;
                let mut raw = (&mut self.reader).take(EXHEADER_SIZE);
                self.exheader = Some(ExHeader::read(&mut raw)?);
            }

            if let Some((exefs_offset, _)) = header.exefs_region() {
                self.reader.seek(SeekFrom::Start(self.offset + exefs_offset))?;
                self.exefs = Some(ExeFsHeader::read(&mut self.reader)?);
            }

            debug!(
                offset = self.offset,
                program_id = format_args!("{:016X}", header.program_id),
                "parsed NCCH header"
            );
            self.header = Some(header);
        }

        self.header.as_ref().ok_or(LoaderError::Error)
    }

    fn read_exefs_section(&mut self, name: &[u8]) -> LoaderResult<Vec<u8>> {
        let (exefs_offset, _) = self.load_headers()?.exefs_region().ok_or(LoaderError::NotUsed)?;
        let section = self
            .exefs
            .as_ref()
            .and_then(|exefs| exefs.file_header_by_name(name))
            .copied()
            .ok_or(LoaderError::NotUsed)?;

        let pos = self.offset + exefs_offset + EXEFS_HEADER_SIZE + section.offset() as u64;
        self.reader.seek(SeekFrom::Start(pos))?;
        let data = util::bytes_vec(&mut self.reader, section.size() as u64)?;

        let compressed = name == b".code"
            && self.exheader.as_ref().is_some_and(ExHeader::is_code_compressed);
        if compressed {
            debug!(size = data.len(), "decompressing .code");
            lzss::decompress(&data)
        } else {
            Ok(data)
        }
    }

    fn read_region(&mut self, start: u64, size: u64) -> LoaderResult<Vec<u8>> {
        self.reader.seek(SeekFrom::Start(self.offset + start))?;
        Ok(util::bytes_vec(&mut self.reader, size)?)
    }
}

impl<R: Read + Seek> AppLoader for NcchLoader<R> {
    fn file_type(&mut self) -> FileType {
        identify_type(&mut self.reader)
    }

    fn load(&mut self) -> LoaderResult<()> {
        if self.is_loaded() {
            return Err(LoaderError::AlreadyLoaded);
        }

        let program_id = self.load_headers()?.program_id;
        let exheader = self
            .exheader
            .clone()
            .ok_or(LoaderError::InvalidFormat("missing extended header"))?;
        let code = self.read_code()?;

        debug!(
            name = %exheader.app_title(),
            code_size = code.len(),
            "loaded program image"
        );
        self.image = Some(ProgramImage {
            name: exheader.app_title(),
            program_id,
            text: exheader.text,
            rodata: exheader.rodata,
            data: exheader.data,
            bss_size: exheader.bss_size,
            stack_size: exheader.stack_size,
            priority: exheader.priority,
            resource_limit_category: exheader.resource_limit_category,
            code,
        });
        Ok(())
    }

    fn load_kernel_system_mode(&mut self) -> LoaderResult<Old3dsSystemMode> {
        self.load_headers()?;
        self.exheader.as_ref().ok_or(LoaderError::NotUsed)?.system_mode()
    }

    fn read_code(&mut self) -> LoaderResult<Vec<u8>> {
        self.read_exefs_section(b".code")
    }

    fn read_banner(&mut self) -> LoaderResult<Vec<u8>> {
        self.read_exefs_section(b"banner")
    }

    fn read_logo(&mut self) -> LoaderResult<Vec<u8>> {
        match self.read_exefs_section(b"logo") {
            Err(LoaderError::NotUsed) => {
                let (start, size) = self.load_headers()?.logo_region().ok_or(LoaderError::NotUsed)?;
                self.read_region(start, size)
            }
            other => other,
        }
    }

    fn read_icon(&mut self) -> LoaderResult<Vec<u8>> {
        self.read_exefs_section(b"icon")
    }

    fn read_program_id(&mut self) -> LoaderResult<u64> {
        Ok(self.load_headers()?.program_id)
    }

    fn read_romfs(&mut self) -> LoaderResult<RomFsRegion> {
        let (start, size) = self.load_headers()?.romfs_region().ok_or(LoaderError::NotUsed)?;
        let size = size.checked_sub(ROMFS_IVFC_SIZE).ok_or(LoaderError::InvalidFormat("RomFS size"))?;

        Ok(RomFsRegion {
            path: self.path.clone(),
            offset: self.offset + start + ROMFS_IVFC_SIZE,
            size,
        })
    }
}
