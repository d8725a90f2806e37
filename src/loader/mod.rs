//! Title loaders.
//!
//! [`identify_file`] classifies an image, [`Loader`] dispatches to the loader
//! for that container. CIA and NCSD images only locate the NCCH they wrap and
//! forward every read to an inner [`NcchLoader`].

pub mod cia;
pub mod ncch;
pub mod ncsd;

#[cfg(test)]
pub(crate) mod testing;

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use self::cia::CiaLoader;
use self::ncch::{NcchLoader, Old3dsSystemMode};
use self::ncsd::NcsdLoader;
use crate::{LoaderError, LoaderResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// Could not be read or matched nothing
    Error,
    Unknown,
    /// NCSD cartridge image
    Cci,
    /// Flat NCCH executable
    Cxi,
    Cia,
}

impl FileType {
    pub fn guess_from_extension(path: impl AsRef<Path>) -> FileType {
        let ext = path
            .as_ref()
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);

        match ext.as_deref() {
            Some("cci") | Some("3ds") => FileType::Cci,
            Some("cxi") | Some("app") => FileType::Cxi,
            Some("cia") => FileType::Cia,
            _ => FileType::Unknown,
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileType::Error => "error",
            FileType::Unknown => "unknown",
            FileType::Cci => "NCSD",
            FileType::Cxi => "NCCH",
            FileType::Cia => "CIA",
        };
        f.write_str(name)
    }
}

/// Byte range of the RomFS level 3 data inside the image file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RomFsRegion {
    pub path: PathBuf,
    pub offset: u64,
    pub size: u64,
}

impl RomFsRegion {
    /// Opens a fresh handle on the image, limited to the region
    pub fn open(&self) -> io::Result<io::Take<File>> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.offset))?;
        Ok(file.take(self.size))
    }
}

/// Content access shared by every title format
pub trait AppLoader {
    fn file_type(&mut self) -> FileType;
    /// Reads the executable and remembers its image; a second call fails
    /// with [`LoaderError::AlreadyLoaded`]
    fn load(&mut self) -> LoaderResult<()>;
    fn load_kernel_system_mode(&mut self) -> LoaderResult<Old3dsSystemMode>;
    fn read_code(&mut self) -> LoaderResult<Vec<u8>>;
    fn read_banner(&mut self) -> LoaderResult<Vec<u8>>;
    fn read_logo(&mut self) -> LoaderResult<Vec<u8>>;
    fn read_icon(&mut self) -> LoaderResult<Vec<u8>>;
    fn read_program_id(&mut self) -> LoaderResult<u64>;
    fn read_romfs(&mut self) -> LoaderResult<RomFsRegion>;
}

/// Classifies an image. The reader is left at offset 0.
pub fn identify_file<R: Read + Seek>(r: &mut R) -> FileType {
    let ty = match ncsd::identify_type(r) {
        FileType::Error => match ncch::identify_type(r) {
            FileType::Error => cia::identify_type(r),
            ty => ty,
        },
        ty => ty,
    };
    debug!(%ty, "identified image");
    ty
}

pub enum Loader<R> {
    Ncch(NcchLoader<R>),
    Ncsd(NcsdLoader<R>),
    Cia(CiaLoader<R>),
}

impl<R: Read + Seek> Loader<R> {
    /// Builds the loader for `ty`, or `None` if the type has no loader
    pub fn new(reader: R, path: impl Into<PathBuf>, ty: FileType) -> Option<Self> {
        match ty {
            FileType::Cxi => Some(Loader::Ncch(NcchLoader::new(reader, path))),
            FileType::Cci => Some(Loader::Ncsd(NcsdLoader::new(reader, path))),
            FileType::Cia => Some(Loader::Cia(CiaLoader::new(reader, path))),
            FileType::Error | FileType::Unknown => None,
        }
    }

    /// Offset of the NCCH every read is served from
    pub fn ncch_offset(&self) -> u64 {
        self.ncch().offset()
    }

    pub fn ncch(&self) -> &NcchLoader<R> {
        match self {
            Loader::Ncch(l) => l,
            Loader::Ncsd(l) => l.ncch(),
            Loader::Cia(l) => l.ncch(),
        }
    }

    fn inner(&mut self) -> &mut dyn AppLoader {
        match self {
            Loader::Ncch(l) => l,
            Loader::Ncsd(l) => l,
            Loader::Cia(l) => l,
        }
    }
}

impl<R: Read + Seek> AppLoader for Loader<R> {
    fn file_type(&mut self) -> FileType {
        self.inner().file_type()
    }
    fn load(&mut self) -> LoaderResult<()> {
        self.inner().load()
    }
    fn load_kernel_system_mode(&mut self) -> LoaderResult<Old3dsSystemMode> {
        self.inner().load_kernel_system_mode()
    }
    fn read_code(&mut self) -> LoaderResult<Vec<u8>> {
        self.inner().read_code()
    }
    fn read_banner(&mut self) -> LoaderResult<Vec<u8>> {
        self.inner().read_banner()
    }
    fn read_logo(&mut self) -> LoaderResult<Vec<u8>> {
        self.inner().read_logo()
    }
    fn read_icon(&mut self) -> LoaderResult<Vec<u8>> {
        self.inner().read_icon()
    }
    fn read_program_id(&mut self) -> LoaderResult<u64> {
        self.inner().read_program_id()
    }
    fn read_romfs(&mut self) -> LoaderResult<RomFsRegion> {
        self.inner().read_romfs()
    }
}

/// Opens `path` and picks its loader by content, falling back to the file
/// extension when the content matches nothing
pub fn open_loader(path: impl AsRef<Path>) -> LoaderResult<Loader<File>> {
    let path = path.as_ref();
    let mut file = File::open(path)?;

    let mut ty = identify_file(&mut file);
    if ty == FileType::Error {
        ty = FileType::guess_from_extension(path);
        warn!(path = %path.display(), guess = %ty, "unrecognized image, guessing from extension");
    }

    Loader::new(file, path, ty).ok_or(LoaderError::Error)
}

#[cfg(test)]
mod tests {
    use super::testing::{cia_image, ncsd_image, CiaSizes, NcchBuilder};
    use super::*;
    use std::fs;
    use std::io::Cursor;

    #[test]
    fn extension_guess() {
        assert_eq!(FileType::guess_from_extension("a/game.3DS"), FileType::Cci);
        assert_eq!(FileType::guess_from_extension("game.cci"), FileType::Cci);
        assert_eq!(FileType::guess_from_extension("game.cxi"), FileType::Cxi);
        assert_eq!(FileType::guess_from_extension("00000000.app"), FileType::Cxi);
        assert_eq!(FileType::guess_from_extension("game.cia"), FileType::Cia);
        assert_eq!(FileType::guess_from_extension("game.zip"), FileType::Unknown);
        assert_eq!(FileType::guess_from_extension("game"), FileType::Unknown);
    }

    #[test]
    fn identifies_each_container() {
        let ncch = NcchBuilder::new().build();
        let cases = [
            (ncsd_image(0x200, &ncch), FileType::Cci),
            (ncch.clone(), FileType::Cxi),
            (cia_image(CiaSizes::default(), &ncch), FileType::Cia),
            (vec![0u8; 0x4000], FileType::Error),
            (Vec::new(), FileType::Error),
        ];

        for (image, expected) in cases {
            let mut cur = Cursor::new(image);
            cur.set_position(0x77);
            assert_eq!(identify_file(&mut cur), expected);
            assert_eq!(cur.position(), 0);
            // repeatable
            assert_eq!(identify_file(&mut cur), expected);
        }
    }

    #[test]
    fn loader_enum_dispatches() {
        let ncch = NcchBuilder::new().program_id(0x1122).build();
        let mut loader = Loader::new(Cursor::new(ncsd_image(4, &ncch)), "game.3ds", FileType::Cci).unwrap();
        assert_eq!(loader.ncch_offset(), 0x800);
        assert_eq!(loader.file_type(), FileType::Cci);
        assert_eq!(loader.read_program_id().unwrap(), 0x1122);
        loader.load().unwrap();
        assert!(matches!(loader.load(), Err(LoaderError::AlreadyLoaded)));

        assert!(Loader::new(Cursor::new(Vec::new()), "x", FileType::Unknown).is_none());
    }

    #[test]
    fn open_loader_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let ncch = NcchBuilder::new().romfs_units(0x10).build();

        let cia_path = dir.path().join("title.bin");
        fs::write(&cia_path, cia_image(CiaSizes::default(), &ncch)).unwrap();
        let mut loader = open_loader(&cia_path).unwrap();
        assert!(matches!(loader, Loader::Cia(_)));
        assert_eq!(loader.ncch_offset(), 0x3900);

        let region = loader.read_romfs().unwrap();
        assert_eq!(region.path, cia_path);
        let mut romfs = Vec::new();
        region.open().unwrap().read_to_end(&mut romfs).unwrap();
        assert_eq!(romfs.len() as u64, region.size);
        assert!(romfs.iter().all(|b| *b == 0x52));
    }

    #[test]
    fn open_loader_falls_back_to_extension() {
        let dir = tempfile::tempdir().unwrap();

        let junk = dir.path().join("junk.cxi");
        fs::write(&junk, vec![0u8; 0x400]).unwrap();
        let mut loader = open_loader(&junk).unwrap();
        assert!(matches!(loader, Loader::Ncch(_)));
        assert!(matches!(loader.load(), Err(LoaderError::InvalidFormat(_))));

        let unknown = dir.path().join("junk.bin");
        fs::write(&unknown, vec![0u8; 0x400]).unwrap();
        assert!(matches!(open_loader(&unknown), Err(LoaderError::Error)));

        assert!(matches!(open_loader(dir.path().join("missing.cia")), Err(LoaderError::Io(_))));
    }
}
