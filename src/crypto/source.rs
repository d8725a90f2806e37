//! Key sources: the `aes_keys.txt` text file and the `aeskeydb.bin` database.
//!
//! Both are best effort. A malformed entry is logged and skipped and the rest
//! of the source is still applied; only I/O failures abort a load.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::ops::AddAssign;
use std::path::{Path, PathBuf};

use derivative::Derivative;
use static_assertions::assert_eq_size;
use tracing::{debug, error, warn};

use super::{AesKey, KeyIndex, KeySlotId, KeyStore, KeyType};
use crate::{KeyError, KeyResult};

pub const AES_KEYS: &str = "aes_keys.txt";
pub const AES_KEYS_DB: &str = "aeskeydb.bin";

/// Location of the key files, normally inside the sysdata directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySources {
    pub text: PathBuf,
    pub db: PathBuf,
}

impl KeySources {
    pub fn from_sysdata_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            text: dir.join(AES_KEYS),
            db: dir.join(AES_KEYS_DB),
        }
    }
}

/// Entry counts of a key load
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyLoadReport {
    /// Entries that parsed and were handed to the key store
    pub loaded: usize,
    pub skipped: usize,
}

impl AddAssign for KeyLoadReport {
    fn add_assign(&mut self, other: Self) {
        self.loaded += other.loaded;
        self.skipped += other.skipped;
    }
}

/// Decodes the first 32 hex digits of `hex` into a key
pub fn hex_to_key(hex: &str) -> KeyResult<AesKey> {
    let digits = hex.get(..0x20).ok_or(KeyError::HexTooShort(hex.len()))?;
    let mut key = [0u8; 0x10];
    hex::decode_to_slice(digits, &mut key)?;
    Ok(key)
}

/// Parses one `name=hex` line of a key text file
pub fn parse_key_line(line: &str) -> KeyResult<(KeyIndex, AesKey)> {
    let mut parts = line.split('=');
    let (name, value) = match (parts.next(), parts.next(), parts.next()) {
        (Some(name), Some(value), None) => (name.trim(), value.trim()),
        _ => return Err(KeyError::MalformedLine(line.to_string())),
    };

    let key = hex_to_key(value)?;
    let idx = name.parse()?;
    Ok((idx, key))
}

#[derive(Derivative)]
#[derivative(Debug)]
struct AesKeyInfo {
    slot: u8,
    ty: u8,
    id: [u8; 10],
    #[derivative(Debug = "ignore")]
    _reserved: [u8; 2],
    is_devkit: u8,
    is_encrypted: u8,
    #[derivative(Debug = "ignore")]
    key: AesKey,
}
assert_eq_size!([u8; 0x20], AesKeyInfo);

impl AesKeyInfo {
    fn from_bytes(b: &[u8; 0x20]) -> Self {
        let mut id = [0u8; 10];
        id.copy_from_slice(&b[0x2..0xC]);
        let mut key = [0u8; 0x10];
        key.copy_from_slice(&b[0x10..]);
        Self {
            slot: b[0x0],
            ty: b[0x1],
            id,
            _reserved: [b[0xC], b[0xD]],
            is_devkit: b[0xE],
            is_encrypted: b[0xF],
            key,
        }
    }
    fn index(&self) -> KeyResult<KeyIndex> {
        let slot = KeySlotId::try_from(self.slot)?;
        let ty = KeyType::try_from(char::from(self.ty))?;
        Ok(KeyIndex::Slot(slot, ty))
    }
}

/// Fills `buf` as far as the reader allows, returning the byte count
fn read_record<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn open_optional(path: &Path) -> KeyResult<Option<File>> {
    match File::open(path) {
        Ok(file) => Ok(Some(file)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "key source not present");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

impl KeyStore {
    /// Applies every `name=hex` line of a key text file.
    ///
    /// Blank lines and lines starting with `#` or `;` are ignored.
    pub fn load_keys_from_text<R: BufRead>(&mut self, reader: R) -> KeyResult<KeyLoadReport> {
        let mut report = KeyLoadReport::default();

        for line in reader.split(b'\n') {
            let line = line?;
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            match parse_key_line(line) {
                Ok((idx, key)) => {
                    self.set_key(idx, key);
                    report.loaded += 1;
                }
                Err(err) => {
                    error!(line, %err, "skipping key entry");
                    report.skipped += 1;
                }
            }
        }

        Ok(report)
    }

    /// Applies every record of a decrypted `aeskeydb.bin` database.
    pub fn load_keys_from_db<R: Read>(&mut self, mut reader: R) -> KeyResult<KeyLoadReport> {
        let mut report = KeyLoadReport::default();
        let mut record = [0u8; 0x20];

        loop {
            match read_record(&mut reader, &mut record)? {
                0 => break,
                0x20 => {}
                n => {
                    warn!(bytes = n, "ignoring truncated trailing key record");
                    report.skipped += 1;
                    break;
                }
            }

            let info = AesKeyInfo::from_bytes(&record);
            if KeySlotId::try_from(info.slot).is_err() {
                error!(slot = info.slot, "out of range slot id");
                report.skipped += 1;
                continue;
            }
            if info.is_encrypted != 0 {
                error!(slot = info.slot, "key record is encrypted");
                report.skipped += 1;
                continue;
            }
            if info.id.iter().any(|&b| b != 0) {
                warn!(slot = info.slot, "key record is a special key, ignoring");
                report.skipped += 1;
                continue;
            }

            match info.index() {
                Ok(idx) => {
                    if info.is_devkit != 0 {
                        debug!(key = %idx, "loading devkit key");
                    }
                    self.set_key(idx, info.key);
                    report.loaded += 1;
                }
                Err(err) => {
                    error!(slot = info.slot, %err, "skipping key record");
                    report.skipped += 1;
                }
            }
        }

        Ok(report)
    }

    /// Loads the text source, then the database. Missing files are skipped.
    pub fn load_preset_keys(&mut self, sources: &KeySources) -> KeyResult<KeyLoadReport> {
        let mut report = KeyLoadReport::default();

        if let Some(file) = open_optional(&sources.text)? {
            report += self.load_keys_from_text(BufReader::new(file))?;
        }
        if let Some(file) = open_optional(&sources.db)? {
            report += self.load_keys_from_db(BufReader::new(file))?;
        }

        debug!(loaded = report.loaded, skipped = report.skipped, "key sources applied");
        Ok(report)
    }

    /// Clears every slot and reloads the key sources
    pub fn init_keys(&mut self, sources: &KeySources) -> KeyResult<KeyLoadReport> {
        self.clear_all_keys();
        self.load_preset_keys(sources)
    }
}
