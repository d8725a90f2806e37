use std::io;

use derive_more::{Display, Error};

/// Status reported at the loader boundary
#[non_exhaustive]
#[derive(Debug, Display, Error)]
pub enum LoaderError {
    #[display(fmt = "Failed to load title")]
    Error,
    #[display(fmt = "Title already loaded")]
    AlreadyLoaded,
    #[display(fmt = "Requested region is not present")]
    NotUsed,
    #[display(fmt = "Title content is encrypted")]
    Encrypted,
    #[display(fmt = "Invalid {}", _0)]
    InvalidFormat(#[error(not(source))] &'static str),
    #[display(fmt = "Header is truncated")]
    Truncated,
    #[display(fmt = "I/O error: {}", _0)]
    Io(io::Error),
}

impl From<io::Error> for LoaderError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => Self::Truncated,
            _ => Self::Io(err),
        }
    }
}

/// Errors raised while addressing key slots or parsing key sources
#[non_exhaustive]
#[derive(Debug, Display, Error)]
pub enum KeyError {
    #[display(fmt = "Key slot 0x{:X} out of range", _0)]
    SlotOutOfRange(#[error(not(source))] usize),
    #[display(fmt = "Invalid key type {:?}", _0)]
    InvalidKeyType(#[error(not(source))] char),
    #[display(fmt = "Invalid key name {:?}", _0)]
    InvalidKeyName(#[error(not(source))] String),
    #[display(fmt = "Malformed line {:?}", _0)]
    MalformedLine(#[error(not(source))] String),
    #[display(fmt = "Hex string too short ({} characters)", _0)]
    HexTooShort(#[error(not(source))] usize),
    #[display(fmt = "Failed to decode hex string")]
    HexError(hex::FromHexError),
    #[display(fmt = "I/O error: {}", _0)]
    Io(io::Error),
}

impl From<hex::FromHexError> for KeyError {
    fn from(err: hex::FromHexError) -> Self {
        Self::HexError(err)
    }
}

impl From<io::Error> for KeyError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}
