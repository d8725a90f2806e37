//! Title container loaders and AES key slot management for 3DS images.
//!
//! The [`loader`] module identifies NCCH, NCSD (cartridge) and CIA images and
//! finds the executable NCCH nested inside them. The [`crypto`] module holds
//! the key slots that content decryption draws its keys from.

pub mod crypto;
pub mod error;
pub mod loader;
mod util;

pub use error::{KeyError, LoaderError};

pub type LoaderResult<T> = std::result::Result<T, LoaderError>;
pub type KeyResult<T> = std::result::Result<T, KeyError>;

pub mod prelude {
    pub use crate::crypto::{AesKey, KeyIndex, KeySlotId, KeySources, KeyStore, KeyType};
    pub use crate::loader::cia::CiaLoader;
    pub use crate::loader::ncch::NcchLoader;
    pub use crate::loader::ncsd::NcsdLoader;
    pub use crate::loader::{identify_file, open_loader, AppLoader, FileType, Loader, RomFsRegion};
    pub use crate::{KeyError, LoaderError, LoaderResult};
}
