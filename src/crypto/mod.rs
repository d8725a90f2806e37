//! AES key material used to decrypt title content.
//!
//! Keys live in a [`KeyStore`] made of 64 key slots. Each slot carries an
//! optional X, Y and Normal key; when X, Y and the generator constant are all
//! known, the Normal key is derived from them with [`generate_normal_key`].
//! Keys are loaded from `aes_keys.txt` and `aeskeydb.bin`, see [`source`].

pub mod source;
mod store;

use std::fmt;
use std::str::FromStr;

use crate::{KeyError, KeyResult};

pub use source::{KeyLoadReport, KeySources};
pub use store::{KeySlot, KeyStore, SlotState};

pub type AesKey = [u8; 0x10];

/// Number of hardware key slots
pub const MAX_KEY_SLOT: usize = 0x40;

/// Bounds-checked key slot number
#[derive(Debug, Clone, Copy, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct KeySlotId(u8);

impl KeySlotId {
    pub const NCCH_SECURE3: Self = Self(0x18);
    pub const NCCH_SECURE4: Self = Self(0x1B);
    pub const NCCH_SECURE2: Self = Self(0x25);
    pub const NCCH_SECURE1: Self = Self(0x2C);
    pub const APT_WRAP: Self = Self(0x31);
    pub const TICKET_COMMON: Self = Self(0x3D);

    pub fn new(id: usize) -> KeyResult<Self> {
        if id < MAX_KEY_SLOT {
            Ok(Self(id as u8))
        } else {
            Err(KeyError::SlotOutOfRange(id))
        }
    }
    pub fn get(self) -> u8 {
        self.0
    }
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
    pub fn all() -> impl Iterator<Item = KeySlotId> {
        (0..MAX_KEY_SLOT as u8).map(KeySlotId)
    }
}

impl TryFrom<usize> for KeySlotId {
    type Error = KeyError;

    fn try_from(id: usize) -> KeyResult<Self> {
        Self::new(id)
    }
}

impl TryFrom<u8> for KeySlotId {
    type Error = KeyError;

    fn try_from(id: u8) -> KeyResult<Self> {
        Self::new(id as usize)
    }
}

impl fmt::Display for KeySlotId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:02X}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Eq, Hash, PartialEq)]
pub enum KeyType {
    X,
    Y,
    N,
}

impl TryFrom<char> for KeyType {
    type Error = KeyError;

    fn try_from(c: char) -> KeyResult<Self> {
        match c {
            'X' => Ok(Self::X),
            'Y' => Ok(Self::Y),
            'N' => Ok(Self::N),
            other => Err(KeyError::InvalidKeyType(other)),
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let string = match self {
            Self::X => "X",
            Self::Y => "Y",
            Self::N => "N",
        };
        f.write_str(string)
    }
}

/// Name of a key as written in a key source
#[derive(Debug, Clone, Copy, Eq, Hash, PartialEq)]
pub enum KeyIndex {
    Generator,
    Slot(KeySlotId, KeyType),
}

impl fmt::Display for KeyIndex {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Generator => f.write_str("generator"),
            Self::Slot(slot, ty) => write!(f, "slot0x{:02X}Key{ty}", slot.get()),
        }
    }
}

impl FromStr for KeyIndex {
    type Err = KeyError;

    /// Accepts `generator` or `slot0xHHKeyT`, where `HH` is one or two hex
    /// digits and `T` is one of `X`, `Y`, `N`.
    fn from_str(name: &str) -> KeyResult<Self> {
        if name == "generator" {
            return Ok(Self::Generator);
        }

        let invalid = || KeyError::InvalidKeyName(name.to_string());
        let (digits, ty) = name
            .strip_prefix("slot0x")
            .and_then(|rest| rest.split_once("Key"))
            .ok_or_else(invalid)?;

        if digits.is_empty() || digits.len() > 2 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        let slot = usize::from_str_radix(digits, 16).map_err(|_| invalid())?;

        let mut chars = ty.chars();
        let ty = match (chars.next(), chars.next()) {
            (Some(c), None) => KeyType::try_from(c)?,
            _ => return Err(invalid()),
        };

        Ok(Self::Slot(KeySlotId::new(slot)?, ty))
    }
}

/// Hardware key scrambler: `rol(((rol(x, 2) ^ y) + generator) mod 2^128, 87)`,
/// with keys read as big-endian integers.
pub fn generate_normal_key(x: &AesKey, y: &AesKey, generator: &AesKey) -> AesKey {
    let x = u128::from_be_bytes(*x);
    let y = u128::from_be_bytes(*y);
    let generator = u128::from_be_bytes(*generator);

    (x.rotate_left(2) ^ y)
        .wrapping_add(generator)
        .rotate_left(87)
        .to_be_bytes()
}
