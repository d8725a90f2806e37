use std::fmt;

use tracing::debug;

use super::{generate_normal_key, AesKey, KeyIndex, KeySlotId, KeyType, MAX_KEY_SLOT};

#[derive(Clone, Copy, PartialEq, Eq)]
enum NormalKey {
    Derived(AesKey),
    Direct(AesKey),
}

impl NormalKey {
    fn key(&self) -> &AesKey {
        match self {
            Self::Derived(key) | Self::Direct(key) => key,
        }
    }
}

/// Observable state of a single key slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Empty,
    /// Exactly one of X and Y is known
    PartiallyKeyed,
    /// X and Y are known, the generator constant is not
    FullyKeyed,
    Derived,
    DirectNormal,
}

#[derive(Clone, Default)]
pub struct KeySlot {
    x: Option<AesKey>,
    y: Option<AesKey>,
    normal: Option<NormalKey>,
}

impl KeySlot {
    pub fn x(&self) -> Option<&AesKey> {
        self.x.as_ref()
    }
    pub fn y(&self) -> Option<&AesKey> {
        self.y.as_ref()
    }
    pub fn normal(&self) -> Option<&AesKey> {
        self.normal.as_ref().map(NormalKey::key)
    }
    pub fn state(&self) -> SlotState {
        match (self.normal, self.x.is_some(), self.y.is_some()) {
            (Some(NormalKey::Direct(_)), _, _) => SlotState::DirectNormal,
            (Some(NormalKey::Derived(_)), _, _) => SlotState::Derived,
            (None, true, true) => SlotState::FullyKeyed,
            (None, false, false) => SlotState::Empty,
            (None, _, _) => SlotState::PartiallyKeyed,
        }
    }
    fn generate_normal_key(&mut self, generator: Option<&AesKey>) {
        if let (Some(x), Some(y), Some(generator)) = (&self.x, &self.y, generator) {
            self.normal = Some(NormalKey::Derived(generate_normal_key(x, y, generator)));
        }
    }
    fn clear(&mut self) {
        *self = Self::default();
    }
}

impl fmt::Debug for KeySlot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("KeySlot")
            .field("x", &self.x.is_some())
            .field("y", &self.y.is_some())
            .field("state", &self.state())
            .finish()
    }
}

/// The 64 AES key slots plus the shared generator constant.
///
/// Populate it once with [`KeyStore::init_keys`] (or the individual setters)
/// before handing out shared references to decryption code; the store does no
/// locking of its own.
#[derive(Clone)]
pub struct KeyStore {
    slots: [KeySlot; MAX_KEY_SLOT],
    generator: Option<AesKey>,
}

impl Default for KeyStore {
    fn default() -> Self {
        Self {
            slots: std::array::from_fn(|_| KeySlot::default()),
            generator: None,
        }
    }
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn clear_all_keys(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.clear();
        }
        self.generator = None;
    }
    pub fn slot(&self, slot: KeySlotId) -> &KeySlot {
        &self.slots[slot.index()]
    }
    pub fn generator_constant(&self) -> Option<&AesKey> {
        self.generator.as_ref()
    }

    /// Sets the generator constant and derives every slot that already has
    /// both X and Y, except slots whose Normal key was set directly.
    pub fn set_generator_constant(&mut self, key: AesKey) {
        self.generator = Some(key);
        for slot in self.slots.iter_mut() {
            if !matches!(slot.normal, Some(NormalKey::Direct(_))) {
                slot.generate_normal_key(self.generator.as_ref());
            }
        }
    }

    /// Stores X unless the slot already has one. Returns whether it was taken.
    pub fn set_key_x(&mut self, slot: KeySlotId, key: AesKey) -> bool {
        if self.slots[slot.index()].x.is_some() {
            debug!(%slot, "keyX already set, ignoring");
            return false;
        }
        self.replace_key_x(slot, key);
        true
    }

    /// Stores Y unless the slot already has one. Returns whether it was taken.
    pub fn set_key_y(&mut self, slot: KeySlotId, key: AesKey) -> bool {
        if self.slots[slot.index()].y.is_some() {
            debug!(%slot, "keyY already set, ignoring");
            return false;
        }
        self.replace_key_y(slot, key);
        true
    }

    /// Overwrites X and re-derives the Normal key when possible
    pub fn replace_key_x(&mut self, slot: KeySlotId, key: AesKey) {
        let generator = self.generator;
        let slot = &mut self.slots[slot.index()];
        slot.x = Some(key);
        slot.generate_normal_key(generator.as_ref());
    }

    /// Overwrites Y and re-derives the Normal key when possible
    pub fn replace_key_y(&mut self, slot: KeySlotId, key: AesKey) {
        let generator = self.generator;
        let slot = &mut self.slots[slot.index()];
        slot.y = Some(key);
        slot.generate_normal_key(generator.as_ref());
    }

    pub fn set_normal_key(&mut self, slot: KeySlotId, key: AesKey) {
        self.slots[slot.index()].normal = Some(NormalKey::Direct(key));
    }

    /// Applies a key read from a key source. X and Y only fill empty
    /// components, Normal keys and the generator always overwrite.
    pub fn set_key(&mut self, idx: KeyIndex, key: AesKey) -> bool {
        match idx {
            KeyIndex::Generator => {
                self.set_generator_constant(key);
                true
            }
            KeyIndex::Slot(slot, KeyType::X) => self.set_key_x(slot, key),
            KeyIndex::Slot(slot, KeyType::Y) => self.set_key_y(slot, key),
            KeyIndex::Slot(slot, KeyType::N) => {
                self.set_normal_key(slot, key);
                true
            }
        }
    }

    pub fn is_normal_key_available(&self, slot: KeySlotId) -> bool {
        self.slots[slot.index()].normal.is_some()
    }

    /// Normal key of `slot`, or all zeroes when there is none
    pub fn normal_key(&self, slot: KeySlotId) -> AesKey {
        self.slot(slot).normal().copied().unwrap_or_default()
    }

    /// AES-128 block cipher keyed with the Normal key of `slot`
    #[cfg(feature = "crypto")]
    pub fn cipher(&self, slot: KeySlotId) -> Option<aes::Aes128> {
        use aes::cipher::KeyInit;

        self.slot(slot)
            .normal()
            .map(|key| aes::Aes128::new(key.into()))
    }
}

impl fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut map = f.debug_map();
        for (id, slot) in KeySlotId::all().zip(self.slots.iter()) {
            if slot.state() != SlotState::Empty {
                map.entry(&id.get(), slot);
            }
        }
        map.finish()
    }
}
