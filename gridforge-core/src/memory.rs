//! # Memory Maps — typed per-device address spaces
//!
//! Each device exposes the four Modbus-style address spaces:
//! - **coils** — single-bit, writable by external clients
//! - **discrete inputs** — single-bit, written only by the owning device
//! - **holding registers** — 16-bit words, writable by external clients
//! - **input registers** — 16-bit words, written only by the owning device
//!
//! Internally each space is a sparse arena indexed by `u16`; the string
//! syntax `"holding_registers[10]"` is a boundary convenience that is
//! canonicalized to `(AddressSpace, index)` before any access. Named
//! aliases (e.g. `speed_setpoint_rpm`) resolve to canonical keys at
//! write time.

use crate::error::{CoreError, CoreResult};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum AddressSpace {
    Coils,
    DiscreteInputs,
    HoldingRegisters,
    InputRegisters,
}

impl AddressSpace {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressSpace::Coils => "coils",
            AddressSpace::DiscreteInputs => "discrete_inputs",
            AddressSpace::HoldingRegisters => "holding_registers",
            AddressSpace::InputRegisters => "input_registers",
        }
    }

    /// Bit-valued (coil / discrete input) vs word-valued space.
    pub fn is_bit(&self) -> bool {
        matches!(self, AddressSpace::Coils | AddressSpace::DiscreteInputs)
    }

    /// Spaces external clients are allowed to write through a protocol.
    pub fn externally_writable(&self) -> bool {
        matches!(
            self,
            AddressSpace::Coils | AddressSpace::HoldingRegisters
        )
    }
}

/// Canonical address: one space, one 16-bit index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct MemKey {
    pub space: AddressSpace,
    pub index: u16,
}

impl MemKey {
    pub const fn coil(index: u16) -> Self {
        Self { space: AddressSpace::Coils, index }
    }
    pub const fn discrete(index: u16) -> Self {
        Self { space: AddressSpace::DiscreteInputs, index }
    }
    pub const fn holding(index: u16) -> Self {
        Self { space: AddressSpace::HoldingRegisters, index }
    }
    pub const fn input(index: u16) -> Self {
        Self { space: AddressSpace::InputRegisters, index }
    }

    /// Parse the canonical `"<space>[<index>]"` syntax.
    pub fn parse(text: &str) -> CoreResult<Self> {
        let (space_str, rest) = text
            .split_once('[')
            .ok_or_else(|| CoreError::BadAddress(text.into()))?;
        let index_str = rest
            .strip_suffix(']')
            .ok_or_else(|| CoreError::BadAddress(text.into()))?;
        let space = match space_str {
            "coils" => AddressSpace::Coils,
            "discrete_inputs" => AddressSpace::DiscreteInputs,
            "holding_registers" => AddressSpace::HoldingRegisters,
            "input_registers" => AddressSpace::InputRegisters,
            _ => return Err(CoreError::BadAddress(text.into())),
        };
        let index: u16 = index_str
            .parse()
            .map_err(|_| CoreError::BadAddress(text.into()))?;
        Ok(Self { space, index })
    }
}

impl fmt::Display for MemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.space.as_str(), self.index)
    }
}

/// A typed memory value: bit or 16-bit word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum MemValue {
    Bit(bool),
    Word(u16),
}

impl MemValue {
    pub fn as_bit(&self) -> Option<bool> {
        match self {
            MemValue::Bit(b) => Some(*b),
            MemValue::Word(_) => None,
        }
    }
    pub fn as_word(&self) -> Option<u16> {
        match self {
            MemValue::Word(w) => Some(*w),
            MemValue::Bit(_) => None,
        }
    }
}

impl From<bool> for MemValue {
    fn from(b: bool) -> Self {
        MemValue::Bit(b)
    }
}

impl From<u16> for MemValue {
    fn from(w: u16) -> Self {
        MemValue::Word(w)
    }
}

// ── Sparse arena ────────────────────────────────────────────────────────────

/// Sparse `u16`-indexed arena. Grows on demand; absent slots stay `None`.
#[derive(Debug, Clone, Default)]
struct SparseArena<T: Copy> {
    slots: Vec<Option<T>>,
}

impl<T: Copy> SparseArena<T> {
    fn get(&self, index: u16) -> Option<T> {
        self.slots.get(index as usize).copied().flatten()
    }

    fn set(&mut self, index: u16, value: T) {
        let idx = index as usize;
        if idx >= self.slots.len() {
            self.slots.resize(idx + 1, None);
        }
        self.slots[idx] = Some(value);
    }

    fn contains(&self, index: u16) -> bool {
        self.slots
            .get(index as usize)
            .map_or(false, Option::is_some)
    }

    fn iter_present(&self) -> impl Iterator<Item = (u16, T)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.map(|v| (i as u16, v)))
    }

    fn present_count(&self) -> usize {
        self.slots.iter().filter(|v| v.is_some()).count()
    }
}

// ── Memory map ──────────────────────────────────────────────────────────────

/// Ordered snapshot of a memory map, safe to hand across threads.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MemorySnapshot {
    pub coils: BTreeMap<u16, bool>,
    pub discrete_inputs: BTreeMap<u16, bool>,
    pub holding_registers: BTreeMap<u16, u16>,
    pub input_registers: BTreeMap<u16, u16>,
}

impl MemorySnapshot {
    pub fn get(&self, key: MemKey) -> Option<MemValue> {
        match key.space {
            AddressSpace::Coils => self.coils.get(&key.index).map(|b| MemValue::Bit(*b)),
            AddressSpace::DiscreteInputs => {
                self.discrete_inputs.get(&key.index).map(|b| MemValue::Bit(*b))
            }
            AddressSpace::HoldingRegisters => {
                self.holding_registers.get(&key.index).map(|w| MemValue::Word(*w))
            }
            AddressSpace::InputRegisters => {
                self.input_registers.get(&key.index).map(|w| MemValue::Word(*w))
            }
        }
    }

    pub fn bit(&self, key: MemKey) -> bool {
        self.get(key).and_then(|v| v.as_bit()).unwrap_or(false)
    }

    pub fn word(&self, key: MemKey) -> u16 {
        self.get(key).and_then(|v| v.as_word()).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.coils.len()
            + self.discrete_inputs.len()
            + self.holding_registers.len()
            + self.input_registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The four address spaces of one device.
#[derive(Debug, Clone, Default)]
pub struct MemoryMap {
    coils: SparseArena<bool>,
    discrete_inputs: SparseArena<bool>,
    holding_registers: SparseArena<u16>,
    input_registers: SparseArena<u16>,
    aliases: HashMap<String, MemKey>,
}

impl MemoryMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: MemKey) -> Option<MemValue> {
        match key.space {
            AddressSpace::Coils => self.coils.get(key.index).map(MemValue::Bit),
            AddressSpace::DiscreteInputs => {
                self.discrete_inputs.get(key.index).map(MemValue::Bit)
            }
            AddressSpace::HoldingRegisters => {
                self.holding_registers.get(key.index).map(MemValue::Word)
            }
            AddressSpace::InputRegisters => {
                self.input_registers.get(key.index).map(MemValue::Word)
            }
        }
    }

    /// Typed write. A bit into a register space (or the reverse) is a
    /// `TypeMismatch`, never a silent coercion.
    pub fn set(&mut self, key: MemKey, value: MemValue) -> CoreResult<()> {
        match (key.space.is_bit(), value) {
            (true, MemValue::Bit(b)) => {
                match key.space {
                    AddressSpace::Coils => self.coils.set(key.index, b),
                    _ => self.discrete_inputs.set(key.index, b),
                }
                Ok(())
            }
            (false, MemValue::Word(w)) => {
                match key.space {
                    AddressSpace::HoldingRegisters => {
                        self.holding_registers.set(key.index, w)
                    }
                    _ => self.input_registers.set(key.index, w),
                }
                Ok(())
            }
            (true, MemValue::Word(_)) => Err(CoreError::TypeMismatch {
                key: key.to_string(),
                expected: "bool",
            }),
            (false, MemValue::Bit(_)) => Err(CoreError::TypeMismatch {
                key: key.to_string(),
                expected: "u16",
            }),
        }
    }

    pub fn contains(&self, key: MemKey) -> bool {
        match key.space {
            AddressSpace::Coils => self.coils.contains(key.index),
            AddressSpace::DiscreteInputs => self.discrete_inputs.contains(key.index),
            AddressSpace::HoldingRegisters => {
                self.holding_registers.contains(key.index)
            }
            AddressSpace::InputRegisters => self.input_registers.contains(key.index),
        }
    }

    /// Register a named alias for a canonical key.
    pub fn define_alias(&mut self, name: &str, key: MemKey) {
        self.aliases.insert(name.to_string(), key);
    }

    /// Resolve an address string: canonical syntax first, then aliases.
    pub fn resolve(&self, address: &str) -> CoreResult<MemKey> {
        if let Ok(key) = MemKey::parse(address) {
            return Ok(key);
        }
        self.aliases
            .get(address)
            .copied()
            .ok_or_else(|| CoreError::BadAddress(address.into()))
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        MemorySnapshot {
            coils: self.coils.iter_present().collect(),
            discrete_inputs: self.discrete_inputs.iter_present().collect(),
            holding_registers: self.holding_registers.iter_present().collect(),
            input_registers: self.input_registers.iter_present().collect(),
        }
    }

    /// Apply a batch of typed writes. All-or-nothing is the caller's
    /// concern (the fabric holds the device lock across the call); a
    /// mismatched value aborts at that entry.
    pub fn apply(&mut self, writes: &[(MemKey, MemValue)]) -> CoreResult<()> {
        for (key, value) in writes {
            self.set(*key, *value)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.coils.present_count()
            + self.discrete_inputs.present_count()
            + self.holding_registers.present_count()
            + self.input_registers.present_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_parse_roundtrip() {
        let key = MemKey::parse("holding_registers[10]").unwrap();
        assert_eq!(key, MemKey::holding(10));
        assert_eq!(key.to_string(), "holding_registers[10]");
        assert_eq!(MemKey::parse("coils[0]").unwrap(), MemKey::coil(0));
        assert!(MemKey::parse("registers[1]").is_err());
        assert!(MemKey::parse("coils[abc]").is_err());
        assert!(MemKey::parse("coils").is_err());
    }

    #[test]
    fn test_typed_writes() {
        let mut map = MemoryMap::new();
        map.set(MemKey::coil(5), MemValue::Bit(true)).unwrap();
        map.set(MemKey::holding(3), MemValue::Word(1234)).unwrap();
        assert_eq!(map.get(MemKey::coil(5)), Some(MemValue::Bit(true)));
        assert_eq!(map.get(MemKey::holding(3)), Some(MemValue::Word(1234)));

        assert!(matches!(
            map.set(MemKey::coil(5), MemValue::Word(1)),
            Err(CoreError::TypeMismatch { .. })
        ));
        assert!(matches!(
            map.set(MemKey::input(0), MemValue::Bit(false)),
            Err(CoreError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_sparse_presence() {
        let mut map = MemoryMap::new();
        map.set(MemKey::input(100), MemValue::Word(7)).unwrap();
        assert!(map.contains(MemKey::input(100)));
        assert!(!map.contains(MemKey::input(99)));
        assert_eq!(map.get(MemKey::input(99)), None);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_alias_resolution() {
        let mut map = MemoryMap::new();
        map.define_alias("speed_setpoint_rpm", MemKey::holding(10));
        assert_eq!(
            map.resolve("speed_setpoint_rpm").unwrap(),
            MemKey::holding(10)
        );
        assert_eq!(map.resolve("coils[2]").unwrap(), MemKey::coil(2));
        assert!(map.resolve("nonsense").is_err());
    }

    #[test]
    fn test_snapshot_is_ordered_and_equal() {
        let mut map = MemoryMap::new();
        map.set(MemKey::holding(2), MemValue::Word(20)).unwrap();
        map.set(MemKey::holding(0), MemValue::Word(0)).unwrap();
        map.set(MemKey::coil(1), MemValue::Bit(true)).unwrap();
        let snap = map.snapshot();
        let keys: Vec<u16> = snap.holding_registers.keys().copied().collect();
        assert_eq!(keys, vec![0, 2]);
        assert_eq!(snap, map.snapshot());
        assert_eq!(snap.word(MemKey::holding(2)), 20);
        assert!(snap.bit(MemKey::coil(1)));
    }
}
