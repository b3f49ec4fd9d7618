//! # Map Mirror — per-listener copy of a device memory map
//!
//! Sessions answer reads from the mirror and buffer writes into a pending
//! list; the orchestrator drains the pending writes into the device and
//! pushes the device's snapshot back, once per tick. The mirror is locked
//! per request batch, never per byte, and a session that dies mid-frame
//! leaves nothing behind — writes are appended only after the full
//! request has been parsed and validated.
//!
//! Address validity is the mirror's size: each space covers `0..size`
//! contiguously (the per-protocol window the listener advertises), and
//! anything outside is an illegal address at the protocol layer.

use gridforge_core::{AddressSpace, MemKey, MemValue, MemorySnapshot};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct MirrorSizes {
    pub coils: u16,
    pub discrete_inputs: u16,
    pub holding_registers: u16,
    pub input_registers: u16,
}

impl Default for MirrorSizes {
    fn default() -> Self {
        Self {
            coils: 64,
            discrete_inputs: 64,
            holding_registers: 64,
            input_registers: 64,
        }
    }
}

impl MirrorSizes {
    pub fn uniform(size: u16) -> Self {
        Self {
            coils: size,
            discrete_inputs: size,
            holding_registers: size,
            input_registers: size,
        }
    }

    pub fn size_of(&self, space: AddressSpace) -> u16 {
        match space {
            AddressSpace::Coils => self.coils,
            AddressSpace::DiscreteInputs => self.discrete_inputs,
            AddressSpace::HoldingRegisters => self.holding_registers,
            AddressSpace::InputRegisters => self.input_registers,
        }
    }
}

struct MirrorInner {
    coils: Vec<bool>,
    discrete_inputs: Vec<bool>,
    holding_registers: Vec<u16>,
    input_registers: Vec<u16>,
    pending: Vec<(MemKey, MemValue)>,
}

pub struct MapMirror {
    sizes: MirrorSizes,
    inner: Mutex<MirrorInner>,
    pushes: AtomicU64,
    writes_buffered: AtomicU64,
}

impl MapMirror {
    pub fn new(sizes: MirrorSizes) -> Self {
        Self {
            sizes,
            inner: Mutex::new(MirrorInner {
                coils: vec![false; sizes.coils as usize],
                discrete_inputs: vec![false; sizes.discrete_inputs as usize],
                holding_registers: vec![0; sizes.holding_registers as usize],
                input_registers: vec![0; sizes.input_registers as usize],
                pending: Vec::new(),
            }),
            pushes: AtomicU64::new(0),
            writes_buffered: AtomicU64::new(0),
        }
    }

    pub fn sizes(&self) -> MirrorSizes {
        self.sizes
    }

    /// Whether `[start, start+count)` lies entirely inside the mapped
    /// window of a space.
    pub fn range_mapped(&self, space: AddressSpace, start: u16, count: u16) -> bool {
        let size = self.sizes.size_of(space) as u32;
        (start as u32) + (count as u32) <= size
    }

    // ── Session-side access ─────────────────────────────────────────────

    /// Read a run of bits from a bit space. Caller has validated the range.
    pub fn read_bits(&self, space: AddressSpace, start: u16, count: u16) -> Vec<bool> {
        let inner = self.inner.lock();
        let bank = match space {
            AddressSpace::Coils => &inner.coils,
            AddressSpace::DiscreteInputs => &inner.discrete_inputs,
            _ => return Vec::new(),
        };
        bank[start as usize..(start + count) as usize].to_vec()
    }

    /// Read a run of words from a word space. Caller has validated the range.
    pub fn read_words(&self, space: AddressSpace, start: u16, count: u16) -> Vec<u16> {
        let inner = self.inner.lock();
        let bank = match space {
            AddressSpace::HoldingRegisters => &inner.holding_registers,
            AddressSpace::InputRegisters => &inner.input_registers,
            _ => return Vec::new(),
        };
        bank[start as usize..(start + count) as usize].to_vec()
    }

    /// Apply a validated batch of client writes: visible to subsequent
    /// reads on any session immediately, and queued for the next
    /// orchestrator drain. One lock, whole batch.
    pub fn write_batch(&self, writes: &[(MemKey, MemValue)]) {
        let mut inner = self.inner.lock();
        for (key, value) in writes {
            match (key.space, value) {
                (AddressSpace::Coils, MemValue::Bit(b)) => {
                    inner.coils[key.index as usize] = *b;
                }
                (AddressSpace::HoldingRegisters, MemValue::Word(w)) => {
                    inner.holding_registers[key.index as usize] = *w;
                }
                // Read-only spaces are unreachable by construction: no
                // write function code addresses them.
                _ => continue,
            }
            inner.pending.push((*key, *value));
        }
        self.writes_buffered
            .fetch_add(writes.len() as u64, Ordering::Relaxed);
    }

    // ── Orchestrator-side sync ──────────────────────────────────────────

    /// Device → mirror: copy the device snapshot into the mirror windows.
    pub fn push_telemetry(&self, snapshot: &MemorySnapshot) {
        let mut inner = self.inner.lock();
        for (&i, &b) in &snapshot.coils {
            if i < self.sizes.coils {
                inner.coils[i as usize] = b;
            }
        }
        for (&i, &b) in &snapshot.discrete_inputs {
            if i < self.sizes.discrete_inputs {
                inner.discrete_inputs[i as usize] = b;
            }
        }
        for (&i, &w) in &snapshot.holding_registers {
            if i < self.sizes.holding_registers {
                inner.holding_registers[i as usize] = w;
            }
        }
        for (&i, &w) in &snapshot.input_registers {
            if i < self.sizes.input_registers {
                inner.input_registers[i as usize] = w;
            }
        }
        self.pushes.fetch_add(1, Ordering::Relaxed);
    }

    /// Mirror → device: take every client write buffered since the last
    /// drain, in arrival order.
    pub fn drain_writes(&self) -> Vec<(MemKey, MemValue)> {
        std::mem::take(&mut self.inner.lock().pending)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn push_count(&self) -> u64 {
        self.pushes.load(Ordering::Relaxed)
    }

    pub fn writes_buffered(&self) -> u64 {
        self.writes_buffered.load(Ordering::Relaxed)
    }
}
