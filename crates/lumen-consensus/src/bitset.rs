// Per-node vote bitset exchanged in phase 2.
//
// INVARIANT: bitset length equals the unsync-list length for the pulse.
// The wire form packs two bits per cell and is a bijection with the
// cell vector (canonical form).

use serde::{Deserialize, Serialize};

use lumen_core::error::CoreError;
use lumen_core::node::Node;
use lumen_core::reference::NodeRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BitsetCell {
    Legit,
    TimedOut,
    Fraud,
}

impl BitsetCell {
    fn to_bits(self) -> u8 {
        match self {
            BitsetCell::Legit => 0b00,
            BitsetCell::TimedOut => 0b01,
            BitsetCell::Fraud => 0b10,
        }
    }

    fn from_bits(bits: u8) -> Result<Self, CoreError> {
        match bits {
            0b00 => Ok(BitsetCell::Legit),
            0b01 => Ok(BitsetCell::TimedOut),
            0b10 => Ok(BitsetCell::Fraud),
            other => Err(CoreError::Bus(format!("invalid bitset cell {other:#04b}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bitset {
    cells: Vec<BitsetCell>,
}

impl Bitset {
    /// A fresh bitset; absent votes start as timed-out.
    pub fn new(length: usize) -> Self {
        Bitset {
            cells: vec![BitsetCell::TimedOut; length],
        }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<BitsetCell> {
        self.cells.get(index).copied()
    }

    pub fn set(&mut self, index: usize, cell: BitsetCell) {
        if index < self.cells.len() {
            self.cells[index] = cell;
        }
    }

    pub fn cells(&self) -> &[BitsetCell] {
        &self.cells
    }

    /// Apply per-node cell changes; node refs are resolved to indices
    /// via the unsync list. An unknown ref fails with `UnknownNode`.
    pub fn apply_changes(
        &mut self,
        changes: &[(NodeRef, BitsetCell)],
        unsync_list: &[Node],
    ) -> Result<(), CoreError> {
        for (node_ref, cell) in changes {
            let index = unsync_list
                .iter()
                .position(|n| n.reference == *node_ref)
                .ok_or(CoreError::UnknownNode(*node_ref))?;
            self.cells[index] = *cell;
        }
        Ok(())
    }

    /// Canonical wire form: u32-LE length header, then two bits per
    /// cell packed little-endian within each byte.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + (self.cells.len() + 3) / 4);
        out.extend_from_slice(&(self.cells.len() as u32).to_le_bytes());
        let mut byte = 0u8;
        for (i, cell) in self.cells.iter().enumerate() {
            byte |= cell.to_bits() << ((i % 4) * 2);
            if i % 4 == 3 {
                out.push(byte);
                byte = 0;
            }
        }
        if self.cells.len() % 4 != 0 {
            out.push(byte);
        }
        out
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, CoreError> {
        if bytes.len() < 4 {
            return Err(CoreError::Bus("bitset too short".into()));
        }
        let length = u32::from_le_bytes(bytes[..4].try_into().expect("4 bytes")) as usize;
        let expected = 4 + (length + 3) / 4;
        if bytes.len() != expected {
            return Err(CoreError::Bus(format!(
                "bitset length mismatch: want {expected} bytes, got {}",
                bytes.len()
            )));
        }
        let mut cells = Vec::with_capacity(length);
        for i in 0..length {
            let byte = bytes[4 + i / 4];
            let bits = (byte >> ((i % 4) * 2)) & 0b11;
            cells.push(BitsetCell::from_bits(bits)?);
        }
        Ok(Bitset { cells })
    }
}
