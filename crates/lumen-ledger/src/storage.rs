// Persisted state layout and the store seam.
//
// Keys carry a `(namespace, jet-prefix, pulse, hash)` structure so that
// a range scan within a jet and pulse window is contiguous. Record,
// blob and drop writes are write-once: a duplicate write is reported
// and keeps the existing value, which is what makes SetRecord
// idempotent under races.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use lumen_core::pulse::PulseNumber;
use lumen_core::reference::JetId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Namespace {
    Lifeline,
    Record,
    Blob,
    Drop,
}

impl Namespace {
    pub fn as_byte(&self) -> u8 {
        match self {
            Namespace::Lifeline => 0x01,
            Namespace::Record => 0x02,
            Namespace::Blob => 0x03,
            Namespace::Drop => 0x04,
        }
    }
}

/// `[ns:1][jet:9][pulse:4][hash:32]`
pub fn entry_key(ns: Namespace, jet: &JetId, pulse: PulseNumber, hash: &[u8; 32]) -> Vec<u8> {
    let mut key = Vec::with_capacity(46);
    key.push(ns.as_byte());
    key.extend_from_slice(&jet.to_key_bytes());
    key.extend_from_slice(&pulse.to_be_bytes());
    key.extend_from_slice(hash);
    key
}

/// `[ns:1][jet:9][pulse:4]`
pub fn drop_key(jet: &JetId, pulse: PulseNumber) -> Vec<u8> {
    let mut key = Vec::with_capacity(14);
    key.push(Namespace::Drop.as_byte());
    key.extend_from_slice(&jet.to_key_bytes());
    key.extend_from_slice(&pulse.to_be_bytes());
    key
}

/// Pulse component of a key, if the key is well-formed.
pub fn key_pulse(key: &[u8]) -> Option<PulseNumber> {
    let bytes = key.get(10..14)?;
    Some(PulseNumber(u32::from_be_bytes(
        bytes.try_into().ok()?,
    )))
}

/// Zero the jet-prefix portion so the heavy recipient can merge by
/// content identity.
pub fn nullify_jet(key: &[u8]) -> Vec<u8> {
    let mut out = key.to_vec();
    for byte in out.iter_mut().take(10).skip(1) {
        *byte = 0;
    }
    out
}

/// Store seam. The light node keeps everything in memory; heavy nodes
/// bring their own disk-backed implementation.
pub trait LedgerStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /// Write-once insert. Returns false (and keeps the existing value)
    /// when the key is already present.
    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> bool;

    /// Unconditional overwrite; used for mutable indexes.
    fn set(&self, key: Vec<u8>, value: Vec<u8>);

    /// All entries of a namespace whose pulse lies in `[from, to]`.
    fn scan(
        &self,
        ns: Namespace,
        from: PulseNumber,
        to: PulseNumber,
    ) -> Vec<(Vec<u8>, Vec<u8>)>;
}

#[derive(Default)]
pub struct MemoryStore {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::default())
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

impl LedgerStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.map.read().get(key).cloned()
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> bool {
        let mut map = self.map.write();
        if map.contains_key(&key) {
            return false;
        }
        map.insert(key, value);
        true
    }

    fn set(&self, key: Vec<u8>, value: Vec<u8>) {
        self.map.write().insert(key, value);
    }

    fn scan(
        &self,
        ns: Namespace,
        from: PulseNumber,
        to: PulseNumber,
    ) -> Vec<(Vec<u8>, Vec<u8>)> {
        let prefix = [ns.as_byte()];
        self.map
            .read()
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.first() == Some(&ns.as_byte()))
            .filter(|(k, _)| {
                key_pulse(k).is_some_and(|p| p >= from && p <= to)
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
