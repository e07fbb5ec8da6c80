// Replication to heavy: walks a pulse window and emits bytes-bounded
// chunks with the jet prefix nullified, so the recipient merges entries
// by content identity regardless of how jets were split locally.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use lumen_core::pulse::PulseNumber;

use crate::storage::{nullify_jet, LedgerStore, Namespace};

/// One wire unit of replication toward heavy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaChunk {
    pub entries: Vec<(Vec<u8>, Vec<u8>)>,
    pub bytes: usize,
}

pub struct ReplicaIterator {
    pending: VecDeque<(Vec<u8>, Vec<u8>)>,
    chunk_bytes: usize,
}

impl ReplicaIterator {
    /// Snapshot every namespace over `[start, end]`.
    pub fn new(
        store: &Arc<dyn LedgerStore>,
        start: PulseNumber,
        end: PulseNumber,
        chunk_bytes: usize,
    ) -> ReplicaIterator {
        let mut pending = VecDeque::new();
        for ns in [
            Namespace::Lifeline,
            Namespace::Record,
            Namespace::Blob,
            Namespace::Drop,
        ] {
            for (key, value) in store.scan(ns, start, end) {
                pending.push_back((nullify_jet(&key), value));
            }
        }
        ReplicaIterator {
            pending,
            chunk_bytes: chunk_bytes.max(1),
        }
    }
}

impl Iterator for ReplicaIterator {
    type Item = ReplicaChunk;

    fn next(&mut self) -> Option<ReplicaChunk> {
        if self.pending.is_empty() {
            return None;
        }
        let mut entries = Vec::new();
        let mut bytes = 0usize;
        while let Some((key, value)) = self.pending.front() {
            let entry_bytes = key.len() + value.len();
            // Always emit at least one entry, even oversized ones.
            if !entries.is_empty() && bytes + entry_bytes > self.chunk_bytes {
                break;
            }
            bytes += entry_bytes;
            let entry = self.pending.pop_front().expect("front checked");
            entries.push(entry);
        }
        Some(ReplicaChunk { entries, bytes })
    }
}
