// Tunables for the consensus, conveyor and ledger subsystems. Loaded
// from layered TOML / environment by the node binary.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub consensus: ConsensusSettings,
    pub conveyor: ConveyorSettings,
    pub ledger: LedgerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusSettings {
    /// Supermajority fraction for phase-2 column acceptance; the quorum
    /// is `floor(n * num / den) + 1` (2f+1 intent).
    pub majority_num: u32,
    pub majority_den: u32,
    /// Per-peer phase exchange timeout.
    pub phase_timeout_ms: u64,
}

impl ConsensusSettings {
    /// Quorum size for an unsync list of `n` nodes.
    pub fn quorum(&self, n: usize) -> usize {
        (n * self.majority_num as usize) / self.majority_den as usize + 1
    }
}

impl Default for ConsensusSettings {
    fn default() -> Self {
        ConsensusSettings {
            majority_num: 2,
            majority_den: 3,
            phase_timeout_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConveyorSettings {
    /// Pulse number distance between consecutive pulses.
    pub pulse_delta: u32,
    /// How many past slots are retained before eviction.
    pub past_slots: usize,
}

impl Default for ConveyorSettings {
    fn default() -> Self {
        ConveyorSettings {
            pulse_delta: 10,
            past_slots: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSettings {
    /// Admission cap for SetRecord of requests, counted across jets.
    pub max_pending_requests: usize,
    /// Pulses a light node retains before data is heavy-only.
    pub light_chain_limit: u32,
    /// Record count at which a jet splits.
    pub jet_split_threshold: usize,
    /// Default TTL for recent objects, in pulses.
    pub recent_ttl_pulses: u32,
    /// Bound on concurrent peer queries in the jet fetcher.
    pub fetch_parallelism: usize,
    /// Byte budget per replica chunk.
    pub replica_chunk_bytes: usize,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        LedgerSettings {
            max_pending_requests: 1_000,
            light_chain_limit: 5,
            jet_split_threshold: 10_000,
            recent_ttl_pulses: 30,
            fetch_parallelism: 8,
            replica_chunk_bytes: 1 << 20,
        }
    }
}
