//! Light-material ledger node internals.
//!
//! The artifact handler serves the ledger bus protocol for the jets
//! this node owns, backed by a binary radix jet tree, a coalescing jet
//! fetcher, TTL-based recent storage with pending-request admission,
//! write-once record storage and a bytes-bounded replica iterator for
//! heavy replication.

pub mod artifact;
pub mod fetcher;
pub mod jet;
pub mod recent;
pub mod replica;
pub mod storage;

pub use artifact::ArtifactHandler;
pub use fetcher::JetFetcher;
pub use jet::{JetMeta, JetTree};
pub use recent::{PendingEntry, RecentStorage, RecentTracker};
pub use replica::{ReplicaChunk, ReplicaIterator};
pub use storage::{drop_key, entry_key, nullify_jet, LedgerStore, MemoryStore, Namespace};
