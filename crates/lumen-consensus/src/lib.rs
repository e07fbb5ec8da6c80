pub mod bitset;
pub mod claims;
pub mod matrix;
pub mod merkle;
pub mod node_keeper;
pub mod packets;
pub mod phases;

pub use bitset::{Bitset, BitsetCell};
pub use claims::{Claim, ClaimHandler, JoinClaim};
pub use matrix::{Phase2Result, StateMatrix};
pub use node_keeper::NodeKeeper;
pub use phases::{
    ConsensusError, EntryProvider, PhaseEngine, PhaseExchange, PhaseState, PulseCommit,
};
