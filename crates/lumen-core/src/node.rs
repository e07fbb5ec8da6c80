// Node identity: the (ref, role, public key, address, short id) tuple.

use serde::{Deserialize, Serialize};

use crate::crypto::PublicKey;
use crate::reference::{NodeRef, ShortNodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeRole {
    /// Contract execution.
    Virtual,
    /// Recent-jet ownership, in-memory ledger service.
    LightMaterial,
    /// Long-term disk-backed archive.
    HeavyMaterial,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Virtual => "virtual",
            NodeRole::LightMaterial => "light_material",
            NodeRole::HeavyMaterial => "heavy_material",
        }
    }
}

/// A network participant. The `reference` is stable across pulses; the
/// `short_id` is scoped to a pulse and serves as the bitset index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub reference: NodeRef,
    pub role: NodeRole,
    pub public_key: PublicKey,
    pub address: String,
    pub short_id: ShortNodeId,
}

impl Node {
    pub fn new(
        reference: NodeRef,
        role: NodeRole,
        public_key: PublicKey,
        address: String,
        short_id: ShortNodeId,
    ) -> Self {
        Node {
            reference,
            role,
            public_key,
            address,
            short_id,
        }
    }
}
