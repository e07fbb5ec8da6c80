// Phase packets exchanged between active nodes during a consensus
// round. Every packet carries an outer signature over its body hash.

use serde::{Deserialize, Serialize};

use lumen_core::crypto::{hash_with_tag, tag, Digest, KeyPair, PublicKey};
use lumen_core::error::CoreError;
use lumen_core::pulse::PulseNumber;
use lumen_core::reference::NodeRef;

use crate::bitset::Bitset;
use crate::claims::{Claim, JoinClaim, PendingClaim};
use crate::merkle::PulseProof;

fn body_hash<T: Serialize>(body: &T) -> Digest {
    let bytes = bincode::serialize(body).expect("packet encoding cannot fail");
    hash_with_tag(tag::PULSE, &[&bytes])
}

macro_rules! signed_packet {
    ($name:ident) => {
        impl $name {
            pub fn sign(&mut self, keypair: &KeyPair) {
                self.signature.clear();
                let hash = body_hash(self);
                self.signature = keypair.sign(&hash);
            }

            pub fn verify(&self, key: &PublicKey) -> Result<(), CoreError> {
                let mut unsigned = self.clone();
                unsigned.signature.clear();
                key.verify(&body_hash(&unsigned), &self.signature)
            }
        }
    };
}

/// Phase 1: own pulse proof plus any pending claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase1Packet {
    pub pulse_number: PulseNumber,
    pub pulse_hash: Digest,
    pub proof: PulseProof,
    pub claims: Vec<PendingClaim>,
    pub sender: NodeRef,
    pub signature: Vec<u8>,
}

signed_packet!(Phase1Packet);

/// Phase 2: signature over the sender's globule hash plus its vote
/// bitset. The receiver verifies the globule signature against its own
/// computed globule hash; a failure means either a bad signature or a
/// diverging globule view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase2Packet {
    pub pulse_number: PulseNumber,
    pub globule_hash_signature: Vec<u8>,
    pub bitset: Bitset,
    pub sender: NodeRef,
    pub signature: Vec<u8>,
}

signed_packet!(Phase2Packet);

/// Phase 2.1 supplementary responses for columns that lacked data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase21Response {
    /// A vouched vote for a node the origin is missing: the unsigned
    /// join claim plus that node's pulse proof.
    MissingNodeSupplementaryVote {
        node_index: u32,
        claim: JoinClaim,
        proof: PulseProof,
    },
    /// A claim the origin is missing.
    MissingNodeClaim { node_index: u32, claim: Claim },
}

/// Phase 3: final bitset and globule hash redistribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase3Packet {
    pub pulse_number: PulseNumber,
    pub bitset: Bitset,
    pub globule_hash: Digest,
    pub sender: NodeRef,
    pub signature: Vec<u8>,
}

signed_packet!(Phase3Packet);
