// Merkle calculator: per-node pulse proofs, aggregated globule proofs
// and the cloud chain.
//
// SAFETY INVARIANTS:
// 1. Aggregation order is deterministic: node proofs sorted by node
//    ref, globule entries by globule id
// 2. Each level prepends a 1-byte domain tag (pulse | globule | cloud)
//    so cross-level collisions are structurally impossible
// 3. Two nodes with identical proof sets and prev cloud hash produce
//    byte-identical globule hashes

use serde::{Deserialize, Serialize};

use lumen_core::crypto::{hash_with_tag, tag, Digest, KeyPair, PublicKey};
use lumen_core::error::CoreError;
use lumen_core::pulse::PulseNumber;
use lumen_core::reference::NodeRef;

/// A node's input to the pulse-proof computation: its view of the
/// previous cloud hash and the roots of the jets it holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PulseEntry {
    pub pulse: PulseNumber,
    pub entropy: [u8; 32],
    pub prev_cloud_hash: Digest,
    pub jet_roots: Vec<Digest>,
}

impl PulseEntry {
    /// The pulse hash every proof is anchored to.
    pub fn pulse_hash(&self) -> Digest {
        hash_with_tag(
            tag::PULSE,
            &[
                &self.pulse.to_be_bytes(),
                &self.entropy,
                &self.prev_cloud_hash,
            ],
        )
    }

    /// The node's state hash: covers its view of its jet roots.
    pub fn state_hash(&self) -> Digest {
        let pulse_bytes = self.pulse.to_be_bytes();
        let mut parts: Vec<&[u8]> = vec![&pulse_bytes];
        for root in &self.jet_roots {
            parts.push(root);
        }
        hash_with_tag(tag::PULSE, &parts)
    }
}

/// Per-node, per-pulse proof: `{ state-hash, signature }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PulseProof {
    pub state_hash: Digest,
    pub signature: Vec<u8>,
}

impl PulseProof {
    /// The byte string the node signs: pulse hash and state hash bound
    /// together.
    pub fn signed_payload(pulse_hash: &Digest, state_hash: &Digest) -> Digest {
        hash_with_tag(tag::PULSE, &[pulse_hash, state_hash])
    }

    pub fn verify(&self, key: &PublicKey, pulse_hash: &Digest) -> Result<(), CoreError> {
        let payload = Self::signed_payload(pulse_hash, &self.state_hash);
        key.verify(&payload, &self.signature)
    }
}

/// Compute this node's pulse proof. Returns `(pulse_hash, proof)`.
pub fn get_pulse_proof(keypair: &KeyPair, entry: &PulseEntry) -> (Digest, PulseProof) {
    let pulse_hash = entry.pulse_hash();
    let state_hash = entry.state_hash();
    let signature = keypair.sign(&PulseProof::signed_payload(&pulse_hash, &state_hash));
    (
        pulse_hash,
        PulseProof {
            state_hash,
            signature,
        },
    )
}

/// Aggregation input for one globule at one pulse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobuleEntry {
    pub globule_id: u32,
    pub pulse_hash: Digest,
    pub prev_cloud_hash: Digest,
    /// Per-node proofs; aggregation sorts by node ref.
    pub proof_set: Vec<(NodeRef, PulseProof)>,
}

/// Aggregated proof over a globule: the merkle root plus, per node, the
/// sibling path needed to verify its leaf at a receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobuleProof {
    pub globule_id: u32,
    pub globule_hash: Digest,
    pub leaf_count: usize,
}

/// Sibling path for one leaf of a merkle tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleSiblingPath {
    pub leaf_index: usize,
    /// Bottom-up sibling digests.
    pub siblings: Vec<Digest>,
}

fn globule_leaf(node: &NodeRef, proof: &PulseProof) -> Digest {
    hash_with_tag(
        tag::GLOBULE,
        &[node.as_bytes(), &proof.state_hash, &proof.signature],
    )
}

fn merkle_root(domain: u8, mut level: Vec<Digest>) -> Digest {
    if level.is_empty() {
        return hash_with_tag(domain, &[b"empty"]);
    }
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let left = &pair[0];
                let right = if pair.len() > 1 { &pair[1] } else { left };
                hash_with_tag(domain, &[left, right])
            })
            .collect();
    }
    level[0]
}

fn merkle_path(domain: u8, leaves: &[Digest], index: usize) -> MerkleSiblingPath {
    let mut siblings = Vec::new();
    let mut level: Vec<Digest> = leaves.to_vec();
    let mut idx = index;
    while level.len() > 1 {
        let sibling_idx = if idx % 2 == 0 { idx + 1 } else { idx - 1 };
        let sibling = if sibling_idx < level.len() {
            level[sibling_idx]
        } else {
            level[idx] // odd level: last node is duplicated
        };
        siblings.push(sibling);
        level = level
            .chunks(2)
            .map(|pair| {
                let left = &pair[0];
                let right = if pair.len() > 1 { &pair[1] } else { left };
                hash_with_tag(domain, &[left, right])
            })
            .collect();
        idx /= 2;
    }
    MerkleSiblingPath {
        leaf_index: index,
        siblings,
    }
}

/// Verify a leaf against a root using its sibling path.
pub fn verify_path(domain: u8, root: &Digest, leaf: &Digest, path: &MerkleSiblingPath) -> bool {
    let mut acc = *leaf;
    let mut idx = path.leaf_index;
    for sibling in &path.siblings {
        acc = if idx % 2 == 0 {
            hash_with_tag(domain, &[&acc, sibling])
        } else {
            hash_with_tag(domain, &[sibling, &acc])
        };
        idx /= 2;
    }
    acc == *root
}

/// Compute the globule hash and proof for an entry. Deterministic: the
/// proof set is sorted by node ref before aggregation.
pub fn get_globule_proof(entry: &GlobuleEntry) -> (Digest, GlobuleProof) {
    let mut sorted = entry.proof_set.clone();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let leaves: Vec<Digest> = sorted
        .iter()
        .map(|(node, proof)| globule_leaf(node, proof))
        .collect();
    let proofs_root = merkle_root(tag::GLOBULE, leaves);

    let globule_hash = hash_with_tag(
        tag::GLOBULE,
        &[
            &entry.globule_id.to_be_bytes(),
            &entry.pulse_hash,
            &entry.prev_cloud_hash,
            &proofs_root,
        ],
    );
    (
        globule_hash,
        GlobuleProof {
            globule_id: entry.globule_id,
            globule_hash,
            leaf_count: sorted.len(),
        },
    )
}

/// Sibling path for one node's proof inside a globule.
pub fn globule_sibling_path(entry: &GlobuleEntry, node: &NodeRef) -> Option<MerkleSiblingPath> {
    let mut sorted = entry.proof_set.clone();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    let index = sorted.iter().position(|(n, _)| n == node)?;
    let leaves: Vec<Digest> = sorted
        .iter()
        .map(|(n, p)| globule_leaf(n, p))
        .collect();
    Some(merkle_path(tag::GLOBULE, &leaves, index))
}

/// Cloud proof over a set of globules at one pulse; entries sorted by
/// globule id.
pub fn get_cloud_proof(globules: &[GlobuleProof]) -> Digest {
    let mut sorted: Vec<&GlobuleProof> = globules.iter().collect();
    sorted.sort_by_key(|g| g.globule_id);
    let leaves: Vec<Digest> = sorted.iter().map(|g| g.globule_hash).collect();
    merkle_root(tag::CLOUD, leaves)
}

/// The running cloud chain: `cloud(p) = H(prev || globule_hash(p))`.
pub fn chain_cloud_hash(prev_cloud_hash: &Digest, globule_hash: &Digest) -> Digest {
    hash_with_tag(tag::CLOUD, &[prev_cloud_hash, globule_hash])
}
