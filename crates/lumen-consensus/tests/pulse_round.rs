// Full consensus rounds against a simulated set of honest peers: the
// exchange synthesizes the packets each peer would send for the same
// pulse entry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;

use lumen_consensus::bitset::{Bitset, BitsetCell};
use lumen_consensus::claims::{Claim, ClaimHandler, JoinClaim, PendingClaim};
use lumen_consensus::merkle::{get_globule_proof, get_pulse_proof, GlobuleEntry, PulseEntry};
use lumen_consensus::node_keeper::NodeKeeper;
use lumen_consensus::packets::{Phase1Packet, Phase21Response, Phase2Packet, Phase3Packet};
use lumen_consensus::phases::{EntryProvider, PhaseEngine, PhaseExchange};
use lumen_core::config::ConsensusSettings;
use lumen_core::crypto::{Digest, KeyPair};
use lumen_core::node::{Node, NodeRole};
use lumen_core::pulse::{Pulse, PulseNumber};
use lumen_core::reference::{NodeRef, ShortNodeId};

struct SimNode {
    node: Node,
    keypair: Arc<KeyPair>,
}

fn make_nodes(count: usize) -> Vec<SimNode> {
    (0..count)
        .map(|i| {
            let keypair = Arc::new(KeyPair::from_seed([i as u8 + 1; 32]));
            SimNode {
                node: Node::new(
                    NodeRef([i as u8 + 1; 32]),
                    NodeRole::LightMaterial,
                    keypair.public_key(),
                    format!("10.0.0.{}:7000", i + 1),
                    ShortNodeId(i as u32),
                ),
                keypair,
            }
        })
        .collect()
}

#[derive(Clone)]
struct SharedEntry {
    entropy: [u8; 32],
    jet_roots: Vec<Digest>,
}

impl SharedEntry {
    fn entry(&self, pulse: &Pulse, prev_cloud_hash: Digest) -> PulseEntry {
        PulseEntry {
            pulse: pulse.pulse_number,
            entropy: self.entropy,
            prev_cloud_hash,
            jet_roots: self.jet_roots.clone(),
        }
    }
}

struct SimProvider {
    shared: SharedEntry,
}

impl EntryProvider for SimProvider {
    fn pulse_entry(&self, pulse: &Pulse, prev_cloud_hash: Digest) -> PulseEntry {
        self.shared.entry(pulse, prev_cloud_hash)
    }

    fn expected_state_hash(&self, _node: &NodeRef, _pulse: &Pulse) -> Option<Digest> {
        None
    }
}

/// Synthesizes honest peer behavior for one origin's round.
struct SimExchange {
    members: Vec<(Node, Arc<KeyPair>)>,
    shared: SharedEntry,
    prev_cloud_hash: Digest,
    silent: HashSet<NodeRef>,
    /// Claims one peer gossips in its phase-1 packet.
    gossiped_claims: Vec<PendingClaim>,
}

impl SimExchange {
    fn pulse_of(&self, number: PulseNumber) -> Pulse {
        Pulse::new(number, number.next(10), self.shared.entropy)
    }

    fn responding(&self) -> Vec<&(Node, Arc<KeyPair>)> {
        self.members
            .iter()
            .filter(|(n, _)| !self.silent.contains(&n.reference))
            .collect()
    }

    fn globule_hash_for(&self, pulse: &Pulse) -> Digest {
        let entry = self.shared.entry(pulse, self.prev_cloud_hash);
        let proof_set = self
            .responding()
            .iter()
            .map(|(node, keypair)| {
                let (_, proof) = get_pulse_proof(keypair, &entry);
                (node.reference, proof)
            })
            .collect();
        let globule = GlobuleEntry {
            globule_id: 0,
            pulse_hash: entry.pulse_hash(),
            prev_cloud_hash: self.prev_cloud_hash,
            proof_set,
        };
        get_globule_proof(&globule).0
    }

    fn peer_bitset(&self) -> Bitset {
        let mut bitset = Bitset::new(self.members.len());
        for (i, (node, _)) in self.members.iter().enumerate() {
            if !self.silent.contains(&node.reference) {
                bitset.set(i, BitsetCell::Legit);
            }
        }
        bitset
    }
}

#[async_trait]
impl PhaseExchange for SimExchange {
    async fn exchange_phase1(
        &self,
        packet: Phase1Packet,
        peers: &[Node],
    ) -> HashMap<NodeRef, Phase1Packet> {
        let pulse = self.pulse_of(packet.pulse_number);
        let entry = self.shared.entry(&pulse, self.prev_cloud_hash);
        let mut replies = HashMap::new();
        let mut claims_once = self.gossiped_claims.clone();
        for peer in peers {
            if self.silent.contains(&peer.reference) {
                continue;
            }
            let keypair = &self
                .members
                .iter()
                .find(|(n, _)| n.reference == peer.reference)
                .expect("peer is a member")
                .1;
            let (pulse_hash, proof) = get_pulse_proof(keypair, &entry);
            let mut reply = Phase1Packet {
                pulse_number: packet.pulse_number,
                pulse_hash,
                proof,
                claims: std::mem::take(&mut claims_once),
                sender: peer.reference,
                signature: Vec::new(),
            };
            reply.sign(keypair);
            replies.insert(peer.reference, reply);
        }
        replies
    }

    async fn exchange_phase2(
        &self,
        packet: Phase2Packet,
        peers: &[Node],
    ) -> HashMap<NodeRef, Phase2Packet> {
        let pulse = self.pulse_of(packet.pulse_number);
        let globule_hash = self.globule_hash_for(&pulse);
        let mut replies = HashMap::new();
        for peer in peers {
            if self.silent.contains(&peer.reference) {
                continue;
            }
            let keypair = &self
                .members
                .iter()
                .find(|(n, _)| n.reference == peer.reference)
                .expect("peer is a member")
                .1;
            let mut reply = Phase2Packet {
                pulse_number: packet.pulse_number,
                globule_hash_signature: keypair.sign(&globule_hash),
                bitset: self.peer_bitset(),
                sender: peer.reference,
                signature: Vec::new(),
            };
            reply.sign(keypair);
            replies.insert(peer.reference, reply);
        }
        replies
    }

    async fn exchange_phase2_1(
        &self,
        _missing_columns: Vec<u32>,
        _peers: &[Node],
    ) -> HashMap<NodeRef, Vec<Phase21Response>> {
        HashMap::new()
    }

    async fn exchange_phase3(
        &self,
        packet: Phase3Packet,
        peers: &[Node],
    ) -> HashMap<NodeRef, Phase3Packet> {
        let pulse = self.pulse_of(packet.pulse_number);
        let globule_hash = self.globule_hash_for(&pulse);
        let mut replies = HashMap::new();
        for peer in peers {
            if self.silent.contains(&peer.reference) {
                continue;
            }
            let keypair = &self
                .members
                .iter()
                .find(|(n, _)| n.reference == peer.reference)
                .expect("peer is a member")
                .1;
            let mut reply = Phase3Packet {
                pulse_number: packet.pulse_number,
                bitset: self.peer_bitset(),
                globule_hash,
                sender: peer.reference,
                signature: Vec::new(),
            };
            reply.sign(keypair);
            replies.insert(peer.reference, reply);
        }
        replies
    }
}

fn shared_entry() -> SharedEntry {
    SharedEntry {
        entropy: [42u8; 32],
        jet_roots: vec![[1u8; 32], [2u8; 32]],
    }
}

fn engine_for(
    origin: usize,
    nodes: &[SimNode],
    silent: HashSet<NodeRef>,
    gossiped_claims: Vec<PendingClaim>,
) -> (PhaseEngine, Arc<NodeKeeper>) {
    let shared = shared_entry();
    let members: Vec<(Node, Arc<KeyPair>)> = nodes
        .iter()
        .map(|s| (s.node.clone(), s.keypair.clone()))
        .collect();
    let keeper = Arc::new(NodeKeeper::new(nodes[origin].node.clone()));
    keeper.set_unsync_list(nodes.iter().map(|s| s.node.clone()).collect());
    let exchange = Arc::new(SimExchange {
        members,
        shared: shared.clone(),
        prev_cloud_hash: [0u8; 32],
        silent,
        gossiped_claims,
    });
    let engine = PhaseEngine::new(
        nodes[origin].keypair.clone(),
        ConsensusSettings::default(),
        exchange,
        Arc::new(SimProvider { shared }),
        keeper.clone(),
        Arc::new(ClaimHandler::new(PulseNumber(90))),
    );
    (engine, keeper)
}

fn test_pulse() -> Pulse {
    Pulse::new(PulseNumber(100), PulseNumber(110), [42u8; 32])
}

#[tokio::test]
async fn all_nodes_commit_the_same_cloud_hash() {
    let nodes = make_nodes(4);
    let pulse = test_pulse();

    let mut cloud_hashes = Vec::new();
    for origin in 0..nodes.len() {
        let (engine, keeper) = engine_for(origin, &nodes, HashSet::new(), Vec::new());
        let commit = engine.run_pulse(&pulse).await.expect("round commits");
        assert_eq!(commit.active.len(), 4);
        assert_eq!(keeper.cloud_hash(), commit.cloud_hash);
        cloud_hashes.push(commit.cloud_hash);
    }
    // Identical inputs, byte-identical chain on every node.
    assert!(cloud_hashes.windows(2).all(|w| w[0] == w[1]));
}

#[tokio::test]
async fn commit_promotes_membership_at_the_boundary() {
    let nodes = make_nodes(4);
    let (engine, keeper) = engine_for(0, &nodes, HashSet::new(), Vec::new());
    let commit = engine.run_pulse(&test_pulse()).await.unwrap();

    // Synced but not yet promoted.
    assert_eq!(keeper.active_nodes().len(), 1);
    keeper.move_sync_to_active(commit.pulse.next_pulse_number);
    assert_eq!(keeper.active_nodes().len(), 4);
}

#[tokio::test]
async fn silent_peer_is_timed_out_and_dropped() {
    let nodes = make_nodes(4);
    let silent: HashSet<NodeRef> = [nodes[3].node.reference].into_iter().collect();
    let (engine, _keeper) = engine_for(0, &nodes, silent, Vec::new());

    let commit = engine.run_pulse(&test_pulse()).await.expect("quorum holds");
    assert_eq!(commit.active.len(), 3);
    assert!(!commit
        .active
        .iter()
        .any(|n| n.reference == nodes[3].node.reference));
}

#[tokio::test]
async fn gossiped_join_claim_gets_the_next_free_short_id() {
    let nodes = make_nodes(4);
    let joiner_key = KeyPair::from_seed([99u8; 32]);
    let join = PendingClaim {
        sender: ShortNodeId(1),
        claim: Claim::Join(JoinClaim {
            node: NodeRef([99u8; 32]),
            role: NodeRole::Virtual,
            public_key: joiner_key.public_key(),
            address: "10.0.0.99:7000".into(),
        }),
    };
    let (engine, keeper) = engine_for(0, &nodes, HashSet::new(), vec![join]);

    let commit = engine.run_pulse(&test_pulse()).await.unwrap();
    assert_eq!(commit.active.len(), 5);
    let joined = commit
        .active
        .iter()
        .find(|n| n.reference == NodeRef([99u8; 32]))
        .expect("joiner admitted");
    // Short ids 0..=3 are taken; the first free slot is 4.
    assert_eq!(joined.short_id, ShortNodeId(4));

    keeper.move_sync_to_active(PulseNumber(110));
    assert!(keeper.active_node(ShortNodeId(4)).is_some());
}

#[tokio::test]
async fn losing_quorum_aborts_the_pulse() {
    let nodes = make_nodes(4);
    // Three of four peers silent: only the origin remains.
    let silent: HashSet<NodeRef> = nodes[1..]
        .iter()
        .map(|s| s.node.reference)
        .collect();
    let (engine, _keeper) = engine_for(0, &nodes, silent, Vec::new());
    assert!(engine.run_pulse(&test_pulse()).await.is_err());
}
