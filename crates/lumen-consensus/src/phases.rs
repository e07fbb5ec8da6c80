// The three-phase pulse consensus engine.
//
// State machine: Phase1 -> Phase2 -> (Phase2_1) -> Phase3 ->
// Committed | Failed.
//
// Failure semantics:
// - phase packet signature failure drops that peer's contribution and
//   logs; it never aborts the round
// - globule-hash mismatch among a supermajority aborts
// - insufficient phase-2.1 responses abort with InsufficientData
// - per-peer timeouts yield timed-out votes, not errors

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};
use parking_lot::Mutex;
use thiserror::Error;

use lumen_core::config::ConsensusSettings;
use lumen_core::crypto::{Digest, KeyPair};
use lumen_core::error::CoreError;
use lumen_core::node::Node;
use lumen_core::pulse::Pulse;
use lumen_core::reference::{NodeRef, ShortNodeId};

use crate::bitset::{Bitset, BitsetCell};
use crate::claims::{assign_short_ids, Claim, ClaimHandler, JoinClaim, PendingClaim};
use crate::matrix::StateMatrix;
use crate::merkle::{
    chain_cloud_hash, get_globule_proof, get_pulse_proof, GlobuleEntry, PulseEntry, PulseProof,
};
use crate::node_keeper::NodeKeeper;
use crate::packets::{Phase1Packet, Phase21Response, Phase2Packet, Phase3Packet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseState {
    Idle,
    Phase1,
    Phase2,
    Phase2_1,
    Phase3,
    Committed,
    Failed,
}

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    #[error("globule hash mismatch among supermajority")]
    GlobuleMismatch,

    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Provides the origin's pulse entry and, where known, the expected
/// state hash of a peer (from replicated jet roots). Returning None
/// accepts a peer's proof on signature alone.
pub trait EntryProvider: Send + Sync {
    fn pulse_entry(&self, pulse: &Pulse, prev_cloud_hash: Digest) -> PulseEntry;
    fn expected_state_hash(&self, node: &NodeRef, pulse: &Pulse) -> Option<Digest>;
}

/// Network seam for the phase exchanges. Implementations deliver the
/// packet to every peer and return whatever arrived before their own
/// deadline; absent peers are simply missing from the map.
#[async_trait]
pub trait PhaseExchange: Send + Sync {
    async fn exchange_phase1(
        &self,
        packet: Phase1Packet,
        peers: &[Node],
    ) -> HashMap<NodeRef, Phase1Packet>;

    async fn exchange_phase2(
        &self,
        packet: Phase2Packet,
        peers: &[Node],
    ) -> HashMap<NodeRef, Phase2Packet>;

    async fn exchange_phase2_1(
        &self,
        missing_columns: Vec<u32>,
        peers: &[Node],
    ) -> HashMap<NodeRef, Vec<Phase21Response>>;

    async fn exchange_phase3(
        &self,
        packet: Phase3Packet,
        peers: &[Node],
    ) -> HashMap<NodeRef, Phase3Packet>;
}

/// Everything phase 1 agreed on, carried into the later phases.
pub struct FirstPhaseState {
    pub pulse_entry: PulseEntry,
    pub pulse_hash: Digest,
    pub pulse_proof: PulseProof,
    pub valid_proofs: Vec<(NodeRef, PulseProof)>,
    pub fault_proofs: Vec<NodeRef>,
    pub unsync_list: Vec<Node>,
}

/// The agreed outcome of one pulse.
#[derive(Debug, Clone)]
pub struct PulseCommit {
    pub pulse: Pulse,
    pub active: Vec<Node>,
    pub globule_hash: Digest,
    pub cloud_hash: Digest,
}

pub struct PhaseEngine {
    keypair: Arc<KeyPair>,
    settings: ConsensusSettings,
    exchange: Arc<dyn PhaseExchange>,
    entries: Arc<dyn EntryProvider>,
    keeper: Arc<NodeKeeper>,
    claims: Arc<ClaimHandler>,
    state: Mutex<PhaseState>,
}

impl PhaseEngine {
    pub fn new(
        keypair: Arc<KeyPair>,
        settings: ConsensusSettings,
        exchange: Arc<dyn PhaseExchange>,
        entries: Arc<dyn EntryProvider>,
        keeper: Arc<NodeKeeper>,
        claims: Arc<ClaimHandler>,
    ) -> Self {
        PhaseEngine {
            keypair,
            settings,
            exchange,
            entries,
            keeper,
            claims,
            state: Mutex::new(PhaseState::Idle),
        }
    }

    pub fn state(&self) -> PhaseState {
        *self.state.lock()
    }

    fn set_state(&self, state: PhaseState) {
        *self.state.lock() = state;
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.settings.phase_timeout_ms)
    }

    /// Run the full consensus round for one pulse. On success the node
    /// keeper holds the synced membership and the new cloud hash; the
    /// caller promotes at the pulse boundary.
    pub async fn run_pulse(&self, pulse: &Pulse) -> Result<PulseCommit, ConsensusError> {
        let result = self.run_pulse_inner(pulse).await;
        match &result {
            Ok(commit) => {
                self.set_state(PhaseState::Committed);
                info!(
                    "[PhaseEngine] pulse {} committed: {} active, cloud {}",
                    pulse.pulse_number,
                    commit.active.len(),
                    hex::encode(&commit.cloud_hash[..4])
                );
            }
            Err(err) => {
                self.set_state(PhaseState::Failed);
                warn!(
                    "[PhaseEngine] pulse {} aborted: {err}",
                    pulse.pulse_number
                );
            }
        }
        result
    }

    async fn run_pulse_inner(&self, pulse: &Pulse) -> Result<PulseCommit, ConsensusError> {
        self.set_state(PhaseState::Phase1);
        let first = self.run_phase1(pulse).await;

        self.set_state(PhaseState::Phase2);
        let (mut matrix, mut own_bitset, globule_hash, mismatches) =
            self.run_phase2(pulse, &first).await?;

        let unsync = &first.unsync_list;
        let quorum = self.settings.quorum(unsync.len());
        if mismatches >= quorum {
            return Err(ConsensusError::GlobuleMismatch);
        }

        let mut phase2 = matrix.calculate_phase2(&self.settings);
        if !phase2.additional_requests.is_empty() {
            self.set_state(PhaseState::Phase2_1);
            self.run_phase2_1(pulse, &first, &mut matrix, &mut own_bitset, &phase2.additional_requests)
                .await?;
            phase2 = matrix.calculate_phase2(&self.settings);
            if !phase2.additional_requests.is_empty() {
                return Err(ConsensusError::InsufficientData(format!(
                    "{} columns unresolved after phase 2.1",
                    phase2.additional_requests.len()
                )));
            }
        }

        self.set_state(PhaseState::Phase3);
        self.run_phase3(pulse, &first, own_bitset, globule_hash, &phase2.active)
            .await
    }

    async fn run_phase1(&self, pulse: &Pulse) -> FirstPhaseState {
        let prev_cloud_hash = self.keeper.cloud_hash();
        let entry = self.entries.pulse_entry(pulse, prev_cloud_hash);
        let (pulse_hash, proof) = get_pulse_proof(&self.keypair, &entry);

        let unsync_list = self.keeper.unsync_list();
        let origin = self.keeper.origin().clone();
        let peers = without(&unsync_list, &origin.reference);

        let mut packet = Phase1Packet {
            pulse_number: pulse.pulse_number,
            pulse_hash,
            proof: proof.clone(),
            claims: self.claims.peek_for_pulse(pulse.next_pulse_number),
            sender: origin.reference,
            signature: Vec::new(),
        };
        packet.sign(&self.keypair);

        let replies = match tokio::time::timeout(
            self.timeout(),
            self.exchange.exchange_phase1(packet, &peers),
        )
        .await
        {
            Ok(replies) => replies,
            Err(_) => HashMap::new(),
        };

        let mut valid_proofs = vec![(origin.reference, proof.clone())];
        let mut fault_proofs = Vec::new();

        for (sender, reply) in replies {
            let Some(peer) = unsync_list.iter().find(|n| n.reference == sender) else {
                warn!("[PhaseEngine] phase1 packet from unknown node {sender}");
                continue;
            };
            if let Err(err) = reply.verify(&peer.public_key) {
                warn!("[PhaseEngine] phase1 packet from {sender} dropped: {err}");
                fault_proofs.push(sender);
                continue;
            }
            if let Err(err) = reply.proof.verify(&peer.public_key, &pulse_hash) {
                warn!("[PhaseEngine] phase1 proof from {sender} is faulty: {err}");
                fault_proofs.push(sender);
                continue;
            }
            if let Some(expected) = self.entries.expected_state_hash(&sender, pulse) {
                if expected != reply.proof.state_hash {
                    warn!("[PhaseEngine] phase1 state hash from {sender} diverges");
                    fault_proofs.push(sender);
                    continue;
                }
            }
            for pending in reply.claims {
                self.claims
                    .add_pending_claim(pulse.next_pulse_number, pending.sender, pending.claim);
            }
            valid_proofs.push((sender, reply.proof));
        }

        info!(
            "[PhaseEngine] phase1: {} valid, {} fault of {} peers",
            valid_proofs.len() - 1,
            fault_proofs.len(),
            peers.len()
        );

        FirstPhaseState {
            pulse_entry: entry,
            pulse_hash,
            pulse_proof: proof,
            valid_proofs,
            fault_proofs,
            unsync_list,
        }
    }

    async fn run_phase2(
        &self,
        pulse: &Pulse,
        first: &FirstPhaseState,
    ) -> Result<(StateMatrix, Bitset, Digest, usize), ConsensusError> {
        let unsync = &first.unsync_list;
        let origin = self.keeper.origin().clone();
        let origin_index = index_of(unsync, &origin.reference)
            .ok_or_else(|| CoreError::UnknownNode(origin.reference))?;

        let globule = GlobuleEntry {
            globule_id: 0,
            pulse_hash: first.pulse_hash,
            prev_cloud_hash: first.pulse_entry.prev_cloud_hash,
            proof_set: first.valid_proofs.clone(),
        };
        let (globule_hash, _globule_proof) = get_globule_proof(&globule);

        let mut own_bitset = Bitset::new(unsync.len());
        for (i, node) in unsync.iter().enumerate() {
            let cell = if first.fault_proofs.contains(&node.reference) {
                BitsetCell::Fraud
            } else if first.valid_proofs.iter().any(|(r, _)| *r == node.reference) {
                BitsetCell::Legit
            } else {
                BitsetCell::TimedOut
            };
            own_bitset.set(i, cell);
        }

        let mut matrix = StateMatrix::new(unsync.len());
        matrix.apply_bitset(origin_index, own_bitset.clone())?;

        let mut packet = Phase2Packet {
            pulse_number: pulse.pulse_number,
            globule_hash_signature: self.keypair.sign(&globule_hash),
            bitset: own_bitset.clone(),
            sender: origin.reference,
            signature: Vec::new(),
        };
        packet.sign(&self.keypair);

        let peers = without(unsync, &origin.reference);
        let replies = match tokio::time::timeout(
            self.timeout(),
            self.exchange.exchange_phase2(packet, &peers),
        )
        .await
        {
            Ok(replies) => replies,
            Err(_) => HashMap::new(),
        };

        let mut mismatches = 0usize;
        for (sender, reply) in replies {
            let Some(index) = index_of(unsync, &sender) else {
                warn!("[PhaseEngine] phase2 packet from unknown node {sender}");
                continue;
            };
            let peer = &unsync[index];
            if let Err(err) = reply.verify(&peer.public_key) {
                warn!("[PhaseEngine] phase2 packet from {sender} dropped: {err}");
                continue;
            }
            if peer
                .public_key
                .verify(&globule_hash, &reply.globule_hash_signature)
                .is_err()
            {
                // Either a bad signature or a diverging globule view.
                warn!("[PhaseEngine] phase2 globule signature from {sender} diverges");
                mismatches += 1;
                continue;
            }
            if let Err(err) = matrix.apply_bitset(index, reply.bitset) {
                warn!("[PhaseEngine] phase2 bitset from {sender} rejected: {err}");
            }
        }

        Ok((matrix, own_bitset, globule_hash, mismatches))
    }

    async fn run_phase2_1(
        &self,
        pulse: &Pulse,
        first: &FirstPhaseState,
        matrix: &mut StateMatrix,
        own_bitset: &mut Bitset,
        missing: &[usize],
    ) -> Result<(), ConsensusError> {
        let unsync = &first.unsync_list;
        let origin = self.keeper.origin().reference;
        let peers = without(unsync, &origin);
        let columns: Vec<u32> = missing.iter().map(|c| *c as u32).collect();

        info!(
            "[PhaseEngine] phase2.1: requesting supplementary data for {} columns",
            columns.len()
        );

        let replies = match tokio::time::timeout(
            self.timeout(),
            self.exchange.exchange_phase2_1(columns, &peers),
        )
        .await
        {
            Ok(replies) => replies,
            Err(_) => HashMap::new(),
        };

        for (sender, responses) in replies {
            for response in responses {
                match response {
                    Phase21Response::MissingNodeSupplementaryVote {
                        node_index,
                        claim,
                        proof,
                    } => {
                        let index = node_index as usize;
                        if index >= unsync.len() {
                            warn!("[PhaseEngine] phase2.1 vote for bad column {index}");
                            continue;
                        }
                        // Convert the unsigned claim to a node and check
                        // the proof against the pulse hash.
                        let node = claim.into_node(unsync[index].short_id);
                        if let Err(err) = proof.verify(&node.public_key, &first.pulse_hash) {
                            warn!(
                                "[PhaseEngine] phase2.1 proof from {sender} for column {index} invalid: {err}"
                            );
                            continue;
                        }
                        matrix.supplementary_legit(index);
                        own_bitset.set(index, BitsetCell::Legit);
                    }
                    Phase21Response::MissingNodeClaim { node_index: _, claim } => {
                        let short_id = unsync
                            .iter()
                            .find(|n| n.reference == claim.node())
                            .map(|n| n.short_id)
                            .unwrap_or(ShortNodeId(u32::MAX));
                        self.claims
                            .add_pending_claim(pulse.next_pulse_number, short_id, claim);
                    }
                }
            }
        }
        Ok(())
    }

    async fn run_phase3(
        &self,
        pulse: &Pulse,
        first: &FirstPhaseState,
        own_bitset: Bitset,
        globule_hash: Digest,
        active_columns: &[usize],
    ) -> Result<PulseCommit, ConsensusError> {
        let unsync = &first.unsync_list;
        let origin = self.keeper.origin().reference;
        let peers = without(unsync, &origin);

        let mut packet = Phase3Packet {
            pulse_number: pulse.pulse_number,
            bitset: own_bitset,
            globule_hash,
            sender: origin,
            signature: Vec::new(),
        };
        packet.sign(&self.keypair);

        let replies = match tokio::time::timeout(
            self.timeout(),
            self.exchange.exchange_phase3(packet, &peers),
        )
        .await
        {
            Ok(replies) => replies,
            Err(_) => HashMap::new(),
        };

        // Every replying node must report the same globule hash; a
        // supermajority of divergence aborts the pulse.
        let mut agreeing = 1usize; // ourselves
        let mut diverging = 0usize;
        for (sender, reply) in replies {
            let Some(peer) = unsync.iter().find(|n| n.reference == sender) else {
                continue;
            };
            if reply.verify(&peer.public_key).is_err() {
                warn!("[PhaseEngine] phase3 packet from {sender} dropped");
                continue;
            }
            if reply.globule_hash == globule_hash {
                agreeing += 1;
            } else {
                diverging += 1;
            }
        }
        let quorum = self.settings.quorum(unsync.len());
        if diverging >= quorum {
            return Err(ConsensusError::GlobuleMismatch);
        }
        if agreeing < quorum {
            return Err(ConsensusError::InsufficientData(format!(
                "only {agreeing} of {} nodes confirmed the globule hash (quorum {quorum})",
                unsync.len()
            )));
        }

        // Survivors: the columns consensus marked active.
        let mut survivors: Vec<Node> = active_columns
            .iter()
            .filter_map(|c| unsync.get(*c).cloned())
            .collect();

        // Apply claims at the pulse boundary, in deterministic order.
        let claims = self.claims.take_for_pulse(pulse.next_pulse_number);
        let mut joins: Vec<JoinClaim> = Vec::new();
        for pending in claims {
            match pending.claim {
                Claim::Leave { node, .. } => {
                    survivors.retain(|n| n.reference != node);
                }
                Claim::Join(join) => joins.push(join),
                Claim::Announce { node, address } => {
                    if let Some(n) = survivors.iter_mut().find(|n| n.reference == node) {
                        n.address = address;
                    }
                }
                Claim::CapabilityChange { .. } => {
                    // Capabilities do not affect membership.
                }
            }
        }

        let occupied: BTreeSet<u32> = survivors.iter().map(|n| n.short_id.0).collect();
        let assignments = assign_short_ids(&occupied, &joins);
        let mut join_map: HashMap<NodeRef, JoinClaim> =
            joins.into_iter().map(|j| (j.node, j)).collect();
        for (node_ref, short_id) in assignments {
            if let Some(join) = join_map.remove(&node_ref) {
                info!("[PhaseEngine] join approved: {node_ref} as {short_id}");
                survivors.push(join.into_node(short_id));
            }
        }

        let cloud_hash = chain_cloud_hash(&first.pulse_entry.prev_cloud_hash, &globule_hash);
        self.keeper.sync(survivors.clone());
        self.keeper.set_cloud_hash(cloud_hash);

        Ok(PulseCommit {
            pulse: pulse.clone(),
            active: survivors,
            globule_hash,
            cloud_hash,
        })
    }
}

fn without(nodes: &[Node], exclude: &NodeRef) -> Vec<Node> {
    nodes
        .iter()
        .filter(|n| n.reference != *exclude)
        .cloned()
        .collect()
}

fn index_of(nodes: &[Node], reference: &NodeRef) -> Option<usize> {
    nodes.iter().position(|n| n.reference == *reference)
}
