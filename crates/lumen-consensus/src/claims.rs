// Join / leave / announce / capability claims: gossiped alongside phase
// packets, ordered deterministically and applied atomically at pulse
// boundary.
//
// SAFETY: two nodes with the same pending-claim queue must assign the
// same short-ids; allocation is a pure function of the sorted join list.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use lumen_core::crypto::{hash_with_tag, tag, Digest, PublicKey};
use lumen_core::node::{Node, NodeRole};
use lumen_core::pulse::PulseNumber;
use lumen_core::reference::{NodeRef, ShortNodeId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinClaim {
    pub node: NodeRef,
    pub role: NodeRole,
    pub public_key: PublicKey,
    pub address: String,
}

impl JoinClaim {
    /// Materialize the joined node once a short-id is allocated.
    pub fn into_node(self, short_id: ShortNodeId) -> Node {
        Node::new(self.node, self.role, self.public_key, self.address, short_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Claim {
    Join(JoinClaim),
    Leave {
        node: NodeRef,
        /// Pulse after which the node wants out; None means immediately.
        eta: Option<PulseNumber>,
    },
    Announce {
        node: NodeRef,
        address: String,
    },
    CapabilityChange {
        node: NodeRef,
        capabilities: Vec<u8>,
    },
}

impl Claim {
    /// Apply order: leave > join > announce > capability.
    pub fn type_priority(&self) -> u8 {
        match self {
            Claim::Leave { .. } => 0,
            Claim::Join(_) => 1,
            Claim::Announce { .. } => 2,
            Claim::CapabilityChange { .. } => 3,
        }
    }

    pub fn node(&self) -> NodeRef {
        match self {
            Claim::Join(join) => join.node,
            Claim::Leave { node, .. }
            | Claim::Announce { node, .. }
            | Claim::CapabilityChange { node, .. } => *node,
        }
    }

    pub fn hash(&self) -> Digest {
        let bytes = bincode::serialize(self).expect("claim encoding cannot fail");
        hash_with_tag(tag::CLAIM, &[&bytes])
    }
}

/// A claim plus the short-id of the peer that gossiped it; the sender
/// participates in the deterministic apply order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingClaim {
    pub sender: ShortNodeId,
    pub claim: Claim,
}

/// Orders and applies claims at pulse boundaries.
pub struct ClaimHandler {
    inner: Mutex<ClaimQueue>,
}

struct ClaimQueue {
    pending: BTreeMap<PulseNumber, Vec<PendingClaim>>,
    seen: HashSet<Digest>,
    current_pulse: PulseNumber,
}

impl ClaimHandler {
    pub fn new(current_pulse: PulseNumber) -> Self {
        ClaimHandler {
            inner: Mutex::new(ClaimQueue {
                pending: BTreeMap::new(),
                seen: HashSet::new(),
                current_pulse,
            }),
        }
    }

    /// Queue a claim for application at `pulse`. Deduplicates by claim
    /// hash; claims for past pulses are rejected.
    pub fn add_pending_claim(
        &self,
        pulse: PulseNumber,
        sender: ShortNodeId,
        claim: Claim,
    ) -> bool {
        let mut queue = self.inner.lock();
        if pulse < queue.current_pulse {
            debug!(
                "[ClaimHandler] rejected claim for past pulse {} (current {})",
                pulse, queue.current_pulse
            );
            return false;
        }
        let hash = claim.hash();
        if !queue.seen.insert(hash) {
            return false;
        }
        queue
            .pending
            .entry(pulse)
            .or_default()
            .push(PendingClaim { sender, claim });
        true
    }

    /// Drain claims for `pulse` in the deterministic apply order
    /// `(type-priority, sender short-id, claim hash)` and advance the
    /// handler's pulse cursor.
    pub fn take_for_pulse(&self, pulse: PulseNumber) -> Vec<PendingClaim> {
        let mut queue = self.inner.lock();
        queue.current_pulse = pulse;
        let mut claims = queue.pending.remove(&pulse).unwrap_or_default();
        for claim in &claims {
            queue.seen.remove(&claim.claim.hash());
        }
        sort_claims(&mut claims);
        claims
    }

    /// All claims queued for the given pulse, in apply order, without
    /// draining (used to attach claims to phase-1 packets).
    pub fn peek_for_pulse(&self, pulse: PulseNumber) -> Vec<PendingClaim> {
        let queue = self.inner.lock();
        let mut claims = queue.pending.get(&pulse).cloned().unwrap_or_default();
        sort_claims(&mut claims);
        claims
    }
}

fn sort_claims(claims: &mut [PendingClaim]) {
    claims.sort_by(|a, b| {
        (a.claim.type_priority(), a.sender, a.claim.hash()).cmp(&(
            b.claim.type_priority(),
            b.sender,
            b.claim.hash(),
        ))
    });
}

/// Allocate short-ids for approved joins: contiguous from the first
/// free slot, a pure function of the occupied set and the sorted join
/// list.
pub fn assign_short_ids(
    occupied: &BTreeSet<u32>,
    joins: &[JoinClaim],
) -> Vec<(NodeRef, ShortNodeId)> {
    let mut sorted: Vec<&JoinClaim> = joins.iter().collect();
    sorted.sort_by_key(|j| j.node);

    let mut next = 0u32;
    let mut assigned = Vec::with_capacity(sorted.len());
    for join in sorted {
        while occupied.contains(&next) {
            next += 1;
        }
        assigned.push((join.node, ShortNodeId(next)));
        next += 1;
    }
    assigned
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join(i: u8) -> JoinClaim {
        JoinClaim {
            node: NodeRef([i; 32]),
            role: NodeRole::Virtual,
            public_key: PublicKey([i; 32]),
            address: format!("10.0.0.{i}:7000"),
        }
    }

    #[test]
    fn duplicate_claims_are_dropped() {
        let handler = ClaimHandler::new(PulseNumber(100));
        let claim = Claim::Join(join(1));
        assert!(handler.add_pending_claim(PulseNumber(101), ShortNodeId(4), claim.clone()));
        assert!(!handler.add_pending_claim(PulseNumber(101), ShortNodeId(4), claim));
    }

    #[test]
    fn past_pulse_claims_are_rejected() {
        let handler = ClaimHandler::new(PulseNumber(100));
        assert!(!handler.add_pending_claim(
            PulseNumber(99),
            ShortNodeId(1),
            Claim::Join(join(1))
        ));
    }

    #[test]
    fn apply_order_is_leave_join_announce_capability() {
        let handler = ClaimHandler::new(PulseNumber(100));
        let pulse = PulseNumber(101);
        handler.add_pending_claim(
            pulse,
            ShortNodeId(2),
            Claim::Announce {
                node: NodeRef([5; 32]),
                address: "a".into(),
            },
        );
        handler.add_pending_claim(pulse, ShortNodeId(3), Claim::Join(join(1)));
        handler.add_pending_claim(
            pulse,
            ShortNodeId(1),
            Claim::Leave {
                node: NodeRef([6; 32]),
                eta: None,
            },
        );
        handler.add_pending_claim(
            pulse,
            ShortNodeId(0),
            Claim::CapabilityChange {
                node: NodeRef([7; 32]),
                capabilities: vec![],
            },
        );

        let ordered = handler.take_for_pulse(pulse);
        let priorities: Vec<u8> = ordered.iter().map(|c| c.claim.type_priority()).collect();
        assert_eq!(priorities, vec![0, 1, 2, 3]);
        // Drained.
        assert!(handler.take_for_pulse(pulse).is_empty());
    }

    #[test]
    fn same_priority_orders_by_sender_then_hash() {
        let handler = ClaimHandler::new(PulseNumber(100));
        let pulse = PulseNumber(101);
        handler.add_pending_claim(pulse, ShortNodeId(9), Claim::Join(join(1)));
        handler.add_pending_claim(pulse, ShortNodeId(2), Claim::Join(join(2)));
        let ordered = handler.take_for_pulse(pulse);
        assert_eq!(ordered[0].sender, ShortNodeId(2));
        assert_eq!(ordered[1].sender, ShortNodeId(9));
    }

    #[test]
    fn short_ids_fill_the_first_free_slots() {
        let occupied: BTreeSet<u32> = [0, 1, 3].into_iter().collect();
        let joins = vec![join(20), join(10)];
        let assigned = assign_short_ids(&occupied, &joins);
        // Sorted by node ref: [10; 32] < [20; 32].
        assert_eq!(
            assigned,
            vec![
                (NodeRef([10; 32]), ShortNodeId(2)),
                (NodeRef([20; 32]), ShortNodeId(4)),
            ]
        );
    }

    proptest::proptest! {
        #[test]
        fn short_id_assignment_is_input_deterministic(refs in proptest::collection::btree_set(1u8..250, 1..20)) {
            let joins: Vec<JoinClaim> = refs.iter().map(|i| join(*i)).collect();
            let mut reversed = joins.clone();
            reversed.reverse();
            let occupied: BTreeSet<u32> = [0, 2].into_iter().collect();
            proptest::prop_assert_eq!(
                assign_short_ids(&occupied, &joins),
                assign_short_ids(&occupied, &reversed)
            );
        }
    }
}
