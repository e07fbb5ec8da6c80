// Node keeper: tracks the active, working and unsync node sets and the
// cloud hash.
//
// INVARIANT: between `sync` and `move_sync_to_active`, reads of the
// active set return the previous pulse's set; after the promotion they
// return the new one. The swap happens under a single write lock, so
// readers never observe a partial set.

use std::collections::{BTreeMap, HashMap};

use log::info;
use parking_lot::RwLock;

use lumen_core::crypto::Digest;
use lumen_core::node::Node;
use lumen_core::pulse::PulseNumber;
use lumen_core::reference::{NodeRef, ShortNodeId};

use crate::claims::{Claim, JoinClaim};

pub struct NodeKeeper {
    origin: Node,
    state: RwLock<KeeperState>,
}

#[derive(Default)]
struct KeeperState {
    /// Nodes participating this pulse, by short-id.
    active: BTreeMap<ShortNodeId, Node>,
    /// Active minus under-penalty nodes.
    working: BTreeMap<ShortNodeId, Node>,
    /// Consensus result awaiting promotion at the pulse boundary.
    sync_list: Option<Vec<Node>>,
    /// Active plus pending joins; the index domain for bitsets and the
    /// state matrix.
    unsync: Vec<Node>,
    cloud_hash: Digest,
    /// Temporary short-id to address mapping, scoped to this pulse.
    addresses: HashMap<ShortNodeId, String>,
    current_pulse: PulseNumber,
}

impl NodeKeeper {
    pub fn new(origin: Node) -> Self {
        let mut state = KeeperState::default();
        state.active.insert(origin.short_id, origin.clone());
        state.working.insert(origin.short_id, origin.clone());
        state.unsync.push(origin.clone());
        NodeKeeper {
            origin,
            state: RwLock::new(state),
        }
    }

    pub fn origin(&self) -> &Node {
        &self.origin
    }

    pub fn active_nodes(&self) -> Vec<Node> {
        self.state.read().active.values().cloned().collect()
    }

    pub fn working_nodes(&self) -> Vec<Node> {
        self.state.read().working.values().cloned().collect()
    }

    pub fn active_node(&self, short_id: ShortNodeId) -> Option<Node> {
        self.state.read().active.get(&short_id).cloned()
    }

    pub fn active_node_by_ref(&self, reference: &NodeRef) -> Option<Node> {
        self.state
            .read()
            .active
            .values()
            .find(|n| n.reference == *reference)
            .cloned()
    }

    pub fn unsync_list(&self) -> Vec<Node> {
        self.state.read().unsync.clone()
    }

    pub fn set_unsync_list(&self, unsync: Vec<Node>) {
        self.state.write().unsync = unsync;
    }

    pub fn cloud_hash(&self) -> Digest {
        self.state.read().cloud_hash
    }

    pub fn set_cloud_hash(&self, hash: Digest) {
        self.state.write().cloud_hash = hash;
    }

    pub fn current_pulse(&self) -> PulseNumber {
        self.state.read().current_pulse
    }

    /// Commit the post-consensus membership; takes effect at the next
    /// `move_sync_to_active`.
    pub fn sync(&self, nodes: Vec<Node>) {
        info!("[NodeKeeper] sync: {} nodes committed", nodes.len());
        self.state.write().sync_list = Some(nodes);
    }

    /// Promote the synced set at the pulse boundary. One write lock;
    /// the swap is atomic from any reader's perspective.
    pub fn move_sync_to_active(&self, pulse: PulseNumber) {
        let mut state = self.state.write();
        if let Some(nodes) = state.sync_list.take() {
            state.active = nodes
                .iter()
                .map(|n| (n.short_id, n.clone()))
                .collect();
            state.working = state.active.clone();
            state.unsync = nodes;
            state.addresses = state
                .active
                .values()
                .map(|n| (n.short_id, n.address.clone()))
                .collect();
        }
        state.current_pulse = pulse;
        info!(
            "[NodeKeeper] pulse {}: {} active nodes",
            pulse,
            state.active.len()
        );
    }

    /// Exclude a node from the working set without removing it from the
    /// active set (penalty).
    pub fn suspend_working(&self, short_id: ShortNodeId) {
        self.state.write().working.remove(&short_id);
    }

    pub fn resolve_address(&self, short_id: ShortNodeId) -> Option<String> {
        self.state.read().addresses.get(&short_id).cloned()
    }

    pub fn set_address(&self, short_id: ShortNodeId, address: String) {
        self.state.write().addresses.insert(short_id, address);
    }

    /// The claim this node gossips when (re)joining.
    pub fn origin_join_claim(&self) -> Claim {
        Claim::Join(JoinClaim {
            node: self.origin.reference,
            role: self.origin.role,
            public_key: self.origin.public_key,
            address: self.origin.address.clone(),
        })
    }

    pub fn origin_announce_claim(&self) -> Claim {
        Claim::Announce {
            node: self.origin.reference,
            address: self.origin.address.clone(),
        }
    }
}
