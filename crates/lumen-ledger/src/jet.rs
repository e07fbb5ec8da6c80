// Binary radix tree over object-ID prefixes. Leaves are the unit of
// ownership for light material nodes; the tree never stores node
// handles, only their refs.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use lumen_core::error::CoreError;
use lumen_core::pulse::PulseNumber;
use lumen_core::reference::{JetId, NodeRef, ObjectId};

/// Per-leaf bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JetMeta {
    pub owner: Option<NodeRef>,
    /// Pulse at which this leaf was last confirmed against the
    /// authoritative view.
    pub updated_at: PulseNumber,
}

/// Whether `outer` covers `inner` (inner is outer or a descendant).
fn covers(outer: &JetId, inner: &JetId) -> bool {
    inner.depth >= outer.depth && JetId::new(outer.depth, inner.prefix) == *outer
}

struct TreeInner {
    leaves: BTreeMap<JetId, JetMeta>,
}

pub struct JetTree {
    inner: RwLock<TreeInner>,
}

impl Default for JetTree {
    fn default() -> Self {
        Self::new()
    }
}

impl JetTree {
    /// A fresh tree: one root leaf, confirmed at genesis only.
    pub fn new() -> Self {
        let mut leaves = BTreeMap::new();
        leaves.insert(
            JetId::ROOT,
            JetMeta {
                owner: None,
                updated_at: PulseNumber::GENESIS,
            },
        );
        JetTree {
            inner: RwLock::new(TreeInner { leaves }),
        }
    }

    /// The leaf jet covering an object, and whether the local view is
    /// actual for the requested pulse.
    pub fn for_object(&self, object: &ObjectId, pulse: PulseNumber) -> (JetId, bool) {
        let inner = self.inner.read();
        for depth in 0..=64u8 {
            let candidate = JetId::for_object(object, depth);
            if let Some(meta) = inner.leaves.get(&candidate) {
                return (candidate, meta.updated_at >= pulse);
            }
        }
        // A well-formed tree always has a covering leaf; treat a gap as
        // a stale root view.
        (JetId::ROOT, false)
    }

    pub fn owner(&self, jet: &JetId) -> Option<NodeRef> {
        self.inner.read().leaves.get(jet).and_then(|m| m.owner)
    }

    pub fn leaves(&self) -> Vec<(JetId, JetMeta)> {
        self.inner
            .read()
            .leaves
            .iter()
            .map(|(j, m)| (*j, m.clone()))
            .collect()
    }

    /// Record an authoritative view of `jet` as of `pulse`. If the jet
    /// is deeper than the current leaf, the covering leaf is split down
    /// to it; siblings created along the path inherit the old meta.
    pub fn update(&self, jet: JetId, owner: Option<NodeRef>, pulse: PulseNumber) {
        let mut inner = self.inner.write();
        if let Some(meta) = inner.leaves.get_mut(&jet) {
            meta.owner = owner;
            meta.updated_at = meta.updated_at.max(pulse);
            return;
        }

        let mut ancestor = jet;
        let found = loop {
            if inner.leaves.contains_key(&ancestor) {
                break true;
            }
            match ancestor.parent() {
                Some(parent) => ancestor = parent,
                None => break false,
            }
        };
        if !found {
            // The update targets a jet above the current leaves; ignore,
            // the finer view stays authoritative.
            return;
        }

        let inherited = inner
            .leaves
            .remove(&ancestor)
            .unwrap_or(JetMeta {
                owner: None,
                updated_at: PulseNumber::GENESIS,
            });
        let mut cursor = ancestor;
        while cursor.depth < jet.depth {
            let (left, right) = cursor.children();
            let (next, sibling) = if covers(&left, &jet) {
                (left, right)
            } else {
                (right, left)
            };
            inner.leaves.insert(sibling, inherited.clone());
            cursor = next;
        }
        inner.leaves.insert(
            jet,
            JetMeta {
                owner,
                updated_at: pulse,
            },
        );
    }

    /// Split a leaf into its two children, both inheriting the owner
    /// and confirmed at `pulse`.
    pub fn split(&self, jet: JetId, pulse: PulseNumber) -> Result<(JetId, JetId), CoreError> {
        let mut inner = self.inner.write();
        let meta = inner
            .leaves
            .remove(&jet)
            .ok_or_else(|| CoreError::NotFound(format!("jet {jet} is not a leaf")))?;
        let (left, right) = jet.children();
        let child_meta = JetMeta {
            owner: meta.owner,
            updated_at: pulse,
        };
        inner.leaves.insert(left, child_meta.clone());
        inner.leaves.insert(right, child_meta);
        Ok((left, right))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(first: u8) -> ObjectId {
        let mut bytes = [0u8; 32];
        bytes[0] = first;
        ObjectId(bytes)
    }

    #[test]
    fn fresh_tree_serves_the_root_leaf() {
        let tree = JetTree::new();
        let (jet, actual) = tree.for_object(&object(0x42), PulseNumber::GENESIS);
        assert_eq!(jet, JetId::ROOT);
        assert!(actual);
        // Any later pulse makes the genesis view stale.
        let (_, actual) = tree.for_object(&object(0x42), PulseNumber(100));
        assert!(!actual);
    }

    #[test]
    fn split_partitions_ownership() {
        let tree = JetTree::new();
        let owner = NodeRef([1u8; 32]);
        tree.update(JetId::ROOT, Some(owner), PulseNumber(100));
        let (left, right) = tree.split(JetId::ROOT, PulseNumber(100)).unwrap();

        let (low_jet, actual) = tree.for_object(&object(0x01), PulseNumber(100));
        assert_eq!(low_jet, left);
        assert!(actual);
        let (high_jet, _) = tree.for_object(&object(0x81), PulseNumber(100));
        assert_eq!(high_jet, right);
        assert_eq!(tree.owner(&left), Some(owner));
        assert_eq!(tree.owner(&right), Some(owner));
    }

    #[test]
    fn deep_update_splits_down_and_siblings_inherit() {
        let tree = JetTree::new();
        let old_owner = NodeRef([1u8; 32]);
        tree.update(JetId::ROOT, Some(old_owner), PulseNumber(50));

        let new_owner = NodeRef([2u8; 32]);
        let deep = JetId::new(2, 0xC000_0000_0000_0000); // [11]
        tree.update(deep, Some(new_owner), PulseNumber(100));

        assert_eq!(tree.owner(&deep), Some(new_owner));
        // The sibling paths keep the old owner and freshness.
        let (low_jet, actual) = tree.for_object(&object(0x01), PulseNumber(100));
        assert_eq!(low_jet, JetId::new(1, 0));
        assert!(!actual);
        assert_eq!(tree.owner(&low_jet), Some(old_owner));

        let (deep_jet, actual) = tree.for_object(&object(0xC1), PulseNumber(100));
        assert_eq!(deep_jet, deep);
        assert!(actual);
    }

    #[test]
    fn split_of_a_non_leaf_fails() {
        let tree = JetTree::new();
        tree.split(JetId::ROOT, PulseNumber(10)).unwrap();
        assert!(tree.split(JetId::ROOT, PulseNumber(11)).is_err());
    }
}
