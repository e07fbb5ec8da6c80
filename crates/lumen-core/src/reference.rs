// Stable 32-byte references for objects, records and nodes, plus the
// jet identifier (a binary prefix over the object-ID space).

use serde::{Deserialize, Serialize};

use crate::pulse::PulseNumber;

macro_rules! byte_ref {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
            Default,
        )]
        pub struct $name(pub [u8; 32]);

        impl $name {
            pub fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                // Short form: first 8 hex chars, enough for logs.
                write!(f, "{}", &hex::encode(&self.0[..4]))
            }
        }
    };
}

byte_ref! {
    /// Globally unique object reference, stable across pulses.
    ObjectId
}

byte_ref! {
    /// Content-derived record identifier: hash of the canonical record
    /// encoding prefixed with the pulse it belongs to.
    RecordId
}

byte_ref! {
    /// Globally unique node reference, stable across pulses.
    NodeRef
}

/// Compact 32-bit node identity scoped to a pulse; used as the index
/// into consensus bitsets and the state matrix.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ShortNodeId(pub u32);

impl std::fmt::Display for ShortNodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A binary prefix over the object-ID keyspace: `(depth, prefix)`.
///
/// The prefix holds the first `depth` bits of the covered object IDs,
/// left-aligned in a u64 (depth is capped at 64, which is far deeper
/// than any realistic split schedule).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct JetId {
    pub depth: u8,
    pub prefix: u64,
}

impl JetId {
    /// The root jet covering the whole keyspace.
    pub const ROOT: JetId = JetId { depth: 0, prefix: 0 };

    pub fn new(depth: u8, prefix: u64) -> Self {
        debug_assert!(depth <= 64);
        JetId {
            depth,
            prefix: mask_prefix(prefix, depth),
        }
    }

    /// Jet an object ID falls under at this depth.
    pub fn for_object(object: &ObjectId, depth: u8) -> Self {
        let raw = u64::from_be_bytes(object.0[..8].try_into().expect("8-byte slice"));
        JetId::new(depth, raw)
    }

    pub fn parent(&self) -> Option<JetId> {
        if self.depth == 0 {
            None
        } else {
            Some(JetId::new(self.depth - 1, self.prefix))
        }
    }

    /// The two children produced by a split; same prefix with one extra
    /// bit of 0 and 1 respectively.
    pub fn children(&self) -> (JetId, JetId) {
        let depth = self.depth + 1;
        let bit = 1u64 << (64 - depth as u64);
        (
            JetId::new(depth, self.prefix),
            JetId::new(depth, self.prefix | bit),
        )
    }

    /// Whether this jet covers the given object ID.
    pub fn contains(&self, object: &ObjectId) -> bool {
        let raw = u64::from_be_bytes(object.0[..8].try_into().expect("8-byte slice"));
        mask_prefix(raw, self.depth) == self.prefix
    }

    /// Storage-key representation: depth byte followed by the prefix.
    pub fn to_key_bytes(&self) -> [u8; 9] {
        let mut out = [0u8; 9];
        out[0] = self.depth;
        out[1..].copy_from_slice(&self.prefix.to_be_bytes());
        out
    }
}

impl std::fmt::Display for JetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.depth == 0 {
            return write!(f, "[*]");
        }
        let mut bits = String::with_capacity(self.depth as usize);
        for i in 0..self.depth {
            let bit = (self.prefix >> (63 - i as u64)) & 1;
            bits.push(if bit == 1 { '1' } else { '0' });
        }
        write!(f, "[{}]", bits)
    }
}

fn mask_prefix(raw: u64, depth: u8) -> u64 {
    if depth == 0 {
        0
    } else if depth >= 64 {
        raw
    } else {
        raw & (!0u64 << (64 - depth as u64))
    }
}
