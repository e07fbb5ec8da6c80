// Append-only ledger records. A record's ID is the hash of its
// canonical encoding prefixed with the pulse it belongs to.

use serde::{Deserialize, Serialize};

use crate::crypto::{hash_with_tag, tag};
use crate::pulse::PulseNumber;
use crate::reference::{ObjectId, RecordId};

/// Contract runtime the stored code targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachineType {
    Builtin,
    Wasm,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Record {
    /// An incoming contract call; creates a pending request on its
    /// object until the matching result arrives.
    Request {
        object: ObjectId,
        method: String,
        arguments: Vec<u8>,
    },

    /// Completion of a previously registered request.
    Result {
        object: ObjectId,
        request: RecordId,
        payload: Vec<u8>,
    },

    /// Contract code blob.
    Code {
        code: Vec<u8>,
        machine_type: MachineType,
    },

    /// First state record of a lifeline. `prev_state` is always absent.
    Activation {
        object: ObjectId,
        parent: ObjectId,
        memory: Vec<u8>,
        is_prototype: bool,
        prototype: Option<ObjectId>,
    },

    /// State update. Must chain onto the current latest state record.
    Amend {
        object: ObjectId,
        memory: Vec<u8>,
        prev_state: RecordId,
    },

    /// Terminates the lifeline. Must chain like an amend.
    Deactivation {
        object: ObjectId,
        prev_state: RecordId,
    },

    /// Child registration; chains on the object's child pointer.
    Child {
        parent: ObjectId,
        child: ObjectId,
        prev_child: Option<RecordId>,
        delegate_as: Option<ObjectId>,
    },
}

/// Record kind, used for dispatch and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordKind {
    Request,
    Result,
    Code,
    Activation,
    Amend,
    Deactivation,
    Child,
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Request { .. } => RecordKind::Request,
            Record::Result { .. } => RecordKind::Result,
            Record::Code { .. } => RecordKind::Code,
            Record::Activation { .. } => RecordKind::Activation,
            Record::Amend { .. } => RecordKind::Amend,
            Record::Deactivation { .. } => RecordKind::Deactivation,
            Record::Child { .. } => RecordKind::Child,
        }
    }

    /// State records drive lifeline transitions.
    pub fn is_state(&self) -> bool {
        matches!(
            self.kind(),
            RecordKind::Activation | RecordKind::Amend | RecordKind::Deactivation
        )
    }

    /// The object a record belongs to, if any.
    pub fn object(&self) -> Option<ObjectId> {
        match self {
            Record::Request { object, .. }
            | Record::Result { object, .. }
            | Record::Amend { object, .. }
            | Record::Deactivation { object, .. }
            | Record::Activation { object, .. } => Some(*object),
            Record::Child { parent, .. } => Some(*parent),
            Record::Code { .. } => None,
        }
    }

    /// Chain pointer of a state record; None for activation.
    pub fn prev_state(&self) -> Option<RecordId> {
        match self {
            Record::Amend { prev_state, .. } | Record::Deactivation { prev_state, .. } => {
                Some(*prev_state)
            }
            _ => None,
        }
    }

    /// Canonical encoding: deterministic bincode of the variant. This is
    /// the byte form both hashed and persisted.
    pub fn canonical(&self) -> Vec<u8> {
        bincode::serialize(self).expect("record encoding cannot fail")
    }

    /// `id = H(tag_record || pulse_be || canonical(record))`
    pub fn record_id(&self, pulse: PulseNumber) -> RecordId {
        let bytes = self.canonical();
        RecordId(hash_with_tag(
            tag::RECORD,
            &[&pulse.to_be_bytes(), &bytes],
        ))
    }

    pub fn decode(bytes: &[u8]) -> Result<Record, crate::error::CoreError> {
        bincode::deserialize(bytes)
            .map_err(|e| crate::error::CoreError::Bus(format!("undecodable record: {e}")))
    }
}
