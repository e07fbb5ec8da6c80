// Ledger bus protocol: message and reply payloads exchanged between
// virtual, light and heavy nodes. Encoding is canonical bincode and is
// versioned by `PROTOCOL_VERSION`.
//
// Consensus phase packets ride their own exchange (see lumen-consensus)
// and are not part of this enum.

use serde::{Deserialize, Serialize};

use crate::crypto::{hash_with_tag, tag, Digest};
use crate::error::CoreError;
use crate::pulse::PulseNumber;
use crate::record::MachineType;
use crate::reference::{JetId, NodeRef, ObjectId, RecordId};

pub const PROTOCOL_VERSION: u16 = 1;

/// Capability proving a redirect reply was issued by an authorized
/// holder; scoped to a single pulse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationToken {
    pub node: NodeRef,
    pub pulse: PulseNumber,
    pub signature: Vec<u8>,
}

impl DelegationToken {
    /// The byte string the issuer signs.
    pub fn signed_payload(node: &NodeRef, pulse: PulseNumber, message_hash: &Digest) -> Digest {
        hash_with_tag(
            tag::TOKEN,
            &[node.as_bytes(), &pulse.to_be_bytes(), message_hash],
        )
    }
}

/// A pending request entry carried inside hot data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRequest {
    pub object: ObjectId,
    pub request: RecordId,
    pub active: bool,
}

/// A recent object entry carried inside hot data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentObject {
    pub object: ObjectId,
    pub index_bytes: Vec<u8>,
    pub ttl_pulses: u32,
}

/// Per-jet snapshot handed from the previous owner to the new owner at
/// a pulse boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotData {
    pub jet: JetId,
    pub drop_bytes: Vec<u8>,
    pub recent_objects: Vec<RecentObject>,
    pub pending_requests: Vec<PendingRequest>,
    pub pulse: PulseNumber,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    GetCode {
        code: RecordId,
    },
    GetObject {
        head: ObjectId,
        state: Option<RecordId>,
        approved: bool,
    },
    GetDelegate {
        head: ObjectId,
        as_type: ObjectId,
    },
    GetChildren {
        parent: ObjectId,
        from_child: Option<RecordId>,
        from_pulse: Option<PulseNumber>,
        amount: u32,
    },
    GetRequest {
        object: ObjectId,
        request: RecordId,
    },
    GetPendingRequests {
        object: ObjectId,
    },
    GetPendingRequestId {
        object: ObjectId,
    },
    SetRecord {
        record_bytes: Vec<u8>,
    },
    UpdateObject {
        object: ObjectId,
        record_bytes: Vec<u8>,
        memory: Vec<u8>,
    },
    RegisterChild {
        parent: ObjectId,
        record_bytes: Vec<u8>,
    },
    SetBlob {
        object: ObjectId,
        memory: Vec<u8>,
    },
    GetObjectIndex {
        object: ObjectId,
    },
    GetJet {
        object: ObjectId,
        pulse: PulseNumber,
    },
    HotRecords(HotData),
    JetDrop {
        jet: JetId,
        messages: Vec<Message>,
    },
    ValidateRecord {
        object: ObjectId,
        state: RecordId,
        is_valid: bool,
    },
    ValidationCheck {
        object: ObjectId,
        validated_state: RecordId,
        latest_state_approved: Option<RecordId>,
    },
    AbandonedRequestsNotification {
        object: ObjectId,
    },
}

impl Message {
    /// The object or jet target a message carries; used by the
    /// jet-check middleware. None for messages with no authority check.
    pub fn target_object(&self) -> Option<ObjectId> {
        match self {
            Message::GetObject { head, .. }
            | Message::GetDelegate { head, .. }
            | Message::GetChildren { parent: head, .. }
            | Message::GetRequest { object: head, .. }
            | Message::GetPendingRequests { object: head }
            | Message::GetPendingRequestId { object: head }
            | Message::UpdateObject { object: head, .. }
            | Message::RegisterChild { parent: head, .. }
            | Message::SetBlob { object: head, .. }
            | Message::GetObjectIndex { object: head }
            | Message::ValidateRecord { object: head, .. }
            | Message::ValidationCheck { object: head, .. }
            | Message::AbandonedRequestsNotification { object: head } => Some(*head),
            Message::SetRecord { record_bytes } => crate::record::Record::decode(record_bytes)
                .ok()
                .and_then(|r| r.object()),
            Message::GetCode { .. }
            | Message::GetJet { .. }
            | Message::HotRecords(_)
            | Message::JetDrop { .. } => None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("message encoding cannot fail")
    }

    pub fn decode(bytes: &[u8]) -> Result<Message, CoreError> {
        bincode::deserialize(bytes)
            .map_err(|e| CoreError::Bus(format!("undecodable message: {e}")))
    }

    pub fn hash(&self) -> Digest {
        hash_with_tag(tag::TOKEN, &[&self.encode()])
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::GetCode { .. } => "GetCode",
            Message::GetObject { .. } => "GetObject",
            Message::GetDelegate { .. } => "GetDelegate",
            Message::GetChildren { .. } => "GetChildren",
            Message::GetRequest { .. } => "GetRequest",
            Message::GetPendingRequests { .. } => "GetPendingRequests",
            Message::GetPendingRequestId { .. } => "GetPendingRequestID",
            Message::SetRecord { .. } => "SetRecord",
            Message::UpdateObject { .. } => "UpdateObject",
            Message::RegisterChild { .. } => "RegisterChild",
            Message::SetBlob { .. } => "SetBlob",
            Message::GetObjectIndex { .. } => "GetObjectIndex",
            Message::GetJet { .. } => "GetJet",
            Message::HotRecords(_) => "HotRecords",
            Message::JetDrop { .. } => "JetDrop",
            Message::ValidateRecord { .. } => "ValidateRecord",
            Message::ValidationCheck { .. } => "ValidationCheck",
            Message::AbandonedRequestsNotification { .. } => "AbandonedRequestsNotification",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    Code {
        bytes: Vec<u8>,
        machine_type: MachineType,
    },
    Object {
        head: ObjectId,
        state: RecordId,
        prototype: Option<ObjectId>,
        is_prototype: bool,
        child_pointer: Option<RecordId>,
        parent: Option<ObjectId>,
        memory: Vec<u8>,
    },
    Delegate {
        head: ObjectId,
    },
    Children {
        refs: Vec<ObjectId>,
        next_from: Option<RecordId>,
    },
    Request {
        record_bytes: Vec<u8>,
    },
    Id {
        id: RecordId,
    },
    ObjectIndex {
        index_bytes: Vec<u8>,
    },
    HasPendingRequests {
        has: bool,
    },
    Jet {
        jet: JetId,
        actual: bool,
    },
    Ok,
    NotOk,
    /// Re-send to `node` with the token attached.
    Redirect {
        node: NodeRef,
        token: DelegationToken,
    },
    /// The data lives on the heavy archive; re-send there.
    HeavyRedirect {
        node: NodeRef,
        token: DelegationToken,
    },
    Error(CoreError),
}
