// Object lifeline: the per-object chain of state records with
// invariant transition rules.
//
// SAFETY INVARIANTS:
// 1. Activation requires state == Undefined
// 2. Amend requires state in {Activation, Amend}
// 3. Deactivation terminates the chain
// 4. Every new state record's prev-state pointer must equal the current
//    latest state or the update is rejected

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::pulse::PulseNumber;
use crate::record::{Record, RecordKind};
use crate::reference::{ObjectId, RecordId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LifelineState {
    #[default]
    Undefined,
    Activation,
    Amend,
    Deactivation,
}

impl LifelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifelineState::Undefined => "undefined",
            LifelineState::Activation => "activation",
            LifelineState::Amend => "amend",
            LifelineState::Deactivation => "deactivation",
        }
    }

    /// The state-transition table. Deactivation is terminal.
    pub fn can_accept(&self, incoming: RecordKind) -> bool {
        match (self, incoming) {
            (LifelineState::Undefined, RecordKind::Activation) => true,
            (LifelineState::Activation | LifelineState::Amend, RecordKind::Amend) => true,
            (LifelineState::Activation | LifelineState::Amend, RecordKind::Deactivation) => true,
            _ => false,
        }
    }
}

/// The per-object index served by GetObjectIndex and mutated by
/// UpdateObject / RegisterChild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ObjectLifeline {
    pub state: LifelineState,
    pub latest_state: Option<RecordId>,
    pub latest_state_approved: Option<RecordId>,
    pub child_pointer: Option<RecordId>,
    pub parent: Option<ObjectId>,
    pub delegates: HashMap<ObjectId, ObjectId>,
    pub latest_update_pulse: PulseNumber,
}

impl ObjectLifeline {
    /// Apply a state record that has already been assigned `id`.
    ///
    /// Chain continuity: the record's prev-state must equal the current
    /// latest state. A record whose computed ID equals the current
    /// latest state is accepted as an idempotent retry.
    pub fn apply_state(
        &mut self,
        id: RecordId,
        record: &Record,
        pulse: PulseNumber,
    ) -> Result<(), CoreError> {
        if self.state == LifelineState::Deactivation {
            return Err(CoreError::Deactivated);
        }
        if Some(id) == self.latest_state {
            // Retry of the already committed record.
            return Ok(());
        }
        let kind = record.kind();
        if !record.is_state() {
            return Err(CoreError::InvalidState {
                from: self.state.as_str().into(),
                to: format!("{kind:?}"),
            });
        }
        if !self.state.can_accept(kind) {
            return Err(CoreError::InvalidState {
                from: self.state.as_str().into(),
                to: format!("{kind:?}"),
            });
        }
        if record.prev_state() != self.latest_state {
            return Err(CoreError::InvalidChain {
                expected: opt_id(self.latest_state),
                got: opt_id(record.prev_state()),
            });
        }

        self.state = match kind {
            RecordKind::Activation => LifelineState::Activation,
            RecordKind::Amend => LifelineState::Amend,
            RecordKind::Deactivation => LifelineState::Deactivation,
            _ => unreachable!("checked by is_state"),
        };
        if let Record::Activation { parent, .. } = record {
            self.parent = Some(*parent);
        }
        self.latest_state = Some(id);
        self.latest_update_pulse = pulse;
        Ok(())
    }

    /// Apply a child record to the child pointer; same continuity and
    /// idempotence rules as state records.
    pub fn apply_child(
        &mut self,
        id: RecordId,
        record: &Record,
        pulse: PulseNumber,
    ) -> Result<(), CoreError> {
        let (child, prev_child, delegate_as) = match record {
            Record::Child {
                child,
                prev_child,
                delegate_as,
                ..
            } => (*child, *prev_child, *delegate_as),
            other => {
                return Err(CoreError::InvalidState {
                    from: "child-pointer".into(),
                    to: format!("{:?}", other.kind()),
                })
            }
        };
        if Some(id) == self.child_pointer {
            return Ok(());
        }
        if prev_child != self.child_pointer {
            return Err(CoreError::InvalidChain {
                expected: opt_id(self.child_pointer),
                got: opt_id(prev_child),
            });
        }
        if let Some(as_type) = delegate_as {
            self.delegates.insert(as_type, child);
        }
        self.child_pointer = Some(id);
        self.latest_update_pulse = pulse;
        Ok(())
    }

    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("lifeline encoding cannot fail")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CoreError> {
        bincode::deserialize(bytes)
            .map_err(|e| CoreError::Bus(format!("undecodable lifeline: {e}")))
    }
}

fn opt_id(id: Option<RecordId>) -> String {
    id.map(|i| i.to_string()).unwrap_or_else(|| "nil".into())
}
