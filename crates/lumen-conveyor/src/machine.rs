// State-machine contract for conveyor events.
//
// An event is dispatched to a machine type by its type id; the machine
// runs transitions until it finishes or yields on an adapter call.
// While waiting the instance holds no CPU; the adapter reply re-enters
// the same slot and instance. At a pulse boundary waiting instances are
// migrated before any queued reply is delivered.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use lumen_core::bus::ExecutionContext;
use lumen_core::pulse::PulseNumber;

pub type MachineTypeId = u32;
pub type StateId = u32;
pub type Payload = Box<dyn Any + Send>;

/// Which slot kind an instance currently runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Past,
    Present,
    Future,
    Antique,
}

impl SlotKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotKind::Past => "past",
            SlotKind::Present => "present",
            SlotKind::Future => "future",
            SlotKind::Antique => "antique",
        }
    }
}

/// An event pushed into the conveyor.
#[derive(Debug)]
pub struct Event {
    pub pulse: PulseNumber,
    pub machine_type: MachineTypeId,
    pub data: Vec<u8>,
}

/// Input handed to machine handlers.
#[derive(Debug, Clone)]
pub struct EventInput {
    pub pulse: PulseNumber,
    pub data: Vec<u8>,
}

/// Completion of an asynchronous adapter call.
#[derive(Debug, Clone)]
pub struct AdapterReply {
    pub payload: Vec<u8>,
    pub error: Option<String>,
}

/// An asynchronous collaborator a state machine can yield on.
#[async_trait]
pub trait Adapter: Send + Sync {
    async fn call(&self, ctx: ExecutionContext, request: Vec<u8>) -> AdapterReply;
}

/// A pending adapter invocation produced by a transition.
pub struct AdapterCall {
    pub adapter: Arc<dyn Adapter>,
    pub request: Vec<u8>,
}

impl std::fmt::Debug for AdapterCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterCall")
            .field("request_len", &self.request.len())
            .finish()
    }
}

/// What a handler asks the slot to do next.
#[derive(Debug)]
pub enum MachineStep {
    /// Continue with another transition in this slot.
    Transit(StateId),
    /// Issue an adapter call and yield until its reply re-enters the
    /// instance.
    WaitAdapter { state: StateId, call: AdapterCall },
    /// Keep waiting on an already in-flight adapter call (used by
    /// migration handlers to carry a suspension across slots).
    Wait(StateId),
    /// The instance is finished.
    Done,
}

#[derive(Debug, thiserror::Error)]
#[error("machine error in state {state}: {message}")]
pub struct MachineError {
    pub state: StateId,
    pub message: String,
}

impl MachineError {
    pub fn new(state: StateId, message: impl Into<String>) -> Self {
        MachineError {
            state,
            message: message.into(),
        }
    }
}

pub type MachineResult = Result<MachineStep, MachineError>;

/// Per-type handler set. Implementations dispatch internally on the
/// slot kind and state id; the slot worker never interprets payloads.
pub trait StateMachine: Send + Sync {
    /// First-time entry of an event into a slot.
    fn init(&self, kind: SlotKind, input: &EventInput) -> Result<(Payload, MachineStep), MachineError>;

    /// One transition step.
    fn transit(
        &self,
        kind: SlotKind,
        state: StateId,
        input: &EventInput,
        payload: &mut Payload,
    ) -> MachineResult;

    /// Invoked when the instance moves between slots at a pulse
    /// boundary; may replay, cancel or carry the payload forward.
    fn migrate(
        &self,
        from: SlotKind,
        to: SlotKind,
        state: StateId,
        payload: &mut Payload,
    ) -> MachineResult {
        let _ = (from, to, payload);
        // Default: keep waiting in the new slot kind.
        Ok(MachineStep::Wait(state))
    }

    /// An adapter reply re-entering the instance.
    fn response(
        &self,
        kind: SlotKind,
        state: StateId,
        payload: &mut Payload,
        reply: AdapterReply,
    ) -> MachineResult;

    /// Error handler; the returned step replaces the failed one.
    fn on_error(&self, kind: SlotKind, error: MachineError) -> MachineStep {
        log::error!("[Conveyor] machine failed in {} slot: {error}", kind.as_str());
        MachineStep::Done
    }
}

/// Machine types registered with the conveyor, keyed by type id.
#[derive(Default)]
pub struct MachineRegistry {
    machines: HashMap<MachineTypeId, Arc<dyn StateMachine>>,
}

impl MachineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, type_id: MachineTypeId, machine: Arc<dyn StateMachine>) {
        self.machines.insert(type_id, machine);
    }

    pub fn get(&self, type_id: MachineTypeId) -> Option<Arc<dyn StateMachine>> {
        self.machines.get(&type_id).cloned()
    }
}
