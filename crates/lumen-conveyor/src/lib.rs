//! Pulse-sharded execution conveyor.
//!
//! Incoming events carry the pulse they belong to and are routed to a
//! slot dedicated to that pulse: one present slot, one future slot, a
//! bounded window of past slots and a shared antique slot for anything
//! older. Each slot runs registered state machines which may suspend on
//! asynchronous adapter calls and resume when the reply re-enters the
//! slot, surviving pulse boundaries through migration handlers.

pub mod conveyor;
pub mod machine;
pub mod slot;

pub use conveyor::{ConveyorError, ConveyorState, PulseConveyor};
pub use machine::{
    Adapter, AdapterCall, AdapterReply, Event, EventInput, MachineError, MachineRegistry,
    MachineResult, MachineStep, MachineTypeId, Payload, SlotKind, StateId, StateMachine,
};
