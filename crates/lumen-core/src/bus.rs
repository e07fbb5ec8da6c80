// Message bus seam and the explicit execution context.
//
// The context replaces the ambient "current proxy context" singleton of
// older designs: every handler call receives the caller's reference,
// the pulse it runs under, and a bus handle explicitly.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::CoreError;
use crate::message::{Message, Reply};
use crate::pulse::PulseNumber;
use crate::reference::NodeRef;

/// Transport seam. Implementations carry parcels between nodes; the
/// wire protocol is out of scope for the core.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn send(&self, target: NodeRef, message: Message) -> Result<Reply, CoreError>;
}

/// Explicit per-call context threaded through handlers.
#[derive(Clone)]
pub struct ExecutionContext {
    pub caller: NodeRef,
    pub pulse: PulseNumber,
    pub bus: Option<Arc<dyn MessageBus>>,
}

impl ExecutionContext {
    pub fn new(caller: NodeRef, pulse: PulseNumber) -> Self {
        ExecutionContext {
            caller,
            pulse,
            bus: None,
        }
    }

    pub fn with_bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("caller", &self.caller)
            .field("pulse", &self.pulse)
            .field("bus", &self.bus.is_some())
            .finish()
    }
}
