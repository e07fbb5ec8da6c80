// Per-pulse execution compartment: a single-consumer event loop that
// owns its queue and its state-machine instances.
//
// Within a slot, events are processed in sink-push order. Control
// inputs (prepare, migrate, shutdown) ride the same queue, which is
// what guarantees that a pulse-boundary migration runs before any
// adapter reply that arrives after the boundary.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use lumen_core::bus::ExecutionContext;
use lumen_core::pulse::PulseNumber;
use lumen_core::reference::NodeRef;

use crate::machine::{
    AdapterReply, Event, EventInput, MachineRegistry, MachineStep, Payload, SlotKind, StateId,
    StateMachine,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Unallocated,
    Initializing,
    Working,
    PreparingNextPulse,
    Suspended,
}

#[derive(Debug)]
pub enum SlotInput {
    Event(Event),
    Response { instance: u64, reply: AdapterReply },
    /// Pulse boundary announced: drain and freeze.
    Prepare,
    /// The slot moves to a new kind at activation.
    Migrate(SlotKind),
    Shutdown { graceful: bool },
}

/// Conveyor-side handle to a running slot.
pub struct SlotHandle {
    pub pulse: PulseNumber,
    tx: mpsc::UnboundedSender<SlotInput>,
    _worker: JoinHandle<()>,
}

impl SlotHandle {
    /// Spawn a slot worker for the given pulse and kind.
    pub fn spawn(
        pulse: PulseNumber,
        kind: SlotKind,
        owner: NodeRef,
        registry: Arc<MachineRegistry>,
    ) -> SlotHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = SlotWorker {
            pulse,
            kind,
            state: SlotState::Initializing,
            owner,
            registry,
            rx,
            self_tx: tx.clone(),
            instances: HashMap::new(),
            next_instance: 0,
        };
        let handle = tokio::spawn(worker.run());
        SlotHandle {
            pulse,
            tx,
            _worker: handle,
        }
    }

    /// Returns false when the worker is gone; the conveyor turns that
    /// into a typed error.
    pub fn send(&self, input: SlotInput) -> bool {
        self.tx.send(input).is_ok()
    }
}

struct Instance {
    machine: Arc<dyn StateMachine>,
    state: StateId,
    payload: Payload,
    input: EventInput,
}

struct SlotWorker {
    pulse: PulseNumber,
    kind: SlotKind,
    state: SlotState,
    owner: NodeRef,
    registry: Arc<MachineRegistry>,
    rx: mpsc::UnboundedReceiver<SlotInput>,
    self_tx: mpsc::UnboundedSender<SlotInput>,
    instances: HashMap<u64, Instance>,
    next_instance: u64,
}

impl SlotWorker {
    async fn run(mut self) {
        self.state = SlotState::Working;
        debug!(
            "[Conveyor] slot {} started as {}",
            self.pulse,
            self.kind.as_str()
        );
        while let Some(input) = self.rx.recv().await {
            match input {
                SlotInput::Event(event) => self.handle_event(event),
                SlotInput::Response { instance, reply } => self.handle_response(instance, reply),
                SlotInput::Prepare => {
                    self.state = SlotState::PreparingNextPulse;
                }
                SlotInput::Migrate(kind) => self.migrate(kind),
                SlotInput::Shutdown { graceful } => {
                    if graceful {
                        // Drain whatever is already queued, then stop.
                        while let Ok(input) = self.rx.try_recv() {
                            match input {
                                SlotInput::Event(event) => self.handle_event(event),
                                SlotInput::Response { instance, reply } => {
                                    self.handle_response(instance, reply)
                                }
                                _ => {}
                            }
                        }
                    }
                    self.cancel_instances();
                    self.state = SlotState::Suspended;
                    break;
                }
            }
        }
        debug!("[Conveyor] slot {} stopped", self.pulse);
    }

    fn handle_event(&mut self, event: Event) {
        if self.state == SlotState::Suspended {
            warn!(
                "[Conveyor] slot {} dropped event for suspended slot",
                self.pulse
            );
            return;
        }
        let Some(machine) = self.registry.get(event.machine_type) else {
            warn!(
                "[Conveyor] slot {}: no machine registered for type {}",
                self.pulse, event.machine_type
            );
            return;
        };
        let input = EventInput {
            pulse: event.pulse,
            data: event.data,
        };
        match machine.init(self.kind, &input) {
            Ok((payload, step)) => self.drive(machine, input, payload, step),
            Err(error) => {
                // No payload exists yet; the handler can only log.
                let _ = machine.on_error(self.kind, error);
            }
        }
    }

    fn handle_response(&mut self, id: u64, reply: AdapterReply) {
        let Some(instance) = self.instances.remove(&id) else {
            debug!(
                "[Conveyor] slot {}: late adapter reply for instance {id} dropped",
                self.pulse
            );
            return;
        };
        let Instance {
            machine,
            state,
            mut payload,
            input,
        } = instance;
        let step = match machine.response(self.kind, state, &mut payload, reply) {
            Ok(step) => step,
            Err(error) => machine.on_error(self.kind, error),
        };
        self.drive(machine, input, payload, step);
    }

    /// Run transitions until the instance finishes or suspends.
    fn drive(
        &mut self,
        machine: Arc<dyn StateMachine>,
        input: EventInput,
        mut payload: Payload,
        mut step: MachineStep,
    ) {
        loop {
            match step {
                MachineStep::Transit(state) => {
                    step = match machine.transit(self.kind, state, &input, &mut payload) {
                        Ok(next) => next,
                        Err(error) => machine.on_error(self.kind, error),
                    };
                }
                MachineStep::WaitAdapter { state, call } => {
                    let id = self.next_instance;
                    self.next_instance += 1;
                    let ctx = ExecutionContext::new(self.owner, self.pulse);
                    let tx = self.self_tx.clone();
                    let adapter = call.adapter;
                    let request = call.request;
                    tokio::spawn(async move {
                        let reply = adapter.call(ctx, request).await;
                        // The slot may be gone; the reply is then dropped.
                        let _ = tx.send(SlotInput::Response {
                            instance: id,
                            reply,
                        });
                    });
                    self.instances.insert(
                        id,
                        Instance {
                            machine,
                            state,
                            payload,
                            input,
                        },
                    );
                    return;
                }
                MachineStep::Wait(state) => {
                    let id = self.next_instance;
                    self.next_instance += 1;
                    self.instances.insert(
                        id,
                        Instance {
                            machine,
                            state,
                            payload,
                            input,
                        },
                    );
                    return;
                }
                MachineStep::Done => return,
            }
        }
    }

    /// Pulse-boundary migration: every suspended instance gets its
    /// migrate handler before any queued reply is dispatched.
    fn migrate(&mut self, to: SlotKind) {
        let from = self.kind;
        self.kind = to;
        self.state = SlotState::Working;

        let ids: Vec<u64> = self.instances.keys().copied().collect();
        for id in ids {
            let Some(mut instance) = self.instances.remove(&id) else {
                continue;
            };
            let step = match instance.machine.migrate(
                from,
                to,
                instance.state,
                &mut instance.payload,
            ) {
                Ok(step) => step,
                Err(error) => instance.machine.on_error(to, error),
            };
            match step {
                MachineStep::Wait(state) => {
                    instance.state = state;
                    // Keep the same id so the in-flight reply still
                    // finds its instance.
                    self.instances.insert(id, instance);
                }
                other => {
                    let Instance {
                        machine,
                        payload,
                        input,
                        ..
                    } = instance;
                    self.drive(machine, input, payload, other);
                }
            }
        }
        debug!(
            "[Conveyor] slot {} migrated {} -> {}",
            self.pulse,
            from.as_str(),
            to.as_str()
        );
    }

    /// Terminal migration on shutdown; payloads are dropped afterwards.
    fn cancel_instances(&mut self) {
        for (_, mut instance) in self.instances.drain() {
            let _ = instance.machine.migrate(
                self.kind,
                self.kind,
                instance.state,
                &mut instance.payload,
            );
        }
    }
}
