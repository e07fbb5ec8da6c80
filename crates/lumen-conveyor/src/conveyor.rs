// Pulse-sharded conveyor: routes events to the slot owning their pulse
// and rotates slots at pulse boundaries.
//
// The rotation is two-phased. `prepare_pulse` announces the boundary to
// the present and future slots; `activate_pulse` performs the rotation:
// present becomes past, future becomes present, and a fresh future slot
// is allocated for the prepared pulse.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;

use lumen_core::config::ConveyorSettings;
use lumen_core::pulse::PulseNumber;
use lumen_core::reference::NodeRef;

use crate::machine::{Event, MachineRegistry, MachineTypeId, SlotKind};
use crate::slot::{SlotHandle, SlotInput};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConveyorState {
    Active,
    PreparingPulse,
    ShuttingDown,
    Inactive,
}

impl ConveyorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConveyorState::Active => "active",
            ConveyorState::PreparingPulse => "preparing-pulse",
            ConveyorState::ShuttingDown => "shutting-down",
            ConveyorState::Inactive => "inactive",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConveyorError {
    /// The pulse lies beyond the future slot; the caller retries after
    /// the next activation.
    #[error("unknown pulse {0}")]
    UnknownPulse(PulseNumber),
    #[error("conveyor is shutting down")]
    ShuttingDown,
    #[error("conveyor is inactive")]
    Inactive,
    #[error("a pulse preparation is already in flight")]
    PrepareInFlight,
    #[error("unexpected pulse: expected {expected}, got {got}")]
    UnexpectedPulse {
        expected: PulseNumber,
        got: PulseNumber,
    },
    #[error("no prepared pulse to activate")]
    NotPrepared,
    #[error("slot {0} rejected the signal")]
    SignalFailed(PulseNumber),
}

type DoneCallback = Box<dyn FnOnce(PulseNumber) + Send>;

struct PreparedPulse {
    pulse: PulseNumber,
    done: DoneCallback,
}

struct Inner {
    state: ConveyorState,
    present: SlotHandle,
    future: SlotHandle,
    antique: SlotHandle,
    past: BTreeMap<PulseNumber, SlotHandle>,
    prepared: Option<PreparedPulse>,
}

pub struct PulseConveyor {
    owner: NodeRef,
    registry: Arc<MachineRegistry>,
    settings: ConveyorSettings,
    inner: Mutex<Inner>,
}

impl PulseConveyor {
    pub fn new(
        owner: NodeRef,
        registry: Arc<MachineRegistry>,
        settings: ConveyorSettings,
        present_pulse: PulseNumber,
    ) -> PulseConveyor {
        let future_pulse = present_pulse.next(settings.pulse_delta);
        let inner = Inner {
            state: ConveyorState::Active,
            present: SlotHandle::spawn(present_pulse, SlotKind::Present, owner, registry.clone()),
            future: SlotHandle::spawn(future_pulse, SlotKind::Future, owner, registry.clone()),
            antique: SlotHandle::spawn(
                PulseNumber::ANTIQUE,
                SlotKind::Antique,
                owner,
                registry.clone(),
            ),
            past: BTreeMap::new(),
            prepared: None,
        };
        info!(
            "[Conveyor] started: present={present_pulse} future={future_pulse} delta={}",
            settings.pulse_delta
        );
        PulseConveyor {
            owner,
            registry,
            settings,
            inner: Mutex::new(inner),
        }
    }

    pub fn state(&self) -> ConveyorState {
        self.inner.lock().state
    }

    pub fn present_pulse(&self) -> PulseNumber {
        self.inner.lock().present.pulse
    }

    pub fn future_pulse(&self) -> PulseNumber {
        self.inner.lock().future.pulse
    }

    /// Route one event to the slot owning its pulse.
    pub fn sink_push(
        &self,
        pulse: PulseNumber,
        machine_type: MachineTypeId,
        data: Vec<u8>,
    ) -> Result<(), ConveyorError> {
        let inner = self.inner.lock();
        match inner.state {
            ConveyorState::Active | ConveyorState::PreparingPulse => {}
            ConveyorState::ShuttingDown => return Err(ConveyorError::ShuttingDown),
            ConveyorState::Inactive => return Err(ConveyorError::Inactive),
        }
        let event = Event {
            pulse,
            machine_type,
            data,
        };
        let slot = if pulse > inner.future.pulse {
            return Err(ConveyorError::UnknownPulse(pulse));
        } else if pulse > inner.present.pulse {
            &inner.future
        } else if pulse == inner.present.pulse {
            &inner.present
        } else if let Some(past) = inner.past.get(&pulse) {
            past
        } else {
            &inner.antique
        };
        if !slot.send(SlotInput::Event(event)) {
            return Err(ConveyorError::SignalFailed(slot.pulse));
        }
        Ok(())
    }

    /// Push a batch of same-pulse events; stops at the first routing
    /// failure.
    pub fn sink_push_all(
        &self,
        pulse: PulseNumber,
        events: Vec<(MachineTypeId, Vec<u8>)>,
    ) -> Result<(), ConveyorError> {
        for (machine_type, data) in events {
            self.sink_push(pulse, machine_type, data)?;
        }
        Ok(())
    }

    /// First half of the pulse boundary: freeze the present and future
    /// slots for the announced pulse. The callback fires when the
    /// matching `activate_pulse` completes.
    pub fn prepare_pulse(
        &self,
        pulse: PulseNumber,
        done: impl FnOnce(PulseNumber) + Send + 'static,
    ) -> Result<(), ConveyorError> {
        let mut inner = self.inner.lock();
        match inner.state {
            ConveyorState::Active => {}
            ConveyorState::PreparingPulse => return Err(ConveyorError::PrepareInFlight),
            ConveyorState::ShuttingDown => return Err(ConveyorError::ShuttingDown),
            ConveyorState::Inactive => return Err(ConveyorError::Inactive),
        }
        let expected = inner.future.pulse.next(self.settings.pulse_delta);
        if pulse != expected {
            return Err(ConveyorError::UnexpectedPulse {
                expected,
                got: pulse,
            });
        }
        if !inner.present.send(SlotInput::Prepare) {
            return Err(ConveyorError::SignalFailed(inner.present.pulse));
        }
        if !inner.future.send(SlotInput::Prepare) {
            return Err(ConveyorError::SignalFailed(inner.future.pulse));
        }
        inner.prepared = Some(PreparedPulse {
            pulse,
            done: Box::new(done),
        });
        inner.state = ConveyorState::PreparingPulse;
        debug!("[Conveyor] prepared pulse {pulse}");
        Ok(())
    }

    /// Second half of the boundary: rotate the slots and allocate a
    /// future slot for the prepared pulse.
    pub fn activate_pulse(&self) -> Result<PulseNumber, ConveyorError> {
        let (done, pulse) = {
            let mut inner = self.inner.lock();
            match inner.state {
                ConveyorState::PreparingPulse => {}
                ConveyorState::ShuttingDown => return Err(ConveyorError::ShuttingDown),
                ConveyorState::Inactive => return Err(ConveyorError::Inactive),
                ConveyorState::Active => return Err(ConveyorError::NotPrepared),
            }
            let PreparedPulse { pulse, done } =
                inner.prepared.take().ok_or(ConveyorError::NotPrepared)?;

            let new_future =
                SlotHandle::spawn(pulse, SlotKind::Future, self.owner, self.registry.clone());
            let new_present = std::mem::replace(&mut inner.future, new_future);
            let retired = std::mem::replace(&mut inner.present, new_present);

            if !inner.present.send(SlotInput::Migrate(SlotKind::Present)) {
                warn!(
                    "[Conveyor] present slot {} was gone at activation",
                    inner.present.pulse
                );
            }
            if !retired.send(SlotInput::Migrate(SlotKind::Past)) {
                warn!(
                    "[Conveyor] past slot {} was gone at activation",
                    retired.pulse
                );
            }
            inner.past.insert(retired.pulse, retired);
            while inner.past.len() > self.settings.past_slots {
                if let Some((evicted_pulse, evicted)) = inner.past.pop_first() {
                    let _ = evicted.send(SlotInput::Shutdown { graceful: true });
                    debug!("[Conveyor] evicted past slot {evicted_pulse}");
                }
            }

            inner.state = ConveyorState::Active;
            info!(
                "[Conveyor] activated pulse: present={} future={}",
                inner.present.pulse, inner.future.pulse
            );
            (done, pulse)
        };
        // Outside the lock: the callback may call back into the
        // conveyor.
        done(pulse);
        Ok(pulse)
    }

    /// Stop accepting events and signal every slot. Graceful shutdown
    /// lets slots drain their queues and run terminal migrations;
    /// immediate shutdown drops queued work.
    pub fn initiate_shutdown(&self, graceful: bool) {
        let mut inner = self.inner.lock();
        if matches!(
            inner.state,
            ConveyorState::ShuttingDown | ConveyorState::Inactive
        ) {
            return;
        }
        inner.state = ConveyorState::ShuttingDown;
        inner.prepared = None;
        let _ = inner.present.send(SlotInput::Shutdown { graceful });
        let _ = inner.future.send(SlotInput::Shutdown { graceful });
        let _ = inner.antique.send(SlotInput::Shutdown { graceful });
        for slot in inner.past.values() {
            let _ = slot.send(SlotInput::Shutdown { graceful });
        }
        if !graceful {
            inner.state = ConveyorState::Inactive;
        }
        info!(
            "[Conveyor] shutdown initiated (graceful={graceful})"
        );
    }
}
