// End-to-end conveyor behavior: routing, pulse rotation, migration
// ordering and shutdown.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::time::sleep;

use lumen_conveyor::{
    Adapter, AdapterCall, AdapterReply, ConveyorError, ConveyorState, EventInput, MachineRegistry,
    MachineResult, MachineStep, Payload, PulseConveyor, SlotKind, StateMachine,
};
use lumen_core::bus::ExecutionContext;
use lumen_core::config::ConveyorSettings;
use lumen_core::pulse::PulseNumber;
use lumen_core::reference::NodeRef;

type TraceLog = Arc<Mutex<Vec<String>>>;

/// Records every handler invocation; finishes immediately.
struct TracingMachine {
    log: TraceLog,
}

impl StateMachine for TracingMachine {
    fn init(
        &self,
        kind: SlotKind,
        input: &EventInput,
    ) -> Result<(Payload, MachineStep), lumen_conveyor::MachineError> {
        self.log
            .lock()
            .push(format!("init:{}:{}", kind.as_str(), input.pulse));
        Ok((Box::new(()), MachineStep::Done))
    }

    fn transit(
        &self,
        _kind: SlotKind,
        _state: u32,
        _input: &EventInput,
        _payload: &mut Payload,
    ) -> MachineResult {
        Ok(MachineStep::Done)
    }

    fn response(
        &self,
        _kind: SlotKind,
        _state: u32,
        _payload: &mut Payload,
        _reply: AdapterReply,
    ) -> MachineResult {
        Ok(MachineStep::Done)
    }
}

/// Blocks until the test releases the gate, then replies.
struct GatedAdapter {
    gate: Arc<Semaphore>,
}

#[async_trait]
impl Adapter for GatedAdapter {
    async fn call(&self, _ctx: ExecutionContext, request: Vec<u8>) -> AdapterReply {
        let permit = self.gate.acquire().await.expect("gate open");
        permit.forget();
        AdapterReply {
            payload: request,
            error: None,
        }
    }
}

/// Suspends on a gated adapter call and records migrations and the
/// reply, so the boundary ordering is observable.
struct WaitingMachine {
    log: TraceLog,
    gate: Arc<Semaphore>,
}

impl StateMachine for WaitingMachine {
    fn init(
        &self,
        kind: SlotKind,
        _input: &EventInput,
    ) -> Result<(Payload, MachineStep), lumen_conveyor::MachineError> {
        self.log.lock().push(format!("init:{}", kind.as_str()));
        Ok((
            Box::new(()),
            MachineStep::WaitAdapter {
                state: 1,
                call: AdapterCall {
                    adapter: Arc::new(GatedAdapter {
                        gate: self.gate.clone(),
                    }),
                    request: vec![7],
                },
            },
        ))
    }

    fn transit(
        &self,
        _kind: SlotKind,
        _state: u32,
        _input: &EventInput,
        _payload: &mut Payload,
    ) -> MachineResult {
        Ok(MachineStep::Done)
    }

    fn migrate(
        &self,
        from: SlotKind,
        to: SlotKind,
        state: u32,
        _payload: &mut Payload,
    ) -> MachineResult {
        self.log
            .lock()
            .push(format!("migrate:{}->{}", from.as_str(), to.as_str()));
        Ok(MachineStep::Wait(state))
    }

    fn response(
        &self,
        kind: SlotKind,
        state: u32,
        _payload: &mut Payload,
        reply: AdapterReply,
    ) -> MachineResult {
        assert!(reply.error.is_none());
        self.log
            .lock()
            .push(format!("response:{}:{state}", kind.as_str()));
        Ok(MachineStep::Done)
    }
}

const TRACING: u32 = 1;
const WAITING: u32 = 2;

fn build_conveyor(log: &TraceLog, gate: &Arc<Semaphore>) -> PulseConveyor {
    let mut registry = MachineRegistry::new();
    registry.register(TRACING, Arc::new(TracingMachine { log: log.clone() }));
    registry.register(
        WAITING,
        Arc::new(WaitingMachine {
            log: log.clone(),
            gate: gate.clone(),
        }),
    );
    PulseConveyor::new(
        NodeRef([1u8; 32]),
        Arc::new(registry),
        ConveyorSettings::default(),
        PulseNumber(100),
    )
}

#[tokio::test]
async fn events_route_to_the_slot_owning_their_pulse() {
    let log: TraceLog = Arc::new(Mutex::new(Vec::new()));
    let gate = Arc::new(Semaphore::new(0));
    let conveyor = build_conveyor(&log, &gate);

    conveyor.sink_push(PulseNumber(100), TRACING, vec![]).unwrap();
    conveyor.sink_push(PulseNumber(110), TRACING, vec![]).unwrap();
    conveyor.sink_push(PulseNumber(50), TRACING, vec![]).unwrap();
    // Beyond the future slot: retryable, not routable.
    assert!(matches!(
        conveyor.sink_push(PulseNumber(120), TRACING, vec![]),
        Err(ConveyorError::UnknownPulse(PulseNumber(120)))
    ));

    sleep(Duration::from_millis(100)).await;
    let entries = log.lock().clone();
    assert!(entries.contains(&"init:present:100".to_string()));
    assert!(entries.contains(&"init:future:110".to_string()));
    assert!(entries.contains(&"init:antique:50".to_string()));
}

#[tokio::test]
async fn prepare_rejects_the_wrong_pulse_without_side_effects() {
    let log: TraceLog = Arc::new(Mutex::new(Vec::new()));
    let gate = Arc::new(Semaphore::new(0));
    let conveyor = build_conveyor(&log, &gate);

    let err = conveyor.prepare_pulse(PulseNumber(115), |_| {}).unwrap_err();
    assert!(matches!(
        err,
        ConveyorError::UnexpectedPulse {
            expected: PulseNumber(120),
            got: PulseNumber(115),
        }
    ));
    assert_eq!(conveyor.state(), ConveyorState::Active);
    assert!(matches!(
        conveyor.activate_pulse(),
        Err(ConveyorError::NotPrepared)
    ));
}

#[tokio::test]
async fn activation_rotates_slots_and_fires_the_callback() {
    let log: TraceLog = Arc::new(Mutex::new(Vec::new()));
    let gate = Arc::new(Semaphore::new(0));
    let conveyor = build_conveyor(&log, &gate);

    let fired: Arc<Mutex<Option<PulseNumber>>> = Arc::new(Mutex::new(None));
    let fired_in = fired.clone();
    conveyor
        .prepare_pulse(PulseNumber(120), move |p| {
            *fired_in.lock() = Some(p);
        })
        .unwrap();
    assert_eq!(conveyor.state(), ConveyorState::PreparingPulse);
    // A second preparation cannot start while one is in flight.
    assert!(matches!(
        conveyor.prepare_pulse(PulseNumber(120), |_| {}),
        Err(ConveyorError::PrepareInFlight)
    ));

    assert_eq!(conveyor.activate_pulse().unwrap(), PulseNumber(120));
    assert_eq!(*fired.lock(), Some(PulseNumber(120)));
    assert_eq!(conveyor.present_pulse(), PulseNumber(110));
    assert_eq!(conveyor.future_pulse(), PulseNumber(120));

    // The retired pulse keeps its own slot in the past window.
    conveyor.sink_push(PulseNumber(100), TRACING, vec![]).unwrap();
    conveyor.sink_push(PulseNumber(110), TRACING, vec![]).unwrap();
    sleep(Duration::from_millis(100)).await;
    let entries = log.lock().clone();
    assert!(entries.contains(&"init:past:100".to_string()));
    assert!(entries.contains(&"init:present:110".to_string()));
}

#[tokio::test]
async fn migration_runs_before_a_reply_that_crosses_the_boundary() {
    let log: TraceLog = Arc::new(Mutex::new(Vec::new()));
    let gate = Arc::new(Semaphore::new(0));
    let conveyor = build_conveyor(&log, &gate);

    conveyor.sink_push(PulseNumber(100), WAITING, vec![]).unwrap();
    sleep(Duration::from_millis(50)).await;

    conveyor.prepare_pulse(PulseNumber(120), |_| {}).unwrap();
    conveyor.activate_pulse().unwrap();
    sleep(Duration::from_millis(50)).await;

    // Only now does the adapter reply arrive, one pulse late.
    gate.add_permits(1);
    sleep(Duration::from_millis(100)).await;

    let entries = log.lock().clone();
    let migrated = entries
        .iter()
        .position(|e| e == "migrate:present->past")
        .expect("instance migrated at the boundary");
    let responded = entries
        .iter()
        .position(|e| e == "response:past:1")
        .expect("reply delivered in the past slot");
    assert!(migrated < responded);
}

#[tokio::test]
async fn shutdown_stops_accepting_events() {
    let log: TraceLog = Arc::new(Mutex::new(Vec::new()));
    let gate = Arc::new(Semaphore::new(0));
    let conveyor = build_conveyor(&log, &gate);

    conveyor.initiate_shutdown(true);
    assert_eq!(conveyor.state(), ConveyorState::ShuttingDown);
    assert!(matches!(
        conveyor.sink_push(PulseNumber(100), TRACING, vec![]),
        Err(ConveyorError::ShuttingDown)
    ));
    assert!(matches!(
        conveyor.prepare_pulse(PulseNumber(120), |_| {}),
        Err(ConveyorError::ShuttingDown)
    ));
}

#[tokio::test]
async fn immediate_shutdown_goes_inactive() {
    let log: TraceLog = Arc::new(Mutex::new(Vec::new()));
    let gate = Arc::new(Semaphore::new(0));
    let conveyor = build_conveyor(&log, &gate);

    conveyor.initiate_shutdown(false);
    assert_eq!(conveyor.state(), ConveyorState::Inactive);
    assert!(matches!(
        conveyor.sink_push(PulseNumber(100), TRACING, vec![]),
        Err(ConveyorError::Inactive)
    ));
}
