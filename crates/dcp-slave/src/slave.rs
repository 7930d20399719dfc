//! The DCP slave.
//!
//! [`DcpSlave`] owns the protocol state and reacts to PDUs pushed into
//! [`DcpSlave::receive`]. Every PDU is checked by the [`Validator`] under
//! the core lock. Accepted PDUs change the core state right away; anything
//! that talks to the outside world (driver calls, notifications, listener
//! and callback invocations, worker threads) is queued as an effect and
//! carried out once the core lock has been released.
//!
//! Lock order is `core` -> `values` -> `driver`. The step gate is never
//! taken while `core` is held.

use crate::description::SlaveDescription;
use crate::driver::Driver;
use crate::heartbeat::HeartbeatMonitor;
use crate::log::{unix_time, LogArg, LogEntry, LogEvent, LogRouter, LogTemplate};
use crate::phases::{
    CallbackMode, Callbacks, PhaseCallback, PhaseKind, StepCallback, StepKind, StopCallback,
    Workers,
};
use crate::realtime::{start_instant, RealtimeStepper, RealtimeTask, StepContext};
use crate::sequence::{Channel, SequenceTracker};
use crate::tables::{ConfigurationTables, InputEntry, TimeResolution};
use crate::validator::{Validator, Verdict};
use crate::value::{DcpScalar, ValueStore, VariableValue};
use crossbeam_utils::CachePadded;
use dcp_codec::{OwnedPdu, PduBody, PduFields, PduView, TRANSPORT_PROTOCOL_OFFSET};
use dcp_common::{
    DataType, DcpError, DcpState, LogLevel, LogMode, OpMode, PduType, RuntimeConfig, Scope,
    SlaveError, SlaveResult, StateMachine, StepMetricsSnapshot, TransportProtocol,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Called with the new state after every state change.
pub type StateListener = Arc<dyn Fn(DcpState) + Send + Sync>;
/// Called when an error is reported.
pub type ErrorListener = Arc<dyn Fn(DcpError) + Send + Sync>;
/// Called with numerator and denominator of a new time resolution.
pub type TimeResListener = Arc<dyn Fn(u32, u32) + Send + Sync>;
/// Called with data id and step count of `CFG_set_steps`.
pub type StepsListener = Arc<dyn Fn(u16, u32) + Send + Sync>;
/// Called with the start time of `STC_run`.
pub type RuntimeListener = Arc<dyn Fn(i64) + Send + Sync>;
/// Called for every channel on which PDUs were lost.
pub type MissedListener = Arc<dyn Fn(Channel) + Send + Sync>;
/// Called for every log entry, routed or not.
pub type LogListener = Arc<dyn Fn(&LogRecord) + Send + Sync>;

/// A log entry as seen by log listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Category of the template.
    pub category: u8,
    /// Level of the template.
    pub level: LogLevel,
    /// Wire form of the entry.
    pub entry: LogEntry,
    /// Rendered message, if log strings are generated.
    pub text: Option<String>,
}

#[derive(Clone, Default)]
struct Listeners {
    state_changed: Option<StateListener>,
    error: Option<ErrorListener>,
    time_res: Option<TimeResListener>,
    steps: Option<StepsListener>,
    runtime: Option<RuntimeListener>,
    missed: Option<MissedListener>,
    log: Vec<LogListener>,
}

#[derive(Debug)]
enum DriverOp {
    Prepare,
    Configure,
    Stop,
    RegisterSuccessful,
    Disconnect,
    Source(u16, TransportProtocol, Vec<u8>),
    Target(u16, TransportProtocol, Vec<u8>),
    Param(u16, TransportProtocol, Vec<u8>),
}

#[derive(Debug)]
enum Effect {
    Send(OwnedPdu),
    StateChanged { sender: u8, state: DcpState },
    Log(LogEvent, Vec<LogArg>),
    Missed(Channel),
    Driver(DriverOp),
    Phase { kind: PhaseKind, generation: u64 },
    Compute { exit: DcpState, steps: u32, generation: u64 },
    Stop { interrupted: Option<PhaseKind>, generation: u64 },
    StartHeartbeat,
    StopHeartbeat,
    KickHeartbeat,
    StartRealtime { start_time: i64 },
    CancelRealtime,
    /// `shape_generation` is the one the payload length was checked against.
    ApplyData {
        layout: Vec<InputEntry>,
        payload: Vec<u8>,
        shape_generation: u64,
    },
    SendOutputs(Vec<u16>),
    TimeResSet(u32, u32),
    StepsSet(u16, u32),
    Runtime(i64),
    Error(DcpError),
}

#[derive(Debug, Default)]
struct Effects(Vec<Effect>);

impl Effects {
    fn push(&mut self, effect: Effect) {
        self.0.push(effect);
    }

    fn send(&mut self, body: &PduBody<'_>) {
        self.0.push(Effect::Send(OwnedPdu::encode(body)));
    }

    fn log(&mut self, event: LogEvent, args: Vec<LogArg>) {
        self.0.push(Effect::Log(event, args));
    }

    fn driver(&mut self, op: DriverOp) {
        self.0.push(Effect::Driver(op));
    }
}

/// Protocol state guarded by the core lock.
#[derive(Debug)]
struct Core {
    machine: StateMachine,
    error_code: DcpError,
    op_mode: Option<OpMode>,
    dcp_id: u8,
    time_resolution: TimeResolution,
    tables: ConfigurationTables,
    sequence: SequenceTracker,
    fixed_nrt_steps: Option<u32>,
    run_last_exit_point: DcpState,
    register_seq: u16,
    log: LogRouter,
    /// Generation at which an async phase was started.
    pending: HashMap<PhaseKind, u64>,
}

impl Core {
    fn state(&self) -> DcpState {
        self.machine.state()
    }
}

struct Shared<D: Driver> {
    description: SlaveDescription,
    config: RuntimeConfig,
    core: Mutex<Core>,
    values: RwLock<ValueStore>,
    step_gate: Mutex<()>,
    driver: Mutex<D>,
    callbacks: RwLock<Callbacks>,
    listeners: RwLock<Listeners>,
    generation: CachePadded<AtomicU64>,
    workers: Mutex<Workers>,
    heartbeat: Mutex<Option<HeartbeatMonitor>>,
    stepper: Mutex<RealtimeStepper>,
}

/// A DCP slave driven by the PDUs of one master.
///
/// Cloning is cheap; clones share the same slave.
pub struct DcpSlave<D: Driver> {
    shared: Arc<Shared<D>>,
}

impl<D: Driver> Clone for DcpSlave<D> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<D: Driver> fmt::Debug for DcpSlave<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.shared.core.lock();
        f.debug_struct("DcpSlave")
            .field("name", &self.shared.description.dcp_slave_name)
            .field("state", &core.state())
            .field("dcp_id", &core.dcp_id)
            .field("op_mode", &core.op_mode)
            .finish_non_exhaustive()
    }
}

impl<D: Driver> DcpSlave<D> {
    /// Create a slave in state ALIVE and start the driver.
    ///
    /// # Errors
    ///
    /// Returns [`SlaveError::Description`] for an inconsistent description,
    /// [`SlaveError::Value`] for a start value that does not fit its
    /// variable and any error of [`Driver::start_receiving`].
    pub fn new(description: SlaveDescription, mut driver: D, config: RuntimeConfig) -> SlaveResult<Self> {
        description.validate()?;
        let values = ValueStore::from_description(&description, &config.values).map_err(|e| {
            SlaveError::Value {
                value_reference: match e {
                    crate::value::ValueError::InvalidStartValue(vr) => vr,
                    _ => 0,
                },
                message: e.to_string(),
            }
        })?;
        driver.start_receiving()?;

        let core = Core {
            machine: StateMachine::new(),
            error_code: DcpError::None,
            op_mode: None,
            dcp_id: 0,
            time_resolution: TimeResolution::from_description(&description),
            tables: ConfigurationTables::new(),
            sequence: SequenceTracker::new(),
            fixed_nrt_steps: None,
            run_last_exit_point: DcpState::Alive,
            register_seq: 0,
            log: LogRouter::new(config.logging.buffer_capacity),
            pending: HashMap::new(),
        };

        info!(
            slave = %description.dcp_slave_name,
            uuid = %description.uuid,
            variables = values.len(),
            "DCP slave created"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                stepper: Mutex::new(RealtimeStepper::new(&config.realtime)),
                description,
                config,
                core: Mutex::new(core),
                values: RwLock::new(values),
                step_gate: Mutex::new(()),
                driver: Mutex::new(driver),
                callbacks: RwLock::new(Callbacks::default()),
                listeners: RwLock::new(Listeners::default()),
                generation: CachePadded::new(AtomicU64::new(0)),
                workers: Mutex::new(Workers::new()),
                heartbeat: Mutex::new(None),
            }),
        })
    }

    /// Decode and process one received PDU.
    ///
    /// # Errors
    ///
    /// Returns [`SlaveError::Codec`] if `bytes` is not a decodable PDU.
    /// Protocol violations are answered on the wire and never returned.
    pub fn receive(&self, bytes: &[u8]) -> SlaveResult<()> {
        let pdu = PduView::decode(bytes).map_err(|e| {
            debug!(error = %e, len = bytes.len(), "Undecodable PDU");
            SlaveError::from(e)
        })?;
        self.receive_pdu(&pdu);
        Ok(())
    }

    /// Process one decoded PDU.
    pub fn receive_pdu(&self, pdu: &PduView<'_>) {
        self.shared.receive_pdu(pdu);
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> DcpState {
        self.shared.core.lock().state()
    }

    /// Error code reported by `INF_error`.
    #[must_use]
    pub fn error_code(&self) -> DcpError {
        self.shared.core.lock().error_code
    }

    /// Op mode chosen at registration.
    #[must_use]
    pub fn op_mode(&self) -> Option<OpMode> {
        self.shared.core.lock().op_mode
    }

    /// Id assigned by the master, 0 while unregistered.
    #[must_use]
    pub fn dcp_id(&self) -> u8 {
        self.shared.core.lock().dcp_id
    }

    /// Time resolution in effect.
    #[must_use]
    pub fn time_resolution(&self) -> TimeResolution {
        self.shared.core.lock().time_resolution
    }

    /// Sequence id of the `STC_register` that registered the slave.
    #[must_use]
    pub fn register_sequence_id(&self) -> u16 {
        self.shared.core.lock().register_seq
    }

    /// Capabilities and variables of this slave.
    #[must_use]
    pub fn description(&self) -> &SlaveDescription {
        &self.shared.description
    }

    /// Configuration the slave was created with.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    /// Timing of the realtime steps taken so far.
    #[must_use]
    pub fn metrics(&self) -> StepMetricsSnapshot {
        self.shared.stepper.lock().metrics()
    }

    /// Stop the simulation. Returns false if the current state cannot be
    /// stopped.
    pub fn stop(&self) -> bool {
        let mut fx = Effects::default();
        let stopped = {
            let mut core = self.shared.core.lock();
            self.shared.begin_stop(&mut core, &mut fx)
        };
        self.shared.apply(fx);
        stopped
    }

    /// Enter ERROR_HANDLING.
    pub fn goto_error_handling(&self) {
        let mut fx = Effects::default();
        {
            let mut core = self.shared.core.lock();
            self.shared.enter_error_handling(&mut core, &mut fx);
        }
        self.shared.apply(fx);
    }

    /// Leave ERROR_HANDLING for ERROR_RESOLVED. Returns false in any other
    /// state.
    pub fn goto_error_resolved(&self) -> bool {
        let mut fx = Effects::default();
        let resolved = {
            let mut core = self.shared.core.lock();
            if core.state() == DcpState::ErrorHandling {
                self.shared.transition(&mut core, DcpState::ErrorResolved, &mut fx);
                true
            } else {
                false
            }
        };
        self.shared.apply(fx);
        resolved
    }

    /// Set the code answered to `INF_error`.
    pub fn set_error(&self, code: DcpError) {
        self.shared.core.lock().error_code = code;
    }

    /// Pass an error to the error listener.
    pub fn report_error(&self, code: DcpError) {
        self.shared.report_error(code);
    }

    // ========================================================================
    // Values
    // ========================================================================

    /// Run `f` on the value of `vr`.
    pub fn read_value<R>(&self, vr: u64, f: impl FnOnce(&VariableValue) -> R) -> Option<R> {
        self.shared.values.read().get(vr).map(f)
    }

    /// Run `f` on the mutable value of `vr`.
    pub fn write_value<R>(&self, vr: u64, f: impl FnOnce(&mut VariableValue) -> R) -> Option<R> {
        self.shared.values.write().get_mut(vr).map(f)
    }

    /// Elements of input `vr`, if it is an input of type `T`.
    #[must_use]
    pub fn get_input<T: DcpScalar>(&self, vr: u64) -> Option<Vec<T>> {
        self.typed(vr, self.shared.description.input_exists(vr))
    }

    /// Elements of output `vr`, if it is an output of type `T`.
    #[must_use]
    pub fn get_output<T: DcpScalar>(&self, vr: u64) -> Option<Vec<T>> {
        self.typed(vr, self.shared.description.output_exists(vr))
    }

    /// Elements of parameter `vr`, if it is a parameter of type `T`.
    #[must_use]
    pub fn get_parameter<T: DcpScalar>(&self, vr: u64) -> Option<Vec<T>> {
        self.typed(vr, self.shared.description.parameter_exists(vr))
    }

    fn typed<T: DcpScalar>(&self, vr: u64, role_matches: bool) -> Option<Vec<T>> {
        if !role_matches {
            return None;
        }
        let values = self.shared.values.read();
        let value = values.get(vr).filter(|v| v.data_type() == T::DATA_TYPE)?;
        Some(value.as_slice::<T>().to_vec())
    }

    /// Overwrite all elements of output `vr`.
    ///
    /// # Errors
    ///
    /// Returns [`SlaveError::Value`] if `vr` is not an output of type `T`
    /// with `data.len()` elements.
    pub fn set_output<T: DcpScalar>(&self, vr: u64, data: &[T]) -> SlaveResult<()> {
        let value_error = |message: String| SlaveError::Value {
            value_reference: vr,
            message,
        };
        if !self.shared.description.output_exists(vr) {
            return Err(value_error("not an output".into()));
        }
        let mut values = self.shared.values.write();
        let value = values
            .get_mut(vr)
            .ok_or_else(|| value_error("no value".into()))?;
        if value.data_type() != T::DATA_TYPE {
            return Err(value_error(format!(
                "declared as {}, written as {}",
                value.data_type(),
                T::DATA_TYPE
            )));
        }
        if value.element_count() != data.len() {
            return Err(value_error(format!(
                "has {} elements, got {}",
                value.element_count(),
                data.len()
            )));
        }
        value.as_mut_slice::<T>().copy_from_slice(data);
        Ok(())
    }

    /// Overwrite string or binary output `vr`.
    ///
    /// # Errors
    ///
    /// Returns [`SlaveError::Value`] if `vr` is not a string or binary
    /// output or `data` exceeds its capacity.
    pub fn set_output_bytes(&self, vr: u64, data: &[u8]) -> SlaveResult<()> {
        let value_error = |message: String| SlaveError::Value {
            value_reference: vr,
            message,
        };
        if !self.shared.description.output_exists(vr) {
            return Err(value_error("not an output".into()));
        }
        let mut values = self.shared.values.write();
        let value = values
            .get_mut(vr)
            .filter(|v| v.data_type().is_variable_size())
            .ok_or_else(|| value_error("not a string or binary value".into()))?;
        value.set_bytes(data).map_err(|e| value_error(e.to_string()))
    }

    // ========================================================================
    // Callbacks and listeners
    // ========================================================================

    /// Register the callback of the prepare, configure, initialize or
    /// synchronize phase.
    pub fn set_phase_callback<F>(&self, kind: PhaseKind, mode: CallbackMode, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let callback: PhaseCallback = Arc::new(callback);
        self.shared.callbacks.write().set_phase(kind, mode, callback);
    }

    /// Register a step callback.
    pub fn set_step_callback<F>(&self, kind: StepKind, mode: CallbackMode, callback: F)
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        let callback: StepCallback = Arc::new(callback);
        self.shared.callbacks.write().set_step(kind, mode, callback);
    }

    /// Register the stop callback. It receives the phase that was running
    /// when the stop arrived.
    pub fn set_stop_callback<F>(&self, mode: CallbackMode, callback: F)
    where
        F: Fn(Option<PhaseKind>) + Send + Sync + 'static,
    {
        let callback: StopCallback = Arc::new(callback);
        self.shared.callbacks.write().set_stop(mode, callback);
    }

    /// Listen to state changes.
    pub fn set_state_changed_listener(&self, f: impl Fn(DcpState) + Send + Sync + 'static) {
        self.shared.listeners.write().state_changed = Some(Arc::new(f));
    }

    /// Listen to reported errors.
    pub fn set_error_listener(&self, f: impl Fn(DcpError) + Send + Sync + 'static) {
        self.shared.listeners.write().error = Some(Arc::new(f));
    }

    /// Listen to time resolution changes.
    pub fn set_time_res_listener(&self, f: impl Fn(u32, u32) + Send + Sync + 'static) {
        self.shared.listeners.write().time_res = Some(Arc::new(f));
    }

    /// Listen to `CFG_set_steps`.
    pub fn set_steps_listener(&self, f: impl Fn(u16, u32) + Send + Sync + 'static) {
        self.shared.listeners.write().steps = Some(Arc::new(f));
    }

    /// Listen to the start time of realtime runs.
    pub fn set_runtime_listener(&self, f: impl Fn(i64) + Send + Sync + 'static) {
        self.shared.listeners.write().runtime = Some(Arc::new(f));
    }

    /// Listen to lost PDUs.
    pub fn set_missed_listener(&self, f: impl Fn(Channel) + Send + Sync + 'static) {
        self.shared.listeners.write().missed = Some(Arc::new(f));
    }

    /// Add a log listener.
    pub fn add_log_listener(&self, f: impl Fn(&LogRecord) + Send + Sync + 'static) {
        self.shared.listeners.write().log.push(Arc::new(f));
    }

    /// Log with a template of the slave description. Returns false for an
    /// unknown template id.
    pub fn log(&self, template_id: u8, args: &[LogArg]) -> bool {
        let Some(template) = self
            .shared
            .description
            .log
            .as_ref()
            .and_then(|log| log.templates.iter().find(|t| t.id == template_id))
        else {
            return false;
        };
        let wire = LogTemplate {
            id: template.id,
            category: template.category,
            level: template.level,
            message: "",
        };
        let entry = LogEntry::new(&wire, args);
        self.shared.log_entry(template.category, template.level, entry, || {
            let rendered: Vec<String> = args.iter().map(ToString::to_string).collect();
            format!("{} [{}]", template.msg, rendered.join(", "))
        });
        true
    }

    // ========================================================================
    // Asynchronous phases
    // ========================================================================

    /// Finish an asynchronous prepare callback.
    pub fn prepare_finished(&self) -> bool {
        self.shared.phase_finished(PhaseKind::Prepare)
    }

    /// Finish an asynchronous configure callback.
    pub fn configure_finished(&self) -> bool {
        self.shared.phase_finished(PhaseKind::Configure)
    }

    /// Finish an asynchronous initialize callback.
    pub fn initialize_finished(&self) -> bool {
        self.shared.phase_finished(PhaseKind::Initialize)
    }

    /// Finish an asynchronous synchronize callback.
    pub fn synchronize_finished(&self) -> bool {
        self.shared.phase_finished(PhaseKind::Synchronize)
    }

    /// Finish an asynchronous stop callback.
    pub fn stop_finished(&self) -> bool {
        self.shared.phase_finished(PhaseKind::Stop)
    }

    /// Finish an asynchronous NRT step callback.
    pub fn compute_finished(&self) -> bool {
        self.shared.phase_finished(PhaseKind::Compute)
    }

    /// Finish an asynchronous realtime step callback.
    pub fn realtime_step_finished(&self) -> bool {
        let stepper = self.shared.stepper.lock();
        if !stepper.is_active() {
            return false;
        }
        stepper.finish_step();
        true
    }

    /// Cancel realtime stepping, stop heartbeat supervision and join all
    /// worker threads.
    pub fn shutdown(&self) {
        info!("Shutting down DCP slave");
        self.shared.stepper.lock().cancel();
        if let Some(mut monitor) = self.shared.heartbeat.lock().take() {
            monitor.stop();
        }
        loop {
            let mut workers = std::mem::take(&mut *self.shared.workers.lock());
            if workers.is_empty() {
                break;
            }
            workers.join_all();
        }
    }
}

impl<D: Driver> Shared<D> {
    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn transition(&self, core: &mut Core, target: DcpState, fx: &mut Effects) {
        let from = core.state();
        if core.machine.transition(target).is_err() {
            return;
        }
        // a full NRT step leaves phases started before it valid
        if !from.is_step_cycle(target) {
            self.generation.fetch_add(1, Ordering::AcqRel);
        }
        debug!(%from, to = %target, "State changed");
        fx.push(Effect::StateChanged {
            sender: core.dcp_id,
            state: target,
        });
        fx.log(LogEvent::StateChanged, vec![target.to_string().into()]);
    }

    fn begin_stop(&self, core: &mut Core, fx: &mut Effects) -> bool {
        let state = core.state();
        if !state.can_stop() {
            return false;
        }
        let interrupted = PhaseKind::in_progress(state);
        self.transition(core, DcpState::Stopping, fx);
        fx.push(Effect::CancelRealtime);
        fx.push(Effect::Stop {
            interrupted,
            generation: self.generation(),
        });
        true
    }

    fn enter_error_handling(&self, core: &mut Core, fx: &mut Effects) {
        self.transition(core, DcpState::ErrorHandling, fx);
        fx.push(Effect::CancelRealtime);
    }

    fn clear_config(&self, core: &mut Core, fx: &mut Effects) {
        core.tables.clear();
        core.time_resolution = TimeResolution::from_description(&self.description);
        core.fixed_nrt_steps = None;
        fx.driver(DriverOp::Stop);
        fx.log(LogEvent::ConfigurationCleared, Vec::new());
    }

    fn receive_pdu(self: &Arc<Self>, pdu: &PduView<'_>) {
        let mut fx = Effects::default();
        {
            let mut guard = self.core.lock();
            let core = &mut *guard;
            let values = self.values.read();
            let mut validator = Validator {
                description: &self.description,
                values: &values,
                tables: &core.tables,
                sequence: self
                    .config
                    .sequence
                    .check_sequence_ids
                    .then_some(&mut core.sequence),
                state: core.machine.state(),
                dcp_id: core.dcp_id,
                op_mode: core.op_mode,
                time_resolution: core.time_resolution,
                fixed_nrt_steps: core.fixed_nrt_steps,
                now: unix_time(),
            };
            let validation = validator.check(pdu);
            let sender = pdu
                .pdu_type()
                .map_or(core.dcp_id, |t| validator.response_sender(t, pdu.body()));
            drop(validator);
            let shape_generation = values.shape_generation();
            drop(values);

            for (event, args) in validation.logs {
                fx.log(event, args);
            }
            for channel in validation.missed {
                fx.push(Effect::Missed(channel));
            }

            let resp_seq_id = pdu.pdu_seq_id().unwrap_or_default();
            match validation.verdict {
                Verdict::Drop => {
                    trace!(type_id = pdu.type_id(), "PDU dropped");
                }
                Verdict::Reject { error, sender } => {
                    debug!(pdu = ?pdu.pdu_type(), %error, "PDU rejected");
                    fx.send(&PduBody::ErrorCode {
                        pdu_type: PduType::RspNack,
                        sender,
                        resp_seq_id,
                        error_code: error.code(),
                    });
                }
                Verdict::Accept { ack } => {
                    if ack {
                        fx.send(&PduBody::Ack {
                            sender,
                            resp_seq_id,
                        });
                    }
                    self.dispatch(core, pdu, shape_generation, &mut fx);
                }
            }
        }
        self.apply(fx);
    }

    fn dispatch(&self, core: &mut Core, pdu: &PduView<'_>, shape_generation: u64, fx: &mut Effects) {
        use DcpState::*;

        let state = core.state();
        match *pdu.body() {
            PduBody::Register {
                pdu_seq_id,
                receiver,
                op_mode,
                ..
            } => {
                core.dcp_id = receiver;
                core.op_mode = OpMode::from_u8(op_mode);
                core.register_seq = pdu_seq_id;
                core.sequence.seed(Channel::Control, pdu_seq_id);
                fx.log(LogEvent::DcpIdSet, vec![receiver.into()]);
                if let Some(mode) = core.op_mode {
                    fx.log(LogEvent::OpModeSet, vec![mode.to_string().into()]);
                }
                fx.driver(DriverOp::RegisterSuccessful);
                self.transition(core, Configuration, fx);
                fx.push(Effect::StartHeartbeat);
            }
            PduBody::StateTransition { pdu_type, .. } => match pdu_type {
                PduType::StcDeregister => {
                    core.op_mode = None;
                    self.clear_config(core, fx);
                    self.transition(core, Alive, fx);
                    core.dcp_id = 0;
                    core.sequence.reset_incoming();
                    fx.driver(DriverOp::Disconnect);
                    fx.push(Effect::StopHeartbeat);
                }
                PduType::StcPrepare => {
                    self.transition(core, Preparing, fx);
                    fx.driver(DriverOp::Prepare);
                    self.queue_phase(PhaseKind::Prepare, fx);
                }
                PduType::StcConfigure => {
                    self.transition(core, Configuring, fx);
                    core.tables.build_output_counters();
                    fx.driver(DriverOp::Configure);
                    self.queue_phase(PhaseKind::Configure, fx);
                }
                PduType::StcInitialize => {
                    self.transition(core, Initializing, fx);
                    self.queue_phase(PhaseKind::Initialize, fx);
                }
                PduType::StcSendOutputs => match state {
                    Initialized => {
                        self.transition(core, SendingI, fx);
                        fx.push(Effect::SendOutputs(core.tables.initialization_outputs()));
                        self.transition(core, Configured, fx);
                    }
                    Computed => {
                        self.transition(core, SendingD, fx);
                        fx.push(Effect::SendOutputs(core.tables.running_outputs()));
                        let exit = core.run_last_exit_point;
                        self.transition(core, exit, fx);
                    }
                    _ => {}
                },
                PduType::StcStop => {
                    fx.driver(DriverOp::Stop);
                    self.begin_stop(core, fx);
                }
                PduType::StcReset => {
                    core.error_code = DcpError::None;
                    self.transition(core, Configuration, fx);
                    fx.push(Effect::StartHeartbeat);
                }
                _ => {}
            },
            PduBody::Run { start_time, .. } => {
                let target = if state == Configured {
                    Synchronizing
                } else {
                    Running
                };
                self.transition(core, target, fx);
                if core.op_mode == Some(OpMode::Nrt) {
                    if target == Synchronizing {
                        self.queue_phase(PhaseKind::Synchronize, fx);
                    }
                } else {
                    fx.push(Effect::Runtime(start_time));
                    fx.push(Effect::StartRealtime { start_time });
                }
            }
            PduBody::DoStep { steps, .. } => {
                if !self.description.capability_flags.can_handle_variable_steps {
                    core.fixed_nrt_steps.get_or_insert(steps);
                }
                core.run_last_exit_point = state;
                self.transition(core, Computing, fx);
                fx.push(Effect::Compute {
                    exit: state,
                    steps,
                    generation: self.generation(),
                });
            }
            PduBody::Basic {
                pdu_type,
                pdu_seq_id,
                receiver,
            } => {
                let sender = if state == Alive { receiver } else { core.dcp_id };
                match pdu_type {
                    PduType::InfState => {
                        fx.push(Effect::KickHeartbeat);
                        fx.send(&PduBody::StateAck {
                            sender,
                            resp_seq_id: pdu_seq_id,
                            state_id: state.as_u8(),
                        });
                    }
                    PduType::InfError => fx.send(&PduBody::ErrorCode {
                        pdu_type: PduType::RspErrorAck,
                        sender,
                        resp_seq_id: pdu_seq_id,
                        error_code: core.error_code.code(),
                    }),
                    PduType::CfgClear => self.clear_config(core, fx),
                    _ => {}
                }
            }
            PduBody::InfLog {
                pdu_seq_id,
                log_category,
                log_max_num,
                ..
            } => {
                let payload = core.log.drain(
                    log_category,
                    log_max_num,
                    self.config.logging.response_buffer_size,
                );
                fx.send(&PduBody::LogAck {
                    sender: core.dcp_id,
                    resp_seq_id: pdu_seq_id,
                    payload: &payload,
                });
            }
            PduBody::TimeRes {
                numerator,
                denominator,
                ..
            } => {
                core.time_resolution.assign(numerator, denominator);
                fx.log(
                    LogEvent::TimeResolutionSet,
                    vec![numerator.into(), denominator.into()],
                );
                fx.push(Effect::TimeResSet(numerator, denominator));
            }
            PduBody::Steps { steps, data_id, .. } => {
                core.tables.steps.insert(data_id, steps);
                fx.log(LogEvent::StepsSet, vec![data_id.into(), steps.into()]);
                fx.push(Effect::StepsSet(data_id, steps));
            }
            PduBody::ConfigInput {
                data_id,
                pos,
                target_vr,
                source_data_type,
                ..
            } => {
                if let Some(source_type) = DataType::from_u8(source_data_type) {
                    core.tables.config_input(
                        data_id,
                        pos,
                        InputEntry {
                            vr: target_vr,
                            source_type,
                        },
                    );
                }
            }
            PduBody::ConfigOutput {
                data_id,
                pos,
                source_vr,
                ..
            } => core.tables.config_output(data_id, pos, source_vr),
            PduBody::TunableParameter {
                param_id,
                pos,
                parameter_vr,
                source_data_type,
                ..
            } => {
                if let Some(source_type) = DataType::from_u8(source_data_type) {
                    core.tables.config_tunable(
                        param_id,
                        pos,
                        InputEntry {
                            vr: parameter_vr,
                            source_type,
                        },
                    );
                }
            }
            PduBody::Scope { data_id, scope, .. } => {
                if let Some(scope) = Scope::from_u8(scope) {
                    core.tables.set_scope(data_id, scope);
                }
            }
            PduBody::NetworkInformation {
                pdu_type,
                id,
                transport_protocol,
                ..
            }
            | PduBody::NetworkInformationEthernet {
                pdu_type,
                id,
                transport_protocol,
                ..
            } => {
                let Some(transport) = TransportProtocol::from_u8(transport_protocol) else {
                    return;
                };
                let info = pdu
                    .bytes()
                    .get(TRANSPORT_PROTOCOL_OFFSET + 1..)
                    .unwrap_or_default()
                    .to_vec();
                match pdu_type {
                    PduType::CfgSourceNetworkInformation => {
                        core.tables.source_network.insert(id);
                        fx.driver(DriverOp::Source(id, transport, info));
                    }
                    PduType::CfgTargetNetworkInformation => {
                        core.tables.target_network.insert(id);
                        fx.driver(DriverOp::Target(id, transport, info));
                    }
                    PduType::CfgParamNetworkInformation => {
                        core.tables.param_network.insert(id);
                        fx.driver(DriverOp::Param(id, transport, info));
                    }
                    _ => {}
                }
            }
            PduBody::SetParameter {
                parameter_vr,
                source_data_type,
                configuration,
                ..
            } => {
                if let Some(source_type) = DataType::from_u8(source_data_type) {
                    fx.push(Effect::ApplyData {
                        layout: vec![InputEntry {
                            vr: parameter_vr,
                            source_type,
                        }],
                        payload: configuration.to_vec(),
                        shape_generation,
                    });
                }
            }
            PduBody::Logging {
                log_category,
                log_level,
                log_mode,
                ..
            } => {
                if let (Some(level), Some(mode)) =
                    (LogLevel::from_u8(log_level), LogMode::from_u8(log_mode))
                {
                    core.log.set_route(log_category, level, mode);
                }
            }
            PduBody::DatInputOutput {
                data_id, payload, ..
            } => fx.push(Effect::ApplyData {
                layout: core.tables.input_layout(data_id).collect(),
                payload: payload.to_vec(),
                shape_generation,
            }),
            PduBody::DatParameter {
                param_id,
                configuration,
                ..
            } => fx.push(Effect::ApplyData {
                layout: core.tables.parameter_layout(param_id).collect(),
                payload: configuration.to_vec(),
                shape_generation,
            }),
            _ => {}
        }
    }

    fn queue_phase(&self, kind: PhaseKind, fx: &mut Effects) {
        fx.push(Effect::Phase {
            kind,
            generation: self.generation(),
        });
    }

    fn apply(self: &Arc<Self>, fx: Effects) {
        for effect in fx.0 {
            match effect {
                Effect::Send(pdu) => self.send(&pdu),
                Effect::StateChanged { sender, state } => {
                    self.send(&OwnedPdu::encode(&PduBody::StateChanged {
                        sender,
                        state_id: state.as_u8(),
                    }));
                    let listener = self.listeners.read().state_changed.clone();
                    if let Some(listener) = listener {
                        listener(state);
                    }
                }
                Effect::Log(event, args) => self.emit(event, &args),
                Effect::Missed(channel) => {
                    let listener = self.listeners.read().missed.clone();
                    if let Some(listener) = listener {
                        listener(channel);
                    }
                }
                Effect::Driver(op) => self.drive(op),
                Effect::Phase { kind, generation } => self.spawn_phase(kind, generation),
                Effect::Compute {
                    exit,
                    steps,
                    generation,
                } => self.spawn_compute(exit, steps, generation),
                Effect::Stop {
                    interrupted,
                    generation,
                } => self.spawn_stop(interrupted, generation),
                Effect::StartHeartbeat => self.start_heartbeat(),
                Effect::StopHeartbeat => {
                    if let Some(mut monitor) = self.heartbeat.lock().take() {
                        monitor.stop();
                        self.emit(LogEvent::HeartbeatStopped, &[]);
                    }
                }
                Effect::KickHeartbeat => {
                    if let Some(monitor) = self.heartbeat.lock().as_ref() {
                        monitor.kick();
                    }
                }
                Effect::StartRealtime { start_time } => self.start_realtime(start_time),
                Effect::CancelRealtime => self.stepper.lock().cancel(),
                Effect::ApplyData {
                    layout,
                    payload,
                    shape_generation,
                } => self.apply_data(&layout, &payload, shape_generation),
                Effect::SendOutputs(data_ids) => self.send_outputs(&data_ids),
                Effect::TimeResSet(numerator, denominator) => {
                    let listener = self.listeners.read().time_res.clone();
                    if let Some(listener) = listener {
                        listener(numerator, denominator);
                    }
                }
                Effect::StepsSet(data_id, steps) => {
                    let listener = self.listeners.read().steps.clone();
                    if let Some(listener) = listener {
                        listener(data_id, steps);
                    }
                }
                Effect::Runtime(start_time) => {
                    let listener = self.listeners.read().runtime.clone();
                    if let Some(listener) = listener {
                        listener(start_time);
                    }
                }
                Effect::Error(code) => self.report_error(code),
            }
        }
    }

    fn send(&self, pdu: &OwnedPdu) {
        trace!(pdu = ?pdu.pdu_type(), len = pdu.len(), "Sending PDU");
        if let Err(e) = self.driver.lock().send(pdu) {
            warn!(error = %e, pdu = ?pdu.pdu_type(), "Failed to send PDU");
        }
    }

    fn drive(&self, op: DriverOp) {
        let mut driver = self.driver.lock();
        let result = match op {
            DriverOp::Prepare => driver.prepare(),
            DriverOp::Configure => driver.configure(),
            DriverOp::Stop => driver.stop(),
            DriverOp::RegisterSuccessful => {
                driver.register_successful();
                Ok(())
            }
            DriverOp::Disconnect => {
                driver.disconnect();
                Ok(())
            }
            DriverOp::Source(id, transport, info) => {
                driver.set_source_network_information(id, transport, &info)
            }
            DriverOp::Target(id, transport, info) => {
                driver.set_target_network_information(id, transport, &info)
            }
            DriverOp::Param(id, transport, info) => {
                driver.set_param_network_information(id, transport, &info)
            }
        };
        if let Err(e) = result {
            error!(error = %e, "Driver call failed");
        }
    }

    fn report_error(&self, code: DcpError) {
        let listener = self.listeners.read().error.clone();
        match listener {
            Some(listener) => listener(code),
            None => warn!(error = %code, "Error reported without an error listener"),
        }
    }

    // ========================================================================
    // Logging
    // ========================================================================

    fn emit(&self, event: LogEvent, args: &[LogArg]) {
        let template = event.template();
        let entry = LogEntry::new(&template, args);
        self.log_entry(template.category, template.level, entry, || template.render(args));
    }

    fn log_entry(&self, category: u8, level: LogLevel, entry: LogEntry, render: impl FnOnce() -> String) {
        let text = self.config.logging.generate_log_strings.then(render);
        let message = text.as_deref().unwrap_or_default();
        let template = entry.template_id;
        match level {
            LogLevel::Fatal | LogLevel::Error | LogLevel::Warning => {
                warn!(category, template, "{message}");
            }
            LogLevel::Information => info!(category, template, "{message}"),
            LogLevel::Debug => debug!(category, template, "{message}"),
        }

        let notification = {
            let mut core = self.core.lock();
            match core.log.route(category, level) {
                Some(LogMode::OnNotification) => Some(OwnedPdu::encode(&PduBody::NtfLog {
                    sender: core.dcp_id,
                    time: entry.time,
                    template_id: entry.template_id,
                    payload: &entry.args,
                })),
                Some(LogMode::OnRequest) => {
                    core.log.buffer(category, entry.clone());
                    None
                }
                None => None,
            }
        };
        if let Some(pdu) = notification {
            self.send(&pdu);
        }

        let listeners = self.listeners.read().log.clone();
        if !listeners.is_empty() {
            let record = LogRecord {
                category,
                level,
                entry,
                text,
            };
            for listener in &listeners {
                listener(&record);
            }
        }
    }

    // ========================================================================
    // Data
    // ========================================================================

    fn apply_data(&self, layout: &[InputEntry], payload: &[u8], shape_generation: u64) {
        let _gate = self.step_gate.lock();
        let mut values = self.values.write();
        if values.shape_generation() != shape_generation {
            warn!("Values were reshaped after the data was checked, discarding it");
            return;
        }
        let mut offset = 0;
        for entry in layout {
            match values.update(entry.vr, payload, offset, entry.source_type) {
                Ok(consumed) => offset += consumed,
                Err(e) => {
                    warn!(vr = entry.vr, error = %e, "Failed to apply received value");
                    break;
                }
            }
        }
    }

    fn send_outputs(&self, data_ids: &[u16]) {
        if data_ids.is_empty() {
            return;
        }
        let pdus: Vec<OwnedPdu> = {
            let mut core = self.core.lock();
            let values = self.values.read();
            data_ids
                .iter()
                .filter_map(|&data_id| {
                    let vrs: Vec<u64> = core.tables.output_layout(data_id).collect();
                    if vrs.is_empty() {
                        return None;
                    }
                    let mut payload = Vec::new();
                    for vr in vrs {
                        if let Some(value) = values.get(vr) {
                            value.serialize(&mut payload);
                        }
                    }
                    Some(OwnedPdu::encode(&PduBody::DatInputOutput {
                        pdu_seq_id: core.sequence.next_outgoing(data_id),
                        data_id,
                        payload: &payload,
                    }))
                })
                .collect()
        };
        for pdu in &pdus {
            self.send(pdu);
        }
    }

    // ========================================================================
    // Phases
    // ========================================================================

    fn spawn_worker(&self, name: &str, work: impl FnOnce() + Send + 'static) {
        if let Err(e) = self.workers.lock().spawn(name, work) {
            error!(error = %e, "Failed to start worker");
        }
    }

    fn spawn_phase(self: &Arc<Self>, kind: PhaseKind, generation: u64) {
        let shared = Arc::clone(self);
        self.spawn_worker(kind.thread_name(), move || {
            shared.emit(LogEvent::PhaseStarted, &[kind.name().into()]);
            let callback = shared.callbacks.read().phase(kind);
            match callback {
                Some((callback, CallbackMode::Async)) => {
                    shared.core.lock().pending.insert(kind, generation);
                    callback();
                }
                Some((callback, CallbackMode::Sync)) => {
                    callback();
                    shared.finish_phase(kind, generation);
                }
                None => shared.finish_phase(kind, generation),
            }
        });
    }

    fn spawn_compute(self: &Arc<Self>, exit: DcpState, steps: u32, generation: u64) {
        let shared = Arc::clone(self);
        self.spawn_worker(PhaseKind::Compute.thread_name(), move || {
            let kind = PhaseKind::Compute;
            shared.emit(LogEvent::PhaseStarted, &[kind.name().into()]);
            let callback = StepKind::for_state(exit, true).and_then(|k| shared.callbacks.read().step(k));
            match callback {
                Some((callback, CallbackMode::Async)) => {
                    shared.core.lock().pending.insert(kind, generation);
                    callback(steps);
                }
                Some((callback, CallbackMode::Sync)) => {
                    callback(steps);
                    shared.finish_phase(kind, generation);
                }
                None => shared.finish_phase(kind, generation),
            }
        });
    }

    fn spawn_stop(self: &Arc<Self>, interrupted: Option<PhaseKind>, generation: u64) {
        let shared = Arc::clone(self);
        self.spawn_worker(PhaseKind::Stop.thread_name(), move || {
            let kind = PhaseKind::Stop;
            shared.emit(LogEvent::PhaseStarted, &[kind.name().into()]);
            let callback = shared.callbacks.read().stop();
            match callback {
                Some((callback, CallbackMode::Async)) => {
                    shared.core.lock().pending.insert(kind, generation);
                    callback(interrupted);
                }
                Some((callback, CallbackMode::Sync)) => {
                    callback(interrupted);
                    shared.finish_phase(kind, generation);
                }
                None => shared.finish_phase(kind, generation),
            }
        });
    }

    /// Apply the postcondition of `kind` if nothing changed the state since
    /// the phase began.
    fn finish_phase(self: &Arc<Self>, kind: PhaseKind, generation: u64) {
        let Some((pre, post)) = kind.transition() else {
            return;
        };
        let mut fx = Effects::default();
        {
            let mut core = self.core.lock();
            core.pending.remove(&kind);
            if self.generation() == generation && core.state() == pre {
                fx.log(LogEvent::PhaseFinished, vec![kind.name().into()]);
                self.transition(&mut core, post, &mut fx);
            } else {
                fx.log(LogEvent::PhaseInterrupted, vec![kind.name().into()]);
            }
        }
        self.apply(fx);
    }

    fn phase_finished(self: &Arc<Self>, kind: PhaseKind) -> bool {
        let Some(generation) = self.core.lock().pending.get(&kind).copied() else {
            return false;
        };
        self.finish_phase(kind, generation);
        true
    }

    // ========================================================================
    // Heartbeat
    // ========================================================================

    fn start_heartbeat(self: &Arc<Self>) {
        let Some(interval) = self.description.heartbeat_interval() else {
            return;
        };
        let weak: Weak<Self> = Arc::downgrade(self);
        let started = {
            let mut slot = self.heartbeat.lock();
            let monitor = slot.get_or_insert_with(|| {
                HeartbeatMonitor::new(interval, self.config.heartbeat.min_check_interval)
            });
            if monitor.is_running() {
                monitor.reset();
                Ok(())
            } else {
                monitor.start(move |since| {
                    if let Some(shared) = weak.upgrade() {
                        shared.heartbeat_missed(since);
                    }
                })
            }
        };
        match started {
            Ok(()) => {
                let ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
                self.emit(LogEvent::HeartbeatStarted, &[ms.into()]);
            }
            Err(e) => error!(error = %e, "Failed to start heartbeat supervision"),
        }
    }

    fn heartbeat_missed(self: &Arc<Self>, since: Duration) {
        let mut fx = Effects::default();
        {
            let mut core = self.core.lock();
            if !core.state().is_supervised() {
                return;
            }
            let code = DcpError::ProtocolErrorHeartbeatMissed;
            core.error_code = code;
            let ms = u64::try_from(since.as_millis()).unwrap_or(u64::MAX);
            fx.log(LogEvent::HeartbeatMissed, vec![ms.into()]);
            fx.push(Effect::Error(code));
            self.enter_error_handling(&mut core, &mut fx);
            if self.config.heartbeat.auto_resolve {
                self.transition(&mut core, DcpState::ErrorResolved, &mut fx);
            }
        }
        self.apply(fx);
    }

    // ========================================================================
    // Realtime
    // ========================================================================

    fn start_realtime(self: &Arc<Self>, start_time: i64) {
        let period = self.core.lock().time_resolution.period();
        let mut stepper = self.stepper.lock();
        if stepper.is_active() {
            return;
        }
        let task = RealtimeLoop {
            shared: Arc::downgrade(self),
        };
        match stepper.start(start_instant(start_time), period, task) {
            Ok(handle) => self.workers.lock().adopt(handle),
            Err(e) => error!(error = %e, "Failed to start realtime stepping"),
        }
    }

    fn realtime_step(self: &Arc<Self>, ctx: &StepContext) -> bool {
        let (state, generation) = {
            let core = self.core.lock();
            (core.state(), self.generation())
        };
        if !matches!(
            state,
            DcpState::Synchronizing | DcpState::Synchronized | DcpState::Running
        ) {
            return false;
        }
        if ctx.step() == 0 && state == DcpState::Synchronizing {
            self.spawn_phase(PhaseKind::Synchronize, generation);
        }

        let callback = StepKind::for_state(state, false).and_then(|k| self.callbacks.read().step(k));
        {
            let _gate = self.step_gate.lock();
            if let Some((callback, mode)) = callback {
                callback(1);
                if mode == CallbackMode::Async && !ctx.wait_for_finish() {
                    return false;
                }
            }
        }

        let due = self.core.lock().tables.tick_outputs();
        self.send_outputs(&due);
        true
    }
}

struct RealtimeLoop<D: Driver> {
    shared: Weak<Shared<D>>,
}

impl<D: Driver> RealtimeTask for RealtimeLoop<D> {
    fn step(&mut self, ctx: &StepContext) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|shared| shared.realtime_step(ctx))
    }

    fn overrun(&mut self, elapsed: Duration, period: Duration) {
        if let Some(shared) = self.shared.upgrade() {
            let us = |d: Duration| u64::try_from(d.as_micros()).unwrap_or(u64::MAX);
            shared.emit(LogEvent::StepOverrun, &[us(elapsed).into(), us(period).into()]);
        }
    }
}
