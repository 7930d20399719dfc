//! Phase callbacks and the threads that run them.
//!
//! Long-running state transitions (prepare, configure, initialize,
//! synchronize, stop and NRT computing) hand control to a host callback on
//! a worker thread. A synchronous callback finishes its phase as soon as it
//! returns; an asynchronous one is finished later by the host.

use dcp_common::{DcpState, SlaveError, SlaveResult};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// A state transition that is completed by a host callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhaseKind {
    /// PREPARING -> PREPARED.
    Prepare,
    /// CONFIGURING -> CONFIGURED.
    Configure,
    /// INITIALIZING -> INITIALIZED.
    Initialize,
    /// SYNCHRONIZING -> SYNCHRONIZED.
    Synchronize,
    /// STOPPING -> STOPPED.
    Stop,
    /// COMPUTING -> COMPUTED.
    Compute,
    /// One real-time step; no state change.
    RealtimeStep,
}

impl PhaseKind {
    /// Precondition and postcondition of the phase.
    #[must_use]
    pub fn transition(self) -> Option<(DcpState, DcpState)> {
        use DcpState::*;
        match self {
            Self::Prepare => Some((Preparing, Prepared)),
            Self::Configure => Some((Configuring, Configured)),
            Self::Initialize => Some((Initializing, Initialized)),
            Self::Synchronize => Some((Synchronizing, Synchronized)),
            Self::Stop => Some((Stopping, Stopped)),
            Self::Compute => Some((Computing, Computed)),
            Self::RealtimeStep => None,
        }
    }

    /// Phase running while the slave is in `state`, if any.
    #[must_use]
    pub fn in_progress(state: DcpState) -> Option<Self> {
        [
            Self::Prepare,
            Self::Configure,
            Self::Initialize,
            Self::Synchronize,
            Self::Stop,
            Self::Compute,
        ]
        .into_iter()
        .find(|kind| kind.transition().is_some_and(|(pre, _)| pre == state))
    }

    /// Human readable name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Prepare => "Preparing",
            Self::Configure => "Configuring",
            Self::Initialize => "Initializing",
            Self::Synchronize => "Synchronizing",
            Self::Stop => "Stopping",
            Self::Compute => "Computing",
            Self::RealtimeStep => "Realtime step",
        }
    }

    /// Worker thread name.
    #[must_use]
    pub fn thread_name(self) -> &'static str {
        match self {
            Self::Prepare => "dcp-prepare",
            Self::Configure => "dcp-configure",
            Self::Initialize => "dcp-initialize",
            Self::Synchronize => "dcp-synchronize",
            Self::Stop => "dcp-stop",
            Self::Compute => "dcp-compute",
            Self::RealtimeStep => "dcp-realtime",
        }
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Whether returning from a callback completes its phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallbackMode {
    /// The phase finishes when the callback returns.
    #[default]
    Sync,
    /// The host finishes the phase through the matching `*_finished` call.
    Async,
}

/// Step callbacks, one per stepping state and timing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    /// NRT step entered from SYNCHRONIZING.
    SynchronizingNrt,
    /// NRT step entered from SYNCHRONIZED.
    SynchronizedNrt,
    /// NRT step entered from RUNNING.
    RunningNrt,
    /// Real-time step in SYNCHRONIZING.
    Synchronizing,
    /// Real-time step in SYNCHRONIZED.
    Synchronized,
    /// Real-time step in RUNNING.
    Running,
}

impl StepKind {
    /// Callback slot for a step taken in `state`.
    #[must_use]
    pub fn for_state(state: DcpState, non_real_time: bool) -> Option<Self> {
        let kind = match (state, non_real_time) {
            (DcpState::Synchronizing, true) => Self::SynchronizingNrt,
            (DcpState::Synchronized, true) => Self::SynchronizedNrt,
            (DcpState::Running, true) => Self::RunningNrt,
            (DcpState::Synchronizing, false) => Self::Synchronizing,
            (DcpState::Synchronized, false) => Self::Synchronized,
            (DcpState::Running, false) => Self::Running,
            _ => return None,
        };
        Some(kind)
    }
}

/// Callback without arguments.
pub type PhaseCallback = Arc<dyn Fn() + Send + Sync>;
/// Step callback receiving the number of steps.
pub type StepCallback = Arc<dyn Fn(u32) + Send + Sync>;
/// Stop callback receiving the phase that was interrupted, if any.
pub type StopCallback = Arc<dyn Fn(Option<PhaseKind>) + Send + Sync>;

/// Registered host callbacks.
#[derive(Clone, Default)]
pub struct Callbacks {
    phases: HashMap<PhaseKind, (PhaseCallback, CallbackMode)>,
    steps: HashMap<StepKind, (StepCallback, CallbackMode)>,
    stop: Option<(StopCallback, CallbackMode)>,
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("phases", &self.phases.keys().collect::<Vec<_>>())
            .field("steps", &self.steps.keys().collect::<Vec<_>>())
            .field("stop", &self.stop.is_some())
            .finish()
    }
}

impl Callbacks {
    /// Register the callback of a prepare, configure, initialize or
    /// synchronize phase.
    pub fn set_phase(&mut self, kind: PhaseKind, mode: CallbackMode, callback: PhaseCallback) {
        self.phases.insert(kind, (callback, mode));
    }

    /// Register a step callback.
    pub fn set_step(&mut self, kind: StepKind, mode: CallbackMode, callback: StepCallback) {
        self.steps.insert(kind, (callback, mode));
    }

    /// Register the stop callback.
    pub fn set_stop(&mut self, mode: CallbackMode, callback: StopCallback) {
        self.stop = Some((callback, mode));
    }

    /// Callback of a phase.
    #[must_use]
    pub fn phase(&self, kind: PhaseKind) -> Option<(PhaseCallback, CallbackMode)> {
        self.phases.get(&kind).cloned()
    }

    /// Step callback.
    #[must_use]
    pub fn step(&self, kind: StepKind) -> Option<(StepCallback, CallbackMode)> {
        self.steps.get(&kind).cloned()
    }

    /// Stop callback.
    #[must_use]
    pub fn stop(&self) -> Option<(StopCallback, CallbackMode)> {
        self.stop.clone()
    }

    /// Mode of a phase callback; unregistered callbacks count as sync.
    #[must_use]
    pub fn phase_mode(&self, kind: PhaseKind) -> CallbackMode {
        match kind {
            PhaseKind::Stop => self.stop.as_ref().map(|(_, mode)| *mode),
            _ => self.phases.get(&kind).map(|(_, mode)| *mode),
        }
        .unwrap_or_default()
    }

    /// Mode of a step callback; unregistered callbacks count as sync.
    #[must_use]
    pub fn step_mode(&self, kind: StepKind) -> CallbackMode {
        self.steps.get(&kind).map(|(_, mode)| *mode).unwrap_or_default()
    }
}

/// Tracked worker threads.
#[derive(Debug, Default)]
pub struct Workers {
    handles: Vec<JoinHandle<()>>,
}

impl Workers {
    /// Create an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` on a new named thread, reaping finished threads first.
    ///
    /// # Errors
    ///
    /// Returns [`SlaveError::Spawn`] if the thread cannot be created.
    pub fn spawn<F>(&mut self, name: &str, work: F) -> SlaveResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.reap();
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(work)
            .map_err(|e| SlaveError::Spawn {
                name: name.to_owned(),
                message: e.to_string(),
            })?;
        debug!(thread = name, "Worker spawned");
        self.handles.push(handle);
        Ok(())
    }

    /// Keep track of a thread started elsewhere.
    pub fn adopt(&mut self, handle: JoinHandle<()>) {
        self.reap();
        self.handles.push(handle);
    }

    /// Join threads that have already finished.
    pub fn reap(&mut self) {
        let (done, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.handles)
            .into_iter()
            .partition(JoinHandle::is_finished);
        self.handles = running;
        for handle in done {
            join(handle);
        }
    }

    /// Join every thread except the calling one.
    pub fn join_all(&mut self) {
        let current = thread::current().id();
        for handle in std::mem::take(&mut self.handles) {
            if handle.thread().id() != current {
                join(handle);
            }
        }
    }

    /// Threads not yet reaped.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Returns true if no thread is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

fn join(handle: JoinHandle<()>) {
    let name = handle.thread().name().unwrap_or("worker").to_owned();
    if handle.join().is_err() {
        warn!(thread = %name, "Worker panicked");
    }
}
