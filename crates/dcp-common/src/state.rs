//! DCP slave state machine.
//!
//! The superstates follow the DCP lifecycle:
//! ALIVE → CONFIGURATION → PREPARING → PREPARED → CONFIGURING → CONFIGURED
//! → (INITIALIZING → INITIALIZED → SENDING_I →) SYNCHRONIZING → SYNCHRONIZED
//! → RUNNING, with COMPUTING/COMPUTED/SENDING_D as the stepping substates.
//!
//! STOPPING/STOPPED and ERROR_HANDLING/ERROR_RESOLVED are reachable from
//! every operational state.

use crate::error::{SlaveError, SlaveResult};
use crate::types::PduType;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// Slave superstates with their wire encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum DcpState {
    /// Powered on, waiting for registration.
    #[default]
    Alive = 0x00,
    /// Registered, accepting configuration.
    Configuration = 0x01,
    /// Preparing the configuration.
    Preparing = 0x02,
    /// Configuration prepared.
    Prepared = 0x03,
    /// Applying the configuration.
    Configuring = 0x04,
    /// Configuration applied.
    Configured = 0x05,
    /// Computing initial values.
    Initializing = 0x06,
    /// Initial values computed.
    Initialized = 0x07,
    /// Sending initialization outputs.
    SendingI = 0x08,
    /// Synchronizing with the master.
    Synchronizing = 0x09,
    /// Synchronized, not yet running.
    Synchronized = 0x0A,
    /// Running.
    Running = 0x0B,
    /// Computing a step.
    Computing = 0x0C,
    /// Step computed.
    Computed = 0x0D,
    /// Sending step outputs.
    SendingD = 0x0E,
    /// Stopping.
    Stopping = 0x0F,
    /// Stopped.
    Stopped = 0x10,
    /// Handling an error.
    ErrorHandling = 0x11,
    /// Error handled, waiting for reset.
    ErrorResolved = 0x12,
}

impl DcpState {
    /// All states in wire order.
    pub const ALL: [DcpState; 19] = [
        Self::Alive,
        Self::Configuration,
        Self::Preparing,
        Self::Prepared,
        Self::Configuring,
        Self::Configured,
        Self::Initializing,
        Self::Initialized,
        Self::SendingI,
        Self::Synchronizing,
        Self::Synchronized,
        Self::Running,
        Self::Computing,
        Self::Computed,
        Self::SendingD,
        Self::Stopping,
        Self::Stopped,
        Self::ErrorHandling,
        Self::ErrorResolved,
    ];

    /// Decode a state id byte.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(usize::from(value)).copied()
    }

    /// Numeric state id.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Check if a transition to `target` is valid from the current state.
    #[must_use]
    pub fn can_transition_to(&self, target: DcpState) -> bool {
        use DcpState::*;

        if target == ErrorHandling {
            return true;
        }
        if target == Stopping {
            return self.can_stop();
        }

        matches!(
            (self, target),
            // Registration
            (Alive, Configuration)
                | (Configuration, Alive)
                | (Stopped, Alive)
                // Forward progression
                | (Configuration, Preparing)
                | (Preparing, Prepared)
                | (Prepared, Configuring)
                | (Configuring, Configured)
                | (Configured, Initializing)
                | (Initializing, Initialized)
                | (Initialized, SendingI)
                | (SendingI, Configured)
                | (Configured, Synchronizing)
                | (Synchronizing, Synchronized)
                | (Synchronized, Running)
                // Stepping
                | (Synchronizing | Synchronized | Running, Computing)
                | (Computing, Computed)
                | (Computed, SendingD)
                | (SendingD, Synchronizing | Synchronized | Running)
                // Shutdown and recovery
                | (Stopping, Stopped)
                | (Stopped, Configuration)
                | (ErrorHandling, ErrorResolved)
                | (ErrorResolved, Configuration)
        )
    }

    /// Transitions of one NRT step: into COMPUTING from a run state, on to
    /// COMPUTED and SENDING_D, and back to the state the step started from.
    #[must_use]
    pub fn is_step_cycle(&self, target: DcpState) -> bool {
        use DcpState::*;

        matches!(
            (self, target),
            (Synchronizing | Synchronized | Running, Computing)
                | (Computing, Computed)
                | (Computed, SendingD)
                | (SendingD, Synchronizing | Synchronized | Running)
        )
    }

    /// States from which a host or master stop leads to STOPPING.
    #[must_use]
    pub fn can_stop(&self) -> bool {
        !matches!(
            self,
            Self::Alive
                | Self::Configuration
                | Self::Stopping
                | Self::Stopped
                | Self::ErrorHandling
                | Self::ErrorResolved
        )
    }

    /// Heartbeat supervision is active in these states.
    #[must_use]
    pub fn is_supervised(&self) -> bool {
        !matches!(
            self,
            Self::Alive | Self::ErrorHandling | Self::ErrorResolved
        )
    }

    /// Returns true if `pdu` may be received in this state.
    ///
    /// This is the admissibility table of the slave. `INF_state` is accepted
    /// everywhere, data PDUs from CONFIGURED onwards.
    #[must_use]
    pub fn is_pdu_allowed(&self, pdu: PduType) -> bool {
        use DcpState::*;
        use PduType::*;

        match pdu {
            InfState => return true,
            InfLog => return *self != Alive,
            DatInputOutput | DatParameter => {
                return !matches!(
                    self,
                    Alive | Configuration | Preparing | Prepared | Configuring
                )
            }
            _ => {}
        }
        if pdu.is_configuration() {
            return *self == Configuration;
        }

        match self {
            Alive => pdu == StcRegister,
            Configuration => matches!(pdu, StcDeregister | StcPrepare),
            Preparing | Configuring | Initializing | SendingI => pdu == StcStop,
            Prepared => matches!(pdu, StcConfigure | StcStop),
            Configured => matches!(pdu, StcInitialize | StcRun | StcStop),
            Initialized => matches!(pdu, StcSendOutputs | StcStop),
            Synchronizing | Running => matches!(pdu, StcDoStep | StcStop),
            Synchronized => matches!(pdu, StcRun | StcDoStep | StcStop),
            Computing => pdu == StcSendOutputs,
            Computed => matches!(pdu, StcSendOutputs | StcStop),
            SendingD | Stopping => false,
            Stopped => matches!(pdu, StcDeregister | StcReset),
            ErrorHandling => pdu == InfError,
            ErrorResolved => matches!(pdu, StcReset | InfError),
        }
    }
}

impl fmt::Display for DcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Alive => "ALIVE",
            Self::Configuration => "CONFIGURATION",
            Self::Preparing => "PREPARING",
            Self::Prepared => "PREPARED",
            Self::Configuring => "CONFIGURING",
            Self::Configured => "CONFIGURED",
            Self::Initializing => "INITIALIZING",
            Self::Initialized => "INITIALIZED",
            Self::SendingI => "SENDING_I",
            Self::Synchronizing => "SYNCHRONIZING",
            Self::Synchronized => "SYNCHRONIZED",
            Self::Running => "RUNNING",
            Self::Computing => "COMPUTING",
            Self::Computed => "COMPUTED",
            Self::SendingD => "SENDING_D",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::ErrorHandling => "ERROR_HANDLING",
            Self::ErrorResolved => "ERROR_RESOLVED",
        };
        f.write_str(name)
    }
}

/// State machine wrapper with transition history tracking.
#[derive(Debug, Clone, Default)]
pub struct StateMachine {
    current: DcpState,
    previous: Option<DcpState>,
    transition_count: u64,
}

impl StateMachine {
    /// Create a new state machine starting in ALIVE.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the current state.
    #[must_use]
    pub fn state(&self) -> DcpState {
        self.current
    }

    /// Get the previous state (if any transition occurred).
    #[must_use]
    pub fn previous_state(&self) -> Option<DcpState> {
        self.previous
    }

    /// Get total number of transitions.
    #[must_use]
    pub fn transition_count(&self) -> u64 {
        self.transition_count
    }

    /// Attempt a state transition.
    ///
    /// # Errors
    ///
    /// Returns [`SlaveError::InvalidStateTransition`] if `target` is not
    /// reachable from the current state.
    pub fn transition(&mut self, target: DcpState) -> SlaveResult<()> {
        if self.current.can_transition_to(target) {
            self.previous = Some(self.current);
            self.current = target;
            self.transition_count += 1;
            Ok(())
        } else {
            warn!(from = %self.current, to = %target, "State change refused");
            Err(SlaveError::InvalidStateTransition {
                from: self.current.to_string(),
                to: target.to_string(),
            })
        }
    }
}
