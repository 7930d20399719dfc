use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error codes exchanged with the master in `RSP_nack` and `RSP_error_ack`.
///
/// Codes are grouped by their high nibble: `0x1xxx` protocol errors,
/// `0x2xxx` invalid values, `0x3xxx` incomplete configuration and
/// `0x4xxx` unsupported features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u16)]
pub enum DcpError {
    /// No error.
    #[default]
    None = 0x0000,
    /// Unspecified protocol error.
    ProtocolErrorGeneric = 0x1001,
    /// No `INF_state` arrived within the heartbeat interval.
    ProtocolErrorHeartbeatMissed = 0x1002,
    /// The PDU is not admissible in the current state.
    ProtocolErrorPduNotAllowedInThisState = 0x1003,
    /// A protocol property was violated.
    ProtocolErrorPropertyViolated = 0x1004,
    /// A state transition is still running.
    ProtocolErrorStateTransitionInProgress = 0x1005,
    /// PDU length does not match its type.
    InvalidLength = 0x2001,
    /// Unknown log category.
    InvalidLogCategory = 0x2002,
    /// Unknown log level.
    InvalidLogLevel = 0x2003,
    /// Unknown log mode.
    InvalidLogMode = 0x2004,
    /// Major protocol version mismatch.
    InvalidMajorVersion = 0x2005,
    /// Minor protocol version mismatch.
    InvalidMinorVersion = 0x2006,
    /// Network information is not supported.
    InvalidNetworkInformation = 0x2007,
    /// Op mode is not supported.
    InvalidOpMode = 0x2008,
    /// Payload cannot be applied.
    InvalidPayload = 0x2009,
    /// Unknown scope.
    InvalidScope = 0x200A,
    /// Source data type cannot be cast to the variable type.
    InvalidSourceDataType = 0x200B,
    /// Start time lies in the past.
    InvalidStartTime = 0x200C,
    /// State id does not match the current state.
    InvalidStateId = 0x200D,
    /// Step count is not supported.
    InvalidSteps = 0x200E,
    /// Time resolution is not supported.
    InvalidTimeResolution = 0x200F,
    /// Transport protocol is not supported.
    InvalidTransportProtocol = 0x2010,
    /// Slave UUID mismatch.
    InvalidUuid = 0x2011,
    /// Value reference does not exist or has the wrong causality.
    InvalidValueReference = 0x2012,
    /// Gap in the input positions of a data id.
    IncompleteConfigGapInputPos = 0x3001,
    /// Gap in the output positions of a data id.
    IncompleteConfigGapOutputPos = 0x3002,
    /// Gap in the tunable parameter positions of a parameter id.
    IncompleteConfigGapTunablePos = 0x3003,
    /// An input data id has no source network information.
    IncompleteConfigNwInfoInput = 0x3004,
    /// An output data id has no target network information.
    IncompleteConfigNwInfoOutput = 0x3005,
    /// A parameter id has no network information.
    IncompleteConfigNwInfoTunable = 0x3006,
    /// A data id has no scope.
    IncompleteConfigScope = 0x3007,
    /// An output data id has no steps.
    IncompleteConfigSteps = 0x3008,
    /// No time resolution was configured.
    IncompleteConfigTimeResolution = 0x3009,
    /// Configuration is incomplete.
    IncompleteConfiguration = 0x300A,
    /// Log on notification is not supported.
    NotSupportedLogOnNotification = 0x4001,
    /// Log on request is not supported.
    NotSupportedLogOnRequest = 0x4002,
    /// Variable step sizes are not supported.
    NotSupportedVariableSteps = 0x4003,
    /// Transport protocol is not supported.
    NotSupportedTransportProtocol = 0x4004,
    /// PDU is not supported.
    NotSupportedPdu = 0x4005,
    /// PDU size is not supported.
    NotSupportedPduSize = 0x4006,
}

impl DcpError {
    /// Numeric wire code.
    #[must_use]
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Decode a wire code.
    #[must_use]
    pub fn from_u16(code: u16) -> Option<Self> {
        use DcpError::*;
        let err = match code {
            0x0000 => None,
            0x1001 => ProtocolErrorGeneric,
            0x1002 => ProtocolErrorHeartbeatMissed,
            0x1003 => ProtocolErrorPduNotAllowedInThisState,
            0x1004 => ProtocolErrorPropertyViolated,
            0x1005 => ProtocolErrorStateTransitionInProgress,
            0x2001 => InvalidLength,
            0x2002 => InvalidLogCategory,
            0x2003 => InvalidLogLevel,
            0x2004 => InvalidLogMode,
            0x2005 => InvalidMajorVersion,
            0x2006 => InvalidMinorVersion,
            0x2007 => InvalidNetworkInformation,
            0x2008 => InvalidOpMode,
            0x2009 => InvalidPayload,
            0x200A => InvalidScope,
            0x200B => InvalidSourceDataType,
            0x200C => InvalidStartTime,
            0x200D => InvalidStateId,
            0x200E => InvalidSteps,
            0x200F => InvalidTimeResolution,
            0x2010 => InvalidTransportProtocol,
            0x2011 => InvalidUuid,
            0x2012 => InvalidValueReference,
            0x3001 => IncompleteConfigGapInputPos,
            0x3002 => IncompleteConfigGapOutputPos,
            0x3003 => IncompleteConfigGapTunablePos,
            0x3004 => IncompleteConfigNwInfoInput,
            0x3005 => IncompleteConfigNwInfoOutput,
            0x3006 => IncompleteConfigNwInfoTunable,
            0x3007 => IncompleteConfigScope,
            0x3008 => IncompleteConfigSteps,
            0x3009 => IncompleteConfigTimeResolution,
            0x300A => IncompleteConfiguration,
            0x4001 => NotSupportedLogOnNotification,
            0x4002 => NotSupportedLogOnRequest,
            0x4003 => NotSupportedVariableSteps,
            0x4004 => NotSupportedTransportProtocol,
            0x4005 => NotSupportedPdu,
            0x4006 => NotSupportedPduSize,
            _ => return Option::None,
        };
        Some(err)
    }

    /// Returns true for anything other than [`DcpError::None`].
    #[must_use]
    pub fn is_error(self) -> bool {
        self != Self::None
    }

    /// Error family derived from the high nibble of the code.
    #[must_use]
    pub fn family(self) -> ErrorFamily {
        match self.code() >> 12 {
            0x1 => ErrorFamily::Protocol,
            0x2 => ErrorFamily::InvalidValue,
            0x3 => ErrorFamily::IncompleteConfiguration,
            0x4 => ErrorFamily::NotSupported,
            _ => ErrorFamily::None,
        }
    }
}

impl fmt::Display for DcpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?} (0x{:04X})", self.code())
    }
}

/// Coarse grouping of [`DcpError`] codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorFamily {
    /// No error.
    None,
    /// `0x1xxx`.
    Protocol,
    /// `0x2xxx`.
    InvalidValue,
    /// `0x3xxx`.
    IncompleteConfiguration,
    /// `0x4xxx`.
    NotSupported,
}

/// Library error type for failures outside the PDU exchange.
///
/// Protocol violations by the master never surface as `SlaveError`; they
/// are answered on the wire with a [`DcpError`] code instead.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SlaveError {
    /// Configuration or initialization error.
    #[error("configuration error: {0}")]
    Config(String),

    /// The slave description is inconsistent.
    #[error("invalid slave description: {0}")]
    Description(String),

    /// Malformed PDU bytes.
    #[error("codec error: {0}")]
    Codec(String),

    /// Transport driver failure.
    #[error("driver error: {0}")]
    Driver(String),

    /// A value buffer could not be updated.
    #[error("value error for vr {value_reference}: {message}")]
    Value {
        /// Affected value reference.
        value_reference: u64,
        /// What went wrong.
        message: String,
    },

    /// A worker thread could not be started.
    #[error("failed to spawn {name} thread: {message}")]
    Spawn {
        /// Thread name.
        name: String,
        /// OS error text.
        message: String,
    },

    /// I/O operation error.
    #[error("I/O error: {0}")]
    Io(String),

    /// Invalid state transition attempted.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Source state.
        from: String,
        /// Attempted target state.
        to: String,
    },
}

/// Convenience type alias for slave operations.
pub type SlaveResult<T> = Result<T, SlaveError>;
