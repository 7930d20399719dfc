//! Protocol enumerations carried on the wire.
//!
//! Every enum here has a fixed numeric encoding. Conversion from a raw
//! byte is fallible (`from_u8`) because all values originate from an
//! untrusted peer.

use serde::{Deserialize, Serialize};
use std::fmt;

/// PDU type identifier, the first byte of every PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum PduType {
    /// Master registers the slave.
    StcRegister = 0x01,
    /// Master deregisters the slave.
    StcDeregister = 0x02,
    /// Enter PREPARING.
    StcPrepare = 0x03,
    /// Enter CONFIGURING.
    StcConfigure = 0x04,
    /// Enter INITIALIZING.
    StcInitialize = 0x05,
    /// Enter SYNCHRONIZING or RUNNING.
    StcRun = 0x06,
    /// Compute a non-real-time step.
    StcDoStep = 0x07,
    /// Emit outputs.
    StcSendOutputs = 0x08,
    /// Enter STOPPING.
    StcStop = 0x09,
    /// Return to CONFIGURATION.
    StcReset = 0x0A,
    /// Set the time resolution.
    CfgTimeRes = 0x20,
    /// Set the steps of an output data id.
    CfgSteps = 0x21,
    /// Assign an input value reference to a position.
    CfgInput = 0x22,
    /// Assign an output value reference to a position.
    CfgOutput = 0x23,
    /// Clear the configuration.
    CfgClear = 0x24,
    /// Target network information for an output data id.
    CfgTargetNetworkInformation = 0x25,
    /// Source network information for an input data id.
    CfgSourceNetworkInformation = 0x26,
    /// Set a parameter value.
    CfgParameter = 0x27,
    /// Assign a tunable parameter to a position.
    CfgTunableParameter = 0x28,
    /// Network information for a parameter id.
    CfgParamNetworkInformation = 0x29,
    /// Route log output.
    CfgLogging = 0x2A,
    /// Set the scope of a data id.
    CfgScope = 0x2B,
    /// Request the current state.
    InfState = 0x80,
    /// Request the current error code.
    InfError = 0x81,
    /// Request buffered log entries.
    InfLog = 0x82,
    /// Positive acknowledgement.
    RspAck = 0xB0,
    /// Negative acknowledgement.
    RspNack = 0xB1,
    /// State response.
    RspStateAck = 0xB2,
    /// Error response.
    RspErrorAck = 0xB3,
    /// Log response.
    RspLogAck = 0xB4,
    /// State change notification.
    NtfStateChanged = 0xE0,
    /// Log notification.
    NtfLog = 0xE1,
    /// Input/output data.
    DatInputOutput = 0xF0,
    /// Parameter data.
    DatParameter = 0xF1,
}

impl PduType {
    /// Decode a type identifier byte.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        use PduType::*;
        let ty = match value {
            0x01 => StcRegister,
            0x02 => StcDeregister,
            0x03 => StcPrepare,
            0x04 => StcConfigure,
            0x05 => StcInitialize,
            0x06 => StcRun,
            0x07 => StcDoStep,
            0x08 => StcSendOutputs,
            0x09 => StcStop,
            0x0A => StcReset,
            0x20 => CfgTimeRes,
            0x21 => CfgSteps,
            0x22 => CfgInput,
            0x23 => CfgOutput,
            0x24 => CfgClear,
            0x25 => CfgTargetNetworkInformation,
            0x26 => CfgSourceNetworkInformation,
            0x27 => CfgParameter,
            0x28 => CfgTunableParameter,
            0x29 => CfgParamNetworkInformation,
            0x2A => CfgLogging,
            0x2B => CfgScope,
            0x80 => InfState,
            0x81 => InfError,
            0x82 => InfLog,
            0xB0 => RspAck,
            0xB1 => RspNack,
            0xB2 => RspStateAck,
            0xB3 => RspErrorAck,
            0xB4 => RspLogAck,
            0xE0 => NtfStateChanged,
            0xE1 => NtfLog,
            0xF0 => DatInputOutput,
            0xF1 => DatParameter,
            _ => return None,
        };
        Some(ty)
    }

    /// Numeric type identifier.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// State transition commands (`STC_*`).
    #[must_use]
    pub fn is_state_transition(self) -> bool {
        (0x01..=0x0A).contains(&self.as_u8())
    }

    /// Configuration commands (`CFG_*`).
    #[must_use]
    pub fn is_configuration(self) -> bool {
        (0x20..=0x2B).contains(&self.as_u8())
    }

    /// Information requests (`INF_*`).
    #[must_use]
    pub fn is_information(self) -> bool {
        (0x80..=0x82).contains(&self.as_u8())
    }

    /// Responses (`RSP_*`).
    #[must_use]
    pub fn is_response(self) -> bool {
        (0xB0..=0xB4).contains(&self.as_u8())
    }

    /// Notifications (`NTF_*`).
    #[must_use]
    pub fn is_notification(self) -> bool {
        matches!(self, Self::NtfStateChanged | Self::NtfLog)
    }

    /// Data PDUs (`DAT_*`).
    #[must_use]
    pub fn is_data(self) -> bool {
        matches!(self, Self::DatInputOutput | Self::DatParameter)
    }

    /// PDUs a master sends to a slave.
    #[must_use]
    pub fn is_master_to_slave(self) -> bool {
        self.is_state_transition() || self.is_configuration() || self.is_information() || self.is_data()
    }

    /// Protocol name, e.g. `STC_register`.
    #[must_use]
    pub fn name(self) -> &'static str {
        use PduType::*;
        match self {
            StcRegister => "STC_register",
            StcDeregister => "STC_deregister",
            StcPrepare => "STC_prepare",
            StcConfigure => "STC_configure",
            StcInitialize => "STC_initialize",
            StcRun => "STC_run",
            StcDoStep => "STC_do_step",
            StcSendOutputs => "STC_send_outputs",
            StcStop => "STC_stop",
            StcReset => "STC_reset",
            CfgTimeRes => "CFG_set_time_res",
            CfgSteps => "CFG_set_steps",
            CfgInput => "CFG_config_input",
            CfgOutput => "CFG_config_output",
            CfgClear => "CFG_config_clear",
            CfgTargetNetworkInformation => "CFG_set_target_network_information",
            CfgSourceNetworkInformation => "CFG_set_source_network_information",
            CfgParameter => "CFG_set_parameter",
            CfgTunableParameter => "CFG_config_tunable_parameter",
            CfgParamNetworkInformation => "CFG_set_param_network_information",
            CfgLogging => "CFG_set_logging",
            CfgScope => "CFG_set_scope",
            InfState => "INF_state",
            InfError => "INF_error",
            InfLog => "INF_log",
            RspAck => "RSP_ack",
            RspNack => "RSP_nack",
            RspStateAck => "RSP_state_ack",
            RspErrorAck => "RSP_error_ack",
            RspLogAck => "RSP_log_ack",
            NtfStateChanged => "NTF_state_changed",
            NtfLog => "NTF_log",
            DatInputOutput => "DAT_input_output",
            DatParameter => "DAT_parameter",
        }
    }
}

impl fmt::Display for PduType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Data types a variable or a wire source can have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum DataType {
    /// Unsigned 8 bit integer.
    Uint8 = 0,
    /// Unsigned 16 bit integer.
    Uint16 = 1,
    /// Unsigned 32 bit integer.
    Uint32 = 2,
    /// Unsigned 64 bit integer.
    Uint64 = 3,
    /// Signed 8 bit integer.
    Int8 = 4,
    /// Signed 16 bit integer.
    Int16 = 5,
    /// Signed 32 bit integer.
    Int32 = 6,
    /// Signed 64 bit integer.
    Int64 = 7,
    /// IEEE 754 single precision.
    Float32 = 8,
    /// IEEE 754 double precision.
    Float64 = 9,
    /// UTF-8 text with a 32 bit length prefix.
    String = 10,
    /// Raw bytes with a 32 bit length prefix.
    Binary = 11,
}

impl DataType {
    /// All data types in wire order.
    pub const ALL: [DataType; 12] = [
        Self::Uint8,
        Self::Uint16,
        Self::Uint32,
        Self::Uint64,
        Self::Int8,
        Self::Int16,
        Self::Int32,
        Self::Int64,
        Self::Float32,
        Self::Float64,
        Self::String,
        Self::Binary,
    ];

    /// Decode a data type byte.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(usize::from(value)).copied()
    }

    /// Fixed wire width in bytes, `None` for string and binary.
    #[must_use]
    pub fn size(self) -> Option<usize> {
        match self {
            Self::Uint8 | Self::Int8 => Some(1),
            Self::Uint16 | Self::Int16 => Some(2),
            Self::Uint32 | Self::Int32 | Self::Float32 => Some(4),
            Self::Uint64 | Self::Int64 | Self::Float64 => Some(8),
            Self::String | Self::Binary => None,
        }
    }

    /// String and binary carry a length prefix instead of a fixed width.
    #[must_use]
    pub fn is_variable_size(self) -> bool {
        matches!(self, Self::String | Self::Binary)
    }

    /// Unsigned integer kinds, the only kinds a structural parameter may have.
    #[must_use]
    pub fn is_unsigned(self) -> bool {
        matches!(self, Self::Uint8 | Self::Uint16 | Self::Uint32 | Self::Uint64)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uint8 => "uint8",
            Self::Uint16 => "uint16",
            Self::Uint32 => "uint32",
            Self::Uint64 => "uint64",
            Self::Int8 => "int8",
            Self::Int16 => "int16",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
            Self::String => "string",
            Self::Binary => "binary",
        };
        f.write_str(name)
    }
}

/// Timing contract negotiated at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum OpMode {
    /// Hard real-time.
    #[default]
    Hrt = 0,
    /// Soft real-time.
    Srt = 1,
    /// Non-real-time, stepped by the master.
    Nrt = 2,
}

impl OpMode {
    /// Decode an op mode byte.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Hrt),
            1 => Some(Self::Srt),
            2 => Some(Self::Nrt),
            _ => None,
        }
    }

    /// Real-time modes pace steps against the wall clock.
    #[must_use]
    pub fn is_real_time(self) -> bool {
        !matches!(self, Self::Nrt)
    }
}

impl fmt::Display for OpMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hrt => write!(f, "HRT"),
            Self::Srt => write!(f, "SRT"),
            Self::Nrt => write!(f, "NRT"),
        }
    }
}

/// Transport protocol carried in network information PDUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum TransportProtocol {
    /// UDP over IPv4.
    UdpIpv4 = 0,
    /// Bluetooth.
    Bluetooth = 1,
    /// CAN bus.
    Can = 2,
    /// USB.
    Usb = 3,
    /// TCP over IPv4.
    TcpIpv4 = 4,
}

impl TransportProtocol {
    /// Decode a transport protocol byte.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::UdpIpv4),
            1 => Some(Self::Bluetooth),
            2 => Some(Self::Can),
            3 => Some(Self::Usb),
            4 => Some(Self::TcpIpv4),
            _ => None,
        }
    }

    /// Ethernet transports carry a port and an IPv4 address.
    #[must_use]
    pub fn is_ethernet(self) -> bool {
        matches!(self, Self::UdpIpv4 | Self::TcpIpv4)
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UdpIpv4 => write!(f, "UDP_IPv4"),
            Self::Bluetooth => write!(f, "BLUETOOTH"),
            Self::Can => write!(f, "CAN"),
            Self::Usb => write!(f, "USB"),
            Self::TcpIpv4 => write!(f, "TCP_IPv4"),
        }
    }
}

/// Superstates in which the data of a data id is exchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Scope {
    /// Both initialization and run.
    InitializationRunNonRealTime = 0,
    /// Initialization only.
    Initialization = 1,
    /// Run only.
    Run = 2,
}

impl Scope {
    /// Decode a scope byte.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::InitializationRunNonRealTime),
            1 => Some(Self::Initialization),
            2 => Some(Self::Run),
            _ => None,
        }
    }

    /// Data is sent while running.
    #[must_use]
    pub fn includes_run(self) -> bool {
        !matches!(self, Self::Initialization)
    }

    /// Data is sent during initialization.
    #[must_use]
    pub fn includes_initialization(self) -> bool {
        !matches!(self, Self::Run)
    }
}

/// Severity of a protocol log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum LogLevel {
    /// Unrecoverable.
    Fatal = 0,
    /// Error.
    Error = 1,
    /// Warning.
    Warning = 2,
    /// Informational.
    Information = 3,
    /// Debug.
    Debug = 4,
}

impl LogLevel {
    /// Decode a log level byte.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Fatal),
            1 => Some(Self::Error),
            2 => Some(Self::Warning),
            3 => Some(Self::Information),
            4 => Some(Self::Debug),
            _ => None,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fatal => write!(f, "FATAL"),
            Self::Error => write!(f, "ERROR"),
            Self::Warning => write!(f, "WARNING"),
            Self::Information => write!(f, "INFORMATION"),
            Self::Debug => write!(f, "DEBUG"),
        }
    }
}

/// How log entries of a category and level reach the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum LogMode {
    /// Buffered until requested with `INF_log`.
    OnRequest = 0,
    /// Sent immediately as `NTF_log`.
    OnNotification = 1,
}

impl LogMode {
    /// Decode a log mode byte.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::OnRequest),
            1 => Some(Self::OnNotification),
            _ => None,
        }
    }
}
