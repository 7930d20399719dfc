//! Protocol logging.
//!
//! Log events of the slave library are described by fixed templates. The
//! master decides per category and level whether entries are pushed as
//! `NTF_log` or buffered for `INF_log`. Independently of that routing every
//! event is also written to `tracing`.

use dcp_common::{LogLevel, LogMode};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Log category of the slave library itself.
pub const SLAVE_LOG_CATEGORY: u8 = 251;

/// Serialized size of an entry header (`time i64 | template_id u8`).
pub const LOG_ENTRY_HEADER_SIZE: usize = 9;

/// A fixed log message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogTemplate {
    /// Template id carried on the wire.
    pub id: u8,
    /// Category.
    pub category: u8,
    /// Level.
    pub level: LogLevel,
    /// Message; each `{}` is replaced by one argument.
    pub message: &'static str,
}

impl LogTemplate {
    /// Substitute `args` into the message.
    #[must_use]
    pub fn render(&self, args: &[LogArg]) -> String {
        let mut out = String::with_capacity(self.message.len());
        let mut args = args.iter();
        let mut pieces = self.message.split("{}").peekable();
        while let Some(piece) = pieces.next() {
            out.push_str(piece);
            if pieces.peek().is_some() {
                match args.next() {
                    Some(arg) => out.push_str(&arg.to_string()),
                    None => out.push_str("{}"),
                }
            }
        }
        out
    }
}

/// Events logged by the slave library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LogEvent {
    StateChanged = 1,
    PhaseStarted,
    PhaseFinished,
    PhaseInterrupted,
    HeartbeatStarted,
    HeartbeatStopped,
    HeartbeatMissed,
    ConfigurationCleared,
    TimeResolutionSet,
    StepsSet,
    DcpIdSet,
    OpModeSet,
    InvalidTypeId,
    InvalidReceiver,
    UnknownDataId,
    UnknownParamId,
    PduMissed,
    OldPduReceived,
    InvalidLength,
    OnlyNrt,
    PduNotAllowed,
    DataNotAllowed,
    InvalidStateId,
    InvalidUuid,
    InvalidOpMode,
    InvalidMajorVersion,
    InvalidMinorVersion,
    IncompleteConfiguration,
    InvalidStartTime,
    InvalidSteps,
    NotSupportedVariableSteps,
    InvalidLogCategory,
    InvalidLogLevel,
    InvalidLogMode,
    NotSupportedLogOnRequest,
    NotSupportedLogOnNotification,
    InvalidScope,
    FixedTimeResolution,
    InvalidTimeResolution,
    InvalidValueReference,
    InvalidSourceDataType,
    InvalidPort,
    InvalidTransportProtocol,
    StepOverrun,
    ShapeTooLarge,
}

impl LogEvent {
    /// Template describing this event.
    #[must_use]
    pub fn template(self) -> LogTemplate {
        use LogLevel::{Debug, Error, Fatal, Information, Warning};

        let (level, message) = match self {
            Self::StateChanged => (Debug, "State changed to {}"),
            Self::PhaseStarted => (Debug, "{} started"),
            Self::PhaseFinished => (Debug, "{} finished"),
            Self::PhaseInterrupted => (Debug, "{} was interrupted"),
            Self::HeartbeatStarted => (Information, "Heartbeat supervision started ({} ms)"),
            Self::HeartbeatStopped => (Information, "Heartbeat supervision stopped"),
            Self::HeartbeatMissed => (Fatal, "No heartbeat from master for {} ms"),
            Self::ConfigurationCleared => (Debug, "Configuration cleared"),
            Self::TimeResolutionSet => (Debug, "Time resolution set to {}/{} s"),
            Self::StepsSet => (Debug, "Steps of data id {} set to {}"),
            Self::DcpIdSet => (Debug, "DCP id set to {}"),
            Self::OpModeSet => (Debug, "Op mode set to {}"),
            Self::InvalidTypeId => (Error, "Invalid type id {}"),
            Self::InvalidReceiver => (Error, "PDU addressed to {} instead of {}"),
            Self::UnknownDataId => (Error, "Unknown data id {}"),
            Self::UnknownParamId => (Error, "Unknown param id {}"),
            Self::PduMissed => (Error, "{} PDU(s) missed, expected sequence id {}"),
            Self::OldPduReceived => (Error, "Outdated PDU with sequence id {} received"),
            Self::InvalidLength => (Error, "Invalid length {} of {}, expected {}"),
            Self::OnlyNrt => (Error, "{} is only allowed in NRT op mode"),
            Self::PduNotAllowed => (Error, "{} is not allowed in state {}"),
            Self::DataNotAllowed => (Error, "Data PDUs are not allowed in state {}"),
            Self::InvalidStateId => (Error, "State id {} does not match state {}"),
            Self::InvalidUuid => (Error, "UUID {} does not match the slave"),
            Self::InvalidOpMode => (Error, "Op mode {} is not supported"),
            Self::InvalidMajorVersion => (Error, "DCP major version {} is not supported"),
            Self::InvalidMinorVersion => (Error, "DCP minor version {} is not supported"),
            Self::IncompleteConfiguration => (Error, "Incomplete configuration: {}"),
            Self::InvalidStartTime => (Error, "Start time {} lies in the past"),
            Self::InvalidSteps => (Error, "{} steps are not supported"),
            Self::NotSupportedVariableSteps => (Error, "Steps must stay at {}, got {}"),
            Self::InvalidLogCategory => (Error, "Unknown log category {}"),
            Self::InvalidLogLevel => (Error, "Invalid log level {}"),
            Self::InvalidLogMode => (Error, "Invalid log mode {}"),
            Self::NotSupportedLogOnRequest => (Error, "Logging on request is not supported"),
            Self::NotSupportedLogOnNotification => {
                (Error, "Logging on notification is not supported")
            }
            Self::InvalidScope => (Error, "Invalid scope {}"),
            Self::FixedTimeResolution => (Error, "Time resolution is fixed"),
            Self::InvalidTimeResolution => (Error, "Time resolution {}/{} is not supported"),
            Self::InvalidValueReference => (Error, "Value reference {} is not a valid {}"),
            Self::InvalidSourceDataType => (Error, "Source type {} cannot be cast to {}"),
            Self::InvalidPort => (Error, "Port {} is not supported"),
            Self::InvalidTransportProtocol => (Error, "Transport protocol {} is not supported"),
            Self::StepOverrun => (Warning, "Step took {} us, period is {} us"),
            Self::ShapeTooLarge => (Error, "Value {} cannot take {} as its size, limit is {} elements"),
        };
        LogTemplate {
            id: self as u8,
            category: SLAVE_LOG_CATEGORY,
            level,
            message,
        }
    }
}

/// One argument of a log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogArg {
    /// 8-bit unsigned.
    U8(u8),
    /// 16-bit unsigned.
    U16(u16),
    /// 32-bit unsigned.
    U32(u32),
    /// 64-bit unsigned.
    U64(u64),
    /// 64-bit signed.
    I64(i64),
    /// Text, length prefixed on the wire.
    Str(String),
}

impl LogArg {
    fn serialize(&self, out: &mut Vec<u8>) {
        match self {
            Self::U8(v) => out.push(*v),
            Self::U16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::U32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::U64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::I64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Str(s) => {
                out.extend_from_slice(&u32::try_from(s.len()).unwrap_or(u32::MAX).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
        }
    }
}

impl fmt::Display for LogArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::U8(v) => write!(f, "{v}"),
            Self::U16(v) => write!(f, "{v}"),
            Self::U32(v) => write!(f, "{v}"),
            Self::U64(v) => write!(f, "{v}"),
            Self::I64(v) => write!(f, "{v}"),
            Self::Str(s) => f.write_str(s),
        }
    }
}

macro_rules! impl_log_arg_from {
    ($($t:ty => $variant:ident),* $(,)?) => {$(
        impl From<$t> for LogArg {
            fn from(v: $t) -> Self {
                Self::$variant(v)
            }
        }
    )*};
}

impl_log_arg_from!(u8 => U8, u16 => U16, u32 => U32, u64 => U64, i64 => I64, String => Str);

impl From<&str> for LogArg {
    fn from(v: &str) -> Self {
        Self::Str(v.to_owned())
    }
}

/// Serialized log entry as carried by `NTF_log` and `RSP_log_ack`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Unix time in seconds.
    pub time: i64,
    /// Template id.
    pub template_id: u8,
    /// Serialized arguments.
    pub args: Vec<u8>,
}

impl LogEntry {
    /// Build an entry for `template` stamped with the current time.
    #[must_use]
    pub fn new(template: &LogTemplate, args: &[LogArg]) -> Self {
        let mut payload = Vec::new();
        for arg in args {
            arg.serialize(&mut payload);
        }
        Self {
            time: unix_time(),
            template_id: template.id,
            args: payload,
        }
    }

    /// Bytes this entry occupies in an `RSP_log_ack`.
    #[must_use]
    pub fn serialized_len(&self) -> usize {
        LOG_ENTRY_HEADER_SIZE + self.args.len()
    }

    /// Append `time | template_id | args`.
    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.time.to_le_bytes());
        out.push(self.template_id);
        out.extend_from_slice(&self.args);
    }
}

/// Current Unix time in seconds.
#[must_use]
pub fn unix_time() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

/// Routing table and on-request buffers.
#[derive(Debug, Clone)]
pub struct LogRouter {
    routes: HashMap<(u8, LogLevel), LogMode>,
    buffers: HashMap<u8, VecDeque<LogEntry>>,
    capacity: usize,
}

impl LogRouter {
    /// Create a router keeping at most `capacity` entries per category.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            routes: HashMap::new(),
            buffers: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Route `category` at exactly `level` to `mode`. Category 0 applies
    /// to every category.
    pub fn set_route(&mut self, category: u8, level: LogLevel, mode: LogMode) {
        if category == 0 {
            for c in 1..=u8::MAX {
                self.routes.insert((c, level), mode);
            }
        } else {
            self.routes.insert((category, level), mode);
        }
    }

    /// Where entries of `category` and `level` go, if anywhere.
    #[must_use]
    pub fn route(&self, category: u8, level: LogLevel) -> Option<LogMode> {
        self.routes.get(&(category, level)).copied()
    }

    /// Buffer an entry for `INF_log`, dropping the oldest beyond capacity.
    pub fn buffer(&mut self, category: u8, entry: LogEntry) {
        let queue = self.buffers.entry(category).or_default();
        if queue.len() >= self.capacity {
            queue.pop_front();
        }
        queue.push_back(entry);
    }

    /// Entries waiting in `category`.
    #[must_use]
    pub fn buffered(&self, category: u8) -> usize {
        self.buffers.get(&category).map_or(0, VecDeque::len)
    }

    /// Remove up to `max_num` of the oldest entries of `category` that fit
    /// into `budget` bytes and return them serialized back to back.
    pub fn drain(&mut self, category: u8, max_num: u8, budget: usize) -> Vec<u8> {
        let mut payload = Vec::new();
        let Some(queue) = self.buffers.get_mut(&category) else {
            return payload;
        };
        for _ in 0..max_num {
            match queue.front() {
                Some(entry) if payload.len() + entry.serialized_len() <= budget => {
                    entry.serialize(&mut payload);
                    queue.pop_front();
                }
                _ => break,
            }
        }
        payload
    }

    /// Forget routes and buffered entries.
    pub fn clear(&mut self) {
        self.routes.clear();
        self.buffers.clear();
    }
}
