#![doc = "DCP slave protocol engine: PDU validation, state machine, values, phases, heartbeat and logging."]

pub mod cast;
pub mod description;
pub mod driver;
pub mod heartbeat;
pub mod log;
pub mod phases;
pub mod realtime;
pub mod sequence;
pub mod slave;
pub mod tables;
pub mod validator;
pub mod value;

pub use cast::cast_allowed;
pub use description::*;
pub use driver::*;
pub use heartbeat::HeartbeatMonitor;
pub use log::*;
pub use phases::*;
pub use realtime::*;
pub use sequence::*;
pub use slave::*;
pub use tables::*;
pub use validator::{Validation, Validator, Verdict};
pub use value::*;
