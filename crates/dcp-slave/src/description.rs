//! Static slave capability description.
//!
//! The description declares what a slave can do (op modes, time
//! resolutions, transports, variables, log templates). It is loaded once
//! and never changes while the slave runs. Every check the validator makes
//! against the master's requests goes through the query methods here.

use crate::log::SLAVE_LOG_CATEGORY;
use dcp_common::{DataType, LogLevel, OpMode, SlaveError, SlaveResult, TransportProtocol};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

/// Complete description of a slave.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveDescription {
    /// Supported DCP major version.
    pub dcp_major_version: u8,
    /// Supported DCP minor version.
    pub dcp_minor_version: u8,
    /// Human readable slave name.
    pub dcp_slave_name: String,
    /// Identity checked at registration.
    pub uuid: Uuid,
    /// Supported op modes.
    #[serde(default)]
    pub op_mode: OpModeSupport,
    /// Supported time resolutions.
    #[serde(default)]
    pub time_res: TimeResSupport,
    /// Heartbeat interval the master must respect, if supervised.
    #[serde(default)]
    pub heartbeat: Option<Heartbeat>,
    /// Optional behaviour switches.
    #[serde(default)]
    pub capability_flags: CapabilityFlags,
    /// Transports and their advertised endpoints.
    #[serde(default)]
    pub transport_protocols: TransportProtocols,
    /// Declared variables.
    #[serde(default)]
    pub variables: Vec<Variable>,
    /// Log categories and templates, if the slave supports DCP logging.
    #[serde(default)]
    pub log: Option<LogDescription>,
}

/// Supported op modes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OpModeSupport {
    /// Hard real-time.
    pub hard_real_time: bool,
    /// Soft real-time.
    pub soft_real_time: bool,
    /// Non-real-time with its step limits.
    pub non_real_time: Option<StepRange>,
}

/// Legal step counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepRange {
    /// Steps used unless the master configures others.
    pub default_steps: u32,
    /// Only `default_steps` is accepted.
    pub fixed_steps: bool,
    /// Smallest accepted count.
    pub min_steps: u32,
    /// Largest accepted count.
    pub max_steps: u32,
    /// When non-empty, only these counts are accepted.
    pub values: Vec<u32>,
}

impl Default for StepRange {
    fn default() -> Self {
        Self {
            default_steps: 1,
            fixed_steps: false,
            min_steps: 1,
            max_steps: u32::MAX,
            values: Vec::new(),
        }
    }
}

impl StepRange {
    /// Returns true if `steps` is an accepted count.
    #[must_use]
    pub fn supports(&self, steps: u32) -> bool {
        if self.fixed_steps {
            steps == self.default_steps
        } else if !self.values.is_empty() {
            self.values.contains(&steps)
        } else {
            (self.min_steps..=self.max_steps).contains(&steps)
        }
    }
}

/// Supported time resolutions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeResSupport {
    /// Discrete resolutions.
    pub resolutions: Vec<Resolution>,
    /// Resolution ranges `numerator_from..=numerator_to / denominator`.
    pub ranges: Vec<ResolutionRange>,
}

/// A discrete resolution of `numerator / denominator` seconds per step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    /// Numerator.
    pub numerator: u32,
    /// Denominator.
    pub denominator: u32,
    /// The slave only runs at this resolution.
    #[serde(default)]
    pub fixed: bool,
    /// Used until the master sets another one.
    #[serde(default)]
    pub recommended: bool,
}

/// A range of resolutions sharing one denominator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionRange {
    /// Smallest numerator.
    pub numerator_from: u32,
    /// Largest numerator.
    pub numerator_to: u32,
    /// Denominator.
    pub denominator: u32,
}

/// Maximum time between two `INF_state` requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Interval numerator in seconds.
    pub numerator: u32,
    /// Interval denominator.
    pub denominator: u32,
}

impl Heartbeat {
    /// Interval as a duration.
    #[must_use]
    pub fn interval(&self) -> Duration {
        fraction_to_duration(self.numerator, self.denominator)
    }
}

/// Optional behaviour switches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
#[allow(clippy::struct_excessive_bools)]
pub struct CapabilityFlags {
    /// Configuration PDUs are accepted.
    pub can_accept_config_pdus: bool,
    /// `STC_reset` is handled.
    pub can_handle_reset: bool,
    /// `STC_do_step` may change the step count between calls.
    pub can_handle_variable_steps: bool,
    /// The slave supervises the master's heartbeat.
    pub can_monitor_heartbeat: bool,
    /// Logs can be buffered for `INF_log`.
    pub can_provide_log_on_request: bool,
    /// Logs can be pushed as `NTF_log`.
    pub can_provide_log_on_notification: bool,
}

/// Transports offered by the slave.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportProtocols {
    /// UDP over IPv4.
    pub udp_ipv4: Option<Ethernet>,
    /// TCP over IPv4.
    pub tcp_ipv4: Option<Ethernet>,
    /// CAN bus.
    pub can: bool,
    /// USB.
    pub usb: bool,
    /// Bluetooth.
    pub bluetooth: bool,
}

/// Endpoints of an Ethernet transport.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Ethernet {
    /// Largest PDU the slave accepts on this transport.
    pub max_pdu_size: u32,
    /// Control channel endpoint.
    pub control: Option<Endpoint>,
    /// Ports for `DAT_input_output`.
    pub dat_input_output: PortSet,
    /// Ports for `DAT_parameter`.
    pub dat_parameter: PortSet,
}

/// A host and port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host name or address.
    pub host: String,
    /// Port.
    pub port: u16,
}

/// Ports a data channel may be bound to.
///
/// An empty set places no restriction on the port.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PortSet {
    /// Host the ports belong to.
    pub host: Option<String>,
    /// Individual ports.
    pub ports: Vec<u16>,
    /// Inclusive port ranges.
    pub port_ranges: Vec<PortRange>,
}

impl PortSet {
    /// Returns true if `port` may be used.
    #[must_use]
    pub fn supports(&self, port: u16) -> bool {
        if self.ports.is_empty() && self.port_ranges.is_empty() {
            return true;
        }
        self.ports.contains(&port)
            || self
                .port_ranges
                .iter()
                .any(|range| (range.from..=range.to).contains(&port))
    }
}

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    /// First port.
    pub from: u16,
    /// Last port.
    pub to: u16,
}

/// Data channel kind used for port lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataChannel {
    /// `DAT_input_output`.
    InputOutput,
    /// `DAT_parameter`.
    Parameter,
}

/// One declared variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variable {
    /// Name.
    pub name: String,
    /// Value reference.
    pub value_reference: u64,
    /// Role of the variable.
    pub causality: Causality,
    /// Declared type.
    pub data_type: DataType,
    /// Array shape; empty means scalar.
    #[serde(default)]
    pub dimensions: Vec<Dimension>,
    /// Start value.
    #[serde(default)]
    pub start: Option<StartValue>,
    /// Capacity of string and binary values.
    #[serde(default)]
    pub max_size: Option<u32>,
    /// Step limits of an output.
    #[serde(default)]
    pub steps: Option<StepRange>,
}

/// Role of a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Causality {
    /// Written by the master through `DAT_input_output`.
    Input,
    /// Sent by the slave through `DAT_input_output`.
    Output,
    /// Tunable parameter.
    Parameter,
    /// Unsigned parameter defining array dimensions of other variables.
    StructuralParameter,
}

/// One array dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    /// Fixed length.
    Constant(u64),
    /// Length read from a structural parameter.
    LinkedVr(u64),
}

/// Start value of a variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StartValue {
    /// One integer, broadcast to every element.
    Integer(i64),
    /// One float, broadcast to every element.
    Float(f64),
    /// Text for string variables, bytes for binary ones.
    Text(String),
    /// One integer per element.
    Integers(Vec<i64>),
    /// One float per element.
    Floats(Vec<f64>),
}

/// Log categories and templates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogDescription {
    /// Categories.
    pub categories: Vec<LogCategory>,
    /// Templates.
    pub templates: Vec<LogTemplateDescription>,
}

/// A log category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogCategory {
    /// Category id.
    pub id: u8,
    /// Name.
    pub name: String,
}

/// A log template declared by the slave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogTemplateDescription {
    /// Template id.
    pub id: u8,
    /// Category id.
    pub category: u8,
    /// Level.
    pub level: LogLevel,
    /// Message with `%` placeholders.
    pub msg: String,
}

impl SlaveDescription {
    /// Load a description from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`SlaveError::Io`] if the file cannot be read and
    /// [`SlaveError::Description`] if it is malformed or inconsistent.
    pub fn from_file(path: &Path) -> SlaveResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SlaveError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    /// Parse and validate a description from TOML.
    ///
    /// # Errors
    ///
    /// Returns [`SlaveError::Description`] if the TOML is malformed or the
    /// description is inconsistent.
    pub fn from_toml(content: &str) -> SlaveResult<Self> {
        let description: Self =
            toml::from_str(content).map_err(|e| SlaveError::Description(e.to_string()))?;
        description.validate()?;
        Ok(description)
    }

    /// Check internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`SlaveError::Description`] naming the first inconsistency.
    pub fn validate(&self) -> SlaveResult<()> {
        let invalid = |msg: String| Err(SlaveError::Description(msg));

        let mut seen = HashSet::new();
        for var in &self.variables {
            if !seen.insert(var.value_reference) {
                return invalid(format!("duplicate value reference {}", var.value_reference));
            }
        }
        for var in &self.variables {
            if var.causality == Causality::StructuralParameter {
                if !var.data_type.is_unsigned() {
                    return invalid(format!(
                        "structural parameter {} must be unsigned, is {}",
                        var.name, var.data_type
                    ));
                }
                if !var.dimensions.is_empty() {
                    return invalid(format!("structural parameter {} must be scalar", var.name));
                }
            }
            for dim in &var.dimensions {
                if let Dimension::LinkedVr(vr) = dim {
                    if !self.structural_parameter_exists(*vr) {
                        return invalid(format!(
                            "{} links dimension to {vr}, which is not a structural parameter",
                            var.name
                        ));
                    }
                }
            }
            if let Some(steps) = &var.steps {
                if steps.min_steps > steps.max_steps {
                    return invalid(format!("{} has min_steps > max_steps", var.name));
                }
            }
        }
        if self
            .time_res
            .resolutions
            .iter()
            .any(|r| r.denominator == 0)
            || self.time_res.ranges.iter().any(|r| r.denominator == 0)
        {
            return invalid("time resolution with zero denominator".into());
        }
        if let Some(hb) = &self.heartbeat {
            if hb.denominator == 0 || hb.numerator == 0 {
                return invalid("heartbeat interval must be positive".into());
            }
        }
        Ok(())
    }

    /// Variable with value reference `vr`.
    #[must_use]
    pub fn variable(&self, vr: u64) -> Option<&Variable> {
        self.variables.iter().find(|v| v.value_reference == vr)
    }

    /// Declared data type of `vr`.
    #[must_use]
    pub fn data_type(&self, vr: u64) -> Option<DataType> {
        self.variable(vr).map(|v| v.data_type)
    }

    fn has_causality(&self, vr: u64, causality: Causality) -> bool {
        self.variable(vr).is_some_and(|v| v.causality == causality)
    }

    /// `vr` is an input.
    #[must_use]
    pub fn input_exists(&self, vr: u64) -> bool {
        self.has_causality(vr, Causality::Input)
    }

    /// `vr` is an output.
    #[must_use]
    pub fn output_exists(&self, vr: u64) -> bool {
        self.has_causality(vr, Causality::Output)
    }

    /// `vr` is a parameter, structural or not.
    #[must_use]
    pub fn parameter_exists(&self, vr: u64) -> bool {
        self.has_causality(vr, Causality::Parameter)
            || self.has_causality(vr, Causality::StructuralParameter)
    }

    /// `vr` is a structural parameter.
    #[must_use]
    pub fn structural_parameter_exists(&self, vr: u64) -> bool {
        self.has_causality(vr, Causality::StructuralParameter)
    }

    /// The slave can run in `mode`.
    #[must_use]
    pub fn is_op_mode_supported(&self, mode: OpMode) -> bool {
        match mode {
            OpMode::Hrt => self.op_mode.hard_real_time,
            OpMode::Srt => self.op_mode.soft_real_time,
            OpMode::Nrt => self.op_mode.non_real_time.is_some(),
        }
    }

    /// `numerator / denominator` is a declared resolution or inside a range.
    #[must_use]
    pub fn is_time_resolution_supported(&self, numerator: u32, denominator: u32) -> bool {
        self.time_res
            .resolutions
            .iter()
            .any(|r| r.numerator == numerator && r.denominator == denominator)
            || self.time_res.ranges.iter().any(|r| {
                r.denominator == denominator
                    && (r.numerator_from..=r.numerator_to).contains(&numerator)
            })
    }

    /// The first fixed resolution, if any.
    #[must_use]
    pub fn fixed_time_resolution(&self) -> Option<Resolution> {
        self.time_res.resolutions.iter().copied().find(|r| r.fixed)
    }

    /// The first recommended resolution, if any.
    #[must_use]
    pub fn recommended_time_resolution(&self) -> Option<Resolution> {
        self.time_res
            .resolutions
            .iter()
            .copied()
            .find(|r| r.recommended)
    }

    /// Output `vr` may be sent every `steps` steps. Outputs without declared
    /// limits accept any positive count.
    #[must_use]
    pub fn is_steps_supported(&self, vr: u64, steps: u32) -> bool {
        match self.variable(vr) {
            Some(var) if var.causality == Causality::Output => var
                .steps
                .as_ref()
                .map_or(steps > 0, |range| range.supports(steps)),
            _ => false,
        }
    }

    /// `STC_do_step` may request `steps` in NRT mode.
    #[must_use]
    pub fn is_steps_supported_nrt(&self, steps: u32) -> bool {
        self.op_mode
            .non_real_time
            .as_ref()
            .is_some_and(|range| range.supports(steps))
    }

    /// The slave offers `protocol`.
    #[must_use]
    pub fn is_transport_protocol_supported(&self, protocol: TransportProtocol) -> bool {
        let tp = &self.transport_protocols;
        match protocol {
            TransportProtocol::UdpIpv4 => tp.udp_ipv4.is_some(),
            TransportProtocol::TcpIpv4 => tp.tcp_ipv4.is_some(),
            TransportProtocol::Can => tp.can,
            TransportProtocol::Usb => tp.usb,
            TransportProtocol::Bluetooth => tp.bluetooth,
        }
    }

    /// `port` is advertised for `channel` on an Ethernet `protocol`.
    #[must_use]
    pub fn is_port_supported(
        &self,
        protocol: TransportProtocol,
        channel: DataChannel,
        port: u16,
    ) -> bool {
        let ethernet = match protocol {
            TransportProtocol::UdpIpv4 => self.transport_protocols.udp_ipv4.as_ref(),
            TransportProtocol::TcpIpv4 => self.transport_protocols.tcp_ipv4.as_ref(),
            _ => None,
        };
        ethernet.is_some_and(|eth| match channel {
            DataChannel::InputOutput => eth.dat_input_output.supports(port),
            DataChannel::Parameter => eth.dat_parameter.supports(port),
        })
    }

    /// UDP port for `DAT_input_output`.
    #[must_use]
    pub fn is_udp_port_supported_for_input_output(&self, port: u16) -> bool {
        self.is_port_supported(TransportProtocol::UdpIpv4, DataChannel::InputOutput, port)
    }

    /// UDP port for `DAT_parameter`.
    #[must_use]
    pub fn is_udp_port_supported_for_parameter(&self, port: u16) -> bool {
        self.is_port_supported(TransportProtocol::UdpIpv4, DataChannel::Parameter, port)
    }

    /// TCP port for `DAT_input_output`.
    #[must_use]
    pub fn is_tcp_port_supported_for_input_output(&self, port: u16) -> bool {
        self.is_port_supported(TransportProtocol::TcpIpv4, DataChannel::InputOutput, port)
    }

    /// TCP port for `DAT_parameter`.
    #[must_use]
    pub fn is_tcp_port_supported_for_parameter(&self, port: u16) -> bool {
        self.is_port_supported(TransportProtocol::TcpIpv4, DataChannel::Parameter, port)
    }

    /// The slave declares log category `id`. The library category exists
    /// whenever the slave has a log section.
    #[must_use]
    pub fn log_category_exists(&self, id: u8) -> bool {
        self.log.as_ref().is_some_and(|log| {
            id == SLAVE_LOG_CATEGORY || log.categories.iter().any(|c| c.id == id)
        })
    }

    /// The slave supports DCP logging at all.
    #[must_use]
    pub fn supports_logging(&self) -> bool {
        self.log.is_some()
            && (self.capability_flags.can_provide_log_on_request
                || self.capability_flags.can_provide_log_on_notification)
    }

    /// Heartbeat interval when the slave supervises the master.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        if !self.capability_flags.can_monitor_heartbeat {
            return None;
        }
        self.heartbeat.as_ref().map(Heartbeat::interval)
    }
}

/// `numerator / denominator` seconds as a duration.
#[must_use]
pub fn fraction_to_duration(numerator: u32, denominator: u32) -> Duration {
    if denominator == 0 {
        return Duration::ZERO;
    }
    let nanos = u128::from(numerator) * 1_000_000_000 / u128::from(denominator);
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}
