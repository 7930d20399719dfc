//! Checks every received PDU before it is dispatched.
//!
//! The checks run in a fixed order. Structural problems (unknown type,
//! wrong receiver, unknown data id, outdated sequence number, bad data
//! length, oversized structural parameter) drop the PDU silently. Data
//! PDUs consume their sequence id only once they passed every other check. Everything else is answered: the first
//! semantic error wins and is sent back as `RSP_nack`, while every
//! violation found on the way is logged.

use crate::cast::cast_allowed;
use crate::description::{DataChannel, SlaveDescription};
use crate::log::{LogArg, LogEvent};
use crate::sequence::{Channel, SequenceCheck, SequenceTracker};
use crate::tables::{ConfigurationTables, InputEntry, TimeResolution};
use crate::value::{ValueError, ValueStore, STRING_LENGTH_PREFIX};
use dcp_codec::{PduBody, PduFields, PduView};
use dcp_common::{
    DataType, DcpError, DcpState, LogLevel, LogMode, OpMode, PduType, Scope, TransportProtocol,
};
use uuid::Uuid;

/// Fixed part of `DAT_input_output` and `DAT_parameter`.
const DATA_HEADER_SIZE: usize = 5;
/// Fixed part of `CFG_set_parameter`.
const SET_PARAMETER_HEADER_SIZE: usize = 13;

/// What to do with a received PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Ignore without answering.
    Drop,
    /// Dispatch. `ack` is false for PDUs answered by their own response
    /// (`INF_state`, `INF_error`, `INF_log`) and for data PDUs.
    Accept {
        /// Send `RSP_ack` before dispatching.
        ack: bool,
    },
    /// Answer with `RSP_nack`.
    Reject {
        /// First error found.
        error: DcpError,
        /// Sender id of the nack.
        sender: u8,
    },
}

/// Result of a check.
#[derive(Debug, Clone, PartialEq)]
pub struct Validation {
    /// Decision.
    pub verdict: Verdict,
    /// Violations found, in detection order.
    pub logs: Vec<(LogEvent, Vec<LogArg>)>,
    /// Channels on which PDUs were lost.
    pub missed: Vec<Channel>,
}

/// Snapshot of the slave needed to judge one PDU.
#[derive(Debug)]
pub struct Validator<'a> {
    /// Capabilities of the slave.
    pub description: &'a SlaveDescription,
    /// Current values, used for data lengths.
    pub values: &'a ValueStore,
    /// Configuration received so far.
    pub tables: &'a ConfigurationTables,
    /// Sequence tracking, if enabled.
    pub sequence: Option<&'a mut SequenceTracker>,
    /// Current state.
    pub state: DcpState,
    /// Id assigned at registration.
    pub dcp_id: u8,
    /// Op mode chosen at registration.
    pub op_mode: Option<OpMode>,
    /// Time resolution in effect.
    pub time_resolution: TimeResolution,
    /// NRT step count pinned by the first `STC_do_step` when the slave
    /// cannot handle variable steps.
    pub fixed_nrt_steps: Option<u32>,
    /// Current Unix time in seconds, for start time checks.
    pub now: i64,
}

#[derive(Default)]
struct Report {
    logs: Vec<(LogEvent, Vec<LogArg>)>,
    missed: Vec<Channel>,
    error: Option<DcpError>,
}

impl Report {
    fn log(&mut self, event: LogEvent, args: Vec<LogArg>) {
        self.logs.push((event, args));
    }

    /// Log `event` and keep `error` unless an earlier one was found.
    fn fail(&mut self, error: DcpError, event: LogEvent, args: Vec<LogArg>) {
        self.log(event, args);
        self.error.get_or_insert(error);
    }

    fn failed(&self) -> bool {
        self.error.is_some()
    }
}

impl Validator<'_> {
    /// Run all checks on `pdu`.
    pub fn check(&mut self, pdu: &PduView<'_>) -> Validation {
        let mut report = Report::default();
        let verdict = self.run(pdu, &mut report);
        Validation {
            verdict,
            logs: report.logs,
            missed: report.missed,
        }
    }

    fn run(&mut self, pdu: &PduView<'_>, report: &mut Report) -> Verdict {
        let Some(pdu_type) = pdu.pdu_type().filter(|t| t.is_master_to_slave()) else {
            report.log(LogEvent::InvalidTypeId, vec![pdu.type_id().into()]);
            return Verdict::Drop;
        };
        let body = pdu.body();

        if !self.check_receiver(body, report) {
            return Verdict::Drop;
        }
        if !pdu_type.is_data() && !self.check_sequence(pdu_type, body, report) {
            return Verdict::Drop;
        }

        if pdu_type == PduType::StcDoStep && self.op_mode != Some(OpMode::Nrt) {
            report.fail(
                DcpError::NotSupportedPdu,
                LogEvent::OnlyNrt,
                vec![pdu_type.name().into()],
            );
        }

        if !report.failed()
            && matches!(pdu_type, PduType::CfgLogging | PduType::InfLog)
            && !self.description.supports_logging()
        {
            report.error = Some(DcpError::NotSupportedPdu);
        }

        if !report.failed() && !self.check_length(pdu, report) {
            return Verdict::Drop;
        }

        if !report.failed() {
            if pdu_type.is_data() {
                if !self.state.is_pdu_allowed(pdu_type) {
                    report.log(LogEvent::DataNotAllowed, vec![self.state.to_string().into()]);
                    return Verdict::Drop;
                }
                if !self.check_data_shapes(body, report) {
                    return Verdict::Drop;
                }
                if !self.check_sequence(pdu_type, body, report) {
                    return Verdict::Drop;
                }
                return Verdict::Accept { ack: false };
            }
            if !self.state.is_pdu_allowed(pdu_type) {
                report.fail(
                    DcpError::ProtocolErrorPduNotAllowedInThisState,
                    LogEvent::PduNotAllowed,
                    vec![pdu_type.name().into(), self.state.to_string().into()],
                );
            }
        }

        if !report.failed() {
            if let Some(state_id) = body.state_id() {
                if state_id != self.state.as_u8() {
                    report.fail(
                        DcpError::InvalidStateId,
                        LogEvent::InvalidStateId,
                        vec![state_id.into(), self.state.to_string().into()],
                    );
                }
            }
        }

        if !report.failed() && matches!(pdu_type, PduType::InfState | PduType::InfError) {
            return Verdict::Accept { ack: false };
        }

        if !report.failed() {
            self.check_semantics(body, report);
        }

        match report.error {
            None if pdu_type == PduType::InfLog => Verdict::Accept { ack: false },
            None => Verdict::Accept { ack: true },
            Some(error) => Verdict::Reject {
                error,
                sender: self.response_sender(pdu_type, body),
            },
        }
    }

    /// Sender id used when answering `pdu`: before registration the slave
    /// answers with the id the master addressed it by.
    #[must_use]
    pub fn response_sender(&self, pdu_type: PduType, body: &PduBody<'_>) -> u8 {
        if pdu_type == PduType::StcRegister || self.state == DcpState::Alive {
            body.receiver().unwrap_or(self.dcp_id)
        } else {
            self.dcp_id
        }
    }

    fn check_receiver(&self, body: &PduBody<'_>, report: &mut Report) -> bool {
        match *body {
            PduBody::DatInputOutput { data_id, .. } => {
                if self.tables.inputs.contains_key(&data_id) {
                    return true;
                }
                report.log(LogEvent::UnknownDataId, vec![data_id.into()]);
                false
            }
            PduBody::DatParameter { param_id, .. } => {
                if self.tables.parameters.contains_key(&param_id) {
                    return true;
                }
                report.log(LogEvent::UnknownParamId, vec![param_id.into()]);
                false
            }
            _ => {
                let receiver = body.receiver().unwrap_or_default();
                if self.state == DcpState::Alive || receiver == self.dcp_id {
                    return true;
                }
                report.log(
                    LogEvent::InvalidReceiver,
                    vec![receiver.into(), self.dcp_id.into()],
                );
                false
            }
        }
    }

    fn check_sequence(&mut self, pdu_type: PduType, body: &PduBody<'_>, report: &mut Report) -> bool {
        let Some(tracker) = self.sequence.as_deref_mut() else {
            return true;
        };
        let Some(seq) = body.pdu_seq_id() else {
            return true;
        };
        let channel = match *body {
            PduBody::DatInputOutput { data_id, .. } => Channel::InputOutput(data_id),
            PduBody::DatParameter { param_id, .. } => Channel::Parameter(param_id),
            _ if self.state == DcpState::Alive || pdu_type == PduType::StcRegister => {
                return true;
            }
            _ => Channel::Control,
        };

        match tracker.check(channel, seq) {
            SequenceCheck::First | SequenceCheck::InOrder => true,
            SequenceCheck::Gap { expected, missing } => {
                report.log(LogEvent::PduMissed, vec![missing.into(), expected.into()]);
                report.missed.push(channel);
                true
            }
            SequenceCheck::Stale { .. } => {
                report.log(LogEvent::OldPduReceived, vec![seq.into()]);
                false
            }
        }
    }

    /// Returns false if the PDU must be dropped. Length errors of other
    /// PDUs are recorded in `report`.
    fn check_length(&self, pdu: &PduView<'_>, report: &mut Report) -> bool {
        let expected = match *pdu.body() {
            PduBody::DatInputOutput { data_id, payload, .. } => {
                let layout: Vec<InputEntry> = self.tables.input_layout(data_id).collect();
                let expected = data_length(&layout, self.values, payload);
                if expected == Some(pdu.len()) {
                    return true;
                }
                report.log(LogEvent::InvalidLength, length_args(pdu, expected));
                return false;
            }
            PduBody::DatParameter {
                param_id,
                configuration,
                ..
            } => {
                let layout: Vec<InputEntry> = self.tables.parameter_layout(param_id).collect();
                let expected = data_length(&layout, self.values, configuration);
                if expected == Some(pdu.len()) {
                    return true;
                }
                report.log(LogEvent::InvalidLength, length_args(pdu, expected));
                return false;
            }
            PduBody::SetParameter {
                parameter_vr,
                source_data_type,
                configuration,
                ..
            } => DataType::from_u8(source_data_type).and_then(|source_type| {
                let count = self.values.get(parameter_vr).map_or(1, |v| v.element_count());
                let entry_len = entry_length(source_type, count, configuration)?;
                Some(SET_PARAMETER_HEADER_SIZE + entry_len)
            }),
            _ => Some(pdu.correct_size()),
        };

        let correct = match (pdu.body(), expected) {
            (PduBody::SetParameter { .. }, Some(len)) => pdu.len() == len,
            _ => pdu.is_size_correct(),
        };
        if !correct {
            report.fail(
                DcpError::InvalidLength,
                LogEvent::InvalidLength,
                length_args(pdu, expected),
            );
        }
        true
    }

    fn check_semantics(&self, body: &PduBody<'_>, report: &mut Report) {
        let sd = self.description;
        match *body {
            PduBody::Register {
                slave_uuid,
                op_mode,
                major_version,
                minor_version,
                ..
            } => {
                let uuid = Uuid::from_bytes(slave_uuid);
                if uuid != sd.uuid {
                    report.fail(DcpError::InvalidUuid, LogEvent::InvalidUuid, vec![uuid.to_string().into()]);
                } else if !OpMode::from_u8(op_mode).is_some_and(|m| sd.is_op_mode_supported(m)) {
                    report.fail(DcpError::InvalidOpMode, LogEvent::InvalidOpMode, vec![op_mode.into()]);
                } else if major_version != sd.dcp_major_version {
                    report.fail(
                        DcpError::InvalidMajorVersion,
                        LogEvent::InvalidMajorVersion,
                        vec![major_version.into()],
                    );
                } else if minor_version != sd.dcp_minor_version {
                    report.fail(
                        DcpError::InvalidMinorVersion,
                        LogEvent::InvalidMinorVersion,
                        vec![minor_version.into()],
                    );
                }
            }
            PduBody::StateTransition {
                pdu_type: PduType::StcConfigure,
                ..
            } => {
                for incomplete in self.tables.completeness_errors(self.time_resolution.set) {
                    report.fail(
                        incomplete.error(),
                        LogEvent::IncompleteConfiguration,
                        vec![format!("{incomplete:?}").into()],
                    );
                }
            }
            PduBody::Run { start_time, .. } => {
                if self.op_mode != Some(OpMode::Nrt) && start_time > 0 && start_time < self.now {
                    report.fail(
                        DcpError::InvalidStartTime,
                        LogEvent::InvalidStartTime,
                        vec![start_time.into()],
                    );
                }
            }
            PduBody::DoStep { steps, .. } => {
                if !sd.is_steps_supported_nrt(steps) {
                    report.fail(DcpError::InvalidSteps, LogEvent::InvalidSteps, vec![steps.into()]);
                }
                if !sd.capability_flags.can_handle_variable_steps {
                    if let Some(fixed) = self.fixed_nrt_steps.filter(|&fixed| fixed != steps) {
                        report.fail(
                            DcpError::NotSupportedVariableSteps,
                            LogEvent::NotSupportedVariableSteps,
                            vec![fixed.into(), steps.into()],
                        );
                    }
                }
            }
            PduBody::InfLog { log_category, .. } => {
                if !sd.log_category_exists(log_category) {
                    report.fail(
                        DcpError::InvalidLogCategory,
                        LogEvent::InvalidLogCategory,
                        vec![log_category.into()],
                    );
                }
            }
            PduBody::TimeRes {
                numerator,
                denominator,
                ..
            } => {
                let res = self.time_resolution;
                if res.fixed && (res.numerator, res.denominator) != (numerator, denominator) {
                    report.fail(DcpError::InvalidTimeResolution, LogEvent::FixedTimeResolution, vec![]);
                }
                if !sd.is_time_resolution_supported(numerator, denominator) {
                    report.fail(
                        DcpError::InvalidTimeResolution,
                        LogEvent::InvalidTimeResolution,
                        vec![numerator.into(), denominator.into()],
                    );
                }
            }
            PduBody::Steps { steps, data_id, .. } => {
                if let Some(vr) = self
                    .tables
                    .output_layout(data_id)
                    .find(|&vr| !sd.is_steps_supported(vr, steps))
                {
                    report.fail(DcpError::InvalidSteps, LogEvent::InvalidSteps, vec![steps.into(), vr.into()]);
                }
            }
            PduBody::ConfigInput {
                target_vr,
                source_data_type,
                ..
            } => {
                if sd.input_exists(target_vr) {
                    self.check_cast(target_vr, source_data_type, report);
                } else {
                    report.fail(
                        DcpError::InvalidValueReference,
                        LogEvent::InvalidValueReference,
                        vec![target_vr.into(), "input".into()],
                    );
                }
            }
            PduBody::ConfigOutput {
                data_id, source_vr, ..
            } => {
                if !sd.output_exists(source_vr) {
                    report.fail(
                        DcpError::InvalidValueReference,
                        LogEvent::InvalidValueReference,
                        vec![source_vr.into(), "output".into()],
                    );
                } else if let Some(&steps) = self.tables.steps.get(&data_id) {
                    if !sd.is_steps_supported(source_vr, steps) {
                        report.fail(
                            DcpError::InvalidSteps,
                            LogEvent::InvalidSteps,
                            vec![steps.into(), source_vr.into()],
                        );
                    }
                }
            }
            PduBody::TunableParameter {
                parameter_vr,
                source_data_type,
                ..
            }
            | PduBody::SetParameter {
                parameter_vr,
                source_data_type,
                ..
            } => {
                if sd.parameter_exists(parameter_vr) {
                    self.check_cast(parameter_vr, source_data_type, report);
                    if let PduBody::SetParameter { configuration, .. } = *body {
                        if !report.failed() && self.values.is_structural(parameter_vr) {
                            let source = DataType::from_u8(source_data_type);
                            let checked = source.map(|source| {
                                self.values.check_update(parameter_vr, configuration, 0, source)
                            });
                            if let Some(Err(err @ ValueError::ShapeTooLarge { .. })) = checked {
                                report.fail(DcpError::InvalidPayload, LogEvent::ShapeTooLarge, shape_args(&err));
                            }
                        }
                    }
                } else {
                    report.fail(
                        DcpError::InvalidValueReference,
                        LogEvent::InvalidValueReference,
                        vec![parameter_vr.into(), "parameter".into()],
                    );
                }
            }
            PduBody::NetworkInformation {
                transport_protocol, ..
            } => {
                self.check_transport(transport_protocol, report);
            }
            PduBody::NetworkInformationEthernet {
                pdu_type,
                transport_protocol,
                port,
                ..
            } => {
                let Some(protocol) = self.check_transport(transport_protocol, report) else {
                    return;
                };
                let channel = match pdu_type {
                    PduType::CfgSourceNetworkInformation => DataChannel::InputOutput,
                    PduType::CfgParamNetworkInformation => DataChannel::Parameter,
                    _ => return,
                };
                if !sd.is_port_supported(protocol, channel, port) {
                    report.fail(DcpError::InvalidNetworkInformation, LogEvent::InvalidPort, vec![port.into()]);
                }
            }
            PduBody::Logging {
                log_category,
                log_level,
                log_mode,
                ..
            } => {
                let flags = &sd.capability_flags;
                match LogMode::from_u8(log_mode) {
                    Some(LogMode::OnRequest) if !flags.can_provide_log_on_request => report.fail(
                        DcpError::NotSupportedLogOnRequest,
                        LogEvent::NotSupportedLogOnRequest,
                        vec![],
                    ),
                    Some(LogMode::OnNotification) if !flags.can_provide_log_on_notification => {
                        report.fail(
                            DcpError::NotSupportedLogOnNotification,
                            LogEvent::NotSupportedLogOnNotification,
                            vec![],
                        );
                    }
                    _ => {}
                }
                if log_category != 0 && !sd.log_category_exists(log_category) {
                    report.fail(
                        DcpError::InvalidLogCategory,
                        LogEvent::InvalidLogCategory,
                        vec![log_category.into()],
                    );
                }
                if LogLevel::from_u8(log_level).is_none() {
                    report.fail(DcpError::InvalidLogLevel, LogEvent::InvalidLogLevel, vec![log_level.into()]);
                }
                if LogMode::from_u8(log_mode).is_none() {
                    report.fail(DcpError::InvalidLogMode, LogEvent::InvalidLogMode, vec![log_mode.into()]);
                }
            }
            PduBody::Scope { scope, .. } => {
                if Scope::from_u8(scope).is_none() {
                    report.fail(DcpError::InvalidScope, LogEvent::InvalidScope, vec![scope.into()]);
                }
            }
            _ => {}
        }
    }

    /// Returns false if a `DAT_parameter` would give a value more elements
    /// than the store allows.
    fn check_data_shapes(&self, body: &PduBody<'_>, report: &mut Report) -> bool {
        let PduBody::DatParameter {
            param_id,
            configuration,
            ..
        } = *body
        else {
            return true;
        };
        let mut offset = 0usize;
        for entry in self.tables.parameter_layout(param_id) {
            let width = if self.values.is_structural(entry.vr) {
                match self.values.check_update(entry.vr, configuration, offset, entry.source_type) {
                    Ok(width) => Some(width),
                    Err(err @ ValueError::ShapeTooLarge { .. }) => {
                        report.log(LogEvent::ShapeTooLarge, shape_args(&err));
                        return false;
                    }
                    Err(_) => None,
                }
            } else {
                let count = self.values.get(entry.vr).map_or(0, |v| v.element_count());
                entry_length(entry.source_type, count, configuration.get(offset..).unwrap_or_default())
            };
            // later positions are judged again when the data is applied
            let Some(width) = width else {
                return true;
            };
            offset += width;
        }
        true
    }

    fn check_cast(&self, vr: u64, source_data_type: u8, report: &mut Report) {
        let declared = self.description.data_type(vr);
        let allowed = match (declared, DataType::from_u8(source_data_type)) {
            (Some(declared), Some(source)) => cast_allowed(declared, source),
            _ => false,
        };
        if !allowed {
            let declared = declared.map_or_else(String::new, |d| d.to_string());
            report.fail(
                DcpError::InvalidSourceDataType,
                LogEvent::InvalidSourceDataType,
                vec![source_data_type.into(), declared.into()],
            );
        }
    }

    fn check_transport(&self, raw: u8, report: &mut Report) -> Option<TransportProtocol> {
        let protocol = TransportProtocol::from_u8(raw)
            .filter(|&p| self.description.is_transport_protocol_supported(p));
        if protocol.is_none() {
            report.fail(
                DcpError::InvalidTransportProtocol,
                LogEvent::InvalidTransportProtocol,
                vec![raw.into()],
            );
        }
        protocol
    }
}

fn length_args(pdu: &PduView<'_>, expected: Option<usize>) -> Vec<LogArg> {
    let as_u32 = |n: usize| LogArg::U32(u32::try_from(n).unwrap_or(u32::MAX));
    vec![
        as_u32(pdu.len()),
        pdu.pdu_type().map_or("unknown", PduType::name).into(),
        expected.map_or_else(|| "?".into(), as_u32),
    ]
}

fn shape_args(err: &ValueError) -> Vec<LogArg> {
    let ValueError::ShapeTooLarge { vr, shape, max } = err else {
        return vec![err.to_string().into()];
    };
    let size = shape.iter().map(ToString::to_string).collect::<Vec<_>>().join("x");
    vec![(*vr).into(), size.into(), u64::try_from(*max).unwrap_or(u64::MAX).into()]
}

/// Wire width of one position holding `count` elements of `source_type`.
/// String and binary widths are read from the length prefix in `rest`.
fn entry_length(source_type: DataType, count: usize, rest: &[u8]) -> Option<usize> {
    match source_type.size() {
        Some(size) => Some(size * count),
        None => {
            let prefix = rest.get(..STRING_LENGTH_PREFIX)?;
            let len = u32::from_le_bytes(prefix.try_into().ok()?);
            Some(STRING_LENGTH_PREFIX + usize::try_from(len).ok()?)
        }
    }
}

/// Expected size of a data PDU whose payload follows `layout`, or `None`
/// if the payload cannot hold the length prefixes it announces.
#[must_use]
pub fn data_length(layout: &[InputEntry], values: &ValueStore, payload: &[u8]) -> Option<usize> {
    let mut offset = 0usize;
    for entry in layout {
        let count = values.get(entry.vr)?.element_count();
        offset += entry_length(entry.source_type, count, payload.get(offset..).unwrap_or_default())?;
    }
    Some(DATA_HEADER_SIZE + offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dcp_codec::OwnedPdu;
    use dcp_common::ValueConfig;

    const DESCRIPTION: &str = r#"
        dcp_major_version = 1
        dcp_minor_version = 0
        dcp_slave_name = "validator"
        uuid = "6c1f3a2e-8d4b-4e71-9a0c-2b5d7e9f1a33"

        [op_mode]
        soft_real_time = true

        [op_mode.non_real_time]
        values = [1, 10]

        [[time_res.resolutions]]
        numerator = 1
        denominator = 100

        [capability_flags]
        can_provide_log_on_request = true

        [transport_protocols.udp_ipv4.dat_input_output]
        ports = [9000]

        [[variables]]
        name = "speed"
        value_reference = 1
        causality = "input"
        data_type = "uint16"

        [[variables]]
        name = "label"
        value_reference = 2
        causality = "input"
        data_type = "string"

        [[variables]]
        name = "torque"
        value_reference = 3
        causality = "output"
        data_type = "float64"

        [[variables]]
        name = "gains"
        value_reference = 4
        causality = "parameter"
        data_type = "float64"
        dimensions = [{ constant = 3 }]

        [[variables]]
        name = "channels"
        value_reference = 5
        causality = "structural_parameter"
        data_type = "uint16"
        start = 2

        [[variables]]
        name = "weights"
        value_reference = 6
        causality = "parameter"
        data_type = "float32"
        dimensions = [{ linked_vr = 5 }]

        [log]
        categories = [{ id = 1, name = "APP" }]
    "#;

    struct Fixture {
        description: SlaveDescription,
        values: ValueStore,
        tables: ConfigurationTables,
        sequence: SequenceTracker,
        state: DcpState,
        op_mode: Option<OpMode>,
        fixed_nrt_steps: Option<u32>,
        check_sequence: bool,
    }

    impl Fixture {
        fn new(state: DcpState) -> Self {
            let description = SlaveDescription::from_toml(DESCRIPTION).unwrap();
            let values = ValueStore::from_description(&description, &ValueConfig::default()).unwrap();
            Self {
                description,
                values,
                tables: ConfigurationTables::new(),
                sequence: SequenceTracker::new(),
                state,
                op_mode: Some(OpMode::Srt),
                fixed_nrt_steps: None,
                check_sequence: false,
            }
        }

        fn check(&mut self, body: &PduBody<'_>) -> Validation {
            let pdu = OwnedPdu::encode(body);
            self.check_bytes(pdu.as_bytes())
        }

        fn check_bytes(&mut self, bytes: &[u8]) -> Validation {
            let view = PduView::decode(bytes).unwrap();
            let mut validator = Validator {
                description: &self.description,
                values: &self.values,
                tables: &self.tables,
                sequence: self.check_sequence.then_some(&mut self.sequence),
                state: self.state,
                dcp_id: 7,
                op_mode: self.op_mode,
                time_resolution: TimeResolution::from_description(&self.description),
                fixed_nrt_steps: self.fixed_nrt_steps,
                now: 1_700_000_000,
            };
            validator.check(&view)
        }
    }

    fn basic(pdu_type: PduType, state: DcpState) -> PduBody<'static> {
        PduBody::StateTransition {
            pdu_type,
            pdu_seq_id: 1,
            receiver: 7,
            state_id: state.as_u8(),
        }
    }

    fn reject(error: DcpError) -> Verdict {
        Verdict::Reject { error, sender: 7 }
    }

    fn register(uuid: &str, op_mode: OpMode, major: u8) -> PduBody<'static> {
        PduBody::Register {
            pdu_seq_id: 0,
            receiver: 3,
            state_id: DcpState::Alive.as_u8(),
            slave_uuid: *Uuid::parse_str(uuid).unwrap().as_bytes(),
            op_mode: op_mode as u8,
            major_version: major,
            minor_version: 0,
        }
    }

    #[test]
    fn test_register_checks_in_order() {
        let mut fx = Fixture::new(DcpState::Alive);
        let good = "6c1f3a2e-8d4b-4e71-9a0c-2b5d7e9f1a33";
        assert_eq!(
            fx.check(&register(good, OpMode::Srt, 1)).verdict,
            Verdict::Accept { ack: true }
        );

        let wrong_uuid = fx.check(&register("00000000-0000-0000-0000-000000000001", OpMode::Hrt, 2));
        assert_eq!(
            wrong_uuid.verdict,
            Verdict::Reject {
                error: DcpError::InvalidUuid,
                sender: 3
            }
        );
        assert_eq!(wrong_uuid.logs.len(), 1);

        assert_eq!(
            fx.check(&register(good, OpMode::Hrt, 2)).verdict,
            Verdict::Reject {
                error: DcpError::InvalidOpMode,
                sender: 3
            }
        );
        assert_eq!(
            fx.check(&register(good, OpMode::Nrt, 2)).verdict,
            Verdict::Reject {
                error: DcpError::InvalidMajorVersion,
                sender: 3
            }
        );
    }

    #[test]
    fn test_register_state_id_mismatch_uses_receiver() {
        let mut fx = Fixture::new(DcpState::Alive);
        let body = PduBody::Register {
            pdu_seq_id: 0,
            receiver: 9,
            state_id: DcpState::Configuration.as_u8(),
            slave_uuid: [0; 16],
            op_mode: 1,
            major_version: 1,
            minor_version: 0,
        };
        assert_eq!(
            fx.check(&body).verdict,
            Verdict::Reject {
                error: DcpError::InvalidStateId,
                sender: 9
            }
        );
    }

    #[test]
    fn test_foreign_receiver_is_dropped() {
        let mut fx = Fixture::new(DcpState::Configuration);
        let body = PduBody::StateTransition {
            pdu_type: PduType::StcPrepare,
            pdu_seq_id: 1,
            receiver: 8,
            state_id: DcpState::Configuration.as_u8(),
        };
        let result = fx.check(&body);
        assert_eq!(result.verdict, Verdict::Drop);
        assert_eq!(result.logs[0].0, LogEvent::InvalidReceiver);
    }

    #[test]
    fn test_response_types_are_dropped() {
        let mut fx = Fixture::new(DcpState::Configuration);
        let ack = PduBody::Ack {
            sender: 7,
            resp_seq_id: 1,
        };
        assert_eq!(fx.check(&ack).verdict, Verdict::Drop);
        assert_eq!(fx.check_bytes(&[0x55, 0, 0, 7]).verdict, Verdict::Drop);
    }

    #[test]
    fn test_inadmissible_pdu() {
        let mut fx = Fixture::new(DcpState::Configuration);
        let result = fx.check(&basic(PduType::StcInitialize, DcpState::Configuration));
        assert_eq!(result.verdict, reject(DcpError::ProtocolErrorPduNotAllowedInThisState));
        assert_eq!(result.logs[0].0, LogEvent::PduNotAllowed);
    }

    #[test]
    fn test_state_id_mismatch() {
        let mut fx = Fixture::new(DcpState::Configuration);
        assert_eq!(
            fx.check(&basic(PduType::StcPrepare, DcpState::Prepared)).verdict,
            reject(DcpError::InvalidStateId)
        );
        assert_eq!(
            fx.check(&basic(PduType::StcPrepare, DcpState::Configuration)).verdict,
            Verdict::Accept { ack: true }
        );
    }

    #[test]
    fn test_info_requests_are_not_acked() {
        let mut fx = Fixture::new(DcpState::ErrorHandling);
        let body = PduBody::Basic {
            pdu_type: PduType::InfError,
            pdu_seq_id: 3,
            receiver: 7,
        };
        assert_eq!(fx.check(&body).verdict, Verdict::Accept { ack: false });

        let log = PduBody::InfLog {
            pdu_seq_id: 4,
            receiver: 7,
            log_category: 1,
            log_max_num: 5,
        };
        assert_eq!(fx.check(&log).verdict, Verdict::Accept { ack: false });

        let unknown = PduBody::InfLog {
            pdu_seq_id: 5,
            receiver: 7,
            log_category: 9,
            log_max_num: 5,
        };
        assert_eq!(fx.check(&unknown).verdict, reject(DcpError::InvalidLogCategory));
    }

    #[test]
    fn test_wrong_length_is_nacked() {
        let mut fx = Fixture::new(DcpState::Configuration);
        let mut bytes = OwnedPdu::encode(&basic(PduType::StcPrepare, DcpState::Configuration))
            .as_bytes()
            .to_vec();
        bytes.push(0);
        let result = fx.check_bytes(&bytes);
        assert_eq!(result.verdict, reject(DcpError::InvalidLength));
        assert_eq!(result.logs[0].0, LogEvent::InvalidLength);
    }

    #[test]
    fn test_do_step_requires_nrt() {
        let mut fx = Fixture::new(DcpState::Running);
        let body = PduBody::DoStep {
            pdu_seq_id: 1,
            receiver: 7,
            state_id: DcpState::Running.as_u8(),
            steps: 1,
        };
        assert_eq!(fx.check(&body).verdict, reject(DcpError::NotSupportedPdu));

        fx.op_mode = Some(OpMode::Nrt);
        assert_eq!(fx.check(&body).verdict, Verdict::Accept { ack: true });

        let five = PduBody::DoStep {
            pdu_seq_id: 2,
            receiver: 7,
            state_id: DcpState::Running.as_u8(),
            steps: 5,
        };
        assert_eq!(fx.check(&five).verdict, reject(DcpError::InvalidSteps));

        fx.fixed_nrt_steps = Some(1);
        let ten = PduBody::DoStep {
            pdu_seq_id: 3,
            receiver: 7,
            state_id: DcpState::Running.as_u8(),
            steps: 10,
        };
        assert_eq!(fx.check(&ten).verdict, reject(DcpError::NotSupportedVariableSteps));
    }

    #[test]
    fn test_config_input_cast() {
        let mut fx = Fixture::new(DcpState::Configuration);
        let input = |source: DataType| PduBody::ConfigInput {
            pdu_seq_id: 1,
            receiver: 7,
            data_id: 1,
            pos: 0,
            target_vr: 1,
            source_data_type: source as u8,
        };
        assert_eq!(fx.check(&input(DataType::Uint8)).verdict, Verdict::Accept { ack: true });
        assert_eq!(
            fx.check(&input(DataType::Uint32)).verdict,
            reject(DcpError::InvalidSourceDataType)
        );

        let output_vr = PduBody::ConfigInput {
            pdu_seq_id: 1,
            receiver: 7,
            data_id: 1,
            pos: 0,
            target_vr: 3,
            source_data_type: DataType::Float64 as u8,
        };
        assert_eq!(fx.check(&output_vr).verdict, reject(DcpError::InvalidValueReference));
    }

    #[test]
    fn test_configure_reports_first_gap() {
        let mut fx = Fixture::new(DcpState::Prepared);
        let entry = InputEntry {
            vr: 1,
            source_type: DataType::Uint16,
        };
        fx.tables.config_input(1, 0, entry);
        fx.tables.config_input(1, 2, entry);
        fx.tables.source_network.insert(1);
        fx.tables.set_scope(1, Scope::Run);

        let result = fx.check(&basic(PduType::StcConfigure, DcpState::Prepared));
        assert_eq!(result.verdict, reject(DcpError::IncompleteConfigGapInputPos));
        // time resolution was never set either
        assert_eq!(result.logs.len(), 2);
    }

    #[test]
    fn test_time_resolution_support() {
        let mut fx = Fixture::new(DcpState::Configuration);
        let res = |numerator, denominator| PduBody::TimeRes {
            pdu_seq_id: 1,
            receiver: 7,
            numerator,
            denominator,
        };
        assert_eq!(fx.check(&res(1, 100)).verdict, Verdict::Accept { ack: true });
        assert_eq!(fx.check(&res(1, 10)).verdict, reject(DcpError::InvalidTimeResolution));
    }

    #[test]
    fn test_network_information() {
        let mut fx = Fixture::new(DcpState::Configuration);
        let udp = |port| PduBody::NetworkInformationEthernet {
            pdu_type: PduType::CfgSourceNetworkInformation,
            pdu_seq_id: 1,
            receiver: 7,
            id: 1,
            transport_protocol: TransportProtocol::UdpIpv4 as u8,
            port,
            ip_address: 0x7F00_0001,
        };
        assert_eq!(fx.check(&udp(9000)).verdict, Verdict::Accept { ack: true });
        assert_eq!(fx.check(&udp(9001)).verdict, reject(DcpError::InvalidNetworkInformation));

        let can = PduBody::NetworkInformation {
            pdu_type: PduType::CfgTargetNetworkInformation,
            pdu_seq_id: 1,
            id: 2,
            receiver: 7,
            transport_protocol: TransportProtocol::Can as u8,
            network_information: &[1, 2],
        };
        assert_eq!(fx.check(&can).verdict, reject(DcpError::InvalidTransportProtocol));
    }

    #[test]
    fn test_set_logging() {
        let mut fx = Fixture::new(DcpState::Configuration);
        let logging = |category, level, mode| PduBody::Logging {
            pdu_seq_id: 1,
            receiver: 7,
            log_category: category,
            log_level: level,
            log_mode: mode,
        };
        assert_eq!(fx.check(&logging(1, 2, 0)).verdict, Verdict::Accept { ack: true });
        assert_eq!(fx.check(&logging(0, 2, 0)).verdict, Verdict::Accept { ack: true });
        assert_eq!(
            fx.check(&logging(1, 2, 1)).verdict,
            reject(DcpError::NotSupportedLogOnNotification)
        );
        assert_eq!(fx.check(&logging(3, 2, 0)).verdict, reject(DcpError::InvalidLogCategory));
        assert_eq!(fx.check(&logging(1, 9, 0)).verdict, reject(DcpError::InvalidLogLevel));
        assert_eq!(fx.check(&logging(1, 2, 4)).verdict, reject(DcpError::InvalidLogMode));
    }

    #[test]
    fn test_set_parameter_length() {
        let mut fx = Fixture::new(DcpState::Configuration);
        let gains = [0u8; 24];
        let body = PduBody::SetParameter {
            pdu_seq_id: 1,
            receiver: 7,
            parameter_vr: 4,
            source_data_type: DataType::Float64 as u8,
            configuration: &gains,
        };
        assert_eq!(fx.check(&body).verdict, Verdict::Accept { ack: true });

        let short = PduBody::SetParameter {
            pdu_seq_id: 1,
            receiver: 7,
            parameter_vr: 4,
            source_data_type: DataType::Float64 as u8,
            configuration: &gains[..8],
        };
        assert_eq!(fx.check(&short).verdict, reject(DcpError::InvalidLength));
    }

    fn data_fixture() -> Fixture {
        let mut fx = Fixture::new(DcpState::Running);
        fx.tables.config_input(
            1,
            0,
            InputEntry {
                vr: 1,
                source_type: DataType::Uint8,
            },
        );
        fx.tables.config_input(
            1,
            1,
            InputEntry {
                vr: 2,
                source_type: DataType::String,
            },
        );
        fx
    }

    fn data(seq: u16, payload: &[u8]) -> PduBody<'_> {
        PduBody::DatInputOutput {
            pdu_seq_id: seq,
            data_id: 1,
            payload,
        }
    }

    #[test]
    fn test_data_length() {
        let mut fx = data_fixture();
        let payload = [5, 2, 0, 0, 0, b'o', b'k'];
        assert_eq!(fx.check(&data(0, &payload)).verdict, Verdict::Accept { ack: false });

        let result = fx.check(&data(1, &payload[..6]));
        assert_eq!(result.verdict, Verdict::Drop);
        assert_eq!(result.logs[0].0, LogEvent::InvalidLength);

        // announced string longer than the payload
        assert_eq!(fx.check(&data(2, &[5, 9, 0])).verdict, Verdict::Drop);
    }

    #[test]
    fn test_data_unknown_id_and_state() {
        let mut fx = data_fixture();
        let other = PduBody::DatInputOutput {
            pdu_seq_id: 0,
            data_id: 2,
            payload: &[],
        };
        assert_eq!(fx.check(&other).verdict, Verdict::Drop);

        fx.state = DcpState::Prepared;
        let result = fx.check(&data(0, &[5, 0, 0, 0, 0]));
        assert_eq!(result.verdict, Verdict::Drop);
        assert_eq!(result.logs[0].0, LogEvent::DataNotAllowed);
    }

    #[test]
    fn test_sequence_policy() {
        let mut fx = data_fixture();
        fx.check_sequence = true;
        let payload = [5, 0, 0, 0, 0];
        assert_eq!(fx.check(&data(10, &payload)).verdict, Verdict::Accept { ack: false });

        let duplicate = fx.check(&data(10, &payload));
        assert_eq!(duplicate.verdict, Verdict::Drop);
        assert_eq!(duplicate.logs[0].0, LogEvent::OldPduReceived);

        let gap = fx.check(&data(13, &payload));
        assert_eq!(gap.verdict, Verdict::Accept { ack: false });
        assert_eq!(gap.missed, vec![Channel::InputOutput(1)]);
    }

    #[test]
    fn test_dropped_data_keeps_sequence_id() {
        let mut fx = data_fixture();
        fx.check_sequence = true;
        let payload = [5, 0, 0, 0, 0];
        assert_eq!(fx.check(&data(10, &payload)).verdict, Verdict::Accept { ack: false });

        assert_eq!(fx.check(&data(11, &payload[..4])).verdict, Verdict::Drop);
        fx.state = DcpState::Prepared;
        assert_eq!(fx.check(&data(11, &payload)).verdict, Verdict::Drop);
        fx.state = DcpState::Running;

        let next = fx.check(&data(11, &payload));
        assert_eq!(next.verdict, Verdict::Accept { ack: false });
        assert!(next.logs.is_empty());
        assert!(next.missed.is_empty());
    }

    fn set_channels(configuration: &[u8]) -> PduBody<'_> {
        PduBody::SetParameter {
            pdu_seq_id: 1,
            receiver: 7,
            parameter_vr: 5,
            source_data_type: DataType::Uint16 as u8,
            configuration,
        }
    }

    fn channels_data(seq: u16, configuration: &[u8]) -> PduBody<'_> {
        PduBody::DatParameter {
            pdu_seq_id: seq,
            param_id: 1,
            configuration,
        }
    }

    fn limit_values(fx: &mut Fixture, max_elements: usize) {
        let config = ValueConfig {
            max_elements,
            ..ValueConfig::default()
        };
        fx.values = ValueStore::from_description(&fx.description, &config).unwrap();
    }

    #[test]
    fn test_oversized_structural_set_parameter_is_nacked() {
        let mut fx = Fixture::new(DcpState::Configuration);
        limit_values(&mut fx, 16);

        let result = fx.check(&set_channels(&[17, 0]));
        assert_eq!(result.verdict, reject(DcpError::InvalidPayload));
        assert_eq!(result.logs[0].0, LogEvent::ShapeTooLarge);
        assert_eq!(fx.check(&set_channels(&[16, 0])).verdict, Verdict::Accept { ack: true });
        assert_eq!(fx.values.get(5).unwrap().uint_value(), Some(2));

        // values without dependents are not limited by their content
        let gains = [0u8; 24];
        let plain = PduBody::SetParameter {
            pdu_seq_id: 2,
            receiver: 7,
            parameter_vr: 4,
            source_data_type: DataType::Float64 as u8,
            configuration: &gains,
        };
        assert_eq!(fx.check(&plain).verdict, Verdict::Accept { ack: true });
    }

    #[test]
    fn test_oversized_structural_parameter_data_is_dropped() {
        let mut fx = Fixture::new(DcpState::Running);
        limit_values(&mut fx, 16);
        fx.check_sequence = true;
        fx.tables.config_tunable(
            1,
            0,
            InputEntry {
                vr: 5,
                source_type: DataType::Uint16,
            },
        );

        let result = fx.check(&channels_data(0, &[0, 1]));
        assert_eq!(result.verdict, Verdict::Drop);
        assert_eq!(result.logs[0].0, LogEvent::ShapeTooLarge);

        let accepted = fx.check(&channels_data(0, &[16, 0]));
        assert_eq!(accepted.verdict, Verdict::Accept { ack: false });
        assert!(accepted.logs.is_empty());
    }

    #[test]
    fn test_control_sequence_skipped_while_alive() {
        let mut fx = Fixture::new(DcpState::Alive);
        fx.check_sequence = true;
        let state = PduBody::Basic {
            pdu_type: PduType::InfState,
            pdu_seq_id: 4,
            receiver: 1,
        };
        assert_eq!(fx.check(&state).verdict, Verdict::Accept { ack: false });
        assert_eq!(fx.check(&state).verdict, Verdict::Accept { ack: false });
    }
}
