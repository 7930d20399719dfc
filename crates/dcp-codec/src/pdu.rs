//! PDU bodies, borrowed views and owned encodings.
//!
//! Offsets below are relative to the type tag, i.e. after the 4-byte
//! length prefix:
//!
//! | Family             | Common fields                          |
//! |--------------------|----------------------------------------|
//! | STC / CFG / INF    | `type@0`, `pdu_seq_id@1`, `receiver@3` |
//! | DAT                | `type@0`, `pdu_seq_id@1`, `id@3`       |
//! | RSP                | `type@0`, `sender@1`, `resp_seq_id@2`  |
//! | NTF                | `type@0`, `sender@1`                   |

use crate::error::{CodecError, CodecResult};
use crate::framing::LENGTH_PREFIX_SIZE;
use crate::reader::FieldReader;
use dcp_common::{PduType, TransportProtocol};

/// Size of the Ethernet form of the network information PDUs.
pub const ETHERNET_NETWORK_INFORMATION_SIZE: usize = 13;

/// Offset of the transport protocol sub-tag in network information PDUs.
pub const TRANSPORT_PROTOCOL_OFFSET: usize = 6;

/// Expected size of a PDU type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeRule {
    /// Exactly this many bytes.
    Exact(usize),
    /// At least this many bytes.
    AtLeast(usize),
}

impl SizeRule {
    /// Byte count of the rule.
    #[must_use]
    pub fn bytes(self) -> usize {
        match self {
            Self::Exact(n) | Self::AtLeast(n) => n,
        }
    }

    /// Returns true if `len` satisfies the rule.
    #[must_use]
    pub fn accepts(self, len: usize) -> bool {
        match self {
            Self::Exact(n) => len == n,
            Self::AtLeast(n) => len >= n,
        }
    }
}

/// Size rule of `pdu_type`. Network information PDUs depend on their
/// transport sub-tag; pass it when known.
#[must_use]
pub fn size_rule(pdu_type: PduType, transport: Option<u8>) -> SizeRule {
    use PduType::*;
    use SizeRule::{AtLeast, Exact};

    match pdu_type {
        InfState | InfError | CfgClear | RspAck => Exact(4),
        StcDeregister | StcPrepare | StcConfigure | StcInitialize | StcSendOutputs | StcStop
        | StcReset | RspStateAck => Exact(5),
        StcRegister => Exact(24),
        StcRun => Exact(13),
        StcDoStep => Exact(9),
        InfLog | RspNack | RspErrorAck => Exact(6),
        CfgTimeRes => Exact(12),
        CfgSteps => Exact(10),
        CfgInput | CfgTunableParameter => Exact(17),
        CfgOutput => Exact(16),
        CfgParameter => AtLeast(13),
        CfgTargetNetworkInformation | CfgSourceNetworkInformation | CfgParamNetworkInformation => {
            match transport.and_then(TransportProtocol::from_u8) {
                Some(tp) if tp.is_ethernet() => Exact(ETHERNET_NETWORK_INFORMATION_SIZE),
                _ => AtLeast(7),
            }
        }
        CfgLogging | CfgScope => Exact(7),
        DatInputOutput | DatParameter => AtLeast(5),
        RspLogAck => AtLeast(4),
        NtfStateChanged => Exact(3),
        NtfLog => AtLeast(11),
    }
}

/// Fields shared by several PDU families.
pub trait PduFields {
    /// Raw type tag.
    fn type_id(&self) -> u8;

    /// Decoded type tag, `None` for unknown tags.
    fn pdu_type(&self) -> Option<PduType> {
        PduType::from_u8(self.type_id())
    }

    /// Sequence id of master-to-slave PDUs.
    fn pdu_seq_id(&self) -> Option<u16>;

    /// Addressed slave of STC, CFG and INF PDUs.
    fn receiver(&self) -> Option<u8>;

    /// Sender of RSP and NTF PDUs.
    fn sender(&self) -> Option<u8>;

    /// State id of state transition PDUs.
    fn state_id(&self) -> Option<u8>;
}

/// Typed fields of one PDU. Variable tails borrow from the decoded buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PduBody<'a> {
    /// `INF_state`, `INF_error`, `CFG_config_clear`.
    Basic {
        /// One of the basic types.
        pdu_type: PduType,
        /// Sequence id.
        pdu_seq_id: u16,
        /// Addressed slave.
        receiver: u8,
    },
    /// State transitions without extra fields.
    StateTransition {
        /// One of the plain `STC_*` types.
        pdu_type: PduType,
        /// Sequence id.
        pdu_seq_id: u16,
        /// Addressed slave.
        receiver: u8,
        /// State the master believes the slave is in.
        state_id: u8,
    },
    /// `STC_register`.
    Register {
        /// Sequence id.
        pdu_seq_id: u16,
        /// Id assigned to the slave.
        receiver: u8,
        /// Expected state.
        state_id: u8,
        /// Slave UUID in textual byte order.
        slave_uuid: [u8; 16],
        /// Requested op mode.
        op_mode: u8,
        /// Protocol major version.
        major_version: u8,
        /// Protocol minor version.
        minor_version: u8,
    },
    /// `STC_run`.
    Run {
        /// Sequence id.
        pdu_seq_id: u16,
        /// Addressed slave.
        receiver: u8,
        /// Expected state.
        state_id: u8,
        /// Unix start time in seconds; 0 means now.
        start_time: i64,
    },
    /// `STC_do_step`.
    DoStep {
        /// Sequence id.
        pdu_seq_id: u16,
        /// Addressed slave.
        receiver: u8,
        /// Expected state.
        state_id: u8,
        /// Steps to compute.
        steps: u32,
    },
    /// `INF_log`.
    InfLog {
        /// Sequence id.
        pdu_seq_id: u16,
        /// Addressed slave.
        receiver: u8,
        /// Requested category.
        log_category: u8,
        /// Maximum number of entries to return.
        log_max_num: u8,
    },
    /// `CFG_set_time_res`.
    TimeRes {
        /// Sequence id.
        pdu_seq_id: u16,
        /// Addressed slave.
        receiver: u8,
        /// Seconds per step, numerator.
        numerator: u32,
        /// Seconds per step, denominator.
        denominator: u32,
    },
    /// `CFG_set_steps`.
    Steps {
        /// Sequence id.
        pdu_seq_id: u16,
        /// Addressed slave.
        receiver: u8,
        /// Steps between two outputs.
        steps: u32,
        /// Output data id.
        data_id: u16,
    },
    /// `CFG_config_input`.
    ConfigInput {
        /// Sequence id.
        pdu_seq_id: u16,
        /// Addressed slave.
        receiver: u8,
        /// Input data id.
        data_id: u16,
        /// Position within the data id.
        pos: u16,
        /// Slave input value reference.
        target_vr: u64,
        /// Data type on the wire.
        source_data_type: u8,
    },
    /// `CFG_config_output`.
    ConfigOutput {
        /// Sequence id.
        pdu_seq_id: u16,
        /// Addressed slave.
        receiver: u8,
        /// Output data id.
        data_id: u16,
        /// Position within the data id.
        pos: u16,
        /// Slave output value reference.
        source_vr: u64,
    },
    /// `CFG_config_tunable_parameter`.
    TunableParameter {
        /// Sequence id.
        pdu_seq_id: u16,
        /// Addressed slave.
        receiver: u8,
        /// Parameter id.
        param_id: u16,
        /// Position within the parameter id.
        pos: u16,
        /// Slave parameter value reference.
        parameter_vr: u64,
        /// Data type on the wire.
        source_data_type: u8,
    },
    /// `CFG_set_parameter`.
    SetParameter {
        /// Sequence id.
        pdu_seq_id: u16,
        /// Addressed slave.
        receiver: u8,
        /// Parameter value reference.
        parameter_vr: u64,
        /// Data type of `configuration`.
        source_data_type: u8,
        /// Encoded value.
        configuration: &'a [u8],
    },
    /// Network information with an opaque tail.
    NetworkInformation {
        /// Target, source or param network information.
        pdu_type: PduType,
        /// Sequence id.
        pdu_seq_id: u16,
        /// Data id or param id.
        id: u16,
        /// Addressed slave.
        receiver: u8,
        /// Transport protocol sub-tag.
        transport_protocol: u8,
        /// Transport specific information.
        network_information: &'a [u8],
    },
    /// Network information for UDP or TCP over IPv4.
    NetworkInformationEthernet {
        /// Target, source or param network information.
        pdu_type: PduType,
        /// Sequence id.
        pdu_seq_id: u16,
        /// Addressed slave.
        receiver: u8,
        /// Data id or param id.
        id: u16,
        /// Transport protocol sub-tag.
        transport_protocol: u8,
        /// Port.
        port: u16,
        /// IPv4 address.
        ip_address: u32,
    },
    /// `CFG_set_logging`.
    Logging {
        /// Sequence id.
        pdu_seq_id: u16,
        /// Addressed slave.
        receiver: u8,
        /// Category, 0 for all.
        log_category: u8,
        /// Level.
        log_level: u8,
        /// Mode.
        log_mode: u8,
    },
    /// `CFG_set_scope`.
    Scope {
        /// Sequence id.
        pdu_seq_id: u16,
        /// Addressed slave.
        receiver: u8,
        /// Data id.
        data_id: u16,
        /// Scope.
        scope: u8,
    },
    /// `DAT_input_output`.
    DatInputOutput {
        /// Sequence id of the data channel.
        pdu_seq_id: u16,
        /// Data id.
        data_id: u16,
        /// Packed values.
        payload: &'a [u8],
    },
    /// `DAT_parameter`.
    DatParameter {
        /// Sequence id of the parameter channel.
        pdu_seq_id: u16,
        /// Parameter id.
        param_id: u16,
        /// Packed values.
        configuration: &'a [u8],
    },
    /// `RSP_ack`.
    Ack {
        /// Responding slave.
        sender: u8,
        /// Sequence id of the answered PDU.
        resp_seq_id: u16,
    },
    /// `RSP_nack` and `RSP_error_ack`.
    ErrorCode {
        /// Nack or error ack.
        pdu_type: PduType,
        /// Responding slave.
        sender: u8,
        /// Sequence id of the answered PDU.
        resp_seq_id: u16,
        /// Error code.
        error_code: u16,
    },
    /// `RSP_state_ack`.
    StateAck {
        /// Responding slave.
        sender: u8,
        /// Sequence id of the answered PDU.
        resp_seq_id: u16,
        /// Current state.
        state_id: u8,
    },
    /// `RSP_log_ack`.
    LogAck {
        /// Responding slave.
        sender: u8,
        /// Sequence id of the answered PDU.
        resp_seq_id: u16,
        /// Serialized log entries.
        payload: &'a [u8],
    },
    /// `NTF_state_changed`.
    StateChanged {
        /// Notifying slave.
        sender: u8,
        /// New state.
        state_id: u8,
    },
    /// `NTF_log`.
    NtfLog {
        /// Notifying slave.
        sender: u8,
        /// Unix time of the entry in seconds.
        time: i64,
        /// Log template.
        template_id: u8,
        /// Serialized template arguments.
        payload: &'a [u8],
    },
    /// Any tag outside the known set.
    Unknown {
        /// Raw type tag.
        type_id: u8,
    },
}

impl<'a> PduBody<'a> {
    fn decode(bytes: &'a [u8], pdu_type: PduType) -> CodecResult<Self> {
        use PduType::*;

        let r = FieldReader::new(bytes);
        let body = match pdu_type {
            InfState | InfError | CfgClear => Self::Basic {
                pdu_type,
                pdu_seq_id: r.u16(1)?,
                receiver: r.u8(3)?,
            },
            StcDeregister | StcPrepare | StcConfigure | StcInitialize | StcSendOutputs | StcStop
            | StcReset => Self::StateTransition {
                pdu_type,
                pdu_seq_id: r.u16(1)?,
                receiver: r.u8(3)?,
                state_id: r.u8(4)?,
            },
            StcRegister => Self::Register {
                pdu_seq_id: r.u16(1)?,
                receiver: r.u8(3)?,
                state_id: r.u8(4)?,
                slave_uuid: r.array(5)?,
                op_mode: r.u8(21)?,
                major_version: r.u8(22)?,
                minor_version: r.u8(23)?,
            },
            StcRun => Self::Run {
                pdu_seq_id: r.u16(1)?,
                receiver: r.u8(3)?,
                state_id: r.u8(4)?,
                start_time: r.i64(5)?,
            },
            StcDoStep => Self::DoStep {
                pdu_seq_id: r.u16(1)?,
                receiver: r.u8(3)?,
                state_id: r.u8(4)?,
                steps: r.u32(5)?,
            },
            InfLog => Self::InfLog {
                pdu_seq_id: r.u16(1)?,
                receiver: r.u8(3)?,
                log_category: r.u8(4)?,
                log_max_num: r.u8(5)?,
            },
            CfgTimeRes => Self::TimeRes {
                pdu_seq_id: r.u16(1)?,
                receiver: r.u8(3)?,
                numerator: r.u32(4)?,
                denominator: r.u32(8)?,
            },
            CfgSteps => Self::Steps {
                pdu_seq_id: r.u16(1)?,
                receiver: r.u8(3)?,
                steps: r.u32(4)?,
                data_id: r.u16(8)?,
            },
            CfgInput => Self::ConfigInput {
                pdu_seq_id: r.u16(1)?,
                receiver: r.u8(3)?,
                data_id: r.u16(4)?,
                pos: r.u16(6)?,
                target_vr: r.u64(8)?,
                source_data_type: r.u8(16)?,
            },
            CfgOutput => Self::ConfigOutput {
                pdu_seq_id: r.u16(1)?,
                receiver: r.u8(3)?,
                data_id: r.u16(4)?,
                pos: r.u16(6)?,
                source_vr: r.u64(8)?,
            },
            CfgTunableParameter => Self::TunableParameter {
                pdu_seq_id: r.u16(1)?,
                receiver: r.u8(3)?,
                param_id: r.u16(4)?,
                pos: r.u16(6)?,
                parameter_vr: r.u64(8)?,
                source_data_type: r.u8(16)?,
            },
            CfgParameter => Self::SetParameter {
                pdu_seq_id: r.u16(1)?,
                receiver: r.u8(3)?,
                parameter_vr: r.u64(4)?,
                source_data_type: r.u8(12)?,
                configuration: r.tail(13)?,
            },
            CfgTargetNetworkInformation | CfgSourceNetworkInformation | CfgParamNetworkInformation => {
                let transport_protocol = r.u8(TRANSPORT_PROTOCOL_OFFSET)?;
                let ethernet = TransportProtocol::from_u8(transport_protocol)
                    .is_some_and(TransportProtocol::is_ethernet);
                if ethernet {
                    Self::NetworkInformationEthernet {
                        pdu_type,
                        pdu_seq_id: r.u16(1)?,
                        receiver: r.u8(3)?,
                        id: r.u16(4)?,
                        transport_protocol,
                        port: r.u16(7)?,
                        ip_address: r.u32(9)?,
                    }
                } else {
                    Self::NetworkInformation {
                        pdu_type,
                        pdu_seq_id: r.u16(1)?,
                        receiver: r.u8(3)?,
                        id: r.u16(4)?,
                        transport_protocol,
                        network_information: r.tail(7)?,
                    }
                }
            }
            CfgLogging => Self::Logging {
                pdu_seq_id: r.u16(1)?,
                receiver: r.u8(3)?,
                log_category: r.u8(4)?,
                log_level: r.u8(5)?,
                log_mode: r.u8(6)?,
            },
            CfgScope => Self::Scope {
                pdu_seq_id: r.u16(1)?,
                receiver: r.u8(3)?,
                data_id: r.u16(4)?,
                scope: r.u8(6)?,
            },
            DatInputOutput => Self::DatInputOutput {
                pdu_seq_id: r.u16(1)?,
                data_id: r.u16(3)?,
                payload: r.tail(5)?,
            },
            DatParameter => Self::DatParameter {
                pdu_seq_id: r.u16(1)?,
                param_id: r.u16(3)?,
                configuration: r.tail(5)?,
            },
            RspAck => Self::Ack {
                sender: r.u8(1)?,
                resp_seq_id: r.u16(2)?,
            },
            RspNack | RspErrorAck => Self::ErrorCode {
                pdu_type,
                sender: r.u8(1)?,
                resp_seq_id: r.u16(2)?,
                error_code: r.u16(4)?,
            },
            RspStateAck => Self::StateAck {
                sender: r.u8(1)?,
                resp_seq_id: r.u16(2)?,
                state_id: r.u8(4)?,
            },
            RspLogAck => Self::LogAck {
                sender: r.u8(1)?,
                resp_seq_id: r.u16(2)?,
                payload: r.tail(4)?,
            },
            NtfStateChanged => Self::StateChanged {
                sender: r.u8(1)?,
                state_id: r.u8(2)?,
            },
            NtfLog => Self::NtfLog {
                sender: r.u8(1)?,
                time: r.i64(2)?,
                template_id: r.u8(10)?,
                payload: r.tail(11)?,
            },
        };
        Ok(body)
    }

    /// Encoded length without the length prefix.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::SetParameter { configuration, .. } => 13 + configuration.len(),
            Self::NetworkInformation {
                network_information, ..
            } => 7 + network_information.len(),
            Self::DatInputOutput { payload, .. } => 5 + payload.len(),
            Self::DatParameter { configuration, .. } => 5 + configuration.len(),
            Self::LogAck { payload, .. } => 4 + payload.len(),
            Self::NtfLog { payload, .. } => 11 + payload.len(),
            Self::Unknown { .. } => 1,
            other => other
                .pdu_type()
                .map_or(1, |ty| size_rule(ty, other.transport_protocol()).bytes()),
        }
    }

    fn transport_protocol(&self) -> Option<u8> {
        match self {
            Self::NetworkInformation {
                transport_protocol, ..
            }
            | Self::NetworkInformationEthernet {
                transport_protocol, ..
            } => Some(*transport_protocol),
            _ => None,
        }
    }

    fn write_fields(&self, out: &mut Vec<u8>) {
        out.push(self.type_id());
        match *self {
            Self::Basic {
                pdu_seq_id,
                receiver,
                ..
            } => {
                out.extend_from_slice(&pdu_seq_id.to_le_bytes());
                out.push(receiver);
            }
            Self::StateTransition {
                pdu_seq_id,
                receiver,
                state_id,
                ..
            } => {
                out.extend_from_slice(&pdu_seq_id.to_le_bytes());
                out.push(receiver);
                out.push(state_id);
            }
            Self::Register {
                pdu_seq_id,
                receiver,
                state_id,
                slave_uuid,
                op_mode,
                major_version,
                minor_version,
            } => {
                out.extend_from_slice(&pdu_seq_id.to_le_bytes());
                out.push(receiver);
                out.push(state_id);
                out.extend_from_slice(&slave_uuid);
                out.extend_from_slice(&[op_mode, major_version, minor_version]);
            }
            Self::Run {
                pdu_seq_id,
                receiver,
                state_id,
                start_time,
            } => {
                out.extend_from_slice(&pdu_seq_id.to_le_bytes());
                out.push(receiver);
                out.push(state_id);
                out.extend_from_slice(&start_time.to_le_bytes());
            }
            Self::DoStep {
                pdu_seq_id,
                receiver,
                state_id,
                steps,
            } => {
                out.extend_from_slice(&pdu_seq_id.to_le_bytes());
                out.push(receiver);
                out.push(state_id);
                out.extend_from_slice(&steps.to_le_bytes());
            }
            Self::InfLog {
                pdu_seq_id,
                receiver,
                log_category,
                log_max_num,
            } => {
                out.extend_from_slice(&pdu_seq_id.to_le_bytes());
                out.extend_from_slice(&[receiver, log_category, log_max_num]);
            }
            Self::TimeRes {
                pdu_seq_id,
                receiver,
                numerator,
                denominator,
            } => {
                out.extend_from_slice(&pdu_seq_id.to_le_bytes());
                out.push(receiver);
                out.extend_from_slice(&numerator.to_le_bytes());
                out.extend_from_slice(&denominator.to_le_bytes());
            }
            Self::Steps {
                pdu_seq_id,
                receiver,
                steps,
                data_id,
            } => {
                out.extend_from_slice(&pdu_seq_id.to_le_bytes());
                out.push(receiver);
                out.extend_from_slice(&steps.to_le_bytes());
                out.extend_from_slice(&data_id.to_le_bytes());
            }
            Self::ConfigInput {
                pdu_seq_id,
                receiver,
                data_id,
                pos,
                target_vr,
                source_data_type,
            } => {
                out.extend_from_slice(&pdu_seq_id.to_le_bytes());
                out.push(receiver);
                out.extend_from_slice(&data_id.to_le_bytes());
                out.extend_from_slice(&pos.to_le_bytes());
                out.extend_from_slice(&target_vr.to_le_bytes());
                out.push(source_data_type);
            }
            Self::ConfigOutput {
                pdu_seq_id,
                receiver,
                data_id,
                pos,
                source_vr,
            } => {
                out.extend_from_slice(&pdu_seq_id.to_le_bytes());
                out.push(receiver);
                out.extend_from_slice(&data_id.to_le_bytes());
                out.extend_from_slice(&pos.to_le_bytes());
                out.extend_from_slice(&source_vr.to_le_bytes());
            }
            Self::TunableParameter {
                pdu_seq_id,
                receiver,
                param_id,
                pos,
                parameter_vr,
                source_data_type,
            } => {
                out.extend_from_slice(&pdu_seq_id.to_le_bytes());
                out.push(receiver);
                out.extend_from_slice(&param_id.to_le_bytes());
                out.extend_from_slice(&pos.to_le_bytes());
                out.extend_from_slice(&parameter_vr.to_le_bytes());
                out.push(source_data_type);
            }
            Self::SetParameter {
                pdu_seq_id,
                receiver,
                parameter_vr,
                source_data_type,
                configuration,
            } => {
                out.extend_from_slice(&pdu_seq_id.to_le_bytes());
                out.push(receiver);
                out.extend_from_slice(&parameter_vr.to_le_bytes());
                out.push(source_data_type);
                out.extend_from_slice(configuration);
            }
            Self::NetworkInformation {
                pdu_seq_id,
                receiver,
                id,
                transport_protocol,
                network_information,
                ..
            } => {
                out.extend_from_slice(&pdu_seq_id.to_le_bytes());
                out.push(receiver);
                out.extend_from_slice(&id.to_le_bytes());
                out.push(transport_protocol);
                out.extend_from_slice(network_information);
            }
            Self::NetworkInformationEthernet {
                pdu_seq_id,
                receiver,
                id,
                transport_protocol,
                port,
                ip_address,
                ..
            } => {
                out.extend_from_slice(&pdu_seq_id.to_le_bytes());
                out.push(receiver);
                out.extend_from_slice(&id.to_le_bytes());
                out.push(transport_protocol);
                out.extend_from_slice(&port.to_le_bytes());
                out.extend_from_slice(&ip_address.to_le_bytes());
            }
            Self::Logging {
                pdu_seq_id,
                receiver,
                log_category,
                log_level,
                log_mode,
            } => {
                out.extend_from_slice(&pdu_seq_id.to_le_bytes());
                out.extend_from_slice(&[receiver, log_category, log_level, log_mode]);
            }
            Self::Scope {
                pdu_seq_id,
                receiver,
                data_id,
                scope,
            } => {
                out.extend_from_slice(&pdu_seq_id.to_le_bytes());
                out.push(receiver);
                out.extend_from_slice(&data_id.to_le_bytes());
                out.push(scope);
            }
            Self::DatInputOutput {
                pdu_seq_id,
                data_id: id,
                payload: tail,
            }
            | Self::DatParameter {
                pdu_seq_id,
                param_id: id,
                configuration: tail,
            } => {
                out.extend_from_slice(&pdu_seq_id.to_le_bytes());
                out.extend_from_slice(&id.to_le_bytes());
                out.extend_from_slice(tail);
            }
            Self::Ack {
                sender,
                resp_seq_id,
            } => {
                out.push(sender);
                out.extend_from_slice(&resp_seq_id.to_le_bytes());
            }
            Self::ErrorCode {
                sender,
                resp_seq_id,
                error_code,
                ..
            } => {
                out.push(sender);
                out.extend_from_slice(&resp_seq_id.to_le_bytes());
                out.extend_from_slice(&error_code.to_le_bytes());
            }
            Self::StateAck {
                sender,
                resp_seq_id,
                state_id,
            } => {
                out.push(sender);
                out.extend_from_slice(&resp_seq_id.to_le_bytes());
                out.push(state_id);
            }
            Self::LogAck {
                sender,
                resp_seq_id,
                payload,
            } => {
                out.push(sender);
                out.extend_from_slice(&resp_seq_id.to_le_bytes());
                out.extend_from_slice(payload);
            }
            Self::StateChanged { sender, state_id } => {
                out.extend_from_slice(&[sender, state_id]);
            }
            Self::NtfLog {
                sender,
                time,
                template_id,
                payload,
            } => {
                out.push(sender);
                out.extend_from_slice(&time.to_le_bytes());
                out.push(template_id);
                out.extend_from_slice(payload);
            }
            Self::Unknown { .. } => {}
        }
    }
}

impl PduFields for PduBody<'_> {
    fn type_id(&self) -> u8 {
        use PduType::*;
        match self {
            Self::Basic { pdu_type, .. }
            | Self::StateTransition { pdu_type, .. }
            | Self::NetworkInformation { pdu_type, .. }
            | Self::NetworkInformationEthernet { pdu_type, .. }
            | Self::ErrorCode { pdu_type, .. } => pdu_type.as_u8(),
            Self::Register { .. } => StcRegister.as_u8(),
            Self::Run { .. } => StcRun.as_u8(),
            Self::DoStep { .. } => StcDoStep.as_u8(),
            Self::InfLog { .. } => InfLog.as_u8(),
            Self::TimeRes { .. } => CfgTimeRes.as_u8(),
            Self::Steps { .. } => CfgSteps.as_u8(),
            Self::ConfigInput { .. } => CfgInput.as_u8(),
            Self::ConfigOutput { .. } => CfgOutput.as_u8(),
            Self::TunableParameter { .. } => CfgTunableParameter.as_u8(),
            Self::SetParameter { .. } => CfgParameter.as_u8(),
            Self::Logging { .. } => CfgLogging.as_u8(),
            Self::Scope { .. } => CfgScope.as_u8(),
            Self::DatInputOutput { .. } => DatInputOutput.as_u8(),
            Self::DatParameter { .. } => DatParameter.as_u8(),
            Self::Ack { .. } => RspAck.as_u8(),
            Self::StateAck { .. } => RspStateAck.as_u8(),
            Self::LogAck { .. } => RspLogAck.as_u8(),
            Self::StateChanged { .. } => NtfStateChanged.as_u8(),
            Self::NtfLog { .. } => NtfLog.as_u8(),
            Self::Unknown { type_id } => *type_id,
        }
    }

    fn pdu_seq_id(&self) -> Option<u16> {
        match self {
            Self::Basic { pdu_seq_id, .. }
            | Self::StateTransition { pdu_seq_id, .. }
            | Self::Register { pdu_seq_id, .. }
            | Self::Run { pdu_seq_id, .. }
            | Self::DoStep { pdu_seq_id, .. }
            | Self::InfLog { pdu_seq_id, .. }
            | Self::TimeRes { pdu_seq_id, .. }
            | Self::Steps { pdu_seq_id, .. }
            | Self::ConfigInput { pdu_seq_id, .. }
            | Self::ConfigOutput { pdu_seq_id, .. }
            | Self::TunableParameter { pdu_seq_id, .. }
            | Self::SetParameter { pdu_seq_id, .. }
            | Self::NetworkInformation { pdu_seq_id, .. }
            | Self::NetworkInformationEthernet { pdu_seq_id, .. }
            | Self::Logging { pdu_seq_id, .. }
            | Self::Scope { pdu_seq_id, .. }
            | Self::DatInputOutput { pdu_seq_id, .. }
            | Self::DatParameter { pdu_seq_id, .. } => Some(*pdu_seq_id),
            _ => None,
        }
    }

    fn receiver(&self) -> Option<u8> {
        match self {
            Self::Basic { receiver, .. }
            | Self::StateTransition { receiver, .. }
            | Self::Register { receiver, .. }
            | Self::Run { receiver, .. }
            | Self::DoStep { receiver, .. }
            | Self::InfLog { receiver, .. }
            | Self::TimeRes { receiver, .. }
            | Self::Steps { receiver, .. }
            | Self::ConfigInput { receiver, .. }
            | Self::ConfigOutput { receiver, .. }
            | Self::TunableParameter { receiver, .. }
            | Self::SetParameter { receiver, .. }
            | Self::NetworkInformation { receiver, .. }
            | Self::NetworkInformationEthernet { receiver, .. }
            | Self::Logging { receiver, .. }
            | Self::Scope { receiver, .. } => Some(*receiver),
            _ => None,
        }
    }

    fn sender(&self) -> Option<u8> {
        match self {
            Self::Ack { sender, .. }
            | Self::ErrorCode { sender, .. }
            | Self::StateAck { sender, .. }
            | Self::LogAck { sender, .. }
            | Self::StateChanged { sender, .. }
            | Self::NtfLog { sender, .. } => Some(*sender),
            _ => None,
        }
    }

    fn state_id(&self) -> Option<u8> {
        match self {
            Self::StateTransition { state_id, .. }
            | Self::Register { state_id, .. }
            | Self::Run { state_id, .. }
            | Self::DoStep { state_id, .. } => Some(*state_id),
            _ => None,
        }
    }
}

/// A decoded PDU borrowing the receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PduView<'a> {
    bytes: &'a [u8],
    body: PduBody<'a>,
}

impl<'a> PduView<'a> {
    /// Decode a PDU (without length prefix).
    ///
    /// Unknown type tags decode to [`PduBody::Unknown`]. Buffers longer than
    /// the fixed size of their type decode fine; use [`Self::is_size_correct`]
    /// to police the length.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Empty`] for an empty buffer and
    /// [`CodecError::Truncated`] if the buffer cannot hold the fields of its
    /// type.
    pub fn decode(bytes: &'a [u8]) -> CodecResult<Self> {
        let type_id = *bytes.first().ok_or(CodecError::Empty)?;
        let Some(pdu_type) = PduType::from_u8(type_id) else {
            return Ok(Self {
                bytes,
                body: PduBody::Unknown { type_id },
            });
        };

        let transport = bytes.get(TRANSPORT_PROTOCOL_OFFSET).copied();
        let need = size_rule(pdu_type, transport).bytes();
        if bytes.len() < need {
            return Err(CodecError::Truncated {
                pdu_type,
                need,
                have: bytes.len(),
            });
        }

        let body = PduBody::decode(bytes, pdu_type)?;
        Ok(Self { bytes, body })
    }

    /// Typed fields.
    #[must_use]
    pub fn body(&self) -> &PduBody<'a> {
        &self.body
    }

    /// Raw PDU bytes starting at the type tag.
    #[must_use]
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Actual length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Always false; a view holds at least its type tag.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Expected size: the exact size for fixed layouts, the minimum for
    /// variable ones, 1 for unknown tags.
    #[must_use]
    pub fn correct_size(&self) -> usize {
        self.size_rule().map_or(1, SizeRule::bytes)
    }

    /// Returns true if the actual length satisfies the size rule.
    #[must_use]
    pub fn is_size_correct(&self) -> bool {
        self.size_rule().map_or(true, |rule| rule.accepts(self.len()))
    }

    fn size_rule(&self) -> Option<SizeRule> {
        self.body
            .pdu_type()
            .map(|ty| size_rule(ty, self.body.transport_protocol()))
    }
}

impl PduFields for PduView<'_> {
    fn type_id(&self) -> u8 {
        self.body.type_id()
    }

    fn pdu_seq_id(&self) -> Option<u16> {
        self.body.pdu_seq_id()
    }

    fn receiver(&self) -> Option<u8> {
        self.body.receiver()
    }

    fn sender(&self) -> Option<u8> {
        self.body.sender()
    }

    fn state_id(&self) -> Option<u8> {
        self.body.state_id()
    }
}

/// An encoded PDU owning its length-prefixed buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedPdu {
    frame: Vec<u8>,
}

impl OwnedPdu {
    /// Encode `body` into exactly `len + 4` bytes.
    #[must_use]
    pub fn encode(body: &PduBody<'_>) -> Self {
        let len = body.encoded_len();
        let mut frame = Vec::with_capacity(len + LENGTH_PREFIX_SIZE);
        frame.extend_from_slice(&u32::try_from(len).unwrap_or(u32::MAX).to_le_bytes());
        body.write_fields(&mut frame);
        debug_assert_eq!(frame.len(), len + LENGTH_PREFIX_SIZE);
        Self { frame }
    }

    /// Copy raw PDU bytes (without prefix) into an owned frame.
    #[must_use]
    pub fn from_pdu_bytes(bytes: &[u8]) -> Self {
        let mut frame = Vec::with_capacity(bytes.len() + LENGTH_PREFIX_SIZE);
        frame.extend_from_slice(&u32::try_from(bytes.len()).unwrap_or(u32::MAX).to_le_bytes());
        frame.extend_from_slice(bytes);
        Self { frame }
    }

    /// Full frame including the length prefix.
    #[must_use]
    pub fn as_frame(&self) -> &[u8] {
        &self.frame
    }

    /// PDU bytes starting at the type tag.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.frame[LENGTH_PREFIX_SIZE..]
    }

    /// Consume into the frame buffer.
    #[must_use]
    pub fn into_frame(self) -> Vec<u8> {
        self.frame
    }

    /// PDU length without prefix.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frame.len() - LENGTH_PREFIX_SIZE
    }

    /// Always false; a PDU holds at least its type tag.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw type tag.
    #[must_use]
    pub fn type_id(&self) -> u8 {
        self.as_bytes().first().copied().unwrap_or_default()
    }

    /// Decoded type tag.
    #[must_use]
    pub fn pdu_type(&self) -> Option<PduType> {
        PduType::from_u8(self.type_id())
    }

    /// Borrow as a decoded view.
    ///
    /// # Errors
    ///
    /// Fails only for frames built with [`Self::from_pdu_bytes`] from
    /// truncated input.
    pub fn view(&self) -> CodecResult<PduView<'_>> {
        PduView::decode(self.as_bytes())
    }
}

impl From<&PduBody<'_>> for OwnedPdu {
    fn from(body: &PduBody<'_>) -> Self {
        Self::encode(body)
    }
}
