//! Common utilities for acceptance tests.
//!
//! Provides:
//! - Slave descriptions for a producer and a consumer slave
//! - A link driver that records everything and forwards outputs to a peer
//! - A scripted master that walks a slave through the DCP state machine

#![allow(dead_code)]

use dcp_codec::{OwnedPdu, PduBody};
use dcp_common::{
    DataType, DcpState, OpMode, PduType, RuntimeConfig, Scope, SlaveResult, TransportProtocol,
};
use dcp_slave::{DcpSlave, Driver, RecordingDriver, SlaveDescription};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Time allowed for any asynchronous transition.
pub const WAIT: Duration = Duration::from_secs(2);

/// Data id carrying the producer's output to the consumer.
pub const LINK_DATA_ID: u16 = 1;

/// Producer output: temperature (float64, starts at 20.0).
pub const PRODUCER_OUTPUT: u64 = 2;
/// Producer tunable parameter: gain (float64, starts at 1.0).
pub const PRODUCER_GAIN: u64 = 3;
/// Consumer input: measured temperature (float64).
pub const CONSUMER_INPUT: u64 = 1;

/// Producer slave: one float64 output and one float64 gain parameter.
pub fn producer_description(monitor_heartbeat: bool) -> String {
    format!(
        r#"
        dcp_major_version = 1
        dcp_minor_version = 0
        dcp_slave_name = "producer"
        uuid = "{uuid}"

        [op_mode]
        soft_real_time = true

        [op_mode.non_real_time]
        min_steps = 1
        max_steps = 100

        [[time_res.resolutions]]
        numerator = 1
        denominator = 100
        recommended = true

        [heartbeat]
        numerator = 1
        denominator = 10

        [capability_flags]
        can_accept_config_pdus = true
        can_handle_reset = true
        can_handle_variable_steps = true
        can_monitor_heartbeat = {monitor_heartbeat}

        [transport_protocols.udp_ipv4.dat_input_output]
        port_ranges = [{{ from = 9000, to = 9099 }}]

        [transport_protocols.udp_ipv4.dat_parameter]
        ports = [9500]

        [[variables]]
        name = "temperature"
        value_reference = {PRODUCER_OUTPUT}
        causality = "output"
        data_type = "float64"
        start = 20.0

        [[variables]]
        name = "gain"
        value_reference = {PRODUCER_GAIN}
        causality = "parameter"
        data_type = "float64"
        start = 1.0
        "#,
        uuid = Uuid::new_v4()
    )
}

/// Consumer slave: one float64 input.
pub fn consumer_description() -> String {
    format!(
        r#"
        dcp_major_version = 1
        dcp_minor_version = 0
        dcp_slave_name = "consumer"
        uuid = "{uuid}"

        [op_mode.non_real_time]
        min_steps = 1
        max_steps = 100

        [[time_res.resolutions]]
        numerator = 1
        denominator = 100
        recommended = true

        [capability_flags]
        can_accept_config_pdus = true
        can_handle_reset = true

        [transport_protocols.udp_ipv4.dat_input_output]
        port_ranges = [{{ from = 9000, to = 9099 }}]

        [[variables]]
        name = "measured"
        value_reference = {CONSUMER_INPUT}
        causality = "input"
        data_type = "float64"
        "#,
        uuid = Uuid::new_v4()
    )
}

// ============================================================================
// Link driver
// ============================================================================

/// Driver that records every PDU and hands `DAT_input_output` to a peer
/// slave, standing in for a UDP link between two slaves.
#[derive(Clone, Default)]
pub struct LinkDriver {
    recorder: RecordingDriver,
    peer: Arc<Mutex<Option<DcpSlave<LinkDriver>>>>,
}

impl Driver for LinkDriver {
    fn send(&mut self, pdu: &OwnedPdu) -> SlaveResult<()> {
        self.recorder.send(pdu)?;
        if pdu.pdu_type() == Some(PduType::DatInputOutput) {
            let peer = self.peer.lock().clone();
            if let Some(peer) = peer {
                peer.receive(pdu.as_bytes())?;
            }
        }
        Ok(())
    }
}

// ============================================================================
// Scripted master
// ============================================================================

/// A master talking to one slave.
pub struct Master {
    pub slave: DcpSlave<LinkDriver>,
    pub recorder: RecordingDriver,
    peer: Arc<Mutex<Option<DcpSlave<LinkDriver>>>>,
    dcp_id: u8,
    seq: u16,
}

impl Master {
    /// Build a slave from a TOML description.
    pub fn new(description: &str, dcp_id: u8, config: RuntimeConfig) -> Self {
        let description = SlaveDescription::from_toml(description).unwrap();
        Self::from_description(description, dcp_id, config)
    }

    /// Build a slave from a loaded description.
    pub fn from_description(description: SlaveDescription, dcp_id: u8, config: RuntimeConfig) -> Self {
        let driver = LinkDriver::default();
        let recorder = driver.recorder.clone();
        let peer = Arc::clone(&driver.peer);
        let slave = DcpSlave::new(description, driver, config).unwrap();
        Self {
            slave,
            recorder,
            peer,
            dcp_id,
            seq: 0,
        }
    }

    /// Forward this slave's outputs to `other`.
    pub fn link_to(&self, other: &Master) {
        *self.peer.lock() = Some(other.slave.clone());
    }

    pub fn next_seq(&mut self) -> u16 {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        seq
    }

    pub fn send(&self, body: &PduBody<'_>) {
        self.slave.receive(OwnedPdu::encode(body).as_bytes()).unwrap();
    }

    pub fn register(&mut self, op_mode: OpMode) {
        let pdu_seq_id = self.next_seq();
        self.send(&PduBody::Register {
            pdu_seq_id,
            receiver: self.dcp_id,
            state_id: DcpState::Alive.as_u8(),
            slave_uuid: *self.slave.description().uuid.as_bytes(),
            op_mode: op_mode as u8,
            major_version: 1,
            minor_version: 0,
        });
    }

    pub fn command(&mut self, pdu_type: PduType) {
        let pdu_seq_id = self.next_seq();
        let state_id = self.slave.state().as_u8();
        self.send(&PduBody::StateTransition {
            pdu_type,
            pdu_seq_id,
            receiver: self.dcp_id,
            state_id,
        });
    }

    pub fn run(&mut self) {
        let pdu_seq_id = self.next_seq();
        let state_id = self.slave.state().as_u8();
        self.send(&PduBody::Run {
            pdu_seq_id,
            receiver: self.dcp_id,
            state_id,
            start_time: 0,
        });
    }

    pub fn do_step(&mut self, steps: u32) {
        let pdu_seq_id = self.next_seq();
        let state_id = self.slave.state().as_u8();
        self.send(&PduBody::DoStep {
            pdu_seq_id,
            receiver: self.dcp_id,
            state_id,
            steps,
        });
    }

    pub fn inf_state(&mut self) {
        let pdu_seq_id = self.next_seq();
        self.send(&PduBody::Basic {
            pdu_type: PduType::InfState,
            pdu_seq_id,
            receiver: self.dcp_id,
        });
    }

    pub fn inf_error(&mut self) {
        let pdu_seq_id = self.next_seq();
        self.send(&PduBody::Basic {
            pdu_type: PduType::InfError,
            pdu_seq_id,
            receiver: self.dcp_id,
        });
    }

    pub fn config_input(&mut self, data_id: u16, pos: u16, target_vr: u64, source: DataType) {
        let pdu_seq_id = self.next_seq();
        self.send(&PduBody::ConfigInput {
            pdu_seq_id,
            receiver: self.dcp_id,
            data_id,
            pos,
            target_vr,
            source_data_type: source as u8,
        });
    }

    pub fn config_output(&mut self, data_id: u16, pos: u16, source_vr: u64) {
        let pdu_seq_id = self.next_seq();
        self.send(&PduBody::ConfigOutput {
            pdu_seq_id,
            receiver: self.dcp_id,
            data_id,
            pos,
            source_vr,
        });
    }

    pub fn config_tunable(&mut self, param_id: u16, pos: u16, parameter_vr: u64, source: DataType) {
        let pdu_seq_id = self.next_seq();
        self.send(&PduBody::TunableParameter {
            pdu_seq_id,
            receiver: self.dcp_id,
            param_id,
            pos,
            parameter_vr,
            source_data_type: source as u8,
        });
    }

    pub fn network(&mut self, pdu_type: PduType, id: u16, port: u16) {
        let pdu_seq_id = self.next_seq();
        self.send(&PduBody::NetworkInformationEthernet {
            pdu_type,
            pdu_seq_id,
            receiver: self.dcp_id,
            id,
            transport_protocol: TransportProtocol::UdpIpv4 as u8,
            port,
            ip_address: 0x7F00_0001,
        });
    }

    pub fn steps(&mut self, data_id: u16, steps: u32) {
        let pdu_seq_id = self.next_seq();
        self.send(&PduBody::Steps {
            pdu_seq_id,
            receiver: self.dcp_id,
            steps,
            data_id,
        });
    }

    pub fn scope(&mut self, data_id: u16, scope: Scope) {
        let pdu_seq_id = self.next_seq();
        self.send(&PduBody::Scope {
            pdu_seq_id,
            receiver: self.dcp_id,
            data_id,
            scope: scope as u8,
        });
    }

    /// Producer side of the link: output on [`LINK_DATA_ID`] every step.
    pub fn configure_producer(&mut self) {
        self.config_output(LINK_DATA_ID, 0, PRODUCER_OUTPUT);
        self.network(PduType::CfgTargetNetworkInformation, LINK_DATA_ID, 9001);
        self.steps(LINK_DATA_ID, 1);
        self.scope(LINK_DATA_ID, Scope::Run);
    }

    /// Consumer side of the link: input from [`LINK_DATA_ID`].
    pub fn configure_consumer(&mut self) {
        self.config_input(LINK_DATA_ID, 0, CONSUMER_INPUT, DataType::Float64);
        self.network(PduType::CfgSourceNetworkInformation, LINK_DATA_ID, 9001);
        self.scope(LINK_DATA_ID, Scope::InitializationRunNonRealTime);
    }

    pub fn wait_for(&self, state: DcpState) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if self.slave.state() == state {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        false
    }

    /// Walk from CONFIGURATION to CONFIGURED.
    pub fn prepare_and_configure(&mut self) {
        self.command(PduType::StcPrepare);
        assert!(self.wait_for(DcpState::Prepared));
        self.command(PduType::StcConfigure);
        assert!(self.wait_for(DcpState::Configured), "configure failed: {:?}", self.nacks());
    }

    /// From CONFIGURED through SYNCHRONIZED into RUNNING.
    pub fn start_running(&mut self) {
        self.run();
        assert!(self.wait_for(DcpState::Synchronized));
        self.run();
        assert!(self.wait_for(DcpState::Running));
    }

    /// One NRT step in RUNNING, ending with the outputs sent.
    pub fn step(&mut self, steps: u32) {
        self.do_step(steps);
        assert!(self.wait_for(DcpState::Computed));
        self.command(PduType::StcSendOutputs);
        assert!(self.wait_for(DcpState::Running));
    }

    /// Error codes of every `RSP_nack` so far.
    pub fn nacks(&self) -> Vec<u16> {
        self.recorder
            .sent_of_type(PduType::RspNack)
            .iter()
            .filter_map(|pdu| match *pdu.view().ok()?.body() {
                PduBody::ErrorCode { error_code, .. } => Some(error_code),
                _ => None,
            })
            .collect()
    }

    /// States announced through `NTF_state_changed`, in order.
    pub fn announced(&self) -> Vec<DcpState> {
        announced(&self.recorder.sent())
    }

    /// Payloads of every `DAT_input_output` sent, with their sequence ids.
    pub fn outputs(&self) -> Vec<(u16, Vec<u8>)> {
        self.recorder
            .sent_of_type(PduType::DatInputOutput)
            .iter()
            .filter_map(|pdu| match *pdu.view().ok()?.body() {
                PduBody::DatInputOutput {
                    pdu_seq_id,
                    payload,
                    ..
                } => Some((pdu_seq_id, payload.to_vec())),
                _ => None,
            })
            .collect()
    }
}

impl Drop for Master {
    fn drop(&mut self) {
        *self.peer.lock() = None;
        self.slave.shutdown();
    }
}

/// States announced in `sent`, in order.
pub fn announced(sent: &[OwnedPdu]) -> Vec<DcpState> {
    sent.iter()
        .filter_map(|pdu| match *pdu.view().ok()?.body() {
            PduBody::StateChanged { state_id, .. } => DcpState::from_u8(state_id),
            _ => None,
        })
        .collect()
}

/// A `DAT_input_output` carrying one float64.
pub fn float_data(pdu_seq_id: u16, value: f64) -> OwnedPdu {
    OwnedPdu::encode(&PduBody::DatInputOutput {
        pdu_seq_id,
        data_id: LINK_DATA_ID,
        payload: &value.to_le_bytes(),
    })
}
