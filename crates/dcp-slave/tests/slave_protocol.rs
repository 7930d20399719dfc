//! Integration tests for the DCP slave.
//!
//! A scripted master pushes PDUs into a slave backed by a
//! [`RecordingDriver`] and inspects what the slave sends back.

use dcp_codec::{OwnedPdu, PduBody};
use dcp_common::{
    DataType, DcpError, DcpState, LogLevel, LogMode, OpMode, PduType, RuntimeConfig, Scope,
    TransportProtocol,
};
use dcp_slave::{
    CallbackMode, DcpSlave, DriverCall, LogEvent, PhaseKind, RecordingDriver, SlaveDescription,
    StepKind, SLAVE_LOG_CATEGORY,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const DCP_ID: u8 = 3;
const WAIT: Duration = Duration::from_secs(2);

// ============================================================================
// Harness
// ============================================================================

fn description(monitor_heartbeat: bool) -> SlaveDescription {
    let toml = format!(
        r#"
        dcp_major_version = 1
        dcp_minor_version = 0
        dcp_slave_name = "heater"
        uuid = "a3b1c2d4-5e6f-4a7b-8c9d-0e1f2a3b4c5d"

        [op_mode]
        soft_real_time = true

        [op_mode.non_real_time]
        values = [1, 10]

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
        can_monitor_heartbeat = {monitor_heartbeat}
        can_provide_log_on_request = true
        can_provide_log_on_notification = true

        [transport_protocols.udp_ipv4.dat_input_output]
        ports = [9000]

        [[variables]]
        name = "setpoint"
        value_reference = 1
        causality = "input"
        data_type = "uint16"

        [[variables]]
        name = "temperature"
        value_reference = 2
        causality = "output"
        data_type = "float64"
        start = 21.5

        [log]
        categories = [{{ id = 1, name = "HEATER" }}]
        "#
    );
    SlaveDescription::from_toml(&toml).unwrap()
}

struct Master {
    slave: DcpSlave<RecordingDriver>,
    recorder: RecordingDriver,
    seq: u16,
}

impl Master {
    fn new(monitor_heartbeat: bool) -> Self {
        let recorder = RecordingDriver::new();
        let slave = DcpSlave::new(
            description(monitor_heartbeat),
            recorder.clone(),
            RuntimeConfig::default(),
        )
        .unwrap();
        Self {
            slave,
            recorder,
            seq: 0,
        }
    }

    fn next_seq(&mut self) -> u16 {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        seq
    }

    fn send(&self, body: &PduBody<'_>) {
        self.slave.receive(OwnedPdu::encode(body).as_bytes()).unwrap();
    }

    fn register(&mut self, op_mode: OpMode) {
        let pdu_seq_id = self.next_seq();
        self.send(&PduBody::Register {
            pdu_seq_id,
            receiver: DCP_ID,
            state_id: DcpState::Alive.as_u8(),
            slave_uuid: *self.slave.description().uuid.as_bytes(),
            op_mode: op_mode as u8,
            major_version: 1,
            minor_version: 0,
        });
    }

    fn command(&mut self, pdu_type: PduType) {
        let pdu_seq_id = self.next_seq();
        let state_id = self.slave.state().as_u8();
        self.send(&PduBody::StateTransition {
            pdu_type,
            pdu_seq_id,
            receiver: DCP_ID,
            state_id,
        });
    }

    fn run(&mut self, start_time: i64) {
        let pdu_seq_id = self.next_seq();
        let state_id = self.slave.state().as_u8();
        self.send(&PduBody::Run {
            pdu_seq_id,
            receiver: DCP_ID,
            state_id,
            start_time,
        });
    }

    fn do_step(&mut self, steps: u32) {
        let pdu_seq_id = self.next_seq();
        let state_id = self.slave.state().as_u8();
        self.send(&PduBody::DoStep {
            pdu_seq_id,
            receiver: DCP_ID,
            state_id,
            steps,
        });
    }

    fn inf_state(&mut self) {
        let pdu_seq_id = self.next_seq();
        self.send(&PduBody::Basic {
            pdu_type: PduType::InfState,
            pdu_seq_id,
            receiver: DCP_ID,
        });
    }

    fn config_input(&mut self, data_id: u16, pos: u16, target_vr: u64, source: DataType) {
        let pdu_seq_id = self.next_seq();
        self.send(&PduBody::ConfigInput {
            pdu_seq_id,
            receiver: DCP_ID,
            data_id,
            pos,
            target_vr,
            source_data_type: source as u8,
        });
    }

    fn config_output(&mut self, data_id: u16, pos: u16, source_vr: u64) {
        let pdu_seq_id = self.next_seq();
        self.send(&PduBody::ConfigOutput {
            pdu_seq_id,
            receiver: DCP_ID,
            data_id,
            pos,
            source_vr,
        });
    }

    fn network(&mut self, pdu_type: PduType, id: u16, port: u16) {
        let pdu_seq_id = self.next_seq();
        self.send(&PduBody::NetworkInformationEthernet {
            pdu_type,
            pdu_seq_id,
            receiver: DCP_ID,
            id,
            transport_protocol: TransportProtocol::UdpIpv4 as u8,
            port,
            ip_address: 0x7F00_0001,
        });
    }

    fn output_schedule(&mut self, data_id: u16, steps: u32, scope: Scope) {
        let pdu_seq_id = self.next_seq();
        self.send(&PduBody::Steps {
            pdu_seq_id,
            receiver: DCP_ID,
            steps,
            data_id,
        });
        self.scope(data_id, scope);
    }

    fn scope(&mut self, data_id: u16, scope: Scope) {
        let pdu_seq_id = self.next_seq();
        self.send(&PduBody::Scope {
            pdu_seq_id,
            receiver: DCP_ID,
            data_id,
            scope: scope as u8,
        });
    }

    fn set_logging(&mut self, category: u8, level: LogLevel, mode: LogMode) {
        let pdu_seq_id = self.next_seq();
        self.send(&PduBody::Logging {
            pdu_seq_id,
            receiver: DCP_ID,
            log_category: category,
            log_level: level as u8,
            log_mode: mode as u8,
        });
    }

    fn wait_for(&self, state: DcpState) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if self.slave.state() == state {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        false
    }

    /// Walk from CONFIGURATION through the configuration states to
    /// CONFIGURED, keeping the heartbeat alive.
    fn configure(&mut self) {
        self.command(PduType::StcPrepare);
        assert!(self.wait_for(DcpState::Prepared));
        self.inf_state();
        self.command(PduType::StcConfigure);
        assert!(self.wait_for(DcpState::Configured));
        self.inf_state();
        self.command(PduType::StcInitialize);
        assert!(self.wait_for(DcpState::Initialized));
        self.command(PduType::StcSendOutputs);
        assert_eq!(self.slave.state(), DcpState::Configured);
        self.inf_state();
    }

    fn nacks(&self) -> Vec<u16> {
        self.recorder
            .sent_of_type(PduType::RspNack)
            .iter()
            .filter_map(|pdu| match *pdu.view().unwrap().body() {
                PduBody::ErrorCode { error_code, .. } => Some(error_code),
                _ => None,
            })
            .collect()
    }

    fn announced(&self) -> Vec<DcpState> {
        announced(&self.recorder.sent())
    }
}

fn announced(sent: &[OwnedPdu]) -> Vec<DcpState> {
    sent.iter()
        .filter_map(|pdu| match *pdu.view().ok()?.body() {
            PduBody::StateChanged { state_id, .. } => DcpState::from_u8(state_id),
            _ => None,
        })
        .collect()
}

// ============================================================================
// Registration
// ============================================================================

#[test]
fn test_register_enters_configuration() {
    let mut master = Master::new(true);
    let records = Arc::new(Mutex::new(Vec::new()));
    let r = Arc::clone(&records);
    master
        .slave
        .add_log_listener(move |record| r.lock().push(record.entry.template_id));

    master.register(OpMode::Nrt);

    let sent = master.recorder.sent();
    let ack = sent.first().unwrap();
    assert_eq!(ack.pdu_type(), Some(PduType::RspAck));
    assert!(matches!(
        *ack.view().unwrap().body(),
        PduBody::Ack { sender: DCP_ID, resp_seq_id: 0 }
    ));
    assert_eq!(master.announced(), vec![DcpState::Configuration]);
    assert_eq!(master.slave.state(), DcpState::Configuration);
    assert_eq!(master.slave.dcp_id(), DCP_ID);
    assert_eq!(master.slave.op_mode(), Some(OpMode::Nrt));
    assert!(master.recorder.calls().contains(&DriverCall::RegisterSuccessful));

    let heartbeat_started = LogEvent::HeartbeatStarted.template().id;
    assert!(records.lock().contains(&heartbeat_started));
    master.slave.shutdown();
}

#[test]
fn test_register_with_foreign_uuid_stays_alive() {
    let master = Master::new(false);
    master.send(&PduBody::Register {
        pdu_seq_id: 0,
        receiver: DCP_ID,
        state_id: DcpState::Alive.as_u8(),
        slave_uuid: [0xAB; 16],
        op_mode: OpMode::Nrt as u8,
        major_version: 1,
        minor_version: 0,
    });

    assert_eq!(master.nacks(), vec![DcpError::InvalidUuid.code()]);
    assert_eq!(master.slave.state(), DcpState::Alive);
    assert_eq!(master.slave.dcp_id(), 0);
    assert!(master.announced().is_empty());
}

#[test]
fn test_deregister_returns_to_alive() {
    let mut master = Master::new(false);
    master.register(OpMode::Nrt);
    master.command(PduType::StcDeregister);

    assert_eq!(master.slave.state(), DcpState::Alive);
    assert_eq!(master.slave.dcp_id(), 0);
    assert_eq!(master.slave.op_mode(), None);
    assert!(master.recorder.calls().contains(&DriverCall::Disconnect));
    assert_eq!(
        master.announced(),
        vec![DcpState::Configuration, DcpState::Alive]
    );
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn test_configure_with_async_callback() {
    let mut master = Master::new(false);
    master
        .slave
        .set_phase_callback(PhaseKind::Configure, CallbackMode::Async, || {});
    master.register(OpMode::Nrt);
    master.command(PduType::StcPrepare);
    assert!(master.wait_for(DcpState::Prepared));

    master.command(PduType::StcConfigure);
    assert_eq!(master.slave.state(), DcpState::Configuring);

    let deadline = Instant::now() + WAIT;
    while !master.slave.configure_finished() {
        assert!(Instant::now() < deadline, "configure callback never ran");
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(master.wait_for(DcpState::Configured));
    assert!(master.nacks().is_empty());
    assert!(master.recorder.calls().contains(&DriverCall::Configure));
    assert!(master
        .announced()
        .ends_with(&[DcpState::Configuring, DcpState::Configured]));
    master.slave.shutdown();
}

#[test]
fn test_narrowing_input_cast_is_rejected() {
    let mut master = Master::new(false);
    master.register(OpMode::Nrt);
    master.config_input(1, 0, 1, DataType::Uint32);

    assert_eq!(master.nacks(), vec![DcpError::InvalidSourceDataType.code()]);

    master.config_input(1, 0, 1, DataType::Uint8);
    assert_eq!(master.nacks().len(), 1);
}

#[test]
fn test_configure_with_position_gap_is_rejected() {
    let mut master = Master::new(false);
    master.register(OpMode::Nrt);
    master.config_input(4, 1, 1, DataType::Uint16);
    master.command(PduType::StcPrepare);
    assert!(master.wait_for(DcpState::Prepared));

    master.command(PduType::StcConfigure);
    assert_eq!(
        master.nacks(),
        vec![DcpError::IncompleteConfigGapInputPos.code()]
    );
    assert_eq!(master.slave.state(), DcpState::Prepared);
    master.slave.shutdown();
}

#[test]
fn test_command_not_allowed_in_state() {
    let mut master = Master::new(false);
    master.register(OpMode::Nrt);
    master.command(PduType::StcInitialize);

    assert_eq!(
        master.nacks(),
        vec![DcpError::ProtocolErrorPduNotAllowedInThisState.code()]
    );
    assert_eq!(master.slave.state(), DcpState::Configuration);
}

#[test]
fn test_network_information_reaches_driver() {
    let mut master = Master::new(false);
    master.register(OpMode::Nrt);
    master.network(PduType::CfgSourceNetworkInformation, 2, 9000);
    master.network(PduType::CfgSourceNetworkInformation, 2, 9001);

    assert_eq!(
        master.nacks(),
        vec![DcpError::InvalidNetworkInformation.code()]
    );
    let mut info = 9000u16.to_le_bytes().to_vec();
    info.extend_from_slice(&0x7F00_0001u32.to_le_bytes());
    assert!(master
        .recorder
        .calls()
        .contains(&DriverCall::SourceNetworkInformation {
            data_id: 2,
            transport: TransportProtocol::UdpIpv4,
            info,
        }));
}

// ============================================================================
// Non-real-time stepping
// ============================================================================

#[test]
fn test_unsupported_nrt_steps_are_rejected() {
    let mut master = Master::new(false);
    master.register(OpMode::Nrt);
    master.configure();
    master.run(0);
    assert!(master.wait_for(DcpState::Synchronized));
    master.run(0);
    assert_eq!(master.slave.state(), DcpState::Running);

    master.do_step(5);

    assert_eq!(master.nacks(), vec![DcpError::InvalidSteps.code()]);
    assert_eq!(master.slave.state(), DcpState::Running);
    master.slave.shutdown();
}

#[test]
fn test_nrt_step_sends_outputs() {
    let mut master = Master::new(false);
    let slave = master.slave.clone();
    master.slave.set_step_callback(
        StepKind::SynchronizedNrt,
        CallbackMode::Sync,
        move |steps| {
            let now = slave.get_output::<f64>(2).unwrap()[0];
            slave.set_output(2, &[now + f64::from(steps)]).unwrap();
        },
    );

    master.register(OpMode::Nrt);
    master.config_output(1, 0, 2);
    master.network(PduType::CfgTargetNetworkInformation, 1, 9100);
    master.output_schedule(1, 1, Scope::Run);
    master.configure();
    assert!(master.recorder.sent_of_type(PduType::DatInputOutput).is_empty());

    master.run(0);
    assert!(master.wait_for(DcpState::Synchronized));
    master.do_step(10);
    assert!(master.wait_for(DcpState::Computed));
    master.command(PduType::StcSendOutputs);
    assert_eq!(master.slave.state(), DcpState::Synchronized);

    let data = master.recorder.sent_of_type(PduType::DatInputOutput);
    assert_eq!(data.len(), 1);
    match *data[0].view().unwrap().body() {
        PduBody::DatInputOutput {
            pdu_seq_id,
            data_id,
            payload,
        } => {
            assert_eq!(pdu_seq_id, 0);
            assert_eq!(data_id, 1);
            assert_eq!(payload, &31.5f64.to_le_bytes()[..]);
        }
        ref other => panic!("unexpected {other:?}"),
    }
    assert!(master.nacks().is_empty());
    master.slave.shutdown();
}

#[test]
fn test_async_synchronize_survives_nrt_step() {
    let mut master = Master::new(false);
    master
        .slave
        .set_phase_callback(PhaseKind::Synchronize, CallbackMode::Async, || {});
    master.register(OpMode::Nrt);
    master.configure();

    master.run(0);
    assert_eq!(master.slave.state(), DcpState::Synchronizing);
    master.do_step(1);
    assert!(master.wait_for(DcpState::Computed));
    master.command(PduType::StcSendOutputs);
    assert_eq!(master.slave.state(), DcpState::Synchronizing);

    let deadline = Instant::now() + WAIT;
    while !master.slave.synchronize_finished() {
        assert!(Instant::now() < deadline, "synchronize callback never ran");
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(master.wait_for(DcpState::Synchronized));
    assert!(master.nacks().is_empty());
    master.slave.shutdown();
}

#[test]
fn test_stop_discards_async_synchronize() {
    let mut master = Master::new(false);
    master
        .slave
        .set_phase_callback(PhaseKind::Synchronize, CallbackMode::Async, || {});
    master.register(OpMode::Nrt);
    master.configure();
    master.run(0);
    assert_eq!(master.slave.state(), DcpState::Synchronizing);

    master.command(PduType::StcStop);
    assert!(master.wait_for(DcpState::Stopped));
    master.slave.synchronize_finished();
    assert_eq!(master.slave.state(), DcpState::Stopped);
    master.slave.shutdown();
}

#[test]
fn test_received_inputs_are_cast() {
    let mut master = Master::new(false);
    master.register(OpMode::Nrt);
    master.config_input(2, 0, 1, DataType::Uint8);
    master.network(PduType::CfgSourceNetworkInformation, 2, 9000);
    master.scope(2, Scope::InitializationRunNonRealTime);
    master.configure();

    master.send(&PduBody::DatInputOutput {
        pdu_seq_id: 0,
        data_id: 2,
        payload: &[42],
    });
    assert_eq!(master.slave.get_input::<u16>(1), Some(vec![42]));

    // wrong payload length is dropped
    master.send(&PduBody::DatInputOutput {
        pdu_seq_id: 1,
        data_id: 2,
        payload: &[7, 7],
    });
    assert_eq!(master.slave.get_input::<u16>(1), Some(vec![42]));
    assert!(master.nacks().is_empty());
    master.slave.shutdown();
}

#[test]
fn test_stop_interrupts_and_reset_recovers() {
    let mut master = Master::new(false);
    let interrupted = Arc::new(Mutex::new(None));
    let i = Arc::clone(&interrupted);
    master
        .slave
        .set_stop_callback(CallbackMode::Sync, move |phase| *i.lock() = Some(phase));

    master.register(OpMode::Nrt);
    master.configure();
    master.command(PduType::StcStop);
    assert!(master.wait_for(DcpState::Stopped));
    assert_eq!(*interrupted.lock(), Some(None));
    assert!(master.recorder.calls().contains(&DriverCall::Stop));

    master.command(PduType::StcReset);
    assert_eq!(master.slave.state(), DcpState::Configuration);
    assert_eq!(master.slave.error_code(), DcpError::None);
    master.slave.shutdown();
}

// ============================================================================
// Heartbeat
// ============================================================================

#[test]
fn test_missed_heartbeat_is_resolved() {
    let mut master = Master::new(true);
    let errors = Arc::new(Mutex::new(Vec::new()));
    let e = Arc::clone(&errors);
    master.slave.set_error_listener(move |code| e.lock().push(code));

    master.register(OpMode::Nrt);
    master.configure();
    master.run(0);
    assert!(master.wait_for(DcpState::Synchronized));
    master.inf_state();
    master.run(0);
    assert_eq!(master.slave.state(), DcpState::Running);
    master.inf_state();

    // stay silent for well over the 100 ms interval
    let resolved = master.recorder.wait_for_sent(WAIT, |sent| {
        announced(sent).last() == Some(&DcpState::ErrorResolved)
    });
    assert!(resolved);
    assert!(master
        .announced()
        .ends_with(&[DcpState::ErrorHandling, DcpState::ErrorResolved]));
    assert_eq!(
        errors.lock().as_slice(),
        &[DcpError::ProtocolErrorHeartbeatMissed]
    );
    assert_eq!(
        master.slave.error_code(),
        DcpError::ProtocolErrorHeartbeatMissed
    );

    let pdu_seq_id = master.next_seq();
    master.send(&PduBody::Basic {
        pdu_type: PduType::InfError,
        pdu_seq_id,
        receiver: DCP_ID,
    });
    let answer = master.recorder.sent_of_type(PduType::RspErrorAck);
    assert!(matches!(
        *answer[0].view().unwrap().body(),
        PduBody::ErrorCode { error_code, .. } if error_code == DcpError::ProtocolErrorHeartbeatMissed.code()
    ));
    master.slave.shutdown();
}

// ============================================================================
// Logging
// ============================================================================

#[test]
fn test_buffered_logs_are_drained_by_inf_log() {
    let mut master = Master::new(false);
    master.register(OpMode::Nrt);
    master.set_logging(SLAVE_LOG_CATEGORY, LogLevel::Debug, LogMode::OnRequest);
    master.command(PduType::StcPrepare);
    assert!(master.wait_for(DcpState::Prepared));

    let pdu_seq_id = master.next_seq();
    master.send(&PduBody::InfLog {
        pdu_seq_id,
        receiver: DCP_ID,
        log_category: SLAVE_LOG_CATEGORY,
        log_max_num: 1,
    });
    let acks = master.recorder.sent_of_type(PduType::RspLogAck);
    assert_eq!(acks.len(), 1);
    match *acks[0].view().unwrap().body() {
        PduBody::LogAck {
            sender,
            resp_seq_id,
            payload,
        } => {
            assert_eq!(sender, DCP_ID);
            assert_eq!(resp_seq_id, pdu_seq_id);
            // time, template id, then "PREPARING" as a length prefixed string
            assert_eq!(payload[8], LogEvent::StateChanged.template().id);
            assert!(payload.len() > 9);
        }
        ref other => panic!("unexpected {other:?}"),
    }
    assert!(master.nacks().is_empty());
    master.slave.shutdown();
}

#[test]
fn test_log_notifications() {
    let mut master = Master::new(false);
    master.register(OpMode::Nrt);
    master.set_logging(0, LogLevel::Error, LogMode::OnNotification);

    // an inadmissible command is logged at error level
    master.run(0);

    assert_eq!(master.nacks().len(), 1);
    let notes = master.recorder.sent_of_type(PduType::NtfLog);
    assert_eq!(notes.len(), 1);
    assert!(matches!(
        *notes[0].view().unwrap().body(),
        PduBody::NtfLog { sender: DCP_ID, template_id, .. } if template_id == LogEvent::PduNotAllowed.template().id
    ));
}

// ============================================================================
// Real-time stepping
// ============================================================================

fn data_count(sent: &[OwnedPdu]) -> usize {
    sent.iter()
        .filter(|pdu| pdu.pdu_type() == Some(PduType::DatInputOutput))
        .count()
}

#[test]
fn test_soft_real_time_run() {
    let mut master = Master::new(false);
    let stepped = Arc::new(AtomicU32::new(0));
    let s = Arc::clone(&stepped);
    master
        .slave
        .set_step_callback(StepKind::Running, CallbackMode::Sync, move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });
    let start = Arc::new(Mutex::new(None));
    let st = Arc::clone(&start);
    master
        .slave
        .set_runtime_listener(move |start_time| *st.lock() = Some(start_time));

    master.register(OpMode::Srt);
    master.config_output(1, 0, 2);
    master.network(PduType::CfgTargetNetworkInformation, 1, 9100);
    master.output_schedule(1, 1, Scope::Run);
    master.configure();

    master.run(0);
    assert!(master.wait_for(DcpState::Synchronized));
    assert_eq!(*start.lock(), Some(0));
    master.run(0);
    assert_eq!(master.slave.state(), DcpState::Running);

    // every 10 ms step sends data id 1
    assert!(master.recorder.wait_for_sent(WAIT, |sent| data_count(sent) >= 3));
    let deadline = Instant::now() + WAIT;
    while stepped.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(stepped.load(Ordering::SeqCst) > 0);

    master.do_step(1);
    assert_eq!(master.nacks(), vec![DcpError::NotSupportedPdu.code()]);

    master.command(PduType::StcStop);
    assert!(master.wait_for(DcpState::Stopped));
    std::thread::sleep(Duration::from_millis(30));
    let sent = data_count(&master.recorder.sent());
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(data_count(&master.recorder.sent()), sent);
    assert!(master.slave.metrics().total_steps >= 3);
    master.slave.shutdown();
}
