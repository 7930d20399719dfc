//! Fault and recovery acceptance tests.
//!
//! A running slave whose master falls silent must leave the simulation
//! through the error states and become usable again after a reset.
//! The slave and its runtime settings are loaded from files, the way the
//! daemon starts them.

use super::common::*;
use dcp_codec::PduBody;
use dcp_common::{DcpError, DcpState, OpMode, PduType, RuntimeConfig};
use dcp_slave::SlaveDescription;
use std::io::Write;
use tempfile::NamedTempFile;

const SLAVE_ID: u8 = 9;

fn write_temp(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

/// Producer with heartbeat supervision, loaded from files.
fn supervised_producer(auto_resolve: bool) -> Master {
    let description = write_temp(&producer_description(true));
    let config = write_temp(&format!(
        "[heartbeat]\nauto_resolve = {auto_resolve}\nmin_check_interval = \"5ms\"\n"
    ));

    let description = SlaveDescription::from_file(description.path()).unwrap();
    let config = RuntimeConfig::from_file(config.path()).unwrap();
    assert_eq!(config.heartbeat.auto_resolve, auto_resolve);

    Master::from_description(description, SLAVE_ID, config)
}

/// Register, configure and start running, keeping the heartbeat alive.
fn run_silently_after_start(master: &mut Master) {
    master.register(OpMode::Nrt);
    master.configure_producer();
    master.inf_state();
    master.prepare_and_configure();
    master.inf_state();
    master.start_running();
    master.inf_state();
}

fn wait_for_announced(master: &Master, state: DcpState) -> bool {
    master
        .recorder
        .wait_for_sent(WAIT, |sent| announced(sent).last() == Some(&state))
}

#[test]
fn test_heartbeat_loss_resolves_and_resets() {
    let mut master = supervised_producer(true);
    run_silently_after_start(&mut master);

    assert!(wait_for_announced(&master, DcpState::ErrorResolved));
    assert!(master
        .announced()
        .ends_with(&[DcpState::ErrorHandling, DcpState::ErrorResolved]));
    assert_eq!(
        master.slave.error_code(),
        DcpError::ProtocolErrorHeartbeatMissed
    );

    master.inf_error();
    let answers = master.recorder.sent_of_type(PduType::RspErrorAck);
    assert_eq!(answers.len(), 1);
    assert!(matches!(
        *answers[0].view().unwrap().body(),
        PduBody::ErrorCode { error_code, .. }
            if error_code == DcpError::ProtocolErrorHeartbeatMissed.code()
    ));

    master.command(PduType::StcReset);
    assert_eq!(master.slave.state(), DcpState::Configuration);
    assert_eq!(master.slave.error_code(), DcpError::None);

    master.command(PduType::StcDeregister);
    assert_eq!(master.slave.state(), DcpState::Alive);
}

#[test]
fn test_heartbeat_loss_waits_for_host_resolution() {
    let mut master = supervised_producer(false);
    run_silently_after_start(&mut master);

    assert!(wait_for_announced(&master, DcpState::ErrorHandling));
    assert_eq!(master.slave.state(), DcpState::ErrorHandling);

    // only INF_error is served until the host resolves the error
    master.command(PduType::StcReset);
    assert_eq!(master.slave.state(), DcpState::ErrorHandling);
    assert_eq!(
        master.nacks(),
        vec![DcpError::ProtocolErrorPduNotAllowedInThisState.code()]
    );

    assert!(master.slave.goto_error_resolved());
    assert_eq!(master.slave.state(), DcpState::ErrorResolved);
    master.command(PduType::StcReset);
    assert_eq!(master.slave.state(), DcpState::Configuration);
}

#[test]
fn test_host_stop_ends_the_simulation() {
    let mut master = Master::new(&producer_description(false), SLAVE_ID, RuntimeConfig::default());
    master.register(OpMode::Nrt);
    master.configure_producer();
    master.prepare_and_configure();
    master.start_running();
    master.step(1);

    assert!(master.slave.stop());
    assert!(master.wait_for(DcpState::Stopped));
    assert!(master.announced().ends_with(&[DcpState::Stopping, DcpState::Stopped]));

    // stepping is over
    master.do_step(1);
    assert_eq!(master.slave.state(), DcpState::Stopped);
    assert_eq!(master.outputs().len(), 1);

    master.command(PduType::StcReset);
    assert_eq!(master.slave.state(), DcpState::Configuration);
}
