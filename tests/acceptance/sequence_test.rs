//! Sequence supervision acceptance tests.
//!
//! With `check_sequence_ids` enabled, a consumer slave must drop repeated
//! or outdated PDUs without touching its values, and report lost ones.

use super::common::*;
use dcp_codec::{OwnedPdu, PduBody};
use dcp_common::{DataType, OpMode, PduType, RuntimeConfig};
use dcp_slave::Channel;
use parking_lot::Mutex;
use std::sync::Arc;

const CONSUMER_ID: u8 = 4;

fn supervised_consumer() -> Master {
    let mut config = RuntimeConfig::default();
    config.sequence.check_sequence_ids = true;
    let mut master = Master::new(&consumer_description(), CONSUMER_ID, config);
    master.register(OpMode::Nrt);
    master.configure_consumer();
    master.prepare_and_configure();
    master
}

fn measured(master: &Master) -> f64 {
    master.slave.get_input::<f64>(CONSUMER_INPUT).unwrap()[0]
}

#[test]
fn test_duplicate_data_leaves_inputs_untouched() {
    let master = supervised_consumer();

    master.slave.receive(float_data(0, 1.5).as_bytes()).unwrap();
    assert_eq!(measured(&master), 1.5);

    master.slave.receive(float_data(0, 99.0).as_bytes()).unwrap();
    assert_eq!(measured(&master), 1.5);

    master.slave.receive(float_data(1, 2.5).as_bytes()).unwrap();
    assert_eq!(measured(&master), 2.5);

    // older than the last accepted number
    master.slave.receive(float_data(0, 99.0).as_bytes()).unwrap();
    assert_eq!(measured(&master), 2.5);
    assert!(master.nacks().is_empty());
}

#[test]
fn test_lost_data_is_reported_and_newer_data_applied() {
    let master = supervised_consumer();
    let missed = Arc::new(Mutex::new(Vec::new()));
    let m = Arc::clone(&missed);
    master.slave.set_missed_listener(move |channel| m.lock().push(channel));

    master.slave.receive(float_data(10, 1.0).as_bytes()).unwrap();
    master.slave.receive(float_data(14, 5.0).as_bytes()).unwrap();

    assert_eq!(measured(&master), 5.0);
    assert_eq!(
        missed.lock().as_slice(),
        &[Channel::InputOutput(LINK_DATA_ID)]
    );
}

#[test]
fn test_data_sequence_wraps_around() {
    let master = supervised_consumer();

    master.slave.receive(float_data(0xFFFF, 1.0).as_bytes()).unwrap();
    master.slave.receive(float_data(0, 2.0).as_bytes()).unwrap();

    assert_eq!(measured(&master), 2.0);
}

#[test]
fn test_repeated_control_pdu_is_not_acknowledged_twice() {
    let mut config = RuntimeConfig::default();
    config.sequence.check_sequence_ids = true;
    let mut master = Master::new(&consumer_description(), CONSUMER_ID, config);
    master.register(OpMode::Nrt);

    let pdu_seq_id = master.next_seq();
    let input = OwnedPdu::encode(&PduBody::ConfigInput {
        pdu_seq_id,
        receiver: CONSUMER_ID,
        data_id: LINK_DATA_ID,
        pos: 0,
        target_vr: CONSUMER_INPUT,
        source_data_type: DataType::Float64 as u8,
    });
    master.slave.receive(input.as_bytes()).unwrap();
    let acks = master.recorder.sent_of_type(PduType::RspAck).len();

    master.slave.receive(input.as_bytes()).unwrap();
    assert_eq!(master.recorder.sent_of_type(PduType::RspAck).len(), acks);
    assert!(master.nacks().is_empty());
}
