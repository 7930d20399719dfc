//! Co-simulation acceptance tests.
//!
//! A producer slave computes a temperature and sends it every step; a
//! consumer slave receives it as an input. The master drives both in
//! non-real-time lockstep.

use super::common::*;
use dcp_codec::PduBody;
use dcp_common::{DataType, DcpState, OpMode, PduType, RuntimeConfig};
use dcp_slave::{CallbackMode, StepKind};

const PRODUCER_ID: u8 = 1;
const CONSUMER_ID: u8 = 2;
const GAIN_PARAM_ID: u16 = 7;

/// Producer whose temperature rises by `gain` per step.
fn heating_producer() -> Master {
    let master = Master::new(
        &producer_description(false),
        PRODUCER_ID,
        RuntimeConfig::default(),
    );
    let slave = master.slave.clone();
    master
        .slave
        .set_step_callback(StepKind::RunningNrt, CallbackMode::Sync, move |steps| {
            let gain = slave.get_parameter::<f64>(PRODUCER_GAIN).unwrap()[0];
            let now = slave.get_output::<f64>(PRODUCER_OUTPUT).unwrap()[0];
            slave
                .set_output(PRODUCER_OUTPUT, &[now + gain * f64::from(steps)])
                .unwrap();
        });
    master
}

fn consumer() -> Master {
    Master::new(&consumer_description(), CONSUMER_ID, RuntimeConfig::default())
}

// ============================================================================
// Lockstep
// ============================================================================

#[test]
fn test_linked_slaves_run_in_lockstep() {
    let mut producer = heating_producer();
    let mut consumer = consumer();
    producer.link_to(&consumer);

    producer.register(OpMode::Nrt);
    consumer.register(OpMode::Nrt);
    assert_eq!(producer.slave.state(), DcpState::Configuration);
    assert_eq!(consumer.slave.state(), DcpState::Configuration);

    producer.configure_producer();
    consumer.configure_consumer();
    producer.prepare_and_configure();
    consumer.prepare_and_configure();
    consumer.start_running();
    producer.start_running();

    for step in 1..=3u32 {
        producer.step(1);
        assert_eq!(
            consumer.slave.get_input::<f64>(CONSUMER_INPUT),
            Some(vec![20.0 + f64::from(step)])
        );
    }

    let sequence: Vec<u16> = producer.outputs().iter().map(|(seq, _)| *seq).collect();
    assert_eq!(sequence, vec![0, 1, 2]);
    assert!(producer.nacks().is_empty());
    assert!(consumer.nacks().is_empty());
}

#[test]
fn test_multi_step_advances_by_step_count() {
    let mut producer = heating_producer();
    producer.register(OpMode::Nrt);
    producer.configure_producer();
    producer.prepare_and_configure();
    producer.start_running();

    producer.step(5);

    let outputs = producer.outputs();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].1, 25.0f64.to_le_bytes().to_vec());
}

// ============================================================================
// Parameters
// ============================================================================

#[test]
fn test_parameter_set_during_configuration() {
    let mut producer = heating_producer();
    producer.register(OpMode::Nrt);

    let pdu_seq_id = producer.next_seq();
    producer.send(&PduBody::SetParameter {
        pdu_seq_id,
        receiver: PRODUCER_ID,
        parameter_vr: PRODUCER_GAIN,
        source_data_type: DataType::Float64 as u8,
        configuration: &0.5f64.to_le_bytes(),
    });
    assert!(producer.nacks().is_empty());
    assert_eq!(
        producer.slave.get_parameter::<f64>(PRODUCER_GAIN),
        Some(vec![0.5])
    );

    producer.configure_producer();
    producer.prepare_and_configure();
    producer.start_running();
    producer.step(4);

    assert_eq!(producer.outputs()[0].1, 22.0f64.to_le_bytes().to_vec());
}

#[test]
fn test_tunable_parameter_reaches_running_slave() {
    let mut producer = heating_producer();
    producer.register(OpMode::Nrt);
    producer.configure_producer();
    producer.config_tunable(GAIN_PARAM_ID, 0, PRODUCER_GAIN, DataType::Float64);
    producer.network(PduType::CfgParamNetworkInformation, GAIN_PARAM_ID, 9500);
    producer.prepare_and_configure();
    producer.start_running();

    producer.step(1);
    producer.send(&PduBody::DatParameter {
        pdu_seq_id: 0,
        param_id: GAIN_PARAM_ID,
        configuration: &2.5f64.to_le_bytes(),
    });
    assert_eq!(
        producer.slave.get_parameter::<f64>(PRODUCER_GAIN),
        Some(vec![2.5])
    );
    producer.step(2);

    let outputs = producer.outputs();
    assert_eq!(outputs.len(), 2);
    assert_eq!(outputs[0].1, 21.0f64.to_le_bytes().to_vec());
    assert_eq!(outputs[1].1, 26.0f64.to_le_bytes().to_vec());
    assert!(producer.nacks().is_empty());
}

#[test]
fn test_parameter_network_port_must_be_advertised() {
    let mut producer = heating_producer();
    producer.register(OpMode::Nrt);
    producer.config_tunable(GAIN_PARAM_ID, 0, PRODUCER_GAIN, DataType::Float64);
    producer.network(PduType::CfgParamNetworkInformation, GAIN_PARAM_ID, 9501);

    assert_eq!(producer.nacks().len(), 1);
    producer.command(PduType::StcPrepare);
    assert!(producer.wait_for(DcpState::Prepared));
    producer.command(PduType::StcConfigure);
    // the parameter channel has no network information
    assert_eq!(producer.slave.state(), DcpState::Prepared);
    assert_eq!(producer.nacks().len(), 2);
}
