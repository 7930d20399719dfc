//! Transport driver abstraction.
//!
//! The slave never touches sockets itself. Everything it sends goes through
//! a [`Driver`], and the driver is told when the slave wants its data
//! channels set up or torn down. Received bytes are pushed into the slave
//! by whoever owns the transport (see `DcpSlave::receive`).

use dcp_codec::OwnedPdu;
use dcp_common::{PduType, SlaveResult, TransportProtocol};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Transport driver used by a slave.
///
/// Only [`Driver::send`] is mandatory; the lifecycle hooks default to
/// no-ops for transports that need no setup.
pub trait Driver: Send + 'static {
    /// Send one PDU to the master (or, for outputs, to the data target).
    fn send(&mut self, pdu: &OwnedPdu) -> SlaveResult<()>;

    /// Start receiving on all configured channels.
    fn start_receiving(&mut self) -> SlaveResult<()> {
        Ok(())
    }

    /// Stop the data channels.
    fn stop(&mut self) -> SlaveResult<()> {
        Ok(())
    }

    /// Prepare data channels after `STC_prepare`.
    fn prepare(&mut self) -> SlaveResult<()> {
        Ok(())
    }

    /// Open data channels after `STC_configure`.
    fn configure(&mut self) -> SlaveResult<()> {
        Ok(())
    }

    /// The slave was registered by a master.
    fn register_successful(&mut self) {}

    /// The master deregistered the slave.
    fn disconnect(&mut self) {}

    /// Where inputs of `data_id` come from.
    fn set_source_network_information(
        &mut self,
        _data_id: u16,
        _transport: TransportProtocol,
        _info: &[u8],
    ) -> SlaveResult<()> {
        Ok(())
    }

    /// Where outputs of `data_id` are sent.
    fn set_target_network_information(
        &mut self,
        _data_id: u16,
        _transport: TransportProtocol,
        _info: &[u8],
    ) -> SlaveResult<()> {
        Ok(())
    }

    /// Where tunable parameters of `param_id` are received.
    fn set_param_network_information(
        &mut self,
        _param_id: u16,
        _transport: TransportProtocol,
        _info: &[u8],
    ) -> SlaveResult<()> {
        Ok(())
    }
}

/// Driver lifecycle call seen by a [`RecordingDriver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    /// `start_receiving`.
    StartReceiving,
    /// `stop`.
    Stop,
    /// `prepare`.
    Prepare,
    /// `configure`.
    Configure,
    /// `register_successful`.
    RegisterSuccessful,
    /// `disconnect`.
    Disconnect,
    /// `set_source_network_information`.
    SourceNetworkInformation {
        /// Data id.
        data_id: u16,
        /// Transport.
        transport: TransportProtocol,
        /// Raw information bytes.
        info: Vec<u8>,
    },
    /// `set_target_network_information`.
    TargetNetworkInformation {
        /// Data id.
        data_id: u16,
        /// Transport.
        transport: TransportProtocol,
        /// Raw information bytes.
        info: Vec<u8>,
    },
    /// `set_param_network_information`.
    ParamNetworkInformation {
        /// Parameter id.
        param_id: u16,
        /// Transport.
        transport: TransportProtocol,
        /// Raw information bytes.
        info: Vec<u8>,
    },
}

#[derive(Debug, Default)]
struct Recording {
    sent: Vec<OwnedPdu>,
    calls: Vec<DriverCall>,
}

/// In-memory driver that records everything the slave does.
///
/// Clones share the same recording, so a test can keep one clone while
/// the slave owns another.
#[derive(Debug, Clone, Default)]
pub struct RecordingDriver {
    inner: Arc<(Mutex<Recording>, Condvar)>,
}

impl RecordingDriver {
    /// Create an empty recording.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All PDUs sent so far.
    #[must_use]
    pub fn sent(&self) -> Vec<OwnedPdu> {
        self.inner.0.lock().sent.clone()
    }

    /// Sent PDUs of one type.
    #[must_use]
    pub fn sent_of_type(&self, pdu_type: PduType) -> Vec<OwnedPdu> {
        self.inner
            .0
            .lock()
            .sent
            .iter()
            .filter(|pdu| pdu.pdu_type() == Some(pdu_type))
            .cloned()
            .collect()
    }

    /// Remove and return all sent PDUs.
    pub fn take_sent(&self) -> Vec<OwnedPdu> {
        std::mem::take(&mut self.inner.0.lock().sent)
    }

    /// Lifecycle calls so far.
    #[must_use]
    pub fn calls(&self) -> Vec<DriverCall> {
        self.inner.0.lock().calls.clone()
    }

    /// Block until `predicate` holds for the sent PDUs or `timeout` passes.
    /// Returns the final predicate value.
    pub fn wait_for_sent<F>(&self, timeout: Duration, mut predicate: F) -> bool
    where
        F: FnMut(&[OwnedPdu]) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let (lock, cvar) = &*self.inner;
        let mut recording = lock.lock();
        loop {
            if predicate(&recording.sent) {
                return true;
            }
            if cvar.wait_until(&mut recording, deadline).timed_out() {
                return predicate(&recording.sent);
            }
        }
    }

    fn record_call(&self, call: DriverCall) {
        self.inner.0.lock().calls.push(call);
    }
}

impl Driver for RecordingDriver {
    fn send(&mut self, pdu: &OwnedPdu) -> SlaveResult<()> {
        let (lock, cvar) = &*self.inner;
        lock.lock().sent.push(pdu.clone());
        cvar.notify_all();
        Ok(())
    }

    fn start_receiving(&mut self) -> SlaveResult<()> {
        self.record_call(DriverCall::StartReceiving);
        Ok(())
    }

    fn stop(&mut self) -> SlaveResult<()> {
        self.record_call(DriverCall::Stop);
        Ok(())
    }

    fn prepare(&mut self) -> SlaveResult<()> {
        self.record_call(DriverCall::Prepare);
        Ok(())
    }

    fn configure(&mut self) -> SlaveResult<()> {
        self.record_call(DriverCall::Configure);
        Ok(())
    }

    fn register_successful(&mut self) {
        self.record_call(DriverCall::RegisterSuccessful);
    }

    fn disconnect(&mut self) {
        self.record_call(DriverCall::Disconnect);
    }

    fn set_source_network_information(
        &mut self,
        data_id: u16,
        transport: TransportProtocol,
        info: &[u8],
    ) -> SlaveResult<()> {
        self.record_call(DriverCall::SourceNetworkInformation {
            data_id,
            transport,
            info: info.to_vec(),
        });
        Ok(())
    }

    fn set_target_network_information(
        &mut self,
        data_id: u16,
        transport: TransportProtocol,
        info: &[u8],
    ) -> SlaveResult<()> {
        self.record_call(DriverCall::TargetNetworkInformation {
            data_id,
            transport,
            info: info.to_vec(),
        });
        Ok(())
    }

    fn set_param_network_information(
        &mut self,
        param_id: u16,
        transport: TransportProtocol,
        info: &[u8],
    ) -> SlaveResult<()> {
        self.record_call(DriverCall::ParamNetworkInformation {
            param_id,
            transport,
            info: info.to_vec(),
        });
        Ok(())
    }
}
