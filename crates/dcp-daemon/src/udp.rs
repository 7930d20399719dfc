//! UDP/IPv4 transport for the daemon.
//!
//! One control socket talks to the master. Source and parameter channels
//! get their own sockets once the master has sent network information and
//! the slave is configured. Every reader thread pushes datagrams into one
//! channel, drained by the receive loop in `main`.

use crate::diagnostics::DiagnosticsState;
use dcp_codec::OwnedPdu;
use dcp_common::{PduType, SlaveError, SlaveResult, TransportConfig, TransportProtocol};
use dcp_slave::Driver;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, trace, warn};

/// A datagram read from any of the driver's sockets.
#[derive(Debug, Clone)]
pub struct Datagram {
    /// Sender address.
    pub from: SocketAddr,
    /// Raw frame, still carrying its length prefix.
    pub bytes: Vec<u8>,
}

/// Parse UDP network information: port (u16) then IPv4 address (u32),
/// both little endian. Address 0 means any local interface.
pub fn parse_network_information(info: &[u8]) -> SlaveResult<SocketAddrV4> {
    let (Some(port), Some(ip)) = (info.get(0..2), info.get(2..6)) else {
        return Err(SlaveError::Driver(format!(
            "UDP network information needs 6 bytes, got {}",
            info.len()
        )));
    };
    let port = u16::from_le_bytes([port[0], port[1]]);
    let ip = u32::from_le_bytes([ip[0], ip[1], ip[2], ip[3]]);
    Ok(SocketAddrV4::new(Ipv4Addr::from(ip), port))
}

struct Reader {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Reader {
    fn spawn(
        name: String,
        socket: UdpSocket,
        context: &ReaderContext,
        record_master: bool,
    ) -> std::io::Result<Self> {
        socket.set_read_timeout(Some(context.read_timeout))?;
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let inbox = context.inbox.clone();
        let diagnostics = Arc::clone(&context.diagnostics);
        let master = record_master.then(|| Arc::clone(&context.master));
        let mut buf = vec![0u8; context.max_frame];

        let handle = std::thread::Builder::new().name(name).spawn(move || {
            while flag.load(Ordering::Relaxed) {
                match socket.recv_from(&mut buf) {
                    Ok((n, from)) => {
                        diagnostics.record_received();
                        if let Some(master) = &master {
                            *master.lock() = Some(from);
                        }
                        let datagram = Datagram {
                            from,
                            bytes: buf[..n].to_vec(),
                        };
                        if inbox.send(datagram).is_err() {
                            break;
                        }
                    }
                    Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                    Err(e) => warn!(error = %e, "UDP receive failed"),
                }
            }
        })?;

        Ok(Self { running, handle })
    }

    fn close(self) {
        self.running.store(false, Ordering::Relaxed);
        if self.handle.join().is_err() {
            warn!("UDP reader thread panicked");
        }
    }
}

struct ReaderContext {
    inbox: Sender<Datagram>,
    master: Arc<Mutex<Option<SocketAddr>>>,
    diagnostics: Arc<DiagnosticsState>,
    read_timeout: std::time::Duration,
    max_frame: usize,
}

/// [`Driver`] over UDP/IPv4 sockets.
pub struct UdpDriver {
    control: UdpSocket,
    context: ReaderContext,
    /// Channels to open on `configure`, keyed by a label for logging.
    inbound: BTreeMap<String, SocketAddrV4>,
    targets: HashMap<u16, SocketAddr>,
    control_reader: Option<Reader>,
    data_readers: Vec<Reader>,
}

impl UdpDriver {
    /// Bind the control socket. The returned receiver yields every datagram
    /// the driver reads.
    pub fn bind(
        config: &TransportConfig,
        diagnostics: Arc<DiagnosticsState>,
    ) -> std::io::Result<(Self, Receiver<Datagram>)> {
        let control = UdpSocket::bind(config.bind.as_str())?;
        let (inbox, rx) = mpsc::channel();
        let driver = Self {
            control,
            context: ReaderContext {
                inbox,
                master: Arc::new(Mutex::new(None)),
                diagnostics,
                read_timeout: config.read_timeout,
                max_frame: config.max_pdu_size + dcp_codec::LENGTH_PREFIX_SIZE,
            },
            inbound: BTreeMap::new(),
            targets: HashMap::new(),
            control_reader: None,
            data_readers: Vec::new(),
        };
        Ok((driver, rx))
    }

    /// Address of the control socket.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.control.local_addr()
    }

    /// Address of the master, once it has sent anything.
    pub fn master(&self) -> Option<SocketAddr> {
        *self.context.master.lock()
    }

    fn close_data_channels(&mut self) {
        for reader in self.data_readers.drain(..) {
            reader.close();
        }
    }

    fn remember_inbound(
        &mut self,
        label: String,
        transport: TransportProtocol,
        info: &[u8],
    ) -> SlaveResult<()> {
        check_transport(transport)?;
        let addr = parse_network_information(info)?;
        debug!(channel = %label, %addr, "Inbound channel announced");
        self.inbound.insert(label, addr);
        Ok(())
    }

    fn deliver(&self, frame: &[u8], to: SocketAddr) -> SlaveResult<()> {
        let result = self.control.send_to(frame, to);
        self.context.diagnostics.record_sent(result.is_ok());
        result
            .map(|_| ())
            .map_err(|e| SlaveError::Io(format!("send to {to} failed: {e}")))
    }
}

fn check_transport(transport: TransportProtocol) -> SlaveResult<()> {
    if transport == TransportProtocol::UdpIpv4 {
        Ok(())
    } else {
        Err(SlaveError::Driver(format!(
            "transport {transport:?} is not served by the UDP driver"
        )))
    }
}

impl Driver for UdpDriver {
    fn send(&mut self, pdu: &OwnedPdu) -> SlaveResult<()> {
        let destination = if pdu.pdu_type() == Some(PduType::DatInputOutput) {
            let data_id = pdu
                .as_bytes()
                .get(3..5)
                .map(|b| u16::from_le_bytes([b[0], b[1]]))
                .ok_or_else(|| SlaveError::Codec("truncated DAT_input_output".into()))?;
            *self
                .targets
                .get(&data_id)
                .ok_or_else(|| SlaveError::Driver(format!("no target for data id {data_id}")))?
        } else {
            self.master()
                .ok_or_else(|| SlaveError::Driver("no master address known".into()))?
        };
        trace!(type_id = pdu.type_id(), to = %destination, "Sending PDU");
        self.deliver(pdu.as_frame(), destination)
    }

    fn start_receiving(&mut self) -> SlaveResult<()> {
        if self.control_reader.is_some() {
            return Ok(());
        }
        let socket = self
            .control
            .try_clone()
            .map_err(|e| SlaveError::Io(e.to_string()))?;
        let reader = Reader::spawn("dcp-udp-control".into(), socket, &self.context, true)
            .map_err(|e| SlaveError::Spawn {
                name: "dcp-udp-control".into(),
                message: e.to_string(),
            })?;
        self.control_reader = Some(reader);
        info!(addr = ?self.control.local_addr().ok(), "Control channel listening");
        Ok(())
    }

    fn stop(&mut self) -> SlaveResult<()> {
        self.close_data_channels();
        self.inbound.clear();
        self.targets.clear();
        Ok(())
    }

    fn configure(&mut self) -> SlaveResult<()> {
        self.close_data_channels();
        let control_port = self.control.local_addr().map(|a| a.port()).ok();
        for (label, addr) in &self.inbound {
            if Some(addr.port()) == control_port {
                // already read by the control reader
                continue;
            }
            let socket = UdpSocket::bind(addr)
                .map_err(|e| SlaveError::Io(format!("bind {addr} for {label} failed: {e}")))?;
            let name = format!("dcp-udp-{label}");
            let reader = Reader::spawn(name.clone(), socket, &self.context, false)
                .map_err(|e| SlaveError::Spawn {
                    name,
                    message: e.to_string(),
                })?;
            self.data_readers.push(reader);
            debug!(channel = %label, %addr, "Inbound channel open");
        }
        Ok(())
    }

    fn register_successful(&mut self) {
        info!(master = ?self.master(), "Registered by master");
    }

    fn disconnect(&mut self) {
        self.close_data_channels();
        self.inbound.clear();
        self.targets.clear();
        *self.context.master.lock() = None;
        info!("Master disconnected");
    }

    fn set_source_network_information(
        &mut self,
        data_id: u16,
        transport: TransportProtocol,
        info: &[u8],
    ) -> SlaveResult<()> {
        self.remember_inbound(format!("source-{data_id}"), transport, info)
    }

    fn set_target_network_information(
        &mut self,
        data_id: u16,
        transport: TransportProtocol,
        info: &[u8],
    ) -> SlaveResult<()> {
        check_transport(transport)?;
        let addr = parse_network_information(info)?;
        debug!(data_id, %addr, "Output target set");
        self.targets.insert(data_id, SocketAddr::V4(addr));
        Ok(())
    }

    fn set_param_network_information(
        &mut self,
        param_id: u16,
        transport: TransportProtocol,
        info: &[u8],
    ) -> SlaveResult<()> {
        self.remember_inbound(format!("param-{param_id}"), transport, info)
    }
}

impl Drop for UdpDriver {
    fn drop(&mut self) {
        self.close_data_channels();
        if let Some(reader) = self.control_reader.take() {
            reader.close();
        }
    }
}
