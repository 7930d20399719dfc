//! Unix signal handling for the daemon.
//!
//! SIGTERM and SIGINT ask the receive loop to stop the slave and exit;
//! SIGHUP asks it to log a status report. The raw handlers only set bits in
//! a static word, and a watcher thread moves them into [`SignalState`].

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Signals the daemon reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// SIGTERM.
    Terminate = 1,
    /// SIGINT.
    Interrupt = 2,
    /// SIGHUP.
    Hangup = 4,
}

impl SignalKind {
    const ALL: [SignalKind; 3] = [Self::Terminate, Self::Interrupt, Self::Hangup];

    fn bit(self) -> u32 {
        self as u32
    }

    fn is_shutdown(self) -> bool {
        matches!(self, Self::Terminate | Self::Interrupt)
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalKind::Terminate => write!(f, "SIGTERM"),
            SignalKind::Interrupt => write!(f, "SIGINT"),
            SignalKind::Hangup => write!(f, "SIGHUP"),
        }
    }
}

/// Flags shared between the watcher thread and the receive loop.
#[derive(Debug, Default)]
pub struct SignalState {
    shutdown_requested: AtomicBool,
    status_requested: AtomicBool,
    signal_count: AtomicU32,
}

impl SignalState {
    /// Create a state with nothing requested.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the daemon should shut down.
    #[inline]
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Relaxed)
    }

    /// Whether a status report was requested; clears the request.
    #[inline]
    pub fn take_status_request(&self) -> bool {
        self.status_requested.swap(false, Ordering::Relaxed)
    }

    /// Ask the daemon to shut down.
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::Relaxed);
    }

    /// Ask for a status report.
    pub fn request_status(&self) {
        self.status_requested.store(true, Ordering::Relaxed);
    }

    /// Number of signals delivered so far.
    pub fn signal_count(&self) -> u32 {
        self.signal_count.load(Ordering::Relaxed)
    }

    fn deliver(&self, kind: SignalKind) {
        self.signal_count.fetch_add(1, Ordering::Relaxed);
        if kind.is_shutdown() {
            info!(signal = %kind, "Shutdown requested");
            self.request_shutdown();
        } else {
            info!(signal = %kind, "Status report requested");
            self.request_status();
        }
    }
}

/// Pending signal bits, written from the raw handlers.
static PENDING: AtomicU32 = AtomicU32::new(0);

/// Installs the signal handlers and exposes the shared [`SignalState`].
#[derive(Clone)]
pub struct SignalHandler {
    state: Arc<SignalState>,
}

impl SignalHandler {
    /// Create a handler. On Unix this installs handlers for SIGTERM,
    /// SIGINT and SIGHUP; elsewhere only [`SignalHandler::request_shutdown`]
    /// stops the daemon.
    pub fn new() -> std::io::Result<Self> {
        let handler = Self {
            state: Arc::new(SignalState::new()),
        };

        #[cfg(unix)]
        handler.install()?;

        Ok(handler)
    }

    #[cfg(unix)]
    fn install(&self) -> std::io::Result<()> {
        extern "C" fn on_signal(signum: libc::c_int) {
            let bit = match signum {
                libc::SIGTERM => SignalKind::Terminate.bit(),
                libc::SIGINT => SignalKind::Interrupt.bit(),
                _ => SignalKind::Hangup.bit(),
            };
            PENDING.fetch_or(bit, Ordering::Relaxed);
        }

        let state = Arc::clone(&self.state);
        std::thread::Builder::new()
            .name("dcp-signals".into())
            .spawn(move || {
                while !state.shutdown_requested() {
                    let pending = PENDING.swap(0, Ordering::Relaxed);
                    for kind in SignalKind::ALL {
                        if pending & kind.bit() != 0 {
                            state.deliver(kind);
                        }
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
            })?;

        for signum in [libc::SIGTERM, libc::SIGINT, libc::SIGHUP] {
            // SAFETY: the handler only touches an atomic, which is
            // async-signal-safe.
            let previous = unsafe { libc::signal(signum, on_signal as libc::sighandler_t) };
            if previous == libc::SIG_ERR {
                return Err(std::io::Error::last_os_error());
            }
        }

        debug!("Signal handlers installed");
        Ok(())
    }

    /// Whether the daemon should shut down.
    #[inline]
    pub fn shutdown_requested(&self) -> bool {
        self.state.shutdown_requested()
    }

    /// Whether a status report was requested; clears the request.
    #[inline]
    pub fn take_status_request(&self) -> bool {
        self.state.take_status_request()
    }

    /// Stop the daemon without a signal.
    pub fn request_shutdown(&self) {
        info!("Shutdown requested");
        self.state.request_shutdown();
    }

    /// Shared flags.
    pub fn state(&self) -> &SignalState {
        &self.state
    }
}

/// Block until shutdown is requested or `timeout` passes.
///
/// Returns `true` if shutdown was requested.
pub fn wait_for_shutdown(handler: &SignalHandler, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if handler.shutdown_requested() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(50)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_state_default() {
        let state = SignalState::new();
        assert!(!state.shutdown_requested());
        assert!(!state.take_status_request());
        assert_eq!(state.signal_count(), 0);
    }

    #[test]
    fn test_delivery_sets_flags() {
        let state = SignalState::new();

        state.deliver(SignalKind::Hangup);
        assert!(!state.shutdown_requested());
        assert!(state.take_status_request());
        assert!(!state.take_status_request());

        state.deliver(SignalKind::Interrupt);
        assert!(state.shutdown_requested());
        assert_eq!(state.signal_count(), 2);
    }

    #[test]
    fn test_manual_shutdown() {
        let handler = SignalHandler::new().unwrap();
        assert!(!wait_for_shutdown(&handler, Duration::from_millis(20)));

        handler.request_shutdown();
        assert!(handler.shutdown_requested());
        assert!(wait_for_shutdown(&handler, Duration::from_millis(20)));
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(SignalKind::Terminate.to_string(), "SIGTERM");
        assert_eq!(SignalKind::Hangup.to_string(), "SIGHUP");
    }
}
