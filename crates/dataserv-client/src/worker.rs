//! Shared plumbing for both client background reactors: the "start blocks
//! until negotiation succeeds or fails" handshake signal (§4.8), the
//! pending-exception slot errors raised off-thread are surfaced through
//! (§7 `ConnectFailure`, §10.2), and the single-connection negotiation
//! first-frame helper both `DataSource` and `DataSink` send.

use std::sync::{
    Condvar, Mutex,
    atomic::{AtomicBool, Ordering},
};

use dataserv_core::proto::{DataMode, NegotiationTag, first_frame_metadata};
use dataserv_transport::tcp::{ConnState, SendBehavior, TcpConnector};
use mio::Token;

use crate::error::ClientError;

/// The connector used by each client instance ever makes exactly one
/// `connect()` call, on a freshly constructed `TcpConnector` (whose tokens
/// start at zero) - so the logical connection this client maintains across
/// reconnects always carries this token.
pub(crate) const CONN_TOKEN: Token = Token(0);

/// One-shot "did the handshake succeed" signal that `start()` blocks on.
pub(crate) struct ReadySignal {
    state: Mutex<Option<Result<(), ClientError>>>,
    cv: Condvar,
}

impl ReadySignal {
    pub(crate) fn new() -> Self {
        Self { state: Mutex::new(None), cv: Condvar::new() }
    }

    pub(crate) fn succeed(&self) {
        let mut state = self.state.lock().unwrap();
        if state.is_none() {
            *state = Some(Ok(()));
            self.cv.notify_all();
        }
    }

    pub(crate) fn fail(&self, err: ClientError) {
        let mut state = self.state.lock().unwrap();
        if state.is_none() {
            *state = Some(Err(err));
            self.cv.notify_all();
        }
    }

    /// Blocks until `succeed`/`fail` is called from the background worker.
    pub(crate) fn wait(&self) -> Result<(), ClientError> {
        let mut state = self.state.lock().unwrap();
        while state.is_none() {
            state = self.cv.wait(state).unwrap();
        }
        match state.as_ref().expect("checked above") {
            Ok(()) => Ok(()),
            Err(ClientError::ConnectFailure) => Err(ClientError::ConnectFailure),
            Err(_) => Err(ClientError::ConnectFailure),
        }
    }
}

/// Slot errors raised on the background reactor thread are deposited into,
/// for the next `push`/`pop` call to surface (§4.8, §7 `ConnectFailure`).
#[derive(Default)]
pub(crate) struct PendingError(Mutex<Option<ClientError>>);

impl PendingError {
    pub(crate) fn set(&self, err: ClientError) {
        *self.0.lock().unwrap() = Some(err);
    }

    /// Returns and clears any pending error.
    pub(crate) fn take(&self) -> Option<ClientError> {
        self.0.lock().unwrap().take()
    }
}

/// Sends the two-frame negotiation handshake (§4.2): tag (+ sink data-mode,
/// packed into the same first frame's secondary metadata byte) then the
/// dataset name. Returns whether the connection is still alive afterwards.
pub(crate) fn send_negotiation(
    connector: &mut TcpConnector,
    tag: NegotiationTag,
    mode: DataMode,
    dataset: &str,
) -> bool {
    let metadata = first_frame_metadata(tag, mode);
    let alive = connector.write_or_enqueue_with(SendBehavior::Single(CONN_TOKEN), metadata, |_| {});
    if alive != ConnState::Alive {
        return false;
    }
    let name = dataset.as_bytes().to_vec();
    connector.write_or_enqueue_with(SendBehavior::Single(CONN_TOKEN), dataserv_transport::Metadata::ZERO, |buf| {
        buf.extend_from_slice(&name);
    }) == ConnState::Alive
}

/// Whether the logical connection is currently down (never connected, or
/// awaiting a reconnect attempt after a disconnect).
pub(crate) fn is_pending_reconnect(connector: &TcpConnector) -> bool {
    connector.currently_disconnected().any(|t| t == CONN_TOKEN)
}

/// Shared shutdown flag type alias, to keep signatures short across the two
/// worker modules.
pub(crate) type Shutdown = AtomicBool;

pub(crate) fn new_shutdown_flag() -> Shutdown {
    AtomicBool::new(false)
}

pub(crate) fn is_shutting_down(flag: &Shutdown) -> bool {
    flag.load(Ordering::Relaxed)
}

pub(crate) fn request_shutdown(flag: &Shutdown) {
    flag.store(true, Ordering::Relaxed);
}
