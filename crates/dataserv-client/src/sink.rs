//! `DataSink`: subscribes to a named dataset's snapshot stream (§4.8).
//! Reconstructs DELTA frames against its own last-received baseline,
//! mirroring the server's own `apply_delta`/`compute_delta` split in
//! reverse.

use std::{
    net::{SocketAddr, ToSocketAddrs},
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use dataserv_core::{
    diff::apply_delta,
    proto::{DataMode, NEGOTIATION_TIMEOUT, NegotiationTag, TIMEOUT},
};
use dataserv_transport::{
    Metadata,
    tcp::{PollEvent, TcpConnector},
};
use serde_json::Value;
use tracing::{info, warn};

use crate::{
    encoding::{Encoder, JsonEncoder, MappingLike},
    error::ClientError,
    queue::ClientQueue,
    worker::{PendingError, ReadySignal, send_negotiation},
};

/// Subscribes to a named dataset, decoding PICKLE/DELTA frames into
/// successive full snapshots.
///
/// `pop` blocks (optionally with a timeout) for the next reconstructed
/// snapshot and decodes it; `field`/`data` read the most recently popped
/// snapshot without blocking.
pub struct DataSink {
    dataset: String,
    addr: SocketAddr,
    mode: DataMode,
    auto_reconnect: bool,
    inbound: Arc<ClientQueue<Vec<u8>>>,
    pending_err: Arc<PendingError>,
    shutdown: Arc<crate::worker::Shutdown>,
    ready: Arc<ReadySignal>,
    handle: Option<JoinHandle<()>>,
    data: Value,
}

impl DataSink {
    /// Resolves `host:port` and builds a sink that is not yet running;
    /// call [`DataSink::start`] to connect. `auto_reconnect` matches
    /// `DataSource::new`'s flag of the same name: if set, a connection drop
    /// after a successful handshake reconnects and renegotiates rather than
    /// surfacing a [`ClientError::Disconnected`] on the next `pop`.
    pub fn new(
        dataset: impl Into<String>,
        host: &str,
        port: u16,
        mode: DataMode,
        auto_reconnect: bool,
    ) -> Result<Self, ClientError> {
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|_| ClientError::ConnectFailure)?
            .next()
            .ok_or(ClientError::ConnectFailure)?;
        Ok(Self {
            dataset: dataset.into(),
            addr,
            mode,
            auto_reconnect,
            inbound: Arc::new(ClientQueue::new(dataserv_core::proto::QUEUE_CAPACITY)),
            pending_err: Arc::new(PendingError::default()),
            shutdown: Arc::new(crate::worker::new_shutdown_flag()),
            ready: Arc::new(ReadySignal::new()),
            handle: None,
            data: Value::Null,
        })
    }

    /// Spawns the background reactor thread and blocks until the initial
    /// handshake succeeds or definitively fails.
    pub fn start(&mut self) -> Result<(), ClientError> {
        if self.handle.is_some() {
            return Err(ClientError::AlreadyStopped);
        }
        let dataset = self.dataset.clone();
        let addr = self.addr;
        let mode = self.mode;
        let auto_reconnect = self.auto_reconnect;
        let inbound = self.inbound.clone();
        let pending_err = self.pending_err.clone();
        let shutdown = self.shutdown.clone();
        let ready = self.ready.clone();

        self.handle = Some(thread::spawn(move || {
            run_sink(dataset, addr, mode, auto_reconnect, inbound, pending_err, shutdown, ready);
        }));
        self.ready.wait()
    }

    /// Blocks for the next reconstructed snapshot, decodes it, and caches it
    /// as the current [`DataSink::data`]. `timeout = None` blocks forever.
    /// Returns `Ok(true)` on a fresh snapshot; with a finite timeout, no data
    /// before it elapses is a [`ClientError::Timeout`].
    pub fn pop(&mut self, timeout: Option<Duration>) -> Result<bool, ClientError> {
        if self.handle.is_none() {
            return Err(ClientError::NotStarted);
        }
        match self.inbound.get(timeout) {
            Some(bytes) => {
                self.data = JsonEncoder::decode(&bytes)?;
                Ok(true)
            }
            None => {
                if let Some(err) = self.pending_err.take() {
                    return Err(err);
                }
                if timeout.is_some() { Err(ClientError::Timeout) } else { Ok(false) }
            }
        }
    }

    /// The most recently popped snapshot.
    #[must_use]
    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Reads a field of the most recently popped snapshot, if it is a
    /// mapping and contains `name`.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.data.field(name)
    }

    /// Stops the background worker and joins its thread.
    pub fn stop(&mut self) -> Result<(), ClientError> {
        let Some(handle) = self.handle.take() else { return Err(ClientError::NotStarted) };
        crate::worker::request_shutdown(&self.shutdown);
        let _ = handle.join();
        Ok(())
    }
}

impl Drop for DataSink {
    fn drop(&mut self) {
        if self.handle.is_some() {
            warn!(dataset = %self.dataset, "DataSink dropped without calling stop()");
            crate::worker::request_shutdown(&self.shutdown);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_sink(
    dataset: String,
    addr: SocketAddr,
    mode: DataMode,
    auto_reconnect: bool,
    inbound: Arc<ClientQueue<Vec<u8>>>,
    pending_err: Arc<PendingError>,
    shutdown: Arc<crate::worker::Shutdown>,
    ready: Arc<ReadySignal>,
) {
    let mut connector = TcpConnector::default().with_reconnect_interval(dataserv_core::proto::FAST_TIMEOUT);
    if connector.connect(addr).is_none() && !crate::worker::is_pending_reconnect(&connector) {
        ready.fail(ClientError::ConnectFailure);
        return;
    }

    let mut negotiated = false;
    let mut ever_negotiated = false;
    // A reconnect resynchronizes from scratch: the dataset's first
    // post-reconnect frame is always PICKLE (§9), so any baseline from a
    // prior connection must not survive.
    let mut baseline: Option<Vec<u8>> = None;
    let mut last_recv_at = Instant::now();
    let attempt_started = Instant::now();

    while !crate::worker::is_shutting_down(&shutdown) {
        let mut events = Vec::new();
        while connector.poll_with(|event| events.push(OwnedSinkEvent::from(event))) {}

        for event in events {
            match event {
                OwnedSinkEvent::Disconnect => {
                    negotiated = false;
                    baseline = None;
                    if !auto_reconnect {
                        if !ever_negotiated {
                            ready.fail(ClientError::ConnectFailure);
                        } else {
                            pending_err.set(ClientError::Disconnected);
                        }
                        return;
                    }
                    info!(dataset = %dataset, "sink connection dropped, reconnecting");
                }
                OwnedSinkEvent::Message { payload, metadata } => {
                    last_recv_at = Instant::now();
                    if payload.is_empty() {
                        continue;
                    }
                    let reconstructed = if metadata.tag() == DataMode::DELTA_BYTE {
                        let Some(old) = &baseline else {
                            warn!(dataset = %dataset, "delta frame received before any baseline, dropping");
                            continue;
                        };
                        match apply_delta(old, &payload) {
                            Ok(full) => full,
                            Err(_) => {
                                warn!(dataset = %dataset, "failed to apply delta, dropping frame");
                                continue;
                            }
                        }
                    } else if metadata.tag() == DataMode::PICKLE_BYTE || metadata.tag() == DataMode::DEFAULT_BYTE {
                        payload
                    } else {
                        warn!(dataset = %dataset, tag = metadata.tag(), "unknown frame tag, disconnecting");
                        pending_err.set(ClientError::Disconnected);
                        return;
                    };
                    baseline = Some(reconstructed.clone());
                    inbound.try_put(reconstructed);
                }
                OwnedSinkEvent::Unexpected => {}
            }
        }

        if !negotiated && !crate::worker::is_pending_reconnect(&connector) {
            if send_negotiation(&mut connector, NegotiationTag::Sink, mode, &dataset) {
                negotiated = true;
                ever_negotiated = true;
                last_recv_at = Instant::now();
                info!(dataset = %dataset, "sink negotiated");
                ready.succeed();
            } else if !auto_reconnect {
                ready.fail(ClientError::ConnectFailure);
                return;
            }
        }

        if !negotiated && !ever_negotiated && attempt_started.elapsed() >= NEGOTIATION_TIMEOUT {
            ready.fail(ClientError::ConnectFailure);
            return;
        }

        if negotiated && last_recv_at.elapsed() >= TIMEOUT {
            warn!(dataset = %dataset, "source/server silent past timeout, disconnecting");
            negotiated = false;
            baseline = None;
            if !auto_reconnect {
                pending_err.set(ClientError::Disconnected);
                return;
            }
            connector.disconnect(crate::worker::CONN_TOKEN, |_| {});
        }

        thread::sleep(Duration::from_millis(1));
    }
}

enum OwnedSinkEvent {
    Disconnect,
    Message { payload: Vec<u8>, metadata: Metadata },
    /// Never produced for an outbound-only connector; ignored if it were.
    Unexpected,
}

impl From<PollEvent<'_>> for OwnedSinkEvent {
    fn from(event: PollEvent<'_>) -> Self {
        match event {
            PollEvent::Disconnect { .. } => OwnedSinkEvent::Disconnect,
            PollEvent::Message { payload, metadata, .. } => {
                OwnedSinkEvent::Message { payload: payload.to_vec(), metadata }
            }
            PollEvent::Accept { .. } => OwnedSinkEvent::Unexpected,
        }
    }
}
