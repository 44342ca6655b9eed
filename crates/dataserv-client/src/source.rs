//! `DataSource`: publishes snapshots into a named dataset (§4.8). Runs its
//! own reactor thread, built on [`TcpConnector`]'s existing outbound
//! auto-reconnect machinery; `push` only ever touches the shared queue.

use std::{
    net::{SocketAddr, ToSocketAddrs},
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use dataserv_core::proto::{DataMode, KEEPALIVE_TIMEOUT, NEGOTIATION_TIMEOUT, NegotiationTag};
use dataserv_transport::{
    Metadata,
    tcp::{ConnState, PollEvent, SendBehavior, TcpConnector},
};
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    encoding::{Encoder, JsonEncoder},
    error::ClientError,
    queue::ClientQueue,
    worker::{CONN_TOKEN, PendingError, ReadySignal, send_negotiation},
};

/// Publishes snapshots into a named dataset on a data server.
///
/// Mirrors the reference client's `DataSource`: `start()` blocks until the
/// first handshake succeeds (or fails outright, when `auto_reconnect` is
/// off), `push` is a non-blocking squash-enqueue, and any error raised on
/// the background thread after that is surfaced on the next `push` call.
pub struct DataSource {
    dataset: String,
    addr: SocketAddr,
    auto_reconnect: bool,
    outbound: Arc<ClientQueue<Vec<u8>>>,
    pending_err: Arc<PendingError>,
    shutdown: Arc<crate::worker::Shutdown>,
    ready: Arc<ReadySignal>,
    handle: Option<JoinHandle<()>>,
}

impl DataSource {
    /// Resolves `host:port` and builds a source that is not yet running;
    /// call [`DataSource::start`] to connect.
    pub fn new(
        dataset: impl Into<String>,
        host: &str,
        port: u16,
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
            auto_reconnect,
            outbound: Arc::new(ClientQueue::new(dataserv_core::proto::QUEUE_CAPACITY)),
            pending_err: Arc::new(PendingError::default()),
            shutdown: Arc::new(crate::worker::new_shutdown_flag()),
            ready: Arc::new(ReadySignal::new()),
            handle: None,
        })
    }

    /// Spawns the background reactor thread and blocks until the initial
    /// handshake either succeeds or (when `auto_reconnect` is false)
    /// definitively fails.
    pub fn start(&mut self) -> Result<(), ClientError> {
        if self.handle.is_some() {
            return Err(ClientError::AlreadyStopped);
        }
        let dataset = self.dataset.clone();
        let addr = self.addr;
        let auto_reconnect = self.auto_reconnect;
        let outbound = self.outbound.clone();
        let pending_err = self.pending_err.clone();
        let shutdown = self.shutdown.clone();
        let ready = self.ready.clone();

        self.handle = Some(thread::spawn(move || {
            run_source(dataset, addr, auto_reconnect, outbound, pending_err, shutdown, ready);
        }));
        self.ready.wait()
    }

    /// Encodes `value` and enqueues it for delivery, squashing any
    /// not-yet-sent snapshot already queued (§4.3). Surfaces the most
    /// recent background-thread error, if any, rather than failing silently.
    pub fn push<T: Serialize>(&self, value: &T) -> Result<(), ClientError> {
        if self.handle.is_none() {
            return Err(ClientError::NotStarted);
        }
        if let Some(err) = self.pending_err.take() {
            return Err(err);
        }
        let bytes = JsonEncoder::encode(value)?;
        self.outbound.try_put(bytes);
        Ok(())
    }

    /// Stops the background worker and joins its thread.
    pub fn stop(&mut self) -> Result<(), ClientError> {
        let Some(handle) = self.handle.take() else { return Err(ClientError::NotStarted) };
        crate::worker::request_shutdown(&self.shutdown);
        let _ = handle.join();
        Ok(())
    }
}

impl Drop for DataSource {
    fn drop(&mut self) {
        if self.handle.is_some() {
            warn!(dataset = %self.dataset, "DataSource dropped without calling stop()");
            crate::worker::request_shutdown(&self.shutdown);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_source(
    dataset: String,
    addr: SocketAddr,
    auto_reconnect: bool,
    outbound: Arc<ClientQueue<Vec<u8>>>,
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
    let mut last_sent_at = Instant::now();
    let attempt_started = Instant::now();

    while !crate::worker::is_shutting_down(&shutdown) {
        let mut events = Vec::new();
        while connector.poll_with(|event| events.push(OwnedSourceEvent::from(event))) {}

        for event in events {
            match event {
                OwnedSourceEvent::Disconnect => {
                    negotiated = false;
                    if !auto_reconnect {
                        if !ever_negotiated {
                            ready.fail(ClientError::ConnectFailure);
                        } else {
                            pending_err.set(ClientError::Disconnected);
                        }
                        return;
                    }
                    info!(dataset = %dataset, "source connection dropped, reconnecting");
                }
                OwnedSourceEvent::Connected => {}
            }
        }

        if !negotiated && !crate::worker::is_pending_reconnect(&connector) {
            if send_negotiation(&mut connector, NegotiationTag::Source, DataMode::Default, &dataset) {
                negotiated = true;
                ever_negotiated = true;
                last_sent_at = Instant::now();
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

        if negotiated {
            if let Some(payload) = outbound.try_pop() {
                let alive = connector.write_or_enqueue_with(
                    SendBehavior::Single(CONN_TOKEN),
                    Metadata::ZERO,
                    |buf| buf.extend_from_slice(&payload),
                ) == ConnState::Alive;
                if alive {
                    last_sent_at = Instant::now();
                } else {
                    negotiated = false;
                    pending_err.set(ClientError::Disconnected);
                }
            } else if last_sent_at.elapsed() >= KEEPALIVE_TIMEOUT {
                let alive = connector.write_or_enqueue_with(
                    SendBehavior::Single(CONN_TOKEN),
                    Metadata::ZERO,
                    |_| {},
                ) == ConnState::Alive;
                if alive {
                    last_sent_at = Instant::now();
                } else {
                    negotiated = false;
                    pending_err.set(ClientError::Disconnected);
                }
            }
        }

        thread::sleep(Duration::from_millis(1));
    }
}

enum OwnedSourceEvent {
    Connected,
    Disconnect,
}

impl From<PollEvent<'_>> for OwnedSourceEvent {
    fn from(event: PollEvent<'_>) -> Self {
        match event {
            PollEvent::Disconnect { .. } => OwnedSourceEvent::Disconnect,
            PollEvent::Accept { .. } | PollEvent::Message { .. } => OwnedSourceEvent::Connected,
        }
    }
}
