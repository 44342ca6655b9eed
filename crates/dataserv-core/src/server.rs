//! The server reactor (§2, §5): a single-threaded, cooperative event loop
//! that owns the [`Registry`] and every connection's protocol-layer state.
//! All mutation happens on this thread, so nothing here needs a mutex.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use dataserv_transport::{
    Metadata,
    tcp::{ConnState, PollEvent, SendBehavior, TcpConnector},
};
use mio::Token;
use tracing::{debug, info, warn};

use crate::{
    dataset::{PendingDiff, SinkSlot, SourceSlot},
    diff::DiffWorker,
    error::{DiffError, SessionError},
    proto::{DIFF_DEADLINE, DataMode, KEEPALIVE_TIMEOUT, NEGOTIATION_TIMEOUT, NegotiationTag, TIMEOUT},
    registry::Registry,
};

/// How far a not-yet-classified connection has gotten through the
/// handshake (§4.2).
enum Handshake {
    /// Waiting for the first frame (negotiation tag + sink data-mode byte).
    AwaitingTag,
    /// First frame consumed; waiting for the dataset-name frame.
    AwaitingName { tag: NegotiationTag, mode: DataMode },
}

enum ConnRole {
    Negotiating(Handshake),
    Source { dataset: String },
    Sink { dataset: String },
}

struct ConnEntry {
    peer_addr: SocketAddr,
    role: ConnRole,
    /// Reset whenever this connection completes a negotiation step; used to
    /// enforce `NEGOTIATION_TIMEOUT` while `role` is still `Negotiating`.
    progress_at: Instant,
}

/// A [`PollEvent`] with its borrowed payload copied out, so it can outlive
/// the `poll_with` call that produced it and be processed with full access
/// to `Server`'s other fields (including the connector itself, for replies
/// and disconnects issued while handling it).
enum OwnedEvent {
    Accept { stream: Token, peer_addr: SocketAddr },
    Disconnect { token: Token },
    Message { token: Token, payload: Vec<u8>, metadata: Metadata },
}

impl From<PollEvent<'_>> for OwnedEvent {
    fn from(event: PollEvent<'_>) -> Self {
        match event {
            PollEvent::Accept { stream, peer_addr, .. } => OwnedEvent::Accept { stream, peer_addr },
            PollEvent::Disconnect { token, .. } => OwnedEvent::Disconnect { token },
            PollEvent::Message { token, payload, metadata } => {
                OwnedEvent::Message { token, payload: payload.to_vec(), metadata }
            }
        }
    }
}

/// Non-blocking data-server reactor. Drive it by calling [`Server::tick`] in
/// a loop (see [`Server::run`]).
pub struct Server {
    connector: TcpConnector,
    registry: Registry,
    conns: HashMap<Token, ConnEntry>,
    diff_worker: DiffWorker,
}

impl Server {
    /// Binds the listening socket and spawns the diff worker thread.
    pub fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let mut connector = TcpConnector::default();
        connector.listen_at(addr).ok_or_else(|| {
            std::io::Error::other(format!("couldn't bind data-server listener on {addr}"))
        })?;
        info!(%addr, "data server listening");

        Ok(Self {
            connector,
            registry: Registry::new(),
            conns: HashMap::new(),
            diff_worker: DiffWorker::spawn(),
        })
    }

    /// Runs the reactor until `shutdown` is set, then returns. Matches the
    /// tight-loop-with-a-short-sleep cadence `TcpConnector::poll_with`
    /// itself is built around (it never blocks inside `mio::Poll`).
    pub fn run(mut self, shutdown: &Arc<AtomicBool>) {
        while !shutdown.load(Ordering::Relaxed) {
            self.tick();
            thread::sleep(Duration::from_millis(1));
        }
        info!("data server shutting down");
    }

    /// One reactor iteration: pump IO events, drain diff results, then run
    /// the per-connection bookkeeping pass (queue drains, keepalives,
    /// timeouts).
    pub fn tick(&mut self) {
        let mut events = Vec::new();
        while self.connector.poll_with(|event| events.push(OwnedEvent::from(event))) {}
        for event in events {
            match event {
                OwnedEvent::Accept { stream, peer_addr } => self.on_accept(stream, peer_addr),
                OwnedEvent::Disconnect { token } => self.on_disconnect(token),
                OwnedEvent::Message { token, payload, metadata } => {
                    self.on_message(token, &payload, metadata);
                }
            }
        }
        self.drain_diff_results();
        self.run_bookkeeping();
    }

    fn drain_diff_results(&mut self) {
        while let Some(result) = self.diff_worker.try_recv() {
            let mut sent: Option<(Token, Vec<u8>)> = None;
            'datasets: for dataset in self.registry.all_datasets_mut() {
                for sink in dataset.sinks.values_mut() {
                    if sink.pending_diff.as_ref().is_some_and(|p| p.job_id == result.id) {
                        let pending = sink.pending_diff.take().expect("matched above");
                        sent = Some((sink.token, pending.new));
                        break 'datasets;
                    }
                }
            }
            let Some((token, new)) = sent else { continue };

            let use_delta = matches!(&result.outcome, Ok(delta) if delta.len() < new.len());
            let alive = if use_delta {
                let Ok(delta) = result.outcome else { unreachable!() };
                send_frame_checked(&mut self.connector, token, DataMode::Delta.metadata(), &delta)
            } else {
                send_frame_checked(&mut self.connector, token, DataMode::Pickle.metadata(), &new)
            };

            if alive {
                self.mark_sent(token, new);
            } else {
                self.terminate_sink(token);
            }
        }
    }

    fn run_bookkeeping(&mut self) {
        let mut dead: Vec<Token> = Vec::new();
        let mut fallbacks: Vec<(Token, Vec<u8>)> = Vec::new();
        let mut keepalives: Vec<Token> = Vec::new();
        let mut new_diffs: Vec<(Token, Vec<u8>, Vec<u8>)> = Vec::new();
        let mut sends: Vec<(Token, Vec<u8>)> = Vec::new();

        for name in self.registry.dataset_names_snapshot() {
            let Some(dataset) = self.registry.get_mut(&name) else { continue };

            if let Some(source) = &dataset.source {
                if source.last_recv_at.elapsed() >= TIMEOUT {
                    warn!(dataset = %name, peer = %source.peer_addr, "source timed out");
                    dead.push(source.token);
                    dataset.source = None;
                }
            }

            for sink in dataset.sinks.values_mut() {
                if let Some(pending) = &sink.pending_diff {
                    if pending.submitted_at.elapsed() >= DIFF_DEADLINE {
                        let err = DiffError::Timeout;
                        debug!(peer = %sink.peer_addr, %err, "falling back to full payload");
                        let new = sink.pending_diff.take().unwrap().new;
                        fallbacks.push((sink.token, new));
                    }
                    continue;
                }

                if let Some(new) = sink.queue.try_pop() {
                    if sink.wants_delta_attempt() {
                        let old = sink.last_sent.clone().expect("wants_delta_attempt checked this");
                        new_diffs.push((sink.token, old, new));
                    } else {
                        sends.push((sink.token, new));
                    }
                } else if sink.last_sent_at.elapsed() >= KEEPALIVE_TIMEOUT {
                    keepalives.push(sink.token);
                }
            }
        }

        for (token, new) in fallbacks {
            if send_frame_checked(&mut self.connector, token, DataMode::Pickle.metadata(), &new) {
                self.mark_sent(token, new);
            } else {
                dead.push(token);
            }
        }

        for (token, new) in sends {
            if send_frame_checked(&mut self.connector, token, DataMode::Pickle.metadata(), &new) {
                self.mark_sent(token, new);
            } else {
                dead.push(token);
            }
        }

        for token in keepalives {
            let alive = self.connector.write_or_enqueue_with(
                SendBehavior::Single(token),
                Metadata::ZERO,
                |_| {},
            ) == ConnState::Alive;
            if alive {
                self.touch_keepalive(token);
            } else {
                dead.push(token);
            }
        }

        for (token, old, new) in new_diffs {
            let job_id = self.diff_worker.submit(old, new.clone());
            self.set_pending_diff(token, job_id, new);
        }

        for token in dead {
            self.terminate_sink(token);
        }

        let negotiation_timeouts: Vec<Token> = self
            .conns
            .iter()
            .filter(|(_, entry)| {
                matches!(entry.role, ConnRole::Negotiating(_))
                    && entry.progress_at.elapsed() >= NEGOTIATION_TIMEOUT
            })
            .map(|(token, _)| *token)
            .collect();

        for token in negotiation_timeouts {
            debug!(?token, err = %SessionError::NegotiationTimeout, "dropping connection");
            self.close_conn(token);
        }

        self.registry.garbage_collect();
    }

    fn mark_sent(&mut self, token: Token, payload: Vec<u8>) {
        if let Some(sink) = self.find_sink_mut(token) {
            sink.record_sent(payload);
        }
    }

    fn touch_keepalive(&mut self, token: Token) {
        if let Some(sink) = self.find_sink_mut(token) {
            sink.last_sent_at = Instant::now();
        }
    }

    fn set_pending_diff(&mut self, token: Token, job_id: u64, new: Vec<u8>) {
        if let Some(sink) = self.find_sink_mut(token) {
            sink.pending_diff = Some(PendingDiff { job_id, new, submitted_at: Instant::now() });
        }
    }

    fn terminate_sink(&mut self, token: Token) {
        if let Some(ConnRole::Sink { dataset }) = self.conns.get(&token).map(|e| &e.role) {
            let dataset = dataset.clone();
            if let Some(ds) = self.registry.get_mut(&dataset) {
                ds.sinks.remove(&token);
            }
        }
        self.close_conn(token);
    }

    fn find_sink_mut(&mut self, token: Token) -> Option<&mut SinkSlot> {
        let dataset = match self.conns.get(&token)?.role {
            ConnRole::Sink { ref dataset } => dataset.clone(),
            _ => return None,
        };
        self.registry.get_mut(&dataset)?.sinks.get_mut(&token)
    }

    fn close_conn(&mut self, token: Token) {
        self.conns.remove(&token);
        self.connector.disconnect(token, |_| {});
    }

    fn on_accept(&mut self, stream: Token, peer_addr: SocketAddr) {
        debug!(peer = %peer_addr, ?stream, "accepted connection");
        self.conns.insert(
            stream,
            ConnEntry {
                peer_addr,
                role: ConnRole::Negotiating(Handshake::AwaitingTag),
                progress_at: Instant::now(),
            },
        );
    }

    fn on_disconnect(&mut self, token: Token) {
        let Some(entry) = self.conns.remove(&token) else { return };
        match entry.role {
            ConnRole::Source { dataset } => {
                if let Some(ds) = self.registry.get_mut(&dataset) {
                    if ds.source.as_ref().is_some_and(|s| s.token == token) {
                        ds.source = None;
                    }
                }
                info!(dataset, peer = %entry.peer_addr, "source disconnected");
            }
            ConnRole::Sink { dataset } => {
                if let Some(ds) = self.registry.get_mut(&dataset) {
                    ds.sinks.remove(&token);
                }
                info!(dataset, peer = %entry.peer_addr, "sink disconnected");
            }
            ConnRole::Negotiating(_) => {
                debug!(peer = %entry.peer_addr, "connection dropped mid-handshake");
            }
        }
    }

    fn on_message(&mut self, token: Token, payload: &[u8], metadata: Metadata) {
        let Some(entry) = self.conns.get(&token) else {
            warn!(?token, "message from unknown connection");
            return;
        };

        match &entry.role {
            ConnRole::Negotiating(Handshake::AwaitingTag) => {
                self.handle_tag_frame(token, metadata);
            }
            ConnRole::Negotiating(Handshake::AwaitingName { tag, mode }) => {
                let (tag, mode) = (*tag, *mode);
                self.handle_name_frame(token, payload, tag, mode);
            }
            ConnRole::Source { dataset } => {
                let dataset = dataset.clone();
                self.handle_source_frame(token, &dataset, payload);
            }
            ConnRole::Sink { .. } => {
                // Sinks are not expected to send anything post-handshake;
                // ignore rather than drop, matching §7's "nothing is
                // retried, but only bad input is penalized" stance.
                debug!(?token, "ignoring unexpected frame from sink connection");
            }
        }
    }

    fn handle_tag_frame(&mut self, token: Token, metadata: Metadata) {
        let Some(tag) = NegotiationTag::from_byte(metadata.tag()) else {
            let err = SessionError::UnknownNegotiationTag(metadata.tag());
            warn!(?token, %err, "dropping connection");
            self.close_conn(token);
            return;
        };

        if tag == NegotiationTag::Info {
            let names = self.registry.list_names().collect::<Vec<_>>().join(",");
            self.connector.write_or_enqueue_with(
                SendBehavior::Single(token),
                Metadata::ZERO,
                |buf| buf.extend_from_slice(names.as_bytes()),
            );
            self.close_conn(token);
            return;
        }

        // Sink data-mode rides the secondary metadata byte of this same
        // first frame, alongside the negotiation tag itself; source/info
        // connections get `Default`, which is never consulted for them.
        let mode = if tag == NegotiationTag::Sink {
            match DataMode::from_byte(metadata.secondary()) {
                Some(mode) => mode,
                None => {
                    let err = SessionError::UnknownDataMode(metadata.secondary());
                    warn!(?token, %err, "dropping connection");
                    self.close_conn(token);
                    return;
                }
            }
        } else {
            DataMode::Default
        };

        if let Some(entry) = self.conns.get_mut(&token) {
            entry.role = ConnRole::Negotiating(Handshake::AwaitingName { tag, mode });
            entry.progress_at = Instant::now();
        }
    }

    fn handle_name_frame(&mut self, token: Token, payload: &[u8], tag: NegotiationTag, mode: DataMode) {
        let Ok(name) = std::str::from_utf8(payload) else {
            let err = SessionError::InvalidDatasetName;
            warn!(?token, %err, "dropping connection");
            self.close_conn(token);
            return;
        };
        let name = name.to_string();

        let Some(peer_addr) = self.conns.get(&token).map(|e| e.peer_addr) else { return };

        match tag {
            NegotiationTag::Source => {
                let dataset = self.registry.get_or_create(&name);
                if dataset.source.is_some() {
                    let err = SessionError::DuplicateSource(name.clone());
                    warn!(peer = %peer_addr, %err, "rejecting");
                    self.close_conn(token);
                    return;
                }
                dataset.source = Some(SourceSlot::new(token, peer_addr));
                if let Some(entry) = self.conns.get_mut(&token) {
                    entry.role = ConnRole::Source { dataset: name.clone() };
                }
                info!(dataset = %name, peer = %peer_addr, "source attached");
            }
            NegotiationTag::Sink => {
                let dataset = self.registry.get_or_create(&name);
                dataset.sinks.insert(token, SinkSlot::new(token, peer_addr, mode));
                if let Some(entry) = self.conns.get_mut(&token) {
                    entry.role = ConnRole::Sink { dataset: name.clone() };
                }
                info!(dataset = %name, peer = %peer_addr, ?mode, "sink attached");
            }
            NegotiationTag::Info => unreachable!("Info never reaches the name-frame stage"),
        }
    }

    fn handle_source_frame(&mut self, token: Token, dataset: &str, payload: &[u8]) {
        let Some(ds) = self.registry.get_mut(dataset) else { return };
        let Some(source) = &mut ds.source else { return };
        if source.token != token {
            return;
        }
        source.last_recv_at = Instant::now();

        // An empty frame from the source is a keepalive; it is not fanned
        // out (B1).
        if payload.is_empty() {
            return;
        }
        ds.fan_out(payload.to_vec());
    }
}

fn send_frame_checked(
    connector: &mut TcpConnector,
    token: Token,
    metadata: Metadata,
    payload: &[u8],
) -> bool {
    connector.write_or_enqueue_with(SendBehavior::Single(token), metadata, |buf| {
        buf.extend_from_slice(payload);
    }) == ConnState::Alive
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

    fn local_addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn bind_succeeds_on_ephemeral_port() {
        let server = Server::bind(local_addr(0)).unwrap();
        drop(server);
    }
}
