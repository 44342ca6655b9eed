use std::{net::SocketAddr, time::Duration};

use dataserv_utils::safe_panic;
use mio::{Events, Interest, Poll, Token, event::Event, net::TcpListener};
use tracing::{debug, error, warn};

use crate::{
    frame::Metadata,
    tcp::{ConnState, TcpStream, stream::set_socket_buf_size},
};

#[derive(Clone, Copy, Debug)]
pub enum SendBehavior {
    Broadcast,
    Single(Token),
}

/// Outbound connections reconnect, inbound ones do not.
enum ConnectionVariant {
    /// Connections that we initiated; will be reconnected.
    Outbound(TcpStream),
    /// Connections accepted through one of the listeners.
    Inbound(TcpStream),
    /// Listeners for new connections. A connection accepted on one becomes
    /// `Inbound`.
    Listener(TcpListener),
}

/// Event emitted by [`TcpConnector::poll_with`] for each notable IO occurrence.
pub enum PollEvent<'a> {
    /// A new connection was accepted from a listener.
    Accept { listener: Token, stream: Token, peer_addr: SocketAddr },
    /// A connection was closed (by the remote or due to an IO error).
    Disconnect { token: Token, peer_addr: SocketAddr },
    /// A complete framed message was received.
    Message { token: Token, payload: &'a [u8], metadata: Metadata },
}

struct ConnectionManager {
    poll: Poll,
    conns: Vec<(Token, ConnectionVariant)>,
    reconnect_interval: Duration,
    last_reconnect_attempt: Option<std::time::Instant>,
    socket_buf_size: Option<usize>,

    // Always only outbound/client-side connections.
    to_be_reconnected: Vec<(Token, SocketAddr)>,
    next_token: usize,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self {
            conns: Vec::with_capacity(5),
            reconnect_interval: Duration::from_secs(1),
            last_reconnect_attempt: None,
            socket_buf_size: None,
            to_be_reconnected: Vec::with_capacity(4),
            poll: Poll::new().expect("couldn't set up a poll for tcp connector"),
            next_token: 0,
        }
    }
}

impl ConnectionManager {
    fn disconnect_at_index<F>(&mut self, index: usize, handler: &mut F)
    where
        F: for<'a> FnMut(PollEvent<'a>),
    {
        let (token, variant) = self.conns.swap_remove(index);
        match variant {
            ConnectionVariant::Outbound(mut tcp_connection) => {
                let addr = tcp_connection.close(self.poll.registry());
                self.to_be_reconnected.push((token, addr));
                handler(PollEvent::Disconnect { token, peer_addr: addr });
            }
            ConnectionVariant::Inbound(mut tcp_connection) => {
                let addr = tcp_connection.close(self.poll.registry());
                handler(PollEvent::Disconnect { token, peer_addr: addr });
            }
            ConnectionVariant::Listener(mut tcp_listener) => {
                let _ = self.poll.registry().deregister(&mut tcp_listener);
            }
        }
    }

    fn disconnect_token<F>(&mut self, token: Token, handler: &mut F)
    where
        F: for<'a> FnMut(PollEvent<'a>),
    {
        if let Some(i) = self.conns.iter().position(|(t, _)| *t == token) {
            self.disconnect_at_index(i, handler);
        }
    }

    #[inline]
    fn write_or_enqueue_with<F>(
        &mut self,
        metadata: Metadata,
        serialise: F,
        where_to: SendBehavior,
    ) -> ConnState
    where
        F: Fn(&mut Vec<u8>),
    {
        match where_to {
            SendBehavior::Broadcast => {
                let mut i = self.conns.len();
                while i != 0 {
                    i -= 1;
                    if let ConnectionVariant::Outbound(conn) | ConnectionVariant::Inbound(conn) =
                        &mut self.conns[i].1
                    {
                        if conn.write_or_enqueue_with(self.poll.registry(), metadata, &serialise)
                            == ConnState::Disconnected
                        {
                            self.disconnect_at_index(i, &mut |_| {});
                        }
                    }
                }
                ConnState::Alive
            }
            SendBehavior::Single(token) => {
                let Some(i) = self.conns.iter().position(|(t, _)| *t == token) else {
                    error!(?token, "tcp sending: unknown token");
                    return ConnState::Disconnected;
                };
                match &mut self.conns[i].1 {
                    ConnectionVariant::Outbound(conn) | ConnectionVariant::Inbound(conn) => {
                        if conn.write_or_enqueue_with(self.poll.registry(), metadata, serialise)
                            == ConnState::Disconnected
                        {
                            warn!(?token, "issue when writing, disconnecting");
                            self.disconnect_at_index(i, &mut |_| {});
                            return ConnState::Disconnected;
                        }
                        ConnState::Alive
                    }
                    ConnectionVariant::Listener(_) => {
                        error!(?token, "cannot write to a listener token");
                        ConnState::Disconnected
                    }
                }
            }
        }
    }

    fn connect(&mut self, addr: SocketAddr) -> Option<Token> {
        let token = Token(self.next_token);
        self.to_be_reconnected.push((token, addr));
        self.last_reconnect_attempt = None;
        self.maybe_reconnect();
        if self.conns.iter().any(|(t, _)| t == &token) {
            self.next_token += 1;
            Some(token)
        } else {
            None
        }
    }

    fn listen_at(&mut self, addr: SocketAddr) -> Option<Token> {
        let mut listener = mio::net::TcpListener::bind(addr)
            .inspect_err(|e| warn!("couldn't start listening at {addr:?}: {e}"))
            .ok()?;
        let token = Token(self.next_token);
        self.poll
            .registry()
            .register(&mut listener, token, Interest::READABLE)
            .inspect_err(|err| warn!("couldn't register listening addr {addr:?}: {err}"))
            .ok()?;
        self.conns.push((token, ConnectionVariant::Listener(listener)));
        self.next_token += 1;
        Some(token)
    }

    fn maybe_reconnect(&mut self) {
        if self.to_be_reconnected.is_empty() {
            return;
        }
        if let Some(last) = self.last_reconnect_attempt {
            if last.elapsed() < self.reconnect_interval {
                return;
            }
        }
        self.last_reconnect_attempt = Some(std::time::Instant::now());

        let mut i = self.to_be_reconnected.len();
        while i != 0 {
            i -= 1;
            let (token, addr) = self.to_be_reconnected[i];
            let Ok(mut stream) =
                mio::net::TcpStream::connect(addr).inspect_err(|e| debug!("couldn't connect to {addr}: {e}"))
            else {
                continue;
            };
            if let Some(size) = self.socket_buf_size {
                set_socket_buf_size(&stream, size);
            }
            if let Err(e) = self.poll.registry().register(&mut stream, token, Interest::READABLE) {
                error!("couldn't register tcp stream for {addr} with registry: {e}");
                continue;
            }
            let Ok(stream) = TcpStream::from_stream(stream, token, addr)
                .inspect_err(|e| error!("couldn't construct tcp stream for {addr}: {e}"))
            else {
                continue;
            };

            self.to_be_reconnected.swap_remove(i);
            self.conns.push((token, ConnectionVariant::Outbound(stream)));
            debug!(?addr, "connected");
        }
    }

    #[inline]
    fn currently_disconnected(&self) -> impl Iterator<Item = Token> + '_ {
        self.to_be_reconnected.iter().map(|(t, _)| *t)
    }

    #[inline]
    fn force_reconnect(&mut self) {
        self.last_reconnect_attempt = None;
        self.maybe_reconnect();
    }

    #[inline]
    fn handle_event<F>(&mut self, e: &Event, handler: &mut F)
    where
        F: for<'a> FnMut(PollEvent<'a>),
    {
        let event_token = e.token();
        let Some(stream_id) = self.conns.iter().position(|(t, _)| t == &event_token) else {
            safe_panic!("got event for unknown token");
            return;
        };

        loop {
            match &mut self.conns[stream_id].1 {
                ConnectionVariant::Outbound(conn) | ConnectionVariant::Inbound(conn) => {
                    if conn.poll_with(self.poll.registry(), e, &mut |token, payload, metadata| {
                        handler(PollEvent::Message { token, payload, metadata });
                    }) == ConnState::Disconnected
                    {
                        self.disconnect_at_index(stream_id, handler);
                    }
                    return;
                }
                ConnectionVariant::Listener(tcp_listener) => {
                    if let Ok((mut stream, addr)) = tcp_listener.accept() {
                        if let Some(size) = self.socket_buf_size {
                            set_socket_buf_size(&stream, size);
                        }
                        let token = Token(self.next_token);
                        if let Err(e) =
                            self.poll.registry().register(&mut stream, token, Interest::READABLE)
                        {
                            error!("couldn't register client: {e}");
                            let _ = stream.shutdown(std::net::Shutdown::Both);
                            continue;
                        }
                        let Ok(conn) = TcpStream::from_stream(stream, token, addr) else { continue };

                        handler(PollEvent::Accept {
                            listener: event_token,
                            stream: token,
                            peer_addr: addr,
                        });
                        self.conns.push((token, ConnectionVariant::Inbound(conn)));
                        self.next_token += 1;
                    } else {
                        return;
                    }
                }
            }
        }
    }
}

/// Non-blocking TCP connector/acceptor built on `mio`.
///
/// Manages:
/// - **Outbound (client) connections** created via [`connect`](Self::connect).
///   These are **auto-retried** on failure/disconnect at `reconnect_interval`.
/// - **Listeners** created via [`listen_at`](Self::listen_at) and **inbound
///   (server) connections** accepted from them. Inbound connections are
///   **not** reconnected.
///
/// Drive all IO by calling [`poll_with`](Self::poll_with) regularly, typically
/// in a tight loop with a short sleep between calls. Use
/// [`write_or_enqueue_with`](Self::write_or_enqueue_with) to send to one
/// connection or to broadcast to all.
pub struct TcpConnector {
    events: Events,
    conn_mgr: ConnectionManager,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self { events: Events::with_capacity(128), conn_mgr: ConnectionManager::default() }
    }
}

impl TcpConnector {
    /// Sets the interval used to retry disconnected/failed outbound
    /// connections. Matches `FAST_TIMEOUT` for client reconnects.
    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.conn_mgr.reconnect_interval = interval;
        self
    }

    /// Sets kernel SO_SNDBUF and SO_RCVBUF on all sockets (outbound and
    /// accepted).
    pub fn with_socket_buf_size(mut self, size: usize) -> Self {
        self.conn_mgr.socket_buf_size = Some(size);
        self
    }

    /// Polls sockets once (non-blocking) and dispatches events via
    /// [`PollEvent`].
    ///
    /// This call:
    /// 1. attempts outbound reconnects if the interval elapsed
    /// 2. polls `mio` with a zero timeout
    /// 3. for each event calls `handler` with the appropriate [`PollEvent`]
    /// 4. returns whether any IO events were processed
    #[inline]
    pub fn poll_with<F>(&mut self, mut handler: F) -> bool
    where
        F: for<'a> FnMut(PollEvent<'a>),
    {
        self.conn_mgr.maybe_reconnect();
        if let Err(e) = self.conn_mgr.poll.poll(&mut self.events, Some(Duration::ZERO)) {
            safe_panic!("got error polling {e}");
            return false;
        }

        let mut any = false;
        for e in self.events.iter() {
            any = true;
            self.conn_mgr.handle_event(e, &mut handler);
        }
        any
    }

    /// Writes immediately or enqueues bytes for later sending, tagged with
    /// `metadata`.
    ///
    /// For [`SendBehavior::Single`], returns whether that connection is
    /// still alive: a send failure disconnects it (as if the peer had
    /// closed) before returning. For [`SendBehavior::Broadcast`], always
    /// returns `Alive` - individual failures are handled per-connection and
    /// reported through the next `poll_with` as ordinary `Disconnect`
    /// events.
    #[inline]
    pub fn write_or_enqueue_with<F>(
        &mut self,
        where_to: SendBehavior,
        metadata: Metadata,
        serialise: F,
    ) -> ConnState
    where
        F: Fn(&mut Vec<u8>),
    {
        self.conn_mgr.write_or_enqueue_with(metadata, serialise, where_to)
    }

    /// Disconnects a specific connection by token.
    ///
    /// If the token is an outbound connection, it is scheduled for
    /// reconnection. If inbound, it's simply closed. No-op if token not found.
    pub fn disconnect<F>(&mut self, token: Token, handler: F)
    where
        F: for<'a> FnMut(PollEvent<'a>),
    {
        let mut handler = handler;
        self.conn_mgr.disconnect_token(token, &mut handler);
    }

    /// Initiates (or schedules) an outbound connection to `addr`.
    ///
    /// Returns the token for this connection if it becomes established
    /// synchronously; otherwise returns `None` and the connector will retry
    /// on the next `poll_with` calls that observe the reconnect interval.
    #[inline]
    pub fn connect(&mut self, addr: SocketAddr) -> Option<Token> {
        self.conn_mgr.connect(addr)
    }

    /// Starts listening on `addr` and registers the listener for readable
    /// events. Returns the listener's token.
    pub fn listen_at(&mut self, addr: SocketAddr) -> Option<Token> {
        self.conn_mgr.listen_at(addr)
    }

    /// Tokens currently pending reconnection (outbound only).
    #[inline]
    pub fn currently_disconnected(&self) -> impl Iterator<Item = Token> + '_ {
        self.conn_mgr.currently_disconnected()
    }

    /// Forces an immediate reconnect attempt, ignoring the configured
    /// interval.
    #[inline]
    pub fn force_reconnect(&mut self) {
        self.conn_mgr.force_reconnect();
    }
}
