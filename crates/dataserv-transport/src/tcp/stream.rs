use std::{
    collections::VecDeque,
    io::{self, IoSlice, Read, Write},
    net::SocketAddr,
};

use mio::{Interest, Registry, Token, event::Event};
use tracing::{debug, warn};

use crate::frame::{HEADER_LEN, Metadata, decode_header, encode_header};

// TODO: might need to tweak this
const RX_BUF_SIZE: usize = 32 * 1024;

/// Response type for all external calls.
///
/// `Alive` means the connection is still usable.
/// `Disconnected` means the peer is gone and the connection must be rebuilt.
#[derive(Debug, PartialEq, Eq)]
pub enum ConnState {
    Alive,
    Disconnected,
}

enum ReadOutcome<'a> {
    PayloadDone { frame: &'a [u8], metadata: Metadata },
    WouldBlock,
    Disconnected,
}

#[derive(Clone, Copy)]
enum RxState {
    /// Waiting for the frame header.
    ReadingHeader { buf: [u8; HEADER_LEN], have: usize },
    /// Reading the payload of `msg_len` bytes.
    ReadingPayload { msg_len: usize, offset: usize, metadata: Metadata },
}

/// Single mio-backed TCP connection speaking the data-server frame format.
///
/// Frames are length-prefixed:
///   - 8-byte LE `msg_len` header
///   - 8-byte opaque metadata
///   - `msg_len` payload bytes
///
/// Outbound:
///   - `write_or_enqueue_with(msg)` serialises `msg` into an internal staging
///     buffer.
///   - Attempts to write bytes (non-blocking) to socket.
///   - Any unwritten remainder is queued (this path allocates).
///   - Backlogged frames are flushed whenever the socket becomes writable.
///
/// Inbound:
///   - Reads the header, then reads exactly `msg_len` more bytes.
///   - When a full frame is assembled, `poll_with` invokes the caller callback
///     with the payload and metadata.
///   - Continues reading frames until `WouldBlock` (no more messages are
///     ready).
///
/// Reconnect handling:
///   - If `ConnState::Disconnected` is returned the caller must treat the
///     connection as dead and rebuild the state.
pub struct TcpStream {
    stream: mio::net::TcpStream,
    token: Token,
    peer_addr: SocketAddr,

    rx_state: RxState,
    rx_buf: Vec<u8>,
    header_buf: [u8; HEADER_LEN],
    send_buf: Vec<u8>,
    /// Filled when send would block.
    /// First entry will either be a full message or the current partially
    /// written head.
    send_backlog: VecDeque<Vec<u8>>,

    /// True if WRITABLE interest is currently registered in `poll`.
    /// Invariant: `writable_armed == !send_backlog.is_empty()`
    writable_armed: bool,
}

impl TcpStream {
    pub const SEND_BUF_SIZE: usize = 32 * 1024;

    #[inline(never)]
    pub(crate) fn from_stream(
        stream: mio::net::TcpStream,
        token: Token,
        peer_addr: SocketAddr,
    ) -> io::Result<Self> {
        stream.set_nodelay(true)?;

        Ok(Self {
            stream,
            token,
            peer_addr,
            rx_state: RxState::ReadingHeader { buf: [0; HEADER_LEN], have: 0 },
            rx_buf: vec![0; RX_BUF_SIZE],
            header_buf: [0; HEADER_LEN],
            send_buf: vec![0; Self::SEND_BUF_SIZE],
            send_backlog: VecDeque::with_capacity(8),
            writable_armed: false,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Poll socket and call `on_msg` for every fully assembled frame.
    /// Frame data is only valid for the duration of the callback.
    #[inline]
    pub fn poll_with<F>(&mut self, registry: &Registry, ev: &Event, on_msg: &mut F) -> ConnState
    where
        F: for<'a> FnMut(Token, &'a [u8], Metadata),
    {
        if ev.is_readable() {
            loop {
                match self.read_frame() {
                    ReadOutcome::PayloadDone { frame, metadata } => {
                        on_msg(ev.token(), frame, metadata);
                    }
                    ReadOutcome::WouldBlock => break,
                    ReadOutcome::Disconnected => return ConnState::Disconnected,
                }
            }
        }

        if ev.is_writable() && self.drain_backlog(registry) == ConnState::Disconnected {
            return ConnState::Disconnected;
        }

        ConnState::Alive
    }

    /// Happy path: serialises into `self.send_buf`, writes frame to stream.
    /// If write would block or we have already blocked on a previous write,
    /// allocates a new vec and stores frame in the backlog to be flushed at
    /// the next writable event.
    #[inline]
    pub fn write_or_enqueue_with<F>(
        &mut self,
        registry: &Registry,
        metadata: Metadata,
        serialise: F,
    ) -> ConnState
    where
        F: Fn(&mut Vec<u8>),
    {
        self.serialise_frame(metadata, serialise);

        let len = self.send_buf.len();

        if !self.send_backlog.is_empty() {
            self.enqueue_back(registry, self.header_buf.to_vec());
            let data = self.alloc_vec(0, len);
            return self.enqueue_back(registry, data);
        }

        let frame = &self.send_buf[..len];
        match self
            .stream
            .write_vectored(&[IoSlice::new(self.header_buf.as_slice()), IoSlice::new(frame)])
        {
            Ok(0) => {
                warn!("tcp: stream failed to write, disconnecting");
                ConnState::Disconnected
            }
            Ok(n) if n == len + HEADER_LEN => ConnState::Alive,

            Ok(n) if n < HEADER_LEN => {
                let data = self.alloc_vec(0, len);
                self.enqueue_front(registry, data);
                let header_data = self.header_buf[n..HEADER_LEN].to_vec();
                self.enqueue_front(registry, header_data)
            }
            Ok(n) => {
                let data = self.alloc_vec(n.saturating_sub(HEADER_LEN), len);
                self.enqueue_front(registry, data)
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.enqueue_back(registry, self.header_buf.to_vec());
                let data = self.alloc_vec(0, len);
                self.enqueue_back(registry, data)
            }
            Err(err) => {
                warn!(?err, "tcp: stream write fail");
                ConnState::Disconnected
            }
        }
    }

    #[inline]
    fn alloc_vec(&mut self, start: usize, end: usize) -> Vec<u8> {
        self.send_buf[start..end].to_vec()
    }

    /// Flush queued data until kernel blocks, queue empty, or backlog drained.
    #[inline]
    fn drain_backlog(&mut self, registry: &Registry) -> ConnState {
        while let Some(front) = self.send_backlog.front_mut() {
            match self.stream.write(front) {
                Ok(0) => return ConnState::Disconnected,

                Ok(n) => {
                    if n == front.len() {
                        self.send_backlog.pop_front();
                    } else {
                        front.drain(..n);
                    }
                }

                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,

                Err(err) => {
                    debug!(?err, "tcp: write from backlog");
                    return ConnState::Disconnected;
                }
            }
        }

        // Drop WRITABLE interest only when fully drained
        if self.send_backlog.is_empty() && self.writable_armed {
            if let Err(err) = registry.reregister(&mut self.stream, self.token, Interest::READABLE) {
                debug!(?err, "tcp: reregister drop writable");
                return ConnState::Disconnected;
            }
            self.writable_armed = false;
        }

        ConnState::Alive
    }

    /// Read a single complete frame if present.
    /// Loops until a frame is received or we've read everything and the read
    /// would block.
    #[inline]
    fn read_frame(&mut self) -> ReadOutcome<'_> {
        loop {
            match self.rx_state {
                RxState::ReadingHeader { mut buf, mut have } => {
                    while have < HEADER_LEN {
                        match self.stream.read(&mut buf[have..]) {
                            Ok(0) => return ReadOutcome::Disconnected,

                            Ok(n) => {
                                have += n;
                                if have == HEADER_LEN {
                                    let (msg_len, metadata) = decode_header(&buf);
                                    if msg_len > self.rx_buf.len() {
                                        debug!(
                                            buf_len = self.rx_buf.len(),
                                            need_len = msg_len,
                                            "tcp: buffer resized"
                                        );
                                        self.rx_buf.resize(msg_len, 0);
                                    }

                                    self.rx_state =
                                        RxState::ReadingPayload { msg_len, offset: 0, metadata };
                                }
                            }

                            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                                self.rx_state = RxState::ReadingHeader { buf, have };
                                return ReadOutcome::WouldBlock;
                            }

                            Err(err) => {
                                debug!(?err, "tcp: read header");
                                return ReadOutcome::Disconnected;
                            }
                        }
                    }
                }

                RxState::ReadingPayload { msg_len, mut offset, metadata } => {
                    while offset < msg_len {
                        match self.stream.read(&mut self.rx_buf[offset..msg_len]) {
                            Ok(0) => return ReadOutcome::Disconnected,

                            Ok(n) => {
                                offset += n;

                                // offset can never be > msg_len as we pass a fixed length slice
                                // into rx_buf. stream will only ever read <= msg_len bytes.
                                if offset == msg_len {
                                    self.rx_state = RxState::ReadingHeader {
                                        buf: [0; HEADER_LEN],
                                        have: 0,
                                    };

                                    return ReadOutcome::PayloadDone {
                                        frame: &self.rx_buf[..msg_len],
                                        metadata,
                                    };
                                }
                            }

                            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                                self.rx_state =
                                    RxState::ReadingPayload { msg_len, offset, metadata };
                                return ReadOutcome::WouldBlock;
                            }

                            Err(err) => {
                                debug!(?err, "tcp: read payload");
                                return ReadOutcome::Disconnected;
                            }
                        }
                    }
                }
            }
        }
    }

    #[inline]
    fn enqueue_front(&mut self, registry: &Registry, data: Vec<u8>) -> ConnState {
        self.send_backlog.push_front(data);
        self.arm_writable(registry)
    }

    #[inline]
    fn enqueue_back(&mut self, registry: &Registry, data: Vec<u8>) -> ConnState {
        self.send_backlog.push_back(data);
        self.arm_writable(registry)
    }

    /// Arm WRITABLE notifications when transitioning from empty -> non-empty
    /// queue. `self.poll` will start polling for writable events.
    #[inline]
    fn arm_writable(&mut self, registry: &Registry) -> ConnState {
        if !self.writable_armed {
            if let Err(err) = registry.reregister(
                &mut self.stream,
                self.token,
                Interest::READABLE | Interest::WRITABLE,
            ) {
                debug!(?err, "tcp: poll reregister");
                return ConnState::Disconnected;
            }
            self.writable_armed = true;
        }
        ConnState::Alive
    }

    /// Serialise payload into send buffer and prepend frame header.
    #[inline(always)]
    fn serialise_frame<F>(&mut self, metadata: Metadata, serialise: F)
    where
        F: Fn(&mut Vec<u8>),
    {
        self.send_buf.clear();
        serialise(&mut self.send_buf);
        self.header_buf = encode_header(self.send_buf.len(), metadata);
    }

    pub fn close(&mut self, registry: &Registry) -> SocketAddr {
        debug!("terminating connection");
        let _ = registry.deregister(&mut self.stream);
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        self.peer_addr
    }
}

/// Set kernel SO_SNDBUF and SO_RCVBUF on a mio TcpStream.
pub(crate) fn set_socket_buf_size(stream: &mio::net::TcpStream, size: usize) {
    use std::os::fd::AsRawFd;
    let fd = stream.as_raw_fd();
    let size = size as libc::c_int;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &size as *const _ as *const libc::c_void,
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &size as *const _ as *const libc::c_void,
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}
