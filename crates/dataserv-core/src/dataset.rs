//! Dataset records (§3): one source slot plus a set of sink slots, keyed by
//! the `mio::Token` of their connection.

use std::{collections::HashMap, net::SocketAddr, time::Instant};

use mio::Token;

use crate::{diff::JobId, proto::DataMode, queue::SquashQueue};

/// Per-sink state machine (§4.9). Only `ActiveWithBaseline` may transmit
/// DELTA frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkState {
    ActiveNoBaseline,
    ActiveWithBaseline,
}

/// An outstanding diff job a sink pipe is waiting on.
pub struct PendingDiff {
    pub job_id: JobId,
    pub new: Vec<u8>,
    pub submitted_at: Instant,
}

pub struct SinkSlot {
    pub token: Token,
    pub peer_addr: SocketAddr,
    pub mode: DataMode,
    pub state: SinkState,
    pub queue: SquashQueue<Vec<u8>>,
    pub last_sent: Option<Vec<u8>>,
    pub last_sent_at: Instant,
    pub pending_diff: Option<PendingDiff>,
}

impl SinkSlot {
    #[must_use]
    pub fn new(token: Token, peer_addr: SocketAddr, mode: DataMode) -> Self {
        Self {
            token,
            peer_addr,
            mode,
            state: SinkState::ActiveNoBaseline,
            queue: SquashQueue::default(),
            last_sent: None,
            last_sent_at: Instant::now(),
            pending_diff: None,
        }
    }

    /// Whether this sink should be offered a delta instead of a full
    /// payload, per §4.6: DELTA mode always tries, DEFAULT mode tries only
    /// for non-loopback peers, and either way only once a baseline exists.
    #[must_use]
    pub fn wants_delta_attempt(&self) -> bool {
        self.last_sent.is_some()
            && match self.mode {
                DataMode::Delta => true,
                DataMode::Default => !self.peer_addr.ip().is_loopback(),
                DataMode::Pickle => false,
            }
    }

    pub fn record_sent(&mut self, payload: Vec<u8>) {
        self.last_sent = Some(payload);
        self.last_sent_at = Instant::now();
        self.state = SinkState::ActiveWithBaseline;
    }
}

pub struct SourceSlot {
    pub token: Token,
    pub peer_addr: SocketAddr,
    pub last_recv_at: Instant,
}

impl SourceSlot {
    #[must_use]
    pub fn new(token: Token, peer_addr: SocketAddr) -> Self {
        Self { token, peer_addr, last_recv_at: Instant::now() }
    }
}

/// One named dataset: at most one source, any number of sinks (I1, I2).
#[derive(Default)]
pub struct Dataset {
    pub source: Option<SourceSlot>,
    pub sinks: HashMap<Token, SinkSlot>,
}

impl Dataset {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.source.is_none() && self.sinks.is_empty()
    }

    /// Fans `payload` out into every sink's queue, squashing on overflow
    /// (§4.5). An empty frame must never reach this: callers filter
    /// keepalives before calling.
    pub fn fan_out(&mut self, payload: Vec<u8>) {
        let mut sinks = self.sinks.values_mut();
        let Some(last) = sinks.next_back() else { return };
        for sink in sinks {
            sink.queue.try_put(payload.clone());
        }
        last.queue.try_put(payload);
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

    fn addr(ip: [u8; 4]) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), 9000)
    }

    #[test]
    fn loopback_sink_in_default_mode_never_wants_delta() {
        let mut sink = SinkSlot::new(Token(1), addr([127, 0, 0, 1]), DataMode::Default);
        sink.record_sent(b"a".to_vec());
        assert!(!sink.wants_delta_attempt());
    }

    #[test]
    fn remote_sink_in_default_mode_wants_delta_once_it_has_a_baseline() {
        let mut sink = SinkSlot::new(Token(1), addr([10, 0, 0, 5]), DataMode::Default);
        assert!(!sink.wants_delta_attempt(), "no baseline yet");
        sink.record_sent(b"a".to_vec());
        assert!(sink.wants_delta_attempt());
    }

    #[test]
    fn pickle_mode_never_wants_delta_even_remote() {
        let mut sink = SinkSlot::new(Token(1), addr([10, 0, 0, 5]), DataMode::Pickle);
        sink.record_sent(b"a".to_vec());
        assert!(!sink.wants_delta_attempt());
    }

    #[test]
    fn fan_out_reaches_every_sink() {
        let mut ds = Dataset::new();
        ds.sinks.insert(
            Token(1),
            SinkSlot::new(Token(1), addr([127, 0, 0, 1]), DataMode::Default),
        );
        ds.sinks.insert(
            Token(2),
            SinkSlot::new(Token(2), addr([127, 0, 0, 1]), DataMode::Default),
        );
        ds.fan_out(b"hello".to_vec());
        for sink in ds.sinks.values_mut() {
            assert_eq!(sink.queue.try_pop(), Some(b"hello".to_vec()));
        }
    }
}
