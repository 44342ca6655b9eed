//! Wire-level constants and tag bytes for the negotiation/data-type protocol
//! carried in frame metadata (§4.2, §6 of the wire spec). This module owns
//! the only place these bytes are named; everything else matches on the
//! enums below.

use std::time::Duration;

use dataserv_transport::Metadata;

/// First-frame tag identifying what kind of connection this is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NegotiationTag {
    /// `0xDE` - client wants the dataset name list, then disconnects.
    Info,
    /// `0xBE` - client will publish snapshots into a named dataset.
    Source,
    /// `0xEF` - client will subscribe to a named dataset's snapshot stream.
    Sink,
}

impl NegotiationTag {
    pub const INFO_BYTE: u8 = 0xDE;
    pub const SOURCE_BYTE: u8 = 0xBE;
    pub const SINK_BYTE: u8 = 0xEF;

    #[must_use]
    pub const fn to_byte(self) -> u8 {
        match self {
            NegotiationTag::Info => Self::INFO_BYTE,
            NegotiationTag::Source => Self::SOURCE_BYTE,
            NegotiationTag::Sink => Self::SINK_BYTE,
        }
    }

    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            Self::INFO_BYTE => Some(NegotiationTag::Info),
            Self::SOURCE_BYTE => Some(NegotiationTag::Source),
            Self::SINK_BYTE => Some(NegotiationTag::Sink),
            _ => None,
        }
    }
}

/// Builds the metadata for a connection's first (negotiation) frame. A sink
/// additionally carries its requested [`DataMode`] in the metadata's
/// secondary byte, alongside the tag itself (§4.2); the byte is unused and
/// zero for source/info connections.
#[must_use]
pub const fn first_frame_metadata(tag: NegotiationTag, mode: DataMode) -> Metadata {
    match tag {
        NegotiationTag::Sink => Metadata::from_negotiation(tag.to_byte(), mode.to_byte()),
        NegotiationTag::Source | NegotiationTag::Info => Metadata::from_tag(tag.to_byte()),
    }
}

/// Data-type mode a sink declares at handshake time, and the tag the server
/// stamps on every frame it actually sends to that sink.
///
/// The reference implementation reuses a single byte (`0xCD`) for both
/// `Default` and `Pickle`, making the two indistinguishable on the wire.
/// This implementation gives `Pickle` its own byte (§9 of the spec,
/// resolved): the ambiguity served no purpose since the delta/pickle
/// transmission decision never actually inspected this byte once negotiated,
/// only the `Default` vs `Delta` choice plus the loopback check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataMode {
    /// Server decides per-send: pickle for loopback sinks, delta otherwise.
    Default,
    /// Sink always receives a full payload.
    Pickle,
    /// Sink always attempts a delta once it has a baseline.
    Delta,
}

impl DataMode {
    pub const DEFAULT_BYTE: u8 = 0xCD;
    pub const PICKLE_BYTE: u8 = 0xCE;
    pub const DELTA_BYTE: u8 = 0xAB;

    #[must_use]
    pub const fn to_byte(self) -> u8 {
        match self {
            DataMode::Default => Self::DEFAULT_BYTE,
            DataMode::Pickle => Self::PICKLE_BYTE,
            DataMode::Delta => Self::DELTA_BYTE,
        }
    }

    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            Self::DEFAULT_BYTE => Some(DataMode::Default),
            Self::PICKLE_BYTE => Some(DataMode::Pickle),
            Self::DELTA_BYTE => Some(DataMode::Delta),
            _ => None,
        }
    }

    #[must_use]
    pub const fn metadata(self) -> Metadata {
        Metadata::from_tag(self.to_byte())
    }
}

/// Bounded squash-queue capacity, Q (§4.3).
pub const QUEUE_CAPACITY: usize = 5;

/// Any sender must emit at least one frame within this interval.
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(3);

/// Upper bound on any single send operation.
pub const OPS_TIMEOUT: Duration = Duration::from_secs(10);

/// A receiver considers the peer dead after this much silence.
pub const TIMEOUT: Duration = Duration::from_secs(
    KEEPALIVE_TIMEOUT.as_secs() + OPS_TIMEOUT.as_secs() + 1,
);

/// Pacing interval for client reconnect attempts.
pub const FAST_TIMEOUT: Duration = Duration::from_secs(1);

/// Bound on any single handshake send/recv.
pub const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(14);

/// Deadline handed to the diff worker for one job.
pub const DIFF_DEADLINE: Duration = Duration::from_nanos((OPS_TIMEOUT.as_nanos() * 3 / 4) as u64);

/// Deadline for a single frame send, as observed by the reactor-side sink
/// pipe bookkeeping (client-side blocking sends use the same budget).
pub const SEND_DEADLINE: Duration = Duration::from_nanos((OPS_TIMEOUT.as_nanos() / 4) as u64);

/// Default TCP listen port for the data server.
pub const DEFAULT_PORT: u16 = 30000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiation_tags_roundtrip() {
        for tag in [NegotiationTag::Info, NegotiationTag::Source, NegotiationTag::Sink] {
            assert_eq!(NegotiationTag::from_byte(tag.to_byte()), Some(tag));
        }
    }

    #[test]
    fn data_modes_roundtrip_and_disambiguate_pickle_from_default() {
        for mode in [DataMode::Default, DataMode::Pickle, DataMode::Delta] {
            assert_eq!(DataMode::from_byte(mode.to_byte()), Some(mode));
        }
        assert_ne!(DataMode::Default.to_byte(), DataMode::Pickle.to_byte());
    }

    #[test]
    fn timeout_budget_matches_spec() {
        assert_eq!(TIMEOUT, Duration::from_secs(14));
    }
}
