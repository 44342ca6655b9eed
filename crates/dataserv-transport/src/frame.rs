/// `msg_len` field width, in bytes. Little-endian.
pub const LEN_HEADER_SIZE: usize = core::mem::size_of::<u64>();
/// `metadata` field width, in bytes.
pub const METADATA_SIZE: usize = core::mem::size_of::<u64>();
/// Total header size preceding every frame's payload.
pub const HEADER_LEN: usize = LEN_HEADER_SIZE + METADATA_SIZE;

/// Opaque per-frame tag carried alongside the payload.
///
/// Only the first byte is meaningful to the transport layer itself (§4.1 of
/// the wire spec); the remaining seven bytes are always zero for ordinary
/// data frames. The negotiation protocol layered on top (`dataserv-core`)
/// additionally gives the *second* byte meaning on a sink's first frame
/// only, to carry its requested data-type mode alongside the negotiation
/// tag in the same frame (§4.2) - see [`Metadata::from_negotiation`]. The
/// transport itself never inspects either byte.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Metadata(u64);

impl Metadata {
    pub const ZERO: Metadata = Metadata(0);

    #[must_use]
    pub const fn from_tag(tag: u8) -> Self {
        Metadata(tag as u64)
    }

    /// Builds metadata for a negotiation first-frame that carries both the
    /// negotiation tag and a secondary byte (a sink's requested data-type
    /// mode; zero and unused for source/info connections).
    #[must_use]
    pub const fn from_negotiation(tag: u8, secondary: u8) -> Self {
        Metadata((tag as u64) | ((secondary as u64) << 8))
    }

    #[must_use]
    pub const fn tag(self) -> u8 {
        (self.0 & 0xFF) as u8
    }

    /// The second metadata byte, meaningful only on a sink's first frame.
    #[must_use]
    pub const fn secondary(self) -> u8 {
        ((self.0 >> 8) & 0xFF) as u8
    }

    pub(crate) const fn to_bytes(self) -> [u8; METADATA_SIZE] {
        self.0.to_le_bytes()
    }

    pub(crate) fn from_bytes(bytes: [u8; METADATA_SIZE]) -> Self {
        Metadata(u64::from_le_bytes(bytes))
    }
}

impl From<u8> for Metadata {
    fn from(tag: u8) -> Self {
        Metadata::from_tag(tag)
    }
}

/// A keepalive is an empty frame: no payload, zeroed metadata.
#[must_use]
pub fn is_keepalive(payload_len: usize, metadata: Metadata) -> bool {
    payload_len == 0 && metadata == Metadata::ZERO
}

pub(crate) fn encode_header(msg_len: usize, metadata: Metadata) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[..LEN_HEADER_SIZE].copy_from_slice(&(msg_len as u64).to_le_bytes());
    header[LEN_HEADER_SIZE..].copy_from_slice(&metadata.to_bytes());
    header
}

pub(crate) fn decode_header(header: &[u8; HEADER_LEN]) -> (usize, Metadata) {
    let msg_len = u64::from_le_bytes(header[..LEN_HEADER_SIZE].try_into().unwrap()) as usize;
    let metadata =
        Metadata::from_bytes(header[LEN_HEADER_SIZE..].try_into().unwrap());
    (msg_len, metadata)
}
