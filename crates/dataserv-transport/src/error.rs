use thiserror::Error;

/// Transport-level failures. Every variant is fatal to the connection that
/// raised it; the transport never retries on its own.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("peer closed the connection")]
    PeerClosed,

    #[error("timed out waiting for a complete frame")]
    Timeout,

    #[error("malformed frame: {0}")]
    Malformed(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
