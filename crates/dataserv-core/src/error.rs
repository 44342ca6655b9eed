use dataserv_transport::TransportError;
use thiserror::Error;

/// Server-side protocol/session failures (§7). Every variant is fatal to the
/// connection that raised it unless noted otherwise; the server never
/// retries on its own.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("handshake did not complete within the negotiation timeout")]
    NegotiationTimeout,

    #[error("unrecognized negotiation tag {0:#x}")]
    UnknownNegotiationTag(u8),

    #[error("unrecognized data-type tag {0:#x}")]
    UnknownDataMode(u8),

    #[error("dataset name was not valid utf-8")]
    InvalidDatasetName,

    #[error("a source is already attached to dataset {0:?}")]
    DuplicateSource(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Off-reactor diff computation failures (§4.7). Never fatal to a sink
/// connection: the sink pipe falls back to sending the raw payload.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum DiffError {
    #[error("diff worker did not respond within its deadline")]
    Timeout,
    #[error("diff worker crashed computing the delta")]
    Crashed,
}
